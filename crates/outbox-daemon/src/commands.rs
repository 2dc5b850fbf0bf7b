//! Command implementations for the outbox daemon.
//!
//! Handles:
//! - start: Load config, open storage and index, run K agents until signalled
//! - stop: Signal running daemon to stop (via PID file)
//! - status: Check if daemon is running
//! - enqueue: Append one change event to the outbox
//! - admin: Inspect and repair the store while the daemon is stopped

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use tokio::signal;
use tracing::{info, warn};

use outbox_coordination::{classify, AgentContext, CoordinationConfig, OutboxAgent, PeerStatus};
use outbox_indexing::SearchIndexWriter;
use outbox_search::{DocumentIndexer, SearchIndex, SearchIndexConfig};
use outbox_storage::{AgentStore, Storage, TenantStorage};
use outbox_types::{Agent, EntityChange, OutboxEvent, Settings};

use crate::cli::AdminCommands;

/// Get the PID file path
fn pid_file_path() -> PathBuf {
    directories::BaseDirs::new()
        .map(|dirs| {
            #[cfg(unix)]
            {
                dirs.runtime_dir()
                    .map(|p| p.to_path_buf())
                    .unwrap_or_else(|| dirs.cache_dir().to_path_buf())
            }
            #[cfg(not(unix))]
            {
                dirs.cache_dir().to_path_buf()
            }
        })
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("outbox-sync")
        .join("daemon.pid")
}

fn write_pid_file() -> Result<()> {
    let pid_path = pid_file_path();
    if let Some(parent) = pid_path.parent() {
        fs::create_dir_all(parent)?;
    }
    fs::write(&pid_path, std::process::id().to_string())?;
    info!("Wrote PID file: {:?}", pid_path);
    Ok(())
}

fn remove_pid_file() {
    let pid_path = pid_file_path();
    if pid_path.exists() {
        if let Err(e) = fs::remove_file(&pid_path) {
            warn!("Failed to remove PID file: {}", e);
        } else {
            info!("Removed PID file");
        }
    }
}

fn read_pid_file() -> Option<u32> {
    fs::read_to_string(pid_file_path())
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

/// Check if a process is running
#[cfg(unix)]
fn is_process_running(pid: u32) -> bool {
    // Signal 0 only checks that the process exists
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

#[cfg(not(unix))]
fn is_process_running(_pid: u32) -> bool {
    true
}

fn daemon_running() -> Option<u32> {
    read_pid_file().filter(|pid| is_process_running(*pid))
}

fn expand_path(path: &str) -> PathBuf {
    PathBuf::from(shellexpand::tilde(path).into_owned())
}

/// Options for [`start_daemon`]; every `Some` overrides the loaded settings.
#[derive(Debug, Clone, Default)]
pub struct StartOptions {
    pub config_path: Option<String>,
    /// Number of event-processing agents to run in this process
    pub agents: usize,
    pub db_path: Option<String>,
    pub index_path: Option<String>,
    pub tenant: Option<String>,
    pub log_level: Option<String>,
}

fn load_settings(
    config_path: Option<&str>,
    db_path: Option<&str>,
    tenant: Option<&str>,
) -> Result<Settings> {
    let mut settings = Settings::load(config_path).context("Failed to load configuration")?;
    if let Some(db_path) = db_path {
        settings.db_path = db_path.to_string();
    }
    if let Some(tenant) = tenant {
        settings.tenant_id = tenant.to_string();
    }
    Ok(settings)
}

fn open_storage(settings: &Settings) -> Result<Arc<Storage>> {
    let db_path = expand_path(&settings.db_path);
    if let Some(parent) = db_path.parent() {
        fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let storage = Storage::open(&db_path)
        .with_context(|| format!("Failed to open storage at {:?} (is the daemon running?)", db_path))?;
    Ok(Arc::new(storage))
}

/// Resolves when the process receives Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        }
        _ = terminate => {
            info!("Received SIGTERM, shutting down...");
        }
    }
}

/// Start the outbox daemon.
///
/// 1. Load configuration (defaults -> file -> env -> CLI)
/// 2. Open RocksDB storage and the search index
/// 3. Start `agents` event-processing agents sharing both
/// 4. On SIGINT/SIGTERM stop every agent gracefully
pub async fn start_daemon(options: StartOptions) -> Result<()> {
    let mut settings = load_settings(
        options.config_path.as_deref(),
        options.db_path.as_deref(),
        options.tenant.as_deref(),
    )?;
    if let Some(index_path) = &options.index_path {
        settings.search_index_path = index_path.clone();
    }
    if let Some(log_level) = &options.log_level {
        settings.log_level = log_level.clone();
    }

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&settings.log_level)),
        )
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set tracing subscriber")?;

    if let Some(pid) = daemon_running() {
        anyhow::bail!("Daemon already running (PID {})", pid);
    }
    if options.agents == 0 {
        anyhow::bail!("At least one agent is required");
    }

    let config = CoordinationConfig::from_settings(&settings);
    config.validate().context("Invalid coordination configuration")?;

    info!("Outbox daemon starting...");
    info!("Configuration:");
    info!("  Database path: {}", settings.db_path);
    info!("  Search index path: {}", settings.search_index_path);
    info!("  Tenant: {}", settings.tenant_id);
    info!("  Agents: {}", options.agents);
    info!("  Total shards: {}", config.total_shard_count);
    info!("  Log level: {}", settings.log_level);

    let storage = open_storage(&settings)?;
    let tenant = storage
        .for_tenant(&settings.tenant_id)
        .context("Invalid tenant id")?;

    let index_path = expand_path(&settings.search_index_path);
    info!("Opening search index at {:?}", index_path);
    let index = SearchIndex::open_or_create(SearchIndexConfig::new(&index_path))
        .context("Failed to open search index")?;
    let indexer = Arc::new(DocumentIndexer::new(&index).context("Failed to open index writer")?);
    let writer = Arc::new(SearchIndexWriter::new(indexer));

    write_pid_file()?;

    let mut agents = Vec::with_capacity(options.agents);
    let mut start_error = None;
    for i in 0..options.agents {
        let agent_config = config
            .clone()
            .with_agent_name(format!("{}-{}", settings.agent_name, i));
        let context = AgentContext::for_tenant(tenant.clone(), writer.clone());
        let started = match OutboxAgent::new(agent_config, context) {
            Ok(mut agent) => agent.start().await.map(|_| agent),
            Err(e) => Err(e),
        };
        match started {
            Ok(agent) => {
                info!(agent_id = %agent.id(), "Agent started");
                agents.push(agent);
            }
            Err(e) => {
                start_error = Some(e);
                break;
            }
        }
    }

    if start_error.is_none() {
        shutdown_signal().await;
    }

    for agent in agents.iter_mut() {
        let totals = agent.dispatch_totals();
        if let Err(e) = agent.stop().await {
            warn!(agent_id = %agent.id(), error = %e, "Agent did not stop cleanly");
        } else {
            info!(
                agent_id = %agent.id(),
                applied = totals.applied,
                poisoned = totals.poisoned,
                "Agent stopped"
            );
        }
    }

    if let Err(e) = storage.flush() {
        warn!("Failed to flush storage: {}", e);
    }
    remove_pid_file();

    match start_error {
        Some(e) => Err(anyhow::anyhow!("Failed to start agent: {}", e)),
        None => Ok(()),
    }
}

/// Stop the running daemon by sending SIGTERM.
pub fn stop_daemon() -> Result<()> {
    let pid = read_pid_file().context("No PID file found - daemon may not be running")?;

    if !is_process_running(pid) {
        remove_pid_file();
        anyhow::bail!("Daemon not running (stale PID file removed)");
    }

    info!("Stopping daemon (PID {})", pid);

    #[cfg(unix)]
    {
        unsafe {
            if libc::kill(pid as i32, libc::SIGTERM) != 0 {
                anyhow::bail!("Failed to send SIGTERM to daemon");
            }
        }
        println!("Sent SIGTERM to daemon (PID {})", pid);
    }

    #[cfg(not(unix))]
    {
        anyhow::bail!("Stop command not yet implemented on this platform");
    }

    Ok(())
}

/// Show daemon status.
pub fn show_status() -> Result<()> {
    let pid_path = pid_file_path();

    match read_pid_file() {
        Some(pid) if is_process_running(pid) => {
            println!("Outbox daemon is running (PID {})", pid);
            println!("PID file: {:?}", pid_path);
        }
        Some(pid) => {
            println!(
                "Outbox daemon is NOT running (stale PID {} in {:?})",
                pid, pid_path
            );
        }
        None => {
            println!("Outbox daemon is NOT running (no PID file)");
        }
    }
    Ok(())
}

/// Build the change for `enqueue`: a deletion, or an upsert of a JSON object.
fn parse_change(document: Option<&str>, delete: bool) -> Result<EntityChange> {
    if delete {
        return Ok(EntityChange::Delete);
    }
    let raw = document.context("Either --document or --delete is required")?;
    let document: serde_json::Value =
        serde_json::from_str(raw).context("Document is not valid JSON")?;
    if !document.is_object() {
        anyhow::bail!("Document must be a JSON object");
    }
    Ok(EntityChange::Upsert { document })
}

fn enqueue_event(
    storage: &TenantStorage,
    entity: &str,
    id: &str,
    change: EntityChange,
) -> Result<OutboxEvent> {
    if entity.is_empty() || id.is_empty() {
        anyhow::bail!("Entity name and id must not be empty");
    }
    storage
        .append_event(entity, id, change)
        .context("Failed to append event")
}

/// Append one change event to the outbox.
pub fn handle_enqueue(
    config_path: Option<&str>,
    entity: &str,
    id: &str,
    document: Option<&str>,
    delete: bool,
    db_path: Option<&str>,
    tenant: Option<&str>,
) -> Result<()> {
    let settings = load_settings(config_path, db_path, tenant)?;
    let change = parse_change(document, delete)?;
    let storage = open_storage(&settings)?;
    let tenant = storage
        .for_tenant(&settings.tenant_id)
        .context("Invalid tenant id")?;

    let event = enqueue_event(&tenant, entity, id, change)?;
    storage.flush().context("Failed to flush storage")?;

    println!(
        "Enqueued event {} for {}:{} (tenant {}, shard key {})",
        event.sequence, event.entity_name, event.entity_id, event.tenant_id, event.shard_key
    );
    Ok(())
}

/// Agents whose lease lapsed more than `grace` before `now`.
fn expired_agents(agents: &[Agent], now: DateTime<Utc>, grace: chrono::Duration) -> Vec<&Agent> {
    agents
        .iter()
        .filter(|agent| agent.expiration + grace <= now)
        .collect()
}

fn format_agent_row(agent: &Agent, now: DateTime<Utc>) -> String {
    let status = match classify(agent, now) {
        PeerStatus::Alive => "alive",
        PeerStatus::Starting => "starting",
        PeerStatus::Suspended => "suspended",
        PeerStatus::Stopped => "stopped",
        PeerStatus::Expired => "EXPIRED",
    };
    let shards = agent
        .assigned_shard_ids
        .iter()
        .map(|s| s.to_string())
        .collect::<Vec<_>>()
        .join(",");
    let total = agent
        .total_shard_count
        .map(|t| t.to_string())
        .unwrap_or_else(|| "-".to_string());
    format!(
        "{}  {:<20} {:<16} {:<10} {:<9} total={:<4} shards=[{}]",
        agent.id,
        agent.name,
        agent.agent_type.to_string(),
        agent.state.to_string(),
        status,
        total,
        shards
    )
}

/// Run an administrative command against the store.
pub fn handle_admin(
    config_path: Option<&str>,
    db_path: Option<&str>,
    tenant: Option<&str>,
    command: AdminCommands,
) -> Result<()> {
    let settings = load_settings(config_path, db_path, tenant)?;
    let storage = open_storage(&settings)?;
    let tenant = storage
        .for_tenant(&settings.tenant_id)
        .context("Invalid tenant id")?;

    match command {
        AdminCommands::Stats => {
            let stats = storage.get_stats().context("Failed to read stats")?;
            println!("Database Statistics");
            println!("===================");
            println!("Path: {}", settings.db_path);
            println!();
            println!("All tenants:");
            println!("  Agents:         {}", stats.agent_count);
            println!("  Pending events: {}", stats.pending_count);
            println!("  Poisoned:       {}", stats.poisoned_count);
            println!("  Next sequence:  {}", stats.next_sequence);
            println!("  Disk usage:     {} bytes", stats.disk_usage_bytes);
            println!();
            println!("Tenant {}:", tenant.tenant());
            println!("  Agents:         {}", tenant.list_all_ordered_by_id()?.len());
            println!("  Pending events: {}", tenant.count_pending()?);
            println!("  Poisoned:       {}", tenant.count_poisoned()?);
        }
        AdminCommands::Agents => {
            let now = Utc::now();
            let agents = tenant
                .list_all_ordered_by_id()
                .context("Failed to list agents")?;
            if agents.is_empty() {
                println!("No agents registered for tenant {}", tenant.tenant());
            }
            for agent in &agents {
                println!("{}", format_agent_row(agent, now));
            }
        }
        AdminCommands::Poisoned { limit } => {
            let events = tenant
                .list_poisoned(limit)
                .context("Failed to list poisoned events")?;
            if events.is_empty() {
                println!("No poisoned events for tenant {}", tenant.tenant());
            }
            for event in &events {
                println!(
                    "#{} {}:{} retries={} error={}",
                    event.sequence,
                    event.entity_name,
                    event.entity_id,
                    event.retries,
                    event.last_error.as_deref().unwrap_or("-")
                );
            }
        }
        AdminCommands::ReprocessPoisoned => {
            let moved = tenant
                .reprocess_poisoned()
                .context("Failed to requeue poisoned events")?;
            println!("Requeued {} poisoned event(s)", moved);
        }
        AdminCommands::ClearPoisoned => {
            let removed = tenant
                .clear_poisoned()
                .context("Failed to clear poisoned events")?;
            println!("Deleted {} poisoned event(s)", removed);
        }
        AdminCommands::CleanupAgents => {
            let grace = CoordinationConfig::from_settings(&settings).grace();
            let agents = tenant
                .list_all_ordered_by_id()
                .context("Failed to list agents")?;
            let expired: Vec<_> = expired_agents(&agents, Utc::now(), grace)
                .into_iter()
                .map(|agent| agent.id)
                .collect();
            tenant.delete(&expired).context("Failed to delete agents")?;
            println!("Deleted {} expired agent(s)", expired.len());
        }
        AdminCommands::Compact => {
            println!("Compacting database...");
            storage.compact().context("Compaction failed")?;
            println!("Compaction complete");
        }
    }

    storage.flush().context("Failed to flush storage")?;
    Ok(())
}
