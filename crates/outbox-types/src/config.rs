//! Configuration loading for outbox synchronization.
//!
//! Layered config: defaults -> config file -> env vars -> CLI flags.
//! The default config file lives at ~/.config/outbox-sync/config.toml.

use config::{Config, Environment, File};
use directories::ProjectDirs;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::error::OutboxError;

/// How shards are distributed over the alive event processors.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentStrategy {
    /// Bounded-load rendezvous hashing; moves few shards on membership change
    #[default]
    Rendezvous,
    /// Equal contiguous ranges over the id-sorted agent list
    Contiguous,
}

/// Tunables of the agent coordination core.
///
/// Durations are expressed in milliseconds so they map directly onto
/// config files and `OUTBOX_COORDINATION_*` environment variables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinationSettings {
    /// Period of lease renewal
    #[serde(default = "default_pulse_interval_ms")]
    pub pulse_interval_ms: u64,

    /// Lease length; must exceed the pulse interval
    #[serde(default = "default_lease_duration_ms")]
    pub lease_duration_ms: u64,

    /// Period of the membership monitor
    #[serde(default = "default_monitor_interval_ms")]
    pub monitor_interval_ms: u64,

    /// Maximum events fetched per poll
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Failed attempts after which an event is poisoned
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Redelivery delay after a failed attempt
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,

    /// Shard-space cardinality; must agree across the cluster
    #[serde(default = "default_total_shard_count")]
    pub total_shard_count: u32,

    #[serde(default = "default_poll_backoff_min_ms")]
    pub poll_backoff_min_ms: u64,

    #[serde(default = "default_poll_backoff_max_ms")]
    pub poll_backoff_max_ms: u64,

    /// Random extra delay added to idle sleeps (0 = none)
    #[serde(default = "default_poll_jitter_ms")]
    pub poll_jitter_ms: u64,

    /// How long a peer must stay expired before its row is deleted
    #[serde(default = "default_expired_agent_grace_ms")]
    pub expired_agent_grace_ms: u64,

    /// Bounded retries of one failed pulse write
    #[serde(default = "default_pulse_max_attempts")]
    pub pulse_max_attempts: u32,

    /// Prefix for task names in logs
    #[serde(default = "default_worker_name_prefix")]
    pub worker_name_prefix: String,

    #[serde(default)]
    pub assignment_strategy: AssignmentStrategy,
}

fn default_pulse_interval_ms() -> u64 {
    2_000
}

fn default_lease_duration_ms() -> u64 {
    30_000
}

fn default_monitor_interval_ms() -> u64 {
    2_000
}

fn default_batch_size() -> usize {
    50
}

fn default_max_retries() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    5_000
}

fn default_total_shard_count() -> u32 {
    8
}

fn default_poll_backoff_min_ms() -> u64 {
    100
}

fn default_poll_backoff_max_ms() -> u64 {
    5_000
}

fn default_poll_jitter_ms() -> u64 {
    50
}

fn default_expired_agent_grace_ms() -> u64 {
    10_000
}

fn default_pulse_max_attempts() -> u32 {
    5
}

fn default_worker_name_prefix() -> String {
    "outbox".to_string()
}

impl Default for CoordinationSettings {
    fn default() -> Self {
        Self {
            pulse_interval_ms: default_pulse_interval_ms(),
            lease_duration_ms: default_lease_duration_ms(),
            monitor_interval_ms: default_monitor_interval_ms(),
            batch_size: default_batch_size(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            total_shard_count: default_total_shard_count(),
            poll_backoff_min_ms: default_poll_backoff_min_ms(),
            poll_backoff_max_ms: default_poll_backoff_max_ms(),
            poll_jitter_ms: default_poll_jitter_ms(),
            expired_agent_grace_ms: default_expired_agent_grace_ms(),
            pulse_max_attempts: default_pulse_max_attempts(),
            worker_name_prefix: default_worker_name_prefix(),
            assignment_strategy: AssignmentStrategy::default(),
        }
    }
}

/// Main application settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Settings {
    /// Path to RocksDB storage directory
    #[serde(default = "default_db_path")]
    pub db_path: String,

    /// Path to the search index directory
    #[serde(default = "default_search_index_path")]
    pub search_index_path: String,

    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Tenant whose agents and events this process handles
    #[serde(default = "default_tenant_id")]
    pub tenant_id: String,

    /// Human-readable agent name prefix
    #[serde(default = "default_agent_name")]
    pub agent_name: String,

    #[serde(default)]
    pub coordination: CoordinationSettings,
}

fn default_db_path() -> String {
    ProjectDirs::from("", "", "outbox-sync")
        .map(|p| p.data_local_dir().join("db"))
        .unwrap_or_else(|| PathBuf::from("./data"))
        .to_string_lossy()
        .to_string()
}

fn default_search_index_path() -> String {
    ProjectDirs::from("", "", "outbox-sync")
        .map(|p| p.data_local_dir().join("search-index"))
        .unwrap_or_else(|| PathBuf::from("./search-index"))
        .to_string_lossy()
        .to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_tenant_id() -> String {
    "default".to_string()
}

fn default_agent_name() -> String {
    "outbox-agent".to_string()
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
            search_index_path: default_search_index_path(),
            log_level: default_log_level(),
            tenant_id: default_tenant_id(),
            agent_name: default_agent_name(),
            coordination: CoordinationSettings::default(),
        }
    }
}

impl Settings {
    /// Load settings with layered precedence:
    /// 1. Built-in defaults
    /// 2. Config file (~/.config/outbox-sync/config.toml)
    /// 3. CLI-specified config file (optional)
    /// 4. Environment variables (OUTBOX_*)
    ///
    /// CLI flags should be applied by the caller after this returns.
    pub fn load(cli_config_path: Option<&str>) -> Result<Self, OutboxError> {
        let config_dir = ProjectDirs::from("", "", "outbox-sync")
            .map(|p| p.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from("."));

        let default_config_path = config_dir.join("config");

        let mut builder = Config::builder()
            .set_default("db_path", default_db_path())
            .map_err(|e| OutboxError::Config(e.to_string()))?
            .set_default("search_index_path", default_search_index_path())
            .map_err(|e| OutboxError::Config(e.to_string()))?
            .set_default("log_level", default_log_level())
            .map_err(|e| OutboxError::Config(e.to_string()))?
            .set_default("tenant_id", default_tenant_id())
            .map_err(|e| OutboxError::Config(e.to_string()))?
            .set_default("agent_name", default_agent_name())
            .map_err(|e| OutboxError::Config(e.to_string()))?
            .add_source(File::with_name(&default_config_path.to_string_lossy()).required(false));

        if let Some(path) = cli_config_path {
            builder = builder.add_source(File::with_name(path).required(true));
        }

        // OUTBOX_DB_PATH, OUTBOX_TENANT_ID, OUTBOX_COORDINATION__BATCH_SIZE, ...
        builder = builder.add_source(
            Environment::with_prefix("OUTBOX")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder
            .build()
            .map_err(|e| OutboxError::Config(e.to_string()))?;

        config
            .try_deserialize()
            .map_err(|e| OutboxError::Config(e.to_string()))
    }

    /// Expand ~ in db_path to the home directory
    pub fn expanded_db_path(&self) -> PathBuf {
        expand_home(&self.db_path)
    }

    /// Expand ~ in search_index_path to the home directory
    pub fn expanded_search_index_path(&self) -> PathBuf {
        expand_home(&self.search_index_path)
    }
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = directories::BaseDirs::new().map(|d| d.home_dir().to_path_buf()) {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}
