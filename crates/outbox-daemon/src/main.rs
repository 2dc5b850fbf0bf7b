//! Outbox Sync Daemon
//!
//! Runs outbox agents that keep the search index in line with the outbox.
//!
//! # Usage
//!
//! ```bash
//! outbox-daemon start [--agents K] [--db-path PATH] [--index-path PATH] [--tenant ID]
//! outbox-daemon stop
//! outbox-daemon status
//! outbox-daemon enqueue book 42 --document '{"title": "Dune"}'
//! outbox-daemon admin stats
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded in order (later sources override earlier):
//! 1. Built-in defaults
//! 2. Config file (~/.config/outbox-sync/config.toml)
//! 3. Environment variables (OUTBOX_*)
//! 4. CLI flags

use anyhow::Result;
use clap::Parser;

use outbox_daemon::{
    handle_admin, handle_enqueue, show_status, start_daemon, stop_daemon, Cli, Commands,
    StartOptions,
};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Start {
            agents,
            db_path,
            index_path,
            tenant,
        } => {
            start_daemon(StartOptions {
                config_path: cli.config,
                agents,
                db_path,
                index_path,
                tenant,
                log_level: cli.log_level,
            })
            .await?;
        }
        Commands::Stop => {
            stop_daemon()?;
        }
        Commands::Status => {
            show_status()?;
        }
        Commands::Enqueue {
            entity,
            id,
            document,
            delete,
            db_path,
            tenant,
        } => {
            handle_enqueue(
                cli.config.as_deref(),
                &entity,
                &id,
                document.as_deref(),
                delete,
                db_path.as_deref(),
                tenant.as_deref(),
            )?;
        }
        Commands::Admin {
            db_path,
            tenant,
            command,
        } => {
            handle_admin(
                cli.config.as_deref(),
                db_path.as_deref(),
                tenant.as_deref(),
                command,
            )?;
        }
    }

    Ok(())
}
