//! CLI argument parsing for the outbox daemon.
//!
//! CLI flags override all other config sources.

use clap::{Parser, Subcommand};

/// Outbox Sync Daemon
///
/// Keeps a search index in sync with a transactional outbox.
#[derive(Parser, Debug)]
#[command(name = "outbox-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Path to config file (overrides default ~/.config/outbox-sync/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<String>,

    /// Set log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    pub log_level: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Daemon commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Start the daemon and its agents (runs in the foreground)
    Start {
        /// Number of event-processing agents to run in this process
        #[arg(short, long, default_value = "1")]
        agents: usize,

        /// Override database path
        #[arg(long)]
        db_path: Option<String>,

        /// Override search index path
        #[arg(long)]
        index_path: Option<String>,

        /// Override tenant id
        #[arg(short, long)]
        tenant: Option<String>,
    },

    /// Stop the running daemon
    Stop,

    /// Show daemon status
    Status,

    /// Append a change event to the outbox (daemon must be stopped)
    Enqueue {
        /// Entity name, e.g. "book"
        entity: String,

        /// Entity id
        id: String,

        /// Entity document as a JSON object
        #[arg(long, conflicts_with = "delete", required_unless_present = "delete")]
        document: Option<String>,

        /// Record a deletion instead of an upsert
        #[arg(long)]
        delete: bool,

        #[arg(long)]
        db_path: Option<String>,

        #[arg(short, long)]
        tenant: Option<String>,
    },

    /// Administrative commands (daemon must be stopped)
    Admin {
        /// Database path (default from config)
        #[arg(long)]
        db_path: Option<String>,

        /// Tenant id (default from config)
        #[arg(short, long)]
        tenant: Option<String>,

        #[command(subcommand)]
        command: AdminCommands,
    },
}

/// Admin subcommands
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum AdminCommands {
    /// Show database statistics
    Stats,

    /// List agent rows with their liveness
    Agents,

    /// List poisoned events
    Poisoned {
        /// Maximum results
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,
    },

    /// Move poisoned events back to the outbox with a fresh retry budget
    ReprocessPoisoned,

    /// Delete all poisoned events
    ClearPoisoned,

    /// Delete agent rows whose lease has expired
    CleanupAgents,

    /// Trigger RocksDB compaction
    Compact,
}

impl Cli {
    /// Parse CLI arguments
    pub fn parse_args() -> Self {
        Cli::parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_start_defaults() {
        let cli = Cli::parse_from(["outbox-daemon", "start"]);
        match cli.command {
            Commands::Start { agents, tenant, .. } => {
                assert_eq!(agents, 1);
                assert!(tenant.is_none());
            }
            _ => panic!("Expected Start command"),
        }
    }

    #[test]
    fn test_cli_start_with_overrides() {
        let cli = Cli::parse_from([
            "outbox-daemon",
            "start",
            "--agents",
            "3",
            "--db-path",
            "/custom/db",
            "--index-path",
            "/custom/index",
            "-t",
            "acme",
        ]);
        match cli.command {
            Commands::Start {
                agents,
                db_path,
                index_path,
                tenant,
            } => {
                assert_eq!(agents, 3);
                assert_eq!(db_path, Some("/custom/db".to_string()));
                assert_eq!(index_path, Some("/custom/index".to_string()));
                assert_eq!(tenant, Some("acme".to_string()));
            }
            _ => panic!("Expected Start command"),
        }
    }

    #[test]
    fn test_cli_with_config_and_log_level() {
        let cli = Cli::parse_from([
            "outbox-daemon",
            "--config",
            "/path/to/config.toml",
            "--log-level",
            "debug",
            "status",
        ]);
        assert_eq!(cli.config, Some("/path/to/config.toml".to_string()));
        assert_eq!(cli.log_level, Some("debug".to_string()));
        assert!(matches!(cli.command, Commands::Status));
    }

    #[test]
    fn test_cli_stop() {
        let cli = Cli::parse_from(["outbox-daemon", "stop"]);
        assert!(matches!(cli.command, Commands::Stop));
    }

    #[test]
    fn test_cli_enqueue_document() {
        let cli = Cli::parse_from([
            "outbox-daemon",
            "enqueue",
            "book",
            "42",
            "--document",
            r#"{"title":"Dune"}"#,
        ]);
        match cli.command {
            Commands::Enqueue {
                entity,
                id,
                document,
                delete,
                ..
            } => {
                assert_eq!(entity, "book");
                assert_eq!(id, "42");
                assert_eq!(document, Some(r#"{"title":"Dune"}"#.to_string()));
                assert!(!delete);
            }
            _ => panic!("Expected Enqueue command"),
        }
    }

    #[test]
    fn test_cli_enqueue_requires_document_or_delete() {
        assert!(Cli::try_parse_from(["outbox-daemon", "enqueue", "book", "42"]).is_err());
        assert!(Cli::try_parse_from([
            "outbox-daemon",
            "enqueue",
            "book",
            "42",
            "--delete",
            "--document",
            "{}"
        ])
        .is_err());

        let cli = Cli::parse_from(["outbox-daemon", "enqueue", "book", "42", "--delete"]);
        assert!(matches!(cli.command, Commands::Enqueue { delete: true, .. }));
    }

    #[test]
    fn test_cli_admin_poisoned_limit() {
        let cli = Cli::parse_from(["outbox-daemon", "admin", "-t", "acme", "poisoned", "-n", "5"]);
        match cli.command {
            Commands::Admin {
                tenant, command, ..
            } => {
                assert_eq!(tenant, Some("acme".to_string()));
                assert_eq!(command, AdminCommands::Poisoned { limit: 5 });
            }
            _ => panic!("Expected Admin command"),
        }
    }

    #[test]
    fn test_cli_admin_subcommands() {
        let cases = [
            ("stats", AdminCommands::Stats),
            ("agents", AdminCommands::Agents),
            ("reprocess-poisoned", AdminCommands::ReprocessPoisoned),
            ("clear-poisoned", AdminCommands::ClearPoisoned),
            ("cleanup-agents", AdminCommands::CleanupAgents),
            ("compact", AdminCommands::Compact),
        ];
        for (arg, expected) in cases {
            let cli = Cli::parse_from(["outbox-daemon", "admin", arg]);
            match cli.command {
                Commands::Admin { command, .. } => assert_eq!(command, expected),
                _ => panic!("Expected Admin command"),
            }
        }
    }
}
