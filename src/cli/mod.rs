// src/cli/mod.rs — CLI definition (clap derive)

pub mod daemon;
pub mod logs;
pub mod migrate;
pub mod status;

use clap::{Parser, Subcommand};

use crate::infra::config::{DatabaseConfig, ServerConfig};

#[derive(Parser)]
#[command(
    name = "wharf",
    about = "Inspect and maintain a wharf server's session store",
    version
)]
pub struct Cli {
    /// Config file path
    #[arg(long, global = true)]
    pub config: Option<String>,

    /// Console log level when WHARF_LOG and RUST_LOG are unset
    #[arg(long, global = true, default_value = "warn")]
    pub log_level: String,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Show database, storage and logging status
    Status,
    /// Print the effective configuration as TOML
    Config,
    /// Show persisted session logs
    Logs {
        /// Number of sessions to list
        #[arg(short, long, default_value = "20")]
        limit: u32,
        /// Show the entries of one session instead
        #[arg(long)]
        session: Option<String>,
        /// Emit JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Apply the retention policy once
    Cleanup {
        /// Override the configured maximum age, in hours
        #[arg(long)]
        max_age_hours: Option<u64>,
        /// Override the configured maximum session count
        #[arg(long)]
        max_count: Option<u64>,
    },
    /// Show or change the schema version
    Migrate {
        /// Only show applied migrations
        #[arg(long)]
        status: bool,
        /// Undo the newest migration
        #[arg(long)]
        rollback: bool,
    },
    /// List scheduled future calls
    FutureCalls {
        /// Only calls with this identifier
        #[arg(long)]
        identifier: Option<String>,
    },
    /// Run log retention in the foreground until Ctrl-C
    Daemon,
}

/// The database section, falling back to defaults so maintenance commands
/// work against the default path.
pub fn database_config(config: &ServerConfig) -> DatabaseConfig {
    config.database.clone().unwrap_or_default()
}

pub fn print_config(config: &ServerConfig) -> anyhow::Result<()> {
    let rendered = toml::to_string_pretty(config)?;
    print!("{rendered}");
    Ok(())
}
