// src/main.rs — wharf maintenance CLI entry point

use std::path::PathBuf;

use clap::Parser;

use wharf::cli::{self, Cli, Commands};
use wharf::db::ConnectionPool;
use wharf::infra::config::ServerConfig;
use wharf::infra::{logger, paths};

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config_path = cli
        .config
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(paths::config_file_path);
    let config = if cli.config.is_some() {
        ServerConfig::load_from(&config_path)?
    } else {
        ServerConfig::load()?
    };

    // Respects WHARF_LOG / RUST_LOG
    logger::init_logging(&cli.log_level, config.logging.console_format);

    let db = cli::database_config(&config);
    let db_path = db.resolved_path();

    match cli.command {
        Commands::Status => cli::status::show_status(&config, &config_path, &db_path),
        Commands::Config => cli::print_config(&config),
        Commands::Migrate { status, rollback } => cli::migrate::run_migrate(&db_path, status, rollback),
        Commands::Logs {
            limit,
            session,
            json,
        } => {
            let pool = open_pool(&config)?;
            cli::logs::run_logs(&pool, limit, session, json).await
        }
        Commands::Cleanup {
            max_age_hours,
            max_count,
        } => {
            let pool = open_pool(&config)?;
            cli::logs::run_cleanup(&pool, &config.logging.retention, max_age_hours, max_count)
                .await
                .map(|_| ())
        }
        Commands::FutureCalls { identifier } => {
            let pool = open_pool(&config)?;
            cli::logs::run_future_calls(&pool, identifier).await
        }
        Commands::Daemon => {
            let pool = open_pool(&config)?;
            cli::daemon::run_daemon(pool, &config.logging.retention).await
        }
    }
}

/// Opening the pool applies pending migrations.
fn open_pool(config: &ServerConfig) -> anyhow::Result<ConnectionPool> {
    let db = cli::database_config(config);
    let pool = ConnectionPool::open(&db.resolved_path(), db.pool_size, db.busy_timeout())?;
    Ok(pool)
}
