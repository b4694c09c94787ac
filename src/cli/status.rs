// src/cli/status.rs — Status display

use std::path::Path;

use rusqlite::Connection;

use crate::db::schema::{self, MIGRATIONS};
use crate::infra::config::{ServerConfig, StorageKind};
use crate::infra::paths;

struct DbStats {
    version: u32,
    sessions: i64,
    entries: i64,
    future_calls: i64,
    stored_files: i64,
}

/// Print config, database, storage and logging state.
pub fn show_status(config: &ServerConfig, config_path: &Path, db_path: &Path) -> anyhow::Result<()> {
    println!("wharf v{}", env!("CARGO_PKG_VERSION"));
    println!();

    if config_path.exists() {
        println!("  Config:     {} (loaded)", config_path.display());
    } else {
        println!("  Config:     (using defaults)");
    }

    if db_path.exists() {
        let size = std::fs::metadata(db_path).map(|m| m.len()).unwrap_or(0);
        println!("  Database:   {} ({})", db_path.display(), format_bytes(size));
        match query_db_stats(db_path) {
            Ok(stats) => {
                let latest = MIGRATIONS.last().map(|m| m.version).unwrap_or(0);
                println!("  Schema:     v{} (latest v{})", stats.version, latest);
                println!(
                    "  Logs:       {} sessions, {} entries",
                    stats.sessions, stats.entries
                );
                println!("  Scheduled:  {} future calls", stats.future_calls);
                println!("  Files:      {} in database storage", stats.stored_files);
            }
            Err(e) => println!("  Schema:     unreadable ({e})"),
        }
    } else {
        println!("  Database:   (not initialized)");
    }
    if config.database.is_none() {
        println!("              [database] not configured; sessions run without one");
    }

    println!();
    let logging = &config.logging;
    println!(
        "  Logging:    level {}, persistent {}, console {}",
        logging.log_level.as_str(),
        on_off(logging.persistent_enabled),
        on_off(logging.console_enabled)
    );
    println!(
        "  Retention:  max age {}, max count {}",
        logging
            .retention
            .max_age_hours
            .filter(|h| *h > 0)
            .map(|h| format!("{h}h"))
            .unwrap_or_else(|| "off".into()),
        logging
            .retention
            .max_count()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "off".into())
    );
    println!(
        "  Distributed: {}",
        on_off(config.distributed.enabled)
    );

    println!();
    println!("  Storages:");
    for storage in &config.storage {
        let location = match storage.kind {
            StorageKind::Database => "database".to_string(),
            StorageKind::Filesystem => storage
                .root
                .clone()
                .unwrap_or_else(|| paths::storage_dir().join(&storage.id))
                .display()
                .to_string(),
        };
        println!(
            "    {:<12} {:<8} {}",
            storage.id,
            if storage.public { "public" } else { "private" },
            location
        );
    }

    Ok(())
}

fn query_db_stats(db_path: &Path) -> anyhow::Result<DbStats> {
    let conn = Connection::open(db_path)?;
    let version = schema::current_version(&conn)?;
    let count = |table: &str| -> i64 {
        conn.query_row(&format!("SELECT COUNT(*) FROM {table}"), [], |r| r.get(0))
            .unwrap_or(0)
    };
    Ok(DbStats {
        version,
        sessions: count("session_log"),
        entries: count("log_entry"),
        future_calls: count("future_call"),
        stored_files: count("cloud_storage"),
    })
}

fn on_off(flag: bool) -> &'static str {
    if flag {
        "on"
    } else {
        "off"
    }
}

fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    }
}
