// src/cli/migrate.rs — Database migration command
//
// Migrations run automatically when a pool opens. This command works on a
// plain connection so `--status` reports what is there without applying
// anything.

use std::path::Path;

use rusqlite::Connection;

use crate::db::schema::{self, MIGRATIONS};

/// Show migration status, roll back the newest migration, or apply pending ones.
pub fn run_migrate(db_path: &Path, status_only: bool, rollback: bool) -> anyhow::Result<()> {
    if !db_path.exists() && (status_only || rollback) {
        println!("No database found at: {}", db_path.display());
        println!("Run `wharf migrate` to create it.");
        return Ok(());
    }

    if let Some(parent) = db_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let conn = Connection::open(db_path)?;

    if status_only {
        return show_migration_status(&conn, db_path);
    }

    if rollback {
        return run_rollback(&conn);
    }

    println!("Running database migrations...");
    schema::run_migrations(&conn)?;
    println!("Migrations complete.");

    show_migration_status(&conn, db_path)
}

fn show_migration_status(conn: &Connection, db_path: &Path) -> anyhow::Result<()> {
    let current = schema::current_version(conn)?;
    let latest = MIGRATIONS.last().map(|m| m.version).unwrap_or(0);

    println!("Database: {}", db_path.display());
    println!("Schema version: {} (latest {})", current, latest);
    println!();

    let mut stmt =
        conn.prepare("SELECT version, name, applied_at FROM _migrations ORDER BY version")?;
    let rows = stmt.query_map([], |row| {
        Ok((
            row.get::<_, u32>(0)?,
            row.get::<_, String>(1)?,
            row.get::<_, String>(2)?,
        ))
    })?;

    println!("Applied migrations:");
    let mut any = false;
    for row in rows {
        let (version, name, applied_at) = row?;
        println!("  v{}: {} (applied {})", version, name, applied_at);
        any = true;
    }
    if !any {
        println!("  (none)");
    }

    let pending: Vec<_> = MIGRATIONS.iter().filter(|m| m.version > current).collect();
    if !pending.is_empty() {
        println!("Pending:");
        for m in pending {
            println!("  v{}: {}", m.version, m.name);
        }
    }
    Ok(())
}

fn run_rollback(conn: &Connection) -> anyhow::Result<()> {
    match schema::rollback_last(conn)? {
        Some(version) => {
            println!("Rolled back migration v{}.", version);
            println!("Data stored by it is gone. Run `wharf migrate` to re-apply.");
        }
        None => println!("No migrations to roll back."),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrate_then_rollback() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("w.db");

        run_migrate(&path, true, false).unwrap();
        assert!(!path.exists());

        run_migrate(&path, false, false).unwrap();
        let conn = Connection::open(&path).unwrap();
        let latest = MIGRATIONS.last().unwrap().version;
        assert_eq!(schema::current_version(&conn).unwrap(), latest);

        run_migrate(&path, false, true).unwrap();
        assert_eq!(schema::current_version(&conn).unwrap(), latest - 1);
    }
}
