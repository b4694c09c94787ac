// src/db/mod.rs — SQLite plumbing shared by sessions and background tasks

pub mod pool;
pub mod schema;

use chrono::{DateTime, SecondsFormat, Utc};

pub use pool::{ConnectionPool, PooledConnection};
pub use rusqlite::types::Value as SqlValue;

/// Positional statement parameters, owned so they can cross onto the
/// blocking pool.
pub type SqlParams = Vec<SqlValue>;

/// Fixed-width UTC timestamp. Stored timestamps compare correctly as text.
pub fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}
