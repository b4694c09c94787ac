// src/session/log.rs — Per-session log buffer and its sinks
//
// Entries are buffered in memory while the session is open and written out
// once, at close. Nothing here performs I/O before `LogWriter::flush`.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::db::{timestamp, ConnectionPool};
use crate::infra::config::{ConsoleFormat, LoggingConfig};
use crate::infra::errors::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "debug" => Some(Self::Debug),
            "info" => Some(Self::Info),
            "warning" | "warn" => Some(Self::Warning),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured fields attached to database-query entries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryInfo {
    pub query: String,
    pub duration_ms: f64,
    pub rows_affected: Option<i64>,
    pub slow: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub time: DateTime<Utc>,
    pub level: LogLevel,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack_trace: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub query: Option<QueryInfo>,
}

impl LogEntry {
    pub fn new(level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            time: Utc::now(),
            level,
            message: message.into(),
            error: None,
            stack_trace: None,
            query: None,
        }
    }

    pub fn with_error(mut self, error: Option<String>, stack_trace: Option<String>) -> Self {
        self.error = error;
        self.stack_trace = stack_trace;
        self
    }

    pub fn query(info: QueryInfo, error: Option<String>) -> Self {
        let level = if error.is_some() {
            LogLevel::Error
        } else if info.slow {
            LogLevel::Warning
        } else {
            LogLevel::Debug
        };
        Self {
            time: Utc::now(),
            level,
            message: info.query.clone(),
            error,
            stack_trace: None,
            query: Some(info),
        }
    }
}

/// Which sessions and queries get written out, resolved once per session.
#[derive(Debug, Clone)]
pub struct LogSettings {
    pub enabled: bool,
    pub level: LogLevel,
    pub log_all_sessions: bool,
    pub log_failed_sessions: bool,
    pub log_slow_sessions: bool,
    pub slow_session_threshold: Duration,
    pub log_all_queries: bool,
    pub log_slow_queries: bool,
    pub slow_query_threshold: Duration,
    pub log_failed_queries: bool,
}

impl LogSettings {
    pub fn from_config(config: &LoggingConfig) -> Self {
        Self {
            enabled: true,
            level: config.log_level,
            log_all_sessions: config.log_all_sessions,
            log_failed_sessions: config.log_failed_sessions,
            log_slow_sessions: config.log_slow_sessions,
            slow_session_threshold: Duration::from_millis(config.slow_session_threshold_ms),
            log_all_queries: config.log_all_queries,
            log_slow_queries: config.log_slow_queries,
            slow_query_threshold: Duration::from_millis(config.slow_query_threshold_ms),
            log_failed_queries: config.log_failed_queries,
        }
    }

    pub fn accepts(&self, level: LogLevel) -> bool {
        self.enabled && level >= self.level
    }

    pub fn is_slow_query(&self, duration: Duration) -> bool {
        duration >= self.slow_query_threshold
    }

    pub fn should_log_query(&self, duration: Duration, failed: bool) -> bool {
        self.enabled
            && (self.log_all_queries
                || (failed && self.log_failed_queries)
                || (self.is_slow_query(duration) && self.log_slow_queries))
    }

    pub fn should_log_session(&self, summary: &SessionSummary, entry_count: usize) -> bool {
        self.enabled
            && (self.log_all_sessions
                || entry_count > 0
                || (summary.error.is_some() && self.log_failed_sessions)
                || (summary.slow && self.log_slow_sessions))
    }
}

/// Ordered, append-only buffer owned by exactly one session.
#[derive(Debug, Default)]
pub struct LogAccumulator {
    entries: Vec<LogEntry>,
    num_queries: u32,
}

impl LogAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&mut self, entry: LogEntry) {
        self.entries.push(entry);
    }

    /// Count a statement whether or not it produced an entry.
    pub fn record_query(&mut self) {
        self.num_queries += 1;
    }

    pub fn entries(&self) -> &[LogEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn num_queries(&self) -> u32 {
        self.num_queries
    }
}

/// One row per completed session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: Uuid,
    pub kind: &'static str,
    pub endpoint: Option<String>,
    pub method: Option<String>,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
    pub num_queries: u32,
    pub slow: bool,
    pub error: Option<String>,
    pub stack_trace: Option<String>,
    pub auth_user_id: Option<String>,
}

impl SessionSummary {
    pub fn duration_ms(&self) -> f64 {
        self.duration.as_secs_f64() * 1000.0
    }
}

/// Console and/or persistent destinations for flushed logs.
#[derive(Debug, Clone, Default)]
pub struct LogWriter {
    persistent: Option<ConnectionPool>,
    console: Option<ConsoleFormat>,
}

impl LogWriter {
    pub fn new(persistent: Option<ConnectionPool>, console: Option<ConsoleFormat>) -> Self {
        Self {
            persistent,
            console,
        }
    }

    pub fn is_persistent(&self) -> bool {
        self.persistent.is_some()
    }

    /// Write the whole buffer in append order. Consumes the accumulator, so
    /// a buffer can only ever be flushed once. Returns the persisted
    /// session row id when a persistent sink is configured.
    pub async fn flush(
        &self,
        accumulator: LogAccumulator,
        mut summary: SessionSummary,
        settings: &LogSettings,
    ) -> Result<Option<i64>> {
        summary.num_queries = accumulator.num_queries();
        if !settings.should_log_session(&summary, accumulator.len()) {
            return Ok(None);
        }

        if let Some(format) = self.console {
            for entry in accumulator.entries() {
                emit_console(format, &summary, entry);
            }
            emit_console_summary(format, &summary);
        }

        let Some(pool) = &self.persistent else {
            return Ok(None);
        };

        let entries = accumulator.entries;
        let id = pool
            .run(move |conn| insert_session_log(conn, &summary, &entries))
            .await?;
        Ok(Some(id))
    }
}

fn insert_session_log(
    conn: &mut Connection,
    summary: &SessionSummary,
    entries: &[LogEntry],
) -> rusqlite::Result<i64> {
    let tx = conn.transaction()?;
    let session_id = summary.session_id.to_string();

    tx.execute(
        "INSERT INTO session_log (session_id, kind, endpoint, method, started_at,
         duration_ms, num_queries, slow, error, stack_trace, auth_user_id)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            session_id,
            summary.kind,
            summary.endpoint,
            summary.method,
            timestamp(summary.started_at),
            summary.duration_ms(),
            summary.num_queries,
            summary.slow,
            summary.error,
            summary.stack_trace,
            summary.auth_user_id
        ],
    )?;
    let log_id = tx.last_insert_rowid();

    {
        let mut stmt = tx.prepare(
            "INSERT INTO log_entry (session_log_id, session_id, seq, time, level, message,
             error, stack_trace, query, duration_ms, rows_affected)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        )?;
        for (seq, entry) in entries.iter().enumerate() {
            let query = entry.query.as_ref();
            stmt.execute(params![
                log_id,
                session_id,
                seq as i64,
                timestamp(entry.time),
                entry.level.as_str(),
                entry.message,
                entry.error,
                entry.stack_trace,
                query.map(|q| q.query.as_str()),
                query.map(|q| q.duration_ms),
                query.and_then(|q| q.rows_affected)
            ])?;
        }
    }

    tx.commit()?;
    Ok(log_id)
}

#[derive(Serialize)]
struct ConsoleRecord<'a> {
    session_id: Uuid,
    kind: &'a str,
    #[serde(flatten)]
    entry: &'a LogEntry,
}

fn emit_console(format: ConsoleFormat, summary: &SessionSummary, entry: &LogEntry) {
    let line = match format {
        ConsoleFormat::Text => {
            let mut line = format!("[{}] {}", summary.session_id, entry.message);
            if let Some(q) = &entry.query {
                line.push_str(&format!(" ({:.2}ms)", q.duration_ms));
            }
            if let Some(e) = &entry.error {
                line.push_str(&format!(" error: {e}"));
            }
            line
        }
        ConsoleFormat::Json => serde_json::to_string(&ConsoleRecord {
            session_id: summary.session_id,
            kind: summary.kind,
            entry,
        })
        .unwrap_or_else(|_| entry.message.clone()),
    };

    match entry.level {
        LogLevel::Debug => tracing::debug!(target: "wharf::session", "{}", line),
        LogLevel::Info => tracing::info!(target: "wharf::session", "{}", line),
        LogLevel::Warning => tracing::warn!(target: "wharf::session", "{}", line),
        LogLevel::Error => tracing::error!(target: "wharf::session", "{}", line),
    }
}

fn emit_console_summary(format: ConsoleFormat, summary: &SessionSummary) {
    match format {
        ConsoleFormat::Text => tracing::info!(
            target: "wharf::session",
            "[{}] {} closed after {:.2}ms, {} queries{}",
            summary.session_id,
            summary.kind,
            summary.duration_ms(),
            summary.num_queries,
            summary
                .error
                .as_deref()
                .map(|e| format!(", error: {e}"))
                .unwrap_or_default()
        ),
        ConsoleFormat::Json => {
            let line = serde_json::json!({
                "session_id": summary.session_id,
                "kind": summary.kind,
                "endpoint": summary.endpoint,
                "method": summary.method,
                "duration_ms": summary.duration_ms(),
                "num_queries": summary.num_queries,
                "slow": summary.slow,
                "error": summary.error,
            });
            tracing::info!(target: "wharf::session", "{}", line);
        }
    }
}

// -- Reading back --

#[derive(Debug, Clone)]
pub struct SessionLogRow {
    pub id: i64,
    pub session_id: String,
    pub kind: String,
    pub endpoint: Option<String>,
    pub method: Option<String>,
    pub started_at: String,
    pub duration_ms: f64,
    pub num_queries: i64,
    pub slow: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LogEntryRow {
    pub seq: i64,
    pub time: String,
    pub level: String,
    pub message: String,
    pub error: Option<String>,
    pub stack_trace: Option<String>,
    pub query: Option<String>,
    pub duration_ms: Option<f64>,
}

/// Most recent session rows, newest first.
pub fn query_recent_sessions(conn: &Connection, limit: u32) -> rusqlite::Result<Vec<SessionLogRow>> {
    let mut stmt = conn.prepare(
        "SELECT id, session_id, kind, endpoint, method, started_at, duration_ms,
         num_queries, slow, error
         FROM session_log ORDER BY id DESC LIMIT ?1",
    )?;

    let rows = stmt.query_map(params![limit], |row| {
        Ok(SessionLogRow {
            id: row.get(0)?,
            session_id: row.get(1)?,
            kind: row.get(2)?,
            endpoint: row.get(3)?,
            method: row.get(4)?,
            started_at: row.get(5)?,
            duration_ms: row.get(6)?,
            num_queries: row.get(7)?,
            slow: row.get(8)?,
            error: row.get(9)?,
        })
    })?;

    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

/// Entries of one session in the order they were logged.
pub fn query_session_entries(conn: &Connection, session_id: &str) -> rusqlite::Result<Vec<LogEntryRow>> {
    let mut stmt = conn.prepare(
        "SELECT seq, time, level, message, error, stack_trace, query, duration_ms
         FROM log_entry WHERE session_id = ?1 ORDER BY seq",
    )?;

    let rows = stmt.query_map(params![session_id], |row| {
        Ok(LogEntryRow {
            seq: row.get(0)?,
            time: row.get(1)?,
            level: row.get(2)?,
            message: row.get(3)?,
            error: row.get(4)?,
            stack_trace: row.get(5)?,
            query: row.get(6)?,
            duration_ms: row.get(7)?,
        })
    })?;

    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}
