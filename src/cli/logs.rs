// src/cli/logs.rs — Session log inspection and maintenance commands

use serde::Serialize;

use crate::db::ConnectionPool;
use crate::future_calls::{list_pending, ScheduledCall};
use crate::infra::config::{age_cutoff, RetentionConfig};
use crate::retention::{cleanup_once, CleanupReport, RetentionPolicy};
use crate::session::log::{query_recent_sessions, query_session_entries, LogEntryRow, SessionLogRow};

#[derive(Serialize)]
struct SessionJson<'a> {
    id: i64,
    session_id: &'a str,
    kind: &'a str,
    endpoint: Option<&'a str>,
    method: Option<&'a str>,
    started_at: &'a str,
    duration_ms: f64,
    num_queries: i64,
    slow: bool,
    error: Option<&'a str>,
}

impl<'a> From<&'a SessionLogRow> for SessionJson<'a> {
    fn from(row: &'a SessionLogRow) -> Self {
        Self {
            id: row.id,
            session_id: &row.session_id,
            kind: &row.kind,
            endpoint: row.endpoint.as_deref(),
            method: row.method.as_deref(),
            started_at: &row.started_at,
            duration_ms: row.duration_ms,
            num_queries: row.num_queries,
            slow: row.slow,
            error: row.error.as_deref(),
        }
    }
}

#[derive(Serialize)]
struct EntryJson<'a> {
    seq: i64,
    time: &'a str,
    level: &'a str,
    message: &'a str,
    error: Option<&'a str>,
    stack_trace: Option<&'a str>,
    query: Option<&'a str>,
    duration_ms: Option<f64>,
}

impl<'a> From<&'a LogEntryRow> for EntryJson<'a> {
    fn from(row: &'a LogEntryRow) -> Self {
        Self {
            seq: row.seq,
            time: &row.time,
            level: &row.level,
            message: &row.message,
            error: row.error.as_deref(),
            stack_trace: row.stack_trace.as_deref(),
            query: row.query.as_deref(),
            duration_ms: row.duration_ms,
        }
    }
}

/// List recent sessions, or the entries of one.
pub async fn run_logs(
    pool: &ConnectionPool,
    limit: u32,
    session: Option<String>,
    json: bool,
) -> anyhow::Result<()> {
    match session {
        Some(session_id) => {
            let lookup = session_id.clone();
            let entries = pool
                .run(move |c| query_session_entries(c, &lookup))
                .await?;
            if json {
                let out: Vec<EntryJson> = entries.iter().map(EntryJson::from).collect();
                println!("{}", serde_json::to_string_pretty(&out)?);
                return Ok(());
            }
            if entries.is_empty() {
                println!("No entries for session {}", session_id);
                return Ok(());
            }
            println!("Session {}", session_id);
            for entry in &entries {
                println!("{}", format_entry(entry));
            }
        }
        None => {
            let sessions = pool.run(move |c| query_recent_sessions(c, limit)).await?;
            if json {
                let out: Vec<SessionJson> = sessions.iter().map(SessionJson::from).collect();
                println!("{}", serde_json::to_string_pretty(&out)?);
                return Ok(());
            }
            if sessions.is_empty() {
                println!("No session logs recorded.");
                return Ok(());
            }
            for row in &sessions {
                println!("{}", format_session(row));
            }
        }
    }
    Ok(())
}

fn format_session(row: &SessionLogRow) -> String {
    let target = match (&row.endpoint, &row.method) {
        (Some(e), Some(m)) => format!("{e}.{m}"),
        (Some(e), None) => e.clone(),
        _ => "-".to_string(),
    };
    let mut line = format!(
        "{:>6}  {}  {:<13} {:<28} {:>9.1}ms  {} queries",
        row.id, row.started_at, row.kind, target, row.duration_ms, row.num_queries
    );
    if row.slow {
        line.push_str("  SLOW");
    }
    if let Some(ref err) = row.error {
        line.push_str(&format!("  error: {err}"));
    }
    line
}

fn format_entry(entry: &LogEntryRow) -> String {
    let mut line = format!(
        "  #{:<3} {} [{}] {}",
        entry.seq, entry.time, entry.level, entry.message
    );
    if let Some(ms) = entry.duration_ms {
        line.push_str(&format!(" ({ms:.1}ms)"));
    }
    if let Some(ref err) = entry.error {
        line.push_str(&format!("\n        error: {err}"));
    }
    if let Some(ref trace) = entry.stack_trace {
        for frame in trace.lines() {
            line.push_str(&format!("\n        {frame}"));
        }
    }
    line
}

/// Apply retention once, with optional overrides of the configured cutoffs.
/// An override of `0` disables that cutoff.
pub async fn run_cleanup(
    pool: &ConnectionPool,
    config: &RetentionConfig,
    max_age_hours: Option<u64>,
    max_count: Option<u64>,
) -> anyhow::Result<CleanupReport> {
    let mut policy = RetentionPolicy::from(config);
    if let Some(hours) = max_age_hours {
        policy.max_age = age_cutoff(hours);
    }
    if let Some(count) = max_count {
        policy.max_count = (count > 0).then_some(count);
    }

    let report = cleanup_once(pool, policy).await?;
    println!(
        "Removed {} sessions ({} by age, {} by count)",
        report.total(),
        report.removed_by_age,
        report.removed_by_count
    );
    Ok(report)
}

/// Print pending future calls, soonest first.
pub async fn run_future_calls(pool: &ConnectionPool, identifier: Option<String>) -> anyhow::Result<()> {
    let calls: Vec<ScheduledCall> = pool
        .run(|c| list_pending(c))
        .await?
        .into_iter()
        .filter(|call| identifier.is_none() || call.identifier == identifier)
        .collect();

    if calls.is_empty() {
        println!("No future calls scheduled.");
        return Ok(());
    }
    for call in &calls {
        println!(
            "{:>6}  {}  {:<24} {}",
            call.id,
            call.run_at,
            call.name,
            call.identifier.as_deref().unwrap_or("-")
        );
    }
    Ok(())
}
