// src/retention.rs — Session log retention

use rusqlite::params;
use serde::Serialize;
use tracing::info;

use crate::db::{timestamp, ConnectionPool};
use crate::infra::config::RetentionConfig;
use crate::infra::daemon::{spawn_periodic, PeriodicTask};
use crate::infra::errors::Result;

/// Cutoffs applied by one cleanup pass. `None` disables a cutoff.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetentionPolicy {
    pub max_age: Option<chrono::Duration>,
    pub max_count: Option<u64>,
}

impl From<&RetentionConfig> for RetentionPolicy {
    fn from(config: &RetentionConfig) -> Self {
        Self {
            max_age: config.max_age(),
            max_count: config.max_count(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CleanupReport {
    pub removed_by_age: usize,
    pub removed_by_count: usize,
}

impl CleanupReport {
    pub fn total(&self) -> usize {
        self.removed_by_age + self.removed_by_count
    }
}

/// Delete sessions older than the age cutoff, then all but the newest
/// `max_count`. Their entries go with them.
pub async fn cleanup_once(pool: &ConnectionPool, policy: RetentionPolicy) -> Result<CleanupReport> {
    // A cutoff before the earliest representable time removes nothing.
    let cutoff = policy
        .max_age
        .and_then(|age| chrono::Utc::now().checked_sub_signed(age))
        .map(timestamp);
    let max_count = policy.max_count.map(|c| c as i64);

    let report = pool
        .run(move |c| {
            let tx = c.transaction()?;
            let removed_by_age = match &cutoff {
                Some(cutoff) => tx.execute(
                    "DELETE FROM session_log WHERE started_at < ?1",
                    params![cutoff],
                )?,
                None => 0,
            };
            let removed_by_count = match max_count {
                Some(keep) => tx.execute(
                    "DELETE FROM session_log WHERE id NOT IN (
                         SELECT id FROM session_log ORDER BY id DESC LIMIT ?1
                     )",
                    params![keep],
                )?,
                None => 0,
            };
            tx.commit()?;
            Ok(CleanupReport {
                removed_by_age,
                removed_by_count,
            })
        })
        .await?;

    if report.total() > 0 {
        info!(
            "Log cleanup removed {} sessions ({} by age, {} by count)",
            report.total(),
            report.removed_by_age,
            report.removed_by_count
        );
    }
    Ok(report)
}

/// Run `cleanup_once` every `cleanup_interval_secs`.
pub fn spawn_cleanup_task(pool: ConnectionPool, config: &RetentionConfig) -> PeriodicTask {
    let policy = RetentionPolicy::from(config);
    spawn_periodic("log-retention", config.cleanup_interval(), move || {
        let pool = pool.clone();
        async move { cleanup_once(&pool, policy).await.map(|_| ()) }
    })
}
