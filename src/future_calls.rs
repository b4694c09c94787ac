// src/future_calls.rs — Scheduled background calls
//
// Calls are persisted in the `future_call` table. A scan claims every due
// row (deleting it in the same transaction) and runs each through the
// dispatcher, which applies the concurrency limit.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rusqlite::params;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::db::{timestamp, ConnectionPool};
use crate::dispatch::Dispatcher;
use crate::infra::daemon::{spawn_periodic, PeriodicTask};
use crate::infra::errors::{Result, WharfError};
use crate::session::Session;

/// A named unit of background work.
#[async_trait]
pub trait FutureCall: Send + Sync {
    fn name(&self) -> &str;
    async fn invoke(&self, session: &Session, payload: Option<Value>) -> anyhow::Result<()>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ScheduledCall {
    pub id: i64,
    pub name: String,
    pub payload: Option<Value>,
    pub identifier: Option<String>,
    pub run_at: String,
}

pub struct FutureCallManager {
    dispatcher: Dispatcher,
    pool: ConnectionPool,
    calls: RwLock<HashMap<String, Arc<dyn FutureCall>>>,
}

impl FutureCallManager {
    /// Future calls are persisted, so a database is required.
    pub fn new(dispatcher: Dispatcher) -> Result<Self> {
        let pool = dispatcher
            .factory()
            .resources()
            .pool()
            .cloned()
            .ok_or_else(|| WharfError::config("future calls require a database"))?;
        Ok(Self {
            dispatcher,
            pool,
            calls: RwLock::new(HashMap::new()),
        })
    }

    pub fn register(&self, call: Arc<dyn FutureCall>) {
        let name = call.name().to_string();
        debug!("Registered future call '{}'", name);
        self.calls.write().insert(name, call);
    }

    pub fn registered(&self) -> Vec<String> {
        let mut names: Vec<String> = self.calls.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Persist a call to run at `at`. Returns the schedule row id.
    pub async fn schedule(
        &self,
        name: &str,
        payload: Option<Value>,
        at: DateTime<Utc>,
        identifier: Option<String>,
    ) -> Result<i64> {
        if !self.calls.read().contains_key(name) {
            return Err(WharfError::UnknownFutureCall {
                name: name.to_string(),
            });
        }
        let name = name.to_string();
        let payload = payload.map(|p| p.to_string());
        self.pool
            .run(move |c| {
                c.execute(
                    "INSERT INTO future_call (name, payload, identifier, run_at, created_at)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![name, payload, identifier, timestamp(at), timestamp(Utc::now())],
                )?;
                Ok(c.last_insert_rowid())
            })
            .await
    }

    pub async fn schedule_in(
        &self,
        name: &str,
        payload: Option<Value>,
        delay: Duration,
        identifier: Option<String>,
    ) -> Result<i64> {
        let delay = chrono::Duration::from_std(delay)
            .map_err(|e| WharfError::Other(anyhow::anyhow!("delay out of range: {e}")))?;
        self.schedule(name, payload, Utc::now() + delay, identifier)
            .await
    }

    /// Drop every pending call with this identifier.
    pub async fn cancel(&self, identifier: &str) -> Result<usize> {
        let identifier = identifier.to_string();
        self.pool
            .run(move |c| {
                c.execute(
                    "DELETE FROM future_call WHERE identifier = ?1",
                    params![identifier],
                )
            })
            .await
    }

    pub async fn pending(&self) -> Result<Vec<ScheduledCall>> {
        self.pool.run(|c| list_pending(c)).await
    }

    /// Claim and run every due call. Returns how many ran.
    pub async fn scan_once(&self) -> Result<usize> {
        let now = timestamp(Utc::now());
        let due = self
            .pool
            .run(move |c| claim_due(c, &now))
            .await?;
        if due.is_empty() {
            return Ok(0);
        }

        let runs = due.into_iter().filter_map(|call| {
            let handler = self.calls.read().get(&call.name).cloned();
            match handler {
                Some(handler) => Some(self.run_call(handler, call)),
                None => {
                    warn!("Dropping scheduled call for unregistered '{}'", call.name);
                    None
                }
            }
        });
        let ran = futures::future::join_all(runs.collect::<Vec<_>>()).await.len();
        Ok(ran)
    }

    async fn run_call(&self, handler: Arc<dyn FutureCall>, call: ScheduledCall) {
        let ScheduledCall {
            id,
            name,
            payload,
            identifier,
            ..
        } = call;
        let dispatched = self
            .dispatcher
            .handle_future_call(&name, identifier, move |session| {
                Box::pin(async move { handler.invoke(session, payload).await })
            })
            .await;
        match dispatched.result {
            Ok(()) => debug!("Future call '{}' ({}) finished", name, id),
            Err(e) => warn!("Future call '{}' ({}) failed: {:#}", name, id, e),
        }
    }

    /// Scan on the configured interval until the handle is stopped.
    pub fn spawn_scanner(self: Arc<Self>) -> PeriodicTask {
        let interval = Duration::from_millis(
            self.dispatcher
                .factory()
                .resources()
                .config()
                .future_calls
                .scan_interval_ms
                .max(1),
        );
        info!("Future call scanner every {:?}", interval);
        spawn_periodic("future-calls", interval, move || {
            let manager = self.clone();
            async move { manager.scan_once().await.map(|_| ()) }
        })
    }
}

fn claim_due(conn: &mut rusqlite::Connection, now: &str) -> rusqlite::Result<Vec<ScheduledCall>> {
    let tx = conn.transaction()?;
    let due = {
        let mut stmt = tx.prepare(
            "SELECT id, name, payload, identifier, run_at FROM future_call
             WHERE run_at <= ?1 ORDER BY run_at, id",
        )?;
        let rows = stmt.query_map(params![now], scheduled_from_row)?;
        rows.collect::<rusqlite::Result<Vec<_>>>()?
    };
    for call in &due {
        tx.execute("DELETE FROM future_call WHERE id = ?1", params![call.id])?;
    }
    tx.commit()?;
    Ok(due)
}

/// Every pending call, soonest first.
pub fn list_pending(conn: &rusqlite::Connection) -> rusqlite::Result<Vec<ScheduledCall>> {
    let mut stmt = conn.prepare(
        "SELECT id, name, payload, identifier, run_at FROM future_call ORDER BY run_at, id",
    )?;
    let rows = stmt.query_map([], scheduled_from_row)?;

    let mut result = Vec::new();
    for row in rows {
        result.push(row?);
    }
    Ok(result)
}

fn scheduled_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<ScheduledCall> {
    let payload: Option<String> = row.get(2)?;
    Ok(ScheduledCall {
        id: row.get(0)?,
        name: row.get(1)?,
        payload: payload.and_then(|p| serde_json::from_str(&p).ok()),
        identifier: row.get(3)?,
        run_at: row.get(4)?,
    })
}
