// src/session/mod.rs — The unit of work: one request, stream, call, or job
//
// A session gives handler code identity, cached authentication, a log
// buffer, and scoped access to shared resources. It is open from creation
// until `close` completes; after that every operation fails with
// `ClosedSession`.

pub mod auth;
pub mod factory;
pub mod kind;
pub mod listeners;
pub mod log;

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use futures::FutureExt;
use parking_lot::{Mutex, MutexGuard};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::infra::config::ServerConfig;
use crate::infra::errors::{Result, WharfError};
use crate::resources::cache::Caches;
use crate::resources::db::Database;
use crate::resources::messages::Messages;
use crate::resources::storage::Storage;
use crate::resources::SharedResources;

pub use auth::{AuthInfo, AuthenticationHandler, Scope};
pub use factory::SessionFactory;
pub use kind::{RequestContext, SessionKind, SocketRef};
pub use listeners::WillCloseListenerId;
pub use log::{LogEntry, LogLevel, LogSettings};

use auth::AuthState;
use listeners::{ListenerRegistry, WillCloseListeners};
use log::{LogAccumulator, QueryInfo, SessionSummary};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Open,
    Closed,
}

enum Lifecycle {
    Open,
    Closed { duration: Duration },
}

pub struct Session {
    id: Uuid,
    kind: SessionKind,
    started_at: DateTime<Utc>,
    started: Instant,
    resources: SharedResources,
    log_settings: LogSettings,
    lifecycle: Mutex<Lifecycle>,
    closing: AtomicBool,
    logs_taken: AtomicBool,
    logs: Mutex<LogAccumulator>,
    listeners: Mutex<ListenerRegistry>,
    will_close: Mutex<WillCloseListeners>,
    auth: tokio::sync::Mutex<AuthState>,
    user_object: Mutex<Option<Arc<dyn Any + Send + Sync>>>,
    in_transaction: AtomicBool,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("kind", &self.kind.name())
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    pub(crate) fn new(kind: SessionKind, resources: SharedResources, enable_logging: bool) -> Self {
        let id = Uuid::new_v4();
        let mut log_settings = LogSettings::from_config(&resources.config().logging);
        log_settings.enabled = enable_logging;
        let listeners = ListenerRegistry::new(resources.messages().clone(), id);
        debug!("Session {} opened ({})", id, kind.name());

        Self {
            id,
            kind,
            started_at: Utc::now(),
            started: Instant::now(),
            resources,
            log_settings,
            lifecycle: Mutex::new(Lifecycle::Open),
            closing: AtomicBool::new(false),
            logs_taken: AtomicBool::new(false),
            logs: Mutex::new(LogAccumulator::new()),
            listeners: Mutex::new(listeners),
            will_close: Mutex::new(WillCloseListeners::default()),
            auth: tokio::sync::Mutex::new(AuthState::Unresolved),
            user_object: Mutex::new(None),
            in_transaction: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> &SessionKind {
        &self.kind
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    pub fn state(&self) -> SessionState {
        match *self.lifecycle.lock() {
            Lifecycle::Open => SessionState::Open,
            Lifecycle::Closed { .. } => SessionState::Closed,
        }
    }

    pub fn is_open(&self) -> bool {
        self.state() == SessionState::Open
    }

    /// Time since creation while open; frozen once closed.
    pub fn duration(&self) -> Duration {
        match *self.lifecycle.lock() {
            Lifecycle::Open => self.started.elapsed(),
            Lifecycle::Closed { duration } => duration,
        }
    }

    pub fn endpoint(&self) -> Option<&str> {
        self.kind.endpoint()
    }

    pub fn method(&self) -> Option<&str> {
        self.kind.method()
    }

    pub fn auth_key(&self) -> Option<&str> {
        self.kind.auth_key()
    }

    pub fn config(&self) -> &ServerConfig {
        self.resources.config()
    }

    pub fn passwords(&self) -> &HashMap<String, String> {
        &self.resources.config().passwords
    }

    pub fn log_settings(&self) -> &LogSettings {
        &self.log_settings
    }

    pub(crate) fn ensure_open(&self) -> Result<()> {
        match *self.lifecycle.lock() {
            Lifecycle::Open => Ok(()),
            Lifecycle::Closed { .. } => Err(WharfError::ClosedSession {
                session_id: self.id,
            }),
        }
    }

    // -- Logging --

    pub fn log(&self, message: impl Into<String>, level: LogLevel) -> Result<()> {
        self.append(LogEntry::new(level, message))
    }

    pub fn log_error(
        &self,
        message: impl Into<String>,
        level: LogLevel,
        error: impl fmt::Display,
        stack_trace: Option<String>,
    ) -> Result<()> {
        self.append(LogEntry::new(level, message).with_error(Some(error.to_string()), stack_trace))
    }

    fn append(&self, entry: LogEntry) -> Result<()> {
        self.ensure_open()?;
        if !self.log_settings.accepts(entry.level) {
            return Ok(());
        }
        let mut logs = self.logs.lock();
        if self.logs_taken.load(Ordering::Acquire) {
            debug!("Session {} is closing; dropped log entry '{}'", self.id, entry.message);
            return Ok(());
        }
        logs.append(entry);
        Ok(())
    }

    /// Count a database statement and, if the settings call for it, log it.
    pub(crate) fn record_query(
        &self,
        query: &str,
        duration: Duration,
        rows_affected: Option<i64>,
        error: Option<String>,
    ) {
        let mut logs = self.logs.lock();
        if self.logs_taken.load(Ordering::Acquire) {
            debug!("Session {} is closing; dropped query log", self.id);
            return;
        }
        logs.record_query();
        if !self.log_settings.should_log_query(duration, error.is_some()) {
            return;
        }
        let info = QueryInfo {
            query: query.to_string(),
            duration_ms: duration.as_secs_f64() * 1000.0,
            rows_affected,
            slow: self.log_settings.is_slow_query(duration),
        };
        logs.append(LogEntry::query(info, error));
    }

    /// Number of buffered log entries not yet flushed.
    pub fn pending_log_entries(&self) -> usize {
        self.logs.lock().len()
    }

    // -- Authentication --

    /// The caller's identity, resolved through the configured handler on
    /// first access and cached for the rest of the session.
    pub async fn authenticated(&self) -> Result<Option<AuthInfo>> {
        self.ensure_open()?;
        let mut state = self.auth.lock().await;
        if let AuthState::Resolved(info) = &*state {
            return Ok(info.clone());
        }
        let resolved = match self.resources.auth_handler() {
            Some(handler) => handler.resolve(self).await?,
            None => None,
        };
        *state = AuthState::Resolved(resolved.clone());
        Ok(resolved)
    }

    /// Replace the cached identity, e.g. after sign-in or sign-out.
    pub async fn update_authenticated(&self, info: Option<AuthInfo>) -> Result<()> {
        self.ensure_open()?;
        *self.auth.lock().await = AuthState::Resolved(info);
        Ok(())
    }

    pub async fn is_user_signed_in(&self) -> Result<bool> {
        Ok(self.authenticated().await?.is_some())
    }

    // -- Will-close listeners --

    pub fn add_will_close_listener<F>(&self, listener: F) -> Result<WillCloseListenerId>
    where
        F: for<'a> Fn(&'a Session) -> BoxFuture<'a, anyhow::Result<()>> + Send + Sync + 'static,
    {
        self.ensure_open()?;
        Ok(self.will_close.lock().add(Box::new(listener)))
    }

    pub fn remove_will_close_listener(&self, id: WillCloseListenerId) -> Result<bool> {
        self.ensure_open()?;
        Ok(self.will_close.lock().remove(id))
    }

    // -- User object --

    pub fn set_user_object<T: Any + Send + Sync>(&self, value: T) -> Result<()> {
        self.ensure_open()?;
        *self.user_object.lock() = Some(Arc::new(value));
        Ok(())
    }

    pub fn user_object<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let slot = self.user_object.lock().clone()?;
        slot.downcast::<T>().ok()
    }

    // -- Resource accessors --

    pub fn db(&self) -> Database<'_> {
        Database::new(self, self.resources.pool())
    }

    pub fn caches(&self) -> Caches<'_> {
        Caches::new(self, self.resources.caches())
    }

    pub fn storage(&self) -> Storage<'_> {
        Storage::new(self, self.resources.storage())
    }

    pub fn messages(&self) -> Messages<'_> {
        Messages::new(self, self.resources.messages())
    }

    pub(crate) fn listener_registry(&self) -> MutexGuard<'_, ListenerRegistry> {
        self.listeners.lock()
    }

    pub fn in_transaction(&self) -> bool {
        self.in_transaction.load(Ordering::Acquire)
    }

    /// Mark a transaction as running. Fails if one already is.
    pub(crate) fn enter_transaction(&self) -> Result<TransactionScope<'_>> {
        if self.in_transaction.swap(true, Ordering::AcqRel) {
            return Err(WharfError::NestedTransaction {
                session_id: self.id,
            });
        }
        Ok(TransactionScope { session: self })
    }

    // -- Close --

    pub async fn close(&self) -> Result<Option<i64>> {
        self.close_with(None, None).await
    }

    /// Close recording the failure that ended the session.
    pub async fn close_with_error(
        &self,
        error: impl fmt::Display,
        stack_trace: Option<String>,
    ) -> Result<Option<i64>> {
        self.close_with(Some(error.to_string()), stack_trace).await
    }

    /// Run will-close listeners, tear down message listeners, flush the log
    /// buffer, then mark the session closed. Returns the persisted session
    /// log id, if any. A second call fails with `ClosedSession`.
    pub async fn close_with(
        &self,
        error: Option<String>,
        stack_trace: Option<String>,
    ) -> Result<Option<i64>> {
        self.ensure_open()?;
        if self.closing.swap(true, Ordering::AcqRel) {
            return Err(WharfError::ClosedSession {
                session_id: self.id,
            });
        }
        let duration = self.started.elapsed();

        self.run_will_close_listeners().await;

        let removed = self.listeners.lock().teardown_all();
        if removed > 0 {
            debug!("Session {} removed {} message listeners", self.id, removed);
        }

        let accumulator = {
            let mut logs = self.logs.lock();
            self.logs_taken.store(true, Ordering::Release);
            std::mem::take(&mut *logs)
        };
        let auth_user_id = self
            .auth
            .try_lock()
            .ok()
            .and_then(|state| state.user_id());
        let summary = SessionSummary {
            session_id: self.id,
            kind: self.kind.name(),
            endpoint: self.kind.endpoint().map(str::to_string),
            method: self.kind.method().map(str::to_string),
            started_at: self.started_at,
            duration,
            num_queries: 0,
            slow: duration >= self.log_settings.slow_session_threshold,
            error,
            stack_trace,
            auth_user_id,
        };
        let flushed = self
            .resources
            .log_writer()
            .flush(accumulator, summary, &self.log_settings)
            .await;

        *self.lifecycle.lock() = Lifecycle::Closed { duration };
        debug!("Session {} closed after {:?}", self.id, duration);

        flushed.map_err(|e| {
            warn!("Failed to write logs for session {}: {}", self.id, e);
            e
        })
    }

    async fn run_will_close_listeners(&self) {
        let listeners = self.will_close.lock().take_all();
        for (id, listener) in listeners {
            let outcome = match std::panic::catch_unwind(AssertUnwindSafe(|| listener(self))) {
                Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
                Err(panic) => Err(panic),
            };
            let failure = match outcome {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => format!("{e:#}"),
                Err(panic) => panic_message(panic.as_ref()),
            };
            warn!("Will-close listener {} of session {} failed: {}", id, self.id, failure);
            self.logs.lock().append(
                LogEntry::new(LogLevel::Error, format!("Will-close listener {id} failed"))
                    .with_error(Some(failure), None),
            );
        }
    }
}

/// Clears the session's transaction flag on every exit path.
pub(crate) struct TransactionScope<'s> {
    session: &'s Session,
}

impl Drop for TransactionScope<'_> {
    fn drop(&mut self) {
        self.session.in_transaction.store(false, Ordering::Release);
    }
}

pub(crate) fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        format!("panicked: {s}")
    } else if let Some(s) = panic.downcast_ref::<String>() {
        format!("panicked: {s}")
    } else {
        "panicked".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::SharedResources;
    use std::sync::atomic::AtomicUsize;

    fn internal_session() -> Session {
        let resources = SharedResources::builder(ServerConfig::default())
            .build()
            .unwrap();
        Session::new(SessionKind::Internal, resources, true)
    }

    #[tokio::test]
    async fn test_log_below_level_is_dropped() {
        let session = internal_session();
        session.log("hidden", LogLevel::Debug).unwrap();
        session.log("kept", LogLevel::Info).unwrap();
        assert_eq!(session.pending_log_entries(), 1);
    }

    #[tokio::test]
    async fn test_close_twice_fails() {
        let session = internal_session();
        session.close().await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
        assert!(session.close().await.unwrap_err().is_closed_session());
    }

    #[tokio::test]
    async fn test_operations_after_close_fail() {
        let session = internal_session();
        session.close().await.unwrap();
        assert!(session.log("late", LogLevel::Info).unwrap_err().is_closed_session());
        assert!(session.authenticated().await.unwrap_err().is_closed_session());
        assert!(session
            .add_will_close_listener(|_| Box::pin(async { Ok(()) }))
            .unwrap_err()
            .is_closed_session());
        assert!(session.set_user_object(1u32).unwrap_err().is_closed_session());
    }

    #[tokio::test]
    async fn test_duration_frozen_after_close() {
        let session = internal_session();
        session.close().await.unwrap();
        let first = session.duration();
        tokio::time::sleep(Duration::from_millis(5)).await;
        assert_eq!(session.duration(), first);
    }

    #[tokio::test]
    async fn test_failing_listener_does_not_stop_others() {
        let session = internal_session();
        let ran = Arc::new(AtomicUsize::new(0));

        session
            .add_will_close_listener(|_| Box::pin(async { Err(anyhow::anyhow!("first fails")) }))
            .unwrap();
        session
            .add_will_close_listener(|_| panic!("second panics"))
            .unwrap();
        let r = ran.clone();
        session
            .add_will_close_listener(move |_| {
                r.fetch_add(1, Ordering::SeqCst);
                Box::pin(async { Ok(()) })
            })
            .unwrap();

        session.close().await.unwrap();
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_user_object_roundtrip() {
        let session = internal_session();
        assert!(session.user_object::<String>().is_none());
        session.set_user_object(String::from("cart-17")).unwrap();
        assert_eq!(session.user_object::<String>().unwrap().as_str(), "cart-17");
        assert!(session.user_object::<u32>().is_none());
    }

    #[tokio::test]
    async fn test_log_after_buffer_taken_is_dropped() {
        let session = internal_session();
        session.log("kept", LogLevel::Info).unwrap();
        *session.logs.lock() = LogAccumulator::new();
        session.logs_taken.store(true, Ordering::Release);

        session.log("late", LogLevel::Info).unwrap();
        session.record_query("SELECT 1", Duration::from_millis(1), None, Some("x".into()));
        assert_eq!(session.pending_log_entries(), 0);
    }

    #[tokio::test]
    async fn test_nested_transaction_scope() {
        let session = internal_session();
        let scope = session.enter_transaction().unwrap();
        assert!(session.in_transaction());
        assert!(matches!(
            session.enter_transaction(),
            Err(WharfError::NestedTransaction { .. })
        ));
        drop(scope);
        assert!(session.enter_transaction().is_ok());
    }
}
