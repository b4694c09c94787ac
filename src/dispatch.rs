// src/dispatch.rs — Creates sessions for triggers and guarantees their close
//
// Method and web calls are scoped: the session is closed when the handler
// returns, errors, or panics. Stream sessions are closed on disconnect, or
// on drop if the transport forgot. FutureCall sessions wait for a permit.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::BoxFuture;
use futures::FutureExt;
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::session::kind::{RequestContext, SocketRef};
use crate::session::{panic_message, Session, SessionFactory};

/// Result of one scoped call, with what close produced.
#[derive(Debug)]
pub struct Dispatched<T> {
    pub session_id: Uuid,
    pub log_id: Option<i64>,
    pub result: anyhow::Result<T>,
}

#[derive(Debug, Clone)]
pub struct Dispatcher {
    factory: SessionFactory,
    future_call_permits: Arc<Semaphore>,
}

impl Dispatcher {
    pub fn new(factory: SessionFactory) -> Self {
        let limit = factory.resources().config().future_calls.max_concurrent.max(1);
        Self {
            factory,
            future_call_permits: Arc::new(Semaphore::new(limit)),
        }
    }

    pub fn factory(&self) -> &SessionFactory {
        &self.factory
    }

    /// FutureCall sessions that could start right now.
    pub fn available_future_call_slots(&self) -> usize {
        self.future_call_permits.available_permits()
    }

    pub async fn handle_method_call<T, F>(
        &self,
        request: RequestContext,
        method: &str,
        handler: F,
    ) -> Dispatched<T>
    where
        F: for<'s> FnOnce(&'s Session) -> BoxFuture<'s, anyhow::Result<T>>,
    {
        let session = self.factory.create_method_call(request, method);
        run_scoped(session, handler).await
    }

    pub async fn handle_web_call<T, F>(&self, request: RequestContext, handler: F) -> Dispatched<T>
    where
        F: for<'s> FnOnce(&'s Session) -> BoxFuture<'s, anyhow::Result<T>>,
    {
        let session = self.factory.create_web_call(request);
        run_scoped(session, handler).await
    }

    /// Waits for a free slot before the session is created, so a throttled
    /// call does not start its clock early.
    pub async fn handle_future_call<T, F>(
        &self,
        name: &str,
        identifier: Option<String>,
        handler: F,
    ) -> Dispatched<T>
    where
        F: for<'s> FnOnce(&'s Session) -> BoxFuture<'s, anyhow::Result<T>>,
    {
        let _permit = match self.future_call_permits.clone().acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => {
                return Dispatched {
                    session_id: Uuid::nil(),
                    log_id: None,
                    result: Err(anyhow::anyhow!("future call limiter is closed")),
                }
            }
        };
        let session = self.factory.create_future_call(name, identifier);
        run_scoped(session, handler).await
    }

    pub fn open_method_stream(
        &self,
        connection_id: Uuid,
        endpoint: &str,
        method: &str,
        auth_key: Option<String>,
    ) -> StreamSession {
        StreamSession::new(
            self.factory
                .create_method_stream(connection_id, endpoint, method, auth_key),
        )
    }

    pub fn open_streaming(&self, socket: SocketRef, auth_key: Option<String>) -> StreamSession {
        StreamSession::new(self.factory.create_streaming(socket, auth_key))
    }
}

async fn run_scoped<T, F>(session: Session, handler: F) -> Dispatched<T>
where
    F: for<'s> FnOnce(&'s Session) -> BoxFuture<'s, anyhow::Result<T>>,
{
    let result = match std::panic::catch_unwind(AssertUnwindSafe(|| handler(&session))) {
        Ok(fut) => AssertUnwindSafe(fut)
            .catch_unwind()
            .await
            .unwrap_or_else(|panic| Err(anyhow::anyhow!(panic_message(panic.as_ref())))),
        Err(panic) => Err(anyhow::anyhow!(panic_message(panic.as_ref()))),
    };

    let closed = match &result {
        Ok(_) => session.close().await,
        Err(e) => {
            session
                .close_with(Some(format!("{e:#}")), Some(format!("{e:?}")))
                .await
        }
    };
    let log_id = closed.unwrap_or_else(|e| {
        warn!("Closing session {} failed: {}", session.id(), e);
        None
    });

    Dispatched {
        session_id: session.id(),
        log_id,
        result,
    }
}

/// A session bound to a live stream connection. It is closed exactly once:
/// by `disconnect`, or in the background if the handle is dropped first.
pub struct StreamSession {
    session: Option<Session>,
}

impl StreamSession {
    fn new(session: Session) -> Self {
        Self {
            session: Some(session),
        }
    }

    /// The open session. Always present until `disconnect` consumes the
    /// handle.
    pub fn session(&self) -> &Session {
        match &self.session {
            Some(session) => session,
            None => unreachable!("stream session used after disconnect"),
        }
    }

    /// The transport dropped; close with the reason, if any.
    pub async fn disconnect(mut self, error: Option<String>) -> Option<i64> {
        let session = self.session.take()?;
        match session.close_with(error, None).await {
            Ok(log_id) => log_id,
            Err(e) => {
                warn!("Closing stream session {} failed: {}", session.id(), e);
                None
            }
        }
    }
}

impl Drop for StreamSession {
    fn drop(&mut self) {
        let Some(session) = self.session.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!("Stream session {} dropped; closing in background", session.id());
                handle.spawn(async move {
                    if let Err(e) = session.close_with(Some("stream dropped".into()), None).await {
                        warn!("Closing dropped stream session {} failed: {}", session.id(), e);
                    }
                });
            }
            Err(_) => {
                let removed = session.listener_registry().teardown_all();
                warn!(
                    "Stream session {} dropped outside a runtime; removed {} listeners, logs discarded",
                    session.id(),
                    removed
                );
            }
        }
    }
}
