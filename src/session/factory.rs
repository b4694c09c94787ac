// src/session/factory.rs — Builds the right session for each trigger

use std::panic::AssertUnwindSafe;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::warn;
use uuid::Uuid;

use super::kind::{RequestContext, SessionKind, SocketRef};
use super::{panic_message, Session};
use crate::infra::errors::{Result, WharfError};
use crate::resources::SharedResources;

/// Creates sessions against one set of shared resources. Construction does
/// no I/O and the factory keeps no reference to what it creates.
#[derive(Debug, Clone)]
pub struct SessionFactory {
    resources: SharedResources,
}

impl SessionFactory {
    pub fn new(resources: SharedResources) -> Self {
        Self { resources }
    }

    pub fn resources(&self) -> &SharedResources {
        &self.resources
    }

    /// A method call; the endpoint defaults to the first path segment.
    pub fn create_method_call(&self, request: RequestContext, method: impl Into<String>) -> Session {
        let endpoint = request.path_endpoint().unwrap_or_default().to_string();
        self.create(SessionKind::MethodCall {
            request,
            endpoint,
            method: method.into(),
        })
    }

    pub fn create_method_stream(
        &self,
        connection_id: Uuid,
        endpoint: impl Into<String>,
        method: impl Into<String>,
        auth_key: Option<String>,
    ) -> Session {
        self.create(SessionKind::MethodStream {
            connection_id,
            endpoint: endpoint.into(),
            method: method.into(),
            auth_key,
        })
    }

    pub fn create_streaming(&self, socket: SocketRef, auth_key: Option<String>) -> Session {
        self.create(SessionKind::Streaming { socket, auth_key })
    }

    pub fn create_future_call(&self, name: impl Into<String>, identifier: Option<String>) -> Session {
        self.create(SessionKind::FutureCall {
            name: name.into(),
            identifier,
        })
    }

    pub fn create_web_call(&self, request: RequestContext) -> Session {
        self.create(SessionKind::WebCall { request })
    }

    /// An internal session. The caller must close it; prefer
    /// `with_internal_session`, which always does.
    pub fn create_internal(&self, enable_logging: bool) -> Session {
        Session::new(SessionKind::Internal, self.resources.clone(), enable_logging)
    }

    fn create(&self, kind: SessionKind) -> Session {
        Session::new(kind, self.resources.clone(), true)
    }

    /// Run `body` with a fresh internal session, closing it on every exit
    /// path. A body error is recorded on the session and returned as is. A
    /// panic is recorded, the session closed, and the panic resumed.
    pub async fn with_internal_session<T, E, F>(&self, enable_logging: bool, body: F) -> std::result::Result<T, E>
    where
        F: for<'s> FnOnce(&'s Session) -> BoxFuture<'s, std::result::Result<T, E>>,
        E: From<WharfError> + std::fmt::Display,
    {
        let session = self.create_internal(enable_logging);
        let caught = match std::panic::catch_unwind(AssertUnwindSafe(|| body(&session))) {
            Ok(fut) => AssertUnwindSafe(fut).catch_unwind().await,
            Err(panic) => Err(panic),
        };
        let outcome = match caught {
            Ok(outcome) => outcome,
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                if let Err(e) = session.close_with_error(&message, None).await {
                    warn!("Closing session {} failed: {}", session.id(), e);
                }
                std::panic::resume_unwind(panic);
            }
        };
        close_after(&session, &outcome).await?;
        outcome
    }
}

/// Close with the outcome's error, if any. A close failure only surfaces
/// when the body itself succeeded.
pub(crate) async fn close_after<T, E>(session: &Session, outcome: &std::result::Result<T, E>) -> Result<()>
where
    E: std::fmt::Display,
{
    let closed = match outcome {
        Ok(_) => session.close().await,
        Err(e) => session.close_with_error(e, None).await,
    };
    match closed {
        Ok(_) => Ok(()),
        Err(e) if outcome.is_ok() => Err(e),
        Err(e) => {
            warn!("Closing session {} failed: {}", session.id(), e);
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infra::config::ServerConfig;

    fn factory() -> SessionFactory {
        SessionFactory::new(
            SharedResources::builder(ServerConfig::default())
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_kinds() {
        let f = factory();
        let req = RequestContext::new("http://localhost/users", "{}", 100).unwrap();
        let call = f.create_method_call(req, "list");
        assert_eq!(call.kind().name(), "method_call");
        assert_eq!(call.endpoint(), Some("users"));
        assert_eq!(call.method(), Some("list"));

        let job = f.create_future_call("nightly", None);
        assert_eq!(job.endpoint(), Some("nightly"));
        assert!(f.create_internal(false).kind().is_manually_closed());
    }

    #[tokio::test]
    async fn test_with_internal_session_closes_on_error() {
        let f = factory();
        let seen = std::sync::Arc::new(parking_lot::Mutex::new(None));
        let s2 = seen.clone();
        let result: std::result::Result<(), WharfError> = f
            .with_internal_session(true, move |session| {
                Box::pin(async move {
                    *s2.lock() = Some(session.id());
                    Err(WharfError::config("boom"))
                })
            })
            .await;
        assert!(result.unwrap_err().is_configuration());
        assert!(seen.lock().is_some());
    }

    #[tokio::test]
    async fn test_with_internal_session_closes_on_panic() {
        let f = factory();
        let bus = f.resources().messages().clone();
        let seen = std::sync::Arc::new(parking_lot::Mutex::new(None));
        let closed = std::sync::Arc::new(std::sync::atomic::AtomicBool::new(false));

        let (s2, c2) = (seen.clone(), closed.clone());
        let run = f.with_internal_session(false, move |session| {
            Box::pin(async move {
                *s2.lock() = Some(session.id());
                session.messages().add_listener("ch", |_| {})?;
                session.add_will_close_listener(move |_| {
                    c2.store(true, std::sync::atomic::Ordering::SeqCst);
                    Box::pin(async { Ok(()) })
                })?;
                if session.is_open() {
                    panic!("body blew up");
                }
                Ok::<(), WharfError>(())
            })
        });
        let caught = AssertUnwindSafe(run).catch_unwind().await;

        assert!(caught.is_err());
        let id = seen.lock().unwrap();
        assert_eq!(bus.owned_by(id), 0);
        assert!(closed.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_with_internal_session_returns_value() {
        let f = factory();
        let id = f
            .with_internal_session(true, |session| {
                Box::pin(async move {
                    session.log("working", crate::session::LogLevel::Info)?;
                    Ok::<_, WharfError>(session.id())
                })
            })
            .await
            .unwrap();
        assert!(!id.is_nil());
    }
}
