// src/session/kind.rs — What triggered a session, and the data that came with it

use std::collections::HashMap;
use std::net::SocketAddr;

use tokio::sync::mpsc;
use url::Url;
use uuid::Uuid;

use crate::infra::errors::{Result, WharfError};

/// The inbound HTTP request behind a method call or web call.
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub uri: Url,
    pub http_method: String,
    /// Header names are stored lowercased.
    pub headers: HashMap<String, String>,
    pub body: String,
    pub remote_addr: Option<SocketAddr>,
}

impl RequestContext {
    /// Parse the request target and enforce the body size limit.
    pub fn new(uri: &str, body: impl Into<String>, max_size: usize) -> Result<Self> {
        let body = body.into();
        if body.len() > max_size {
            return Err(WharfError::PayloadTooLarge {
                size: body.len(),
                limit: max_size,
            });
        }
        let uri = Url::parse(uri)
            .map_err(|e| WharfError::Other(anyhow::anyhow!("invalid request uri '{uri}': {e}")))?;
        Ok(Self {
            uri,
            http_method: "POST".into(),
            headers: HashMap::new(),
            body,
            remote_addr: None,
        })
    }

    pub fn with_header(mut self, name: &str, value: impl Into<String>) -> Self {
        self.headers.insert(name.to_ascii_lowercase(), value.into());
        self
    }

    pub fn with_http_method(mut self, method: impl Into<String>) -> Self {
        self.http_method = method.into();
        self
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .get(&name.to_ascii_lowercase())
            .map(|s| s.as_str())
    }

    /// Token from an `Authorization: Bearer <key>` header.
    pub fn bearer_token(&self) -> Option<&str> {
        self.header("authorization")
            .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
            .map(str::trim)
            .filter(|t| !t.is_empty())
    }

    /// First path segment, e.g. `/users/login` → `users`.
    pub fn path_endpoint(&self) -> Option<&str> {
        self.uri
            .path_segments()
            .and_then(|mut s| s.next())
            .filter(|s| !s.is_empty())
    }
}

/// Handle to a live streaming socket. Sends fail once the transport has
/// dropped the other end.
#[derive(Debug, Clone)]
pub struct SocketRef {
    id: Uuid,
    remote_addr: Option<SocketAddr>,
    outbound: mpsc::UnboundedSender<String>,
}

impl SocketRef {
    pub fn new(outbound: mpsc::UnboundedSender<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            remote_addr: None,
            outbound,
        }
    }

    pub fn with_remote_addr(mut self, addr: SocketAddr) -> Self {
        self.remote_addr = Some(addr);
        self
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn remote_addr(&self) -> Option<SocketAddr> {
        self.remote_addr
    }

    pub fn is_connected(&self) -> bool {
        !self.outbound.is_closed()
    }

    pub fn send(&self, text: impl Into<String>) -> Result<()> {
        self.outbound
            .send(text.into())
            .map_err(|_| WharfError::Other(anyhow::anyhow!("socket {} is disconnected", self.id)))
    }
}

/// The closed set of session kinds. Shared behavior lives on `Session`;
/// only the payload differs.
#[derive(Debug, Clone)]
pub enum SessionKind {
    MethodCall {
        request: RequestContext,
        endpoint: String,
        method: String,
    },
    MethodStream {
        connection_id: Uuid,
        endpoint: String,
        method: String,
        auth_key: Option<String>,
    },
    Streaming {
        socket: SocketRef,
        auth_key: Option<String>,
    },
    FutureCall {
        name: String,
        identifier: Option<String>,
    },
    WebCall {
        request: RequestContext,
    },
    Internal,
}

impl SessionKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::MethodCall { .. } => "method_call",
            Self::MethodStream { .. } => "method_stream",
            Self::Streaming { .. } => "streaming",
            Self::FutureCall { .. } => "future_call",
            Self::WebCall { .. } => "web_call",
            Self::Internal => "internal",
        }
    }

    pub fn endpoint(&self) -> Option<&str> {
        match self {
            Self::MethodCall { endpoint, .. } | Self::MethodStream { endpoint, .. } => {
                Some(endpoint)
            }
            Self::FutureCall { name, .. } => Some(name),
            Self::WebCall { request } => Some(request.uri.path()),
            Self::Streaming { .. } | Self::Internal => None,
        }
    }

    pub fn method(&self) -> Option<&str> {
        match self {
            Self::MethodCall { method, .. } | Self::MethodStream { method, .. } => Some(method),
            Self::WebCall { request } => Some(&request.http_method),
            _ => None,
        }
    }

    /// Credential the authentication handler resolves against.
    pub fn auth_key(&self) -> Option<&str> {
        match self {
            Self::MethodCall { request, .. } | Self::WebCall { request } => request.bearer_token(),
            Self::MethodStream { auth_key, .. } | Self::Streaming { auth_key, .. } => {
                auth_key.as_deref()
            }
            Self::FutureCall { .. } | Self::Internal => None,
        }
    }

    /// Only internal sessions are closed by their creator rather than by the
    /// dispatcher or transport.
    pub fn is_manually_closed(&self) -> bool {
        matches!(self, Self::Internal)
    }
}
