// src/session/auth.rs — Authentication info and the pluggable handler

use std::collections::{HashMap, HashSet};
use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use super::Session;

/// A named permission granted to an authenticated user.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Scope(String);

impl Scope {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn admin() -> Self {
        Self::new("admin")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthInfo {
    pub user_id: String,
    pub scopes: HashSet<Scope>,
    /// Identifier of the key that authenticated this user, when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_id: Option<String>,
}

impl AuthInfo {
    pub fn new(user_id: impl Into<String>, scopes: impl IntoIterator<Item = Scope>) -> Self {
        Self {
            user_id: user_id.into(),
            scopes: scopes.into_iter().collect(),
            auth_id: None,
        }
    }

    pub fn with_auth_id(mut self, auth_id: impl Into<String>) -> Self {
        self.auth_id = Some(auth_id.into());
        self
    }

    pub fn has_scope(&self, scope: &Scope) -> bool {
        self.scopes.contains(scope)
    }
}

/// Resolves the caller behind a session. Invoked at most once per session,
/// on first access to `Session::authenticated`.
#[async_trait]
pub trait AuthenticationHandler: Send + Sync {
    async fn resolve(&self, session: &Session) -> anyhow::Result<Option<AuthInfo>>;
}

/// Resolves fixed keys to fixed users. Useful for tooling and tests.
#[derive(Debug, Clone, Default)]
pub struct StaticKeyHandler {
    keys: HashMap<String, AuthInfo>,
}

impl StaticKeyHandler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, key: impl Into<String>, info: AuthInfo) -> Self {
        self.keys.insert(key.into(), info);
        self
    }
}

#[async_trait]
impl AuthenticationHandler for StaticKeyHandler {
    async fn resolve(&self, session: &Session) -> anyhow::Result<Option<AuthInfo>> {
        Ok(session.auth_key().and_then(|key| self.keys.get(key).cloned()))
    }
}

/// Cached result of resolution. `Resolved(None)` means "resolved, nobody".
#[derive(Debug, Clone, Default)]
pub(crate) enum AuthState {
    #[default]
    Unresolved,
    Resolved(Option<AuthInfo>),
}

impl AuthState {
    pub(crate) fn user_id(&self) -> Option<String> {
        match self {
            Self::Resolved(Some(info)) => Some(info.user_id.clone()),
            _ => None,
        }
    }
}
