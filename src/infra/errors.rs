// src/infra/errors.rs — Error types for wharf

use thiserror::Error;
use uuid::Uuid;

pub type Result<T, E = WharfError> = std::result::Result<T, E>;

#[derive(Error, Debug)]
pub enum WharfError {
    // Session misuse (programming errors, never retried)
    #[error("Session {session_id} is closed")]
    ClosedSession { session_id: Uuid },

    #[error("Session {session_id} already has an open transaction")]
    NestedTransaction { session_id: Uuid },

    // Deployment errors
    #[error("Configuration error: {0}")]
    Configuration(String),

    // Resource errors
    #[error("Storage '{storage_id}' error: {message}")]
    Storage { storage_id: String, message: String },

    #[error("Storage '{storage_id}' is not configured")]
    StorageNotFound { storage_id: String },

    #[error("Upload rejected: {0}")]
    UploadRejected(String),

    #[error("Payload of {size} bytes exceeds the {limit} byte limit")]
    PayloadTooLarge { size: usize, limit: usize },

    #[error("Future call '{name}' is not registered")]
    UnknownFutureCall { name: String },

    // Infra
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl WharfError {
    pub fn config(message: impl Into<String>) -> Self {
        WharfError::Configuration(message.into())
    }

    pub fn storage(storage_id: &str, message: impl std::fmt::Display) -> Self {
        WharfError::Storage {
            storage_id: storage_id.to_string(),
            message: message.to_string(),
        }
    }

    pub fn is_closed_session(&self) -> bool {
        matches!(self, WharfError::ClosedSession { .. })
    }

    pub fn is_configuration(&self) -> bool {
        matches!(self, WharfError::Configuration(_))
    }
}

impl From<tokio::task::JoinError> for WharfError {
    fn from(e: tokio::task::JoinError) -> Self {
        WharfError::Other(anyhow::anyhow!("blocking task failed: {e}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closed_session_predicate() {
        let e = WharfError::ClosedSession {
            session_id: Uuid::nil(),
        };
        assert!(e.is_closed_session());
        assert!(!e.is_configuration());
        assert!(e.to_string().contains("is closed"));
    }

    #[test]
    fn test_config_helper() {
        let e = WharfError::config("global cache is disabled");
        assert!(e.is_configuration());
        assert_eq!(
            e.to_string(),
            "Configuration error: global cache is disabled"
        );
    }

    #[test]
    fn test_database_from() {
        let e: WharfError = rusqlite::Error::QueryReturnedNoRows.into();
        assert!(matches!(e, WharfError::Database(_)));
    }
}
