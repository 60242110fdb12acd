//! Error types for agendamento-publisher operations.
//!
//! Defines the error types shared across subsystems:
//! - Agendamento storage
//! - Platform publishing
//! - Due-agendamento loading
//!
//! Queue and worker pool errors live next to their modules
//! (`scheduler::QueueError`, `scheduler::PoolError`).

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::agendamento::AgendamentoStatus;
use crate::storage::MigrationError;

/// Errors that can occur in the agendamento store.
#[derive(Debug, Error)]
pub enum StorageError {
    /// Connection to the database failed.
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Query execution failed.
    #[error("Query failed: {0}")]
    QueryFailed(#[from] sqlx::Error),

    /// Record not found.
    #[error("Agendamento {0} not found")]
    NotFound(Uuid),

    /// A record with the same id already exists.
    #[error("Agendamento {0} already exists")]
    Duplicate(Uuid),

    /// The requested status change is not part of the lifecycle.
    #[error("Invalid transition for agendamento {id}: {from} -> {to}")]
    InvalidTransition {
        id: Uuid,
        from: AgendamentoStatus,
        to: AgendamentoStatus,
    },

    /// A stored row could not be decoded.
    #[error("Corrupt record: {0}")]
    CorruptRecord(String),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Migration error.
    #[error("Migration error: {0}")]
    Migration(#[from] MigrationError),
}

/// Errors that can occur while publishing to a social platform.
///
/// Every variant is treated as a failed attempt and retried until the job's
/// retry budget is spent.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Platform API error (status {status}): {message}")]
    Api {
        status: u16,
        code: Option<i64>,
        message: String,
    },

    #[error("Publish timed out after {0:?}")]
    Timeout(Duration),

    #[error("Missing credentials: {0}")]
    MissingCredentials(String),

    #[error("No publisher registered for platform '{0}'")]
    UnsupportedPlatform(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

/// Errors that abort a loader sweep as a whole.
///
/// Per-item failures are reported in the `LoadReport` instead.
#[derive(Debug, Error)]
pub enum LoaderError {
    #[error("Failed to list due agendamentos: {0}")]
    ListDue(#[source] StorageError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_error_display() {
        let id = Uuid::nil();
        let err = StorageError::InvalidTransition {
            id,
            from: AgendamentoStatus::Published,
            to: AgendamentoStatus::Queued,
        };
        assert!(err.to_string().contains("published -> queued"));

        let err = StorageError::NotFound(id);
        assert!(err.to_string().contains(&id.to_string()));
    }

    #[test]
    fn test_publish_error_display() {
        let err = PublishError::Api {
            status: 400,
            code: Some(100),
            message: "Invalid parameter".to_string(),
        };
        assert!(err.to_string().contains("400"));
        assert!(err.to_string().contains("Invalid parameter"));

        let err = PublishError::Timeout(Duration::from_secs(30));
        assert!(err.to_string().contains("30s"));
    }

    #[test]
    fn test_loader_error_keeps_source() {
        let err = LoaderError::ListDue(StorageError::ConnectionFailed("refused".to_string()));
        assert!(err.to_string().contains("refused"));
    }
}
