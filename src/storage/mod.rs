//! Agendamento persistence.
//!
//! The agendamento record is the system of record for a scheduled post. This
//! module defines the `AgendamentoStore` trait the loader and workers drive,
//! and two implementations:
//!
//! - **PgAgendamentoStore**: PostgreSQL client (sqlx) with idempotent migrations
//! - **MemoryAgendamentoStore**: in-process store for tests and local runs
//!
//! Every status change is a compare-and-set on the current status, so two
//! actors racing on the same record cannot both win.
//!
//! # Usage
//!
//! ```rust,ignore
//! use agendamento_publisher::storage::{AgendamentoStore, PgAgendamentoStore};
//!
//! let store = PgAgendamentoStore::connect("postgres://localhost/agendamentos").await?;
//! store.run_migrations().await?;
//!
//! let due = store.list_due(chrono::Utc::now(), 100).await?;
//! ```

pub mod database;
pub mod memory;
pub mod migrations;
pub mod schema;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::agendamento::{Agendamento, AgendamentoStatus};
pub use crate::error::StorageError;

// Re-export main types for convenience
pub use database::PgAgendamentoStore;
pub use memory::MemoryAgendamentoStore;
pub use migrations::{AppliedMigration, MigrationError, MigrationRunner};

/// Statuses a worker may start a publish attempt from.
///
/// `publishing` is included so a job recovered from a crashed worker can run
/// again.
pub const PUBLISHABLE_STATUSES: [AgendamentoStatus; 3] = [
    AgendamentoStatus::Queued,
    AgendamentoStatus::Failed,
    AgendamentoStatus::Publishing,
];

/// Position in the due listing: records are ordered by `(due_at, id)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct DueCursor {
    pub due_at: DateTime<Utc>,
    pub id: Uuid,
}

impl DueCursor {
    /// Cursor positioned right after `agendamento`.
    pub fn after(agendamento: &Agendamento) -> Self {
        Self {
            due_at: agendamento.due_at,
            id: agendamento.id,
        }
    }
}

/// Storage of agendamento records.
#[async_trait]
pub trait AgendamentoStore: Send + Sync {
    /// Stores a new agendamento.
    async fn insert(&self, agendamento: &Agendamento) -> Result<(), StorageError>;

    /// Fetches an agendamento by id.
    async fn get(&self, id: Uuid) -> Result<Option<Agendamento>, StorageError>;

    /// Lists `pending` agendamentos due at `now`, ordered by `(due_at, id)`,
    /// at most `limit`.
    ///
    /// With `after`, only records strictly past that cursor are returned, so a
    /// caller can page through every due record without seeing one twice.
    async fn list_due_after(
        &self,
        now: DateTime<Utc>,
        after: Option<DueCursor>,
        limit: usize,
    ) -> Result<Vec<Agendamento>, StorageError>;

    /// First page of `list_due_after`.
    async fn list_due(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<Agendamento>, StorageError> {
        self.list_due_after(now, None, limit).await
    }

    /// Moves the agendamento to `to` if its status is one of `from`.
    ///
    /// Returns the updated record, or `None` when the current status is not in
    /// `from`. Fails with `InvalidTransition` if an edge `from -> to` is not in
    /// the lifecycle, and with `NotFound` if the record does not exist.
    async fn transition(
        &self,
        id: Uuid,
        from: &[AgendamentoStatus],
        to: AgendamentoStatus,
    ) -> Result<Option<Agendamento>, StorageError>;

    /// Starts a publish attempt: moves the record to `publishing` from one of
    /// `PUBLISHABLE_STATUSES` and increments `attempt_count`.
    ///
    /// Returns `None` when the record is in another status.
    async fn begin_publishing(&self, id: Uuid) -> Result<Option<Agendamento>, StorageError>;

    /// Records a successful publish. The record must be `publishing`.
    async fn mark_published(
        &self,
        id: Uuid,
        external_post_id: &str,
    ) -> Result<Agendamento, StorageError>;

    /// Records a failed attempt. The record must be `publishing`.
    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<Agendamento, StorageError>;

    /// Counts records per status.
    async fn count_by_status(&self) -> Result<Vec<(AgendamentoStatus, u64)>, StorageError>;
}

/// Checks that every `from -> to` edge is part of the lifecycle.
pub(crate) fn check_transition(
    id: Uuid,
    from: &[AgendamentoStatus],
    to: AgendamentoStatus,
) -> Result<(), StorageError> {
    match from.iter().find(|status| !status.can_transition_to(to)) {
        Some(bad) => Err(StorageError::InvalidTransition {
            id,
            from: *bad,
            to,
        }),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_transition_rejects_unknown_edge() {
        let id = Uuid::new_v4();
        assert!(check_transition(id, &[AgendamentoStatus::Pending], AgendamentoStatus::Queued).is_ok());
        assert!(check_transition(id, &PUBLISHABLE_STATUSES, AgendamentoStatus::Publishing).is_ok());

        let err = check_transition(
            id,
            &[AgendamentoStatus::Pending, AgendamentoStatus::Published],
            AgendamentoStatus::Queued,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            StorageError::InvalidTransition {
                from: AgendamentoStatus::Published,
                ..
            }
        ));
    }
}
