//! In-process agendamento store.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;
use uuid::Uuid;

use super::{check_transition, AgendamentoStore, DueCursor, StorageError, PUBLISHABLE_STATUSES};
use crate::agendamento::{Agendamento, AgendamentoStatus};

/// Agendamento store kept in process memory.
///
/// A single mutex guards all records, so each compare-and-set is atomic.
#[derive(Debug, Default)]
pub struct MemoryAgendamentoStore {
    records: Mutex<HashMap<Uuid, Agendamento>>,
}

impl MemoryAgendamentoStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a store pre-filled with `records`.
    pub fn with_records(records: impl IntoIterator<Item = Agendamento>) -> Self {
        Self {
            records: Mutex::new(records.into_iter().map(|a| (a.id, a)).collect()),
        }
    }

    /// Returns a snapshot of every record.
    pub async fn all(&self) -> Vec<Agendamento> {
        self.records.lock().await.values().cloned().collect()
    }

    /// Applies `update` to a `publishing` record.
    async fn finish_attempt(
        &self,
        id: Uuid,
        to: AgendamentoStatus,
        update: impl FnOnce(&mut Agendamento),
    ) -> Result<Agendamento, StorageError> {
        let mut records = self.records.lock().await;
        let record = records.get_mut(&id).ok_or(StorageError::NotFound(id))?;

        if record.status != AgendamentoStatus::Publishing {
            return Err(StorageError::InvalidTransition {
                id,
                from: record.status,
                to,
            });
        }

        record.status = to;
        record.updated_at = Utc::now();
        update(record);
        Ok(record.clone())
    }
}

#[async_trait]
impl AgendamentoStore for MemoryAgendamentoStore {
    async fn insert(&self, agendamento: &Agendamento) -> Result<(), StorageError> {
        let mut records = self.records.lock().await;
        if records.contains_key(&agendamento.id) {
            return Err(StorageError::Duplicate(agendamento.id));
        }
        records.insert(agendamento.id, agendamento.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<Agendamento>, StorageError> {
        Ok(self.records.lock().await.get(&id).cloned())
    }

    async fn list_due_after(
        &self,
        now: DateTime<Utc>,
        after: Option<DueCursor>,
        limit: usize,
    ) -> Result<Vec<Agendamento>, StorageError> {
        let records = self.records.lock().await;
        let mut due: Vec<Agendamento> = records
            .values()
            .filter(|a| a.status == AgendamentoStatus::Pending && a.is_due(now))
            .filter(|a| after.map_or(true, |cursor| DueCursor::after(a) > cursor))
            .cloned()
            .collect();

        due.sort_by_key(DueCursor::after);
        due.truncate(limit);
        Ok(due)
    }

    async fn transition(
        &self,
        id: Uuid,
        from: &[AgendamentoStatus],
        to: AgendamentoStatus,
    ) -> Result<Option<Agendamento>, StorageError> {
        check_transition(id, from, to)?;

        let mut records = self.records.lock().await;
        let record = records.get_mut(&id).ok_or(StorageError::NotFound(id))?;

        if !from.contains(&record.status) {
            return Ok(None);
        }

        record.status = to;
        record.updated_at = Utc::now();
        Ok(Some(record.clone()))
    }

    async fn begin_publishing(&self, id: Uuid) -> Result<Option<Agendamento>, StorageError> {
        let mut records = self.records.lock().await;
        let record = records.get_mut(&id).ok_or(StorageError::NotFound(id))?;

        if !PUBLISHABLE_STATUSES.contains(&record.status) {
            return Ok(None);
        }

        record.status = AgendamentoStatus::Publishing;
        record.attempt_count += 1;
        record.updated_at = Utc::now();
        Ok(Some(record.clone()))
    }

    async fn mark_published(
        &self,
        id: Uuid,
        external_post_id: &str,
    ) -> Result<Agendamento, StorageError> {
        self.finish_attempt(id, AgendamentoStatus::Published, |record| {
            record.external_post_id = Some(external_post_id.to_string());
            record.published_at = Some(record.updated_at);
            record.last_error = None;
        })
        .await
    }

    async fn mark_failed(&self, id: Uuid, error: &str) -> Result<Agendamento, StorageError> {
        self.finish_attempt(id, AgendamentoStatus::Failed, |record| {
            record.last_error = Some(error.to_string());
        })
        .await
    }

    async fn count_by_status(&self) -> Result<Vec<(AgendamentoStatus, u64)>, StorageError> {
        let records = self.records.lock().await;
        Ok(AgendamentoStatus::ALL
            .iter()
            .map(|status| {
                let count = records.values().filter(|a| a.status == *status).count();
                (*status, count as u64)
            })
            .collect())
    }
}
