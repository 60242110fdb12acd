//! Entry point invoked by a timer or an operator to run one loader sweep.
//!
//! The response is the JSON document the caller receives:
//!
//! ```json
//! {"success": true, "logs": ["Found 1 due agendamento(s)", "..."]}
//! {"success": false, "logs": [], "error": "Failed to list due agendamentos: ..."}
//! ```

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

use crate::loader::{AgendamentoLoader, LoadReport};

/// Result of a trigger invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerResponse {
    pub success: bool,
    pub logs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TriggerResponse {
    fn from_report(report: LoadReport) -> Self {
        Self {
            success: true,
            logs: report.logs,
            error: None,
        }
    }

    fn failure(message: String) -> Self {
        Self {
            success: false,
            logs: Vec::new(),
            error: Some(message),
        }
    }
}

/// Runs a loader sweep and reports its log.
#[derive(Clone)]
pub struct TriggerEndpoint {
    loader: Arc<AgendamentoLoader>,
}

impl TriggerEndpoint {
    pub fn new(loader: Arc<AgendamentoLoader>) -> Self {
        Self { loader }
    }

    /// Runs one sweep.
    ///
    /// Individual agendamento failures only show up in `logs`; the response
    /// is a failure only when the sweep itself could not run.
    pub async fn invoke(&self) -> TriggerResponse {
        match self.loader.load_due().await {
            Ok(report) => {
                info!(
                    enqueued = report.enqueued,
                    errors = report.errors.len(),
                    "Trigger completed"
                );
                TriggerResponse::from_report(report)
            }
            Err(e) => {
                error!(error = %e, "Trigger failed");
                TriggerResponse::failure(e.to_string())
            }
        }
    }

    /// Runs a sweep every `period` until `shutdown` fires.
    ///
    /// The shutdown signal is only observed between sweeps: a sweep that has
    /// started always runs to completion, so no record is left `queued`
    /// without its job.
    pub async fn run_every(self, period: Duration, mut shutdown: broadcast::Receiver<()>) {
        let mut interval = tokio::time::interval(period);
        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                _ = interval.tick() => {}
            }

            let response = self.invoke().await;
            if !response.success {
                warn!(error = ?response.error, "Scheduled sweep failed");
            }
        }
        debug!("Periodic trigger stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agendamento::{Agendamento, AgendamentoStatus, Platform, PostPayload};
    use crate::error::StorageError;
    use crate::scheduler::JobQueue;
    use crate::storage::{AgendamentoStore, DueCursor, MemoryAgendamentoStore};
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use uuid::Uuid;

    /// Memory store whose status changes take `delay` to return.
    struct SlowStore {
        inner: MemoryAgendamentoStore,
        delay: Duration,
    }

    #[async_trait]
    impl AgendamentoStore for SlowStore {
        async fn insert(&self, agendamento: &Agendamento) -> Result<(), StorageError> {
            self.inner.insert(agendamento).await
        }

        async fn get(&self, id: Uuid) -> Result<Option<Agendamento>, StorageError> {
            self.inner.get(id).await
        }

        async fn list_due_after(
            &self,
            now: DateTime<Utc>,
            after: Option<DueCursor>,
            limit: usize,
        ) -> Result<Vec<Agendamento>, StorageError> {
            self.inner.list_due_after(now, after, limit).await
        }

        async fn transition(
            &self,
            id: Uuid,
            from: &[AgendamentoStatus],
            to: AgendamentoStatus,
        ) -> Result<Option<Agendamento>, StorageError> {
            let result = self.inner.transition(id, from, to).await;
            tokio::time::sleep(self.delay).await;
            result
        }

        async fn begin_publishing(&self, id: Uuid) -> Result<Option<Agendamento>, StorageError> {
            self.inner.begin_publishing(id).await
        }

        async fn mark_published(
            &self,
            id: Uuid,
            external_post_id: &str,
        ) -> Result<Agendamento, StorageError> {
            self.inner.mark_published(id, external_post_id).await
        }

        async fn mark_failed(&self, id: Uuid, error: &str) -> Result<Agendamento, StorageError> {
            self.inner.mark_failed(id, error).await
        }

        async fn count_by_status(&self) -> Result<Vec<(AgendamentoStatus, u64)>, StorageError> {
            self.inner.count_by_status().await
        }
    }

    fn due_now() -> Agendamento {
        Agendamento::new(
            Utc::now() - chrono::Duration::seconds(1),
            Platform::Instagram,
            PostPayload::new("hello"),
        )
    }

    #[tokio::test]
    async fn test_invoke_reports_logs() {
        let agendamento = due_now();
        let store = Arc::new(MemoryAgendamentoStore::with_records([agendamento.clone()]));
        let queue = Arc::new(JobQueue::in_memory("trigger_test"));
        let endpoint = TriggerEndpoint::new(Arc::new(AgendamentoLoader::new(store.clone(), queue)));

        let response = endpoint.invoke().await;

        assert!(response.success);
        assert!(response.error.is_none());
        assert!(response
            .logs
            .iter()
            .any(|line| line.contains(&agendamento.id.to_string())));

        let record = store.get(agendamento.id).await.expect("get").expect("record");
        assert_eq!(record.status, AgendamentoStatus::Queued);
    }

    #[tokio::test]
    async fn test_invoke_with_nothing_due() {
        let store = Arc::new(MemoryAgendamentoStore::new());
        let queue = Arc::new(JobQueue::in_memory("trigger_empty"));
        let endpoint = TriggerEndpoint::new(Arc::new(AgendamentoLoader::new(store, queue)));

        let response = endpoint.invoke().await;
        assert!(response.success);
        assert_eq!(response.logs[0], "Found 0 due agendamento(s)");
    }

    #[tokio::test]
    async fn test_run_every_finishes_sweep_before_stopping() {
        let records = [due_now(), due_now()];
        let store = Arc::new(SlowStore {
            inner: MemoryAgendamentoStore::with_records(records.clone()),
            delay: Duration::from_millis(100),
        });
        let queue = Arc::new(JobQueue::in_memory("trigger_periodic"));
        let endpoint =
            TriggerEndpoint::new(Arc::new(AgendamentoLoader::new(store.clone(), queue.clone())));

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(endpoint.run_every(Duration::from_secs(3600), shutdown_rx));

        // The first tick fires at once; stop while the sweep is mid-claim.
        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(()).expect("send shutdown");
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("trigger stops")
            .expect("task");

        for record in &records {
            let current = store.get(record.id).await.expect("get").expect("record");
            assert_eq!(current.status, AgendamentoStatus::Queued);
        }
        assert_eq!(queue.stats().await.expect("stats").ready_jobs, 2);
    }

    #[tokio::test]
    async fn test_run_every_stops_while_idle() {
        let store = Arc::new(MemoryAgendamentoStore::new());
        let queue = Arc::new(JobQueue::in_memory("trigger_idle"));
        let endpoint = TriggerEndpoint::new(Arc::new(AgendamentoLoader::new(store, queue)));

        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let handle = tokio::spawn(endpoint.run_every(Duration::from_secs(3600), shutdown_rx));

        tokio::time::sleep(Duration::from_millis(50)).await;
        shutdown_tx.send(()).expect("send shutdown");
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("trigger stops")
            .expect("task");
    }

    #[test]
    fn test_response_json_shape() {
        let ok = serde_json::to_value(TriggerResponse {
            success: true,
            logs: vec!["line".to_string()],
            error: None,
        })
        .expect("serialize");
        assert_eq!(ok, serde_json::json!({"success": true, "logs": ["line"]}));

        let failed = serde_json::to_value(TriggerResponse::failure("down".to_string()))
            .expect("serialize");
        assert_eq!(failed["success"], false);
        assert_eq!(failed["error"], "down");
    }
}
