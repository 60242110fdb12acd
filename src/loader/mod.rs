//! Sweep that turns due agendamentos into queued jobs.
//!
//! `AgendamentoLoader::load_due` pages through the `pending` agendamentos whose
//! due time has arrived, claims each with a compare-and-set `pending -> queued` and
//! enqueues one job per claimed record. Per-item failures are recorded in the
//! returned `LoadReport` and never abort the sweep.
//!
//! Re-running a sweep is safe: a record that is no longer `pending` cannot be
//! claimed again, and the queue keeps at most one live job per agendamento.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::agendamento::{Agendamento, AgendamentoStatus};
use crate::error::LoaderError;
use crate::metrics::MetricsCollector;
use crate::scheduler::{Job, JobQueue, PublishTask, DEFAULT_MAX_RETRIES};
use crate::storage::{AgendamentoStore, DueCursor};

/// Default number of agendamentos listed per page of a sweep.
pub const DEFAULT_BATCH_SIZE: usize = 100;

/// Step of the sweep at which an item failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadStage {
    /// Moving the record from `pending` to `queued`.
    Claim,
    /// Handing the job to the queue.
    Enqueue,
    /// Returning a claimed record to `pending` after a failed enqueue.
    Release,
}

impl std::fmt::Display for LoadStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            LoadStage::Claim => "claim",
            LoadStage::Enqueue => "enqueue",
            LoadStage::Release => "release",
        };
        f.write_str(name)
    }
}

/// Failure of a single agendamento during a sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ItemError {
    pub agendamento_id: Uuid,
    pub stage: LoadStage,
    pub message: String,
}

/// Result of one sweep.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadReport {
    /// Due agendamentos returned by the listing.
    pub examined: usize,
    /// Agendamentos claimed and enqueued.
    pub enqueued: usize,
    /// Agendamentos another actor claimed first.
    pub skipped: usize,
    /// Per-item failures.
    pub errors: Vec<ItemError>,
    /// Agendamentos enqueued by this sweep, in their `queued` state.
    pub loaded: Vec<Agendamento>,
    /// Human readable run log.
    pub logs: Vec<String>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl LoadReport {
    fn new(started_at: DateTime<Utc>) -> Self {
        Self {
            examined: 0,
            enqueued: 0,
            skipped: 0,
            errors: Vec::new(),
            loaded: Vec::new(),
            logs: Vec::new(),
            started_at,
            finished_at: started_at,
        }
    }

    /// Returns whether any item failed.
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    fn log(&mut self, line: impl Into<String>) {
        self.logs.push(line.into());
    }

    fn record_error(&mut self, agendamento_id: Uuid, stage: LoadStage, message: String) {
        warn!(
            agendamento_id = %agendamento_id,
            stage = %stage,
            error = %message,
            "Failed to load agendamento"
        );
        self.log(format!(
            "Agendamento {} failed at {}: {}",
            agendamento_id, stage, message
        ));
        self.errors.push(ItemError {
            agendamento_id,
            stage,
            message,
        });
    }
}

/// Loads due agendamentos into the job queue.
pub struct AgendamentoLoader {
    store: Arc<dyn AgendamentoStore>,
    queue: Arc<JobQueue>,
    batch_size: usize,
    max_retries: u32,
    metrics: MetricsCollector,
}

impl AgendamentoLoader {
    pub fn new(store: Arc<dyn AgendamentoStore>, queue: Arc<JobQueue>) -> Self {
        Self {
            store,
            queue,
            batch_size: DEFAULT_BATCH_SIZE,
            max_retries: DEFAULT_MAX_RETRIES,
            metrics: MetricsCollector::new(),
        }
    }

    /// Sets the number of agendamentos listed per page.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    /// Sets the attempts allowed for the jobs this loader creates.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Runs one sweep at the current time.
    pub async fn load_due(&self) -> Result<LoadReport, LoaderError> {
        self.load_due_at(Utc::now()).await
    }

    /// Runs one sweep treating `now` as the current time.
    ///
    /// Due records are listed in pages of `batch_size` ordered by
    /// `(due_at, id)`. Each page starts after the last record of the previous
    /// one, so a record released back to `pending` during the sweep is not
    /// listed again and cannot keep later records from being reached. The
    /// sweep ends at the first short page.
    ///
    /// # Errors
    ///
    /// Returns `LoaderError::ListDue` only when a due listing fails. Item
    /// failures are reported in `LoadReport::errors`.
    pub async fn load_due_at(&self, now: DateTime<Utc>) -> Result<LoadReport, LoaderError> {
        let mut report = LoadReport::new(Utc::now());
        let mut cursor: Option<DueCursor> = None;

        loop {
            let page = match self.store.list_due_after(now, cursor, self.batch_size).await {
                Ok(page) => page,
                Err(e) => {
                    self.metrics.record_sweep(
                        false,
                        report.enqueued,
                        report.skipped,
                        report.errors.len(),
                    );
                    return Err(LoaderError::ListDue(e));
                }
            };

            info!(
                queue = %self.queue.queue_name(),
                due = page.len(),
                batch_size = self.batch_size,
                "Loading due agendamentos"
            );
            report.log(format!("Found {} due agendamento(s)", page.len()));

            let exhausted = page.len() < self.batch_size;
            if let Some(last) = page.last() {
                cursor = Some(DueCursor::after(last));
            }

            for agendamento in page {
                report.examined += 1;
                self.load_one(agendamento.id, &mut report).await;
            }

            if exhausted {
                break;
            }
        }

        report.finished_at = Utc::now();
        report.log(format!(
            "Sweep finished: {} examined, {} enqueued, {} skipped, {} error(s)",
            report.examined,
            report.enqueued,
            report.skipped,
            report.errors.len()
        ));

        self.metrics.record_sweep(
            true,
            report.enqueued,
            report.skipped,
            report.errors.len(),
        );

        info!(
            examined = report.examined,
            enqueued = report.enqueued,
            skipped = report.skipped,
            errors = report.errors.len(),
            "Sweep finished"
        );

        Ok(report)
    }

    async fn load_one(&self, id: Uuid, report: &mut LoadReport) {
        let claimed = match self
            .store
            .transition(id, &[AgendamentoStatus::Pending], AgendamentoStatus::Queued)
            .await
        {
            Ok(Some(claimed)) => claimed,
            Ok(None) => {
                debug!(agendamento_id = %id, "Agendamento already claimed");
                report.skipped += 1;
                report.log(format!("Agendamento {} already claimed, skipped", id));
                return;
            }
            Err(e) => {
                report.record_error(id, LoadStage::Claim, e.to_string());
                return;
            }
        };

        let job = Job::new(PublishTask::from_agendamento(&claimed)).with_max_retries(self.max_retries);

        match self.queue.enqueue(job).await {
            Ok(job_id) => {
                debug!(agendamento_id = %id, job_id = %job_id, "Agendamento enqueued");
                report.enqueued += 1;
                report.log(format!("Agendamento {} enqueued as job {}", id, job_id));
                report.loaded.push(claimed);
            }
            Err(e) => {
                report.record_error(id, LoadStage::Enqueue, e.to_string());

                // Give the record back so the next sweep can claim it.
                if let Err(release_error) = self
                    .store
                    .transition(id, &[AgendamentoStatus::Queued], AgendamentoStatus::Pending)
                    .await
                {
                    report.record_error(id, LoadStage::Release, release_error.to_string());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agendamento::{Platform, PostPayload};
    use crate::error::StorageError;
    use crate::scheduler::queue::{DeadLetter, QueueError, QueueStats};
    use crate::scheduler::QueueBackend;
    use crate::storage::MemoryAgendamentoStore;
    use async_trait::async_trait;
    use chrono::Duration;

    /// Queue backend whose store is unreachable.
    struct DownBackend;

    fn down() -> QueueError {
        QueueError::ConnectionFailed("connection refused".to_string())
    }

    #[async_trait]
    impl QueueBackend for DownBackend {
        async fn push(&self, _queue: &str, _job: &Job) -> Result<Uuid, QueueError> {
            Err(down())
        }

        async fn lease(
            &self,
            _queue: &str,
            _now: DateTime<Utc>,
            _lease_duration: std::time::Duration,
        ) -> Result<Option<Job>, QueueError> {
            Err(down())
        }

        async fn ack(&self, _queue: &str, _job: &Job, _token: Uuid) -> Result<bool, QueueError> {
            Err(down())
        }

        async fn reschedule(
            &self,
            _queue: &str,
            _job: &Job,
            _token: Uuid,
        ) -> Result<bool, QueueError> {
            Err(down())
        }

        async fn bury(
            &self,
            _queue: &str,
            _entry: &DeadLetter,
            _token: Uuid,
        ) -> Result<bool, QueueError> {
            Err(down())
        }

        async fn reclaim_expired(
            &self,
            _queue: &str,
            _now: DateTime<Utc>,
        ) -> Result<usize, QueueError> {
            Err(down())
        }

        async fn stats(&self, _queue: &str, _now: DateTime<Utc>) -> Result<QueueStats, QueueError> {
            Err(down())
        }

        async fn dead_letters(
            &self,
            _queue: &str,
            _limit: usize,
        ) -> Result<Vec<DeadLetter>, QueueError> {
            Err(down())
        }

        async fn clear(&self, _queue: &str) -> Result<(), QueueError> {
            Err(down())
        }
    }

    /// Store whose listing always fails.
    struct BrokenStore;

    #[async_trait]
    impl AgendamentoStore for BrokenStore {
        async fn insert(&self, _agendamento: &Agendamento) -> Result<(), StorageError> {
            Err(StorageError::ConnectionFailed("down".to_string()))
        }

        async fn get(&self, _id: Uuid) -> Result<Option<Agendamento>, StorageError> {
            Err(StorageError::ConnectionFailed("down".to_string()))
        }

        async fn list_due_after(
            &self,
            _now: DateTime<Utc>,
            _after: Option<DueCursor>,
            _limit: usize,
        ) -> Result<Vec<Agendamento>, StorageError> {
            Err(StorageError::ConnectionFailed("down".to_string()))
        }

        async fn transition(
            &self,
            _id: Uuid,
            _from: &[AgendamentoStatus],
            _to: AgendamentoStatus,
        ) -> Result<Option<Agendamento>, StorageError> {
            Err(StorageError::ConnectionFailed("down".to_string()))
        }

        async fn begin_publishing(&self, _id: Uuid) -> Result<Option<Agendamento>, StorageError> {
            Err(StorageError::ConnectionFailed("down".to_string()))
        }

        async fn mark_published(
            &self,
            _id: Uuid,
            _external_post_id: &str,
        ) -> Result<Agendamento, StorageError> {
            Err(StorageError::ConnectionFailed("down".to_string()))
        }

        async fn mark_failed(&self, _id: Uuid, _error: &str) -> Result<Agendamento, StorageError> {
            Err(StorageError::ConnectionFailed("down".to_string()))
        }

        async fn count_by_status(&self) -> Result<Vec<(AgendamentoStatus, u64)>, StorageError> {
            Err(StorageError::ConnectionFailed("down".to_string()))
        }
    }

    fn due(offset_secs: i64) -> Agendamento {
        Agendamento::new(
            Utc::now() + Duration::seconds(offset_secs),
            Platform::Instagram,
            PostPayload::new("caption"),
        )
    }

    #[tokio::test]
    async fn test_load_due_enqueues_pending_records() {
        let ready = due(-1);
        let future = due(3600);
        let store = Arc::new(MemoryAgendamentoStore::with_records([
            ready.clone(),
            future.clone(),
        ]));
        let queue = Arc::new(JobQueue::in_memory("loader_enqueue"));
        let loader = AgendamentoLoader::new(store.clone(), queue.clone()).with_max_retries(5);

        let report = loader.load_due().await.expect("sweep");

        assert_eq!(report.examined, 1);
        assert_eq!(report.enqueued, 1);
        assert!(!report.has_errors());
        assert_eq!(report.loaded[0].id, ready.id);
        assert_eq!(report.loaded[0].status, AgendamentoStatus::Queued);
        assert!(report.logs.iter().any(|l| l.contains("enqueued as job")));

        let job = queue
            .lease(std::time::Duration::from_secs(60))
            .await
            .expect("lease")
            .expect("job");
        assert_eq!(job.agendamento_id(), ready.id);
        assert_eq!(job.max_retries, 5);

        let untouched = store.get(future.id).await.expect("get").expect("record");
        assert_eq!(untouched.status, AgendamentoStatus::Pending);
    }

    #[tokio::test]
    async fn test_second_sweep_does_not_enqueue_again() {
        let store = Arc::new(MemoryAgendamentoStore::with_records([due(-5), due(-1)]));
        let queue = Arc::new(JobQueue::in_memory("loader_idempotent"));
        let loader = AgendamentoLoader::new(store, queue.clone());

        let first = loader.load_due().await.expect("first sweep");
        let second = loader.load_due().await.expect("second sweep");

        assert_eq!(first.enqueued, 2);
        assert_eq!(second.examined, 0);
        assert_eq!(second.enqueued, 0);
        assert_eq!(queue.stats().await.expect("stats").ready_jobs, 2);
    }

    #[tokio::test]
    async fn test_sweep_pages_past_batch_size() {
        let records: Vec<Agendamento> = (0..5).map(|i| due(-10 - i)).collect();
        let store = Arc::new(MemoryAgendamentoStore::with_records(records));
        let queue = Arc::new(JobQueue::in_memory("loader_batch"));
        let loader = AgendamentoLoader::new(store, queue.clone()).with_batch_size(2);

        let report = loader.load_due().await.expect("sweep");

        assert_eq!(report.examined, 5);
        assert_eq!(report.enqueued, 5);
        assert_eq!(
            report.logs.iter().filter(|l| l.starts_with("Found")).count(),
            3
        );
        assert_eq!(queue.stats().await.expect("stats").ready_jobs, 5);
        assert_eq!(loader.load_due().await.expect("sweep").examined, 0);
    }

    #[tokio::test]
    async fn test_full_default_batch_does_not_end_sweep() {
        let records: Vec<Agendamento> = (0..150).map(|_| due(-60)).collect();
        let store = Arc::new(MemoryAgendamentoStore::with_records(records));
        let queue = Arc::new(JobQueue::in_memory("loader_many"));
        let loader = AgendamentoLoader::new(store.clone(), queue.clone());

        let report = loader.load_due().await.expect("sweep");

        assert_eq!(report.enqueued, 150);
        assert_eq!(queue.stats().await.expect("stats").ready_jobs, 150);
        let counts = store.count_by_status().await.expect("counts");
        assert!(counts.contains(&(AgendamentoStatus::Pending, 0)));
    }

    #[tokio::test]
    async fn test_released_records_do_not_starve_later_ones() {
        let records: Vec<Agendamento> = (0..5).map(|i| due(-10 - i)).collect();
        let store = Arc::new(MemoryAgendamentoStore::with_records(records));
        let queue = Arc::new(JobQueue::new("loader_starve", Arc::new(DownBackend)));
        let loader = AgendamentoLoader::new(store.clone(), queue).with_batch_size(2);

        let report = loader.load_due().await.expect("sweep");

        // Every record is tried exactly once even though each is released.
        assert_eq!(report.examined, 5);
        assert_eq!(report.errors.len(), 5);
        let mut tried: Vec<Uuid> = report.errors.iter().map(|e| e.agendamento_id).collect();
        tried.sort();
        tried.dedup();
        assert_eq!(tried.len(), 5);
        let counts = store.count_by_status().await.expect("counts");
        assert!(counts.contains(&(AgendamentoStatus::Pending, 5)));
    }

    #[tokio::test]
    async fn test_enqueue_failure_releases_claim() {
        let agendamento = due(-1);
        let store = Arc::new(MemoryAgendamentoStore::with_records([agendamento.clone()]));
        let queue = Arc::new(JobQueue::new("loader_down", Arc::new(DownBackend)));
        let loader = AgendamentoLoader::new(store.clone(), queue);

        let report = loader.load_due().await.expect("sweep still succeeds");

        assert_eq!(report.examined, 1);
        assert_eq!(report.enqueued, 0);
        assert_eq!(report.errors.len(), 1);
        assert_eq!(report.errors[0].stage, LoadStage::Enqueue);
        assert!(report.errors[0].message.contains("connection refused"));

        let record = store.get(agendamento.id).await.expect("get").expect("record");
        assert_eq!(record.status, AgendamentoStatus::Pending);
    }

    #[tokio::test]
    async fn test_listing_failure_aborts_sweep() {
        let queue = Arc::new(JobQueue::in_memory("loader_broken"));
        let loader = AgendamentoLoader::new(Arc::new(BrokenStore), queue);

        let err = loader.load_due().await.expect_err("listing fails");
        assert!(matches!(err, LoaderError::ListDue(StorageError::ConnectionFailed(_))));
    }

    #[test]
    fn test_report_serializes_stage_names() {
        let error = ItemError {
            agendamento_id: Uuid::nil(),
            stage: LoadStage::Enqueue,
            message: "boom".to_string(),
        };
        let json = serde_json::to_value(&error).expect("serialize");
        assert_eq!(json["stage"], "enqueue");
    }
}
