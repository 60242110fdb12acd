//! Durable job queue with leases, retry and dead letters.
//!
//! `JobQueue` is a named queue client. It owns no state of its own: every
//! mutation is delegated to a [`QueueBackend`] primitive that is atomic on the
//! backing store, which makes the backend the single source of mutual
//! exclusion between workers.
//!
//! # Job lifecycle
//!
//! ```text
//! enqueue ──► ready ──lease──► leased ──acknowledge──► (removed)
//!               ▲                │
//!               │   retry        ├──retry (exhausted)──► dead letter
//!               └────────────────┤
//!               ▲                │
//!               └──lease expiry──┘
//! ```
//!
//! # Reliability
//!
//! A leased job carries a lease token. Only the holder of the current token
//! can acknowledge or retry it; once the lease expires the next `lease` call
//! returns the job to the ready set and the stale token stops working.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use super::backend::{MemoryBackend, QueueBackend, RedisBackend};
use super::job::Job;
use crate::config::ConnectionConfig;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// The backing store is unreachable.
    #[error("Queue store connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis rejected an operation.
    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    /// Failed to serialize or deserialize job data.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// The job does not exist or the caller no longer holds its lease.
    #[error("Job {0} not found or lease no longer held")]
    JobNotFound(Uuid),

    /// The job failed its last allowed attempt and was dead-lettered.
    #[error("Job {job_id} exhausted its retries after {retry_count} attempts")]
    RetriesExhausted { job_id: Uuid, retry_count: u32 },
}

impl QueueError {
    /// Returns whether the error means the store could not be reached.
    pub fn is_connection_error(&self) -> bool {
        match self {
            QueueError::ConnectionFailed(_) => true,
            QueueError::RedisError(e) => {
                e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped()
            }
            _ => false,
        }
    }
}

/// A job moved out of the active set after its last failed attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub job: Job,
    pub error: String,
    pub moved_at: DateTime<Utc>,
}

/// Statistics about queue state.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    /// Name of the queue.
    pub queue_name: String,
    /// Jobs eligible for lease now.
    pub ready_jobs: usize,
    /// Jobs waiting for their backoff to elapse.
    pub delayed_jobs: usize,
    /// Jobs currently leased by a worker.
    pub leased_jobs: usize,
    /// Jobs in the dead letter set.
    pub dead_letter_jobs: usize,
}

impl QueueStats {
    /// Returns the number of jobs that are still live.
    pub fn live_jobs(&self) -> usize {
        self.ready_jobs + self.delayed_jobs + self.leased_jobs
    }

    /// Returns the total number of jobs in all sets.
    pub fn total_jobs(&self) -> usize {
        self.live_jobs() + self.dead_letter_jobs
    }
}

/// Named job queue client.
#[derive(Clone)]
pub struct JobQueue {
    backend: Arc<dyn QueueBackend>,
    queue_name: String,
}

impl std::fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobQueue")
            .field("queue_name", &self.queue_name)
            .finish_non_exhaustive()
    }
}

impl JobQueue {
    /// Creates a queue client over an existing backend.
    ///
    /// Useful when sharing a connection across multiple components.
    pub fn new(queue_name: impl Into<String>, backend: Arc<dyn QueueBackend>) -> Self {
        Self {
            backend,
            queue_name: queue_name.into(),
        }
    }

    /// Creates a queue backed by process memory.
    pub fn in_memory(queue_name: impl Into<String>) -> Self {
        Self::new(queue_name, Arc::new(MemoryBackend::new()))
    }

    /// Connects to Redis and creates a new job queue.
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub async fn connect(
        config: &ConnectionConfig,
        queue_name: impl Into<String>,
    ) -> Result<Self, QueueError> {
        let backend = RedisBackend::connect(config).await?;
        Ok(Self::new(queue_name, Arc::new(backend)))
    }

    /// Returns the queue name.
    pub fn queue_name(&self) -> &str {
        &self.queue_name
    }

    /// Enqueues a job and returns its id.
    ///
    /// If a live job already exists for the same agendamento, that job's id
    /// is returned and nothing is added. The call is not retried internally.
    pub async fn enqueue(&self, job: Job) -> Result<Uuid, QueueError> {
        let job_id = self.backend.push(&self.queue_name, &job).await?;

        if job_id != job.id {
            debug!(
                queue = %self.queue_name,
                agendamento_id = %job.agendamento_id(),
                existing_job_id = %job_id,
                "Agendamento already has a live job"
            );
        }

        Ok(job_id)
    }

    /// Claims the next eligible job for `lease_duration`.
    ///
    /// Expired leases are reclaimed first. Returns `None` when no job is
    /// eligible.
    pub async fn lease(&self, lease_duration: Duration) -> Result<Option<Job>, QueueError> {
        self.backend
            .lease(&self.queue_name, Utc::now(), lease_duration)
            .await
    }

    /// Marks a leased job complete and removes it from the queue.
    ///
    /// # Errors
    ///
    /// `QueueError::JobNotFound` if the job is gone or its lease was
    /// reclaimed by another worker.
    pub async fn acknowledge(&self, job: &Job) -> Result<(), QueueError> {
        let token = job.lease_token.ok_or(QueueError::JobNotFound(job.id))?;

        if self.backend.ack(&self.queue_name, job, token).await? {
            Ok(())
        } else {
            Err(QueueError::JobNotFound(job.id))
        }
    }

    /// Re-queues a leased job after a failed attempt.
    ///
    /// The job becomes eligible no earlier than `now + backoff_delay` with its
    /// `retry_count` incremented. When the incremented count reaches
    /// `max_retries` the job is dead-lettered instead.
    ///
    /// # Errors
    ///
    /// - `QueueError::RetriesExhausted` after the job was dead-lettered.
    /// - `QueueError::JobNotFound` if the lease is no longer held.
    pub async fn retry(
        &self,
        job: &Job,
        backoff_delay: Duration,
        error: &str,
    ) -> Result<Job, QueueError> {
        let token = job.lease_token.ok_or(QueueError::JobNotFound(job.id))?;
        let now = Utc::now();
        let delay = chrono::Duration::from_std(backoff_delay)
            .unwrap_or_else(|_| chrono::Duration::days(365));
        let next = job.next_attempt(error, now + delay);

        if next.retry_count >= next.max_retries {
            let entry = DeadLetter {
                job: next.clone(),
                error: error.to_string(),
                moved_at: now,
            };

            if !self.backend.bury(&self.queue_name, &entry, token).await? {
                return Err(QueueError::JobNotFound(job.id));
            }

            warn!(
                queue = %self.queue_name,
                job_id = %job.id,
                agendamento_id = %job.agendamento_id(),
                retry_count = next.retry_count,
                "Job moved to dead letter queue"
            );

            return Err(QueueError::RetriesExhausted {
                job_id: job.id,
                retry_count: next.retry_count,
            });
        }

        if self.backend.reschedule(&self.queue_name, &next, token).await? {
            Ok(next)
        } else {
            Err(QueueError::JobNotFound(job.id))
        }
    }

    /// Returns jobs whose lease expired to the ready set.
    ///
    /// `lease` does this on every call; the explicit form is useful on worker
    /// startup and for monitoring.
    pub async fn reclaim_expired(&self) -> Result<usize, QueueError> {
        self.backend
            .reclaim_expired(&self.queue_name, Utc::now())
            .await
    }

    /// Returns queue statistics.
    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        self.backend.stats(&self.queue_name, Utc::now()).await
    }

    /// Peeks at the most recent dead letters without removing them.
    pub async fn peek_dead_letter(&self, limit: usize) -> Result<Vec<DeadLetter>, QueueError> {
        self.backend.dead_letters(&self.queue_name, limit).await
    }

    /// Clears every set of the queue, dead letters included.
    ///
    /// **Warning**: This permanently deletes all jobs. Use with caution.
    pub async fn clear(&self) -> Result<(), QueueError> {
        self.backend.clear(&self.queue_name).await
    }
}
