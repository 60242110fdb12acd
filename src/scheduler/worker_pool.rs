//! Worker pool for publishing leased jobs.
//!
//! A `Processor` runs one job to completion: it moves the agendamento to
//! `publishing`, calls the platform publisher under a timeout, and then
//! acknowledges or retries the job. The `WorkerPool` runs N `Worker` tasks,
//! each a lease/process loop sharing one processor.
//!
//! # Features
//!
//! - Configurable number of workers
//! - Graceful shutdown with broadcast channel
//! - Exponential backoff retry, dead letter after the last attempt
//! - Crash recovery through lease expiry
//! - Pool statistics tracking

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use super::job::{Job, JobOutcome, RetryPolicy};
use super::queue::{JobQueue, QueueError};
use crate::agendamento::AgendamentoStatus;
use crate::config::WorkerSettings;
use crate::error::{PublishError, StorageError};
use crate::metrics::MetricsCollector;
use crate::publish::{PublishRequest, PublisherRegistry};
use crate::storage::AgendamentoStore;

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A queue operation failed.
    #[error("Queue error: {0}")]
    Queue(#[from] QueueError),

    /// The agendamento store failed.
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    /// Pool is already running.
    #[error("Pool is already running")]
    AlreadyRunning,

    /// Pool is not running.
    #[error("Pool is not running")]
    NotRunning,

    /// Shutdown timed out.
    #[error("Shutdown timed out after {0:?}")]
    ShutdownTimeout(Duration),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    /// Number of worker tasks to spawn.
    pub num_workers: usize,
    /// How long to wait before polling again when the queue is empty.
    pub poll_interval: Duration,
    /// How long a leased job stays invisible to other workers.
    pub lease_duration: Duration,
    /// Maximum time allowed for one platform publish call.
    pub publish_timeout: Duration,
    /// Timeout for graceful shutdown.
    pub shutdown_timeout: Duration,
    /// Backoff between attempts.
    pub retry_policy: RetryPolicy,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self::from_settings(&WorkerSettings::default())
    }
}

impl WorkerPoolConfig {
    /// Creates a new configuration with the specified number of workers.
    pub fn new(num_workers: usize) -> Self {
        Self {
            num_workers,
            ..Default::default()
        }
    }

    /// Builds the configuration from environment-derived settings.
    pub fn from_settings(settings: &WorkerSettings) -> Self {
        Self {
            num_workers: settings.concurrency,
            poll_interval: settings.poll_interval,
            lease_duration: settings.lease_duration,
            publish_timeout: settings.publish_timeout,
            shutdown_timeout: settings.shutdown_timeout,
            retry_policy: RetryPolicy::new(
                settings.retry_base_delay,
                settings.retry_max_delay,
                settings.max_retries,
            ),
        }
    }

    /// Sets the poll interval.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Sets the lease duration.
    pub fn with_lease_duration(mut self, duration: Duration) -> Self {
        self.lease_duration = duration;
        self
    }

    /// Sets the publish timeout.
    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    /// Sets the shutdown timeout.
    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Sets the retry policy.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = policy;
        self
    }
}

/// Runs leased jobs against the store and the platform publishers.
pub struct Processor {
    queue: Arc<JobQueue>,
    store: Arc<dyn AgendamentoStore>,
    publishers: PublisherRegistry,
    retry_policy: RetryPolicy,
    lease_duration: Duration,
    publish_timeout: Duration,
    metrics: MetricsCollector,
}

impl Processor {
    /// Creates a processor.
    pub fn new(
        queue: Arc<JobQueue>,
        store: Arc<dyn AgendamentoStore>,
        publishers: PublisherRegistry,
        config: &WorkerPoolConfig,
    ) -> Self {
        Self {
            queue,
            store,
            publishers,
            retry_policy: config.retry_policy,
            lease_duration: config.lease_duration,
            publish_timeout: config.publish_timeout,
            metrics: MetricsCollector::new(),
        }
    }

    /// Returns the job queue.
    pub fn queue(&self) -> &Arc<JobQueue> {
        &self.queue
    }

    /// Leases the next eligible job and runs it to completion.
    ///
    /// Returns `None` when no job is eligible.
    pub async fn process_next(&self) -> Result<Option<JobOutcome>, PoolError> {
        match self.queue.lease(self.lease_duration).await? {
            Some(job) => Ok(Some(self.process(job).await?)),
            None => Ok(None),
        }
    }

    /// Processes jobs until none is eligible and returns their outcomes.
    pub async fn drain(&self) -> Result<Vec<JobOutcome>, PoolError> {
        let mut outcomes = Vec::new();
        while let Some(outcome) = self.process_next().await? {
            outcomes.push(outcome);
        }
        Ok(outcomes)
    }

    /// Runs one leased job.
    ///
    /// On error the job keeps its lease and becomes eligible again once the
    /// lease expires.
    pub async fn process(&self, job: Job) -> Result<JobOutcome, PoolError> {
        let agendamento_id = job.agendamento_id();
        let platform = job.task.platform;

        // Another worker may already hold a lapsed lease; publishing now could post twice.
        if job.lease_expired(Utc::now()) {
            warn!(
                job_id = %job.id,
                agendamento_id = %agendamento_id,
                "Lease expired before the attempt started"
            );
            return Ok(JobOutcome::LeaseLost {
                job_id: job.id,
                agendamento_id,
            });
        }

        let agendamento = match self.store.begin_publishing(agendamento_id).await {
            Ok(Some(agendamento)) => agendamento,
            Ok(None) => return self.skip_stale(&job).await,
            Err(StorageError::NotFound(_)) => {
                return self.skip(&job, "agendamento no longer exists").await;
            }
            Err(e) => return Err(e.into()),
        };

        info!(
            job_id = %job.id,
            agendamento_id = %agendamento_id,
            attempt = agendamento.attempt_count,
            retry_count = job.retry_count,
            "Publishing agendamento"
        );

        let request = PublishRequest::from_task(&job.task, agendamento.attempt_count);
        let started = Instant::now();
        let result = match tokio::time::timeout(
            self.publish_timeout,
            self.publishers.publish(&request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(PublishError::Timeout(self.publish_timeout)),
        };
        self.metrics
            .record_publish_latency(platform.as_str(), started.elapsed());

        let outcome = match result {
            Ok(receipt) => {
                self.store
                    .mark_published(agendamento_id, &receipt.external_post_id)
                    .await?;

                match self.queue.acknowledge(&job).await {
                    Ok(()) => {}
                    Err(QueueError::JobNotFound(_)) => {
                        // The record is already published; whoever holds the
                        // job now will skip it.
                        warn!(
                            job_id = %job.id,
                            agendamento_id = %agendamento_id,
                            "Lease lost before acknowledging a published job"
                        );
                    }
                    Err(e) => return Err(e.into()),
                }

                JobOutcome::Published {
                    job_id: job.id,
                    agendamento_id,
                    external_post_id: receipt.external_post_id,
                }
            }
            Err(publish_error) => self.handle_failure(&job, publish_error).await?,
        };

        self.metrics.record_job(outcome.label(), platform.as_str());
        Ok(outcome)
    }

    async fn handle_failure(
        &self,
        job: &Job,
        publish_error: PublishError,
    ) -> Result<JobOutcome, PoolError> {
        let agendamento_id = job.agendamento_id();
        let message = publish_error.to_string();

        self.store.mark_failed(agendamento_id, &message).await?;

        let delay = self.retry_policy.delay_for(job.retry_count);
        match self.queue.retry(job, delay, &message).await {
            Ok(next) => {
                self.store
                    .transition(
                        agendamento_id,
                        &[AgendamentoStatus::Failed],
                        AgendamentoStatus::Queued,
                    )
                    .await?;

                warn!(
                    job_id = %job.id,
                    agendamento_id = %agendamento_id,
                    error = %message,
                    retry_count = next.retry_count,
                    remaining_attempts = next.remaining_attempts(),
                    delay_ms = delay.as_millis() as u64,
                    "Publish failed, job rescheduled"
                );

                Ok(JobOutcome::Retrying {
                    job_id: job.id,
                    agendamento_id,
                    retry_count: next.retry_count,
                    delay_ms: delay.as_millis() as u64,
                    error: message,
                })
            }
            Err(QueueError::RetriesExhausted { retry_count, .. }) => {
                error!(
                    job_id = %job.id,
                    agendamento_id = %agendamento_id,
                    error = %message,
                    retry_count = retry_count,
                    "Publish failed, retries exhausted"
                );

                Ok(JobOutcome::DeadLettered {
                    job_id: job.id,
                    agendamento_id,
                    error: message,
                })
            }
            Err(QueueError::JobNotFound(_)) => {
                warn!(
                    job_id = %job.id,
                    agendamento_id = %agendamento_id,
                    "Lease lost before the failure could be recorded"
                );

                Ok(JobOutcome::LeaseLost {
                    job_id: job.id,
                    agendamento_id,
                })
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Handles a job whose agendamento cannot start a publish attempt.
    async fn skip_stale(&self, job: &Job) -> Result<JobOutcome, PoolError> {
        let status = self
            .store
            .get(job.agendamento_id())
            .await?
            .map(|a| a.status);

        match status {
            Some(AgendamentoStatus::Published) => self.skip(job, "already published").await,
            Some(status) => {
                warn!(
                    job_id = %job.id,
                    agendamento_id = %job.agendamento_id(),
                    status = %status,
                    "Job does not match agendamento status, dropping it"
                );
                self.skip(job, &format!("agendamento is {}", status)).await
            }
            None => self.skip(job, "agendamento no longer exists").await,
        }
    }

    async fn skip(&self, job: &Job, reason: &str) -> Result<JobOutcome, PoolError> {
        match self.queue.acknowledge(job).await {
            Ok(()) => {
                debug!(job_id = %job.id, reason = reason, "Skipped job");
                let outcome = JobOutcome::Skipped {
                    job_id: job.id,
                    agendamento_id: job.agendamento_id(),
                    reason: reason.to_string(),
                };
                self.metrics
                    .record_job(outcome.label(), job.task.platform.as_str());
                Ok(outcome)
            }
            Err(QueueError::JobNotFound(_)) => Ok(JobOutcome::LeaseLost {
                job_id: job.id,
                agendamento_id: job.agendamento_id(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default)]
pub struct PoolStats {
    /// Total number of workers in the pool.
    pub num_workers: usize,
    /// Number of workers currently processing jobs.
    pub active_workers: usize,
    /// Jobs whose post went live.
    pub jobs_published: u64,
    /// Jobs whose attempt failed (rescheduled or dead-lettered).
    pub jobs_failed: u64,
    /// Jobs dropped without publishing.
    pub jobs_skipped: u64,
    /// Average job processing duration.
    pub average_job_duration: Duration,
}

impl PoolStats {
    /// Returns the total number of jobs processed.
    pub fn total_processed(&self) -> u64 {
        self.jobs_published + self.jobs_failed + self.jobs_skipped
    }

    /// Returns the share of publish attempts that succeeded, as a percentage.
    pub fn success_rate(&self) -> f64 {
        let attempts = self.jobs_published + self.jobs_failed;
        if attempts == 0 {
            return 0.0;
        }
        (self.jobs_published as f64 / attempts as f64) * 100.0
    }
}

/// Shared state for tracking pool statistics.
struct SharedPoolStats {
    jobs_published: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_skipped: AtomicU64,
    total_duration_ms: AtomicU64,
    active_workers: AtomicU64,
}

impl SharedPoolStats {
    fn new() -> Self {
        Self {
            jobs_published: AtomicU64::new(0),
            jobs_failed: AtomicU64::new(0),
            jobs_skipped: AtomicU64::new(0),
            total_duration_ms: AtomicU64::new(0),
            active_workers: AtomicU64::new(0),
        }
    }

    fn record(&self, outcome: &JobOutcome, duration: Duration) {
        let counter = match outcome {
            JobOutcome::Published { .. } => &self.jobs_published,
            JobOutcome::Retrying { .. } | JobOutcome::DeadLettered { .. } => &self.jobs_failed,
            JobOutcome::Skipped { .. } | JobOutcome::LeaseLost { .. } => &self.jobs_skipped,
        };
        counter.fetch_add(1, Ordering::SeqCst);
        self.total_duration_ms
            .fetch_add(duration.as_millis() as u64, Ordering::SeqCst);
    }

    fn increment_active(&self) {
        self.active_workers.fetch_add(1, Ordering::SeqCst);
    }

    fn decrement_active(&self) {
        self.active_workers.fetch_sub(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, num_workers: usize) -> PoolStats {
        let published = self.jobs_published.load(Ordering::SeqCst);
        let failed = self.jobs_failed.load(Ordering::SeqCst);
        let skipped = self.jobs_skipped.load(Ordering::SeqCst);
        let total_duration_ms = self.total_duration_ms.load(Ordering::SeqCst);
        let active = self.active_workers.load(Ordering::SeqCst);

        let total_jobs = published + failed + skipped;
        let average_duration = if total_jobs > 0 {
            Duration::from_millis(total_duration_ms / total_jobs)
        } else {
            Duration::ZERO
        };

        PoolStats {
            num_workers,
            active_workers: active as usize,
            jobs_published: published,
            jobs_failed: failed,
            jobs_skipped: skipped,
            average_job_duration: average_duration,
        }
    }
}

/// Worker pool that manages multiple workers processing jobs from a queue.
pub struct WorkerPool {
    config: WorkerPoolConfig,
    processor: Arc<Processor>,
    shutdown_tx: broadcast::Sender<()>,
    worker_handles: Vec<JoinHandle<()>>,
    stats: Arc<SharedPoolStats>,
    metrics: MetricsCollector,
    is_running: AtomicBool,
}

impl WorkerPool {
    /// Creates a new worker pool around a processor.
    pub fn new(config: WorkerPoolConfig, processor: Arc<Processor>) -> Self {
        // Buffer size of 1 is sufficient since we only send once
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            config,
            processor,
            shutdown_tx,
            worker_handles: Vec::new(),
            stats: Arc::new(SharedPoolStats::new()),
            metrics: MetricsCollector::new(),
            is_running: AtomicBool::new(false),
        }
    }

    /// Starts all workers in the pool.
    ///
    /// Jobs whose lease expired while no worker was running are returned to
    /// the ready set first.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::AlreadyRunning` if the pool is already running.
    pub async fn start(&mut self) -> Result<(), PoolError> {
        if self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::AlreadyRunning);
        }

        match self.processor.queue().reclaim_expired().await {
            Ok(recovered) => {
                if recovered > 0 {
                    self.metrics.record_reclaimed(recovered);
                    info!(recovered = recovered, "Recovered jobs with expired leases");
                }
            }
            Err(e) => {
                warn!(error = %e, "Failed to recover expired leases");
            }
        }

        for i in 0..self.config.num_workers {
            let worker = Worker::new(
                format!("worker-{}", i),
                Arc::clone(&self.processor),
                self.shutdown_tx.subscribe(),
                self.config.poll_interval,
                Arc::clone(&self.stats),
            );

            let handle = tokio::spawn(async move {
                worker.run().await;
            });

            self.worker_handles.push(handle);
        }

        self.is_running.store(true, Ordering::SeqCst);
        self.metrics.update_workers(self.config.num_workers);
        info!(num_workers = self.config.num_workers, "Worker pool started");

        Ok(())
    }

    /// Gracefully shuts down all workers.
    ///
    /// Workers finish their current job before stopping.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::ShutdownTimeout` if workers don't stop within
    /// the configured timeout.
    pub async fn shutdown(&mut self) -> Result<(), PoolError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Err(PoolError::NotRunning);
        }

        info!("Initiating worker pool shutdown");

        // Workers may have already stopped
        let _ = self.shutdown_tx.send(());

        let handles: Vec<_> = self.worker_handles.drain(..).collect();
        let shutdown_future = async {
            for result in futures::future::join_all(handles).await {
                if let Err(e) = result {
                    error!(error = %e, "Worker task panicked during shutdown");
                }
            }
        };

        let result = tokio::time::timeout(self.config.shutdown_timeout, shutdown_future).await;
        self.is_running.store(false, Ordering::SeqCst);
        self.metrics.update_workers(0);

        match result {
            Ok(()) => {
                info!("Worker pool shutdown complete");
                Ok(())
            }
            Err(_) => Err(PoolError::ShutdownTimeout(self.config.shutdown_timeout)),
        }
    }

    /// Returns current pool statistics.
    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.config.num_workers)
    }

    /// Returns whether the pool is currently running.
    pub fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    /// Returns the number of workers in the pool.
    pub fn num_workers(&self) -> usize {
        self.config.num_workers
    }
}

/// A single worker that processes jobs from the queue.
pub struct Worker {
    /// Unique identifier for this worker.
    id: String,
    processor: Arc<Processor>,
    /// Receiver for shutdown signal.
    shutdown_rx: broadcast::Receiver<()>,
    /// Interval between poll attempts when queue is empty.
    poll_interval: Duration,
    /// Shared statistics.
    stats: Arc<SharedPoolStats>,
}

impl Worker {
    fn new(
        id: String,
        processor: Arc<Processor>,
        shutdown_rx: broadcast::Receiver<()>,
        poll_interval: Duration,
        stats: Arc<SharedPoolStats>,
    ) -> Self {
        Self {
            id,
            processor,
            shutdown_rx,
            poll_interval,
            stats,
        }
    }

    /// Main worker loop.
    ///
    /// Leases and processes jobs until a shutdown signal is received.
    async fn run(mut self) {
        info!(worker_id = %self.id, "Worker started");

        loop {
            match self.shutdown_rx.try_recv() {
                Ok(()) | Err(broadcast::error::TryRecvError::Closed) => {
                    info!(worker_id = %self.id, "Worker received shutdown signal");
                    break;
                }
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
                Err(broadcast::error::TryRecvError::Empty) => {}
            }

            let started = Instant::now();
            self.stats.increment_active();
            self.processor.metrics.inc_jobs_in_progress();
            let result = self.processor.process_next().await;
            self.processor.metrics.dec_jobs_in_progress();
            self.stats.decrement_active();

            match result {
                Ok(Some(outcome)) => {
                    self.stats.record(&outcome, started.elapsed());
                    debug!(
                        worker_id = %self.id,
                        job_id = %outcome.job_id(),
                        outcome = outcome.label(),
                        duration_ms = started.elapsed().as_millis() as u64,
                        "Job processed"
                    );
                }
                Ok(None) => {
                    if self.idle().await {
                        break;
                    }
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to process job");
                    if self.idle().await {
                        break;
                    }
                }
            }
        }

        info!(worker_id = %self.id, "Worker stopped");
    }

    /// Waits one poll interval. Returns `true` if shutdown was signalled.
    async fn idle(&mut self) -> bool {
        tokio::select! {
            _ = tokio::time::sleep(self.poll_interval) => false,
            signal = self.shutdown_rx.recv() => {
                !matches!(signal, Err(broadcast::error::RecvError::Lagged(_)))
            }
        }
    }

    /// Returns the worker's ID.
    pub fn id(&self) -> &str {
        &self.id
    }
}
