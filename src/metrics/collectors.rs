//! Custom metric collectors for agendamento-publisher operations.
//!
//! `MetricsCollector` wraps the raw Prometheus metrics and provides methods
//! for the events the loader and the workers report. Every method is a no-op
//! until `init_metrics()` has run.

use std::time::Duration;

use super::prometheus::{
    ACTIVE_WORKERS, AGENDAMENTOS_LOADED_TOTAL, JOBS_IN_PROGRESS, JOBS_TOTAL,
    LEASES_RECLAIMED_TOTAL, PUBLISH_LATENCY, QUEUE_DEPTH, SWEEPS_TOTAL,
};
use crate::scheduler::queue::QueueStats;

/// Metrics collector for recording agendamento-publisher operational metrics.
///
/// # Example
///
/// ```ignore
/// use agendamento_publisher::metrics::{MetricsCollector, init_metrics};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
///
/// collector.record_sweep(true, 3, 1, 0);
/// collector.record_job("published", "instagram");
/// ```
#[derive(Debug, Clone, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record a loader sweep.
    ///
    /// # Arguments
    ///
    /// * `success` - Whether the due listing succeeded
    /// * `enqueued` - Agendamentos handed to the queue
    /// * `skipped` - Agendamentos another sweep had already claimed
    /// * `errors` - Agendamentos that failed to load
    pub fn record_sweep(&self, success: bool, enqueued: usize, skipped: usize, errors: usize) {
        let status = if success { "success" } else { "failure" };

        if let Some(sweeps) = SWEEPS_TOTAL.get() {
            sweeps.with_label_values(&[status]).inc();
        }

        if let Some(loaded) = AGENDAMENTOS_LOADED_TOTAL.get() {
            loaded
                .with_label_values(&["enqueued"])
                .inc_by(enqueued as f64);
            loaded.with_label_values(&["skipped"]).inc_by(skipped as f64);
            loaded.with_label_values(&["error"]).inc_by(errors as f64);
        }

        tracing::trace!(
            status = status,
            enqueued = enqueued,
            skipped = skipped,
            errors = errors,
            "Recorded sweep metric"
        );
    }

    /// Record the outcome of a processed job.
    pub fn record_job(&self, outcome: &str, platform: &str) {
        if let Some(jobs_total) = JOBS_TOTAL.get() {
            jobs_total.with_label_values(&[outcome, platform]).inc();
        }

        tracing::trace!(outcome = outcome, platform = platform, "Recorded job metric");
    }

    /// Record how long a platform publish call took.
    pub fn record_publish_latency(&self, platform: &str, latency: Duration) {
        if let Some(latency_histogram) = PUBLISH_LATENCY.get() {
            latency_histogram
                .with_label_values(&[platform])
                .observe(latency.as_secs_f64());
        }
    }

    /// Update the queue depth gauges from a stats snapshot.
    pub fn update_queue_stats(&self, stats: &QueueStats) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            let name = stats.queue_name.as_str();
            queue_depth
                .with_label_values(&[name, "ready"])
                .set(stats.ready_jobs as f64);
            queue_depth
                .with_label_values(&[name, "delayed"])
                .set(stats.delayed_jobs as f64);
            queue_depth
                .with_label_values(&[name, "leased"])
                .set(stats.leased_jobs as f64);
            queue_depth
                .with_label_values(&[name, "dead_letter"])
                .set(stats.dead_letter_jobs as f64);
        }

        tracing::trace!(
            queue_name = %stats.queue_name,
            live = stats.live_jobs(),
            "Updated queue depth metric"
        );
    }

    /// Record expired leases returned to the ready set.
    pub fn record_reclaimed(&self, count: usize) {
        if let Some(reclaimed) = LEASES_RECLAIMED_TOTAL.get() {
            reclaimed.inc_by(count as f64);
        }
    }

    /// Update the count of active workers.
    pub fn update_workers(&self, count: usize) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.set(count as f64);
        }

        tracing::trace!(count = count, "Updated active workers metric");
    }

    /// Increment the count of jobs in progress by 1.
    pub fn inc_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.inc();
        }
    }

    /// Decrement the count of jobs in progress by 1.
    pub fn dec_jobs_in_progress(&self) {
        if let Some(jobs_in_progress) = JOBS_IN_PROGRESS.get() {
            jobs_in_progress.dec();
        }
    }
}
