//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by agendamento-publisher
//! and provides functions for initializing, registering, and exporting them.

use prometheus::{
    Counter, CounterVec, Encoder, Gauge, GaugeVec, HistogramVec, Opts, Registry, TextEncoder,
};
use std::sync::{Mutex, OnceLock};

/// Global Prometheus registry for all agendamento-publisher metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Loader sweeps, labeled by status (success/failure).
pub static SWEEPS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Agendamentos examined by sweeps, labeled by result (enqueued/skipped/error).
pub static AGENDAMENTOS_LOADED_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Processed jobs, labeled by outcome and platform.
pub static JOBS_TOTAL: OnceLock<CounterVec> = OnceLock::new();

/// Platform publish latency in seconds, labeled by platform.
pub static PUBLISH_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

/// Number of jobs in a queue, labeled by queue name and state.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of jobs currently being processed.
pub static JOBS_IN_PROGRESS: OnceLock<Gauge> = OnceLock::new();

/// Expired leases returned to the ready set.
pub static LEASES_RECLAIMED_TOTAL: OnceLock<Counter> = OnceLock::new();

/// Number of active workers.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Serializes `init_metrics` so every static comes from the same registry.
static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Initialize all metrics and register them with the registry.
///
/// This function should be called once at application startup. Later calls
/// keep the metrics registered by the first one.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let _guard = INIT_LOCK.lock().unwrap_or_else(|e| e.into_inner());
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    // Loader metrics
    let sweeps_total = CounterVec::new(
        Opts::new("agendamento_publisher_sweeps_total", "Total loader sweeps"),
        &["status"],
    )?;

    let agendamentos_loaded_total = CounterVec::new(
        Opts::new(
            "agendamento_publisher_agendamentos_loaded_total",
            "Agendamentos examined by loader sweeps",
        ),
        &["result"],
    )?;

    // Worker metrics
    let jobs_total = CounterVec::new(
        Opts::new("agendamento_publisher_jobs_total", "Total jobs processed"),
        &["outcome", "platform"],
    )?;

    let publish_latency = HistogramVec::new(
        prometheus::HistogramOpts::new(
            "agendamento_publisher_publish_latency_seconds",
            "Platform publish latency in seconds",
        )
        .buckets(vec![0.25, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0, 60.0]),
        &["platform"],
    )?;

    // Queue metrics
    let queue_depth = GaugeVec::new(
        Opts::new("agendamento_publisher_queue_depth", "Number of jobs in queue"),
        &["queue_name", "state"],
    )?;

    let jobs_in_progress = Gauge::new(
        "agendamento_publisher_jobs_in_progress",
        "Number of jobs currently being processed",
    )?;

    let leases_reclaimed_total = Counter::new(
        "agendamento_publisher_leases_reclaimed_total",
        "Expired leases returned to the ready set",
    )?;

    let active_workers = Gauge::new(
        "agendamento_publisher_active_workers",
        "Number of active workers",
    )?;

    registry.register(Box::new(sweeps_total.clone()))?;
    registry.register(Box::new(agendamentos_loaded_total.clone()))?;
    registry.register(Box::new(jobs_total.clone()))?;
    registry.register(Box::new(publish_latency.clone()))?;
    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(jobs_in_progress.clone()))?;
    registry.register(Box::new(leases_reclaimed_total.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;

    let _ = SWEEPS_TOTAL.set(sweeps_total);
    let _ = AGENDAMENTOS_LOADED_TOTAL.set(agendamentos_loaded_total);
    let _ = JOBS_TOTAL.set(jobs_total);
    let _ = PUBLISH_LATENCY.set(publish_latency);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = JOBS_IN_PROGRESS.set(jobs_in_progress);
    let _ = LEASES_RECLAIMED_TOTAL.set(leases_reclaimed_total);
    let _ = ACTIVE_WORKERS.set(active_workers);
    let _ = REGISTRY.set(registry);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// Returns a comment line instead if the registry has not been initialized or
/// encoding fails.
pub fn export_metrics() -> String {
    let Some(registry) = REGISTRY.get() else {
        return "# Metrics not initialized. Call init_metrics() first.\n".to_string();
    };

    let encoder = TextEncoder::new();
    let metric_families = registry.gather();

    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return format!("# Error encoding metrics: {}\n", e);
    }

    String::from_utf8(buffer)
        .unwrap_or_else(|e| format!("# Error converting metrics to UTF-8: {}\n", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics_is_idempotent() {
        assert!(init_metrics().is_ok());
        assert!(init_metrics().is_ok());
        assert!(REGISTRY.get().is_some());
    }

    #[test]
    fn test_metrics_after_init() {
        init_metrics().expect("init");

        if let Some(sweeps) = SWEEPS_TOTAL.get() {
            sweeps.with_label_values(&["success"]).inc();
        }

        let metrics = export_metrics();
        assert!(!metrics.starts_with("# Error"));
        assert!(metrics.contains("agendamento_publisher_sweeps_total"));
    }
}
