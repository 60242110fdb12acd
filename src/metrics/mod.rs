//! Metrics module for Prometheus-based monitoring.
//!
//! Records loader sweeps, job outcomes, publish latency and queue depth.
//!
//! # Example
//!
//! ```ignore
//! use agendamento_publisher::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_job("published", "instagram");
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};
