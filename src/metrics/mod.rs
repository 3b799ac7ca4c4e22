//! Metrics module for Prometheus-based monitoring.
//!
//! Tracks queue depth, pool size, planned worker counts, per-class event
//! outcomes, downstream latency and cycle timings.
//!
//! # Example
//!
//! ```ignore
//! use ratelimit_manager::metrics::{init_metrics, export_metrics, MetricsCollector};
//!
//! init_metrics().expect("Failed to initialize metrics");
//!
//! let collector = MetricsCollector::new();
//! collector.record_cycle("completed", 42.0, false);
//!
//! let metrics_text = export_metrics();
//! ```

pub mod collectors;
pub mod prometheus;

pub use collectors::MetricsCollector;
pub use prometheus::{export_metrics, init_metrics};

pub use prometheus::{
    ACTIVE_WORKERS, CALL_LATENCY, CYCLES_TOTAL, CYCLE_DURATION, DEADLINE_MISSES,
    EMERGENCY_SCALE_UPS, EVENTS_TOTAL, QUEUE_DEPTH, RATE_LIMIT_WAIT, REGISTRY, REQUIRED_WORKERS,
};
