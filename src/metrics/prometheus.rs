//! Prometheus metrics registration and export.
//!
//! This module defines all Prometheus metrics used by the manager and provides
//! functions for initializing, registering, and exporting metrics.

use prometheus::{
    Encoder, Gauge, GaugeVec, Histogram, HistogramOpts, HistogramVec, IntCounter, IntCounterVec,
    Opts, Registry, TextEncoder,
};
use std::sync::{Mutex, OnceLock};

/// Global Prometheus registry for all manager metrics.
pub static REGISTRY: OnceLock<Registry> = OnceLock::new();

/// Number of events per queue, labeled by queue name.
pub static QUEUE_DEPTH: OnceLock<GaugeVec> = OnceLock::new();

/// Number of live workers.
pub static ACTIVE_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Worker count computed by the last plan.
pub static REQUIRED_WORKERS: OnceLock<Gauge> = OnceLock::new();

/// Events handled, labeled by primary class and outcome.
pub static EVENTS_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Downstream call latency in seconds, labeled by class and status.
pub static CALL_LATENCY: OnceLock<HistogramVec> = OnceLock::new();

/// Time spent waiting on the rate limiter, labeled by class.
pub static RATE_LIMIT_WAIT: OnceLock<HistogramVec> = OnceLock::new();

/// Cycle duration in seconds.
pub static CYCLE_DURATION: OnceLock<Histogram> = OnceLock::new();

/// Cycles run, labeled by status.
pub static CYCLES_TOTAL: OnceLock<IntCounterVec> = OnceLock::new();

/// Cycles that overran their deadline.
pub static DEADLINE_MISSES: OnceLock<IntCounter> = OnceLock::new();

/// Emergency scale-ups triggered.
pub static EMERGENCY_SCALE_UPS: OnceLock<IntCounter> = OnceLock::new();

/// Serializes initialization so concurrent callers agree on one registry.
static INIT_LOCK: Mutex<()> = Mutex::new(());

/// Initialize all metrics and register them with the registry.
///
/// This function should be called once at application startup. Later calls
/// are no-ops.
///
/// # Errors
///
/// Returns a `prometheus::Error` if metric registration fails, typically due to
/// duplicate metric names or invalid metric configurations.
pub fn init_metrics() -> Result<(), prometheus::Error> {
    let _guard = INIT_LOCK.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    if REGISTRY.get().is_some() {
        return Ok(());
    }

    let registry = Registry::new();

    // Queue and pool metrics
    let queue_depth = GaugeVec::new(
        Opts::new("rlm_queue_depth", "Number of events in queue"),
        &["queue_name"],
    )?;

    let active_workers = Gauge::new("rlm_active_workers", "Number of live workers")?;

    let required_workers = Gauge::new(
        "rlm_required_workers",
        "Worker count computed by the last plan",
    )?;

    // Event metrics
    let events_total = IntCounterVec::new(
        Opts::new("rlm_events_total", "Total events handled"),
        &["class", "outcome"],
    )?;

    let call_latency = HistogramVec::new(
        HistogramOpts::new(
            "rlm_call_latency_seconds",
            "Downstream call latency in seconds",
        )
        .buckets(vec![0.5, 1.0, 2.0, 3.0, 5.0, 8.0, 15.0, 30.0]),
        &["class", "status"],
    )?;

    let rate_limit_wait = HistogramVec::new(
        HistogramOpts::new(
            "rlm_rate_limit_wait_seconds",
            "Time spent waiting for a rate-limit slot",
        )
        .buckets(vec![0.0, 1.0, 5.0, 15.0, 30.0, 60.0]),
        &["class"],
    )?;

    // Cycle metrics
    let cycle_duration = Histogram::with_opts(
        HistogramOpts::new("rlm_cycle_duration_seconds", "Cycle duration in seconds")
            .buckets(vec![1.0, 10.0, 30.0, 60.0, 120.0, 180.0, 300.0, 600.0]),
    )?;

    let cycles_total = IntCounterVec::new(
        Opts::new("rlm_cycles_total", "Total control loop cycles"),
        &["status"],
    )?;

    let deadline_misses = IntCounter::new(
        "rlm_deadline_misses_total",
        "Cycles that overran their deadline",
    )?;

    let emergency_scale_ups = IntCounter::new(
        "rlm_emergency_scale_ups_total",
        "Emergency scale-ups triggered",
    )?;

    registry.register(Box::new(queue_depth.clone()))?;
    registry.register(Box::new(active_workers.clone()))?;
    registry.register(Box::new(required_workers.clone()))?;
    registry.register(Box::new(events_total.clone()))?;
    registry.register(Box::new(call_latency.clone()))?;
    registry.register(Box::new(rate_limit_wait.clone()))?;
    registry.register(Box::new(cycle_duration.clone()))?;
    registry.register(Box::new(cycles_total.clone()))?;
    registry.register(Box::new(deadline_misses.clone()))?;
    registry.register(Box::new(emergency_scale_ups.clone()))?;

    let _ = REGISTRY.set(registry);
    let _ = QUEUE_DEPTH.set(queue_depth);
    let _ = ACTIVE_WORKERS.set(active_workers);
    let _ = REQUIRED_WORKERS.set(required_workers);
    let _ = EVENTS_TOTAL.set(events_total);
    let _ = CALL_LATENCY.set(call_latency);
    let _ = RATE_LIMIT_WAIT.set(rate_limit_wait);
    let _ = CYCLE_DURATION.set(cycle_duration);
    let _ = CYCLES_TOTAL.set(cycles_total);
    let _ = DEADLINE_MISSES.set(deadline_misses);
    let _ = EMERGENCY_SCALE_UPS.set(emergency_scale_ups);

    tracing::info!("Prometheus metrics initialized successfully");

    Ok(())
}

/// Export all registered metrics in Prometheus text format.
///
/// If the registry has not been initialized or encoding fails, returns a
/// comment line describing the problem.
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
