//! High-level metrics collection interface.
//!
//! `MetricsCollector` wraps the raw Prometheus statics with typed recording
//! methods. Every method is a no-op until `init_metrics()` has run, so
//! library code records unconditionally.

use super::prometheus::{
    ACTIVE_WORKERS, CALL_LATENCY, CYCLES_TOTAL, CYCLE_DURATION, DEADLINE_MISSES,
    EMERGENCY_SCALE_UPS, EVENTS_TOTAL, QUEUE_DEPTH, RATE_LIMIT_WAIT, REQUIRED_WORKERS,
};

/// Collector for recording manager metrics.
///
/// # Example
///
/// ```ignore
/// use ratelimit_manager::metrics::{MetricsCollector, init_metrics};
///
/// init_metrics().expect("Failed to init metrics");
/// let collector = MetricsCollector::new();
/// collector.record_event("OPEN_ORDER_DETECTED", "completed");
/// collector.update_queue_depth("pending", 42);
/// ```
#[derive(Debug, Clone, Copy, Default)]
pub struct MetricsCollector;

impl MetricsCollector {
    /// Create a new MetricsCollector instance.
    pub fn new() -> Self {
        Self
    }

    /// Record the outcome of one event.
    ///
    /// # Arguments
    ///
    /// * `class` - Primary class label of the event
    /// * `outcome` - Outcome label ("completed", "failed", "retryable", "leftover")
    pub fn record_event(&self, class: &str, outcome: &str) {
        if let Some(events_total) = EVENTS_TOTAL.get() {
            events_total.with_label_values(&[class, outcome]).inc();
        }

        tracing::trace!(class = class, outcome = outcome, "Recorded event metric");
    }

    /// Record one downstream call.
    pub fn record_call(&self, class: &str, success: bool, latency_secs: f64) {
        let status = if success { "success" } else { "failure" };

        if let Some(call_latency) = CALL_LATENCY.get() {
            call_latency
                .with_label_values(&[class, status])
                .observe(latency_secs);
        }
    }

    /// Record time spent waiting for a rate-limit slot.
    pub fn record_rate_limit_wait(&self, class: &str, wait_secs: f64) {
        if let Some(wait) = RATE_LIMIT_WAIT.get() {
            wait.with_label_values(&[class]).observe(wait_secs);
        }
    }

    /// Update the depth of a queue.
    pub fn update_queue_depth(&self, queue_name: &str, depth: usize) {
        if let Some(queue_depth) = QUEUE_DEPTH.get() {
            queue_depth
                .with_label_values(&[queue_name])
                .set(depth as f64);
        }

        tracing::trace!(
            queue_name = queue_name,
            depth = depth,
            "Updated queue depth metric"
        );
    }

    /// Update the count of live workers.
    pub fn update_workers(&self, count: u32) {
        if let Some(active_workers) = ACTIVE_WORKERS.get() {
            active_workers.set(count as f64);
        }

        tracing::trace!(count = count, "Updated active workers metric");
    }

    /// Update the worker count requested by the last plan.
    pub fn update_required_workers(&self, count: u32) {
        if let Some(required) = REQUIRED_WORKERS.get() {
            required.set(count as f64);
        }
    }

    /// Record a finished cycle.
    ///
    /// # Arguments
    ///
    /// * `status` - Cycle status label ("completed", "failed")
    /// * `duration_secs` - Wall-clock duration of the cycle
    /// * `deadline_missed` - Whether the cycle overran its deadline
    pub fn record_cycle(&self, status: &str, duration_secs: f64, deadline_missed: bool) {
        if let Some(cycles) = CYCLES_TOTAL.get() {
            cycles.with_label_values(&[status]).inc();
        }
        if let Some(duration) = CYCLE_DURATION.get() {
            duration.observe(duration_secs);
        }
        if deadline_missed {
            if let Some(misses) = DEADLINE_MISSES.get() {
                misses.inc();
            }
        }

        tracing::trace!(
            status = status,
            duration_secs = duration_secs,
            deadline_missed = deadline_missed,
            "Recorded cycle metric"
        );
    }

    /// Record an emergency scale-up.
    pub fn record_emergency_scale_up(&self) {
        if let Some(counter) = EMERGENCY_SCALE_UPS.get() {
            counter.inc();
        }
    }
}
