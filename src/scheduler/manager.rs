//! Manager control loop.
//!
//! One cycle drains the pending queue into a plan, sizes the worker pool,
//! executes the plan and puts unfinished work back:
//!
//! ```text
//! Idle -> Draining -> Planning -> Scaling -> Executing -> Aggregating -> Idle
//!            |
//!            +-> Terminated (nothing pending, nothing in flight)
//! ```
//!
//! Only one cycle runs at a time. A trigger that arrives while a cycle is
//! running is skipped rather than queued. Cancellation takes effect between
//! cycles.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::ManagerConfig;
use crate::error::ManagerError;
use crate::metrics::MetricsCollector;

use super::cost::CostModel;
use super::event::{Event, EventOutcome};
use super::executor::Executor;
use super::planner::CapacityPlanner;
use super::queue::{EventQueue, QueueError, QueueName, QueueSnapshot};
use super::registry::WorkerRegistry;
use super::retry::{RetryPolicy, StepError};
use super::worker_pool::{PoolStats, WorkerPool};

/// Pause before the next cycle when no worker could take work.
const NO_WORKER_BACKOFF: Duration = Duration::from_secs(5);

/// Where the control loop currently is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopPhase {
    Idle,
    Draining,
    Planning,
    Scaling,
    Executing,
    Aggregating,
    Terminated,
}

/// Overall result of a cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CycleStatus {
    /// Every outcome was recorded in the queue store.
    Completed,
    /// Some outcomes could not be written back to the queue store.
    Failed,
}

/// Report of one cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CycleSummary {
    pub cycle: u64,
    pub status: CycleStatus,
    pub events_processed: usize,
    /// Events that failed this cycle, whether requeued or parked.
    pub events_failed: usize,
    /// Live workers while the plan executed.
    pub workers_used: u32,
    pub required_workers: u32,
    pub duration_ms: u64,
    /// Events not attempted before the deadline.
    pub leftover_events: usize,
    pub feasible: bool,
    pub deadline_missed: bool,
    /// Events moved to the failed queue this cycle.
    pub parked: usize,
    /// Events put back on the pending queue for another attempt.
    pub requeued: usize,
    pub emergency_scale_up: bool,
}

impl CycleSummary {
    fn empty(cycle: u64) -> Self {
        Self {
            cycle,
            status: CycleStatus::Completed,
            events_processed: 0,
            events_failed: 0,
            workers_used: 0,
            required_workers: 0,
            duration_ms: 0,
            leftover_events: 0,
            feasible: true,
            deadline_missed: false,
            parked: 0,
            requeued: 0,
            emergency_scale_up: false,
        }
    }
}

/// What a trigger did.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CycleOutcome {
    /// Nothing pending and nothing in flight; the pool was scaled down.
    Drained(CycleSummary),
    /// A plan was executed.
    Processed(CycleSummary),
    /// Another cycle was already running.
    Skipped,
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Completed,
    Cancelled,
}

/// Totals over all cycles of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub status: RunStatus,
    pub cycles: u64,
    pub events_processed: usize,
    pub events_failed: usize,
    pub parked: usize,
    pub peak_workers: u32,
    pub duration_ms: u64,
    pub cycle_summaries: Vec<CycleSummary>,
}

impl RunSummary {
    fn new() -> Self {
        Self {
            status: RunStatus::Completed,
            cycles: 0,
            events_processed: 0,
            events_failed: 0,
            parked: 0,
            peak_workers: 0,
            duration_ms: 0,
            cycle_summaries: Vec::new(),
        }
    }

    fn absorb(&mut self, summary: CycleSummary) {
        self.cycles += 1;
        self.events_processed += summary.events_processed;
        self.events_failed += summary.events_failed;
        self.parked += summary.parked;
        self.peak_workers = self.peak_workers.max(summary.workers_used);
        self.cycle_summaries.push(summary);
    }
}

/// State owned by whichever cycle holds the lock.
struct ControlState {
    pool: WorkerPool,
    cycle: u64,
    leftover_count: usize,
    emergency_floor: u32,
    recovered: bool,
}

/// The rate limit manager.
pub struct Manager {
    config: ManagerConfig,
    queue: Arc<dyn EventQueue>,
    planner: CapacityPlanner,
    executor: Executor,
    retry: RetryPolicy,
    state: Mutex<ControlState>,
    phase: std::sync::Mutex<LoopPhase>,
    healthy: AtomicBool,
    cancel_tx: watch::Sender<bool>,
    cancel_rx: watch::Receiver<bool>,
    metrics: MetricsCollector,
}

impl Manager {
    /// Wires the manager together.
    ///
    /// # Errors
    ///
    /// Returns `ManagerError::Config` or `ManagerError::Pool` for invalid
    /// settings.
    pub fn new(
        config: ManagerConfig,
        queue: Arc<dyn EventQueue>,
        registry: Arc<dyn WorkerRegistry>,
        cost: Arc<CostModel>,
    ) -> Result<Self, ManagerError> {
        config.validate()?;

        let retry = config.retry_policy();
        let pool = WorkerPool::new(config.pool_config(), registry)?;
        let planner = CapacityPlanner::new(Arc::clone(&cost))
            .with_enforced_rate_ceiling(config.enforce_rate_ceiling);
        let executor = Executor::new(
            Arc::clone(&queue),
            cost,
            retry.clone(),
            config.executor_config(),
        );
        let (cancel_tx, cancel_rx) = watch::channel(false);

        Ok(Self {
            config,
            queue,
            planner,
            executor,
            retry,
            state: Mutex::new(ControlState {
                pool,
                cycle: 0,
                leftover_count: 0,
                emergency_floor: 0,
                recovered: false,
            }),
            phase: std::sync::Mutex::new(LoopPhase::Idle),
            healthy: AtomicBool::new(true),
            cancel_tx,
            cancel_rx,
            metrics: MetricsCollector::new(),
        })
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    /// Current phase of the control loop.
    pub fn phase(&self) -> LoopPhase {
        *self.phase.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// False after the queue store stopped answering.
    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }

    /// Requests the run loop to stop after the current cycle.
    pub fn cancel(&self) {
        let _ = self.cancel_tx.send(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    /// Pool statistics, or `None` while a cycle holds the pool.
    pub fn pool_stats(&self) -> Option<PoolStats> {
        self.state.try_lock().ok().map(|state| state.pool.stats())
    }

    /// Runs cycles until the queues are drained or the run is cancelled.
    pub async fn run(&self) -> Result<RunSummary, ManagerError> {
        let started = Instant::now();
        let mut summary = RunSummary::new();

        loop {
            if self.is_cancelled() {
                info!(cycles = summary.cycles, "Run cancelled");
                summary.status = RunStatus::Cancelled;
                break;
            }

            match self.trigger().await? {
                CycleOutcome::Drained(cycle) => {
                    summary.absorb(cycle);
                    break;
                }
                CycleOutcome::Processed(cycle) => {
                    let stalled = cycle.workers_used == 0 && cycle.leftover_events > 0;
                    summary.absorb(cycle);
                    if stalled {
                        warn!(
                            backoff = ?NO_WORKER_BACKOFF,
                            "No worker took work last cycle; backing off"
                        );
                        let mut cancel_rx = self.cancel_rx.clone();
                        tokio::select! {
                            _ = tokio::time::sleep(NO_WORKER_BACKOFF) => {}
                            _ = cancel_rx.wait_for(|cancelled| *cancelled) => {}
                        }
                    }
                }
                CycleOutcome::Skipped => {
                    // Someone else is running a cycle; wait for it to finish.
                    drop(self.state.lock().await);
                }
            }
        }

        summary.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            status = ?summary.status,
            cycles = summary.cycles,
            processed = summary.events_processed,
            failed = summary.events_failed,
            parked = summary.parked,
            duration_ms = summary.duration_ms,
            "Run finished"
        );
        Ok(summary)
    }

    /// Runs one cycle unless another is in progress.
    pub async fn trigger(&self) -> Result<CycleOutcome, ManagerError> {
        let Ok(mut state) = self.state.try_lock() else {
            debug!("Cycle already running; trigger skipped");
            return Ok(CycleOutcome::Skipped);
        };

        let result = self.run_cycle(&mut state).await;
        if self.phase() != LoopPhase::Terminated {
            self.set_phase(LoopPhase::Idle);
        }
        result
    }

    /// Stops every worker unit, ignoring the configured minimum.
    pub async fn shutdown(&self) {
        let mut state = self.state.lock().await;
        let report = state.pool.shutdown().await;
        self.metrics.update_workers(report.live);
        self.set_phase(LoopPhase::Terminated);
    }

    async fn run_cycle(&self, state: &mut ControlState) -> Result<CycleOutcome, ManagerError> {
        let started = Instant::now();
        state.cycle += 1;
        let mut summary = CycleSummary::empty(state.cycle);
        let mut persisted_all = true;

        if !state.recovered {
            let report = self
                .step("recover_in_flight", || {
                    self.queue.recover_in_flight(self.config.max_retries)
                })
                .await?;
            if report.requeued > 0 || report.parked > 0 {
                info!(
                    requeued = report.requeued,
                    parked = report.parked,
                    "Recovered in-flight events from a previous run"
                );
            }
            summary.parked += report.parked;
            state.recovered = true;
        }

        // Draining
        self.set_phase(LoopPhase::Draining);
        let mut snapshot = self.snapshot().await?;

        if snapshot.pending == 0 && snapshot.in_flight > 0 {
            let report = self
                .step("recover_in_flight", || {
                    self.queue.recover_in_flight(self.config.max_retries)
                })
                .await?;
            warn!(
                requeued = report.requeued,
                parked = report.parked,
                "Recovered orphaned in-flight events"
            );
            summary.parked += report.parked;
            // Stranded leftovers are back in pending now.
            state.leftover_count = 0;
            snapshot = self.snapshot().await?;
        }

        if snapshot.is_drained() && state.leftover_count == 0 {
            return Ok(CycleOutcome::Drained(
                self.terminate(state, summary, started).await,
            ));
        }

        let mut claimed: Vec<Event> = Vec::with_capacity(snapshot.pending);
        for _ in 0..snapshot.pending {
            match self.step("claim", || self.queue.claim_next()).await? {
                Some(event) => claimed.push(event),
                None => break,
            }
        }

        if claimed.is_empty() && state.leftover_count == 0 {
            return Ok(CycleOutcome::Drained(
                self.terminate(state, summary, started).await,
            ));
        }

        // Planning
        self.set_phase(LoopPhase::Planning);
        let plan = self.planner.plan(
            claimed,
            self.config.deadline,
            state.leftover_count,
            self.config.max_workers,
        );
        self.metrics.update_required_workers(plan.required_workers);
        summary.required_workers = plan.required_workers;
        summary.feasible = plan.feasible;

        // Scaling
        self.set_phase(LoopPhase::Scaling);
        let target = plan.required_workers.max(state.emergency_floor);
        state.emergency_floor = 0;
        let scale = state.pool.scale_to(target).await;
        self.metrics.update_workers(scale.live);
        let units = state.pool.clients().await;
        summary.workers_used = units.len() as u32;
        if units.is_empty() {
            warn!(
                live = scale.live,
                failures = scale.failures,
                "No worker can take work this cycle"
            );
        }

        // Executing
        self.set_phase(LoopPhase::Executing);
        let remaining = self.config.deadline.saturating_sub(started.elapsed());
        let report = self.executor.execute(&plan, &units, remaining).await;

        // Aggregating
        self.set_phase(LoopPhase::Aggregating);
        if report.unsettled > 0 {
            self.healthy.store(false, Ordering::SeqCst);
            persisted_all = false;
        }
        summary.events_processed = report.processed;
        summary.events_failed = report.failed;
        summary.leftover_events = report.leftover;
        summary.parked += report.permanently_failed();

        for result in report.retryable() {
            let EventOutcome::Retryable { reason, .. } = &result.outcome else {
                continue;
            };

            if result.event.can_retry(self.config.max_retries) {
                let next = result.event.next_attempt();
                match self
                    .persist("requeue", &next, || self.queue.requeue(&next))
                    .await
                {
                    Some(true) => summary.requeued += 1,
                    Some(false) => debug!(event_id = %next.id, "Event already completed; not requeued"),
                    None => persisted_all = false,
                }
            } else {
                let parked_reason = format!("retry budget exhausted: {reason}");
                warn!(
                    event_id = %result.event.id,
                    retry_count = result.event.retry_count,
                    reason = %reason,
                    "Parking event after retry budget exhausted"
                );
                match self
                    .persist("park", &result.event, || {
                        self.queue.move_to_failed(&result.event, &parked_reason)
                    })
                    .await
                {
                    Some(()) => summary.parked += 1,
                    None => persisted_all = false,
                }
            }
        }

        // Requeued leftovers show up in the next snapshot; only the ones
        // still stuck in flight add demand on top of it.
        let mut stranded = 0;
        for event in report.leftover_events() {
            match self
                .persist("requeue_leftover", event, || self.queue.requeue(event))
                .await
            {
                Some(true) => summary.requeued += 1,
                Some(false) => {}
                None => {
                    persisted_all = false;
                    stranded += 1;
                }
            }
        }
        state.leftover_count = stranded;

        let elapsed = started.elapsed();
        summary.deadline_missed = elapsed > self.config.deadline;

        if elapsed > self.config.deadline.mul_f64(self.config.emergency_fraction) {
            let pending = match self
                .retry
                .run("pending_length", || self.queue.length(QueueName::Pending))
                .await
            {
                Ok(pending) => pending,
                Err(e) => {
                    warn!(error = %e, "Could not read pending length for emergency check");
                    0
                }
            };

            if pending > 0 {
                let live = state.pool.live();
                let target = live
                    .saturating_mul(2)
                    .max(live + 1)
                    .min(self.config.max_workers);
                warn!(
                    live,
                    target,
                    pending,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Cycle overran emergency threshold with work pending; scaling up"
                );
                let scale = state.pool.scale_to(target).await;
                self.metrics.update_workers(scale.live);
                self.metrics.record_emergency_scale_up();
                state.emergency_floor = target;
                summary.emergency_scale_up = true;
            }
        }

        if !persisted_all {
            summary.status = CycleStatus::Failed;
        }
        summary.duration_ms = started.elapsed().as_millis() as u64;
        self.record_cycle(&summary);

        info!(
            cycle = summary.cycle,
            processed = summary.events_processed,
            failed = summary.events_failed,
            leftover = summary.leftover_events,
            parked = summary.parked,
            requeued = summary.requeued,
            workers = summary.workers_used,
            feasible = summary.feasible,
            deadline_missed = summary.deadline_missed,
            duration_ms = summary.duration_ms,
            "Cycle finished"
        );

        Ok(CycleOutcome::Processed(summary))
    }

    async fn terminate(
        &self,
        state: &mut ControlState,
        mut summary: CycleSummary,
        started: Instant,
    ) -> CycleSummary {
        let scale = state.pool.scale_to(self.config.min_workers).await;
        self.metrics.update_workers(scale.live);
        self.metrics.update_required_workers(0);
        state.emergency_floor = 0;

        summary.workers_used = 0;
        summary.duration_ms = started.elapsed().as_millis() as u64;
        self.record_cycle(&summary);
        self.set_phase(LoopPhase::Terminated);

        info!(cycle = summary.cycle, live = scale.live, "Queues drained; terminating");
        summary
    }

    async fn snapshot(&self) -> Result<QueueSnapshot, ManagerError> {
        let snapshot = self.step("snapshot", || self.queue.snapshot()).await?;
        self.metrics.update_queue_depth("pending", snapshot.pending);
        self.metrics.update_queue_depth("in_flight", snapshot.in_flight);
        self.metrics.update_queue_depth("failed", snapshot.failed);
        debug!(
            pending = snapshot.pending,
            in_flight = snapshot.in_flight,
            failed = snapshot.failed,
            "Queue snapshot"
        );
        Ok(snapshot)
    }

    /// Runs a queue step under the retry policy. Exhausting the budget
    /// marks the manager unhealthy and stops the loop.
    async fn step<T, F, Fut>(&self, name: &str, f: F) -> Result<T, ManagerError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, QueueError>>,
    {
        match self.retry.run(name, f).await {
            Ok(value) => {
                self.healthy.store(true, Ordering::SeqCst);
                Ok(value)
            }
            Err(e) => {
                self.healthy.store(false, Ordering::SeqCst);
                error!(step = name, error = %e, "Queue store unavailable");
                let attempts = e.attempts();
                let source = match e {
                    StepError::Failed { source, .. } => source,
                    StepError::TimedOut { timeout, .. } => QueueError::Timeout(timeout),
                };
                Err(ManagerError::QueueUnavailable { attempts, source })
            }
        }
    }

    /// Writes an outcome back under the retry policy.
    ///
    /// On failure the event is logged in full and `None` is returned; the
    /// cycle carries on with its in-memory results.
    async fn persist<T, F, Fut>(&self, name: &str, event: &Event, f: F) -> Option<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, QueueError>>,
    {
        match self.retry.run(name, f).await {
            Ok(value) => Some(value),
            Err(e) => {
                self.healthy.store(false, Ordering::SeqCst);
                let payload = serde_json::to_string(event).unwrap_or_default();
                error!(
                    step = name,
                    event_id = %event.id,
                    error = %e,
                    event = %payload,
                    "Failed to write event back to queue store"
                );
                None
            }
        }
    }

    fn record_cycle(&self, summary: &CycleSummary) {
        let status = match summary.status {
            CycleStatus::Completed => "completed",
            CycleStatus::Failed => "failed",
        };
        self.metrics.record_cycle(
            status,
            Duration::from_millis(summary.duration_ms).as_secs_f64(),
            summary.deadline_missed,
        );
    }

    fn set_phase(&self, phase: LoopPhase) {
        let mut current = self.phase.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if *current != phase {
            debug!(from = ?*current, to = ?phase, "Control loop phase change");
            *current = phase;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use crate::scheduler::downstream::{FailurePolicy, SimulatedDownstream};
    use crate::scheduler::event::EventClass;
    use crate::scheduler::memory_queue::MemoryEventQueue;
    use crate::scheduler::registry::TaskRegistry;
    use std::collections::HashMap;

    fn manager_with(
        config: ManagerConfig,
        queue: Arc<MemoryEventQueue>,
        failures: FailurePolicy,
    ) -> Manager {
        let cost = Arc::new(CostModel::reference());
        let downstream =
            Arc::new(SimulatedDownstream::new(Arc::clone(&cost)).with_failures(failures));
        Manager::new(config, queue, Arc::new(TaskRegistry::new(downstream)), cost).unwrap()
    }

    fn fast_steps(config: ManagerConfig) -> ManagerConfig {
        config.with_step_policy(3, Duration::from_secs(5), Duration::from_millis(10))
    }

    async fn enqueue(queue: &MemoryEventQueue, subjects: &[&str], class: EventClass) -> Vec<Event> {
        let events: Vec<Event> = subjects
            .iter()
            .map(|s| Event::new(*s, vec![class]).unwrap())
            .collect();
        queue.push_batch(QueueName::Pending, &events).await.unwrap();
        events
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_queue_terminates() {
        let queue = Arc::new(MemoryEventQueue::new());
        let manager = manager_with(fast_steps(ManagerConfig::default()), queue, FailurePolicy::None);

        let outcome = manager.trigger().await.unwrap();
        let CycleOutcome::Drained(summary) = outcome else {
            panic!("expected drained, got {outcome:?}");
        };
        assert_eq!(summary.events_processed, 0);
        assert_eq!(summary.workers_used, 0);
        assert_eq!(manager.phase(), LoopPhase::Terminated);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cycle_processes_batch() {
        let queue = Arc::new(MemoryEventQueue::new());
        enqueue(&queue, &["a", "b", "c"], EventClass::NewBalanceUpdate).await;
        let manager = manager_with(
            fast_steps(ManagerConfig::default()),
            Arc::clone(&queue),
            FailurePolicy::None,
        );

        let CycleOutcome::Processed(summary) = manager.trigger().await.unwrap() else {
            panic!("expected processed");
        };
        assert_eq!(summary.events_processed, 3);
        assert_eq!(summary.workers_used, 1);
        assert_eq!(summary.status, CycleStatus::Completed);
        assert_eq!(manager.phase(), LoopPhase::Idle);
        assert_eq!(queue.completed_ids().len(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_trigger_is_skipped() {
        let queue = Arc::new(MemoryEventQueue::new());
        enqueue(&queue, &["a"], EventClass::RebalanceNeeded).await;
        let manager = manager_with(fast_steps(ManagerConfig::default()), queue, FailurePolicy::None);

        let (first, second) = tokio::join!(manager.trigger(), manager.trigger());
        assert!(matches!(first.unwrap(), CycleOutcome::Processed(_)));
        assert_eq!(second.unwrap(), CycleOutcome::Skipped);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_cap_parks_event() {
        let queue = Arc::new(MemoryEventQueue::new());
        enqueue(&queue, &["flaky"], EventClass::NewBalanceUpdate).await;
        let failures =
            FailurePolicy::Subjects(HashMap::from([("flaky".to_string(), ErrorCategory::Transient)]));
        let manager = manager_with(
            fast_steps(ManagerConfig::default().with_max_retries(2)),
            Arc::clone(&queue),
            failures,
        );

        let summary = manager.run().await.unwrap();
        assert_eq!(summary.status, RunStatus::Completed);
        assert_eq!(summary.parked, 1);

        let failed = queue.peek_failed(10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert!(failed[0].reason.starts_with("retry budget exhausted"));
        assert_eq!(failed[0].event().unwrap().retry_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_failure_is_parked_once() {
        let queue = Arc::new(MemoryEventQueue::new());
        enqueue(&queue, &["bad", "good"], EventClass::OpenOrderDetected).await;
        let failures =
            FailurePolicy::Subjects(HashMap::from([("bad".to_string(), ErrorCategory::Validation)]));
        let manager = manager_with(fast_steps(ManagerConfig::default()), Arc::clone(&queue), failures);

        let summary = manager.run().await.unwrap();
        assert_eq!(summary.events_processed, 1);
        assert_eq!(summary.parked, 1);
        assert_eq!(queue.length(QueueName::Failed).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_outage_returns_unavailable() {
        let queue = Arc::new(MemoryEventQueue::new());
        queue.set_available(false);
        let manager = manager_with(
            fast_steps(ManagerConfig::default()),
            Arc::clone(&queue),
            FailurePolicy::None,
        );

        let err = manager.trigger().await.unwrap_err();
        assert!(matches!(
            err,
            ManagerError::QueueUnavailable { attempts: 3, .. }
        ));
        assert!(!manager.is_healthy());

        queue.set_available(true);
        assert!(matches!(
            manager.trigger().await.unwrap(),
            CycleOutcome::Drained(_)
        ));
        assert!(manager.is_healthy());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_between_cycles() {
        let queue = Arc::new(MemoryEventQueue::new());
        enqueue(&queue, &["a"], EventClass::NewBalanceUpdate).await;
        let manager = manager_with(fast_steps(ManagerConfig::default()), queue, FailurePolicy::None);

        manager.cancel();
        let summary = manager.run().await.unwrap();
        assert_eq!(summary.status, RunStatus::Cancelled);
        assert_eq!(summary.cycles, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_emergency_scale_up_sets_floor() {
        let queue = Arc::new(MemoryEventQueue::new());
        let subjects: Vec<String> = (0..40).map(|i| format!("w{i}")).collect();
        let refs: Vec<&str> = subjects.iter().map(String::as_str).collect();
        enqueue(&queue, &refs, EventClass::RebalanceNeeded).await;

        // 40 rebalance events at 8 s over a 10 s deadline need 32 workers,
        // but only 4 are allowed and each runs one call at a time: the
        // first cycle overruns with work left.
        let config = fast_steps(
            ManagerConfig::default()
                .with_deadline(Duration::from_secs(10))
                .with_workers(0, 4)
                .with_in_worker_concurrency(1),
        );
        let manager = manager_with(config, Arc::clone(&queue), FailurePolicy::None);

        let CycleOutcome::Processed(first) = manager.trigger().await.unwrap() else {
            panic!("expected processed");
        };
        assert!(!first.feasible);
        assert_eq!(first.workers_used, 4);
        assert_eq!(first.events_processed, 8);
        assert_eq!(first.leftover_events, 32);
        assert!(first.deadline_missed);
        assert!(first.emergency_scale_up);
    }

    #[tokio::test(start_paused = true)]
    async fn test_emergency_floor_holds_pool_size_next_cycle() {
        let queue = Arc::new(MemoryEventQueue::new());
        let subjects: Vec<String> = (0..200).map(|i| format!("w{i:03}")).collect();
        let refs: Vec<&str> = subjects.iter().map(String::as_str).collect();
        enqueue(&queue, &refs, EventClass::BalanceCheckRequired).await;

        // Balance checks share one endpoint at 80 calls a minute, so ten
        // workers get 80 events through and the rest wait out the deadline.
        let config = fast_steps(
            ManagerConfig::default()
                .with_deadline(Duration::from_secs(60))
                .with_workers(0, 30),
        );
        let manager = manager_with(config, Arc::clone(&queue), FailurePolicy::None);

        let CycleOutcome::Processed(first) = manager.trigger().await.unwrap() else {
            panic!("expected processed");
        };
        assert_eq!(first.required_workers, 10);
        assert_eq!(first.workers_used, 10);
        assert_eq!(first.events_processed, 80);
        assert_eq!(first.leftover_events, 120);
        assert!(first.emergency_scale_up);
        assert_eq!(manager.pool_stats().unwrap().live_workers, 20);

        // 120 events alone would need 6 workers; the floor keeps 20.
        let CycleOutcome::Processed(second) = manager.trigger().await.unwrap() else {
            panic!("expected processed");
        };
        assert_eq!(second.required_workers, 6);
        assert_eq!(second.workers_used, 20);
    }

    #[tokio::test(start_paused = true)]
    async fn test_requeued_leftovers_are_not_counted_twice() {
        use crate::scheduler::cost::ClassProfile;

        let queue = Arc::new(MemoryEventQueue::new());
        let subjects: Vec<String> = (0..20).map(|i| format!("w{i:02}")).collect();
        let refs: Vec<&str> = subjects.iter().map(String::as_str).collect();
        enqueue(&queue, &refs, EventClass::NewBalanceUpdate).await;

        // The planner expects 3 s per balance update; the downstream takes 6 s,
        // so two workers get through half of the batch.
        let slow = CostModel::reference()
            .with_profile(
                EventClass::NewBalanceUpdate,
                ClassProfile {
                    expected_latency_ms: 6000,
                    rate_limit_per_minute: 40,
                    primary_endpoint: "balances-a".into(),
                    overflow_endpoints: vec!["balances-b".into()],
                },
            )
            .unwrap();
        let downstream = Arc::new(SimulatedDownstream::new(Arc::new(slow)));
        let config = fast_steps(
            ManagerConfig::default()
                .with_deadline(Duration::from_secs(30))
                .with_workers(0, 20)
                .with_in_worker_concurrency(1),
        );
        let manager = Manager::new(
            config,
            Arc::clone(&queue) as Arc<dyn EventQueue>,
            Arc::new(TaskRegistry::new(downstream)),
            Arc::new(CostModel::reference()),
        )
        .unwrap();

        let CycleOutcome::Processed(first) = manager.trigger().await.unwrap() else {
            panic!("expected processed");
        };
        assert_eq!(first.required_workers, 2);
        assert_eq!(first.events_processed, 10);
        assert_eq!(first.leftover_events, 10);
        assert_eq!(first.requeued, 10);

        let CycleOutcome::Processed(second) = manager.trigger().await.unwrap() else {
            panic!("expected processed");
        };
        // ceil(10 × 3000 / 30000); counting the leftovers again would give 2.
        assert_eq!(second.required_workers, 1);
    }
}
