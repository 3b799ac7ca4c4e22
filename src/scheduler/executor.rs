//! Task distribution and execution.
//!
//! Every non-empty bucket of a plan is bound to a live worker unit and runs
//! as its own tokio task that feeds the unit its calls. Inside a bucket at
//! most `in_worker_concurrency` events are in flight; each event's classes
//! are processed in order, every call first taking a rate-limit slot for its
//! `(class, endpoint)` pair.
//!
//! Buckets planned for a unit that is not live are dealt to the live ones.
//! With no live unit the whole plan comes back as leftover.
//!
//! Results stream back over a channel while buckets run, so a bucket that
//! panics loses only the events it had not reported yet. Those come back as
//! leftover.

use std::collections::{BTreeMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use tokio::sync::{mpsc, Semaphore};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::error::CallError;
use crate::metrics::MetricsCollector;

use super::cost::CostModel;
use super::downstream::DownstreamClient;
use super::event::{Event, EventOutcome, EventResult, WorkerId};
use super::planner::ProcessingPlan;
use super::queue::EventQueue;
use super::rate_limit::RateLimiter;
use super::registry::UnitClients;
use super::retry::RetryPolicy;

/// Executor tuning.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Events processed concurrently inside one bucket.
    pub in_worker_concurrency: usize,
    /// Upper bound on a single downstream call.
    pub call_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            in_worker_concurrency: 5,
            call_timeout: Duration::from_secs(30),
        }
    }
}

/// Aggregate result of executing one plan.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExecutionReport {
    /// Events in the plan.
    pub dispatched: usize,
    /// Events whose every class call succeeded.
    pub processed: usize,
    /// Events that failed this cycle, retryable or not.
    pub failed: usize,
    /// Events never attempted.
    pub leftover: usize,
    /// Completed or failed events whose outcome the queue store did not take.
    pub unsettled: usize,
    /// One result per dispatched event.
    pub results: Vec<EventResult>,
}

impl ExecutionReport {
    /// Results the control loop must requeue or park.
    pub fn retryable(&self) -> impl Iterator<Item = &EventResult> {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, EventOutcome::Retryable { .. }))
    }

    /// Events that were never attempted.
    pub fn leftover_events(&self) -> impl Iterator<Item = &Event> {
        self.results
            .iter()
            .filter(|r| r.outcome == EventOutcome::Leftover)
            .map(|r| &r.event)
    }

    /// Events parked as non-retryable failures.
    pub fn permanently_failed(&self) -> usize {
        self.results
            .iter()
            .filter(|r| matches!(r.outcome, EventOutcome::Failed { .. }))
            .count()
    }
}

/// A bucket bound to the unit that runs its calls.
struct Route {
    worker_id: WorkerId,
    client: Arc<dyn DownstreamClient>,
    events: Vec<Event>,
}

/// Binds plan buckets to units that can take work.
///
/// A bucket whose unit is live keeps it. Events of the other buckets are
/// dealt round-robin onto the live units. With no live unit they come back
/// unrouted, tagged with the worker they were planned for.
fn route(plan: &ProcessingPlan, units: &UnitClients) -> (Vec<Route>, Vec<(WorkerId, Event)>) {
    let mut routed: BTreeMap<WorkerId, Vec<Event>> = BTreeMap::new();
    let mut orphaned: Vec<(WorkerId, Event)> = Vec::new();

    for (worker_id, events) in &plan.assignments {
        if events.is_empty() {
            continue;
        }
        if units.contains_key(worker_id) {
            routed
                .entry(*worker_id)
                .or_default()
                .extend(events.iter().cloned());
        } else {
            orphaned.extend(events.iter().cloned().map(|event| (*worker_id, event)));
        }
    }

    let live: Vec<WorkerId> = units.keys().copied().collect();
    if !orphaned.is_empty() && !live.is_empty() {
        warn!(
            events = orphaned.len(),
            live = live.len(),
            "Planned workers cannot take work; dealing their events to live workers"
        );
        for (i, (_, event)) in orphaned.drain(..).enumerate() {
            routed.entry(live[i % live.len()]).or_default().push(event);
        }
    }

    let routes = routed
        .into_iter()
        .filter_map(|(worker_id, events)| {
            units.get(&worker_id).map(|client| Route {
                worker_id,
                client: Arc::clone(client),
                events,
            })
        })
        .collect();
    (routes, orphaned)
}

/// Shared pieces every bucket needs.
struct BucketContext {
    queue: Arc<dyn EventQueue>,
    cost: Arc<CostModel>,
    limiter: Arc<RateLimiter>,
    retry: RetryPolicy,
    config: ExecutorConfig,
    metrics: MetricsCollector,
}

/// Dispatches plans to worker units and collects outcomes.
pub struct Executor {
    ctx: Arc<BucketContext>,
}

impl Executor {
    pub fn new(
        queue: Arc<dyn EventQueue>,
        cost: Arc<CostModel>,
        retry: RetryPolicy,
        config: ExecutorConfig,
    ) -> Self {
        let limiter = Arc::new(RateLimiter::new(Arc::clone(&cost)));
        Self {
            ctx: Arc::new(BucketContext {
                queue,
                cost,
                limiter,
                retry,
                config,
                metrics: MetricsCollector::new(),
            }),
        }
    }

    /// Runs every bucket of `plan` on the given units and waits for all of
    /// them.
    ///
    /// Events not started within `deadline_remaining`, and every event when
    /// `units` is empty, are reported as leftover.
    pub async fn execute(
        &self,
        plan: &ProcessingPlan,
        units: &UnitClients,
        deadline_remaining: Duration,
    ) -> ExecutionReport {
        let deadline = Instant::now() + deadline_remaining;
        let (tx, mut rx) = mpsc::unbounded_channel::<EventResult>();
        let unsettled = Arc::new(AtomicUsize::new(0));

        let (routes, unrouted) = route(plan, units);
        if !unrouted.is_empty() {
            warn!(
                events = unrouted.len(),
                "No live worker can take work; events left for the next cycle"
            );
        }

        let mut dispatched: BTreeMap<WorkerId, Vec<Event>> = BTreeMap::new();
        let mut handles = Vec::new();

        for route in routes {
            dispatched.insert(route.worker_id, route.events.clone());

            let ctx = Arc::clone(&self.ctx);
            let tx = tx.clone();
            let unsettled = Arc::clone(&unsettled);
            let worker_id = route.worker_id;
            handles.push((
                worker_id,
                tokio::spawn(async move {
                    run_bucket(ctx, route, deadline, tx, unsettled).await
                }),
            ));
        }
        drop(tx);

        let joined = join_all(
            handles
                .into_iter()
                .map(|(worker_id, handle)| async move { (worker_id, handle.await) }),
        )
        .await;

        for (worker_id, outcome) in joined {
            if let Err(e) = outcome {
                error!(
                    worker_id = %worker_id,
                    error = %e,
                    "Bucket crashed; unreported events become leftover"
                );
            }
        }

        let mut results = Vec::new();
        while let Ok(result) = rx.try_recv() {
            results.push(result);
        }

        // Anything a crashed bucket never reported is leftover.
        let reported: HashSet<String> = results.iter().map(|r| r.event.id.clone()).collect();
        for (worker_id, events) in &dispatched {
            for event in events {
                if !reported.contains(&event.id) {
                    results.push(EventResult::leftover(event.clone(), *worker_id));
                }
            }
        }

        let total = dispatched.values().map(Vec::len).sum::<usize>() + unrouted.len();
        for (worker_id, event) in unrouted {
            results.push(EventResult::leftover(event, worker_id));
        }

        self.aggregate(total, results, unsettled.load(Ordering::SeqCst))
    }

    fn aggregate(&self, dispatched: usize, results: Vec<EventResult>, unsettled: usize) -> ExecutionReport {
        let mut processed = 0;
        let mut failed = 0;

        for result in &results {
            match result.outcome {
                EventOutcome::Completed => processed += 1,
                EventOutcome::Failed { .. } | EventOutcome::Retryable { .. } => failed += 1,
                EventOutcome::Leftover => {}
            }
            let class = result
                .event
                .primary_class()
                .map(|c| c.as_str())
                .unwrap_or("unknown");
            self.ctx.metrics.record_event(class, result.outcome.label());
        }

        let leftover = match dispatched.checked_sub(processed + failed) {
            Some(leftover) => leftover,
            None => {
                warn!(
                    dispatched,
                    processed,
                    failed,
                    "More outcomes than dispatched events; clamping leftover to zero"
                );
                0
            }
        };

        info!(dispatched, processed, failed, leftover, unsettled, "Execution finished");

        ExecutionReport {
            dispatched,
            processed,
            failed,
            leftover,
            unsettled,
            results,
        }
    }
}

async fn run_bucket(
    ctx: Arc<BucketContext>,
    route: Route,
    deadline: Instant,
    tx: mpsc::UnboundedSender<EventResult>,
    unsettled: Arc<AtomicUsize>,
) {
    let Route {
        worker_id,
        client,
        events,
    } = route;
    let total = events.len();
    let semaphore = Semaphore::new(ctx.config.in_worker_concurrency.max(1));
    debug!(worker_id = %worker_id, events = total, "Bucket started");

    let tasks = events.into_iter().map(|event| {
        let ctx = &ctx;
        let client = client.as_ref();
        let semaphore = &semaphore;
        let tx = &tx;
        let unsettled = &unsettled;
        async move {
            let result = match semaphore.acquire().await {
                Ok(_permit) if Instant::now() < deadline => {
                    let result = ctx.process_event(worker_id, client, event, deadline).await;
                    if !ctx.settle(&result).await {
                        unsettled.fetch_add(1, Ordering::SeqCst);
                    }
                    result
                }
                _ => EventResult::leftover(event, worker_id),
            };
            // Receiver outlives every bucket; a send error means nobody is listening.
            let _ = tx.send(result);
        }
    });
    join_all(tasks).await;

    debug!(worker_id = %worker_id, events = total, "Bucket finished");
}

impl BucketContext {
    async fn process_event(
        &self,
        worker_id: WorkerId,
        client: &dyn DownstreamClient,
        event: Event,
        deadline: Instant,
    ) -> EventResult {
        let started = Instant::now();
        let mut endpoints = Vec::with_capacity(event.classes.len());

        for class in event.classes.clone() {
            let endpoint = self.cost.endpoint_for(class, worker_id).to_string();

            // An event that made its first call runs to completion.
            let waited = if endpoints.is_empty() {
                match self.limiter.acquire_before(class, &endpoint, deadline).await {
                    Some(waited) => waited,
                    None => {
                        debug!(
                            event_id = %event.id,
                            worker_id = %worker_id,
                            class = %class,
                            endpoint = %endpoint,
                            "No rate-limit slot before the deadline; leaving event over"
                        );
                        return EventResult::leftover(event, worker_id);
                    }
                }
            } else {
                self.limiter.acquire(class, &endpoint).await
            };
            self.metrics
                .record_rate_limit_wait(class.as_str(), waited.as_secs_f64());

            let call_started = Instant::now();
            let outcome = match tokio::time::timeout(
                self.config.call_timeout,
                client.call(class, &endpoint, &event),
            )
            .await
            {
                Ok(outcome) => outcome,
                Err(_) => Err(CallError::Timeout(self.config.call_timeout)),
            };
            self.metrics.record_call(
                class.as_str(),
                outcome.is_ok(),
                call_started.elapsed().as_secs_f64(),
            );
            endpoints.push(endpoint.clone());

            if let Err(e) = outcome {
                let category = e.category();
                let reason = format!("{class} via {endpoint}: {e}");
                debug!(
                    event_id = %event.id,
                    worker_id = %worker_id,
                    class = %class,
                    %category,
                    "Downstream call failed"
                );
                let outcome = if self.retry.is_retryable(category) {
                    EventOutcome::Retryable { reason, category }
                } else {
                    EventOutcome::Failed { reason, category }
                };
                return EventResult {
                    event,
                    worker_id,
                    outcome,
                    endpoints,
                    duration_ms: started.elapsed().as_millis() as u64,
                };
            }
        }

        EventResult {
            event,
            worker_id,
            outcome: EventOutcome::Completed,
            endpoints,
            duration_ms: started.elapsed().as_millis() as u64,
        }
    }

    /// Records terminal outcomes in the queue store. Returns false when the
    /// store did not take the outcome.
    ///
    /// Store failures are logged with the full event so it can be replayed
    /// by hand; the in-memory result still counts and the event stays in
    /// flight for recovery.
    async fn settle(&self, result: &EventResult) -> bool {
        let outcome = match &result.outcome {
            EventOutcome::Completed => self.queue.move_to_completed(&result.event).await,
            EventOutcome::Failed { reason, .. } => {
                self.queue.move_to_failed(&result.event, reason).await
            }
            EventOutcome::Retryable { .. } | EventOutcome::Leftover => return true,
        };

        match outcome {
            Ok(()) => true,
            Err(e) => {
                let payload = serde_json::to_string(&result.event).unwrap_or_default();
                error!(
                    event_id = %result.event.id,
                    outcome = result.outcome.label(),
                    error = %e,
                    event = %payload,
                    "Failed to record event outcome in queue store"
                );
                false
            }
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
    use crate::scheduler::planner::CapacityPlanner;
    use crate::scheduler::queue::QueueName;
    use async_trait::async_trait;
    use std::collections::HashMap;

    fn events(n: usize, class: EventClass) -> Vec<Event> {
        (0..n)
            .map(|i| {
                Event::new(format!("wallet_{i:03}"), vec![class])
                    .unwrap()
                    .with_id(format!("e{i:03}"))
            })
            .collect()
    }

    fn plan_for(events: Vec<Event>, workers: u32) -> ProcessingPlan {
        let mut assignments: BTreeMap<WorkerId, Vec<Event>> =
            (1..=workers).map(|id| (id, Vec::new())).collect();
        for (i, event) in events.into_iter().enumerate() {
            assignments
                .entry(i as u32 % workers + 1)
                .or_default()
                .push(event);
        }
        ProcessingPlan {
            required_workers: workers,
            assignments,
            ..ProcessingPlan::empty()
        }
    }

    async fn claimed_queue(events: &[Event]) -> Arc<MemoryEventQueue> {
        let queue = Arc::new(MemoryEventQueue::new());
        queue.push_batch(QueueName::InFlight, events).await.unwrap();
        queue
    }

    fn executor(queue: Arc<MemoryEventQueue>, config: ExecutorConfig) -> Executor {
        Executor::new(
            queue,
            Arc::new(CostModel::reference()),
            RetryPolicy::default(),
            config,
        )
    }

    /// Units `1..=count`, all backed by `client`.
    fn units(client: Arc<dyn DownstreamClient>, count: u32) -> UnitClients {
        (1..=count).map(|id| (id, Arc::clone(&client))).collect()
    }

    fn simulated(failures: FailurePolicy) -> Arc<SimulatedDownstream> {
        Arc::new(
            SimulatedDownstream::new(Arc::new(CostModel::reference())).with_failures(failures),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_all_events_complete() {
        let batch = events(6, EventClass::NewBalanceUpdate);
        let queue = claimed_queue(&batch).await;
        let executor = executor(Arc::clone(&queue), ExecutorConfig::default());

        let report = executor
            .execute(
                &plan_for(batch, 2),
                &units(simulated(FailurePolicy::None), 2),
                Duration::from_secs(60),
            )
            .await;

        assert_eq!(report.dispatched, 6);
        assert_eq!(report.processed, 6);
        assert_eq!(report.failed, 0);
        assert_eq!(report.leftover, 0);
        assert_eq!(queue.completed_ids().len(), 6);
        assert_eq!(queue.length(QueueName::InFlight).await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_overflow_endpoint_per_worker() {
        let batch = events(3, EventClass::OpenOrderDetected);
        let queue = claimed_queue(&batch).await;
        let executor = executor(queue, ExecutorConfig::default());

        let report = executor
            .execute(
                &plan_for(batch, 3),
                &units(simulated(FailurePolicy::None), 3),
                Duration::from_secs(60),
            )
            .await;

        let mut used: Vec<(WorkerId, String)> = report
            .results
            .iter()
            .map(|r| (r.worker_id, r.endpoints[0].clone()))
            .collect();
        used.sort();
        assert_eq!(
            used,
            vec![
                (1, "orders-a".to_string()),
                (2, "orders-c".to_string()),
                (3, "orders-b".to_string()),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_failures_are_classified() {
        let batch = events(3, EventClass::NewBalanceUpdate);
        let queue = claimed_queue(&batch).await;
        let failures = FailurePolicy::Subjects(HashMap::from([
            ("wallet_000".to_string(), ErrorCategory::Validation),
            ("wallet_001".to_string(), ErrorCategory::Transient),
        ]));
        let executor = executor(Arc::clone(&queue), ExecutorConfig::default());

        let report = executor
            .execute(
                &plan_for(batch, 1),
                &units(simulated(failures), 1),
                Duration::from_secs(60),
            )
            .await;

        assert_eq!(report.processed, 1);
        assert_eq!(report.failed, 2);
        assert_eq!(report.permanently_failed(), 1);
        assert_eq!(report.retryable().count(), 1);

        // Non-retryable goes to failed, retryable stays in flight for the loop.
        let failed = queue.peek_failed(10).await.unwrap();
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].event_id, "e000");
        assert_eq!(queue.length(QueueName::InFlight).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_events_not_started_before_deadline_are_leftover() {
        let batch = events(10, EventClass::NewBalanceUpdate);
        let queue = claimed_queue(&batch).await;
        let executor = executor(
            queue,
            ExecutorConfig {
                in_worker_concurrency: 1,
                ..Default::default()
            },
        );

        // 3000 ms per event, one at a time: starts at 0, 3, 6 and 9 seconds.
        let report = executor
            .execute(
                &plan_for(batch, 1),
                &units(simulated(FailurePolicy::None), 1),
                Duration::from_secs(10),
            )
            .await;

        assert_eq!(report.processed, 4);
        assert_eq!(report.leftover, 6);
        assert_eq!(report.leftover_events().count(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_call_timeout_is_retryable() {
        let batch = events(1, EventClass::RebalanceNeeded);
        let queue = claimed_queue(&batch).await;
        let executor = executor(
            queue,
            ExecutorConfig {
                call_timeout: Duration::from_secs(1),
                ..Default::default()
            },
        );

        let report = executor
            .execute(
                &plan_for(batch, 1),
                &units(simulated(FailurePolicy::None), 1),
                Duration::from_secs(60),
            )
            .await;

        let result = report.retryable().next().expect("retryable result");
        assert!(matches!(
            result.outcome,
            EventOutcome::Retryable {
                category: ErrorCategory::Timeout,
                ..
            }
        ));
    }

    struct PanickingDownstream;

    #[async_trait]
    impl DownstreamClient for PanickingDownstream {
        async fn call(
            &self,
            _class: EventClass,
            _endpoint: &str,
            event: &Event,
        ) -> Result<(), CallError> {
            if event.subject == "boom" {
                panic!("downstream client bug");
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_crashed_bucket_does_not_affect_siblings() {
        let ok1 = Event::new("ok1", vec![EventClass::NewBalanceUpdate]).unwrap();
        let boom = Event::new("boom", vec![EventClass::NewBalanceUpdate]).unwrap();
        let ok2 = Event::new("ok2", vec![EventClass::NewBalanceUpdate]).unwrap();

        let plan = ProcessingPlan {
            required_workers: 2,
            assignments: BTreeMap::from([
                (1, vec![ok1.clone(), boom.clone()]),
                (2, vec![ok2.clone()]),
            ]),
            ..ProcessingPlan::empty()
        };

        let queue = claimed_queue(&[ok1, boom.clone(), ok2]).await;
        let executor = executor(
            queue,
            ExecutorConfig {
                in_worker_concurrency: 1,
                ..Default::default()
            },
        );

        let report = executor
            .execute(&plan, &units(Arc::new(PanickingDownstream), 2), Duration::from_secs(60))
            .await;

        assert_eq!(report.dispatched, 3);
        assert_eq!(report.processed, 2);
        assert_eq!(report.leftover, 1);
        let leftover: Vec<&Event> = report.leftover_events().collect();
        assert_eq!(leftover[0].id, boom.id);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reference_batch_respects_rate_limits() {
        let batch = events(108, EventClass::OpenOrderDetected);
        let plan = CapacityPlanner::new(Arc::new(CostModel::reference())).plan(
            batch.clone(),
            Duration::from_millis(180_000),
            0,
            10,
        );
        let queue = claimed_queue(&batch).await;
        let executor = executor(queue, ExecutorConfig::default());

        let started = Instant::now();
        let report = executor
            .execute(
                &plan,
                &units(simulated(FailurePolicy::None), plan.required_workers),
                Duration::from_millis(180_000),
            )
            .await;

        assert_eq!(report.processed, 108);
        assert_eq!(report.leftover, 0);
        // 16 calls per minute per endpoint: the last window opens at 120 s.
        assert!(started.elapsed() >= Duration::from_secs(120));
        assert!(started.elapsed() < Duration::from_secs(180));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_live_units_leaves_whole_plan_over() {
        let batch = events(5, EventClass::NewBalanceUpdate);
        let queue = claimed_queue(&batch).await;
        let executor = executor(Arc::clone(&queue), ExecutorConfig::default());

        let report = executor
            .execute(&plan_for(batch, 2), &UnitClients::new(), Duration::from_secs(60))
            .await;

        assert_eq!(report.dispatched, 5);
        assert_eq!(report.processed, 0);
        assert_eq!(report.failed, 0);
        assert_eq!(report.leftover, 5);
        assert_eq!(report.leftover_events().count(), 5);
        assert!(queue.completed_ids().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_buckets_of_missing_units_go_to_live_ones() {
        let batch = events(6, EventClass::NewBalanceUpdate);
        let queue = claimed_queue(&batch).await;
        let executor = executor(Arc::clone(&queue), ExecutorConfig::default());
        let downstream = simulated(FailurePolicy::None);

        // Planned for three workers; only worker 2 is up.
        let live: UnitClients =
            BTreeMap::from([(2, Arc::clone(&downstream) as Arc<dyn DownstreamClient>)]);
        let report = executor
            .execute(&plan_for(batch, 3), &live, Duration::from_secs(60))
            .await;

        assert_eq!(report.processed, 6);
        assert!(report.results.iter().all(|r| r.worker_id == 2));
        assert_eq!(downstream.call_count(), 6);
    }

    #[tokio::test(start_paused = true)]
    async fn test_event_waiting_for_rate_slot_past_deadline_is_leftover() {
        // balance-check-a allows 80 calls a minute and has no overflow endpoint.
        let batch = events(81, EventClass::BalanceCheckRequired);
        let queue = claimed_queue(&batch).await;
        let executor = executor(
            Arc::clone(&queue),
            ExecutorConfig {
                in_worker_concurrency: 100,
                ..Default::default()
            },
        );
        let downstream = simulated(FailurePolicy::None);

        let started = Instant::now();
        let report = executor
            .execute(
                &plan_for(batch, 1),
                &units(Arc::clone(&downstream) as Arc<dyn DownstreamClient>, 1),
                Duration::from_secs(30),
            )
            .await;

        assert_eq!(report.processed, 80);
        assert_eq!(report.leftover, 1);
        assert_eq!(downstream.call_count(), 80);
        // Held to the deadline, not to the 60 s window.
        assert!(started.elapsed() >= Duration::from_secs(30));
        assert!(started.elapsed() < Duration::from_secs(31));
    }

    struct UnavailableAfterCall {
        inner: Arc<SimulatedDownstream>,
        queue: Arc<MemoryEventQueue>,
    }

    #[async_trait]
    impl DownstreamClient for UnavailableAfterCall {
        async fn call(&self, class: EventClass, endpoint: &str, event: &Event) -> Result<(), CallError> {
            let outcome = self.inner.call(class, endpoint, event).await;
            self.queue.set_available(false);
            outcome
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unrecorded_outcomes_are_counted_and_stay_in_flight() {
        let batch = events(3, EventClass::NewBalanceUpdate);
        let queue = claimed_queue(&batch).await;
        let executor = executor(Arc::clone(&queue), ExecutorConfig::default());
        let client = Arc::new(UnavailableAfterCall {
            inner: simulated(FailurePolicy::None),
            queue: Arc::clone(&queue),
        });

        let report = executor
            .execute(&plan_for(batch, 1), &units(client, 1), Duration::from_secs(60))
            .await;

        assert_eq!(report.processed, 3);
        assert_eq!(report.unsettled, 3);

        queue.set_available(true);
        assert_eq!(queue.length(QueueName::InFlight).await.unwrap(), 3);
        assert!(queue.completed_ids().is_empty());
    }
}
