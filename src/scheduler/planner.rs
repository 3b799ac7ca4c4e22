//! Capacity planning.
//!
//! Turns a batch of claimed events into a worker count and a per-worker
//! assignment. The planner is pure: identical input gives an identical plan.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use super::cost::{CostModel, DEFAULT_LATENCY_MS};
use super::event::{Event, WorkerId};

/// Output of one planning pass.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessingPlan {
    /// Workers to run, in `[0, max_workers]`. Zero only for an empty batch.
    pub required_workers: u32,
    /// Projected time to finish the batch with `required_workers`.
    pub estimated_completion_ms: u64,
    /// Events per worker id. Every id in `1..=required_workers` has an entry.
    pub assignments: BTreeMap<WorkerId, Vec<Event>>,
    /// Whether the deadline is reachable within `max_workers`.
    pub feasible: bool,
    /// Worker count before clamping.
    pub unclamped_workers: u64,
    /// Workers the rate limits of the present classes can keep busy.
    pub rate_ceiling: Option<u32>,
    /// Mean latency over every (event, class) pair.
    pub avg_latency_ms: u64,
}

impl ProcessingPlan {
    /// Plan for an empty queue with nothing left over.
    pub fn empty() -> Self {
        Self {
            required_workers: 0,
            estimated_completion_ms: 0,
            assignments: BTreeMap::new(),
            feasible: true,
            unclamped_workers: 0,
            rate_ceiling: None,
            avg_latency_ms: DEFAULT_LATENCY_MS,
        }
    }

    /// Returns whether the plan signals there is nothing to do.
    pub fn is_terminal(&self) -> bool {
        self.required_workers == 0
    }

    /// Number of events assigned across all workers.
    pub fn event_count(&self) -> usize {
        self.assignments.values().map(Vec::len).sum()
    }
}

/// Computes processing plans from the cost model.
#[derive(Debug, Clone)]
pub struct CapacityPlanner {
    cost: Arc<CostModel>,
    enforce_rate_ceiling: bool,
}

impl CapacityPlanner {
    pub fn new(cost: Arc<CostModel>) -> Self {
        Self {
            cost,
            enforce_rate_ceiling: false,
        }
    }

    /// Makes the rate ceiling a hard clamp instead of an advisory figure.
    pub fn with_enforced_rate_ceiling(mut self, enforce: bool) -> Self {
        self.enforce_rate_ceiling = enforce;
        self
    }

    /// Plans a batch.
    ///
    /// `leftover_count` is the number of events the previous cycle did not
    /// finish; it adds to demand even though those events are already back
    /// in `events`.
    pub fn plan(
        &self,
        events: Vec<Event>,
        deadline: Duration,
        leftover_count: usize,
        max_workers: u32,
    ) -> ProcessingPlan {
        if events.is_empty() && leftover_count == 0 {
            return ProcessingPlan::empty();
        }

        let avg_latency_ms = self.average_latency_ms(&events);
        let deadline_ms = (deadline.as_millis() as u128).max(1);
        let demand = (events.len() + leftover_count) as u128;
        let total_work_ms = demand * avg_latency_ms as u128;

        let unclamped = total_work_ms.div_ceil(deadline_ms).max(1);
        let unclamped_workers = u64::try_from(unclamped).unwrap_or(u64::MAX);
        let rate_ceiling = self.rate_ceiling(&events);

        let max_workers = max_workers.max(1);
        let mut limit = max_workers;
        if self.enforce_rate_ceiling {
            if let Some(ceiling) = rate_ceiling {
                limit = limit.min(ceiling.max(1));
            }
        }

        let required_workers = unclamped.min(limit as u128) as u32;
        let feasible = unclamped <= limit as u128;

        if !feasible {
            warn!(
                unclamped_workers,
                max_workers = limit,
                events = events.len(),
                leftover = leftover_count,
                "Deadline not reachable within worker limit; running degraded"
            );
        }
        if let Some(ceiling) = rate_ceiling {
            if !self.enforce_rate_ceiling && required_workers > ceiling {
                warn!(
                    required_workers,
                    rate_ceiling = ceiling,
                    "Worker count exceeds what downstream rate limits can keep busy"
                );
            }
        }

        let estimated_completion_ms =
            u64::try_from(total_work_ms.div_ceil(required_workers as u128)).unwrap_or(u64::MAX);
        let assignments = partition(events, required_workers);

        debug!(
            required_workers,
            avg_latency_ms,
            estimated_completion_ms,
            feasible,
            "Computed processing plan"
        );

        ProcessingPlan {
            required_workers,
            estimated_completion_ms,
            assignments,
            feasible,
            unclamped_workers,
            rate_ceiling,
            avg_latency_ms,
        }
    }

    fn average_latency_ms(&self, events: &[Event]) -> u64 {
        let (sum, pairs) = events
            .iter()
            .flat_map(|event| event.classes.iter())
            .fold((0u64, 0u64), |(sum, pairs), class| {
                (sum + self.cost.profile(*class).expected_latency_ms, pairs + 1)
            });

        if pairs == 0 {
            DEFAULT_LATENCY_MS
        } else {
            sum / pairs
        }
    }

    fn rate_ceiling(&self, events: &[Event]) -> Option<u32> {
        events
            .iter()
            .flat_map(|event| event.classes.iter())
            .map(|class| self.cost.rate_ceiling(*class))
            .min()
    }
}

/// Distributes events round-robin over workers `1..=workers`.
///
/// Events are grouped by their highest-priority class and the groups are
/// visited in declared class order. The cursor carries over between groups,
/// so bucket sizes differ by at most one.
fn partition(mut events: Vec<Event>, workers: u32) -> BTreeMap<WorkerId, Vec<Event>> {
    let mut assignments: BTreeMap<WorkerId, Vec<Event>> =
        (1..=workers).map(|id| (id, Vec::new())).collect();
    if workers == 0 {
        return assignments;
    }

    // Stable sort keeps arrival order inside a class group.
    events.sort_by_key(|event| {
        event
            .primary_class()
            .map(|class| class as usize)
            .unwrap_or(usize::MAX)
    });

    for (cursor, event) in events.into_iter().enumerate() {
        let worker_id = (cursor as u32 % workers) + 1;
        assignments.entry(worker_id).or_default().push(event);
    }

    assignments
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::event::EventClass;
    use std::collections::HashSet;

    fn planner() -> CapacityPlanner {
        CapacityPlanner::new(Arc::new(CostModel::reference()))
    }

    fn events(n: usize, classes: &[EventClass]) -> Vec<Event> {
        (0..n)
            .map(|i| {
                Event::new(format!("wallet_{i:03}"), classes.to_vec())
                    .unwrap()
                    .with_id(format!("e{i:03}"))
            })
            .collect()
    }

    fn mixed(n: usize) -> Vec<Event> {
        (0..n)
            .map(|i| {
                let class = EventClass::ALL[i % EventClass::ALL.len()];
                Event::new(format!("wallet_{i:03}"), vec![class])
                    .unwrap()
                    .with_id(format!("m{i:03}"))
            })
            .collect()
    }

    #[test]
    fn test_empty_batch_is_terminal() {
        let plan = planner().plan(Vec::new(), Duration::from_secs(180), 0, 10);
        assert_eq!(plan.required_workers, 0);
        assert!(plan.feasible);
        assert!(plan.is_terminal());
        assert!(plan.assignments.is_empty());
    }

    #[test]
    fn test_reference_sizing() {
        let batch = events(108, &[EventClass::OpenOrderDetected]);
        let plan = planner().plan(batch, Duration::from_millis(180_000), 0, 10);

        assert_eq!(plan.avg_latency_ms, 5000);
        assert_eq!(plan.required_workers, 3);
        assert_eq!(plan.estimated_completion_ms, 180_000);
        assert_eq!(plan.rate_ceiling, Some(4));
        assert!(plan.feasible);
        assert!(plan.assignments.values().all(|bucket| bucket.len() == 36));
    }

    #[test]
    fn test_infeasible_plan_is_clamped() {
        let batch = events(200, &[EventClass::OpenOrderDetected]);
        let plan = planner().plan(batch, Duration::from_millis(30_000), 0, 20);

        assert_eq!(plan.unclamped_workers, 34);
        assert_eq!(plan.required_workers, 20);
        assert!(!plan.feasible);
        assert_eq!(plan.event_count(), 200);
    }

    #[test]
    fn test_required_workers_within_bounds() {
        let planner = planner();
        for n in [1usize, 2, 7, 50, 333] {
            for max in [1u32, 3, 16] {
                let plan = planner.plan(mixed(n), Duration::from_secs(10), 0, max);
                assert!(plan.required_workers >= 1);
                assert!(plan.required_workers <= max);
            }
        }
    }

    #[test]
    fn test_leftover_adds_demand() {
        let planner = planner();
        let batch = events(36, &[EventClass::OpenOrderDetected]);

        let base = planner.plan(batch.clone(), Duration::from_millis(180_000), 0, 10);
        let with_leftover = planner.plan(batch, Duration::from_millis(180_000), 72, 10);

        assert_eq!(base.required_workers, 1);
        assert_eq!(with_leftover.required_workers, 3);
    }

    #[test]
    fn test_leftover_only_uses_default_latency() {
        let plan = planner().plan(Vec::new(), Duration::from_millis(10_000), 4, 10);
        assert_eq!(plan.avg_latency_ms, DEFAULT_LATENCY_MS);
        assert_eq!(plan.required_workers, 2);
        assert_eq!(plan.rate_ceiling, None);
    }

    #[test]
    fn test_average_latency_over_class_pairs() {
        let mut batch = events(1, &[EventClass::RebalanceNeeded]);
        batch.extend(events(1, &[EventClass::NewBalanceUpdate, EventClass::BalanceCheckRequired]));
        let plan = planner().plan(batch, Duration::from_secs(60), 0, 10);
        // (8000 + 3000 + 3000) / 3
        assert_eq!(plan.avg_latency_ms, 4666);
    }

    #[test]
    fn test_partition_is_deterministic() {
        let planner = planner();
        let a = planner.plan(mixed(47), Duration::from_secs(20), 0, 8);
        let b = planner.plan(mixed(47), Duration::from_secs(20), 0, 8);
        assert_eq!(a.assignments, b.assignments);
    }

    #[test]
    fn test_partition_no_loss_no_duplication() {
        let batch = mixed(101);
        let expected: HashSet<String> = batch.iter().map(|e| e.id.clone()).collect();
        let plan = planner().plan(batch, Duration::from_secs(30), 0, 6);

        let assigned: Vec<String> = plan
            .assignments
            .values()
            .flatten()
            .map(|e| e.id.clone())
            .collect();
        let unique: HashSet<String> = assigned.iter().cloned().collect();

        assert_eq!(assigned.len(), 101);
        assert_eq!(unique, expected);

        let sizes: Vec<usize> = plan.assignments.values().map(Vec::len).collect();
        let max = sizes.iter().max().copied().unwrap_or(0);
        let min = sizes.iter().min().copied().unwrap_or(0);
        assert!(max - min <= 1, "bucket sizes {sizes:?}");
    }

    #[test]
    fn test_partition_groups_by_priority_class() {
        let mut batch = events(2, &[EventClass::BalanceCheckRequired]);
        let urgent = Event::new(
            "urgent",
            vec![EventClass::NewBalanceUpdate, EventClass::RebalanceNeeded],
        )
        .unwrap()
        .with_id("urgent");
        batch.push(urgent);

        let plan = planner().plan(batch, Duration::from_millis(1), 0, 3);
        assert_eq!(plan.required_workers, 3);
        // The rebalance group is visited first, so worker 1 gets it.
        assert_eq!(plan.assignments[&1][0].id, "urgent");
        assert_eq!(plan.assignments[&2][0].id, "e000");
        assert_eq!(plan.assignments[&3][0].id, "e001");
    }

    #[test]
    fn test_enforced_rate_ceiling_clamps() {
        let planner = planner().with_enforced_rate_ceiling(true);
        let batch = events(100, &[EventClass::OpenOrderDetected]);
        let plan = planner.plan(batch, Duration::from_secs(60), 0, 20);

        assert_eq!(plan.rate_ceiling, Some(4));
        assert_eq!(plan.required_workers, 4);
        assert!(!plan.feasible);
    }
}
