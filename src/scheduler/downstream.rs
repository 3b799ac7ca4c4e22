//! Downstream wallet API capability.
//!
//! The executor only needs one operation: perform the call for one class of
//! one event against one endpoint. [`SimulatedDownstream`] stands in for the
//! real API by sleeping the class's expected latency.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tracing::debug;

use crate::error::{CallError, ErrorCategory};

use super::cost::CostModel;
use super::event::{Event, EventClass};

/// Performs wallet calls.
#[async_trait]
pub trait DownstreamClient: Send + Sync {
    /// Processes `class` of `event` against `endpoint`.
    async fn call(&self, class: EventClass, endpoint: &str, event: &Event) -> Result<(), CallError>;
}

/// Which simulated calls fail.
#[derive(Debug, Clone, Default)]
pub enum FailurePolicy {
    /// Every call succeeds.
    #[default]
    None,
    /// Calls for the listed subjects fail with the given category.
    Subjects(HashMap<String, ErrorCategory>),
    /// Every `n`-th call (1-based, counted across all calls) fails.
    EveryNth { n: u64, category: ErrorCategory },
}

/// Simulated downstream that sleeps the expected class latency.
pub struct SimulatedDownstream {
    cost: Arc<CostModel>,
    failures: FailurePolicy,
    calls: AtomicU64,
}

impl SimulatedDownstream {
    pub fn new(cost: Arc<CostModel>) -> Self {
        Self {
            cost,
            failures: FailurePolicy::None,
            calls: AtomicU64::new(0),
        }
    }

    /// Sets the failure policy.
    pub fn with_failures(mut self, failures: FailurePolicy) -> Self {
        self.failures = failures;
        self
    }

    /// Total calls made so far.
    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DownstreamClient for SimulatedDownstream {
    async fn call(&self, class: EventClass, endpoint: &str, event: &Event) -> Result<(), CallError> {
        let seq = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        tokio::time::sleep(self.cost.expected_latency(class)).await;

        let failure = match &self.failures {
            FailurePolicy::None => None,
            FailurePolicy::Subjects(subjects) => subjects.get(&event.subject).copied(),
            FailurePolicy::EveryNth { n, category } => {
                (*n > 0 && seq % n == 0).then_some(*category)
            }
        };

        match failure {
            Some(category) => {
                debug!(
                    event_id = %event.id,
                    class = %class,
                    endpoint,
                    %category,
                    "Simulated downstream failure"
                );
                Err(CallError::from_category(
                    category,
                    format!("simulated {category} on {endpoint}"),
                ))
            }
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn event(subject: &str) -> Event {
        Event::new(subject, vec![EventClass::NewBalanceUpdate]).unwrap()
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_call_sleeps_expected_latency() {
        let downstream = SimulatedDownstream::new(Arc::new(CostModel::reference()));
        let start = tokio::time::Instant::now();
        downstream
            .call(EventClass::RebalanceNeeded, "rebalance-a", &event("w"))
            .await
            .unwrap();
        assert_eq!(start.elapsed(), Duration::from_millis(8000));
        assert_eq!(downstream.call_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subject_failures() {
        let downstream = SimulatedDownstream::new(Arc::new(CostModel::reference())).with_failures(
            FailurePolicy::Subjects(HashMap::from([(
                "bad".to_string(),
                ErrorCategory::Validation,
            )])),
        );

        let err = downstream
            .call(EventClass::NewBalanceUpdate, "balances-a", &event("bad"))
            .await
            .unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Validation);
        assert!(downstream
            .call(EventClass::NewBalanceUpdate, "balances-a", &event("good"))
            .await
            .is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_nth_failure() {
        let downstream = SimulatedDownstream::new(Arc::new(CostModel::reference())).with_failures(
            FailurePolicy::EveryNth {
                n: 3,
                category: ErrorCategory::Transient,
            },
        );

        let mut outcomes = Vec::new();
        for _ in 0..6 {
            outcomes.push(
                downstream
                    .call(EventClass::NewBalanceUpdate, "balances-a", &event("w"))
                    .await
                    .is_ok(),
            );
        }
        assert_eq!(outcomes, vec![true, true, false, true, true, false]);
    }
}
