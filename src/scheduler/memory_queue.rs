//! In-process event queue.
//!
//! Same contract as the Redis adapter, backed by a mutex-guarded set of
//! deques. Used by tests; `set_available` simulates a store outage.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::event::Event;
use super::queue::{
    EventQueue, FailedEntry, HealthReport, HealthStatus, QueueError, QueueName, RecoveryReport,
};

#[derive(Debug, Default)]
struct Inner {
    /// Front is the head (next to be claimed).
    pending: VecDeque<Event>,
    in_flight: Vec<Event>,
    /// Front is the newest entry.
    failed: VecDeque<FailedEntry>,
    failed_ids: HashSet<String>,
    completed: HashSet<String>,
}

impl Inner {
    fn remove_in_flight(&mut self, id: &str) -> bool {
        match self.in_flight.iter().position(|e| e.id == id) {
            Some(index) => {
                self.in_flight.remove(index);
                true
            }
            None => false,
        }
    }

    fn park(&mut self, entry: FailedEntry) -> bool {
        if self.failed_ids.insert(entry.event_id.clone()) {
            self.failed.push_front(entry);
            true
        } else {
            false
        }
    }
}

/// Queue store kept entirely in memory.
#[derive(Debug)]
pub struct MemoryEventQueue {
    inner: Mutex<Inner>,
    available: AtomicBool,
}

impl Default for MemoryEventQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryEventQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Toggles simulated availability. While unavailable every operation
    /// fails with `QueueError::Unavailable`.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Ids marked completed so far.
    pub fn completed_ids(&self) -> Vec<String> {
        let inner = self.lock();
        let mut ids: Vec<String> = inner.completed.iter().cloned().collect();
        ids.sort();
        ids
    }

    /// Appends a raw payload to pending, bypassing serialization.
    ///
    /// The memory store holds typed events, so a raw payload that does not
    /// parse is parked right away the way a claim would park it.
    pub fn push_raw(&self, raw: &str) -> Result<(), QueueError> {
        self.check()?;
        let mut inner = self.lock();
        match serde_json::from_str::<Event>(raw) {
            Ok(event) => inner.pending.push_back(event),
            Err(e) => {
                inner.park(FailedEntry::for_raw(raw, &format!("malformed payload: {e}")));
            }
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        // A poisoned lock only means a test panicked mid-operation; the data
        // is still structurally valid.
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check(&self) -> Result<(), QueueError> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(QueueError::Unavailable("memory store offline".to_string()))
        }
    }
}

#[async_trait]
impl EventQueue for MemoryEventQueue {
    async fn push(&self, queue: QueueName, event: &Event) -> Result<(), QueueError> {
        self.push_batch(queue, std::slice::from_ref(event)).await
    }

    async fn push_batch(&self, queue: QueueName, events: &[Event]) -> Result<(), QueueError> {
        self.check()?;
        let mut inner = self.lock();
        for event in events {
            match queue {
                QueueName::Pending => inner.pending.push_back(event.clone()),
                QueueName::InFlight => inner.in_flight.push(event.clone()),
                QueueName::Failed => {
                    inner.park(FailedEntry::for_event(event, "pushed to failed queue")?);
                }
            }
        }
        Ok(())
    }

    async fn pop_one(&self, queue: QueueName) -> Result<Option<Event>, QueueError> {
        self.check()?;
        let mut inner = self.lock();
        Ok(match queue {
            QueueName::Pending => inner.pending.pop_front(),
            QueueName::InFlight => {
                if inner.in_flight.is_empty() {
                    None
                } else {
                    Some(inner.in_flight.remove(0))
                }
            }
            QueueName::Failed => loop {
                let Some(entry) = inner.failed.pop_back() else {
                    break None;
                };
                inner.failed_ids.remove(&entry.event_id);
                if let Some(event) = entry.event() {
                    break Some(event);
                }
            },
        })
    }

    async fn claim_next(&self) -> Result<Option<Event>, QueueError> {
        self.check()?;
        let mut inner = self.lock();
        while let Some(event) = inner.pending.pop_front() {
            match event.validate() {
                Ok(()) => {
                    inner.in_flight.push(event.clone());
                    return Ok(Some(event));
                }
                Err(e) => {
                    let entry = FailedEntry::for_event(&event, &format!("malformed event: {e}"))?;
                    inner.park(entry);
                }
            }
        }
        Ok(None)
    }

    async fn length(&self, queue: QueueName) -> Result<usize, QueueError> {
        self.check()?;
        let inner = self.lock();
        Ok(match queue {
            QueueName::Pending => inner.pending.len(),
            QueueName::InFlight => inner.in_flight.len(),
            QueueName::Failed => inner.failed.len(),
        })
    }

    async fn move_to_in_flight(&self, event: &Event) -> Result<(), QueueError> {
        self.check()?;
        let mut inner = self.lock();
        if !inner.in_flight.iter().any(|e| e.id == event.id) {
            inner.in_flight.push(event.clone());
        }
        Ok(())
    }

    async fn move_to_completed(&self, event: &Event) -> Result<(), QueueError> {
        self.check()?;
        let mut inner = self.lock();
        inner.remove_in_flight(&event.id);
        inner.completed.insert(event.id.clone());
        Ok(())
    }

    async fn move_to_failed(&self, event: &Event, reason: &str) -> Result<(), QueueError> {
        self.check()?;
        let entry = FailedEntry::for_event(event, reason)?;
        let mut inner = self.lock();
        inner.remove_in_flight(&event.id);
        inner.park(entry);
        Ok(())
    }

    async fn requeue(&self, event: &Event) -> Result<bool, QueueError> {
        self.check()?;
        let mut inner = self.lock();
        inner.remove_in_flight(&event.id);
        if inner.completed.contains(&event.id) {
            return Ok(false);
        }
        inner.pending.push_front(event.clone());
        Ok(true)
    }

    async fn recover_in_flight(&self, max_retries: u32) -> Result<RecoveryReport, QueueError> {
        self.check()?;
        let mut inner = self.lock();
        let mut report = RecoveryReport::default();

        let orphans = std::mem::take(&mut inner.in_flight);
        for event in orphans {
            if inner.completed.contains(&event.id) {
                continue;
            }
            if event.can_retry(max_retries) {
                inner.pending.push_front(event.next_attempt());
                report.requeued += 1;
            } else {
                let entry = FailedEntry::for_event(
                    &event,
                    "recovered from in-flight after retry budget exhausted",
                )?;
                inner.park(entry);
                report.parked += 1;
            }
        }

        Ok(report)
    }

    async fn scan(&self, queue: QueueName, limit: usize) -> Result<Vec<Event>, QueueError> {
        self.check()?;
        let inner = self.lock();
        Ok(match queue {
            QueueName::Pending => inner.pending.iter().take(limit).cloned().collect(),
            QueueName::InFlight => inner.in_flight.iter().take(limit).cloned().collect(),
            QueueName::Failed => inner
                .failed
                .iter()
                .take(limit)
                .filter_map(FailedEntry::event)
                .collect(),
        })
    }

    async fn peek_failed(&self, limit: usize) -> Result<Vec<FailedEntry>, QueueError> {
        self.check()?;
        let inner = self.lock();
        Ok(inner.failed.iter().take(limit).cloned().collect())
    }

    async fn health_check(&self) -> HealthReport {
        if self.available.load(Ordering::SeqCst) {
            HealthReport::healthy("memory store")
        } else {
            HealthReport {
                status: HealthStatus::Disconnected,
                message: "memory store offline".to_string(),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::event::EventClass;

    fn event(subject: &str) -> Event {
        Event::new(subject, vec![EventClass::NewBalanceUpdate]).unwrap()
    }

    #[tokio::test]
    async fn test_fifo_claim_moves_to_in_flight() {
        let queue = MemoryEventQueue::new();
        let a = event("a");
        let b = event("b");
        queue
            .push_batch(QueueName::Pending, &[a.clone(), b.clone()])
            .await
            .unwrap();

        let claimed = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(claimed.id, a.id);

        let snapshot = queue.snapshot().await.unwrap();
        assert_eq!(snapshot.pending, 1);
        assert_eq!(snapshot.in_flight, 1);
    }

    #[tokio::test]
    async fn test_move_to_failed_is_idempotent() {
        let queue = MemoryEventQueue::new();
        let e = event("a");
        queue.push(QueueName::Pending, &e).await.unwrap();
        let claimed = queue.claim_next().await.unwrap().unwrap();

        queue.move_to_failed(&claimed, "validation").await.unwrap();
        queue.move_to_failed(&claimed, "validation").await.unwrap();

        assert_eq!(queue.length(QueueName::Failed).await.unwrap(), 1);
        assert_eq!(queue.length(QueueName::InFlight).await.unwrap(), 0);
        let failed = queue.peek_failed(10).await.unwrap();
        assert_eq!(failed[0].reason, "validation");
    }

    #[tokio::test]
    async fn test_completed_events_are_never_requeued() {
        let queue = MemoryEventQueue::new();
        let e = event("a");
        queue.push(QueueName::Pending, &e).await.unwrap();
        let claimed = queue.claim_next().await.unwrap().unwrap();

        queue.move_to_completed(&claimed).await.unwrap();
        queue.move_to_completed(&claimed).await.unwrap();
        assert!(!queue.requeue(&claimed).await.unwrap());

        let snapshot = queue.snapshot().await.unwrap();
        assert!(snapshot.is_drained());
        assert_eq!(queue.completed_ids(), vec![e.id]);
    }

    #[tokio::test]
    async fn test_pop_then_mark_in_flight_is_idempotent() {
        let queue = MemoryEventQueue::new();
        let a = event("a");
        let b = event("b");
        queue.push_batch(QueueName::Pending, &[a.clone(), b.clone()]).await.unwrap();

        let popped = queue.pop_one(QueueName::Pending).await.unwrap().unwrap();
        assert_eq!(popped.id, a.id);
        queue.move_to_in_flight(&popped).await.unwrap();
        queue.move_to_in_flight(&popped).await.unwrap();

        let in_flight = queue.scan(QueueName::InFlight, 10).await.unwrap();
        assert_eq!(in_flight.len(), 1);
        assert_eq!(in_flight[0].id, a.id);

        let pending = queue.scan(QueueName::Pending, 10).await.unwrap();
        assert_eq!(pending.iter().map(|e| &e.id).collect::<Vec<_>>(), vec![&b.id]);
    }

    #[tokio::test]
    async fn test_requeue_puts_event_at_head() {
        let queue = MemoryEventQueue::new();
        let a = event("a");
        let b = event("b");
        queue.push(QueueName::Pending, &a).await.unwrap();
        queue.push(QueueName::Pending, &b).await.unwrap();

        let claimed = queue.claim_next().await.unwrap().unwrap();
        assert!(queue.requeue(&claimed.next_attempt()).await.unwrap());

        let head = queue.claim_next().await.unwrap().unwrap();
        assert_eq!(head.id, a.id);
        assert_eq!(head.retry_count, 1);
    }

    #[tokio::test]
    async fn test_recover_in_flight_respects_retry_budget() {
        let queue = MemoryEventQueue::new();
        let fresh = event("fresh");
        let mut spent = event("spent");
        spent.retry_count = 3;
        queue
            .push_batch(QueueName::InFlight, &[fresh.clone(), spent.clone()])
            .await
            .unwrap();

        let report = queue.recover_in_flight(3).await.unwrap();
        assert_eq!(report.requeued, 1);
        assert_eq!(report.parked, 1);

        let recovered = queue.pop_one(QueueName::Pending).await.unwrap().unwrap();
        assert_eq!(recovered.id, fresh.id);
        assert_eq!(recovered.retry_count, 1);
        assert_eq!(queue.length(QueueName::Failed).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_parked() {
        let queue = MemoryEventQueue::new();
        queue.push_raw("{\"garbage\": true}").unwrap();

        assert!(queue.claim_next().await.unwrap().is_none());
        let failed = queue.peek_failed(1).await.unwrap();
        assert!(failed[0].reason.starts_with("malformed"));
    }

    #[tokio::test]
    async fn test_unavailable_store_fails_operations() {
        let queue = MemoryEventQueue::new();
        queue.set_available(false);

        assert!(matches!(
            queue.snapshot().await,
            Err(QueueError::Unavailable(_))
        ));
        assert_eq!(
            queue.health_check().await.status,
            HealthStatus::Disconnected
        );

        queue.set_available(true);
        assert!(queue.health_check().await.is_healthy());
    }

    #[tokio::test]
    async fn test_replay_from_failed() {
        let queue = MemoryEventQueue::new();
        let e = event("a");
        queue.push(QueueName::Failed, &e).await.unwrap();

        let replayed = queue.pop_one(QueueName::Failed).await.unwrap().unwrap();
        assert_eq!(replayed.id, e.id);
        assert_eq!(queue.length(QueueName::Failed).await.unwrap(), 0);

        // The id may be parked again after a replay.
        queue.move_to_failed(&e, "again").await.unwrap();
        assert_eq!(queue.length(QueueName::Failed).await.unwrap(), 1);
    }
}
