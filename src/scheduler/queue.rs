//! Event queue adapter and its Redis implementation.
//!
//! The control loop only talks to the [`EventQueue`] trait, so tests swap in
//! [`MemoryEventQueue`](super::memory_queue::MemoryEventQueue).
//!
//! # Queue Structure
//!
//! The Redis implementation uses the following keys:
//!
//! - `{ns}:pending`: FIFO list, LPUSH on enqueue and RPOP on dequeue
//! - `{ns}:in_flight`: Events claimed by a cycle (for crash recovery)
//! - `{ns}:failed`: Parked events with their failure reason
//! - `{ns}:failed_ids`: Set guarding `failed` against duplicates
//! - `{ns}:completed`: Set of completed ids, never requeued again
//!
//! # Reliability
//!
//! Events are atomically moved from `pending` to `in_flight` when claimed.
//! Every write-back removes the in-flight entry in the same transaction that
//! adds it to its destination, so a crash leaves an event in exactly one
//! place. Events still in `in_flight` after a crash are recovered on the next
//! start.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use super::event::Event;

/// Completed ids are kept for 7 days.
const COMPLETED_TTL_SECS: i64 = 604_800;

/// Adds to the failed list only if the id was not parked before, and drops
/// the in-flight entry `ARGV[3]` (if any) in the same step.
const PARK_SCRIPT: &str = r#"
if ARGV[3] ~= '' then
  redis.call('LREM', KEYS[3], 1, ARGV[3])
end
if redis.call('SADD', KEYS[1], ARGV[1]) == 1 then
  redis.call('LPUSH', KEYS[2], ARGV[2])
  return 1
end
return 0
"#;

/// Errors that can occur during queue operations.
#[derive(Debug, Error)]
pub enum QueueError {
    /// Failed to connect to the store.
    #[error("Redis connection failed: {0}")]
    ConnectionFailed(String),

    /// Redis operation failed.
    #[error("Redis operation failed: {0}")]
    RedisError(#[from] redis::RedisError),

    /// Failed to serialize or parse event data.
    #[error("Serialization failed: {0}")]
    SerializationFailed(#[from] serde_json::Error),

    /// The store is reachable but refusing work.
    #[error("Queue store unavailable: {0}")]
    Unavailable(String),

    /// Operation timed out.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),
}

/// The three named queues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    Pending,
    InFlight,
    Failed,
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueName::Pending => write!(f, "pending"),
            QueueName::InFlight => write!(f, "in_flight"),
            QueueName::Failed => write!(f, "failed"),
        }
    }
}

/// Queue sizes read at the start of a cycle.
///
/// Producers may append concurrently, so this is a lower-bound estimate.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueSnapshot {
    pub pending: usize,
    pub in_flight: usize,
    pub failed: usize,
}

impl QueueSnapshot {
    /// No pending and no in-flight work.
    pub fn is_drained(&self) -> bool {
        self.pending == 0 && self.in_flight == 0
    }

}

/// An event parked in the failed queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedEntry {
    /// Id of the event, or a placeholder for unparseable payloads.
    pub event_id: String,
    /// The event as JSON, or the raw payload as a string when malformed.
    pub payload: serde_json::Value,
    /// Why the event was parked.
    pub reason: String,
    /// When it was parked.
    pub failed_at: DateTime<Utc>,
}

impl FailedEntry {
    /// Builds an entry for a well-formed event.
    pub fn for_event(event: &Event, reason: &str) -> Result<Self, QueueError> {
        Ok(Self {
            event_id: event.id.clone(),
            payload: serde_json::to_value(event)?,
            reason: reason.to_string(),
            failed_at: Utc::now(),
        })
    }

    /// Builds an entry for a payload that could not be parsed.
    pub fn for_raw(raw: &str, reason: &str) -> Self {
        Self {
            event_id: format!("malformed:{}", short_digest(raw)),
            payload: serde_json::Value::String(raw.to_string()),
            reason: reason.to_string(),
            failed_at: Utc::now(),
        }
    }

    /// Returns the parked event if the payload is a valid event.
    pub fn event(&self) -> Option<Event> {
        serde_json::from_value(self.payload.clone()).ok()
    }
}

/// Result of recovering events left in flight by a previous run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RecoveryReport {
    /// Events moved back to pending with an incremented retry count.
    pub requeued: usize,
    /// Events parked because their retry budget was spent or they were malformed.
    pub parked: usize,
}

/// Health of the queue store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Disconnected,
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "healthy"),
            HealthStatus::Unhealthy => write!(f, "unhealthy"),
            HealthStatus::Disconnected => write!(f, "disconnected"),
        }
    }
}

/// Health check result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub message: String,
}

impl HealthReport {
    pub fn healthy(message: impl Into<String>) -> Self {
        Self {
            status: HealthStatus::Healthy,
            message: message.into(),
        }
    }

    pub fn is_healthy(&self) -> bool {
        self.status == HealthStatus::Healthy
    }
}

/// Contract the control loop needs from the queue store.
///
/// Every `move_*` operation is idempotent from the caller's point of view.
#[async_trait]
pub trait EventQueue: Send + Sync {
    /// Appends an event to the tail of a queue.
    async fn push(&self, queue: QueueName, event: &Event) -> Result<(), QueueError>;

    /// Appends several events in one round trip.
    async fn push_batch(&self, queue: QueueName, events: &[Event]) -> Result<(), QueueError>;

    /// Removes and returns the head of a queue.
    async fn pop_one(&self, queue: QueueName) -> Result<Option<Event>, QueueError>;

    /// Atomically moves the head of `pending` into `in_flight` and returns it.
    ///
    /// Malformed payloads are parked in `failed` and skipped.
    async fn claim_next(&self) -> Result<Option<Event>, QueueError>;

    /// Number of entries in a queue.
    async fn length(&self, queue: QueueName) -> Result<usize, QueueError>;

    /// Reads all three queue lengths.
    async fn snapshot(&self) -> Result<QueueSnapshot, QueueError> {
        Ok(QueueSnapshot {
            pending: self.length(QueueName::Pending).await?,
            in_flight: self.length(QueueName::InFlight).await?,
            failed: self.length(QueueName::Failed).await?,
        })
    }

    /// Records an event as in flight.
    async fn move_to_in_flight(&self, event: &Event) -> Result<(), QueueError>;

    /// Removes an event from flight and marks its id completed.
    async fn move_to_completed(&self, event: &Event) -> Result<(), QueueError>;

    /// Parks an event in the failed queue with a reason.
    async fn move_to_failed(&self, event: &Event, reason: &str) -> Result<(), QueueError>;

    /// Moves an in-flight event back to the head of `pending`.
    ///
    /// Returns `false` without touching the store when the id already
    /// completed.
    async fn requeue(&self, event: &Event) -> Result<bool, QueueError>;

    /// Recovers everything left in `in_flight` by a previous run.
    async fn recover_in_flight(&self, max_retries: u32) -> Result<RecoveryReport, QueueError>;

    /// Lists up to `limit` events of `pending` or `in_flight` without removing them.
    async fn scan(&self, queue: QueueName, limit: usize) -> Result<Vec<Event>, QueueError>;

    /// Lists up to `limit` parked entries, newest first.
    async fn peek_failed(&self, limit: usize) -> Result<Vec<FailedEntry>, QueueError>;

    /// Checks connectivity to the store.
    async fn health_check(&self) -> HealthReport;
}

/// Redis-based event queue.
pub struct RedisEventQueue {
    /// Redis connection manager (handles reconnection automatically).
    redis: ConnectionManager,
    namespace: String,
    pending: String,
    in_flight: String,
    failed: String,
    failed_ids: String,
    completed: String,
}

impl RedisEventQueue {
    /// Connects to Redis and creates the adapter.
    ///
    /// # Arguments
    ///
    /// * `redis_url` - Redis connection URL (e.g., "redis://localhost:6379")
    /// * `namespace` - Prefix for all keys
    ///
    /// # Errors
    ///
    /// Returns `QueueError::ConnectionFailed` if the connection fails.
    pub async fn connect(redis_url: &str, namespace: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        let redis = ConnectionManager::new(client)
            .await
            .map_err(|e| QueueError::ConnectionFailed(e.to_string()))?;

        Ok(Self::from_connection(redis, namespace))
    }

    /// Creates the adapter from an existing ConnectionManager.
    pub fn from_connection(redis: ConnectionManager, namespace: &str) -> Self {
        Self {
            redis,
            namespace: namespace.to_string(),
            pending: format!("{}:pending", namespace),
            in_flight: format!("{}:in_flight", namespace),
            failed: format!("{}:failed", namespace),
            failed_ids: format!("{}:failed_ids", namespace),
            completed: format!("{}:completed", namespace),
        }
    }

    fn key(&self, queue: QueueName) -> &str {
        match queue {
            QueueName::Pending => &self.pending,
            QueueName::InFlight => &self.in_flight,
            QueueName::Failed => &self.failed,
        }
    }

    /// Parks `entry`, removing the in-flight payload `in_flight_raw` in the
    /// same script run.
    async fn park(&self, entry: &FailedEntry, in_flight_raw: Option<&str>) -> Result<bool, QueueError> {
        let mut conn = self.redis.clone();
        let serialized = serde_json::to_string(entry)?;
        let added: i32 = redis::Script::new(PARK_SCRIPT)
            .key(&self.failed_ids)
            .key(&self.failed)
            .key(&self.in_flight)
            .arg(&entry.event_id)
            .arg(serialized)
            .arg(in_flight_raw.unwrap_or(""))
            .invoke_async(&mut conn)
            .await?;
        Ok(added == 1)
    }

    async fn park_in_flight_raw(&self, raw: &str, reason: &str) -> Result<(), QueueError> {
        self.park(&FailedEntry::for_raw(raw, reason), Some(raw)).await?;
        warn!(queue = %self.in_flight, reason, "Parked malformed queue payload");
        Ok(())
    }

    /// Finds the stored in-flight payload of an event by id.
    ///
    /// Not found is not an error: the entry may already have been settled.
    async fn in_flight_entry(&self, event_id: &str) -> Result<Option<String>, QueueError> {
        let mut conn = self.redis.clone();
        let entries: Vec<String> = conn.lrange(&self.in_flight, 0, -1).await?;
        Ok(entries.into_iter().find(|data| {
            serde_json::from_str::<Event>(data)
                .map(|event| event.id == event_id)
                .unwrap_or(false)
        }))
    }

    async fn is_completed(&self, event_id: &str) -> Result<bool, QueueError> {
        let mut conn = self.redis.clone();
        Ok(conn.sismember(&self.completed, event_id).await?)
    }
}

#[async_trait]
impl EventQueue for RedisEventQueue {
    async fn push(&self, queue: QueueName, event: &Event) -> Result<(), QueueError> {
        if queue == QueueName::Failed {
            return self.move_to_failed(event, "pushed to failed queue").await;
        }
        let serialized = serde_json::to_string(event)?;
        let mut conn = self.redis.clone();
        conn.lpush::<_, _, ()>(self.key(queue), serialized).await?;
        Ok(())
    }

    async fn push_batch(&self, queue: QueueName, events: &[Event]) -> Result<(), QueueError> {
        if events.is_empty() {
            return Ok(());
        }
        if queue == QueueName::Failed {
            for event in events {
                self.move_to_failed(event, "pushed to failed queue").await?;
            }
            return Ok(());
        }

        let serialized: Result<Vec<String>, _> = events.iter().map(serde_json::to_string).collect();
        let serialized = serialized?;

        let mut conn = self.redis.clone();

        // Use pipeline for batch efficiency
        let mut pipe = redis::pipe();
        for data in &serialized {
            pipe.lpush(self.key(queue), data);
        }
        pipe.query_async::<_, ()>(&mut conn).await?;

        Ok(())
    }

    async fn pop_one(&self, queue: QueueName) -> Result<Option<Event>, QueueError> {
        let mut conn = self.redis.clone();
        let key = self.key(queue).to_string();
        loop {
            let data: Option<String> = conn.rpop(&key, None).await?;
            let Some(data) = data else {
                return Ok(None);
            };

            if queue == QueueName::Failed {
                let entry: FailedEntry = serde_json::from_str(&data)?;
                conn.srem::<_, _, ()>(&self.failed_ids, &entry.event_id).await?;
                match entry.event() {
                    Some(event) => return Ok(Some(event)),
                    None => {
                        warn!(event_id = %entry.event_id, "Dropped unreplayable failed entry");
                        continue;
                    }
                }
            }

            match serde_json::from_str::<Event>(&data) {
                Ok(event) => return Ok(Some(event)),
                Err(e) => {
                    // Already removed by RPOP; keep it visible in failed.
                    self.park(
                        &FailedEntry::for_raw(&data, &format!("malformed payload: {e}")),
                        None,
                    )
                    .await?;
                }
            }
        }
    }

    async fn claim_next(&self) -> Result<Option<Event>, QueueError> {
        let mut conn = self.redis.clone();
        loop {
            // RPOPLPUSH atomically pops from pending and pushes to in_flight
            let data: Option<String> = redis::cmd("RPOPLPUSH")
                .arg(&self.pending)
                .arg(&self.in_flight)
                .query_async(&mut conn)
                .await?;

            let Some(data) = data else {
                return Ok(None);
            };

            match serde_json::from_str::<Event>(&data) {
                Ok(event) => match event.validate() {
                    Ok(()) => return Ok(Some(event)),
                    Err(e) => {
                        self.park_in_flight_raw(&data, &format!("malformed event: {e}"))
                            .await?
                    }
                },
                Err(e) => {
                    self.park_in_flight_raw(&data, &format!("malformed payload: {e}"))
                        .await?
                }
            }
        }
    }

    async fn length(&self, queue: QueueName) -> Result<usize, QueueError> {
        let mut conn = self.redis.clone();
        let len: usize = conn.llen(self.key(queue)).await?;
        Ok(len)
    }

    async fn snapshot(&self) -> Result<QueueSnapshot, QueueError> {
        let (pending, in_flight, failed) = tokio::try_join!(
            self.length(QueueName::Pending),
            self.length(QueueName::InFlight),
            self.length(QueueName::Failed)
        )?;

        Ok(QueueSnapshot {
            pending,
            in_flight,
            failed,
        })
    }

    async fn move_to_in_flight(&self, event: &Event) -> Result<(), QueueError> {
        let mut conn = self.redis.clone();
        let entries: Vec<String> = conn.lrange(&self.in_flight, 0, -1).await?;
        let present = entries
            .iter()
            .filter_map(|data| serde_json::from_str::<Event>(data).ok())
            .any(|e| e.id == event.id);
        if !present {
            conn.lpush::<_, _, ()>(&self.in_flight, serde_json::to_string(event)?)
                .await?;
        }
        Ok(())
    }

    async fn move_to_completed(&self, event: &Event) -> Result<(), QueueError> {
        let raw = self.in_flight_entry(&event.id).await?;

        let mut conn = self.redis.clone();
        let mut pipe = leave_in_flight(&self.in_flight, raw.as_deref());
        pipe.sadd(&self.completed, &event.id)
            .ignore()
            .expire(&self.completed, COMPLETED_TTL_SECS)
            .ignore();
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }

    async fn move_to_failed(&self, event: &Event, reason: &str) -> Result<(), QueueError> {
        let raw = self.in_flight_entry(&event.id).await?;
        self.park(&FailedEntry::for_event(event, reason)?, raw.as_deref())
            .await?;
        Ok(())
    }

    async fn requeue(&self, event: &Event) -> Result<bool, QueueError> {
        let raw = self.in_flight_entry(&event.id).await?;
        let completed = self.is_completed(&event.id).await?;

        let mut conn = self.redis.clone();
        let mut pipe = leave_in_flight(&self.in_flight, raw.as_deref());
        if !completed {
            // Re-add at the consuming end so the retry runs first.
            pipe.rpush(&self.pending, serde_json::to_string(event)?)
                .ignore();
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(!completed)
    }

    async fn recover_in_flight(&self, max_retries: u32) -> Result<RecoveryReport, QueueError> {
        let mut conn = self.redis.clone();
        let mut report = RecoveryReport::default();

        let entries: Vec<String> = conn.lrange(&self.in_flight, 0, -1).await?;

        for data in entries {
            let event = match serde_json::from_str::<Event>(&data) {
                Ok(event) => event,
                Err(e) => {
                    self.park_in_flight_raw(&data, &format!("malformed payload: {e}"))
                        .await?;
                    report.parked += 1;
                    continue;
                }
            };

            if self.is_completed(&event.id).await? {
                conn.lrem::<_, _, ()>(&self.in_flight, 1, &data).await?;
                continue;
            }

            if event.can_retry(max_retries) {
                let serialized = serde_json::to_string(&event.next_attempt())?;

                let mut pipe = leave_in_flight(&self.in_flight, Some(&data));
                pipe.rpush(&self.pending, &serialized).ignore();
                pipe.query_async::<_, ()>(&mut conn).await?;

                report.requeued += 1;
            } else {
                self.park(
                    &FailedEntry::for_event(
                        &event,
                        "recovered from in-flight after retry budget exhausted",
                    )?,
                    Some(&data),
                )
                .await?;
                report.parked += 1;
            }
        }

        Ok(report)
    }

    async fn scan(&self, queue: QueueName, limit: usize) -> Result<Vec<Event>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        if queue == QueueName::Failed {
            return Ok(self
                .peek_failed(limit)
                .await?
                .iter()
                .filter_map(FailedEntry::event)
                .collect());
        }

        let mut conn = self.redis.clone();
        // The head (next to be consumed) is the right end of the list.
        let data: Vec<String> = conn.lrange(self.key(queue), -(limit as isize), -1).await?;
        Ok(data
            .iter()
            .rev()
            .filter_map(|s| serde_json::from_str(s).ok())
            .collect())
    }

    async fn peek_failed(&self, limit: usize) -> Result<Vec<FailedEntry>, QueueError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let mut conn = self.redis.clone();
        let data: Vec<String> = conn.lrange(&self.failed, 0, limit as isize - 1).await?;

        let entries: Result<Vec<FailedEntry>, _> =
            data.iter().map(|s| serde_json::from_str(s)).collect();

        Ok(entries?)
    }

    async fn health_check(&self) -> HealthReport {
        let mut conn = self.redis.clone();
        let ping = tokio::time::timeout(
            Duration::from_secs(2),
            redis::cmd("PING").query_async::<_, String>(&mut conn),
        )
        .await;

        match ping {
            Ok(Ok(_)) => HealthReport::healthy(format!("redis namespace '{}' reachable", self.namespace)),
            Ok(Err(e)) if e.is_io_error() || e.is_connection_refusal() || e.is_connection_dropped() => {
                HealthReport {
                    status: HealthStatus::Disconnected,
                    message: e.to_string(),
                }
            }
            Ok(Err(e)) => HealthReport {
                status: HealthStatus::Unhealthy,
                message: e.to_string(),
            },
            Err(_) => HealthReport {
                status: HealthStatus::Unhealthy,
                message: "PING timed out after 2s".to_string(),
            },
        }
    }
}

/// Starts a MULTI/EXEC pipeline that drops `raw` from `in_flight` together
/// with whatever the caller queues next.
fn leave_in_flight(in_flight: &str, raw: Option<&str>) -> redis::Pipeline {
    let mut pipe = redis::pipe();
    pipe.atomic();
    if let Some(raw) = raw {
        pipe.lrem(in_flight, 1, raw).ignore();
    }
    pipe
}

fn short_digest(raw: &str) -> String {
    use sha2::{Digest, Sha256};
    let digest = Sha256::digest(raw.as_bytes());
    hex::encode(&digest[..8])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::event::EventClass;

    #[test]
    fn test_queue_error_display() {
        let err = QueueError::ConnectionFailed("timeout".to_string());
        assert!(err.to_string().contains("timeout"));

        let err = QueueError::Unavailable("maintenance".to_string());
        assert!(err.to_string().contains("maintenance"));

        let err = QueueError::Timeout(Duration::from_secs(30));
        assert!(err.to_string().contains("30"));
    }

    #[test]
    fn test_queue_snapshot() {
        let snapshot = QueueSnapshot {
            pending: 10,
            in_flight: 5,
            failed: 2,
        };

        assert!(!snapshot.is_drained());
        assert!(QueueSnapshot {
            failed: 3,
            ..Default::default()
        }
        .is_drained());
    }

    #[test]
    fn test_failed_entry_roundtrips_event() {
        let event = Event::new("wallet_9", vec![EventClass::OpenOrderDetected]).unwrap();
        let entry = FailedEntry::for_event(&event, "validation").unwrap();
        assert_eq!(entry.event_id, event.id);
        assert_eq!(entry.event(), Some(event));
    }

    #[test]
    fn test_failed_entry_for_raw_payload() {
        let entry = FailedEntry::for_raw("{not json", "malformed payload");
        assert!(entry.event_id.starts_with("malformed:"));
        assert!(entry.event().is_none());
        // Same payload, same id: parking twice stays idempotent.
        assert_eq!(
            entry.event_id,
            FailedEntry::for_raw("{not json", "other").event_id
        );
    }

    fn position(haystack: &[u8], needle: &str) -> Option<usize> {
        haystack
            .windows(needle.len())
            .position(|window| window == needle.as_bytes())
    }

    #[test]
    fn test_write_back_is_one_transaction() {
        let raw = r#"{"id":"e-1"}"#;
        let mut pipe = leave_in_flight("audit:in_flight", Some(raw));
        pipe.rpush("audit:pending", raw).ignore();
        let packed = pipe.get_packed_pipeline();

        let multi = position(&packed, "MULTI").expect("MULTI");
        let lrem = position(&packed, "LREM").expect("LREM");
        let rpush = position(&packed, "RPUSH").expect("RPUSH");
        let exec = position(&packed, "EXEC").expect("EXEC");
        assert!(multi < lrem && lrem < rpush && rpush < exec);
    }

    #[test]
    fn test_write_back_without_in_flight_entry_only_pushes() {
        let mut pipe = leave_in_flight("audit:in_flight", None);
        pipe.sadd("audit:completed", "e-1").ignore();
        let packed = pipe.get_packed_pipeline();

        assert!(position(&packed, "LREM").is_none());
        assert!(position(&packed, "SADD").is_some());
    }

    #[test]
    fn test_park_script_drops_in_flight_entry_in_same_run() {
        let lrem = PARK_SCRIPT.find("'LREM', KEYS[3]").expect("LREM");
        let push = PARK_SCRIPT.find("'LPUSH', KEYS[2]").expect("LPUSH");
        assert!(lrem < push);
    }

    #[test]
    fn test_queue_name_display() {
        assert_eq!(QueueName::InFlight.to_string(), "in_flight");
        assert_eq!(HealthStatus::Disconnected.to_string(), "disconnected");
    }
}
