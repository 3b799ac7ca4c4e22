//! Event definitions for the scheduler.
//!
//! This module defines the core event types moved through the queues:
//!
//! - `EventClass`: The kind of wallet condition an event reports
//! - `Event`: A unit of work for one subject (wallet)
//! - `EventOutcome`: What happened to an event in one cycle
//! - `EventResult`: Per-event execution record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::error::ErrorCategory;

/// Identity of a worker unit. Always `>= 1`.
pub type WorkerId = u32;

/// Errors raised when building an event.
#[derive(Debug, Error, PartialEq)]
pub enum EventError {
    /// An event must carry at least one class.
    #[error("Event for '{0}' has no classes")]
    NoClasses(String),

    /// The subject must be non-empty.
    #[error("Event subject is empty")]
    EmptySubject,
}

/// Category of a detected wallet condition.
///
/// The declaration order is the planner's deterministic iteration order and
/// also ranks priority (first = most urgent).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventClass {
    RebalanceNeeded,
    OpenPositionDetected,
    OpenOrderDetected,
    NewBalanceUpdate,
    BalanceCheckRequired,
}

impl EventClass {
    /// All classes in declared order.
    pub const ALL: [EventClass; 5] = [
        EventClass::RebalanceNeeded,
        EventClass::OpenPositionDetected,
        EventClass::OpenOrderDetected,
        EventClass::NewBalanceUpdate,
        EventClass::BalanceCheckRequired,
    ];

    /// Priority of the class, higher is more urgent.
    pub fn priority(self) -> i32 {
        match self {
            EventClass::RebalanceNeeded => 5,
            EventClass::OpenPositionDetected => 4,
            EventClass::OpenOrderDetected => 3,
            EventClass::NewBalanceUpdate => 2,
            EventClass::BalanceCheckRequired => 1,
        }
    }

    /// Stable label used in logs and metrics.
    pub fn as_str(self) -> &'static str {
        match self {
            EventClass::RebalanceNeeded => "REBALANCE_NEEDED",
            EventClass::OpenPositionDetected => "OPEN_POSITION_DETECTED",
            EventClass::OpenOrderDetected => "OPEN_ORDER_DETECTED",
            EventClass::NewBalanceUpdate => "NEW_BALANCE_UPDATE",
            EventClass::BalanceCheckRequired => "BALANCE_CHECK_REQUIRED",
        }
    }
}

impl std::fmt::Display for EventClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for EventClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventClass::ALL
            .into_iter()
            .find(|class| class.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| format!("unknown event class: {s}"))
    }
}

/// An event representing one or more detected conditions for a wallet.
///
/// Events are stored in the queue store as JSON. Everything except
/// `retry_count` is fixed at generation time.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Unique identifier, assigned at generation.
    pub id: String,
    /// Subject of the event (a wallet name).
    pub subject: String,
    /// Conditions detected for the subject, non-empty.
    pub classes: Vec<EventClass>,
    /// When the event was generated.
    pub enqueued_at: DateTime<Utc>,
    /// Priority of the highest-priority class.
    pub priority: i32,
    /// Number of times the event was requeued for retry.
    #[serde(default)]
    pub retry_count: u32,
}

impl Event {
    /// Creates a new event with a fresh id.
    ///
    /// Duplicate classes are collapsed, first occurrence wins.
    pub fn new(subject: impl Into<String>, classes: Vec<EventClass>) -> Result<Self, EventError> {
        let subject = subject.into();
        if subject.trim().is_empty() {
            return Err(EventError::EmptySubject);
        }

        let mut unique = Vec::with_capacity(classes.len());
        for class in classes {
            if !unique.contains(&class) {
                unique.push(class);
            }
        }
        if unique.is_empty() {
            return Err(EventError::NoClasses(subject));
        }

        let priority = unique.iter().map(|c| c.priority()).max().unwrap_or(0);

        Ok(Self {
            id: Uuid::new_v4().to_string(),
            subject,
            classes: unique,
            enqueued_at: Utc::now(),
            priority,
            retry_count: 0,
        })
    }

    /// Replaces the generated id. Used when replaying known events.
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self
    }

    /// Returns the highest-priority class, which decides planner grouping.
    pub fn primary_class(&self) -> Option<EventClass> {
        self.classes.iter().copied().min()
    }

    /// Returns the event as it should be requeued for another attempt.
    pub fn next_attempt(&self) -> Self {
        let mut next = self.clone();
        next.retry_count += 1;
        next
    }

    /// Returns whether another retry is allowed under `max_retries`.
    pub fn can_retry(&self, max_retries: u32) -> bool {
        self.retry_count < max_retries
    }

    /// Checks structural validity of an event read back from the store.
    pub fn validate(&self) -> Result<(), EventError> {
        if self.subject.trim().is_empty() {
            return Err(EventError::EmptySubject);
        }
        if self.classes.is_empty() {
            return Err(EventError::NoClasses(self.subject.clone()));
        }
        Ok(())
    }
}

/// What happened to one event during a cycle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum EventOutcome {
    /// Every class call succeeded.
    Completed,
    /// A class call failed with a non-retryable error.
    Failed {
        reason: String,
        category: ErrorCategory,
    },
    /// A class call failed with a retryable error; the control loop decides
    /// between requeue and parking.
    Retryable {
        reason: String,
        category: ErrorCategory,
    },
    /// The event was never attempted (deadline reached or bucket crashed).
    Leftover,
}

impl EventOutcome {
    /// Short label for logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            EventOutcome::Completed => "completed",
            EventOutcome::Failed { .. } => "failed",
            EventOutcome::Retryable { .. } => "retryable",
            EventOutcome::Leftover => "leftover",
        }
    }
}

/// Result of processing one event on one worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventResult {
    /// The event as it was dispatched.
    pub event: Event,
    /// Worker bucket that handled the event.
    pub worker_id: WorkerId,
    /// Final outcome.
    pub outcome: EventOutcome,
    /// Endpoints used, one per attempted class.
    pub endpoints: Vec<String>,
    /// Wall-clock processing time in milliseconds.
    pub duration_ms: u64,
}

impl EventResult {
    /// Creates a leftover record for an event that was never attempted.
    pub fn leftover(event: Event, worker_id: WorkerId) -> Self {
        Self {
            event,
            worker_id,
            outcome: EventOutcome::Leftover,
            endpoints: Vec::new(),
            duration_ms: 0,
        }
    }
}
