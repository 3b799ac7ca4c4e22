//! ratelimit-manager: deadline-driven, rate-limited event processing.
//!
//! This library drains queued wallet audit events within a wall-clock
//! deadline by sizing a worker pool from a per-class cost table, spreading
//! events over rate-limited downstream endpoints and carrying unfinished
//! work into the next cycle.

// Core modules
pub mod cli;
pub mod config;
pub mod error;
pub mod metrics;
pub mod scheduler;
pub mod source;

// Re-export commonly used error types
pub use config::ConfigError;
pub use error::{CallError, ErrorCategory, ManagerError};
pub use scheduler::{PoolError, QueueError};
pub use source::SourceError;
