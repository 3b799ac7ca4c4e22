//! Error types shared across the manager.
//!
//! Subsystem-local errors live next to their code (`QueueError` in the queue
//! adapter, `PoolError` in the worker pool, `ConfigError` in the config
//! module). This module holds the downstream call taxonomy, which the
//! executor, the retry policy and the control loop all need to agree on, and
//! the top-level `ManagerError`.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::ConfigError;
use crate::scheduler::queue::QueueError;
use crate::scheduler::worker_pool::PoolError;

/// Coarse classification of a downstream failure.
///
/// The retry policy decides retryability per category, so adding a category
/// never silently changes what gets retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Network blip, connection reset.
    Transient,
    /// Downstream answered with a 5xx.
    ServerError,
    /// The call exceeded its timeout.
    Timeout,
    /// Downstream explicitly signalled rate-limit exceeded.
    RateLimited,
    /// Downstream rejected the request as invalid.
    Validation,
    /// The event itself cannot be processed.
    Malformed,
}

impl std::fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            ErrorCategory::Transient => "transient",
            ErrorCategory::ServerError => "server_error",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::RateLimited => "rate_limited",
            ErrorCategory::Validation => "validation",
            ErrorCategory::Malformed => "malformed",
        };
        f.write_str(name)
    }
}

/// Errors returned by a downstream wallet call.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CallError {
    #[error("Transient downstream failure: {0}")]
    Transient(String),

    #[error("Downstream returned {status}: {message}")]
    ServerError { status: u16, message: String },

    #[error("Downstream call timed out after {0:?}")]
    Timeout(Duration),

    #[error("Downstream rate limit exceeded: {0}")]
    RateLimited(String),

    #[error("Downstream rejected request: {0}")]
    Validation(String),

    #[error("Malformed event: {0}")]
    Malformed(String),
}

impl CallError {
    /// Returns the category used for retry decisions.
    pub fn category(&self) -> ErrorCategory {
        match self {
            CallError::Transient(_) => ErrorCategory::Transient,
            CallError::ServerError { .. } => ErrorCategory::ServerError,
            CallError::Timeout(_) => ErrorCategory::Timeout,
            CallError::RateLimited(_) => ErrorCategory::RateLimited,
            CallError::Validation(_) => ErrorCategory::Validation,
            CallError::Malformed(_) => ErrorCategory::Malformed,
        }
    }

    /// Builds an error of the given category with a message.
    pub fn from_category(category: ErrorCategory, message: impl Into<String>) -> Self {
        let message = message.into();
        match category {
            ErrorCategory::Transient => CallError::Transient(message),
            ErrorCategory::ServerError => CallError::ServerError {
                status: 503,
                message,
            },
            ErrorCategory::Timeout => CallError::Timeout(Duration::ZERO),
            ErrorCategory::RateLimited => CallError::RateLimited(message),
            ErrorCategory::Validation => CallError::Validation(message),
            ErrorCategory::Malformed => CallError::Malformed(message),
        }
    }
}

/// Errors that stop the control loop.
///
/// A queue step that times out on every attempt surfaces as
/// `QueueUnavailable` carrying `QueueError::Timeout`.
#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("Queue store unavailable after {attempts} attempts: {source}")]
    QueueUnavailable {
        attempts: u32,
        #[source]
        source: QueueError,
    },

    #[error("Worker pool error: {0}")]
    Pool(#[from] PoolError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_call_error_categories() {
        assert_eq!(
            CallError::Transient("reset".into()).category(),
            ErrorCategory::Transient
        );
        assert_eq!(
            CallError::ServerError {
                status: 502,
                message: "bad gateway".into()
            }
            .category(),
            ErrorCategory::ServerError
        );
        assert_eq!(
            CallError::RateLimited("429".into()).category(),
            ErrorCategory::RateLimited
        );
    }

    #[test]
    fn test_from_category_roundtrips_category() {
        for category in [
            ErrorCategory::Transient,
            ErrorCategory::ServerError,
            ErrorCategory::Timeout,
            ErrorCategory::RateLimited,
            ErrorCategory::Validation,
            ErrorCategory::Malformed,
        ] {
            assert_eq!(CallError::from_category(category, "x").category(), category);
        }
    }

    #[test]
    fn test_error_display() {
        let err = CallError::ServerError {
            status: 503,
            message: "unavailable".into(),
        };
        assert!(err.to_string().contains("503"));
        assert_eq!(ErrorCategory::RateLimited.to_string(), "rate_limited");
    }
}
