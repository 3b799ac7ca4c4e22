//! Retry policy for control-loop steps.
//!
//! Queue reads and writes of the control loop run through [`RetryPolicy::run`],
//! which bounds each attempt with a timeout and retries with exponential
//! backoff. The same policy decides which downstream error categories are
//! worth retrying at the event level.

use std::collections::BTreeSet;
use std::future::Future;
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

use crate::error::ErrorCategory;

/// Error returned when a step runs out of attempts.
#[derive(Debug, Error)]
pub enum StepError<E>
where
    E: std::error::Error + 'static,
{
    /// The last attempt failed with an error.
    #[error("Step '{step}' failed after {attempts} attempts: {source}")]
    Failed {
        step: String,
        attempts: u32,
        #[source]
        source: E,
    },

    /// The last attempt timed out.
    #[error("Step '{step}' timed out after {timeout:?} ({attempts} attempts)")]
    TimedOut {
        step: String,
        attempts: u32,
        timeout: Duration,
    },
}

impl<E> StepError<E>
where
    E: std::error::Error + 'static,
{
    /// Number of attempts made.
    pub fn attempts(&self) -> u32 {
        match self {
            StepError::Failed { attempts, .. } | StepError::TimedOut { attempts, .. } => *attempts,
        }
    }
}

/// Retry and timeout settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per step, including the first.
    pub max_attempts: u32,
    /// Backoff after the first failed attempt.
    pub initial_backoff: Duration,
    /// Upper bound on any single backoff.
    pub max_backoff: Duration,
    /// Timeout of one attempt.
    pub step_timeout: Duration,
    /// Downstream error categories that are never retried.
    pub non_retryable: BTreeSet<ErrorCategory>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(30),
            step_timeout: Duration::from_secs(30),
            non_retryable: BTreeSet::from([
                ErrorCategory::RateLimited,
                ErrorCategory::Validation,
                ErrorCategory::Malformed,
            ]),
        }
    }
}

impl RetryPolicy {
    /// Sets the number of attempts.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    /// Sets the initial and maximum backoff.
    pub fn with_backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max.max(initial);
        self
    }

    /// Sets the per-attempt timeout.
    pub fn with_step_timeout(mut self, timeout: Duration) -> Self {
        self.step_timeout = timeout;
        self
    }

    /// Whether a downstream failure of this category may be retried.
    pub fn is_retryable(&self, category: ErrorCategory) -> bool {
        !self.non_retryable.contains(&category)
    }

    /// Backoff to wait after failed attempt number `attempt` (1-based).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        self.initial_backoff
            .saturating_mul(1u32 << exponent)
            .min(self.max_backoff)
    }

    /// Runs `f` until it succeeds or the attempts are spent.
    pub async fn run<T, E, F, Fut>(&self, step: &str, mut f: F) -> Result<T, StepError<E>>
    where
        E: std::error::Error + 'static,
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            let failure = match tokio::time::timeout(self.step_timeout, f()).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => StepError::Failed {
                    step: step.to_string(),
                    attempts: attempt,
                    source: e,
                },
                Err(_) => StepError::TimedOut {
                    step: step.to_string(),
                    attempts: attempt,
                    timeout: self.step_timeout,
                },
            };

            if attempt >= max_attempts {
                return Err(failure);
            }

            let backoff = self.backoff_for(attempt);
            warn!(
                step,
                attempt,
                max_attempts,
                backoff_ms = backoff.as_millis() as u64,
                error = %failure,
                "Step failed; retrying"
            );
            tokio::time::sleep(backoff).await;
        }
    }
}
