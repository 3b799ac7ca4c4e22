//! Manager configuration.
//!
//! Defaults match the reference deployment. Every field can be overridden
//! from `RLM_*` environment variables, and the CLI overrides those in turn.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::scheduler::executor::ExecutorConfig;
use crate::scheduler::retry::RetryPolicy;
use crate::scheduler::worker_pool::PoolConfig;

/// Upper bound on events a worker keeps in flight at once.
pub const MAX_IN_WORKER_CONCURRENCY: usize = 5;

/// Errors that can occur during configuration operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// An environment variable has an invalid value.
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    /// Configuration validation failed.
    #[error("Configuration validation failed: {0}")]
    ValidationFailed(String),

    /// The cost table override could not be loaded.
    #[error("Cost table error: {0}")]
    CostTable(#[from] crate::scheduler::cost::CostError),
}

/// Configuration for the manager and its collaborators.
#[derive(Debug, Clone, PartialEq)]
pub struct ManagerConfig {
    // Queue settings
    /// Redis connection URL.
    pub redis_url: String,
    /// Prefix of every queue key.
    pub namespace: String,

    // Cycle settings
    /// Wall-clock budget of one cycle.
    pub deadline: Duration,
    /// Workers kept alive while idle.
    pub min_workers: u32,
    /// Upper bound on live workers.
    pub max_workers: u32,
    /// Requeues allowed per event before it is parked.
    pub max_retries: u32,
    /// Fraction of the deadline after which a non-empty queue triggers an
    /// emergency scale-up.
    pub emergency_fraction: f64,
    /// Treat the rate ceiling as a hard clamp on the worker count.
    pub enforce_rate_ceiling: bool,

    // Executor settings
    /// Events in flight per worker bucket.
    pub in_worker_concurrency: usize,
    /// Timeout of one downstream call.
    pub call_timeout: Duration,

    // Pool settings
    /// Task queue name handed to worker units.
    pub task_queue: String,
    /// Time a new worker gets to report ready.
    pub ready_timeout: Duration,
    /// Time a draining worker gets before it is killed.
    pub stop_grace: Duration,
    /// Directory for worker pid files.
    pub run_dir: PathBuf,

    // Step runner settings
    /// Attempts per queue step.
    pub step_attempts: u32,
    /// Timeout of one queue step attempt.
    pub step_timeout: Duration,
    /// First backoff between queue step attempts.
    pub step_backoff: Duration,

    // Sources
    /// Optional YAML override of the cost table.
    pub cost_table: Option<PathBuf>,
    /// Wallet database URL.
    pub database_url: String,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://localhost:6379".to_string(),
            namespace: "wallet_audit".to_string(),

            deadline: Duration::from_secs(180),
            min_workers: 0,
            max_workers: 20,
            max_retries: 3,
            emergency_fraction: 0.8,
            enforce_rate_ceiling: false,

            in_worker_concurrency: 5,
            call_timeout: Duration::from_secs(30),

            task_queue: "wallet-audit".to_string(),
            ready_timeout: Duration::from_secs(30),
            stop_grace: Duration::from_secs(30),
            run_dir: PathBuf::from("./run"),

            step_attempts: 5,
            step_timeout: Duration::from_secs(30),
            step_backoff: Duration::from_millis(500),

            cost_table: None,
            database_url: "sqlite://wallets.db".to_string(),
        }
    }
}

impl ManagerConfig {
    /// Creates a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `RLM_REDIS_URL`: Redis URL (default: redis://localhost:6379)
    /// - `RLM_NAMESPACE`: Queue key prefix (default: wallet_audit)
    /// - `RLM_DEADLINE_MS`: Cycle deadline in milliseconds (default: 180000)
    /// - `RLM_MIN_WORKERS` / `RLM_MAX_WORKERS`: Pool bounds (default: 0 / 20)
    /// - `RLM_MAX_RETRIES`: Requeues per event (default: 3)
    /// - `RLM_EMERGENCY_FRACTION`: Emergency scale-up threshold (default: 0.8)
    /// - `RLM_ENFORCE_RATE_CEILING`: Clamp workers to the rate ceiling (default: false)
    /// - `RLM_WORKER_CONCURRENCY`: Events in flight per worker, 1 to 5 (default: 5)
    /// - `RLM_CALL_TIMEOUT_SECS`: Downstream call timeout (default: 30)
    /// - `RLM_TASK_QUEUE`: Worker task queue name (default: wallet-audit)
    /// - `RLM_READY_TIMEOUT_SECS`: Worker readiness timeout (default: 30)
    /// - `RLM_STOP_GRACE_SECS`: Worker drain grace period (default: 30)
    /// - `RLM_RUN_DIR`: Worker pid file directory (default: ./run)
    /// - `RLM_STEP_ATTEMPTS`: Attempts per queue step (default: 5)
    /// - `RLM_STEP_TIMEOUT_SECS`: Timeout per queue step attempt (default: 30)
    /// - `RLM_COST_TABLE`: YAML cost table override
    /// - `RLM_DATABASE_URL`: Wallet database (default: sqlite://wallets.db)
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if a variable has an invalid value.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        // Queue settings
        if let Some(val) = lookup("RLM_REDIS_URL") {
            config.redis_url = val;
        }

        if let Some(val) = lookup("RLM_NAMESPACE") {
            config.namespace = val;
        }

        // Cycle settings
        if let Some(val) = lookup("RLM_DEADLINE_MS") {
            let ms: u64 = parse_env_value(&val, "RLM_DEADLINE_MS")?;
            config.deadline = Duration::from_millis(ms);
        }

        if let Some(val) = lookup("RLM_MIN_WORKERS") {
            config.min_workers = parse_env_value(&val, "RLM_MIN_WORKERS")?;
        }

        if let Some(val) = lookup("RLM_MAX_WORKERS") {
            config.max_workers = parse_env_value(&val, "RLM_MAX_WORKERS")?;
        }

        if let Some(val) = lookup("RLM_MAX_RETRIES") {
            config.max_retries = parse_env_value(&val, "RLM_MAX_RETRIES")?;
        }

        if let Some(val) = lookup("RLM_EMERGENCY_FRACTION") {
            config.emergency_fraction = parse_env_value(&val, "RLM_EMERGENCY_FRACTION")?;
        }

        if let Some(val) = lookup("RLM_ENFORCE_RATE_CEILING") {
            config.enforce_rate_ceiling = parse_env_bool(&val, "RLM_ENFORCE_RATE_CEILING")?;
        }

        // Executor settings
        if let Some(val) = lookup("RLM_WORKER_CONCURRENCY") {
            config.in_worker_concurrency = parse_env_value(&val, "RLM_WORKER_CONCURRENCY")?;
        }

        if let Some(val) = lookup("RLM_CALL_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "RLM_CALL_TIMEOUT_SECS")?;
            config.call_timeout = Duration::from_secs(secs);
        }

        // Pool settings
        if let Some(val) = lookup("RLM_TASK_QUEUE") {
            config.task_queue = val;
        }

        if let Some(val) = lookup("RLM_READY_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "RLM_READY_TIMEOUT_SECS")?;
            config.ready_timeout = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("RLM_STOP_GRACE_SECS") {
            let secs: u64 = parse_env_value(&val, "RLM_STOP_GRACE_SECS")?;
            config.stop_grace = Duration::from_secs(secs);
        }

        if let Some(val) = lookup("RLM_RUN_DIR") {
            config.run_dir = PathBuf::from(val);
        }

        // Step runner settings
        if let Some(val) = lookup("RLM_STEP_ATTEMPTS") {
            config.step_attempts = parse_env_value(&val, "RLM_STEP_ATTEMPTS")?;
        }

        if let Some(val) = lookup("RLM_STEP_TIMEOUT_SECS") {
            let secs: u64 = parse_env_value(&val, "RLM_STEP_TIMEOUT_SECS")?;
            config.step_timeout = Duration::from_secs(secs);
        }

        // Sources
        if let Some(val) = lookup("RLM_COST_TABLE") {
            config.cost_table = Some(PathBuf::from(val));
        }

        if let Some(val) = lookup("RLM_DATABASE_URL") {
            config.database_url = val;
        }

        config.validate()?;
        Ok(config)
    }

    /// Validates the configuration values.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationFailed` if any values are invalid.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.redis_url.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "redis_url cannot be empty".to_string(),
            ));
        }

        if self.namespace.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "namespace cannot be empty".to_string(),
            ));
        }

        if self.deadline.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "deadline must be greater than 0".to_string(),
            ));
        }

        if self.max_workers == 0 {
            return Err(ConfigError::ValidationFailed(
                "max_workers must be greater than 0".to_string(),
            ));
        }

        if self.min_workers > self.max_workers {
            return Err(ConfigError::ValidationFailed(
                "min_workers cannot exceed max_workers".to_string(),
            ));
        }

        if !(self.emergency_fraction > 0.0 && self.emergency_fraction <= 1.0) {
            return Err(ConfigError::ValidationFailed(
                "emergency_fraction must be in (0.0, 1.0]".to_string(),
            ));
        }

        if self.in_worker_concurrency == 0 || self.in_worker_concurrency > MAX_IN_WORKER_CONCURRENCY {
            return Err(ConfigError::ValidationFailed(format!(
                "in_worker_concurrency must be between 1 and {}",
                MAX_IN_WORKER_CONCURRENCY
            )));
        }

        if self.call_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "call_timeout must be greater than 0".to_string(),
            ));
        }

        if self.task_queue.is_empty() {
            return Err(ConfigError::ValidationFailed(
                "task_queue cannot be empty".to_string(),
            ));
        }

        if self.step_attempts == 0 {
            return Err(ConfigError::ValidationFailed(
                "step_attempts must be greater than 0".to_string(),
            ));
        }

        if self.step_timeout.is_zero() {
            return Err(ConfigError::ValidationFailed(
                "step_timeout must be greater than 0".to_string(),
            ));
        }

        Ok(())
    }

    /// Pool bounds and timings.
    pub fn pool_config(&self) -> PoolConfig {
        PoolConfig::new(self.min_workers, self.max_workers)
            .with_task_queue(self.task_queue.clone())
            .with_ready_timeout(self.ready_timeout)
            .with_stop_grace(self.stop_grace)
    }

    /// Retry policy for queue steps.
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::default()
            .with_max_attempts(self.step_attempts)
            .with_step_timeout(self.step_timeout)
            .with_backoff(self.step_backoff, Duration::from_secs(30))
    }

    /// Executor tuning.
    pub fn executor_config(&self) -> ExecutorConfig {
        ExecutorConfig {
            in_worker_concurrency: self.in_worker_concurrency,
            call_timeout: self.call_timeout,
        }
    }

    /// Builder method to set the Redis URL.
    pub fn with_redis_url(mut self, url: impl Into<String>) -> Self {
        self.redis_url = url.into();
        self
    }

    /// Builder method to set the queue namespace.
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Builder method to set the cycle deadline.
    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = deadline;
        self
    }

    /// Builder method to set the pool bounds.
    pub fn with_workers(mut self, min: u32, max: u32) -> Self {
        self.min_workers = min;
        self.max_workers = max;
        self
    }

    /// Builder method to set the retry cap.
    pub fn with_max_retries(mut self, retries: u32) -> Self {
        self.max_retries = retries;
        self
    }

    /// Builder method to set the emergency fraction.
    pub fn with_emergency_fraction(mut self, fraction: f64) -> Self {
        self.emergency_fraction = fraction;
        self
    }

    /// Builder method to enforce the rate ceiling.
    pub fn with_enforced_rate_ceiling(mut self, enforce: bool) -> Self {
        self.enforce_rate_ceiling = enforce;
        self
    }

    /// Builder method to set per-worker concurrency.
    pub fn with_in_worker_concurrency(mut self, concurrency: usize) -> Self {
        self.in_worker_concurrency = concurrency;
        self
    }

    /// Builder method to set the step runner attempts and timeout.
    pub fn with_step_policy(mut self, attempts: u32, timeout: Duration, backoff: Duration) -> Self {
        self.step_attempts = attempts;
        self.step_timeout = timeout;
        self.step_backoff = backoff;
        self
    }

    /// Builder method to set the cost table override.
    pub fn with_cost_table(mut self, path: impl Into<PathBuf>) -> Self {
        self.cost_table = Some(path.into());
        self
    }
}

/// Parse an environment variable value into a type.
fn parse_env_value<T: std::str::FromStr>(value: &str, key: &str) -> Result<T, ConfigError> {
    value.trim().parse().map_err(|_| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("could not parse '{}'", value),
    })
}

/// Parse an environment variable as a boolean.
fn parse_env_bool(value: &str, key: &str) -> Result<bool, ConfigError> {
    match value.to_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected boolean value, got '{}'", value),
        }),
    }
}
