//! Worker pool sizing.
//!
//! The pool owns the set of worker units and drives the live count toward a
//! target. Units are started and stopped through a [`WorkerRegistry`], so the
//! same pool logic runs in-process tasks or child processes.
//!
//! # Features
//!
//! - Discovery reconciles the in-memory view with what is actually alive
//! - Lowest free ids are reused on scale-up, highest ids go first on scale-down
//! - Starts and stops of one batch run concurrently
//! - A failing unit never aborts the rest of the batch

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use super::event::WorkerId;
use super::registry::{StartAck, StopOutcome, UnitClients, WorkerRegistry};

/// Errors that can occur in the worker pool.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A worker unit could not be started.
    #[error("Worker {id} failed to start: {reason}")]
    StartFailed { id: WorkerId, reason: String },

    /// A worker unit could not be stopped.
    #[error("Worker {id} failed to stop: {reason}")]
    StopFailed { id: WorkerId, reason: String },

    /// The id is already running.
    #[error("Worker {0} is already running")]
    AlreadyRunning(WorkerId),

    /// The registry could not be queried.
    #[error("Worker registry error: {0}")]
    Registry(String),

    /// IO error talking to worker processes.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Invalid pool bounds.
    #[error("Invalid pool configuration: {0}")]
    InvalidConfig(String),
}

/// Configuration for the worker pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Workers kept alive while idle.
    pub min_workers: u32,
    /// Upper bound on live workers.
    pub max_workers: u32,
    /// Task queue name handed to every unit.
    pub task_queue: String,
    /// How long to wait for a unit to report ready.
    pub ready_timeout: Duration,
    /// How long a draining unit gets before it is force-terminated.
    pub stop_grace: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            min_workers: 0,
            max_workers: 20,
            task_queue: "wallet-audit".to_string(),
            ready_timeout: Duration::from_secs(30),
            stop_grace: Duration::from_secs(30),
        }
    }
}

impl PoolConfig {
    /// Creates a configuration with the given bounds.
    pub fn new(min_workers: u32, max_workers: u32) -> Self {
        Self {
            min_workers,
            max_workers,
            ..Default::default()
        }
    }

    /// Sets the task queue name.
    pub fn with_task_queue(mut self, name: impl Into<String>) -> Self {
        self.task_queue = name.into();
        self
    }

    /// Sets the readiness timeout.
    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    /// Sets the stop grace period.
    pub fn with_stop_grace(mut self, grace: Duration) -> Self {
        self.stop_grace = grace;
        self
    }

    /// Checks the bounds.
    pub fn validate(&self) -> Result<(), PoolError> {
        if self.max_workers == 0 {
            return Err(PoolError::InvalidConfig("max_workers must be > 0".into()));
        }
        if self.min_workers > self.max_workers {
            return Err(PoolError::InvalidConfig(format!(
                "min_workers ({}) exceeds max_workers ({})",
                self.min_workers, self.max_workers
            )));
        }
        Ok(())
    }
}

/// Lifecycle state of a worker unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Starting,
    Running,
    Draining,
    Stopped,
}

/// A worker unit tracked by the pool.
#[derive(Debug, Clone, Serialize)]
pub struct WorkerUnit {
    pub id: WorkerId,
    pub state: WorkerState,
    pub started_at: DateTime<Utc>,
}

impl WorkerUnit {
    fn new(id: WorkerId, state: WorkerState) -> Self {
        Self {
            id,
            state,
            started_at: Utc::now(),
        }
    }

    /// Counts toward live capacity.
    pub fn is_live(&self) -> bool {
        matches!(self.state, WorkerState::Starting | WorkerState::Running)
    }
}

/// Direction of a scaling decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ScaleAction {
    None,
    ScaleUp,
    ScaleDown,
}

/// Outcome of one `scale_to` call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ScaleReport {
    pub action: ScaleAction,
    /// Target as requested by the caller.
    pub requested: u32,
    /// Target after clamping into `[min_workers, max_workers]`.
    pub target: u32,
    /// Whether clamping changed the request.
    pub clamped: bool,
    /// Units started (including ones still not ready).
    pub started: u32,
    /// Units stopped.
    pub stopped: u32,
    /// Live units after the call.
    pub live: u32,
    /// Per-unit failures.
    pub failures: u32,
}

/// Statistics about the worker pool.
#[derive(Debug, Clone, Default, Serialize)]
pub struct PoolStats {
    /// Live workers right now.
    pub live_workers: u32,
    /// Units started since the pool was created.
    pub total_started: u64,
    /// Units stopped since the pool was created.
    pub total_stopped: u64,
    /// Stops that needed a forced termination.
    pub forced_stops: u64,
    /// Start and stop failures.
    pub failures: u64,
}

/// Shared state for tracking pool statistics.
#[derive(Default)]
struct SharedPoolStats {
    total_started: AtomicU64,
    total_stopped: AtomicU64,
    forced_stops: AtomicU64,
    failures: AtomicU64,
}

impl SharedPoolStats {
    fn record_started(&self) {
        self.total_started.fetch_add(1, Ordering::SeqCst);
    }

    fn record_stopped(&self, outcome: StopOutcome) {
        self.total_stopped.fetch_add(1, Ordering::SeqCst);
        if outcome == StopOutcome::Forced {
            self.forced_stops.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn record_failure(&self) {
        self.failures.fetch_add(1, Ordering::SeqCst);
    }

    fn to_pool_stats(&self, live_workers: u32) -> PoolStats {
        PoolStats {
            live_workers,
            total_started: self.total_started.load(Ordering::SeqCst),
            total_stopped: self.total_stopped.load(Ordering::SeqCst),
            forced_stops: self.forced_stops.load(Ordering::SeqCst),
            failures: self.failures.load(Ordering::SeqCst),
        }
    }
}

/// Pool of worker units driven toward a target size.
pub struct WorkerPool {
    config: PoolConfig,
    registry: Arc<dyn WorkerRegistry>,
    units: BTreeMap<WorkerId, WorkerUnit>,
    stats: SharedPoolStats,
}

impl WorkerPool {
    /// Creates an empty pool.
    ///
    /// # Errors
    ///
    /// Returns `PoolError::InvalidConfig` if the bounds are inconsistent.
    pub fn new(config: PoolConfig, registry: Arc<dyn WorkerRegistry>) -> Result<Self, PoolError> {
        config.validate()?;
        Ok(Self {
            config,
            registry,
            units: BTreeMap::new(),
            stats: SharedPoolStats::default(),
        })
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Number of live units.
    pub fn live(&self) -> u32 {
        self.units.values().filter(|u| u.is_live()).count() as u32
    }

    /// Live unit ids in ascending order.
    pub fn live_ids(&self) -> Vec<WorkerId> {
        self.units
            .values()
            .filter(|u| u.is_live())
            .map(|u| u.id)
            .collect()
    }

    /// Call handles of the live units that can take work right now.
    ///
    /// Units the registry cannot reach (not ready, adopted without a
    /// channel) are left out and get no bucket.
    pub async fn clients(&self) -> UnitClients {
        let mut clients = UnitClients::new();
        for id in self.live_ids() {
            match self.registry.client(id).await {
                Ok(Some(client)) => {
                    clients.insert(id, client);
                }
                Ok(None) => debug!(worker_id = %id, "Worker cannot take calls yet"),
                Err(e) => warn!(worker_id = %id, error = %e, "Failed to reach worker"),
            }
        }
        clients
    }

    /// Returns a copy of one unit.
    pub fn unit(&self, id: WorkerId) -> Option<WorkerUnit> {
        self.units.get(&id).cloned()
    }

    pub fn stats(&self) -> PoolStats {
        self.stats.to_pool_stats(self.live())
    }

    /// Reconciles the tracked units with the registry.
    ///
    /// Live ids the pool did not know about are adopted, ids the registry no
    /// longer reports are dropped and ready `Starting` units are promoted.
    pub async fn discover(&mut self) -> Result<(), PoolError> {
        let statuses = self.registry.list().await?;

        let seen: BTreeMap<WorkerId, bool> = statuses.iter().map(|s| (s.id, s.ready)).collect();

        self.units.retain(|id, unit| {
            if seen.contains_key(id) {
                true
            } else {
                if unit.is_live() {
                    warn!(worker_id = %id, "Worker vanished; dropping from pool");
                }
                false
            }
        });

        for (id, ready) in seen {
            match self.units.get_mut(&id) {
                Some(unit) => {
                    if unit.state == WorkerState::Starting && ready {
                        unit.state = WorkerState::Running;
                        debug!(worker_id = %id, "Worker became ready");
                    }
                }
                None => {
                    let state = if ready {
                        WorkerState::Running
                    } else {
                        WorkerState::Starting
                    };
                    info!(worker_id = %id, ?state, "Adopted live worker");
                    self.units.insert(id, WorkerUnit::new(id, state));
                }
            }
        }

        Ok(())
    }

    /// Drives the live count toward `target`.
    ///
    /// Discovery failures are logged and the last known view is used.
    pub async fn scale_to(&mut self, target: u32) -> ScaleReport {
        if let Err(e) = self.discover().await {
            warn!(error = %e, "Worker discovery failed; using last known pool state");
        }

        let clamped_target = target.clamp(self.config.min_workers, self.config.max_workers);
        let clamped = clamped_target != target;
        if clamped {
            warn!(
                requested = target,
                target = clamped_target,
                "Scale target clamped to pool bounds"
            );
        }

        self.resize(target, clamped_target, clamped).await
    }

    /// Stops every unit, ignoring `min_workers`.
    pub async fn shutdown(&mut self) -> ScaleReport {
        if let Err(e) = self.discover().await {
            warn!(error = %e, "Worker discovery failed during shutdown");
        }
        self.resize(0, 0, false).await
    }

    async fn resize(&mut self, requested: u32, target: u32, clamped: bool) -> ScaleReport {
        let live = self.live();
        let mut report = ScaleReport {
            action: ScaleAction::None,
            requested,
            target,
            clamped,
            started: 0,
            stopped: 0,
            live,
            failures: 0,
        };

        if target > live {
            report.action = ScaleAction::ScaleUp;
            let (started, failures) = self.scale_up(target - live).await;
            report.started = started;
            report.failures = failures;
        } else if target < live {
            report.action = ScaleAction::ScaleDown;
            let (stopped, failures) = self.scale_down(live - target).await;
            report.stopped = stopped;
            report.failures = failures;
        }

        report.live = self.live();
        if report.action != ScaleAction::None {
            info!(
                action = ?report.action,
                target = report.target,
                started = report.started,
                stopped = report.stopped,
                failures = report.failures,
                live = report.live,
                "Scaled worker pool"
            );
        }
        report
    }

    fn free_ids(&self, count: u32) -> Vec<WorkerId> {
        (1..)
            .filter(|id| !self.units.contains_key(id))
            .take(count as usize)
            .collect()
    }

    async fn scale_up(&mut self, count: u32) -> (u32, u32) {
        let ids = self.free_ids(count);
        let registry = Arc::clone(&self.registry);
        let task_queue = self.config.task_queue.clone();
        let ready_timeout = self.config.ready_timeout;

        for id in &ids {
            self.units.insert(*id, WorkerUnit::new(*id, WorkerState::Starting));
        }

        let starts = ids.iter().map(|&id| {
            let registry = Arc::clone(&registry);
            let task_queue = task_queue.clone();
            async move { (id, registry.start(id, &task_queue, ready_timeout).await) }
        });
        let results = join_all(starts).await;

        let mut started = 0;
        let mut failures = 0;
        for (id, result) in results {
            match result {
                Ok(StartAck::Ready) => {
                    if let Some(unit) = self.units.get_mut(&id) {
                        unit.state = WorkerState::Running;
                    }
                    self.stats.record_started();
                    started += 1;
                }
                Ok(StartAck::TimedOut) => {
                    warn!(
                        worker_id = %id,
                        timeout = ?ready_timeout,
                        "Worker not ready before timeout; keeping it as starting"
                    );
                    self.stats.record_started();
                    started += 1;
                }
                Err(e) => {
                    warn!(worker_id = %id, error = %e, "Failed to start worker");
                    self.units.remove(&id);
                    self.stats.record_failure();
                    failures += 1;
                }
            }
        }

        (started, failures)
    }

    async fn scale_down(&mut self, count: u32) -> (u32, u32) {
        let ids: Vec<WorkerId> = self
            .units
            .values()
            .rev()
            .filter(|u| u.is_live())
            .map(|u| u.id)
            .take(count as usize)
            .collect();

        for id in &ids {
            if let Some(unit) = self.units.get_mut(id) {
                unit.state = WorkerState::Draining;
            }
        }

        let registry = Arc::clone(&self.registry);
        let grace = self.config.stop_grace;
        let stops = ids.iter().map(|&id| {
            let registry = Arc::clone(&registry);
            async move { (id, registry.stop(id, grace).await) }
        });
        let results = join_all(stops).await;

        let mut stopped = 0;
        let mut failures = 0;
        for (id, result) in results {
            match result {
                Ok(outcome) => {
                    if outcome == StopOutcome::Forced {
                        warn!(worker_id = %id, grace = ?grace, "Worker force-terminated after grace period");
                    }
                    if let Some(mut unit) = self.units.remove(&id) {
                        unit.state = WorkerState::Stopped;
                        debug!(
                            worker_id = %id,
                            state = ?unit.state,
                            started_at = %unit.started_at,
                            "Worker stopped"
                        );
                    }
                    self.stats.record_stopped(outcome);
                    stopped += 1;
                }
                Err(e) => {
                    warn!(worker_id = %id, error = %e, "Failed to stop worker");
                    if let Some(unit) = self.units.get_mut(&id) {
                        unit.state = WorkerState::Running;
                    }
                    self.stats.record_failure();
                    failures += 1;
                }
            }
        }

        (stopped, failures)
    }
}
