//! Rate-limited, dynamically scaled event processing.
//!
//! - **EventQueue**: pending / in-flight / failed lists with crash recovery,
//!   backed by Redis or held in memory
//! - **CapacityPlanner**: sizes the worker pool from the backlog, the cost
//!   table and the cycle deadline, and partitions events across workers
//! - **WorkerPool**: starts and stops worker units through a registry
//! - **Executor**: sends each bucket's calls to a live worker unit under
//!   per-endpoint rate limits
//! - **Manager**: the control loop tying the above together
//!
//! # Architecture
//!
//! ```text
//!                      ┌──────────────┐
//!                      │   Enqueue    │
//!                      │  (wallets)   │
//!                      └──────┬───────┘
//!                             │
//!                      ┌──────▼───────┐
//!                      │ Redis queues │◄──────────────┐
//!                      └──────┬───────┘               │ requeue / park
//!                             │ claim                 │
//!                      ┌──────▼───────┐        ┌──────┴───────┐
//!                      │   Planner    │───────►│   Executor   │
//!                      └──────┬───────┘        └──────┬───────┘
//!                             │ scale_to              │
//!         ┌───────────────────┼───────────────────┐   │
//!         ▼                   ▼                   ▼   ▼
//!    ┌─────────┐         ┌─────────┐         ┌─────────┐
//!    │ Worker 1│         │ Worker 2│         │ Worker N│
//!    └─────────┘         └─────────┘         └─────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use ratelimit_manager::config::ManagerConfig;
//! use ratelimit_manager::scheduler::{
//!     CostModel, Manager, RedisEventQueue, SimulatedDownstream, TaskRegistry,
//! };
//! use std::sync::Arc;
//!
//! let config = ManagerConfig::from_env()?;
//! let cost = Arc::new(CostModel::reference());
//! let queue = Arc::new(RedisEventQueue::connect(&config.redis_url, &config.namespace).await?);
//! let downstream = Arc::new(SimulatedDownstream::new(Arc::clone(&cost)));
//! let registry = Arc::new(TaskRegistry::new(downstream));
//!
//! let manager = Manager::new(config, queue, registry, cost)?;
//! let summary = manager.run().await?;
//! manager.shutdown().await;
//! ```
//!
//! # Reliability Features
//!
//! - **Atomic claim**: RPOPLPUSH moves an event to the in-flight list
//! - **Crash recovery**: in-flight events are requeued (or parked once their
//!   retry budget is spent) when a manager starts
//! - **Failed queue**: non-retryable failures and exhausted retries are kept
//!   for inspection
//! - **Idempotent completion**: a completed event is never requeued

pub mod cost;
pub mod downstream;
pub mod event;
pub mod executor;
pub mod manager;
pub mod memory_queue;
pub mod planner;
pub mod process;
pub mod queue;
pub mod rate_limit;
pub mod registry;
pub mod retry;
pub mod worker_pool;

// Re-export main types for convenience
pub use cost::{ClassProfile, CostError, CostModel};
pub use downstream::{DownstreamClient, FailurePolicy, SimulatedDownstream};
pub use event::{Event, EventClass, EventError, EventOutcome, EventResult, WorkerId};
pub use executor::{ExecutionReport, Executor, ExecutorConfig};
pub use manager::{
    CycleOutcome, CycleStatus, CycleSummary, LoopPhase, Manager, RunStatus, RunSummary,
};
pub use memory_queue::MemoryEventQueue;
pub use planner::{CapacityPlanner, ProcessingPlan};
pub use process::{serve_calls, ProcessRegistry, UnitReply, UnitRequest};
pub use queue::{
    EventQueue, FailedEntry, HealthReport, HealthStatus, QueueError, QueueName, QueueSnapshot,
    RecoveryReport, RedisEventQueue,
};
pub use rate_limit::RateLimiter;
pub use registry::{
    StartAck, StopOutcome, TaskRegistry, UnitClients, WorkerRegistry, WorkerStatus,
};
pub use retry::{RetryPolicy, StepError};
pub use worker_pool::{
    PoolConfig, PoolError, PoolStats, ScaleAction, ScaleReport, WorkerPool, WorkerState,
    WorkerUnit,
};
