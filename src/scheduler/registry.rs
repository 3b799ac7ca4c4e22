//! Worker registries.
//!
//! A registry knows how to bring a worker unit up and down, what is alive
//! right now and how to hand a live unit its calls. The pool decides how
//! many units exist; the registry decides what a unit is. [`TaskRegistry`]
//! hosts units as tokio tasks in this process;
//! [`ProcessRegistry`](super::process::ProcessRegistry) runs them as child
//! processes.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, info, warn};

use crate::error::CallError;

use super::downstream::DownstreamClient;
use super::event::{Event, EventClass, WorkerId};
use super::worker_pool::PoolError;

/// Call handles of the units that can take work, by id.
pub type UnitClients = BTreeMap<WorkerId, Arc<dyn DownstreamClient>>;

/// Interval between polls while waiting for a draining unit to exit.
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Idle heartbeat of task units.
const HEARTBEAT: Duration = Duration::from_secs(30);

/// Error for a call that reached a unit which stopped accepting work.
pub(crate) fn unit_gone(id: WorkerId) -> CallError {
    CallError::Transient(format!("worker {id} is no longer accepting calls"))
}

/// A unit as reported by the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerStatus {
    pub id: WorkerId,
    pub ready: bool,
}

/// Result of starting a unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartAck {
    /// The unit reported ready in time.
    Ready,
    /// The unit is up but did not report ready before the timeout.
    TimedOut,
}

/// How a unit went down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The unit exited on its own after being drained.
    Graceful,
    /// The unit had to be force-terminated.
    Forced,
}

/// Starts, stops and lists worker units.
#[async_trait]
pub trait WorkerRegistry: Send + Sync {
    /// Units currently alive.
    async fn list(&self) -> Result<Vec<WorkerStatus>, PoolError>;

    /// Starts unit `id` bound to `task_queue` and waits up to `ready_timeout`
    /// for it to report ready.
    async fn start(
        &self,
        id: WorkerId,
        task_queue: &str,
        ready_timeout: Duration,
    ) -> Result<StartAck, PoolError>;

    /// Asks the unit to finish in-flight work and exit.
    async fn drain(&self, id: WorkerId) -> Result<(), PoolError>;

    /// Whether the unit is still running.
    async fn is_alive(&self, id: WorkerId) -> Result<bool, PoolError>;

    /// Kills the unit and forgets it. Must succeed for units that already exited.
    async fn terminate(&self, id: WorkerId) -> Result<(), PoolError>;

    /// Handle that runs downstream calls on unit `id`.
    ///
    /// `None` when the unit cannot take work: unknown, not ready yet,
    /// draining, or adopted from an earlier run without a call channel.
    async fn client(&self, id: WorkerId) -> Result<Option<Arc<dyn DownstreamClient>>, PoolError>;

    /// Drains the unit, waits up to `grace` for it to exit, then terminates.
    async fn stop(&self, id: WorkerId, grace: Duration) -> Result<StopOutcome, PoolError> {
        self.drain(id).await?;

        let deadline = tokio::time::Instant::now() + grace;
        let mut exited = !self.is_alive(id).await?;
        while !exited && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(STOP_POLL_INTERVAL.min(grace)).await;
            exited = !self.is_alive(id).await?;
        }

        self.terminate(id).await?;
        Ok(if exited {
            StopOutcome::Graceful
        } else {
            StopOutcome::Forced
        })
    }
}

/// A call handed to a task unit.
struct UnitCall {
    class: EventClass,
    endpoint: String,
    event: Event,
    reply: oneshot::Sender<Result<(), CallError>>,
}

struct TaskUnit {
    handle: JoinHandle<()>,
    drain_tx: watch::Sender<bool>,
    ready: Arc<AtomicBool>,
    calls: mpsc::UnboundedSender<UnitCall>,
}

/// Hosts worker units as tokio tasks.
///
/// A unit reports ready after `startup_delay`, then runs every call it is
/// handed against the shared downstream client. Draining stops intake; calls
/// already handed over still run to completion before the unit exits.
pub struct TaskRegistry {
    units: Mutex<HashMap<WorkerId, TaskUnit>>,
    downstream: Arc<dyn DownstreamClient>,
    startup_delay: Duration,
}

impl TaskRegistry {
    pub fn new(downstream: Arc<dyn DownstreamClient>) -> Self {
        Self {
            units: Mutex::new(HashMap::new()),
            downstream,
            startup_delay: Duration::ZERO,
        }
    }

    /// Delays readiness of every new unit.
    pub fn with_startup_delay(mut self, delay: Duration) -> Self {
        self.startup_delay = delay;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<WorkerId, TaskUnit>> {
        self.units.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Call handle of one task unit.
struct TaskUnitClient {
    id: WorkerId,
    calls: mpsc::UnboundedSender<UnitCall>,
}

#[async_trait]
impl DownstreamClient for TaskUnitClient {
    async fn call(&self, class: EventClass, endpoint: &str, event: &Event) -> Result<(), CallError> {
        let (reply, outcome) = oneshot::channel();
        self.calls
            .send(UnitCall {
                class,
                endpoint: endpoint.to_string(),
                event: event.clone(),
                reply,
            })
            .map_err(|_| unit_gone(self.id))?;
        outcome.await.map_err(|_| unit_gone(self.id))?
    }
}

fn spawn_call(running: &mut JoinSet<()>, downstream: &Arc<dyn DownstreamClient>, call: UnitCall) {
    let downstream = Arc::clone(downstream);
    running.spawn(async move {
        let outcome = downstream
            .call(call.class, &call.endpoint, &call.event)
            .await;
        let _ = call.reply.send(outcome);
    });
}

fn log_joined(id: WorkerId, joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        warn!(worker_id = %id, error = %e, "Worker call task crashed");
    }
}

#[allow(clippy::too_many_arguments)]
async fn run_task_unit(
    id: WorkerId,
    task_queue: String,
    startup_delay: Duration,
    downstream: Arc<dyn DownstreamClient>,
    ready_flag: Arc<AtomicBool>,
    ready_tx: oneshot::Sender<()>,
    mut drain_rx: watch::Receiver<bool>,
    mut calls: mpsc::UnboundedReceiver<UnitCall>,
) {
    if !startup_delay.is_zero() {
        tokio::time::sleep(startup_delay).await;
    }
    ready_flag.store(true, Ordering::SeqCst);
    let _ = ready_tx.send(());
    info!(worker_id = %id, task_queue = %task_queue, "Worker ready");

    let mut running = JoinSet::new();
    let mut served = 0u64;
    let mut ticker = tokio::time::interval(HEARTBEAT);
    ticker.tick().await;

    loop {
        tokio::select! {
            changed = drain_rx.changed() => {
                if changed.is_err() || *drain_rx.borrow() {
                    break;
                }
            }
            call = calls.recv() => match call {
                Some(call) => {
                    served += 1;
                    spawn_call(&mut running, &downstream, call);
                }
                None => break,
            },
            Some(joined) = running.join_next(), if !running.is_empty() => {
                log_joined(id, joined);
            }
            _ = ticker.tick() => {
                debug!(worker_id = %id, in_flight = running.len(), served, "Worker heartbeat");
            }
        }
    }

    // Calls queued before the drain are still ours to run.
    calls.close();
    while let Some(call) = calls.recv().await {
        served += 1;
        spawn_call(&mut running, &downstream, call);
    }
    while let Some(joined) = running.join_next().await {
        log_joined(id, joined);
    }

    info!(worker_id = %id, served, "Worker drained");
}

#[async_trait]
impl WorkerRegistry for TaskRegistry {
    async fn list(&self) -> Result<Vec<WorkerStatus>, PoolError> {
        let mut units = self.lock();
        units.retain(|_, unit| !unit.handle.is_finished());

        let mut statuses: Vec<WorkerStatus> = units
            .iter()
            .map(|(id, unit)| WorkerStatus {
                id: *id,
                ready: unit.ready.load(Ordering::SeqCst),
            })
            .collect();
        statuses.sort_by_key(|s| s.id);
        Ok(statuses)
    }

    async fn start(
        &self,
        id: WorkerId,
        task_queue: &str,
        ready_timeout: Duration,
    ) -> Result<StartAck, PoolError> {
        let ready_rx = {
            let mut units = self.lock();
            if units.get(&id).is_some_and(|u| !u.handle.is_finished()) {
                return Err(PoolError::AlreadyRunning(id));
            }

            let (ready_tx, ready_rx) = oneshot::channel();
            let (drain_tx, drain_rx) = watch::channel(false);
            let (calls, calls_rx) = mpsc::unbounded_channel();
            let ready = Arc::new(AtomicBool::new(false));

            let handle = tokio::spawn(run_task_unit(
                id,
                task_queue.to_string(),
                self.startup_delay,
                Arc::clone(&self.downstream),
                Arc::clone(&ready),
                ready_tx,
                drain_rx,
                calls_rx,
            ));

            units.insert(
                id,
                TaskUnit {
                    handle,
                    drain_tx,
                    ready,
                    calls,
                },
            );
            ready_rx
        };

        match tokio::time::timeout(ready_timeout, ready_rx).await {
            Ok(Ok(())) => Ok(StartAck::Ready),
            Ok(Err(_)) => Err(PoolError::StartFailed {
                id,
                reason: "worker task exited before reporting ready".into(),
            }),
            Err(_) => Ok(StartAck::TimedOut),
        }
    }

    async fn drain(&self, id: WorkerId) -> Result<(), PoolError> {
        if let Some(unit) = self.lock().get(&id) {
            let _ = unit.drain_tx.send(true);
        }
        Ok(())
    }

    async fn is_alive(&self, id: WorkerId) -> Result<bool, PoolError> {
        Ok(self
            .lock()
            .get(&id)
            .is_some_and(|unit| !unit.handle.is_finished()))
    }

    async fn terminate(&self, id: WorkerId) -> Result<(), PoolError> {
        if let Some(unit) = self.lock().remove(&id) {
            unit.handle.abort();
        }
        Ok(())
    }

    async fn client(&self, id: WorkerId) -> Result<Option<Arc<dyn DownstreamClient>>, PoolError> {
        let units = self.lock();
        let Some(unit) = units.get(&id) else {
            return Ok(None);
        };
        let accepting = !unit.handle.is_finished()
            && unit.ready.load(Ordering::SeqCst)
            && !*unit.drain_tx.borrow();
        Ok(accepting.then(|| {
            Arc::new(TaskUnitClient {
                id,
                calls: unit.calls.clone(),
            }) as Arc<dyn DownstreamClient>
        }))
    }
}
