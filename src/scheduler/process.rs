//! Worker units as child processes.
//!
//! Each unit runs `<program> worker --id N --task-queue Q [extra args]` and
//! prints `ready` on stdout once initialized. Calls then travel as JSON
//! lines: a [`UnitRequest`] per call on the child's stdin, a [`UnitReply`]
//! per finished call on its stdout. Closing stdin (or SIGTERM) drains the
//! unit: it stops reading, finishes the calls it has and exits.
//!
//! Pid files in the run directory let a restarted manager discover units
//! that are still alive. Adopted units have no pipes, so they count as live
//! but never receive calls.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{CallError, ErrorCategory};

use super::downstream::DownstreamClient;
use super::event::{Event, EventClass, WorkerId};
use super::registry::{unit_gone, StartAck, WorkerRegistry, WorkerStatus};
use super::worker_pool::PoolError;

/// Line a worker prints once it is ready.
pub const READY_LINE: &str = "ready";

/// One call sent to a worker process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitRequest {
    pub call_id: u64,
    pub class: EventClass,
    pub endpoint: String,
    pub event: Event,
}

/// Failure carried back in a [`UnitReply`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplyError {
    pub category: ErrorCategory,
    pub message: String,
}

/// Outcome of one call, written by the worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnitReply {
    pub call_id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ReplyError>,
}

impl UnitReply {
    pub fn from_outcome(call_id: u64, outcome: &Result<(), CallError>) -> Self {
        Self {
            call_id,
            error: outcome.as_ref().err().map(|e| ReplyError {
                category: e.category(),
                message: e.to_string(),
            }),
        }
    }

    pub fn into_outcome(self) -> Result<(), CallError> {
        match self.error {
            None => Ok(()),
            Some(e) => Err(CallError::from_category(e.category, e.message)),
        }
    }
}

type PendingReplies = std::sync::Mutex<HashMap<u64, oneshot::Sender<Result<(), CallError>>>>;

/// Pipes of one child plus the calls waiting on its replies.
struct CallChannel {
    stdin: Mutex<Option<ChildStdin>>,
    pending: PendingReplies,
    next_call: AtomicU64,
    closed: AtomicBool,
}

impl CallChannel {
    fn new(stdin: Option<ChildStdin>) -> Self {
        Self {
            stdin: Mutex::new(stdin),
            pending: std::sync::Mutex::new(HashMap::new()),
            next_call: AtomicU64::new(1),
            closed: AtomicBool::new(false),
        }
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, HashMap<u64, oneshot::Sender<Result<(), CallError>>>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn deliver(&self, reply: UnitReply) {
        match self.pending().remove(&reply.call_id) {
            Some(waiter) => {
                let _ = waiter.send(reply.into_outcome());
            }
            None => debug!(call_id = reply.call_id, "Reply for unknown call"),
        }
    }

    /// Fails every waiting call; later calls fail right away.
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.pending().clear();
    }
}

/// Call handle of one child process.
struct ProcessUnitClient {
    id: WorkerId,
    channel: Arc<CallChannel>,
}

#[async_trait]
impl DownstreamClient for ProcessUnitClient {
    async fn call(&self, class: EventClass, endpoint: &str, event: &Event) -> Result<(), CallError> {
        let call_id = self.channel.next_call.fetch_add(1, Ordering::SeqCst);
        let request = UnitRequest {
            call_id,
            class,
            endpoint: endpoint.to_string(),
            event: event.clone(),
        };
        let mut line = serde_json::to_string(&request)
            .map_err(|e| CallError::Malformed(e.to_string()))?;
        line.push('\n');

        let (waiter, reply) = oneshot::channel();
        self.channel.pending().insert(call_id, waiter);
        if self.channel.closed.load(Ordering::SeqCst) {
            self.channel.pending().remove(&call_id);
            return Err(unit_gone(self.id));
        }

        let written = {
            let mut stdin = self.channel.stdin.lock().await;
            match stdin.as_mut() {
                Some(pipe) => match pipe.write_all(line.as_bytes()).await {
                    Ok(()) => pipe.flush().await,
                    Err(e) => Err(e),
                },
                None => {
                    self.channel.pending().remove(&call_id);
                    return Err(unit_gone(self.id));
                }
            }
        };
        if let Err(e) = written {
            self.channel.pending().remove(&call_id);
            return Err(CallError::Transient(format!(
                "worker {} stdin write failed: {e}",
                self.id
            )));
        }

        reply.await.map_err(|_| unit_gone(self.id))?
    }
}

struct ChildUnit {
    child: Child,
    pid: u32,
    ready: Arc<AtomicBool>,
    channel: Arc<CallChannel>,
}

/// Registry that runs worker units as child processes.
pub struct ProcessRegistry {
    program: PathBuf,
    run_dir: PathBuf,
    worker_args: Vec<String>,
    children: Mutex<HashMap<WorkerId, ChildUnit>>,
}

impl ProcessRegistry {
    /// Creates a registry launching `program`, keeping pid files in `run_dir`.
    pub fn new(program: impl Into<PathBuf>, run_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            run_dir: run_dir.into(),
            worker_args: Vec::new(),
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a registry that launches the current executable.
    pub fn for_current_exe(run_dir: impl Into<PathBuf>) -> Result<Self, PoolError> {
        let program = std::env::current_exe()?;
        Ok(Self::new(program, run_dir))
    }

    /// Extra arguments appended to every `worker` invocation.
    pub fn with_worker_args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.worker_args = args.into_iter().map(Into::into).collect();
        self
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    fn pid_file(&self, id: WorkerId) -> PathBuf {
        self.run_dir.join(format!("worker-{id}.pid"))
    }

    async fn read_pid(&self, id: WorkerId) -> Option<u32> {
        let content = tokio::fs::read_to_string(self.pid_file(id)).await.ok()?;
        content.trim().parse().ok()
    }

    async fn remove_pid_file(&self, id: WorkerId) {
        if let Err(e) = tokio::fs::remove_file(self.pid_file(id)).await {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(worker_id = %id, error = %e, "Failed to remove pid file");
            }
        }
    }

    async fn signal(pid: u32, signal: &str) -> Result<bool, PoolError> {
        let status = Command::new("kill")
            .arg(format!("-{signal}"))
            .arg(pid.to_string())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .await?;
        Ok(status.success())
    }
}

fn pid_alive(pid: u32) -> bool {
    Path::new("/proc").join(pid.to_string()).exists()
}

fn parse_pid_file_name(name: &str) -> Option<WorkerId> {
    name.strip_prefix("worker-")?
        .strip_suffix(".pid")?
        .parse()
        .ok()
}

#[async_trait]
impl WorkerRegistry for ProcessRegistry {
    async fn list(&self) -> Result<Vec<WorkerStatus>, PoolError> {
        let mut statuses = Vec::new();
        let mut children = self.children.lock().await;

        let mut exited = Vec::new();
        for (id, unit) in children.iter_mut() {
            match unit.child.try_wait() {
                Ok(None) => statuses.push(WorkerStatus {
                    id: *id,
                    ready: unit.ready.load(Ordering::SeqCst),
                }),
                Ok(Some(status)) => {
                    debug!(worker_id = %id, %status, "Worker process exited");
                    exited.push(*id);
                }
                Err(e) => {
                    warn!(worker_id = %id, error = %e, "Failed to poll worker process");
                    exited.push(*id);
                }
            }
        }
        for id in exited {
            children.remove(&id);
            self.remove_pid_file(id).await;
        }

        let mut entries = match tokio::fs::read_dir(&self.run_dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                statuses.sort_by_key(|s| s.id);
                return Ok(statuses);
            }
            Err(e) => return Err(PoolError::Registry(e.to_string())),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| PoolError::Registry(e.to_string()))?
        {
            let name = entry.file_name();
            let Some(id) = name.to_str().and_then(parse_pid_file_name) else {
                continue;
            };
            if children.contains_key(&id) {
                continue;
            }

            match self.read_pid(id).await {
                Some(pid) if pid_alive(pid) => statuses.push(WorkerStatus { id, ready: true }),
                _ => {
                    debug!(worker_id = %id, "Removing stale pid file");
                    self.remove_pid_file(id).await;
                }
            }
        }

        statuses.sort_by_key(|s| s.id);
        Ok(statuses)
    }

    async fn start(
        &self,
        id: WorkerId,
        task_queue: &str,
        ready_timeout: Duration,
    ) -> Result<StartAck, PoolError> {
        if self.is_alive(id).await? {
            return Err(PoolError::AlreadyRunning(id));
        }

        tokio::fs::create_dir_all(&self.run_dir).await?;

        let mut child = Command::new(&self.program)
            .arg("worker")
            .arg("--id")
            .arg(id.to_string())
            .arg("--task-queue")
            .arg(task_queue)
            .args(&self.worker_args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .spawn()?;

        let Some(pid) = child.id() else {
            return Err(PoolError::StartFailed {
                id,
                reason: "process exited immediately".into(),
            });
        };
        tokio::fs::write(self.pid_file(id), pid.to_string()).await?;

        let ready = Arc::new(AtomicBool::new(false));
        let channel = Arc::new(CallChannel::new(child.stdin.take()));
        let (ready_tx, ready_rx) = oneshot::channel();

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(read_worker_output(
                id,
                stdout,
                Arc::clone(&ready),
                ready_tx,
                Arc::clone(&channel),
            ));
        }

        self.children.lock().await.insert(
            id,
            ChildUnit {
                child,
                pid,
                ready,
                channel,
            },
        );

        info!(worker_id = %id, pid, task_queue, "Spawned worker process");

        match tokio::time::timeout(ready_timeout, ready_rx).await {
            Ok(Ok(())) => Ok(StartAck::Ready),
            Ok(Err(_)) => {
                self.terminate(id).await?;
                Err(PoolError::StartFailed {
                    id,
                    reason: "process closed stdout before reporting ready".into(),
                })
            }
            Err(_) => Ok(StartAck::TimedOut),
        }
    }

    async fn drain(&self, id: WorkerId) -> Result<(), PoolError> {
        let channel = self
            .children
            .lock()
            .await
            .get(&id)
            .map(|unit| Arc::clone(&unit.channel));

        match channel {
            Some(channel) => {
                // EOF on stdin is the drain signal for units we spawned.
                drop(channel.stdin.lock().await.take());
            }
            None => {
                if let Some(pid) = self.read_pid(id).await {
                    if !Self::signal(pid, "TERM").await? {
                        debug!(worker_id = %id, pid, "SIGTERM not delivered; process likely gone");
                    }
                }
            }
        }
        Ok(())
    }

    async fn is_alive(&self, id: WorkerId) -> Result<bool, PoolError> {
        {
            let mut children = self.children.lock().await;
            if let Some(unit) = children.get_mut(&id) {
                return Ok(matches!(unit.child.try_wait(), Ok(None)));
            }
        }
        Ok(self.read_pid(id).await.is_some_and(pid_alive))
    }

    async fn terminate(&self, id: WorkerId) -> Result<(), PoolError> {
        let unit = self.children.lock().await.remove(&id);

        match unit {
            Some(mut unit) => {
                if matches!(unit.child.try_wait(), Ok(None)) {
                    if let Err(e) = unit.child.start_kill() {
                        warn!(worker_id = %id, error = %e, "Failed to kill worker process");
                    }
                }
                let _ = tokio::time::timeout(Duration::from_secs(5), unit.child.wait()).await;
            }
            None => {
                if let Some(pid) = self.read_pid(id).await {
                    if pid_alive(pid) {
                        Self::signal(pid, "KILL").await?;
                    }
                }
            }
        }

        self.remove_pid_file(id).await;
        Ok(())
    }

    async fn client(&self, id: WorkerId) -> Result<Option<Arc<dyn DownstreamClient>>, PoolError> {
        let mut children = self.children.lock().await;
        let Some(unit) = children.get_mut(&id) else {
            return Ok(None);
        };
        let stdin_open = unit
            .channel
            .stdin
            .try_lock()
            .map(|stdin| stdin.is_some())
            .unwrap_or(true);
        let accepting = matches!(unit.child.try_wait(), Ok(None))
            && unit.ready.load(Ordering::SeqCst)
            && !unit.channel.closed.load(Ordering::SeqCst)
            && stdin_open;
        Ok(accepting.then(|| {
            Arc::new(ProcessUnitClient {
                id,
                channel: Arc::clone(&unit.channel),
            }) as Arc<dyn DownstreamClient>
        }))
    }
}

/// Reads a child's stdout: the ready line first, then call replies.
async fn read_worker_output(
    id: WorkerId,
    stdout: tokio::process::ChildStdout,
    ready: Arc<AtomicBool>,
    ready_tx: oneshot::Sender<()>,
    channel: Arc<CallChannel>,
) {
    let mut ready_tx = Some(ready_tx);
    let mut lines = BufReader::new(stdout).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        let line = line.trim();
        if line == READY_LINE {
            ready.store(true, Ordering::SeqCst);
            if let Some(tx) = ready_tx.take() {
                let _ = tx.send(());
            }
            continue;
        }
        match serde_json::from_str::<UnitReply>(line) {
            Ok(reply) => channel.deliver(reply),
            Err(_) => debug!(worker_id = %id, line = %line, "Worker output"),
        }
    }
    channel.close();
    debug!(worker_id = %id, "Worker stdout closed");
}

/// Serves calls for one worker unit until its input closes or `shutdown`
/// resolves.
///
/// Writes [`READY_LINE`] first, then one [`UnitReply`] per [`UnitRequest`]
/// read from `input`. Calls run concurrently; once intake stops, calls
/// already read still finish and reply. Returns the number of calls served.
pub async fn serve_calls<R, W, S>(
    id: WorkerId,
    input: R,
    output: W,
    downstream: Arc<dyn DownstreamClient>,
    shutdown: S,
) -> std::io::Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
    S: Future<Output = ()>,
{
    let output = Arc::new(Mutex::new(output));
    write_line(&output, READY_LINE).await?;

    let mut lines = input.lines();
    let mut running = JoinSet::new();
    let mut served = 0u64;
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!(worker_id = %id, "Input closed; draining");
                    break;
                };
                if line.trim().is_empty() {
                    continue;
                }
                let request = match serde_json::from_str::<UnitRequest>(&line) {
                    Ok(request) => request,
                    Err(e) => {
                        warn!(worker_id = %id, error = %e, "Ignoring unreadable call request");
                        continue;
                    }
                };
                served += 1;
                let downstream = Arc::clone(&downstream);
                let output = Arc::clone(&output);
                running.spawn(async move {
                    let outcome = downstream
                        .call(request.class, &request.endpoint, &request.event)
                        .await;
                    let reply = UnitReply::from_outcome(request.call_id, &outcome);
                    match serde_json::to_string(&reply) {
                        Ok(line) => write_line(&output, &line).await,
                        Err(e) => Err(std::io::Error::other(e)),
                    }
                });
            }
            Some(joined) = running.join_next(), if !running.is_empty() => {
                log_reply(id, joined);
            }
            _ = &mut shutdown => {
                info!(worker_id = %id, "Termination requested; draining");
                break;
            }
        }
    }

    while let Some(joined) = running.join_next().await {
        log_reply(id, joined);
    }
    Ok(served)
}

async fn write_line<W>(output: &Mutex<W>, line: &str) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut output = output.lock().await;
    output.write_all(line.as_bytes()).await?;
    output.write_all(b"\n").await?;
    output.flush().await
}

fn log_reply(id: WorkerId, joined: Result<std::io::Result<()>, tokio::task::JoinError>) {
    match joined {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(worker_id = %id, error = %e, "Failed to write call reply"),
        Err(e) => warn!(worker_id = %id, error = %e, "Call task crashed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_pid_file_name() {
        assert_eq!(parse_pid_file_name("worker-3.pid"), Some(3));
        assert_eq!(parse_pid_file_name("worker-x.pid"), None);
        assert_eq!(parse_pid_file_name("other.pid"), None);
    }

    #[cfg(target_os = "linux")]
    #[tokio::test]
    async fn test_list_adopts_live_pid_and_drops_stale() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("worker-1.pid"), std::process::id().to_string()).unwrap();
        std::fs::write(dir.path().join("worker-2.pid"), u32::MAX.to_string()).unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let registry = ProcessRegistry::new("/bin/false", dir.path());
        let listed = registry.list().await.unwrap();

        assert_eq!(listed, vec![WorkerStatus { id: 1, ready: true }]);
        assert!(!dir.path().join("worker-2.pid").exists());
        assert!(registry.is_alive(1).await.unwrap());
        assert!(!registry.is_alive(2).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_without_run_dir_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProcessRegistry::new("/bin/false", dir.path().join("missing"));
        assert!(registry.list().await.unwrap().is_empty());
    }

    #[test]
    fn test_reply_carries_error_category() {
        let failed = UnitReply::from_outcome(7, &Err(CallError::Validation("bad wallet".into())));
        let line = serde_json::to_string(&failed).unwrap();
        assert!(line.contains("\"category\":\"validation\""));

        let parsed: UnitReply = serde_json::from_str(&line).unwrap();
        let err = parsed.into_outcome().unwrap_err();
        assert_eq!(err.category(), ErrorCategory::Validation);

        let ok: UnitReply = serde_json::from_str(r#"{"call_id":8}"#).unwrap();
        assert_eq!(ok.call_id, 8);
        assert!(ok.into_outcome().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_serve_calls_replies_and_drains_on_eof() {
        use crate::scheduler::cost::CostModel;
        use crate::scheduler::downstream::{FailurePolicy, SimulatedDownstream};

        let downstream = Arc::new(
            SimulatedDownstream::new(Arc::new(CostModel::reference())).with_failures(
                FailurePolicy::Subjects(HashMap::from([(
                    "wallet_bad".to_string(),
                    ErrorCategory::ServerError,
                )])),
            ),
        );
        let (mut to_unit, unit_input) = tokio::io::duplex(4096);
        let (unit_output, from_unit) = tokio::io::duplex(4096);

        let server = tokio::spawn(serve_calls(
            4,
            BufReader::new(unit_input),
            unit_output,
            downstream,
            std::future::pending::<()>(),
        ));

        for (call_id, subject) in [(1, "wallet_ok"), (2, "wallet_bad")] {
            let request = UnitRequest {
                call_id,
                class: EventClass::NewBalanceUpdate,
                endpoint: "balances-a".into(),
                event: Event::new(subject, vec![EventClass::NewBalanceUpdate]).unwrap(),
            };
            let mut line = serde_json::to_string(&request).unwrap();
            line.push('\n');
            to_unit.write_all(line.as_bytes()).await.unwrap();
        }
        to_unit.write_all(b"not json\n").await.unwrap();
        drop(to_unit);

        assert_eq!(server.await.unwrap().unwrap(), 2);

        let mut lines = BufReader::new(from_unit).lines();
        assert_eq!(lines.next_line().await.unwrap().unwrap(), READY_LINE);
        let mut replies = Vec::new();
        while let Some(line) = lines.next_line().await.unwrap() {
            replies.push(serde_json::from_str::<UnitReply>(&line).unwrap());
        }
        replies.sort_by_key(|r| r.call_id);

        assert_eq!(replies.len(), 2);
        assert!(replies[0].error.is_none());
        assert_eq!(
            replies[1].error.as_ref().map(|e| e.category),
            Some(ErrorCategory::ServerError)
        );
    }

    #[tokio::test]
    async fn test_start_missing_program_fails() {
        let dir = tempfile::tempdir().unwrap();
        let registry = ProcessRegistry::new(dir.path().join("no-such-binary"), dir.path());
        let result = registry.start(1, "audit", Duration::from_secs(1)).await;
        assert!(matches!(result, Err(PoolError::Io(_))));
    }
}
