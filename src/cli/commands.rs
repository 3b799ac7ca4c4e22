//! CLI command definitions for ratelimit-manager.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, ValueEnum};
use tokio::io::BufReader;
use tracing::{debug, info, warn};

use crate::config::ManagerConfig;
use crate::error::ErrorCategory;
use crate::metrics::{export_metrics, init_metrics};
use crate::scheduler::{
    serve_calls, CostModel, DownstreamClient, EventQueue, FailurePolicy, Manager, ProcessRegistry,
    QueueName, RedisEventQueue, RunStatus, RunSummary, SimulatedDownstream, TaskRegistry,
    WorkerRegistry,
};
use crate::source::{events_from_records, record_table, SqliteWalletSource, WalletSource};

/// Wallet records fetched per page when enqueueing.
const DEFAULT_PAGE_SIZE: u64 = 500;

/// Rows shown by `stats` in table order and at random.
const SAMPLE_RECORDS: u64 = 10;
const RANDOM_RECORDS: u64 = 5;

/// Rate-limited, dynamically scaled wallet audit pipeline.
#[derive(Parser)]
#[command(name = "ratelimit-manager")]
#[command(about = "Drain wallet audit events within a deadline under downstream rate limits")]
#[command(version)]
#[command(
    long_about = "ratelimit-manager sizes a worker pool so that queued wallet audit events clear within a deadline.\n\nExample usage:\n  ratelimit-manager enqueue --database wallets.db\n  ratelimit-manager run --deadline-secs 180 --max-workers 20"
)]
pub struct Cli {
    /// The subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,

    /// Log level (trace, debug, info, warn, error).
    #[arg(short, long, default_value = "info", global = true)]
    pub log_level: String,
}

/// Available CLI subcommands.
#[derive(clap::Subcommand)]
pub enum Commands {
    /// Run the control loop until the queues are drained.
    Run(RunArgs),

    /// Load wallet records, derive events and push them to the pending queue.
    Enqueue(EnqueueArgs),

    /// Print wallet field statistics.
    Stats(StatsArgs),

    /// Show queue depths, store health and the newest failed entries.
    Queue(QueueArgs),

    /// Host a single worker unit. Started by the process registry.
    #[command(hide = true)]
    Worker(WorkerArgs),
}

/// Queue store connection flags shared by several commands.
#[derive(Args, Debug, Clone, Default)]
pub struct StoreArgs {
    /// Redis URL of the queue store.
    #[arg(long, env = "RLM_REDIS_URL")]
    pub redis_url: Option<String>,

    /// Key namespace for the queues.
    #[arg(long, env = "RLM_NAMESPACE")]
    pub namespace: Option<String>,
}

/// How worker units are hosted.
#[derive(ValueEnum, Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WorkerMode {
    /// Tokio tasks inside this process.
    #[default]
    Task,
    /// Child processes running `ratelimit-manager worker`.
    Process,
}

/// Arguments for `ratelimit-manager run`.
#[derive(Parser, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Wall-clock budget per cycle, in seconds.
    #[arg(long)]
    pub deadline_secs: Option<u64>,

    /// Lower bound on live workers.
    #[arg(long)]
    pub min_workers: Option<u32>,

    /// Upper bound on live workers.
    #[arg(long)]
    pub max_workers: Option<u32>,

    /// Requeues allowed before an event is parked.
    #[arg(long)]
    pub max_retries: Option<u32>,

    /// Also cap the plan at the per-class rate ceiling.
    #[arg(long)]
    pub enforce_rate_ceiling: bool,

    /// YAML file overriding the cost table.
    #[arg(long, env = "RLM_COST_TABLE")]
    pub cost_table: Option<PathBuf>,

    /// How worker units are hosted.
    #[arg(long, value_enum, default_value_t = WorkerMode::Task)]
    pub workers: WorkerMode,

    /// Make every N-th simulated downstream call fail transiently.
    #[arg(long)]
    pub fail_every: Option<u64>,

    /// Print Prometheus metrics after the run.
    #[arg(long)]
    pub print_metrics: bool,

    /// Output JSON summary.
    #[arg(short = 'j', long)]
    pub json: bool,
}

impl RunArgs {
    /// Applies command-line overrides on top of `config`.
    pub fn apply(&self, mut config: ManagerConfig) -> ManagerConfig {
        apply_store(&self.store, &mut config);
        if let Some(secs) = self.deadline_secs {
            config.deadline = Duration::from_secs(secs);
        }
        if let Some(min) = self.min_workers {
            config.min_workers = min;
        }
        if let Some(max) = self.max_workers {
            config.max_workers = max;
        }
        if let Some(retries) = self.max_retries {
            config.max_retries = retries;
        }
        if self.enforce_rate_ceiling {
            config.enforce_rate_ceiling = true;
        }
        if let Some(path) = &self.cost_table {
            config.cost_table = Some(path.clone());
        }
        config
    }
}

/// Arguments for `ratelimit-manager enqueue`.
#[derive(Parser, Debug)]
pub struct EnqueueArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Wallet database path or sqlite:// URL.
    #[arg(short = 'd', long, env = "RLM_DATABASE_URL")]
    pub database: Option<String>,

    /// First record to load.
    #[arg(long, default_value = "0")]
    pub offset: u64,

    /// Maximum records to load (default: all).
    #[arg(short = 'n', long)]
    pub limit: Option<u64>,

    /// Records fetched per page.
    #[arg(long, default_value_t = DEFAULT_PAGE_SIZE)]
    pub page_size: u64,
}

/// Arguments for `ratelimit-manager stats`.
#[derive(Parser, Debug)]
pub struct StatsArgs {
    /// Wallet database path or sqlite:// URL.
    #[arg(short = 'd', long, env = "RLM_DATABASE_URL")]
    pub database: Option<String>,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `ratelimit-manager queue`.
#[derive(Parser, Debug)]
pub struct QueueArgs {
    #[command(flatten)]
    pub store: StoreArgs,

    /// Number of failed entries to show.
    #[arg(long, default_value = "10")]
    pub peek: usize,

    /// Output JSON.
    #[arg(short = 'j', long)]
    pub json: bool,
}

/// Arguments for `ratelimit-manager worker`.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Worker id assigned by the pool.
    #[arg(long)]
    pub id: u32,

    /// Task queue the unit serves.
    #[arg(long)]
    pub task_queue: String,

    /// YAML file overriding the cost table.
    #[arg(long, env = "RLM_COST_TABLE")]
    pub cost_table: Option<PathBuf>,

    /// Make every N-th simulated downstream call fail transiently.
    #[arg(long)]
    pub fail_every: Option<u64>,
}

/// Parse CLI arguments and return the Cli struct.
///
/// This allows main.rs to access CLI arguments (like log_level) before running commands.
pub fn parse_cli() -> Cli {
    Cli::parse()
}

/// Run the CLI by parsing arguments and executing the command.
pub async fn run() -> anyhow::Result<()> {
    run_with_cli(parse_cli()).await
}

/// Run the CLI with the parsed arguments.
pub async fn run_with_cli(cli: Cli) -> anyhow::Result<()> {
    match cli.command {
        Commands::Run(args) => run_manager_command(args).await,
        Commands::Enqueue(args) => run_enqueue_command(args).await,
        Commands::Stats(args) => run_stats_command(args).await,
        Commands::Queue(args) => run_queue_command(args).await,
        Commands::Worker(args) => run_worker_command(args).await,
    }
}

fn apply_store(store: &StoreArgs, config: &mut ManagerConfig) {
    if let Some(url) = &store.redis_url {
        config.redis_url = url.clone();
    }
    if let Some(namespace) = &store.namespace {
        config.namespace = namespace.clone();
    }
}

fn load_config(store: &StoreArgs) -> anyhow::Result<ManagerConfig> {
    let mut config = ManagerConfig::from_env()?;
    apply_store(store, &mut config);
    Ok(config)
}

async fn connect_queue(config: &ManagerConfig) -> anyhow::Result<Arc<RedisEventQueue>> {
    let queue = RedisEventQueue::connect(&config.redis_url, &config.namespace)
        .await
        .map_err(|e| anyhow::anyhow!("Failed to connect to queue store {}: {}", config.redis_url, e))?;
    Ok(Arc::new(queue))
}

// ============================================================================
// Run
// ============================================================================

async fn run_manager_command(args: RunArgs) -> anyhow::Result<()> {
    let config = args.apply(ManagerConfig::from_env()?);
    config.validate()?;

    if let Err(e) = init_metrics() {
        warn!(error = %e, "Metrics unavailable");
    }

    let cost = Arc::new(match &config.cost_table {
        Some(path) => CostModel::from_yaml_file(path)?,
        None => CostModel::reference(),
    });

    let queue = connect_queue(&config).await?;

    let registry: Arc<dyn WorkerRegistry> = match args.workers {
        WorkerMode::Task => Arc::new(TaskRegistry::new(simulated_downstream(
            Arc::clone(&cost),
            args.fail_every,
        ))),
        WorkerMode::Process => {
            std::fs::create_dir_all(&config.run_dir)?;
            let mut worker_args = Vec::new();
            if let Some(path) = &config.cost_table {
                worker_args.push("--cost-table".to_string());
                worker_args.push(path.display().to_string());
            }
            if let Some(n) = args.fail_every {
                worker_args.push("--fail-every".to_string());
                worker_args.push(n.to_string());
            }
            Arc::new(
                ProcessRegistry::for_current_exe(config.run_dir.clone())?
                    .with_worker_args(worker_args),
            )
        }
    };

    info!(
        redis_url = %config.redis_url,
        namespace = %config.namespace,
        deadline_secs = config.deadline.as_secs(),
        max_workers = config.max_workers,
        workers = ?args.workers,
        "Starting rate limit manager"
    );

    let manager = Arc::new(Manager::new(config, queue, registry, cost)?);

    let cancel = Arc::clone(&manager);
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received; stopping after the current cycle");
            cancel.cancel();
        }
    });

    let result = manager.run().await;
    manager.shutdown().await;
    let summary = result?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summary)?);
    } else {
        print_run_summary(&summary);
    }

    if args.print_metrics {
        print!("{}", export_metrics());
    }

    Ok(())
}

fn print_run_summary(summary: &RunSummary) {
    let status = match summary.status {
        RunStatus::Completed => "completed",
        RunStatus::Cancelled => "cancelled",
    };
    println!("Run {} after {} cycle(s) in {} ms", status, summary.cycles, summary.duration_ms);
    println!("  processed: {}", summary.events_processed);
    println!("  failed:    {}", summary.events_failed);
    println!("  parked:    {}", summary.parked);
    println!("  peak workers: {}", summary.peak_workers);

    for cycle in &summary.cycle_summaries {
        println!(
            "  cycle {:>3}: processed={} failed={} leftover={} workers={} feasible={} deadline_missed={} {} ms",
            cycle.cycle,
            cycle.events_processed,
            cycle.events_failed,
            cycle.leftover_events,
            cycle.workers_used,
            cycle.feasible,
            cycle.deadline_missed,
            cycle.duration_ms
        );
    }
}

// ============================================================================
// Enqueue / Stats
// ============================================================================

async fn open_source(database: Option<&str>) -> anyhow::Result<SqliteWalletSource> {
    let location = match database {
        Some(db) => db.to_string(),
        None => ManagerConfig::from_env()?.database_url,
    };
    Ok(SqliteWalletSource::open(&location).await?)
}

async fn run_enqueue_command(args: EnqueueArgs) -> anyhow::Result<()> {
    if args.page_size == 0 {
        anyhow::bail!("--page-size must be greater than 0");
    }

    let config = load_config(&args.store)?;
    let source = open_source(args.database.as_deref()).await?;
    let queue = connect_queue(&config).await?;

    let total = source.count().await?;
    let end = match args.limit {
        Some(limit) => total.min(args.offset.saturating_add(limit)),
        None => total,
    };

    let mut offset = args.offset;
    let mut records = 0u64;
    let mut enqueued = 0usize;
    while offset < end {
        let page_size = args.page_size.min(end - offset);
        let page = source.fetch_range(offset, page_size).await?;
        if page.is_empty() {
            break;
        }
        records += page.len() as u64;
        offset += page.len() as u64;

        let events = events_from_records(&page);
        queue.push_batch(QueueName::Pending, &events).await?;
        enqueued += events.len();
        debug!(offset, events = events.len(), "Enqueued page");
    }

    info!(records, enqueued, "Wallet events enqueued");
    println!(
        "Enqueued {} event(s) from {} wallet record(s) into {}:pending",
        enqueued, records, config.namespace
    );
    Ok(())
}

async fn run_stats_command(args: StatsArgs) -> anyhow::Result<()> {
    let source = open_source(args.database.as_deref()).await?;
    let stats = source.field_stats().await?;
    let sample = source.sample(SAMPLE_RECORDS).await?;
    let random = source.random(RANDOM_RECORDS).await?;

    if args.json {
        let report = serde_json::json!({
            "stats": stats,
            "sample": sample,
            "random": random,
        });
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print!("{}", stats);
        println!();
        print!(
            "{}",
            record_table(&format!("Sample Records (first {SAMPLE_RECORDS}):"), &sample)
        );
        println!();
        print!(
            "{}",
            record_table(&format!("Random Records ({RANDOM_RECORDS} samples):"), &random)
        );
    }
    Ok(())
}

// ============================================================================
// Queue
// ============================================================================

async fn run_queue_command(args: QueueArgs) -> anyhow::Result<()> {
    let config = load_config(&args.store)?;
    let queue = connect_queue(&config).await?;

    let health = queue.health_check().await;
    let snapshot = queue.snapshot().await?;
    let failed = queue.peek_failed(args.peek).await?;

    if args.json {
        let output = serde_json::json!({
            "namespace": config.namespace,
            "health": health,
            "snapshot": snapshot,
            "failed": failed,
        });
        println!("{}", serde_json::to_string_pretty(&output)?);
        return Ok(());
    }

    println!("Queue store: {} ({}: {})", config.redis_url, health.status, health.message);
    println!("  pending:   {}", snapshot.pending);
    println!("  in flight: {}", snapshot.in_flight);
    println!("  failed:    {}", snapshot.failed);

    if !failed.is_empty() {
        println!();
        println!("Newest failed entries:");
        for entry in &failed {
            println!("  {} [{}] {}", entry.event_id, entry.failed_at, entry.reason);
        }
    }
    Ok(())
}

// ============================================================================
// Worker
// ============================================================================

fn simulated_downstream(cost: Arc<CostModel>, fail_every: Option<u64>) -> Arc<dyn DownstreamClient> {
    let failures = match fail_every {
        Some(n) if n > 0 => FailurePolicy::EveryNth {
            n,
            category: ErrorCategory::Transient,
        },
        _ => FailurePolicy::None,
    };
    Arc::new(SimulatedDownstream::new(cost).with_failures(failures))
}

async fn run_worker_command(args: WorkerArgs) -> anyhow::Result<()> {
    info!(worker_id = %args.id, task_queue = %args.task_queue, "Worker unit starting");

    let cost = Arc::new(match &args.cost_table {
        Some(path) => CostModel::from_yaml_file(path)?,
        None => CostModel::reference(),
    });
    let downstream = simulated_downstream(cost, args.fail_every);

    // Installed before the ready line so an early SIGTERM is not lost.
    let terminate = terminate_signal()?;
    let worker_id = args.id;
    let shutdown = async move {
        tokio::select! {
            _ = terminate => info!(worker_id = %worker_id, "Termination requested; draining"),
            _ = tokio::signal::ctrl_c() => info!(worker_id = %worker_id, "Interrupted; draining"),
        }
    };

    let served = serve_calls(
        args.id,
        BufReader::new(tokio::io::stdin()),
        tokio::io::stdout(),
        downstream,
        shutdown,
    )
    .await?;

    info!(worker_id = %args.id, served, "Worker unit stopped");
    Ok(())
}

#[cfg(unix)]
fn terminate_signal() -> std::io::Result<impl std::future::Future<Output = ()>> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate())?;
    Ok(async move {
        sigterm.recv().await;
    })
}

#[cfg(not(unix))]
fn terminate_signal() -> std::io::Result<impl std::future::Future<Output = ()>> {
    Ok(std::future::pending::<()>())
}
