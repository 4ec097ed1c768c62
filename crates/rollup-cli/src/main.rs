//! rollup - 集計ワーカーの CLI
//!
//! Everything runs in one process against the in-memory store and queue:
//! `run` keeps the scheduler and workers alive until Ctrl-C, the other commands
//! enqueue their tasks, drain the queue with the worker pool and print a summary.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{FixedOffset, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::time::FormatTime;

use rollup_core::RollupConfig;
use rollup_core::app::{AppBuilder, Backfill, Dispatcher, JobRegistry, RecurringScheduler, Trigger, WorkerGroup};
use rollup_core::domain::{BusinessCalendar, JobKind, parse_date};
use rollup_core::impls::{InMemoryStore, SourceData, TableSizes, aggregation_for};
use rollup_core::ports::{Clock, SystemClock};
use rollup_core::queue::{InMemoryQueue, QueueCounts, TaskQueue};

#[derive(Parser)]
#[command(name = "rollup", version, about = "Windowed analytics roll-ups: schedule, backfill, recompute")]
struct Cli {
    /// Configuration file (TOML). Falls back to $ROLLUP_CONFIG, then built-in defaults.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Source orders and inventory (JSON) loaded into the in-memory store
    #[arg(short, long, global = true)]
    source: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Backfill if needed, then run the scheduler and workers until Ctrl-C
    Run {
        /// Backfill even when daily roll-ups already exist
        #[arg(long)]
        force_backfill: bool,
    },
    /// Enqueue every day, week and month from the oldest order up to yesterday
    Backfill {
        #[arg(long)]
        force: bool,
    },
    /// Enqueue one job kind, e.g. `analytics:weekly_revenue 2024-01-08`
    Trigger {
        /// Job kind; the `analytics:` prefix may be omitted
        kind: String,
        /// YYYY-MM-DD (a Monday for weekly kinds) or YYYY-MM. Defaults to the latest complete window.
        window: Option<String>,
    },
    /// Recompute every daily roll-up for one business date
    Recompute {
        /// YYYY-MM-DD
        date: String,
    },
}

struct BusinessTimer(FixedOffset);

impl FormatTime for BusinessTimer {
    fn format_time(&self, w: &mut tracing_subscriber::fmt::format::Writer<'_>) -> std::fmt::Result {
        write!(
            w,
            "{}",
            Utc::now().with_timezone(&self.0).format("%Y-%m-%dT%H:%M:%S%.3f%:z")
        )
    }
}

/// Process-wide wiring shared by every command.
struct Runtime {
    config: RollupConfig,
    calendar: BusinessCalendar,
    clock: Arc<dyn Clock>,
    store: Arc<InMemoryStore>,
    queue: InMemoryQueue,
    registry: Arc<JobRegistry>,
}

#[derive(Serialize)]
struct Summary<T: Serialize> {
    result: T,
    queue: QueueCounts,
    tables: TableSizes,
}

impl Runtime {
    fn new(config: RollupConfig, source: SourceData) -> Result<Self> {
        let calendar = config.calendar()?;
        let clock: Arc<dyn Clock> = Arc::new(SystemClock);
        let store = Arc::new(InMemoryStore::new(source));
        let queue = InMemoryQueue::new(config.queue_options(), Arc::clone(&clock));
        let registry = AppBuilder::new()
            .register_standard(|kind| aggregation_for(&store, kind))?
            .expect_standard_kinds()
            .build()?;
        Ok(Self {
            config,
            calendar,
            clock,
            store,
            queue,
            registry: Arc::new(registry),
        })
    }

    fn task_queue(&self) -> Arc<dyn TaskQueue> {
        Arc::new(self.queue.clone())
    }

    fn backfill(&self) -> Backfill {
        Backfill::new(
            self.task_queue(),
            Arc::clone(&self.registry),
            self.calendar,
            Arc::clone(&self.clock),
            self.config.queue.name.clone(),
        )
    }

    fn trigger(&self) -> Trigger {
        Trigger::new(
            self.task_queue(),
            Arc::clone(&self.registry),
            self.calendar,
            Arc::clone(&self.clock),
            self.config.queue.name.clone(),
        )
    }

    fn spawn_workers(&self, cancel: &CancellationToken) -> WorkerGroup {
        let dispatcher = Dispatcher::new(
            Arc::clone(&self.registry),
            self.calendar,
            Arc::clone(&self.clock),
            self.config.task_timeout(),
        );
        WorkerGroup::spawn(
            self.config.worker.concurrency,
            self.task_queue(),
            Arc::new(dispatcher),
            self.config.queues(),
            cancel,
        )
    }

    /// Works off everything queued so far, then prints `result` with the queue and
    /// table counts as JSON.
    async fn drain<T: Serialize>(&self, result: T) -> Result<()> {
        let cancel = CancellationToken::new();
        let workers = self.spawn_workers(&cancel);
        tokio::select! {
            _ = self.queue.wait_drained() => {}
            _ = tokio::signal::ctrl_c() => warn!("interrupted, stopping before the queue drained"),
        }
        workers.shutdown_and_join(self.config.shutdown_grace()).await;

        let summary = Summary {
            result,
            queue: self.queue.counts().await?,
            tables: self.store.tables().await.sizes(),
        };
        println!("{}", serde_json::to_string_pretty(&summary)?);
        Ok(())
    }

    async fn run(&self, force_backfill: bool) -> Result<()> {
        match self.backfill().run_guarded(self.store.as_ref(), force_backfill).await {
            Ok(outcome) => info!(?outcome, "startup backfill"),
            Err(e) => warn!(error = %e, "startup backfill failed, continuing"),
        }

        let cancel = CancellationToken::new();
        let scheduler = Arc::new(RecurringScheduler::new(
            self.config.schedule_entries()?,
            &self.registry,
            self.task_queue(),
            self.calendar,
            Arc::clone(&self.clock),
        )?);
        let mut schedules = scheduler.spawn(&cancel);
        let workers = self.spawn_workers(&cancel);

        tokio::signal::ctrl_c().await.context("listen for ctrl-c")?;
        info!("shutting down");
        cancel.cancel();
        while schedules.join_next().await.is_some() {}
        if !workers.shutdown_and_join(self.config.shutdown_grace()).await {
            error!("in-flight roll-ups were aborted");
        }
        info!(counts = ?self.queue.counts().await?, "shutdown complete");
        Ok(())
    }
}

/// Accepts `weekly_revenue` as shorthand for `analytics:weekly_revenue`.
fn job_kind(input: &str) -> JobKind {
    if input.contains(':') {
        JobKind::new(input)
    } else {
        JobKind::new(format!("analytics:{input}"))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = RollupConfig::load(cli.config.as_deref())?;

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt()
        .with_timer(BusinessTimer(config.calendar()?.offset()))
        .with_env_filter(filter)
        .init();

    let source = match &cli.source {
        Some(path) => SourceData::load(path)?,
        None => SourceData::default(),
    };
    let runtime = Runtime::new(config, source)?;

    match cli.command {
        Commands::Run { force_backfill } => runtime.run(force_backfill).await,
        Commands::Backfill { force } => {
            let outcome = runtime
                .backfill()
                .run_guarded(runtime.store.as_ref(), force)
                .await?;
            runtime.drain(outcome).await
        }
        Commands::Trigger { kind, window } => {
            let handle = runtime
                .trigger()
                .trigger(&job_kind(&kind), window.as_deref())
                .await?;
            runtime.drain(handle).await
        }
        Commands::Recompute { date } => {
            let report = runtime.trigger().recompute_day(parse_date(&date)?).await?;
            runtime.drain(report).await
        }
    }
}
