//! WorkerLoop - タスク実行ループ
//!
//! # フロー
//! 1. TaskQueue::dequeue() で lease 取得
//! 2. Dispatcher::execute() で集計を実行（panic はタスク単位で隔離）
//! 3. 成功 → ack / 一時的な失敗 → retry / 恒久的な失敗 → fail (dead-letter)
//!
//! Shutdown has two stages: `stop` ends pulling, then after the grace period
//! `abort` is fired into running aggregations and the tasks are aborted.

use std::sync::Arc;
use std::time::Duration;

use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, instrument, warn};

use crate::domain::{ErrorKind, RollupError, TaskEnvelope};
use crate::queue::TaskQueue;

use super::dispatch::{Dispatcher, Execution};

pub struct WorkerGroup {
    stop: CancellationToken,
    abort: CancellationToken,
    workers: JoinSet<()>,
}

impl WorkerGroup {
    /// Spawns `concurrency` workers pulling from `queues`. Cancelling `parent` has
    /// the same effect as [`WorkerGroup::request_shutdown`].
    pub fn spawn(
        concurrency: usize,
        queue: Arc<dyn TaskQueue>,
        dispatcher: Arc<Dispatcher>,
        queues: Vec<String>,
        parent: &CancellationToken,
    ) -> Self {
        let stop = parent.child_token();
        let abort = CancellationToken::new();
        let queues: Arc<[String]> = queues.into();

        let mut workers = JoinSet::new();
        for worker_id in 0..concurrency {
            workers.spawn(worker_loop(
                worker_id,
                Arc::clone(&queue),
                Arc::clone(&dispatcher),
                Arc::clone(&queues),
                stop.clone(),
                abort.clone(),
            ));
        }
        info!(concurrency, ?queues, "workers started");

        Self {
            stop,
            abort,
            workers,
        }
    }

    /// Stop taking new leases. In-flight aggregations keep running.
    pub fn request_shutdown(&self) {
        self.stop.cancel();
    }

    /// Stops pulling, waits up to `grace` for in-flight tasks, then cancels and
    /// aborts whatever is still running. Returns `true` when everything finished
    /// within the grace period.
    pub async fn shutdown_and_join(mut self, grace: Duration) -> bool {
        self.request_shutdown();
        let drained = tokio::time::timeout(grace, async {
            while self.workers.join_next().await.is_some() {}
        })
        .await
        .is_ok();

        if !drained {
            warn!(?grace, remaining = self.workers.len(), "grace period elapsed, aborting workers");
            self.abort.cancel();
            self.workers.abort_all();
            while self.workers.join_next().await.is_some() {}
        }
        info!(drained, "workers stopped");
        drained
    }
}

#[instrument(skip(queue, dispatcher, queues, stop, abort))]
async fn worker_loop(
    worker_id: usize,
    queue: Arc<dyn TaskQueue>,
    dispatcher: Arc<Dispatcher>,
    queues: Arc<[String]>,
    stop: CancellationToken,
    abort: CancellationToken,
) {
    while let Some(lease) = queue.dequeue(&queues, &stop).await {
        let envelope = lease.envelope().clone();
        let task_id = envelope.task_id();
        let attempt = lease.attempt();

        let settled = match execute_isolated(&dispatcher, &envelope, &abort).await {
            Ok(done) => {
                info!(
                    %task_id,
                    kind = %done.kind,
                    window = %done.window.spec,
                    rows = done.rows,
                    attempt,
                    "roll-up succeeded"
                );
                lease.ack().await
            }
            Err(err) if err.kind() == ErrorKind::Permanent => {
                error!(%task_id, kind = %envelope.kind(), attempt, error = %err, "permanent failure, dead-lettering");
                lease.fail(err.to_string()).await
            }
            Err(err) => {
                warn!(%task_id, kind = %envelope.kind(), attempt, error = %err, "roll-up failed, handing back for retry");
                lease.retry(err.to_string()).await
            }
        };

        if let Err(e) = settled {
            error!(%task_id, error = %e, "could not settle lease");
        }
    }
}

/// Runs one execution in its own task so a panicking aggregation fails the
/// attempt instead of taking the worker down with it. Dropping the future aborts
/// the execution.
async fn execute_isolated(
    dispatcher: &Arc<Dispatcher>,
    envelope: &TaskEnvelope,
    abort: &CancellationToken,
) -> Result<Execution, RollupError> {
    let mut run = JoinSet::new();
    {
        let dispatcher = Arc::clone(dispatcher);
        let envelope = envelope.clone();
        let abort = abort.clone();
        run.spawn(async move { dispatcher.execute(&envelope, &abort).await });
    }
    match run.join_next().await {
        Some(Ok(result)) => result,
        Some(Err(e)) => Err(RollupError::ExecutionAborted(describe(e))),
        None => Err(RollupError::ExecutionAborted("execution was not started".into())),
    }
}

fn describe(e: JoinError) -> String {
    if !e.is_panic() {
        return "cancelled".into();
    }
    let payload = e.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string payload".into());
    format!("panicked: {message}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::AppBuilder;
    use crate::domain::{
        BusinessCalendar, Granularity, JobKind, ResolvedWindow, RollupError, WindowPayload, WindowSpec,
    };
    use crate::ports::{Aggregation, FixedClock};
    use crate::queue::{InMemoryQueue, QueueOptions, RetryPolicy};
    use async_trait::async_trait;
    use chrono::{NaiveDate, TimeZone, Utc};
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Fails with a storage error the first `failures` times.
    struct Flaky {
        failures: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Aggregation for Flaky {
        async fn execute(&self, _: &ResolvedWindow, _: &CancellationToken) -> Result<u64, RollupError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.failures {
                Err(RollupError::TransientStorage("connection reset".into()))
            } else {
                Ok(1)
            }
        }
    }

    /// Panics the first `panics` times.
    struct Panicky {
        panics: u32,
        calls: AtomicU32,
    }

    #[async_trait]
    impl Aggregation for Panicky {
        async fn execute(&self, _: &ResolvedWindow, _: &CancellationToken) -> Result<u64, RollupError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if call < self.panics {
                panic!("counter overflow on call {call}");
            }
            Ok(1)
        }
    }

    /// Never finishes unless cancelled.
    struct Hang;

    #[async_trait]
    impl Aggregation for Hang {
        async fn execute(&self, _: &ResolvedWindow, cancel: &CancellationToken) -> Result<u64, RollupError> {
            cancel.cancelled().await;
            Err(RollupError::TransientStorage("cancelled".into()))
        }
    }

    fn setup(aggregation: Arc<dyn Aggregation>, max_attempts: u32) -> (InMemoryQueue, Arc<Dispatcher>) {
        let clock = Arc::new(FixedClock::new(Utc.with_ymd_and_hms(2024, 2, 3, 0, 0, 0).unwrap()));
        let queue = InMemoryQueue::new(
            QueueOptions {
                max_attempts,
                retry_policy: RetryPolicy {
                    base_delay: Duration::from_millis(10),
                    ..RetryPolicy::default()
                },
                capacity: None,
                finished_retention: None,
            },
            clock.clone(),
        );
        let registry = AppBuilder::new()
            .register("day", Granularity::Day, aggregation)
            .unwrap()
            .build()
            .unwrap();
        let dispatcher = Dispatcher::new(
            Arc::new(registry),
            BusinessCalendar::utc(),
            clock,
            Duration::from_secs(3600),
        );
        (queue, Arc::new(dispatcher))
    }

    fn day() -> WindowPayload {
        WindowSpec::Day(NaiveDate::from_ymd_opt(2024, 2, 1).unwrap()).into()
    }

    #[tokio::test(start_paused = true)]
    async fn transient_failures_are_retried_until_success() {
        let flaky = Arc::new(Flaky {
            failures: 2,
            calls: AtomicU32::new(0),
        });
        let (queue, dispatcher) = setup(flaky.clone(), 5);
        queue.enqueue(&JobKind::new("day"), day(), "analytics").await.unwrap();

        let group = WorkerGroup::spawn(
            2,
            Arc::new(queue.clone()),
            dispatcher,
            vec!["analytics".into()],
            &CancellationToken::new(),
        );
        queue.wait_drained().await;
        assert!(group.shutdown_and_join(Duration::from_secs(1)).await);

        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.succeeded, 1);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
        assert_eq!(queue.decisions().await.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_retries_dead_letter() {
        let flaky = Arc::new(Flaky {
            failures: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let (queue, dispatcher) = setup(flaky.clone(), 3);
        queue.enqueue(&JobKind::new("day"), day(), "analytics").await.unwrap();

        let group = WorkerGroup::spawn(1, Arc::new(queue.clone()), dispatcher, vec!["analytics".into()], &CancellationToken::new());
        queue.wait_drained().await;
        group.shutdown_and_join(Duration::from_secs(1)).await;

        assert_eq!(queue.counts().await.unwrap().dead, 1);
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_aggregation_is_retried_and_the_worker_survives() {
        let panicky = Arc::new(Panicky {
            panics: 1,
            calls: AtomicU32::new(0),
        });
        let (queue, dispatcher) = setup(panicky.clone(), 5);
        let first = queue.enqueue(&JobKind::new("day"), day(), "analytics").await.unwrap();
        queue.enqueue(&JobKind::new("day"), day(), "analytics").await.unwrap();

        let group = WorkerGroup::spawn(1, Arc::new(queue.clone()), dispatcher, vec!["analytics".into()], &CancellationToken::new());
        tokio::time::timeout(Duration::from_secs(60), queue.wait_drained())
            .await
            .unwrap();
        assert!(group.shutdown_and_join(Duration::from_secs(1)).await);

        let counts = queue.counts().await.unwrap();
        assert_eq!((counts.succeeded, counts.running, counts.dead), (2, 0, 0));
        assert_eq!(panicky.calls.load(Ordering::SeqCst), 3);

        let attempts = queue.attempts().await;
        let failed = attempts.iter().find(|a| a.task_id == first.task_id && a.attempt == 1).unwrap();
        let error = failed.error.as_deref().unwrap();
        assert!(error.contains("panicked: counter overflow on call 0"), "{error}");
    }

    #[tokio::test(start_paused = true)]
    async fn aggregation_that_always_panics_is_dead_lettered() {
        let panicky = Arc::new(Panicky {
            panics: u32::MAX,
            calls: AtomicU32::new(0),
        });
        let (queue, dispatcher) = setup(panicky.clone(), 2);
        queue.enqueue(&JobKind::new("day"), day(), "analytics").await.unwrap();

        let group = WorkerGroup::spawn(1, Arc::new(queue.clone()), dispatcher, vec!["analytics".into()], &CancellationToken::new());
        tokio::time::timeout(Duration::from_secs(60), queue.wait_drained())
            .await
            .unwrap();
        group.shutdown_and_join(Duration::from_secs(1)).await;

        assert_eq!(queue.counts().await.unwrap().dead, 1);
        assert_eq!(panicky.calls.load(Ordering::SeqCst), 2);
        assert_eq!(queue.decisions().await.last().unwrap().decision, "mark_dead");
    }

    #[tokio::test]
    async fn unknown_kind_goes_straight_to_dead_letter() {
        let (queue, dispatcher) = setup(Arc::new(Flaky { failures: 0, calls: AtomicU32::new(0) }), 5);
        queue.enqueue(&JobKind::new("analytics:gone"), day(), "analytics").await.unwrap();

        let group = WorkerGroup::spawn(1, Arc::new(queue.clone()), dispatcher, vec!["analytics".into()], &CancellationToken::new());
        queue.wait_drained().await;
        group.shutdown_and_join(Duration::from_secs(1)).await;

        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.dead, 1);
        assert_eq!(queue.attempts().await.len(), 1);
        assert_eq!(queue.decisions().await[0].policy, "permanent_error");
    }

    #[tokio::test(start_paused = true)]
    async fn grace_period_expiry_cancels_in_flight_work() {
        let (queue, dispatcher) = setup(Arc::new(Hang), 5);
        queue.enqueue(&JobKind::new("day"), day(), "analytics").await.unwrap();

        let group = WorkerGroup::spawn(1, Arc::new(queue.clone()), dispatcher, vec!["analytics".into()], &CancellationToken::new());
        while queue.counts().await.unwrap().running == 0 {
            tokio::task::yield_now().await;
        }

        assert!(!group.shutdown_and_join(Duration::from_millis(100)).await);
    }

    #[tokio::test]
    async fn parent_cancellation_stops_idle_workers() {
        let (queue, dispatcher) = setup(Arc::new(Hang), 5);
        let parent = CancellationToken::new();
        let group = WorkerGroup::spawn(3, Arc::new(queue), dispatcher, vec!["analytics".into()], &parent);
        parent.cancel();
        assert!(group.shutdown_and_join(Duration::from_secs(5)).await);
    }
}
