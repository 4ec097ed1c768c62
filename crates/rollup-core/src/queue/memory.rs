//! In-memory queue implementation.

use std::collections::{BinaryHeap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::{Mutex, Notify};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{QueueCounts, RetryPolicy, TaskLease, TaskQueue, TaskRecord, TaskState};
use crate::domain::{
    AttemptOutcome, AttemptRecord, Decider, Decision, DecisionRecord, DefaultDecider, JobKind,
    RollupError, TaskEnvelope, TaskHandle, TaskId, WindowPayload,
};
use crate::ports::{Clock, IdGenerator, UlidGenerator};

/// Error recorded for a lease that was dropped without ack, retry or fail.
const ABANDONED: &str = "lease dropped before it was settled";

#[derive(Debug, Clone)]
pub struct QueueOptions {
    /// Deliveries before a retryable failure is dead-lettered.
    pub max_attempts: u32,
    pub retry_policy: RetryPolicy,
    /// Bound on tasks not yet succeeded or dead. `None` is unbounded.
    pub capacity: Option<usize>,
    /// Succeeded and dead records kept for inspection, oldest evicted first. The
    /// attempt and decision logs are capped at the same length. `None` keeps everything.
    pub finished_retention: Option<usize>,
}

impl Default for QueueOptions {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            retry_policy: RetryPolicy::default(),
            capacity: None,
            finished_retention: None,
        }
    }
}

/// Retry entry. Reverse ordering turns BinaryHeap into a min-heap (earliest first).
#[derive(Debug, Clone, PartialEq, Eq)]
struct ScheduledTask {
    next_run_at: Instant,
    task_id: TaskId,
}

impl PartialOrd for ScheduledTask {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ScheduledTask {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other.next_run_at.cmp(&self.next_run_at)
    }
}

struct QueueState {
    records: HashMap<TaskId, TaskRecord>,

    /// Ready ids per named queue, FIFO.
    ready: HashMap<String, VecDeque<TaskId>>,

    scheduled: BinaryHeap<ScheduledTask>,

    /// Terminal ids in the order they finished.
    finished: VecDeque<TaskId>,

    attempts: VecDeque<AttemptRecord>,
    decisions: VecDeque<DecisionRecord>,

    /// Moved on every state change. `succeeded` and `dead` are lifetime totals
    /// and survive eviction.
    counts: QueueCounts,

    retention: Option<usize>,
    closed: bool,
}

impl QueueState {
    fn new(retention: Option<usize>) -> Self {
        Self {
            records: HashMap::new(),
            ready: HashMap::new(),
            scheduled: BinaryHeap::new(),
            finished: VecDeque::new(),
            attempts: VecDeque::new(),
            decisions: VecDeque::new(),
            counts: QueueCounts::default(),
            retention,
            closed: false,
        }
    }

    fn insert(&mut self, record: TaskRecord) {
        self.counts.add(record.state);
        self.records.insert(record.envelope.task_id(), record);
    }

    /// Every transition of a stored record goes through here so the counters and
    /// the retention window stay in step.
    fn update<R>(&mut self, task_id: TaskId, f: impl FnOnce(&mut TaskRecord) -> R) -> Option<R> {
        let record = self.records.get_mut(&task_id)?;
        let before = record.state;
        let out = f(record);
        let after = record.state;
        if before != after {
            self.counts.remove(before);
            self.counts.add(after);
            if after.is_terminal() {
                self.finished.push_back(task_id);
                self.evict_finished();
            }
        }
        Some(out)
    }

    fn evict_finished(&mut self) {
        let Some(limit) = self.retention else {
            return;
        };
        while self.finished.len() > limit {
            if let Some(old) = self.finished.pop_front() {
                self.records.remove(&old);
            }
        }
    }

    fn push_attempt(&mut self, attempt: AttemptRecord) {
        self.attempts.push_back(attempt);
        trim(&mut self.attempts, self.retention);
    }

    fn push_decision(&mut self, decision: DecisionRecord) {
        self.decisions.push_back(decision);
        trim(&mut self.decisions, self.retention);
    }

    fn promote_due(&mut self, now: Instant, wall: chrono::DateTime<chrono::Utc>) {
        while let Some(entry) = self.scheduled.peek() {
            if entry.next_run_at > now {
                break;
            }
            let Some(entry) = self.scheduled.pop() else {
                break;
            };
            let requeued = self
                .update(entry.task_id, |record| {
                    (record.state == TaskState::RetryScheduled).then(|| {
                        record.requeue(wall);
                        record.envelope.queue().to_string()
                    })
                })
                .flatten();
            if let Some(queue) = requeued {
                self.ready.entry(queue).or_default().push_back(entry.task_id);
            }
        }
    }

    fn pop_ready(&mut self, queues: &[String]) -> Option<TaskId> {
        queues
            .iter()
            .find_map(|name| self.ready.get_mut(name).and_then(VecDeque::pop_front))
    }
}

fn trim<T>(log: &mut VecDeque<T>, limit: Option<usize>) {
    if let Some(limit) = limit {
        while log.len() > limit {
            log.pop_front();
        }
    }
}

struct Shared {
    state: Mutex<QueueState>,
    /// Wakes workers: new task, retry scheduled, close.
    ready: Notify,
    /// Wakes drain waiters: a task reached a terminal state.
    settled: Notify,
    clock: Arc<dyn Clock>,
    ids: UlidGenerator<Arc<dyn Clock>>,
    decider: Box<dyn Decider>,
    options: QueueOptions,
}

impl Shared {
    /// Records a failed delivery and lets the decider pick backoff or dead-letter.
    /// Returns `true` when a retry was scheduled.
    fn record_failure(
        &self,
        state: &mut QueueState,
        envelope: &TaskEnvelope,
        attempt: AttemptRecord,
        error: String,
    ) -> bool {
        let task_id = envelope.task_id();
        let now = self.clock.now();
        state.push_attempt(attempt);

        let Some(record) = state.records.get(&task_id) else {
            return false;
        };
        let trigger = serde_json::json!({
            "error": error,
            "attempts": record.attempts,
            "max_attempts": record.max_attempts,
        });

        match self.decider.decide(record) {
            Decision::Retry { delay, reason } => {
                let next_run_at = Instant::now() + delay;
                state.update(task_id, |record| record.schedule_retry(next_run_at, error, now));
                state.scheduled.push(ScheduledTask { next_run_at, task_id });
                let context = Some(serde_json::json!({
                    "delay_ms": u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "reason": reason,
                }));
                state.push_decision(DecisionRecord::new(
                    task_id,
                    trigger,
                    "retry_policy",
                    "schedule_retry",
                    context,
                    now,
                ));
                true
            }
            Decision::MarkDead { reason } => {
                warn!(task_id = %task_id, kind = %envelope.kind(), %reason, "dead-lettered");
                state.update(task_id, |record| record.mark_dead(error, now));
                state.push_decision(DecisionRecord::new(
                    task_id,
                    trigger,
                    "retry_policy",
                    "mark_dead",
                    Some(serde_json::json!({ "reason": reason })),
                    now,
                ));
                false
            }
        }
    }

    fn after_failure(&self, scheduled: bool) {
        if scheduled {
            self.ready.notify_waiters();
        } else {
            self.settled.notify_waiters();
        }
    }
}

/// In-memory [`TaskQueue`]. Delivery is at-least-once within the process; nothing
/// survives a restart.
#[derive(Clone)]
pub struct InMemoryQueue {
    shared: Arc<Shared>,
}

impl InMemoryQueue {
    pub fn new(options: QueueOptions, clock: Arc<dyn Clock>) -> Self {
        let decider = DefaultDecider::new(options.retry_policy.clone());
        Self::with_decider(options, clock, Box::new(decider))
    }

    pub fn with_decider(options: QueueOptions, clock: Arc<dyn Clock>, decider: Box<dyn Decider>) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState::new(options.finished_retention)),
                ready: Notify::new(),
                settled: Notify::new(),
                ids: UlidGenerator::new(Arc::clone(&clock)),
                clock,
                decider,
                options,
            }),
        }
    }

    /// Rejects all further enqueues with `QueueUnavailable`. Queued tasks still deliver.
    pub async fn close(&self) {
        self.shared.state.lock().await.closed = true;
        self.shared.ready.notify_waiters();
    }

    pub async fn attempts(&self) -> Vec<AttemptRecord> {
        self.shared.state.lock().await.attempts.iter().cloned().collect()
    }

    pub async fn decisions(&self) -> Vec<DecisionRecord> {
        self.shared.state.lock().await.decisions.iter().cloned().collect()
    }

    /// Snapshot of every retained record, ordered by task id.
    pub async fn tasks(&self) -> Vec<TaskRecord> {
        let state = self.shared.state.lock().await;
        let mut records: Vec<_> = state.records.values().cloned().collect();
        records.sort_by_key(|r| r.envelope.task_id());
        records
    }

    /// Returns once no task is queued, running or waiting for a retry.
    pub async fn wait_drained(&self) {
        loop {
            let settled = self.shared.settled.notified();
            tokio::pin!(settled);
            settled.as_mut().enable();
            if self.shared.state.lock().await.counts.pending() == 0 {
                return;
            }
            settled.await;
        }
    }

    fn settle(&self) {
        self.shared.settled.notify_waiters();
    }
}

#[async_trait]
impl TaskQueue for InMemoryQueue {
    async fn enqueue(
        &self,
        kind: &JobKind,
        payload: WindowPayload,
        queue: &str,
    ) -> Result<TaskHandle, RollupError> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| RollupError::PayloadDecode(format!("encode {kind}: {e}")))?;
        let handle = {
            let mut state = self.shared.state.lock().await;
            if state.closed {
                return Err(RollupError::QueueUnavailable("queue is closed".into()));
            }
            if let Some(capacity) = self.shared.options.capacity
                && state.counts.pending() >= capacity
            {
                return Err(RollupError::QueueUnavailable(format!(
                    "queue is full ({capacity} pending tasks)"
                )));
            }

            let task_id = self.shared.ids.generate_task_id();
            let envelope = TaskEnvelope::new(task_id, kind.clone(), queue, payload);
            let handle = TaskHandle::from(&envelope);
            state.insert(TaskRecord::new(envelope, self.shared.options.max_attempts, self.shared.clock.now()));
            state.ready.entry(queue.to_string()).or_default().push_back(task_id);
            handle
        };
        debug!(task_id = %handle.task_id, kind = %kind, queue, "enqueued");
        self.shared.ready.notify_waiters();
        Ok(handle)
    }

    async fn dequeue(
        &self,
        queues: &[String],
        cancel: &CancellationToken,
    ) -> Option<Box<dyn TaskLease>> {
        loop {
            if cancel.is_cancelled() {
                return None;
            }
            // Register interest before inspecting state so a concurrent enqueue cannot slip by.
            let notified = self.shared.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            let next_wake = {
                let mut guard = self.shared.state.lock().await;
                let state = &mut *guard;
                let wall = self.shared.clock.now();
                state.promote_due(Instant::now(), wall);

                if let Some(task_id) = state.pop_ready(queues)
                    && let Some((envelope, attempt)) = state.update(task_id, |record| {
                        record.start_attempt(wall);
                        (record.envelope.clone(), record.attempts)
                    })
                {
                    return Some(Box::new(InMemoryLease {
                        queue: self.clone(),
                        envelope,
                        attempt,
                        settled: AtomicBool::new(false),
                    }));
                }
                state.scheduled.peek().map(|entry| entry.next_run_at)
            };

            match next_wake {
                Some(wake_at) => tokio::select! {
                    _ = cancel.cancelled() => return None,
                    _ = &mut notified => {},
                    _ = tokio::time::sleep_until(wake_at) => {},
                },
                None => tokio::select! {
                    _ = cancel.cancelled() => return None,
                    _ = &mut notified => {},
                },
            }
        }
    }

    async fn counts(&self) -> Result<QueueCounts, RollupError> {
        Ok(self.shared.state.lock().await.counts)
    }
}

struct InMemoryLease {
    queue: InMemoryQueue,
    envelope: TaskEnvelope,
    attempt: u32,
    /// Set by ack, retry and fail. A lease dropped while unset is treated as a
    /// failed delivery so the task is never stranded in Running.
    settled: AtomicBool,
}

impl InMemoryLease {
    fn attempt_record(&self, outcome: AttemptOutcome, error: Option<String>) -> AttemptRecord {
        let shared = &self.queue.shared;
        AttemptRecord {
            attempt_id: shared.ids.generate_attempt_id(),
            task_id: self.envelope.task_id(),
            kind: self.envelope.kind().clone(),
            attempt: self.attempt,
            outcome,
            error,
            finished_at: shared.clock.now(),
        }
    }

    fn mark_settled(&self) {
        self.settled.store(true, Ordering::SeqCst);
    }
}

impl Drop for InMemoryLease {
    fn drop(&mut self) {
        if self.settled.load(Ordering::SeqCst) {
            return;
        }
        warn!(
            task_id = %self.envelope.task_id(),
            kind = %self.envelope.kind(),
            attempt = self.attempt,
            "lease dropped unsettled, handing back for retry"
        );
        let attempt = self.attempt_record(AttemptOutcome::Failed, Some(ABANDONED.into()));
        let shared = Arc::clone(&self.queue.shared);
        let envelope = self.envelope.clone();

        if let Ok(mut state) = shared.state.try_lock() {
            let scheduled = shared.record_failure(&mut state, &envelope, attempt, ABANDONED.into());
            drop(state);
            shared.after_failure(scheduled);
        } else if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                let scheduled = {
                    let mut state = shared.state.lock().await;
                    shared.record_failure(&mut state, &envelope, attempt, ABANDONED.into())
                };
                shared.after_failure(scheduled);
            });
        }
    }
}

#[async_trait]
impl TaskLease for InMemoryLease {
    fn envelope(&self) -> &TaskEnvelope {
        &self.envelope
    }

    fn attempt(&self) -> u32 {
        self.attempt
    }

    async fn ack(self: Box<Self>) -> Result<(), RollupError> {
        self.mark_settled();
        let attempt = self.attempt_record(AttemptOutcome::Succeeded, None);
        {
            let shared = &self.queue.shared;
            let now = shared.clock.now();
            let mut state = shared.state.lock().await;
            state.push_attempt(attempt);
            state.update(self.envelope.task_id(), |record| record.mark_succeeded(now));
        }
        self.queue.settle();
        Ok(())
    }

    async fn retry(self: Box<Self>, error: String) -> Result<(), RollupError> {
        self.mark_settled();
        let attempt = self.attempt_record(AttemptOutcome::Failed, Some(error.clone()));
        let shared = &self.queue.shared;
        let scheduled = {
            let mut state = shared.state.lock().await;
            shared.record_failure(&mut state, &self.envelope, attempt, error)
        };
        shared.after_failure(scheduled);
        Ok(())
    }

    async fn fail(self: Box<Self>, error: String) -> Result<(), RollupError> {
        self.mark_settled();
        let attempt = self.attempt_record(AttemptOutcome::Rejected, Some(error.clone()));
        let task_id = self.envelope.task_id();
        {
            let shared = &self.queue.shared;
            let now = shared.clock.now();
            let mut state = shared.state.lock().await;
            state.push_attempt(attempt);
            let trigger = state.records.get(&task_id).map(|record| {
                serde_json::json!({
                    "error": error,
                    "attempts": record.attempts,
                    "max_attempts": record.max_attempts,
                })
            });
            if let Some(trigger) = trigger {
                state.update(task_id, |record| record.mark_dead(error, now));
                state.push_decision(DecisionRecord::new(
                    task_id,
                    trigger,
                    "permanent_error",
                    "mark_dead",
                    None,
                    now,
                ));
            }
        }
        self.queue.settle();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::domain::WindowSpec;
    use crate::ports::FixedClock;
    use chrono::{NaiveDate, TimeZone, Utc};

    const Q: &str = "analytics";

    fn queue_with(options: QueueOptions) -> InMemoryQueue {
        let clock = FixedClock::new(Utc.with_ymd_and_hms(2024, 2, 3, 0, 0, 0).unwrap());
        InMemoryQueue::new(options, Arc::new(clock))
    }

    fn queues() -> Vec<String> {
        vec![Q.to_string()]
    }

    fn day_payload() -> WindowPayload {
        WindowSpec::Day(NaiveDate::from_ymd_opt(2024, 2, 1).unwrap()).into()
    }

    async fn lease(queue: &InMemoryQueue) -> Box<dyn TaskLease> {
        let cancel = CancellationToken::new();
        tokio::time::timeout(Duration::from_secs(5), queue.dequeue(&queues(), &cancel))
            .await
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn enqueue_then_lease_runs_the_task() {
        let queue = queue_with(QueueOptions::default());
        let kind = JobKind::new("analytics:daily_revenue");
        let handle = queue.enqueue(&kind, day_payload(), Q).await.unwrap();
        assert_eq!(queue.counts().await.unwrap().queued, 1);

        let lease = lease(&queue).await;
        assert_eq!(lease.envelope().task_id(), handle.task_id);
        assert_eq!(lease.attempt(), 1);
        assert_eq!(lease.envelope().decode_payload().unwrap(), day_payload());
        assert_eq!(queue.counts().await.unwrap().running, 1);

        lease.ack().await.unwrap();
        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.succeeded, 1);
        assert_eq!(counts.pending(), 0);
        assert_eq!(queue.attempts().await[0].outcome, AttemptOutcome::Succeeded);
    }

    #[tokio::test]
    async fn other_queues_are_not_delivered() {
        let queue = queue_with(QueueOptions::default());
        queue
            .enqueue(&JobKind::new("analytics:daily_revenue"), day_payload(), "reports")
            .await
            .unwrap();

        let cancel = CancellationToken::new();
        let got = tokio::time::timeout(Duration::from_millis(50), queue.dequeue(&queues(), &cancel)).await;
        assert!(got.is_err(), "task from another queue was delivered");
    }

    #[tokio::test(start_paused = true)]
    async fn retry_schedules_backoff_then_redelivers() {
        let queue = queue_with(QueueOptions::default());
        queue
            .enqueue(&JobKind::new("analytics:daily_revenue"), day_payload(), Q)
            .await
            .unwrap();

        lease(&queue).await.retry("storage down".into()).await.unwrap();
        assert_eq!(queue.counts().await.unwrap().retry_scheduled, 1);

        let decisions = queue.decisions().await;
        assert_eq!(decisions.len(), 1);
        assert_eq!(decisions[0].policy, "retry_policy");
        assert_eq!(decisions[0].decision, "schedule_retry");
        assert_eq!(decisions[0].trigger["error"], "storage down");
        assert_eq!(decisions[0].context.as_ref().unwrap()["delay_ms"], 2000);

        // paused time auto-advances to the backoff deadline
        let second = lease(&queue).await;
        assert_eq!(second.attempt(), 2);
    }

    #[tokio::test]
    async fn retry_at_max_attempts_dead_letters() {
        let queue = queue_with(QueueOptions {
            max_attempts: 1,
            ..QueueOptions::default()
        });
        queue
            .enqueue(&JobKind::new("analytics:daily_revenue"), day_payload(), Q)
            .await
            .unwrap();

        lease(&queue).await.retry("still down".into()).await.unwrap();

        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.dead, 1);
        let decisions = queue.decisions().await;
        assert_eq!(decisions[0].decision, "mark_dead");
        assert_eq!(decisions[0].trigger["attempts"], 1);
        assert_eq!(decisions[0].trigger["max_attempts"], 1);
    }

    #[tokio::test]
    async fn fail_dead_letters_without_retry() {
        let queue = queue_with(QueueOptions::default());
        queue
            .enqueue(&JobKind::new("analytics:nope"), day_payload(), Q)
            .await
            .unwrap();

        lease(&queue).await.fail("unknown job kind".into()).await.unwrap();

        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.dead, 1);
        assert_eq!(counts.retry_scheduled, 0);
        let decisions = queue.decisions().await;
        assert_eq!(decisions[0].policy, "permanent_error");
        assert_eq!(queue.attempts().await[0].outcome, AttemptOutcome::Rejected);
        let tasks = queue.tasks().await;
        assert_eq!(tasks[0].last_error.as_deref(), Some("unknown job kind"));
    }

    #[tokio::test]
    async fn closed_queue_rejects_enqueue() {
        let queue = queue_with(QueueOptions::default());
        queue.close().await;
        let err = queue
            .enqueue(&JobKind::new("analytics:daily_revenue"), day_payload(), Q)
            .await
            .unwrap_err();
        assert!(matches!(err, RollupError::QueueUnavailable(_)));
    }

    #[tokio::test]
    async fn capacity_counts_pending_tasks_only() {
        let queue = queue_with(QueueOptions {
            capacity: Some(1),
            ..QueueOptions::default()
        });
        let kind = JobKind::new("analytics:daily_revenue");
        queue.enqueue(&kind, day_payload(), Q).await.unwrap();
        assert!(matches!(
            queue.enqueue(&kind, day_payload(), Q).await,
            Err(RollupError::QueueUnavailable(_))
        ));

        lease(&queue).await.ack().await.unwrap();
        assert!(queue.enqueue(&kind, day_payload(), Q).await.is_ok());
    }

    #[tokio::test]
    async fn cancelled_dequeue_returns_none() {
        let queue = queue_with(QueueOptions::default());
        let cancel = CancellationToken::new();
        let waiter = {
            let queue = queue.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move { queue.dequeue(&queues(), &cancel).await.is_none() })
        };
        cancel.cancel();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn wait_drained_returns_after_last_ack() {
        let queue = queue_with(QueueOptions::default());
        queue
            .enqueue(&JobKind::new("analytics:daily_revenue"), day_payload(), Q)
            .await
            .unwrap();

        let drained = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.wait_drained().await })
        };
        lease(&queue).await.ack().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), drained)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn dropped_lease_is_handed_back_for_retry() {
        let queue = queue_with(QueueOptions::default());
        queue
            .enqueue(&JobKind::new("analytics:daily_revenue"), day_payload(), Q)
            .await
            .unwrap();

        drop(lease(&queue).await);

        let counts = queue.counts().await.unwrap();
        assert_eq!((counts.running, counts.retry_scheduled), (0, 1));
        let attempts = queue.attempts().await;
        assert_eq!(attempts[0].outcome, AttemptOutcome::Failed);
        assert_eq!(attempts[0].error.as_deref(), Some(ABANDONED));

        let second = lease(&queue).await;
        assert_eq!(second.attempt(), 2);
        second.ack().await.unwrap();
        assert_eq!(queue.counts().await.unwrap().succeeded, 1);
    }

    #[tokio::test]
    async fn dropped_lease_on_last_attempt_dead_letters() {
        let queue = queue_with(QueueOptions {
            max_attempts: 1,
            ..QueueOptions::default()
        });
        queue
            .enqueue(&JobKind::new("analytics:daily_revenue"), day_payload(), Q)
            .await
            .unwrap();

        drop(lease(&queue).await);

        assert_eq!(queue.counts().await.unwrap().dead, 1);
        tokio::time::timeout(Duration::from_secs(5), queue.wait_drained())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn retention_evicts_oldest_finished_records() {
        let queue = queue_with(QueueOptions {
            finished_retention: Some(2),
            ..QueueOptions::default()
        });
        let kind = JobKind::new("analytics:daily_revenue");
        let mut handles = Vec::new();
        for _ in 0..3 {
            handles.push(queue.enqueue(&kind, day_payload(), Q).await.unwrap());
        }
        for _ in 0..3 {
            lease(&queue).await.ack().await.unwrap();
        }

        let kept: Vec<_> = queue.tasks().await.iter().map(|r| r.envelope.task_id()).collect();
        assert_eq!(kept.len(), 2);
        assert!(!kept.contains(&handles[0].task_id));
        assert_eq!(queue.attempts().await.len(), 2);
        // lifetime totals survive eviction
        assert_eq!(queue.counts().await.unwrap().succeeded, 3);
    }

    #[tokio::test]
    async fn counts_follow_every_transition() {
        let queue = queue_with(QueueOptions::default());
        let kind = JobKind::new("analytics:daily_revenue");
        queue.enqueue(&kind, day_payload(), Q).await.unwrap();
        queue.enqueue(&kind, day_payload(), Q).await.unwrap();

        let first = lease(&queue).await;
        assert_eq!(
            queue.counts().await.unwrap(),
            QueueCounts {
                queued: 1,
                running: 1,
                ..QueueCounts::default()
            }
        );
        first.fail("bad window".into()).await.unwrap();
        lease(&queue).await.ack().await.unwrap();
        assert_eq!(
            queue.counts().await.unwrap(),
            QueueCounts {
                succeeded: 1,
                dead: 1,
                ..QueueCounts::default()
            }
        );
    }
}
