//! Durable task queue: the seam between producers (scheduler, backfill, trigger)
//! and the dispatch loop, plus an in-memory implementation.

mod memory;
mod record;
mod retry;
mod state;

pub use memory::{InMemoryQueue, QueueOptions};
pub use record::TaskRecord;
pub use retry::RetryPolicy;
pub use state::TaskState;

use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::domain::{JobKind, RollupError, TaskEnvelope, TaskHandle, WindowPayload};

/// A delivered task. The worker owns the lease and settles it exactly once.
#[async_trait]
pub trait TaskLease: Send {
    fn envelope(&self) -> &TaskEnvelope;

    /// 1-based delivery number.
    fn attempt(&self) -> u32;

    async fn ack(self: Box<Self>) -> Result<(), RollupError>;

    /// Failed, may succeed later. The queue decides between backoff and dead-letter.
    async fn retry(self: Box<Self>, error: String) -> Result<(), RollupError>;

    /// Failed for good. Straight to dead-letter.
    async fn fail(self: Box<Self>, error: String) -> Result<(), RollupError>;
}

/// At-least-once delivery with retry and dead-letter state.
#[async_trait]
pub trait TaskQueue: Send + Sync {
    async fn enqueue(
        &self,
        kind: &JobKind,
        payload: WindowPayload,
        queue: &str,
    ) -> Result<TaskHandle, RollupError>;

    /// Waits for a ready task on any of `queues`. `None` once `cancel` fires.
    async fn dequeue(
        &self,
        queues: &[String],
        cancel: &CancellationToken,
    ) -> Option<Box<dyn TaskLease>>;

    async fn counts(&self) -> Result<QueueCounts, RollupError>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub queued: usize,
    pub running: usize,
    pub retry_scheduled: usize,
    pub succeeded: usize,
    pub dead: usize,
}

impl QueueCounts {
    /// Tasks that will still be delivered or are being delivered now.
    pub fn pending(&self) -> usize {
        self.queued + self.running + self.retry_scheduled
    }

    pub(crate) fn add(&mut self, state: TaskState) {
        match state {
            TaskState::Queued => self.queued += 1,
            TaskState::Running => self.running += 1,
            TaskState::RetryScheduled => self.retry_scheduled += 1,
            TaskState::Succeeded => self.succeeded += 1,
            TaskState::Dead => self.dead += 1,
        }
    }

    pub(crate) fn remove(&mut self, state: TaskState) {
        let slot = match state {
            TaskState::Queued => &mut self.queued,
            TaskState::Running => &mut self.running,
            TaskState::RetryScheduled => &mut self.retry_scheduled,
            TaskState::Succeeded => &mut self.succeeded,
            TaskState::Dead => &mut self.dead,
        };
        *slot = slot.saturating_sub(1);
    }
}
