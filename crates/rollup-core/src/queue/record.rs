//! Task record: envelope plus delivery bookkeeping.

use chrono::{DateTime, Utc};
use tokio::time::Instant;

use super::TaskState;
use crate::domain::TaskEnvelope;

/// The single source of truth for a task. Ready and scheduled queues hold ids only;
/// every state transition goes through the methods here.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub envelope: TaskEnvelope,
    pub state: TaskState,

    /// Deliveries so far, including the current one while Running.
    pub attempts: u32,
    pub max_attempts: u32,

    pub last_error: Option<String>,

    /// Set while RetryScheduled.
    pub next_run_at: Option<Instant>,

    pub enqueued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TaskRecord {
    pub fn new(envelope: TaskEnvelope, max_attempts: u32, now: DateTime<Utc>) -> Self {
        Self {
            envelope,
            state: TaskState::Queued,
            attempts: 0,
            max_attempts,
            last_error: None,
            next_run_at: None,
            enqueued_at: now,
            updated_at: now,
        }
    }

    pub fn start_attempt(&mut self, now: DateTime<Utc>) {
        self.state = TaskState::Running;
        self.attempts += 1;
        self.updated_at = now;
    }

    pub fn mark_succeeded(&mut self, now: DateTime<Utc>) {
        self.state = TaskState::Succeeded;
        self.updated_at = now;
    }

    pub fn mark_dead(&mut self, error: String, now: DateTime<Utc>) {
        self.state = TaskState::Dead;
        self.last_error = Some(error);
        self.updated_at = now;
    }

    pub fn schedule_retry(&mut self, next_run_at: Instant, error: String, now: DateTime<Utc>) {
        self.state = TaskState::RetryScheduled;
        self.next_run_at = Some(next_run_at);
        self.last_error = Some(error);
        self.updated_at = now;
    }

    /// RetryScheduled -> Queued once the backoff has elapsed.
    pub fn requeue(&mut self, now: DateTime<Utc>) {
        self.state = TaskState::Queued;
        self.next_run_at = None;
        self.updated_at = now;
    }
}
