//! Task state machine for the queue.

use serde::{Deserialize, Serialize};

/// Queued -> Running -> Succeeded
/// Queued -> Running -> RetryScheduled -> Queued (until max_attempts)
/// Queued -> Running -> Dead (max_attempts exhausted, or a permanent error)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Queued,
    Running,
    Succeeded,
    RetryScheduled,
    /// Dead-lettered. Kept for inspection, never delivered again.
    Dead,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskState::Succeeded | TaskState::Dead)
    }

    pub fn is_runnable(self) -> bool {
        matches!(self, TaskState::Queued)
    }
}
