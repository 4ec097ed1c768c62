//! Attempt and decision history kept by the queue.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{AttemptId, TaskId};
use super::job::JobKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptOutcome {
    Succeeded,
    /// Failed with an error worth retrying.
    Failed,
    /// Failed with an error no retry can fix.
    Rejected,
}

/// One delivery of a task and how it ended.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttemptRecord {
    pub attempt_id: AttemptId,
    pub task_id: TaskId,
    pub kind: JobKind,
    /// 1-based delivery number.
    pub attempt: u32,
    pub outcome: AttemptOutcome,
    pub error: Option<String>,
    pub finished_at: DateTime<Utc>,
}

/// Why the queue retried or buried a task.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DecisionRecord {
    pub task_id: TaskId,

    /// What was observed: the error and attempt counters.
    pub trigger: serde_json::Value,

    /// "retry_policy" or "permanent_error".
    pub policy: String,

    /// "schedule_retry" or "mark_dead".
    pub decision: String,

    pub context: Option<serde_json::Value>,

    pub decided_at: DateTime<Utc>,
}

impl DecisionRecord {
    pub fn new(
        task_id: TaskId,
        trigger: serde_json::Value,
        policy: impl Into<String>,
        decision: impl Into<String>,
        context: Option<serde_json::Value>,
        decided_at: DateTime<Utc>,
    ) -> Self {
        Self {
            task_id,
            trigger,
            policy: policy.into(),
            decision: decision.into(),
            context,
            decided_at,
        }
    }
}
