use serde::{Deserialize, Serialize};

use super::errors::RollupError;
use super::ids::TaskId;
use super::job::JobKind;
use super::window::WindowPayload;

/// A task as the queue stores and delivers it.
///
/// The payload stays as JSON until dispatch, so a malformed payload surfaces as a
/// permanent failure of that one task rather than breaking the queue.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskEnvelope {
    task_id: TaskId,
    kind: JobKind,
    queue: String,
    payload: serde_json::Value,
}

impl TaskEnvelope {
    pub fn new(task_id: TaskId, kind: JobKind, queue: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            task_id,
            kind,
            queue: queue.into(),
            payload,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn kind(&self) -> &JobKind {
        &self.kind
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.payload
    }

    pub fn decode_payload(&self) -> Result<WindowPayload, RollupError> {
        serde_json::from_value(self.payload.clone())
            .map_err(|e| RollupError::PayloadDecode(format!("{}: {e}", self.task_id)))
    }
}

/// What the queue hands back on a successful enqueue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TaskHandle {
    pub task_id: TaskId,
    pub kind: JobKind,
    pub queue: String,
}

impl From<&TaskEnvelope> for TaskHandle {
    fn from(envelope: &TaskEnvelope) -> Self {
        Self {
            task_id: envelope.task_id(),
            kind: envelope.kind().clone(),
            queue: envelope.queue().to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::window::WindowSpec;
    use chrono::NaiveDate;
    use ulid::Ulid;

    fn envelope(payload: serde_json::Value) -> TaskEnvelope {
        TaskEnvelope::new(
            TaskId::from(Ulid::new()),
            JobKind::new("analytics:daily_revenue"),
            "analytics",
            payload,
        )
    }

    #[test]
    fn decodes_fixed_window() {
        let day = WindowSpec::Day(NaiveDate::from_ymd_opt(2024, 1, 30).unwrap());
        let env = envelope(serde_json::to_value(WindowPayload::from(day)).unwrap());
        assert_eq!(env.decode_payload().unwrap(), WindowPayload::Fixed { window: day });
    }

    #[test]
    fn garbage_payload_is_a_decode_error() {
        let env = envelope(serde_json::json!({"date": "yesterday"}));
        assert!(matches!(env.decode_payload(), Err(RollupError::PayloadDecode(_))));
    }
}
