//! Dispatcher - 1 タスクの実行（decode → lookup → materialize → resolve → execute）

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::domain::{
    BusinessCalendar, JobKind, ResolvedWindow, RollupError, TaskEnvelope, WindowPayload, WindowSpec,
};
use crate::ports::Clock;

use super::registry::{JobDescriptor, JobRegistry};

/// Result of one successful execution.
#[derive(Debug, Clone)]
pub struct Execution {
    pub kind: JobKind,
    pub window: ResolvedWindow,
    pub rows: u64,
}

pub struct Dispatcher {
    registry: Arc<JobRegistry>,
    calendar: BusinessCalendar,
    clock: Arc<dyn Clock>,
    task_timeout: Duration,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<JobRegistry>,
        calendar: BusinessCalendar,
        clock: Arc<dyn Clock>,
        task_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            calendar,
            clock,
            task_timeout,
        }
    }

    pub fn registry(&self) -> &JobRegistry {
        &self.registry
    }

    /// Picks the concrete window for a payload. `AtExecution` reads the clock now,
    /// not when the task was enqueued.
    pub fn materialize(
        &self,
        descriptor: &JobDescriptor,
        payload: WindowPayload,
    ) -> Result<WindowSpec, RollupError> {
        let window = match payload {
            WindowPayload::AtExecution => self
                .calendar
                .latest_complete(descriptor.granularity, self.clock.now())?,
            WindowPayload::Fixed { window } => window,
        };
        if window.granularity() != descriptor.granularity {
            return Err(RollupError::GranularityMismatch {
                kind: descriptor.kind.clone(),
                expected: descriptor.granularity,
                actual: window.granularity(),
            });
        }
        Ok(window)
    }

    /// Runs one task under the per-task timeout. Errors come back classified; the
    /// caller settles the lease.
    pub async fn execute(
        &self,
        envelope: &TaskEnvelope,
        cancel: &CancellationToken,
    ) -> Result<Execution, RollupError> {
        let descriptor = self.registry.lookup(envelope.kind())?;
        let payload = envelope.decode_payload()?;
        let spec = self.materialize(descriptor, payload)?;
        let window = self.calendar.resolve(&spec)?;
        debug!(
            task_id = %envelope.task_id(),
            kind = %descriptor.kind,
            window = %spec,
            storage_key = %window.storage_key,
            "executing"
        );

        let rows = tokio::time::timeout(
            self.task_timeout,
            descriptor.aggregation.execute(&window, cancel),
        )
        .await
        .map_err(|_| RollupError::Timeout(self.task_timeout))??;

        Ok(Execution {
            kind: descriptor.kind.clone(),
            window,
            rows,
        })
    }
}
