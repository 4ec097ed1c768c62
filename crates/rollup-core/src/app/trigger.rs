//! Manual triggers: recompute one business day, or enqueue a single kind.

use std::sync::Arc;

use chrono::NaiveDate;
use serde::Serialize;
use tracing::{info, warn};

use crate::domain::{
    BusinessCalendar, Granularity, JobKind, RollupError, TaskHandle, WindowPayload, WindowSpec,
};
use crate::ports::Clock;
use crate::queue::TaskQueue;

use super::registry::JobRegistry;

#[derive(Debug, Clone, Serialize)]
pub struct RecomputeReport {
    pub date: NaiveDate,
    pub enqueued: Vec<TaskHandle>,
}

pub struct Trigger {
    queue: Arc<dyn TaskQueue>,
    registry: Arc<JobRegistry>,
    calendar: BusinessCalendar,
    clock: Arc<dyn Clock>,
    queue_name: String,
}

impl Trigger {
    pub fn new(
        queue: Arc<dyn TaskQueue>,
        registry: Arc<JobRegistry>,
        calendar: BusinessCalendar,
        clock: Arc<dyn Clock>,
        queue_name: impl Into<String>,
    ) -> Self {
        Self {
            queue,
            registry,
            calendar,
            clock,
            queue_name: queue_name.into(),
        }
    }

    /// Enqueues every day-granularity kind for `date`. Stops at the first rejected
    /// enqueue; the error says which kind failed and how many went in before it.
    pub async fn recompute_day(&self, date: NaiveDate) -> Result<RecomputeReport, RollupError> {
        let window = WindowSpec::Day(date);
        let mut enqueued = Vec::new();
        for kind in self.registry.kinds_with(Granularity::Day) {
            match self
                .queue
                .enqueue(&kind, WindowPayload::from(window), &self.queue_name)
                .await
            {
                Ok(handle) => {
                    info!(%kind, %date, task_id = %handle.task_id, "recompute enqueued");
                    enqueued.push(handle);
                }
                Err(source) => {
                    warn!(%kind, %date, error = %source, "recompute enqueue failed");
                    return Err(RollupError::Enqueue {
                        kind,
                        window,
                        enqueued: enqueued.len(),
                        source: Box::new(source),
                    });
                }
            }
        }
        Ok(RecomputeReport { date, enqueued })
    }

    /// Enqueues one kind. `window` is parsed for the kind's granularity
    /// (`YYYY-MM-DD`, a Monday for weeks, `YYYY-MM` for months); without it the most
    /// recently completed window as of now is used.
    pub async fn trigger(&self, kind: &JobKind, window: Option<&str>) -> Result<TaskHandle, RollupError> {
        let granularity = self.registry.lookup(kind)?.granularity;
        let spec = match window {
            Some(input) => WindowSpec::parse(granularity, input)?,
            None => self.calendar.latest_complete(granularity, self.clock.now())?,
        };
        let handle = self
            .queue
            .enqueue(kind, WindowPayload::from(spec), &self.queue_name)
            .await?;
        info!(%kind, window = %spec, task_id = %handle.task_id, "triggered");
        Ok(handle)
    }
}
