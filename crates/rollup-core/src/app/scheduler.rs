//! RecurringScheduler - cron エントリごとに AtExecution タスクを投入
//!
//! The entry list is fixed when the scheduler is built. A tick enqueues a task
//! with an `AtExecution` payload and does nothing else; the dispatch loop picks
//! the window when the task runs.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::domain::{BusinessCalendar, JobKind, RollupError, STANDARD_JOBS, TaskHandle, WindowPayload};
use crate::ports::Clock;
use crate::queue::TaskQueue;

use super::registry::JobRegistry;

#[derive(Debug, Clone)]
pub struct ScheduleEntry {
    pub kind: JobKind,
    pub cron: String,
    pub queue: String,
    schedule: cron::Schedule,
}

impl ScheduleEntry {
    /// `cron` has six fields (sec min hour dom mon dow) and is read on the business
    /// wall clock.
    pub fn new(kind: impl Into<JobKind>, cron: &str, queue: impl Into<String>) -> Result<Self, RollupError> {
        let kind = kind.into();
        let schedule = cron::Schedule::from_str(cron)
            .map_err(|e| RollupError::Config(format!("invalid cron {cron:?} for {kind}: {e}")))?;
        Ok(Self {
            kind,
            cron: cron.to_string(),
            queue: queue.into(),
            schedule,
        })
    }

    /// First fire time strictly after `after`.
    pub fn next_after(&self, calendar: &BusinessCalendar, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let local = after.with_timezone(&calendar.offset());
        self.schedule
            .after(&local)
            .next()
            .map(|t| t.with_timezone(&Utc))
    }
}

/// One entry per standard job kind, all on `queue`.
pub fn standard_entries(queue: &str) -> Result<Vec<ScheduleEntry>, RollupError> {
    STANDARD_JOBS
        .iter()
        .map(|t| ScheduleEntry::new(t.kind, t.cron, queue))
        .collect()
}

pub struct RecurringScheduler {
    entries: Arc<[ScheduleEntry]>,
    queue: Arc<dyn TaskQueue>,
    calendar: BusinessCalendar,
    clock: Arc<dyn Clock>,
}

impl RecurringScheduler {
    /// Fails with `UnknownJobKind` when an entry names a kind the registry lacks.
    pub fn new(
        entries: Vec<ScheduleEntry>,
        registry: &JobRegistry,
        queue: Arc<dyn TaskQueue>,
        calendar: BusinessCalendar,
        clock: Arc<dyn Clock>,
    ) -> Result<Self, RollupError> {
        for entry in &entries {
            registry.lookup(&entry.kind)?;
        }
        Ok(Self {
            entries: entries.into(),
            queue,
            calendar,
            clock,
        })
    }

    pub fn entries(&self) -> &[ScheduleEntry] {
        &self.entries
    }

    pub async fn fire(&self, entry: &ScheduleEntry) -> Result<TaskHandle, RollupError> {
        self.queue
            .enqueue(&entry.kind, WindowPayload::AtExecution, &entry.queue)
            .await
    }

    /// One loop per entry until `cancel` fires.
    pub fn spawn(self: &Arc<Self>, cancel: &CancellationToken) -> JoinSet<()> {
        let mut loops = JoinSet::new();
        for index in 0..self.entries.len() {
            loops.spawn(Arc::clone(self).run_entry(index, cancel.clone()));
        }
        info!(entries = self.entries.len(), "scheduler started");
        loops
    }

    async fn run_entry(self: Arc<Self>, index: usize, cancel: CancellationToken) {
        let entry = &self.entries[index];
        let mut last_fired: Option<DateTime<Utc>> = None;
        loop {
            let now = self.clock.now();
            let from = last_fired.map_or(now, |fired| fired.max(now));
            let Some(next) = entry.next_after(&self.calendar, from) else {
                warn!(kind = %entry.kind, cron = %entry.cron, "cron has no future fire time");
                return;
            };
            let delay = (next - now).to_std().unwrap_or(Duration::ZERO);

            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }

            match self.fire(entry).await {
                Ok(handle) => info!(kind = %entry.kind, task_id = %handle.task_id, fire_time = %next, "scheduled roll-up enqueued"),
                Err(e) => error!(kind = %entry.kind, fire_time = %next, error = %e, "scheduled roll-up could not be enqueued"),
            }
            last_fired = Some(next);
        }
    }
}
