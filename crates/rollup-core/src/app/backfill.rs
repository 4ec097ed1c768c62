//! Backfill - 履歴全体のロールアップを一括投入
//!
//! A plan covers `[earliest_day, last_complete_day]` on the business calendar and
//! yields each (kind, window) pair exactly once: every day, every Monday that
//! falls inside the range, and every month the range touches.

use std::sync::Arc;

use chrono::{DateTime, Datelike, Days, NaiveDate, Utc, Weekday};
use serde::Serialize;
use tracing::{info, warn};

use crate::domain::{
    BusinessCalendar, Granularity, JobKind, RollupError, WeekStart, WindowPayload, WindowSpec, YearMonth,
};
use crate::ports::{BackfillSource, Clock};
use crate::queue::TaskQueue;

use super::registry::JobRegistry;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BackfillPlan {
    pub earliest_day: NaiveDate,
    pub last_complete_day: NaiveDate,
}

impl BackfillPlan {
    /// From the oldest source record up to yesterday, both on the business calendar.
    pub fn new(calendar: &BusinessCalendar, earliest: DateTime<Utc>, now: DateTime<Utc>) -> Self {
        let today = calendar.local_date(now);
        Self {
            earliest_day: calendar.local_date(earliest),
            last_complete_day: today.pred_opt().unwrap_or(NaiveDate::MIN),
        }
    }

    pub fn between(earliest_day: NaiveDate, last_complete_day: NaiveDate) -> Self {
        Self {
            earliest_day,
            last_complete_day,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.earliest_day > self.last_complete_day
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> + '_ {
        self.earliest_day
            .iter_days()
            .take_while(|day| *day <= self.last_complete_day)
    }

    /// Mondays inside the range. A week that starts before `earliest_day` is skipped.
    pub fn weeks(&self) -> Vec<WeekStart> {
        if self.is_empty() {
            return Vec::new();
        }
        let first = if self.earliest_day.weekday() == Weekday::Mon {
            Some(self.earliest_day)
        } else {
            WeekStart::containing(self.earliest_day)
                .monday()
                .checked_add_days(Days::new(7))
        };
        std::iter::successors(first, |monday| monday.checked_add_days(Days::new(7)))
            .take_while(|monday| *monday <= self.last_complete_day)
            .filter_map(|monday| WeekStart::new(monday).ok())
            .collect()
    }

    /// Every month touched by the range, the partial last month included.
    pub fn months(&self) -> Vec<YearMonth> {
        if self.is_empty() {
            return Vec::new();
        }
        let last = YearMonth::of(self.last_complete_day);
        std::iter::successors(Some(YearMonth::of(self.earliest_day)), |month| month.succ())
            .take_while(|month| *month <= last)
            .collect()
    }

    /// (kind, window) pairs in enqueue order: days, then weeks, then months.
    pub fn windows(&self, registry: &JobRegistry) -> Vec<(JobKind, WindowSpec)> {
        let day_kinds = registry.kinds_with(Granularity::Day);
        let week_kinds = registry.kinds_with(Granularity::Week);
        let month_kinds = registry.kinds_with(Granularity::Month);

        let mut windows = Vec::new();
        for day in self.days() {
            for kind in &day_kinds {
                windows.push((kind.clone(), WindowSpec::Day(day)));
            }
        }
        for week in self.weeks() {
            for kind in &week_kinds {
                windows.push((kind.clone(), WindowSpec::Week(week)));
            }
        }
        for month in self.months() {
            for kind in &month_kinds {
                windows.push((kind.clone(), WindowSpec::Month(month)));
            }
        }
        windows
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackfillReport {
    pub plan: BackfillPlan,
    pub days: usize,
    pub weeks: usize,
    pub months: usize,
    pub enqueued: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum BackfillOutcome {
    /// The daily destination already had rows and the run was not forced.
    Skipped { existing_rows: u64 },
    /// No source data at all.
    NoHistory,
    Completed(BackfillReport),
}

pub struct Backfill {
    queue: Arc<dyn TaskQueue>,
    registry: Arc<JobRegistry>,
    calendar: BusinessCalendar,
    clock: Arc<dyn Clock>,
    queue_name: String,
}

impl Backfill {
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

    pub fn plan(&self, earliest: DateTime<Utc>) -> BackfillPlan {
        BackfillPlan::new(&self.calendar, earliest, self.clock.now())
    }

    /// Enqueues the whole plan. The first rejected enqueue stops the run; tasks
    /// already accepted stay queued.
    pub async fn run(&self, plan: &BackfillPlan) -> Result<BackfillReport, RollupError> {
        if plan.is_empty() {
            info!(earliest = %plan.earliest_day, last = %plan.last_complete_day, "nothing to backfill");
        }
        let windows = plan.windows(&self.registry);
        let mut enqueued = 0;
        for (kind, window) in windows {
            if let Err(source) = self
                .queue
                .enqueue(&kind, WindowPayload::from(window), &self.queue_name)
                .await
            {
                warn!(%kind, %window, enqueued, error = %source, "backfill aborted");
                return Err(RollupError::Enqueue {
                    kind,
                    window,
                    enqueued,
                    source: Box::new(source),
                });
            }
            enqueued += 1;
        }

        let report = BackfillReport {
            plan: *plan,
            days: plan.days().count(),
            weeks: plan.weeks().len(),
            months: plan.months().len(),
            enqueued,
        };
        info!(
            earliest = %plan.earliest_day,
            last = %plan.last_complete_day,
            days = report.days,
            weeks = report.weeks,
            months = report.months,
            enqueued,
            "backfill enqueued"
        );
        Ok(report)
    }

    /// Runs only when the daily destination is empty, unless `force` is set.
    pub async fn run_guarded(
        &self,
        source: &dyn BackfillSource,
        force: bool,
    ) -> Result<BackfillOutcome, RollupError> {
        let existing_rows = source.existing_day_rows().await?;
        if existing_rows > 0 && !force {
            info!(existing_rows, "daily roll-ups already present, skipping backfill");
            return Ok(BackfillOutcome::Skipped { existing_rows });
        }
        let Some(earliest) = source.earliest_source_timestamp().await? else {
            info!("no source data, skipping backfill");
            return Ok(BackfillOutcome::NoHistory);
        };
        let plan = self.plan(earliest);
        self.run(&plan).await.map(BackfillOutcome::Completed)
    }
}
