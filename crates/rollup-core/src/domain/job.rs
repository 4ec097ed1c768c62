//! Job kinds and the declarative table of standard roll-ups.
//!
//! Each roll-up is one row of [`STANDARD_JOBS`]: its kind name, the window
//! granularity it computes, and the cron expression that drives it. The
//! registry and scheduler are generic over this table; no roll-up gets a
//! component of its own.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Size of the window a job computes, and so the shape of its storage key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    Day,
    Week,
    Month,
}

impl Granularity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Day => "day",
            Granularity::Week => "week",
            Granularity::Month => "month",
        }
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Name of a roll-up, e.g. `analytics:daily_revenue`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobKind(String);

impl JobKind {
    pub fn new(kind: impl Into<String>) -> Self {
        Self(kind.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for JobKind {
    fn from(kind: &str) -> Self {
        Self::new(kind)
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

pub const DEFAULT_QUEUE: &str = "analytics";

pub const DAILY_REVENUE: &str = "analytics:daily_revenue";
pub const DAILY_DESSERT_REVENUE: &str = "analytics:daily_dessert_revenue";
pub const DAILY_ITEM_SALES: &str = "analytics:daily_item_sales";
pub const DAILY_EOD_STOCK: &str = "analytics:daily_eod_stock";
pub const WEEKLY_REVENUE: &str = "analytics:weekly_revenue";
pub const MONTHLY_REVENUE: &str = "analytics:monthly_revenue";
pub const MONTHLY_DESSERT_REVENUE: &str = "analytics:monthly_dessert_revenue";

/// One row of the standard job table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobTemplate {
    pub kind: &'static str,
    pub granularity: Granularity,
    /// Six-field cron (sec min hour dom mon dow), business wall clock.
    pub cron: &'static str,
}

const DAILY_AT_ONE: &str = "0 0 1 * * *";
const MONDAYS_AT_ONE: &str = "0 0 1 * * Mon";
const FIRST_OF_MONTH_AT_ONE: &str = "0 0 1 1 * *";

pub const STANDARD_JOBS: &[JobTemplate] = &[
    JobTemplate {
        kind: DAILY_REVENUE,
        granularity: Granularity::Day,
        cron: DAILY_AT_ONE,
    },
    JobTemplate {
        kind: DAILY_DESSERT_REVENUE,
        granularity: Granularity::Day,
        cron: DAILY_AT_ONE,
    },
    JobTemplate {
        kind: DAILY_ITEM_SALES,
        granularity: Granularity::Day,
        cron: DAILY_AT_ONE,
    },
    JobTemplate {
        kind: DAILY_EOD_STOCK,
        granularity: Granularity::Day,
        cron: DAILY_AT_ONE,
    },
    JobTemplate {
        kind: WEEKLY_REVENUE,
        granularity: Granularity::Week,
        cron: MONDAYS_AT_ONE,
    },
    JobTemplate {
        kind: MONTHLY_REVENUE,
        granularity: Granularity::Month,
        cron: FIRST_OF_MONTH_AT_ONE,
    },
    JobTemplate {
        kind: MONTHLY_DESSERT_REVENUE,
        granularity: Granularity::Month,
        cron: FIRST_OF_MONTH_AT_ONE,
    },
];

pub fn standard_template(kind: &str) -> Option<&'static JobTemplate> {
    STANDARD_JOBS.iter().find(|t| t.kind == kind)
}
