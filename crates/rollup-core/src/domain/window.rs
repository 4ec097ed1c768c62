//! Window specs: which business day, ISO week or calendar month a task computes.

use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, Days, Months, NaiveDate, Weekday};
use serde::{Deserialize, Serialize};

use super::errors::RollupError;
use super::job::Granularity;

const DAY_FORMAT: &str = "%Y-%m-%d";

/// Parses a `YYYY-MM-DD` business date.
pub fn parse_date(input: &str) -> Result<NaiveDate, RollupError> {
    NaiveDate::parse_from_str(input.trim(), DAY_FORMAT)
        .map_err(|e| RollupError::InvalidWindow(format!("{input:?} is not a YYYY-MM-DD date: {e}")))
}

/// A calendar month, always stored as its first day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct YearMonth(NaiveDate);

impl YearMonth {
    pub fn new(year: i32, month: u32) -> Result<Self, RollupError> {
        NaiveDate::from_ymd_opt(year, month, 1)
            .map(Self)
            .ok_or_else(|| RollupError::InvalidWindow(format!("{year}-{month} is not a month")))
    }

    /// The month a date falls in.
    pub fn of(date: NaiveDate) -> Self {
        Self(date.with_day(1).unwrap_or(date))
    }

    pub fn year(&self) -> i32 {
        self.0.year()
    }

    pub fn month(&self) -> u32 {
        self.0.month()
    }

    pub fn first_day(&self) -> NaiveDate {
        self.0
    }

    /// The following month, `None` past chrono's date range.
    pub fn succ(&self) -> Option<Self> {
        self.0.checked_add_months(Months::new(1)).map(Self)
    }

    pub fn pred(&self) -> Option<Self> {
        self.0.checked_sub_months(Months::new(1)).map(Self)
    }
}

impl FromStr for YearMonth {
    type Err = RollupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        NaiveDate::parse_from_str(&format!("{s}-01"), DAY_FORMAT)
            .map(Self)
            .map_err(|e| RollupError::InvalidWindow(format!("{s:?} is not a YYYY-MM month: {e}")))
    }
}

impl TryFrom<String> for YearMonth {
    type Error = RollupError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<YearMonth> for String {
    fn from(value: YearMonth) -> Self {
        value.to_string()
    }
}

impl fmt::Display for YearMonth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:04}-{:02}", self.year(), self.month())
    }
}

/// The Monday opening an ISO week. Cannot hold any other weekday.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "NaiveDate", into = "NaiveDate")]
pub struct WeekStart(NaiveDate);

impl WeekStart {
    pub fn new(monday: NaiveDate) -> Result<Self, RollupError> {
        if monday.weekday() != Weekday::Mon {
            return Err(RollupError::InvalidWindow(format!(
                "week must start on a Monday, {monday} is a {}",
                monday.weekday()
            )));
        }
        Ok(Self(monday))
    }

    /// The week a date falls in.
    pub fn containing(date: NaiveDate) -> Self {
        let back = Days::new(u64::from(date.weekday().num_days_from_monday()));
        Self(date.checked_sub_days(back).unwrap_or(date))
    }

    pub fn monday(&self) -> NaiveDate {
        self.0
    }

    pub fn sunday(&self) -> Option<NaiveDate> {
        self.0.checked_add_days(Days::new(6))
    }
}

impl TryFrom<NaiveDate> for WeekStart {
    type Error = RollupError;

    fn try_from(value: NaiveDate) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<WeekStart> for NaiveDate {
    fn from(value: WeekStart) -> Self {
        value.0
    }
}

/// A concrete window chosen by whoever enqueued the task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "granularity", content = "start", rename_all = "snake_case")]
pub enum WindowSpec {
    Day(NaiveDate),
    Week(WeekStart),
    Month(YearMonth),
}

impl WindowSpec {
    pub fn granularity(&self) -> Granularity {
        match self {
            WindowSpec::Day(_) => Granularity::Day,
            WindowSpec::Week(_) => Granularity::Week,
            WindowSpec::Month(_) => Granularity::Month,
        }
    }

    /// Parses user input for a window of the given granularity.
    ///
    /// Days and weeks take `YYYY-MM-DD` (weeks must name a Monday), months take `YYYY-MM`.
    pub fn parse(granularity: Granularity, input: &str) -> Result<Self, RollupError> {
        match granularity {
            Granularity::Day => parse_date(input).map(WindowSpec::Day),
            Granularity::Week => WeekStart::new(parse_date(input)?).map(WindowSpec::Week),
            Granularity::Month => input.parse().map(WindowSpec::Month),
        }
    }
}

impl fmt::Display for WindowSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WindowSpec::Day(d) => write!(f, "day {d}"),
            WindowSpec::Week(w) => write!(f, "week {}", w.monday()),
            WindowSpec::Month(m) => write!(f, "month {m}"),
        }
    }
}

/// What a queued task computes.
///
/// Recurring tasks carry `AtExecution` so that a delayed or retried delivery still
/// computes the window that is complete when it actually runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "resolve", rename_all = "snake_case")]
pub enum WindowPayload {
    AtExecution,
    Fixed { window: WindowSpec },
}

impl From<WindowSpec> for WindowPayload {
    fn from(window: WindowSpec) -> Self {
        WindowPayload::Fixed { window }
    }
}
