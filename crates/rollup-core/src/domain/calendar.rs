//! Business calendar: maps window specs onto storage keys and query ranges.
//!
//! The business runs on one fixed UTC offset. Storage keys are the business-local
//! calendar date re-labelled as UTC midnight, which is not the same thing as the
//! UTC date of the local midnight (for +05:30 they differ by a day).

use std::fmt;

use chrono::{DateTime, FixedOffset, NaiveDate, NaiveTime, Offset, TimeDelta, Utc};

use super::errors::RollupError;
use super::job::Granularity;
use super::window::{WeekStart, WindowSpec, YearMonth};

/// Where a window's rows live in the destination tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StorageKey {
    Day(DateTime<Utc>),
    Week {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },
    Month(YearMonth),
}

impl fmt::Display for StorageKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageKey::Day(day) => write!(f, "{}", day.format("%Y-%m-%dT%H:%MZ")),
            StorageKey::Week { start, end } => write!(
                f,
                "{}..{}",
                start.format("%Y-%m-%dT%H:%MZ"),
                end.format("%Y-%m-%dT%H:%MZ")
            ),
            StorageKey::Month(month) => write!(f, "{month}"),
        }
    }
}

/// A window ready for an aggregation: where to write and which source rows to read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedWindow {
    pub spec: WindowSpec,
    pub storage_key: StorageKey,
    pub query_start: DateTime<FixedOffset>,
    /// Inclusive for days and weeks, exclusive for months.
    pub query_end: DateTime<FixedOffset>,
}

impl ResolvedWindow {
    pub fn end_is_exclusive(&self) -> bool {
        matches!(self.spec, WindowSpec::Month(_))
    }

    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        let start = self.query_start.with_timezone(&Utc);
        let end = self.query_end.with_timezone(&Utc);
        if self.end_is_exclusive() {
            start <= instant && instant < end
        } else {
            start <= instant && instant <= end
        }
    }
}

/// Parses `+HH:MM` / `-HH:MM` into an offset.
pub fn parse_offset(input: &str) -> Result<FixedOffset, RollupError> {
    let bad = || RollupError::Config(format!("{input:?} is not a +HH:MM offset"));
    let s = input.trim();
    let (sign, rest) = match s.as_bytes().first() {
        Some(b'+') => (1, &s[1..]),
        Some(b'-') => (-1, &s[1..]),
        _ => return Err(bad()),
    };
    let (hours, minutes) = rest.split_once(':').ok_or_else(bad)?;
    let hours: i32 = hours.parse().map_err(|_| bad())?;
    let minutes: i32 = minutes.parse().map_err(|_| bad())?;
    if !(0..=14).contains(&hours) || !(0..60).contains(&minutes) {
        return Err(bad());
    }
    FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60)).ok_or_else(bad)
}

fn utc_midnight(date: NaiveDate) -> DateTime<Utc> {
    date.and_time(NaiveTime::MIN).and_utc()
}

fn out_of_range(spec: &WindowSpec) -> RollupError {
    RollupError::InvalidWindow(format!("{spec} is outside the supported date range"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BusinessCalendar {
    offset: FixedOffset,
}

impl BusinessCalendar {
    pub fn new(offset: FixedOffset) -> Self {
        Self { offset }
    }

    pub fn utc() -> Self {
        Self::new(Utc.fix())
    }

    pub fn offset(&self) -> FixedOffset {
        self.offset
    }

    pub fn local_date(&self, instant: DateTime<Utc>) -> NaiveDate {
        instant.with_timezone(&self.offset).date_naive()
    }

    /// The local wall-clock midnight opening `date`.
    pub fn local_midnight(&self, date: NaiveDate) -> DateTime<FixedOffset> {
        let naive_utc = date.and_time(NaiveTime::MIN)
            - TimeDelta::seconds(i64::from(self.offset.local_minus_utc()));
        DateTime::from_naive_utc_and_offset(naive_utc, self.offset)
    }

    pub fn resolve(&self, spec: &WindowSpec) -> Result<ResolvedWindow, RollupError> {
        let resolved = match *spec {
            WindowSpec::Day(day) => {
                let (query_start, query_end) = self.local_days(day, day).ok_or_else(|| out_of_range(spec))?;
                ResolvedWindow {
                    spec: *spec,
                    storage_key: StorageKey::Day(utc_midnight(day)),
                    query_start,
                    query_end,
                }
            }
            WindowSpec::Week(week) => {
                let monday = week.monday();
                let sunday = week.sunday().ok_or_else(|| out_of_range(spec))?;
                let (query_start, query_end) =
                    self.local_days(monday, sunday).ok_or_else(|| out_of_range(spec))?;
                ResolvedWindow {
                    spec: *spec,
                    storage_key: StorageKey::Week {
                        start: utc_midnight(monday),
                        end: utc_midnight(sunday),
                    },
                    query_start,
                    query_end,
                }
            }
            // Month roll-ups read daily rows, which are already keyed in UTC.
            WindowSpec::Month(month) => {
                let next = month.succ().ok_or_else(|| out_of_range(spec))?;
                ResolvedWindow {
                    spec: *spec,
                    storage_key: StorageKey::Month(month),
                    query_start: utc_midnight(month.first_day()).fixed_offset(),
                    query_end: utc_midnight(next.first_day()).fixed_offset(),
                }
            }
        };
        Ok(resolved)
    }

    /// Local midnight of `first` through the last nanosecond of `last`.
    fn local_days(
        &self,
        first: NaiveDate,
        last: NaiveDate,
    ) -> Option<(DateTime<FixedOffset>, DateTime<FixedOffset>)> {
        let after = last.succ_opt()?;
        Some((
            self.local_midnight(first),
            self.local_midnight(after) - TimeDelta::nanoseconds(1),
        ))
    }

    /// The most recently completed window of `granularity` as of `now`:
    /// yesterday, last week's Monday, or last month.
    pub fn latest_complete(
        &self,
        granularity: Granularity,
        now: DateTime<Utc>,
    ) -> Result<WindowSpec, RollupError> {
        let today = self.local_date(now);
        let underflow = || RollupError::InvalidWindow(format!("no {granularity} window completes before {today}"));
        match granularity {
            Granularity::Day => today.pred_opt().map(WindowSpec::Day).ok_or_else(underflow),
            Granularity::Week => {
                let this_monday = WeekStart::containing(today).monday();
                let last_monday = this_monday
                    .checked_sub_days(chrono::Days::new(7))
                    .ok_or_else(underflow)?;
                WeekStart::new(last_monday).map(WindowSpec::Week)
            }
            Granularity::Month => YearMonth::of(today)
                .pred()
                .map(WindowSpec::Month)
                .ok_or_else(underflow),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use rstest::rstest;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    fn calendar(offset: &str) -> BusinessCalendar {
        BusinessCalendar::new(parse_offset(offset).unwrap())
    }

    #[rstest]
    #[case::half_hour_east("+05:30", utc(2024, 1, 14, 18, 30))]
    #[case::utc("+00:00", utc(2024, 1, 15, 0, 0))]
    #[case::west("-05:00", utc(2024, 1, 15, 5, 0))]
    #[case::far_east("+14:00", utc(2024, 1, 14, 10, 0))]
    fn day_key_is_the_local_date_at_utc_midnight(
        #[case] offset: &str,
        #[case] local_midnight_utc: DateTime<Utc>,
    ) {
        let window = calendar(offset).resolve(&WindowSpec::Day(date(2024, 1, 15))).unwrap();

        assert_eq!(window.storage_key, StorageKey::Day(utc(2024, 1, 15, 0, 0)));
        assert_eq!(window.query_start.with_timezone(&Utc), local_midnight_utc);
        assert_eq!(
            window.query_end.with_timezone(&Utc),
            local_midnight_utc + TimeDelta::days(1) - TimeDelta::nanoseconds(1)
        );
    }

    #[test]
    fn local_date_follows_the_business_offset() {
        let ist = calendar("+05:30");
        assert_eq!(ist.local_date(utc(2024, 1, 14, 18, 29)), date(2024, 1, 14));
        assert_eq!(ist.local_date(utc(2024, 1, 14, 18, 30)), date(2024, 1, 15));
    }

    #[test]
    fn day_window_contains_both_ends() {
        let window = calendar("+05:30").resolve(&WindowSpec::Day(date(2024, 1, 15))).unwrap();
        assert!(window.contains(utc(2024, 1, 14, 18, 30)));
        assert!(window.contains(utc(2024, 1, 15, 18, 29)));
        assert!(!window.contains(utc(2024, 1, 15, 18, 30)));
        assert!(!window.contains(utc(2024, 1, 14, 18, 29)));
    }

    #[test]
    fn week_window_spans_monday_to_sunday() {
        let week = WeekStart::new(date(2024, 1, 29)).unwrap();
        let window = calendar("+05:30").resolve(&WindowSpec::Week(week)).unwrap();

        assert_eq!(
            window.storage_key,
            StorageKey::Week {
                start: utc(2024, 1, 29, 0, 0),
                end: utc(2024, 2, 4, 0, 0),
            }
        );
        assert_eq!(window.query_start.with_timezone(&Utc), utc(2024, 1, 28, 18, 30));
        assert_eq!(
            window.query_end.with_timezone(&Utc),
            utc(2024, 2, 4, 18, 30) - TimeDelta::nanoseconds(1)
        );
    }

    #[rstest]
    #[case::leap_february(2024, 2, utc(2024, 2, 1, 0, 0), utc(2024, 3, 1, 0, 0))]
    #[case::december(2023, 12, utc(2023, 12, 1, 0, 0), utc(2024, 1, 1, 0, 0))]
    fn month_window_uses_utc_boundaries(
        #[case] year: i32,
        #[case] month: u32,
        #[case] start: DateTime<Utc>,
        #[case] end: DateTime<Utc>,
    ) {
        let ym = YearMonth::new(year, month).unwrap();
        let window = calendar("+05:30").resolve(&WindowSpec::Month(ym)).unwrap();

        assert_eq!(window.storage_key, StorageKey::Month(ym));
        assert_eq!(window.query_start.with_timezone(&Utc), start);
        assert_eq!(window.query_end.with_timezone(&Utc), end);
        assert!(window.contains(start));
        assert!(!window.contains(end));
    }

    #[rstest]
    // 2024-02-06 01:30 local, a Tuesday
    #[case(utc(2024, 2, 5, 20, 0), date(2024, 2, 5), date(2024, 1, 29), (2024, 1))]
    // 2024-03-01 23:59 local
    #[case(utc(2024, 3, 1, 18, 29), date(2024, 2, 29), date(2024, 2, 19), (2024, 2))]
    // 2024-03-02 00:00 local
    #[case(utc(2024, 3, 1, 18, 30), date(2024, 3, 1), date(2024, 2, 19), (2024, 2))]
    // 2024-01-01 06:00 local, a Monday
    #[case(utc(2024, 1, 1, 0, 30), date(2023, 12, 31), date(2023, 12, 25), (2023, 12))]
    fn latest_complete_windows(
        #[case] now: DateTime<Utc>,
        #[case] day: NaiveDate,
        #[case] monday: NaiveDate,
        #[case] month: (i32, u32),
    ) {
        let ist = calendar("+05:30");
        assert_eq!(ist.latest_complete(Granularity::Day, now).unwrap(), WindowSpec::Day(day));
        assert_eq!(
            ist.latest_complete(Granularity::Week, now).unwrap(),
            WindowSpec::Week(WeekStart::new(monday).unwrap())
        );
        assert_eq!(
            ist.latest_complete(Granularity::Month, now).unwrap(),
            WindowSpec::Month(YearMonth::new(month.0, month.1).unwrap())
        );
    }

    #[rstest]
    #[case("+05:30", 19_800)]
    #[case("-03:00", -10_800)]
    #[case("+00:00", 0)]
    fn offsets_parse(#[case] input: &str, #[case] seconds: i32) {
        assert_eq!(parse_offset(input).unwrap().local_minus_utc(), seconds);
    }

    #[rstest]
    #[case("05:30")]
    #[case("+5")]
    #[case("+15:00")]
    #[case("+05:75")]
    #[case("Asia/Kolkata")]
    fn bad_offsets_are_config_errors(#[case] input: &str) {
        assert!(matches!(parse_offset(input), Err(RollupError::Config(_))));
    }
}
