//! Errors - エラー型と運用分類
//!
//! Every failure in the core is a [`RollupError`]. The dispatch loop asks
//! [`RollupError::kind`] whether a failed task goes back to the queue for a
//! retry or straight to the dead-letter state.

use std::time::Duration;

use thiserror::Error;

use super::job::{Granularity, JobKind};
use super::window::WindowSpec;

/// ErrorKind は実行エラーの分類
///
/// - Transient: 一時的なエラー（リトライ推奨）
/// - Permanent: 恒久的なエラー（リトライ無意味、即 dead-letter）
/// - Infrastructure: キューそのものの障害
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

#[derive(Debug, Error)]
pub enum RollupError {
    #[error("invalid window: {0}")]
    InvalidWindow(String),

    #[error("unknown job kind: {0}")]
    UnknownJobKind(JobKind),

    #[error("job kind {0} is already registered")]
    DuplicateJobKind(JobKind),

    #[error("job kind {kind} computes {expected} windows, got a {actual} window")]
    GranularityMismatch {
        kind: JobKind,
        expected: Granularity,
        actual: Granularity,
    },

    #[error("payload decode: {0}")]
    PayloadDecode(String),

    #[error("storage unavailable: {0}")]
    TransientStorage(String),

    #[error("aggregation did not finish within {0:?}")]
    Timeout(Duration),

    /// The execution panicked or was torn down before returning.
    #[error("aggregation aborted: {0}")]
    ExecutionAborted(String),

    /// Source rows that cannot be aggregated, e.g. sums past the counter range.
    #[error("invalid source data: {0}")]
    InvalidSource(String),

    #[error("queue unavailable: {0}")]
    QueueUnavailable(String),

    /// A plan stopped because one window could not be enqueued.
    /// `enqueued` tasks made it into the queue before the failure and stay there.
    #[error("failed to enqueue {kind} for {window} after {enqueued} task(s): {source}")]
    Enqueue {
        kind: JobKind,
        window: WindowSpec,
        enqueued: usize,
        #[source]
        source: Box<RollupError>,
    },

    #[error("missing job kinds: {0:?}. These kinds were expected but not registered.")]
    MissingJobKinds(Vec<String>),

    #[error("config: {0}")]
    Config(String),
}

impl RollupError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RollupError::TransientStorage(_)
            | RollupError::Timeout(_)
            | RollupError::ExecutionAborted(_) => ErrorKind::Transient,
            RollupError::QueueUnavailable(_) => ErrorKind::Infrastructure,
            RollupError::Enqueue { source, .. } => source.kind(),
            RollupError::InvalidWindow(_)
            | RollupError::UnknownJobKind(_)
            | RollupError::DuplicateJobKind(_)
            | RollupError::GranularityMismatch { .. }
            | RollupError::PayloadDecode(_)
            | RollupError::InvalidSource(_)
            | RollupError::MissingJobKinds(_)
            | RollupError::Config(_) => ErrorKind::Permanent,
        }
    }

    /// Permanent errors never succeed on redelivery.
    pub fn is_retryable(&self) -> bool {
        self.kind() != ErrorKind::Permanent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::invalid_window(RollupError::InvalidWindow("x".into()), ErrorKind::Permanent)]
    #[case::unknown_kind(RollupError::UnknownJobKind(JobKind::new("nope")), ErrorKind::Permanent)]
    #[case::storage(RollupError::TransientStorage("down".into()), ErrorKind::Transient)]
    #[case::timeout(RollupError::Timeout(Duration::from_secs(1)), ErrorKind::Transient)]
    #[case::aborted(RollupError::ExecutionAborted("panicked".into()), ErrorKind::Transient)]
    #[case::invalid_source(RollupError::InvalidSource("overflow".into()), ErrorKind::Permanent)]
    #[case::queue(RollupError::QueueUnavailable("closed".into()), ErrorKind::Infrastructure)]
    fn errors_are_classified(#[case] err: RollupError, #[case] expected: ErrorKind) {
        assert_eq!(err.kind(), expected);
    }

    #[test]
    fn enqueue_error_takes_the_kind_of_its_source() {
        let err = RollupError::Enqueue {
            kind: JobKind::new("analytics:daily_revenue"),
            window: WindowSpec::Day(chrono::NaiveDate::from_ymd_opt(2024, 1, 30).unwrap()),
            enqueued: 3,
            source: Box::new(RollupError::QueueUnavailable("closed".into())),
        };
        assert_eq!(err.kind(), ErrorKind::Infrastructure);
        assert!(err.is_retryable());
        let msg = err.to_string();
        assert!(msg.contains("day 2024-01-30"));
        assert!(msg.contains("after 3 task(s)"));
    }
}
