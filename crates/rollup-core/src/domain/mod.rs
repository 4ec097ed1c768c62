//! Domain model: job kinds, windows, the business calendar, tasks and errors.

pub mod attempt;
pub mod calendar;
pub mod decision;
pub mod errors;
pub mod ids;
pub mod job;
pub mod task;
pub mod window;

pub use attempt::{AttemptOutcome, AttemptRecord, DecisionRecord};
pub use calendar::{BusinessCalendar, ResolvedWindow, StorageKey, parse_offset};
pub use decision::{Decider, Decision, DefaultDecider};
pub use errors::{ErrorKind, RollupError};
pub use ids::{AttemptId, TaskId};
pub use job::{Granularity, JobKind, JobTemplate, STANDARD_JOBS, standard_template};
pub use task::{TaskEnvelope, TaskHandle};
pub use window::{WeekStart, WindowPayload, WindowSpec, YearMonth, parse_date};
