//! Scheduling: schedule expressions, the task registry that drives suite
//! runs, and the sinks that receive their results.

pub mod engine;
pub mod history;
pub mod trigger;

pub use self::engine::{RescheduleSummary, ScheduleTaskError, Scheduler};
pub use self::history::{LogSink, ResultSink, RunHistory};
pub use self::trigger::{is_valid, parse, Trigger, DEFAULT_SCHEDULE};
