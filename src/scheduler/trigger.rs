//! Schedule expressions and the triggers they produce.
//!
//! Two grammars are accepted, tried in order:
//!
//! 1. A six-field calendar expression (`sec min hour dom month dow`) with the
//!    usual cron wildcard, range and step syntax.
//! 2. A simple interval: digits followed by `s`, `m` or `h` (`30s`, `10m`,
//!    `2h`). A zero interval is rejected.
//!
//! A calendar expression with no future match is rejected too.
//!
//! [`parse`] never fails: anything else falls back to [`DEFAULT_SCHEDULE`]
//! with a warning. [`is_valid`] answers the same question truthfully and is
//! what configuration validation uses.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use thiserror::Error;
use tracing::warn;

/// Substituted for any expression that does not parse: every 10 minutes.
pub const DEFAULT_SCHEDULE: &str = "0 */10 * * * *";

const CALENDAR_FIELDS: usize = 6;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ScheduleError {
    #[error("schedule expression is blank")]
    Blank,
    #[error("invalid calendar expression '{expr}': {reason}")]
    Calendar { expr: String, reason: String },
    #[error("calendar expression '{0}' never fires")]
    NeverFires(String),
    #[error("interval '{0}' must be greater than zero")]
    ZeroInterval(String),
    #[error("interval '{0}' is too large")]
    IntervalOverflow(String),
    #[error("'{0}' is neither a six-field calendar expression nor an interval like 30s, 10m, 2h")]
    Unrecognized(String),
}

/// Executable form of a schedule expression.
#[derive(Debug, Clone)]
pub enum Trigger {
    /// Fires on calendar matches of a cron schedule.
    Calendar {
        expression: String,
        schedule: Box<CronSchedule>,
    },
    /// Fires at a fixed rate, the first time immediately.
    Interval(Duration),
}

impl PartialEq for Trigger {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Trigger::Calendar { expression: a, .. }, Trigger::Calendar { expression: b, .. }) => {
                a == b
            }
            (Trigger::Interval(a), Trigger::Interval(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for Trigger {}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Trigger::Calendar { expression, .. } => write!(f, "cron({})", expression),
            Trigger::Interval(period) => write!(f, "every {}s", period.as_secs()),
        }
    }
}

impl FromStr for Trigger {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        try_parse(s)
    }
}

impl Trigger {
    /// The trigger every invalid expression is replaced with.
    pub fn fallback() -> Self {
        // DEFAULT_SCHEDULE is a constant known to parse; the interval arm only
        // exists so this stays total.
        try_parse(DEFAULT_SCHEDULE).unwrap_or(Trigger::Interval(Duration::from_secs(600)))
    }

    pub fn is_fallback(&self) -> bool {
        *self == Self::fallback()
    }

    /// Delay from `now` until the next firing, `None` if the calendar has no
    /// future match.
    pub fn next_delay(&self, now: DateTime<Utc>) -> Option<Duration> {
        match self {
            Trigger::Calendar { schedule, .. } => {
                let next = schedule.after(&now).next()?;
                Some((next - now).to_std().unwrap_or(Duration::ZERO))
            }
            Trigger::Interval(period) => Some(*period),
        }
    }

    /// The next `count` firing times strictly after `after`.
    pub fn upcoming(&self, after: DateTime<Utc>, count: usize) -> Vec<DateTime<Utc>> {
        match self {
            Trigger::Calendar { schedule, .. } => schedule.after(&after).take(count).collect(),
            Trigger::Interval(period) => {
                let Ok(step) = chrono::Duration::from_std(*period) else {
                    return Vec::new();
                };
                (1..=count as i32)
                    .filter_map(|k| step.checked_mul(k).map(|d| after + d))
                    .collect()
            }
        }
    }
}

/// Parse `expr` under the two-tier grammar without falling back.
pub fn try_parse(expr: &str) -> Result<Trigger, ScheduleError> {
    let expr = expr.trim();
    if expr.is_empty() {
        return Err(ScheduleError::Blank);
    }

    if expr.split_whitespace().count() == CALENDAR_FIELDS {
        let schedule = CronSchedule::from_str(expr).map_err(|e| ScheduleError::Calendar {
            expr: expr.to_string(),
            reason: e.to_string(),
        })?;
        // Grammatical but unsatisfiable, e.g. February 30th.
        if schedule.after(&Utc::now()).next().is_none() {
            return Err(ScheduleError::NeverFires(expr.to_string()));
        }
        return Ok(Trigger::Calendar {
            expression: expr.to_string(),
            schedule: Box::new(schedule),
        });
    }

    parse_interval(expr).map(Trigger::Interval)
}

fn parse_interval(expr: &str) -> Result<Duration, ScheduleError> {
    let unrecognized = || ScheduleError::Unrecognized(expr.to_string());

    let Some((unit_at, _)) = expr.char_indices().last() else {
        return Err(unrecognized());
    };
    let (digits, unit) = expr.split_at(unit_at);
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(unrecognized());
    }
    let multiplier: u64 = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        _ => return Err(unrecognized()),
    };

    let magnitude: u64 = digits
        .parse()
        .map_err(|_| ScheduleError::IntervalOverflow(expr.to_string()))?;
    if magnitude == 0 {
        return Err(ScheduleError::ZeroInterval(expr.to_string()));
    }
    magnitude
        .checked_mul(multiplier)
        .map(Duration::from_secs)
        .ok_or_else(|| ScheduleError::IntervalOverflow(expr.to_string()))
}

/// Parse `expr`, substituting [`DEFAULT_SCHEDULE`] when it does not parse.
pub fn parse(expr: Option<&str>) -> Trigger {
    match try_parse(expr.unwrap_or_default()) {
        Ok(trigger) => trigger,
        Err(e) => {
            warn!(
                expression = expr.unwrap_or_default(),
                error = %e,
                default = DEFAULT_SCHEDULE,
                "invalid schedule expression, using default"
            );
            Trigger::fallback()
        }
    }
}

/// Whether `expr` parses under either grammar.
pub fn is_valid(expr: &str) -> bool {
    try_parse(expr).is_ok()
}
