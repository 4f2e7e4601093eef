//! Cron engine
//!
//! Computes, for a schedule, the most recent fire time that passed without a
//! run and the next upcoming fire time. Pure: "now" is always an argument.

use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use croner::Cron;
use thiserror::Error;

/// Upper bound on fire times walked in one evaluation (a week of minutes)
pub const MAX_MISSED_RUNS: u32 = 60 * 24 * 7;

/// Look-back window in hours when the schedule never fired
const DEFAULT_LOOKBACK_HOURS: i64 = 1;

/// Schedule evaluation errors. All of them need a spec change to go away.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ScheduleError {
    /// The cron expression does not parse
    #[error("unparseable schedule {expression:?}: {reason}")]
    InvalidCron {
        /// Expression as written
        expression: String,
        /// Parser message
        reason: String,
    },

    /// The time zone is not in the IANA database
    #[error("unknown time zone {0:?}")]
    UnknownTimeZone(String),

    /// More fire times were missed than the walk is allowed to visit
    #[error("too many missed start times (> {MAX_MISSED_RUNS}), set or decrease .spec.startingDeadlineSeconds or check clock skew")]
    TooManyMissedRuns,
}

/// A parsed cron expression bound to a time zone
pub struct CronSchedule {
    expression: String,
    cron: Cron,
    tz: Tz,
}

impl CronSchedule {
    /// Parse a standard 5-field expression (or an `@daily`-style alias)
    /// evaluated in `time_zone`, UTC when unset
    pub fn parse(expression: &str, time_zone: Option<&str>) -> Result<Self, ScheduleError> {
        let tz = match time_zone {
            Some(name) => name
                .parse::<Tz>()
                .map_err(|_| ScheduleError::UnknownTimeZone(name.to_string()))?,
            None => Tz::UTC,
        };

        let invalid = |reason: String| ScheduleError::InvalidCron {
            expression: expression.to_string(),
            reason,
        };
        let trimmed = expression.trim();
        let fields = trimmed.split_whitespace().count();
        if !trimmed.starts_with('@') && fields != 5 {
            return Err(invalid(format!("expected 5 fields, found {}", fields)));
        }
        let cron = Cron::new(trimmed)
            .parse()
            .map_err(|e| invalid(e.to_string()))?;

        Ok(Self {
            expression: expression.to_string(),
            cron,
            tz,
        })
    }

    /// First fire time strictly after `t`
    pub fn next_after(&self, t: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        self.cron
            .find_next_occurrence(&t.with_timezone(&self.tz), false)
            .map(|next| next.with_timezone(&Utc))
            .map_err(|e| ScheduleError::InvalidCron {
                expression: self.expression.clone(),
                reason: e.to_string(),
            })
    }
}

/// Inputs of one evaluation
#[derive(Debug, Clone, Default)]
pub struct ScheduleInput<'a> {
    /// Cron expression
    pub expression: &'a str,
    /// IANA time zone
    pub time_zone: Option<&'a str>,
    /// Seconds after a fire time during which it may still start
    pub starting_deadline_seconds: Option<i64>,
    /// Fire time of the last created run
    pub last_schedule_time: Option<DateTime<Utc>>,
    /// Manual trigger marker present
    pub triggered: bool,
}

/// Result of one evaluation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Fire {
    /// Most recent fire time at or before now that has no run yet
    pub missed: Option<DateTime<Utc>>,
    /// Next fire time after now
    pub next: DateTime<Utc>,
}

/// Evaluate a schedule at `now`
pub fn evaluate(input: &ScheduleInput<'_>, now: DateTime<Utc>) -> Result<Fire, ScheduleError> {
    let schedule = CronSchedule::parse(input.expression, input.time_zone)?;
    let next = schedule.next_after(now)?;

    if input.triggered {
        return Ok(Fire {
            missed: Some(now),
            next,
        });
    }

    let mut earliest = input
        .last_schedule_time
        .unwrap_or(now - Duration::hours(DEFAULT_LOOKBACK_HOURS));
    if let Some(deadline) = input.starting_deadline_seconds {
        // nothing older than the deadline window can start anymore
        earliest = earliest.max(now - Duration::seconds(deadline));
    }
    if earliest > now {
        return Ok(Fire { missed: None, next });
    }

    let mut missed = None;
    let mut visited = 0u32;
    let mut t = schedule.next_after(earliest)?;
    while t <= now {
        missed = Some(t);
        visited += 1;
        if visited > MAX_MISSED_RUNS {
            return Err(ScheduleError::TooManyMissedRuns);
        }
        t = schedule.next_after(t)?;
    }
    Ok(Fire { missed, next })
}
