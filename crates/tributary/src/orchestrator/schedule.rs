//! When a task runs

use chrono::{DateTime, Utc};
use cron::Schedule as CronSchedule;
use std::str::FromStr;
use std::time::Duration;

use crate::error::{Error, Result};

/// Scheduling mode of a task
#[derive(Debug, Clone)]
pub enum Schedule {
    /// Run once, then terminate
    OneShot,
    /// Run again `period` after the previous run started
    Interval(Duration),
    /// Union of cron expressions
    Cron(Vec<CronSchedule>),
}

impl Schedule {
    /// Build a schedule from cron expressions and an interval
    ///
    /// Both empty means one-shot; setting both is an error.
    pub fn from_parts(cron: &[String], interval: Option<Duration>) -> Result<Self> {
        match (cron.is_empty(), interval) {
            (true, None) => Ok(Self::OneShot),
            (true, Some(period)) if period.is_zero() => {
                Err(Error::Schedule("interval must be greater than zero".into()))
            }
            (true, Some(period)) => Ok(Self::Interval(period)),
            (false, None) => cron
                .iter()
                .map(|expr| {
                    CronSchedule::from_str(expr)
                        .map_err(|e| Error::Schedule(format!("invalid cron expression {:?}: {}", expr, e)))
                })
                .collect::<Result<Vec<_>>>()
                .map(Self::Cron),
            (false, Some(_)) => Err(Error::Schedule(
                "schedule and interval are mutually exclusive".into(),
            )),
        }
    }

    /// Whether the task runs more than once
    pub fn is_recurring(&self) -> bool {
        !matches!(self, Self::OneShot)
    }

    /// Next run strictly after `after`, `None` for one-shot or exhausted
    /// cron expressions
    pub fn next_after(&self, after: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Self::OneShot => None,
            Self::Interval(period) => {
                let period = chrono::Duration::from_std(*period).ok()?;
                after.checked_add_signed(period)
            }
            Self::Cron(schedules) => schedules
                .iter()
                .filter_map(|s| s.after(&after).next())
                .min(),
        }
    }
}
