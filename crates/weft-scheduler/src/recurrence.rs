//! Schedule specifications and next-fire computation.
//!
//! `compute_next_run` is a pure function of the spec, the last run time, and
//! the current time, so recurrence behavior is testable against fixed clocks.

use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, Utc};
use cron::Schedule;
use serde::{Deserialize, Serialize};

use weft_core::error::{Result, WeftError};

/// Unit for `ScheduleSpec::Interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalUnit {
    Minutes,
    Hours,
    Days,
}

/// When a scheduled workflow should fire.
///
/// Weekly days count from Monday = 0. All times are UTC.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ScheduleSpec {
    Once {
        run_at: DateTime<Utc>,
    },
    Daily {
        hour: u32,
        minute: u32,
    },
    Weekly {
        day_of_week: u32,
        hour: u32,
        minute: u32,
    },
    Monthly {
        day: u32,
        hour: u32,
        minute: u32,
    },
    Interval {
        value: u64,
        unit: IntervalUnit,
    },
    Cron {
        expression: String,
    },
}

impl ScheduleSpec {
    /// Reject malformed specs at creation time so no dead entry is ever
    /// stored.
    pub fn validate(&self) -> Result<()> {
        match self {
            Self::Once { .. } => Ok(()),
            Self::Daily { hour, minute } => check_time(*hour, *minute),
            Self::Weekly {
                day_of_week,
                hour,
                minute,
            } => {
                if *day_of_week > 6 {
                    return Err(WeftError::Schedule(format!(
                        "day_of_week must be 0-6 (Monday = 0), got {day_of_week}"
                    )));
                }
                check_time(*hour, *minute)
            }
            Self::Monthly { day, hour, minute } => {
                if !(1..=31).contains(day) {
                    return Err(WeftError::Schedule(format!(
                        "day of month must be 1-31, got {day}"
                    )));
                }
                check_time(*hour, *minute)
            }
            Self::Interval { value, .. } => {
                if *value == 0 {
                    return Err(WeftError::Schedule(
                        "interval value must be positive".to_string(),
                    ));
                }
                Ok(())
            }
            Self::Cron { expression } => Schedule::from_str(expression)
                .map(|_| ())
                .map_err(|e| WeftError::Schedule(format!("invalid cron expression: {e}"))),
        }
    }

    pub fn is_recurring(&self) -> bool {
        !matches!(self, Self::Once { .. })
    }
}

fn check_time(hour: u32, minute: u32) -> Result<()> {
    if hour > 23 {
        return Err(WeftError::Schedule(format!("hour must be 0-23, got {hour}")));
    }
    if minute > 59 {
        return Err(WeftError::Schedule(format!(
            "minute must be 0-59, got {minute}"
        )));
    }
    Ok(())
}

/// Next fire time strictly after `now`, or `None` when the spec has no
/// future occurrence (an expired `Once`, or a `Monthly` day that never
/// exists).
pub fn compute_next_run(
    spec: &ScheduleSpec,
    last_run: Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    match spec {
        ScheduleSpec::Once { run_at } => (*run_at > now).then_some(*run_at),

        ScheduleSpec::Daily { hour, minute } => {
            let candidate = at_time(now.date_naive(), *hour, *minute)?;
            if candidate > now {
                Some(candidate)
            } else {
                Some(candidate + chrono::Duration::days(1))
            }
        }

        ScheduleSpec::Weekly {
            day_of_week,
            hour,
            minute,
        } => {
            let today = now.date_naive();
            let days_ahead = (*day_of_week as i64
                - today.weekday().num_days_from_monday() as i64)
                .rem_euclid(7);
            let candidate = at_time(today + chrono::Duration::days(days_ahead), *hour, *minute)?;
            // The target weekday may still be ahead of us today
            if candidate > now {
                Some(candidate)
            } else {
                Some(candidate + chrono::Duration::days(7))
            }
        }

        ScheduleSpec::Monthly { day, hour, minute } => {
            // Months without the requested day are skipped
            let mut year = now.year();
            let mut month = now.month();
            for _ in 0..48 {
                if let Some(date) = NaiveDate::from_ymd_opt(year, month, *day) {
                    if let Some(candidate) = at_time(date, *hour, *minute) {
                        if candidate > now {
                            return Some(candidate);
                        }
                    }
                }
                month += 1;
                if month > 12 {
                    month = 1;
                    year += 1;
                }
            }
            None
        }

        ScheduleSpec::Interval { value, unit } => {
            let base = last_run.unwrap_or(now);
            let delta = match unit {
                IntervalUnit::Minutes => chrono::Duration::minutes(*value as i64),
                IntervalUnit::Hours => chrono::Duration::hours(*value as i64),
                IntervalUnit::Days => chrono::Duration::days(*value as i64),
            };
            Some(base + delta)
        }

        ScheduleSpec::Cron { expression } => {
            let schedule = Schedule::from_str(expression).ok()?;
            schedule.after(&now).next()
        }
    }
}

fn at_time(date: NaiveDate, hour: u32, minute: u32) -> Option<DateTime<Utc>> {
    date.and_hms_opt(hour, minute, 0).map(|dt| dt.and_utc())
}
