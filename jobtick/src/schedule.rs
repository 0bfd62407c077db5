//! Computing when a job is next due.
//!
//! Job schedules are standard five field cron expressions:
//!
//! ```text
//! ┌───────────── minute (0-59)
//! │ ┌───────────── hour (0-23)
//! │ │ ┌───────────── day of month (1-31)
//! │ │ │ ┌───────────── month (1-12)
//! │ │ │ │ ┌───────────── day of week (0-6, 0 is Sunday)
//! * * * * *
//! ```
//!
//! Each field is `*`, a number, a range `a-b`, or a comma separated list of those. A step `/n`
//! may follow `*` or a range. All times are UTC.
//!
//! When both the day of month and day of week are restricted (neither starts with `*`) a day
//! matches if *either* field matches, as in Vixie cron. Otherwise both must match.
//!
//! # Example
//!
//! ```
//! # use jobtick::schedule::{CronCalculator, ScheduleCalculator};
//! # use chrono::{TimeZone, Utc};
//! let calculator = CronCalculator::default();
//! let from = Utc.with_ymd_and_hms(2024, 3, 1, 12, 0, 0).unwrap();
//!
//! assert!(calculator.is_valid("0 2 * * *"));
//! assert!(!calculator.is_valid("* * * *"));
//! assert_eq!(
//!     calculator.next_execution_time("0 2 * * *", from).unwrap(),
//!     Utc.with_ymd_and_hms(2024, 3, 2, 2, 0, 0).unwrap(),
//! );
//! ```
use std::{collections::BTreeSet, fmt::Display, str::FromStr};

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;

/// How far past `from` to search before declaring a schedule unreachable.
///
/// Eight years always contains a 29th of February.
pub const SEARCH_HORIZON_YEARS: i64 = 8;

#[derive(Debug, Error)]
pub enum ScheduleError {
    #[error("`{expression}` is not a valid cron expression: {reason}")]
    Invalid { expression: String, reason: String },
    #[error("`{expression}` has no occurrence within {SEARCH_HORIZON_YEARS} years")]
    Unreachable { expression: String },
}

/// Computes when a schedule expression is next due.
pub trait ScheduleCalculator: Send + Sync {
    /// The earliest time strictly after `from` matching `expression`.
    fn next_execution_time(
        &self,
        expression: &str,
        from: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, ScheduleError>;

    fn is_valid(&self, expression: &str) -> bool;
}

/// The default [`ScheduleCalculator`] for five field cron expressions.
#[derive(Debug, Clone, Copy, Default)]
pub struct CronCalculator;

impl ScheduleCalculator for CronCalculator {
    fn next_execution_time(
        &self,
        expression: &str,
        from: DateTime<Utc>,
    ) -> Result<DateTime<Utc>, ScheduleError> {
        expression.parse::<CronExpression>()?.next_after(from)
    }

    fn is_valid(&self, expression: &str) -> bool {
        expression.parse::<CronExpression>().is_ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Bounds {
    name: &'static str,
    min: u8,
    max: u8,
}

const MINUTE: Bounds = Bounds {
    name: "minute",
    min: 0,
    max: 59,
};
const HOUR: Bounds = Bounds {
    name: "hour",
    min: 0,
    max: 23,
};
const DAY_OF_MONTH: Bounds = Bounds {
    name: "day of month",
    min: 1,
    max: 31,
};
const MONTH: Bounds = Bounds {
    name: "month",
    min: 1,
    max: 12,
};
const DAY_OF_WEEK: Bounds = Bounds {
    name: "day of week",
    min: 0,
    max: 6,
};

/// One parsed cron field: the set of values it allows.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Field {
    values: BTreeSet<u8>,
    /// False when the field starts with `*`.
    restricted: bool,
    bounds: Bounds,
}

impl Field {
    fn parse(raw: &str, bounds: Bounds) -> Result<Self, String> {
        let mut values = BTreeSet::new();
        for item in raw.split(',') {
            values.extend(Self::parse_item(item, bounds)?);
        }
        Ok(Self {
            values,
            restricted: !raw.starts_with('*'),
            bounds,
        })
    }

    fn parse_item(item: &str, bounds: Bounds) -> Result<Vec<u8>, String> {
        let (base, step) = match item.split_once('/') {
            Some((base, step)) => {
                let step = parse_number(step, bounds)?;
                if step == 0 {
                    return Err(format!("{} step must be positive", bounds.name));
                }
                (base, Some(step))
            }
            None => (item, None),
        };
        let (start, end) = match base {
            "*" => (bounds.min, bounds.max),
            _ => match base.split_once('-') {
                Some((start, end)) => {
                    let (start, end) = (parse_value(start, bounds)?, parse_value(end, bounds)?);
                    if start > end {
                        return Err(format!("{} range {base} is reversed", bounds.name));
                    }
                    (start, end)
                }
                None if step.is_some() => {
                    return Err(format!(
                        "{} step must follow `*` or a range, found `{item}`",
                        bounds.name
                    ))
                }
                None => {
                    let value = parse_value(base, bounds)?;
                    (value, value)
                }
            },
        };
        Ok((start..=end)
            .step_by(step.unwrap_or(1).into())
            .collect())
    }

    fn is_full(&self) -> bool {
        self.values.len() == usize::from(self.bounds.max - self.bounds.min + 1)
    }

    /// Render for the `cron` crate, shifting every value by `offset`.
    fn render(&self, offset: u8) -> String {
        if self.is_full() {
            return "*".to_owned();
        }
        self.values
            .iter()
            .map(|value| (value + offset).to_string())
            .collect::<Vec<_>>()
            .join(",")
    }
}

fn parse_number(raw: &str, bounds: Bounds) -> Result<u8, String> {
    if raw.is_empty() || !raw.bytes().all(|byte| byte.is_ascii_digit()) {
        return Err(format!("{} `{raw}` is not a number", bounds.name));
    }
    raw.parse()
        .map_err(|_| format!("{} `{raw}` is out of range", bounds.name))
}

fn parse_value(raw: &str, bounds: Bounds) -> Result<u8, String> {
    let value = parse_number(raw, bounds)?;
    if value < bounds.min || value > bounds.max {
        return Err(format!(
            "{} {value} is outside {}-{}",
            bounds.name, bounds.min, bounds.max
        ));
    }
    Ok(value)
}

/// A validated five field cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    source: String,
    minutes: Field,
    hours: Field,
    days_of_month: Field,
    months: Field,
    days_of_week: Field,
}

impl FromStr for CronExpression {
    type Err = ScheduleError;

    fn from_str(expression: &str) -> Result<Self, Self::Err> {
        let invalid = |reason: String| ScheduleError::Invalid {
            expression: expression.to_owned(),
            reason,
        };
        let fields = expression.split_whitespace().collect::<Vec<_>>();
        let [minutes, hours, days_of_month, months, days_of_week] = fields[..] else {
            return Err(invalid(format!(
                "expected 5 fields, found {}",
                fields.len()
            )));
        };
        Ok(Self {
            source: expression.to_owned(),
            minutes: Field::parse(minutes, MINUTE).map_err(invalid)?,
            hours: Field::parse(hours, HOUR).map_err(invalid)?,
            days_of_month: Field::parse(days_of_month, DAY_OF_MONTH).map_err(invalid)?,
            months: Field::parse(months, MONTH).map_err(invalid)?,
            days_of_week: Field::parse(days_of_week, DAY_OF_WEEK).map_err(invalid)?,
        })
    }
}

impl Display for CronExpression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.source)
    }
}

impl CronExpression {
    /// The earliest time strictly after `from` matching this expression.
    pub fn next_after(&self, from: DateTime<Utc>) -> Result<DateTime<Utc>, ScheduleError> {
        let horizon = from + TimeDelta::days(366 * SEARCH_HORIZON_YEARS);
        self.schedules()?
            .iter()
            .filter_map(|schedule| schedule.after(&from).next())
            .min()
            .filter(|next| *next <= horizon)
            .ok_or_else(|| ScheduleError::Unreachable {
                expression: self.source.clone(),
            })
    }

    /// The `cron` crate schedules whose union is this expression.
    ///
    /// The `cron` crate always intersects day of month and day of week and counts days of the
    /// week from 1 (Sunday), so a doubly restricted expression becomes two schedules.
    fn schedules(&self) -> Result<Vec<cron::Schedule>, ScheduleError> {
        let days = if self.days_of_month.restricted && self.days_of_week.restricted {
            vec![
                (self.days_of_month.render(0), "*".to_owned()),
                ("*".to_owned(), self.days_of_week.render(1)),
            ]
        } else {
            vec![(self.days_of_month.render(0), self.days_of_week.render(1))]
        };
        days.into_iter()
            .map(|(days_of_month, days_of_week)| {
                let rendered = format!(
                    "0 {} {} {} {} {}",
                    self.minutes.render(0),
                    self.hours.render(0),
                    days_of_month,
                    self.months.render(0),
                    days_of_week,
                );
                cron::Schedule::from_str(&rendered).map_err(|error| ScheduleError::Invalid {
                    expression: self.source.clone(),
                    reason: error.to_string(),
                })
            })
            .collect()
    }
}
