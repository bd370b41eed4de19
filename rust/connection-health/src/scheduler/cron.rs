//! Cron expression parsing and evaluation.
//!
//! Supports the standard five-field format `minute hour day month weekday`
//! plus the common `@daily`-style macros. All evaluation happens in UTC.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, NaiveDate, NaiveDateTime, TimeDelta, Timelike, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How far ahead `next_after` searches. Eight years always contains a Feb 29.
const SEARCH_YEARS: i32 = 8;

const MONTH_NAMES: &[&str] = &[
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const WEEKDAY_NAMES: &[&str] = &["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Errors produced while parsing a cron expression.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronError {
    #[error("cron expression is empty")]
    Empty,

    #[error("expected 5 fields (minute hour day-of-month month day-of-week), found {found}")]
    FieldCount { found: usize },

    #[error("{field} value '{value}' is not a number or a known name")]
    InvalidValue { field: &'static str, value: String },

    #[error("{field} value {value} is out of range {min}-{max}")]
    OutOfRange {
        field: &'static str,
        value: u32,
        min: u32,
        max: u32,
    },

    #[error("{field} range '{range}' must have start <= end")]
    InvalidRange { field: &'static str, range: String },

    #[error("{field} step '{step}' must be between 1 and {max}")]
    InvalidStep {
        field: &'static str,
        step: String,
        max: u32,
    },

    #[error("unknown macro '{0}'")]
    UnknownMacro(String),

    #[error("'{0}' never matches a calendar date")]
    NeverFires(String),
}

/// Static description of one cron field.
#[derive(Debug)]
struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    /// Value of the first entry in `names`.
    names_offset: u32,
}

const MINUTE: FieldSpec = FieldSpec {
    name: "minute",
    min: 0,
    max: 59,
    names: &[],
    names_offset: 0,
};
const HOUR: FieldSpec = FieldSpec {
    name: "hour",
    min: 0,
    max: 23,
    names: &[],
    names_offset: 0,
};
const DAY: FieldSpec = FieldSpec {
    name: "day-of-month",
    min: 1,
    max: 31,
    names: &[],
    names_offset: 0,
};
const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: MONTH_NAMES,
    names_offset: 1,
};
// 7 is accepted as an alias for Sunday and folded into 0 after parsing.
const WEEKDAY: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 0,
    max: 7,
    names: WEEKDAY_NAMES,
    names_offset: 0,
};

/// A parsed cron expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    /// Text as supplied by the user.
    source: String,
    /// Five-field form with macros expanded.
    normalized: String,
    minute: CronField,
    hour: CronField,
    day: CronField,
    month: CronField,
    weekday: CronField,
}

/// Set of permitted values for one field, as a bitmask.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct CronField {
    bits: u64,
    /// False when the field was written starting with `*`.
    restricted: bool,
}

impl CronField {
    /// Check if the field matches the given value.
    fn matches(self, value: u32) -> bool {
        value < 64 && self.bits & (1 << value) != 0
    }
}

/// Cron expression parser.
#[derive(Debug)]
pub struct CronParser;

impl CronParser {
    /// Parse a cron expression string.
    ///
    /// # Format
    ///
    /// Standard cron format: `minute hour day month weekday`. Each field
    /// accepts comma separated lists of `*`, `n`, `a-b`, `*/s`, `a-b/s`
    /// and `a/s`. Months and weekdays also accept three-letter names.
    ///
    /// # Examples
    ///
    /// - `0 0 * * *` - Daily at midnight
    /// - `*/5 * * * *` - Every 5 minutes
    /// - `0 9-17 * * 1-5` - Every hour 9am-5pm, Monday-Friday
    /// - `@hourly` - Start of every hour
    pub fn parse(expr: &str) -> Result<CronExpression, CronError> {
        let source = expr.trim();
        if source.is_empty() {
            return Err(CronError::Empty);
        }

        let normalized = if source.starts_with('@') {
            expand_macro(source)?.to_string()
        } else {
            source.split_whitespace().collect::<Vec<_>>().join(" ")
        };

        let parts: Vec<&str> = normalized.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(CronError::FieldCount { found: parts.len() });
        }

        let mut weekday = Self::parse_field(parts[4], &WEEKDAY)?;
        if weekday.matches(7) {
            weekday.bits = (weekday.bits & !(1 << 7)) | 1;
        }

        let expression = CronExpression {
            source: source.to_string(),
            minute: Self::parse_field(parts[0], &MINUTE)?,
            hour: Self::parse_field(parts[1], &HOUR)?,
            day: Self::parse_field(parts[2], &DAY)?,
            month: Self::parse_field(parts[3], &MONTH)?,
            weekday,
            normalized,
        };

        if !expression.has_feasible_date() {
            return Err(CronError::NeverFires(expression.source));
        }
        Ok(expression)
    }

    /// Check an expression without persisting anything.
    ///
    /// On success the result carries the normalized expression and the
    /// first occurrence strictly after `now`.
    pub fn validate(expr: &str, now: &DateTime<Utc>) -> CronValidation {
        match Self::parse(expr) {
            Ok(parsed) => CronValidation {
                is_valid: true,
                description: Some(parsed.normalized().to_string()),
                next_run_time: parsed.next_after(now),
                error_message: None,
            },
            Err(e) => CronValidation {
                is_valid: false,
                description: None,
                next_run_time: None,
                error_message: Some(e.to_string()),
            },
        }
    }

    fn parse_field(field: &str, spec: &FieldSpec) -> Result<CronField, CronError> {
        let mut bits = 0u64;

        for item in field.split(',') {
            let (range, step) = match item.split_once('/') {
                Some((range, step)) => (range, Some(Self::parse_step(step, spec)?)),
                None => (item, None),
            };

            let (start, end) = if range == "*" {
                (spec.min, spec.max)
            } else if let Some((a, b)) = range.split_once('-') {
                let start = Self::parse_value(a, spec)?;
                let end = Self::parse_value(b, spec)?;
                if start > end {
                    return Err(CronError::InvalidRange {
                        field: spec.name,
                        range: range.to_string(),
                    });
                }
                (start, end)
            } else {
                let value = Self::parse_value(range, spec)?;
                // `a/s` runs from `a` to the end of the field.
                if step.is_some() {
                    (value, spec.max)
                } else {
                    (value, value)
                }
            };

            for value in (start..=end).step_by(step.unwrap_or(1) as usize) {
                bits |= 1 << value;
            }
        }

        Ok(CronField {
            bits,
            restricted: !field.starts_with('*'),
        })
    }

    fn parse_step(step: &str, spec: &FieldSpec) -> Result<u32, CronError> {
        match step.parse::<u32>() {
            Ok(n) if n >= 1 && n <= spec.max => Ok(n),
            _ => Err(CronError::InvalidStep {
                field: spec.name,
                step: step.to_string(),
                max: spec.max,
            }),
        }
    }

    fn parse_value(raw: &str, spec: &FieldSpec) -> Result<u32, CronError> {
        let value = if let Ok(n) = raw.parse::<u32>() {
            n
        } else {
            let position = spec
                .names
                .iter()
                .position(|name| name.eq_ignore_ascii_case(raw))
                .ok_or_else(|| CronError::InvalidValue {
                    field: spec.name,
                    value: raw.to_string(),
                })?;
            u32::try_from(position).unwrap_or(u32::MAX) + spec.names_offset
        };

        if value < spec.min || value > spec.max {
            return Err(CronError::OutOfRange {
                field: spec.name,
                value,
                min: spec.min,
                max: spec.max,
            });
        }
        Ok(value)
    }
}

fn expand_macro(name: &str) -> Result<&'static str, CronError> {
    match name.to_ascii_lowercase().as_str() {
        "@yearly" | "@annually" => Ok("0 0 1 1 *"),
        "@monthly" => Ok("0 0 1 * *"),
        "@weekly" => Ok("0 0 * * 0"),
        "@daily" | "@midnight" => Ok("0 0 * * *"),
        "@hourly" => Ok("0 * * * *"),
        _ => Err(CronError::UnknownMacro(name.to_string())),
    }
}

/// Result of [`CronParser::validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronValidation {
    pub is_valid: bool,
    pub description: Option<String>,
    pub next_run_time: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
}

impl CronExpression {
    /// The expression as supplied.
    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// The five-field form, with macros expanded.
    pub fn normalized(&self) -> &str {
        &self.normalized
    }

    /// Check if the cron expression matches the given time (minute precision).
    pub fn matches(&self, time: &DateTime<Utc>) -> bool {
        self.minute.matches(time.minute())
            && self.hour.matches(time.hour())
            && self.month.matches(time.month())
            && self.day_matches(time.date_naive())
    }

    /// Calculate the first matching instant strictly after `after`.
    ///
    /// Returns `None` only when nothing matches within the search window.
    pub fn next_after(&self, after: &DateTime<Utc>) -> Option<DateTime<Utc>> {
        let truncated = after.naive_utc().with_second(0)?.with_nanosecond(0)?;
        let mut current: NaiveDateTime = truncated + TimeDelta::minutes(1);
        let limit_year = current.year() + SEARCH_YEARS;

        while current.year() <= limit_year {
            let date = current.date();

            if !self.month.matches(current.month()) {
                current = first_of_next_month(date)?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.day_matches(date) {
                current = date.succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.hour.matches(current.hour()) {
                current = date.and_hms_opt(current.hour(), 0, 0)? + TimeDelta::hours(1);
                continue;
            }
            if !self.minute.matches(current.minute()) {
                current += TimeDelta::minutes(1);
                continue;
            }
            return Some(current.and_utc());
        }
        None
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.day.matches(date.day());
        let dow = self.weekday.matches(date.weekday().num_days_from_sunday());
        if self.day.restricted && self.weekday.restricted {
            dom || dow
        } else {
            dom && dow
        }
    }

    /// Whether some month contains one of the permitted days of month.
    fn has_feasible_date(&self) -> bool {
        if self.weekday.restricted && self.day.restricted {
            return true;
        }
        (1..=12u32).filter(|m| self.month.matches(*m)).any(|month| {
            let longest = match month {
                2 => 29,
                4 | 6 | 9 | 11 => 30,
                _ => 31,
            };
            (1..=longest).any(|day| self.day.matches(day))
        })
    }
}

fn first_of_next_month(date: NaiveDate) -> Option<NaiveDate> {
    if date.month() == 12 {
        NaiveDate::from_ymd_opt(date.year() + 1, 1, 1)
    } else {
        NaiveDate::from_ymd_opt(date.year(), date.month() + 1, 1)
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.source)
    }
}

impl FromStr for CronExpression {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CronParser::parse(s)
    }
}
