//! Five-field cron expressions (`minute hour day-of-month month day-of-week`).
//!
//! Supports `*`, single values, ranges (`a-b`), steps (`*/n`, `a-b/n`, `a/n`),
//! comma-separated lists, and three-letter month and weekday names. When both
//! day-of-month and day-of-week are restricted, a day matches if either does.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, FixedOffset, NaiveDate, NaiveDateTime, TimeZone, Timelike};
use thiserror::Error;

/// Searching stops after this many days without a match (e.g. `0 0 30 2 *`).
const SEARCH_LIMIT_DAYS: i64 = 366 * 5;

const MONTH_NAMES: &[&str] = &[
    "JAN", "FEB", "MAR", "APR", "MAY", "JUN", "JUL", "AUG", "SEP", "OCT", "NOV", "DEC",
];
const WEEKDAY_NAMES: &[&str] = &["SUN", "MON", "TUE", "WED", "THU", "FRI", "SAT"];

/// Errors raised for malformed cron expressions.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CronError {
    #[error("Expected 5 fields, got {0}")]
    FieldCount(usize),

    #[error("Invalid {field} field: '{value}'")]
    InvalidField { field: &'static str, value: String },
}

struct FieldSpec {
    name: &'static str,
    min: u32,
    max: u32,
    names: &'static [&'static str],
    name_base: u32,
}

const MINUTE: FieldSpec = FieldSpec {
    name: "minute",
    min: 0,
    max: 59,
    names: &[],
    name_base: 0,
};
const HOUR: FieldSpec = FieldSpec {
    name: "hour",
    min: 0,
    max: 23,
    names: &[],
    name_base: 0,
};
const DAY_OF_MONTH: FieldSpec = FieldSpec {
    name: "day-of-month",
    min: 1,
    max: 31,
    names: &[],
    name_base: 0,
};
const MONTH: FieldSpec = FieldSpec {
    name: "month",
    min: 1,
    max: 12,
    names: MONTH_NAMES,
    name_base: 1,
};
// 7 is accepted as an alias for Sunday.
const DAY_OF_WEEK: FieldSpec = FieldSpec {
    name: "day-of-week",
    min: 0,
    max: 7,
    names: WEEKDAY_NAMES,
    name_base: 0,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Field {
    bits: u64,
    wildcard: bool,
}

impl Field {
    fn contains(&self, value: u32) -> bool {
        self.bits & (1u64 << value) != 0
    }
}

impl FieldSpec {
    fn invalid(&self, value: &str) -> CronError {
        CronError::InvalidField {
            field: self.name,
            value: value.to_string(),
        }
    }

    fn value(&self, text: &str, whole: &str) -> Result<u32, CronError> {
        if let Ok(v) = text.parse::<u32>() {
            return Ok(v);
        }
        self.names
            .iter()
            .position(|n| n.eq_ignore_ascii_case(text))
            .map(|i| i as u32 + self.name_base)
            .ok_or_else(|| self.invalid(whole))
    }

    fn parse(&self, text: &str) -> Result<Field, CronError> {
        let mut bits = 0u64;

        for part in text.split(',') {
            let (range, step) = match part.split_once('/') {
                Some((range, step)) => {
                    let step: u32 = step.parse().map_err(|_| self.invalid(text))?;
                    if step == 0 {
                        return Err(self.invalid(text));
                    }
                    (range, Some(step))
                }
                None => (part, None),
            };

            let (start, end) = if range == "*" {
                (self.min, self.max)
            } else if let Some((a, b)) = range.split_once('-') {
                (self.value(a, text)?, self.value(b, text)?)
            } else {
                let v = self.value(range, text)?;
                if step.is_some() { (v, self.max) } else { (v, v) }
            };

            if start < self.min || end > self.max || start > end {
                return Err(self.invalid(text));
            }

            for v in (start..=end).step_by(step.unwrap_or(1) as usize) {
                bits |= 1u64 << v;
            }
        }

        if self.max == 7 && bits & (1 << 7) != 0 {
            bits = (bits | 1) & !(1 << 7);
        }

        Ok(Field {
            bits,
            wildcard: text.starts_with('*'),
        })
    }
}

/// A parsed cron schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    expression: String,
    minutes: Field,
    hours: Field,
    days_of_month: Field,
    months: Field,
    days_of_week: Field,
}

impl Schedule {
    pub fn parse(expression: &str) -> Result<Self, CronError> {
        let fields: Vec<&str> = expression.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(CronError::FieldCount(fields.len()));
        }

        Ok(Self {
            expression: fields.join(" "),
            minutes: MINUTE.parse(fields[0])?,
            hours: HOUR.parse(fields[1])?,
            days_of_month: DAY_OF_MONTH.parse(fields[2])?,
            months: MONTH.parse(fields[3])?,
            days_of_week: DAY_OF_WEEK.parse(fields[4])?,
        })
    }

    fn day_matches(&self, date: NaiveDate) -> bool {
        let dom = self.days_of_month.contains(date.day());
        let dow = self.days_of_week.contains(date.weekday().num_days_from_sunday());

        match (self.days_of_month.wildcard, self.days_of_week.wildcard) {
            (false, false) => dom || dow,
            (false, true) => dom,
            (true, false) => dow,
            (true, true) => true,
        }
    }

    /// First matching minute strictly after `after`, in `after`'s offset.
    ///
    /// Returns `None` if nothing matches within five years.
    pub fn next_after(&self, after: &DateTime<FixedOffset>) -> Option<DateTime<FixedOffset>> {
        let offset = *after.offset();
        let start = after.naive_local();
        let limit = start + chrono::Duration::days(SEARCH_LIMIT_DAYS);

        let mut t = start.with_second(0)?.with_nanosecond(0)? + chrono::Duration::minutes(1);

        while t <= limit {
            if !self.months.contains(t.month()) {
                t = first_of_next_month(t)?;
                continue;
            }
            if !self.day_matches(t.date()) {
                t = t.date().succ_opt()?.and_hms_opt(0, 0, 0)?;
                continue;
            }
            if !self.hours.contains(t.hour()) {
                t = t.date().and_hms_opt(t.hour(), 0, 0)? + chrono::Duration::hours(1);
                continue;
            }
            if !self.minutes.contains(t.minute()) {
                t += chrono::Duration::minutes(1);
                continue;
            }
            return offset.from_local_datetime(&t).single();
        }

        None
    }
}

fn first_of_next_month(t: NaiveDateTime) -> Option<NaiveDateTime> {
    let (year, month) = if t.month() == 12 {
        (t.year() + 1, 1)
    } else {
        (t.year(), t.month() + 1)
    };
    NaiveDate::from_ymd_opt(year, month, 1)?.and_hms_opt(0, 0, 0)
}

impl FromStr for Schedule {
    type Err = CronError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Schedule::parse(s)
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.expression)
    }
}
