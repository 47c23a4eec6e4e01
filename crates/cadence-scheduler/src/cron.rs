//! 5-field cron expressions: `minute hour day month weekday`.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike};

use crate::error::ParseError;

/// Upper bound of the minute-by-minute search in [`CronExpression::next_run_after`].
///
/// One leap year of minutes, so a yearly schedule is always found.
pub const MAX_SCAN_MINUTES: u32 = 366 * 24 * 60;

/// One position of a cron expression and its domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Minute,
    Hour,
    Day,
    Month,
    /// 0 = Sunday through 6 = Saturday.
    Weekday,
}

impl Field {
    const ALL: [Field; 5] = [
        Field::Minute,
        Field::Hour,
        Field::Day,
        Field::Month,
        Field::Weekday,
    ];

    pub fn bounds(self) -> (u32, u32) {
        match self {
            Field::Minute => (0, 59),
            Field::Hour => (0, 23),
            Field::Day => (1, 31),
            Field::Month => (1, 12),
            Field::Weekday => (0, 6),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Field::Minute => "minute",
            Field::Hour => "hour",
            Field::Day => "day",
            Field::Month => "month",
            Field::Weekday => "weekday",
        }
    }
}

/// Allowed values of one field, as a bitmask (every domain fits in 64 bits).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FieldSet(u64);

impl FieldSet {
    fn insert(&mut self, value: u32) {
        self.0 |= 1u64 << value;
    }

    pub fn contains(&self, value: u32) -> bool {
        value < 64 && self.0 & (1u64 << value) != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn len(&self) -> usize {
        self.0.count_ones() as usize
    }

    /// Values in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = u32> + '_ {
        (0..64).filter(move |v| self.contains(*v))
    }
}

/// A parsed cron schedule. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CronExpression {
    text: String,
    minute: FieldSet,
    hour: FieldSet,
    day: FieldSet,
    month: FieldSet,
    weekday: FieldSet,
}

impl CronExpression {
    /// Parse `minute hour day month weekday`.
    ///
    /// Each field accepts `*`, `*/n`, `a-b`, `a-b/n`, `a,b,c` or a single
    /// integer. A field is read by the first rule that applies: `*`, then
    /// anything with `/`, then `-`, then `,`.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let fail = |reason: String| ParseError {
            expression: text.to_string(),
            reason,
        };

        let parts: Vec<&str> = text.split_whitespace().collect();
        if parts.len() != 5 {
            return Err(fail(format!("expected 5 fields, got {}", parts.len())));
        }

        let mut sets = [FieldSet::default(); 5];
        for ((set, field), token) in sets.iter_mut().zip(Field::ALL).zip(&parts) {
            *set = parse_field(token, field)
                .map_err(|reason| fail(format!("{} field '{}': {}", field.name(), token, reason)))?;
        }
        let [minute, hour, day, month, weekday] = sets;

        Ok(Self {
            text: parts.join(" "),
            minute,
            hour,
            day,
            month,
            weekday,
        })
    }

    /// The normalized expression text.
    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn field(&self, field: Field) -> FieldSet {
        match field {
            Field::Minute => self.minute,
            Field::Hour => self.hour,
            Field::Day => self.day,
            Field::Month => self.month,
            Field::Weekday => self.weekday,
        }
    }

    /// Whether `t` falls on a scheduled minute. Seconds are ignored.
    ///
    /// Day-of-month and weekday must both match.
    pub fn matches<Tz: TimeZone>(&self, t: &DateTime<Tz>) -> bool {
        self.minute.contains(t.minute())
            && self.hour.contains(t.hour())
            && self.day.contains(t.day())
            && self.month.contains(t.month())
            && self.weekday.contains(t.weekday().num_days_from_sunday())
    }

    /// First scheduled minute at or after `from` (rounded up to a whole minute).
    ///
    /// Scans minute by minute for at most [`MAX_SCAN_MINUTES`]; returns `None`
    /// when nothing matches in that window (e.g. `0 0 31 2 *`).
    pub fn next_run_after<Tz: TimeZone>(&self, from: &DateTime<Tz>) -> Option<DateTime<Tz>> {
        let mut candidate = ceil_to_minute(from)?;
        for _ in 0..MAX_SCAN_MINUTES {
            if self.matches(&candidate) {
                return Some(candidate);
            }
            candidate = candidate + Duration::minutes(1);
        }
        None
    }
}

impl FromStr for CronExpression {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CronExpression {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.text)
    }
}

/// Drop seconds and sub-second precision.
pub fn truncate_to_minute<Tz: TimeZone>(t: &DateTime<Tz>) -> Option<DateTime<Tz>> {
    t.with_nanosecond(0)?.with_second(0)
}

/// Round up to the next whole minute; whole minutes are returned unchanged.
pub fn ceil_to_minute<Tz: TimeZone>(t: &DateTime<Tz>) -> Option<DateTime<Tz>> {
    let floor = truncate_to_minute(t)?;
    if floor == *t {
        Some(floor)
    } else {
        Some(floor + Duration::minutes(1))
    }
}

fn parse_field(token: &str, field: Field) -> Result<FieldSet, String> {
    let (min, max) = field.bounds();

    let values: Vec<u32> = if token == "*" {
        (min..=max).collect()
    } else if let Some((base, step)) = token.split_once('/') {
        let step = parse_number(step)?;
        if step == 0 {
            return Err("step must be greater than 0".into());
        }
        let (lo, hi) = if base == "*" {
            (min, max)
        } else if let Some((a, b)) = base.split_once('-') {
            (parse_number(a)?, parse_number(b)?)
        } else {
            // `5/15` means "from 5 to the end of the domain, every 15".
            (parse_number(base)?, max)
        };
        check_range(lo, hi, min, max)?;
        (lo..=hi).step_by(step as usize).collect()
    } else if let Some((a, b)) = token.split_once('-') {
        let (lo, hi) = (parse_number(a)?, parse_number(b)?);
        check_range(lo, hi, min, max)?;
        (lo..=hi).collect()
    } else if token.contains(',') {
        token
            .split(',')
            .map(|part| parse_number(part).and_then(|v| check_value(v, min, max)))
            .collect::<Result<_, _>>()?
    } else {
        vec![check_value(parse_number(token)?, min, max)?]
    };

    let mut set = FieldSet::default();
    for v in values {
        set.insert(v);
    }
    if set.is_empty() {
        return Err("no values selected".into());
    }
    Ok(set)
}

fn parse_number(s: &str) -> Result<u32, String> {
    if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
        return Err(format!("'{s}' is not a non-negative integer"));
    }
    s.parse().map_err(|_| format!("'{s}' is out of range"))
}

fn check_value(v: u32, min: u32, max: u32) -> Result<u32, String> {
    if v < min || v > max {
        return Err(format!("value {v} out of [{min}, {max}]"));
    }
    Ok(v)
}

fn check_range(lo: u32, hi: u32, min: u32, max: u32) -> Result<(), String> {
    check_value(lo, min, max)?;
    check_value(hi, min, max)?;
    if lo > hi {
        return Err(format!("range {lo}-{hi} is reversed"));
    }
    Ok(())
}
