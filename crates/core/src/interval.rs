//! Relative intervals used by visit offsets and windows.
//!
//! Intervals convert to whole days with a coarse rule: a month is 30 days, a year is 365 days
//! and hours round up to whole days (1 to 24 hours is one day). Not calendar arithmetic.
//!
//! Parsed intervals are limited to [`MAX_INTERVAL_DAYS`]. Date arithmetic saturates at the ends
//! of the representable range instead of panicking.

use crate::constants::{DAYS_PER_MONTH, DAYS_PER_YEAR, MAX_INTERVAL_DAYS};
use crate::{EdcError, EdcResult};
use chrono::{DateTime, Utc};
use std::fmt;
use std::str::FromStr;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IntervalUnit {
    Hours,
    Days,
    Months,
    Years,
}

impl IntervalUnit {
    fn code(self) -> &'static str {
        match self {
            IntervalUnit::Hours => "H",
            IntervalUnit::Days => "D",
            IntervalUnit::Months => "M",
            IntervalUnit::Years => "Y",
        }
    }

    fn parse(input: &str) -> Option<Self> {
        match input.to_ascii_lowercase().as_str() {
            "h" | "hr" | "hrs" | "hour" | "hours" => Some(IntervalUnit::Hours),
            "d" | "day" | "days" => Some(IntervalUnit::Days),
            "m" | "mo" | "month" | "months" => Some(IntervalUnit::Months),
            "y" | "yr" | "yrs" | "year" | "years" => Some(IntervalUnit::Years),
            _ => None,
        }
    }
}

/// A signed magnitude with a unit, e.g. `+28 days` or `7D`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct Interval {
    value: i64,
    unit: IntervalUnit,
}

impl Interval {
    pub const ZERO: Interval = Interval {
        value: 0,
        unit: IntervalUnit::Days,
    };

    pub fn new(value: i64, unit: IntervalUnit) -> Self {
        Self { value, unit }
    }

    pub fn of_hours(value: i64) -> Self {
        Self::new(value, IntervalUnit::Hours)
    }

    pub fn of_days(value: i64) -> Self {
        Self::new(value, IntervalUnit::Days)
    }

    pub fn of_months(value: i64) -> Self {
        Self::new(value, IntervalUnit::Months)
    }

    pub fn of_years(value: i64) -> Self {
        Self::new(value, IntervalUnit::Years)
    }

    pub fn value(&self) -> i64 {
        self.value
    }

    pub fn unit(&self) -> IntervalUnit {
        self.unit
    }

    pub fn is_negative(&self) -> bool {
        self.value < 0
    }

    /// Whole days this interval counts for in window arithmetic, or `None` on overflow.
    pub fn checked_days(&self) -> Option<i64> {
        let magnitude = self.value.checked_abs()?;
        let days = match self.unit {
            IntervalUnit::Days => magnitude,
            IntervalUnit::Months => magnitude.checked_mul(DAYS_PER_MONTH)?,
            IntervalUnit::Years => magnitude.checked_mul(DAYS_PER_YEAR)?,
            // ceil(h / 24); 1..=24 hours is one day
            IntervalUnit::Hours => magnitude / 24 + i64::from(magnitude % 24 != 0),
        };
        Some(days * self.value.signum())
    }

    /// Whole days this interval counts for in window arithmetic, clamped to
    /// `±MAX_INTERVAL_DAYS`.
    pub fn days(&self) -> i64 {
        match self.checked_days() {
            Some(days) => days.clamp(-MAX_INTERVAL_DAYS, MAX_INTERVAL_DAYS),
            None if self.value < 0 => -MAX_INTERVAL_DAYS,
            None => MAX_INTERVAL_DAYS,
        }
    }

    /// `datetime` moved forward by this interval.
    pub fn after(&self, datetime: DateTime<Utc>) -> DateTime<Utc> {
        shift_days(datetime, self.days())
    }

    /// `datetime` moved back by this interval.
    pub fn before(&self, datetime: DateTime<Utc>) -> DateTime<Utc> {
        shift_days(datetime, -self.days())
    }

    /// # Errors
    ///
    /// Returns [`EdcError::InvalidInput`] if the interval is longer than `MAX_INTERVAL_DAYS`.
    pub fn check_bounded(&self) -> EdcResult<()> {
        match self.checked_days() {
            Some(days) if days.abs() <= MAX_INTERVAL_DAYS => Ok(()),
            _ => Err(EdcError::InvalidInput(format!(
                "interval {} exceeds {} days",
                self, MAX_INTERVAL_DAYS
            ))),
        }
    }

    /// Parse an interval that must not be negative (window widths).
    pub fn parse_window(input: &str) -> EdcResult<Self> {
        let interval: Interval = input.parse()?;
        if interval.is_negative() {
            return Err(EdcError::InvalidInput(format!(
                "window interval cannot be negative: '{input}'"
            )));
        }
        Ok(interval)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", self.value, self.unit.code())
    }
}

impl FromStr for Interval {
    type Err = EdcError;

    /// Accepts `28D`, `+28 days`, `-1 month`, `12h`, `1Y`. `M` means months.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || EdcError::InvalidInput(format!("invalid interval '{s}'"));

        let trimmed = s.trim();
        let (sign, rest) = match trimmed.strip_prefix('-') {
            Some(rest) => (-1, rest),
            None => (1, trimmed.strip_prefix('+').unwrap_or(trimmed)),
        };

        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        if digits_end == 0 {
            return Err(invalid());
        }
        let magnitude: i64 = rest[..digits_end].parse().map_err(|_| invalid())?;
        let unit = IntervalUnit::parse(rest[digits_end..].trim()).ok_or_else(invalid)?;

        let interval = Self::new(sign * magnitude, unit);
        interval.check_bounded()?;
        Ok(interval)
    }
}

/// `datetime` shifted by whole days, saturating at the ends of the representable range.
pub fn shift_days(datetime: DateTime<Utc>, days: i64) -> DateTime<Utc> {
    chrono::Duration::try_days(days)
        .and_then(|d| datetime.checked_add_signed(d))
        .unwrap_or(if days < 0 {
            DateTime::<Utc>::MIN_UTC
        } else {
            DateTime::<Utc>::MAX_UTC
        })
}
