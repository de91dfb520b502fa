//! Epoch + offset timestamp normalization.
//!
//! Cards store time as "days since a family epoch" plus an optional sub-day
//! count (minutes or seconds). A `Clock` turns those counts into absolute
//! instants in the family's time zone and tags each result with its precision,
//! so a date-only value is never mistaken for midnight. Resolved instants keep
//! the UTC offset in force at that moment, so daylight saving is honoured.

use std::fmt;

use chrono::{DateTime, Days, FixedOffset, NaiveDate, NaiveDateTime, NaiveTime, TimeDelta, TimeZone};
use chrono_tz::Tz;
use serde::Serialize;

use crate::types::{FareError, Result};

/// Build a constant calendar date. Out-of-range input collapses to `NaiveDate::MIN`.
pub fn ymd(year: i32, month: u32, day: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(year, month, day).unwrap_or(NaiveDate::MIN)
}

/// Whether a timestamp carries a time of day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Precision {
    Day,
    Full,
}

/// An absolute point in time with its precision tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "precision", content = "value", rename_all = "lowercase")]
pub enum Timestamp {
    Day(NaiveDate),
    Full(DateTime<FixedOffset>),
}

impl Timestamp {
    pub fn precision(&self) -> Precision {
        match self {
            Timestamp::Day(_) => Precision::Day,
            Timestamp::Full(_) => Precision::Full,
        }
    }

    /// Calendar date in the timestamp's own offset.
    pub fn date(&self) -> NaiveDate {
        match self {
            Timestamp::Day(d) => *d,
            Timestamp::Full(dt) => dt.date_naive(),
        }
    }

    /// Seconds since the Unix epoch; day-only stamps sort at their UTC midnight.
    pub fn sort_key(&self) -> i64 {
        match self {
            Timestamp::Day(d) => d.and_time(NaiveTime::MIN).and_utc().timestamp(),
            Timestamp::Full(dt) => dt.timestamp(),
        }
    }

    /// Same instant moved by whole days, keeping the precision tag.
    pub fn shift_days(&self, days: i64) -> Result<Timestamp> {
        let delta = TimeDelta::try_days(days)
            .ok_or_else(|| FareError::Timestamp(format!("shift of {days} days")))?;
        let overflow = || FareError::Timestamp(format!("{self} shifted by {days} days"));
        match self {
            Timestamp::Day(d) => d
                .checked_add_signed(delta)
                .map(Timestamp::Day)
                .ok_or_else(overflow),
            Timestamp::Full(dt) => dt
                .checked_add_signed(delta)
                .map(Timestamp::Full)
                .ok_or_else(overflow),
        }
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Timestamp::Day(d) => write!(f, "{}", d.format("%Y-%m-%d")),
            Timestamp::Full(dt) => write!(f, "{}", dt.format("%Y-%m-%d %H:%M %:z")),
        }
    }
}

/// Granularity of the sub-day counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubDayUnit {
    Minute,
    Second,
}

/// A family's time convention: epoch date, time zone, and sub-day unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Clock {
    epoch: NaiveDate,
    tz: Tz,
    unit: SubDayUnit,
}

impl Clock {
    pub fn new(epoch: NaiveDate, tz: Tz, unit: SubDayUnit) -> Self {
        Clock { epoch, tz, unit }
    }

    pub fn epoch(&self) -> NaiveDate {
        self.epoch
    }

    pub fn tz(&self) -> Tz {
        self.tz
    }

    /// Local wall time in the clock's zone. Ambiguous times take the earlier
    /// instant; times skipped by a forward clock change land an hour later.
    fn resolve(&self, naive: NaiveDateTime) -> Option<DateTime<FixedOffset>> {
        self.tz
            .from_local_datetime(&naive)
            .earliest()
            .or_else(|| {
                let later = naive.checked_add_signed(TimeDelta::hours(1))?;
                self.tz.from_local_datetime(&later).earliest()
            })
            .map(|dt| dt.fixed_offset())
    }

    fn add_days(&self, days: u64) -> Result<NaiveDate> {
        self.epoch
            .checked_add_days(Days::new(days))
            .ok_or_else(|| FareError::Timestamp(format!("{} + {days} days", self.epoch)))
    }

    fn sub_day(&self, units: u64) -> Result<TimeDelta> {
        let n = i64::try_from(units)
            .map_err(|_| FareError::Timestamp(format!("{units} sub-day units")))?;
        let delta = match self.unit {
            SubDayUnit::Minute => TimeDelta::try_minutes(n),
            SubDayUnit::Second => TimeDelta::try_seconds(n),
        };
        delta.ok_or_else(|| FareError::Timestamp(format!("{units} sub-day units")))
    }

    /// Clock whose epoch is `days` after this one. Used for per-card epochs.
    pub fn rebased(&self, days: u64) -> Result<Clock> {
        Ok(Clock {
            epoch: self.add_days(days)?,
            ..*self
        })
    }

    /// Day-only timestamp `days` after the epoch.
    pub fn day(&self, days: u64) -> Result<Timestamp> {
        self.add_days(days).map(Timestamp::Day)
    }

    /// Full timestamp: epoch + `days` + `units` of the sub-day unit.
    pub fn date_time(&self, days: u64, units: u64) -> Result<Timestamp> {
        let date = self.add_days(days)?;
        let naive = date
            .and_time(NaiveTime::MIN)
            .checked_add_signed(self.sub_day(units)?)
            .ok_or_else(|| FareError::Timestamp(format!("{date} + {units} units")))?;
        self.resolve(naive)
            .map(Timestamp::Full)
            .ok_or_else(|| FareError::Timestamp(naive.to_string()))
    }

    /// Full timestamp `units` of the sub-day unit after epoch midnight.
    pub fn since_epoch(&self, units: u64) -> Result<Timestamp> {
        self.date_time(0, units)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
