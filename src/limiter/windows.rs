//! Observation windows for rate-limit rules
//!
//! A rolling window ends at `now` and reaches back a fixed span, bounds inclusive.
//! An absolute window is the calendar period containing `now` in the configured zone,
//! `[start, end)`, so a period boundary always separates two windows.

use crate::pipeline::config::ConfigError;
use crate::providers::rules::{RateLimitRule, Timeframe, WindowKind};
use chrono::{
    DateTime, Datelike, Duration, FixedOffset, Local, Months, NaiveDateTime, Offset, TimeZone,
    Timelike, Utc,
};
use std::fmt;
use std::str::FromStr;

/// Zone used to align absolute windows
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZoneSetting {
    /// System local time, DST transitions included
    Local,
    Fixed(FixedOffset),
}

impl ZoneSetting {
    pub fn utc() -> Self {
        ZoneSetting::Fixed(Utc.fix())
    }

    /// `now` expressed in this zone
    pub fn localize(&self, now: DateTime<Utc>) -> DateTime<FixedOffset> {
        match self {
            ZoneSetting::Local => now.with_timezone(&Local).fixed_offset(),
            ZoneSetting::Fixed(offset) => now.with_timezone(offset),
        }
    }
}

impl fmt::Display for ZoneSetting {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ZoneSetting::Local => f.write_str("local"),
            ZoneSetting::Fixed(offset) => write!(f, "{}", offset),
        }
    }
}

impl FromStr for ZoneSetting {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw = s.trim();
        match raw.to_lowercase().as_str() {
            "local" => return Ok(ZoneSetting::Local),
            "utc" | "z" => return Ok(ZoneSetting::utc()),
            _ => {}
        }

        let invalid = || {
            ConfigError::InvalidValue(format!(
                "timezone must be 'local', 'UTC' or an offset like '+02:00', got '{}'",
                raw
            ))
        };

        let (sign, rest) = match raw.chars().next() {
            Some('+') => (1, &raw[1..]),
            Some('-') => (-1, &raw[1..]),
            _ => return Err(invalid()),
        };
        let (hours, minutes) = rest.split_once(':').unwrap_or((rest, "0"));
        let hours: i32 = hours.parse().map_err(|_| invalid())?;
        let minutes: i32 = minutes.parse().map_err(|_| invalid())?;
        if !(0..=23).contains(&hours) || !(0..=59).contains(&minutes) {
            return Err(invalid());
        }

        FixedOffset::east_opt(sign * (hours * 3600 + minutes * 60))
            .map(ZoneSetting::Fixed)
            .ok_or_else(invalid)
    }
}

/// Span of log history a rule counts over
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObservationWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub kind: WindowKind,
}

impl ObservationWindow {
    pub fn for_rule(rule: &RateLimitRule, now: DateTime<Utc>, zone: ZoneSetting) -> Self {
        match rule.window_kind {
            WindowKind::Rolling => Self::rolling(rule.timeframe, now),
            WindowKind::Absolute => Self::absolute(rule.timeframe, now, zone),
        }
    }

    /// `[now - duration, now]`; a rolling month is 30 days
    pub fn rolling(timeframe: Timeframe, now: DateTime<Utc>) -> Self {
        Self {
            start: now - timeframe.rolling_duration(),
            end: now,
            kind: WindowKind::Rolling,
        }
    }

    /// Calendar period containing `now`; an absolute month is the calendar month
    pub fn absolute(timeframe: Timeframe, now: DateTime<Utc>, zone: ZoneSetting) -> Self {
        let (start, end) = match zone {
            ZoneSetting::Local => period_bounds(&Local, now, timeframe),
            ZoneSetting::Fixed(offset) => period_bounds(&offset, now, timeframe),
        };
        Self {
            start,
            end,
            kind: WindowKind::Absolute,
        }
    }

    pub fn contains<Tz: TimeZone>(&self, ts: &DateTime<Tz>) -> bool {
        let ts = ts.with_timezone(&Utc);
        match self.kind {
            WindowKind::Rolling => self.start <= ts && ts <= self.end,
            WindowKind::Absolute => self.start <= ts && ts < self.end,
        }
    }
}

fn period_bounds<Tz: TimeZone>(
    tz: &Tz,
    now: DateTime<Utc>,
    timeframe: Timeframe,
) -> (DateTime<Utc>, DateTime<Utc>) {
    let local = now.with_timezone(tz).naive_local();
    let subsec = Duration::nanoseconds(i64::from(local.nanosecond() % 1_000_000_000));
    let second = local - subsec;
    let minute = second - Duration::seconds(i64::from(local.second()));
    let hour = minute - Duration::minutes(i64::from(local.minute()));
    let day = hour - Duration::hours(i64::from(local.hour()));

    let (start, end) = match timeframe {
        Timeframe::Second => (second, second + Duration::seconds(1)),
        Timeframe::Minute => (minute, minute + Duration::minutes(1)),
        Timeframe::Hour => (hour, hour + Duration::hours(1)),
        Timeframe::Day => (day, day + Duration::days(1)),
        Timeframe::Month => {
            let month = day - Duration::days(i64::from(local.day0()));
            let next = month
                .checked_add_months(Months::new(1))
                .unwrap_or(month + Duration::days(31));
            (month, next)
        }
    };

    (resolve_local(tz, start), resolve_local(tz, end))
}

/// Map a local wall-clock time to an instant, stepping past DST gaps
fn resolve_local<Tz: TimeZone>(tz: &Tz, naive: NaiveDateTime) -> DateTime<Utc> {
    tz.from_local_datetime(&naive)
        .earliest()
        .or_else(|| tz.from_local_datetime(&(naive + Duration::hours(1))).earliest())
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or_else(|| Utc.from_utc_datetime(&naive))
}
