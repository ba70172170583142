use std::fmt;
use std::str::FromStr;

use chrono::{Datelike, NaiveDateTime, Timelike, Weekday};
use serde::Deserialize;

/// Minute-of-day wall clock time, written `HH:MM`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Deserialize)]
#[serde(try_from = "String")]
pub struct ClockTime {
    minutes: u16,
}

impl ClockTime {
    pub fn new(hour: u8, minute: u8) -> Option<Self> {
        (hour < 24 && minute < 60).then(|| Self {
            minutes: hour as u16 * 60 + minute as u16,
        })
    }

    pub fn of(at: &NaiveDateTime) -> Self {
        Self {
            minutes: (at.hour() * 60 + at.minute()) as u16,
        }
    }

    pub fn hour(self) -> u8 {
        (self.minutes / 60) as u8
    }

    pub fn minute(self) -> u8 {
        (self.minutes % 60) as u8
    }
}

impl FromStr for ClockTime {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (h, m) = s
            .trim()
            .split_once(':')
            .ok_or_else(|| format!("expected HH:MM, got '{}'", s))?;
        let hour = h.parse::<u8>().map_err(|_| format!("invalid hour in '{}'", s))?;
        let minute = m.parse::<u8>().map_err(|_| format!("invalid minute in '{}'", s))?;
        Self::new(hour, minute).ok_or_else(|| format!("time out of range: '{}'", s))
    }
}

impl TryFrom<String> for ClockTime {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl fmt::Display for ClockTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour(), self.minute())
    }
}

/// Set of ISO weekdays (1 = Monday .. 7 = Sunday).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct DaySet(u8);

impl DaySet {
    pub const ALL: DaySet = DaySet(0b111_1111);

    /// Numbers outside 1..=7 are ignored.
    pub fn from_iso(days: &[u8]) -> Self {
        Self(
            days.iter()
                .filter(|d| (1..=7).contains(*d))
                .fold(0, |acc, d| acc | 1 << (d - 1)),
        )
    }

    pub fn contains(self, day: Weekday) -> bool {
        self.0 & (1 << day.num_days_from_monday()) != 0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

/// A daily window on selected weekdays.
///
/// `start > end` wraps past midnight; the part after midnight belongs to the
/// day the window started on. `start == end` covers the whole day.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeWindow {
    pub start: ClockTime,
    pub end: ClockTime,
    pub days: DaySet,
}

impl TimeWindow {
    pub fn new(start: ClockTime, end: ClockTime, days: DaySet) -> Self {
        Self { start, end, days }
    }

    pub fn contains(&self, at: &NaiveDateTime) -> bool {
        let now = ClockTime::of(at);
        let today = at.weekday();

        if self.start == self.end {
            self.days.contains(today)
        } else if self.start < self.end {
            self.days.contains(today) && self.start <= now && now < self.end
        } else {
            (now >= self.start && self.days.contains(today))
                || (now < self.end && self.days.contains(today.pred()))
        }
    }
}
