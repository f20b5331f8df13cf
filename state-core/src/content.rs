//! Content filter parameters.
//!
//! A device may ask to only synchronize items newer than a window (one day,
//! two weeks, ...). The window turns into a cutoff timestamp that callers use
//! to narrow item lists before diffing.

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

const DAY_SECS: i64 = 24 * 60 * 60;

/// Synchronization window requested by a device.
///
/// Discriminants are the wire values devices send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
#[repr(u8)]
pub enum FilterType {
    /// No filter.
    #[default]
    All = 0,
    /// Last day.
    OneDay = 1,
    /// Last three days.
    ThreeDays = 2,
    /// Last week.
    OneWeek = 3,
    /// Last two weeks.
    TwoWeeks = 4,
    /// Last month.
    OneMonth = 5,
    /// Last three months.
    ThreeMonths = 6,
    /// Last six months.
    SixMonths = 7,
    /// Incomplete tasks only. Not a time window.
    IncompleteTasks = 8,
}

impl FilterType {
    /// Length of the window in days, `None` when the filter is not time based.
    ///
    /// Months count as 31 days.
    pub fn window_days(&self) -> Option<i64> {
        match self {
            Self::All | Self::IncompleteTasks => None,
            Self::OneDay => Some(1),
            Self::ThreeDays => Some(3),
            Self::OneWeek => Some(7),
            Self::TwoWeeks => Some(14),
            Self::OneMonth => Some(31),
            Self::ThreeMonths => Some(31 * 3),
            Self::SixMonths => Some(31 * 6),
        }
    }

    /// Cutoff timestamp (unix seconds) relative to `now`.
    pub fn cutoff_from(&self, now: i64) -> Option<i64> {
        self.window_days().map(|days| now - days * DAY_SECS)
    }
}

impl TryFrom<u8> for FilterType {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            0 => Self::All,
            1 => Self::OneDay,
            2 => Self::ThreeDays,
            3 => Self::OneWeek,
            4 => Self::TwoWeeks,
            5 => Self::OneMonth,
            6 => Self::ThreeMonths,
            7 => Self::SixMonths,
            8 => Self::IncompleteTasks,
            other => return Err(other),
        })
    }
}

impl From<FilterType> for u8 {
    fn from(value: FilterType) -> Self {
        value as u8
    }
}

/// Parameters narrowing what a folder session compares.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ContentParameters {
    /// Requested synchronization window.
    pub filter_type: FilterType,
}

impl ContentParameters {
    /// Parameters with the given filter.
    pub fn new(filter_type: FilterType) -> Self {
        Self { filter_type }
    }
}

/// Current time as unix seconds.
pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
