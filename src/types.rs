//! Shared value types
//!
//! - `TimeRange`: a half-open query interval in milliseconds
//! - month keys (`year * 100 + month`, UTC) used to partition series indexes

use chrono::{DateTime, Datelike, Utc};

/// Month key (`year * 100 + month`, UTC) of a millisecond timestamp
pub fn month_key(timestamp_millis: i64) -> Option<u32> {
    let time = DateTime::<Utc>::from_timestamp_millis(timestamp_millis)?;
    let year = u32::try_from(time.year()).ok()?;
    Some(year * 100 + time.month())
}

/// Time range for queries (half-open interval: [start, end))
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    /// Start timestamp (inclusive), in milliseconds
    pub start: i64,
    /// End timestamp (exclusive), in milliseconds
    pub end: i64,
}

impl TimeRange {
    /// Create a new time range
    ///
    /// # Panics
    /// Panics if start >= end
    pub fn new(start: i64, end: i64) -> Self {
        assert!(start < end, "TimeRange: start must be less than end");
        Self { start, end }
    }

    /// Create a time range, returning None if invalid
    pub fn try_new(start: i64, end: i64) -> Option<Self> {
        if start < end {
            Some(Self { start, end })
        } else {
            None
        }
    }

    /// Create a range for the last N days from now
    pub fn last_days(days: i64) -> Self {
        let end = Utc::now().timestamp_millis();
        let start = end - days * 24 * 3600 * 1000;
        Self { start, end }
    }

    /// Check if a timestamp falls within this range
    pub fn contains(&self, timestamp: i64) -> bool {
        timestamp >= self.start && timestamp < self.end
    }

    /// Whether the range touches the given month key
    pub fn covers_month(&self, month: u32) -> bool {
        match (month_key(self.start), month_key(self.end - 1)) {
            (Some(first), Some(last)) => month >= first && month <= last,
            _ => false,
        }
    }
}
