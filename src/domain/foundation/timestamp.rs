//! Timestamp value object for immutable points in time.
//!
//! The wire protocol exchanges timestamps as epoch milliseconds, so that is
//! the canonical representation here.

use chrono::Utc;
use serde::{Deserialize, Serialize};

/// Immutable point in time as milliseconds since the Unix epoch, UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// Creates a timestamp for the current moment.
    pub fn now() -> Self {
        Self(Utc::now().timestamp_millis())
    }

    /// Creates a timestamp from epoch milliseconds.
    pub fn from_millis(millis: i64) -> Self {
        Self(millis)
    }

    /// Returns epoch milliseconds.
    pub fn as_millis(&self) -> i64 {
        self.0
    }

    /// Checks if this timestamp is before another.
    pub fn is_before(&self, other: &Timestamp) -> bool {
        self.0 < other.0
    }

    /// Checks if this timestamp is after another.
    pub fn is_after(&self, other: &Timestamp) -> bool {
        self.0 > other.0
    }

    /// Milliseconds elapsed between this timestamp and now, clamped at zero.
    pub fn elapsed_ms(&self) -> u64 {
        (Utc::now().timestamp_millis() - self.0).max(0) as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn from_millis_round_trips() {
        let ts = Timestamp::from_millis(1_700_000_000_123);
        assert_eq!(ts.as_millis(), 1_700_000_000_123);
    }

    #[test]
    fn ordering_follows_millis() {
        let earlier = Timestamp::from_millis(100);
        let later = Timestamp::from_millis(200);
        assert!(earlier.is_before(&later));
        assert!(later.is_after(&earlier));
        assert!(earlier < later);
    }

    #[test]
    fn serializes_as_bare_number() {
        let ts = Timestamp::from_millis(42);
        assert_eq!(serde_json::to_string(&ts).unwrap(), "42");
        let back: Timestamp = serde_json::from_str("42").unwrap();
        assert_eq!(back, ts);
    }

    #[test]
    fn elapsed_ms_clamps_future_timestamps() {
        let future = Timestamp::from_millis(Utc::now().timestamp_millis() + 60_000);
        assert_eq!(future.elapsed_ms(), 0);
    }
}
