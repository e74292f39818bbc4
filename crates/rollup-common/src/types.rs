//! Common type definitions for Rollup

use serde::{Deserialize, Serialize};

/// Timestamp in milliseconds since Unix epoch
pub type Timestamp = i64;

/// Offset of an event within its partition stream
pub type Offset = i64;

/// Current wall-clock time in milliseconds
#[must_use]
pub fn now_millis() -> Timestamp {
    chrono::Utc::now().timestamp_millis()
}

// ============================================================================
// Window Types
// ============================================================================

/// Half-open event-time interval `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WindowBounds {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl WindowBounds {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    pub fn contains(&self, ts: Timestamp) -> bool {
        ts >= self.start && ts < self.end
    }

    /// Instant after which the window no longer accepts events
    pub fn close_time(&self, lateness_ms: i64) -> Timestamp {
        self.end.saturating_add(lateness_ms)
    }

    /// A window is closed once current time has moved past `end + lateness`
    pub fn is_closed_at(&self, now: Timestamp, lateness_ms: i64) -> bool {
        now > self.close_time(lateness_ms)
    }

    pub fn overlaps(&self, range: &TimeRange) -> bool {
        self.start < range.end && range.start < self.end
    }
}

/// Query range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeRange {
    pub start: Timestamp,
    pub end: Timestamp,
}

impl TimeRange {
    pub fn new(start: Timestamp, end: Timestamp) -> Self {
        Self { start, end }
    }

    /// Everything
    pub fn all() -> Self {
        Self {
            start: Timestamp::MIN,
            end: Timestamp::MAX,
        }
    }
}

// ============================================================================
// Aggregate Types
// ============================================================================

/// Lifecycle of an aggregate window as seen by readers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowStatus {
    /// Still accepting events
    Open,
    /// Final value, immutable
    Closed,
    /// Close time passed but the close was never persisted
    Unclosed,
}

/// Aggregated value of one metric over one window of one partition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateRecord {
    pub partition_key: String,
    pub metric_name: String,
    pub window_start: Timestamp,
    pub window_end: Timestamp,
    pub value: f64,
    pub update_count: u64,
    pub status: WindowStatus,
}

impl AggregateRecord {
    pub fn bounds(&self) -> WindowBounds {
        WindowBounds::new(self.window_start, self.window_end)
    }

    pub fn is_closed(&self) -> bool {
        self.status == WindowStatus::Closed
    }
}

// ============================================================================
// Checkpoint Types
// ============================================================================

/// Durable progress marker of a partition's consumer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub partition_key: String,
    pub last_processed_offset: Offset,
    pub committed_at: Timestamp,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_window_contains_half_open() {
        let w = WindowBounds::new(0, 60_000);
        assert!(w.contains(0));
        assert!(w.contains(59_999));
        assert!(!w.contains(60_000));
        assert!(!w.contains(-1));
    }

    #[test]
    fn test_window_closure() {
        let w = WindowBounds::new(0, 60_000);
        assert!(!w.is_closed_at(60_000, 0));
        assert!(w.is_closed_at(60_001, 0));
        assert!(!w.is_closed_at(65_000, 5_000));
        assert!(w.is_closed_at(65_001, 5_000));
    }

    #[test]
    fn test_window_overlaps_range() {
        let w = WindowBounds::new(60_000, 120_000);
        assert!(w.overlaps(&TimeRange::new(0, 60_001)));
        assert!(!w.overlaps(&TimeRange::new(0, 60_000)));
        assert!(w.overlaps(&TimeRange::all()));
    }
}
