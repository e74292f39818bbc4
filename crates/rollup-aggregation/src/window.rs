//! Tumbling event-time window assignment

use rollup_common::config::AggregationConfig;
use rollup_common::error::{Error, Result};
use rollup_common::types::{Timestamp, WindowBounds};

/// Fixed-size, non-overlapping event-time windows aligned to multiples of
/// the window size, with a grace period after each window ends.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TumblingWindows {
    size_ms: i64,
    lateness_ms: i64,
}

impl TumblingWindows {
    pub fn new(size_ms: i64, lateness_ms: i64) -> Result<Self> {
        if size_ms <= 0 {
            return Err(Error::Config(format!("window size must be positive, got {size_ms}")));
        }
        if lateness_ms < 0 {
            return Err(Error::Config(format!(
                "allowed lateness must not be negative, got {lateness_ms}"
            )));
        }
        Ok(Self {
            size_ms,
            lateness_ms,
        })
    }

    pub fn from_config(config: &AggregationConfig) -> Result<Self> {
        Self::new(config.window_size_ms, config.allowed_lateness_ms)
    }

    /// Window containing `timestamp`
    pub fn assign(&self, timestamp: Timestamp) -> WindowBounds {
        let start = timestamp - timestamp.rem_euclid(self.size_ms);
        WindowBounds::new(start, start.saturating_add(self.size_ms))
    }

    /// Instant after which `window` accepts no more events
    pub fn close_time(&self, window: &WindowBounds) -> Timestamp {
        window.close_time(self.lateness_ms)
    }

    /// `window_end + lateness < now`
    pub fn is_closed(&self, window: &WindowBounds, now: Timestamp) -> bool {
        window.is_closed_at(now, self.lateness_ms)
    }

    pub fn size_ms(&self) -> i64 {
        self.size_ms
    }

    pub fn lateness_ms(&self) -> i64 {
        self.lateness_ms
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_assign_aligns_to_size() {
        let windows = TumblingWindows::new(60_000, 0).unwrap();
        assert_eq!(windows.assign(0), WindowBounds::new(0, 60_000));
        assert_eq!(windows.assign(59_999), WindowBounds::new(0, 60_000));
        assert_eq!(windows.assign(60_000), WindowBounds::new(60_000, 120_000));
        assert_eq!(windows.assign(-1), WindowBounds::new(-60_000, 0));
    }

    #[test]
    fn test_closure_respects_lateness() {
        let windows = TumblingWindows::new(1_000, 500).unwrap();
        let w = windows.assign(100);
        assert_eq!(windows.close_time(&w), 1_500);
        assert!(!windows.is_closed(&w, 1_500));
        assert!(windows.is_closed(&w, 1_501));
    }

    #[test]
    fn test_rejects_bad_settings() {
        assert!(TumblingWindows::new(0, 0).is_err());
        assert!(TumblingWindows::new(1_000, -1).is_err());
    }

    proptest! {
        #[test]
        fn prop_assigned_window_contains_timestamp(
            ts in -1_000_000_000_000i64..4_000_000_000_000,
            size in 1i64..86_400_000,
        ) {
            let windows = TumblingWindows::new(size, 0).unwrap();
            let w = windows.assign(ts);
            prop_assert!(w.contains(ts));
            prop_assert_eq!(w.start.rem_euclid(size), 0);
            prop_assert_eq!(w.end - w.start, size);
        }

        #[test]
        fn prop_windows_do_not_overlap(a in 0i64..10_000_000, b in 0i64..10_000_000) {
            let windows = TumblingWindows::new(60_000, 0).unwrap();
            let (wa, wb) = (windows.assign(a), windows.assign(b));
            prop_assert!(wa == wb || wa.end <= wb.start || wb.end <= wa.start);
        }
    }
}
