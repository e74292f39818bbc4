//! Metrics and observability for Rollup
#![allow(clippy::cast_precision_loss)]

use metrics::{counter, gauge, histogram};
use std::time::Instant;

// ============================================================================
// Ingestion Metrics
// ============================================================================

/// Record an event accepted into the buffer
pub fn record_event_appended(bytes: u64) {
    counter!("rollup_events_appended_total").increment(1);
    counter!("rollup_bytes_appended_total").increment(bytes);
}

/// Record an event rejected before buffering
pub fn record_event_rejected(reason: &'static str) {
    counter!("rollup_events_rejected_total", "reason" => reason).increment(1);
}

/// Update retained buffer size gauges
pub fn set_buffer_usage(records: usize, bytes: usize) {
    gauge!("rollup_buffer_records").set(records as f64);
    gauge!("rollup_buffer_bytes").set(bytes as f64);
}

/// Record segments dropped by retention
pub fn record_segments_evicted(count: u64) {
    counter!("rollup_segments_evicted_total").increment(count);
}

// ============================================================================
// Aggregation Metrics
// ============================================================================

/// Record an event applied to aggregate state
pub fn record_event_processed(partition_key: &str) {
    counter!("rollup_events_processed_total", "partition" => partition_key.to_string())
        .increment(1);
}

/// Record an event routed to the late path
pub fn record_late_event(partition_key: &str) {
    counter!("rollup_late_events_total", "partition" => partition_key.to_string()).increment(1);
}

/// Record a redelivered event skipped by deduplication
pub fn record_duplicate_event() {
    counter!("rollup_duplicate_events_total").increment(1);
}

/// Record a storage retry
pub fn record_storage_retry(operation: &'static str) {
    counter!("rollup_storage_retries_total", "operation" => operation).increment(1);
}

/// Record retries exhausted on a persist
pub fn record_persist_failure(partition_key: &str) {
    counter!("rollup_persist_failures_total", "partition" => partition_key.to_string())
        .increment(1);
}

/// Record a window close
pub fn record_window_closed(metric: &str) {
    counter!("rollup_windows_closed_total", "metric" => metric.to_string()).increment(1);
}

/// Record storage operation latency
pub fn record_storage_latency(operation: &'static str, latency_us: f64) {
    histogram!("rollup_storage_operation_duration_us", "operation" => operation)
        .record(latency_us);
}

// ============================================================================
// Checkpoint Metrics
// ============================================================================

/// Record a committed checkpoint
pub fn record_commit(partition_key: &str, offset: i64) {
    counter!("rollup_commits_total").increment(1);
    gauge!("rollup_committed_offset", "partition" => partition_key.to_string()).set(offset as f64);
}

/// Record consumer lag
pub fn set_consumer_lag(partition_key: &str, lag: i64) {
    gauge!("rollup_consumer_lag", "partition" => partition_key.to_string()).set(lag as f64);
}

/// Record a supervised consumer restarting or giving up on its partition
pub fn record_consumer_exit(partition_key: &str, outcome: &'static str) {
    counter!(
        "rollup_consumer_exits_total",
        "partition" => partition_key.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Record a lease transition
pub fn record_lease_event(event: &'static str) {
    counter!("rollup_lease_events_total", "event" => event).increment(1);
}

/// Timer guard recording storage latency on drop
pub struct LatencyTimer {
    start: Instant,
    operation: &'static str,
}

impl LatencyTimer {
    #[must_use]
    pub fn new(operation: &'static str) -> Self {
        Self {
            start: Instant::now(),
            operation,
        }
    }

    #[must_use]
    pub fn elapsed_us(&self) -> f64 {
        self.start.elapsed().as_secs_f64() * 1_000_000.0
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_storage_latency(self.operation, self.elapsed_us());
    }
}
