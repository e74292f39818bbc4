//! Key layout of the durable store
//!
//! ```text
//! agg/{partition}/{metric}/{window_start}   aggregate window state
//! ckpt/{partition}                          committed offset
//! lease/{partition}                         partition lease
//! wf/{partition}                            per-partition workflow record
//! ```
//!
//! Window starts are written as order-preserving hex so a prefix scan
//! returns windows sorted by start time, negative timestamps included.

use rollup_common::types::Timestamp;

pub const AGGREGATE_PREFIX: &str = "agg/";
pub const CHECKPOINT_PREFIX: &str = "ckpt/";
pub const LEASE_PREFIX: &str = "lease/";
pub const WORKFLOW_PREFIX: &str = "wf/";

const SIGN_BIT: u64 = 1 << 63;

/// Order-preserving encoding of a signed timestamp
pub fn encode_timestamp(ts: Timestamp) -> String {
    format!("{:016x}", (ts as u64) ^ SIGN_BIT)
}

pub fn decode_timestamp(s: &str) -> Option<Timestamp> {
    u64::from_str_radix(s, 16).ok().map(|v| (v ^ SIGN_BIT) as i64)
}

/// All windows of every metric of a partition
pub fn partition_aggregates(partition_key: &str) -> String {
    format!("{AGGREGATE_PREFIX}{partition_key}/")
}

/// All windows of one metric of a partition
pub fn metric_aggregates(partition_key: &str, metric: &str) -> String {
    format!("{AGGREGATE_PREFIX}{partition_key}/{metric}/")
}

pub fn aggregate(partition_key: &str, metric: &str, window_start: Timestamp) -> String {
    format!(
        "{AGGREGATE_PREFIX}{partition_key}/{metric}/{}",
        encode_timestamp(window_start)
    )
}

pub fn checkpoint(partition_key: &str) -> String {
    format!("{CHECKPOINT_PREFIX}{partition_key}")
}

pub fn lease(partition_key: &str) -> String {
    format!("{LEASE_PREFIX}{partition_key}")
}

pub fn workflow(partition_key: &str) -> String {
    format!("{WORKFLOW_PREFIX}{partition_key}")
}
