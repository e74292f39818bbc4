//! Distinct-count sketch
//!
//! Wraps `hyperloglog::HyperLogLog`. Every sketch is built with the same
//! error rate and hash seed, so sketches of different windows (and of
//! different process runs) can be merged into coarser buckets.

use hyperloglog::HyperLogLog;
use serde::{Deserialize, Serialize};

use rollup_storage::encode;

/// ~1.6% standard error
const ERROR_RATE: f64 = 0.016_25;
const SEED: u128 = 0x726f_6c6c_7570_2d64_6973_7469_6e63_7400;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DistinctSketch(HyperLogLog);

impl Default for DistinctSketch {
    fn default() -> Self {
        Self::new()
    }
}

impl DistinctSketch {
    pub fn new() -> Self {
        Self(HyperLogLog::new_deterministic(ERROR_RATE, SEED))
    }

    pub fn insert(&mut self, item: &str) {
        self.0.insert(&item);
    }

    pub fn merge(&mut self, other: &DistinctSketch) {
        self.0.merge(&other.0);
    }

    /// Estimated number of distinct items
    pub fn estimate(&self) -> f64 {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Sketches are equal when their encoded registers are
impl PartialEq for DistinctSketch {
    fn eq(&self, other: &Self) -> bool {
        matches!((encode(self), encode(other)), (Ok(a), Ok(b)) if a == b)
    }
}
