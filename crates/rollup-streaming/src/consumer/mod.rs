//! Consumer registration and retention tracking
//!
//! Every consumer reading a partition registers here and acknowledges the
//! offsets it has checkpointed. A partition's retention watermark is the
//! lowest acknowledged offset across its registered consumers; segments at
//! or below it may be evicted.

use std::sync::atomic::{AtomicI64, Ordering};

use dashmap::DashMap;
use tracing::debug;

use rollup_common::types::Offset;

/// Acknowledged offsets: partition -> consumer -> offset
#[derive(Default)]
pub struct ConsumerRegistry {
    offsets: DashMap<String, DashMap<String, AtomicI64>>,
}

impl ConsumerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a consumer on a partition.
    ///
    /// `acknowledged` is the last offset it has already checkpointed
    /// (`-1` when it starts from the beginning). Re-registering keeps the
    /// higher of the two positions.
    pub fn register(&self, consumer_id: &str, partition_key: &str, acknowledged: Offset) {
        debug!(
            "Registering consumer {} on partition {} at offset {}",
            consumer_id, partition_key, acknowledged
        );
        let consumers = self
            .offsets
            .entry(partition_key.to_string())
            .or_insert_with(DashMap::new);

        consumers
            .entry(consumer_id.to_string())
            .or_insert_with(|| AtomicI64::new(acknowledged))
            .fetch_max(acknowledged, Ordering::SeqCst);
    }

    /// Record a checkpointed offset. Returns false for an unregistered consumer.
    pub fn acknowledge(&self, consumer_id: &str, partition_key: &str, offset: Offset) -> bool {
        self.offsets
            .get(partition_key)
            .and_then(|consumers| {
                consumers
                    .get(consumer_id)
                    .map(|acked| acked.fetch_max(offset, Ordering::SeqCst))
            })
            .is_some()
    }

    /// Remove a consumer from a partition
    pub fn unregister(&self, consumer_id: &str, partition_key: &str) {
        if let Some(consumers) = self.offsets.get(partition_key) {
            consumers.remove(consumer_id);
        }
        self.offsets
            .remove_if(partition_key, |_, consumers| consumers.is_empty());
    }

    /// Highest offset every registered consumer has acknowledged.
    ///
    /// `None` when nobody consumes the partition, in which case nothing may
    /// be evicted.
    pub fn retention_watermark(&self, partition_key: &str) -> Option<Offset> {
        self.offsets.get(partition_key).and_then(|consumers| {
            consumers
                .iter()
                .map(|acked| acked.load(Ordering::SeqCst))
                .min()
        })
    }

    /// Last offset acknowledged by one consumer
    pub fn acknowledged(&self, consumer_id: &str, partition_key: &str) -> Option<Offset> {
        self.offsets.get(partition_key).and_then(|consumers| {
            consumers
                .get(consumer_id)
                .map(|acked| acked.load(Ordering::SeqCst))
        })
    }

    /// Number of registered (consumer, partition) pairs
    pub fn len(&self) -> usize {
        self.offsets.iter().map(|consumers| consumers.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
