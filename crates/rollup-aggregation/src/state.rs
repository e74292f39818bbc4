//! Persisted per-window aggregate state

use serde::{Deserialize, Serialize};

use rollup_common::config::CombineKind;
use rollup_common::error::Result;
use rollup_common::types::{AggregateRecord, Offset, Timestamp, WindowBounds, WindowStatus};
use rollup_storage::{decode, encode, keys, DurableStore};

use crate::combine::Accumulator;
use crate::dedup::SeenEvents;

/// Everything stored under `agg/{partition}/{metric}/{window_start}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AggregateState {
    /// Reader-facing view
    pub record: AggregateRecord,
    pub accumulator: Accumulator,
    /// Recently applied event ids (non-idempotent functions only)
    pub seen: SeenEvents,
    /// Highest buffer offset folded into this window
    pub last_offset: Offset,
}

impl AggregateState {
    pub fn new(
        partition_key: &str,
        metric_name: &str,
        window: WindowBounds,
        kind: CombineKind,
    ) -> Self {
        let accumulator = Accumulator::new(kind);
        Self {
            record: AggregateRecord {
                partition_key: partition_key.to_string(),
                metric_name: metric_name.to_string(),
                window_start: window.start,
                window_end: window.end,
                value: accumulator.value(),
                update_count: 0,
                status: WindowStatus::Open,
            },
            accumulator,
            seen: SeenEvents::new(),
            last_offset: -1,
        }
    }

    /// Store key of this window
    pub fn key(&self) -> String {
        keys::aggregate(
            &self.record.partition_key,
            &self.record.metric_name,
            self.record.window_start,
        )
    }

    pub fn window(&self) -> WindowBounds {
        self.record.bounds()
    }

    pub fn window_start(&self) -> Timestamp {
        self.record.window_start
    }

    pub fn is_closed(&self) -> bool {
        self.record.is_closed()
    }

    /// Refresh the reader-facing value after the accumulator changed
    pub fn sync_value(&mut self) {
        self.record.value = self.accumulator.value();
    }
}

/// Every persisted window of a partition, ordered by metric then start
pub async fn load_partition(
    store: &dyn DurableStore,
    partition_key: &str,
) -> Result<Vec<AggregateState>> {
    decode_all(store, &keys::partition_aggregates(partition_key)).await
}

/// Every persisted window of one metric, ordered by start
pub async fn load_metric(
    store: &dyn DurableStore,
    partition_key: &str,
    metric_name: &str,
) -> Result<Vec<AggregateState>> {
    decode_all(store, &keys::metric_aggregates(partition_key, metric_name)).await
}

async fn decode_all(store: &dyn DurableStore, prefix: &str) -> Result<Vec<AggregateState>> {
    store
        .scan_prefix(prefix)
        .await?
        .into_iter()
        .map(|(_, versioned)| decode(&versioned.value))
        .collect()
}

/// Unconditional write of one window
pub async fn save(store: &dyn DurableStore, state: &AggregateState) -> Result<u64> {
    store.put(&state.key(), encode(state)?).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollup_storage::MemoryStore;

    #[tokio::test]
    async fn test_save_and_load_partition() {
        let store = MemoryStore::new();
        let mut views = AggregateState::new("u1", "views", WindowBounds::new(0, 60), CombineKind::Count);
        views.seen.insert("e1", 10);
        views.accumulator = Accumulator::Count(1);
        views.sync_value();
        save(&store, &views).await.unwrap();

        let later = AggregateState::new("u1", "views", WindowBounds::new(60, 120), CombineKind::Count);
        save(&store, &later).await.unwrap();
        let other = AggregateState::new("u2", "views", WindowBounds::new(0, 60), CombineKind::Count);
        save(&store, &other).await.unwrap();

        let loaded = load_metric(&store, "u1", "views").await.unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[0], views);
        assert_eq!(loaded[0].record.value, 1.0);
        assert_eq!(loaded[1].window_start(), 60);

        assert_eq!(load_partition(&store, "u2").await.unwrap().len(), 1);
    }
}
