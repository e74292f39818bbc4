//! Read-only access to persisted aggregates

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::debug;

use rollup_aggregation::combine::Accumulator;
use rollup_aggregation::retry::{retry_with_backoff, RetryPolicy};
use rollup_aggregation::state::{self, AggregateState};
use rollup_aggregation::{SharedClock, TumblingWindows};
use rollup_common::config::AggregationConfig;
use rollup_common::error::{Error, QueryError, Result};
use rollup_common::types::{AggregateRecord, Timestamp, TimeRange, WindowStatus};
use rollup_storage::{keys, DurableStore};

use crate::granularity::Granularity;

/// Windows of one metric merged into a coarser bucket
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollupBucket {
    pub partition_key: String,
    pub metric_name: String,
    pub granularity: Granularity,
    pub bucket_start: Timestamp,
    pub bucket_end: Timestamp,
    pub value: f64,
    pub update_count: u64,
    /// Number of windows merged
    pub windows: usize,
    /// `Closed` when every merged window is closed, `Unclosed` when any of
    /// them is overdue, `Open` otherwise
    pub status: WindowStatus,
}

struct BucketAcc {
    accumulator: Accumulator,
    update_count: u64,
    windows: usize,
    status: WindowStatus,
}

pub struct QuerySurface {
    store: Arc<dyn DurableStore>,
    windows: TumblingWindows,
    clock: SharedClock,
    retry: RetryPolicy,
}

impl QuerySurface {
    pub fn new(
        store: Arc<dyn DurableStore>,
        config: &AggregationConfig,
        clock: SharedClock,
    ) -> Result<Self> {
        Ok(Self {
            store,
            windows: TumblingWindows::from_config(config)?,
            clock,
            retry: RetryPolicy::default(),
        })
    }

    #[must_use]
    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Windows overlapping `range`, ordered by window start
    pub async fn get_aggregate(
        &self,
        partition_key: &str,
        metric_name: &str,
        range: TimeRange,
    ) -> Result<Vec<AggregateRecord>> {
        check_range(range)?;
        let now = self.clock.now_millis();

        let records: Vec<AggregateRecord> = self
            .load(partition_key, metric_name)
            .await?
            .into_iter()
            .filter(|s| s.window().overlaps(&range))
            .map(|s| self.flag(s.record, now))
            .collect();

        debug!(
            "Query {}/{} [{}, {}) matched {} windows",
            partition_key,
            metric_name,
            range.start,
            range.end,
            records.len()
        );
        Ok(records)
    }

    /// Most recent persisted window, possibly still open
    pub async fn get_realtime(
        &self,
        partition_key: &str,
        metric_name: &str,
    ) -> Result<Option<AggregateRecord>> {
        let now = self.clock.now_millis();
        Ok(self
            .load(partition_key, metric_name)
            .await?
            .pop()
            .map(|s| self.flag(s.record, now)))
    }

    /// Merge the windows overlapping `range` into `granularity` buckets
    pub async fn rollup(
        &self,
        partition_key: &str,
        metric_name: &str,
        range: TimeRange,
        granularity: Granularity,
    ) -> Result<Vec<RollupBucket>> {
        check_range(range)?;
        if granularity.min_length_ms() < self.windows.size_ms() {
            return Err(Error::Query(QueryError::GranularityTooFine {
                granularity: granularity.to_string(),
                window_size_ms: self.windows.size_ms(),
            }));
        }
        let now = self.clock.now_millis();

        let mut buckets: BTreeMap<Timestamp, (Timestamp, BucketAcc)> = BTreeMap::new();
        for state in self.load(partition_key, metric_name).await? {
            if !state.window().overlaps(&range) {
                continue;
            }
            // Windows are bucketed by their start
            let bounds = granularity.bucket(state.window_start())?;
            let status = self.flag(state.record.clone(), now).status;

            match buckets.get_mut(&bounds.start) {
                Some((_, acc)) => {
                    acc.accumulator.merge(&state.accumulator)?;
                    acc.update_count += state.record.update_count;
                    acc.windows += 1;
                    acc.status = combine_status(acc.status, status);
                }
                None => {
                    buckets.insert(
                        bounds.start,
                        (
                            bounds.end,
                            BucketAcc {
                                accumulator: state.accumulator,
                                update_count: state.record.update_count,
                                windows: 1,
                                status,
                            },
                        ),
                    );
                }
            }
        }

        Ok(buckets
            .into_iter()
            .map(|(start, (end, acc))| RollupBucket {
                partition_key: partition_key.to_string(),
                metric_name: metric_name.to_string(),
                granularity,
                bucket_start: start,
                bucket_end: end,
                value: acc.accumulator.value(),
                update_count: acc.update_count,
                windows: acc.windows,
                status: acc.status,
            })
            .collect())
    }

    /// Metric names with at least one persisted window
    pub async fn list_metrics(&self, partition_key: &str) -> Result<Vec<String>> {
        let prefix = keys::partition_aggregates(partition_key);
        let metrics: BTreeSet<String> = self
            .scan_keys(&prefix)
            .await?
            .into_iter()
            .filter_map(|key| {
                key.strip_prefix(&prefix)
                    .and_then(|rest| rest.rsplit_once('/'))
                    .map(|(metric, _)| metric.to_string())
            })
            .collect();
        Ok(metrics.into_iter().collect())
    }

    /// Partitions with at least one persisted window
    pub async fn list_partitions(&self) -> Result<Vec<String>> {
        let partitions: BTreeSet<String> = self
            .scan_keys(keys::AGGREGATE_PREFIX)
            .await?
            .into_iter()
            .filter_map(|key| {
                key.strip_prefix(keys::AGGREGATE_PREFIX)
                    .and_then(|rest| rest.split_once('/'))
                    .map(|(partition, _)| partition.to_string())
            })
            .collect();
        Ok(partitions.into_iter().collect())
    }

    async fn load(&self, partition_key: &str, metric_name: &str) -> Result<Vec<AggregateState>> {
        retry_with_backoff(&self.retry, "query_aggregates", || {
            state::load_metric(self.store.as_ref(), partition_key, metric_name)
        })
        .await
        .map_err(|e| e.error)
    }

    async fn scan_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let entries = retry_with_backoff(&self.retry, "query_keys", || self.store.scan_prefix(prefix))
            .await
            .map_err(|e| e.error)?;
        Ok(entries.into_iter().map(|(key, _)| key).collect())
    }

    /// Mark an open window whose close time has passed as `Unclosed`
    fn flag(&self, mut record: AggregateRecord, now: Timestamp) -> AggregateRecord {
        if record.status == WindowStatus::Open && self.windows.is_closed(&record.bounds(), now) {
            record.status = WindowStatus::Unclosed;
        }
        record
    }
}

fn check_range(range: TimeRange) -> Result<()> {
    if range.start >= range.end {
        return Err(Error::Query(QueryError::InvalidRange {
            start: range.start,
            end: range.end,
        }));
    }
    Ok(())
}

fn combine_status(a: WindowStatus, b: WindowStatus) -> WindowStatus {
    match (a, b) {
        (WindowStatus::Unclosed, _) | (_, WindowStatus::Unclosed) => WindowStatus::Unclosed,
        (WindowStatus::Closed, WindowStatus::Closed) => WindowStatus::Closed,
        _ => WindowStatus::Open,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollup_aggregation::ManualClock;
    use rollup_common::config::CombineKind;
    use rollup_common::types::WindowBounds;
    use rollup_storage::MemoryStore;

    const MINUTE: i64 = 60_000;

    fn config() -> AggregationConfig {
        AggregationConfig {
            window_size_ms: MINUTE,
            allowed_lateness_ms: 0,
            ..AggregationConfig::default()
        }
    }

    async fn put(
        store: &dyn DurableStore,
        metric: &str,
        start: Timestamp,
        accumulator: Accumulator,
        status: WindowStatus,
    ) {
        let mut s = AggregateState::new(
            "u1",
            metric,
            WindowBounds::new(start, start + MINUTE),
            accumulator.kind(),
        );
        s.accumulator = accumulator;
        s.record.update_count = 1;
        s.record.status = status;
        s.sync_value();
        state::save(store, &s).await.unwrap();
    }

    async fn surface(now: Timestamp) -> (QuerySurface, Arc<dyn DurableStore>) {
        let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
        let surface = QuerySurface::new(store.clone(), &config(), Arc::new(ManualClock::new(now))).unwrap();
        (surface, store)
    }

    #[tokio::test]
    async fn test_get_aggregate_filters_by_overlap() {
        let (surface, store) = surface(0).await;
        for i in 0..4 {
            put(store.as_ref(), "views", i * MINUTE, Accumulator::Count(1), WindowStatus::Open).await;
        }

        let records = surface
            .get_aggregate("u1", "views", TimeRange::new(MINUTE + 1, 3 * MINUTE))
            .await
            .unwrap();
        let starts: Vec<_> = records.iter().map(|r| r.window_start).collect();
        assert_eq!(starts, vec![MINUTE, 2 * MINUTE]);

        assert!(surface
            .get_aggregate("u1", "clicks", TimeRange::all())
            .await
            .unwrap()
            .is_empty());
        assert!(surface
            .get_aggregate("u1", "views", TimeRange::new(5, 5))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_overdue_open_window_is_flagged_unclosed() {
        let (surface, store) = surface(2 * MINUTE + 1).await;
        put(store.as_ref(), "views", 0, Accumulator::Count(3), WindowStatus::Open).await;
        put(store.as_ref(), "views", MINUTE, Accumulator::Count(1), WindowStatus::Closed).await;
        put(store.as_ref(), "views", 2 * MINUTE, Accumulator::Count(1), WindowStatus::Open).await;

        let records = surface.get_aggregate("u1", "views", TimeRange::all()).await.unwrap();
        let statuses: Vec<_> = records.iter().map(|r| r.status).collect();
        assert_eq!(
            statuses,
            vec![WindowStatus::Unclosed, WindowStatus::Closed, WindowStatus::Open]
        );
    }

    #[tokio::test]
    async fn test_get_realtime_returns_latest_window() {
        let (surface, store) = surface(0).await;
        assert!(surface.get_realtime("u1", "views").await.unwrap().is_none());

        put(store.as_ref(), "views", 0, Accumulator::Count(3), WindowStatus::Closed).await;
        put(store.as_ref(), "views", MINUTE, Accumulator::Count(2), WindowStatus::Open).await;

        let latest = surface.get_realtime("u1", "views").await.unwrap().unwrap();
        assert_eq!(latest.window_start, MINUTE);
        assert_eq!(latest.value, 2.0);
    }

    #[tokio::test]
    async fn test_rollup_merges_windows_into_hours() {
        let hour = 60 * MINUTE;
        let (surface, store) = surface(3 * hour).await;
        put(store.as_ref(), "views", 0, Accumulator::Count(2), WindowStatus::Closed).await;
        put(store.as_ref(), "views", 30 * MINUTE, Accumulator::Count(3), WindowStatus::Closed).await;
        put(store.as_ref(), "views", hour, Accumulator::Count(4), WindowStatus::Open).await;

        let buckets = surface
            .rollup("u1", "views", TimeRange::all(), Granularity::Hour)
            .await
            .unwrap();
        assert_eq!(buckets.len(), 2);
        assert_eq!((buckets[0].bucket_start, buckets[0].value, buckets[0].windows), (0, 5.0, 2));
        assert_eq!(buckets[0].status, WindowStatus::Closed);
        assert_eq!((buckets[1].bucket_start, buckets[1].value), (hour, 4.0));
        assert_eq!(buckets[1].status, WindowStatus::Unclosed);
    }

    #[tokio::test]
    async fn test_rollup_merges_max_and_rejects_fine_granularity() {
        let (surface, store) = surface(0).await;
        put(store.as_ref(), "peak", 0, Accumulator::Max(Some(7.0)), WindowStatus::Closed).await;
        put(store.as_ref(), "peak", MINUTE, Accumulator::Max(Some(3.0)), WindowStatus::Closed).await;

        let day = surface
            .rollup("u1", "peak", TimeRange::all(), Granularity::Day)
            .await
            .unwrap();
        assert_eq!(day.len(), 1);
        assert_eq!(day[0].value, 7.0);

        let hourly_windows = AggregationConfig {
            window_size_ms: 60 * MINUTE,
            ..config()
        };
        let coarse = QuerySurface::new(store, &hourly_windows, Arc::new(ManualClock::new(0))).unwrap();
        let err = coarse
            .rollup("u1", "peak", TimeRange::all(), Granularity::Minute)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Query(QueryError::GranularityTooFine { .. })));
    }

    #[tokio::test]
    async fn test_list_metrics_and_partitions() {
        let (surface, store) = surface(0).await;
        put(store.as_ref(), "views", 0, Accumulator::Count(1), WindowStatus::Open).await;
        put(store.as_ref(), "views", MINUTE, Accumulator::Count(1), WindowStatus::Open).await;
        put(store.as_ref(), "revenue", 0, Accumulator::Sum(2.5), WindowStatus::Open).await;

        assert_eq!(surface.list_metrics("u1").await.unwrap(), vec!["revenue", "views"]);
        assert!(surface.list_metrics("u2").await.unwrap().is_empty());
        assert_eq!(surface.list_partitions().await.unwrap(), vec!["u1"]);
    }
}
