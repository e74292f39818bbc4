//! Ingestion buffer implementation

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use rollup_common::config::{BackpressureMode, BufferConfig};
use rollup_common::error::{Error, IngestError, Result};
use rollup_common::event::Event;
use rollup_common::metrics;
use rollup_common::types::Offset;

use crate::batch::{AppendedEvent, BatchAppendResult, BufferStats, EventBatch, FailedEvent};
use crate::consumer::ConsumerRegistry;
use crate::log::{PartitionLog, SegmentLimits, FRAME_OVERHEAD};

/// Partitioned, bounded, append-only event buffer
pub struct IngestionBuffer {
    /// Configuration
    config: BufferConfig,
    /// Segment directory root; partitions live in hex-named subdirectories
    dir: Option<PathBuf>,
    /// Partition logs by key
    partitions: DashMap<String, Arc<PartitionLog>>,
    /// Registered consumers and their acknowledged offsets
    consumers: ConsumerRegistry,
    /// Retained records and bytes across all partitions
    usage: Mutex<Usage>,
    /// Woken whenever space may have been released
    space_available: Notify,
}

#[derive(Debug, Default, Clone, Copy)]
struct Usage {
    records: usize,
    bytes: usize,
}

impl IngestionBuffer {
    /// Create an in-memory buffer, ignoring `config.dir`
    pub fn new(config: BufferConfig) -> Self {
        Self {
            config,
            dir: None,
            partitions: DashMap::new(),
            consumers: ConsumerRegistry::new(),
            usage: Mutex::new(Usage::default()),
            space_available: Notify::new(),
        }
    }

    /// Open the buffer described by `config`, replaying segment files when
    /// a directory is configured
    pub fn open(config: BufferConfig) -> Result<Self> {
        let Some(dir) = config.dir.clone().map(PathBuf::from) else {
            return Ok(Self::new(config));
        };

        info!("Opening ingestion buffer at {:?}", dir);
        std::fs::create_dir_all(&dir)?;

        let mut buffer = Self::new(config);
        buffer.dir = Some(dir.clone());

        let mut usage = Usage::default();
        for entry in std::fs::read_dir(&dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            let Some(partition_key) = entry
                .file_name()
                .to_str()
                .and_then(|name| hex::decode(name).ok())
                .and_then(|raw| String::from_utf8(raw).ok())
            else {
                warn!("Skipping unrecognised directory {:?}", entry.path());
                continue;
            };

            let log = PartitionLog::open(partition_key.clone(), &entry.path(), buffer.limits())?;
            usage.records += log.len();
            usage.bytes += log.size_bytes();
            buffer.partitions.insert(partition_key, Arc::new(log));
        }

        *buffer.usage.lock() = usage;
        metrics::set_buffer_usage(usage.records, usage.bytes);

        info!(
            "Ingestion buffer recovered {} partitions, {} records",
            buffer.partitions.len(),
            usage.records
        );

        Ok(buffer)
    }

    fn limits(&self) -> SegmentLimits {
        SegmentLimits {
            max_records: self.config.segment_max_records,
            max_bytes: self.config.segment_max_bytes,
            fsync: self.config.fsync,
        }
    }

    // ========================================================================
    // Append Operations
    // ========================================================================

    /// Append an event to its partition, returning the assigned offset.
    ///
    /// Once this returns the event is visible to readers and, for a durable
    /// buffer, written to its segment file.
    pub async fn append(&self, event: Event) -> Result<Offset> {
        if let Err(e) = event.validate() {
            metrics::record_event_rejected("validation");
            return Err(e);
        }

        let payload = bincode::serialize(&event)
            .map_err(|e| Error::Serialization(format!("Serialization failed: {}", e)))?;
        let size = payload.len() + FRAME_OVERHEAD;

        self.reserve(size).await?;

        let appended = self
            .partition_or_create(&event.partition_key)
            .and_then(|log| log.append(&payload));

        match appended {
            Ok((offset, bytes)) => {
                debug!(
                    "Appended event {} to partition {} at offset {}",
                    event.event_id, event.partition_key, offset
                );
                metrics::record_event_appended(bytes as u64);
                Ok(offset)
            }
            Err(e) => {
                self.release(1, size);
                Err(e)
            }
        }
    }

    /// Append every event of a batch, reporting success or failure per event
    pub async fn append_batch(&self, batch: impl Into<EventBatch>) -> BatchAppendResult {
        let mut result = BatchAppendResult::default();

        for (index, event) in batch.into().into_events().into_iter().enumerate() {
            let event_id = event.event_id.clone();
            let partition_key = event.partition_key.clone();
            match self.append(event).await {
                Ok(offset) => result.successful.push(AppendedEvent {
                    index,
                    event_id,
                    partition_key,
                    offset,
                }),
                Err(error) => result.failed.push(FailedEvent {
                    index,
                    event_id,
                    error,
                }),
            }
        }

        if !result.is_complete() {
            warn!(
                "Batch append: {} of {} events failed",
                result.failed.len(),
                result.total()
            );
        }

        result
    }

    fn partition_or_create(&self, partition_key: &str) -> Result<Arc<PartitionLog>> {
        if let Some(log) = self.partitions.get(partition_key) {
            return Ok(log.clone());
        }

        let entry = self
            .partitions
            .entry(partition_key.to_string())
            .or_try_insert_with(|| {
                let log = match &self.dir {
                    Some(dir) => PartitionLog::open(
                        partition_key,
                        &dir.join(hex::encode(partition_key)),
                        self.limits(),
                    )?,
                    None => PartitionLog::new(partition_key, self.limits()),
                };
                info!("Created partition {}", partition_key);
                Ok::<_, Error>(Arc::new(log))
            })?;

        Ok(entry.clone())
    }

    // ========================================================================
    // Capacity Management
    // ========================================================================

    /// Reserve room for one record of `bytes`, evicting consumed segments
    /// and (in `Block` mode) waiting for consumers when full.
    async fn reserve(&self, bytes: usize) -> Result<()> {
        let deadline =
            tokio::time::Instant::now() + Duration::from_millis(self.config.block_timeout_ms);

        loop {
            let notified = self.space_available.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if self.try_reserve(bytes) {
                return Ok(());
            }
            if self.evict_consumed()? > 0 && self.try_reserve(bytes) {
                return Ok(());
            }

            if self.config.backpressure == BackpressureMode::FailFast
                || tokio::time::timeout_at(deadline, notified).await.is_err()
            {
                let usage = *self.usage.lock();
                metrics::record_event_rejected("capacity");
                return Err(Error::Ingest(IngestError::CapacityExceeded(format!(
                    "buffer holds {}/{} records and {}/{} bytes",
                    usage.records, self.config.max_records, usage.bytes, self.config.max_bytes
                ))));
            }
        }
    }

    fn try_reserve(&self, bytes: usize) -> bool {
        let mut usage = self.usage.lock();
        if usage.records + 1 > self.config.max_records
            || usage.bytes + bytes > self.config.max_bytes
        {
            return false;
        }
        usage.records += 1;
        usage.bytes += bytes;
        metrics::set_buffer_usage(usage.records, usage.bytes);
        true
    }

    fn release(&self, records: usize, bytes: usize) {
        let mut usage = self.usage.lock();
        usage.records = usage.records.saturating_sub(records);
        usage.bytes = usage.bytes.saturating_sub(bytes);
        metrics::set_buffer_usage(usage.records, usage.bytes);
    }

    /// Evict segments every registered consumer has checkpointed past.
    ///
    /// Returns the number of records released.
    pub fn evict_consumed(&self) -> Result<usize> {
        let logs: Vec<Arc<PartitionLog>> =
            self.partitions.iter().map(|entry| entry.value().clone()).collect();

        let mut released = 0;
        for log in logs {
            let Some(watermark) = self.consumers.retention_watermark(log.partition_key()) else {
                continue;
            };
            let evicted = log.evict_through(watermark)?;
            if evicted.records > 0 {
                self.release(evicted.records, evicted.bytes);
                metrics::record_segments_evicted(evicted.segments as u64);
                released += evicted.records;
            }
        }

        if released > 0 {
            self.space_available.notify_waiters();
        }
        Ok(released)
    }

    // ========================================================================
    // Consumer Operations
    // ========================================================================

    /// Register a consumer on a partition with its last checkpointed offset
    pub fn register_consumer(&self, consumer_id: &str, partition_key: &str, acknowledged: Offset) {
        self.consumers.register(consumer_id, partition_key, acknowledged);
    }

    /// Record that a consumer has checkpointed through `offset`
    pub fn acknowledge(&self, consumer_id: &str, partition_key: &str, offset: Offset) {
        if self.consumers.acknowledge(consumer_id, partition_key, offset) {
            // Blocked producers retry eviction
            self.space_available.notify_waiters();
        } else {
            warn!(
                "Acknowledgement from unregistered consumer {} on partition {}",
                consumer_id, partition_key
            );
        }
    }

    pub fn unregister_consumer(&self, consumer_id: &str, partition_key: &str) {
        self.consumers.unregister(consumer_id, partition_key);
        self.space_available.notify_waiters();
    }

    // ========================================================================
    // Read Operations
    // ========================================================================

    /// Lazy reader over `[offset, head)` where head is fixed at creation.
    ///
    /// An unknown partition yields an empty reader.
    pub fn read_from(&self, partition_key: &str, offset: Offset) -> Result<PartitionReader> {
        if offset < 0 {
            return Err(Error::validation(format!("offset must not be negative, got {offset}")));
        }

        let Some(log) = self.partitions.get(partition_key).map(|l| l.clone()) else {
            return Ok(PartitionReader::empty(offset));
        };

        let low_watermark = log.low_watermark();
        if offset < low_watermark {
            return Err(Error::Ingest(IngestError::OffsetEvicted {
                partition_key: partition_key.to_string(),
                requested: offset,
                low_watermark,
            }));
        }

        let end = log.next_offset();
        Ok(PartitionReader {
            log: Some(log),
            next: offset,
            end,
            done: false,
        })
    }

    /// Read at most `max_records` events starting at `offset`
    pub fn read_batch(
        &self,
        partition_key: &str,
        offset: Offset,
        max_records: usize,
    ) -> Result<Vec<(Offset, Event)>> {
        self.read_from(partition_key, offset)?
            .take(max_records)
            .collect()
    }

    /// Known partition keys, sorted
    pub fn partitions(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.partitions.iter().map(|e| e.key().clone()).collect();
        keys.sort();
        keys
    }

    /// Latest appended offset, `None` for an unknown or empty partition
    pub fn high_watermark(&self, partition_key: &str) -> Option<Offset> {
        self.partitions
            .get(partition_key)
            .map(|log| log.high_watermark())
            .filter(|&hw| hw >= 0)
    }

    /// Earliest retained offset, `None` for an unknown partition
    pub fn low_watermark(&self, partition_key: &str) -> Option<Offset> {
        self.partitions.get(partition_key).map(|log| log.low_watermark())
    }

    pub fn stats(&self) -> BufferStats {
        let usage = *self.usage.lock();
        BufferStats {
            partitions: self.partitions.len(),
            records: usage.records,
            bytes: usage.bytes,
            max_records: self.config.max_records,
            max_bytes: self.config.max_bytes,
            consumers: self.consumers.len(),
        }
    }

    pub fn config(&self) -> &BufferConfig {
        &self.config
    }
}

/// Finite iterator over one partition, yielding `(offset, event)` pairs.
///
/// If retention overtakes the reader it yields a single `OffsetEvicted`
/// error and stops.
pub struct PartitionReader {
    log: Option<Arc<PartitionLog>>,
    next: Offset,
    end: Offset,
    done: bool,
}

impl PartitionReader {
    fn empty(offset: Offset) -> Self {
        Self {
            log: None,
            next: offset,
            end: offset,
            done: true,
        }
    }

    /// Offset the next call to `next` will read
    pub fn position(&self) -> Offset {
        self.next
    }

    /// Exclusive upper bound fixed when the reader was created
    pub fn head(&self) -> Offset {
        self.end
    }

    pub fn remaining(&self) -> usize {
        usize::try_from(self.end - self.next).unwrap_or(0)
    }
}

impl Iterator for PartitionReader {
    type Item = Result<(Offset, Event)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.next >= self.end {
            return None;
        }
        let log = self.log.as_ref()?;

        match log.read(self.next) {
            Ok(Some(event)) => {
                let offset = self.next;
                self.next += 1;
                Some(Ok((offset, event)))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        if self.done {
            (0, Some(0))
        } else {
            (0, Some(self.remaining()))
        }
    }
}
