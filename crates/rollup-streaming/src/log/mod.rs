//! Append-only log storage for a single partition stream

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use parking_lot::RwLock;
use tracing::{debug, info};

use rollup_common::error::{Error, IngestError, Result};
use rollup_common::event::Event;
use rollup_common::types::Offset;

mod segment;

pub use segment::Segment;
use segment::{parse_segment_name, segment_path, FRAME_HEADER};

/// Bytes an entry occupies beyond its payload
pub const FRAME_OVERHEAD: usize = FRAME_HEADER;

/// Segment rolling thresholds
#[derive(Debug, Clone, Copy)]
pub struct SegmentLimits {
    pub max_records: usize,
    pub max_bytes: usize,
    pub fsync: bool,
}

/// Records and bytes released by an eviction pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Evicted {
    pub segments: usize,
    pub records: usize,
    pub bytes: usize,
}

/// Partition log - append-only storage for a single partition.
///
/// The last segment in `segments` is the active one. Offsets are assigned
/// under the write lock, so they are gap-free and strictly increasing.
pub struct PartitionLog {
    /// Partition key
    partition_key: String,
    /// Segment directory (durable logs only)
    dir: Option<PathBuf>,
    limits: SegmentLimits,
    segments: RwLock<VecDeque<Segment>>,
}

impl PartitionLog {
    /// Create an in-memory partition log
    pub fn new(partition_key: impl Into<String>, limits: SegmentLimits) -> Self {
        let mut segments = VecDeque::new();
        segments.push_back(Segment::new(0));
        Self {
            partition_key: partition_key.into(),
            dir: None,
            limits,
            segments: RwLock::new(segments),
        }
    }

    /// Open a durable partition log in `dir`, replaying any existing segments
    pub fn open(partition_key: impl Into<String>, dir: &Path, limits: SegmentLimits) -> Result<Self> {
        let partition_key = partition_key.into();
        std::fs::create_dir_all(dir)?;

        let mut bases = Vec::new();
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            if let Some(base) = entry.file_name().to_str().and_then(parse_segment_name) {
                bases.push(base);
            }
        }
        bases.sort_unstable();

        let mut segments = VecDeque::new();
        let mut expected_base = bases.first().copied().unwrap_or(0);
        for base in bases {
            if base != expected_base {
                return Err(Error::Internal(format!(
                    "partition {partition_key}: segment {base} does not follow offset {expected_base}"
                )));
            }
            let segment = Segment::open(&segment_path(dir, base), base, limits.fsync)?;
            expected_base = segment.next_offset();
            segments.push_back(segment);
        }

        if segments.is_empty() {
            segments.push_back(Segment::create(dir, 0, limits.fsync)?);
        }

        let log = Self {
            partition_key,
            dir: Some(dir.to_path_buf()),
            limits,
            segments: RwLock::new(segments),
        };

        info!(
            "Recovered partition {} with offsets [{}, {})",
            log.partition_key,
            log.low_watermark(),
            log.next_offset()
        );

        Ok(log)
    }

    /// Append an encoded event, returning its offset and framed size
    pub fn append(&self, payload: &[u8]) -> Result<(Offset, usize)> {
        let mut segments = self.segments.write();

        let needs_roll = segments.back().map_or(true, |active| {
            !active.is_empty()
                && (active.len() >= self.limits.max_records
                    || active.size() + payload.len() > self.limits.max_bytes)
        });
        if needs_roll {
            let next = segments.back().map_or(0, Segment::next_offset);
            debug!("Rolling partition {} at offset {}", self.partition_key, next);
            segments.push_back(self.new_segment(next)?);
        }

        let active = segments
            .back_mut()
            .ok_or_else(|| Error::Internal("partition log has no active segment".to_string()))?;
        let offset = active.next_offset();
        let size = active.append(payload)?;

        Ok((offset, size))
    }

    /// Read and decode the event at `offset`.
    ///
    /// Returns `Ok(None)` at or beyond the head.
    pub fn read(&self, offset: Offset) -> Result<Option<Event>> {
        let segments = self.segments.read();

        let low = segments.front().map_or(0, Segment::base_offset);
        if offset < low {
            return Err(Error::Ingest(IngestError::OffsetEvicted {
                partition_key: self.partition_key.clone(),
                requested: offset,
                low_watermark: low,
            }));
        }

        let segment = segments
            .iter()
            .rev()
            .find(|s| s.base_offset() <= offset);

        match segment.and_then(|s| s.read(offset)) {
            Some(payload) => {
                let event = bincode::deserialize(payload).map_err(|e| {
                    Error::Serialization(format!("Deserialization failed: {}", e))
                })?;
                Ok(Some(event))
            }
            None => Ok(None),
        }
    }

    /// Drop every segment whose entries are all at or below `watermark`.
    ///
    /// A fully consumed active segment is replaced by an empty one so that
    /// retention does not depend on segment rolling.
    pub fn evict_through(&self, watermark: Offset) -> Result<Evicted> {
        let mut segments = self.segments.write();
        let mut evicted = Evicted::default();

        while let Some(front) = segments.front() {
            let fully_consumed = front.highest_offset().map_or(false, |h| h <= watermark);
            if !fully_consumed {
                break;
            }

            if segments.len() == 1 {
                let next = front.next_offset();
                segments.push_back(self.new_segment(next)?);
            }

            if let Some(mut segment) = segments.pop_front() {
                evicted.segments += 1;
                evicted.records += segment.len();
                evicted.bytes += segment.size();
                segment.remove_file()?;
            }
        }

        if evicted.segments > 0 {
            debug!(
                "Evicted {} segments ({} records) from partition {} through offset {}",
                evicted.segments, evicted.records, self.partition_key, watermark
            );
        }

        Ok(evicted)
    }

    fn new_segment(&self, base_offset: Offset) -> Result<Segment> {
        match &self.dir {
            Some(dir) => Segment::create(dir, base_offset, self.limits.fsync),
            None => Ok(Segment::new(base_offset)),
        }
    }

    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    /// Offset the next append will receive
    pub fn next_offset(&self) -> Offset {
        self.segments.read().back().map_or(0, Segment::next_offset)
    }

    /// Get high watermark (latest appended offset, -1 when empty)
    pub fn high_watermark(&self) -> Offset {
        self.next_offset() - 1
    }

    /// Get low watermark (earliest retained offset)
    pub fn low_watermark(&self) -> Offset {
        self.segments.read().front().map_or(0, Segment::base_offset)
    }

    /// Retained records
    pub fn len(&self) -> usize {
        self.segments.read().iter().map(Segment::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Get log size in bytes
    pub fn size_bytes(&self) -> usize {
        self.segments.read().iter().map(Segment::size).sum()
    }
}
