//! Batch append types

use rollup_common::error::Error;
use rollup_common::event::Event;
use rollup_common::types::Offset;

/// Batch of events submitted in one call
#[derive(Debug, Clone, Default)]
pub struct EventBatch {
    events: Vec<Event>,
}

impl EventBatch {
    /// Create a new empty batch
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a batch with capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Vec::with_capacity(capacity),
        }
    }

    /// Add an event to the batch
    pub fn add(&mut self, event: Event) {
        self.events.push(event);
    }

    /// Get batch size
    pub fn len(&self) -> usize {
        self.events.len()
    }

    /// Check if batch is empty
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    pub fn into_events(self) -> Vec<Event> {
        self.events
    }
}

impl From<Vec<Event>> for EventBatch {
    fn from(events: Vec<Event>) -> Self {
        Self { events }
    }
}

impl FromIterator<Event> for EventBatch {
    fn from_iter<I: IntoIterator<Item = Event>>(iter: I) -> Self {
        Self {
            events: iter.into_iter().collect(),
        }
    }
}

/// An event accepted by a batch append
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppendedEvent {
    /// Position in the submitted batch
    pub index: usize,
    pub event_id: String,
    pub partition_key: String,
    pub offset: Offset,
}

/// An event rejected by a batch append
#[derive(Debug)]
pub struct FailedEvent {
    /// Position in the submitted batch
    pub index: usize,
    pub event_id: String,
    pub error: Error,
}

/// Per-event outcome of a batch append.
///
/// One rejected event never prevents the rest of the batch from being
/// appended.
#[derive(Debug, Default)]
pub struct BatchAppendResult {
    pub successful: Vec<AppendedEvent>,
    pub failed: Vec<FailedEvent>,
}

impl BatchAppendResult {
    /// Whether every event was appended
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }

    pub fn total(&self) -> usize {
        self.successful.len() + self.failed.len()
    }
}

/// Buffer-wide usage snapshot
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BufferStats {
    pub partitions: usize,
    pub records: usize,
    pub bytes: usize,
    pub max_records: usize,
    pub max_bytes: usize,
    /// Registered (consumer, partition) pairs
    pub consumers: usize,
}

impl BufferStats {
    /// Fraction of the tighter of the two limits in use
    #[allow(clippy::cast_precision_loss)]
    pub fn utilization(&self) -> f64 {
        let records = self.records as f64 / self.max_records.max(1) as f64;
        let bytes = self.bytes as f64 / self.max_bytes.max(1) as f64;
        records.max(bytes)
    }
}
