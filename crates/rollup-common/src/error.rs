//! Error types for Rollup
//!
//! Provides a unified error type hierarchy for the entire system.

use thiserror::Error;

use crate::types::{Offset, Timestamp};

/// Result type alias using Rollup's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Rollup
#[derive(Error, Debug)]
pub enum Error {
    // Ingestion Errors
    #[error("Ingest error: {0}")]
    Ingest(#[from] IngestError),

    // Aggregation Errors
    #[error("Aggregation error: {0}")]
    Aggregation(#[from] AggregationError),

    // Checkpoint / Lease Errors
    #[error("Checkpoint error: {0}")]
    Checkpoint(#[from] CheckpointError),

    // Storage Errors
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    // Query Errors
    #[error("Query error: {0}")]
    Query(#[from] QueryError),

    // Configuration Errors
    #[error("Configuration error: {0}")]
    Config(String),

    // IO Errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization Errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    // Internal Errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Errors raised on the producer path, before an event enters the buffer
/// or while reading it back.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum IngestError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    #[error("Offset {requested} of partition {partition_key} was evicted (low watermark {low_watermark})")]
    OffsetEvicted {
        partition_key: String,
        requested: Offset,
        low_watermark: Offset,
    },
}

/// Errors raised while applying events to aggregate state
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AggregationError {
    #[error("Late event {event_id}: window [{window_start}, {window_end}) closed at {closed_at}")]
    LateEvent {
        event_id: String,
        window_start: Timestamp,
        window_end: Timestamp,
        closed_at: Timestamp,
    },

    #[error("Persist failed for partition {partition_key} at offset {offset} after {attempts} attempts: {reason}")]
    PersistFailure {
        partition_key: String,
        offset: Offset,
        attempts: u32,
        reason: String,
    },

    #[error("Out of order delivery on partition {partition_key}: expected offset {expected}, got {got}")]
    OutOfOrder {
        partition_key: String,
        expected: Offset,
        got: Offset,
    },

    #[error("Unknown metric: {0}")]
    UnknownMetric(String),
}

/// Errors raised by the checkpoint manager and partition leases
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CheckpointError {
    #[error("Stale commit on partition {partition_key}: offset {attempted} is not after committed offset {committed}")]
    StaleCommit {
        partition_key: String,
        committed: Offset,
        attempted: Offset,
    },

    #[error("Lease on partition {partition_key} is held by {owner} until {expires_at}")]
    LeaseHeld {
        partition_key: String,
        owner: String,
        expires_at: Timestamp,
    },

    #[error("Lease on partition {partition_key} lost (epoch {epoch})")]
    LeaseLost { partition_key: String, epoch: u64 },
}

/// Errors raised by the read-only query surface
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum QueryError {
    #[error("Invalid time range [{start}, {end})")]
    InvalidRange { start: Timestamp, end: Timestamp },

    #[error("Unknown granularity: {0}")]
    UnknownGranularity(String),

    #[error("Granularity {granularity} is finer than the {window_size_ms}ms window size")]
    GranularityTooFine {
        granularity: String,
        window_size_ms: i64,
    },
}

/// Durable store errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StorageError {
    #[error("Read failed: {0}")]
    ReadFailed(String),

    #[error("Write failed: {0}")]
    WriteFailed(String),

    #[error("Corrupt data: {0}")]
    CorruptData(String),

    #[error("Operation timed out after {0}ms")]
    Timeout(u64),

    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl Error {
    /// Shorthand for a validation failure
    pub fn validation(msg: impl Into<String>) -> Self {
        Error::Ingest(IngestError::Validation(msg.into()))
    }

    /// Whether retrying the same operation may succeed
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Storage(
                StorageError::ReadFailed(_)
                    | StorageError::WriteFailed(_)
                    | StorageError::Timeout(_)
                    | StorageError::Unavailable(_)
            ) | Error::Io(_)
        )
    }

    /// Whether the error means this consumer instance no longer owns its
    /// partition and must release its lease and restart
    #[must_use]
    pub fn is_fatal_to_consumer(&self) -> bool {
        matches!(
            self,
            Error::Checkpoint(CheckpointError::StaleCommit { .. } | CheckpointError::LeaseLost { .. })
        )
    }

    /// Whether restarting the consumer cannot clear the error. The
    /// partition needs an operator: its data is gone from the buffer, the
    /// stored state is unreadable, or the configuration is wrong.
    #[must_use]
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            Error::Ingest(IngestError::OffsetEvicted { .. })
                | Error::Storage(StorageError::CorruptData(_))
                | Error::Config(_)
                | Error::Serialization(_)
                | Error::Internal(_)
        )
    }

    #[must_use]
    pub fn is_late_event(&self) -> bool {
        matches!(self, Error::Aggregation(AggregationError::LateEvent { .. }))
    }

    #[must_use]
    pub fn is_capacity_exceeded(&self) -> bool {
        matches!(self, Error::Ingest(IngestError::CapacityExceeded(_)))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
