//! Rollup Streaming - the ingestion buffer
//!
//! Durable, partitioned, append-only buffer between producers and the
//! aggregation consumers:
//! - Gap-free offsets per partition key
//! - Segment files with CRC-checked frames, replayed on restart
//! - Bounded capacity with fail-fast or blocking backpressure
//! - Retention driven by consumer acknowledgements

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod batch;
pub mod consumer;
pub mod log;

mod buffer;

pub use batch::{AppendedEvent, BatchAppendResult, BufferStats, EventBatch, FailedEvent};
pub use buffer::{IngestionBuffer, PartitionReader};
