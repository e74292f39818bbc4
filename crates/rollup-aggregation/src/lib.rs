//! Rollup Aggregation - windowed aggregation and exactly-once consumers
//!
//! Turns the ingestion buffer's partitions into persisted window
//! aggregates:
//! - Tumbling event-time windows with allowed lateness
//! - Configurable metrics (count, sum, min, max, approximate distinct)
//! - Event-id deduplication for non-idempotent metrics
//! - Compare-and-set checkpoints and epoch-fenced partition leases
//! - Supervised per-partition consumers driving a persisted workflow

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod checkpoint;
pub mod clock;
pub mod combine;
pub mod consumer;
pub mod dedup;
pub mod engine;
pub mod hll;
pub mod lease;
pub mod notify;
pub mod pipeline;
pub mod retry;
pub mod state;
pub mod window;
pub mod workflow;

pub use checkpoint::CheckpointManager;
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use combine::Accumulator;
pub use consumer::{ConsumerContext, PartitionConsumer};
pub use engine::{AggregationEngine, ProcessOutcome};
pub use lease::{Lease, LeaseGuard, LeaseManager};
pub use notify::{BroadcastHook, LoggingHook, WindowClosedHook};
pub use pipeline::Pipeline;
pub use retry::RetryPolicy;
pub use window::TumblingWindows;
pub use workflow::{ResumePoint, Stage, WorkflowRecord, WorkflowStore};
