//! Rollup Query - read-only access to aggregates
//!
//! Provides:
//! - Range queries over persisted windows
//! - Latest (realtime) window lookup
//! - Rollups into minute, hour, day, week and month buckets
//! - Flagging of overdue windows that were never closed

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod granularity;

mod surface;

pub use granularity::Granularity;
pub use surface::{QuerySurface, RollupBucket};
