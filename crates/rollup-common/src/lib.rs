//! Rollup Common - Shared utilities and types
//!
//! This crate provides functionality used across all Rollup components:
//! - Error types and handling
//! - Configuration management
//! - Metrics and observability
//! - The event model and aggregate record types

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod error;
pub mod event;
pub mod metrics;
pub mod types;

pub use config::Config;
pub use error::{Error, Result};
pub use event::{Event, PropertyValue};
pub use types::*;
