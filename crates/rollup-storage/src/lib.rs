//! Rollup Storage
//!
//! Durable key-value storage injected into the aggregation engine and the
//! checkpoint manager. Every value carries a version so callers can make
//! conditional (compare-and-set) writes:
//! - `MemoryStore` for tests and ephemeral runs
//! - `SledStore` backed by an embedded sled database

#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use rollup_common::config::{StorageBackend, StorageConfig};
use rollup_common::error::{Error, Result, StorageError};

pub mod keys;

mod memory;
mod sled_store;

pub use memory::MemoryStore;
pub use sled_store::SledStore;

/// A stored value and the version it was written at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Versioned {
    pub version: u64,
    pub value: Bytes,
}

/// Result of a conditional write
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    /// Written; carries the new version
    Applied { version: u64 },
    /// Expected version did not match; carries what is stored now
    Conflict { current: Option<Versioned> },
}

impl CasOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, CasOutcome::Applied { .. })
    }
}

/// Key-value store with atomic conditional writes
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Read a key
    async fn get(&self, key: &str) -> Result<Option<Versioned>>;

    /// Write `value` only if the stored version equals `expected`
    /// (`None` = key must be absent). Versions start at 1.
    async fn compare_and_set(&self, key: &str, expected: Option<u64>, value: Bytes)
        -> Result<CasOutcome>;

    /// Unconditional write, returns the new version
    async fn put(&self, key: &str, value: Bytes) -> Result<u64>;

    /// Remove a key, returns whether it existed
    async fn delete(&self, key: &str) -> Result<bool>;

    /// All entries whose key starts with `prefix`, in key order
    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Versioned)>>;
}

/// Open the store selected by configuration
pub fn open_store(config: &StorageConfig) -> Result<Arc<dyn DurableStore>> {
    match config.backend {
        StorageBackend::Memory => Ok(Arc::new(MemoryStore::new())),
        StorageBackend::Sled => Ok(Arc::new(SledStore::open(&config.path)?)),
    }
}

/// Serialize a stored value
pub fn encode<T: Serialize>(value: &T) -> Result<Bytes> {
    bincode::serialize(value)
        .map(Bytes::from)
        .map_err(|e| Error::Serialization(format!("encode failed: {e}")))
}

/// Deserialize a stored value
pub fn decode<T: DeserializeOwned>(bytes: &[u8]) -> Result<T> {
    bincode::deserialize(bytes)
        .map_err(|e| Error::Storage(StorageError::CorruptData(format!("decode failed: {e}"))))
}
