//! sled-backed durable store
//!
//! Each value is stored as an 8-byte big-endian version followed by the
//! payload. Conditional writes use sled's atomic compare-and-swap on the
//! raw bytes, and every write is flushed before it is acknowledged.

use std::path::Path;

use async_trait::async_trait;
use bytes::Bytes;
use sled::{Db, IVec};
use tracing::{debug, info};

use rollup_common::error::{Error, Result, StorageError};
use rollup_common::metrics::LatencyTimer;

use crate::{CasOutcome, DurableStore, Versioned};

const VERSION_LEN: usize = 8;

/// Durable store on top of an embedded sled database
pub struct SledStore {
    db: Db,
}

impl SledStore {
    /// Open (or create) the database at `path`
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        info!("Opening sled store at {:?}", path.as_ref());
        let db = sled::open(path.as_ref()).map_err(|e| {
            Error::Storage(StorageError::Unavailable(format!("open failed: {e}")))
        })?;
        Ok(Self { db })
    }

    /// Temporary database removed on drop
    pub fn temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| Error::Storage(StorageError::Unavailable(e.to_string())))?;
        Ok(Self { db })
    }

    async fn flush(&self) -> Result<()> {
        self.db
            .flush_async()
            .await
            .map_err(|e| Error::Storage(StorageError::WriteFailed(format!("flush failed: {e}"))))?;
        Ok(())
    }
}

fn encode_raw(version: u64, value: &[u8]) -> Vec<u8> {
    let mut raw = Vec::with_capacity(VERSION_LEN + value.len());
    raw.extend_from_slice(&version.to_be_bytes());
    raw.extend_from_slice(value);
    raw
}

fn decode_raw(raw: &IVec) -> Result<Versioned> {
    if raw.len() < VERSION_LEN {
        return Err(Error::Storage(StorageError::CorruptData(
            "value shorter than version header".to_string(),
        )));
    }
    let mut header = [0u8; VERSION_LEN];
    header.copy_from_slice(&raw[..VERSION_LEN]);
    Ok(Versioned {
        version: u64::from_be_bytes(header),
        value: Bytes::copy_from_slice(&raw[VERSION_LEN..]),
    })
}

fn read_err(e: sled::Error) -> Error {
    Error::Storage(StorageError::ReadFailed(e.to_string()))
}

fn write_err(e: sled::Error) -> Error {
    Error::Storage(StorageError::WriteFailed(e.to_string()))
}

#[async_trait]
impl DurableStore for SledStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        let _timer = LatencyTimer::new("get");
        self.db
            .get(key)
            .map_err(read_err)?
            .as_ref()
            .map(decode_raw)
            .transpose()
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Bytes,
    ) -> Result<CasOutcome> {
        let _timer = LatencyTimer::new("compare_and_set");
        let current_raw = self.db.get(key).map_err(read_err)?;
        let current = current_raw.as_ref().map(decode_raw).transpose()?;

        if current.as_ref().map(|v| v.version) != expected {
            return Ok(CasOutcome::Conflict { current });
        }

        let version = expected.unwrap_or(0) + 1;
        let swapped = self
            .db
            .compare_and_swap(key, current_raw, Some(encode_raw(version, &value)))
            .map_err(write_err)?;

        match swapped {
            Ok(()) => {
                self.flush().await?;
                Ok(CasOutcome::Applied { version })
            }
            Err(conflict) => {
                debug!("CAS lost race on {}", key);
                let current = conflict.current.as_ref().map(decode_raw).transpose()?;
                Ok(CasOutcome::Conflict { current })
            }
        }
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<u64> {
        let _timer = LatencyTimer::new("put");
        let updated = self
            .db
            .update_and_fetch(key, |old| {
                let version = old
                    .filter(|raw| raw.len() >= VERSION_LEN)
                    .map_or(1, |raw| {
                        let mut header = [0u8; VERSION_LEN];
                        header.copy_from_slice(&raw[..VERSION_LEN]);
                        u64::from_be_bytes(header) + 1
                    });
                Some(encode_raw(version, &value))
            })
            .map_err(write_err)?
            .ok_or_else(|| Error::Internal(format!("put on {key} produced no value")))?;

        self.flush().await?;
        Ok(decode_raw(&updated)?.version)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        let removed = self.db.remove(key).map_err(write_err)?.is_some();
        if removed {
            self.flush().await?;
        }
        Ok(removed)
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Versioned)>> {
        let _timer = LatencyTimer::new("scan_prefix");
        let mut entries = Vec::new();
        for item in self.db.scan_prefix(prefix) {
            let (key, raw) = item.map_err(read_err)?;
            let key = String::from_utf8(key.to_vec()).map_err(|e| {
                Error::Storage(StorageError::CorruptData(format!("non-utf8 key: {e}")))
            })?;
            entries.push((key, decode_raw(&raw)?));
        }
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cas_and_put_versions() {
        let store = SledStore::temporary().unwrap();

        assert!(store
            .compare_and_set("ckpt/a", None, Bytes::from_static(b"x"))
            .await
            .unwrap()
            .is_applied());
        assert_eq!(store.put("ckpt/a", Bytes::from_static(b"y")).await.unwrap(), 2);

        let stale = store
            .compare_and_set("ckpt/a", Some(1), Bytes::from_static(b"z"))
            .await
            .unwrap();
        match stale {
            CasOutcome::Conflict { current } => assert_eq!(current.unwrap().version, 2),
            CasOutcome::Applied { .. } => panic!("stale CAS must not apply"),
        }
    }

    #[tokio::test]
    async fn test_reopen_keeps_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store");

        {
            let store = SledStore::open(&path).unwrap();
            store.put("agg/a/m/1", Bytes::from_static(b"v1")).await.unwrap();
            store.put("agg/a/m/2", Bytes::from_static(b"v2")).await.unwrap();
        }

        let store = SledStore::open(&path).unwrap();
        let entries = store.scan_prefix("agg/a/").await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].1.value, Bytes::from_static(b"v1"));
        assert!(store.delete("agg/a/m/1").await.unwrap());
        assert!(!store.delete("agg/a/m/1").await.unwrap());
    }
}
