//! In-memory durable store

use std::collections::BTreeMap;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;

use rollup_common::error::Result;

use crate::{CasOutcome, DurableStore, Versioned};

/// Process-local store; "durable" for the lifetime of the value
#[derive(Default)]
pub struct MemoryStore {
    entries: RwLock<BTreeMap<String, Versioned>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<Versioned>> {
        Ok(self.entries.read().get(key).cloned())
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<u64>,
        value: Bytes,
    ) -> Result<CasOutcome> {
        let mut entries = self.entries.write();
        let current = entries.get(key);

        if current.map(|v| v.version) != expected {
            return Ok(CasOutcome::Conflict {
                current: current.cloned(),
            });
        }

        let version = expected.unwrap_or(0) + 1;
        entries.insert(key.to_string(), Versioned { version, value });
        Ok(CasOutcome::Applied { version })
    }

    async fn put(&self, key: &str, value: Bytes) -> Result<u64> {
        let mut entries = self.entries.write();
        let version = entries.get(key).map_or(1, |v| v.version + 1);
        entries.insert(key.to_string(), Versioned { version, value });
        Ok(version)
    }

    async fn delete(&self, key: &str) -> Result<bool> {
        Ok(self.entries.write().remove(key).is_some())
    }

    async fn scan_prefix(&self, prefix: &str) -> Result<Vec<(String, Versioned)>> {
        let entries = self.entries.read();
        Ok(entries
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cas_versions() {
        let store = MemoryStore::new();

        let first = store
            .compare_and_set("k", None, Bytes::from_static(b"1"))
            .await
            .unwrap();
        assert_eq!(first, CasOutcome::Applied { version: 1 });

        // Absent expectation no longer holds
        let conflict = store
            .compare_and_set("k", None, Bytes::from_static(b"2"))
            .await
            .unwrap();
        assert!(!conflict.is_applied());

        let second = store
            .compare_and_set("k", Some(1), Bytes::from_static(b"2"))
            .await
            .unwrap();
        assert_eq!(second, CasOutcome::Applied { version: 2 });

        let stored = store.get("k").await.unwrap().unwrap();
        assert_eq!(stored.value, Bytes::from_static(b"2"));
    }

    #[tokio::test]
    async fn test_scan_prefix_is_ordered_and_bounded() {
        let store = MemoryStore::new();
        for key in ["agg/b/x", "agg/a/y", "agg/a/x", "ckpt/a"] {
            store.put(key, Bytes::from_static(b"v")).await.unwrap();
        }

        let keys: Vec<String> = store
            .scan_prefix("agg/a/")
            .await
            .unwrap()
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(keys, vec!["agg/a/x".to_string(), "agg/a/y".to_string()]);
    }
}
