//! Checkpoint commit and recovery
//!
//! Checkpoints live under `ckpt/{partition}` and only move forward. A
//! commit reads the current value, refuses anything not strictly greater
//! (`StaleCommit`), and writes with compare-and-set against the version it
//! read, so two concurrent committers can never both land the same offset.

use std::sync::Arc;

use tracing::{debug, info};

use rollup_common::error::{CheckpointError, Error, Result};
use rollup_common::metrics;
use rollup_common::types::{Checkpoint, Offset};
use rollup_storage::{decode, encode, keys, CasOutcome, DurableStore, Versioned};

use crate::clock::SharedClock;
use crate::retry::{retry_with_backoff, RetryPolicy};

pub struct CheckpointManager {
    store: Arc<dyn DurableStore>,
    clock: SharedClock,
    retry: RetryPolicy,
}

impl CheckpointManager {
    pub fn new(store: Arc<dyn DurableStore>, clock: SharedClock, retry: RetryPolicy) -> Self {
        Self { store, clock, retry }
    }

    /// Record that every offset up to `offset` is reflected in durable state
    pub async fn commit(&self, partition_key: &str, offset: Offset) -> Result<Checkpoint> {
        let key = keys::checkpoint(partition_key);
        let checkpoint = Checkpoint {
            partition_key: partition_key.to_string(),
            last_processed_offset: offset,
            committed_at: self.clock.now_millis(),
        };
        let value = encode(&checkpoint)?;

        let mut current = self.read(&key).await?;
        loop {
            let expected = match &current {
                Some((version, committed)) => {
                    if committed.last_processed_offset >= offset {
                        return Err(Error::Checkpoint(CheckpointError::StaleCommit {
                            partition_key: partition_key.to_string(),
                            committed: committed.last_processed_offset,
                            attempted: offset,
                        }));
                    }
                    Some(*version)
                }
                None => None,
            };

            let mut attempts = 0u32;
            let outcome = retry_with_backoff(&self.retry, "commit_checkpoint", || {
                attempts += 1;
                self.store.compare_and_set(&key, expected, value.clone())
            })
            .await
            .map_err(|e| e.error)?;

            match outcome {
                CasOutcome::Applied { .. } => {
                    debug!("Committed offset {} for partition {}", offset, partition_key);
                    metrics::record_commit(partition_key, offset);
                    return Ok(checkpoint);
                }
                // A failed attempt may have landed before reporting its error
                CasOutcome::Conflict { current: Some(latest) }
                    if attempts > 1 && latest.value == value =>
                {
                    debug!(
                        "Commit of offset {} for partition {} landed on an earlier attempt",
                        offset, partition_key
                    );
                    metrics::record_commit(partition_key, offset);
                    return Ok(checkpoint);
                }
                CasOutcome::Conflict { current: latest } => {
                    current = latest.map(|v| decode_versioned(&v)).transpose()?;
                }
            }
        }
    }

    /// Last committed offset, `None` for a partition never committed.
    /// Consumers resume at `offset + 1`.
    pub async fn recover(&self, partition_key: &str) -> Result<Option<Offset>> {
        let offset = self
            .load(partition_key)
            .await?
            .map(|c| c.last_processed_offset);
        info!("Recovered partition {} at checkpoint {:?}", partition_key, offset);
        Ok(offset)
    }

    pub async fn load(&self, partition_key: &str) -> Result<Option<Checkpoint>> {
        Ok(self
            .read(&keys::checkpoint(partition_key))
            .await?
            .map(|(_, checkpoint)| checkpoint))
    }

    /// Every committed checkpoint, ordered by partition key
    pub async fn list(&self) -> Result<Vec<Checkpoint>> {
        let entries = retry_with_backoff(&self.retry, "scan_checkpoints", || {
            self.store.scan_prefix(keys::CHECKPOINT_PREFIX)
        })
        .await
        .map_err(|e| e.error)?;

        entries
            .into_iter()
            .map(|(_, v)| decode(&v.value))
            .collect()
    }

    async fn read(&self, key: &str) -> Result<Option<(u64, Checkpoint)>> {
        retry_with_backoff(&self.retry, "get_checkpoint", || self.store.get(key))
            .await
            .map_err(|e| e.error)?
            .map(|v| decode_versioned(&v))
            .transpose()
    }
}

fn decode_versioned(versioned: &Versioned) -> Result<(u64, Checkpoint)> {
    Ok((versioned.version, decode(&versioned.value)?))
}
