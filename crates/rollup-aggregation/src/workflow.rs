//! Per-event workflow state machine
//!
//! Every event runs through `Validate → Transform → Aggregate → Store →
//! Notify`. The stage reached is persisted under `wf/{partition}` at the
//! two points where a crash changes what recovery must do:
//!
//! - entering `Store`, before any aggregate write for the offset;
//! - entering `Notify`, after the checkpoint for the offset is committed.
//!
//! A `Notify` record lists the windows it is about to close. The list is
//! cleared once their hooks have fired, so a restart re-emits exactly the
//! closures that may have been lost.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use rollup_common::error::{Error, Result};
use rollup_common::types::{Offset, Timestamp};
use rollup_storage::{decode, encode, keys, DurableStore};

use crate::retry::{retry_with_backoff, RetryPolicy};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Stage {
    /// Re-check the event against the ingestion contract
    Validate,
    /// Assign the event-time window, reject late events
    Transform,
    /// Fold into in-memory window state
    Aggregate,
    /// Persist window state, then commit the checkpoint
    Store,
    /// Close due windows and emit them
    Notify,
}

impl Stage {
    pub fn next(self) -> Option<Stage> {
        match self {
            Stage::Validate => Some(Stage::Transform),
            Stage::Transform => Some(Stage::Aggregate),
            Stage::Aggregate => Some(Stage::Store),
            Stage::Store => Some(Stage::Notify),
            Stage::Notify => None,
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One event's progress through the stages
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Workflow {
    partition_key: String,
    offset: Offset,
    stage: Stage,
}

impl Workflow {
    pub fn start(partition_key: &str, offset: Offset) -> Self {
        Self {
            partition_key: partition_key.to_string(),
            offset,
            stage: Stage::Validate,
        }
    }

    /// Move to `to`, which must be the stage right after the current one
    pub fn advance(&mut self, to: Stage) -> Result<()> {
        if self.stage.next() != Some(to) {
            return Err(Error::Internal(format!(
                "invalid workflow transition {} -> {} at offset {} of {}",
                self.stage, to, self.offset, self.partition_key
            )));
        }
        self.stage = to;
        Ok(())
    }

    pub fn stage(&self) -> Stage {
        self.stage
    }

    pub fn offset(&self) -> Offset {
        self.offset
    }

    pub fn record(&self, updated_at: Timestamp) -> WorkflowRecord {
        WorkflowRecord {
            partition_key: self.partition_key.clone(),
            offset: self.offset,
            stage: self.stage,
            closing: Vec::new(),
            updated_at,
        }
    }
}

/// Persisted progress of the last event a partition's consumer worked on
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowRecord {
    pub partition_key: String,
    pub offset: Offset,
    pub stage: Stage,
    /// (metric, window start) of windows being closed at `Notify`
    pub closing: Vec<(String, Timestamp)>,
    pub updated_at: Timestamp,
}

/// What a restarting consumer must do before reading new events
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResumePoint {
    /// Nothing in flight; read from the checkpoint
    Checkpoint,
    /// Writes for `offset` may have landed without a commit. The event is
    /// read again from `Validate`; deduplication keeps counts exact.
    Reprocess { offset: Offset },
    /// `offset` was committed but its windows may not have been closed
    Notify { offset: Offset },
}

/// Decide where to resume from the last workflow record and checkpoint
pub fn resume_point(record: Option<&WorkflowRecord>, checkpoint: Option<Offset>) -> ResumePoint {
    let Some(record) = record else {
        return ResumePoint::Checkpoint;
    };

    let committed = checkpoint.map_or(false, |c| record.offset <= c);
    match (record.stage, committed) {
        (_, false) => ResumePoint::Reprocess {
            offset: record.offset,
        },
        (Stage::Notify, true) => ResumePoint::Notify {
            offset: record.offset,
        },
        (_, true) => ResumePoint::Checkpoint,
    }
}

/// Reads and writes workflow records
pub struct WorkflowStore {
    store: Arc<dyn DurableStore>,
    retry: RetryPolicy,
}

impl WorkflowStore {
    pub fn new(store: Arc<dyn DurableStore>, retry: RetryPolicy) -> Self {
        Self { store, retry }
    }

    pub async fn save(&self, record: &WorkflowRecord) -> Result<()> {
        let key = keys::workflow(&record.partition_key);
        let value = encode(record)?;
        retry_with_backoff(&self.retry, "put_workflow", || {
            self.store.put(&key, value.clone())
        })
        .await
        .map(|_| ())
        .map_err(|e| e.error)
    }

    pub async fn load(&self, partition_key: &str) -> Result<Option<WorkflowRecord>> {
        let key = keys::workflow(partition_key);
        let stored = retry_with_backoff(&self.retry, "get_workflow", || self.store.get(&key))
            .await
            .map_err(|e| e.error)?;

        let record: Option<WorkflowRecord> = stored.map(|v| decode(&v.value)).transpose()?;
        if let Some(record) = &record {
            info!(
                "Partition {} last reached {} at offset {}",
                partition_key, record.stage, record.offset
            );
        }
        Ok(record)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollup_storage::MemoryStore;

    fn record(offset: Offset, stage: Stage) -> WorkflowRecord {
        WorkflowRecord {
            partition_key: "u1".to_string(),
            offset,
            stage,
            closing: Vec::new(),
            updated_at: 0,
        }
    }

    #[test]
    fn test_stages_advance_in_order() {
        let mut workflow = Workflow::start("u1", 3);
        for stage in [Stage::Transform, Stage::Aggregate, Stage::Store, Stage::Notify] {
            workflow.advance(stage).unwrap();
        }
        assert_eq!(workflow.stage(), Stage::Notify);
        assert_eq!(workflow.stage().next(), None);
    }

    #[test]
    fn test_skipping_a_stage_is_rejected() {
        let mut workflow = Workflow::start("u1", 3);
        assert!(workflow.advance(Stage::Store).is_err());
        assert_eq!(workflow.stage(), Stage::Validate);
    }

    #[test]
    fn test_resume_point() {
        assert_eq!(resume_point(None, Some(4)), ResumePoint::Checkpoint);

        // Crashed between aggregate writes and commit
        assert_eq!(
            resume_point(Some(&record(5, Stage::Store)), Some(4)),
            ResumePoint::Reprocess { offset: 5 }
        );
        assert_eq!(
            resume_point(Some(&record(0, Stage::Store)), None),
            ResumePoint::Reprocess { offset: 0 }
        );

        // Committed, window close may be missing
        assert_eq!(
            resume_point(Some(&record(5, Stage::Notify)), Some(5)),
            ResumePoint::Notify { offset: 5 }
        );

        // Crashed after commit but before Notify was recorded
        assert_eq!(
            resume_point(Some(&record(5, Stage::Store)), Some(5)),
            ResumePoint::Checkpoint
        );
    }

    #[tokio::test]
    async fn test_record_roundtrip_through_store() {
        let workflows = WorkflowStore::new(Arc::new(MemoryStore::new()), RetryPolicy::default());
        assert_eq!(workflows.load("u1").await.unwrap(), None);

        let mut workflow = Workflow::start("u1", 9);
        workflow.advance(Stage::Transform).unwrap();
        let mut record = workflow.record(77);
        record.closing = vec![("views".to_string(), 60_000)];
        workflows.save(&record).await.unwrap();

        let loaded = workflows.load("u1").await.unwrap().unwrap();
        assert_eq!(loaded.stage, Stage::Transform);
        assert_eq!(loaded.offset, 9);
        assert_eq!(loaded.updated_at, 77);
        assert_eq!(loaded.closing, record.closing);
    }
}
