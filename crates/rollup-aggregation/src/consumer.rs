//! Partition consumer
//!
//! One consumer task owns one partition while it holds the partition's
//! lease. It reads events from the ingestion buffer in offset order and
//! drives each through the workflow stages:
//!
//! ```text
//! Validate → Transform → Aggregate → Store → Notify
//!                                     │        │
//!                      wf record ─────┘        └──── wf record
//!                      aggregate writes              close due windows
//!                      checkpoint commit
//!                      buffer ack
//! ```
//!
//! On restart the last workflow record decides what happens before new
//! events are read. A record left at `Notify` re-emits the closures it
//! listed; a record left at `Store` must sit right after the checkpoint.
//!
//! Cancellation is checked between events only, so the write-then-commit
//! sequence of the current event always completes.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use rollup_common::config::Config;
use rollup_common::error::{CheckpointError, Error, IngestError, Result};
use rollup_common::event::Event;
use rollup_common::metrics;
use rollup_common::types::{Offset, Timestamp};
use rollup_storage::DurableStore;
use rollup_streaming::IngestionBuffer;

use crate::checkpoint::CheckpointManager;
use crate::clock::SharedClock;
use crate::engine::{AggregationEngine, ProcessOutcome};
use crate::lease::{LeaseGuard, LeaseManager};
use crate::notify::WindowClosedHook;
use crate::retry::RetryPolicy;
use crate::workflow::{resume_point, ResumePoint, Stage, Workflow, WorkflowRecord, WorkflowStore};

/// Everything a consumer needs, shared by all consumers of one process
#[derive(Clone)]
pub struct ConsumerContext {
    pub consumer_id: String,
    pub config: Arc<Config>,
    pub buffer: Arc<IngestionBuffer>,
    pub store: Arc<dyn DurableStore>,
    pub clock: SharedClock,
    pub hook: Arc<dyn WindowClosedHook>,
    pub retry: RetryPolicy,
    pub leases: Arc<LeaseManager>,
    pub checkpoints: Arc<CheckpointManager>,
    pub workflows: Arc<WorkflowStore>,
}

impl ConsumerContext {
    pub fn new(
        consumer_id: impl Into<String>,
        config: Arc<Config>,
        buffer: Arc<IngestionBuffer>,
        store: Arc<dyn DurableStore>,
        clock: SharedClock,
        hook: Arc<dyn WindowClosedHook>,
    ) -> Self {
        let consumer_id = consumer_id.into();
        let retry = RetryPolicy::from(&config.retry);
        let leases = Arc::new(LeaseManager::new(
            consumer_id.clone(),
            store.clone(),
            clock.clone(),
            &config.checkpoint,
        ));
        let checkpoints = Arc::new(CheckpointManager::new(
            store.clone(),
            clock.clone(),
            retry.clone(),
        ));
        let workflows = Arc::new(WorkflowStore::new(store.clone(), retry.clone()));

        Self {
            consumer_id,
            config,
            buffer,
            store,
            clock,
            hook,
            retry,
            leases,
            checkpoints,
            workflows,
        }
    }
}

pub struct PartitionConsumer {
    ctx: ConsumerContext,
    partition_key: String,
    engine: AggregationEngine,
    guard: LeaseGuard,
    /// Next buffer offset to read
    next_offset: Offset,
}

impl PartitionConsumer {
    /// Take the partition's lease and restore its state from the store.
    ///
    /// Fails with `LeaseHeld` while another live instance owns the
    /// partition.
    pub async fn start(
        ctx: ConsumerContext,
        partition_key: &str,
        cancel: &CancellationToken,
    ) -> Result<Self> {
        let lease = ctx.leases.acquire(partition_key).await?;
        let guard = ctx.leases.keep_alive(lease, cancel);

        match Self::restore(&ctx, partition_key).await {
            Ok((engine, next_offset, interrupted)) => {
                let mut consumer = Self {
                    ctx,
                    partition_key: partition_key.to_string(),
                    engine,
                    guard,
                    next_offset,
                };
                consumer
                    .ctx
                    .buffer
                    .register_consumer(&consumer.ctx.consumer_id, partition_key, next_offset - 1);

                match consumer.catch_up(interrupted).await {
                    Ok(()) => Ok(consumer),
                    Err(e) => {
                        consumer.finish().await;
                        Err(e)
                    }
                }
            }
            Err(e) => {
                let lease = guard.stop().await;
                if let Err(release) = ctx.leases.release(&lease).await {
                    warn!("Failed to release lease on {}: {}", partition_key, release);
                }
                Err(e)
            }
        }
    }

    /// Load the engine and the next offset to read. Also returns the
    /// workflow record when its `Notify` stage was interrupted.
    async fn restore(
        ctx: &ConsumerContext,
        partition_key: &str,
    ) -> Result<(AggregationEngine, Offset, Option<WorkflowRecord>)> {
        let checkpoint = ctx.checkpoints.recover(partition_key).await?;
        let record = ctx.workflows.load(partition_key).await?;
        let next_offset = checkpoint.map_or(0, |offset| offset + 1);

        let interrupted = match resume_point(record.as_ref(), checkpoint) {
            ResumePoint::Checkpoint => None,
            ResumePoint::Reprocess { offset } => {
                if offset != next_offset {
                    return Err(Error::Internal(format!(
                        "workflow of {} stopped at offset {} but the checkpoint is {:?}",
                        partition_key, offset, checkpoint
                    )));
                }
                info!(
                    "Partition {} was interrupted before committing offset {}, reprocessing",
                    partition_key, offset
                );
                None
            }
            ResumePoint::Notify { offset } => {
                info!(
                    "Partition {} was interrupted while closing windows after offset {}",
                    partition_key, offset
                );
                record
            }
        };

        let engine = AggregationEngine::load(
            partition_key,
            &ctx.config.aggregation,
            ctx.retry.clone(),
            ctx.store.clone(),
            ctx.clock.clone(),
        )
        .await?;

        if let Some(low) = ctx.buffer.low_watermark(partition_key) {
            if low > next_offset {
                return Err(Error::Ingest(IngestError::OffsetEvicted {
                    partition_key: partition_key.to_string(),
                    requested: next_offset,
                    low_watermark: low,
                }));
            }
        }

        Ok((engine, next_offset, interrupted))
    }

    /// Finish an interrupted `Notify`, then close whatever else is due
    async fn catch_up(&mut self, interrupted: Option<WorkflowRecord>) -> Result<()> {
        if let Some(record) = interrupted {
            self.resume_notify(record).await?;
        }
        self.close_windows().await?;
        Ok(())
    }

    /// Re-emit the closures listed by an interrupted `Notify`. Listed
    /// windows that never reached the store closed are left to the next
    /// close sweep.
    async fn resume_notify(&mut self, mut record: WorkflowRecord) -> Result<()> {
        if record.closing.is_empty() {
            return Ok(());
        }

        let mut emitted = 0;
        for (metric, window_start) in &record.closing {
            if let Some(closed) = self.engine.closed_record(metric, *window_start).await? {
                self.ctx.hook.on_window_closed(&closed);
                emitted += 1;
            }
        }
        info!(
            "Re-emitted {} of {} window closures of {} after offset {}",
            emitted,
            record.closing.len(),
            self.partition_key,
            record.offset
        );

        record.closing.clear();
        record.updated_at = self.ctx.clock.now_millis();
        self.ctx.workflows.save(&record).await
    }

    pub fn partition_key(&self) -> &str {
        &self.partition_key
    }

    pub fn next_offset(&self) -> Offset {
        self.next_offset
    }

    pub fn engine(&self) -> &AggregationEngine {
        &self.engine
    }

    /// Consume until `cancel` fires or a fatal error occurs. The lease is
    /// released and the consumer unregistered either way.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        info!(
            "Starting consumer {} on partition {} at offset {}",
            self.ctx.consumer_id, self.partition_key, self.next_offset
        );

        let result = self.consume(&cancel).await;
        match &result {
            Ok(()) => info!("Consumer on partition {} stopped", self.partition_key),
            Err(e) => warn!("Consumer on partition {} failed: {}", self.partition_key, e),
        }

        self.finish().await;
        result
    }

    async fn consume(&mut self, cancel: &CancellationToken) -> Result<()> {
        let lost = self.guard.lost_token();
        let poll_interval = Duration::from_millis(self.ctx.config.aggregation.poll_interval_ms);

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }
            if lost.is_cancelled() {
                return Err(self.lease_lost());
            }

            if self.poll_once(cancel).await? > 0 {
                continue;
            }

            // Idle: windows still close on wall-clock time
            self.close_windows().await?;
            tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                () = lost.cancelled() => {}
                () = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    /// Process at most one batch. Returns the number of events handled.
    pub async fn poll_once(&mut self, cancel: &CancellationToken) -> Result<usize> {
        let batch = self.ctx.buffer.read_batch(
            &self.partition_key,
            self.next_offset,
            self.ctx.config.aggregation.max_batch_records,
        )?;
        if batch.is_empty() {
            return Ok(0);
        }

        let mut handled = 0;
        for (offset, event) in batch {
            if cancel.is_cancelled() || self.guard.is_lost() {
                break;
            }
            self.process_event(offset, &event).await?;
            handled += 1;
        }

        if let Some(head) = self.ctx.buffer.high_watermark(&self.partition_key) {
            metrics::set_consumer_lag(&self.partition_key, head - (self.next_offset - 1));
        }
        Ok(handled)
    }

    async fn process_event(&mut self, offset: Offset, event: &Event) -> Result<()> {
        let mut workflow = Workflow::start(&self.partition_key, offset);

        let valid = match event.validate() {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    "Skipping invalid event at offset {} of {}: {}",
                    offset, self.partition_key, e
                );
                metrics::record_event_rejected("invalid");
                false
            }
        };

        workflow.advance(Stage::Transform)?;
        let window = if valid {
            match self.engine.assign_window(event) {
                Ok(window) => Some(window),
                Err(e) if e.is_late_event() => {
                    warn!(
                        "Dropping late event at offset {} of {}: {}",
                        offset, self.partition_key, e
                    );
                    None
                }
                Err(e) => return Err(e),
            }
        } else {
            None
        };

        workflow.advance(Stage::Aggregate)?;
        let outcome = match window {
            Some(window) => self.engine.aggregate(offset, event, window)?,
            None => ProcessOutcome::empty(offset),
        };

        workflow.advance(Stage::Store)?;
        self.ctx
            .workflows
            .save(&workflow.record(self.ctx.clock.now_millis()))
            .await?;
        self.engine.persist(&outcome).await?;
        // Fence out a stale owner before the checkpoint moves
        self.ctx.leases.check(&self.guard.lease()).await?;
        self.ctx.checkpoints.commit(&self.partition_key, offset).await?;
        self.ctx
            .buffer
            .acknowledge(&self.ctx.consumer_id, &self.partition_key, offset);
        self.next_offset = offset + 1;

        workflow.advance(Stage::Notify)?;
        let now = self.ctx.clock.now_millis();
        let mut record = workflow.record(now);
        record.closing = self.engine.due_windows(now);
        self.ctx.workflows.save(&record).await?;
        self.close_recorded(record).await?;

        Ok(())
    }

    /// Close sweep outside of event processing
    async fn close_windows(&mut self) -> Result<usize> {
        let now = self.ctx.clock.now_millis();
        let closing = self.engine.due_windows(now);
        if closing.is_empty() {
            return Ok(0);
        }
        // Nothing committed yet to anchor a workflow record on
        if self.next_offset == 0 {
            return self.emit_due(now).await;
        }

        let record = WorkflowRecord {
            partition_key: self.partition_key.clone(),
            offset: self.next_offset - 1,
            stage: Stage::Notify,
            closing,
            updated_at: now,
        };
        self.ctx.workflows.save(&record).await?;
        self.close_recorded(record).await
    }

    /// Close the windows `record` lists, then clear the list
    async fn close_recorded(&mut self, mut record: WorkflowRecord) -> Result<usize> {
        if record.closing.is_empty() {
            return Ok(0);
        }
        let closed = self.emit_due(record.updated_at).await?;

        record.closing.clear();
        record.updated_at = self.ctx.clock.now_millis();
        self.ctx.workflows.save(&record).await?;
        Ok(closed)
    }

    async fn emit_due(&mut self, now: Timestamp) -> Result<usize> {
        let closed = self.engine.close_due_windows(now).await?;
        for record in &closed {
            self.ctx.hook.on_window_closed(record);
        }
        Ok(closed.len())
    }

    fn lease_lost(&self) -> Error {
        Error::Checkpoint(CheckpointError::LeaseLost {
            partition_key: self.partition_key.clone(),
            epoch: self.guard.epoch(),
        })
    }

    async fn finish(self) {
        let Self {
            ctx,
            partition_key,
            guard,
            ..
        } = self;

        let lease = guard.stop().await;
        if let Err(e) = ctx.leases.release(&lease).await {
            warn!("Failed to release lease on {}: {}", partition_key, e);
        }
        ctx.buffer.unregister_consumer(&ctx.consumer_id, &partition_key);
    }
}
