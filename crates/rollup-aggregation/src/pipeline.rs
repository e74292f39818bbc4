//! Consumer supervisor
//!
//! The pipeline discovers partitions as they appear in the ingestion
//! buffer and runs one supervised consumer task per partition. A consumer
//! that fails (a fatal `StaleCommit` or `LeaseLost`, exhausted storage
//! retries, a lease held elsewhere) has already released its lease; the
//! supervisor waits with backoff and starts a fresh one from the last
//! checkpoint. Errors a restart cannot clear, such as an evicted resume
//! offset, stop the partition's supervisor instead.

use std::collections::HashMap;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use rollup_common::error::{CheckpointError, Error, Result};
use rollup_common::metrics;

use crate::consumer::{ConsumerContext, PartitionConsumer};

pub struct Pipeline {
    ctx: ConsumerContext,
    cancel: CancellationToken,
    tasks: Mutex<HashMap<String, JoinHandle<Result<()>>>>,
}

impl Pipeline {
    pub fn new(ctx: ConsumerContext) -> Self {
        Self {
            ctx,
            cancel: CancellationToken::new(),
            tasks: Mutex::new(HashMap::new()),
        }
    }

    pub fn context(&self) -> &ConsumerContext {
        &self.ctx
    }

    /// Token that stops the pipeline when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Ask every consumer to stop after its current event
    pub fn shutdown(&self) {
        info!("Shutting down pipeline");
        self.cancel.cancel();
    }

    /// Partitions with a supervised consumer
    pub fn active_partitions(&self) -> Vec<String> {
        self.partitions_where(|h| !h.is_finished())
    }

    /// Partitions whose supervisor gave up. They are not rediscovered
    /// until the process restarts.
    pub fn stopped_partitions(&self) -> Vec<String> {
        self.partitions_where(|h| h.is_finished())
    }

    fn partitions_where(&self, keep: impl Fn(&JoinHandle<Result<()>>) -> bool) -> Vec<String> {
        let mut partitions: Vec<String> = self
            .tasks
            .lock()
            .iter()
            .filter(|(_, h)| keep(h))
            .map(|(k, _)| k.clone())
            .collect();
        partitions.sort();
        partitions
    }

    /// Discover partitions and supervise their consumers until shutdown
    pub async fn run(&self) -> Result<()> {
        let interval = Duration::from_millis(self.ctx.config.aggregation.discovery_interval_ms.max(1));
        let mut discovery = tokio::time::interval(interval);
        discovery.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        info!(
            "Pipeline {} started, discovering partitions every {:?}",
            self.ctx.consumer_id, interval
        );

        loop {
            tokio::select! {
                () = self.cancel.cancelled() => break,
                _ = discovery.tick() => self.discover(),
            }
        }

        self.join_all().await;
        info!("Pipeline {} stopped", self.ctx.consumer_id);
        Ok(())
    }

    fn discover(&self) {
        let mut tasks = self.tasks.lock();
        for partition_key in self.ctx.buffer.partitions() {
            if tasks.contains_key(&partition_key) {
                continue;
            }
            info!("Discovered partition {}", partition_key);
            let handle = tokio::spawn(supervise(
                self.ctx.clone(),
                partition_key.clone(),
                self.cancel.clone(),
            ));
            tasks.insert(partition_key, handle);
        }
        drop(tasks);

        match self.ctx.buffer.evict_consumed() {
            Ok(0) => {}
            Ok(released) => debug!("Evicted {} consumed events", released),
            Err(e) => warn!("Segment eviction failed: {}", e),
        }
    }

    async fn join_all(&self) {
        let handles: Vec<JoinHandle<Result<()>>> =
            self.tasks.lock().drain().map(|(_, h)| h).collect();
        for result in futures::future::join_all(handles).await {
            match result {
                // A supervisor that gave up has logged why
                Ok(_) => {}
                Err(e) => error!("Consumer task panicked: {}", e),
            }
        }
    }
}

/// Keep one consumer running on `partition_key` until `cancel` fires or
/// it fails with an error a restart cannot clear
async fn supervise(
    ctx: ConsumerContext,
    partition_key: String,
    cancel: CancellationToken,
) -> Result<()> {
    let mut failures: u32 = 0;

    while !cancel.is_cancelled() {
        let result = match PartitionConsumer::start(ctx.clone(), &partition_key, &cancel).await {
            Ok(consumer) => consumer.run(cancel.clone()).await,
            Err(e) => Err(e),
        };

        let delay = match result {
            Ok(()) => break,
            Err(Error::Checkpoint(CheckpointError::LeaseHeld { owner, expires_at, .. })) => {
                debug!(
                    "Partition {} is held by {} until {}",
                    partition_key, owner, expires_at
                );
                let remaining = expires_at.saturating_sub(ctx.clock.now_millis());
                Duration::from_millis(u64::try_from(remaining).unwrap_or(0))
                    .min(ctx.retry.max_backoff)
                    .max(ctx.retry.initial_backoff)
            }
            Err(e) if e.is_permanent() => {
                error!(
                    "Stopping consumer on partition {}, a restart cannot recover: {}",
                    partition_key, e
                );
                metrics::record_consumer_exit(&partition_key, "stopped");
                return Err(e);
            }
            Err(e) => {
                metrics::record_consumer_exit(&partition_key, "restarted");
                let delay = ctx.retry.backoff(failures);
                failures = failures.saturating_add(1);
                if e.is_fatal_to_consumer() {
                    warn!(
                        "Restarting consumer on partition {} in {:?} after fatal error: {}",
                        partition_key, delay, e
                    );
                } else {
                    error!(
                        "Consumer on partition {} failed, restarting in {:?}: {}",
                        partition_key, delay, e
                    );
                }
                delay
            }
        };

        tokio::select! {
            () = cancel.cancelled() => break,
            () = tokio::time::sleep(delay) => {}
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{Clock, ManualClock};
    use crate::notify::BroadcastHook;
    use crate::workflow::{Stage, Workflow};
    use rollup_common::config::{Config, MetricSpec};
    use rollup_common::event::Event;
    use rollup_storage::{DurableStore, MemoryStore};
    use rollup_streaming::IngestionBuffer;
    use std::sync::Arc;

    fn context(
        clock: Arc<ManualClock>,
        hook: Arc<BroadcastHook>,
    ) -> (ConsumerContext, Arc<IngestionBuffer>) {
        let mut config = Config::default();
        config.aggregation.metrics = vec![MetricSpec::count("events")];
        config.aggregation.poll_interval_ms = 5;
        config.aggregation.discovery_interval_ms = 5;

        let buffer = Arc::new(IngestionBuffer::new(config.buffer.clone()));
        let store: Arc<dyn DurableStore> = Arc::new(MemoryStore::new());
        let ctx = ConsumerContext::new("p1", Arc::new(config), buffer.clone(), store, clock, hook);
        (ctx, buffer)
    }

    #[tokio::test]
    async fn test_pipeline_consumes_new_partitions_and_shuts_down() {
        let clock = Arc::new(ManualClock::new(1_000));
        let hook = Arc::new(BroadcastHook::new(16));
        let mut closed = hook.subscribe();
        let (ctx, buffer) = context(clock.clone(), hook);

        let pipeline = Arc::new(Pipeline::new(ctx));
        let runner = tokio::spawn({
            let pipeline = pipeline.clone();
            async move { pipeline.run().await }
        });

        buffer.append(Event::new("e1", "u1", "view", 10)).await.unwrap();
        buffer.append(Event::new("e2", "u2", "view", 20)).await.unwrap();
        buffer.append(Event::new("e3", "u1", "view", 30)).await.unwrap();

        // Wait for both partitions to commit their last offset
        let checkpoints = pipeline.context().checkpoints.clone();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let u1 = checkpoints.recover("u1").await.unwrap();
                let u2 = checkpoints.recover("u2").await.unwrap();
                if u1 == Some(1) && u2 == Some(0) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("both partitions should be consumed");
        assert_eq!(pipeline.active_partitions(), vec!["u1", "u2"]);

        clock.set(61_000);
        let mut values = Vec::new();
        for _ in 0..2 {
            let record = tokio::time::timeout(Duration::from_secs(5), closed.recv())
                .await
                .expect("window should close")
                .unwrap();
            values.push((record.partition_key, record.value));
        }
        values.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(values, vec![("u1".to_string(), 2.0), ("u2".to_string(), 1.0)]);

        pipeline.shutdown();
        runner.await.unwrap().unwrap();
        assert!(pipeline.active_partitions().is_empty());
    }

    #[tokio::test]
    async fn test_supervisor_gives_up_on_unrecoverable_partition() {
        let clock = Arc::new(ManualClock::new(1_000));
        let hook = Arc::new(BroadcastHook::new(16));
        let (ctx, buffer) = context(clock.clone(), hook);

        // A workflow record past the checkpoint stays wrong across restarts
        let mut workflow = Workflow::start("u1", 7);
        for stage in [Stage::Transform, Stage::Aggregate, Stage::Store] {
            workflow.advance(stage).unwrap();
        }
        ctx.workflows.save(&workflow.record(1_000)).await.unwrap();

        let pipeline = Arc::new(Pipeline::new(ctx));
        let runner = tokio::spawn({
            let pipeline = pipeline.clone();
            async move { pipeline.run().await }
        });
        buffer.append(Event::new("e1", "u1", "view", 10)).await.unwrap();
        buffer.append(Event::new("e2", "u2", "view", 10)).await.unwrap();

        let checkpoints = pipeline.context().checkpoints.clone();
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let u2 = checkpoints.recover("u2").await.unwrap();
                if pipeline.stopped_partitions() == vec!["u1"] && u2 == Some(0) {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("u1 should stop while u2 is consumed");

        assert_eq!(pipeline.active_partitions(), vec!["u2"]);
        assert_eq!(checkpoints.recover("u1").await.unwrap(), None);
        let lease = pipeline.context().leases.current("u1").await.unwrap().unwrap();
        assert!(lease.is_expired(clock.now_millis()));

        pipeline.shutdown();
        runner.await.unwrap().unwrap();
    }
}
