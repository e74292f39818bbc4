//! Server orchestration

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use rollup_aggregation::{ConsumerContext, LoggingHook, Pipeline, SystemClock};
use rollup_common::config::Config;
use rollup_common::event::Event;
use rollup_common::metrics;
use rollup_storage::open_store;
use rollup_streaming::IngestionBuffer;

/// Where `serve` reads newline-delimited JSON events from
pub enum EventSource {
    Stdin,
    File(PathBuf),
}

/// Counts of one ingestion run
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct IngestSummary {
    pub accepted: usize,
    pub rejected: usize,
}

/// Ingestion front end plus the aggregation pipeline
pub struct RollupServer {
    buffer: Arc<IngestionBuffer>,
    pipeline: Arc<Pipeline>,
}

impl RollupServer {
    pub fn new(config: Config) -> Result<Self> {
        info!("Initializing Rollup components...");

        let store = open_store(&config.storage).context("failed to open durable store")?;
        let buffer = Arc::new(
            IngestionBuffer::open(config.buffer.clone()).context("failed to open ingestion buffer")?,
        );

        let ctx = ConsumerContext::new(
            config.server.consumer_id.clone(),
            Arc::new(config),
            buffer.clone(),
            store,
            Arc::new(SystemClock),
            Arc::new(LoggingHook),
        );
        let pipeline = Arc::new(Pipeline::new(ctx));

        info!("Rollup initialization complete");
        Ok(Self { buffer, pipeline })
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.pipeline.cancellation_token()
    }

    /// Ingest `source` while the pipeline aggregates, then keep aggregating
    /// until shutdown so open windows still close
    pub async fn run(&self, source: EventSource) -> Result<()> {
        let pipeline = self.pipeline.clone();
        let pipeline_handle = tokio::spawn(async move { pipeline.run().await });

        let summary = match source {
            EventSource::Stdin => self.ingest(BufReader::new(tokio::io::stdin())).await,
            EventSource::File(path) => {
                let file = tokio::fs::File::open(&path)
                    .await
                    .with_context(|| format!("failed to open {}", path.display()))?;
                self.ingest(BufReader::new(file)).await
            }
        };

        match summary {
            Ok(summary) => info!(
                "Input exhausted: {} events accepted, {} rejected",
                summary.accepted, summary.rejected
            ),
            Err(e) => {
                warn!("Ingestion stopped: {:#}", e);
                self.pipeline.shutdown();
            }
        }

        pipeline_handle.await??;

        let stats = self.buffer.stats();
        info!(
            "Shutdown complete ({} partitions, {} buffered events)",
            stats.partitions, stats.records
        );
        Ok(())
    }

    /// Append every event line of `reader` until end of input or shutdown
    pub async fn ingest<R>(&self, reader: R) -> Result<IngestSummary>
    where
        R: AsyncBufRead + Unpin,
    {
        let cancel = self.pipeline.cancellation_token();
        let mut lines = reader.lines();
        let mut summary = IngestSummary::default();

        loop {
            let line = tokio::select! {
                () = cancel.cancelled() => break,
                line = lines.next_line() => line.context("failed to read input")?,
            };
            let Some(line) = line else { break };
            let line = line.trim();
            if line.is_empty() {
                continue;
            }

            let event = serde_json::from_str::<serde_json::Value>(line)
                .map_err(rollup_common::Error::from)
                .and_then(|payload| Event::from_json(&payload));
            let event = match event {
                Ok(event) => event,
                Err(e) => {
                    warn!("Rejected malformed event: {}", e);
                    metrics::record_event_rejected("malformed");
                    summary.rejected += 1;
                    continue;
                }
            };

            match self.buffer.append(event).await {
                Ok(_) => summary.accepted += 1,
                Err(e) => {
                    warn!("Failed to buffer event: {}", e);
                    summary.rejected += 1;
                }
            }
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rollup_common::config::StorageBackend;

    fn config() -> Config {
        let mut config = Config::default();
        config.storage.backend = StorageBackend::Memory;
        config.buffer.dir = None;
        config
    }

    #[tokio::test]
    async fn test_ingest_counts_accepted_and_rejected_lines() {
        let server = RollupServer::new(config()).unwrap();
        let input = concat!(
            r#"{"event_id":"e1","user_id":"u1","event_type":"view","timestamp":1000}"#,
            "\n\n",
            "not json\n",
            r#"{"event_type":"view"}"#,
            "\n",
            r#"{"partition_key":"u2","event_type":"click","properties":{"x":1}}"#,
            "\n",
        );

        let summary = server.ingest(BufReader::new(input.as_bytes())).await.unwrap();
        assert_eq!(summary, IngestSummary { accepted: 2, rejected: 2 });
        assert_eq!(server.buffer.partitions(), vec!["u1", "u2"]);
    }
}
