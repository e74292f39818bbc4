//! Read-only CLI commands

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::Serialize;

use rollup_aggregation::{CheckpointManager, RetryPolicy, SystemClock};
use rollup_common::config::Config;
use rollup_common::types::TimeRange;
use rollup_query::{Granularity, QuerySurface};
use rollup_storage::open_store;

pub struct QueryRequest {
    pub partition: String,
    pub metric: Option<String>,
    pub from: Option<i64>,
    pub to: Option<i64>,
    pub granularity: Option<Granularity>,
    pub realtime: bool,
}

impl QueryRequest {
    fn range(&self) -> TimeRange {
        let all = TimeRange::all();
        TimeRange::new(self.from.unwrap_or(all.start), self.to.unwrap_or(all.end))
    }
}

/// Handle `rollup query`
pub async fn handle_query_command(config: &Config, request: QueryRequest) -> Result<()> {
    let store = open_store(&config.storage).context("failed to open durable store")?;
    let surface = QuerySurface::new(store, &config.aggregation, Arc::new(SystemClock))?
        .with_retry(RetryPolicy::from(&config.retry));

    let Some(metric) = request.metric.as_deref() else {
        return print_json(&surface.list_metrics(&request.partition).await?);
    };

    if request.realtime {
        return print_json(&surface.get_realtime(&request.partition, metric).await?);
    }

    match request.granularity {
        Some(granularity) => print_json(
            &surface
                .rollup(&request.partition, metric, request.range(), granularity)
                .await?,
        ),
        None => print_json(
            &surface
                .get_aggregate(&request.partition, metric, request.range())
                .await?,
        ),
    }
}

/// Handle `rollup checkpoint`
pub async fn handle_checkpoint_command(config: &Config, partition: Option<&str>) -> Result<()> {
    let store = open_store(&config.storage).context("failed to open durable store")?;
    let checkpoints =
        CheckpointManager::new(store, Arc::new(SystemClock), RetryPolicy::from(&config.retry));

    match partition {
        Some(partition) => print_json(&checkpoints.load(partition).await?),
        None => print_json(&checkpoints.list().await?),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
