//! Rollup - event ingestion and streaming aggregation
//!
//! Single binary that provides:
//! - `serve`: ingest newline-delimited JSON events and aggregate them
//! - `query`: print persisted aggregates as JSON
//! - `checkpoint`: show committed offsets per partition

#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

use rollup_common::config::TelemetryConfig;
use rollup_query::Granularity;

mod cli;
mod config;
mod server;

use server::{EventSource, RollupServer};

#[derive(Parser)]
#[command(name = "rollup")]
#[command(author, version, about = "Rollup - event ingestion and streaming aggregation", long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path (TOML or JSON)
    #[arg(short, long, global = true, default_value = "/etc/rollup/rollup.toml", env = "ROLLUP_CONFIG")]
    config: PathBuf,

    /// Durable store path, overrides `storage.path`
    #[arg(long, global = true, env = "ROLLUP_STORE_PATH")]
    store_path: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest events and run the aggregation pipeline
    Serve {
        /// Newline-delimited JSON events; stdin when omitted
        #[arg(short, long)]
        input: Option<PathBuf>,

        /// Consumer instance id, overrides `server.consumer_id`
        #[arg(long, env = "ROLLUP_CONSUMER_ID")]
        consumer_id: Option<String>,
    },

    /// Print aggregates of one partition and metric
    Query {
        /// Partition key (for example a user id)
        #[arg(short, long)]
        partition: String,

        /// Metric name; lists the partition's metrics when omitted
        #[arg(short, long)]
        metric: Option<String>,

        /// Range start, milliseconds since the epoch
        #[arg(long)]
        from: Option<i64>,

        /// Range end (exclusive), milliseconds since the epoch
        #[arg(long)]
        to: Option<i64>,

        /// Merge windows into minute, hour, day, week or month buckets
        #[arg(short, long)]
        granularity: Option<Granularity>,

        /// Only the most recent window
        #[arg(long, conflicts_with = "granularity")]
        realtime: bool,
    },

    /// Show committed checkpoints
    Checkpoint {
        /// Single partition; all partitions when omitted
        #[arg(short, long)]
        partition: Option<String>,
    },

    /// Show version information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if let Commands::Version = cli.command {
        println!("Rollup version {}", env!("CARGO_PKG_VERSION"));
        return Ok(());
    }

    let mut config = config::load(&cli.config).await?;
    if let Some(path) = cli.store_path {
        config.storage.path = path;
    }
    init_telemetry(&config.telemetry)?;

    match cli.command {
        Commands::Serve { input, consumer_id } => {
            if let Some(id) = consumer_id {
                config.server.consumer_id = id;
            }
            info!("Starting Rollup consumer {}...", config.server.consumer_id);

            let source = input.map_or(EventSource::Stdin, EventSource::File);
            let server = RollupServer::new(config)?;

            // Handle shutdown gracefully
            let shutdown = server.cancellation_token();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Shutdown signal received");
                    shutdown.cancel();
                }
            });

            server.run(source).await?;
        }

        Commands::Query {
            partition,
            metric,
            from,
            to,
            granularity,
            realtime,
        } => {
            let request = cli::QueryRequest {
                partition,
                metric,
                from,
                to,
                granularity,
                realtime,
            };
            cli::handle_query_command(&config, request).await?;
        }

        Commands::Checkpoint { partition } => {
            cli::handle_checkpoint_command(&config, partition.as_deref()).await?;
        }

        Commands::Version => {}
    }

    Ok(())
}

fn init_telemetry(config: &TelemetryConfig) -> Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_filter))
        .context("invalid log filter")?;

    // Logs go to stderr so `query` output stays machine readable
    if config.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    }

    if let Some(listen) = &config.prometheus_listen {
        let addr: std::net::SocketAddr = listen
            .parse()
            .with_context(|| format!("invalid prometheus listen address {listen}"))?;
        metrics_exporter_prometheus::PrometheusBuilder::new()
            .with_http_listener(addr)
            .install()
            .context("failed to install prometheus exporter")?;
        info!("Prometheus metrics on http://{}/metrics", addr);
    }

    Ok(())
}
