//! Configuration management for Rollup

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use tracing::info;

use crate::error::{Error, Result};

/// Main configuration structure for Rollup
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Process identity and data directory
    #[serde(default)]
    pub server: ServerConfig,

    /// Ingestion buffer configuration
    #[serde(default)]
    pub buffer: BufferConfig,

    /// Aggregation engine configuration
    #[serde(default)]
    pub aggregation: AggregationConfig,

    /// Storage retry policy
    #[serde(default)]
    pub retry: RetryConfig,

    /// Checkpoint and lease configuration
    #[serde(default)]
    pub checkpoint: CheckpointConfig,

    /// Durable store configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Logging and metrics export
    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl Config {
    /// Load configuration from a TOML/JSON file
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = tokio::fs::read_to_string(path.as_ref())
            .await
            .map_err(|e| Error::Config(format!("Failed to read config file: {}", e)))?;

        let config: Config = if path.as_ref().extension().map_or(false, |ext| ext == "toml") {
            toml::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse TOML config: {}", e)))?
        } else {
            serde_json::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse JSON config: {}", e)))?
        };

        config.validate()?;
        info!(
            "Loaded configuration from {} ({} metrics)",
            path.as_ref().display(),
            config.aggregation.metrics.len()
        );
        Ok(config)
    }

    /// Reject settings the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.aggregation.window_size_ms <= 0 {
            return Err(Error::Config("aggregation.window_size_ms must be positive".into()));
        }
        if self.aggregation.allowed_lateness_ms < 0 {
            return Err(Error::Config("aggregation.allowed_lateness_ms must not be negative".into()));
        }
        if self.aggregation.metrics.is_empty() {
            return Err(Error::Config("aggregation.metrics must name at least one metric".into()));
        }
        let mut names = HashSet::new();
        for metric in &self.aggregation.metrics {
            metric.validate()?;
            // Metrics share the agg/{partition}/{metric} key space
            if !names.insert(metric.name.as_str()) {
                return Err(Error::Config(format!("duplicate metric name: {}", metric.name)));
            }
        }
        if self.buffer.max_records == 0 || self.buffer.max_bytes == 0 {
            return Err(Error::Config("buffer limits must be positive".into()));
        }
        if self.retry.max_attempts == 0 {
            return Err(Error::Config("retry.max_attempts must be at least 1".into()));
        }
        if self.checkpoint.lease_renew_interval_ms >= self.checkpoint.lease_ttl_ms {
            return Err(Error::Config(
                "checkpoint.lease_renew_interval_ms must be shorter than lease_ttl_ms".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Identity used as lease owner and buffer consumer id
    pub consumer_id: String,
    /// Data directory
    pub data_dir: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            consumer_id: format!("rollup-{}", std::process::id()),
            data_dir: "/var/lib/rollup".to_string(),
        }
    }
}

/// What `append` does when the buffer is full
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackpressureMode {
    /// Fail immediately with `CapacityExceeded`
    FailFast,
    /// Wait up to `block_timeout_ms` for space
    Block,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BufferConfig {
    /// Maximum number of retained events across all partitions
    pub max_records: usize,
    /// Maximum retained bytes across all partitions
    pub max_bytes: usize,
    /// Events per segment before rolling
    pub segment_max_records: usize,
    /// Bytes per segment before rolling
    pub segment_max_bytes: usize,
    /// Full-buffer behaviour
    pub backpressure: BackpressureMode,
    /// Wait limit in `Block` mode
    pub block_timeout_ms: u64,
    /// Segment files directory; in-memory only when unset
    pub dir: Option<String>,
    /// fsync each append
    pub fsync: bool,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            max_records: 1_000_000,
            max_bytes: 256 * 1024 * 1024, // 256MB
            segment_max_records: 10_000,
            segment_max_bytes: 8 * 1024 * 1024, // 8MB
            backpressure: BackpressureMode::FailFast,
            block_timeout_ms: 5_000,
            dir: None,
            fsync: true,
        }
    }
}

/// Combine function of a metric
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CombineKind {
    Count,
    Sum,
    Min,
    Max,
    Distinct,
}

impl CombineKind {
    /// Functions that tolerate redelivery without deduplication
    pub fn is_idempotent(self) -> bool {
        matches!(self, CombineKind::Min | CombineKind::Max | CombineKind::Distinct)
    }
}

/// One configured metric
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricSpec {
    pub name: String,
    pub function: CombineKind,
    /// Property read by the combine function (unused by `count`)
    #[serde(default)]
    pub field: Option<String>,
    /// Only events of this type contribute
    #[serde(default)]
    pub event_type: Option<String>,
}

impl MetricSpec {
    pub fn count(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            function: CombineKind::Count,
            field: None,
            event_type: None,
        }
    }

    pub fn over(name: impl Into<String>, function: CombineKind, field: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            function,
            field: Some(field.into()),
            event_type: None,
        }
    }

    pub fn for_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = Some(event_type.into());
        self
    }

    fn validate(&self) -> Result<()> {
        if self.name.is_empty() || self.name.contains('/') {
            return Err(Error::Config(format!("invalid metric name: {:?}", self.name)));
        }
        if self.function != CombineKind::Count && self.field.is_none() {
            return Err(Error::Config(format!(
                "metric {} needs a field for {:?}",
                self.name, self.function
            )));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AggregationConfig {
    /// Tumbling window size
    pub window_size_ms: i64,
    /// Grace period after window end
    pub allowed_lateness_ms: i64,
    /// Recently-seen event ids kept per window for deduplication
    pub dedup_capacity: usize,
    /// Events per consumer batch (one in-flight batch per partition)
    pub max_batch_records: usize,
    /// Consumer idle poll interval
    pub poll_interval_ms: u64,
    /// Interval between partition discovery sweeps
    pub discovery_interval_ms: u64,
    /// Configured metrics
    pub metrics: Vec<MetricSpec>,
}

impl Default for AggregationConfig {
    fn default() -> Self {
        Self {
            window_size_ms: 60_000,
            allowed_lateness_ms: 0,
            dedup_capacity: 10_000,
            max_batch_records: 500,
            poll_interval_ms: 100,
            discovery_interval_ms: 500,
            metrics: vec![MetricSpec::count("event_count")],
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts including the first
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub backoff_multiplier: f64,
    /// Per-attempt timeout
    pub attempt_timeout_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff_ms: 50,
            max_backoff_ms: 2_000,
            backoff_multiplier: 2.0,
            attempt_timeout_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Lease lifetime without renewal
    pub lease_ttl_ms: i64,
    /// Renewal cadence, must be below the TTL
    pub lease_renew_interval_ms: i64,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            lease_ttl_ms: 30_000,
            lease_renew_interval_ms: 10_000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    Memory,
    Sled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    /// Path to the sled database
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::Sled,
            path: "/var/lib/rollup/store".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub log_filter: String,
    /// Emit JSON logs
    pub json_logs: bool,
    /// Address for the Prometheus scrape endpoint
    pub prometheus_listen: Option<String>,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            log_filter: "rollup=info".to_string(),
            json_logs: false,
            prometheus_listen: None,
        }
    }
}
