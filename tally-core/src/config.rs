//! Pipeline configuration.
//!
//! Loaded from a `toml` file. Every field has a default, so an empty file is a valid
//! config for a local word-count run.
//!
//! Examples:
//!
//! ```toml
//! [source]
//! feed = ["resources/words.txt"]
//! consumer_group = "tally"
//!
//! [pipeline]
//! partition_count = 8
//! sink_writers = 2
//!
//! [sink]
//! store = "file"
//! path = "/tmp/tally.rows"
//! flush_threshold = 1000
//! ```
use std::collections::BTreeMap;
use std::time::Duration;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

use crate::error_bail;

/// Which topology to run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Display, EnumString, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PipelineKind {
    /// Source -> normalizer -> aggregator -> sink writer.
    #[default]
    WordCount,

    /// Source -> field row transform -> sink writer.
    FieldRows,
}

/// Where the stages run.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Display, EnumString, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum DeploymentMode {
    /// All stages in this process.
    #[default]
    Local,

    /// Stages placed by an external coordinator.
    Distributed,
}

/// Sink store backend.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Display, EnumString, Deserialize, Serialize)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum StoreKind {
    #[default]
    Memory,

    /// Log every row.
    Log,

    /// Append rows to a local file.
    File,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Feed identifier. For the local feed, the files to read.
    pub feed: Vec<String>,

    pub consumer_group: String,

    /// Read the feed from the beginning, or only what arrives after it is opened.
    pub start_from_beginning: bool,

    /// How many times a failed record is redelivered before the source gives up on it.
    pub max_redeliveries: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            feed: Vec::new(),
            consumer_group: "tally".to_string(),
            start_from_beginning: true,
            max_redeliveries: 3,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct StageConfig {
    pub kind: PipelineKind,

    /// Number of aggregator partitions. Fixed for the lifetime of the pipeline.
    pub partition_count: usize,

    /// Number of normalizer (or field row) workers sharing the source queue.
    pub normalizer_workers: usize,

    /// Number of sink writer instances.
    pub sink_writers: usize,

    /// Capacity of every inter-stage queue.
    pub queue_capacity: usize,

    /// Attempts per routing or flush before the affected records are failed.
    pub retry_budget: u32,

    /// Base of the exponential backoff between retries.
    pub retry_backoff_ms: u64,

    /// Deadline for draining and the final flush once shutdown is requested.
    pub shutdown_timeout_ms: u64,

    pub mode: DeploymentMode,

    /// Required in distributed mode.
    pub coordinator_endpoint: Option<String>,
}

impl Default for StageConfig {
    fn default() -> Self {
        Self {
            kind: PipelineKind::WordCount,
            partition_count: 4,
            normalizer_workers: num_cpus::get(),
            sink_writers: 2,
            queue_capacity: 256,
            retry_budget: 3,
            retry_backoff_ms: 100,
            shutdown_timeout_ms: 5000,
            mode: DeploymentMode::Local,
            coordinator_endpoint: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct SinkConfig {
    pub store: StoreKind,

    /// Output file of the file store.
    pub path: Option<String>,

    /// Column family of count rows.
    pub family: String,

    /// Buffer length that triggers a flush.
    pub flush_threshold: usize,

    /// Flush a non-empty buffer at least this often. `0` disables the timer.
    pub flush_interval_ms: u64,

    /// Timeout of one write call to the store.
    pub flush_timeout_ms: u64,

    /// Max rows the store accepts per write call.
    pub max_batch_rows: usize,

    /// Log throughput every `log_every` appended entries. `0` disables it.
    pub log_every: u64,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            store: StoreKind::Memory,
            path: None,
            family: "wc".to_string(),
            flush_threshold: 1000,
            flush_interval_ms: 1000,
            flush_timeout_ms: 3000,
            max_batch_rows: 1000,
            log_every: 20000,
        }
    }
}

impl SinkConfig {
    pub fn flush_interval(&self) -> Option<Duration> {
        if self.flush_interval_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.flush_interval_ms))
        }
    }

    #[inline]
    pub fn flush_timeout(&self) -> Duration {
        Duration::from_millis(self.flush_timeout_ms)
    }
}

/// Layout of the field row topology.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct FieldRowConfig {
    pub family: String,

    /// Fields joined by `key_separator` to build the row key.
    pub key_fields: Vec<String>,

    pub key_separator: String,

    /// Columns of the row, in order. A column is read from the json field of the same
    /// name unless `columns` maps it to another one.
    pub fields: Vec<String>,

    /// Column name to json field, e.g. `senProv = "senProvCode"`.
    pub columns: BTreeMap<String, String>,
}

impl FieldRowConfig {
    /// Json field holding the value of `column`.
    pub fn json_field<'a>(&'a self, column: &'a str) -> &'a str {
        self.columns.get(column).map_or(column, |f| f.as_str())
    }
}

impl Default for FieldRowConfig {
    fn default() -> Self {
        let fields = [
            "mailType",
            "weight",
            "senAreaCode",
            "recAreaCode",
            "senCityCode",
            "recCityCode",
            "senProv",
            "senCity",
            "senCountyCode",
            "senAddress",
            "senName",
            "senMobile",
            "senPhone",
            "recProvCode",
            "recCity",
            "recCountyCode",
            "recAddress",
            "recName",
            "recMobile",
            "recPhone",
            "typeOfContents",
            "nameOfCoutents",
            "mailCode",
            "recDatetime",
            "insuranceValue",
        ];

        Self {
            family: "info".to_string(),
            key_fields: vec!["logisticProviderID".to_string(), "mailNo".to_string()],
            key_separator: ":".to_string(),
            fields: fields.iter().map(|f| f.to_string()).collect(),
            columns: BTreeMap::from([("senProv".to_string(), "senProvCode".to_string())]),
        }
    }
}

/// Whole config file.
#[derive(Debug, Default, Clone, PartialEq, Deserialize, Serialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub source: SourceConfig,
    pub pipeline: StageConfig,
    pub sink: SinkConfig,
    pub field_rows: FieldRowConfig,
}

impl PipelineConfig {
    /// Parse from a `toml` file and validate.
    pub fn from_config_file(filename: &str) -> Result<Self> {
        let content = match std::fs::read_to_string(filename) {
            Ok(content) => content,
            Err(e) => {
                error_bail!("Failed to read config file, filename: {}, error: {}", filename, e);
            }
        };

        Self::from_config_str(&content)
    }

    /// Parse from a `toml` string and validate.
    pub fn from_config_str(content: &str) -> Result<Self> {
        let config: PipelineConfig = match toml::from_str(content) {
            Ok(config) => config,
            Err(e) => {
                error_bail!("Invalid config: {}", e);
            }
        };

        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let stage = &self.pipeline;

        if stage.partition_count == 0 {
            error_bail!("pipeline.partition_count must be positive");
        }

        if stage.normalizer_workers == 0 {
            error_bail!("pipeline.normalizer_workers must be positive");
        }

        if stage.sink_writers == 0 {
            error_bail!("pipeline.sink_writers must be positive");
        }

        if stage.queue_capacity == 0 {
            error_bail!("pipeline.queue_capacity must be positive");
        }

        if stage.retry_budget == 0 {
            error_bail!("pipeline.retry_budget must be positive");
        }

        if stage.mode == DeploymentMode::Distributed
            && stage
                .coordinator_endpoint
                .as_ref()
                .map_or(true, |e| e.trim().is_empty())
        {
            error_bail!("pipeline.coordinator_endpoint is required in distributed mode");
        }

        let sink = &self.sink;

        if sink.flush_threshold == 0 {
            error_bail!("sink.flush_threshold must be positive");
        }

        if sink.flush_threshold > sink.max_batch_rows {
            error_bail!(
                "sink.flush_threshold must not exceed sink.max_batch_rows, flush_threshold: {}, max_batch_rows: {}",
                sink.flush_threshold,
                sink.max_batch_rows
            );
        }

        if sink.store == StoreKind::File && sink.path.is_none() {
            error_bail!("sink.path is required for the file store");
        }

        if self.pipeline.kind == PipelineKind::FieldRows && self.field_rows.key_fields.is_empty() {
            error_bail!("field_rows.key_fields must not be empty");
        }

        Ok(())
    }

    #[inline]
    pub fn retry_backoff(&self) -> Duration {
        Duration::from_millis(self.pipeline.retry_backoff_ms)
    }

    #[inline]
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.pipeline.shutdown_timeout_ms)
    }
}
