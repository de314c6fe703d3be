//! Sink configuration file.

use std::fs;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;
use tablesink_core::{BufferLimits, InvalidRecordPolicy};
use tablesink_sql::{EngineOptions, PostgresConnectionOptions};

use crate::error::SinkError;

/// Settings read from the JSON config passed with `--config`.
///
/// Every field but `target_url` has a default; unknown keys are ignored.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// `postgres://…` or `sqlite://…` DSN.
    pub target_url: String,
    /// Postgres schema holding every table.
    pub target_schema: String,
    /// Rows a stream buffers before it must flush.
    pub max_batch_rows: usize,
    /// Estimated bytes a stream buffers before it must flush.
    pub max_buffer_size: usize,
    /// Input lines between flush checks; derived from `max_batch_rows` when unset.
    pub batch_detection_threshold: Option<usize>,
    /// Escalate invalid records to a fatal error.
    pub invalid_records_detect: bool,
    /// Invalid records tolerated per stream before escalating.
    pub invalid_records_threshold: usize,
    /// Echo checkpoints to stdout.
    pub state_support: bool,
    /// Create tables for streams that never received a record.
    pub persist_empty_tables: bool,
    /// Index key and sequence columns on table creation.
    pub add_upsert_indexes: bool,
    /// SQL run before the first message.
    pub before_run_sql: Option<String>,
    /// SQL run after the final flush.
    pub after_run_sql: Option<String>,
    /// Default log filter when `RUST_LOG` is unset.
    pub logging_level: String,
    /// Connection pool size.
    pub max_connections: u32,
}

impl Default for SinkConfig {
    fn default() -> Self {
        let limits = BufferLimits::default();
        let policy = InvalidRecordPolicy::default();
        Self {
            target_url: String::new(),
            target_schema: "public".to_string(),
            max_batch_rows: limits.max_rows,
            max_buffer_size: limits.max_bytes,
            batch_detection_threshold: None,
            invalid_records_detect: policy.detect,
            invalid_records_threshold: policy.threshold,
            state_support: true,
            persist_empty_tables: false,
            add_upsert_indexes: true,
            before_run_sql: None,
            after_run_sql: None,
            logging_level: "info".to_string(),
            max_connections: 5,
        }
    }
}

impl SinkConfig {
    /// Reads and validates the config file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| SinkError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json(&raw)
    }

    /// Parses and validates a config document.
    pub fn from_json(raw: &str) -> Result<Self, SinkError> {
        let config: Self = serde_json::from_str(raw).map_err(SinkError::ConfigParse)?;
        config.validate()?;
        Ok(config)
    }

    /// Rejects settings the sink cannot run with.
    pub fn validate(&self) -> Result<(), SinkError> {
        if self.target_url.trim().is_empty() {
            return Err(SinkError::Config("target_url is required".into()));
        }
        if self.max_batch_rows == 0 {
            return Err(SinkError::Config("max_batch_rows must be positive".into()));
        }
        if self.max_buffer_size == 0 {
            return Err(SinkError::Config("max_buffer_size must be positive".into()));
        }
        if self.batch_detection_threshold == Some(0) {
            return Err(SinkError::Config(
                "batch_detection_threshold must be positive".into(),
            ));
        }
        if self.max_connections == 0 {
            return Err(SinkError::Config("max_connections must be positive".into()));
        }
        Ok(())
    }

    /// Lines between flush checks.
    pub fn batch_detection_threshold(&self) -> usize {
        self.batch_detection_threshold
            .unwrap_or_else(|| (self.max_batch_rows / 40).max(50))
    }

    /// Buffer limits for every stream.
    pub fn buffer_limits(&self) -> BufferLimits {
        BufferLimits {
            max_rows: self.max_batch_rows,
            max_bytes: self.max_buffer_size,
        }
    }

    /// Invalid record handling for every stream.
    pub fn invalid_record_policy(&self) -> InvalidRecordPolicy {
        InvalidRecordPolicy {
            detect: self.invalid_records_detect,
            threshold: self.invalid_records_threshold,
        }
    }

    /// Persistence engine switches.
    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            add_upsert_indexes: self.add_upsert_indexes,
        }
    }

    /// Postgres pool settings.
    pub fn postgres_options(&self) -> PostgresConnectionOptions {
        PostgresConnectionOptions {
            max_connections: self.max_connections,
            connect_timeout: Duration::from_secs(5),
        }
    }
}
