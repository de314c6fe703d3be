//! Per-stream record buffering.
//!
//! A [`StreamBuffer`] holds the current schema of one stream, validates
//! incoming records against it and accumulates them until the tracker drains
//! the buffer into a [`FlushedBatch`].

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Map, Value};
use tracing::{debug, warn};
use uuid::Uuid;

use crate::denest::{self, SEQUENCE_COLUMN};
use crate::error::StreamError;
use crate::message::RecordMessage;
use crate::schema::{self, CanonicalSchema};
use crate::validate::{JsonSchemaValidator, RecordValidator};

/// When the record entered the buffer.
pub const RECEIVED_AT_COLUMN: &str = "_sdc_received_at";
/// When the buffer holding the record was flushed.
pub const BATCHED_AT_COLUMN: &str = "_sdc_batched_at";
/// When the producer extracted the record.
pub const EXTRACTED_AT_COLUMN: &str = "_sdc_extracted_at";
/// Table version the record belongs to.
pub const TABLE_VERSION_COLUMN: &str = "_sdc_table_version";
/// Synthetic key of key-less streams.
pub const PRIMARY_KEY_COLUMN: &str = "_sdc_primary_key";

/// Fullness limits of a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferLimits {
    /// Row count at which the buffer is full.
    pub max_rows: usize,
    /// Estimated serialized size at which the buffer is full.
    pub max_bytes: usize,
}

impl Default for BufferLimits {
    fn default() -> Self {
        Self {
            max_rows: 200_000,
            max_bytes: 104_857_600,
        }
    }
}

/// How records failing validation are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidRecordPolicy {
    /// Escalate once more than `threshold` records are invalid.
    pub detect: bool,
    /// Invalid records tolerated before escalation.
    pub threshold: usize,
}

impl Default for InvalidRecordPolicy {
    fn default() -> Self {
        Self {
            detect: true,
            threshold: 0,
        }
    }
}

/// A record rejected by validation, kept for reporting.
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidRecord {
    /// The record as received.
    pub record: Value,
    /// Validation messages.
    pub errors: Vec<String>,
}

/// A record accepted into a buffer, already carrying its metadata columns.
#[derive(Debug, Clone, PartialEq)]
pub struct BufferedRecord {
    /// Augmented record.
    pub record: Value,
    /// Table version declared by the message.
    pub version: Option<i64>,
    /// Estimated serialized size.
    pub size_bytes: usize,
}

/// Contents of a drained buffer, ready for persistence.
#[derive(Debug, Clone)]
pub struct FlushedBatch {
    /// Stream name.
    pub stream: String,
    /// Canonical schema, including metadata columns.
    pub schema: CanonicalSchema,
    /// Key columns (the synthetic key for key-less streams).
    pub key_columns: Vec<String>,
    /// Records in arrival order.
    pub records: Vec<BufferedRecord>,
    /// Highest table version among the records.
    pub version: Option<i64>,
}

impl FlushedBatch {
    /// Whether the batch carries no records.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of records.
    pub fn len(&self) -> usize {
        self.records.len()
    }
}

/// Result of offering a record to a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// Buffered.
    Accepted,
    /// Dropped because a newer table version was already adopted.
    Stale,
    /// Rejected by validation and collected for reporting.
    Invalid,
}

/// Strictly increasing nanosecond clock used when messages carry no sequence.
#[derive(Debug, Default)]
struct SequenceClock {
    last: i64,
}

impl SequenceClock {
    fn next(&mut self) -> i64 {
        let now = Utc::now()
            .timestamp_nanos_opt()
            .unwrap_or(self.last.saturating_add(1));
        self.last = now.max(self.last.saturating_add(1));
        self.last
    }
}

/// Accumulates validated records for one stream.
pub struct StreamBuffer {
    stream: String,
    raw_schema: Value,
    schema: CanonicalSchema,
    declared_keys: Vec<String>,
    key_columns: Vec<String>,
    validator: Box<dyn RecordValidator>,
    limits: BufferLimits,
    policy: InvalidRecordPolicy,
    records: Vec<BufferedRecord>,
    byte_size: usize,
    max_version: Option<i64>,
    invalid_records: Vec<InvalidRecord>,
    clock: SequenceClock,
}

impl std::fmt::Debug for StreamBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamBuffer")
            .field("stream", &self.stream)
            .field("key_columns", &self.key_columns)
            .field("records", &self.records.len())
            .field("byte_size", &self.byte_size)
            .field("max_version", &self.max_version)
            .finish_non_exhaustive()
    }
}

impl StreamBuffer {
    /// Creates a buffer for `stream` with the given raw schema and keys.
    pub fn new(
        stream: impl Into<String>,
        raw_schema: &Value,
        key_properties: &[String],
        limits: BufferLimits,
        policy: InvalidRecordPolicy,
    ) -> Result<Self, StreamError> {
        let stream = stream.into();
        let prepared = prepare_schema(&stream, raw_schema, key_properties)?;
        Ok(Self {
            stream,
            raw_schema: raw_schema.clone(),
            schema: prepared.schema,
            declared_keys: key_properties.to_vec(),
            key_columns: prepared.key_columns,
            validator: Box::new(prepared.validator),
            limits,
            policy,
            records: Vec::new(),
            byte_size: 0,
            max_version: None,
            invalid_records: Vec::new(),
            clock: SequenceClock::default(),
        })
    }

    /// Replaces the schema and key columns. Re-applying the same schema is a
    /// no-op.
    pub fn update_schema(
        &mut self,
        raw_schema: &Value,
        key_properties: &[String],
    ) -> Result<(), StreamError> {
        if self.has_schema(raw_schema, key_properties) {
            return Ok(());
        }
        let prepared = prepare_schema(&self.stream, raw_schema, key_properties)?;
        self.raw_schema = raw_schema.clone();
        self.declared_keys = key_properties.to_vec();
        self.schema = prepared.schema;
        self.key_columns = prepared.key_columns;
        self.validator = Box::new(prepared.validator);
        debug!(stream = %self.stream, keys = ?self.key_columns, "stream schema updated");
        Ok(())
    }

    /// Whether `raw_schema` and `key_properties` match the current ones.
    pub fn has_schema(&self, raw_schema: &Value, key_properties: &[String]) -> bool {
        self.raw_schema == *raw_schema && self.declared_keys == key_properties
    }

    /// Validates, augments and buffers one record.
    pub fn add_record(
        &mut self,
        message: &RecordMessage,
        received_at: DateTime<Utc>,
    ) -> Result<AddOutcome, StreamError> {
        if self.is_full() {
            return Err(StreamError::BufferFull(self.stream.clone()));
        }

        if let (Some(version), Some(adopted)) = (message.version, self.max_version) {
            if version < adopted {
                debug!(stream = %self.stream, version, adopted, "dropping stale record");
                return Ok(AddOutcome::Stale);
            }
        }

        if let Err(errors) = self.validator.validate(&message.record) {
            return self.reject(message.record.clone(), errors);
        }
        let Value::Object(mut record) = message.record.clone() else {
            return Err(StreamError::RecordNotObject(self.stream.clone()));
        };

        record.insert(RECEIVED_AT_COLUMN.to_string(), timestamp(received_at));
        if let Some(extracted) = message.time_extracted {
            record.insert(EXTRACTED_AT_COLUMN.to_string(), timestamp(extracted));
        }
        let sequence = message.sequence.unwrap_or_else(|| self.clock.next());
        record.insert(SEQUENCE_COLUMN.to_string(), Value::from(sequence));
        if let Some(version) = message.version {
            record.insert(TABLE_VERSION_COLUMN.to_string(), Value::from(version));
        }
        if self.key_columns == [PRIMARY_KEY_COLUMN] && !record.contains_key(PRIMARY_KEY_COLUMN) {
            record.insert(
                PRIMARY_KEY_COLUMN.to_string(),
                Value::String(Uuid::new_v4().to_string()),
            );
        }

        let record = Value::Object(record);
        let size_bytes = serde_json::to_string(&record).map_or(0, |text| text.len());
        self.byte_size += size_bytes;
        self.max_version = self.max_version.max(message.version);
        self.records.push(BufferedRecord {
            record,
            version: message.version,
            size_bytes,
        });
        Ok(AddOutcome::Accepted)
    }

    fn reject(&mut self, record: Value, errors: Vec<String>) -> Result<AddOutcome, StreamError> {
        let sample = errors.first().cloned().unwrap_or_default();
        warn!(stream = %self.stream, error = %sample, "record failed validation");
        self.invalid_records.push(InvalidRecord { record, errors });

        if self.policy.detect && self.invalid_records.len() > self.policy.threshold {
            return Err(StreamError::InvalidRecords {
                stream: self.stream.clone(),
                count: self.invalid_records.len(),
                threshold: self.policy.threshold,
                sample,
            });
        }
        Ok(AddOutcome::Invalid)
    }

    /// Whether accepting a record of `version` requires flushing first, so a
    /// batch never mixes table versions.
    pub fn needs_flush_for(&self, version: Option<i64>) -> bool {
        if self.records.is_empty() {
            return false;
        }
        match (version, self.max_version) {
            (Some(version), Some(adopted)) => version > adopted,
            (Some(_), None) => true,
            (None, _) => false,
        }
    }

    /// Full once non-empty and at either limit.
    pub fn is_full(&self) -> bool {
        !self.records.is_empty()
            && (self.records.len() >= self.limits.max_rows
                || self.byte_size >= self.limits.max_bytes)
    }

    /// Buffered records, oldest first.
    pub fn peek(&self) -> &[BufferedRecord] {
        &self.records
    }

    /// Empties the buffer, stamping each record with the flush time.
    pub fn flush(&mut self) -> Vec<BufferedRecord> {
        let batched_at = timestamp(Utc::now());
        let mut records = std::mem::take(&mut self.records);
        for buffered in &mut records {
            if let Value::Object(record) = &mut buffered.record {
                record.insert(BATCHED_AT_COLUMN.to_string(), batched_at.clone());
            }
        }
        self.byte_size = 0;
        records
    }

    /// Empties the buffer into a batch carrying the schema and keys.
    pub fn drain_batch(&mut self) -> FlushedBatch {
        let records = self.flush();
        let version = records.iter().filter_map(|r| r.version).max();
        FlushedBatch {
            stream: self.stream.clone(),
            schema: self.schema.clone(),
            key_columns: self.key_columns.clone(),
            records,
            version,
        }
    }

    /// A record-less batch, used to create tables for idle streams.
    pub fn empty_batch(&self) -> FlushedBatch {
        FlushedBatch {
            stream: self.stream.clone(),
            schema: self.schema.clone(),
            key_columns: self.key_columns.clone(),
            records: Vec::new(),
            version: self.max_version,
        }
    }

    /// Stream name.
    pub fn stream(&self) -> &str {
        &self.stream
    }

    /// Canonical schema including metadata columns.
    pub fn schema(&self) -> &CanonicalSchema {
        &self.schema
    }

    /// Effective key columns.
    pub fn key_columns(&self) -> &[String] {
        &self.key_columns
    }

    /// Number of buffered records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Estimated serialized size of the buffered records.
    pub fn byte_size(&self) -> usize {
        self.byte_size
    }

    /// Highest table version adopted so far.
    pub fn max_version(&self) -> Option<i64> {
        self.max_version
    }

    /// Invalid records collected so far.
    pub fn invalid_records(&self) -> &[InvalidRecord] {
        &self.invalid_records
    }

    /// Takes the collected invalid records.
    pub fn take_invalid_records(&mut self) -> Vec<InvalidRecord> {
        std::mem::take(&mut self.invalid_records)
    }
}

struct PreparedSchema {
    schema: CanonicalSchema,
    key_columns: Vec<String>,
    validator: JsonSchemaValidator,
}

fn prepare_schema(
    stream: &str,
    raw_schema: &Value,
    key_properties: &[String],
) -> Result<PreparedSchema, StreamError> {
    let schema_error = |source| StreamError::Schema {
        stream: stream.to_string(),
        source,
    };

    let key_columns = if key_properties.is_empty() {
        vec![PRIMARY_KEY_COLUMN.to_string()]
    } else {
        key_properties.to_vec()
    };
    let augmented = with_metadata_properties(raw_schema, key_properties.is_empty());
    let schema = schema::normalize(&augmented).map_err(schema_error)?;
    let validator = JsonSchemaValidator::compile(raw_schema).map_err(schema_error)?;

    denest::table_schemas(&schema, &key_columns).map_err(|source| StreamError::Denest {
        stream: stream.to_string(),
        source,
    })?;

    Ok(PreparedSchema {
        schema,
        key_columns,
        validator,
    })
}

/// Adds the metadata columns to the schema's root properties. Properties the
/// schema already declares are left alone, so applying this twice is harmless.
fn with_metadata_properties(raw_schema: &Value, keyless: bool) -> Value {
    let mut document = raw_schema.clone();
    let Value::Object(root) = &mut document else {
        return document;
    };

    let timestamp = json!({"type": ["null", "string"], "format": "date-time"});
    let integer = json!({"type": ["null", "integer"]});
    let mut additions = vec![
        (RECEIVED_AT_COLUMN, timestamp.clone()),
        (BATCHED_AT_COLUMN, timestamp.clone()),
        (EXTRACTED_AT_COLUMN, timestamp),
        (SEQUENCE_COLUMN, integer.clone()),
        (TABLE_VERSION_COLUMN, integer),
    ];
    if keyless {
        additions.push((PRIMARY_KEY_COLUMN, json!({"type": "string"})));
    }

    let properties = root
        .entry("properties")
        .or_insert_with(|| Value::Object(Map::new()));
    if let Value::Object(properties) = properties {
        for (name, definition) in additions {
            properties.entry(name).or_insert(definition);
        }
    }
    document
}

fn timestamp(at: DateTime<Utc>) -> Value {
    Value::String(at.to_rfc3339_opts(SecondsFormat::Micros, true))
}
