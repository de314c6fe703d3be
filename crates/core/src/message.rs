//! Line-delimited input messages.
//!
//! Each input line is one JSON object whose `type` field selects one of four
//! kinds. Decoding is strict: unknown kinds and missing required fields are
//! errors rather than silently ignored lines.

use std::fmt;

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};

use crate::error::MessageError;

/// Discriminator of an input message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Stream registration or schema update.
    Schema,
    /// A single data record.
    Record,
    /// Full-table-replacement cutover marker.
    ActivateVersion,
    /// Opaque checkpoint marker.
    State,
}

impl MessageKind {
    /// Wire spelling of the kind.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Schema => "SCHEMA",
            MessageKind::Record => "RECORD",
            MessageKind::ActivateVersion => "ACTIVATE_VERSION",
            MessageKind::State => "STATE",
        }
    }

    /// Parses the wire spelling.
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "SCHEMA" => Some(MessageKind::Schema),
            "RECORD" => Some(MessageKind::Record),
            "ACTIVATE_VERSION" => Some(MessageKind::ActivateVersion),
            "STATE" => Some(MessageKind::State),
            _ => None,
        }
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Registers a stream or replaces its schema.
#[derive(Debug, Clone, PartialEq)]
pub struct SchemaMessage {
    /// Stream name.
    pub stream: String,
    /// Raw schema document.
    pub schema: Value,
    /// Key column names; empty for key-less streams.
    pub key_properties: Vec<String>,
}

/// One data record.
#[derive(Debug, Clone, PartialEq)]
pub struct RecordMessage {
    /// Stream name.
    pub stream: String,
    /// Nested record payload.
    pub record: Value,
    /// Table version the record belongs to.
    pub version: Option<i64>,
    /// Producer-assigned ordering value.
    pub sequence: Option<i64>,
    /// When the producer extracted the record.
    pub time_extracted: Option<DateTime<Utc>>,
}

/// Requests a cutover to a fully built table version.
#[derive(Debug, Clone, PartialEq)]
pub struct ActivateVersionMessage {
    /// Stream name.
    pub stream: String,
    /// Version to activate.
    pub version: i64,
}

/// Opaque checkpoint payload.
#[derive(Debug, Clone, PartialEq)]
pub struct StateMessage {
    /// Payload, echoed verbatim once safe.
    pub value: Value,
}

/// A decoded input line.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    /// See [`SchemaMessage`].
    Schema(SchemaMessage),
    /// See [`RecordMessage`].
    Record(RecordMessage),
    /// See [`ActivateVersionMessage`].
    ActivateVersion(ActivateVersionMessage),
    /// See [`StateMessage`].
    State(StateMessage),
}

impl Message {
    /// Kind of this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Schema(_) => MessageKind::Schema,
            Message::Record(_) => MessageKind::Record,
            Message::ActivateVersion(_) => MessageKind::ActivateVersion,
            Message::State(_) => MessageKind::State,
        }
    }

    /// Decodes one input line.
    pub fn parse(line: &str) -> Result<Self, MessageError> {
        let Value::Object(object) = serde_json::from_str::<Value>(line)? else {
            return Err(MessageError::NotAnObject);
        };

        let kind = match object.get("type") {
            Some(Value::String(name)) => {
                MessageKind::parse(name).ok_or_else(|| MessageError::UnknownKind(name.clone()))?
            }
            Some(other) => {
                return Err(MessageError::InvalidField {
                    field: "type",
                    reason: format!("expected a string, found {other}"),
                })
            }
            None => {
                return Err(MessageError::InvalidField {
                    field: "type",
                    reason: "message has no type".to_string(),
                })
            }
        };

        let mut fields = Fields { kind, object };
        let message = match kind {
            MessageKind::Schema => Message::Schema(SchemaMessage {
                stream: fields.required_string("stream")?,
                schema: fields.required("schema")?,
                key_properties: fields.string_list("key_properties")?,
            }),
            MessageKind::Record => Message::Record(RecordMessage {
                stream: fields.required_string("stream")?,
                record: fields.required("record")?,
                version: fields.optional_integer("version")?,
                sequence: fields.optional_integer("sequence")?,
                time_extracted: fields.optional_timestamp("time_extracted")?,
            }),
            MessageKind::ActivateVersion => {
                let stream = fields.required_string("stream")?;
                let version = fields
                    .optional_integer("version")?
                    .ok_or(MessageError::MissingField {
                        kind,
                        field: "version",
                    })?;
                Message::ActivateVersion(ActivateVersionMessage { stream, version })
            }
            MessageKind::State => Message::State(StateMessage {
                value: fields.required("value")?,
            }),
        };
        Ok(message)
    }
}

struct Fields {
    kind: MessageKind,
    object: Map<String, Value>,
}

impl Fields {
    fn required(&mut self, field: &'static str) -> Result<Value, MessageError> {
        match self.object.remove(field) {
            None | Some(Value::Null) => Err(MessageError::MissingField {
                kind: self.kind,
                field,
            }),
            Some(value) => Ok(value),
        }
    }

    fn required_string(&mut self, field: &'static str) -> Result<String, MessageError> {
        match self.required(field)? {
            Value::String(value) => Ok(value),
            other => Err(MessageError::InvalidField {
                field,
                reason: format!("expected a string, found {other}"),
            }),
        }
    }

    fn string_list(&mut self, field: &'static str) -> Result<Vec<String>, MessageError> {
        match self.object.remove(field) {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::Array(entries)) => entries
                .into_iter()
                .map(|entry| match entry {
                    Value::String(name) => Ok(name),
                    other => Err(MessageError::InvalidField {
                        field,
                        reason: format!("entries must be strings, found {other}"),
                    }),
                })
                .collect(),
            Some(other) => Err(MessageError::InvalidField {
                field,
                reason: format!("expected an array, found {other}"),
            }),
        }
    }

    fn optional_integer(&mut self, field: &'static str) -> Result<Option<i64>, MessageError> {
        match self.object.remove(field) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::Number(number)) => number.as_i64().map(Some).ok_or_else(|| {
                MessageError::InvalidField {
                    field,
                    reason: format!("expected an integer, found {number}"),
                }
            }),
            Some(other) => Err(MessageError::InvalidField {
                field,
                reason: format!("expected an integer, found {other}"),
            }),
        }
    }

    fn optional_timestamp(
        &mut self,
        field: &'static str,
    ) -> Result<Option<DateTime<Utc>>, MessageError> {
        match self.object.remove(field) {
            None | Some(Value::Null) => Ok(None),
            Some(Value::String(text)) => DateTime::parse_from_rfc3339(&text)
                .map(|parsed| Some(parsed.with_timezone(&Utc)))
                .map_err(|e| MessageError::InvalidField {
                    field,
                    reason: format!("'{text}' is not an RFC 3339 timestamp: {e}"),
                }),
            Some(other) => Err(MessageError::InvalidField {
                field,
                reason: format!("expected a timestamp string, found {other}"),
            }),
        }
    }
}
