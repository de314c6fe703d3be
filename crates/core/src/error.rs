//! Error types for schema, message and stream handling.
//!
//! **Error Hierarchy:**
//! - `MessageError` (input lines that cannot be decoded)
//! - `SchemaError` (schema documents that cannot be normalized)
//! - `DenestError` (records or schemas that cannot be split into tables)
//! - `StreamError` (per-stream buffering and tracking failures)
//!
//! Every variant here is fatal for the run except where the caller decides
//! otherwise; invalid records only become a `StreamError` once the configured
//! threshold is exceeded.

use thiserror::Error;

use crate::message::MessageKind;

/// Errors raised while reducing a raw schema document to its canonical form.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    /// A schema (or sub-schema) was not a JSON object.
    #[error("schema at {pointer} is not an object")]
    NotAnObject {
        /// JSON pointer of the offending location.
        pointer: String,
    },

    /// A `$ref` pointed outside the document or at a missing location.
    #[error("unresolved reference '{0}'")]
    UnresolvedReference(String),

    /// A chain of `$ref`s loops back onto itself.
    #[error("cyclic reference '{reference}' (chain: {})", chain.join(" -> "))]
    CyclicReference {
        /// Reference that closed the loop.
        reference: String,
        /// References being resolved when the loop was found, outermost first.
        chain: Vec<String>,
    },

    /// The document declares a `$schema` draft we do not understand.
    #[error("unsupported schema draft '{0}'")]
    UnsupportedDraft(String),

    /// A keyword carried a value of the wrong shape.
    #[error("invalid '{keyword}' at {pointer}: {reason}")]
    InvalidKeyword {
        /// JSON pointer of the schema carrying the keyword.
        pointer: String,
        /// Keyword name.
        keyword: &'static str,
        /// What was wrong with it.
        reason: String,
    },

    /// The validator could not compile the document.
    #[error("schema cannot be compiled for validation: {0}")]
    Validator(String),
}

impl SchemaError {
    /// Create an invalid keyword error
    pub fn invalid_keyword(
        pointer: impl Into<String>,
        keyword: &'static str,
        reason: impl Into<String>,
    ) -> Self {
        Self::InvalidKeyword {
            pointer: pointer.into(),
            keyword,
            reason: reason.into(),
        }
    }
}

/// Errors raised while splitting records into root and child table rows.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum DenestError {
    /// A declared key column is not a property of the stream schema.
    #[error("key column '{0}' is not declared in the schema")]
    MissingKeyColumn(String),

    /// A record did not carry a value for one of its key columns.
    #[error("record is missing a value for key column '{0}'")]
    MissingKeyValue(String),

    /// A record was not a JSON object.
    #[error("record is not an object")]
    NotAnObject,
}

/// Errors raised while decoding an input line into a message.
#[derive(Error, Debug)]
pub enum MessageError {
    /// The line was not valid JSON.
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),

    /// The line was JSON but not an object.
    #[error("message is not an object")]
    NotAnObject,

    /// The `type` discriminator named a kind we do not handle.
    #[error("unknown message type '{0}'")]
    UnknownKind(String),

    /// A required field was absent or null.
    #[error("{kind} message is missing required field '{field}'")]
    MissingField {
        /// Kind of the message being decoded.
        kind: MessageKind,
        /// Name of the absent field.
        field: &'static str,
    },

    /// A field was present but had the wrong type.
    #[error("invalid field '{field}': {reason}")]
    InvalidField {
        /// Name of the field.
        field: &'static str,
        /// What was wrong with it.
        reason: String,
    },
}

/// Errors raised by stream buffers and the stream tracker.
#[derive(Error, Debug)]
pub enum StreamError {
    /// A record or activation referenced a stream with no prior schema.
    #[error("stream '{0}' has not been registered by a schema message")]
    UnregisteredStream(String),

    /// A record was offered to a buffer that is already full.
    #[error("buffer for stream '{0}' is full")]
    BufferFull(String),

    /// Too many records failed validation.
    #[error("stream '{stream}' has {count} invalid records (threshold {threshold}); first error: {sample}")]
    InvalidRecords {
        /// Stream name.
        stream: String,
        /// Invalid records collected so far.
        count: usize,
        /// Configured tolerance.
        threshold: usize,
        /// First validation message of the most recent failure.
        sample: String,
    },

    /// A record passed validation but is not an object.
    #[error("stream '{0}' received a record that is not an object")]
    RecordNotObject(String),

    /// The stream schema could not be normalized.
    #[error("stream '{stream}': {source}")]
    Schema {
        /// Stream name.
        stream: String,
        /// Underlying schema error.
        #[source]
        source: SchemaError,
    },

    /// The stream schema and key columns are inconsistent.
    #[error("stream '{stream}': {source}")]
    Denest {
        /// Stream name.
        stream: String,
        /// Underlying denest error.
        #[source]
        source: DenestError,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cyclic_reference_message() {
        let err = SchemaError::CyclicReference {
            reference: "#/definitions/a".to_string(),
            chain: vec!["#/definitions/a".to_string(), "#/definitions/b".to_string()],
        };
        assert_eq!(
            err.to_string(),
            "cyclic reference '#/definitions/a' (chain: #/definitions/a -> #/definitions/b)"
        );
    }

    #[test]
    fn missing_field_message() {
        let err = MessageError::MissingField {
            kind: MessageKind::Record,
            field: "stream",
        };
        assert_eq!(
            err.to_string(),
            "RECORD message is missing required field 'stream'"
        );
    }

    #[test]
    fn malformed_conversion() {
        let json_err = serde_json::from_str::<serde_json::Value>("{").unwrap_err();
        let err: MessageError = json_err.into();
        assert!(err.to_string().starts_with("malformed message"));
    }
}
