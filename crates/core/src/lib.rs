//! tablesink-core
//!
//! Message decoding, schema normalization, denesting and the buffered stream
//! state machine of the tablesink relational sink. Nothing here touches a
//! database; flushed batches are handed to `tablesink-sql` for persistence.

#![warn(missing_docs)]

pub mod buffer;
pub mod denest;
mod error;
pub mod message;
mod path;
pub mod schema;
pub mod tracker;
pub mod validate;

pub use buffer::{
    AddOutcome, BufferLimits, BufferedRecord, FlushedBatch, InvalidRecord, InvalidRecordPolicy,
    StreamBuffer,
};
pub use denest::{
    to_table_batches, DenestedRow, LeafKind, LeafType, TableBatch, TableSchema,
};
pub use error::{DenestError, MessageError, SchemaError, StreamError};
pub use message::{
    ActivateVersionMessage, Message, MessageKind, RecordMessage, SchemaMessage, StateMessage,
};
pub use path::{FieldPath, SEPARATOR};
pub use schema::{normalize, CanonicalSchema, Kind, Shape};
pub use tracker::{CheckpointQueueEntry, StreamTracker};
pub use validate::{JsonSchemaValidator, RecordValidator};
