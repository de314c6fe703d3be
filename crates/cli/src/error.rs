use std::io;
use std::path::PathBuf;

use tablesink_core::{MessageError, StreamError};
use tablesink_sql::{SqlError, TargetUriError};
use thiserror::Error;

/// Fatal errors that abort a run.
#[derive(Debug, Error)]
pub enum SinkError {
    /// Config file could not be read.
    #[error("failed to read config {}: {source}", path.display())]
    ConfigRead {
        /// Config path.
        path: PathBuf,
        /// Underlying error.
        source: io::Error,
    },
    /// Config file is not valid JSON for the expected layout.
    #[error("failed to parse config: {0}")]
    ConfigParse(serde_json::Error),
    /// Config values are unusable.
    #[error("invalid config: {0}")]
    Config(String),
    /// Target DSN is unusable.
    #[error(transparent)]
    Target(#[from] TargetUriError),
    /// An input line could not be decoded.
    #[error("input line {line}: {source}")]
    Message {
        /// 1-based line number.
        line: u64,
        /// Decoding error.
        source: MessageError,
    },
    /// Stream state error (unknown stream, invalid records, bad schema).
    #[error(transparent)]
    Stream(#[from] StreamError),
    /// Persistence failure.
    #[error(transparent)]
    Sql(#[from] SqlError),
    /// Reading input or writing checkpoints failed.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}
