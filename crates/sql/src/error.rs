//! Error types for SQL operations

use tablesink_core::{DenestError, LeafKind};
use thiserror::Error;

use crate::uri::TargetUriError;

/// Result type for SQL operations
pub type SqlResult<T> = Result<T, SqlError>;

/// Errors that can occur during SQL operations
#[derive(Error, Debug)]
pub enum SqlError {
    /// Connection error
    #[error("Database connection error: {0}")]
    ConnectionError(String),

    /// Query execution error
    #[error("Query execution error: {0}")]
    QueryError(String),

    /// Migration error
    #[error("Migration error: {0}")]
    MigrationError(String),

    /// A non-nullable column must be added but no safe default exists
    #[error("cannot add non-nullable column '{column}' to '{table}': no default can be derived")]
    MissingDefault {
        /// Physical table name
        table: String,
        /// Physical column name
        column: String,
    },

    /// A key column started arriving with a different kind
    #[error("key column '{column}' of '{table}' changed from {existing:?} to {incoming:?}")]
    KeyColumnTypeChanged {
        /// Physical table name
        table: String,
        /// Logical column path
        column: String,
        /// Kind stored remotely
        existing: LeafKind,
        /// Kind of the incoming schema
        incoming: LeafKind,
    },

    /// The set of key columns of an existing table changed
    #[error("key columns of '{table}' changed from {existing:?} to {incoming:?}")]
    KeyColumnsChanged {
        /// Physical table name
        table: String,
        /// Key columns stored remotely
        existing: Vec<String>,
        /// Key columns of the incoming schema
        incoming: Vec<String>,
    },

    /// Remote table metadata could not be read or understood
    #[error("Metadata error for '{table}': {message}")]
    MetadataError {
        /// Physical table name
        table: String,
        /// What went wrong
        message: String,
    },

    /// Target URI could not be parsed
    #[error("Invalid target: {0}")]
    UriError(#[from] TargetUriError),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Records could not be split into tables
    #[error("Denest error: {0}")]
    DenestError(#[from] DenestError),

    /// SQLx error wrapped
    #[error("SQLx error: {0}")]
    SqlxError(#[from] sqlx::Error),
}

impl SqlError {
    /// Create a connection error
    pub fn connection_error(message: impl Into<String>) -> Self {
        Self::ConnectionError(message.into())
    }

    /// Create a query error
    pub fn query_error(message: impl Into<String>) -> Self {
        Self::QueryError(message.into())
    }

    /// Create a migration error
    pub fn migration_error(message: impl Into<String>) -> Self {
        Self::MigrationError(message.into())
    }

    /// Create a missing default error
    pub fn missing_default(table: impl Into<String>, column: impl Into<String>) -> Self {
        Self::MissingDefault {
            table: table.into(),
            column: column.into(),
        }
    }

    /// Create a metadata error
    pub fn metadata_error(table: impl Into<String>, message: impl Into<String>) -> Self {
        Self::MetadataError {
            table: table.into(),
            message: message.into(),
        }
    }

    /// Whether the error is a schema-evolution conflict rather than an I/O failure
    pub fn is_migration_conflict(&self) -> bool {
        matches!(
            self,
            Self::MissingDefault { .. }
                | Self::KeyColumnTypeChanged { .. }
                | Self::KeyColumnsChanged { .. }
                | Self::MigrationError(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connection_error_display() {
        let err = SqlError::connection_error("Connection failed");
        assert!(matches!(err, SqlError::ConnectionError(_)));
        assert_eq!(err.to_string(), "Database connection error: Connection failed");
    }

    #[test]
    fn missing_default_is_a_migration_conflict() {
        let err = SqlError::missing_default("users", "created_at");
        assert!(err.is_migration_conflict());
        assert_eq!(
            err.to_string(),
            "cannot add non-nullable column 'created_at' to 'users': no default can be derived"
        );
    }

    #[test]
    fn denest_errors_convert() {
        let err: SqlError = DenestError::MissingKeyValue("id".to_string()).into();
        assert!(!err.is_migration_conflict());
        assert!(err.to_string().contains("id"));
    }
}
