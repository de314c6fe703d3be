//! tablesink-sql
//!
//! Relational persistence for tablesink: migrations into type-suffixed column
//! families, staged dedup merges and table-version cutovers, on Postgres or
//! SQLite behind one `Connection` interface.

#![warn(missing_docs)]

/// SQL rendering differences between targets.
pub mod dialect;
/// Batch persistence and version activation.
pub mod engine;
/// Error types for SQL operations.
pub mod error;
/// Staging-table merge statements.
pub mod merge;
/// Per-table metadata documents.
pub mod metadata;
/// Table migration planning.
pub mod migration;
/// Physical identifier generation.
pub mod naming;
/// Postgres target.
pub mod postgres;
/// Connection and transaction traits.
pub mod session;
/// SQLite target.
pub mod sqlite;
/// Target DSN parser.
pub mod uri;

pub use dialect::{Dialect, PostgresDialect, SqliteDialect};
pub use engine::{EngineOptions, PersistenceEngine, Placement};
pub use error::{SqlError, SqlResult};
pub use metadata::{ColumnMapping, RemoteTableMetadata};
pub use postgres::{PostgresConnection, PostgresConnectionOptions};
pub use session::{Connection, Session, SqlValue, StagedColumn};
pub use sqlite::SqliteConnection;
pub use uri::{TargetEngine, TargetUri, TargetUriError};
