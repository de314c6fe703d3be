//! Transaction-scoped access to a target database.

use chrono::{DateTime, Utc};
use serde_json::Value;
use tablesink_core::LeafKind;

use crate::dialect::Dialect;
use crate::error::SqlResult;
use crate::metadata::RemoteTableMetadata;

/// A scalar bound into a staged row.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    /// SQL NULL.
    Null,
    /// Text.
    Text(String),
    /// 64-bit integer.
    Integer(i64),
    /// Double.
    Float(f64),
    /// Boolean.
    Boolean(bool),
    /// UTC timestamp.
    Timestamp(DateTime<Utc>),
}

impl SqlValue {
    /// Converts a denested value observed as `kind`.
    pub fn from_leaf(kind: LeafKind, value: &Value) -> Self {
        match (kind, value) {
            (_, Value::Null) => SqlValue::Null,
            (LeafKind::String, Value::String(text)) => SqlValue::Text(text.clone()),
            (LeafKind::String, other) => SqlValue::Text(other.to_string()),
            (LeafKind::DateTime, Value::String(text)) => DateTime::parse_from_rfc3339(text)
                .map(|parsed| SqlValue::Timestamp(parsed.with_timezone(&Utc)))
                .unwrap_or(SqlValue::Null),
            (LeafKind::Integer, Value::Number(n)) => {
                n.as_i64().map(SqlValue::Integer).unwrap_or(SqlValue::Null)
            }
            (LeafKind::Number, Value::Number(n)) => {
                n.as_f64().map(SqlValue::Float).unwrap_or(SqlValue::Null)
            }
            (LeafKind::Boolean, Value::Bool(b)) => SqlValue::Boolean(*b),
            _ => SqlValue::Null,
        }
    }

    /// Whether the value is NULL.
    pub fn is_null(&self) -> bool {
        matches!(self, SqlValue::Null)
    }
}

/// Column of a staging table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StagedColumn {
    /// Physical name.
    pub name: String,
    /// Stored kind.
    pub kind: LeafKind,
}

/// An open transaction. Dropping a session without committing rolls it back.
pub trait Session {
    /// Dialect of the underlying engine.
    fn dialect(&self) -> &dyn Dialect;

    /// Executes one or more statements without bind parameters; returns affected rows.
    fn execute(&mut self, sql: &str) -> SqlResult<u64>;

    /// Metadata stored for `table`, if the table is managed.
    fn read_metadata(&mut self, table: &str) -> SqlResult<Option<RemoteTableMetadata>>;

    /// Stores metadata for `table`.
    fn write_metadata(&mut self, table: &str, metadata: &RemoteTableMetadata) -> SqlResult<()>;

    /// Every managed table with its metadata.
    fn list_metadata(&mut self) -> SqlResult<Vec<(String, RemoteTableMetadata)>>;

    /// Renames a managed table, carrying its metadata.
    fn rename_table(&mut self, from: &str, to: &str) -> SqlResult<()>;

    /// Drops a managed table and its metadata.
    fn drop_table(&mut self, table: &str) -> SqlResult<()>;

    /// Bulk-inserts `rows` into the staging table; each row is prefixed with
    /// its ordinal in `_sdc_stage_row`.
    fn stage_rows(
        &mut self,
        table: &str,
        columns: &[StagedColumn],
        rows: &[Vec<SqlValue>],
    ) -> SqlResult<u64>;

    /// Commits the transaction.
    fn commit(self: Box<Self>) -> SqlResult<()>;

    /// Rolls the transaction back.
    fn rollback(self: Box<Self>) -> SqlResult<()>;
}

/// A database that can open sessions.
pub trait Connection {
    /// Dialect of the underlying engine.
    fn dialect(&self) -> &dyn Dialect;

    /// Begins a transaction.
    fn begin(&self) -> SqlResult<Box<dyn Session + '_>>;
}

/// Rows per `INSERT` so a statement stays under the bind parameter limit.
pub(crate) fn rows_per_statement(dialect: &dyn Dialect, columns: usize) -> usize {
    (dialect.max_bind_parameters() / (columns + 1)).max(1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dialect::{PostgresDialect, SqliteDialect};
    use serde_json::json;

    #[test]
    fn converts_leaf_values() {
        assert_eq!(
            SqlValue::from_leaf(LeafKind::Integer, &json!(7)),
            SqlValue::Integer(7)
        );
        assert_eq!(
            SqlValue::from_leaf(LeafKind::Number, &json!(7)),
            SqlValue::Float(7.0)
        );
        assert_eq!(
            SqlValue::from_leaf(LeafKind::String, &json!(12)),
            SqlValue::Text("12".into())
        );
        assert!(SqlValue::from_leaf(LeafKind::Boolean, &json!(null)).is_null());

        let SqlValue::Timestamp(ts) =
            SqlValue::from_leaf(LeafKind::DateTime, &json!("2024-03-01T10:00:00+02:00"))
        else {
            panic!("expected timestamp");
        };
        assert_eq!(ts.to_rfc3339(), "2024-03-01T08:00:00+00:00");
    }

    #[test]
    fn chunks_respect_bind_limits() {
        assert_eq!(rows_per_statement(&PostgresDialect::default(), 4), 13_107);
        assert_eq!(rows_per_statement(&SqliteDialect, 32_766), 1);
    }
}
