//! Per-table metadata kept alongside every table the sink manages.
//!
//! The metadata records which stream and logical path a physical table holds,
//! its key columns, its table version and how every physical column maps back
//! to a (path, kind) pair. Backends persist it as a JSON document.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tablesink_core::{FieldPath, LeafKind};

use crate::error::{SqlError, SqlResult};

/// Version of the metadata document layout written by this crate.
pub const METADATA_SCHEMA_VERSION: u32 = 1;

/// How one physical column maps to the logical model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnMapping {
    /// Logical field path.
    pub path: FieldPath,
    /// Kind stored in the column.
    pub kind: LeafKind,
    /// Whether the field is logically non-nullable.
    pub not_null: bool,
    /// SQL literal filling missing values of a non-nullable column.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<String>,
}

/// Metadata stored with each managed table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteTableMetadata {
    /// Layout version of this document.
    pub schema_version: u32,
    /// Owning stream.
    pub stream: String,
    /// Table path below the stream root.
    pub path: FieldPath,
    /// Logical key columns.
    pub key_columns: Vec<FieldPath>,
    /// Table version whose data the table holds.
    #[serde(default)]
    pub table_version: Option<i64>,
    /// Whether the table is a not-yet-activated version table.
    #[serde(default)]
    pub pending: bool,
    /// Physical column name to mapping.
    #[serde(default)]
    pub mappings: BTreeMap<String, ColumnMapping>,
}

impl RemoteTableMetadata {
    /// Metadata for a table that does not exist yet.
    pub fn new(stream: impl Into<String>, path: FieldPath) -> Self {
        Self {
            schema_version: METADATA_SCHEMA_VERSION,
            stream: stream.into(),
            path,
            key_columns: Vec::new(),
            table_version: None,
            pending: false,
            mappings: BTreeMap::new(),
        }
    }

    /// Physical column holding `kind` values of `path`.
    pub fn column_for(&self, path: &FieldPath, kind: LeafKind) -> Option<&str> {
        self.mappings
            .iter()
            .find(|(_, mapping)| &mapping.path == path && mapping.kind == kind)
            .map(|(name, _)| name.as_str())
    }

    /// Every physical column mapped to `path`.
    pub fn columns_for<'a>(
        &'a self,
        path: &'a FieldPath,
    ) -> impl Iterator<Item = (&'a str, &'a ColumnMapping)> + 'a {
        self.mappings
            .iter()
            .filter(move |(_, mapping)| &mapping.path == path)
            .map(|(name, mapping)| (name.as_str(), mapping))
    }

    /// Serializes the document.
    pub fn encode(&self) -> SqlResult<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Parses a stored document for `table`.
    pub fn decode(table: &str, raw: &str) -> SqlResult<Self> {
        let metadata: Self = serde_json::from_str(raw)
            .map_err(|err| SqlError::metadata_error(table, err.to_string()))?;
        if metadata.schema_version > METADATA_SCHEMA_VERSION {
            return Err(SqlError::metadata_error(
                table,
                format!(
                    "metadata schema version {} is newer than supported version {METADATA_SCHEMA_VERSION}",
                    metadata.schema_version
                ),
            ));
        }
        Ok(metadata)
    }
}
