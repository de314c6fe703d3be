//! SQL dialect differences between the supported targets.

use chrono::DateTime;
use serde_json::Value;
use tablesink_core::LeafKind;

/// Engine-specific SQL rendering.
pub trait Dialect: Send + Sync {
    /// Engine name used in logs and errors.
    fn name(&self) -> &'static str;

    /// Longest identifier the engine keeps without truncating.
    fn max_identifier_length(&self) -> usize;

    /// Column type for a leaf kind.
    fn column_type(&self, kind: LeafKind) -> &'static str;

    /// Whether `NOT NULL` can be dropped from an existing column.
    fn supports_relaxing_not_null(&self) -> bool;

    /// Bind parameters allowed in one statement.
    fn max_bind_parameters(&self) -> usize;

    /// Literal for a boolean.
    fn boolean_literal(&self, value: bool) -> &'static str;

    /// Table reference including any schema qualification.
    fn qualify(&self, table: &str) -> String;

    /// Quotes an identifier.
    fn quote(&self, identifier: &str) -> String {
        format!("\"{}\"", identifier.replace('"', "\"\""))
    }

    /// Quotes a string literal.
    fn string_literal(&self, value: &str) -> String {
        format!("'{}'", value.replace('\'', "''"))
    }

    /// Literal for `value` stored as `kind`, if the value is a scalar of that kind.
    fn literal(&self, kind: LeafKind, value: &Value) -> Option<String> {
        match (kind, value) {
            (LeafKind::String, Value::String(text)) => Some(self.string_literal(text)),
            (LeafKind::String, Value::Number(n)) => Some(self.string_literal(&n.to_string())),
            (LeafKind::String, Value::Bool(b)) => Some(self.string_literal(&b.to_string())),
            (LeafKind::DateTime, Value::String(text)) => DateTime::parse_from_rfc3339(text)
                .ok()
                .map(|_| self.string_literal(text)),
            (LeafKind::Integer, Value::Number(n)) => n.as_i64().map(|v| v.to_string()),
            (LeafKind::Number, Value::Number(n)) => n.as_f64().map(|v| format!("{v:?}")),
            (LeafKind::Boolean, Value::Bool(b)) => Some(self.boolean_literal(*b).to_string()),
            _ => None,
        }
    }

    /// Literal used when a non-nullable column needs a default and none is declared.
    fn safe_default(&self, kind: LeafKind) -> Option<String> {
        match kind {
            LeafKind::String => Some("''".to_string()),
            LeafKind::Integer => Some("0".to_string()),
            LeafKind::Number => Some("0.0".to_string()),
            LeafKind::Boolean => Some(self.boolean_literal(false).to_string()),
            LeafKind::DateTime => None,
        }
    }
}

/// Postgres rendering; every table lives in one schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PostgresDialect {
    schema: String,
}

impl PostgresDialect {
    /// Dialect placing tables in `schema`.
    pub fn new(schema: impl Into<String>) -> Self {
        Self {
            schema: schema.into(),
        }
    }

    /// Target schema.
    pub fn schema(&self) -> &str {
        &self.schema
    }
}

impl Default for PostgresDialect {
    fn default() -> Self {
        Self::new("public")
    }
}

impl Dialect for PostgresDialect {
    fn name(&self) -> &'static str {
        "postgres"
    }

    fn max_identifier_length(&self) -> usize {
        63
    }

    fn column_type(&self, kind: LeafKind) -> &'static str {
        match kind {
            LeafKind::String => "TEXT",
            LeafKind::DateTime => "TIMESTAMP WITH TIME ZONE",
            LeafKind::Integer => "BIGINT",
            LeafKind::Number => "DOUBLE PRECISION",
            LeafKind::Boolean => "BOOLEAN",
        }
    }

    fn supports_relaxing_not_null(&self) -> bool {
        true
    }

    fn max_bind_parameters(&self) -> usize {
        65_535
    }

    fn boolean_literal(&self, value: bool) -> &'static str {
        if value {
            "TRUE"
        } else {
            "FALSE"
        }
    }

    fn qualify(&self, table: &str) -> String {
        format!("{}.{}", self.quote(&self.schema), self.quote(table))
    }
}

/// SQLite rendering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SqliteDialect;

impl Dialect for SqliteDialect {
    fn name(&self) -> &'static str {
        "sqlite"
    }

    fn max_identifier_length(&self) -> usize {
        // SQLite has no practical limit; keep names portable.
        63
    }

    fn column_type(&self, kind: LeafKind) -> &'static str {
        match kind {
            LeafKind::String | LeafKind::DateTime => "TEXT",
            LeafKind::Integer | LeafKind::Boolean => "INTEGER",
            LeafKind::Number => "REAL",
        }
    }

    fn supports_relaxing_not_null(&self) -> bool {
        false
    }

    fn max_bind_parameters(&self) -> usize {
        32_766
    }

    fn boolean_literal(&self, value: bool) -> &'static str {
        if value {
            "1"
        } else {
            "0"
        }
    }

    fn qualify(&self, table: &str) -> String {
        self.quote(table)
    }
}
