//! Plans the DDL that brings a table in line with an incoming table schema.
//!
//! Columns are never altered in type. A field whose kind changes becomes a
//! family of suffixed columns: a plain column is renamed to its suffixed name
//! (its data moves with it) and a sibling column is added for the new kind.

use std::collections::BTreeSet;

use tablesink_core::{FieldPath, LeafKind, LeafType, TableSchema};
use tracing::debug;

use crate::dialect::Dialect;
use crate::error::{SqlError, SqlResult};
use crate::metadata::{ColumnMapping, RemoteTableMetadata};
use crate::naming;

/// Column definition used when creating or extending a table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnDef {
    /// Physical name.
    pub name: String,
    /// Stored kind.
    pub kind: LeafKind,
    /// Whether the column is created `NOT NULL`.
    pub not_null: bool,
    /// Default literal.
    pub default: Option<String>,
}

impl ColumnDef {
    fn to_sql(&self, dialect: &dyn Dialect) -> String {
        let mut sql = format!("{} {}", dialect.quote(&self.name), dialect.column_type(self.kind));
        if let Some(default) = &self.default {
            sql.push_str(" DEFAULT ");
            sql.push_str(default);
        }
        if self.not_null {
            sql.push_str(" NOT NULL");
        }
        sql
    }
}

/// One DDL statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationStep {
    /// Create the table.
    CreateTable(Vec<ColumnDef>),
    /// Add a column.
    AddColumn(ColumnDef),
    /// Rename a column.
    RenameColumn {
        /// Current name.
        from: String,
        /// New name.
        to: String,
    },
    /// Drop `NOT NULL` and any default from a column.
    RelaxColumn(String),
    /// Index columns used by the merge.
    CreateIndex {
        /// Index name.
        name: String,
        /// Indexed columns.
        columns: Vec<String>,
    },
}

impl MigrationStep {
    /// Renders the step against `table` (unqualified physical name).
    pub fn to_sql(&self, dialect: &dyn Dialect, table: &str) -> String {
        let qualified = dialect.qualify(table);
        match self {
            MigrationStep::CreateTable(columns) => {
                let columns: Vec<String> = columns.iter().map(|c| c.to_sql(dialect)).collect();
                format!("CREATE TABLE {qualified} ({})", columns.join(", "))
            }
            MigrationStep::AddColumn(column) => {
                format!("ALTER TABLE {qualified} ADD COLUMN {}", column.to_sql(dialect))
            }
            MigrationStep::RenameColumn { from, to } => format!(
                "ALTER TABLE {qualified} RENAME COLUMN {} TO {}",
                dialect.quote(from),
                dialect.quote(to)
            ),
            MigrationStep::RelaxColumn(column) => {
                let column = dialect.quote(column);
                format!(
                    "ALTER TABLE {qualified} ALTER COLUMN {column} DROP NOT NULL, ALTER COLUMN {column} DROP DEFAULT"
                )
            }
            MigrationStep::CreateIndex { name, columns } => {
                let columns: Vec<String> = columns.iter().map(|c| dialect.quote(c)).collect();
                format!(
                    "CREATE INDEX IF NOT EXISTS {} ON {qualified} ({})",
                    dialect.quote(name),
                    columns.join(", ")
                )
            }
        }
    }
}

/// Identity and placement of the table being migrated.
#[derive(Debug, Clone)]
pub struct MigrationTarget<'a> {
    /// Owning stream.
    pub stream: &'a str,
    /// Physical table name.
    pub table: &'a str,
    /// Table version the table holds.
    pub table_version: Option<i64>,
    /// Whether the table is a pending version table.
    pub pending: bool,
    /// Create an index over key and sequence columns on creation.
    pub add_indexes: bool,
    /// Sequence column included in the index, when the table has one.
    pub sequence: Option<&'a FieldPath>,
}

/// DDL to run and the metadata to store afterwards.
#[derive(Debug, Clone, PartialEq)]
pub struct MigrationPlan {
    /// Statements in execution order.
    pub steps: Vec<MigrationStep>,
    /// Metadata describing the migrated table.
    pub metadata: RemoteTableMetadata,
}

/// Compares `schema` with the stored metadata and plans the DDL.
pub fn plan_migration(
    dialect: &dyn Dialect,
    target: &MigrationTarget<'_>,
    existing: Option<&RemoteTableMetadata>,
    schema: &TableSchema,
) -> SqlResult<MigrationPlan> {
    let mut planner = Planner {
        dialect,
        target,
        schema,
        steps: Vec::new(),
        metadata: existing
            .cloned()
            .unwrap_or_else(|| RemoteTableMetadata::new(target.stream, schema.path.clone())),
    };
    if target.table_version.is_some() {
        planner.metadata.table_version = target.table_version;
    }
    planner.metadata.pending = target.pending;

    match existing {
        None => planner.create()?,
        Some(_) => planner.evolve()?,
    }
    planner.metadata.key_columns = schema.key_columns.clone();

    debug!(
        table = target.table,
        steps = planner.steps.len(),
        created = existing.is_none(),
        "planned table migration"
    );
    Ok(MigrationPlan {
        steps: planner.steps,
        metadata: planner.metadata,
    })
}

struct Planner<'a> {
    dialect: &'a dyn Dialect,
    target: &'a MigrationTarget<'a>,
    schema: &'a TableSchema,
    steps: Vec<MigrationStep>,
    metadata: RemoteTableMetadata,
}

impl Planner<'_> {
    fn create(&mut self) -> SqlResult<()> {
        let mut columns = Vec::new();
        for (path, leaf) in &self.schema.columns {
            let is_key = self.is_key(path);
            if is_key && leaf.kinds.len() > 1 {
                return Err(SqlError::migration_error(format!(
                    "key column '{path}' of '{}' has more than one kind",
                    self.target.table
                )));
            }
            let family = leaf.kinds.len() > 1;
            for &kind in &leaf.kinds {
                let name = self.new_column_name(path, family.then_some(kind));
                // A data column only rejects nulls when a default can fill them.
                let default = if !is_key && !family && !leaf.nullable {
                    self.default_literal(kind, leaf)
                } else {
                    None
                };
                let not_null = is_key || default.is_some();
                let physical = is_key || (not_null && self.dialect.supports_relaxing_not_null());
                columns.push(ColumnDef {
                    name: name.clone(),
                    kind,
                    not_null: physical,
                    default: default.clone().filter(|_| physical),
                });
                self.metadata.mappings.insert(
                    name,
                    ColumnMapping {
                        path: path.clone(),
                        kind,
                        not_null,
                        default,
                    },
                );
            }
        }
        self.steps.push(MigrationStep::CreateTable(columns));

        if self.target.add_indexes {
            let mut indexed: Vec<String> = Vec::new();
            for path in self.schema.key_columns.iter().chain(self.target.sequence) {
                if let Some((name, _)) = self.metadata.columns_for(path).next() {
                    if !indexed.iter().any(|existing| existing == name) {
                        indexed.push(name.to_string());
                    }
                }
            }
            if !indexed.is_empty() {
                let name =
                    naming::index_name(self.target.table, self.dialect.max_identifier_length());
                self.steps.push(MigrationStep::CreateIndex {
                    name,
                    columns: indexed,
                });
            }
        }
        Ok(())
    }

    fn evolve(&mut self) -> SqlResult<()> {
        self.check_keys()?;

        let mut incoming: BTreeSet<(FieldPath, LeafKind)> = BTreeSet::new();
        for (path, leaf) in &self.schema.columns {
            for &kind in &leaf.kinds {
                incoming.insert((path.clone(), kind));
                self.merge_column(path, kind, leaf)?;
            }
        }

        // Columns no longer produced must accept missing values.
        let stale: Vec<String> = self
            .metadata
            .mappings
            .iter()
            .filter(|(_, m)| !incoming.contains(&(m.path.clone(), m.kind)))
            .map(|(name, _)| name.clone())
            .collect();
        for name in stale {
            self.relax(&name);
        }
        Ok(())
    }

    fn check_keys(&self) -> SqlResult<()> {
        if self.metadata.key_columns != self.schema.key_columns {
            return Err(SqlError::KeyColumnsChanged {
                table: self.target.table.to_string(),
                existing: self.metadata.key_columns.iter().map(ToString::to_string).collect(),
                incoming: self.schema.key_columns.iter().map(ToString::to_string).collect(),
            });
        }
        for path in &self.schema.key_columns {
            let Some(leaf) = self.schema.columns.get(path) else {
                continue;
            };
            let Some((_, mapping)) = self.metadata.columns_for(path).next() else {
                continue;
            };
            if let Some(incoming) = leaf.kinds.iter().find(|&&kind| kind != mapping.kind) {
                return Err(SqlError::KeyColumnTypeChanged {
                    table: self.target.table.to_string(),
                    column: path.to_string(),
                    existing: mapping.kind,
                    incoming: *incoming,
                });
            }
        }
        Ok(())
    }

    fn merge_column(&mut self, path: &FieldPath, kind: LeafKind, leaf: &LeafType) -> SqlResult<()> {
        let family = leaf.kinds.len() > 1;
        if let Some(name) = self.metadata.column_for(path, kind).map(str::to_string) {
            if (family || leaf.nullable) && !self.is_key(path) {
                self.relax(&name);
            }
            return Ok(());
        }

        let siblings: Vec<(String, LeafKind)> = self
            .metadata
            .columns_for(path)
            .map(|(name, mapping)| (name.to_string(), mapping.kind))
            .collect();

        if let [(plain, old_kind)] = siblings.as_slice() {
            let max_len = self.dialect.max_identifier_length();
            if *plain == naming::column_name(path, None, max_len) {
                let renamed = self.new_column_name(path, Some(*old_kind));
                self.relax(plain);
                self.steps.push(MigrationStep::RenameColumn {
                    from: plain.clone(),
                    to: renamed.clone(),
                });
                if let Some(mapping) = self.metadata.mappings.remove(plain) {
                    self.metadata.mappings.insert(renamed, mapping);
                }
            }
        }

        if !siblings.is_empty() || family {
            let name = self.new_column_name(path, Some(kind));
            self.add_column(name, path, kind, false, None);
            return Ok(());
        }

        let not_null = !leaf.nullable;
        let name = self.new_column_name(path, None);
        let default = if not_null {
            Some(
                self.default_literal(kind, leaf)
                    .ok_or_else(|| SqlError::missing_default(self.target.table, name.clone()))?,
            )
        } else {
            None
        };
        self.add_column(name, path, kind, not_null, default);
        Ok(())
    }

    fn add_column(
        &mut self,
        name: String,
        path: &FieldPath,
        kind: LeafKind,
        not_null: bool,
        default: Option<String>,
    ) {
        // Constraints the dialect cannot relax later stay logical only.
        let physical = not_null && self.dialect.supports_relaxing_not_null();
        self.steps.push(MigrationStep::AddColumn(ColumnDef {
            name: name.clone(),
            kind,
            not_null: physical,
            default: default.clone().filter(|_| physical),
        }));
        self.metadata.mappings.insert(
            name,
            ColumnMapping {
                path: path.clone(),
                kind,
                not_null,
                default,
            },
        );
    }

    fn relax(&mut self, name: &str) {
        let Some(mapping) = self.metadata.mappings.get_mut(name) else {
            return;
        };
        if !mapping.not_null || self.schema.key_columns.contains(&mapping.path) {
            return;
        }
        mapping.not_null = false;
        mapping.default = None;
        if self.dialect.supports_relaxing_not_null() {
            self.steps.push(MigrationStep::RelaxColumn(name.to_string()));
        }
    }

    fn is_key(&self, path: &FieldPath) -> bool {
        self.schema.key_columns.contains(path)
    }

    fn new_column_name(&self, path: &FieldPath, kind: Option<LeafKind>) -> String {
        let max_len = self.dialect.max_identifier_length();
        let name = naming::column_name(path, kind, max_len);
        let taken = |candidate: &str| self.metadata.mappings.contains_key(candidate);
        if taken(&name) {
            naming::disambiguate(&name, max_len, taken)
        } else {
            name
        }
    }

    fn default_literal(&self, kind: LeafKind, leaf: &LeafType) -> Option<String> {
        match &leaf.default {
            Some(declared) => self.dialect.literal(kind, declared),
            None => self.dialect.safe_default(kind),
        }
    }
}
