//! Persists flushed batches: migration, staging, dedup merge and version cutover.

use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;

use serde_json::Value;
use tablesink_core::denest::SEQUENCE_COLUMN;
use tablesink_core::{to_table_batches, FieldPath, FlushedBatch, LeafKind, TableBatch};
use tablesink_observability as observability;
use tracing::{debug, info, warn};

use crate::error::{SqlError, SqlResult};
use crate::merge::{self, MergeColumn, MergeRequest};
use crate::metadata::RemoteTableMetadata;
use crate::migration::{plan_migration, MigrationTarget};
use crate::naming;
use crate::session::{Connection, Session, SqlValue, StagedColumn};

/// Engine behaviour switches.
#[derive(Debug, Clone)]
pub struct EngineOptions {
    /// Index key and sequence columns when creating tables.
    pub add_upsert_indexes: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            add_upsert_indexes: true,
        }
    }
}

/// Where a batch's tables live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// The stream's visible tables.
    Canonical {
        /// Version recorded on the tables.
        version: Option<i64>,
    },
    /// Tables built for a version that is not active yet.
    Pending(i64),
}

impl Placement {
    fn pending_version(self) -> Option<i64> {
        match self {
            Placement::Pending(version) => Some(version),
            Placement::Canonical { .. } => None,
        }
    }

    fn table_version(self) -> Option<i64> {
        match self {
            Placement::Pending(version) => Some(version),
            Placement::Canonical { version } => version,
        }
    }
}

/// Managed tables known to the target, keyed by physical name.
#[derive(Debug, Default)]
struct Catalog {
    tables: BTreeMap<String, RemoteTableMetadata>,
}

impl Catalog {
    fn load(session: &mut dyn Session) -> SqlResult<Self> {
        Ok(Self {
            tables: session.list_metadata()?.into_iter().collect(),
        })
    }

    fn find(&self, stream: &str, path: &FieldPath, placement: Placement) -> Option<&str> {
        self.tables
            .iter()
            .find(|(_, meta)| {
                meta.stream == stream
                    && &meta.path == path
                    && match placement {
                        Placement::Canonical { .. } => !meta.pending,
                        Placement::Pending(version) => {
                            meta.pending && meta.table_version == Some(version)
                        }
                    }
            })
            .map(|(name, _)| name.as_str())
    }

    fn active_root(&self, stream: &str) -> Option<&RemoteTableMetadata> {
        self.find(stream, &FieldPath::root(), Placement::Canonical { version: None })
            .and_then(|name| self.tables.get(name))
    }

    /// Existing name of the table, or a fresh one not used by another table.
    fn resolve_name(
        &self,
        max_len: usize,
        stream: &str,
        path: &FieldPath,
        placement: Placement,
    ) -> String {
        if let Some(name) = self.find(stream, path, placement) {
            return name.to_string();
        }
        let name = naming::table_name(stream, path, placement.pending_version(), max_len);
        if self.tables.contains_key(&name) {
            naming::disambiguate(&name, max_len, |candidate| self.tables.contains_key(candidate))
        } else {
            name
        }
    }

    fn stream_tables(&self, stream: &str) -> Vec<(String, RemoteTableMetadata)> {
        self.tables
            .iter()
            .filter(|(_, meta)| meta.stream == stream)
            .map(|(name, meta)| (name.clone(), meta.clone()))
            .collect()
    }
}

/// Writes batches to a target through a [`Connection`].
#[derive(Debug)]
pub struct PersistenceEngine<C> {
    connection: C,
    options: EngineOptions,
}

impl<C: Connection> PersistenceEngine<C> {
    /// Creates an engine over `connection`.
    pub fn new(connection: C, options: EngineOptions) -> Self {
        Self {
            connection,
            options,
        }
    }

    /// Underlying connection.
    pub fn connection(&self) -> &C {
        &self.connection
    }

    /// Runs `f` in one transaction, rolling back if it fails.
    fn in_transaction<T>(
        &self,
        f: impl FnOnce(&mut dyn Session) -> SqlResult<T>,
    ) -> SqlResult<T> {
        let mut session = self.connection.begin()?;
        match f(session.as_mut()) {
            Ok(value) => {
                session.commit()?;
                Ok(value)
            }
            Err(err) => {
                if let Err(rollback_err) = session.rollback() {
                    warn!(%rollback_err, "rollback failed after batch error");
                }
                Err(err)
            }
        }
    }

    /// Executes ad-hoc SQL (run hooks) in its own transaction.
    pub fn execute_sql(&self, sql: &str) -> SqlResult<u64> {
        info!(sql, "executing sql hook");
        self.in_transaction(|session| session.execute(sql))
    }

    /// Denests and persists a flushed batch; returns rows written.
    ///
    /// Only records of the batch's version are written. An empty batch still
    /// creates or migrates the stream's tables.
    pub fn write_batch(&self, batch: &FlushedBatch) -> SqlResult<u64> {
        let records: Vec<Value> = batch
            .records
            .iter()
            .filter(|record| match (batch.version, record.version) {
                (Some(target), Some(version)) => version == target,
                _ => true,
            })
            .map(|record| record.record.clone())
            .collect();
        if records.len() < batch.records.len() {
            debug!(
                stream = %batch.stream,
                dropped = batch.records.len() - records.len(),
                "dropped records of superseded table versions"
            );
        }
        let records = newest_per_key(records, &batch.key_columns);
        let tables = to_table_batches(&batch.schema, &batch.key_columns, &records)?;
        self.upsert(&batch.stream, batch.version, &tables)
    }

    /// Writes denested tables of `stream` in one transaction; returns rows written.
    ///
    /// Child rows of every root record in `tables` are replaced, so a record
    /// whose array shrank or vanished leaves no stale children behind.
    pub fn upsert(&self, stream: &str, version: Option<i64>, tables: &[TableBatch]) -> SqlResult<u64> {
        let started = Instant::now();
        let parents = tables
            .iter()
            .find(|table| table.schema.is_root())
            .map(parent_rows)
            .unwrap_or_default();
        let result = self.in_transaction(|session| {
            let mut catalog = Catalog::load(session)?;
            let Some(placement) = place(&catalog, stream, version) else {
                return Ok(0);
            };
            let mut written = 0;
            for table in tables {
                written +=
                    self.write_table(session, &mut catalog, stream, placement, table, &parents)?;
            }
            Ok(written)
        });

        match &result {
            Ok(rows) => observability::record_batch_written(stream, tables.len(), *rows, started.elapsed()),
            Err(err) => {
                if err.is_migration_conflict() {
                    warn!(stream, "incoming schema conflicts with the target tables");
                }
                observability::record_batch_failure(stream, &err.to_string());
            }
        }
        result
    }

    fn write_table(
        &self,
        session: &mut dyn Session,
        catalog: &mut Catalog,
        stream: &str,
        placement: Placement,
        table: &TableBatch,
        parents: &[ParentRow],
    ) -> SqlResult<u64> {
        let dialect = self.connection.dialect();
        let schema = &table.schema;
        let name = catalog.resolve_name(dialect.max_identifier_length(), stream, &schema.path, placement);
        let sequence = FieldPath::single(SEQUENCE_COLUMN);

        let target = MigrationTarget {
            stream,
            table: &name,
            table_version: placement.table_version(),
            pending: matches!(placement, Placement::Pending(_)),
            add_indexes: self.options.add_upsert_indexes,
            sequence: schema.columns.contains_key(&sequence).then_some(&sequence),
        };
        let plan = plan_migration(dialect, &target, catalog.tables.get(&name), schema)?;
        for step in &plan.steps {
            session.execute(&step.to_sql(dialect, &name))?;
        }
        session.write_metadata(&name, &plan.metadata)?;
        let metadata = plan.metadata;
        let sequence_column = metadata
            .column_for(&sequence, LeafKind::Integer)
            .map(str::to_string);

        let replace_children = !schema.is_root() && !parents.is_empty();
        if replace_children {
            let deleted = self.delete_children(
                session,
                &name,
                &metadata,
                &schema.parent_keys,
                sequence_column.as_deref(),
                parents,
            )?;
            debug!(table = %name, parents = parents.len(), deleted, "cleared child rows");
        }

        if table.rows.is_empty() {
            catalog.tables.insert(name, metadata);
            return Ok(0);
        }

        let mut staged_paths: Vec<(&FieldPath, LeafKind)> = Vec::new();
        let mut columns = Vec::new();
        let mut merge_columns = Vec::new();
        for (path, leaf) in &schema.columns {
            for &kind in &leaf.kinds {
                let (column, mapping) = metadata
                    .column_for(path, kind)
                    .and_then(|column| metadata.mappings.get_key_value(column))
                    .ok_or_else(|| {
                        SqlError::metadata_error(&name, format!("no column mapped to '{path}'"))
                    })?;
                staged_paths.push((path, kind));
                columns.push(StagedColumn {
                    name: column.clone(),
                    kind,
                });
                merge_columns.push(MergeColumn {
                    name: column.clone(),
                    default: mapping.default.clone().filter(|_| mapping.not_null),
                });
            }
        }

        let rows: Vec<Vec<SqlValue>> = table
            .rows
            .iter()
            .map(|row| {
                staged_paths
                    .iter()
                    .map(|(path, kind)| match row.get(*path) {
                        Some((observed, value)) if observed == kind => SqlValue::from_leaf(*kind, value),
                        _ => SqlValue::Null,
                    })
                    .collect()
            })
            .collect();

        let key_names = |paths: &[FieldPath]| -> SqlResult<Vec<String>> {
            paths
                .iter()
                .map(|path| {
                    metadata
                        .columns_for(path)
                        .next()
                        .map(|(column, _)| column.to_string())
                        .ok_or_else(|| {
                            SqlError::metadata_error(&name, format!("no column mapped to key '{path}'"))
                        })
                })
                .collect()
        };
        let dedup_keys = key_names(&schema.key_columns)?;
        let delete_keys = if schema.is_root() {
            dedup_keys.clone()
        } else {
            key_names(&schema.parent_keys)?
        };
        let stage = merge::stage_table_name();
        session.execute(&merge::create_stage_sql(dialect, &stage, &columns))?;
        session.stage_rows(&stage, &columns, &rows)?;
        let statements = merge::merge_statements(
            dialect,
            &MergeRequest {
                target: &name,
                stage: &stage,
                columns: &merge_columns,
                delete_keys: &delete_keys,
                dedup_keys: &dedup_keys,
                sequence: sequence_column.as_deref(),
            },
        );
        let deleted = if replace_children {
            0
        } else {
            session.execute(&statements.delete)?
        };
        let inserted = session.execute(&statements.insert)?;
        session.execute(&merge::drop_stage_sql(dialect, &stage))?;

        debug!(
            table = %name,
            staged = rows.len(),
            deleted,
            inserted,
            "merged staged rows"
        );
        catalog.tables.insert(name, metadata);
        Ok(inserted)
    }

    /// Stages the root keys of the batch and deletes the child rows under them.
    fn delete_children(
        &self,
        session: &mut dyn Session,
        table: &str,
        metadata: &RemoteTableMetadata,
        parent_keys: &[FieldPath],
        sequence: Option<&str>,
        parents: &[ParentRow],
    ) -> SqlResult<u64> {
        let dialect = self.connection.dialect();
        let mut columns = Vec::with_capacity(parent_keys.len() + 1);
        for path in parent_keys {
            let (column, mapping) = metadata.columns_for(path).next().ok_or_else(|| {
                SqlError::metadata_error(table, format!("no column mapped to key '{path}'"))
            })?;
            columns.push(StagedColumn {
                name: column.to_string(),
                kind: mapping.kind,
            });
        }
        let keys: Vec<String> = columns.iter().map(|c| c.name.clone()).collect();
        if let Some(sequence) = sequence {
            columns.push(StagedColumn {
                name: sequence.to_string(),
                kind: LeafKind::Integer,
            });
        }
        let rows: Vec<Vec<SqlValue>> = parents
            .iter()
            .map(|parent| {
                let mut row: Vec<SqlValue> = columns
                    .iter()
                    .zip(&parent.keys)
                    .map(|(column, value)| SqlValue::from_leaf(column.kind, value))
                    .collect();
                if sequence.is_some() {
                    row.push(parent.sequence.map_or(SqlValue::Null, SqlValue::Integer));
                }
                row
            })
            .collect();

        let stage = merge::stage_table_name();
        session.execute(&merge::create_stage_sql(dialect, &stage, &columns))?;
        session.stage_rows(&stage, &columns, &rows)?;
        let deleted = session.execute(&merge::parent_delete_sql(
            dialect, table, &stage, &keys, sequence,
        ))?;
        session.execute(&merge::drop_stage_sql(dialect, &stage))?;
        Ok(deleted)
    }

    /// Swaps the pending tables of `version` in for the stream's visible
    /// tables. Returns false when nothing was activated.
    pub fn activate_version(&self, stream: &str, version: i64) -> SqlResult<bool> {
        let max_len = self.connection.dialect().max_identifier_length();
        let activated = self.in_transaction(|session| {
            let mut catalog = Catalog::load(session)?;
            if let Some(active) = catalog.active_root(stream).and_then(|m| m.table_version) {
                if version == active {
                    info!(stream, version, "table version already active");
                    return Ok(None);
                }
                if version < active {
                    warn!(stream, version, active, "refusing to activate an older table version");
                    return Ok(None);
                }
            }

            let tables = catalog.stream_tables(stream);
            let pending: Vec<&(String, RemoteTableMetadata)> = tables
                .iter()
                .filter(|(_, meta)| meta.pending && meta.table_version == Some(version))
                .collect();
            if pending.is_empty() {
                info!(stream, version, "no tables built for table version; nothing to activate");
                return Ok(None);
            }
            let count = pending.len();

            for (name, meta) in &tables {
                let superseded = !meta.pending || meta.table_version.is_some_and(|v| v < version);
                if superseded {
                    session.drop_table(name)?;
                    catalog.tables.remove(name);
                }
            }
            for (name, meta) in pending {
                catalog.tables.remove(name);
                let canonical = catalog.resolve_name(
                    max_len,
                    stream,
                    &meta.path,
                    Placement::Canonical { version: None },
                );
                session.rename_table(name, &canonical)?;
                let mut meta = meta.clone();
                meta.pending = false;
                session.write_metadata(&canonical, &meta)?;
                catalog.tables.insert(canonical, meta);
            }
            Ok(Some(count))
        })?;

        Ok(match activated {
            Some(count) => {
                observability::record_version_activated(stream, version, count);
                true
            }
            None => false,
        })
    }
}

/// Key values and sequence of one root row, in key column order.
#[derive(Debug, Clone)]
struct ParentRow {
    keys: Vec<Value>,
    sequence: Option<i64>,
}

fn parent_rows(root: &TableBatch) -> Vec<ParentRow> {
    let sequence = FieldPath::single(SEQUENCE_COLUMN);
    root.rows
        .iter()
        .map(|row| ParentRow {
            keys: root
                .schema
                .key_columns
                .iter()
                .map(|key| row.get(key).map_or(Value::Null, |(_, value)| value.clone()))
                .collect(),
            sequence: row.get(&sequence).and_then(|(_, value)| value.as_i64()),
        })
        .collect()
}

/// Keeps one record per key: the highest sequence, then the latest arrival.
fn newest_per_key(records: Vec<Value>, key_columns: &[String]) -> Vec<Value> {
    if key_columns.is_empty() {
        return records;
    }
    let mut winners: BTreeMap<String, (i64, usize)> = BTreeMap::new();
    for (index, record) in records.iter().enumerate() {
        let key = Value::Array(
            key_columns
                .iter()
                .map(|key| record.get(key).cloned().unwrap_or(Value::Null))
                .collect(),
        )
        .to_string();
        let sequence = record
            .get(SEQUENCE_COLUMN)
            .and_then(Value::as_i64)
            .unwrap_or(0);
        match winners.get(&key) {
            Some(&(newest, _)) if newest > sequence => {}
            _ => {
                winners.insert(key, (sequence, index));
            }
        }
    }
    let keep: BTreeSet<usize> = winners.values().map(|&(_, index)| index).collect();
    records
        .into_iter()
        .enumerate()
        .filter(|(index, _)| keep.contains(index))
        .map(|(_, record)| record)
        .collect()
}

/// Decides where a batch of `version` goes; `None` means the batch is stale.
fn place(catalog: &Catalog, stream: &str, version: Option<i64>) -> Option<Placement> {
    let Some(version) = version else {
        return Some(Placement::Canonical { version: None });
    };
    match catalog.active_root(stream) {
        None => Some(Placement::Canonical {
            version: Some(version),
        }),
        Some(root) => match root.table_version {
            Some(active) if version < active => {
                warn!(stream, version, active, "skipping batch of a superseded table version");
                None
            }
            Some(active) if version == active => Some(Placement::Canonical {
                version: Some(version),
            }),
            _ => Some(Placement::Pending(version)),
        },
    }
}
