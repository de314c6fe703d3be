//! Postgres-backed `Connection` implementation.
//!
//! Table metadata is stored as a JSON comment on each managed table.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use sqlx::query_builder::Separated;
use sqlx::{Executor, Postgres, QueryBuilder, Transaction};
use tablesink_core::LeafKind;
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, trace, warn};

use crate::dialect::{Dialect, PostgresDialect};
use crate::error::{SqlError, SqlResult};
use crate::merge::STAGE_ROW_COLUMN;
use crate::metadata::RemoteTableMetadata;
use crate::session::{rows_per_statement, Connection, Session, SqlValue, StagedColumn};

/// Connection tuning knobs for the Postgres target.
#[derive(Debug, Clone)]
pub struct PostgresConnectionOptions {
    /// Maximum number of pooled connections.
    pub max_connections: u32,
    /// Timeout applied when establishing the initial pool.
    pub connect_timeout: Duration,
}

impl Default for PostgresConnectionOptions {
    fn default() -> Self {
        Self {
            max_connections: 5,
            connect_timeout: Duration::from_secs(5),
        }
    }
}

/// Postgres target database.
pub struct PostgresConnection {
    runtime: Arc<Runtime>,
    pool: PgPool,
    dialect: PostgresDialect,
}

impl fmt::Debug for PostgresConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PostgresConnection")
            .field("schema", &self.dialect.schema())
            .finish_non_exhaustive()
    }
}

impl PostgresConnection {
    /// Connects with default options, placing tables in `schema`.
    pub fn connect(dsn: impl AsRef<str>, schema: impl Into<String>) -> SqlResult<Self> {
        Self::with_options(dsn, schema, PostgresConnectionOptions::default())
    }

    /// Connects with the provided tuning options and creates `schema` if needed.
    pub fn with_options(
        dsn: impl AsRef<str>,
        schema: impl Into<String>,
        options: PostgresConnectionOptions,
    ) -> SqlResult<Self> {
        let runtime = Arc::new(build_runtime()?);
        let dialect = PostgresDialect::new(schema);
        let pool = runtime
            .block_on(
                PgPoolOptions::new()
                    .max_connections(options.max_connections)
                    .acquire_timeout(options.connect_timeout)
                    .connect(dsn.as_ref()),
            )
            .map_err(|err| SqlError::connection_error(format!("postgres connect failed: {err}")))?;

        let create_schema = format!(
            "CREATE SCHEMA IF NOT EXISTS {}",
            dialect.quote(dialect.schema())
        );
        runtime
            .block_on(pool.execute(create_schema.as_str()))
            .map_err(map_db_error)?;
        debug!(schema = dialect.schema(), "connected to postgres target");

        Ok(Self {
            runtime,
            pool,
            dialect,
        })
    }
}

impl Connection for PostgresConnection {
    fn dialect(&self) -> &dyn Dialect {
        &self.dialect
    }

    fn begin(&self) -> SqlResult<Box<dyn Session + '_>> {
        let tx = self.runtime.block_on(self.pool.begin())?;
        Ok(Box::new(PostgresSession {
            runtime: self.runtime.as_ref(),
            dialect: &self.dialect,
            tx,
        }))
    }
}

struct PostgresSession<'a> {
    runtime: &'a Runtime,
    dialect: &'a PostgresDialect,
    tx: Transaction<'static, Postgres>,
}

impl Session for PostgresSession<'_> {
    fn dialect(&self) -> &dyn Dialect {
        self.dialect
    }

    fn execute(&mut self, sql: &str) -> SqlResult<u64> {
        trace!(sql, "postgres execute");
        let tx = &mut self.tx;
        let result = self
            .runtime
            .block_on(async move { (&mut **tx).execute(sql).await })
            .map_err(map_db_error)?;
        Ok(result.rows_affected())
    }

    fn read_metadata(&mut self, table: &str) -> SqlResult<Option<RemoteTableMetadata>> {
        let qualified = self.dialect.qualify(table);
        let tx = &mut self.tx;
        let comment: Option<String> = self
            .runtime
            .block_on(async move {
                sqlx::query_scalar("SELECT obj_description(to_regclass($1), 'pg_class')")
                    .bind(qualified)
                    .fetch_one(&mut **tx)
                    .await
            })
            .map_err(map_db_error)?;
        comment
            .map(|raw| RemoteTableMetadata::decode(table, &raw))
            .transpose()
    }

    fn write_metadata(&mut self, table: &str, metadata: &RemoteTableMetadata) -> SqlResult<()> {
        let sql = format!(
            "COMMENT ON TABLE {} IS {}",
            self.dialect.qualify(table),
            self.dialect.string_literal(&metadata.encode()?)
        );
        self.execute(&sql)?;
        Ok(())
    }

    fn list_metadata(&mut self) -> SqlResult<Vec<(String, RemoteTableMetadata)>> {
        let schema = self.dialect.schema().to_string();
        let tx = &mut self.tx;
        let rows: Vec<(String, Option<String>)> = self
            .runtime
            .block_on(async move {
                sqlx::query_as(
                    "SELECT c.relname::text, obj_description(c.oid, 'pg_class') \
                     FROM pg_class c JOIN pg_namespace n ON n.oid = c.relnamespace \
                     WHERE n.nspname = $1 AND c.relkind = 'r'",
                )
                .bind(schema)
                .fetch_all(&mut **tx)
                .await
            })
            .map_err(map_db_error)?;

        let mut tables = Vec::new();
        for (name, comment) in rows {
            let Some(raw) = comment else {
                continue;
            };
            match RemoteTableMetadata::decode(&name, &raw) {
                Ok(metadata) => tables.push((name, metadata)),
                Err(err) => trace!(table = %name, %err, "ignoring table without sink metadata"),
            }
        }
        Ok(tables)
    }

    fn rename_table(&mut self, from: &str, to: &str) -> SqlResult<()> {
        let sql = format!(
            "ALTER TABLE {} RENAME TO {}",
            self.dialect.qualify(from),
            self.dialect.quote(to)
        );
        self.execute(&sql)?;
        Ok(())
    }

    fn drop_table(&mut self, table: &str) -> SqlResult<()> {
        let sql = format!("DROP TABLE IF EXISTS {}", self.dialect.qualify(table));
        self.execute(&sql)?;
        Ok(())
    }

    fn stage_rows(
        &mut self,
        table: &str,
        columns: &[StagedColumn],
        rows: &[Vec<SqlValue>],
    ) -> SqlResult<u64> {
        let names: Vec<String> = std::iter::once(STAGE_ROW_COLUMN)
            .chain(columns.iter().map(|c| c.name.as_str()))
            .map(|name| self.dialect.quote(name))
            .collect();
        let prefix = format!("INSERT INTO {} ({}) ", self.dialect.quote(table), names.join(", "));
        let per_statement = rows_per_statement(self.dialect, columns.len());

        let mut staged = 0;
        for (chunk_index, chunk) in rows.chunks(per_statement).enumerate() {
            let offset = chunk_index * per_statement;
            let mut builder: QueryBuilder<Postgres> = QueryBuilder::new(prefix.as_str());
            builder.push_values(chunk.iter().enumerate(), |mut tuple, (index, row)| {
                tuple.push_bind((offset + index) as i64);
                for (column, value) in columns.iter().zip(row) {
                    push_value(&mut tuple, column.kind, value);
                }
            });
            let tx = &mut self.tx;
            let result = self
                .runtime
                .block_on(async move { builder.build().execute(&mut **tx).await })
                .map_err(map_db_error)?;
            staged += result.rows_affected();
        }
        trace!(table, rows = staged, "staged rows");
        Ok(staged)
    }

    fn commit(self: Box<Self>) -> SqlResult<()> {
        let PostgresSession { runtime, tx, .. } = *self;
        runtime.block_on(tx.commit())?;
        Ok(())
    }

    fn rollback(self: Box<Self>) -> SqlResult<()> {
        let PostgresSession { runtime, tx, .. } = *self;
        runtime.block_on(tx.rollback())?;
        Ok(())
    }
}

/// NULLs are bound with the column's type so Postgres accepts them.
fn push_value(tuple: &mut Separated<'_, '_, Postgres, &'static str>, kind: LeafKind, value: &SqlValue) {
    match value {
        SqlValue::Null => match kind {
            LeafKind::String => tuple.push_bind(None::<String>),
            LeafKind::DateTime => tuple.push_bind(None::<DateTime<Utc>>),
            LeafKind::Integer => tuple.push_bind(None::<i64>),
            LeafKind::Number => tuple.push_bind(None::<f64>),
            LeafKind::Boolean => tuple.push_bind(None::<bool>),
        },
        SqlValue::Text(text) => tuple.push_bind(text.clone()),
        SqlValue::Integer(value) => tuple.push_bind(*value),
        SqlValue::Float(value) => tuple.push_bind(*value),
        SqlValue::Boolean(value) => tuple.push_bind(*value),
        SqlValue::Timestamp(value) => tuple.push_bind(*value),
    };
}

fn build_runtime() -> SqlResult<Runtime> {
    match Builder::new_multi_thread().enable_all().build() {
        Ok(runtime) => Ok(runtime),
        Err(err) => {
            warn!("failed to build multi-threaded runtime, falling back: {err}");
            Builder::new_current_thread()
                .enable_all()
                .build()
                .map_err(|fallback_err| {
                    SqlError::connection_error(format!(
                        "failed to build tokio runtime: {err}; fallback error: {fallback_err}"
                    ))
                })
        }
    }
}

fn map_db_error(err: sqlx::Error) -> SqlError {
    SqlError::query_error(format!("postgres query failed: {err}"))
}
