//! SQLite-backed `Connection` implementation.
//!
//! SQLite has no table comments, so metadata lives in a side table that is
//! renamed and dropped together with the tables it describes.

use std::str::FromStr;
use std::sync::Arc;

use chrono::SecondsFormat;
use sqlx::query_builder::Separated;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Executor, QueryBuilder, Sqlite, Transaction};
use tokio::runtime::{Builder, Runtime};
use tracing::{debug, trace, warn};

use crate::dialect::{Dialect, SqliteDialect};
use crate::error::{SqlError, SqlResult};
use crate::merge::STAGE_ROW_COLUMN;
use crate::metadata::RemoteTableMetadata;
use crate::session::{rows_per_statement, Connection, Session, SqlValue, StagedColumn};

/// Side table holding per-table metadata documents.
pub const METADATA_TABLE: &str = "_tablesink_table_metadata";

/// SQLite target database.
#[derive(Debug)]
pub struct SqliteConnection {
    runtime: Arc<Runtime>,
    pool: SqlitePool,
    dialect: SqliteDialect,
}

impl SqliteConnection {
    /// Opens (creating if missing) the database at `dsn`, e.g. `sqlite:///tmp/sink.db`.
    pub fn connect(dsn: impl AsRef<str>) -> SqlResult<Self> {
        let runtime = Arc::new(build_runtime()?);
        let options = SqliteConnectOptions::from_str(dsn.as_ref())
            .map_err(|err| SqlError::connection_error(format!("invalid sqlite dsn: {err}")))?
            .create_if_missing(true);
        let pool = runtime
            .block_on(
                SqlitePoolOptions::new()
                    .max_connections(1)
                    .idle_timeout(None)
                    .max_lifetime(None)
                    .connect_with(options),
            )
            .map_err(|err| SqlError::connection_error(format!("sqlite connect failed: {err}")))?;

        let create_metadata = format!(
            "CREATE TABLE IF NOT EXISTS {METADATA_TABLE} \
             (table_name TEXT PRIMARY KEY, metadata TEXT NOT NULL)"
        );
        runtime
            .block_on(pool.execute(create_metadata.as_str()))
            .map_err(sqlite_err)?;
        debug!(dsn = dsn.as_ref(), "opened sqlite target");

        Ok(Self {
            runtime,
            pool,
            dialect: SqliteDialect,
        })
    }
}

impl Connection for SqliteConnection {
    fn dialect(&self) -> &dyn Dialect {
        &self.dialect
    }

    fn begin(&self) -> SqlResult<Box<dyn Session + '_>> {
        let tx = self.runtime.block_on(self.pool.begin())?;
        Ok(Box::new(SqliteSession {
            runtime: self.runtime.as_ref(),
            dialect: &self.dialect,
            tx,
        }))
    }
}

struct SqliteSession<'a> {
    runtime: &'a Runtime,
    dialect: &'a SqliteDialect,
    tx: Transaction<'static, Sqlite>,
}

impl Session for SqliteSession<'_> {
    fn dialect(&self) -> &dyn Dialect {
        self.dialect
    }

    fn execute(&mut self, sql: &str) -> SqlResult<u64> {
        trace!(sql, "sqlite execute");
        let tx = &mut self.tx;
        let result = self
            .runtime
            .block_on(async move { (&mut **tx).execute(sql).await })
            .map_err(sqlite_err)?;
        Ok(result.rows_affected())
    }

    fn read_metadata(&mut self, table: &str) -> SqlResult<Option<RemoteTableMetadata>> {
        let sql = format!("SELECT metadata FROM {METADATA_TABLE} WHERE table_name = ?");
        let name = table.to_string();
        let tx = &mut self.tx;
        let raw: Option<String> = self
            .runtime
            .block_on(async move {
                sqlx::query_scalar(&sql)
                    .bind(name)
                    .fetch_optional(&mut **tx)
                    .await
            })
            .map_err(sqlite_err)?;
        raw.map(|raw| RemoteTableMetadata::decode(table, &raw))
            .transpose()
    }

    fn write_metadata(&mut self, table: &str, metadata: &RemoteTableMetadata) -> SqlResult<()> {
        let sql = format!(
            "INSERT INTO {METADATA_TABLE} (table_name, metadata) VALUES (?, ?) \
             ON CONFLICT(table_name) DO UPDATE SET metadata = excluded.metadata"
        );
        let encoded = metadata.encode()?;
        let name = table.to_string();
        let tx = &mut self.tx;
        self.runtime
            .block_on(async move {
                sqlx::query(&sql)
                    .bind(name)
                    .bind(encoded)
                    .execute(&mut **tx)
                    .await
            })
            .map_err(sqlite_err)?;
        Ok(())
    }

    fn list_metadata(&mut self) -> SqlResult<Vec<(String, RemoteTableMetadata)>> {
        let sql = format!("SELECT table_name, metadata FROM {METADATA_TABLE} ORDER BY table_name");
        let tx = &mut self.tx;
        let rows: Vec<(String, String)> = self
            .runtime
            .block_on(async move { sqlx::query_as(&sql).fetch_all(&mut **tx).await })
            .map_err(sqlite_err)?;

        let mut tables = Vec::with_capacity(rows.len());
        for (name, raw) in rows {
            match RemoteTableMetadata::decode(&name, &raw) {
                Ok(metadata) => tables.push((name, metadata)),
                Err(err) => warn!(table = %name, %err, "skipping unreadable table metadata"),
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

        let (from, to) = (from.to_string(), to.to_string());
        let tx = &mut self.tx;
        self.runtime
            .block_on(async move {
                sqlx::query(&format!("DELETE FROM {METADATA_TABLE} WHERE table_name = ?"))
                    .bind(to.clone())
                    .execute(&mut **tx)
                    .await?;
                sqlx::query(&format!(
                    "UPDATE {METADATA_TABLE} SET table_name = ? WHERE table_name = ?"
                ))
                .bind(to)
                .bind(from)
                .execute(&mut **tx)
                .await
            })
            .map_err(sqlite_err)?;
        Ok(())
    }

    fn drop_table(&mut self, table: &str) -> SqlResult<()> {
        let sql = format!("DROP TABLE IF EXISTS {}", self.dialect.qualify(table));
        self.execute(&sql)?;

        let name = table.to_string();
        let tx = &mut self.tx;
        self.runtime
            .block_on(async move {
                sqlx::query(&format!("DELETE FROM {METADATA_TABLE} WHERE table_name = ?"))
                    .bind(name)
                    .execute(&mut **tx)
                    .await
            })
            .map_err(sqlite_err)?;
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
            let mut builder: QueryBuilder<Sqlite> = QueryBuilder::new(prefix.as_str());
            builder.push_values(chunk.iter().enumerate(), |mut tuple, (index, row)| {
                tuple.push_bind((offset + index) as i64);
                for value in row {
                    push_value(&mut tuple, value);
                }
            });
            let tx = &mut self.tx;
            let result = self
                .runtime
                .block_on(async move { builder.build().execute(&mut **tx).await })
                .map_err(sqlite_err)?;
            staged += result.rows_affected();
        }
        trace!(table, rows = staged, "staged rows");
        Ok(staged)
    }

    fn commit(self: Box<Self>) -> SqlResult<()> {
        let SqliteSession { runtime, tx, .. } = *self;
        runtime.block_on(tx.commit())?;
        Ok(())
    }

    fn rollback(self: Box<Self>) -> SqlResult<()> {
        let SqliteSession { runtime, tx, .. } = *self;
        runtime.block_on(tx.rollback())?;
        Ok(())
    }
}

/// Timestamps are stored as RFC 3339 text.
fn push_value(tuple: &mut Separated<'_, '_, Sqlite, &'static str>, value: &SqlValue) {
    match value {
        SqlValue::Null => tuple.push_bind(None::<String>),
        SqlValue::Text(text) => tuple.push_bind(text.clone()),
        SqlValue::Integer(value) => tuple.push_bind(*value),
        SqlValue::Float(value) => tuple.push_bind(*value),
        SqlValue::Boolean(value) => tuple.push_bind(*value),
        SqlValue::Timestamp(value) => {
            tuple.push_bind(value.to_rfc3339_opts(SecondsFormat::Micros, true))
        }
    };
}

fn build_runtime() -> SqlResult<Runtime> {
    Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(|err| SqlError::connection_error(format!("failed to build tokio runtime: {err}")))
}

fn sqlite_err(err: sqlx::Error) -> SqlError {
    SqlError::query_error(format!("sqlite query failed: {err}"))
}
