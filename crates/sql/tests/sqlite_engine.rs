use chrono::Utc;
use serde_json::{json, Value};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::FromRow;
use tablesink_core::{
    BufferLimits, FieldPath, FlushedBatch, InvalidRecordPolicy, LeafKind, RecordMessage,
    StreamBuffer,
};
use tablesink_sql::{Connection, EngineOptions, PersistenceEngine, SqlError, SqliteConnection};
use tempfile::NamedTempFile;
use tokio::runtime::Builder;

type TestResult = Result<(), Box<dyn std::error::Error>>;

struct Row {
    record: Value,
    sequence: Option<i64>,
    version: Option<i64>,
}

fn row(record: Value, sequence: i64) -> Row {
    Row {
        record,
        sequence: Some(sequence),
        version: None,
    }
}

fn versioned(record: Value, version: i64) -> Row {
    Row {
        record,
        sequence: None,
        version: Some(version),
    }
}

fn batch(
    stream: &str,
    schema: &Value,
    keys: &[&str],
    rows: Vec<Row>,
) -> Result<FlushedBatch, Box<dyn std::error::Error>> {
    let keys: Vec<String> = keys.iter().map(|k| k.to_string()).collect();
    let mut buffer = StreamBuffer::new(
        stream,
        schema,
        &keys,
        BufferLimits::default(),
        InvalidRecordPolicy::default(),
    )?;
    for row in rows {
        buffer.add_record(
            &RecordMessage {
                stream: stream.to_string(),
                record: row.record,
                version: row.version,
                sequence: row.sequence,
                time_extracted: None,
            },
            Utc::now(),
        )?;
    }
    Ok(buffer.drain_batch())
}

fn fetch<T>(dsn: &str, sql: &str) -> Result<Vec<T>, Box<dyn std::error::Error>>
where
    T: for<'r> FromRow<'r, SqliteRow> + Send + Unpin,
{
    let runtime = Builder::new_current_thread().enable_all().build()?;
    let rows = runtime.block_on(async {
        let pool = SqlitePoolOptions::new().max_connections(1).connect(dsn).await?;
        let rows = sqlx::query_as::<_, T>(sql).fetch_all(&pool).await?;
        pool.close().await;
        Ok::<_, sqlx::Error>(rows)
    })?;
    Ok(rows)
}

fn with_engine<F>(f: F) -> TestResult
where
    F: FnOnce(&str, PersistenceEngine<SqliteConnection>) -> TestResult,
{
    let tmp = NamedTempFile::new()?;
    let dsn = format!("sqlite://{}", tmp.path().display());
    let engine = PersistenceEngine::new(SqliteConnection::connect(&dsn)?, EngineOptions::default());
    f(&dsn, engine)
}

fn users_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "id": {"type": "integer"},
            "name": {"type": "string"}
        }
    })
}

#[test]
fn highest_sequence_wins_within_and_across_batches() -> TestResult {
    with_engine(|dsn, engine| {
        let schema = users_schema();
        let first = batch(
            "users",
            &schema,
            &["id"],
            vec![
                row(json!({"id": 1, "name": "newer"}), 9),
                row(json!({"id": 1, "name": "older"}), 5),
                row(json!({"id": 2, "name": "bob"}), 1),
            ],
        )?;
        assert_eq!(engine.write_batch(&first)?, 2);

        let rows: Vec<(i64, String, i64)> = fetch(
            dsn,
            "SELECT id, name, _sdc_sequence FROM users ORDER BY id",
        )?;
        assert_eq!(
            rows,
            vec![(1, "newer".to_string(), 9), (2, "bob".to_string(), 1)]
        );

        let late = batch("users", &schema, &["id"], vec![row(json!({"id": 1, "name": "late"}), 7)])?;
        assert_eq!(engine.write_batch(&late)?, 0);

        let update = batch("users", &schema, &["id"], vec![row(json!({"id": 1, "name": "final"}), 12)])?;
        assert_eq!(engine.write_batch(&update)?, 1);

        let rows: Vec<(i64, String)> = fetch(dsn, "SELECT id, name FROM users ORDER BY id")?;
        assert_eq!(
            rows,
            vec![(1, "final".to_string()), (2, "bob".to_string())]
        );
        Ok(())
    })
}

#[test]
fn child_rows_are_replaced_with_their_parent() -> TestResult {
    with_engine(|dsn, engine| {
        let schema = json!({
            "type": "object",
            "properties": {
                "id": {"type": "integer"},
                "lines": {
                    "type": "array",
                    "items": {"type": "object", "properties": {"sku": {"type": "string"}}}
                }
            }
        });
        let first = batch(
            "orders",
            &schema,
            &["id"],
            vec![row(json!({"id": 1, "lines": [{"sku": "a"}, {"sku": "b"}]}), 1)],
        )?;
        assert_eq!(engine.write_batch(&first)?, 3);

        let rows: Vec<(i64, i64, String)> = fetch(
            dsn,
            "SELECT _sdc_source_key_id, _sdc_level_0_id, sku FROM orders__lines ORDER BY _sdc_level_0_id",
        )?;
        assert_eq!(rows, vec![(1, 0, "a".to_string()), (1, 1, "b".to_string())]);

        let shrunk = batch(
            "orders",
            &schema,
            &["id"],
            vec![row(json!({"id": 1, "lines": [{"sku": "c"}]}), 2)],
        )?;
        engine.write_batch(&shrunk)?;

        let rows: Vec<(i64, i64, String)> = fetch(
            dsn,
            "SELECT _sdc_source_key_id, _sdc_level_0_id, sku FROM orders__lines",
        )?;
        assert_eq!(rows, vec![(1, 0, "c".to_string())]);
        Ok(())
    })
}

fn orders_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "id": {"type": "integer"},
            "lines": {
                "type": "array",
                "items": {"type": "object", "properties": {"sku": {"type": "string"}}}
            }
        }
    })
}

fn order_lines(dsn: &str) -> Result<Vec<(i64, i64, i64, String)>, Box<dyn std::error::Error>> {
    fetch(
        dsn,
        "SELECT _sdc_source_key_id, _sdc_level_0_id, _sdc_sequence, sku FROM orders__lines \
         ORDER BY _sdc_source_key_id, _sdc_level_0_id",
    )
}

#[test]
fn omitted_optional_field_without_default_is_stored_as_null() -> TestResult {
    with_engine(|dsn, engine| {
        let schema = json!({
            "type": "object",
            "properties": {
                "id": {"type": "integer"},
                "seen_at": {"type": "string", "format": "date-time"}
            },
            "required": ["id"]
        });
        let written = engine.write_batch(&batch(
            "visits",
            &schema,
            &["id"],
            vec![
                row(json!({"id": 1, "seen_at": "2020-01-01T00:00:00Z"}), 1),
                row(json!({"id": 2}), 2),
            ],
        )?)?;
        assert_eq!(written, 2);

        let rows: Vec<(i64, i64)> =
            fetch(dsn, "SELECT id, seen_at IS NULL FROM visits ORDER BY id")?;
        assert_eq!(rows, vec![(1, 0), (2, 1)]);
        Ok(())
    })
}

#[test]
fn duplicate_parents_keep_only_the_newest_children() -> TestResult {
    with_engine(|dsn, engine| {
        let lines = |skus: &[&str]| -> Value {
            skus.iter().map(|sku| json!({"sku": sku})).collect()
        };
        let written = engine.write_batch(&batch(
            "orders",
            &orders_schema(),
            &["id"],
            vec![
                row(json!({"id": 1, "lines": lines(&["a", "b", "c"])}), 5),
                row(json!({"id": 1, "lines": lines(&["x"])}), 9),
            ],
        )?)?;
        assert_eq!(written, 2);
        assert_eq!(order_lines(dsn)?, vec![(1, 0, 9, "x".to_string())]);

        // Same sequence: the later record wins as a whole.
        engine.write_batch(&batch(
            "orders",
            &orders_schema(),
            &["id"],
            vec![
                row(json!({"id": 2, "lines": lines(&["d", "e"])}), 11),
                row(json!({"id": 2, "lines": lines(&["f"])}), 11),
            ],
        )?)?;
        let rows: Vec<(i64, i64, i64, String)> =
            order_lines(dsn)?.into_iter().filter(|row| row.0 == 2).collect();
        assert_eq!(rows, vec![(2, 0, 11, "f".to_string())]);
        Ok(())
    })
}

#[test]
fn emptied_or_missing_array_clears_old_children() -> TestResult {
    with_engine(|dsn, engine| {
        engine.write_batch(&batch(
            "orders",
            &orders_schema(),
            &["id"],
            vec![
                row(json!({"id": 1, "lines": [{"sku": "a"}, {"sku": "b"}]}), 1),
                row(json!({"id": 2, "lines": [{"sku": "c"}]}), 2),
                row(json!({"id": 3, "lines": [{"sku": "d"}]}), 3),
            ],
        )?)?;
        assert_eq!(order_lines(dsn)?.len(), 4);

        // Every record of this batch drops its array; the child batch is empty.
        engine.write_batch(&batch(
            "orders",
            &orders_schema(),
            &["id"],
            vec![row(json!({"id": 1, "lines": []}), 4), row(json!({"id": 2}), 5)],
        )?)?;
        assert_eq!(order_lines(dsn)?, vec![(3, 0, 3, "d".to_string())]);

        // Older records never clear newer children.
        engine.write_batch(&batch(
            "orders",
            &orders_schema(),
            &["id"],
            vec![row(json!({"id": 3, "lines": []}), 1)],
        )?)?;
        assert_eq!(order_lines(dsn)?, vec![(3, 0, 3, "d".to_string())]);
        Ok(())
    })
}

#[test]
fn type_change_splits_column_into_family() -> TestResult {
    with_engine(|dsn, engine| {
        let as_string = json!({
            "type": "object",
            "properties": {"id": {"type": "integer"}, "flag": {"type": "string"}}
        });
        let as_boolean = json!({
            "type": "object",
            "properties": {"id": {"type": "integer"}, "flag": {"type": "boolean"}}
        });
        engine.write_batch(&batch(
            "things",
            &as_string,
            &["id"],
            vec![row(json!({"id": 1, "flag": "yes"}), 1)],
        )?)?;
        engine.write_batch(&batch(
            "things",
            &as_boolean,
            &["id"],
            vec![row(json!({"id": 2, "flag": true}), 2)],
        )?)?;

        let rows: Vec<(i64, Option<String>, Option<bool>)> = fetch(
            dsn,
            "SELECT id, flag__s, flag__b FROM things ORDER BY id",
        )?;
        assert_eq!(
            rows,
            vec![(1, Some("yes".to_string()), None), (2, None, Some(true))]
        );

        let mut session = engine.connection().begin()?;
        let metadata = session.read_metadata("things")?.ok_or("metadata missing")?;
        session.rollback()?;
        let flag = FieldPath::single("flag");
        assert_eq!(metadata.column_for(&flag, LeafKind::String), Some("flag__s"));
        assert_eq!(metadata.column_for(&flag, LeafKind::Boolean), Some("flag__b"));
        Ok(())
    })
}

#[test]
fn failed_migration_rolls_back_the_whole_batch() -> TestResult {
    with_engine(|dsn, engine| {
        let before = json!({
            "type": "object",
            "properties": {
                "id": {"type": "integer"},
                "lines": {
                    "type": "array",
                    "items": {"type": "object", "properties": {"sku": {"type": "string"}}}
                }
            }
        });
        engine.write_batch(&batch(
            "orders",
            &before,
            &["id"],
            vec![row(json!({"id": 1, "lines": [{"sku": "a"}]}), 1)],
        )?)?;

        let after = json!({
            "type": "object",
            "properties": {
                "id": {"type": "integer"},
                "note": {"type": ["null", "string"]},
                "lines": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {
                            "sku": {"type": "string"},
                            "shipped_at": {"type": "string", "format": "date-time"}
                        },
                        "required": ["sku", "shipped_at"]
                    }
                }
            }
        });
        let err = engine
            .write_batch(&batch(
                "orders",
                &after,
                &["id"],
                vec![row(
                    json!({"id": 2, "note": "x", "lines": [{"sku": "b", "shipped_at": "2024-01-01T00:00:00Z"}]}),
                    2,
                )],
            )?)
            .unwrap_err();
        assert!(matches!(err, SqlError::MissingDefault { ref column, .. } if column == "shipped_at"));

        let mut session = engine.connection().begin()?;
        let root = session.read_metadata("orders")?.ok_or("metadata missing")?;
        session.rollback()?;
        assert_eq!(root.columns_for(&FieldPath::single("note")).count(), 0);

        let ids: Vec<(i64,)> = fetch(dsn, "SELECT id FROM orders")?;
        assert_eq!(ids, vec![(1,)]);
        Ok(())
    })
}

#[test]
fn key_type_change_is_fatal() -> TestResult {
    with_engine(|_, engine| {
        engine.write_batch(&batch(
            "users",
            &users_schema(),
            &["id"],
            vec![row(json!({"id": 1, "name": "a"}), 1)],
        )?)?;
        let retyped = json!({
            "type": "object",
            "properties": {"id": {"type": "string"}, "name": {"type": "string"}}
        });
        let err = engine
            .write_batch(&batch(
                "users",
                &retyped,
                &["id"],
                vec![row(json!({"id": "a", "name": "a"}), 2)],
            )?)
            .unwrap_err();
        assert!(matches!(err, SqlError::KeyColumnTypeChanged { .. }));
        Ok(())
    })
}

#[test]
fn version_activation_swaps_tables() -> TestResult {
    with_engine(|dsn, engine| {
        let schema = users_schema();
        engine.write_batch(&batch(
            "users",
            &schema,
            &["id"],
            vec![
                versioned(json!({"id": 1, "name": "a"}), 1),
                versioned(json!({"id": 2, "name": "b"}), 1),
            ],
        )?)?;
        engine.write_batch(&batch(
            "users",
            &schema,
            &["id"],
            vec![versioned(json!({"id": 3, "name": "c"}), 2)],
        )?)?;

        let visible: Vec<(i64,)> = fetch(dsn, "SELECT id FROM users ORDER BY id")?;
        assert_eq!(visible, vec![(1,), (2,)]);
        let pending: Vec<(i64,)> = fetch(dsn, "SELECT id FROM users__v2")?;
        assert_eq!(pending, vec![(3,)]);

        assert!(engine.activate_version("users", 2)?);
        let visible: Vec<(i64, i64)> = fetch(dsn, "SELECT id, _sdc_table_version FROM users")?;
        assert_eq!(visible, vec![(3, 2)]);
        let leftovers: Vec<(String,)> = fetch(
            dsn,
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE 'users%'",
        )?;
        assert_eq!(leftovers, vec![("users".to_string(),)]);

        assert!(!engine.activate_version("users", 2)?);
        assert!(!engine.activate_version("users", 1)?);

        let stale = batch(
            "users",
            &schema,
            &["id"],
            vec![versioned(json!({"id": 9, "name": "old"}), 1)],
        )?;
        assert_eq!(engine.write_batch(&stale)?, 0);
        let visible: Vec<(i64,)> = fetch(dsn, "SELECT id FROM users")?;
        assert_eq!(visible, vec![(3,)]);
        Ok(())
    })
}

#[test]
fn empty_batches_create_tables() -> TestResult {
    with_engine(|dsn, engine| {
        let keys = vec!["id".to_string()];
        let buffer = StreamBuffer::new(
            "quiet",
            &users_schema(),
            &keys,
            BufferLimits::default(),
            InvalidRecordPolicy::default(),
        )?;
        assert_eq!(engine.write_batch(&buffer.empty_batch())?, 0);
        let count: Vec<(i64,)> = fetch(dsn, "SELECT COUNT(*) FROM quiet")?;
        assert_eq!(count, vec![(0,)]);
        Ok(())
    })
}

#[test]
fn sql_hooks_run_in_the_target() -> TestResult {
    with_engine(|dsn, engine| {
        engine.execute_sql("CREATE TABLE audit (note TEXT); INSERT INTO audit VALUES ('ran')")?;
        let notes: Vec<(String,)> = fetch(dsn, "SELECT note FROM audit")?;
        assert_eq!(notes, vec![("ran".to_string(),)]);
        Ok(())
    })
}
