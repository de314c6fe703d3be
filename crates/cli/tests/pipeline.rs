use std::io::Cursor;

use serde_json::{json, Value};
use sqlx::sqlite::{SqlitePoolOptions, SqliteRow};
use sqlx::FromRow;
use tablesink_cli::{run, RunSummary, SinkConfig, SinkError};
use tablesink_core::{MessageError, StreamError};
use tempfile::NamedTempFile;
use tokio::runtime::Builder;

type TestResult = Result<(), Box<dyn std::error::Error>>;

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

fn config(dsn: &str, overrides: Value) -> Result<SinkConfig, Box<dyn std::error::Error>> {
    let mut raw = json!({ "target_url": dsn });
    if let (Some(base), Value::Object(extra)) = (raw.as_object_mut(), overrides) {
        base.extend(extra);
    }
    Ok(SinkConfig::from_json(&raw.to_string())?)
}

fn lines(messages: &[Value]) -> String {
    messages
        .iter()
        .map(Value::to_string)
        .collect::<Vec<_>>()
        .join("\n")
}

fn sink(
    dsn: &str,
    overrides: Value,
    messages: &[Value],
) -> Result<(Result<RunSummary, SinkError>, Vec<Value>), Box<dyn std::error::Error>> {
    let mut output = Vec::new();
    let result = run(
        config(dsn, overrides)?,
        Cursor::new(lines(messages)),
        &mut output,
    );
    let emitted = String::from_utf8(output)?
        .lines()
        .map(serde_json::from_str)
        .collect::<Result<Vec<Value>, _>>()?;
    Ok((result, emitted))
}

fn with_target<F>(f: F) -> TestResult
where
    F: FnOnce(&str) -> TestResult,
{
    let file = NamedTempFile::new()?;
    let dsn = format!("sqlite://{}", file.path().display());
    f(&dsn)
}

fn schema(stream: &str) -> Value {
    json!({
        "type": "SCHEMA",
        "stream": stream,
        "schema": {
            "type": "object",
            "properties": {
                "id": {"type": "integer"},
                "name": {"type": ["null", "string"]}
            }
        },
        "key_properties": ["id"]
    })
}

fn record(stream: &str, id: i64, name: &str) -> Value {
    json!({"type": "RECORD", "stream": stream, "record": {"id": id, "name": name}})
}

fn state(cursor: i64) -> Value {
    json!({"type": "STATE", "value": {"cursor": cursor}})
}

#[test]
fn final_flush_writes_rows_and_releases_last_checkpoint() -> TestResult {
    with_target(|dsn| {
        let (result, emitted) = sink(
            dsn,
            json!({}),
            &[
                schema("users"),
                record("users", 1, "a"),
                record("users", 2, "b"),
                state(1),
                record("users", 1, "c"),
                state(2),
            ],
        )?;
        let summary = result?;
        assert_eq!(summary.lines, 6);
        assert_eq!(summary.records, 3);
        assert_eq!(summary.rows_written, 2);
        assert_eq!(summary.checkpoints_emitted, 1);
        assert_eq!(emitted, vec![json!({"cursor": 2})]);

        let rows: Vec<(i64, String)> = fetch(dsn, "SELECT id, name FROM users ORDER BY id")?;
        assert_eq!(rows, vec![(1, "c".to_string()), (2, "b".to_string())]);
        Ok(())
    })
}

#[test]
fn checkpoint_waits_for_every_stream_with_pending_records() -> TestResult {
    with_target(|dsn| {
        let (result, emitted) = sink(
            dsn,
            json!({"max_batch_rows": 2, "batch_detection_threshold": 1}),
            &[
                schema("a"),
                schema("b"),
                record("a", 1, "x"),
                record("a", 2, "y"),
                state(1),
                record("b", 1, "z"),
                state(2),
                record("a", 3, "w"),
                record("a", 4, "v"),
                state(3),
            ],
        )?;
        result?;
        // state 2 is held back by b's pending record until the final flush,
        // which then releases only the newest checkpoint.
        assert_eq!(emitted, vec![json!({"cursor": 1}), json!({"cursor": 3})]);

        let a: Vec<(i64,)> = fetch(dsn, "SELECT COUNT(*) FROM a")?;
        let b: Vec<(i64,)> = fetch(dsn, "SELECT COUNT(*) FROM b")?;
        assert_eq!((a, b), (vec![(4,)], vec![(1,)]));
        Ok(())
    })
}

#[test]
fn repeated_checkpoint_is_emitted_once() -> TestResult {
    with_target(|dsn| {
        let (result, emitted) = sink(
            dsn,
            json!({"batch_detection_threshold": 1}),
            &[schema("users"), state(1), state(1), record("users", 1, "a")],
        )?;
        result?;
        assert_eq!(emitted, vec![json!({"cursor": 1})]);
        Ok(())
    })
}

#[test]
fn disabled_state_support_emits_nothing() -> TestResult {
    with_target(|dsn| {
        let (result, emitted) = sink(
            dsn,
            json!({"state_support": false}),
            &[schema("users"), record("users", 1, "a"), state(1)],
        )?;
        assert_eq!(result?.checkpoints_emitted, 0);
        assert!(emitted.is_empty());
        Ok(())
    })
}

#[test]
fn activation_replaces_the_visible_table() -> TestResult {
    with_target(|dsn| {
        let versioned = |id: i64, version: i64| {
            json!({
                "type": "RECORD",
                "stream": "users",
                "record": {"id": id, "name": "n"},
                "version": version
            })
        };
        let (result, _) = sink(
            dsn,
            json!({}),
            &[
                schema("users"),
                versioned(1, 1),
                versioned(2, 1),
                json!({"type": "ACTIVATE_VERSION", "stream": "users", "version": 1}),
                versioned(3, 2),
                json!({"type": "ACTIVATE_VERSION", "stream": "users", "version": 2}),
            ],
        )?;
        result?;

        let rows: Vec<(i64, i64)> =
            fetch(dsn, "SELECT id, _sdc_table_version FROM users ORDER BY id")?;
        assert_eq!(rows, vec![(3, 2)]);
        Ok(())
    })
}

#[test]
fn hooks_and_empty_tables() -> TestResult {
    with_target(|dsn| {
        let (result, _) = sink(
            dsn,
            json!({
                "persist_empty_tables": true,
                "before_run_sql": "CREATE TABLE audit (note TEXT)",
                "after_run_sql": "INSERT INTO audit (note) VALUES ('done')"
            }),
            &[schema("quiet")],
        )?;
        assert_eq!(result?.rows_written, 0);

        let quiet: Vec<(i64,)> = fetch(dsn, "SELECT COUNT(*) FROM quiet")?;
        assert_eq!(quiet, vec![(0,)]);
        let audit: Vec<(String,)> = fetch(dsn, "SELECT note FROM audit")?;
        assert_eq!(audit, vec![("done".to_string(),)]);
        Ok(())
    })
}

#[test]
fn invalid_record_aborts_by_default() -> TestResult {
    with_target(|dsn| {
        let bad = json!({"type": "RECORD", "stream": "users", "record": {"id": "one"}});
        let (result, emitted) = sink(dsn, json!({}), &[schema("users"), bad.clone()])?;
        assert!(matches!(
            result,
            Err(SinkError::Stream(StreamError::InvalidRecords { .. }))
        ));
        assert!(emitted.is_empty());

        let (result, _) = sink(
            dsn,
            json!({"invalid_records_threshold": 5}),
            &[schema("users"), bad, record("users", 2, "b")],
        )?;
        assert_eq!(result?.records, 1);
        Ok(())
    })
}

#[test]
fn input_errors_are_fatal() -> TestResult {
    with_target(|dsn| {
        let (result, _) = sink(dsn, json!({}), &[record("ghost", 1, "a")])?;
        assert!(matches!(
            result,
            Err(SinkError::Stream(StreamError::UnregisteredStream(stream))) if stream == "ghost"
        ));

        let (result, _) = sink(
            dsn,
            json!({}),
            &[json!({"type": "ACTIVATE_VERSION", "stream": "ghost", "version": 1})],
        )?;
        assert!(matches!(
            result,
            Err(SinkError::Stream(StreamError::UnregisteredStream(_)))
        ));

        let (result, _) = sink(dsn, json!({}), &[schema("users"), json!({"type": "BOGUS"})])?;
        assert!(matches!(
            result,
            Err(SinkError::Message {
                line: 2,
                source: MessageError::UnknownKind(_)
            })
        ));
        Ok(())
    })
}
