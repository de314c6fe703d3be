//! Structured metric events for the tablesink pipeline.
//!
//! Metrics are plain `tracing` events carrying a `metric` field so any
//! subscriber can pick them up; process-wide totals live in atomics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tracing::{info, warn};

static BATCHES_WRITTEN_TOTAL: AtomicU64 = AtomicU64::new(0);
static ROWS_WRITTEN_TOTAL: AtomicU64 = AtomicU64::new(0);
static BATCH_FAILURES_TOTAL: AtomicU64 = AtomicU64::new(0);
static CHECKPOINTS_EMITTED_TOTAL: AtomicU64 = AtomicU64::new(0);
static INVALID_RECORDS_TOTAL: AtomicU64 = AtomicU64::new(0);
static VERSIONS_ACTIVATED_TOTAL: AtomicU64 = AtomicU64::new(0);

fn duration_ms(duration: Duration) -> f64 {
    duration.as_secs_f64() * 1000.0
}

/// Records a committed write batch with its latency and row count.
pub fn record_batch_written(stream: &str, tables: usize, rows: u64, duration: Duration) {
    let batches = BATCHES_WRITTEN_TOTAL.fetch_add(1, Ordering::Relaxed) + 1;
    let total_rows = ROWS_WRITTEN_TOTAL.fetch_add(rows, Ordering::Relaxed) + rows;
    info!(
        metric = "batch_write_latency_ms",
        stream,
        tables,
        rows,
        latency_ms = duration_ms(duration),
        batches_written_total = batches,
        rows_written_total = total_rows
    );
}

/// Marks a rolled-back write batch.
pub fn record_batch_failure(stream: &str, error: &str) {
    let total = BATCH_FAILURES_TOTAL.fetch_add(1, Ordering::Relaxed) + 1;
    warn!(
        metric = "batch_write_failure",
        stream,
        error,
        batch_failures_total = total
    );
}

/// Records a checkpoint released to the output.
pub fn record_checkpoint_emitted(pending: usize) {
    let total = CHECKPOINTS_EMITTED_TOTAL.fetch_add(1, Ordering::Relaxed) + 1;
    info!(
        metric = "checkpoint_emitted",
        pending,
        checkpoints_emitted_total = total
    );
}

/// Records invalid records reported for a stream.
pub fn record_invalid_records(stream: &str, count: usize) {
    let total = INVALID_RECORDS_TOTAL.fetch_add(count as u64, Ordering::Relaxed) + count as u64;
    warn!(
        metric = "invalid_records",
        stream,
        count,
        invalid_records_total = total
    );
}

/// Records a table-version cutover.
pub fn record_version_activated(stream: &str, version: i64, tables: usize) {
    let total = VERSIONS_ACTIVATED_TOTAL.fetch_add(1, Ordering::Relaxed) + 1;
    info!(
        metric = "version_activated",
        stream,
        version,
        tables,
        versions_activated_total = total
    );
}

/// Rows written by every batch recorded so far in this process.
pub fn rows_written_total() -> u64 {
    ROWS_WRITTEN_TOTAL.load(Ordering::Relaxed)
}

/// Checkpoints emitted so far in this process.
pub fn checkpoints_emitted_total() -> u64 {
    CHECKPOINTS_EMITTED_TOTAL.load(Ordering::Relaxed)
}
