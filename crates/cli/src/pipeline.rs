//! Line-driven driver tying the stream tracker to the persistence engine.

use std::io::{BufRead, Write};

use serde_json::Value;
use tablesink_core::{AddOutcome, FlushedBatch, Message, StreamTracker};
use tablesink_observability as observability;
use tablesink_sql::{Connection, PersistenceEngine};
use tracing::{debug, info, warn};

use crate::config::SinkConfig;
use crate::error::SinkError;

/// Counters reported at the end of a run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Non-blank input lines consumed.
    pub lines: u64,
    /// Records accepted into a buffer.
    pub records: u64,
    /// Rows written across all tables.
    pub rows_written: u64,
    /// Checkpoint lines written to the output.
    pub checkpoints_emitted: u64,
}

/// Single-threaded sink run over one target connection.
pub struct Pipeline<C: Connection> {
    config: SinkConfig,
    tracker: StreamTracker,
    engine: PersistenceEngine<C>,
    summary: RunSummary,
}

impl<C: Connection> Pipeline<C> {
    /// Builds a pipeline over an open connection.
    pub fn new(config: SinkConfig, connection: C) -> Self {
        let tracker = StreamTracker::new(config.buffer_limits(), config.invalid_record_policy());
        let engine = PersistenceEngine::new(connection, config.engine_options());
        Self {
            config,
            tracker,
            engine,
            summary: RunSummary::default(),
        }
    }

    /// Persistence engine of this pipeline.
    pub fn engine(&self) -> &PersistenceEngine<C> {
        &self.engine
    }

    /// Consumes `input` to the end, writing released checkpoints to `output`.
    ///
    /// Invalid records collected along the way are reported whether or not
    /// the run succeeds.
    pub fn run<R: BufRead, W: Write>(
        &mut self,
        input: R,
        output: &mut W,
    ) -> Result<RunSummary, SinkError> {
        let result = self.consume(input, output);
        self.report_invalid_records();
        match &result {
            Ok(summary) => info!(
                lines = summary.lines,
                records = summary.records,
                rows = summary.rows_written,
                checkpoints = summary.checkpoints_emitted,
                "run complete"
            ),
            Err(err) => warn!(error = %err, lines = self.summary.lines, "run aborted"),
        }
        result
    }

    fn consume<R: BufRead, W: Write>(
        &mut self,
        input: R,
        output: &mut W,
    ) -> Result<RunSummary, SinkError> {
        if let Some(sql) = self.config.before_run_sql.clone() {
            self.engine.execute_sql(&sql)?;
        }

        let threshold = self.config.batch_detection_threshold().max(1) as u64;
        let mut line_number = 0u64;
        for line in input.lines() {
            let line = line?;
            line_number += 1;
            if line.trim().is_empty() {
                continue;
            }
            self.summary.lines += 1;

            let message = Message::parse(&line).map_err(|source| SinkError::Message {
                line: line_number,
                source,
            })?;
            self.dispatch(message, output)?;

            if self.summary.lines % threshold == 0 {
                self.flush(false, output)?;
            }
        }

        self.flush(true, output)?;

        if self.config.persist_empty_tables {
            for batch in self.tracker.empty_batches() {
                debug!(stream = %batch.stream, "persisting empty table");
                self.write(&batch)?;
            }
        }
        if let Some(sql) = self.config.after_run_sql.clone() {
            self.engine.execute_sql(&sql)?;
        }
        Ok(self.summary)
    }

    fn dispatch<W: Write>(&mut self, message: Message, output: &mut W) -> Result<(), SinkError> {
        match message {
            Message::Schema(schema) => {
                if let Some(batch) = self.tracker.register_stream(&schema)? {
                    self.write(&batch)?;
                    self.emit_checkpoint(false, output)?;
                }
            }
            Message::Record(record) => {
                let (drained, outcome) = self.tracker.handle_record(&record)?;
                if let Some(batch) = drained {
                    self.write(&batch)?;
                    self.emit_checkpoint(false, output)?;
                }
                if outcome == AddOutcome::Accepted {
                    self.summary.records += 1;
                }
            }
            Message::ActivateVersion(activation) => {
                if let Some(batch) = self.tracker.flush_stream(&activation.stream)? {
                    self.write(&batch)?;
                }
                self.engine
                    .activate_version(&activation.stream, activation.version)?;
                self.emit_checkpoint(false, output)?;
            }
            Message::State(state) => {
                if self.config.state_support {
                    self.tracker.handle_checkpoint(state.value);
                }
            }
        }
        Ok(())
    }

    /// Writes full buffers (every non-empty one when `force`) and releases
    /// whatever checkpoint became safe.
    fn flush<W: Write>(&mut self, force: bool, output: &mut W) -> Result<(), SinkError> {
        for batch in self.tracker.flush_streams(force) {
            self.write(&batch)?;
        }
        self.emit_checkpoint(force, output)
    }

    fn write(&mut self, batch: &FlushedBatch) -> Result<(), SinkError> {
        let rows = self.engine.write_batch(batch)?;
        info!(
            stream = %batch.stream,
            records = batch.len(),
            rows,
            version = ?batch.version,
            "batch written"
        );
        self.summary.rows_written += rows;
        Ok(())
    }

    fn emit_checkpoint<W: Write>(&mut self, force: bool, output: &mut W) -> Result<(), SinkError> {
        let Some(payload) = self.tracker.emittable_checkpoint(force) else {
            return Ok(());
        };
        write_checkpoint(output, &payload)?;
        self.summary.checkpoints_emitted += 1;
        observability::record_checkpoint_emitted(self.tracker.pending_checkpoints());
        Ok(())
    }

    fn report_invalid_records(&mut self) {
        for (stream, records) in self.tracker.take_invalid_records() {
            observability::record_invalid_records(&stream, records.len());
            for invalid in records {
                warn!(
                    stream = %stream,
                    record = %invalid.record,
                    errors = ?invalid.errors,
                    "invalid record"
                );
            }
        }
    }
}

fn write_checkpoint<W: Write>(output: &mut W, payload: &Value) -> Result<(), SinkError> {
    serde_json::to_writer(&mut *output, payload).map_err(std::io::Error::from)?;
    output.write_all(b"\n")?;
    output.flush()?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn checkpoints_are_single_lines() -> Result<(), Box<dyn std::error::Error>> {
        let mut out = Vec::new();
        write_checkpoint(&mut out, &json!({"bookmarks": {"users": {"cursor": 3}}}))?;
        write_checkpoint(&mut out, &json!("plain"))?;
        assert_eq!(
            String::from_utf8(out)?,
            "{\"bookmarks\":{\"users\":{\"cursor\":3}}}\n\"plain\"\n"
        );
        Ok(())
    }
}
