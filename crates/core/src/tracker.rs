//! Stream registry and checkpoint watermarking.
//!
//! Every record bumps one counter shared by all streams. A stream's
//! `last_added` mark is the counter value of its newest record and its
//! `last_flushed` mark is what `last_added` was when the stream was last
//! drained. A checkpoint received at counter `c` may only be released once
//! every registered stream has `last_flushed >= c`.

use std::collections::{BTreeMap, VecDeque};

use chrono::Utc;
use serde_json::Value;
use tracing::{debug, info};

use crate::buffer::{
    AddOutcome, BufferLimits, FlushedBatch, InvalidRecord, InvalidRecordPolicy, StreamBuffer,
};
use crate::error::StreamError;
use crate::message::{RecordMessage, SchemaMessage};

/// A checkpoint waiting for the streams preceding it to be flushed.
#[derive(Debug, Clone, PartialEq)]
pub struct CheckpointQueueEntry {
    /// Opaque payload, emitted verbatim.
    pub payload: Value,
    /// Record counter when the checkpoint arrived.
    pub counter: u64,
}

#[derive(Debug)]
struct StreamState {
    buffer: StreamBuffer,
    last_added: u64,
    last_flushed: u64,
}

impl StreamState {
    fn drain(&mut self) -> FlushedBatch {
        self.last_flushed = self.last_added;
        self.buffer.drain_batch()
    }
}

/// Owns every stream buffer of a run and decides when checkpoints are safe.
#[derive(Debug)]
pub struct StreamTracker {
    limits: BufferLimits,
    policy: InvalidRecordPolicy,
    streams: BTreeMap<String, StreamState>,
    counter: u64,
    checkpoints: VecDeque<CheckpointQueueEntry>,
    last_emitted: Option<Value>,
}

impl StreamTracker {
    /// Creates a tracker whose buffers use `limits` and `policy`.
    pub fn new(limits: BufferLimits, policy: InvalidRecordPolicy) -> Self {
        Self {
            limits,
            policy,
            streams: BTreeMap::new(),
            counter: 0,
            checkpoints: VecDeque::new(),
            last_emitted: None,
        }
    }

    /// Registers a stream, or updates its schema.
    ///
    /// Records buffered under a previous schema are drained first and
    /// returned so they are written with the schema they were validated by.
    pub fn register_stream(
        &mut self,
        message: &SchemaMessage,
    ) -> Result<Option<FlushedBatch>, StreamError> {
        if let Some(state) = self.streams.get_mut(&message.stream) {
            if state
                .buffer
                .has_schema(&message.schema, &message.key_properties)
            {
                return Ok(None);
            }
            let pending = (!state.buffer.is_empty()).then(|| state.drain());
            state
                .buffer
                .update_schema(&message.schema, &message.key_properties)?;
            return Ok(pending);
        }

        let buffer = StreamBuffer::new(
            message.stream.as_str(),
            &message.schema,
            &message.key_properties,
            self.limits,
            self.policy,
        )?;
        info!(stream = %message.stream, keys = ?buffer.key_columns(), "registered stream");
        self.streams.insert(
            message.stream.clone(),
            StreamState {
                buffer,
                last_added: self.counter,
                last_flushed: self.counter,
            },
        );
        Ok(None)
    }

    /// Buffers one record.
    ///
    /// If the stream's buffer is full, or the record starts a newer table
    /// version, the buffer is drained first and the drained batch returned.
    pub fn handle_record(
        &mut self,
        message: &RecordMessage,
    ) -> Result<(Option<FlushedBatch>, AddOutcome), StreamError> {
        let state = self
            .streams
            .get_mut(&message.stream)
            .ok_or_else(|| StreamError::UnregisteredStream(message.stream.clone()))?;

        let mut drained = None;
        if state.buffer.is_full() || state.buffer.needs_flush_for(message.version) {
            debug!(stream = %message.stream, "draining before record");
            drained = Some(state.drain());
        }

        self.counter += 1;
        state.last_added = self.counter;
        let outcome = state.buffer.add_record(message, Utc::now())?;
        Ok((drained, outcome))
    }

    /// Drains one stream regardless of fullness.
    pub fn flush_stream(&mut self, stream: &str) -> Result<Option<FlushedBatch>, StreamError> {
        let state = self
            .streams
            .get_mut(stream)
            .ok_or_else(|| StreamError::UnregisteredStream(stream.to_string()))?;
        Ok((!state.buffer.is_empty()).then(|| state.drain()))
    }

    /// Queues a checkpoint at the current counter.
    pub fn handle_checkpoint(&mut self, payload: Value) {
        self.checkpoints.push_back(CheckpointQueueEntry {
            payload,
            counter: self.counter,
        });
    }

    /// Drains every full buffer, or every non-empty one when `force` is set.
    ///
    /// Streams with nothing buffered have nothing pending, so their flushed
    /// mark catches up with the counter.
    pub fn flush_streams(&mut self, force: bool) -> Vec<FlushedBatch> {
        let mut batches = Vec::new();
        for (name, state) in &mut self.streams {
            if state.buffer.is_empty() {
                state.last_flushed = self.counter;
            } else if force || state.buffer.is_full() {
                debug!(stream = %name, rows = state.buffer.len(), force, "flushing stream");
                batches.push(state.drain());
            }
        }
        batches
    }

    /// Newest checkpoint that has become safe to emit, if any.
    ///
    /// Earlier checkpoints that became safe at the same time are discarded,
    /// and a payload identical to the previously emitted one is suppressed.
    pub fn emittable_checkpoint(&mut self, force: bool) -> Option<Value> {
        let watermark = if force {
            u64::MAX
        } else {
            self.streams
                .values()
                .map(|state| state.last_flushed)
                .min()
                .unwrap_or(u64::MAX)
        };

        let mut latest = None;
        while self
            .checkpoints
            .front()
            .is_some_and(|entry| entry.counter <= watermark)
        {
            latest = self.checkpoints.pop_front().map(|entry| entry.payload);
        }

        let payload = latest?;
        if self.last_emitted.as_ref() == Some(&payload) {
            debug!("suppressing checkpoint identical to the last one emitted");
            return None;
        }
        self.last_emitted = Some(payload.clone());
        Some(payload)
    }

    /// Whether `stream` has been registered.
    pub fn is_registered(&self, stream: &str) -> bool {
        self.streams.contains_key(stream)
    }

    /// Buffer of `stream`, if registered.
    pub fn buffer(&self, stream: &str) -> Option<&StreamBuffer> {
        self.streams.get(stream).map(|state| &state.buffer)
    }

    /// Record-less batches for every registered stream.
    pub fn empty_batches(&self) -> Vec<FlushedBatch> {
        self.streams
            .values()
            .map(|state| state.buffer.empty_batch())
            .collect()
    }

    /// Checkpoints still waiting for release.
    pub fn pending_checkpoints(&self) -> usize {
        self.checkpoints.len()
    }

    /// Current value of the shared record counter.
    pub fn counter(&self) -> u64 {
        self.counter
    }

    /// Takes the invalid records collected by every stream.
    pub fn take_invalid_records(&mut self) -> Vec<(String, Vec<InvalidRecord>)> {
        self.streams
            .iter_mut()
            .filter_map(|(name, state)| {
                let invalid = state.buffer.take_invalid_records();
                (!invalid.is_empty()).then(|| (name.clone(), invalid))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    fn tracker(max_rows: usize) -> StreamTracker {
        StreamTracker::new(
            BufferLimits {
                max_rows,
                max_bytes: usize::MAX,
            },
            InvalidRecordPolicy::default(),
        )
    }

    fn schema_message(stream: &str) -> SchemaMessage {
        SchemaMessage {
            stream: stream.to_string(),
            schema: json!({"properties": {"id": {"type": "integer"}}}),
            key_properties: vec!["id".to_string()],
        }
    }

    fn record(stream: &str, id: i64) -> RecordMessage {
        RecordMessage {
            stream: stream.to_string(),
            record: json!({"id": id}),
            version: None,
            sequence: None,
            time_extracted: None,
        }
    }

    #[test]
    fn checkpoint_waits_for_the_slowest_stream() {
        let mut tracker = tracker(2);
        for stream in ["x", "y", "z"] {
            tracker.register_stream(&schema_message(stream)).unwrap();
        }

        tracker.handle_record(&record("y", 1)).unwrap();
        tracker.handle_record(&record("x", 1)).unwrap();
        tracker.handle_record(&record("x", 2)).unwrap();
        let flushed = tracker.flush_streams(false);
        assert_eq!(flushed.len(), 1);
        assert_eq!(flushed[0].stream, "x");

        tracker.handle_checkpoint(json!({"bookmark": 1}));
        assert_eq!(tracker.emittable_checkpoint(false), None);
        assert!(tracker.flush_streams(false).is_empty());
        assert_eq!(tracker.emittable_checkpoint(false), None);

        tracker.handle_record(&record("y", 2)).unwrap();
        let flushed = tracker.flush_streams(false);
        assert_eq!(flushed[0].stream, "y");
        assert_eq!(
            tracker.emittable_checkpoint(false),
            Some(json!({"bookmark": 1}))
        );
    }

    #[test]
    fn forced_flush_releases_everything() {
        let mut tracker = tracker(100);
        tracker.register_stream(&schema_message("x")).unwrap();
        tracker.handle_record(&record("x", 1)).unwrap();
        tracker.handle_checkpoint(json!(1));
        assert_eq!(tracker.emittable_checkpoint(false), None);

        let flushed = tracker.flush_streams(true);
        assert_eq!(flushed.len(), 1);
        assert_eq!(tracker.emittable_checkpoint(true), Some(json!(1)));
    }

    #[test]
    fn only_the_newest_safe_checkpoint_is_emitted() {
        let mut tracker = tracker(100);
        tracker.register_stream(&schema_message("x")).unwrap();
        tracker.handle_checkpoint(json!(1));
        tracker.handle_checkpoint(json!(2));
        tracker.handle_checkpoint(json!(3));
        assert_eq!(tracker.emittable_checkpoint(false), Some(json!(3)));
        assert_eq!(tracker.pending_checkpoints(), 0);
    }

    #[test]
    fn identical_checkpoints_are_suppressed() {
        let mut tracker = tracker(100);
        tracker.handle_checkpoint(json!({"a": 1}));
        assert_eq!(tracker.emittable_checkpoint(false), Some(json!({"a": 1})));
        tracker.handle_checkpoint(json!({"a": 1}));
        assert_eq!(tracker.emittable_checkpoint(false), None);
        tracker.handle_checkpoint(json!({"a": 2}));
        assert_eq!(tracker.emittable_checkpoint(false), Some(json!({"a": 2})));
    }

    #[test]
    fn full_buffer_drains_on_next_record() {
        let mut tracker = tracker(1);
        tracker.register_stream(&schema_message("x")).unwrap();
        let (drained, _) = tracker.handle_record(&record("x", 1)).unwrap();
        assert!(drained.is_none());
        let (drained, outcome) = tracker.handle_record(&record("x", 2)).unwrap();
        assert_eq!(drained.map(|batch| batch.len()), Some(1));
        assert_eq!(outcome, AddOutcome::Accepted);
    }

    #[test]
    fn schema_change_drains_pending_records() {
        let mut tracker = tracker(100);
        tracker.register_stream(&schema_message("x")).unwrap();
        tracker.handle_record(&record("x", 1)).unwrap();
        assert!(tracker.register_stream(&schema_message("x")).unwrap().is_none());

        let mut changed = schema_message("x");
        changed.schema = json!({"properties": {"id": {"type": "integer"}, "n": {"type": "string"}}});
        let pending = tracker.register_stream(&changed).unwrap().unwrap();
        assert_eq!(pending.len(), 1);
        assert!(tracker.buffer("x").unwrap().is_empty());
    }

    #[test]
    fn unregistered_stream_is_rejected() {
        let mut tracker = tracker(10);
        assert!(matches!(
            tracker.handle_record(&record("nope", 1)),
            Err(StreamError::UnregisteredStream(_))
        ));
    }

    #[derive(Debug, Clone)]
    enum Op {
        Record(usize),
        State,
        Check,
    }

    fn op() -> impl Strategy<Value = Op> {
        prop_oneof![
            4 => (0..3usize).prop_map(Op::Record),
            1 => Just(Op::State),
            1 => Just(Op::Check),
        ]
    }

    proptest! {
        #[test]
        fn checkpoints_never_overtake_unflushed_records(ops in prop::collection::vec(op(), 1..120)) {
            let streams = ["a", "b", "c"];
            let mut tracker = tracker(3);
            for stream in streams {
                tracker.register_stream(&schema_message(stream)).unwrap();
            }

            let mut pending: BTreeMap<String, Vec<u64>> = BTreeMap::new();
            let mut state_counters: Vec<u64> = Vec::new();
            let mut counter = 0u64;

            let check = |payload: Option<Value>, pending: &BTreeMap<String, Vec<u64>>, state_counters: &[u64]| {
                if let Some(payload) = payload {
                    let index = payload.as_u64().unwrap() as usize;
                    let received = state_counters[index];
                    for counters in pending.values() {
                        prop_assert!(counters.iter().all(|c| *c > received));
                    }
                }
                Ok(())
            };

            for (i, op) in ops.into_iter().enumerate() {
                match op {
                    Op::Record(stream) => {
                        let (drained, _) = tracker.handle_record(&record(streams[stream], i as i64)).unwrap();
                        if let Some(batch) = drained {
                            pending.remove(&batch.stream);
                        }
                        counter += 1;
                        pending.entry(streams[stream].to_string()).or_default().push(counter);
                    }
                    Op::State => {
                        tracker.handle_checkpoint(json!(state_counters.len()));
                        state_counters.push(counter);
                    }
                    Op::Check => {
                        for batch in tracker.flush_streams(false) {
                            pending.remove(&batch.stream);
                        }
                        let emitted = tracker.emittable_checkpoint(false);
                        check(emitted, &pending, &state_counters)?;
                    }
                }
            }
        }
    }
}
