//! An in-memory backend, useful for testing and development.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use tracing::instrument;
use uuid::Uuid;

use crate::backend::{Append, Backend, BackendError, CommandRecord, EventRecord, SnapshotRecord};

#[derive(Default)]
struct Stream {
    events: Vec<EventRecord>,
    // Tracked separately so deleting a prefix of events (snapshot tests,
    // compaction) does not reset the append position.
    high_water_mark: u64,
    snapshot: Option<SnapshotRecord>,
    commands: HashMap<String, CommandRecord>,
}

/// Thread-safe map keyed by `(aggregate_type, aggregate_id)`.
type StreamMap = DashMap<(String, String), Stream>;

/// An in-memory, thread-safe [`Backend`].
///
/// This is useful for testing or for applications that do not require a
/// persistent event store. The optimistic concurrency check runs under the
/// stream's map entry lock, making each append atomic.
#[derive(Default)]
pub struct InMemoryBackend {
    streams: StreamMap,
}

impl InMemoryBackend {
    /// Creates an empty backend.
    pub fn new() -> Self {
        Self::default()
    }

    fn key(aggregate_type: &str, aggregate_id: &str) -> (String, String) {
        (aggregate_type.to_string(), aggregate_id.to_string())
    }

    /// Deletes all events with `sequence_number <= through_sequence_number`
    /// for one aggregate, keeping the high-water mark.
    ///
    /// This exists for exercising snapshot transparency: a contiguous prefix
    /// covered by a snapshot can be dropped without changing what
    /// rehydration produces.
    pub fn delete_events_through(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        through_sequence_number: u64,
    ) {
        if let Some(mut stream) = self.streams.get_mut(&Self::key(aggregate_type, aggregate_id)) {
            stream
                .events
                .retain(|record| record.sequence_number > through_sequence_number);
        }
    }
}

#[async_trait]
impl Backend for InMemoryBackend {
    #[instrument(skip(self))]
    async fn load_events(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        after_sequence_number: u64,
    ) -> Result<Vec<EventRecord>, BackendError> {
        match self.streams.get(&Self::key(aggregate_type, aggregate_id)) {
            Some(stream) => Ok(stream
                .events
                .iter()
                .filter(|record| record.sequence_number > after_sequence_number)
                .cloned()
                .collect()),
            None => Ok(Vec::new()),
        }
    }

    #[instrument(skip(self))]
    async fn load_snapshot(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<Option<SnapshotRecord>, BackendError> {
        Ok(self
            .streams
            .get(&Self::key(aggregate_type, aggregate_id))
            .and_then(|stream| stream.snapshot.clone()))
    }

    #[instrument(skip(self))]
    async fn load_command_record(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        command_id: &str,
    ) -> Result<Option<CommandRecord>, BackendError> {
        Ok(self
            .streams
            .get(&Self::key(aggregate_type, aggregate_id))
            .and_then(|stream| stream.commands.get(command_id).cloned()))
    }

    #[instrument(skip(self))]
    async fn highest_sequence_number(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<u64, BackendError> {
        Ok(self
            .streams
            .get(&Self::key(aggregate_type, aggregate_id))
            .map(|stream| stream.high_water_mark)
            .unwrap_or(0))
    }

    #[instrument(skip(self, append), fields(expected = append.expected_sequence_number))]
    async fn append(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        append: Append,
    ) -> Result<Vec<EventRecord>, BackendError> {
        if append.events.is_empty() {
            return Ok(Vec::new());
        }

        let mut stream = self
            .streams
            .entry(Self::key(aggregate_type, aggregate_id))
            .or_default();

        if stream.high_water_mark != append.expected_sequence_number {
            return Err(BackendError::Conflict {
                expected: append.expected_sequence_number,
                actual: stream.high_water_mark,
            });
        }

        let first_sequence_number = stream.high_water_mark + 1;
        let timestamp = Utc::now();
        let mut records = Vec::with_capacity(append.events.len());
        for new_event in append.events {
            stream.high_water_mark += 1;
            let record = EventRecord {
                event_id: Uuid::new_v4(),
                aggregate_type: aggregate_type.to_string(),
                aggregate_id: aggregate_id.to_string(),
                causation_id: append.causation_id.clone(),
                correlation_id: append.correlation_id.clone(),
                sequence_number: stream.high_water_mark,
                timestamp,
                payload: new_event.payload,
                event_type: new_event.event_type,
                event_version: new_event.event_version,
            };
            stream.events.push(record.clone());
            records.push(record);
        }

        if let Some(snapshot) = append.snapshot {
            stream.snapshot = Some(SnapshotRecord {
                aggregate_type: aggregate_type.to_string(),
                aggregate_id: aggregate_id.to_string(),
                state: snapshot.state,
                version: snapshot.version,
            });
        }

        if let Some(command) = append.command {
            let record = CommandRecord {
                command_id: command.command_id.clone(),
                command_type: command.command_type,
                first_sequence_number,
                last_sequence_number: stream.high_water_mark,
                event_ids: records.iter().map(|record| record.event_id).collect(),
            };
            stream.commands.insert(command.command_id, record);
        }

        Ok(records)
    }
}
