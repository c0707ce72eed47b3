//! The persistence contract for events, snapshots and command records.
//!
//! A [`Backend`] deals only in serialized records; the
//! [`AggregateRuntime`](crate::runtime::AggregateRuntime) performs all
//! mapping between domain events and their wire form. One event log exists
//! per `(aggregate_type, aggregate_id)` pair, with dense sequence numbers
//! starting at 1.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// A persisted event, including provenance metadata.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventRecord {
    /// Unique identifier of this event.
    pub event_id: Uuid,
    /// The aggregate type this event belongs to.
    pub aggregate_type: String,
    /// The aggregate instance this event belongs to.
    pub aggregate_id: String,
    /// The id of the command (or other cause) that produced this event.
    pub causation_id: String,
    /// Optional correlation identifier propagated across contexts.
    pub correlation_id: Option<String>,
    /// Position of this event in the aggregate's log, starting at 1.
    pub sequence_number: u64,
    /// When the event was persisted.
    pub timestamp: DateTime<Utc>,
    /// The serialized event payload.
    pub payload: Value,
    /// The event's type name, as registered with the mapper.
    pub event_type: String,
    /// The version of the event's schema at the time it was written.
    pub event_version: u16,
}

/// A persisted snapshot of aggregate state.
///
/// A snapshot at version `v` means events `1..=v` have been folded into
/// `state`; rehydration loads only events with a higher sequence number.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRecord {
    /// The aggregate type this snapshot belongs to.
    pub aggregate_type: String,
    /// The aggregate instance this snapshot belongs to.
    pub aggregate_id: String,
    /// The serialized aggregate state.
    pub state: Value,
    /// The sequence number of the last event folded into `state`.
    pub version: u64,
}

/// The record kept for a handled command envelope, enabling deduplication.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CommandRecord {
    /// The caller-supplied command id.
    pub command_id: String,
    /// The type of the command that was handled.
    pub command_type: String,
    /// Sequence number of the first event the command emitted.
    pub first_sequence_number: u64,
    /// Sequence number of the last event the command emitted.
    pub last_sequence_number: u64,
    /// Ids of the emitted events, in append order.
    pub event_ids: Vec<Uuid>,
}

/// A serialized event awaiting persistence (the mapper's output).
#[derive(Debug, Clone)]
pub struct NewEvent {
    /// The serialized event payload.
    pub payload: Value,
    /// The event's type name at its current version.
    pub event_type: String,
    /// The event's current schema version.
    pub event_version: u16,
}

/// A snapshot awaiting persistence alongside an append.
#[derive(Debug, Clone)]
pub struct NewSnapshot {
    /// The serialized aggregate state after folding the appended events.
    pub state: Value,
    /// The sequence number of the last appended event.
    pub version: u64,
}

/// A command record awaiting persistence alongside an append.
///
/// The backend fills in the sequence range and event ids so the record and
/// its events always appear together.
#[derive(Debug, Clone)]
pub struct NewCommandRecord {
    /// The caller-supplied command id.
    pub command_id: String,
    /// The type of the command being handled.
    pub command_type: String,
}

/// Everything that travels with one atomic append.
#[derive(Debug)]
pub struct Append {
    /// The events to append, in order.
    pub events: Vec<NewEvent>,
    /// The current high-water mark the writer observed; the append fails
    /// with [`BackendError::Conflict`] when it no longer matches.
    pub expected_sequence_number: u64,
    /// Causation id stamped on each appended event.
    pub causation_id: String,
    /// Correlation id stamped on each appended event.
    pub correlation_id: Option<String>,
    /// Snapshot to persist in the same append, if the threshold was crossed.
    pub snapshot: Option<NewSnapshot>,
    /// Command record to persist in the same append, when deduplication is
    /// enabled and the command carried an id.
    pub command: Option<NewCommandRecord>,
}

/// The error type for backend operations.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The append's expected sequence number did not match the current
    /// high-water mark, indicating a concurrent writer.
    #[error("optimistic concurrency conflict: expected sequence {expected}, found {actual}")]
    Conflict {
        /// The sequence number the writer expected.
        expected: u64,
        /// The sequence number actually found.
        actual: u64,
    },
    /// The backend could not serve the request (I/O failure, lost
    /// connection, and so on).
    #[error("backend unavailable: {0}")]
    Unavailable(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl BackendError {
    /// Wraps an arbitrary error as [`BackendError::Unavailable`].
    pub fn unavailable(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self::Unavailable(error.into())
    }
}

/// The trait for persistence backends.
///
/// Implementations must preserve dense, strictly monotonic sequence numbers
/// per `(aggregate_type, aggregate_id)` and perform the optimistic
/// concurrency check on [`append`](Backend::append) atomically.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Loads the events for an aggregate with
    /// `sequence_number > after_sequence_number`, ordered ascending.
    /// Passing 0 loads the full stream.
    async fn load_events(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        after_sequence_number: u64,
    ) -> Result<Vec<EventRecord>, BackendError>;

    /// Loads the latest snapshot for an aggregate, if any.
    async fn load_snapshot(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<Option<SnapshotRecord>, BackendError>;

    /// Loads the command record for a previously handled command id, if any.
    async fn load_command_record(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        command_id: &str,
    ) -> Result<Option<CommandRecord>, BackendError>;

    /// Returns the aggregate's current high-water mark (0 when no event has
    /// ever been appended). Used for the dedup horizon check without a full
    /// rehydration.
    async fn highest_sequence_number(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
    ) -> Result<u64, BackendError>;

    /// Atomically appends events (and the optional snapshot and command
    /// record) to an aggregate's log.
    ///
    /// Fails with [`BackendError::Conflict`] when
    /// `append.expected_sequence_number` does not equal the current
    /// high-water mark. Returns the persisted records in append order.
    async fn append(
        &self,
        aggregate_type: &str,
        aggregate_id: &str,
        append: Append,
    ) -> Result<Vec<EventRecord>, BackendError>;
}
