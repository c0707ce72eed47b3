//! The aggregate runtime: rehydration, command deduplication, behavior
//! dispatch, event folding, snapshotting and append.

use std::fmt::Debug;
use std::marker::PhantomData;
use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tracing::instrument;
use uuid::Uuid;

use crate::backend::{Append, Backend, BackendError, NewCommandRecord, NewSnapshot};
use crate::config::{EventSourcingConfig, KEEP_FOREVER};
use crate::mapper::{EventMapper, MapperError};
use crate::reporter::AggregateReporters;
use crate::{Aggregate, Command as _, Event as _, Reception};

/// The outcome of handling one command.
pub enum CommandResult<A: Aggregate> {
    /// The command was accepted, or answered from its recorded outcome when
    /// `deduplicated` is `true`.
    Success {
        /// The events the command emitted, in append order.
        events: Vec<A::Event>,
        /// Whether the result was replayed from a command record instead of
        /// being processed anew.
        deduplicated: bool,
    },
    /// The command was turned down as a normal, typed outcome.
    Rejection {
        /// Why the command was rejected.
        error: CommandRejection<A::Error>,
    },
    /// Another writer appended first; the caller may retry.
    ConcurrentModification,
    /// Something went wrong that retrying the same command will not fix.
    UnexpectedError {
        /// The underlying cause.
        cause: UnexpectedError,
    },
}

impl<A: Aggregate> Debug for CommandResult<A> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Success {
                events,
                deduplicated,
            } => f
                .debug_struct("Success")
                .field("events", events)
                .field("deduplicated", deduplicated)
                .finish(),
            Self::Rejection { error } => f.debug_struct("Rejection").field("error", error).finish(),
            Self::ConcurrentModification => write!(f, "ConcurrentModification"),
            Self::UnexpectedError { cause } => f
                .debug_struct("UnexpectedError")
                .field("cause", cause)
                .finish(),
        }
    }
}

/// Why a command was rejected.
#[derive(Debug, thiserror::Error)]
pub enum CommandRejection<E: std::error::Error> {
    /// The eden behavior has no clause for this command; the aggregate does
    /// not exist yet.
    #[error("command is not supported in the eden behavior")]
    UnsupportedCommandInEdenBehavior,

    /// A business rule turned the command down.
    #[error(transparent)]
    Domain(E),
}

/// Causes surfaced as [`CommandResult::UnexpectedError`].
#[derive(Debug, thiserror::Error)]
pub enum UnexpectedError {
    /// The behavior selected for the current state has no clause for this
    /// command.
    #[error("command '{command_type}' is not supported in the current behavior")]
    UnsupportedCommandInCurrentBehavior {
        /// The unhandled command's type.
        command_type: String,
    },

    /// No `apply` clause matched an event, either during rehydration or
    /// while pre-checking newly emitted events.
    #[error("event '{event_type}' is not supported in the current behavior")]
    UnsupportedEventInCurrentBehavior {
        /// The unapplicable event's type.
        event_type: String,
    },

    /// A creation command reached an aggregate that already exists.
    #[error("aggregate instance already exists")]
    AggregateInstanceAlreadyExists,

    /// The backend failed outside of an optimistic concurrency conflict.
    #[error(transparent)]
    Backend(BackendError),

    /// Serialization or deserialization of an event failed.
    #[error(transparent)]
    Mapper(MapperError),

    /// Snapshot state could not be encoded or decoded.
    #[error("snapshot state codec failure: {0}")]
    Snapshot(serde_json::Error),
}

/// The error type for read-only state access.
#[derive(Debug, thiserror::Error)]
pub enum StateError {
    /// The backend failed.
    #[error(transparent)]
    Backend(#[from] BackendError),

    /// A recorded event could not be decoded.
    #[error(transparent)]
    Mapper(#[from] MapperError),

    /// The persisted snapshot state could not be decoded.
    #[error("failed to decode snapshot state: {0}")]
    Snapshot(serde_json::Error),

    /// A recorded event had no matching `apply` clause.
    #[error("event '{event_type}' at sequence {sequence_number} is not applicable to the current state")]
    UnsupportedEvent {
        /// The unapplicable event's type.
        event_type: String,
        /// Where in the log the event sits.
        sequence_number: u64,
    },
}

impl From<StateError> for UnexpectedError {
    fn from(error: StateError) -> Self {
        match error {
            StateError::Backend(e) => Self::Backend(e),
            StateError::Mapper(e) => Self::Mapper(e),
            StateError::Snapshot(e) => Self::Snapshot(e),
            StateError::UnsupportedEvent { event_type, .. } => {
                Self::UnsupportedEventInCurrentBehavior { event_type }
            }
        }
    }
}

/// Processes commands for one aggregate type against a [`Backend`].
///
/// The runtime owns no aggregate state; every command rehydrates from the
/// snapshot and event log. Commands for the same aggregate id are serialized
/// through an internal per-id lock so concurrent callers do not waste work
/// racing the optimistic concurrency check; commands for different ids run
/// in parallel.
pub struct AggregateRuntime<A: Aggregate, B: Backend> {
    backend: Arc<B>,
    mapper: Arc<EventMapper<A::Event>>,
    config: EventSourcingConfig,
    reporters: AggregateReporters,
    locks: DashMap<String, Arc<Mutex<()>>>,
    _aggregate: PhantomData<A>,
}

impl<A: Aggregate, B: Backend> AggregateRuntime<A, B> {
    /// Creates a runtime over the given backend and mapper.
    pub fn new(
        backend: Arc<B>,
        mapper: Arc<EventMapper<A::Event>>,
        config: EventSourcingConfig,
    ) -> Self {
        Self {
            backend,
            mapper,
            config,
            reporters: AggregateReporters::default(),
            locks: DashMap::new(),
            _aggregate: PhantomData,
        }
    }

    /// The runtime's reporter registry.
    pub fn reporters(&self) -> &AggregateReporters {
        &self.reporters
    }

    /// Returns a handle for one aggregate instance.
    pub fn aggregate_root_of(&self, id: A::Id) -> AggregateRoot<'_, A, B> {
        AggregateRoot {
            runtime: self,
            aggregate_id: id.to_string(),
        }
    }

    fn lock_for(&self, aggregate_id: &str) -> Arc<Mutex<()>> {
        self.locks
            .entry(aggregate_id.to_string())
            .or_default()
            .clone()
    }
}

/// A handle to one aggregate instance, produced by
/// [`AggregateRuntime::aggregate_root_of`].
pub struct AggregateRoot<'r, A: Aggregate, B: Backend> {
    runtime: &'r AggregateRuntime<A, B>,
    aggregate_id: String,
}

struct Hydration<S> {
    state: Option<S>,
    high_water_mark: u64,
    version_at_last_snapshot: u64,
}

impl<A: Aggregate, B: Backend> AggregateRoot<'_, A, B> {
    /// Handles a command without deduplication.
    pub async fn handle_command(&self, command: A::Command) -> CommandResult<A> {
        self.process(command, None).await
    }

    /// Handles a command envelope. A `command_id` already recorded within
    /// the dedup horizon returns the originally emitted events unchanged,
    /// with `deduplicated` set.
    pub async fn handle_command_envelope(
        &self,
        command: A::Command,
        command_id: impl Into<String>,
    ) -> CommandResult<A> {
        self.process(command, Some(command_id.into())).await
    }

    /// Rehydrates and returns the aggregate's current state, or `None` when
    /// no event has ever been appended.
    pub async fn current_state(&self) -> Result<Option<A::State>, StateError> {
        Ok(self.hydrate().await?.state)
    }

    /// The aggregate's current high-water mark (0 for a nonexistent
    /// aggregate).
    pub async fn current_version(&self) -> Result<u64, StateError> {
        Ok(self.hydrate().await?.high_water_mark)
    }

    #[instrument(
        skip(self, command, command_id),
        fields(aggregate_type = A::AGGREGATE_TYPE, aggregate_id = %self.aggregate_id)
    )]
    async fn process(&self, command: A::Command, command_id: Option<String>) -> CommandResult<A> {
        let runtime = self.runtime;
        let lock = runtime.lock_for(&self.aggregate_id);
        let _guard = lock.lock().await;

        runtime.reporters.set.each(|reporter| {
            reporter.command_received(A::AGGREGATE_TYPE, &self.aggregate_id, command.command_type());
        });

        let dedup_threshold = runtime.config.command_dedup_threshold_for(A::AGGREGATE_TYPE);

        if let Some(command_id) = command_id.as_deref() {
            if dedup_threshold > 0 {
                match self.replay_recorded(command_id, dedup_threshold).await {
                    Ok(Some(events)) => {
                        runtime.reporters.set.each(|reporter| {
                            reporter.command_deduplicated(
                                A::AGGREGATE_TYPE,
                                &self.aggregate_id,
                                command_id,
                            );
                        });
                        return CommandResult::Success {
                            events,
                            deduplicated: true,
                        };
                    }
                    Ok(None) => {}
                    Err(cause) => return self.unexpected(cause),
                }
            }
        }

        let hydration = match self.hydrate().await {
            Ok(hydration) => hydration,
            Err(error) => return self.unexpected(error.into()),
        };

        let reception = match &hydration.state {
            None => A::eden_behavior().receive(&command),
            Some(state) => A::behavior_for(state).receive(&command, state),
        };

        let events = match reception {
            Reception::Accept(events) => events,
            Reception::Reject(error) => {
                runtime.reporters.set.each(|reporter| {
                    reporter.command_rejected(
                        A::AGGREGATE_TYPE,
                        &self.aggregate_id,
                        command.command_type(),
                    );
                });
                return CommandResult::Rejection {
                    error: CommandRejection::Domain(error),
                };
            }
            Reception::Unhandled => {
                return match &hydration.state {
                    None => {
                        runtime.reporters.set.each(|reporter| {
                            reporter.command_rejected(
                                A::AGGREGATE_TYPE,
                                &self.aggregate_id,
                                command.command_type(),
                            );
                        });
                        CommandResult::Rejection {
                            error: CommandRejection::UnsupportedCommandInEdenBehavior,
                        }
                    }
                    Some(_) => {
                        // An eden-handled command reaching a live aggregate
                        // is a creation attempt on an existing instance.
                        let cause = match A::eden_behavior().receive(&command) {
                            Reception::Unhandled => {
                                UnexpectedError::UnsupportedCommandInCurrentBehavior {
                                    command_type: command.command_type().to_string(),
                                }
                            }
                            _ => UnexpectedError::AggregateInstanceAlreadyExists,
                        };
                        self.unexpected(cause)
                    }
                };
            }
        };

        if events.is_empty() {
            return CommandResult::Success {
                events,
                deduplicated: false,
            };
        }

        // Fold the emitted events before touching the backend so an event
        // without an apply clause never causes a partial append.
        let mut folded = hydration.state.clone();
        for event in &events {
            let next = match &folded {
                None => A::eden_behavior().apply(event),
                Some(state) => A::behavior_for(state).apply(event, state),
            };
            match next {
                Some(state) => folded = Some(state),
                None => {
                    return self.unexpected(UnexpectedError::UnsupportedEventInCurrentBehavior {
                        event_type: event.event_type().to_string(),
                    })
                }
            }
        }

        let snapshot_threshold = runtime.config.snapshot_threshold_for(A::AGGREGATE_TYPE);
        let new_high_water_mark = hydration.high_water_mark + events.len() as u64;
        let due = snapshot_threshold > 0
            && new_high_water_mark - hydration.version_at_last_snapshot >= snapshot_threshold;
        let snapshot = match (&folded, due) {
            (Some(state), true) => match serde_json::to_value(state) {
                Ok(value) => Some(NewSnapshot {
                    state: value,
                    version: new_high_water_mark,
                }),
                Err(error) => return self.unexpected(UnexpectedError::Snapshot(error)),
            },
            _ => None,
        };

        let mut new_events = Vec::with_capacity(events.len());
        for event in &events {
            match runtime.mapper.serialize(event) {
                Ok(wire) => new_events.push(wire),
                Err(error) => return self.unexpected(UnexpectedError::Mapper(error)),
            }
        }

        let causation_id = command_id
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        let command_record = command_id
            .filter(|_| dedup_threshold > 0)
            .map(|command_id| NewCommandRecord {
                command_id,
                command_type: command.command_type().to_string(),
            });

        let append = Append {
            events: new_events,
            expected_sequence_number: hydration.high_water_mark,
            causation_id,
            correlation_id: None,
            snapshot,
            command: command_record,
        };
        let snapshot_version = append.snapshot.as_ref().map(|snapshot| snapshot.version);

        match runtime
            .backend
            .append(A::AGGREGATE_TYPE, &self.aggregate_id, append)
            .await
        {
            Ok(records) => {
                runtime.reporters.set.each(|reporter| {
                    reporter.events_persisted(A::AGGREGATE_TYPE, &self.aggregate_id, &records);
                });
                if let Some(version) = snapshot_version {
                    runtime.reporters.set.each(|reporter| {
                        reporter.snapshot_saved(A::AGGREGATE_TYPE, &self.aggregate_id, version);
                    });
                }
                CommandResult::Success {
                    events,
                    deduplicated: false,
                }
            }
            Err(BackendError::Conflict { .. }) => CommandResult::ConcurrentModification,
            Err(error) => self.unexpected(UnexpectedError::Backend(error)),
        }
    }

    /// Replays the events recorded for a command id, or `None` when no
    /// record exists or the record has fallen out of the dedup horizon.
    async fn replay_recorded(
        &self,
        command_id: &str,
        dedup_threshold: u64,
    ) -> Result<Option<Vec<A::Event>>, UnexpectedError> {
        let backend = &self.runtime.backend;

        let Some(record) = backend
            .load_command_record(A::AGGREGATE_TYPE, &self.aggregate_id, command_id)
            .await
            .map_err(UnexpectedError::Backend)?
        else {
            return Ok(None);
        };

        if dedup_threshold != KEEP_FOREVER {
            let high_water_mark = backend
                .highest_sequence_number(A::AGGREGATE_TYPE, &self.aggregate_id)
                .await
                .map_err(UnexpectedError::Backend)?;
            if high_water_mark.saturating_sub(record.last_sequence_number) > dedup_threshold {
                return Ok(None);
            }
        }

        let records = backend
            .load_events(
                A::AGGREGATE_TYPE,
                &self.aggregate_id,
                record.first_sequence_number.saturating_sub(1),
            )
            .await
            .map_err(UnexpectedError::Backend)?;

        let mut events = Vec::new();
        for event_record in records {
            if event_record.sequence_number > record.last_sequence_number {
                break;
            }
            let event = self
                .runtime
                .mapper
                .deserialize(
                    &event_record.event_type,
                    event_record.event_version,
                    event_record.payload,
                )
                .map_err(UnexpectedError::Mapper)?;
            events.push(event);
        }
        Ok(Some(events))
    }

    #[instrument(skip(self), fields(aggregate_type = A::AGGREGATE_TYPE, aggregate_id = %self.aggregate_id))]
    async fn hydrate(&self) -> Result<Hydration<A::State>, StateError> {
        let backend = &self.runtime.backend;

        let snapshot = backend
            .load_snapshot(A::AGGREGATE_TYPE, &self.aggregate_id)
            .await?;
        let (mut state, mut high_water_mark, version_at_last_snapshot) = match snapshot {
            Some(snapshot) => {
                let state: A::State =
                    serde_json::from_value(snapshot.state).map_err(StateError::Snapshot)?;
                (Some(state), snapshot.version, snapshot.version)
            }
            None => (None, 0, 0),
        };

        let records = backend
            .load_events(A::AGGREGATE_TYPE, &self.aggregate_id, high_water_mark)
            .await?;
        for record in records {
            let event = self.runtime.mapper.deserialize(
                &record.event_type,
                record.event_version,
                record.payload,
            )?;
            let next = match &state {
                None => A::eden_behavior().apply(&event),
                Some(current) => A::behavior_for(current).apply(&event, current),
            };
            state = Some(next.ok_or(StateError::UnsupportedEvent {
                event_type: record.event_type,
                sequence_number: record.sequence_number,
            })?);
            high_water_mark = record.sequence_number;
        }

        Ok(Hydration {
            state,
            high_water_mark,
            version_at_last_snapshot,
        })
    }

    fn unexpected(&self, cause: UnexpectedError) -> CommandResult<A> {
        if let UnexpectedError::Backend(error) = &cause {
            self.runtime.reporters.set.each(|reporter| {
                reporter.backend_error(A::AGGREGATE_TYPE, &self.aggregate_id, error);
            });
        }
        CommandResult::UnexpectedError { cause }
    }
}
