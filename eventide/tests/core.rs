//! Integration tests for the backend contract and the aggregate runtime.

use std::sync::{Arc, Mutex};

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use eventide::backend::{Append, Backend, NewCommandRecord, NewEvent};
use eventide::store::in_memory::InMemoryBackend;
use eventide::{
    Aggregate, AggregateReporter, AggregateRuntime, BackendError, Behavior, CommandResult,
    EdenBehavior, EventMapper, EventMapperBuilder, EventSourcingConfig, Reception,
};
use eventide_derive::{Command as DeriveCommand, Event as DeriveEvent};

/// Simple aggregate used for exercising runtime behaviour.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, DeriveEvent)]
enum TallyEvent {
    Opened,
    Bumped { by: u64 },
}

#[derive(Debug, DeriveCommand)]
enum TallyCommand {
    Open,
    Bump { by: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
struct TallyState {
    total: u64,
    entries: u64,
}

struct Tally;

impl Aggregate for Tally {
    type Id = Uuid;
    type Command = TallyCommand;
    type Event = TallyEvent;
    type State = TallyState;
    type Error = std::convert::Infallible;

    const AGGREGATE_TYPE: &'static str = "Tally";

    fn eden_behavior() -> EdenBehavior<Self> {
        EdenBehavior::new(
            |command| match command {
                TallyCommand::Open => Reception::Accept(vec![TallyEvent::Opened]),
                TallyCommand::Bump { .. } => Reception::Unhandled,
            },
            |event| match event {
                TallyEvent::Opened => Some(TallyState {
                    total: 0,
                    entries: 0,
                }),
                TallyEvent::Bumped { .. } => None,
            },
        )
    }

    fn behavior_for(_state: &TallyState) -> Behavior<Self> {
        Behavior::new(
            |command, _state| match command {
                TallyCommand::Bump { by } => {
                    Reception::Accept(vec![TallyEvent::Bumped { by: *by }])
                }
                TallyCommand::Open => Reception::Unhandled,
            },
            |event, state: &TallyState| match event {
                TallyEvent::Bumped { by } => Some(TallyState {
                    total: state.total + by,
                    entries: state.entries + 1,
                }),
                TallyEvent::Opened => None,
            },
        )
    }
}

fn mapper() -> EventMapper<TallyEvent> {
    EventMapperBuilder::new()
        .event(
            "Opened",
            1,
            |event| matches!(event, TallyEvent::Opened).then(|| serde_json::to_value(event)),
            serde_json::from_value,
        )
        .event(
            "Bumped",
            1,
            |event| matches!(event, TallyEvent::Bumped { .. }).then(|| serde_json::to_value(event)),
            serde_json::from_value,
        )
        .build()
        .expect("tally mapper configuration is complete")
}

fn wire_event(event: &TallyEvent, mapper: &EventMapper<TallyEvent>) -> NewEvent {
    mapper.serialize(event).expect("event serializes")
}

fn plain_append(events: Vec<NewEvent>, expected: u64) -> Append {
    Append {
        events,
        expected_sequence_number: expected,
        causation_id: "cause-1".to_string(),
        correlation_id: None,
        snapshot: None,
        command: None,
    }
}

// -- Backend contract -----------------------------------------------------

#[test]
fn in_memory_backend_append_and_load() {
    let backend = InMemoryBackend::new();
    let mapper = mapper();
    let id = Uuid::new_v4().to_string();

    let stored = futures::executor::block_on(backend.append(
        "Tally",
        &id,
        plain_append(
            vec![
                wire_event(&TallyEvent::Opened, &mapper),
                wire_event(&TallyEvent::Bumped { by: 3 }, &mapper),
            ],
            0,
        ),
    ))
    .expect("append should succeed");

    assert_eq!(stored.len(), 2);
    assert_eq!(stored[0].sequence_number, 1);
    assert_eq!(stored[1].sequence_number, 2);
    assert_eq!(stored[0].causation_id, "cause-1");

    let loaded = futures::executor::block_on(backend.load_events("Tally", &id, 0))
        .expect("load should succeed");
    assert_eq!(loaded, stored);

    let after_first = futures::executor::block_on(backend.load_events("Tally", &id, 1))
        .expect("load should succeed");
    assert_eq!(after_first.len(), 1);
    assert_eq!(after_first[0].sequence_number, 2);

    let high_water_mark =
        futures::executor::block_on(backend.highest_sequence_number("Tally", &id))
            .expect("probe should succeed");
    assert_eq!(high_water_mark, 2);
}

#[test]
fn in_memory_backend_conflict() {
    let backend = InMemoryBackend::new();
    let mapper = mapper();
    let id = Uuid::new_v4().to_string();

    futures::executor::block_on(backend.append(
        "Tally",
        &id,
        plain_append(vec![wire_event(&TallyEvent::Opened, &mapper)], 0),
    ))
    .expect("initial append");

    // Appending with a stale expected sequence number should conflict.
    let err = futures::executor::block_on(backend.append(
        "Tally",
        &id,
        plain_append(vec![wire_event(&TallyEvent::Bumped { by: 1 }, &mapper)], 0),
    ))
    .expect_err("should conflict");
    assert!(matches!(
        err,
        BackendError::Conflict {
            expected: 0,
            actual: 1
        }
    ));
}

#[test]
fn command_record_rides_along_with_its_events() {
    let backend = InMemoryBackend::new();
    let mapper = mapper();
    let id = Uuid::new_v4().to_string();

    let mut append = plain_append(
        vec![
            wire_event(&TallyEvent::Opened, &mapper),
            wire_event(&TallyEvent::Bumped { by: 1 }, &mapper),
        ],
        0,
    );
    append.command = Some(NewCommandRecord {
        command_id: "cmd-1".to_string(),
        command_type: "Open".to_string(),
    });

    let stored =
        futures::executor::block_on(backend.append("Tally", &id, append)).expect("append");

    let record = futures::executor::block_on(backend.load_command_record("Tally", &id, "cmd-1"))
        .expect("load")
        .expect("record exists");
    assert_eq!(record.first_sequence_number, 1);
    assert_eq!(record.last_sequence_number, 2);
    assert_eq!(
        record.event_ids,
        stored.iter().map(|r| r.event_id).collect::<Vec<_>>()
    );
}

#[test]
fn deleting_a_prefix_keeps_the_high_water_mark() {
    let backend = InMemoryBackend::new();
    let mapper = mapper();
    let id = Uuid::new_v4().to_string();

    futures::executor::block_on(backend.append(
        "Tally",
        &id,
        plain_append(
            vec![
                wire_event(&TallyEvent::Opened, &mapper),
                wire_event(&TallyEvent::Bumped { by: 1 }, &mapper),
            ],
            0,
        ),
    ))
    .expect("append");

    backend.delete_events_through("Tally", &id, 1);

    let remaining =
        futures::executor::block_on(backend.load_events("Tally", &id, 0)).expect("load");
    assert_eq!(remaining.len(), 1);
    assert_eq!(remaining[0].sequence_number, 2);

    let high_water_mark =
        futures::executor::block_on(backend.highest_sequence_number("Tally", &id))
            .expect("probe");
    assert_eq!(high_water_mark, 2);
}

// -- Runtime properties ---------------------------------------------------

#[tokio::test]
async fn successful_commands_produce_dense_sequence_numbers() {
    let backend = Arc::new(InMemoryBackend::new());
    let runtime: AggregateRuntime<Tally, _> = AggregateRuntime::new(
        backend.clone(),
        Arc::new(mapper()),
        EventSourcingConfig::new(),
    );
    let id = Uuid::new_v4();
    let root = runtime.aggregate_root_of(id);

    assert!(matches!(
        root.handle_command(TallyCommand::Open).await,
        CommandResult::Success { .. }
    ));
    for by in 1..=5 {
        assert!(matches!(
            root.handle_command(TallyCommand::Bump { by }).await,
            CommandResult::Success { .. }
        ));
    }

    let records = backend
        .load_events("Tally", &id.to_string(), 0)
        .await
        .unwrap();
    let sequence_numbers: Vec<u64> = records.iter().map(|r| r.sequence_number).collect();
    assert_eq!(sequence_numbers, (1..=6).collect::<Vec<u64>>());
}

#[tokio::test]
async fn replaying_all_events_reproduces_the_current_state() {
    let backend = Arc::new(InMemoryBackend::new());
    let mapper = Arc::new(mapper());
    let runtime: AggregateRuntime<Tally, _> =
        AggregateRuntime::new(backend.clone(), mapper.clone(), EventSourcingConfig::new());
    let id = Uuid::new_v4();
    let root = runtime.aggregate_root_of(id);

    root.handle_command(TallyCommand::Open).await;
    for by in [2, 7, 1] {
        root.handle_command(TallyCommand::Bump { by }).await;
    }

    let mut replayed: Option<TallyState> = None;
    for record in backend
        .load_events("Tally", &id.to_string(), 0)
        .await
        .unwrap()
    {
        let event = mapper
            .deserialize(&record.event_type, record.event_version, record.payload)
            .unwrap();
        replayed = match &replayed {
            None => Tally::eden_behavior().apply(&event),
            Some(state) => Tally::behavior_for(state).apply(&event, state),
        };
        assert!(replayed.is_some(), "every recorded event must apply");
    }

    assert_eq!(replayed, root.current_state().await.unwrap());
    assert_eq!(
        replayed,
        Some(TallyState {
            total: 10,
            entries: 3
        })
    );
}

#[tokio::test]
async fn snapshotting_is_transparent_to_rehydration() {
    let backend = Arc::new(InMemoryBackend::new());
    let runtime: AggregateRuntime<Tally, _> = AggregateRuntime::new(
        backend.clone(),
        Arc::new(mapper()),
        EventSourcingConfig::new().with_snapshot_threshold_for(Tally::AGGREGATE_TYPE, 3),
    );
    let id = Uuid::new_v4();
    let root = runtime.aggregate_root_of(id);

    root.handle_command(TallyCommand::Open).await;
    for by in [5, 5, 5, 5] {
        root.handle_command(TallyCommand::Bump { by }).await;
    }

    let before = root.current_state().await.unwrap();
    let snapshot = backend
        .load_snapshot("Tally", &id.to_string())
        .await
        .unwrap()
        .expect("snapshot emitted after crossing the threshold");
    assert_eq!(snapshot.version, 3);

    backend.delete_events_through("Tally", &id.to_string(), snapshot.version);

    assert_eq!(root.current_state().await.unwrap(), before);
    assert_eq!(root.current_version().await.unwrap(), 5);
}

#[tokio::test]
async fn dedup_horizon_expires_old_command_records() {
    let backend = Arc::new(InMemoryBackend::new());
    let runtime: AggregateRuntime<Tally, _> = AggregateRuntime::new(
        backend.clone(),
        Arc::new(mapper()),
        EventSourcingConfig::new().with_command_dedup_threshold_for(Tally::AGGREGATE_TYPE, 2),
    );
    let root = runtime.aggregate_root_of(Uuid::new_v4());

    root.handle_command(TallyCommand::Open).await;
    let result = root
        .handle_command_envelope(TallyCommand::Bump { by: 9 }, "bump-once")
        .await;
    assert!(matches!(
        result,
        CommandResult::Success {
            deduplicated: false,
            ..
        }
    ));

    // Two more events keep the record exactly at the horizon edge.
    root.handle_command(TallyCommand::Bump { by: 1 }).await;
    root.handle_command(TallyCommand::Bump { by: 1 }).await;
    let result = root
        .handle_command_envelope(TallyCommand::Bump { by: 9 }, "bump-once")
        .await;
    assert!(matches!(
        result,
        CommandResult::Success {
            deduplicated: true,
            ..
        }
    ));

    // One event further and the record has fallen out of the horizon; the
    // envelope is processed as a fresh command.
    root.handle_command(TallyCommand::Bump { by: 1 }).await;
    let result = root
        .handle_command_envelope(TallyCommand::Bump { by: 9 }, "bump-once")
        .await;
    assert!(matches!(
        result,
        CommandResult::Success {
            deduplicated: false,
            ..
        }
    ));
    assert_eq!(root.current_version().await.unwrap(), 6);
}

// -- Reporters ------------------------------------------------------------

#[derive(Default)]
struct SpyReporter {
    calls: Mutex<Vec<&'static str>>,
}

impl SpyReporter {
    fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }
}

impl AggregateReporter for SpyReporter {
    fn command_received(&self, _: &str, _: &str, _: &str) {
        self.calls.lock().unwrap().push("command_received");
    }

    fn command_deduplicated(&self, _: &str, _: &str, _: &str) {
        self.calls.lock().unwrap().push("command_deduplicated");
    }

    fn events_persisted(&self, _: &str, _: &str, _: &[eventide::EventRecord]) {
        self.calls.lock().unwrap().push("events_persisted");
    }

    fn snapshot_saved(&self, _: &str, _: &str, _: u64) {
        self.calls.lock().unwrap().push("snapshot_saved");
    }
}

#[tokio::test]
async fn reporters_observe_the_command_lifecycle() {
    let runtime: AggregateRuntime<Tally, _> = AggregateRuntime::new(
        Arc::new(InMemoryBackend::new()),
        Arc::new(mapper()),
        EventSourcingConfig::new()
            .with_command_dedup_threshold_for(Tally::AGGREGATE_TYPE, eventide::KEEP_FOREVER)
            .with_snapshot_threshold_for(Tally::AGGREGATE_TYPE, 1),
    );
    let spy = Arc::new(SpyReporter::default());
    runtime.reporters().register(spy.clone());

    let root = runtime.aggregate_root_of(Uuid::new_v4());
    root.handle_command_envelope(TallyCommand::Open, "open-1")
        .await;
    root.handle_command_envelope(TallyCommand::Open, "open-1")
        .await;

    assert_eq!(
        spy.calls(),
        vec![
            "command_received",
            "events_persisted",
            "snapshot_saved",
            "command_received",
            "command_deduplicated",
        ]
    );
}
