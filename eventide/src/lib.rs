//! # Event-Sourced Aggregate Runtime
//!
//! `eventide` is a Rust framework for building event-sourced applications
//! around two tightly coupled capabilities:
//!
//! - **The aggregate runtime**: commands are dispatched against behaviors
//!   derived from the aggregate's current state, producing events that are
//!   appended to a persistent log with optimistic concurrency, snapshotting
//!   and command deduplication.
//! - **The HTTP event subscription engine**: a pull-based consumer that polls
//!   a remote bounded context's event feed page by page, tracks
//!   per-subscription offsets and dispatches decoded events to registered
//!   handlers.
//!
//! ## Core Concepts
//!
//! - **[`Aggregate`]**: the consistency boundary. Defines identity, state
//!   variants and the behaviors that process commands and fold events.
//! - **[`EdenBehavior`] / [`Behavior`]**: pairs of partial functions
//!   (`receive`, `apply`). The eden behavior is the only behavior that may
//!   handle commands on a not-yet-existing aggregate; once any event has been
//!   appended, the behavior derives from state via
//!   [`Aggregate::behavior_for`].
//! - **[`Backend`]**: the persistence contract for events, snapshots and
//!   command records.
//! - **[`EventMapper`]**: bidirectional mapping between domain events and
//!   their serialized form, with versioned migration chains.
//! - **[`AggregateRuntime`]**: orchestrates rehydration, deduplication,
//!   dispatch, append and snapshotting.
//! - **[`HttpEventSource`]**: the paginated, resumable, offset-tracked feed
//!   consumer, driven by a [`Scheduler`].
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//!
//! use serde::{Deserialize, Serialize};
//! use uuid::Uuid;
//!
//! use eventide::store::in_memory::InMemoryBackend;
//! use eventide::{
//!     Aggregate, AggregateRuntime, Behavior, Command, CommandResult, EdenBehavior, Event,
//!     EventMapperBuilder, EventSourcingConfig, Reception,
//! };
//!
//! #[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
//! enum CounterEvent {
//!     Opened { initial: u64 },
//!     Incremented { by: u64 },
//! }
//!
//! impl Event for CounterEvent {
//!     fn event_type(&self) -> &'static str {
//!         match self {
//!             CounterEvent::Opened { .. } => "Opened",
//!             CounterEvent::Incremented { .. } => "Incremented",
//!         }
//!     }
//! }
//!
//! #[derive(Debug)]
//! enum CounterCommand {
//!     Open { initial: u64 },
//!     Increment { by: u64 },
//! }
//!
//! impl Command for CounterCommand {
//!     fn command_type(&self) -> &'static str {
//!         match self {
//!             CounterCommand::Open { .. } => "Open",
//!             CounterCommand::Increment { .. } => "Increment",
//!         }
//!     }
//! }
//!
//! #[derive(Debug, Clone, Serialize, Deserialize)]
//! struct CounterState {
//!     value: u64,
//! }
//!
//! struct Counter;
//!
//! impl Aggregate for Counter {
//!     type Id = Uuid;
//!     type Command = CounterCommand;
//!     type Event = CounterEvent;
//!     type State = CounterState;
//!     type Error = std::convert::Infallible;
//!
//!     const AGGREGATE_TYPE: &'static str = "Counter";
//!
//!     fn eden_behavior() -> EdenBehavior<Self> {
//!         EdenBehavior::new(
//!             |command| match command {
//!                 CounterCommand::Open { initial } => {
//!                     Reception::Accept(vec![CounterEvent::Opened { initial: *initial }])
//!                 }
//!                 _ => Reception::Unhandled,
//!             },
//!             |event| match event {
//!                 CounterEvent::Opened { initial } => Some(CounterState { value: *initial }),
//!                 _ => None,
//!             },
//!         )
//!     }
//!
//!     fn behavior_for(_state: &CounterState) -> Behavior<Self> {
//!         Behavior::new(
//!             |command, _state| match command {
//!                 CounterCommand::Increment { by } => {
//!                     Reception::Accept(vec![CounterEvent::Incremented { by: *by }])
//!                 }
//!                 _ => Reception::Unhandled,
//!             },
//!             |event, state: &CounterState| match event {
//!                 CounterEvent::Incremented { by } => {
//!                     Some(CounterState { value: state.value + by })
//!                 }
//!                 _ => None,
//!             },
//!         )
//!     }
//! }
//!
//! # async fn example() {
//! let mapper = EventMapperBuilder::new()
//!     .event(
//!         "Opened",
//!         1,
//!         |event| match event {
//!             CounterEvent::Opened { .. } => Some(serde_json::to_value(event)),
//!             _ => None,
//!         },
//!         |value| serde_json::from_value(value),
//!     )
//!     .event(
//!         "Incremented",
//!         1,
//!         |event| match event {
//!             CounterEvent::Incremented { .. } => Some(serde_json::to_value(event)),
//!             _ => None,
//!         },
//!         |value| serde_json::from_value(value),
//!     )
//!     .build()
//!     .expect("mapper configuration is complete");
//!
//! let runtime = AggregateRuntime::<Counter, _>::new(
//!     Arc::new(InMemoryBackend::new()),
//!     Arc::new(mapper),
//!     EventSourcingConfig::default(),
//! );
//!
//! let id = Uuid::new_v4();
//! let root = runtime.aggregate_root_of(id);
//! let result = root.handle_command(CounterCommand::Open { initial: 1 }).await;
//! assert!(matches!(result, CommandResult::Success { .. }));
//! # }
//! ```
#![deny(missing_docs)]

use std::fmt::Debug;

pub use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};
use uuid::Uuid;

pub mod backend;
pub mod config;
pub mod mapper;
pub mod offset;
pub mod reporter;
pub mod runtime;
pub mod scheduler;
pub mod source;
pub mod store;

pub use backend::{Backend, BackendError, CommandRecord, EventRecord, SnapshotRecord};
pub use config::{
    EdenPolicy, EventSourcingConfig, HttpEventSourceConfig, SubscriptionConfig, KEEP_FOREVER,
};
pub use mapper::{EventMapper, EventMapperBuilder, MapperBuildError, MapperError};
pub use offset::{OffsetState, OffsetTracker};
pub use reporter::{AggregateReporter, SubscriptionReporter};
pub use runtime::{
    AggregateRoot, AggregateRuntime, CommandRejection, CommandResult, StateError, UnexpectedError,
};
pub use scheduler::{Job, JobError, Scheduler};
pub use source::{
    handler_fn, EventHandler, FeedEventMeta, HandlerError, HttpEventSource, SubscriptionHandlers,
};

/// A marker trait for events.
///
/// Events must be serializable, deserializable, clonable, and debuggable.
/// The `Event` derive macro from `eventide-derive` can be used to
/// automatically implement this trait for enums.
pub trait Event: Serialize + DeserializeOwned + Clone + Debug + Send + Sync + 'static {
    /// Returns a static string slice identifying the type of the event.
    ///
    /// This is the lookup key for the [`EventMapper`](mapper::EventMapper)
    /// and for subscription handler dispatch.
    fn event_type(&self) -> &'static str;
}

/// A marker trait for commands.
///
/// The `Command` derive macro from `eventide-derive` can be used to
/// automatically implement this trait for enums.
pub trait Command: Debug + Send + Sync {
    /// Returns a static string slice identifying the type of the command.
    ///
    /// Recorded alongside the command id when deduplication is enabled.
    fn command_type(&self) -> &'static str;
}

/// Uniquely identifies an aggregate instance.
///
/// Identifiers are converted to strings at the backend boundary; the trait
/// exists so callers can use strongly-typed ids without the runtime caring.
pub trait AggregateId:
    Eq + std::hash::Hash + Clone + Send + Sync + Debug + std::fmt::Display + 'static
{
    /// Creates a new, unique aggregate ID.
    fn new() -> Self;
}

impl AggregateId for Uuid {
    fn new() -> Self {
        Uuid::new_v4()
    }
}

/// An aggregate is a consistency boundary. It is the fundamental building
/// block of the domain model.
///
/// An aggregate is declarative: it names itself, provides the *eden*
/// behavior that handles commands while no events exist yet, and selects a
/// [`Behavior`] for every state variant. The runtime owns the rest
/// (rehydration, dedup, append, snapshots).
pub trait Aggregate: Send + Sync + Sized + 'static {
    /// The type of the aggregate's unique identifier.
    type Id: AggregateId;
    /// The type of commands that this aggregate can handle.
    type Command: Command;
    /// The type of events that this aggregate produces.
    type Event: Event;
    /// The state folded from the event stream. Serializable so snapshots can
    /// be persisted.
    type State: Clone + Debug + Serialize + DeserializeOwned + Send + Sync;
    /// The domain error produced when a behavior rejects a command.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Unique string identifying this aggregate type in the event store.
    /// Must be stable across deployments.
    const AGGREGATE_TYPE: &'static str;

    /// The behavior that applies before any event has been appended.
    ///
    /// Only commands expected on a nonexistent aggregate should be handled
    /// here; leaving everything else unhandled is what lets the runtime
    /// detect `AggregateInstanceAlreadyExists` for creation commands sent to
    /// a live aggregate.
    fn eden_behavior() -> EdenBehavior<Self>;

    /// Selects the behavior for the current state.
    fn behavior_for(state: &Self::State) -> Behavior<Self>;
}

/// The outcome of a behavior's `receive` handler for one command.
pub enum Reception<A: Aggregate> {
    /// The command was accepted and produced these events, in append order.
    Accept(Vec<A::Event>),
    /// The command was rejected by a business rule.
    Reject(A::Error),
    /// No clause of this behavior handles the command.
    Unhandled,
}

type EdenReceiveFn<A> = Box<dyn Fn(&<A as Aggregate>::Command) -> Reception<A> + Send + Sync>;
type OriginateFn<A> =
    Box<dyn Fn(&<A as Aggregate>::Event) -> Option<<A as Aggregate>::State> + Send + Sync>;
type ReceiveFn<A> = Box<
    dyn Fn(&<A as Aggregate>::Command, &<A as Aggregate>::State) -> Reception<A> + Send + Sync,
>;
type EvolveFn<A> = Box<
    dyn Fn(&<A as Aggregate>::Event, &<A as Aggregate>::State) -> Option<<A as Aggregate>::State>
        + Send
        + Sync,
>;

/// The behavior of an aggregate that does not exist yet.
///
/// `receive` decides commands without any state; `apply` originates the
/// initial state from the first event.
pub struct EdenBehavior<A: Aggregate> {
    receive: EdenReceiveFn<A>,
    apply: OriginateFn<A>,
}

impl<A: Aggregate> EdenBehavior<A> {
    /// Creates an eden behavior from its `receive` and `apply` clauses.
    ///
    /// Construction is one-shot; the behavior is frozen afterwards.
    pub fn new(
        receive: impl Fn(&A::Command) -> Reception<A> + Send + Sync + 'static,
        apply: impl Fn(&A::Event) -> Option<A::State> + Send + Sync + 'static,
    ) -> Self {
        Self {
            receive: Box::new(receive),
            apply: Box::new(apply),
        }
    }

    /// Dispatches a command against the eden behavior.
    pub fn receive(&self, command: &A::Command) -> Reception<A> {
        (self.receive)(command)
    }

    /// Originates the initial state from an event, or `None` when the event
    /// cannot create the aggregate.
    pub fn apply(&self, event: &A::Event) -> Option<A::State> {
        (self.apply)(event)
    }
}

/// The behavior selected for a live aggregate state.
///
/// Both clauses are partial: `receive` may leave a command
/// [`Unhandled`](Reception::Unhandled) and `apply` may return `None` for an
/// event that does not apply to the current state. The runtime surfaces
/// those as the appropriate unexpected-error outcomes.
pub struct Behavior<A: Aggregate> {
    receive: ReceiveFn<A>,
    apply: EvolveFn<A>,
}

impl<A: Aggregate> Behavior<A> {
    /// Creates a behavior from its `receive` and `apply` clauses.
    ///
    /// Construction is one-shot; the behavior is frozen afterwards.
    pub fn new(
        receive: impl Fn(&A::Command, &A::State) -> Reception<A> + Send + Sync + 'static,
        apply: impl Fn(&A::Event, &A::State) -> Option<A::State> + Send + Sync + 'static,
    ) -> Self {
        Self {
            receive: Box::new(receive),
            apply: Box::new(apply),
        }
    }

    /// Dispatches a command against the current state.
    pub fn receive(&self, command: &A::Command, state: &A::State) -> Reception<A> {
        (self.receive)(command, state)
    }

    /// Folds an event into a new state, or `None` when no clause matches.
    pub fn apply(&self, event: &A::Event, state: &A::State) -> Option<A::State> {
        (self.apply)(event, state)
    }
}
