//! Side-channel observation hooks for the aggregate runtime and the feed
//! consumer.
//!
//! Reporters are registered dynamically and notified synchronously at each
//! lifecycle point. They must not block the main path; a panicking reporter
//! is caught and logged, never propagated.

use std::panic::AssertUnwindSafe;
use std::sync::{Arc, RwLock};

use tracing::warn;

use crate::backend::{BackendError, EventRecord};
use crate::source::HandlerError;

/// Observes the aggregate runtime's command lifecycle.
///
/// All methods default to no-ops; implement only the hooks of interest.
pub trait AggregateReporter: Send + Sync {
    /// A command arrived for processing.
    fn command_received(&self, aggregate_type: &str, aggregate_id: &str, command_type: &str) {
        let _ = (aggregate_type, aggregate_id, command_type);
    }

    /// A command envelope was answered from its recorded outcome.
    fn command_deduplicated(&self, aggregate_type: &str, aggregate_id: &str, command_id: &str) {
        let _ = (aggregate_type, aggregate_id, command_id);
    }

    /// A behavior rejected a command.
    fn command_rejected(&self, aggregate_type: &str, aggregate_id: &str, command_type: &str) {
        let _ = (aggregate_type, aggregate_id, command_type);
    }

    /// Events were appended to the log.
    fn events_persisted(&self, aggregate_type: &str, aggregate_id: &str, records: &[EventRecord]) {
        let _ = (aggregate_type, aggregate_id, records);
    }

    /// A snapshot was persisted at the given version.
    fn snapshot_saved(&self, aggregate_type: &str, aggregate_id: &str, version: u64) {
        let _ = (aggregate_type, aggregate_id, version);
    }

    /// The backend failed outside of an optimistic concurrency conflict.
    fn backend_error(&self, aggregate_type: &str, aggregate_id: &str, error: &BackendError) {
        let _ = (aggregate_type, aggregate_id, error);
    }
}

/// Observes the feed consumer's subscription lifecycle.
///
/// All methods default to no-ops; implement only the hooks of interest.
pub trait SubscriptionReporter: Send + Sync {
    /// A feed page was fetched.
    fn page_fetched(&self, subscription_name: &str, events: usize, page_end_offset: i64) {
        let _ = (subscription_name, events, page_end_offset);
    }

    /// A feed event was decoded and its handler completed.
    fn event_handled(&self, subscription_name: &str, event_type: &str, offset: u64) {
        let _ = (subscription_name, event_type, offset);
    }

    /// A feed event had no registered handler and was skipped.
    fn event_skipped(&self, subscription_name: &str, event_type: &str, offset: u64) {
        let _ = (subscription_name, event_type, offset);
    }

    /// A handler failed; the offset was not advanced.
    fn handler_failed(
        &self,
        subscription_name: &str,
        event_type: &str,
        offset: u64,
        error: &HandlerError,
    ) {
        let _ = (subscription_name, event_type, offset, error);
    }

    /// The subscription's offset was persisted.
    fn offset_saved(&self, subscription_name: &str, offset: u64) {
        let _ = (subscription_name, offset);
    }
}

/// A copy-on-write set of reporters.
///
/// Registration clones the list under a write lock; notification reads a
/// snapshot, so observers never hold the lock across their own execution.
pub(crate) struct ReporterSet<R: ?Sized> {
    reporters: RwLock<Vec<Arc<R>>>,
}

impl<R: ?Sized> Default for ReporterSet<R> {
    fn default() -> Self {
        Self {
            reporters: RwLock::new(Vec::new()),
        }
    }
}

impl<R: ?Sized> ReporterSet<R> {
    pub(crate) fn register(&self, reporter: Arc<R>) {
        self.reporters
            .write()
            .expect("reporter set lock poisoned")
            .push(reporter);
    }

    fn snapshot(&self) -> Vec<Arc<R>> {
        self.reporters
            .read()
            .expect("reporter set lock poisoned")
            .clone()
    }

    /// Invokes `notify` for each registered reporter, swallowing panics.
    pub(crate) fn each(&self, notify: impl Fn(&R)) {
        for reporter in self.snapshot() {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| notify(&reporter)));
            if outcome.is_err() {
                warn!("reporter panicked during notification");
            }
        }
    }
}

/// The registered [`AggregateReporter`]s of a runtime.
#[derive(Default)]
pub struct AggregateReporters {
    pub(crate) set: ReporterSet<dyn AggregateReporter>,
}

impl AggregateReporters {
    /// Registers a reporter. Reporters cannot be removed.
    pub fn register(&self, reporter: Arc<dyn AggregateReporter>) {
        self.set.register(reporter);
    }
}

/// The registered [`SubscriptionReporter`]s of a feed consumer.
#[derive(Default)]
pub struct SubscriptionReporters {
    pub(crate) set: Arc<ReporterSet<dyn SubscriptionReporter>>,
}

impl SubscriptionReporters {
    /// Registers a reporter. Reporters cannot be removed.
    pub fn register(&self, reporter: Arc<dyn SubscriptionReporter>) {
        self.set.register(reporter);
    }
}
