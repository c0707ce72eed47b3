//! An in-memory offset tracker.

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::instrument;

use crate::offset::{OffsetError, OffsetState, OffsetTracker};

/// An in-memory, thread-safe [`OffsetTracker`].
///
/// This is useful for testing or for subscriptions that can afford to
/// restart from their eden policy after a crash.
#[derive(Default)]
pub struct InMemoryOffsetTracker {
    offsets: DashMap<String, u64>,
}

impl InMemoryOffsetTracker {
    /// Creates an empty tracker.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OffsetTracker for InMemoryOffsetTracker {
    #[instrument(skip(self))]
    async fn get_offset(&self, subscription_name: &str) -> Result<OffsetState, OffsetError> {
        Ok(self
            .offsets
            .get(subscription_name)
            .map(|offset| OffsetState::LastProcessed(*offset))
            .unwrap_or(OffsetState::NoOffset))
    }

    #[instrument(skip(self))]
    async fn save_offset(&self, subscription_name: &str, value: u64) -> Result<(), OffsetError> {
        self.offsets.insert(subscription_name.to_string(), value);
        Ok(())
    }
}
