//! Per-subscription offset tracking for the feed consumer.

use async_trait::async_trait;

/// The position of a subscription in the remote event feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OffsetState {
    /// The subscription has never processed an event.
    NoOffset,
    /// The offset of the last event the subscription processed.
    LastProcessed(u64),
}

/// The error type for offset store operations.
#[derive(Debug, thiserror::Error)]
#[error("offset store unavailable: {0}")]
pub struct OffsetError(#[source] Box<dyn std::error::Error + Send + Sync>);

impl OffsetError {
    /// Wraps an arbitrary error.
    pub fn new(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self(error.into())
    }
}

/// Persists the last-processed offset per subscription name.
///
/// `save_offset` must be durable before returning. A stale save (an older
/// offset) is allowed; the consumer monotonizes by processing events in
/// ascending offset order.
#[async_trait]
pub trait OffsetTracker: Send + Sync {
    /// Reads the stored offset for a subscription. A missing record reads as
    /// [`OffsetState::NoOffset`].
    async fn get_offset(&self, subscription_name: &str) -> Result<OffsetState, OffsetError>;

    /// Stores the offset for a subscription, creating the record on first
    /// save.
    async fn save_offset(&self, subscription_name: &str, value: u64) -> Result<(), OffsetError>;
}
