//! Structured configuration for the runtime and the feed consumer.
//!
//! There is no configuration loading here; callers construct these values
//! however they like and hand them in.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Dedup threshold value meaning "keep command records forever".
pub const KEEP_FOREVER: u64 = u64::MAX;

/// Per-aggregate-type tuning for the runtime.
///
/// Thresholds of 0 disable the corresponding mechanism; that is the
/// default for both.
#[derive(Debug, Clone, Default)]
pub struct EventSourcingConfig {
    default_command_dedup_threshold: u64,
    default_snapshot_threshold: u64,
    command_dedup_thresholds: HashMap<String, u64>,
    snapshot_thresholds: HashMap<String, u64>,
}

impl EventSourcingConfig {
    /// Creates a configuration with both mechanisms disabled.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the default command dedup threshold for all aggregate types.
    ///
    /// The threshold is the maximum distance (in sequence numbers) between a
    /// command's last effect and the current high-water mark within which a
    /// repeated command id returns the recorded result. Use [`KEEP_FOREVER`]
    /// to never expire records.
    #[must_use]
    pub fn with_command_dedup_threshold(mut self, threshold: u64) -> Self {
        self.default_command_dedup_threshold = threshold;
        self
    }

    /// Sets the default snapshot threshold for all aggregate types.
    ///
    /// A snapshot is emitted with an append once the high-water mark has
    /// advanced at least `threshold` past the last snapshot.
    #[must_use]
    pub fn with_snapshot_threshold(mut self, threshold: u64) -> Self {
        self.default_snapshot_threshold = threshold;
        self
    }

    /// Overrides the command dedup threshold for one aggregate type.
    #[must_use]
    pub fn with_command_dedup_threshold_for(
        mut self,
        aggregate_type: &str,
        threshold: u64,
    ) -> Self {
        self.command_dedup_thresholds
            .insert(aggregate_type.to_string(), threshold);
        self
    }

    /// Overrides the snapshot threshold for one aggregate type.
    #[must_use]
    pub fn with_snapshot_threshold_for(mut self, aggregate_type: &str, threshold: u64) -> Self {
        self.snapshot_thresholds
            .insert(aggregate_type.to_string(), threshold);
        self
    }

    /// The command dedup threshold in effect for an aggregate type.
    pub fn command_dedup_threshold_for(&self, aggregate_type: &str) -> u64 {
        self.command_dedup_thresholds
            .get(aggregate_type)
            .copied()
            .unwrap_or(self.default_command_dedup_threshold)
    }

    /// The snapshot threshold in effect for an aggregate type.
    pub fn snapshot_threshold_for(&self, aggregate_type: &str) -> u64 {
        self.snapshot_thresholds
            .get(aggregate_type)
            .copied()
            .unwrap_or(self.default_snapshot_threshold)
    }
}

/// Where a brand-new subscription starts reading the feed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EdenPolicy {
    /// Start before the first event ever written (`after_offset = -1`).
    BeginningOfTime,
    /// Start at the wall-clock instant the subscription was created,
    /// captured once; offset-based queries take over after the first save.
    FromNow,
}

/// Identity and start policy of one subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionConfig {
    /// The subscription's unique name; keys the offset store.
    pub name: String,
    /// Where the subscription starts when it has no saved offset.
    pub eden_policy: EdenPolicy,
}

impl SubscriptionConfig {
    /// Creates a subscription configuration.
    pub fn new(name: impl Into<String>, eden_policy: EdenPolicy) -> Self {
        Self {
            name: name.into(),
            eden_policy,
        }
    }
}

/// Endpoint and per-subscription tuning for the HTTP feed consumer.
#[derive(Debug, Clone)]
pub struct HttpEventSourceConfig {
    protocol: String,
    host: String,
    port: u16,
    path: String,
    default_batch_size: u32,
    default_repeat_schedule: Duration,
    default_timeout: Duration,
    batch_sizes: HashMap<String, u32>,
    repeat_schedules: HashMap<String, Duration>,
    timeouts: HashMap<String, Duration>,
    disabled: HashSet<String>,
}

impl HttpEventSourceConfig {
    /// Creates a configuration for the feed at
    /// `{protocol}://{host}:{port}{path}` with default tuning (batch size
    /// 100, one-second repeat schedule, thirty-second timeout).
    pub fn new(
        protocol: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        path: impl Into<String>,
    ) -> Self {
        Self {
            protocol: protocol.into(),
            host: host.into(),
            port,
            path: path.into(),
            default_batch_size: 100,
            default_repeat_schedule: Duration::from_secs(1),
            default_timeout: Duration::from_secs(30),
            batch_sizes: HashMap::new(),
            repeat_schedules: HashMap::new(),
            timeouts: HashMap::new(),
            disabled: HashSet::new(),
        }
    }

    /// Sets the default page size for feed queries.
    #[must_use]
    pub fn with_batch_size(mut self, batch_size: u32) -> Self {
        self.default_batch_size = batch_size;
        self
    }

    /// Sets the default delay between polling runs.
    #[must_use]
    pub fn with_repeat_schedule(mut self, repeat_schedule: Duration) -> Self {
        self.default_repeat_schedule = repeat_schedule;
        self
    }

    /// Sets the default per-run deadline.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Overrides the page size for one subscription.
    #[must_use]
    pub fn with_batch_size_for(mut self, subscription_name: &str, batch_size: u32) -> Self {
        self.batch_sizes
            .insert(subscription_name.to_string(), batch_size);
        self
    }

    /// Overrides the repeat schedule for one subscription.
    #[must_use]
    pub fn with_repeat_schedule_for(
        mut self,
        subscription_name: &str,
        repeat_schedule: Duration,
    ) -> Self {
        self.repeat_schedules
            .insert(subscription_name.to_string(), repeat_schedule);
        self
    }

    /// Overrides the per-run deadline for one subscription.
    #[must_use]
    pub fn with_timeout_for(mut self, subscription_name: &str, timeout: Duration) -> Self {
        self.timeouts
            .insert(subscription_name.to_string(), timeout);
        self
    }

    /// Disables one subscription; [`subscribe`](crate::HttpEventSource::subscribe)
    /// becomes a logged no-op for it.
    #[must_use]
    pub fn with_disabled(mut self, subscription_name: &str) -> Self {
        self.disabled.insert(subscription_name.to_string());
        self
    }

    /// The page size in effect for a subscription.
    pub fn batch_size_for(&self, subscription_name: &str) -> u32 {
        self.batch_sizes
            .get(subscription_name)
            .copied()
            .unwrap_or(self.default_batch_size)
    }

    /// The repeat schedule in effect for a subscription.
    pub fn repeat_schedule_for(&self, subscription_name: &str) -> Duration {
        self.repeat_schedules
            .get(subscription_name)
            .copied()
            .unwrap_or(self.default_repeat_schedule)
    }

    /// The per-run deadline in effect for a subscription.
    pub fn timeout_for(&self, subscription_name: &str) -> Duration {
        self.timeouts
            .get(subscription_name)
            .copied()
            .unwrap_or(self.default_timeout)
    }

    /// Whether a subscription should run at all.
    pub fn enabled(&self, subscription_name: &str) -> bool {
        !self.disabled.contains(subscription_name)
    }

    /// The feed endpoint as a URL string.
    pub fn endpoint(&self) -> String {
        format!(
            "{}://{}:{}{}",
            self.protocol, self.host, self.port, self.path
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thresholds_fall_back_to_defaults() {
        let config = EventSourcingConfig::new()
            .with_command_dedup_threshold(10)
            .with_snapshot_threshold(100)
            .with_command_dedup_threshold_for("User", KEEP_FOREVER)
            .with_snapshot_threshold_for("User", 4);

        assert_eq!(config.command_dedup_threshold_for("User"), KEEP_FOREVER);
        assert_eq!(config.command_dedup_threshold_for("Order"), 10);
        assert_eq!(config.snapshot_threshold_for("User"), 4);
        assert_eq!(config.snapshot_threshold_for("Order"), 100);
    }

    #[test]
    fn subscription_tuning_falls_back_to_defaults() {
        let config = HttpEventSourceConfig::new("http", "localhost", 8080, "/events")
            .with_batch_size(50)
            .with_batch_size_for("audit", 500)
            .with_disabled("audit");

        assert_eq!(config.batch_size_for("audit"), 500);
        assert_eq!(config.batch_size_for("billing"), 50);
        assert!(!config.enabled("audit"));
        assert!(config.enabled("billing"));
        assert_eq!(config.endpoint(), "http://localhost:8080/events");
    }
}
