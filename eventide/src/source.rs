//! The pull-based HTTP event feed consumer.
//!
//! A [`HttpEventSource`] polls a remote bounded context's event feed page by
//! page, decodes events through an [`EventMapper`], dispatches them to
//! registered handlers in ascending offset order and saves the subscription
//! offset after each handled event. Backlog is drained by the
//! [`Scheduler`]'s immediate re-invocation; fresh subscriptions start where
//! their [`EdenPolicy`] says.

use std::collections::{BTreeSet, HashMap};
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::Deserialize;
use tracing::{info, instrument, warn};
use url::Url;

use crate::config::{EdenPolicy, HttpEventSourceConfig, SubscriptionConfig};
use crate::mapper::EventMapper;
use crate::offset::{OffsetState, OffsetTracker};
use crate::reporter::{ReporterSet, SubscriptionReporter, SubscriptionReporters};
use crate::scheduler::{Job, JobError, Scheduler};
use crate::Event;

/// One page of the remote event feed.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedPage {
    /// The page's events, in ascending offset order.
    pub events: Vec<FeedEvent>,
    /// The highest offset matching the query's tags.
    pub query_max_offset: i64,
    /// The highest offset in the whole feed.
    pub global_max_offset: i64,
    /// The offset the page starts after.
    pub page_start_offset: i64,
    /// The offset of the last event in the page.
    pub page_end_offset: i64,
}

/// One event as served by the remote feed.
#[derive(Debug, Clone, Deserialize)]
pub struct FeedEvent {
    /// The event's unique id.
    pub id: String,
    /// The aggregate instance the event belongs to.
    pub aggregate_id: String,
    /// The id of whatever caused the event.
    pub causation_id: String,
    /// Optional correlation identifier.
    pub correlation_id: Option<String>,
    /// The event's position in its aggregate's log.
    pub sequence_number: u64,
    /// The event's position in the feed.
    pub offset: u64,
    /// The event's type name.
    #[serde(rename = "type")]
    pub event_type: String,
    /// The serialized event payload.
    pub payload: serde_json::Value,
}

impl FeedEvent {
    fn meta(&self) -> FeedEventMeta {
        FeedEventMeta {
            id: self.id.clone(),
            aggregate_id: self.aggregate_id.clone(),
            causation_id: self.causation_id.clone(),
            correlation_id: self.correlation_id.clone(),
            sequence_number: self.sequence_number,
            offset: self.offset,
        }
    }
}

/// Provenance of a feed event, handed to handlers alongside the decoded
/// payload.
#[derive(Debug, Clone)]
pub struct FeedEventMeta {
    /// The event's unique id.
    pub id: String,
    /// The aggregate instance the event belongs to.
    pub aggregate_id: String,
    /// The id of whatever caused the event.
    pub causation_id: String,
    /// Optional correlation identifier.
    pub correlation_id: Option<String>,
    /// The event's position in its aggregate's log.
    pub sequence_number: u64,
    /// The event's position in the feed.
    pub offset: u64,
}

/// The error type for subscription handlers.
#[derive(Debug, thiserror::Error)]
#[error(transparent)]
pub struct HandlerError(Box<dyn std::error::Error + Send + Sync>);

impl HandlerError {
    /// Wraps an arbitrary error.
    pub fn new(error: impl Into<Box<dyn std::error::Error + Send + Sync>>) -> Self {
        Self(error.into())
    }
}

/// Handles decoded feed events of one type.
#[async_trait]
pub trait EventHandler<E: Event>: Send + Sync {
    /// Processes one decoded event. Failing keeps the subscription offset
    /// where it was; the event is redelivered on the next run.
    async fn handle(&self, event: E, meta: &FeedEventMeta) -> Result<(), HandlerError>;
}

struct FnHandler<F, E> {
    f: F,
    _event: PhantomData<fn(E)>,
}

#[async_trait]
impl<E, F, Fut> EventHandler<E> for FnHandler<F, E>
where
    E: Event,
    F: Fn(E, FeedEventMeta) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(), HandlerError>> + Send,
{
    async fn handle(&self, event: E, meta: &FeedEventMeta) -> Result<(), HandlerError> {
        (self.f)(event, meta.clone()).await
    }
}

/// Adapts an async closure into an [`EventHandler`].
pub fn handler_fn<E, F, Fut>(f: F) -> Arc<dyn EventHandler<E>>
where
    E: Event,
    F: Fn(E, FeedEventMeta) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler {
        f,
        _event: PhantomData,
    })
}

/// The handlers of one subscription, keyed by event type name.
pub struct SubscriptionHandlers<E: Event> {
    handlers: HashMap<String, Arc<dyn EventHandler<E>>>,
}

impl<E: Event> Default for SubscriptionHandlers<E> {
    fn default() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }
}

impl<E: Event> SubscriptionHandlers<E> {
    /// Creates an empty handler set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a handler for one event type.
    #[must_use]
    pub fn on(mut self, event_type: &str, handler: Arc<dyn EventHandler<E>>) -> Self {
        self.handlers.insert(event_type.to_string(), handler);
        self
    }

    /// Registers an async closure as the handler for one event type.
    #[must_use]
    pub fn on_fn<F, Fut>(self, event_type: &str, f: F) -> Self
    where
        F: Fn(E, FeedEventMeta) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
    {
        self.on(event_type, handler_fn(f))
    }
}

/// The error type for subscription setup.
#[derive(Debug, thiserror::Error)]
pub enum SubscribeError {
    /// A handled event type has no tag mapping.
    #[error("event type '{0}' has no tag mapping")]
    UnknownEventType(String),

    /// A handled event type has no registered codec.
    #[error("event type '{0}' has no registered codec")]
    UnregisteredEventType(String),

    /// The configured endpoint is not a valid URL.
    #[error("invalid feed endpoint '{endpoint}': {source}")]
    InvalidEndpoint {
        /// The endpoint as configured.
        endpoint: String,
        /// The parse failure.
        #[source]
        source: url::ParseError,
    },
}

/// The error type for feed fetches.
#[derive(Debug, thiserror::Error)]
pub enum FeedError {
    /// The request could not be sent or the response body not read.
    #[error("feed request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The feed answered with a non-success status.
    #[error("feed responded with status {status}: {body}")]
    Status {
        /// The response status.
        status: reqwest::StatusCode,
        /// The response body, for diagnostics.
        body: String,
    },
}

enum QueryPolicy {
    Offset,
    FromNow { captured_at: DateTime<Utc> },
}

struct RequestFactory {
    base: Url,
    tags: String,
    batch_size: u32,
    policy: QueryPolicy,
}

impl RequestFactory {
    fn build(&self, offset: OffsetState) -> Url {
        let mut url = self.base.clone();
        {
            let mut query = url.query_pairs_mut();
            query.append_pair("tags", &self.tags);
            match (&self.policy, offset) {
                (_, OffsetState::LastProcessed(last)) => {
                    query.append_pair("after_offset", &last.to_string());
                }
                (QueryPolicy::Offset, OffsetState::NoOffset) => {
                    query.append_pair("after_offset", "-1");
                }
                (QueryPolicy::FromNow { captured_at }, OffsetState::NoOffset) => {
                    query.append_pair(
                        "after_timestamp",
                        &captured_at.to_rfc3339_opts(SecondsFormat::Secs, true),
                    );
                }
            }
            query.append_pair("batch_size", &self.batch_size.to_string());
        }
        url
    }
}

/// A pull-based consumer of one remote event feed.
///
/// Construction wires together the feed endpoint, the codec registry, the
/// event-type-to-tag table, the offset store and the scheduler; individual
/// subscriptions are then registered through
/// [`subscribe`](HttpEventSource::subscribe).
pub struct HttpEventSource<E: Event> {
    client: reqwest::Client,
    config: HttpEventSourceConfig,
    mapper: Arc<EventMapper<E>>,
    tags: HashMap<String, String>,
    offsets: Arc<dyn OffsetTracker>,
    scheduler: Arc<Scheduler>,
    reporters: SubscriptionReporters,
}

impl<E: Event> HttpEventSource<E> {
    /// Creates a consumer for the feed described by `config`.
    ///
    /// `tags` maps each consumable event type name to the coarse-grained
    /// feed tag it is published under.
    pub fn new(
        config: HttpEventSourceConfig,
        mapper: Arc<EventMapper<E>>,
        tags: HashMap<String, String>,
        offsets: Arc<dyn OffsetTracker>,
        scheduler: Arc<Scheduler>,
    ) -> Self {
        Self {
            client: reqwest::Client::new(),
            config,
            mapper,
            tags,
            offsets,
            scheduler,
            reporters: SubscriptionReporters::default(),
        }
    }

    /// The consumer's reporter registry.
    pub fn reporters(&self) -> &SubscriptionReporters {
        &self.reporters
    }

    /// Registers a subscription with the scheduler.
    ///
    /// Handled event types are resolved to their tags and codecs first;
    /// unknown types fail loudly. A subscription disabled by configuration
    /// is logged and not scheduled.
    pub fn subscribe(
        &self,
        subscription: SubscriptionConfig,
        handlers: SubscriptionHandlers<E>,
    ) -> Result<(), SubscribeError> {
        let job = self.subscription_job(&subscription, handlers)?;

        if !self.config.enabled(&subscription.name) {
            info!(
                subscription = %subscription.name,
                "subscription is disabled; not scheduling"
            );
            return Ok(());
        }

        self.scheduler.schedule_many_times(
            self.config.repeat_schedule_for(&subscription.name),
            self.config.timeout_for(&subscription.name),
            Arc::new(job),
        );
        Ok(())
    }

    /// Builds the polling job for a subscription without scheduling it.
    ///
    /// Useful for driving ticks manually (tests, custom schedulers). The
    /// `FromNow` instant is captured here, once.
    pub fn subscription_job(
        &self,
        subscription: &SubscriptionConfig,
        handlers: SubscriptionHandlers<E>,
    ) -> Result<EventSourceJob<E>, SubscribeError> {
        let mut tags = BTreeSet::new();
        for event_type in handlers.handlers.keys() {
            let tag = self
                .tags
                .get(event_type)
                .ok_or_else(|| SubscribeError::UnknownEventType(event_type.clone()))?;
            if !self.mapper.contains(event_type) {
                return Err(SubscribeError::UnregisteredEventType(event_type.clone()));
            }
            tags.insert(tag.clone());
        }

        let endpoint = self.config.endpoint();
        let base = Url::parse(&endpoint)
            .map_err(|source| SubscribeError::InvalidEndpoint { endpoint, source })?;
        let batch_size = self.config.batch_size_for(&subscription.name);

        Ok(EventSourceJob {
            name: subscription.name.clone(),
            client: self.client.clone(),
            factory: RequestFactory {
                base,
                tags: tags.into_iter().collect::<Vec<_>>().join(","),
                batch_size,
                policy: match subscription.eden_policy {
                    EdenPolicy::BeginningOfTime => QueryPolicy::Offset,
                    EdenPolicy::FromNow => QueryPolicy::FromNow {
                        captured_at: Utc::now(),
                    },
                },
            },
            mapper: Arc::clone(&self.mapper),
            handlers: handlers.handlers,
            offsets: Arc::clone(&self.offsets),
            reporters: Arc::clone(&self.reporters.set),
            batch_size,
        })
    }
}

/// The repeatable polling job of one subscription.
pub struct EventSourceJob<E: Event> {
    name: String,
    client: reqwest::Client,
    factory: RequestFactory,
    mapper: Arc<EventMapper<E>>,
    handlers: HashMap<String, Arc<dyn EventHandler<E>>>,
    offsets: Arc<dyn OffsetTracker>,
    reporters: Arc<ReporterSet<dyn SubscriptionReporter>>,
    batch_size: u32,
}

impl<E: Event> std::fmt::Debug for EventSourceJob<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventSourceJob")
            .field("name", &self.name)
            .field("batch_size", &self.batch_size)
            .finish()
    }
}

#[async_trait]
impl<E: Event> Job for EventSourceJob<E> {
    fn name(&self) -> &str {
        &self.name
    }

    #[instrument(skip(self), fields(subscription = %self.name))]
    async fn execute(&self) -> Result<bool, JobError> {
        let offset = self
            .offsets
            .get_offset(&self.name)
            .await
            .map_err(JobError::new)?;
        let url = self.factory.build(offset);

        let page = self.fetch_page(url).await.map_err(JobError::new)?;
        self.reporters.each(|reporter| {
            reporter.page_fetched(&self.name, page.events.len(), page.page_end_offset);
        });

        if page.events.is_empty() {
            // Advance past skipped events so empty pages do not pin the
            // subscription behind offsets it will never receive.
            let derived = page.query_max_offset.max(page.global_max_offset);
            if self.batch_size > 0 && derived > -1 {
                self.save_offset(derived as u64).await?;
            }
            return Ok(false);
        }

        for event in &page.events {
            let Some(handler) = self.handlers.get(&event.event_type) else {
                self.reporters.each(|reporter| {
                    reporter.event_skipped(&self.name, &event.event_type, event.offset);
                });
                self.save_offset(event.offset).await?;
                continue;
            };

            let decoded = match self
                .mapper
                .deserialize_current(&event.event_type, event.payload.clone())
            {
                Ok(decoded) => decoded,
                Err(error) => {
                    warn!(
                        event_type = %event.event_type,
                        offset = event.offset,
                        %error,
                        "failed to decode feed event; offset not advanced"
                    );
                    return Ok(false);
                }
            };

            let meta = event.meta();
            if let Err(error) = handler.handle(decoded, &meta).await {
                warn!(
                    event_type = %event.event_type,
                    offset = event.offset,
                    %error,
                    "event handler failed; offset not advanced"
                );
                self.reporters.each(|reporter| {
                    reporter.handler_failed(&self.name, &event.event_type, event.offset, &error);
                });
                return Ok(false);
            }

            self.reporters.each(|reporter| {
                reporter.event_handled(&self.name, &event.event_type, event.offset);
            });
            self.save_offset(event.offset).await?;
        }

        Ok(self.batch_size > 0 && page.page_end_offset < page.query_max_offset)
    }
}

impl<E: Event> EventSourceJob<E> {
    async fn fetch_page(&self, url: Url) -> Result<FeedPage, FeedError> {
        let response = self.client.get(url).send().await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "failed to read response body".to_string());
            return Err(FeedError::Status { status, body });
        }

        Ok(response.json().await?)
    }

    async fn save_offset(&self, offset: u64) -> Result<(), JobError> {
        self.offsets
            .save_offset(&self.name, offset)
            .await
            .map_err(JobError::new)?;
        self.reporters.each(|reporter| {
            reporter.offset_saved(&self.name, offset);
        });
        Ok(())
    }
}
