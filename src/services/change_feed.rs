use crate::domain::change::{ChangeEvent, FeedSpec};
use crate::error::Result;
use async_trait::async_trait;
use dashmap::DashMap;
use futures::{Stream, StreamExt};
use opentelemetry::{KeyValue, global, metrics::Counter};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};
use tokio::sync::{broadcast, mpsc};
use tokio::task::AbortHandle;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tracing::Instrument;
use uuid::Uuid;

#[derive(Clone, Debug)]
struct Metrics {
    delivered_total: Counter<u64>,
    lagged_total: Counter<u64>,
}

impl Metrics {
    fn new() -> Self {
        let meter = global::meter("rally-sync");
        Self {
            delivered_total: meter
                .u64_counter("feed_events_delivered_total")
                .with_description("Change events delivered to a subscriber")
                .build(),
            lagged_total: meter
                .u64_counter("feed_events_lagged_total")
                .with_description("Change events a slow subscriber missed")
                .build(),
        }
    }
}

/// Subscribe/publish access to committed row changes.
#[async_trait]
pub trait ChangeFeed: Send + Sync + std::fmt::Debug {
    /// Opens a subscription delivering every matching event, in commit order, until closed.
    async fn subscribe(&self, spec: FeedSpec) -> Result<Subscription>;

    /// Publishes a committed row change to every subscriber.
    async fn publish(&self, event: &ChangeEvent) -> Result<()>;

    /// Topics of the subscriptions that are currently open.
    fn active_topics(&self) -> Vec<String>;
}

/// Bookkeeping of open subscriptions, shared by a feed and its subscriptions.
#[derive(Clone, Debug, Default)]
pub struct SubscriptionRegistry {
    live: Arc<DashMap<Uuid, String>>,
}

impl SubscriptionRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, topic: &str) -> Uuid {
        let id = Uuid::new_v4();
        self.live.insert(id, topic.to_string());
        id
    }

    fn release(&self, id: Uuid) {
        self.live.remove(&id);
    }

    #[must_use]
    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = self.live.iter().map(|entry| entry.value().clone()).collect();
        topics.sort();
        topics
    }
}

#[derive(Debug)]
struct Registration {
    id: Uuid,
    topic: String,
    registry: SubscriptionRegistry,
    forwarder: AbortHandle,
    closed: AtomicBool,
}

impl Registration {
    fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.forwarder.abort();
            self.registry.release(self.id);
            tracing::debug!(topic = %self.topic, "Subscription closed");
        }
    }
}

/// Cloneable handle that can cancel a subscription from outside its consumer.
#[derive(Clone, Debug)]
pub struct SubscriptionHandle(Arc<Registration>);

impl SubscriptionHandle {
    pub fn close(&self) {
        self.0.close();
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.0.closed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.0.topic
    }
}

/// A live change-feed subscription. Closing is idempotent and happens on drop.
///
/// A subscriber that falls more than the feed's channel capacity behind skips
/// the oldest events it missed, logs a warning and keeps delivering. Skipped
/// rows are not repaired; a view only converges again when it is reopened.
#[derive(Debug)]
pub struct Subscription {
    rx: mpsc::Receiver<ChangeEvent>,
    registration: Arc<Registration>,
}

impl Subscription {
    /// Spawns a task that decodes items from `source`, keeps those matching
    /// `spec` and hands them to the returned subscription.
    pub fn forward<T, F>(
        spec: FeedSpec,
        source: broadcast::Receiver<T>,
        decode: F,
        registry: &SubscriptionRegistry,
        buffer: usize,
    ) -> Self
    where
        T: Clone + Send + 'static,
        F: Fn(T) -> Option<ChangeEvent> + Send + 'static,
    {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let id = registry.register(&spec.topic);
        let topic = spec.topic.clone();
        let metrics = Metrics::new();

        let task = tokio::spawn(
            async move {
                let mut stream = BroadcastStream::new(source);
                while let Some(item) = stream.next().await {
                    let event = match item {
                        Ok(item) => decode(item),
                        Err(BroadcastStreamRecvError::Lagged(missed)) => {
                            tracing::warn!(missed, "Change feed subscriber lagged");
                            metrics.lagged_total.add(missed, &[KeyValue::new("topic", spec.topic.clone())]);
                            continue;
                        }
                    };
                    let Some(event) = event else { continue };
                    if !spec.matches(&event) {
                        continue;
                    }
                    if tx.send(event).await.is_err() {
                        break;
                    }
                    metrics.delivered_total.add(1, &[]);
                }
                tracing::debug!("Change feed source closed");
            }
            .instrument(tracing::info_span!("feed_subscription", topic = %topic)),
        );

        let registration = Arc::new(Registration {
            id,
            topic,
            registry: registry.clone(),
            forwarder: task.abort_handle(),
            closed: AtomicBool::new(false),
        });
        Self { rx, registration }
    }

    #[must_use]
    pub fn topic(&self) -> &str {
        &self.registration.topic
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.registration.closed.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn handle(&self) -> SubscriptionHandle {
        SubscriptionHandle(Arc::clone(&self.registration))
    }

    /// Next matching event; `None` once closed or the feed disconnected.
    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        if !self.is_open() {
            self.rx.close();
        }
        self.rx.recv().await
    }

    /// Cancels delivery and releases the subscription. Safe to call repeatedly.
    pub fn close(&mut self) {
        self.registration.close();
        self.rx.close();
    }
}

impl Stream for Subscription {
    type Item = ChangeEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.registration.close();
    }
}

/// Teardown for a live view: its subscription plus the task applying its events.
#[derive(Clone, Debug)]
pub struct Teardown(Arc<TeardownInner>);

#[derive(Debug)]
struct TeardownInner {
    subscription: Option<SubscriptionHandle>,
    pump: Option<AbortHandle>,
    closed: AtomicBool,
}

impl Teardown {
    #[must_use]
    pub fn new(subscription: Option<SubscriptionHandle>, pump: Option<AbortHandle>) -> Self {
        Self(Arc::new(TeardownInner { subscription, pump, closed: AtomicBool::new(false) }))
    }

    /// Releases the subscription and stops the pump. Idempotent.
    pub fn close(&self) {
        if self.0.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(subscription) = &self.0.subscription {
            subscription.close();
        }
        if let Some(pump) = &self.0.pump {
            pump.abort();
        }
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        !self.0.closed.load(Ordering::SeqCst)
    }
}
