use crate::config::PubSubConfig;
use backon::{ExponentialBuilder, Retryable};
use dashmap::DashMap;
use futures::StreamExt;
use redis::AsyncCommands;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, watch};
use tracing::Instrument;

pub mod change_feed;

pub use change_feed::RedisChangeFeed;

#[derive(Debug, Clone)]
pub struct PubSubMessage {
    pub channel: String,
    pub payload: Vec<u8>,
}

/// Redis publisher plus one shared listener per subscribed pattern.
#[derive(Debug)]
pub struct RedisClient {
    publisher: redis::aio::ConnectionManager,
    // Pattern (e.g. "rows:*") -> fan-out of everything the listener receives
    patterns: Arc<DashMap<String, broadcast::Sender<PubSubMessage>>>,
    client: redis::Client,
    shutdown: watch::Receiver<bool>,
    config: PubSubConfig,
}

impl RedisClient {
    /// Connects the publisher side.
    ///
    /// # Errors
    /// Returns an error if the URL is invalid or the connection fails.
    pub async fn new(config: &PubSubConfig, shutdown: watch::Receiver<bool>) -> anyhow::Result<Arc<Self>> {
        let client = redis::Client::open(config.url.as_str())?;
        let publisher = client.get_connection_manager().await?;

        Ok(Arc::new(Self { publisher, patterns: Arc::new(DashMap::new()), client, shutdown, config: config.clone() }))
    }

    /// Receiver for every message on channels matching `pattern`.
    ///
    /// The first caller for a pattern starts its listener and waits until the
    /// pattern is subscribed; later callers share it.
    pub async fn psubscribe(&self, pattern: &str) -> broadcast::Receiver<PubSubMessage> {
        if let Some(tx) = self.patterns.get(pattern) {
            return tx.subscribe();
        }

        let (tx, rx) = broadcast::channel(self.config.channel_capacity.max(1));
        self.patterns.insert(pattern.to_string(), tx.clone());

        let (ready_tx, ready_rx) = oneshot::channel();
        let listener = PatternListener {
            client: self.client.clone(),
            pattern: pattern.to_string(),
            tx,
            shutdown: self.shutdown.clone(),
            patterns: Arc::clone(&self.patterns),
            config: self.config.clone(),
        };
        tokio::spawn(listener.run(ready_tx).instrument(tracing::info_span!("pubsub_listener", pattern = %pattern)));

        // Resolves on first subscribe, or with an error once the listener gave up.
        let _ = ready_rx.await;

        rx
    }

    /// Publishes `payload` on `channel`.
    ///
    /// # Errors
    /// Returns an error if the publish fails.
    pub async fn publish(&self, channel: &str, payload: &[u8]) -> Result<(), redis::RedisError> {
        let mut conn = self.publisher.clone();
        conn.publish::<_, _, i64>(channel, payload).await?;
        Ok(())
    }

    /// Pings the Redis server to check connectivity.
    ///
    /// # Errors
    /// Returns an error if the ping fails.
    pub async fn ping(&self) -> Result<(), redis::RedisError> {
        let mut conn = self.publisher.clone();
        redis::cmd("PING").query_async::<String>(&mut conn).await?;
        Ok(())
    }
}

struct PatternListener {
    client: redis::Client,
    pattern: String,
    tx: broadcast::Sender<PubSubMessage>,
    shutdown: watch::Receiver<bool>,
    patterns: Arc<DashMap<String, broadcast::Sender<PubSubMessage>>>,
    config: PubSubConfig,
}

impl PatternListener {
    async fn run(mut self, ready_tx: oneshot::Sender<()>) {
        let retry_strategy = ExponentialBuilder::default()
            .with_min_delay(Duration::from_secs(self.config.min_backoff_secs))
            .with_max_delay(Duration::from_secs(self.config.max_backoff_secs));

        let mut ready_tx = Some(ready_tx);

        loop {
            let connected = (|| async {
                let mut pubsub = self.client.get_async_pubsub().await?;
                pubsub.psubscribe(&self.pattern).await?;
                Ok::<redis::aio::PubSub, redis::RedisError>(pubsub)
            })
            .retry(&retry_strategy)
            .when(|e| {
                tracing::warn!(error = %e, "Failed to subscribe to change feed, retrying...");
                true
            })
            .notify(|e, duration| {
                tracing::debug!(?duration, error = ?e, "Change feed subscription retry scheduled");
            })
            .await;

            let pubsub = match connected {
                Ok(pubsub) => pubsub,
                Err(e) => {
                    tracing::error!(error = %e, "Change feed subscription failed after retries");
                    break;
                }
            };

            tracing::info!(pattern = %self.pattern, "Subscribed to change feed");
            if let Some(ready) = ready_tx.take() {
                let _ = ready.send(());
            }

            let mut messages = pubsub.into_on_message();
            loop {
                tokio::select! {
                    _ = self.shutdown.changed() => {
                        self.patterns.remove(&self.pattern);
                        return;
                    }
                    msg = messages.next() => {
                        let Some(msg) = msg else {
                            tracing::warn!(pattern = %self.pattern, "Change feed connection lost, reconnecting...");
                            break;
                        };
                        let message = PubSubMessage {
                            channel: msg.get_channel_name().to_string(),
                            payload: msg.get_payload().unwrap_or_default(),
                        };
                        // Err only means no local subscriber right now.
                        let _ = self.tx.send(message);
                    }
                }
            }

            if *self.shutdown.borrow() {
                break;
            }
        }

        self.patterns.remove(&self.pattern);
    }
}
