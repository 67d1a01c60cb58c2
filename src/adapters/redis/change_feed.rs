use crate::adapters::redis::{PubSubMessage, RedisClient};
use crate::domain::change::{ChangeEvent, FeedSpec};
use crate::error::Result;
use crate::services::change_feed::{ChangeFeed, Subscription, SubscriptionRegistry};
use async_trait::async_trait;
use std::sync::Arc;

const CHANNEL_PREFIX: &str = "rows:";
const CHANNEL_PATTERN: &str = "rows:*";

/// Row changes carried as JSON over Redis pub/sub, one channel per table.
#[derive(Debug)]
pub struct RedisChangeFeed {
    redis: Arc<RedisClient>,
    registry: SubscriptionRegistry,
    buffer: usize,
}

impl RedisChangeFeed {
    #[must_use]
    pub fn new(redis: Arc<RedisClient>, buffer: usize) -> Self {
        Self { redis, registry: SubscriptionRegistry::new(), buffer }
    }

    fn decode(message: PubSubMessage) -> Option<ChangeEvent> {
        if !message.channel.starts_with(CHANNEL_PREFIX) {
            return None;
        }
        match serde_json::from_slice(&message.payload) {
            Ok(event) => Some(event),
            Err(e) => {
                tracing::warn!(error = %e, channel = %message.channel, "Dropping undecodable change event");
                None
            }
        }
    }
}

#[async_trait]
impl ChangeFeed for RedisChangeFeed {
    #[tracing::instrument(skip(self, spec), fields(topic = %spec.topic))]
    async fn subscribe(&self, spec: FeedSpec) -> Result<Subscription> {
        let source = self.redis.psubscribe(CHANNEL_PATTERN).await;
        Ok(Subscription::forward(spec, source, Self::decode, &self.registry, self.buffer))
    }

    #[tracing::instrument(level = "debug", skip(self, event), fields(kind = ?event.kind, id = %event.row.id))]
    async fn publish(&self, event: &ChangeEvent) -> Result<()> {
        let payload = serde_json::to_vec(event)?;
        let channel = format!("{CHANNEL_PREFIX}{}", event.table.as_str());
        self.redis.publish(&channel, &payload).await?;
        Ok(())
    }

    fn active_topics(&self) -> Vec<String> {
        self.registry.topics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::message::{Message, MessageId};
    use crate::domain::user::UserId;
    use time::OffsetDateTime;

    fn event() -> ChangeEvent {
        ChangeEvent::inserted(Message {
            id: MessageId(9),
            sender_id: UserId(1),
            recipient_id: UserId(2),
            content: "hey".into(),
            inserted_at: OffsetDateTime::UNIX_EPOCH,
            is_read: false,
        })
    }

    #[test]
    fn test_decode_accepts_row_channels() {
        let payload = serde_json::to_vec(&event()).unwrap();
        let decoded = RedisChangeFeed::decode(PubSubMessage { channel: "rows:messages".into(), payload });
        assert_eq!(decoded, Some(event()));
    }

    #[test]
    fn test_decode_drops_garbage_and_foreign_channels() {
        let garbage = PubSubMessage { channel: "rows:messages".into(), payload: b"{".to_vec() };
        assert_eq!(RedisChangeFeed::decode(garbage), None);

        let payload = serde_json::to_vec(&event()).unwrap();
        assert_eq!(RedisChangeFeed::decode(PubSubMessage { channel: "user:1".into(), payload }), None);
    }
}
