#![allow(dead_code)]

use rally_sync::adapters::memory::MemoryBackend;
use rally_sync::config::SyncConfig;
use rally_sync::domain::friendship::FriendshipStatus;
use rally_sync::domain::message::{Message, NewMessage};
use rally_sync::domain::user::UserId;
use rally_sync::services::change_feed::ChangeFeed;
use rally_sync::services::session::Session;
use rally_sync::services::store::{MessageStore, Stores};
use std::sync::{Arc, Once};
use std::time::Duration;

static INIT: Once = Once::new();

pub const ME: UserId = UserId(1);
pub const FRIEND: UserId = UserId(2);
pub const OTHER: UserId = UserId(3);

pub fn setup_tracing() {
    INIT.call_once(|| {
        let filter = tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| "warn".into())
            .add_directive("rally_sync=debug".parse().unwrap())
            .add_directive("sqlx=warn".parse().unwrap());

        tracing_subscriber::fmt().with_env_filter(filter).with_test_writer().init();
    });
}

/// An in-memory backend with a few helpers for arranging rows.
pub struct TestBackend {
    pub backend: Arc<MemoryBackend>,
}

impl TestBackend {
    pub fn new() -> Self {
        setup_tracing();
        Self { backend: Arc::new(MemoryBackend::default()) }
    }

    pub fn stores(&self) -> Stores {
        Stores::from_backend(&self.backend)
    }

    pub fn feed(&self) -> Arc<dyn ChangeFeed> {
        self.backend.feed()
    }

    pub fn message_store(&self) -> Arc<dyn MessageStore> {
        Arc::clone(&self.backend) as Arc<dyn MessageStore>
    }

    pub fn befriend(&self, a: UserId, b: UserId) {
        self.backend.add_user(a, None);
        self.backend.add_user(b, None);
        self.backend.add_friendship(a, b, FriendshipStatus::Accepted);
    }

    /// Inserts a message as if `from`'s own client had sent it.
    pub async fn send(&self, from: UserId, to: UserId, text: &str) -> Message {
        self.backend
            .insert_message(NewMessage::compose(from, to, text).expect("non-blank text"))
            .await
            .expect("insert should succeed")
    }

    pub fn session(&self) -> Session {
        Session::new(fast_sync_config(), self.stores(), self.feed())
    }

    pub fn unread_from(&self, sender: UserId, recipient: UserId) -> usize {
        self.backend
            .messages()
            .iter()
            .filter(|m| m.sender_id == sender && m.recipient_id == recipient && !m.is_read)
            .count()
    }
}

pub fn fast_sync_config() -> SyncConfig {
    SyncConfig { subscription_buffer: 64, ..SyncConfig::default() }
}

/// Polls `check` until it holds, failing the test after a few seconds.
pub async fn eventually<F>(what: &str, mut check: F)
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(tokio::time::Instant::now() < deadline, "timed out waiting for {what}");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
