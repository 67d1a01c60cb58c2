pub mod friendship_repo;
pub mod message_repo;
pub mod records;
pub mod user_repo;

use crate::config::DatabaseConfig;
use crate::domain::change::ChangeEvent;
use crate::domain::friendship::FriendshipEdge;
use crate::domain::message::{ConversationKey, Message, MessageId, NewMessage};
use crate::domain::presence::PresenceRecord;
use crate::domain::user::{Account, AccountId, UserId};
use crate::error::Result;
use crate::services::change_feed::ChangeFeed;
use crate::services::store::{AccountStore, FriendshipStore, MessageStore, PresenceStore};
use async_trait::async_trait;
use friendship_repo::FriendshipRepository;
use message_repo::MessageRepository;
use sqlx::postgres::PgPoolOptions;
use sqlx::{Pool, Postgres};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use user_repo::UserRepository;

pub type DbPool = Pool<Postgres>;

/// Initializes the database connection pool.
///
/// # Errors
/// Returns `sqlx::Error` if the connection fails.
pub async fn init_pool(config: &DatabaseConfig) -> std::result::Result<DbPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections)
        .acquire_timeout(Duration::from_secs(config.acquire_timeout_secs))
        .connect(&config.url)
        .await
}

/// Applies the bundled schema migrations.
///
/// # Errors
/// Returns an error if a migration fails.
pub async fn run_migrations(pool: &DbPool) -> std::result::Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!().run(pool).await
}

/// Postgres tables, publishing every committed message change on the feed.
#[derive(Clone, Debug)]
pub struct PgBackend {
    pool: DbPool,
    feed: Arc<dyn ChangeFeed>,
    messages: MessageRepository,
    users: UserRepository,
    friendships: FriendshipRepository,
}

impl PgBackend {
    #[must_use]
    pub fn new(pool: DbPool, feed: Arc<dyn ChangeFeed>) -> Self {
        Self {
            pool,
            feed,
            messages: MessageRepository::new(),
            users: UserRepository::new(),
            friendships: FriendshipRepository::new(),
        }
    }

    // The row is already committed; a lost event only delays subscribers until
    // their next reload.
    async fn emit(&self, event: ChangeEvent) {
        if let Err(e) = self.feed.publish(&event).await {
            tracing::error!(error = %e, id = %event.row.id, kind = ?event.kind, "Failed to publish row change");
        }
    }
}

#[async_trait]
impl MessageStore for PgBackend {
    async fn fetch_conversation(&self, key: ConversationKey) -> Result<Vec<Message>> {
        let mut conn = self.pool.acquire().await?;
        self.messages.fetch_conversation(&mut conn, key).await
    }

    async fn fetch_involving(&self, user: UserId, friends: &[UserId]) -> Result<Vec<Message>> {
        let mut conn = self.pool.acquire().await?;
        self.messages.fetch_involving(&mut conn, user, friends).await
    }

    async fn insert_message(&self, message: NewMessage) -> Result<Message> {
        let mut conn = self.pool.acquire().await?;
        let row = self.messages.create(&mut conn, message).await?;
        self.emit(ChangeEvent::inserted(row.clone())).await;
        Ok(row)
    }

    async fn mark_conversation_read(&self, sender: UserId, recipient: UserId) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        let rows = self.messages.mark_conversation_read(&mut conn, sender, recipient).await?;
        let affected = rows.len() as u64;
        for row in rows {
            self.emit(ChangeEvent::updated(row)).await;
        }
        Ok(affected)
    }

    async fn mark_read(&self, id: MessageId) -> Result<u64> {
        let mut conn = self.pool.acquire().await?;
        match self.messages.mark_read(&mut conn, id).await? {
            Some(row) => {
                self.emit(ChangeEvent::updated(row)).await;
                Ok(1)
            }
            None => Ok(0),
        }
    }
}

#[async_trait]
impl PresenceStore for PgBackend {
    async fn touch(&self, user: UserId, at: OffsetDateTime) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        if self.users.touch(&mut conn, user, at).await? == 0 {
            tracing::debug!(user_id = %user, "Heartbeat for unknown user");
        }
        Ok(())
    }

    async fn fetch_last_active(&self, users: &[UserId]) -> Result<Vec<PresenceRecord>> {
        let mut conn = self.pool.acquire().await?;
        self.users.fetch_last_active(&mut conn, users).await
    }
}

#[async_trait]
impl FriendshipStore for PgBackend {
    async fn accepted_edges(&self, user: UserId) -> Result<Vec<FriendshipEdge>> {
        let mut conn = self.pool.acquire().await?;
        self.friendships.accepted_for(&mut conn, user).await
    }
}

#[async_trait]
impl AccountStore for PgBackend {
    async fn account(&self, id: AccountId) -> Result<Account> {
        let mut conn = self.pool.acquire().await?;
        self.users.find_account(&mut conn, id).await
    }

    async fn first_user(&self, id: AccountId) -> Result<Option<UserId>> {
        let mut conn = self.pool.acquire().await?;
        self.users.first_profile(&mut conn, id).await
    }

    async fn set_last_active_user(&self, id: AccountId, user: UserId) -> Result<()> {
        let mut conn = self.pool.acquire().await?;
        self.users.set_last_active_user(&mut conn, id, user).await
    }
}
