use crate::domain::friendship::FriendshipEdge;
use crate::domain::message::{ConversationKey, Message, MessageId, NewMessage};
use crate::domain::presence::PresenceRecord;
use crate::domain::user::{Account, AccountId, UserId};
use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use time::OffsetDateTime;

/// Rows of the `messages` table.
///
/// Every committed insert or update is also published on the change feed.
#[async_trait]
pub trait MessageStore: Send + Sync + std::fmt::Debug {
    /// All messages between the two members, oldest first.
    async fn fetch_conversation(&self, key: ConversationKey) -> Result<Vec<Message>>;

    /// Messages between `user` and any of `friends`, newest first.
    async fn fetch_involving(&self, user: UserId, friends: &[UserId]) -> Result<Vec<Message>>;

    /// Inserts a message and returns the committed row.
    async fn insert_message(&self, message: NewMessage) -> Result<Message>;

    /// Marks every unread message from `sender` to `recipient` as read.
    async fn mark_conversation_read(&self, sender: UserId, recipient: UserId) -> Result<u64>;

    /// Marks a single message as read.
    async fn mark_read(&self, id: MessageId) -> Result<u64>;
}

/// The `last_active` column of `users`.
#[async_trait]
pub trait PresenceStore: Send + Sync + std::fmt::Debug {
    /// Stamps `at` unless the stored value is already later.
    async fn touch(&self, user: UserId, at: OffsetDateTime) -> Result<()>;

    /// Presence of exactly the requested users that exist.
    async fn fetch_last_active(&self, users: &[UserId]) -> Result<Vec<PresenceRecord>>;
}

/// Rows of `friendships`.
#[async_trait]
pub trait FriendshipStore: Send + Sync + std::fmt::Debug {
    /// Accepted edges where `user` is requester or addressee.
    async fn accepted_edges(&self, user: UserId) -> Result<Vec<FriendshipEdge>>;
}

/// Rows of `accounts`, and the profiles an account owns.
#[async_trait]
pub trait AccountStore: Send + Sync + std::fmt::Debug {
    async fn account(&self, id: AccountId) -> Result<Account>;

    /// The account's profile with the lowest id.
    async fn first_user(&self, id: AccountId) -> Result<Option<UserId>>;

    async fn set_last_active_user(&self, id: AccountId, user: UserId) -> Result<()>;
}

/// The storage collaborators a session is wired with.
#[derive(Clone, Debug)]
pub struct Stores {
    pub messages: Arc<dyn MessageStore>,
    pub presence: Arc<dyn PresenceStore>,
    pub friendships: Arc<dyn FriendshipStore>,
    pub accounts: Arc<dyn AccountStore>,
}

impl Stores {
    /// Uses one backend for every table.
    pub fn from_backend<B>(backend: &Arc<B>) -> Self
    where
        B: MessageStore + PresenceStore + FriendshipStore + AccountStore + 'static,
    {
        Self {
            messages: Arc::clone(backend) as Arc<dyn MessageStore>,
            presence: Arc::clone(backend) as Arc<dyn PresenceStore>,
            friendships: Arc::clone(backend) as Arc<dyn FriendshipStore>,
            accounts: Arc::clone(backend) as Arc<dyn AccountStore>,
        }
    }
}
