//! In-process tables and change feed.
//!
//! Rows live behind a mutex and every committed mutation is broadcast while the
//! lock is still held, so subscribers observe changes in commit order.

use crate::domain::change::{ChangeEvent, FeedSpec};
use crate::domain::friendship::{FriendshipEdge, FriendshipStatus};
use crate::domain::message::{ConversationKey, Message, MessageId, NewMessage};
use crate::domain::presence::PresenceRecord;
use crate::domain::user::{Account, AccountId, UserId};
use crate::error::{AppError, Result};
use crate::services::change_feed::{ChangeFeed, Subscription, SubscriptionRegistry};
use crate::services::store::{AccountStore, FriendshipStore, MessageStore, PresenceStore};
use async_trait::async_trait;
use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use time::OffsetDateTime;
use tokio::sync::broadcast;

#[derive(Debug)]
pub struct MemoryChangeFeed {
    tx: broadcast::Sender<ChangeEvent>,
    registry: SubscriptionRegistry,
    buffer: usize,
}

impl MemoryChangeFeed {
    #[must_use]
    pub fn new(channel_capacity: usize, buffer: usize) -> Self {
        let (tx, _rx) = broadcast::channel(channel_capacity.max(1));
        Self { tx, registry: SubscriptionRegistry::new(), buffer }
    }

    fn emit(&self, event: ChangeEvent) {
        // No receivers simply means nobody is subscribed yet.
        let _ = self.tx.send(event);
    }
}

impl Default for MemoryChangeFeed {
    fn default() -> Self {
        Self::new(1024, 256)
    }
}

#[async_trait]
impl ChangeFeed for MemoryChangeFeed {
    async fn subscribe(&self, spec: FeedSpec) -> Result<Subscription> {
        Ok(Subscription::forward(spec, self.tx.subscribe(), Some, &self.registry, self.buffer))
    }

    async fn publish(&self, event: &ChangeEvent) -> Result<()> {
        self.emit(event.clone());
        Ok(())
    }

    fn active_topics(&self) -> Vec<String> {
        self.registry.topics()
    }
}

#[derive(Debug, Default)]
struct Tables {
    messages: Vec<Message>,
    last_message_id: i64,
    last_inserted_at: Option<OffsetDateTime>,
    users: HashMap<UserId, Option<OffsetDateTime>>,
    friendships: Vec<FriendshipEdge>,
    accounts: HashMap<AccountId, Option<UserId>>,
    profiles: HashMap<AccountId, BTreeSet<UserId>>,
    calls: HashMap<&'static str, usize>,
}

impl Tables {
    fn count(&mut self, op: &'static str) {
        *self.calls.entry(op).or_default() += 1;
    }
}

/// All tables of the backend in one process, wired to a [`MemoryChangeFeed`].
#[derive(Debug)]
pub struct MemoryBackend {
    tables: Mutex<Tables>,
    feed: Arc<MemoryChangeFeed>,
    unavailable: AtomicBool,
}

impl MemoryBackend {
    #[must_use]
    pub fn new(feed: Arc<MemoryChangeFeed>) -> Self {
        Self { tables: Mutex::new(Tables::default()), feed, unavailable: AtomicBool::new(false) }
    }

    #[must_use]
    pub fn feed(&self) -> Arc<MemoryChangeFeed> {
        Arc::clone(&self.feed)
    }

    /// Makes every subsequent storage call fail until switched back.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub fn add_user(&self, user: UserId, last_active: Option<OffsetDateTime>) {
        self.lock().users.insert(user, last_active);
    }

    pub fn add_friendship(&self, requester: UserId, addressee: UserId, status: FriendshipStatus) {
        self.lock().friendships.push(FriendshipEdge { requester_id: requester, addressee_id: addressee, status });
    }

    pub fn add_account(&self, account: AccountId, profiles: &[UserId], last_active_user: Option<UserId>) {
        let mut tables = self.lock();
        tables.accounts.insert(account, last_active_user);
        tables.profiles.insert(account, profiles.iter().copied().collect());
        for profile in profiles {
            tables.users.entry(*profile).or_insert(None);
        }
    }

    #[must_use]
    pub fn messages(&self) -> Vec<Message> {
        self.lock().messages.clone()
    }

    #[must_use]
    pub fn last_active(&self, user: UserId) -> Option<OffsetDateTime> {
        self.lock().users.get(&user).copied().flatten()
    }

    #[must_use]
    pub fn account_row(&self, account: AccountId) -> Option<Option<UserId>> {
        self.lock().accounts.get(&account).copied()
    }

    /// How many times a storage operation has been invoked, failed calls included.
    #[must_use]
    pub fn calls(&self, op: &str) -> usize {
        self.lock().calls.get(op).copied().unwrap_or_default()
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn begin(&self, op: &'static str) -> Result<MutexGuard<'_, Tables>> {
        let mut tables = self.lock();
        tables.count(op);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::Unavailable(format!("{op} rejected: backend offline")));
        }
        Ok(tables)
    }

    fn mark_where<F>(&self, op: &'static str, predicate: F) -> Result<u64>
    where
        F: Fn(&Message) -> bool,
    {
        let mut tables = self.begin(op)?;
        let mut affected = 0;
        for message in tables.messages.iter_mut().filter(|m| !m.is_read && predicate(m)) {
            message.is_read = true;
            self.feed.emit(ChangeEvent::updated(message.clone()));
            affected += 1;
        }
        Ok(affected)
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new(Arc::new(MemoryChangeFeed::default()))
    }
}

#[async_trait]
impl MessageStore for MemoryBackend {
    async fn fetch_conversation(&self, key: ConversationKey) -> Result<Vec<Message>> {
        let tables = self.begin("fetch_conversation")?;
        let mut rows: Vec<Message> =
            tables.messages.iter().filter(|m| m.conversation() == key).cloned().collect();
        rows.sort_by_key(Message::order_key);
        Ok(rows)
    }

    async fn fetch_involving(&self, user: UserId, friends: &[UserId]) -> Result<Vec<Message>> {
        let tables = self.begin("fetch_involving")?;
        let mut rows: Vec<Message> = tables
            .messages
            .iter()
            .filter(|m| {
                (m.sender_id == user && friends.contains(&m.recipient_id))
                    || (m.recipient_id == user && friends.contains(&m.sender_id))
            })
            .cloned()
            .collect();
        rows.sort_by_key(|m| std::cmp::Reverse(m.order_key()));
        Ok(rows)
    }

    async fn insert_message(&self, message: NewMessage) -> Result<Message> {
        let mut tables = self.begin("insert_message")?;
        let now = OffsetDateTime::now_utc();
        let inserted_at = tables.last_inserted_at.map_or(now, |last| last.max(now));
        tables.last_inserted_at = Some(inserted_at);
        tables.last_message_id += 1;

        let row = Message {
            id: MessageId(tables.last_message_id),
            sender_id: message.sender_id,
            recipient_id: message.recipient_id,
            content: message.content,
            inserted_at,
            is_read: false,
        };
        tables.messages.push(row.clone());
        self.feed.emit(ChangeEvent::inserted(row.clone()));
        Ok(row)
    }

    async fn mark_conversation_read(&self, sender: UserId, recipient: UserId) -> Result<u64> {
        self.mark_where("mark_conversation_read", |m| m.sender_id == sender && m.recipient_id == recipient)
    }

    async fn mark_read(&self, id: MessageId) -> Result<u64> {
        self.mark_where("mark_read", |m| m.id == id)
    }
}

#[async_trait]
impl PresenceStore for MemoryBackend {
    async fn touch(&self, user: UserId, at: OffsetDateTime) -> Result<()> {
        let mut tables = self.begin("touch")?;
        if let Some(last_active) = tables.users.get_mut(&user) {
            *last_active = Some(last_active.map_or(at, |prev| prev.max(at)));
        }
        Ok(())
    }

    async fn fetch_last_active(&self, users: &[UserId]) -> Result<Vec<PresenceRecord>> {
        let tables = self.begin("fetch_last_active")?;
        Ok(users
            .iter()
            .filter_map(|id| tables.users.get(id).map(|last_active| PresenceRecord { user_id: *id, last_active: *last_active }))
            .collect())
    }
}

#[async_trait]
impl FriendshipStore for MemoryBackend {
    async fn accepted_edges(&self, user: UserId) -> Result<Vec<FriendshipEdge>> {
        let tables = self.begin("accepted_edges")?;
        Ok(tables
            .friendships
            .iter()
            .filter(|e| e.status == FriendshipStatus::Accepted && (e.requester_id == user || e.addressee_id == user))
            .copied()
            .collect())
    }
}

#[async_trait]
impl AccountStore for MemoryBackend {
    async fn account(&self, id: AccountId) -> Result<Account> {
        let tables = self.begin("account")?;
        let last_active_user_id = *tables.accounts.get(&id).ok_or(AppError::NotFound)?;
        Ok(Account { id, last_active_user_id })
    }

    async fn first_user(&self, id: AccountId) -> Result<Option<UserId>> {
        let tables = self.begin("first_user")?;
        Ok(tables.profiles.get(&id).and_then(|profiles| profiles.iter().next().copied()))
    }

    async fn set_last_active_user(&self, id: AccountId, user: UserId) -> Result<()> {
        let mut tables = self.begin("set_last_active_user")?;
        let slot = tables.accounts.get_mut(&id).ok_or(AppError::NotFound)?;
        *slot = Some(user);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::change::{ChangeKind, RowFilter, Table};

    #[tokio::test]
    async fn test_insert_assigns_increasing_ids_and_publishes() {
        let backend = MemoryBackend::default();
        let mut sub = backend
            .feed()
            .subscribe(FeedSpec::new("all").on(ChangeKind::Insert, Table::Messages, RowFilter::Any))
            .await
            .unwrap();

        let a = backend.insert_message(NewMessage::compose(UserId(1), UserId(2), "a").unwrap()).await.unwrap();
        let b = backend.insert_message(NewMessage::compose(UserId(2), UserId(1), "b").unwrap()).await.unwrap();
        assert!(a.id < b.id);
        assert!(a.inserted_at <= b.inserted_at);

        assert_eq!(sub.recv().await.unwrap().row, a);
        assert_eq!(sub.recv().await.unwrap().row, b);
    }

    #[tokio::test]
    async fn test_mark_conversation_read_only_touches_unread_inbound() {
        let backend = MemoryBackend::default();
        for text in ["x", "y"] {
            backend.insert_message(NewMessage::compose(UserId(2), UserId(1), text).unwrap()).await.unwrap();
        }
        backend.insert_message(NewMessage::compose(UserId(1), UserId(2), "z").unwrap()).await.unwrap();

        assert_eq!(backend.mark_conversation_read(UserId(2), UserId(1)).await.unwrap(), 2);
        assert_eq!(backend.mark_conversation_read(UserId(2), UserId(1)).await.unwrap(), 0);
        let unread: Vec<_> = backend.messages().into_iter().filter(|m| !m.is_read).collect();
        assert_eq!(unread.len(), 1);
        assert_eq!(unread[0].sender_id, UserId(1));
    }

    #[tokio::test]
    async fn test_touch_never_moves_last_active_backwards() {
        let backend = MemoryBackend::default();
        backend.add_user(UserId(1), None);
        let now = OffsetDateTime::now_utc();

        backend.touch(UserId(1), now).await.unwrap();
        backend.touch(UserId(1), now - time::Duration::minutes(3)).await.unwrap();
        assert_eq!(backend.last_active(UserId(1)), Some(now));

        let later = now + time::Duration::seconds(60);
        backend.touch(UserId(1), later).await.unwrap();
        assert_eq!(backend.last_active(UserId(1)), Some(later));
    }

    #[tokio::test]
    async fn test_unavailable_backend_fails_and_counts_calls() {
        let backend = MemoryBackend::default();
        backend.set_unavailable(true);
        assert!(backend.touch(UserId(1), OffsetDateTime::now_utc()).await.is_err());
        assert_eq!(backend.calls("touch"), 1);
    }

    #[tokio::test]
    async fn test_lagged_subscriber_skips_oldest_and_keeps_delivering() {
        let feed = MemoryChangeFeed::new(2, 8);
        let mut sub = feed
            .subscribe(FeedSpec::new("all").on(ChangeKind::Insert, Table::Messages, RowFilter::Any))
            .await
            .unwrap();
        for id in 1..=5 {
            let row = Message {
                id: MessageId(id),
                sender_id: UserId(2),
                recipient_id: UserId(1),
                content: format!("m{id}"),
                inserted_at: OffsetDateTime::UNIX_EPOCH,
                is_read: false,
            };
            feed.publish(&ChangeEvent::inserted(row)).await.unwrap();
        }

        assert_eq!(sub.recv().await.unwrap().row.id, MessageId(4));
        assert_eq!(sub.recv().await.unwrap().row.id, MessageId(5));
        assert!(sub.is_open());
    }

    #[tokio::test]
    async fn test_subscription_close_releases_topic() {
        let feed = MemoryChangeFeed::default();
        let mut sub = feed.subscribe(FeedSpec::new("chat-1-2")).await.unwrap();
        assert_eq!(feed.active_topics(), vec!["chat-1-2".to_string()]);
        sub.close();
        sub.close();
        assert!(feed.active_topics().is_empty());
        assert!(sub.recv().await.is_none());
    }
}
