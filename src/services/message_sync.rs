use crate::domain::change::{ChangeKind, FeedSpec, RowFilter, Table};
use crate::domain::message::{ConversationKey, Message, MessageLog, NewMessage};
use crate::domain::user::UserId;
use crate::error::Result;
use crate::services::change_feed::{ChangeFeed, Subscription, Teardown};
use crate::services::read_receipts::ReadReceiptTracker;
use crate::services::store::MessageStore;
use opentelemetry::{KeyValue, global, metrics::Counter};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::Instrument;

#[derive(Clone, Debug)]
struct Metrics {
    sent_total: Counter<u64>,
    live_events_total: Counter<u64>,
}

impl Metrics {
    fn new() -> Self {
        let meter = global::meter("rally-sync");
        Self {
            sent_total: meter
                .u64_counter("messages_sent_total")
                .with_description("Outbound message submissions by outcome")
                .build(),
            live_events_total: meter
                .u64_counter("conversation_live_events_total")
                .with_description("Live message events by merge outcome")
                .build(),
        }
    }
}

/// Opens two-party conversations: bulk history plus a live, deduplicated tail.
#[derive(Clone, Debug)]
pub struct MessageSyncEngine {
    store: Arc<dyn MessageStore>,
    feed: Arc<dyn ChangeFeed>,
    metrics: Metrics,
}

impl MessageSyncEngine {
    #[must_use]
    pub fn new(store: Arc<dyn MessageStore>, feed: Arc<dyn ChangeFeed>) -> Self {
        Self { store, feed, metrics: Metrics::new() }
    }

    /// Opens the conversation between `user` and `friend`.
    ///
    /// The feed subscription is opened before the history is read so nothing
    /// committed in between is lost; duplicates are merged away by id. A
    /// failed history read is logged and the conversation starts empty.
    ///
    /// # Errors
    /// Returns an error if the change feed subscription cannot be opened.
    #[tracing::instrument(err(level = "warn"), skip(self), fields(user_id = %user, friend_id = %friend))]
    pub async fn open(&self, user: UserId, friend: UserId, focused: bool) -> Result<Conversation> {
        let key = ConversationKey::new(user, friend);
        let spec = FeedSpec::new(key.topic())
            .on(ChangeKind::Insert, Table::Messages, RowFilter::Conversation(key))
            .on(ChangeKind::Update, Table::Messages, RowFilter::Conversation(key));
        let subscription = self.feed.subscribe(spec).await?;

        let mut log = MessageLog::new();
        match self.store.fetch_conversation(key).await {
            Ok(initial) => {
                log.load(initial);
            }
            Err(e) => tracing::error!(error = %e, "Failed to load conversation history"),
        }
        tracing::debug!(count = log.len(), "Conversation history loaded");

        let receipts = Arc::new(ReadReceiptTracker::new(Arc::clone(&self.store), user, friend, focused));
        receipts.on_open().await;

        let (log_tx, log_rx) = watch::channel(log);
        let handle = subscription.handle();
        let pump = tokio::spawn(
            Self::pump(subscription, log_tx, Arc::clone(&receipts), self.metrics.clone())
                .instrument(tracing::info_span!("conversation_pump", conversation = %key)),
        );

        Ok(Conversation {
            key,
            user,
            friend,
            log: log_rx,
            receipts,
            store: Arc::clone(&self.store),
            teardown: Teardown::new(Some(handle), Some(pump.abort_handle())),
            metrics: self.metrics.clone(),
        })
    }

    async fn pump(
        mut subscription: Subscription,
        log: watch::Sender<MessageLog>,
        receipts: Arc<ReadReceiptTracker>,
        metrics: Metrics,
    ) {
        while let Some(event) = subscription.recv().await {
            match event.kind {
                ChangeKind::Insert => {
                    let row = event.row;
                    let merged = log.send_if_modified(|log| log.insert(row.clone()));
                    let outcome = if merged { "merged" } else { "duplicate" };
                    metrics.live_events_total.add(1, &[KeyValue::new("outcome", outcome)]);
                    if merged {
                        receipts.on_live_insert(&row).await;
                    }
                }
                ChangeKind::Update => {
                    log.send_if_modified(|log| log.refresh(&event.row));
                }
            }
        }
        tracing::debug!("Conversation feed ended");
    }
}

/// An open conversation. Closing (explicitly or by drop) releases its feed subscription.
#[derive(Debug)]
pub struct Conversation {
    key: ConversationKey,
    user: UserId,
    friend: UserId,
    log: watch::Receiver<MessageLog>,
    receipts: Arc<ReadReceiptTracker>,
    store: Arc<dyn MessageStore>,
    teardown: Teardown,
    metrics: Metrics,
}

impl Conversation {
    #[must_use]
    pub const fn key(&self) -> ConversationKey {
        self.key
    }

    #[must_use]
    pub const fn friend(&self) -> UserId {
        self.friend
    }

    /// Snapshot of the displayed messages, oldest first.
    #[must_use]
    pub fn messages(&self) -> Vec<Message> {
        self.log.borrow().as_slice().to_vec()
    }

    /// Receiver notified whenever the displayed sequence changes.
    #[must_use]
    pub fn updates(&self) -> watch::Receiver<MessageLog> {
        self.log.clone()
    }

    /// Submits `text` to the friend.
    ///
    /// Blank text, or a closed conversation, is a silent no-op returning `None`.
    /// The message is not appended locally; it arrives through the live feed.
    ///
    /// # Errors
    /// Returns the storage error after logging it. Nothing is retried.
    #[tracing::instrument(err(level = "warn"), skip(self, text), fields(conversation = %self.key))]
    pub async fn send(&self, text: &str) -> Result<Option<Message>> {
        if !self.is_open() {
            tracing::debug!("Send on closed conversation ignored");
            return Ok(None);
        }
        let Some(message) = NewMessage::compose(self.user, self.friend, text) else {
            return Ok(None);
        };

        match self.store.insert_message(message).await {
            Ok(row) => {
                self.metrics.sent_total.add(1, &[KeyValue::new("status", "success")]);
                Ok(Some(row))
            }
            Err(e) => {
                self.metrics.sent_total.add(1, &[KeyValue::new("status", "failure")]);
                Err(e)
            }
        }
    }

    #[must_use]
    pub fn is_focused(&self) -> bool {
        self.receipts.is_focused()
    }

    /// Reports a focus transition of the conversation view.
    pub async fn set_focused(&self, focused: bool) {
        if self.is_open() {
            self.receipts.set_focused(focused).await;
        }
    }

    #[must_use]
    pub fn teardown(&self) -> Teardown {
        self.teardown.clone()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.teardown.is_open()
    }

    /// Releases the subscription. Idempotent.
    pub fn close(&self) {
        self.teardown.close();
    }
}

impl Drop for Conversation {
    fn drop(&mut self) {
        self.teardown.close();
    }
}
