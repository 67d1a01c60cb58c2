use crate::domain::change::{ChangeKind, FeedSpec, RowFilter, Table};
use crate::domain::summary::{FriendSummary, SummaryBook};
use crate::domain::user::UserId;
use crate::error::Result;
use crate::services::change_feed::{ChangeFeed, Subscription, Teardown};
use crate::services::store::MessageStore;
use opentelemetry::{KeyValue, global, metrics::Counter};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::Instrument;

#[derive(Clone, Debug)]
struct Metrics {
    events_total: Counter<u64>,
}

impl Metrics {
    fn new() -> Self {
        let meter = global::meter("rally-sync");
        Self {
            events_total: meter
                .u64_counter("friend_summary_events_total")
                .with_description("Change events folded into friend summaries, by kind")
                .build(),
        }
    }
}

/// Builds the per-friend "latest message / unread count" view behind the friend list.
#[derive(Clone, Debug)]
pub struct FriendSummaryAggregator {
    store: Arc<dyn MessageStore>,
    feed: Arc<dyn ChangeFeed>,
    metrics: Metrics,
}

impl FriendSummaryAggregator {
    #[must_use]
    pub fn new(store: Arc<dyn MessageStore>, feed: Arc<dyn ChangeFeed>) -> Self {
        Self { store, feed, metrics: Metrics::new() }
    }

    /// Loads summaries for `friends` of `user` and keeps them live.
    ///
    /// An empty friend list opens no subscription. A failed bulk read is logged
    /// and the view starts empty, to be filled by live events.
    ///
    /// # Errors
    /// Returns an error if the change feed subscription cannot be opened.
    #[tracing::instrument(err(level = "warn"), skip(self, friends), fields(user_id = %user, friends = friends.len()))]
    pub async fn start(&self, user: UserId, friends: &[UserId]) -> Result<FriendSummaries> {
        let friends: BTreeSet<UserId> = friends.iter().copied().filter(|f| *f != user).collect();
        let mut book = SummaryBook::new(user);

        if friends.is_empty() {
            let (_, rx) = watch::channel(book);
            return Ok(FriendSummaries { user, friends, book: rx, teardown: Teardown::new(None, None) });
        }

        let spec = FeedSpec::new(format!("friend-summaries-{user}"))
            .on(ChangeKind::Insert, Table::Messages, RowFilter::Involving { user, friends: friends.clone() })
            .on(ChangeKind::Update, Table::Messages, RowFilter::RecipientIs(user));
        let subscription = self.feed.subscribe(spec).await?;

        let ids: Vec<UserId> = friends.iter().copied().collect();
        match self.store.fetch_involving(user, &ids).await {
            Ok(newest_first) => book.load(newest_first),
            Err(e) => tracing::error!(error = %e, "Failed to load friend summaries"),
        }

        let (tx, rx) = watch::channel(book);
        let handle = subscription.handle();
        let pump = tokio::spawn(
            Self::pump(subscription, user, friends.clone(), tx, self.metrics.clone())
                .instrument(tracing::info_span!("friend_summary_pump", user_id = %user)),
        );

        Ok(FriendSummaries { user, friends, book: rx, teardown: Teardown::new(Some(handle), Some(pump.abort_handle())) })
    }

    async fn pump(
        mut subscription: Subscription,
        user: UserId,
        friends: BTreeSet<UserId>,
        book: watch::Sender<SummaryBook>,
        metrics: Metrics,
    ) {
        while let Some(event) = subscription.recv().await {
            if !friends.contains(&event.row.counterpart_of(user)) {
                continue;
            }
            let kind = match event.kind {
                ChangeKind::Insert => "insert",
                ChangeKind::Update => "update",
            };
            metrics.events_total.add(1, &[KeyValue::new("kind", kind)]);
            book.send_if_modified(|book| book.apply(&event).is_some());
        }
        tracing::debug!("Friend summary feed ended");
    }
}

/// Live friend summaries. Closing (explicitly or by drop) releases the subscription.
#[derive(Debug)]
pub struct FriendSummaries {
    user: UserId,
    friends: BTreeSet<UserId>,
    book: watch::Receiver<SummaryBook>,
    teardown: Teardown,
}

impl FriendSummaries {
    #[must_use]
    pub const fn user(&self) -> UserId {
        self.user
    }

    /// One entry per requested friend; friends without messages get an empty summary.
    #[must_use]
    pub fn summaries(&self) -> HashMap<UserId, FriendSummary> {
        let book = self.book.borrow();
        self.friends.iter().map(|f| (*f, book.get(*f).cloned().unwrap_or_default())).collect()
    }

    #[must_use]
    pub fn summary(&self, friend: UserId) -> FriendSummary {
        self.book.borrow().get(friend).cloned().unwrap_or_default()
    }

    #[must_use]
    pub fn total_unread(&self) -> u32 {
        self.book.borrow().total_unread()
    }

    #[must_use]
    pub fn updates(&self) -> watch::Receiver<SummaryBook> {
        self.book.clone()
    }

    #[must_use]
    pub fn teardown(&self) -> Teardown {
        self.teardown.clone()
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.teardown.is_open()
    }

    pub fn close(&self) {
        self.teardown.close();
    }
}

impl Drop for FriendSummaries {
    fn drop(&mut self) {
        self.teardown.close();
    }
}
