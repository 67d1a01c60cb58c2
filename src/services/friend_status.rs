use crate::domain::friendship::friend_set;
use crate::domain::presence::Status;
use crate::domain::user::UserId;
use crate::error::Result;
use crate::services::store::{FriendshipStore, PresenceStore};
use crate::workers::{StatusPollWorker, WorkerHandle};
use opentelemetry::{
    KeyValue, global,
    metrics::{Counter, Gauge},
};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use time::OffsetDateTime;
use tokio::sync::watch;

#[derive(Clone, Debug)]
struct Metrics {
    recomputations_total: Counter<u64>,
    friends_online: Gauge<u64>,
}

impl Metrics {
    fn new() -> Self {
        let meter = global::meter("rally-sync");
        Self {
            recomputations_total: meter
                .u64_counter("friend_status_recomputations_total")
                .with_description("Friend status recomputations by outcome")
                .build(),
            friends_online: meter
                .u64_gauge("friends_online")
                .with_description("Friends classified online by the last committed recomputation")
                .build(),
        }
    }
}

/// Result of the most recently committed status computation.
#[derive(Debug, Clone, Default)]
pub struct StatusSnapshot {
    user: Option<UserId>,
    friends: BTreeSet<UserId>,
    statuses: HashMap<UserId, Status>,
    online_count: usize,
    computed_at: Option<OffsetDateTime>,
    epoch: u64,
    seq: u64,
}

impl StatusSnapshot {
    #[must_use]
    pub const fn user(&self) -> Option<UserId> {
        self.user
    }

    /// Status of `friend`; anything not in the last computation is offline.
    #[must_use]
    pub fn status(&self, friend: UserId) -> Status {
        self.statuses.get(&friend).copied().unwrap_or_default()
    }

    #[must_use]
    pub const fn online_count(&self) -> usize {
        self.online_count
    }

    #[must_use]
    pub const fn friends(&self) -> &BTreeSet<UserId> {
        &self.friends
    }

    #[must_use]
    pub const fn computed_at(&self) -> Option<OffsetDateTime> {
        self.computed_at
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recompute {
    /// The result replaced the published snapshot.
    Committed,
    /// The active user changed, or a newer computation already committed.
    Discarded,
    /// A storage call failed; the previous snapshot stays.
    Failed,
    /// No active user.
    Idle,
}

#[derive(Debug)]
struct Inner {
    friendships: Arc<dyn FriendshipStore>,
    presence: Arc<dyn PresenceStore>,
    state: watch::Sender<StatusSnapshot>,
    seq: AtomicU64,
    metrics: Metrics,
}

/// Liveness classification for every accepted friend of the active user.
///
/// Computations may overlap. Each one is stamped with the active-user epoch
/// and a sequence number when it starts, and only commits if the epoch is
/// unchanged and nothing newer has committed since.
#[derive(Clone, Debug)]
pub struct FriendStatusEngine {
    inner: Arc<Inner>,
}

impl FriendStatusEngine {
    #[must_use]
    pub fn new(friendships: Arc<dyn FriendshipStore>, presence: Arc<dyn PresenceStore>) -> Self {
        let (state, _) = watch::channel(StatusSnapshot::default());
        Self {
            inner: Arc::new(Inner { friendships, presence, state, seq: AtomicU64::new(0), metrics: Metrics::new() }),
        }
    }

    #[must_use]
    pub fn active_user(&self) -> Option<UserId> {
        self.inner.state.borrow().user
    }

    #[must_use]
    pub fn status(&self, friend: UserId) -> Status {
        self.inner.state.borrow().status(friend)
    }

    #[must_use]
    pub fn online_count(&self) -> usize {
        self.inner.state.borrow().online_count
    }

    /// Friend ids of the last committed computation, ascending.
    #[must_use]
    pub fn friends(&self) -> Vec<UserId> {
        self.inner.state.borrow().friends.iter().copied().collect()
    }

    #[must_use]
    pub fn friends_with_status(&self, status: Status) -> Vec<UserId> {
        let state = self.inner.state.borrow();
        state.friends.iter().copied().filter(|f| state.status(*f) == status).collect()
    }

    #[must_use]
    pub fn snapshot(&self) -> StatusSnapshot {
        self.inner.state.borrow().clone()
    }

    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<StatusSnapshot> {
        self.inner.state.subscribe()
    }

    /// Rebinds the engine. The published map is cleared immediately and any
    /// computation still running for the previous user is discarded on completion.
    pub fn set_active_user(&self, user: Option<UserId>) {
        self.inner.state.send_modify(|state| {
            *state = StatusSnapshot { user, epoch: state.epoch + 1, seq: state.seq, ..StatusSnapshot::default() };
        });
        tracing::debug!(user_id = ?user, "Friend status engine rebound");
    }

    #[tracing::instrument(skip(self), fields(user_id = tracing::field::Empty, online = tracing::field::Empty))]
    pub async fn recompute(&self) -> Recompute {
        let (epoch, user) = {
            let state = self.inner.state.borrow();
            (state.epoch, state.user)
        };
        let Some(user) = user else {
            return Recompute::Idle;
        };
        tracing::Span::current().record("user_id", user.0);
        let seq = self.inner.seq.fetch_add(1, Ordering::SeqCst) + 1;

        let (friends, statuses) = match self.compute(user).await {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(error = %e, "Friend status computation failed");
                self.record(Recompute::Failed);
                return Recompute::Failed;
            }
        };
        let online_count = statuses.values().filter(|s| **s == Status::Online).count();

        let committed = self.inner.state.send_if_modified(|state| {
            if state.epoch != epoch || state.seq >= seq {
                return false;
            }
            state.seq = seq;
            state.friends = friends;
            state.statuses = statuses;
            state.online_count = online_count;
            state.computed_at = Some(OffsetDateTime::now_utc());
            true
        });

        let outcome = if committed {
            tracing::Span::current().record("online", online_count);
            self.inner.metrics.friends_online.record(online_count as u64, &[]);
            Recompute::Committed
        } else {
            tracing::debug!(seq, "Discarding stale friend status computation");
            Recompute::Discarded
        };
        self.record(outcome);
        outcome
    }

    /// Spawns the periodic recomputation loop.
    #[must_use]
    pub fn spawn_poller(&self, interval: Duration) -> WorkerHandle {
        let worker = StatusPollWorker::new(self.clone(), interval);
        WorkerHandle::spawn("friend_status_poll", |shutdown| worker.run(shutdown))
    }

    async fn compute(&self, user: UserId) -> Result<(BTreeSet<UserId>, HashMap<UserId, Status>)> {
        let edges = self.inner.friendships.accepted_edges(user).await?;
        let friends = friend_set(user, &edges);
        if friends.is_empty() {
            return Ok((friends, HashMap::new()));
        }

        let ids: Vec<UserId> = friends.iter().copied().collect();
        let seen: HashMap<UserId, Option<OffsetDateTime>> = self
            .inner
            .presence
            .fetch_last_active(&ids)
            .await?
            .into_iter()
            .map(|record| (record.user_id, record.last_active))
            .collect();

        let now = OffsetDateTime::now_utc();
        let statuses = friends
            .iter()
            .map(|friend| (*friend, Status::classify(now, seen.get(friend).copied().flatten())))
            .collect();
        Ok((friends, statuses))
    }

    fn record(&self, outcome: Recompute) {
        let label = match outcome {
            Recompute::Committed => "committed",
            Recompute::Discarded => "discarded",
            Recompute::Failed => "failed",
            Recompute::Idle => "idle",
        };
        self.inner.metrics.recomputations_total.add(1, &[KeyValue::new("outcome", label)]);
    }
}
