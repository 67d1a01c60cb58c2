use crate::config::SyncConfig;
use crate::domain::user::{AccountId, UserId};
use crate::error::{AppError, Result};
use crate::services::change_feed::{ChangeFeed, Teardown};
use crate::services::friend_status::{FriendStatusEngine, Recompute};
use crate::services::friend_summary::{FriendSummaries, FriendSummaryAggregator};
use crate::services::message_sync::{Conversation, MessageSyncEngine};
use crate::services::presence_heartbeat::PresenceHeartbeat;
use crate::services::store::Stores;
use crate::workers::WorkerHandle;
use std::sync::{Arc, Mutex, MutexGuard};

/// Everything bound to one active user. Dropped as a unit on switch or dispose.
#[derive(Debug)]
struct Binding {
    user: UserId,
    heartbeat: PresenceHeartbeat,
    poller: WorkerHandle,
    views: Vec<Teardown>,
}

impl Binding {
    fn release(self) {
        self.heartbeat.stop();
        self.poller.stop();
        for view in &self.views {
            view.close();
        }
        tracing::info!(user_id = %self.user, views = self.views.len(), "Released active user services");
    }
}

#[derive(Debug, Default)]
struct State {
    binding: Option<Binding>,
    disposed: bool,
}

/// The services of one signed-in device session, bound to its active user.
///
/// Heartbeat, status polling and every conversation or summary view opened
/// through the session belong to the active user, and are torn down together
/// when the user switches or the session is disposed.
#[derive(Debug)]
pub struct Session {
    config: SyncConfig,
    stores: Stores,
    conversations: MessageSyncEngine,
    summaries: FriendSummaryAggregator,
    status: FriendStatusEngine,
    state: Mutex<State>,
}

impl Session {
    #[must_use]
    pub fn new(config: SyncConfig, stores: Stores, feed: Arc<dyn ChangeFeed>) -> Self {
        let conversations = MessageSyncEngine::new(Arc::clone(&stores.messages), Arc::clone(&feed));
        let summaries = FriendSummaryAggregator::new(Arc::clone(&stores.messages), feed);
        let status = FriendStatusEngine::new(Arc::clone(&stores.friendships), Arc::clone(&stores.presence));
        Self { config, stores, conversations, summaries, status, state: Mutex::new(State::default()) }
    }

    /// Creates a session and binds it to `user`.
    pub async fn start(config: SyncConfig, stores: Stores, feed: Arc<dyn ChangeFeed>, user: UserId) -> Self {
        let session = Self::new(config, stores, feed);
        session.activate(user).await;
        session
    }

    /// The profile an account should start with: the one it used last, or its
    /// first profile, which is then remembered for next time.
    ///
    /// # Errors
    /// Returns an error if the account cannot be read.
    #[tracing::instrument(err(level = "warn"), skip(self))]
    pub async fn resolve_active_user(&self, account: AccountId) -> Result<Option<UserId>> {
        let row = self.stores.accounts.account(account).await?;
        if let Some(user) = row.last_active_user_id {
            return Ok(Some(user));
        }

        let Some(first) = self.stores.accounts.first_user(account).await? else {
            tracing::warn!("Account owns no user profiles");
            return Ok(None);
        };
        self.persist_active_user(account, first).await;
        Ok(Some(first))
    }

    /// Binds the session to `user`, releasing whatever was bound before.
    pub async fn activate(&self, user: UserId) -> Recompute {
        {
            let mut state = self.lock();
            if state.disposed {
                tracing::warn!(user_id = %user, "Activation on a disposed session ignored");
                return Recompute::Idle;
            }
            if let Some(previous) = state.binding.take() {
                previous.release();
            }
            self.status.set_active_user(Some(user));
            let heartbeat =
                PresenceHeartbeat::start(Arc::clone(&self.stores.presence), user, self.config.heartbeat_interval());
            let poller = self.status.spawn_poller(self.config.status_poll_interval());
            state.binding = Some(Binding { user, heartbeat, poller, views: Vec::new() });
        }
        tracing::info!(user_id = %user, "Active user bound");
        self.status.recompute().await
    }

    /// Switches to another profile. The choice is persisted for `account` if
    /// given; a failed write is logged and the switch still happens.
    #[tracing::instrument(skip(self))]
    pub async fn switch_active_user(&self, account: Option<AccountId>, user: UserId) -> Recompute {
        if let Some(account) = account {
            self.persist_active_user(account, user).await;
        }
        self.activate(user).await
    }

    #[must_use]
    pub fn active_user(&self) -> Option<UserId> {
        self.lock().binding.as_ref().map(|b| b.user)
    }

    #[must_use]
    pub const fn friend_status(&self) -> &FriendStatusEngine {
        &self.status
    }

    #[must_use]
    pub const fn config(&self) -> &SyncConfig {
        &self.config
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.lock().disposed
    }

    /// Opens a conversation between the active user and `friend`.
    ///
    /// # Errors
    /// Returns an error without an active user, or if the subscription fails.
    pub async fn open_conversation(&self, friend: UserId, focused: bool) -> Result<Conversation> {
        let user = self.bound_user()?;
        let conversation = self.conversations.open(user, friend, focused).await?;
        self.track(user, conversation.teardown());
        Ok(conversation)
    }

    /// Opens the friend-list summaries of the active user for `friends`.
    ///
    /// # Errors
    /// Returns an error without an active user, or if the subscription fails.
    pub async fn friend_summaries(&self, friends: &[UserId]) -> Result<FriendSummaries> {
        let user = self.bound_user()?;
        let summaries = self.summaries.start(user, friends).await?;
        self.track(user, summaries.teardown());
        Ok(summaries)
    }

    /// Stops every service and closes every view. Idempotent.
    pub fn dispose(&self) {
        let binding = {
            let mut state = self.lock();
            if state.disposed {
                return;
            }
            state.disposed = true;
            state.binding.take()
        };
        if let Some(binding) = binding {
            binding.release();
        }
        self.status.set_active_user(None);
        tracing::info!("Session disposed");
    }

    fn bound_user(&self) -> Result<UserId> {
        let state = self.lock();
        if state.disposed {
            return Err(AppError::Disposed);
        }
        state.binding.as_ref().map(|b| b.user).ok_or(AppError::NoActiveUser)
    }

    // A view opened while the user switched belongs to nobody; close it now.
    fn track(&self, user: UserId, view: Teardown) {
        let mut state = self.lock();
        match state.binding.as_mut() {
            Some(binding) if binding.user == user => {
                binding.views.retain(Teardown::is_open);
                binding.views.push(view);
            }
            _ => {
                tracing::debug!(user_id = %user, "Closing view opened across a user switch");
                view.close();
            }
        }
    }

    async fn persist_active_user(&self, account: AccountId, user: UserId) {
        if let Err(e) = self.stores.accounts.set_last_active_user(account, user).await {
            tracing::error!(error = %e, account_id = %account, user_id = %user, "Failed to persist active user");
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.dispose();
    }
}
