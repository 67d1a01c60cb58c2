use crate::domain::user::UserId;
use crate::services::store::PresenceStore;
use crate::workers::{HeartbeatWorker, WorkerHandle};
use std::sync::Arc;
use std::time::Duration;

/// Keeps the local user's `last_active` fresh while a session is bound to them.
///
/// The first write happens right away. Stop it before the active user changes,
/// otherwise presence keeps being written under the old identity.
#[derive(Debug)]
pub struct PresenceHeartbeat {
    user: UserId,
    worker: WorkerHandle,
}

impl PresenceHeartbeat {
    #[tracing::instrument(skip(store), fields(user_id = %user))]
    pub fn start(store: Arc<dyn PresenceStore>, user: UserId, interval: Duration) -> Self {
        let worker = HeartbeatWorker::new(store, user, interval);
        tracing::info!(interval = ?interval, "Presence heartbeat started");
        Self { user, worker: WorkerHandle::spawn("presence_heartbeat", |shutdown| worker.run(shutdown)) }
    }

    #[must_use]
    pub const fn user(&self) -> UserId {
        self.user
    }

    #[must_use]
    pub fn is_running(&self) -> bool {
        self.worker.is_running()
    }

    /// Cancels the schedule. Idempotent.
    pub fn stop(&self) {
        self.worker.stop();
    }

    /// Cancels the schedule and waits until the loop has exited.
    pub async fn shutdown(self) {
        self.worker.join().await;
    }
}
