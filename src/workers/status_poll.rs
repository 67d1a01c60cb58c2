use crate::services::friend_status::FriendStatusEngine;
use std::time::Duration;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::Instrument;

/// Re-runs the friend status computation on a fixed interval.
///
/// The first poll fires one interval after start; the initial computation is
/// triggered by the active-user change itself.
#[derive(Debug)]
pub struct StatusPollWorker {
    engine: FriendStatusEngine,
    interval: Duration,
}

impl StatusPollWorker {
    #[must_use]
    pub const fn new(engine: FriendStatusEngine, interval: Duration) -> Self {
        Self { engine, interval }
    }

    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval_at(Instant::now() + self.interval, self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !*shutdown.borrow() {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {}
                _ = interval.tick() => {
                    let outcome = self.engine.recompute()
                        .instrument(tracing::info_span!("status_poll_iteration"))
                        .await;
                    tracing::debug!(?outcome, "Friend status poll finished");
                }
            }
        }
        tracing::info!("Friend status poll shutting down...");
    }
}
