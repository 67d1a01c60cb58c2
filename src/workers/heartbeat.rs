use crate::domain::user::UserId;
use crate::services::store::PresenceStore;
use opentelemetry::{KeyValue, global, metrics::Counter};
use std::sync::Arc;
use std::time::Duration;
use time::OffsetDateTime;
use tokio::time::MissedTickBehavior;

#[derive(Clone, Debug)]
struct Metrics {
    ticks_total: Counter<u64>,
}

impl Metrics {
    fn new() -> Self {
        let meter = global::meter("rally-sync");
        Self {
            ticks_total: meter
                .u64_counter("presence_heartbeat_ticks_total")
                .with_description("Presence heartbeat writes by outcome")
                .build(),
        }
    }
}

/// Stamps `last_active` for one user, immediately and then every `interval`.
#[derive(Debug)]
pub struct HeartbeatWorker {
    store: Arc<dyn PresenceStore>,
    user: UserId,
    interval: Duration,
    metrics: Metrics,
}

impl HeartbeatWorker {
    #[must_use]
    pub fn new(store: Arc<dyn PresenceStore>, user: UserId, interval: Duration) -> Self {
        Self { store, user, interval, metrics: Metrics::new() }
    }

    pub async fn run(self, mut shutdown: tokio::sync::watch::Receiver<bool>) {
        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        while !*shutdown.borrow() {
            tokio::select! {
                biased;
                _ = shutdown.changed() => {}
                _ = interval.tick() => {
                    if *shutdown.borrow() {
                        break;
                    }
                    self.beat().await;
                }
            }
        }
        tracing::info!(user_id = %self.user, "Presence heartbeat shutting down...");
    }

    // A failed tick is only logged; the schedule is unaffected.
    async fn beat(&self) {
        match self.store.touch(self.user, OffsetDateTime::now_utc()).await {
            Ok(()) => {
                tracing::trace!(user_id = %self.user, "Heartbeat written");
                self.metrics.ticks_total.add(1, &[KeyValue::new("status", "ok")]);
            }
            Err(e) => {
                tracing::warn!(error = %e, user_id = %self.user, "Heartbeat write failed");
                self.metrics.ticks_total.add(1, &[KeyValue::new("status", "error")]);
            }
        }
    }
}
