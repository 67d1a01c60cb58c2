#![forbid(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::nursery)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::todo)]
#![warn(clippy::panic)]
#![warn(clippy::dbg_macro)]
#![warn(clippy::print_stdout)]
#![warn(clippy::print_stderr)]
#![warn(clippy::clone_on_ref_ptr)]
#![warn(unreachable_pub)]
#![warn(missing_debug_implementations)]
#![warn(unused_qualifications)]
#![deny(unused_must_use)]

use anyhow::Context;
use rally_sync::adapters::database::{self, PgBackend};
use rally_sync::adapters::memory::MemoryBackend;
use rally_sync::adapters::redis::{RedisChangeFeed, RedisClient};
use rally_sync::config::{Backend, Config};
use rally_sync::domain::user::{AccountId, UserId};
use rally_sync::services::change_feed::ChangeFeed;
use rally_sync::services::friend_status::StatusSnapshot;
use rally_sync::services::friend_summary::FriendSummaries;
use rally_sync::services::session::Session;
use rally_sync::services::store::Stores;
use rally_sync::telemetry;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::Instrument;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Config::load();
    let telemetry_guard = telemetry::init_telemetry(&config.telemetry)?;

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    rally_sync::spawn_signal_handler(shutdown_tx);

    let boot_span = tracing::info_span!("boot_session", backend = ?config.backend);
    let session = async {
        // Phase 1: Collaborators
        let (stores, feed) = connect(&config, shutdown_rx.clone()).await?;

        // Phase 2: Active user
        let session = Session::new(config.sync.clone(), stores, feed);
        let user = match (config.user_id, config.account_id) {
            (Some(user), _) => UserId(user),
            (None, Some(account)) => session
                .resolve_active_user(AccountId(account))
                .await?
                .with_context(|| format!("account {account} owns no user profiles"))?,
            (None, None) => anyhow::bail!("either --user-id or --account-id is required"),
        };

        // Phase 3: Services
        let outcome = session.activate(user).await;
        tracing::info!(user_id = %user, ?outcome, "Session started");
        Ok::<Session, anyhow::Error>(session)
    }
    .instrument(boot_span)
    .await?;

    // Phase 4: Follow the friend list until shutdown
    let mut statuses = session.friend_status().subscribe();
    let mut summaries: Option<FriendSummaries> = None;
    loop {
        {
            let snapshot = statuses.borrow_and_update().clone();
            summaries = refresh_summaries(&session, &snapshot, summaries).await;
            log_snapshot(&snapshot, summaries.as_ref());
        }

        tokio::select! {
            _ = shutdown_rx.wait_for(|&s| s) => break,
            changed = statuses.changed() => {
                if changed.is_err() {
                    break;
                }
            }
        }
    }

    // Phase 5: Teardown
    drop(summaries);
    session.dispose();
    telemetry_guard.shutdown();
    Ok(())
}

async fn connect(
    config: &Config,
    shutdown: watch::Receiver<bool>,
) -> anyhow::Result<(Stores, Arc<dyn ChangeFeed>)> {
    match config.backend {
        Backend::Postgres => {
            let pool = database::init_pool(&config.database).await?;
            database::run_migrations(&pool).await?;

            let redis = RedisClient::new(&config.pubsub, shutdown).await?;
            let feed: Arc<dyn ChangeFeed> = Arc::new(RedisChangeFeed::new(redis, config.sync.subscription_buffer));
            let backend = Arc::new(PgBackend::new(pool, Arc::clone(&feed)));
            Ok((Stores::from_backend(&backend), feed))
        }
        Backend::Memory => {
            let backend = Arc::new(MemoryBackend::default());
            // Nothing is persisted; seed just enough for the session to bind.
            if let Some(user) = config.user_id {
                backend.add_user(UserId(user), None);
            }
            if let Some(account) = config.account_id {
                backend.add_account(AccountId(account), &[UserId(account)], None);
            }
            let feed: Arc<dyn ChangeFeed> = backend.feed();
            Ok((Stores::from_backend(&backend), feed))
        }
    }
}

// Reopens the summaries when the friend set changed.
async fn refresh_summaries(
    session: &Session,
    snapshot: &StatusSnapshot,
    current: Option<FriendSummaries>,
) -> Option<FriendSummaries> {
    let friends: Vec<UserId> = snapshot.friends().iter().copied().collect();
    if let Some(current) = current
        && current.summaries().len() == friends.len()
        && friends.iter().all(|f| current.summaries().contains_key(f))
    {
        return Some(current);
    }
    match session.friend_summaries(&friends).await {
        Ok(summaries) => Some(summaries),
        Err(e) => {
            tracing::warn!(error = %e, "Failed to open friend summaries");
            None
        }
    }
}

fn log_snapshot(snapshot: &StatusSnapshot, summaries: Option<&FriendSummaries>) {
    tracing::info!(
        user_id = ?snapshot.user(),
        friends = snapshot.friends().len(),
        online = snapshot.online_count(),
        unread = summaries.map_or(0, FriendSummaries::total_unread),
        "Friend list"
    );
    for friend in snapshot.friends() {
        let summary = summaries.map(|s| s.summary(*friend)).unwrap_or_default();
        tracing::info!(
            friend_id = %friend,
            status = %snapshot.status(*friend),
            unread = summary.unread,
            latest = summary.latest.as_ref().map(|m| m.content.as_str()),
            "Friend"
        );
    }
}
