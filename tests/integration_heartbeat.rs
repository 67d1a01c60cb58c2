use rally_sync::services::presence_heartbeat::PresenceHeartbeat;
use std::time::Duration;

mod common;
use common::{FRIEND, ME, TestBackend};

const INTERVAL: Duration = Duration::from_secs(60);

#[tokio::test(start_paused = true)]
async fn test_writes_immediately_then_every_interval() {
    let t = TestBackend::new();
    t.backend.add_user(ME, None);

    let heartbeat = PresenceHeartbeat::start(t.stores().presence, ME, INTERVAL);
    assert_eq!(heartbeat.user(), ME);
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(t.backend.calls("touch"), 1);
    let first = t.backend.last_active(ME).unwrap();

    tokio::time::sleep(INTERVAL).await;
    assert_eq!(t.backend.calls("touch"), 2);
    tokio::time::sleep(INTERVAL).await;
    assert_eq!(t.backend.calls("touch"), 3);
    assert!(t.backend.last_active(ME).unwrap() >= first);
    assert!(t.backend.last_active(FRIEND).is_none());

    heartbeat.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_failed_tick_does_not_break_the_schedule() {
    let t = TestBackend::new();
    t.backend.add_user(ME, None);
    t.backend.set_unavailable(true);

    let heartbeat = PresenceHeartbeat::start(t.stores().presence, ME, INTERVAL);
    tokio::time::sleep(Duration::from_millis(1)).await;
    assert_eq!(t.backend.calls("touch"), 1);
    assert!(t.backend.last_active(ME).is_none());

    t.backend.set_unavailable(false);
    tokio::time::sleep(INTERVAL).await;
    assert_eq!(t.backend.calls("touch"), 2);
    assert!(t.backend.last_active(ME).is_some());
    assert!(heartbeat.is_running());

    heartbeat.stop();
}

#[tokio::test(start_paused = true)]
async fn test_stop_cancels_future_writes() {
    let t = TestBackend::new();
    t.backend.add_user(ME, None);

    let heartbeat = PresenceHeartbeat::start(t.stores().presence, ME, INTERVAL);
    tokio::time::sleep(Duration::from_millis(1)).await;
    heartbeat.stop();
    heartbeat.stop();
    tokio::time::sleep(INTERVAL * 10).await;

    assert_eq!(t.backend.calls("touch"), 1);
    assert!(!heartbeat.is_running());
}

#[tokio::test(start_paused = true)]
async fn test_dropping_the_heartbeat_stops_it() {
    let t = TestBackend::new();
    t.backend.add_user(ME, None);

    let heartbeat = PresenceHeartbeat::start(t.stores().presence, ME, INTERVAL);
    tokio::time::sleep(Duration::from_millis(1)).await;
    drop(heartbeat);
    tokio::time::sleep(INTERVAL * 3).await;

    assert_eq!(t.backend.calls("touch"), 1);
}
