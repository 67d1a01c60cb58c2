use rally_sync::domain::change::ChangeEvent;
use rally_sync::domain::message::Message;
use rally_sync::services::change_feed::ChangeFeed;
use rally_sync::services::message_sync::MessageSyncEngine;
use rally_sync::services::store::MessageStore;

mod common;
use common::{FRIEND, ME, OTHER, TestBackend, eventually};

fn engine(t: &TestBackend) -> MessageSyncEngine {
    MessageSyncEngine::new(t.message_store(), t.feed())
}

fn ids(messages: &[Message]) -> Vec<i64> {
    messages.iter().map(|m| m.id.0).collect()
}

#[tokio::test]
async fn test_open_loads_history_then_appends_live_inserts() {
    let t = TestBackend::new();
    t.befriend(ME, FRIEND);
    t.send(ME, FRIEND, "hi").await;
    t.send(FRIEND, ME, "hey").await;
    t.send(FRIEND, OTHER, "elsewhere").await;

    let conversation = engine(&t).open(ME, FRIEND, false).await.unwrap();
    let initial = conversation.messages();
    assert_eq!(initial.len(), 2);
    assert_eq!(initial[0].content, "hi");
    assert_eq!(initial[1].content, "hey");

    t.send(FRIEND, OTHER, "still elsewhere").await;
    let live = t.send(FRIEND, ME, "live").await;
    eventually("live insert", || conversation.messages().len() == 3).await;

    let messages = conversation.messages();
    assert_eq!(messages.last().unwrap().id, live.id);
    assert!(messages.windows(2).all(|w| w[0].order_key() < w[1].order_key()));
    assert!(messages.iter().all(|m| m.conversation() == conversation.key()));
}

#[tokio::test]
async fn test_replayed_inserts_are_not_duplicated() {
    let t = TestBackend::new();
    let first = t.send(FRIEND, ME, "one").await;
    let conversation = engine(&t).open(ME, FRIEND, false).await.unwrap();

    // Redeliver a row from the bulk load, and a live row twice.
    t.feed().publish(&ChangeEvent::inserted(first.clone())).await.unwrap();
    let second = t.send(FRIEND, ME, "two").await;
    t.feed().publish(&ChangeEvent::inserted(second.clone())).await.unwrap();
    let third = t.send(ME, FRIEND, "three").await;

    eventually("third message", || conversation.messages().iter().any(|m| m.id == third.id)).await;
    assert_eq!(ids(&conversation.messages()), vec![first.id.0, second.id.0, third.id.0]);
}

#[tokio::test]
async fn test_send_trims_and_waits_for_the_feed() {
    let t = TestBackend::new();
    let conversation = engine(&t).open(ME, FRIEND, true).await.unwrap();

    assert!(conversation.send("   ").await.unwrap().is_none());
    assert!(conversation.send("").await.unwrap().is_none());
    assert_eq!(t.backend.calls("insert_message"), 0);

    let row = conversation.send("  hello ").await.unwrap().unwrap();
    assert_eq!(row.content, "hello");
    assert_eq!((row.sender_id, row.recipient_id), (ME, FRIEND));
    assert_eq!(t.backend.calls("insert_message"), 1);
    // Not appended locally; the row arrives through the subscription.
    assert!(conversation.messages().is_empty());

    eventually("sent message echoed", || conversation.messages().len() == 1).await;
    assert_eq!(conversation.messages()[0].id, row.id);
}

#[tokio::test]
async fn test_send_failure_is_reported_and_not_retried() {
    let t = TestBackend::new();
    let conversation = engine(&t).open(ME, FRIEND, false).await.unwrap();

    t.backend.set_unavailable(true);
    assert!(conversation.send("lost").await.is_err());
    t.backend.set_unavailable(false);

    assert_eq!(t.backend.calls("insert_message"), 1);
    assert!(t.backend.messages().is_empty());
}

#[tokio::test]
async fn test_failed_history_load_starts_empty() {
    let t = TestBackend::new();
    t.send(FRIEND, ME, "unseen").await;
    t.backend.set_unavailable(true);
    let conversation = engine(&t).open(ME, FRIEND, false).await.unwrap();
    t.backend.set_unavailable(false);

    assert!(conversation.messages().is_empty());
    t.send(FRIEND, ME, "live").await;
    eventually("live insert after failed load", || conversation.messages().len() == 1).await;
}

#[tokio::test]
async fn test_read_updates_refresh_displayed_rows() {
    let t = TestBackend::new();
    let sent = t.send(ME, FRIEND, "read me").await;
    let conversation = engine(&t).open(ME, FRIEND, false).await.unwrap();
    let mut updates = conversation.updates();
    updates.mark_unchanged();

    t.backend.mark_read(sent.id).await.unwrap();

    updates.changed().await.unwrap();
    assert!(conversation.messages()[0].is_read);
}

#[tokio::test]
async fn test_close_releases_the_subscription_once() {
    let t = TestBackend::new();
    let conversation = engine(&t).open(ME, FRIEND, false).await.unwrap();
    assert_eq!(t.feed().active_topics(), vec!["chat-1-2".to_string()]);

    conversation.close();
    conversation.close();
    assert!(!conversation.is_open());
    assert!(t.feed().active_topics().is_empty());

    assert!(conversation.send("after close").await.unwrap().is_none());
    assert_eq!(t.backend.calls("insert_message"), 0);

    t.send(FRIEND, ME, "unseen").await;
    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    assert!(conversation.messages().is_empty());
}

#[tokio::test]
async fn test_dropping_a_conversation_tears_it_down() {
    let t = TestBackend::new();
    let engine = engine(&t);
    let a = engine.open(ME, FRIEND, false).await.unwrap();
    let b = engine.open(ME, OTHER, false).await.unwrap();
    assert_eq!(t.feed().active_topics().len(), 2);

    drop(a);
    assert_eq!(t.feed().active_topics(), vec!["chat-1-3".to_string()]);
    drop(b);
    assert!(t.feed().active_topics().is_empty());
}

#[tokio::test]
async fn test_focused_conversation_marks_incoming_messages_read() {
    let t = TestBackend::new();
    t.send(FRIEND, ME, "backlog").await;
    let conversation = engine(&t).open(ME, FRIEND, true).await.unwrap();
    assert_eq!(t.unread_from(FRIEND, ME), 0);

    let live = t.send(FRIEND, ME, "live").await;
    eventually("live message marked read", || t.unread_from(FRIEND, ME) == 0 && t.backend.calls("mark_read") == 1)
        .await;
    eventually("read flag displayed", || {
        conversation.messages().iter().any(|m| m.id == live.id && m.is_read)
    })
    .await;
    assert_eq!(t.backend.calls("mark_conversation_read"), 1);
}

#[tokio::test]
async fn test_unfocused_conversation_accumulates_unread_until_focus() {
    let t = TestBackend::new();
    let conversation = engine(&t).open(ME, FRIEND, false).await.unwrap();

    let last = t.send(FRIEND, ME, "3").await;
    eventually("message delivered", || conversation.messages().iter().any(|m| m.id == last.id)).await;
    assert_eq!(t.backend.calls("mark_read"), 0);
    assert_eq!(t.unread_from(FRIEND, ME), 1);

    conversation.set_focused(true).await;
    assert!(conversation.is_focused());
    assert_eq!(t.unread_from(FRIEND, ME), 0);
    assert_eq!(t.backend.calls("mark_conversation_read"), 1);
    assert_eq!(conversation.messages().iter().filter(|m| m.id == last.id).count(), 1);
}
