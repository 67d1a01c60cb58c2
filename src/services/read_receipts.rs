use crate::domain::message::Message;
use crate::domain::user::UserId;
use crate::services::store::MessageStore;
use opentelemetry::{KeyValue, global, metrics::Counter};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Clone, Debug)]
struct Metrics {
    marks_total: Counter<u64>,
}

impl Metrics {
    fn new() -> Self {
        let meter = global::meter("rally-sync");
        Self {
            marks_total: meter
                .u64_counter("read_marks_total")
                .with_description("Mark-read requests issued, by scope and outcome")
                .build(),
        }
    }
}

/// Marks a friend's messages read while their conversation is focused.
///
/// Fire-and-forget: failures are logged and reconciled by the next focus gain.
#[derive(Debug)]
pub struct ReadReceiptTracker {
    store: Arc<dyn MessageStore>,
    user: UserId,
    friend: UserId,
    focused: AtomicBool,
    metrics: Metrics,
}

impl ReadReceiptTracker {
    #[must_use]
    pub fn new(store: Arc<dyn MessageStore>, user: UserId, friend: UserId, focused: bool) -> Self {
        Self { store, user, friend, focused: AtomicBool::new(focused), metrics: Metrics::new() }
    }

    #[must_use]
    pub fn is_focused(&self) -> bool {
        self.focused.load(Ordering::SeqCst)
    }

    /// Runs once when the conversation opens.
    pub async fn on_open(&self) {
        if self.is_focused() {
            self.mark_all().await;
        }
    }

    /// Records a focus change. Regaining focus marks the whole backlog read.
    pub async fn set_focused(&self, focused: bool) {
        let was_focused = self.focused.swap(focused, Ordering::SeqCst);
        if focused && !was_focused {
            self.mark_all().await;
        }
    }

    /// Marks a freshly delivered inbound message read if the conversation is focused.
    pub async fn on_live_insert(&self, message: &Message) {
        if !self.is_focused()
            || message.is_read
            || message.sender_id != self.friend
            || message.recipient_id != self.user
        {
            return;
        }
        match self.store.mark_read(message.id).await {
            Ok(_) => self.metrics.marks_total.add(1, &[KeyValue::new("scope", "single"), KeyValue::new("status", "ok")]),
            Err(e) => {
                tracing::error!(error = %e, message_id = %message.id, "Failed to mark received message read");
                self.metrics.marks_total.add(1, &[KeyValue::new("scope", "single"), KeyValue::new("status", "error")]);
            }
        }
    }

    #[tracing::instrument(skip(self), fields(user_id = %self.user, friend_id = %self.friend))]
    async fn mark_all(&self) {
        match self.store.mark_conversation_read(self.friend, self.user).await {
            Ok(count) => {
                tracing::debug!(count, "Marked conversation read");
                self.metrics.marks_total.add(1, &[KeyValue::new("scope", "batch"), KeyValue::new("status", "ok")]);
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to mark conversation read on focus");
                self.metrics.marks_total.add(1, &[KeyValue::new("scope", "batch"), KeyValue::new("status", "error")]);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::memory::MemoryBackend;
    use crate::domain::message::NewMessage;

    const ME: UserId = UserId(1);
    const FRIEND: UserId = UserId(2);

    async fn backend_with_unread(count: usize) -> Arc<MemoryBackend> {
        let backend = Arc::new(MemoryBackend::default());
        for i in 0..count {
            backend.insert_message(NewMessage::compose(FRIEND, ME, &format!("m{i}")).unwrap()).await.unwrap();
        }
        backend
    }

    fn unread(backend: &MemoryBackend) -> usize {
        backend.messages().iter().filter(|m| !m.is_read).count()
    }

    #[tokio::test]
    async fn test_open_while_unfocused_marks_nothing() {
        let backend = backend_with_unread(2).await;
        let tracker = ReadReceiptTracker::new(backend.clone(), ME, FRIEND, false);
        tracker.on_open().await;
        assert_eq!(backend.calls("mark_conversation_read"), 0);
        assert_eq!(unread(&backend), 2);
    }

    #[tokio::test]
    async fn test_focus_gain_issues_one_batch() {
        let backend = backend_with_unread(3).await;
        let tracker = ReadReceiptTracker::new(backend.clone(), ME, FRIEND, false);
        tracker.set_focused(true).await;
        tracker.set_focused(true).await;
        assert_eq!(backend.calls("mark_conversation_read"), 1);
        assert_eq!(backend.calls("mark_read"), 0);
        assert_eq!(unread(&backend), 0);
    }

    #[tokio::test]
    async fn test_live_insert_only_marked_when_focused_and_inbound() {
        let backend = backend_with_unread(0).await;
        let tracker = ReadReceiptTracker::new(backend.clone(), ME, FRIEND, false);

        let inbound = backend.insert_message(NewMessage::compose(FRIEND, ME, "a").unwrap()).await.unwrap();
        tracker.on_live_insert(&inbound).await;
        assert_eq!(backend.calls("mark_read"), 0);

        tracker.set_focused(true).await;
        let inbound = backend.insert_message(NewMessage::compose(FRIEND, ME, "b").unwrap()).await.unwrap();
        let outbound = backend.insert_message(NewMessage::compose(ME, FRIEND, "c").unwrap()).await.unwrap();
        tracker.on_live_insert(&inbound).await;
        tracker.on_live_insert(&outbound).await;
        assert_eq!(backend.calls("mark_read"), 1);
        assert_eq!(unread(&backend), 1);
    }

    #[tokio::test]
    async fn test_failures_are_swallowed() {
        let backend = backend_with_unread(1).await;
        backend.set_unavailable(true);
        let tracker = ReadReceiptTracker::new(backend.clone(), ME, FRIEND, true);
        tracker.on_open().await;
        backend.set_unavailable(false);
        assert_eq!(unread(&backend), 1);

        tracker.set_focused(false).await;
        tracker.set_focused(true).await;
        assert_eq!(unread(&backend), 0);
    }
}
