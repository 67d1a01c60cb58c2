use crate::domain::user::UserId;
use serde::{Deserialize, Serialize};
use std::fmt;
use time::OffsetDateTime;

/// Storage-assigned message identifier. Totally ordered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, sqlx::Type)]
#[serde(transparent)]
#[sqlx(transparent)]
pub struct MessageId(pub i64);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// A committed chat message. Only `is_read` ever changes after insert.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub content: String,
    pub inserted_at: OffsetDateTime,
    pub is_read: bool,
}

impl Message {
    /// Display order key: `inserted_at`, ties broken by id.
    #[must_use]
    pub const fn order_key(&self) -> (OffsetDateTime, MessageId) {
        (self.inserted_at, self.id)
    }

    #[must_use]
    pub fn is_inbound_for(&self, user: UserId) -> bool {
        self.recipient_id == user
    }

    /// The endpoint that is not `user`.
    #[must_use]
    pub fn counterpart_of(&self, user: UserId) -> UserId {
        if self.sender_id == user { self.recipient_id } else { self.sender_id }
    }

    #[must_use]
    pub fn conversation(&self) -> ConversationKey {
        ConversationKey::new(self.sender_id, self.recipient_id)
    }
}

/// An outbound message before the store has assigned id and timestamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMessage {
    pub sender_id: UserId,
    pub recipient_id: UserId,
    pub content: String,
}

impl NewMessage {
    /// Builds an outbound message, trimming the text. Returns `None` for blank input.
    #[must_use]
    pub fn compose(sender_id: UserId, recipient_id: UserId, text: &str) -> Option<Self> {
        let content = text.trim();
        if content.is_empty() {
            return None;
        }
        Some(Self { sender_id, recipient_id, content: content.to_string() })
    }
}

/// Unordered pair of users exchanging messages. Stored normalised (`low <= high`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationKey {
    low: UserId,
    high: UserId,
}

impl ConversationKey {
    #[must_use]
    pub fn new(a: UserId, b: UserId) -> Self {
        if a <= b { Self { low: a, high: b } } else { Self { low: b, high: a } }
    }

    #[must_use]
    pub const fn members(&self) -> (UserId, UserId) {
        (self.low, self.high)
    }

    #[must_use]
    pub fn contains(&self, user: UserId) -> bool {
        self.low == user || self.high == user
    }

    #[must_use]
    pub fn topic(&self) -> String {
        format!("chat-{}-{}", self.low, self.high)
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.low, self.high)
    }
}

/// The in-memory message sequence of one open conversation.
///
/// Keeps messages sorted by `(inserted_at, id)` with no duplicate id, whatever
/// order the bulk load and the live feed arrive in.
#[derive(Debug, Clone, Default)]
pub struct MessageLog {
    messages: Vec<Message>,
    ids: std::collections::HashSet<MessageId>,
}

impl MessageLog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Merges the result of the bulk read. Rows already seen live are skipped.
    pub fn load(&mut self, initial: Vec<Message>) -> usize {
        let mut added = 0;
        for message in initial {
            if self.insert(message) {
                added += 1;
            }
        }
        added
    }

    /// Merges one live row. Returns `false` if the id was already present.
    pub fn insert(&mut self, message: Message) -> bool {
        if !self.ids.insert(message.id) {
            return false;
        }
        let key = message.order_key();
        match self.messages.last() {
            Some(last) if last.order_key() > key => {
                let at = self.messages.partition_point(|m| m.order_key() < key);
                self.messages.insert(at, message);
            }
            _ => self.messages.push(message),
        }
        true
    }

    /// Applies a newer version of a known row (the read flag). Unknown ids are ignored.
    pub fn refresh(&mut self, message: &Message) -> bool {
        if !self.ids.contains(&message.id) {
            return false;
        }
        self.messages.iter_mut().find(|m| m.id == message.id).is_some_and(|m| {
            let changed = !m.is_read && message.is_read;
            m.is_read |= message.is_read;
            changed
        })
    }

    #[must_use]
    pub fn contains(&self, id: MessageId) -> bool {
        self.ids.contains(&id)
    }

    #[must_use]
    pub fn as_slice(&self) -> &[Message] {
        &self.messages
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    #[must_use]
    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }
}
