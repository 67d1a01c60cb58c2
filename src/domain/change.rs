use crate::domain::message::{ConversationKey, Message};
use crate::domain::user::UserId;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ChangeKind {
    Insert,
    Update,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Table {
    Messages,
}

impl Table {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Messages => "messages",
        }
    }
}

/// A committed row change, as delivered by the change feed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub kind: ChangeKind,
    pub table: Table,
    pub row: Message,
}

impl ChangeEvent {
    #[must_use]
    pub const fn inserted(row: Message) -> Self {
        Self { kind: ChangeKind::Insert, table: Table::Messages, row }
    }

    #[must_use]
    pub const fn updated(row: Message) -> Self {
        Self { kind: ChangeKind::Update, table: Table::Messages, row }
    }
}

/// Row predicate evaluated against the new row of an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowFilter {
    Any,
    /// Both endpoints are the members of this conversation.
    Conversation(ConversationKey),
    /// One endpoint is `user`, the other one of `friends`.
    Involving { user: UserId, friends: BTreeSet<UserId> },
    RecipientIs(UserId),
}

impl RowFilter {
    #[must_use]
    pub fn matches(&self, row: &Message) -> bool {
        match self {
            Self::Any => true,
            Self::Conversation(key) => row.conversation() == *key,
            Self::Involving { user, friends } => {
                (row.sender_id == *user && friends.contains(&row.recipient_id))
                    || (row.recipient_id == *user && friends.contains(&row.sender_id))
            }
            Self::RecipientIs(user) => row.recipient_id == *user,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    pub kind: ChangeKind,
    pub table: Table,
    pub filter: RowFilter,
}

/// What a subscriber listens to: a topic name plus one or more bindings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedSpec {
    pub topic: String,
    pub bindings: Vec<Binding>,
}

impl FeedSpec {
    #[must_use]
    pub fn new(topic: impl Into<String>) -> Self {
        Self { topic: topic.into(), bindings: Vec::new() }
    }

    #[must_use]
    pub fn on(mut self, kind: ChangeKind, table: Table, filter: RowFilter) -> Self {
        self.bindings.push(Binding { kind, table, filter });
        self
    }

    #[must_use]
    pub fn matches(&self, event: &ChangeEvent) -> bool {
        self.bindings
            .iter()
            .any(|b| b.kind == event.kind && b.table == event.table && b.filter.matches(&event.row))
    }
}
