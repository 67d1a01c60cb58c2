use crate::domain::change::{ChangeEvent, ChangeKind};
use crate::domain::message::{Message, MessageId};
use crate::domain::user::UserId;
use std::collections::{BTreeSet, HashMap};
use time::OffsetDateTime;

/// Latest message and unread count for one friend, as seen by the active user.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FriendSummary {
    pub latest: Option<Message>,
    pub unread: u32,
}

/// Unread inbound rows of one friend, by order key.
type UnreadSet = BTreeSet<(OffsetDateTime, MessageId)>;

/// Reducer state behind the friend list: one summary per friend.
///
/// Unread counts are derived from the set of unread inbound rows rather than a
/// bare counter, so replaying events that raced the bulk read converges on
/// what storage holds.
#[derive(Debug, Clone)]
pub struct SummaryBook {
    user: UserId,
    entries: HashMap<UserId, FriendSummary>,
    unread: HashMap<UserId, UnreadSet>,
}

impl SummaryBook {
    #[must_use]
    pub fn new(user: UserId) -> Self {
        Self { user, entries: HashMap::new(), unread: HashMap::new() }
    }

    /// Folds the bulk read, which must be ordered newest first.
    pub fn load(&mut self, newest_first: Vec<Message>) {
        for message in newest_first {
            self.merge(message);
        }
    }

    /// Applies one change-feed event. Returns the friend whose summary changed.
    pub fn apply(&mut self, event: &ChangeEvent) -> Option<UserId> {
        let row = &event.row;
        match event.kind {
            ChangeKind::Insert => self.merge(row.clone()),
            // Coarse reset: a read update means the recipient marked the
            // conversation read up to and including this row.
            ChangeKind::Update if row.is_read && row.is_inbound_for(self.user) => {
                let friend = row.counterpart_of(self.user);
                let pending = self.unread.entry(friend).or_default();
                let before = pending.len();
                pending.retain(|key| *key > row.order_key());

                let mut changed = pending.len() != before;
                let entry = self.entries.entry(friend).or_default();
                if let Some(latest) = entry.latest.as_mut()
                    && latest.id == row.id
                    && !latest.is_read
                {
                    latest.is_read = true;
                    changed = true;
                }
                changed.then(|| self.sync(friend))
            }
            ChangeKind::Update => None,
        }
    }

    #[must_use]
    pub fn get(&self, friend: UserId) -> Option<&FriendSummary> {
        self.entries.get(&friend)
    }

    #[must_use]
    pub const fn entries(&self) -> &HashMap<UserId, FriendSummary> {
        &self.entries
    }

    #[must_use]
    pub fn total_unread(&self) -> u32 {
        self.entries.values().map(|s| s.unread).sum()
    }

    // Idempotent per row: seeing the same message twice changes nothing.
    fn merge(&mut self, message: Message) -> Option<UserId> {
        let friend = message.counterpart_of(self.user);
        let mut changed = false;
        if message.is_inbound_for(self.user) && !message.is_read {
            changed |= self.unread.entry(friend).or_default().insert(message.order_key());
        }

        let entry = self.entries.entry(friend).or_default();
        let newer = entry.latest.as_ref().is_none_or(|l| l.order_key() < message.order_key());
        if newer {
            entry.latest = Some(message);
            changed = true;
        }
        changed.then(|| self.sync(friend))
    }

    fn sync(&mut self, friend: UserId) -> UserId {
        let count = self.unread.get(&friend).map_or(0, BTreeSet::len);
        self.entries.entry(friend).or_default().unread = u32::try_from(count).unwrap_or(u32::MAX);
        friend
    }
}
