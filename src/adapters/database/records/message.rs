use crate::domain::message::{Message, MessageId};
use crate::domain::user::UserId;
use time::OffsetDateTime;

#[derive(Debug, sqlx::FromRow)]
pub struct MessageRecord {
    pub(crate) id: i64,
    pub(crate) sender_id: i64,
    pub(crate) recipient_id: i64,
    pub(crate) content: String,
    pub(crate) inserted_at: OffsetDateTime,
    pub(crate) is_read: bool,
}

impl From<MessageRecord> for Message {
    fn from(record: MessageRecord) -> Self {
        Self {
            id: MessageId(record.id),
            sender_id: UserId(record.sender_id),
            recipient_id: UserId(record.recipient_id),
            content: record.content,
            inserted_at: record.inserted_at,
            is_read: record.is_read,
        }
    }
}
