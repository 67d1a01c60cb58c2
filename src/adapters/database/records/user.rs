use crate::domain::presence::PresenceRecord;
use crate::domain::user::UserId;
use time::OffsetDateTime;

#[derive(Debug, sqlx::FromRow)]
pub struct PresenceRow {
    pub(crate) id: i64,
    pub(crate) last_active: Option<OffsetDateTime>,
}

impl From<PresenceRow> for PresenceRecord {
    fn from(row: PresenceRow) -> Self {
        Self { user_id: UserId(row.id), last_active: row.last_active }
    }
}
