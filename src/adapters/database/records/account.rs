use crate::domain::user::{Account, AccountId, UserId};

#[derive(Debug, sqlx::FromRow)]
pub struct AccountRecord {
    pub(crate) id: i64,
    pub(crate) last_active_user_id: Option<i64>,
}

impl From<AccountRecord> for Account {
    fn from(record: AccountRecord) -> Self {
        Self { id: AccountId(record.id), last_active_user_id: record.last_active_user_id.map(UserId) }
    }
}
