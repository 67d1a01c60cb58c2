use crate::domain::friendship::{FriendshipEdge, FriendshipStatus};
use crate::domain::user::UserId;
use crate::error::AppError;

#[derive(Debug, sqlx::FromRow)]
pub struct FriendshipRecord {
    pub(crate) requester_id: i64,
    pub(crate) addressee_id: i64,
    pub(crate) status: String,
}

impl TryFrom<FriendshipRecord> for FriendshipEdge {
    type Error = AppError;

    fn try_from(record: FriendshipRecord) -> Result<Self, Self::Error> {
        let status: FriendshipStatus = record.status.parse().map_err(|e: String| {
            tracing::error!(error = %e, "Invalid friendship row");
            AppError::Internal
        })?;
        Ok(Self { requester_id: UserId(record.requester_id), addressee_id: UserId(record.addressee_id), status })
    }
}
