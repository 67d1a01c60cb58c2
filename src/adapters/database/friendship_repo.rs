use crate::adapters::database::records::FriendshipRecord;
use crate::domain::friendship::{FriendshipEdge, FriendshipStatus};
use crate::domain::user::UserId;
use crate::error::Result;
use sqlx::PgConnection;

#[derive(Clone, Debug, Default)]
pub struct FriendshipRepository {}

impl FriendshipRepository {
    #[must_use]
    pub const fn new() -> Self {
        Self {}
    }

    /// Accepted friendships on either side of `user`.
    ///
    /// # Errors
    /// Returns `AppError::Database` if the query fails.
    #[tracing::instrument(level = "debug", skip(self, conn))]
    pub(crate) async fn accepted_for(&self, conn: &mut PgConnection, user: UserId) -> Result<Vec<FriendshipEdge>> {
        let rows = sqlx::query_as::<_, FriendshipRecord>(
            r#"
            SELECT requester_id, addressee_id, status
            FROM friendships
            WHERE status = $2
              AND (requester_id = $1 OR addressee_id = $1)
            "#,
        )
        .bind(user.0)
        .bind(FriendshipStatus::Accepted.as_str())
        .fetch_all(conn)
        .await?;

        rows.into_iter().map(TryInto::try_into).collect()
    }
}
