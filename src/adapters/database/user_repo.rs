use crate::adapters::database::records::{AccountRecord, PresenceRow};
use crate::domain::presence::PresenceRecord;
use crate::domain::user::{Account, AccountId, UserId};
use crate::error::{AppError, Result};
use sqlx::PgConnection;
use time::OffsetDateTime;

#[derive(Clone, Debug, Default)]
pub struct UserRepository {}

impl UserRepository {
    #[must_use]
    pub const fn new() -> Self {
        Self {}
    }

    /// Stamps the user's heartbeat. An older `at` never moves it backwards.
    ///
    /// # Errors
    /// Returns `AppError::Database` if the update fails.
    #[tracing::instrument(level = "debug", skip(self, conn))]
    pub(crate) async fn touch(&self, conn: &mut PgConnection, user: UserId, at: OffsetDateTime) -> Result<u64> {
        let result = sqlx::query("UPDATE users SET last_active = GREATEST(COALESCE(last_active, $2), $2) WHERE id = $1")
            .bind(user.0)
            .bind(at)
            .execute(conn)
            .await?;
        Ok(result.rows_affected())
    }

    /// # Errors
    /// Returns `AppError::Database` if the query fails.
    #[tracing::instrument(level = "debug", skip(self, conn, users), fields(count = users.len()))]
    pub(crate) async fn fetch_last_active(
        &self,
        conn: &mut PgConnection,
        users: &[UserId],
    ) -> Result<Vec<PresenceRecord>> {
        if users.is_empty() {
            return Ok(Vec::new());
        }
        let ids: Vec<i64> = users.iter().map(|id| id.0).collect();
        let rows = sqlx::query_as::<_, PresenceRow>("SELECT id, last_active FROM users WHERE id = ANY($1)")
            .bind(ids)
            .fetch_all(conn)
            .await?;
        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// # Errors
    /// Returns `AppError::NotFound` if the account does not exist.
    #[tracing::instrument(level = "debug", skip(self, conn))]
    pub(crate) async fn find_account(&self, conn: &mut PgConnection, id: AccountId) -> Result<Account> {
        let record =
            sqlx::query_as::<_, AccountRecord>("SELECT id, last_active_user_id FROM accounts WHERE id = $1")
                .bind(id.0)
                .fetch_optional(conn)
                .await?;
        record.map(Into::into).ok_or(AppError::NotFound)
    }

    /// # Errors
    /// Returns `AppError::Database` if the query fails.
    #[tracing::instrument(level = "debug", skip(self, conn))]
    pub(crate) async fn first_profile(&self, conn: &mut PgConnection, id: AccountId) -> Result<Option<UserId>> {
        let user = sqlx::query_scalar::<_, i64>("SELECT id FROM users WHERE account_id = $1 ORDER BY id ASC LIMIT 1")
            .bind(id.0)
            .fetch_optional(conn)
            .await?;
        Ok(user.map(UserId))
    }

    /// # Errors
    /// Returns `AppError::NotFound` if the account does not exist.
    #[tracing::instrument(level = "debug", skip(self, conn))]
    pub(crate) async fn set_last_active_user(
        &self,
        conn: &mut PgConnection,
        id: AccountId,
        user: UserId,
    ) -> Result<()> {
        let result = sqlx::query("UPDATE accounts SET last_active_user_id = $2 WHERE id = $1")
            .bind(id.0)
            .bind(user.0)
            .execute(conn)
            .await?;
        if result.rows_affected() == 0 {
            return Err(AppError::NotFound);
        }
        Ok(())
    }
}
