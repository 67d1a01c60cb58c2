use crate::adapters::database::records::MessageRecord;
use crate::domain::message::{ConversationKey, Message, MessageId, NewMessage};
use crate::domain::user::UserId;
use crate::error::{AppError, Result};
use sqlx::PgConnection;

const COLUMNS: &str = "id, sender_id, recipient_id, content, inserted_at, is_read";

#[derive(Clone, Debug, Default)]
pub struct MessageRepository {}

impl MessageRepository {
    #[must_use]
    pub const fn new() -> Self {
        Self {}
    }

    /// Fetches the whole two-party conversation, oldest first.
    ///
    /// # Errors
    /// Returns `AppError::Database` if the query fails.
    #[tracing::instrument(level = "debug", skip(self, conn), fields(conversation = %key))]
    pub(crate) async fn fetch_conversation(
        &self,
        conn: &mut PgConnection,
        key: ConversationKey,
    ) -> Result<Vec<Message>> {
        let (a, b) = key.members();
        let rows = sqlx::query_as::<_, MessageRecord>(&format!(
            r#"
            SELECT {COLUMNS}
            FROM messages
            WHERE (sender_id = $1 AND recipient_id = $2)
               OR (sender_id = $2 AND recipient_id = $1)
            ORDER BY inserted_at ASC, id ASC
            "#
        ))
        .bind(a.0)
        .bind(b.0)
        .fetch_all(conn)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Fetches every message between `user` and any of `friends`, newest first.
    ///
    /// # Errors
    /// Returns `AppError::Database` if the query fails.
    #[tracing::instrument(level = "debug", skip(self, conn, friends), fields(friend_count = friends.len()))]
    pub(crate) async fn fetch_involving(
        &self,
        conn: &mut PgConnection,
        user: UserId,
        friends: &[UserId],
    ) -> Result<Vec<Message>> {
        if friends.is_empty() {
            return Ok(Vec::new());
        }
        let friend_ids: Vec<i64> = friends.iter().map(|id| id.0).collect();
        let rows = sqlx::query_as::<_, MessageRecord>(&format!(
            r#"
            SELECT {COLUMNS}
            FROM messages
            WHERE (sender_id = $1 AND recipient_id = ANY($2))
               OR (recipient_id = $1 AND sender_id = ANY($2))
            ORDER BY inserted_at DESC, id DESC
            "#
        ))
        .bind(user.0)
        .bind(friend_ids)
        .fetch_all(conn)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Inserts a message, returning the committed row.
    ///
    /// # Errors
    /// Returns `AppError::NotFound` if either endpoint does not exist.
    /// Returns `AppError::Database` if the insert fails.
    #[tracing::instrument(level = "debug", skip(self, conn, message), fields(recipient_id = %message.recipient_id))]
    pub(crate) async fn create(&self, conn: &mut PgConnection, message: NewMessage) -> Result<Message> {
        let result = sqlx::query_as::<_, MessageRecord>(&format!(
            r#"
            INSERT INTO messages (sender_id, recipient_id, content)
            VALUES ($1, $2, $3)
            RETURNING {COLUMNS}
            "#
        ))
        .bind(message.sender_id.0)
        .bind(message.recipient_id.0)
        .bind(message.content)
        .fetch_one(conn)
        .await;

        match result {
            Ok(record) => Ok(record.into()),
            Err(sqlx::Error::Database(e)) if e.code().as_deref() == Some("23503") => {
                // Foreign key violation: sender or recipient does not exist
                Err(AppError::NotFound)
            }
            Err(e) => Err(AppError::Database(e)),
        }
    }

    /// Marks every unread message from `sender` to `recipient` read, returning the changed rows.
    ///
    /// # Errors
    /// Returns `AppError::Database` if the update fails.
    #[tracing::instrument(level = "debug", skip(self, conn))]
    pub(crate) async fn mark_conversation_read(
        &self,
        conn: &mut PgConnection,
        sender: UserId,
        recipient: UserId,
    ) -> Result<Vec<Message>> {
        let rows = sqlx::query_as::<_, MessageRecord>(&format!(
            r#"
            UPDATE messages
            SET is_read = TRUE
            WHERE sender_id = $1 AND recipient_id = $2 AND is_read = FALSE
            RETURNING {COLUMNS}
            "#
        ))
        .bind(sender.0)
        .bind(recipient.0)
        .fetch_all(conn)
        .await?;

        Ok(rows.into_iter().map(Into::into).collect())
    }

    /// Marks one message read. Returns the row only if it changed.
    ///
    /// # Errors
    /// Returns `AppError::Database` if the update fails.
    #[tracing::instrument(level = "debug", skip(self, conn))]
    pub(crate) async fn mark_read(&self, conn: &mut PgConnection, id: MessageId) -> Result<Option<Message>> {
        let row = sqlx::query_as::<_, MessageRecord>(&format!(
            r#"
            UPDATE messages
            SET is_read = TRUE
            WHERE id = $1 AND is_read = FALSE
            RETURNING {COLUMNS}
            "#
        ))
        .bind(id.0)
        .fetch_optional(conn)
        .await?;

        Ok(row.map(Into::into))
    }
}
