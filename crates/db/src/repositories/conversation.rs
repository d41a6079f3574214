use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use winback_core::domain::abandonment::AbandonmentId;
use winback_core::domain::conversation::{Conversation, ConversationId, ConversationStatus};
use winback_core::domain::user::UserId;
use winback_core::lifecycle;

use super::{ConversationRepository, RepositoryError};
use crate::DbPool;

pub struct SqlConversationRepository {
    pool: DbPool,
}

impl SqlConversationRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl ConversationRepository for SqlConversationRepository {
    async fn find_by_id(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                id,
                abandonment_id,
                user_id,
                status,
                status_reason,
                cycle_count,
                message_count,
                last_message_at,
                last_user_message_at,
                created_at,
                updated_at
             FROM conversations
             WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(conversation_from_row).transpose()
    }

    async fn find_by_abandonment_id(
        &self,
        abandonment_id: &AbandonmentId,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                id,
                abandonment_id,
                user_id,
                status,
                status_reason,
                cycle_count,
                message_count,
                last_message_at,
                last_user_message_at,
                created_at,
                updated_at
             FROM conversations
             WHERE abandonment_id = ?
             ORDER BY created_at DESC
             LIMIT 1",
        )
        .bind(&abandonment_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(conversation_from_row).transpose()
    }

    async fn find_latest_by_user(
        &self,
        user_id: &UserId,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                id,
                abandonment_id,
                user_id,
                status,
                status_reason,
                cycle_count,
                message_count,
                last_message_at,
                last_user_message_at,
                created_at,
                updated_at
             FROM conversations
             WHERE user_id = ?
             ORDER BY created_at DESC
             LIMIT 1",
        )
        .bind(&user_id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(conversation_from_row).transpose()
    }

    async fn save(&self, conversation: Conversation) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO conversations (
                id,
                abandonment_id,
                user_id,
                status,
                status_reason,
                cycle_count,
                message_count,
                last_message_at,
                last_user_message_at,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                abandonment_id = excluded.abandonment_id,
                user_id = excluded.user_id,
                cycle_count = excluded.cycle_count,
                message_count = excluded.message_count,
                last_message_at = excluded.last_message_at,
                last_user_message_at = excluded.last_user_message_at,
                updated_at = excluded.updated_at",
        )
        .bind(&conversation.id.0)
        .bind(&conversation.abandonment_id.0)
        .bind(&conversation.user_id.0)
        .bind(conversation.status.as_str())
        .bind(conversation.status_reason.as_deref())
        .bind(i64::from(conversation.cycle_count))
        .bind(i64::from(conversation.message_count))
        .bind(conversation.last_message_at.map(|value| value.to_rfc3339()))
        .bind(conversation.last_user_message_at.map(|value| value.to_rfc3339()))
        .bind(conversation.created_at.to_rfc3339())
        .bind(conversation.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn transition_status(
        &self,
        id: &ConversationId,
        from: ConversationStatus,
        to: ConversationStatus,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        lifecycle::validate_transition(from, to)?;

        let result = sqlx::query(
            "UPDATE conversations
             SET status = ?, status_reason = ?, updated_at = ?
             WHERE id = ? AND status = ?",
        )
        .bind(to.as_str())
        .bind(reason)
        .bind(at.to_rfc3339())
        .bind(&id.0)
        .bind(from.as_str())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

fn conversation_from_row(row: SqliteRow) -> Result<Conversation, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = ConversationStatus::parse(&status_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown conversation status `{status_raw}`"))
    })?;

    Ok(Conversation {
        id: ConversationId(row.try_get("id")?),
        abandonment_id: AbandonmentId(row.try_get("abandonment_id")?),
        user_id: UserId(row.try_get("user_id")?),
        status,
        status_reason: row.try_get("status_reason")?,
        cycle_count: parse_u32("cycle_count", row.try_get("cycle_count")?)?,
        message_count: parse_u32("message_count", row.try_get("message_count")?)?,
        last_message_at: parse_optional_timestamp(
            "last_message_at",
            row.try_get("last_message_at")?,
        )?,
        last_user_message_at: parse_optional_timestamp(
            "last_user_message_at",
            row.try_get("last_user_message_at")?,
        )?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

fn parse_u32(column: &str, value: i64) -> Result<u32, RepositoryError> {
    u32::try_from(value).map_err(|_| {
        RepositoryError::Decode(format!(
            "invalid value for `{column}` (expected non-negative u32): {value}"
        ))
    })
}

fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

fn parse_optional_timestamp(
    column: &str,
    value: Option<String>,
) -> Result<Option<DateTime<Utc>>, RepositoryError> {
    value.map(|timestamp| parse_timestamp(column, timestamp)).transpose()
}
