use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use winback_core::domain::conversation::ConversationId;
use winback_core::domain::message::{
    Message, MessageId, MessageMetadata, MessageStatus, MessageType, SenderType,
};

use super::{MessageRepository, RepositoryError};
use crate::DbPool;

pub struct SqlMessageRepository {
    pool: DbPool,
}

impl SqlMessageRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl MessageRepository for SqlMessageRepository {
    async fn find_by_id(&self, id: &MessageId) -> Result<Option<Message>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                id,
                conversation_id,
                sender,
                text,
                message_type,
                external_id,
                metadata_json,
                status,
                error,
                created_at,
                updated_at
             FROM messages
             WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(message_from_row).transpose()
    }

    async fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Message>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                id,
                conversation_id,
                sender,
                text,
                message_type,
                external_id,
                metadata_json,
                status,
                error,
                created_at,
                updated_at
             FROM messages
             WHERE external_id = ?",
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(message_from_row).transpose()
    }

    async fn save(&self, message: Message) -> Result<(), RepositoryError> {
        let metadata_json = encode_metadata(&message.metadata)?;

        sqlx::query(
            "INSERT INTO messages (
                id,
                conversation_id,
                sender,
                text,
                message_type,
                external_id,
                metadata_json,
                status,
                error,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                external_id = excluded.external_id,
                metadata_json = excluded.metadata_json,
                status = excluded.status,
                error = excluded.error,
                updated_at = excluded.updated_at",
        )
        .bind(&message.id.0)
        .bind(&message.conversation_id.0)
        .bind(message.sender.as_str())
        .bind(&message.text)
        .bind(message.message_type.as_str())
        .bind(message.external_id.as_deref())
        .bind(metadata_json)
        .bind(message.status.as_str())
        .bind(message.error.as_deref())
        .bind(message.created_at.to_rfc3339())
        .bind(message.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_recent(
        &self,
        conversation_id: &ConversationId,
        limit: u32,
    ) -> Result<Vec<Message>, RepositoryError> {
        let rows = sqlx::query(
            "SELECT
                id,
                conversation_id,
                sender,
                text,
                message_type,
                external_id,
                metadata_json,
                status,
                error,
                created_at,
                updated_at
             FROM messages
             WHERE conversation_id = ?
             ORDER BY created_at DESC, id DESC
             LIMIT ?",
        )
        .bind(&conversation_id.0)
        .bind(i64::from(limit))
        .fetch_all(&self.pool)
        .await?;

        let mut messages = rows
            .into_iter()
            .map(message_from_row)
            .collect::<Result<Vec<Message>, RepositoryError>>()?;
        messages.reverse();
        Ok(messages)
    }
}

fn message_from_row(row: SqliteRow) -> Result<Message, RepositoryError> {
    let sender_raw = row.try_get::<String, _>("sender")?;
    let sender = SenderType::parse(&sender_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown sender type `{sender_raw}`")))?;

    let type_raw = row.try_get::<String, _>("message_type")?;
    let message_type = MessageType::parse(&type_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown message type `{type_raw}`")))?;

    let status_raw = row.try_get::<String, _>("status")?;
    let status = MessageStatus::parse(&status_raw)
        .ok_or_else(|| RepositoryError::Decode(format!("unknown message status `{status_raw}`")))?;

    Ok(Message {
        id: MessageId(row.try_get("id")?),
        conversation_id: ConversationId(row.try_get("conversation_id")?),
        sender,
        text: row.try_get("text")?,
        message_type,
        external_id: row.try_get("external_id")?,
        metadata: decode_metadata(row.try_get("metadata_json")?)?,
        status,
        error: row.try_get("error")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

fn encode_metadata(metadata: &MessageMetadata) -> Result<Option<String>, RepositoryError> {
    if metadata.is_empty() {
        return Ok(None);
    }

    serde_json::to_string(metadata)
        .map(Some)
        .map_err(|error| RepositoryError::Decode(format!("invalid message metadata: {error}")))
}

fn decode_metadata(value: Option<String>) -> Result<MessageMetadata, RepositoryError> {
    match value {
        Some(json) => serde_json::from_str(&json).map_err(|error| {
            RepositoryError::Decode(format!("invalid metadata_json: `{json}` ({error})"))
        }),
        None => Ok(MessageMetadata::default()),
    }
}

fn parse_timestamp(column: &str, value: String) -> Result<DateTime<Utc>, RepositoryError> {
    DateTime::parse_from_rfc3339(&value).map(|timestamp| timestamp.with_timezone(&Utc)).map_err(
        |error| {
            RepositoryError::Decode(format!("invalid timestamp in `{column}`: `{value}` ({error})"))
        },
    )
}

#[cfg(test)]
mod tests {
    use chrono::{DateTime, Utc};

    use winback_core::domain::conversation::ConversationId;
    use winback_core::domain::message::{
        Message, MessageId, MessageMetadata, MessageStatus, MessageType, SenderType,
    };

    use super::SqlMessageRepository;
    use crate::migrations;
    use crate::repositories::MessageRepository;
    use crate::{connect_with_settings, DbPool};

    #[tokio::test]
    async fn sql_message_repo_round_trip() {
        let pool = setup_pool().await;
        let conversation_id = ConversationId("conv-msg-001".to_string());
        insert_conversation_tree(&pool, &conversation_id, "usr-msg-001", "ab-msg-001", "+5511999887766")
            .await;

        let repo = SqlMessageRepository::new(pool.clone());
        let mut message = sample_message(
            "msg-rt-001",
            &conversation_id,
            SenderType::User,
            "2026-02-23T12:00:00Z",
        );
        message.external_id = Some("wamid.rt.1".to_string());
        message.metadata = MessageMetadata {
            intent: Some("interested".to_string()),
            sentiment: Some("positive".to_string()),
            tokens_used: Some(184),
            provider_response_id: Some("resp-1".to_string()),
        };

        repo.save(message.clone()).await.expect("save message");

        let by_id = repo.find_by_id(&message.id).await.expect("find by id");
        assert_eq!(by_id, Some(message.clone()));

        let by_external = repo.find_by_external_id("wamid.rt.1").await.expect("find by external");
        assert_eq!(by_external, Some(message));

        pool.close().await;
    }

    #[tokio::test]
    async fn save_backfills_delivery_outcome_without_touching_the_text() {
        let pool = setup_pool().await;
        let conversation_id = ConversationId("conv-msg-002".to_string());
        insert_conversation_tree(&pool, &conversation_id, "usr-msg-002", "ab-msg-002", "+5511988776655")
            .await;

        let repo = SqlMessageRepository::new(pool.clone());
        let mut message = sample_message(
            "msg-bf-001",
            &conversation_id,
            SenderType::Agent,
            "2026-02-23T12:00:00Z",
        );
        message.status = MessageStatus::Pending;
        repo.save(message.clone()).await.expect("save pending message");

        message.status = MessageStatus::Sent;
        message.external_id = Some("wamid.bf.1".to_string());
        message.text = "tampered".to_string();
        message.updated_at = parse_ts("2026-02-23T12:01:00Z");
        repo.save(message.clone()).await.expect("backfill message");

        let found = repo.find_by_id(&message.id).await.expect("find").expect("exists");
        assert_eq!(found.status, MessageStatus::Sent);
        assert_eq!(found.external_id.as_deref(), Some("wamid.bf.1"));
        // Rows are append-only: the original text survives a stale snapshot
        assert_eq!(found.text, "oi, ainda tem o produto?");

        pool.close().await;
    }

    #[tokio::test]
    async fn duplicate_external_id_is_rejected_by_the_schema() {
        let pool = setup_pool().await;
        let conversation_id = ConversationId("conv-msg-003".to_string());
        insert_conversation_tree(&pool, &conversation_id, "usr-msg-003", "ab-msg-003", "+5511977665544")
            .await;

        let repo = SqlMessageRepository::new(pool.clone());
        let mut first = sample_message(
            "msg-dup-001",
            &conversation_id,
            SenderType::User,
            "2026-02-23T12:00:00Z",
        );
        first.external_id = Some("wamid.dup.1".to_string());
        repo.save(first).await.expect("save first");

        let mut second = sample_message(
            "msg-dup-002",
            &conversation_id,
            SenderType::User,
            "2026-02-23T12:00:05Z",
        );
        second.external_id = Some("wamid.dup.1".to_string());
        let result = repo.save(second).await;
        assert!(result.is_err(), "duplicate external_id must violate idx_messages_external_id");

        pool.close().await;
    }

    #[tokio::test]
    async fn list_recent_returns_the_newest_window_in_order() {
        let pool = setup_pool().await;
        let conversation_id = ConversationId("conv-msg-004".to_string());
        insert_conversation_tree(&pool, &conversation_id, "usr-msg-004", "ab-msg-004", "+5511966554433")
            .await;

        let repo = SqlMessageRepository::new(pool.clone());
        for (index, minute) in [0u32, 1, 2, 3].iter().enumerate() {
            let message = sample_message(
                &format!("msg-hist-{index}"),
                &conversation_id,
                if index % 2 == 0 { SenderType::User } else { SenderType::Agent },
                &format!("2026-02-23T12:0{minute}:00Z"),
            );
            repo.save(message).await.expect("save history message");
        }

        let recent = repo.list_recent(&conversation_id, 3).await.expect("list recent");

        let ids: Vec<&str> = recent.iter().map(|message| message.id.0.as_str()).collect();
        assert_eq!(ids, vec!["msg-hist-1", "msg-hist-2", "msg-hist-3"]);

        pool.close().await;
    }

    async fn setup_pool() -> DbPool {
        let pool = connect_with_settings("sqlite::memory:", 1, 30)
            .await
            .expect("connect test pool");
        migrations::run_pending(&pool).await.expect("run migrations");
        pool
    }

    async fn insert_conversation_tree(
        pool: &DbPool,
        conversation_id: &ConversationId,
        user_id: &str,
        abandonment_id: &str,
        address: &str,
    ) {
        let timestamp = "2026-02-23T11:00:00Z";

        sqlx::query(
            "INSERT INTO users (id, address, opted_out, created_at, updated_at)
             VALUES (?, ?, 0, ?, ?)",
        )
        .bind(user_id)
        .bind(address)
        .bind(timestamp)
        .bind(timestamp)
        .execute(pool)
        .await
        .expect("insert user");

        sqlx::query(
            "INSERT INTO abandonments (
                id, user_id, external_id, product_name, cart_value, currency,
                status, created_at, updated_at
             ) VALUES (?, ?, ?, 'Trail Runner Shoes', '349.90', 'BRL', 'pending', ?, ?)",
        )
        .bind(abandonment_id)
        .bind(user_id)
        .bind(format!("EXT-{abandonment_id}"))
        .bind(timestamp)
        .bind(timestamp)
        .execute(pool)
        .await
        .expect("insert abandonment");

        sqlx::query(
            "INSERT INTO conversations (
                id, abandonment_id, user_id, status, cycle_count, message_count,
                created_at, updated_at
             ) VALUES (?, ?, ?, 'awaiting_response', 1, 0, ?, ?)",
        )
        .bind(&conversation_id.0)
        .bind(abandonment_id)
        .bind(user_id)
        .bind(timestamp)
        .bind(timestamp)
        .execute(pool)
        .await
        .expect("insert conversation");
    }

    fn sample_message(
        id: &str,
        conversation_id: &ConversationId,
        sender: SenderType,
        created_at: &str,
    ) -> Message {
        Message {
            id: MessageId(id.to_string()),
            conversation_id: conversation_id.clone(),
            sender,
            text: "oi, ainda tem o produto?".to_string(),
            message_type: MessageType::Text,
            external_id: None,
            metadata: MessageMetadata::default(),
            status: MessageStatus::Sent,
            error: None,
            created_at: parse_ts(created_at),
            updated_at: parse_ts(created_at),
        }
    }

    fn parse_ts(value: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(value).expect("valid rfc3339").with_timezone(&Utc)
    }
}
