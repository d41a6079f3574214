use chrono::{DateTime, Utc};
use sqlx::{sqlite::SqliteRow, Row};

use winback_core::domain::user::{User, UserId};

use super::{RepositoryError, UserRepository};
use crate::DbPool;

pub struct SqlUserRepository {
    pool: DbPool,
}

impl SqlUserRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl UserRepository for SqlUserRepository {
    async fn find_by_id(&self, id: &UserId) -> Result<Option<User>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                id,
                address,
                display_name,
                opted_out,
                opted_out_at,
                opted_out_reason,
                created_at,
                updated_at
             FROM users
             WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(user_from_row).transpose()
    }

    async fn find_by_address(&self, address: &str) -> Result<Option<User>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                id,
                address,
                display_name,
                opted_out,
                opted_out_at,
                opted_out_reason,
                created_at,
                updated_at
             FROM users
             WHERE address = ?",
        )
        .bind(address)
        .fetch_optional(&self.pool)
        .await?;

        row.map(user_from_row).transpose()
    }

    async fn upsert_by_address(&self, user: User) -> Result<User, RepositoryError> {
        sqlx::query(
            "INSERT INTO users (
                id,
                address,
                display_name,
                opted_out,
                opted_out_at,
                opted_out_reason,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(address) DO UPDATE SET
                display_name = COALESCE(excluded.display_name, users.display_name),
                updated_at = excluded.updated_at",
        )
        .bind(&user.id.0)
        .bind(&user.address)
        .bind(user.display_name.as_deref())
        .bind(user.opted_out)
        .bind(user.opted_out_at.map(|value| value.to_rfc3339()))
        .bind(user.opted_out_reason.as_deref())
        .bind(user.created_at.to_rfc3339())
        .bind(user.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        self.find_by_address(&user.address).await?.ok_or_else(|| {
            RepositoryError::Decode(format!("user row missing after upsert for `{}`", user.address))
        })
    }

    async fn save(&self, user: User) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO users (
                id,
                address,
                display_name,
                opted_out,
                opted_out_at,
                opted_out_reason,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                address = excluded.address,
                display_name = excluded.display_name,
                opted_out = excluded.opted_out,
                opted_out_at = excluded.opted_out_at,
                opted_out_reason = excluded.opted_out_reason,
                updated_at = excluded.updated_at",
        )
        .bind(&user.id.0)
        .bind(&user.address)
        .bind(user.display_name.as_deref())
        .bind(user.opted_out)
        .bind(user.opted_out_at.map(|value| value.to_rfc3339()))
        .bind(user.opted_out_reason.as_deref())
        .bind(user.created_at.to_rfc3339())
        .bind(user.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn user_from_row(row: SqliteRow) -> Result<User, RepositoryError> {
    Ok(User {
        id: UserId(row.try_get("id")?),
        address: row.try_get("address")?,
        display_name: row.try_get("display_name")?,
        opted_out: row.try_get("opted_out")?,
        opted_out_at: parse_optional_timestamp("opted_out_at", row.try_get("opted_out_at")?)?,
        opted_out_reason: row.try_get("opted_out_reason")?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
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
