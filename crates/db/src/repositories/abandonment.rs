use std::str::FromStr;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::{sqlite::SqliteRow, Row};

use winback_core::domain::abandonment::{Abandonment, AbandonmentId, AbandonmentStatus};
use winback_core::domain::user::UserId;

use super::{AbandonmentRepository, RepositoryError};
use crate::DbPool;

pub struct SqlAbandonmentRepository {
    pool: DbPool,
}

impl SqlAbandonmentRepository {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }
}

#[async_trait::async_trait]
impl AbandonmentRepository for SqlAbandonmentRepository {
    async fn find_by_id(&self, id: &AbandonmentId) -> Result<Option<Abandonment>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                id,
                user_id,
                external_id,
                product_name,
                product_url,
                cart_value,
                currency,
                status,
                payment_id,
                payment_amount,
                payment_currency,
                converted_at,
                created_at,
                updated_at
             FROM abandonments
             WHERE id = ?",
        )
        .bind(&id.0)
        .fetch_optional(&self.pool)
        .await?;

        row.map(abandonment_from_row).transpose()
    }

    async fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Abandonment>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                id,
                user_id,
                external_id,
                product_name,
                product_url,
                cart_value,
                currency,
                status,
                payment_id,
                payment_amount,
                payment_currency,
                converted_at,
                created_at,
                updated_at
             FROM abandonments
             WHERE external_id = ?",
        )
        .bind(external_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(abandonment_from_row).transpose()
    }

    async fn find_by_payment_id(
        &self,
        payment_id: &str,
    ) -> Result<Option<Abandonment>, RepositoryError> {
        let row = sqlx::query(
            "SELECT
                id,
                user_id,
                external_id,
                product_name,
                product_url,
                cart_value,
                currency,
                status,
                payment_id,
                payment_amount,
                payment_currency,
                converted_at,
                created_at,
                updated_at
             FROM abandonments
             WHERE payment_id = ?",
        )
        .bind(payment_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(abandonment_from_row).transpose()
    }

    async fn save(&self, abandonment: Abandonment) -> Result<(), RepositoryError> {
        sqlx::query(
            "INSERT INTO abandonments (
                id,
                user_id,
                external_id,
                product_name,
                product_url,
                cart_value,
                currency,
                status,
                payment_id,
                payment_amount,
                payment_currency,
                converted_at,
                created_at,
                updated_at
             ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                user_id = excluded.user_id,
                external_id = excluded.external_id,
                product_name = excluded.product_name,
                product_url = excluded.product_url,
                cart_value = excluded.cart_value,
                currency = excluded.currency,
                status = excluded.status,
                payment_id = excluded.payment_id,
                payment_amount = excluded.payment_amount,
                payment_currency = excluded.payment_currency,
                converted_at = excluded.converted_at,
                updated_at = excluded.updated_at",
        )
        .bind(&abandonment.id.0)
        .bind(&abandonment.user_id.0)
        .bind(&abandonment.external_id)
        .bind(&abandonment.product_name)
        .bind(abandonment.product_url.as_deref())
        .bind(abandonment.cart_value.to_string())
        .bind(&abandonment.currency)
        .bind(abandonment.status.as_str())
        .bind(abandonment.payment_id.as_deref())
        .bind(abandonment.payment_amount.map(|value| value.to_string()))
        .bind(abandonment.payment_currency.as_deref())
        .bind(abandonment.converted_at.map(|value| value.to_rfc3339()))
        .bind(abandonment.created_at.to_rfc3339())
        .bind(abandonment.updated_at.to_rfc3339())
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn abandonment_from_row(row: SqliteRow) -> Result<Abandonment, RepositoryError> {
    let status_raw = row.try_get::<String, _>("status")?;
    let status = AbandonmentStatus::parse(&status_raw).ok_or_else(|| {
        RepositoryError::Decode(format!("unknown abandonment status `{status_raw}`"))
    })?;

    Ok(Abandonment {
        id: AbandonmentId(row.try_get("id")?),
        user_id: UserId(row.try_get("user_id")?),
        external_id: row.try_get("external_id")?,
        product_name: row.try_get("product_name")?,
        product_url: row.try_get("product_url")?,
        cart_value: parse_decimal("cart_value", row.try_get("cart_value")?)?,
        currency: row.try_get("currency")?,
        status,
        payment_id: row.try_get("payment_id")?,
        payment_amount: parse_optional_decimal("payment_amount", row.try_get("payment_amount")?)?,
        payment_currency: row.try_get("payment_currency")?,
        converted_at: parse_optional_timestamp("converted_at", row.try_get("converted_at")?)?,
        created_at: parse_timestamp("created_at", row.try_get("created_at")?)?,
        updated_at: parse_timestamp("updated_at", row.try_get("updated_at")?)?,
    })
}

fn parse_decimal(column: &str, value: String) -> Result<Decimal, RepositoryError> {
    Decimal::from_str(&value).map_err(|error| {
        RepositoryError::Decode(format!("invalid decimal in `{column}`: `{value}` ({error})"))
    })
}

fn parse_optional_decimal(
    column: &str,
    value: Option<String>,
) -> Result<Option<Decimal>, RepositoryError> {
    value.map(|decimal| parse_decimal(column, decimal)).transpose()
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
