use std::fmt;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::user::UserId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct AbandonmentId(pub String);

impl fmt::Display for AbandonmentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AbandonmentStatus {
    Pending,
    Converted,
    Declined,
}

impl AbandonmentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Converted => "converted",
            Self::Declined => "declined",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "converted" => Some(Self::Converted),
            "declined" => Some(Self::Declined),
            _ => None,
        }
    }
}

/// One cart-abandonment occurrence from the upstream commerce system.
///
/// `external_id` is the idempotency key: at most one row per external id.
/// Product and value fields are immutable after insert; the payment fields
/// are written once by payment reconciliation.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Abandonment {
    pub id: AbandonmentId,
    pub user_id: UserId,
    pub external_id: String,
    pub product_name: String,
    pub product_url: Option<String>,
    pub cart_value: Decimal,
    pub currency: String,
    pub status: AbandonmentStatus,
    pub payment_id: Option<String>,
    pub payment_amount: Option<Decimal>,
    pub payment_currency: Option<String>,
    pub converted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Abandonment {
    pub fn new(
        user_id: UserId,
        external_id: impl Into<String>,
        product_name: impl Into<String>,
        product_url: Option<String>,
        cart_value: Decimal,
        currency: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: AbandonmentId(format!("ab-{}", Uuid::new_v4().simple())),
            user_id,
            external_id: external_id.into(),
            product_name: product_name.into(),
            product_url,
            cart_value,
            currency: currency.into(),
            status: AbandonmentStatus::Pending,
            payment_id: None,
            payment_amount: None,
            payment_currency: None,
            converted_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Customer-facing rendering of the cart value, e.g. `R$ 349,90`.
    pub fn display_value(&self) -> String {
        format_cart_value(&self.cart_value, &self.currency)
    }
}

pub fn format_cart_value(value: &Decimal, currency: &str) -> String {
    match currency.to_ascii_uppercase().as_str() {
        "BRL" => format!("R$ {}", value.to_string().replace('.', ",")),
        other => format!("{other} {value}"),
    }
}
