use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::abandonment::AbandonmentId;
use crate::domain::user::UserId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(pub String);

impl fmt::Display for ConversationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConversationStatus {
    AwaitingResponse,
    Active,
    Closed,
    Error,
}

impl ConversationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AwaitingResponse => "awaiting_response",
            Self::Active => "active",
            Self::Closed => "closed",
            Self::Error => "error",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "awaiting_response" => Some(Self::AwaitingResponse),
            "active" => Some(Self::Active),
            "closed" => Some(Self::Closed),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// The stateful dialogue tied 1:1 to an abandonment.
///
/// `cycle_count` counts agent-initiated engagement rounds and never exceeds
/// the configured maximum; `message_count` counts stored turns in either
/// direction. `last_user_message_at` anchors the messaging window.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ConversationId,
    pub abandonment_id: AbandonmentId,
    pub user_id: UserId,
    pub status: ConversationStatus,
    pub status_reason: Option<String>,
    pub cycle_count: u32,
    pub message_count: u32,
    pub last_message_at: Option<DateTime<Utc>>,
    pub last_user_message_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn new(abandonment_id: AbandonmentId, user_id: UserId) -> Self {
        let now = Utc::now();
        Self {
            id: ConversationId(format!("conv-{}", Uuid::new_v4().simple())),
            abandonment_id,
            user_id,
            status: ConversationStatus::AwaitingResponse,
            status_reason: None,
            cycle_count: 0,
            message_count: 0,
            last_message_at: None,
            last_user_message_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Timestamp the messaging window is measured from: the customer's last
    /// message when there is one, conversation creation otherwise.
    pub fn window_reference(&self) -> DateTime<Utc> {
        self.last_user_message_at.unwrap_or(self.created_at)
    }
}
