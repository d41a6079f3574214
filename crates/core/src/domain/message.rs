use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::conversation::ConversationId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderType {
    User,
    Agent,
}

impl SenderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Agent => "agent",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "user" => Some(Self::User),
            "agent" => Some(Self::Agent),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    Text,
    Template,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Template => "template",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "text" => Some(Self::Text),
            "template" => Some(Self::Template),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Sent,
    Delivered,
    Read,
    Failed,
}

impl MessageStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Sent => "sent",
            Self::Delivered => "delivered",
            Self::Read => "read",
            Self::Failed => "failed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(Self::Pending),
            "sent" => Some(Self::Sent),
            "delivered" => Some(Self::Delivered),
            "read" => Some(Self::Read),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Interpretation annotations attached to a stored turn after the model has
/// seen it. All fields optional; absent for plain inbound persistence.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageMetadata {
    pub intent: Option<String>,
    pub sentiment: Option<String>,
    pub tokens_used: Option<u32>,
    pub provider_response_id: Option<String>,
}

impl MessageMetadata {
    pub fn is_empty(&self) -> bool {
        self.intent.is_none()
            && self.sentiment.is_none()
            && self.tokens_used.is_none()
            && self.provider_response_id.is_none()
    }
}

/// One turn in a conversation. Rows are append-only: after insert only
/// `status`, `external_id`, `error` and the metadata block may be backfilled
/// when a send attempt resolves.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: MessageId,
    pub conversation_id: ConversationId,
    pub sender: SenderType,
    pub text: String,
    pub message_type: MessageType,
    /// Channel-assigned id. The dedup key for inbound messages; backfilled
    /// for outbound messages once the channel confirms the send.
    pub external_id: Option<String>,
    pub metadata: MessageMetadata,
    pub status: MessageStatus,
    pub error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Message {
    pub fn inbound(
        conversation_id: ConversationId,
        external_id: impl Into<String>,
        text: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: MessageId(format!("msg-{}", Uuid::new_v4().simple())),
            conversation_id,
            sender: SenderType::User,
            text: text.into(),
            message_type: MessageType::Text,
            external_id: Some(external_id.into()),
            metadata: MessageMetadata::default(),
            status: MessageStatus::Sent,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn outbound(
        conversation_id: ConversationId,
        text: impl Into<String>,
        message_type: MessageType,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: MessageId(format!("msg-{}", Uuid::new_v4().simple())),
            conversation_id,
            sender: SenderType::Agent,
            text: text.into(),
            message_type,
            external_id: None,
            metadata: MessageMetadata::default(),
            status: MessageStatus::Pending,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }
}
