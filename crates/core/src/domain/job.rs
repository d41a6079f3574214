use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::domain::conversation::ConversationId;
use crate::domain::message::MessageId;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
    InboundMessage,
    OutboundDelivery,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InboundMessage => "inbound_message",
            Self::OutboundDelivery => "outbound_delivery",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "inbound_message" => Some(Self::InboundMessage),
            "outbound_delivery" => Some(Self::OutboundDelivery),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    Queued,
    Running,
    RetryableFailed,
    FailedTerminal,
    Completed,
}

impl JobState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::RetryableFailed => "retryable_failed",
            Self::FailedTerminal => "failed_terminal",
            Self::Completed => "completed",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "queued" => Some(Self::Queued),
            "running" => Some(Self::Running),
            "retryable_failed" => Some(Self::RetryableFailed),
            "failed_terminal" => Some(Self::FailedTerminal),
            "completed" => Some(Self::Completed),
            _ => None,
        }
    }

    pub fn is_settled(&self) -> bool {
        matches!(self, Self::FailedTerminal | Self::Completed)
    }
}

/// One durable unit of queued work. The payload is stored as JSON and
/// deserialized into [`InboundJob`] or [`DeliveryJob`] according to `kind`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueJob {
    pub id: JobId,
    pub kind: JobKind,
    pub conversation_id: Option<ConversationId>,
    pub payload_json: String,
    /// Hash of `payload_json`; duplicate-enqueue guard while a job with the
    /// same payload is still unsettled.
    pub payload_hash: String,
    pub state: JobState,
    pub attempt_count: u32,
    pub max_attempts: u32,
    pub available_at: DateTime<Utc>,
    pub claimed_by: Option<String>,
    pub claimed_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub state_version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl QueueJob {
    pub fn remaining_attempts(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempt_count)
    }
}

/// Payload for one inbound webhook delivery awaiting pipeline processing.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundJob {
    pub conversation_id: Option<ConversationId>,
    pub external_message_id: String,
    pub recipient_address: String,
    pub text: String,
    pub trace_id: String,
}

/// Body of an outbound message as carried by a delivery job.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundContent {
    Text { text: String },
    Template { name: String, params: BTreeMap<String, String> },
}

impl OutboundContent {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }
}

/// Payload for one durable outbound send. The referenced message row is the
/// source of truth for delivery state; the job only drives it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryJob {
    pub conversation_id: ConversationId,
    pub recipient_address: String,
    pub message_id: MessageId,
    pub content: OutboundContent,
    /// Agent-initiated outreach (counts toward the cycle bound) as opposed
    /// to a reply to an inbound message.
    pub proactive: bool,
    pub trace_id: String,
}

/// Operational counters for one queue, bucketed the way operators expect to
/// read them: `waiting` is runnable now, `delayed` is scheduled for later.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueueStats {
    pub waiting: u64,
    pub active: u64,
    pub completed: u64,
    pub failed: u64,
    pub delayed: u64,
}

pub fn new_job_id() -> JobId {
    JobId(format!("job-{}", Uuid::new_v4().simple()))
}

pub fn new_trace_id() -> String {
    format!("trace-{}", Uuid::new_v4().simple())
}
