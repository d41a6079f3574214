use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use winback_core::config::ChannelConfig;
use winback_core::ChannelErrorClass;

/// Provider confirmation for an accepted message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SendReceipt {
    pub external_id: String,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    #[error("channel rejected credentials: {0}")]
    Auth(String),
    #[error("channel rejected the request: {0}")]
    BadRequest(String),
    #[error("channel rate limit hit: {0}")]
    RateLimited(String),
    #[error("channel provider failure: {0}")]
    ServerError(String),
    #[error("channel unreachable: {0}")]
    Network(String),
}

impl ChannelError {
    /// The classification consulted by `winback_core::delivery::DeliveryPolicy`.
    pub fn class(&self) -> ChannelErrorClass {
        match self {
            Self::Auth(_) => ChannelErrorClass::Auth,
            Self::BadRequest(_) => ChannelErrorClass::BadRequest,
            Self::RateLimited(_) => ChannelErrorClass::RateLimited,
            Self::ServerError(_) => ChannelErrorClass::ServerError,
            Self::Network(_) => ChannelErrorClass::Network,
        }
    }
}

/// One-shot message send. Implementations must not retry internally; the
/// caller owns the retry schedule.
#[async_trait]
pub trait ChannelTransport: Send + Sync {
    async fn send(&self, recipient: &str, text: &str) -> Result<SendReceipt, ChannelError>;
}

#[derive(Serialize)]
struct SendRequest<'a> {
    from: &'a str,
    to: &'a str,
    body: &'a str,
}

#[derive(Deserialize)]
struct SendResponse {
    message_id: String,
}

/// reqwest-backed transport for the provider's message API.
pub struct HttpChannelTransport {
    client: reqwest::Client,
    api_url: String,
    api_token: SecretString,
    sender: String,
}

impl HttpChannelTransport {
    pub fn from_config(config: &ChannelConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.send_timeout_secs.max(1)))
            .build()?;
        Ok(Self {
            client,
            api_url: config.api_url.trim_end_matches('/').to_string(),
            api_token: config.api_token.clone(),
            sender: config.sender.clone(),
        })
    }
}

#[async_trait]
impl ChannelTransport for HttpChannelTransport {
    async fn send(&self, recipient: &str, text: &str) -> Result<SendReceipt, ChannelError> {
        let request = SendRequest { from: &self.sender, to: recipient, body: text };
        let response = self
            .client
            .post(format!("{}/messages", self.api_url))
            .bearer_auth(self.api_token.expose_secret())
            .json(&request)
            .send()
            .await
            .map_err(|error| {
                warn!(
                    event_name = "channel.send_unreachable",
                    recipient,
                    error = %error,
                    "channel request did not complete"
                );
                ChannelError::Network(error.to_string())
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let failure = classify_status(status, &body);
            warn!(
                event_name = "channel.send_rejected",
                recipient,
                status = status.as_u16(),
                class = failure.class().as_str(),
                "channel rejected the send"
            );
            return Err(failure);
        }

        let accepted: SendResponse = response.json().await.map_err(|error| {
            ChannelError::Network(format!("channel response did not decode: {error}"))
        })?;
        debug!(
            event_name = "channel.send_accepted",
            recipient,
            external_id = %accepted.message_id,
            "channel accepted the send"
        );
        Ok(SendReceipt { external_id: accepted.message_id })
    }
}

fn classify_status(status: StatusCode, body: &str) -> ChannelError {
    let detail = format!("{} {}", status.as_u16(), snippet(body));
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ChannelError::Auth(detail),
        StatusCode::TOO_MANY_REQUESTS => ChannelError::RateLimited(detail),
        _ if status.is_client_error() => ChannelError::BadRequest(detail),
        _ if status.is_server_error() => ChannelError::ServerError(detail),
        _ => ChannelError::Network(detail),
    }
}

fn snippet(body: &str) -> String {
    let trimmed = body.trim();
    if trimmed.len() <= 200 {
        trimmed.to_string()
    } else {
        let mut end = 200;
        while !trimmed.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &trimmed[..end])
    }
}

/// Scripted transport for tests: pops canned outcomes in order and records
/// every send. Once the script runs out it keeps accepting with generated
/// ids.
#[derive(Default)]
pub struct ScriptedTransport {
    state: Mutex<ScriptedState>,
}

#[derive(Default)]
struct ScriptedState {
    outcomes: VecDeque<Result<SendReceipt, ChannelError>>,
    sent: Vec<(String, String)>,
}

impl ScriptedTransport {
    pub fn with_outcomes(outcomes: Vec<Result<SendReceipt, ChannelError>>) -> Self {
        Self {
            state: Mutex::new(ScriptedState { outcomes: outcomes.into(), sent: Vec::new() }),
        }
    }

    pub fn accepting(external_id: &str) -> Self {
        Self::with_outcomes(vec![Ok(SendReceipt { external_id: external_id.to_string() })])
    }

    /// `(recipient, text)` pairs in the order they were attempted.
    pub async fn sent(&self) -> Vec<(String, String)> {
        self.state.lock().await.sent.clone()
    }
}

#[async_trait]
impl ChannelTransport for ScriptedTransport {
    async fn send(&self, recipient: &str, text: &str) -> Result<SendReceipt, ChannelError> {
        let mut state = self.state.lock().await;
        state.sent.push((recipient.to_string(), text.to_string()));
        let sequence = state.sent.len();
        state
            .outcomes
            .pop_front()
            .unwrap_or_else(|| Ok(SendReceipt { external_id: format!("scripted-{sequence}") }))
    }
}
