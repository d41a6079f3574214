//! Interpretation capability: turns an inbound customer message plus
//! conversation context into the agent's next reply.
//!
//! Three layers:
//!
//! - [`Interpreter`] is the trait the pipeline consumes.
//! - [`HttpInterpreter`] speaks to an OpenAI-compatible, Anthropic, or
//!   Ollama endpoint over reqwest.
//! - [`ResilientInterpreter`] wraps any interpreter with a hard timeout and
//!   degrades to the configured fallback reply on transient failures.
//!   Authentication failures pass through untouched; retrying those cannot
//!   succeed.
//!
//! The model is strictly a copywriter here. It never decides compliance,
//! state transitions, or payment outcomes; those are deterministic and live
//! in `winback-core`.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::warn;

use winback_core::config::{LlmConfig, LlmProvider};
use winback_core::domain::abandonment::format_cart_value;
use winback_core::domain::conversation::ConversationId;
use winback_core::domain::message::{MessageMetadata, SenderType};
use winback_core::domain::user::UserId;

/// Everything the model is allowed to see about the conversation.
#[derive(Clone, Debug)]
pub struct ConversationContext {
    pub conversation_id: ConversationId,
    pub user_id: UserId,
    pub product_name: String,
    pub cart_value: Decimal,
    pub currency: String,
    /// Prior turns, oldest first. The message being interpreted is passed
    /// separately and must not appear here.
    pub history: Vec<HistoryTurn>,
    pub trace_id: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HistoryTurn {
    pub sender: SenderType,
    pub text: String,
}

/// The interpreter contract: reply text plus whatever annotations the
/// provider surfaced about the exchange.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct InterpreterReply {
    pub text: String,
    pub intent: Option<String>,
    pub sentiment: Option<String>,
    pub should_offer_discount: bool,
    pub tokens_used: Option<u32>,
    pub provider_response_id: Option<String>,
}

impl InterpreterReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            intent: None,
            sentiment: None,
            should_offer_discount: false,
            tokens_used: None,
            provider_response_id: None,
        }
    }

    /// Annotation block persisted onto the stored reply message.
    pub fn metadata(&self) -> MessageMetadata {
        MessageMetadata {
            intent: self.intent.clone(),
            sentiment: self.sentiment.clone(),
            tokens_used: self.tokens_used,
            provider_response_id: self.provider_response_id.clone(),
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterpreterError {
    #[error("interpreter authentication rejected: {0}")]
    Auth(String),
    #[error("interpreter rejected the request: {0}")]
    BadRequest(String),
    #[error("interpreter rate limited: {0}")]
    RateLimited(String),
    #[error("interpreter provider failure: {0}")]
    Provider(String),
    #[error("interpreter unreachable: {0}")]
    Network(String),
    #[error("interpreter timed out after {0}s")]
    Timeout(u64),
}

impl InterpreterError {
    /// Fatal errors propagate out of the resilient wrapper instead of
    /// degrading to the fallback reply.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Auth(_))
    }
}

/// The model-facing seam of the system. One method answers the customer,
/// the other settles opt-out questions the keyword scan could not.
#[async_trait]
pub trait Interpreter: Send + Sync {
    async fn generate_reply(
        &self,
        context: &ConversationContext,
        text: &str,
    ) -> Result<InterpreterReply, InterpreterError>;

    /// Second-layer opt-out review: does `text` ask us to stop messaging?
    async fn review_opt_out(&self, text: &str) -> Result<bool, InterpreterError>;
}

const ANTHROPIC_VERSION: &str = "2023-06-01";
const ANTHROPIC_MAX_TOKENS: u32 = 512;

const OPT_OUT_REVIEW_PROMPT: &str = "Você modera mensagens de clientes de uma loja. Responda \
     apenas \"sim\" se a mensagem pedir para parar de receber mensagens (descadastro, recusa \
     de contato, pedido de silêncio) ou \"não\" em qualquer outro caso.";

/// Interpreter backed by a chat-completion HTTP API.
pub struct HttpInterpreter {
    client: reqwest::Client,
    provider: LlmProvider,
    api_key: Option<SecretString>,
    base_url: String,
    model: String,
    timeout_secs: u64,
}

impl HttpInterpreter {
    pub fn from_config(config: &LlmConfig) -> Result<Self, reqwest::Error> {
        let timeout_secs = config.timeout_secs.max(1);
        let client =
            reqwest::Client::builder().timeout(Duration::from_secs(timeout_secs)).build()?;
        let base_url = config
            .base_url
            .clone()
            .unwrap_or_else(|| default_base_url(config.provider).to_string());

        Ok(Self {
            client,
            provider: config.provider,
            api_key: config.api_key.clone(),
            base_url: base_url.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            timeout_secs,
        })
    }

    async fn complete(
        &self,
        system: &str,
        turns: Vec<WireMessage>,
    ) -> Result<RawCompletion, InterpreterError> {
        match self.provider {
            LlmProvider::OpenAi => self.openai_chat(system, turns).await,
            LlmProvider::Anthropic => self.anthropic_chat(system, turns).await,
            LlmProvider::Ollama => self.ollama_chat(system, turns).await,
        }
    }

    async fn openai_chat(
        &self,
        system: &str,
        turns: Vec<WireMessage>,
    ) -> Result<RawCompletion, InterpreterError> {
        let messages = with_system_turn(system, turns);
        let request = ChatRequest { model: &self.model, messages: &messages, stream: None };

        let mut builder =
            self.client.post(format!("{}/v1/chat/completions", self.base_url)).json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key.expose_secret());
        }

        let response = builder.send().await.map_err(|error| self.transport_error(error))?;
        if !response.status().is_success() {
            return Err(rejection(response).await);
        }

        let decoded: OpenAiResponse = response
            .json()
            .await
            .map_err(|error| InterpreterError::Provider(format!("response did not decode: {error}")))?;
        let choice = decoded
            .choices
            .into_iter()
            .next()
            .ok_or_else(|| InterpreterError::Provider("response carried no choices".to_string()))?;

        Ok(RawCompletion {
            text: choice.message.content,
            tokens_used: decoded.usage.map(|usage| usage.total_tokens),
            provider_response_id: decoded.id,
        })
    }

    async fn anthropic_chat(
        &self,
        system: &str,
        turns: Vec<WireMessage>,
    ) -> Result<RawCompletion, InterpreterError> {
        let request = AnthropicRequest {
            model: &self.model,
            max_tokens: ANTHROPIC_MAX_TOKENS,
            system,
            messages: &turns,
        };

        let mut builder = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request);
        if let Some(key) = &self.api_key {
            builder = builder.header("x-api-key", key.expose_secret());
        }

        let response = builder.send().await.map_err(|error| self.transport_error(error))?;
        if !response.status().is_success() {
            return Err(rejection(response).await);
        }

        let decoded: AnthropicResponse = response
            .json()
            .await
            .map_err(|error| InterpreterError::Provider(format!("response did not decode: {error}")))?;
        let text = decoded
            .content
            .into_iter()
            .find_map(|block| block.text)
            .ok_or_else(|| InterpreterError::Provider("response carried no text block".to_string()))?;
        let tokens_used =
            decoded.usage.map(|usage| usage.input_tokens.saturating_add(usage.output_tokens));

        Ok(RawCompletion { text, tokens_used, provider_response_id: decoded.id })
    }

    async fn ollama_chat(
        &self,
        system: &str,
        turns: Vec<WireMessage>,
    ) -> Result<RawCompletion, InterpreterError> {
        let messages = with_system_turn(system, turns);
        let request = ChatRequest { model: &self.model, messages: &messages, stream: Some(false) };

        let response = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&request)
            .send()
            .await
            .map_err(|error| self.transport_error(error))?;
        if !response.status().is_success() {
            return Err(rejection(response).await);
        }

        let decoded: OllamaResponse = response
            .json()
            .await
            .map_err(|error| InterpreterError::Provider(format!("response did not decode: {error}")))?;
        let tokens_used = match (decoded.prompt_eval_count, decoded.eval_count) {
            (None, None) => None,
            (prompt, eval) => Some(prompt.unwrap_or(0).saturating_add(eval.unwrap_or(0))),
        };

        Ok(RawCompletion {
            text: decoded.message.content,
            tokens_used,
            provider_response_id: None,
        })
    }

    fn transport_error(&self, error: reqwest::Error) -> InterpreterError {
        warn!(
            event_name = "interpreter.request_failed",
            error = %error,
            "interpretation request never completed"
        );
        if error.is_timeout() {
            InterpreterError::Timeout(self.timeout_secs)
        } else {
            InterpreterError::Network(error.to_string())
        }
    }
}

#[async_trait]
impl Interpreter for HttpInterpreter {
    async fn generate_reply(
        &self,
        context: &ConversationContext,
        text: &str,
    ) -> Result<InterpreterReply, InterpreterError> {
        let system = build_system_prompt(context);
        let turns = wire_history(&context.history, text);
        let raw = self.complete(&system, turns).await?;
        Ok(reply_from_raw(raw))
    }

    async fn review_opt_out(&self, text: &str) -> Result<bool, InterpreterError> {
        let turns = vec![WireMessage { role: "user", content: text.to_string() }];
        let raw = self.complete(OPT_OUT_REVIEW_PROMPT, turns).await?;
        Ok(is_affirmative(&raw.text))
    }
}

/// Timeout-and-fallback wrapper. On transient provider trouble the customer
/// still gets an answer; only authentication failures escape.
pub struct ResilientInterpreter<I> {
    inner: I,
    budget: Duration,
    fallback_reply: String,
}

impl<I> ResilientInterpreter<I> {
    pub fn new(inner: I, budget: Duration, fallback_reply: impl Into<String>) -> Self {
        Self { inner, budget, fallback_reply: fallback_reply.into() }
    }

    pub fn from_config(inner: I, config: &LlmConfig) -> Self {
        Self::new(
            inner,
            Duration::from_secs(config.timeout_secs.max(1)),
            config.fallback_reply.clone(),
        )
    }

    fn fallback(&self) -> InterpreterReply {
        InterpreterReply::text(self.fallback_reply.clone())
    }
}

#[async_trait]
impl<I: Interpreter> Interpreter for ResilientInterpreter<I> {
    async fn generate_reply(
        &self,
        context: &ConversationContext,
        text: &str,
    ) -> Result<InterpreterReply, InterpreterError> {
        match tokio::time::timeout(self.budget, self.inner.generate_reply(context, text)).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(error)) if error.is_fatal() => Err(error),
            Ok(Err(error)) => {
                warn!(
                    event_name = "interpreter.degraded",
                    conversation_id = %context.conversation_id,
                    trace_id = %context.trace_id,
                    error = %error,
                    "interpretation degraded to the fallback reply"
                );
                Ok(self.fallback())
            }
            Err(_) => {
                warn!(
                    event_name = "interpreter.timeout",
                    conversation_id = %context.conversation_id,
                    trace_id = %context.trace_id,
                    budget_secs = self.budget.as_secs(),
                    "interpretation exceeded its budget, using the fallback reply"
                );
                Ok(self.fallback())
            }
        }
    }

    async fn review_opt_out(&self, text: &str) -> Result<bool, InterpreterError> {
        match tokio::time::timeout(self.budget, self.inner.review_opt_out(text)).await {
            Ok(Ok(verdict)) => Ok(verdict),
            Ok(Err(error)) if error.is_fatal() => Err(error),
            Ok(Err(error)) => {
                warn!(
                    event_name = "interpreter.review_degraded",
                    error = %error,
                    "opt-out review failed, treating as not opted out"
                );
                Ok(false)
            }
            Err(_) => {
                warn!(
                    event_name = "interpreter.review_timeout",
                    budget_secs = self.budget.as_secs(),
                    "opt-out review timed out, treating as not opted out"
                );
                Ok(false)
            }
        }
    }
}

/// Scripted interpreter for tests: pops queued outcomes, records every
/// request, and keeps answering with a canned reply once the script runs dry.
pub struct ScriptedInterpreter {
    state: Mutex<ScriptedState>,
}

#[derive(Default)]
struct ScriptedState {
    replies: VecDeque<Result<InterpreterReply, InterpreterError>>,
    reviews: VecDeque<Result<bool, InterpreterError>>,
    prompts: Vec<String>,
    contexts: Vec<ConversationContext>,
    reviewed: Vec<String>,
}

impl ScriptedInterpreter {
    pub fn with_outcomes(replies: Vec<Result<InterpreterReply, InterpreterError>>) -> Self {
        Self {
            state: Mutex::new(ScriptedState { replies: replies.into(), ..ScriptedState::default() }),
        }
    }

    pub fn replying(text: &str) -> Self {
        Self::with_outcomes(vec![Ok(InterpreterReply::text(text))])
    }

    pub fn with_reviews(mut self, reviews: Vec<Result<bool, InterpreterError>>) -> Self {
        self.state.get_mut().reviews = reviews.into();
        self
    }

    /// Inbound texts passed to `generate_reply`, in call order.
    pub async fn prompts(&self) -> Vec<String> {
        self.state.lock().await.prompts.clone()
    }

    /// Contexts passed to `generate_reply`, in call order.
    pub async fn contexts(&self) -> Vec<ConversationContext> {
        self.state.lock().await.contexts.clone()
    }

    /// Texts passed to `review_opt_out`, in call order.
    pub async fn reviewed(&self) -> Vec<String> {
        self.state.lock().await.reviewed.clone()
    }
}

#[async_trait]
impl Interpreter for ScriptedInterpreter {
    async fn generate_reply(
        &self,
        context: &ConversationContext,
        text: &str,
    ) -> Result<InterpreterReply, InterpreterError> {
        let mut state = self.state.lock().await;
        state.prompts.push(text.to_string());
        state.contexts.push(context.clone());
        let sequence = state.prompts.len();
        state
            .replies
            .pop_front()
            .unwrap_or_else(|| Ok(InterpreterReply::text(format!("scripted reply {sequence}"))))
    }

    async fn review_opt_out(&self, text: &str) -> Result<bool, InterpreterError> {
        let mut state = self.state.lock().await;
        state.reviewed.push(text.to_string());
        state.reviews.pop_front().unwrap_or(Ok(false))
    }
}

#[derive(Clone, Serialize)]
struct WireMessage {
    role: &'static str,
    content: String,
}

#[derive(Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [WireMessage],
    #[serde(skip_serializing_if = "Option::is_none")]
    stream: Option<bool>,
}

#[derive(Serialize)]
struct AnthropicRequest<'a> {
    model: &'a str,
    max_tokens: u32,
    system: &'a str,
    messages: &'a [WireMessage],
}

#[derive(Deserialize)]
struct OpenAiResponse {
    #[serde(default)]
    id: Option<String>,
    choices: Vec<OpenAiChoice>,
    #[serde(default)]
    usage: Option<OpenAiUsage>,
}

#[derive(Deserialize)]
struct OpenAiChoice {
    message: OpenAiMessage,
}

#[derive(Deserialize)]
struct OpenAiMessage {
    content: String,
}

#[derive(Deserialize)]
struct OpenAiUsage {
    total_tokens: u32,
}

#[derive(Deserialize)]
struct AnthropicResponse {
    #[serde(default)]
    id: Option<String>,
    content: Vec<AnthropicBlock>,
    #[serde(default)]
    usage: Option<AnthropicUsage>,
}

#[derive(Deserialize)]
struct AnthropicBlock {
    #[serde(default)]
    text: Option<String>,
}

#[derive(Deserialize)]
struct AnthropicUsage {
    #[serde(default)]
    input_tokens: u32,
    #[serde(default)]
    output_tokens: u32,
}

#[derive(Deserialize)]
struct OllamaResponse {
    message: OpenAiMessage,
    #[serde(default)]
    prompt_eval_count: Option<u32>,
    #[serde(default)]
    eval_count: Option<u32>,
}

struct RawCompletion {
    text: String,
    tokens_used: Option<u32>,
    provider_response_id: Option<String>,
}

/// Shape the model is asked to answer in. Anything that does not parse is
/// treated as the reply text itself.
#[derive(Deserialize)]
struct StructuredReply {
    response: String,
    #[serde(default)]
    intent: Option<String>,
    #[serde(default)]
    sentiment: Option<String>,
    #[serde(default)]
    should_offer_discount: Option<bool>,
}

fn default_base_url(provider: LlmProvider) -> &'static str {
    match provider {
        LlmProvider::OpenAi => "https://api.openai.com",
        LlmProvider::Anthropic => "https://api.anthropic.com",
        LlmProvider::Ollama => "http://localhost:11434",
    }
}

fn build_system_prompt(context: &ConversationContext) -> String {
    format!(
        "Você é um atendente de pós-venda de uma loja online. O cliente deixou o produto \
         \"{product}\" ({value}) no carrinho e você está ajudando a concluir a compra. Seja \
         breve e cordial, nunca invente descontos, prazos ou condições. Responda em JSON com \
         os campos: response (sua mensagem ao cliente), intent, sentiment e \
         should_offer_discount (booleano).",
        product = context.product_name,
        value = format_cart_value(&context.cart_value, &context.currency),
    )
}

fn wire_history(history: &[HistoryTurn], text: &str) -> Vec<WireMessage> {
    let mut turns: Vec<WireMessage> = history
        .iter()
        .map(|turn| WireMessage {
            role: match turn.sender {
                SenderType::User => "user",
                SenderType::Agent => "assistant",
            },
            content: turn.text.clone(),
        })
        .collect();
    turns.push(WireMessage { role: "user", content: text.to_string() });
    turns
}

fn with_system_turn(system: &str, turns: Vec<WireMessage>) -> Vec<WireMessage> {
    let mut messages = Vec::with_capacity(turns.len() + 1);
    messages.push(WireMessage { role: "system", content: system.to_string() });
    messages.extend(turns);
    messages
}

fn reply_from_raw(raw: RawCompletion) -> InterpreterReply {
    match parse_structured_reply(&raw.text) {
        Some(parsed) => InterpreterReply {
            text: parsed.response,
            intent: parsed.intent,
            sentiment: parsed.sentiment,
            should_offer_discount: parsed.should_offer_discount.unwrap_or(false),
            tokens_used: raw.tokens_used,
            provider_response_id: raw.provider_response_id,
        },
        None => InterpreterReply {
            text: raw.text.trim().to_string(),
            intent: None,
            sentiment: None,
            should_offer_discount: false,
            tokens_used: raw.tokens_used,
            provider_response_id: raw.provider_response_id,
        },
    }
}

fn parse_structured_reply(raw: &str) -> Option<StructuredReply> {
    let trimmed = strip_code_fence(raw.trim());
    if let Ok(parsed) = serde_json::from_str::<StructuredReply>(trimmed) {
        return Some(parsed);
    }

    // Some providers wrap the object in prose; try the outermost braces.
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    if start >= end {
        return None;
    }
    serde_json::from_str(&trimmed[start..=end]).ok()
}

fn strip_code_fence(text: &str) -> &str {
    let Some(rest) = text.strip_prefix("```") else {
        return text;
    };
    let body = match rest.split_once('\n') {
        Some((_lang, body)) => body,
        None => rest,
    };
    body.trim_end().trim_end_matches("```").trim()
}

fn is_affirmative(text: &str) -> bool {
    let normalized = text.trim().to_lowercase();
    normalized.starts_with("sim") || normalized.starts_with("yes")
}

async fn rejection(response: reqwest::Response) -> InterpreterError {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let error = classify_status(status, &body);
    warn!(
        event_name = "interpreter.request_rejected",
        status = status.as_u16(),
        "interpretation request rejected by the provider"
    );
    error
}

fn classify_status(status: StatusCode, body: &str) -> InterpreterError {
    let detail = format!("{} {}", status.as_u16(), snippet(body));
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => InterpreterError::Auth(detail),
        StatusCode::TOO_MANY_REQUESTS => InterpreterError::RateLimited(detail),
        status if status.is_client_error() => InterpreterError::BadRequest(detail),
        status if status.is_server_error() => InterpreterError::Provider(detail),
        _ => InterpreterError::Network(detail),
    }
}

fn snippet(body: &str) -> &str {
    const LIMIT: usize = 200;
    if body.len() <= LIMIT {
        return body;
    }
    let mut cut = LIMIT;
    while !body.is_char_boundary(cut) {
        cut -= 1;
    }
    &body[..cut]
}
