//! Webhook ingress for the three upstream event sources.
//!
//! Every endpoint is fast-ack: abandonment and payment events are DB-only
//! writes answered synchronously, inbound customer messages are queued for
//! the worker pool and acknowledged immediately. Idempotency lives in the
//! layers below (external ids, payment ids, payload hashes), so a replayed
//! webhook is always safe to accept.

use std::sync::Arc;

use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    routing::post,
    Json, Router,
};
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use winback_agent::{
    AbandonmentEvent, AbandonmentIntake, IntakeError, IntakeOutcome, PaymentEvent,
    PaymentReconciliation, ReconcileError, ReconcileOutcome,
};
use winback_core::domain::abandonment::AbandonmentId;
use winback_core::domain::conversation::ConversationId;
use winback_core::domain::job::{new_trace_id, InboundJob, JobId, JobKind};
use winback_core::domain::message::MessageId;
use winback_core::queue::QueueEngine;
use winback_db::repositories::{MessageRepository, QueueRepository};

#[derive(Clone)]
pub struct WebhookState {
    pub intake: Arc<AbandonmentIntake>,
    pub reconciliation: Arc<PaymentReconciliation>,
    pub messages: Arc<dyn MessageRepository>,
    pub queue: Arc<dyn QueueRepository>,
    pub engine: QueueEngine,
    pub webhook_secret: Option<SecretString>,
}

/// The one error body every handler failure maps through.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WebhookError {
    pub error: String,
    pub message: String,
    pub trace_id: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AbandonmentAck {
    pub status: &'static str,
    pub abandonment_id: AbandonmentId,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_id: Option<ConversationId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
}

/// Inbound message event as posted by the channel provider. The provider
/// does not know conversation ids; when absent the pipeline resolves the
/// conversation by the customer's address.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageEvent {
    pub external_message_id: String,
    pub recipient_address: String,
    pub text: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageAck {
    pub queued: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub job_id: Option<JobId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message_id: Option<MessageId>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentAck {
    pub status: &'static str,
    pub abandonment_id: AbandonmentId,
    /// Abandonment status after the event: `pending`, `converted` or
    /// `declined`.
    pub outcome: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conversation_closed: Option<bool>,
}

pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/webhooks/abandonment", post(abandonment_received))
        .route("/webhooks/message", post(message_received))
        .route("/webhooks/payment", post(payment_received))
        .with_state(state)
}

type HandlerError = (StatusCode, Json<WebhookError>);

fn webhook_guard(
    headers: &HeaderMap,
    state: &WebhookState,
    trace_id: &str,
) -> Result<(), HandlerError> {
    let Some(secret) = &state.webhook_secret else {
        return Ok(());
    };
    match headers.get("x-webhook-secret").and_then(|value| value.to_str().ok()) {
        Some(provided) if provided == secret.expose_secret() => Ok(()),
        Some(_) => {
            Err(reject(StatusCode::UNAUTHORIZED, "unauthorized", "invalid webhook secret", trace_id))
        }
        None => {
            Err(reject(StatusCode::UNAUTHORIZED, "unauthorized", "missing webhook secret", trace_id))
        }
    }
}

fn trace_id_from(headers: &HeaderMap) -> String {
    headers
        .get("x-trace-id")
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToString::to_string)
        .unwrap_or_else(new_trace_id)
}

fn reject(status: StatusCode, error: &str, message: &str, trace_id: &str) -> HandlerError {
    (
        status,
        Json(WebhookError {
            error: error.to_string(),
            message: message.to_string(),
            trace_id: trace_id.to_string(),
        }),
    )
}

fn internal_error(detail: impl std::fmt::Display, trace_id: &str) -> HandlerError {
    error!(
        event_name = "webhook.internal_error",
        trace_id,
        error = %detail,
        "webhook handler failed internally"
    );
    reject(StatusCode::INTERNAL_SERVER_ERROR, "internal", "an internal error occurred", trace_id)
}

pub async fn abandonment_received(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    Json(event): Json<AbandonmentEvent>,
) -> Result<Json<AbandonmentAck>, HandlerError> {
    let trace_id = trace_id_from(&headers);
    webhook_guard(&headers, &state, &trace_id)?;

    match state.intake.record_abandonment(event, &trace_id).await {
        Ok(IntakeOutcome::Created { abandonment_id, conversation_id, job_id }) => {
            Ok(Json(AbandonmentAck {
                status: "created",
                abandonment_id,
                conversation_id: Some(conversation_id),
                job_id,
            }))
        }
        Ok(IntakeOutcome::AlreadyProcessed { abandonment_id, conversation_id }) => {
            Ok(Json(AbandonmentAck {
                status: "already_processed",
                abandonment_id,
                conversation_id,
                job_id: None,
            }))
        }
        Err(IntakeError::Validation(message)) => {
            Err(reject(StatusCode::BAD_REQUEST, "validation", &message, &trace_id))
        }
        Err(error) => Err(internal_error(error, &trace_id)),
    }
}

pub async fn message_received(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    Json(event): Json<MessageEvent>,
) -> Result<(StatusCode, Json<MessageAck>), HandlerError> {
    let trace_id = trace_id_from(&headers);
    webhook_guard(&headers, &state, &trace_id)?;

    let external_message_id = event.external_message_id.trim().to_string();
    let recipient_address = event.recipient_address.trim().to_string();
    if external_message_id.is_empty() {
        return Err(reject(
            StatusCode::BAD_REQUEST,
            "validation",
            "externalMessageId is required",
            &trace_id,
        ));
    }
    if recipient_address.is_empty() {
        return Err(reject(
            StatusCode::BAD_REQUEST,
            "validation",
            "recipientAddress is required",
            &trace_id,
        ));
    }
    if event.text.trim().is_empty() {
        return Err(reject(StatusCode::BAD_REQUEST, "validation", "text is required", &trace_id));
    }

    // A message the pipeline already persisted needs no new job.
    let existing = state
        .messages
        .find_by_external_id(&external_message_id)
        .await
        .map_err(|error| internal_error(error, &trace_id))?;
    if let Some(message) = existing {
        debug!(
            event_name = "webhook.message_duplicate",
            external_message_id,
            message_id = %message.id,
            trace_id,
            "inbound message already processed"
        );
        return Ok((
            StatusCode::OK,
            Json(MessageAck { queued: false, job_id: None, message_id: Some(message.id) }),
        ));
    }

    let job = InboundJob {
        conversation_id: event.conversation_id.map(ConversationId),
        external_message_id,
        recipient_address,
        text: event.text,
        trace_id: trace_id.clone(),
    };
    let payload =
        serde_json::to_string(&job).map_err(|error| internal_error(error, &trace_id))?;
    let queued = state.engine.create_job(JobKind::InboundMessage, job.conversation_id.clone(), payload);

    // Same payload replayed before the worker got to it: re-ack the job
    // that is already waiting.
    let unsettled = state
        .queue
        .find_unsettled_by_payload(JobKind::InboundMessage, &queued.payload_hash)
        .await
        .map_err(|error| internal_error(error, &trace_id))?;
    if let Some(waiting) = unsettled {
        return Ok((
            StatusCode::ACCEPTED,
            Json(MessageAck { queued: true, job_id: Some(waiting.id), message_id: None }),
        ));
    }

    let job_id = queued.id.clone();
    state.queue.insert(queued).await.map_err(|error| internal_error(error, &trace_id))?;
    info!(
        event_name = "webhook.message_queued",
        external_message_id = %job.external_message_id,
        job_id = %job_id,
        trace_id,
        "inbound message handed to the queue"
    );
    Ok((
        StatusCode::ACCEPTED,
        Json(MessageAck { queued: true, job_id: Some(job_id), message_id: None }),
    ))
}

pub async fn payment_received(
    State(state): State<WebhookState>,
    headers: HeaderMap,
    Json(event): Json<PaymentEvent>,
) -> Result<Json<PaymentAck>, HandlerError> {
    let trace_id = trace_id_from(&headers);
    webhook_guard(&headers, &state, &trace_id)?;

    match state.reconciliation.record_payment(event, &trace_id).await {
        Ok(ReconcileOutcome::Recorded { abandonment_id, status, conversation_closed }) => {
            Ok(Json(PaymentAck {
                status: "recorded",
                abandonment_id,
                outcome: status.as_str(),
                conversation_closed: Some(conversation_closed),
            }))
        }
        Ok(ReconcileOutcome::AlreadyProcessed { abandonment_id, status }) => Ok(Json(PaymentAck {
            status: "already_processed",
            abandonment_id,
            outcome: status.as_str(),
            conversation_closed: None,
        })),
        Err(ReconcileError::Validation(message)) => {
            Err(reject(StatusCode::BAD_REQUEST, "validation", &message, &trace_id))
        }
        Err(ReconcileError::UnknownAbandonment(abandonment_id)) => Err(reject(
            StatusCode::NOT_FOUND,
            "unknown_abandonment",
            &format!("abandonment `{abandonment_id}` is not known"),
            &trace_id,
        )),
        Err(error) => Err(internal_error(error, &trace_id)),
    }
}
