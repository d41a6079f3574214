//! Outbound delivery: one message from "persisted and pending" to "accepted
//! by the channel", with the retry split the rest of the system relies on.
//!
//! Fast transient blips (429, 5xx) are retried in-process with doubling
//! delays. Systemic trouble (network down, in-process budget exhausted)
//! becomes a durable queue job so nothing is lost during an outage. Terminal
//! rejections (auth, bad request) are not retried at all; resubmitting them
//! cannot succeed.
//!
//! Whatever the channel said is mirrored onto the stored message row. A
//! failing mirror write is logged and swallowed: the database being down
//! must not turn an accepted send into a phantom failure.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use winback_channel::payload::validate_outbound;
use winback_channel::template::TemplateEngine;
use winback_channel::transport::ChannelTransport;
use winback_core::config::ChannelConfig;
use winback_core::delivery::{DeliveryAction, DeliveryPolicy};
use winback_core::domain::job::{DeliveryJob, JobId, JobKind};
use winback_core::domain::message::{MessageId, MessageStatus};
use winback_core::queue::QueueEngine;
use winback_db::repositories::{
    ConversationRepository, MessageRepository, QueueRepository, RepositoryError,
};

/// What one synchronous walk through the retry policy concluded.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SendResolution {
    Sent { external_id: String },
    /// Terminal rejection; the message row is now `failed`.
    Abandoned { detail: String },
    /// Transient failure that outlived the in-process retries; the caller
    /// decides between a durable job and a queue-level reschedule.
    Exhausted { detail: String },
}

/// Resolution of a [`DeliveryService::dispatch`] call, where exhaustion has
/// already been converted into a durable job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DeliveryOutcome {
    Sent { external_id: String },
    Requeued { job_id: JobId },
    Abandoned { detail: String },
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("repository failure: {0}")]
    Repository(#[from] RepositoryError),
    #[error("payload encoding failed: {0}")]
    Encoding(#[from] serde_json::Error),
}

pub struct DeliveryService {
    transport: Arc<dyn ChannelTransport>,
    templates: Arc<TemplateEngine>,
    messages: Arc<dyn MessageRepository>,
    conversations: Arc<dyn ConversationRepository>,
    queue: Arc<dyn QueueRepository>,
    engine: QueueEngine,
    policy: DeliveryPolicy,
    config: ChannelConfig,
}

impl DeliveryService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        transport: Arc<dyn ChannelTransport>,
        templates: Arc<TemplateEngine>,
        messages: Arc<dyn MessageRepository>,
        conversations: Arc<dyn ConversationRepository>,
        queue: Arc<dyn QueueRepository>,
        engine: QueueEngine,
        config: ChannelConfig,
    ) -> Self {
        Self {
            transport,
            templates,
            messages,
            conversations,
            queue,
            engine,
            policy: DeliveryPolicy::default(),
            config,
        }
    }

    /// Pipeline-facing path: try the send now, converting exhaustion into a
    /// durable retry job. Only queue persistence itself can fail here.
    pub async fn dispatch(&self, job: DeliveryJob) -> Result<DeliveryOutcome, DispatchError> {
        match self.send(&job).await {
            SendResolution::Sent { external_id } => Ok(DeliveryOutcome::Sent { external_id }),
            SendResolution::Abandoned { detail } => Ok(DeliveryOutcome::Abandoned { detail }),
            SendResolution::Exhausted { .. } => {
                let job_id = self.enqueue(&job).await?;
                Ok(DeliveryOutcome::Requeued { job_id })
            }
        }
    }

    /// One pass through render, validate, and the in-process retry loop.
    /// Every resolution is already mirrored onto the message row.
    pub async fn send(&self, job: &DeliveryJob) -> SendResolution {
        let text = match self.templates.render_content(&job.content) {
            Ok(text) => text,
            Err(error) => {
                let detail = format!("template rendering failed: {error}");
                self.mark_failed(&job.message_id, &detail).await;
                return SendResolution::Abandoned { detail };
            }
        };

        if let Err(error) = validate_outbound(&job.recipient_address, &text, &self.config) {
            let detail = error.to_string();
            self.mark_failed(&job.message_id, &detail).await;
            return SendResolution::Abandoned { detail };
        }

        let mut failed_attempts = 0u32;
        loop {
            match self.transport.send(&job.recipient_address, &text).await {
                Ok(receipt) => {
                    info!(
                        event_name = "delivery.sent",
                        conversation_id = %job.conversation_id,
                        message_id = %job.message_id,
                        trace_id = %job.trace_id,
                        attempts = failed_attempts + 1,
                        "outbound message accepted by the channel"
                    );
                    self.mark_sent(job, &receipt.external_id).await;
                    return SendResolution::Sent { external_id: receipt.external_id };
                }
                Err(error) => {
                    failed_attempts += 1;
                    match self.policy.action_for(error.class(), failed_attempts) {
                        DeliveryAction::Abandon => {
                            let detail = error.to_string();
                            warn!(
                                event_name = "delivery.abandoned",
                                conversation_id = %job.conversation_id,
                                message_id = %job.message_id,
                                trace_id = %job.trace_id,
                                class = error.class().as_str(),
                                error = %detail,
                                "channel rejected the send terminally"
                            );
                            self.mark_failed(&job.message_id, &detail).await;
                            return SendResolution::Abandoned { detail };
                        }
                        DeliveryAction::RetryAfter(delay) => {
                            debug!(
                                event_name = "delivery.retrying",
                                message_id = %job.message_id,
                                attempt = failed_attempts,
                                delay_ms = delay.as_millis() as u64,
                                "retrying the send in-process"
                            );
                            tokio::time::sleep(delay).await;
                        }
                        DeliveryAction::Requeue => {
                            let detail = error.to_string();
                            warn!(
                                event_name = "delivery.exhausted",
                                conversation_id = %job.conversation_id,
                                message_id = %job.message_id,
                                trace_id = %job.trace_id,
                                attempts = failed_attempts,
                                error = %detail,
                                "in-process retries exhausted"
                            );
                            return SendResolution::Exhausted { detail };
                        }
                    }
                }
            }
        }
    }

    /// Queue a durable retry job for `job`. An unsettled job already
    /// carrying the same payload is reused instead of inserted twice.
    pub async fn enqueue(&self, job: &DeliveryJob) -> Result<JobId, DispatchError> {
        let payload = serde_json::to_string(job)?;
        let queued = self.engine.create_job(
            JobKind::OutboundDelivery,
            Some(job.conversation_id.clone()),
            payload,
        );

        if let Some(existing) = self
            .queue
            .find_unsettled_by_payload(JobKind::OutboundDelivery, &queued.payload_hash)
            .await?
        {
            debug!(
                event_name = "delivery.requeue_deduplicated",
                job_id = %existing.id,
                message_id = %job.message_id,
                "an unsettled retry job already carries this payload"
            );
            return Ok(existing.id);
        }

        let job_id = queued.id.clone();
        self.queue.insert(queued).await?;
        info!(
            event_name = "delivery.requeued",
            job_id = %job_id,
            conversation_id = %job.conversation_id,
            message_id = %job.message_id,
            trace_id = %job.trace_id,
            "send handed to the durable retry queue"
        );
        Ok(job_id)
    }

    async fn mark_sent(&self, job: &DeliveryJob, external_id: &str) {
        let now = Utc::now();

        match self.messages.find_by_id(&job.message_id).await {
            Ok(Some(mut message)) => {
                message.status = MessageStatus::Sent;
                message.external_id = Some(external_id.to_string());
                message.error = None;
                message.updated_at = now;
                if let Err(error) = self.messages.save(message).await {
                    warn!(
                        event_name = "delivery.mirror_failed",
                        message_id = %job.message_id,
                        error = %error,
                        "send succeeded but the message row update failed"
                    );
                }
            }
            Ok(None) => warn!(
                event_name = "delivery.mirror_failed",
                message_id = %job.message_id,
                "send succeeded but the message row is missing"
            ),
            Err(error) => warn!(
                event_name = "delivery.mirror_failed",
                message_id = %job.message_id,
                error = %error,
                "send succeeded but the message row could not be loaded"
            ),
        }

        match self.conversations.find_by_id(&job.conversation_id).await {
            Ok(Some(mut conversation)) => {
                conversation.last_message_at = Some(now);
                if job.proactive {
                    conversation.cycle_count += 1;
                }
                conversation.updated_at = now;
                if let Err(error) = self.conversations.save(conversation).await {
                    warn!(
                        event_name = "delivery.mirror_failed",
                        conversation_id = %job.conversation_id,
                        error = %error,
                        "send succeeded but the conversation update failed"
                    );
                }
            }
            Ok(None) => warn!(
                event_name = "delivery.mirror_failed",
                conversation_id = %job.conversation_id,
                "send succeeded but the conversation row is missing"
            ),
            Err(error) => warn!(
                event_name = "delivery.mirror_failed",
                conversation_id = %job.conversation_id,
                error = %error,
                "send succeeded but the conversation could not be loaded"
            ),
        }
    }

    async fn mark_failed(&self, message_id: &MessageId, detail: &str) {
        match self.messages.find_by_id(message_id).await {
            Ok(Some(mut message)) => {
                message.status = MessageStatus::Failed;
                message.error = Some(detail.to_string());
                message.updated_at = Utc::now();
                if let Err(error) = self.messages.save(message).await {
                    warn!(
                        event_name = "delivery.mirror_failed",
                        message_id = %message_id,
                        error = %error,
                        "failure outcome could not be written to the message row"
                    );
                }
            }
            Ok(None) => warn!(
                event_name = "delivery.mirror_failed",
                message_id = %message_id,
                "failure outcome has no message row to land on"
            ),
            Err(error) => warn!(
                event_name = "delivery.mirror_failed",
                message_id = %message_id,
                error = %error,
                "failure outcome could not be written to the message row"
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;
    use std::sync::Arc;

    use chrono::Utc;

    use winback_channel::template::{TemplateEngine, OPENING_TEMPLATE};
    use winback_channel::transport::{ChannelError, ScriptedTransport, SendReceipt};
    use winback_core::config::ChannelConfig;
    use winback_core::domain::abandonment::AbandonmentId;
    use winback_core::domain::conversation::Conversation;
    use winback_core::domain::job::{DeliveryJob, JobKind, OutboundContent};
    use winback_core::domain::message::{Message, MessageStatus, MessageType};
    use winback_core::domain::user::UserId;
    use winback_core::queue::QueueEngine;
    use winback_db::repositories::{
        ConversationRepository, InMemoryConversationRepository, InMemoryMessageRepository,
        InMemoryQueueRepository, MessageRepository, QueueRepository,
    };

    use super::{DeliveryOutcome, DeliveryService, SendResolution};

    struct Harness {
        service: DeliveryService,
        transport: Arc<ScriptedTransport>,
        messages: Arc<InMemoryMessageRepository>,
        conversations: Arc<InMemoryConversationRepository>,
        queue: Arc<InMemoryQueueRepository>,
    }

    fn channel_config() -> ChannelConfig {
        ChannelConfig {
            api_url: "http://localhost:8081".to_string(),
            api_token: String::new().into(),
            sender: "+5511888000000".to_string(),
            send_timeout_secs: 5,
            recipient_min_digits: 10,
            recipient_max_digits: 15,
            max_message_length: 4096,
        }
    }

    fn harness(transport: ScriptedTransport) -> Harness {
        let transport = Arc::new(transport);
        let messages = Arc::new(InMemoryMessageRepository::default());
        let conversations = Arc::new(InMemoryConversationRepository::default());
        let queue = Arc::new(InMemoryQueueRepository::default());
        let service = DeliveryService::new(
            transport.clone(),
            Arc::new(TemplateEngine::new().unwrap()),
            messages.clone(),
            conversations.clone(),
            queue.clone(),
            QueueEngine::new(),
            channel_config(),
        );
        Harness { service, transport, messages, conversations, queue }
    }

    /// Seeds a conversation plus a pending agent message and returns the
    /// delivery job that would carry it.
    async fn seeded_job(harness: &Harness, proactive: bool) -> DeliveryJob {
        let conversation =
            Conversation::new(AbandonmentId("ab-1".to_string()), UserId("usr-1".to_string()));
        let message =
            Message::outbound(conversation.id.clone(), "Temos sim!", MessageType::Text);

        harness.conversations.save(conversation.clone()).await.unwrap();
        harness.messages.save(message.clone()).await.unwrap();

        DeliveryJob {
            conversation_id: conversation.id,
            recipient_address: "+5511999887766".to_string(),
            message_id: message.id,
            content: OutboundContent::text("Temos sim!"),
            proactive,
            trace_id: "trace-t".to_string(),
        }
    }

    fn rate_limited() -> ChannelError {
        ChannelError::RateLimited("429 too many requests".to_string())
    }

    #[tokio::test]
    async fn successful_send_backfills_the_message_row() {
        let harness = harness(ScriptedTransport::accepting("wamid.99"));
        let job = seeded_job(&harness, false).await;

        let resolution = harness.service.send(&job).await;

        assert_eq!(resolution, SendResolution::Sent { external_id: "wamid.99".to_string() });
        let message = harness.messages.find_by_id(&job.message_id).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Sent);
        assert_eq!(message.external_id.as_deref(), Some("wamid.99"));
        let conversation =
            harness.conversations.find_by_id(&job.conversation_id).await.unwrap().unwrap();
        assert!(conversation.last_message_at.is_some());
        assert_eq!(conversation.cycle_count, 0);
    }

    #[tokio::test]
    async fn proactive_send_counts_an_engagement_cycle() {
        let harness = harness(ScriptedTransport::accepting("wamid.1"));
        let job = seeded_job(&harness, true).await;

        harness.service.send(&job).await;

        let conversation =
            harness.conversations.find_by_id(&job.conversation_id).await.unwrap().unwrap();
        assert_eq!(conversation.cycle_count, 1);
    }

    #[tokio::test]
    async fn auth_rejection_abandons_without_retry() {
        let harness = harness(ScriptedTransport::with_outcomes(vec![Err(ChannelError::Auth(
            "401 token rejected".to_string(),
        ))]));
        let job = seeded_job(&harness, false).await;

        let resolution = harness.service.send(&job).await;

        assert!(matches!(resolution, SendResolution::Abandoned { .. }));
        assert_eq!(harness.transport.sent().await.len(), 1);
        let message = harness.messages.find_by_id(&job.message_id).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Failed);
        assert!(message.error.unwrap().contains("401"));
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limits_retry_inline_then_exhaust() {
        let harness = harness(ScriptedTransport::with_outcomes(vec![
            Err(rate_limited()),
            Err(rate_limited()),
            Err(rate_limited()),
            Err(rate_limited()),
        ]));
        let job = seeded_job(&harness, false).await;

        let resolution = harness.service.send(&job).await;

        assert!(matches!(resolution, SendResolution::Exhausted { .. }));
        assert_eq!(harness.transport.sent().await.len(), 4);
        let message = harness.messages.find_by_id(&job.message_id).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Pending);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_blip_recovers_inline() {
        let harness = harness(ScriptedTransport::with_outcomes(vec![
            Err(rate_limited()),
            Ok(SendReceipt { external_id: "wamid.2".to_string() }),
        ]));
        let job = seeded_job(&harness, false).await;

        let resolution = harness.service.send(&job).await;

        assert_eq!(resolution, SendResolution::Sent { external_id: "wamid.2".to_string() });
        assert_eq!(harness.transport.sent().await.len(), 2);
    }

    #[tokio::test]
    async fn network_errors_dispatch_straight_to_the_durable_queue() {
        let harness = harness(ScriptedTransport::with_outcomes(vec![Err(
            ChannelError::Network("connection refused".to_string()),
        )]));
        let job = seeded_job(&harness, false).await;

        let outcome = harness.service.dispatch(job.clone()).await.unwrap();

        assert!(matches!(outcome, DeliveryOutcome::Requeued { .. }));
        assert_eq!(harness.transport.sent().await.len(), 1);
        let stats = harness.queue.stats(JobKind::OutboundDelivery, Utc::now()).await.unwrap();
        assert_eq!(stats.waiting, 1);
        let message = harness.messages.find_by_id(&job.message_id).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Pending);
    }

    #[tokio::test]
    async fn enqueue_deduplicates_unsettled_payloads() {
        let harness = harness(ScriptedTransport::with_outcomes(vec![]));
        let job = seeded_job(&harness, false).await;

        let first = harness.service.enqueue(&job).await.unwrap();
        let second = harness.service.enqueue(&job).await.unwrap();

        assert_eq!(first, second);
        let stats = harness.queue.stats(JobKind::OutboundDelivery, Utc::now()).await.unwrap();
        assert_eq!(stats.waiting, 1);
    }

    #[tokio::test]
    async fn invalid_recipient_abandons_before_any_network_call() {
        let harness = harness(ScriptedTransport::accepting("wamid.3"));
        let mut job = seeded_job(&harness, false).await;
        job.recipient_address = "not-a-number".to_string();

        let resolution = harness.service.send(&job).await;

        assert!(matches!(resolution, SendResolution::Abandoned { .. }));
        assert!(harness.transport.sent().await.is_empty());
        let message = harness.messages.find_by_id(&job.message_id).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Failed);
    }

    #[tokio::test]
    async fn template_content_is_rendered_before_the_send() {
        let harness = harness(ScriptedTransport::accepting("wamid.4"));
        let mut job = seeded_job(&harness, true).await;
        let params: BTreeMap<String, String> = [
            ("first_name", "Ana"),
            ("product_name", "Tênis Corrida Azul"),
            ("cart_value", "R$ 349,90"),
        ]
        .into_iter()
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
        job.content = OutboundContent::Template { name: OPENING_TEMPLATE.to_string(), params };

        let resolution = harness.service.send(&job).await;

        assert!(matches!(resolution, SendResolution::Sent { .. }));
        let sent = harness.transport.sent().await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].1.starts_with("Oi, Ana!"));
        assert!(sent[0].1.contains("Tênis Corrida Azul"));
    }
}
