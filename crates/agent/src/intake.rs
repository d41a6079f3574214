//! Abandonment intake: turns an upstream cart-abandonment event into a user,
//! an abandonment row, a conversation, and the queued opening message.
//!
//! The external id is the idempotency key; replaying the same event returns
//! the stored row untouched. The opening message is never sent inline: intake
//! renders it, persists it as a pending turn, and enqueues a durable delivery
//! job. An opted-out customer still gets the bookkeeping rows so payments can
//! reconcile later, but the conversation is closed immediately and nothing is
//! queued.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use winback_channel::template::{TemplateEngine, TemplateError, OPENING_TEMPLATE};
use winback_core::compliance::ComplianceGate;
use winback_core::domain::abandonment::{format_cart_value, Abandonment, AbandonmentId};
use winback_core::domain::conversation::{Conversation, ConversationId, ConversationStatus};
use winback_core::domain::job::{DeliveryJob, JobId, OutboundContent};
use winback_core::domain::message::{Message, MessageType};
use winback_core::domain::user::User;
use winback_db::repositories::{
    AbandonmentRepository, ConversationRepository, MessageRepository, RepositoryError,
    UserRepository,
};

use crate::outbound::{DeliveryService, DispatchError};

/// Cart-abandonment webhook payload from the commerce platform.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbandonmentEvent {
    pub external_id: String,
    /// Customer address on the messaging channel, e.g. `+5511999887766`.
    pub address: String,
    pub display_name: Option<String>,
    pub product_name: String,
    pub product_url: Option<String>,
    pub cart_value: Decimal,
    pub currency: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IntakeOutcome {
    Created {
        abandonment_id: AbandonmentId,
        conversation_id: ConversationId,
        /// Queued opening delivery; absent when compliance refused the send.
        job_id: Option<JobId>,
    },
    /// The external id was seen before; nothing changed.
    AlreadyProcessed {
        abandonment_id: AbandonmentId,
        conversation_id: Option<ConversationId>,
    },
}

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("invalid abandonment event: {0}")]
    Validation(String),
    #[error("repository failure: {0}")]
    Repository(#[from] RepositoryError),
    #[error("opening message failed to render: {0}")]
    Template(#[from] TemplateError),
    #[error("delivery handoff failed: {0}")]
    Dispatch(#[from] DispatchError),
}

pub struct AbandonmentIntake {
    users: Arc<dyn UserRepository>,
    abandonments: Arc<dyn AbandonmentRepository>,
    conversations: Arc<dyn ConversationRepository>,
    messages: Arc<dyn MessageRepository>,
    delivery: Arc<DeliveryService>,
    templates: Arc<TemplateEngine>,
    gate: ComplianceGate,
}

impl AbandonmentIntake {
    pub fn new(
        users: Arc<dyn UserRepository>,
        abandonments: Arc<dyn AbandonmentRepository>,
        conversations: Arc<dyn ConversationRepository>,
        messages: Arc<dyn MessageRepository>,
        delivery: Arc<DeliveryService>,
        templates: Arc<TemplateEngine>,
        gate: ComplianceGate,
    ) -> Self {
        Self { users, abandonments, conversations, messages, delivery, templates, gate }
    }

    pub async fn record_abandonment(
        &self,
        event: AbandonmentEvent,
        trace_id: &str,
    ) -> Result<IntakeOutcome, IntakeError> {
        let event = validate(event)?;

        if let Some(existing) = self.abandonments.find_by_external_id(&event.external_id).await? {
            let conversation = self.conversations.find_by_abandonment_id(&existing.id).await?;
            debug!(
                event_name = "intake.duplicate",
                abandonment_id = %existing.id,
                external_id = %event.external_id,
                trace_id,
                "abandonment already recorded"
            );
            return Ok(IntakeOutcome::AlreadyProcessed {
                abandonment_id: existing.id,
                conversation_id: conversation.map(|conversation| conversation.id),
            });
        }

        let user = self
            .users
            .upsert_by_address(User::new(event.address.clone(), event.display_name.clone()))
            .await?;

        let abandonment = Abandonment::new(
            user.id.clone(),
            event.external_id.clone(),
            event.product_name.clone(),
            event.product_url.clone(),
            event.cart_value,
            event.currency.clone().unwrap_or_else(|| "BRL".to_string()),
        );
        self.abandonments.save(abandonment.clone()).await?;

        let mut conversation = Conversation::new(abandonment.id.clone(), user.id.clone());
        self.conversations.save(conversation.clone()).await?;

        if let Err(refusal) = self.gate.allow_proactive(&conversation, &user, Utc::now()) {
            self.conversations
                .transition_status(
                    &conversation.id,
                    ConversationStatus::AwaitingResponse,
                    ConversationStatus::Closed,
                    Some(refusal.reason_code()),
                    Utc::now(),
                )
                .await?;
            warn!(
                event_name = "intake.proactive_refused",
                abandonment_id = %abandonment.id,
                conversation_id = %conversation.id,
                trace_id,
                reason = refusal.reason_code(),
                "opening message refused, conversation closed"
            );
            return Ok(IntakeOutcome::Created {
                abandonment_id: abandonment.id,
                conversation_id: conversation.id,
                job_id: None,
            });
        }

        let params = opening_params(&event);
        let rendered = self.templates.render(OPENING_TEMPLATE, &params)?;

        let message =
            Message::outbound(conversation.id.clone(), rendered, MessageType::Template);
        self.messages.save(message.clone()).await?;

        conversation.message_count = 1;
        conversation.updated_at = Utc::now();
        self.conversations.save(conversation.clone()).await?;

        let job_id = self
            .delivery
            .enqueue(&DeliveryJob {
                conversation_id: conversation.id.clone(),
                recipient_address: user.address,
                message_id: message.id,
                content: OutboundContent::Template { name: OPENING_TEMPLATE.to_string(), params },
                proactive: true,
                trace_id: trace_id.to_string(),
            })
            .await?;

        info!(
            event_name = "intake.recorded",
            abandonment_id = %abandonment.id,
            conversation_id = %conversation.id,
            job_id = %job_id,
            trace_id,
            "abandonment recorded, opening message queued"
        );
        Ok(IntakeOutcome::Created {
            abandonment_id: abandonment.id,
            conversation_id: conversation.id,
            job_id: Some(job_id),
        })
    }
}

fn validate(mut event: AbandonmentEvent) -> Result<AbandonmentEvent, IntakeError> {
    event.external_id = event.external_id.trim().to_string();
    event.address = event.address.trim().to_string();
    event.product_name = event.product_name.trim().to_string();

    if event.external_id.is_empty() {
        return Err(IntakeError::Validation("externalId must not be empty".to_string()));
    }
    if event.address.is_empty() {
        return Err(IntakeError::Validation("address must not be empty".to_string()));
    }
    if event.product_name.is_empty() {
        return Err(IntakeError::Validation("productName must not be empty".to_string()));
    }
    if event.cart_value.is_sign_negative() {
        return Err(IntakeError::Validation("cartValue must not be negative".to_string()));
    }
    if let Some(currency) = &event.currency {
        let currency = currency.trim();
        if currency.len() != 3 || !currency.chars().all(|character| character.is_ascii_alphabetic())
        {
            return Err(IntakeError::Validation(format!(
                "currency `{currency}` is not a three-letter code"
            )));
        }
        event.currency = Some(currency.to_ascii_uppercase());
    }
    Ok(event)
}

fn opening_params(event: &AbandonmentEvent) -> BTreeMap<String, String> {
    let first_name = event
        .display_name
        .as_deref()
        .and_then(|name| name.split_whitespace().next())
        .unwrap_or_default();
    let currency = event.currency.as_deref().unwrap_or("BRL");

    BTreeMap::from([
        ("first_name".to_string(), first_name.to_string()),
        ("product_name".to_string(), event.product_name.clone()),
        ("cart_value".to_string(), format_cart_value(&event.cart_value, currency)),
    ])
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use rust_decimal::Decimal;

    use winback_channel::template::TemplateEngine;
    use winback_channel::transport::ScriptedTransport;
    use winback_core::compliance::ComplianceGate;
    use winback_core::config::ChannelConfig;
    use winback_core::domain::conversation::ConversationStatus;
    use winback_core::domain::job::{DeliveryJob, JobKind, OutboundContent};
    use winback_core::domain::message::MessageStatus;
    use winback_core::domain::user::User;
    use winback_core::queue::QueueEngine;
    use winback_db::repositories::{
        AbandonmentRepository, ConversationRepository, InMemoryAbandonmentRepository,
        InMemoryConversationRepository, InMemoryMessageRepository, InMemoryQueueRepository,
        InMemoryUserRepository, MessageRepository, QueueRepository, UserRepository,
    };

    use crate::outbound::DeliveryService;

    use super::{AbandonmentEvent, AbandonmentIntake, IntakeError, IntakeOutcome};

    struct Harness {
        intake: AbandonmentIntake,
        users: Arc<InMemoryUserRepository>,
        abandonments: Arc<InMemoryAbandonmentRepository>,
        conversations: Arc<InMemoryConversationRepository>,
        messages: Arc<InMemoryMessageRepository>,
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

    fn harness() -> Harness {
        let users = Arc::new(InMemoryUserRepository::default());
        let abandonments = Arc::new(InMemoryAbandonmentRepository::default());
        let conversations = Arc::new(InMemoryConversationRepository::default());
        let messages = Arc::new(InMemoryMessageRepository::default());
        let queue = Arc::new(InMemoryQueueRepository::default());
        let templates = Arc::new(TemplateEngine::new().unwrap());

        let delivery = Arc::new(DeliveryService::new(
            Arc::new(ScriptedTransport::with_outcomes(vec![])),
            templates.clone(),
            messages.clone(),
            conversations.clone(),
            queue.clone(),
            QueueEngine::new(),
            channel_config(),
        ));
        let intake = AbandonmentIntake::new(
            users.clone(),
            abandonments.clone(),
            conversations.clone(),
            messages.clone(),
            delivery,
            templates,
            ComplianceGate::new(24, 3),
        );

        Harness { intake, users, abandonments, conversations, messages, queue }
    }

    fn event() -> AbandonmentEvent {
        AbandonmentEvent {
            external_id: "EXT-100".to_string(),
            address: "+5511999887766".to_string(),
            display_name: Some("Ana Souza".to_string()),
            product_name: "Tênis Corrida Azul".to_string(),
            product_url: Some("https://loja.example/tenis-azul".to_string()),
            cart_value: Decimal::new(34_990, 2),
            currency: None,
        }
    }

    #[tokio::test]
    async fn records_the_abandonment_and_queues_the_opening_message() {
        let harness = harness();

        let outcome = harness.intake.record_abandonment(event(), "trace-t").await.unwrap();

        let IntakeOutcome::Created { abandonment_id, conversation_id, job_id } = outcome else {
            panic!("expected a creation, got {outcome:?}");
        };
        let job_id = job_id.expect("opening delivery queued");

        let abandonment =
            harness.abandonments.find_by_external_id("EXT-100").await.unwrap().unwrap();
        assert_eq!(abandonment.id, abandonment_id);
        assert_eq!(abandonment.currency, "BRL");

        let conversation =
            harness.conversations.find_by_id(&conversation_id).await.unwrap().unwrap();
        assert_eq!(conversation.status, ConversationStatus::AwaitingResponse);
        assert_eq!(conversation.message_count, 1);
        assert_eq!(conversation.cycle_count, 0);

        let turns = harness.messages.list_recent(&conversation_id, 10).await.unwrap();
        assert_eq!(turns.len(), 1);
        assert_eq!(turns[0].status, MessageStatus::Pending);
        assert!(turns[0].text.starts_with("Oi, Ana!"), "got: {}", turns[0].text);
        assert!(turns[0].text.contains("R$ 349,90"), "got: {}", turns[0].text);

        let job = harness.queue.find_by_id(&job_id).await.unwrap().unwrap();
        let payload: DeliveryJob = serde_json::from_str(&job.payload_json).unwrap();
        assert!(payload.proactive);
        assert_eq!(payload.message_id, turns[0].id);
        assert!(matches!(payload.content, OutboundContent::Template { .. }));
    }

    #[tokio::test]
    async fn replayed_events_return_the_stored_rows_untouched() {
        let harness = harness();

        let first = harness.intake.record_abandonment(event(), "trace-1").await.unwrap();
        let second = harness.intake.record_abandonment(event(), "trace-2").await.unwrap();

        let IntakeOutcome::Created { abandonment_id, conversation_id, .. } = first else {
            panic!("expected a creation, got {first:?}");
        };
        assert_eq!(
            second,
            IntakeOutcome::AlreadyProcessed {
                abandonment_id,
                conversation_id: Some(conversation_id),
            }
        );

        let stats = harness.queue.stats(JobKind::OutboundDelivery, Utc::now()).await.unwrap();
        assert_eq!(stats.waiting, 1);
    }

    #[tokio::test]
    async fn malformed_events_are_rejected() {
        let harness = harness();
        let cases = [
            AbandonmentEvent { external_id: "  ".to_string(), ..event() },
            AbandonmentEvent { address: String::new(), ..event() },
            AbandonmentEvent { product_name: String::new(), ..event() },
            AbandonmentEvent { cart_value: Decimal::new(-1, 0), ..event() },
            AbandonmentEvent { currency: Some("R$".to_string()), ..event() },
        ];

        for case in cases {
            let error = harness.intake.record_abandonment(case, "trace-t").await.unwrap_err();
            assert!(matches!(error, IntakeError::Validation(_)), "got: {error}");
        }
        assert!(harness.abandonments.find_by_external_id("EXT-100").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn currency_codes_are_normalized_to_uppercase() {
        let harness = harness();
        let event = AbandonmentEvent {
            currency: Some("usd".to_string()),
            cart_value: Decimal::new(1_999, 2),
            ..event()
        };

        harness.intake.record_abandonment(event, "trace-t").await.unwrap();

        let abandonment =
            harness.abandonments.find_by_external_id("EXT-100").await.unwrap().unwrap();
        assert_eq!(abandonment.currency, "USD");

        let conversation = harness
            .conversations
            .find_by_abandonment_id(&abandonment.id)
            .await
            .unwrap()
            .unwrap();
        let turns = harness.messages.list_recent(&conversation.id, 10).await.unwrap();
        assert!(turns[0].text.contains("USD 19.99"), "got: {}", turns[0].text);
    }

    #[tokio::test]
    async fn opted_out_customers_get_rows_but_no_opening_message() {
        let harness = harness();
        let mut user = User::new("+5511999887766", Some("Ana Souza".to_string()));
        user.mark_opted_out("keyword:pare", Utc::now());
        harness.users.save(user).await.unwrap();

        let outcome = harness.intake.record_abandonment(event(), "trace-t").await.unwrap();

        let IntakeOutcome::Created { conversation_id, job_id, .. } = outcome else {
            panic!("expected a creation, got {outcome:?}");
        };
        assert!(job_id.is_none());

        let conversation =
            harness.conversations.find_by_id(&conversation_id).await.unwrap().unwrap();
        assert_eq!(conversation.status, ConversationStatus::Closed);
        assert_eq!(conversation.status_reason.as_deref(), Some("opted_out"));

        assert!(harness.messages.list_recent(&conversation_id, 10).await.unwrap().is_empty());
        let stats = harness.queue.stats(JobKind::OutboundDelivery, Utc::now()).await.unwrap();
        assert_eq!(stats.waiting, 0);
    }

    #[tokio::test]
    async fn greeting_drops_the_name_clause_when_no_display_name_is_known() {
        let harness = harness();
        let event = AbandonmentEvent { display_name: None, ..event() };

        let outcome = harness.intake.record_abandonment(event, "trace-t").await.unwrap();

        let IntakeOutcome::Created { conversation_id, .. } = outcome else {
            panic!("expected a creation, got {outcome:?}");
        };
        let turns = harness.messages.list_recent(&conversation_id, 10).await.unwrap();
        assert!(turns[0].text.starts_with("Oi!"), "got: {}", turns[0].text);
    }

    #[tokio::test]
    async fn existing_users_are_reused_by_address() {
        let harness = harness();
        harness.intake.record_abandonment(event(), "trace-1").await.unwrap();

        let second = AbandonmentEvent {
            external_id: "EXT-101".to_string(),
            product_name: "Mochila Trilha 40L".to_string(),
            ..event()
        };
        harness.intake.record_abandonment(second, "trace-2").await.unwrap();

        let user =
            harness.users.find_by_address("+5511999887766").await.unwrap().unwrap();
        let first = harness.abandonments.find_by_external_id("EXT-100").await.unwrap().unwrap();
        let replay = harness.abandonments.find_by_external_id("EXT-101").await.unwrap().unwrap();
        assert_eq!(first.user_id, user.id);
        assert_eq!(replay.user_id, user.id);
    }
}
