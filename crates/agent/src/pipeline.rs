//! Inbound processing pipeline: one customer message in, at most one agent
//! reply out.
//!
//! The walk is strictly ordered: resolve the conversation, honor an earlier
//! opt-out, deduplicate on the channel's message id, persist the turn, run
//! opt-out detection, activate the conversation, interpret, persist the
//! reply, and hand it to outbound delivery. Failures downstream of
//! acknowledgment never un-process the inbound message; a failed send only
//! means the reply now travels through the durable retry queue.
//!
//! The return type separates terminal outcomes (duplicate, not found, opted
//! out) from errors the job runner may retry. Only repository and dispatch
//! failures are transient; interpreter authentication failures are fatal.

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{debug, info, warn};

use winback_core::domain::conversation::{Conversation, ConversationId, ConversationStatus};
use winback_core::domain::job::{DeliveryJob, InboundJob, OutboundContent};
use winback_core::domain::message::{Message, MessageId, MessageType};
use winback_core::domain::user::User;
use winback_core::lifecycle::reasons;
use winback_db::repositories::{
    AbandonmentRepository, ConversationRepository, MessageRepository, RepositoryError,
    UserRepository,
};

use crate::interpreter::{ConversationContext, HistoryTurn, Interpreter};
use crate::optout::OptOutDetector;
use crate::outbound::{DeliveryOutcome, DeliveryService, DispatchError};

/// Terminal result of one inbound job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum InboundOutcome {
    /// The external message id was seen before; nothing was re-processed.
    Duplicate { message_id: MessageId },
    /// No conversation could be resolved for this webhook.
    NotFound,
    /// The user opted out earlier; the turn was stored for audit only.
    Silenced { message_id: MessageId },
    /// This message itself was an opt-out; the conversation is now closed.
    OptedOut { message_id: MessageId, reason: String },
    Replied { message_id: MessageId, reply_id: MessageId, delivery: DeliveryOutcome },
}

impl InboundOutcome {
    /// Whether the webhook delivery counts as handled.
    pub fn processed(&self) -> bool {
        !matches!(self, Self::NotFound)
    }
}

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("repository failure: {0}")]
    Repository(#[from] RepositoryError),
    #[error("delivery handoff failed: {0}")]
    Dispatch(#[from] DispatchError),
    #[error("interpreter authentication failed: {0}")]
    InterpreterAuth(String),
    #[error("interpretation failed: {0}")]
    Interpretation(String),
}

impl PipelineError {
    /// Whether the job runner should retry the inbound job.
    pub fn is_transient(&self) -> bool {
        !matches!(self, Self::InterpreterAuth(_))
    }
}

pub struct InboundPipeline {
    users: Arc<dyn UserRepository>,
    abandonments: Arc<dyn AbandonmentRepository>,
    conversations: Arc<dyn ConversationRepository>,
    messages: Arc<dyn MessageRepository>,
    interpreter: Arc<dyn Interpreter>,
    detector: OptOutDetector,
    delivery: Arc<DeliveryService>,
    history_limit: u32,
}

impl InboundPipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        users: Arc<dyn UserRepository>,
        abandonments: Arc<dyn AbandonmentRepository>,
        conversations: Arc<dyn ConversationRepository>,
        messages: Arc<dyn MessageRepository>,
        interpreter: Arc<dyn Interpreter>,
        detector: OptOutDetector,
        delivery: Arc<DeliveryService>,
        history_limit: u32,
    ) -> Self {
        Self {
            users,
            abandonments,
            conversations,
            messages,
            interpreter,
            detector,
            delivery,
            history_limit,
        }
    }

    pub async fn process(&self, job: &InboundJob) -> Result<InboundOutcome, PipelineError> {
        let Some((mut conversation, user)) = self.resolve(job).await? else {
            warn!(
                event_name = "pipeline.conversation_missing",
                trace_id = %job.trace_id,
                "inbound message resolves to no conversation"
            );
            return Ok(InboundOutcome::NotFound);
        };

        if user.opted_out {
            let (message, _) = self.persist_inbound(&conversation, job).await?;
            debug!(
                event_name = "pipeline.silenced",
                conversation_id = %conversation.id,
                message_id = %message.id,
                trace_id = %job.trace_id,
                "user has opted out, staying silent"
            );
            return Ok(InboundOutcome::Silenced { message_id: message.id });
        }

        let (message, fresh) = self.persist_inbound(&conversation, job).await?;
        if !fresh {
            debug!(
                event_name = "pipeline.duplicate",
                message_id = %message.id,
                trace_id = %job.trace_id,
                "external message id already processed"
            );
            return Ok(InboundOutcome::Duplicate { message_id: message.id });
        }

        let now = Utc::now();
        conversation.message_count += 1;
        conversation.last_message_at = Some(now);
        conversation.last_user_message_at = Some(now);
        conversation.updated_at = now;
        self.conversations.save(conversation.clone()).await?;

        if let Some(reason) = self.detector.detect(&job.text).await {
            return Ok(self.apply_opt_out(&user, &conversation, message.id, reason, job).await?);
        }

        self.advance_to_active(&mut conversation).await?;

        let Some(context) = self.load_context(&conversation, &message, job).await? else {
            warn!(
                event_name = "pipeline.abandonment_missing",
                conversation_id = %conversation.id,
                trace_id = %job.trace_id,
                "conversation references a missing abandonment"
            );
            return Ok(InboundOutcome::NotFound);
        };

        let reply = match self.interpreter.generate_reply(&context, &job.text).await {
            Ok(reply) => reply,
            Err(error) if error.is_fatal() => {
                return Err(PipelineError::InterpreterAuth(error.to_string()));
            }
            Err(error) => return Err(PipelineError::Interpretation(error.to_string())),
        };
        info!(
            event_name = "pipeline.interpreted",
            conversation_id = %conversation.id,
            trace_id = %job.trace_id,
            intent = reply.intent.as_deref().unwrap_or("unknown"),
            sentiment = reply.sentiment.as_deref().unwrap_or("unknown"),
            should_offer_discount = reply.should_offer_discount,
            tokens_used = reply.tokens_used.unwrap_or(0),
            "reply generated"
        );

        let mut reply_message =
            Message::outbound(conversation.id.clone(), reply.text.clone(), MessageType::Text);
        reply_message.metadata = reply.metadata();
        self.messages.save(reply_message.clone()).await?;

        conversation.message_count += 1;
        conversation.updated_at = Utc::now();
        self.conversations.save(conversation.clone()).await?;

        let delivery = self
            .delivery
            .dispatch(DeliveryJob {
                conversation_id: conversation.id.clone(),
                recipient_address: user.address.clone(),
                message_id: reply_message.id.clone(),
                content: OutboundContent::text(reply.text),
                proactive: false,
                trace_id: job.trace_id.clone(),
            })
            .await?;

        Ok(InboundOutcome::Replied {
            message_id: message.id,
            reply_id: reply_message.id,
            delivery,
        })
    }

    /// Conversation and owning user for the webhook: by conversation id when
    /// given, else the newest conversation of the user holding the address.
    async fn resolve(
        &self,
        job: &InboundJob,
    ) -> Result<Option<(Conversation, User)>, RepositoryError> {
        let conversation = match &job.conversation_id {
            Some(id) => self.conversations.find_by_id(id).await?,
            None => {
                let Some(user) = self.users.find_by_address(&job.recipient_address).await? else {
                    return Ok(None);
                };
                self.conversations.find_latest_by_user(&user.id).await?
            }
        };

        let Some(conversation) = conversation else {
            return Ok(None);
        };
        let Some(user) = self.users.find_by_id(&conversation.user_id).await? else {
            warn!(
                event_name = "pipeline.user_missing",
                conversation_id = %conversation.id,
                "conversation references a missing user"
            );
            return Ok(None);
        };
        Ok(Some((conversation, user)))
    }

    /// Stores the inbound turn unless its external id was already seen; the
    /// second element is false when the stored row was returned instead.
    async fn persist_inbound(
        &self,
        conversation: &Conversation,
        job: &InboundJob,
    ) -> Result<(Message, bool), RepositoryError> {
        if let Some(existing) =
            self.messages.find_by_external_id(&job.external_message_id).await?
        {
            return Ok((existing, false));
        }

        let message = Message::inbound(
            conversation.id.clone(),
            job.external_message_id.clone(),
            job.text.clone(),
        );
        self.messages.save(message.clone()).await?;
        Ok((message, true))
    }

    async fn apply_opt_out(
        &self,
        user: &User,
        conversation: &Conversation,
        message_id: MessageId,
        reason: String,
        job: &InboundJob,
    ) -> Result<InboundOutcome, RepositoryError> {
        let now = Utc::now();
        let mut user = user.clone();
        user.mark_opted_out(reason.clone(), now);
        self.users.save(user).await?;

        self.close_conversation(&conversation.id, conversation.status, reasons::OPTED_OUT)
            .await?;
        info!(
            event_name = "pipeline.opted_out",
            conversation_id = %conversation.id,
            trace_id = %job.trace_id,
            reason = %reason,
            "customer opted out, conversation closed"
        );
        Ok(InboundOutcome::OptedOut { message_id, reason })
    }

    /// First customer contact moves `AwaitingResponse` to `Active`; a reply
    /// on an errored conversation recovers it. Losing the compare-and-set
    /// race reloads the winner's status instead of fighting it.
    async fn advance_to_active(
        &self,
        conversation: &mut Conversation,
    ) -> Result<(), RepositoryError> {
        let reason = match conversation.status {
            ConversationStatus::AwaitingResponse => reasons::USER_REPLIED,
            ConversationStatus::Error => reasons::RECOVERED,
            ConversationStatus::Active | ConversationStatus::Closed => return Ok(()),
        };

        let applied = self
            .conversations
            .transition_status(
                &conversation.id,
                conversation.status,
                ConversationStatus::Active,
                Some(reason),
                Utc::now(),
            )
            .await?;
        if applied {
            conversation.status = ConversationStatus::Active;
            conversation.status_reason = Some(reason.to_string());
        } else if let Some(latest) = self.conversations.find_by_id(&conversation.id).await? {
            *conversation = latest;
        }
        Ok(())
    }

    async fn close_conversation(
        &self,
        id: &ConversationId,
        mut current: ConversationStatus,
        reason: &str,
    ) -> Result<(), RepositoryError> {
        for _ in 0..2 {
            if current == ConversationStatus::Closed {
                return Ok(());
            }
            let applied = self
                .conversations
                .transition_status(id, current, ConversationStatus::Closed, Some(reason), Utc::now())
                .await?;
            if applied {
                return Ok(());
            }
            match self.conversations.find_by_id(id).await? {
                Some(conversation) => current = conversation.status,
                None => return Ok(()),
            }
        }
        warn!(
            event_name = "pipeline.transition_raced",
            conversation_id = %id,
            "conversation kept changing status, leaving it to the winner"
        );
        Ok(())
    }

    /// Bounded history window plus the product context of the abandonment.
    /// `None` when the abandonment row is gone.
    async fn load_context(
        &self,
        conversation: &Conversation,
        inbound: &Message,
        job: &InboundJob,
    ) -> Result<Option<ConversationContext>, RepositoryError> {
        let Some(abandonment) =
            self.abandonments.find_by_id(&conversation.abandonment_id).await?
        else {
            return Ok(None);
        };

        let history = self
            .messages
            .list_recent(&conversation.id, self.history_limit)
            .await?
            .into_iter()
            .filter(|message| message.id != inbound.id)
            .map(|message| HistoryTurn { sender: message.sender, text: message.text })
            .collect();

        Ok(Some(ConversationContext {
            conversation_id: conversation.id.clone(),
            user_id: conversation.user_id.clone(),
            product_name: abandonment.product_name,
            cart_value: abandonment.cart_value,
            currency: abandonment.currency,
            history,
            trace_id: job.trace_id.clone(),
        }))
    }
}
