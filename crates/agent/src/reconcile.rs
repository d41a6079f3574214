//! Payment reconciliation: maps payment-status webhooks onto abandonments
//! and closes the attached conversation on a settled outcome.
//!
//! The payment id is the idempotency key. Once a payment id has been
//! recorded, every replay answers with the stored status and applies no side
//! effects, whatever status the replay carries. The external status
//! vocabulary collapses onto `{converted, pending, declined}` through a fixed
//! table; anything outside the table is rejected rather than guessed at.

use std::sync::Arc;

use chrono::Utc;
use rust_decimal::Decimal;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, info, warn};

use winback_core::domain::abandonment::{AbandonmentId, AbandonmentStatus};
use winback_core::domain::conversation::{ConversationId, ConversationStatus};
use winback_core::lifecycle::reasons;
use winback_db::repositories::{
    AbandonmentRepository, ConversationRepository, RepositoryError,
};

/// Payment-status webhook payload. `abandonment_id` is the internal id the
/// intake response handed back to the commerce platform.
#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentEvent {
    pub payment_id: String,
    pub abandonment_id: String,
    pub status: String,
    pub amount: Option<Decimal>,
    pub currency: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// The payment id was seen before; `status` is what was stored then.
    AlreadyProcessed { abandonment_id: AbandonmentId, status: AbandonmentStatus },
    Recorded {
        abandonment_id: AbandonmentId,
        status: AbandonmentStatus,
        conversation_closed: bool,
    },
}

#[derive(Debug, Error)]
pub enum ReconcileError {
    #[error("invalid payment event: {0}")]
    Validation(String),
    /// Non-retryable: the webhook names an abandonment this system never saw.
    #[error("unknown abandonment `{0}`")]
    UnknownAbandonment(String),
    #[error("repository failure: {0}")]
    Repository(#[from] RepositoryError),
}

/// Fixed mapping from the commerce platform's status vocabulary.
pub fn map_payment_status(raw: &str) -> Option<AbandonmentStatus> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "approved" | "completed" | "paid" => Some(AbandonmentStatus::Converted),
        "pending" | "in_process" | "processing" | "authorized" => Some(AbandonmentStatus::Pending),
        "rejected" | "declined" | "failed" | "cancelled" | "canceled" | "refunded"
        | "charged_back" | "expired" => Some(AbandonmentStatus::Declined),
        _ => None,
    }
}

pub struct PaymentReconciliation {
    abandonments: Arc<dyn AbandonmentRepository>,
    conversations: Arc<dyn ConversationRepository>,
}

impl PaymentReconciliation {
    pub fn new(
        abandonments: Arc<dyn AbandonmentRepository>,
        conversations: Arc<dyn ConversationRepository>,
    ) -> Self {
        Self { abandonments, conversations }
    }

    pub async fn record_payment(
        &self,
        event: PaymentEvent,
        trace_id: &str,
    ) -> Result<ReconcileOutcome, ReconcileError> {
        let event = validate(event)?;
        let Some(status) = map_payment_status(&event.status) else {
            return Err(ReconcileError::Validation(format!(
                "unknown payment status `{}`",
                event.status
            )));
        };

        if let Some(existing) = self.abandonments.find_by_payment_id(&event.payment_id).await? {
            debug!(
                event_name = "reconcile.duplicate",
                payment_id = %event.payment_id,
                abandonment_id = %existing.id,
                trace_id,
                stored_status = existing.status.as_str(),
                "payment already recorded"
            );
            return Ok(ReconcileOutcome::AlreadyProcessed {
                abandonment_id: existing.id,
                status: existing.status,
            });
        }

        let id = AbandonmentId(event.abandonment_id.clone());
        let Some(mut abandonment) = self.abandonments.find_by_id(&id).await? else {
            warn!(
                event_name = "reconcile.abandonment_unknown",
                payment_id = %event.payment_id,
                abandonment_id = %event.abandonment_id,
                trace_id,
                "payment references an abandonment this system never saw"
            );
            return Err(ReconcileError::UnknownAbandonment(event.abandonment_id));
        };

        let now = Utc::now();
        abandonment.payment_id = Some(event.payment_id.clone());
        abandonment.payment_amount = event.amount;
        abandonment.payment_currency = event.currency.clone();
        abandonment.status = status.clone();
        if status == AbandonmentStatus::Converted {
            abandonment.converted_at = Some(now);
        }
        abandonment.updated_at = now;
        self.abandonments.save(abandonment.clone()).await?;

        let mut conversation_closed = false;
        if status != AbandonmentStatus::Pending {
            let reason = match status {
                AbandonmentStatus::Converted => reasons::PAYMENT_CONVERTED,
                _ => reasons::PAYMENT_DECLINED,
            };
            if let Some(conversation) =
                self.conversations.find_by_abandonment_id(&abandonment.id).await?
            {
                conversation_closed = self.close(&conversation.id, conversation.status, reason).await?;
            }
        }

        info!(
            event_name = "reconcile.recorded",
            payment_id = %event.payment_id,
            abandonment_id = %abandonment.id,
            trace_id,
            status = status.as_str(),
            conversation_closed,
            "payment recorded"
        );
        Ok(ReconcileOutcome::Recorded {
            abandonment_id: abandonment.id,
            status,
            conversation_closed,
        })
    }

    /// Closes the conversation, reloading once if a concurrent transition
    /// wins the compare-and-set. Returns true when the conversation ends up
    /// closed.
    async fn close(
        &self,
        id: &ConversationId,
        mut current: ConversationStatus,
        reason: &str,
    ) -> Result<bool, RepositoryError> {
        for _ in 0..2 {
            if current == ConversationStatus::Closed {
                return Ok(true);
            }
            let applied = self
                .conversations
                .transition_status(id, current, ConversationStatus::Closed, Some(reason), Utc::now())
                .await?;
            if applied {
                return Ok(true);
            }
            match self.conversations.find_by_id(id).await? {
                Some(conversation) => current = conversation.status,
                None => return Ok(false),
            }
        }
        warn!(
            event_name = "reconcile.transition_raced",
            conversation_id = %id,
            "conversation kept changing status, leaving it to the winner"
        );
        Ok(false)
    }
}

fn validate(mut event: PaymentEvent) -> Result<PaymentEvent, ReconcileError> {
    event.payment_id = event.payment_id.trim().to_string();
    event.abandonment_id = event.abandonment_id.trim().to_string();

    if event.payment_id.is_empty() {
        return Err(ReconcileError::Validation("paymentId must not be empty".to_string()));
    }
    if event.abandonment_id.is_empty() {
        return Err(ReconcileError::Validation("abandonmentId must not be empty".to_string()));
    }
    if event.status.trim().is_empty() {
        return Err(ReconcileError::Validation("status must not be empty".to_string()));
    }
    if let Some(amount) = event.amount {
        if amount.is_sign_negative() {
            return Err(ReconcileError::Validation("amount must not be negative".to_string()));
        }
    }
    if let Some(currency) = &event.currency {
        let currency = currency.trim();
        if currency.len() != 3 || !currency.chars().all(|character| character.is_ascii_alphabetic())
        {
            return Err(ReconcileError::Validation(format!(
                "currency `{currency}` is not a three-letter code"
            )));
        }
        event.currency = Some(currency.to_ascii_uppercase());
    }
    Ok(event)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use rust_decimal::Decimal;

    use winback_core::domain::abandonment::{Abandonment, AbandonmentStatus};
    use winback_core::domain::conversation::{Conversation, ConversationStatus};
    use winback_core::domain::user::User;
    use winback_db::repositories::{
        AbandonmentRepository, ConversationRepository, InMemoryAbandonmentRepository,
        InMemoryConversationRepository,
    };

    use super::{
        map_payment_status, PaymentEvent, PaymentReconciliation, ReconcileError, ReconcileOutcome,
    };

    struct Harness {
        reconciliation: PaymentReconciliation,
        abandonments: Arc<InMemoryAbandonmentRepository>,
        conversations: Arc<InMemoryConversationRepository>,
    }

    fn harness() -> Harness {
        let abandonments = Arc::new(InMemoryAbandonmentRepository::default());
        let conversations = Arc::new(InMemoryConversationRepository::default());
        let reconciliation =
            PaymentReconciliation::new(abandonments.clone(), conversations.clone());
        Harness { reconciliation, abandonments, conversations }
    }

    /// Abandonment with an active conversation, as left by intake plus one
    /// customer reply.
    async fn seed(harness: &Harness) -> (Abandonment, Conversation) {
        let user = User::new("+5511999887766", Some("Ana Souza".to_string()));
        let abandonment = Abandonment::new(
            user.id.clone(),
            "EXT-100",
            "Tênis Corrida Azul",
            None,
            Decimal::new(34_990, 2),
            "BRL",
        );
        let mut conversation = Conversation::new(abandonment.id.clone(), user.id);
        conversation.status = ConversationStatus::Active;

        harness.abandonments.save(abandonment.clone()).await.unwrap();
        harness.conversations.save(conversation.clone()).await.unwrap();
        (abandonment, conversation)
    }

    fn event(abandonment: &Abandonment, status: &str) -> PaymentEvent {
        PaymentEvent {
            payment_id: "P1".to_string(),
            abandonment_id: abandonment.id.0.clone(),
            status: status.to_string(),
            amount: Some(Decimal::new(34_990, 2)),
            currency: Some("BRL".to_string()),
        }
    }

    #[test]
    fn the_status_table_is_fixed() {
        let cases = [
            ("approved", Some(AbandonmentStatus::Converted)),
            ("completed", Some(AbandonmentStatus::Converted)),
            ("paid", Some(AbandonmentStatus::Converted)),
            ("pending", Some(AbandonmentStatus::Pending)),
            ("in_process", Some(AbandonmentStatus::Pending)),
            ("processing", Some(AbandonmentStatus::Pending)),
            ("authorized", Some(AbandonmentStatus::Pending)),
            ("rejected", Some(AbandonmentStatus::Declined)),
            ("declined", Some(AbandonmentStatus::Declined)),
            ("failed", Some(AbandonmentStatus::Declined)),
            ("cancelled", Some(AbandonmentStatus::Declined)),
            ("canceled", Some(AbandonmentStatus::Declined)),
            ("refunded", Some(AbandonmentStatus::Declined)),
            ("charged_back", Some(AbandonmentStatus::Declined)),
            ("expired", Some(AbandonmentStatus::Declined)),
            ("  Approved  ", Some(AbandonmentStatus::Converted)),
            ("on_hold", None),
            ("", None),
        ];

        for (raw, expected) in cases {
            assert_eq!(map_payment_status(raw), expected, "status `{raw}`");
        }
    }

    #[tokio::test]
    async fn a_completed_payment_converts_and_closes_the_conversation() {
        let harness = harness();
        let (abandonment, conversation) = seed(&harness).await;

        let outcome = harness
            .reconciliation
            .record_payment(event(&abandonment, "completed"), "trace-t")
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::Recorded {
                abandonment_id: abandonment.id.clone(),
                status: AbandonmentStatus::Converted,
                conversation_closed: true,
            }
        );

        let stored = harness.abandonments.find_by_id(&abandonment.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AbandonmentStatus::Converted);
        assert_eq!(stored.payment_id.as_deref(), Some("P1"));
        assert_eq!(stored.payment_amount, Some(Decimal::new(34_990, 2)));
        assert!(stored.converted_at.is_some());

        let closed = harness.conversations.find_by_id(&conversation.id).await.unwrap().unwrap();
        assert_eq!(closed.status, ConversationStatus::Closed);
        assert_eq!(closed.status_reason.as_deref(), Some("payment_converted"));
    }

    #[tokio::test]
    async fn a_declined_payment_closes_with_its_own_reason() {
        let harness = harness();
        let (abandonment, conversation) = seed(&harness).await;

        let outcome = harness
            .reconciliation
            .record_payment(event(&abandonment, "charged_back"), "trace-t")
            .await
            .unwrap();

        let ReconcileOutcome::Recorded { status, conversation_closed, .. } = outcome else {
            panic!("expected a recording, got {outcome:?}");
        };
        assert_eq!(status, AbandonmentStatus::Declined);
        assert!(conversation_closed);

        let stored = harness.abandonments.find_by_id(&abandonment.id).await.unwrap().unwrap();
        assert!(stored.converted_at.is_none());

        let closed = harness.conversations.find_by_id(&conversation.id).await.unwrap().unwrap();
        assert_eq!(closed.status, ConversationStatus::Closed);
        assert_eq!(closed.status_reason.as_deref(), Some("payment_declined"));
    }

    #[tokio::test]
    async fn a_pending_payment_records_but_leaves_the_conversation_open() {
        let harness = harness();
        let (abandonment, conversation) = seed(&harness).await;

        let outcome = harness
            .reconciliation
            .record_payment(event(&abandonment, "in_process"), "trace-t")
            .await
            .unwrap();

        let ReconcileOutcome::Recorded { status, conversation_closed, .. } = outcome else {
            panic!("expected a recording, got {outcome:?}");
        };
        assert_eq!(status, AbandonmentStatus::Pending);
        assert!(!conversation_closed);

        let stored = harness.abandonments.find_by_id(&abandonment.id).await.unwrap().unwrap();
        assert_eq!(stored.payment_id.as_deref(), Some("P1"));
        assert!(stored.converted_at.is_none());

        let open = harness.conversations.find_by_id(&conversation.id).await.unwrap().unwrap();
        assert_eq!(open.status, ConversationStatus::Active);
    }

    #[tokio::test]
    async fn replays_answer_with_the_stored_status_and_change_nothing() {
        let harness = harness();
        let (abandonment, conversation) = seed(&harness).await;

        harness
            .reconciliation
            .record_payment(event(&abandonment, "pending"), "trace-1")
            .await
            .unwrap();
        let replay = harness
            .reconciliation
            .record_payment(event(&abandonment, "approved"), "trace-2")
            .await
            .unwrap();

        // Same payment id: the stored status answers, even though the replay
        // carries a different one.
        assert_eq!(
            replay,
            ReconcileOutcome::AlreadyProcessed {
                abandonment_id: abandonment.id.clone(),
                status: AbandonmentStatus::Pending,
            }
        );

        let stored = harness.abandonments.find_by_id(&abandonment.id).await.unwrap().unwrap();
        assert_eq!(stored.status, AbandonmentStatus::Pending);
        let open = harness.conversations.find_by_id(&conversation.id).await.unwrap().unwrap();
        assert_eq!(open.status, ConversationStatus::Active);
    }

    #[tokio::test]
    async fn a_new_payment_id_can_settle_a_pending_abandonment() {
        let harness = harness();
        let (abandonment, conversation) = seed(&harness).await;

        harness
            .reconciliation
            .record_payment(event(&abandonment, "pending"), "trace-1")
            .await
            .unwrap();
        let retry = PaymentEvent { payment_id: "P2".to_string(), ..event(&abandonment, "approved") };
        let outcome = harness.reconciliation.record_payment(retry, "trace-2").await.unwrap();

        let ReconcileOutcome::Recorded { status, conversation_closed, .. } = outcome else {
            panic!("expected a recording, got {outcome:?}");
        };
        assert_eq!(status, AbandonmentStatus::Converted);
        assert!(conversation_closed);

        let stored = harness.abandonments.find_by_id(&abandonment.id).await.unwrap().unwrap();
        assert_eq!(stored.payment_id.as_deref(), Some("P2"));
        let closed = harness.conversations.find_by_id(&conversation.id).await.unwrap().unwrap();
        assert_eq!(closed.status, ConversationStatus::Closed);
    }

    #[tokio::test]
    async fn unknown_abandonments_are_fatal() {
        let harness = harness();

        let event = PaymentEvent {
            payment_id: "P1".to_string(),
            abandonment_id: "ab-missing".to_string(),
            status: "approved".to_string(),
            amount: None,
            currency: None,
        };
        let error = harness.reconciliation.record_payment(event, "trace-t").await.unwrap_err();

        assert!(matches!(error, ReconcileError::UnknownAbandonment(id) if id == "ab-missing"));
    }

    #[tokio::test]
    async fn malformed_events_are_rejected() {
        let harness = harness();
        let (abandonment, _conversation) = seed(&harness).await;

        let cases = [
            PaymentEvent { payment_id: "  ".to_string(), ..event(&abandonment, "approved") },
            PaymentEvent { abandonment_id: String::new(), ..event(&abandonment, "approved") },
            PaymentEvent { amount: Some(Decimal::new(-500, 2)), ..event(&abandonment, "approved") },
            PaymentEvent { currency: Some("reais".to_string()), ..event(&abandonment, "approved") },
            event(&abandonment, "on_hold"),
        ];

        for case in cases {
            let error = harness.reconciliation.record_payment(case, "trace-t").await.unwrap_err();
            assert!(matches!(error, ReconcileError::Validation(_)), "got: {error}");
        }

        let stored = harness.abandonments.find_by_id(&abandonment.id).await.unwrap().unwrap();
        assert!(stored.payment_id.is_none());
    }

    #[tokio::test]
    async fn settlement_without_a_conversation_still_records() {
        let harness = harness();
        let user = User::new("+5511999887766", None);
        let abandonment = Abandonment::new(
            user.id,
            "EXT-102",
            "Garrafa Térmica 1L",
            None,
            Decimal::new(8_990, 2),
            "BRL",
        );
        harness.abandonments.save(abandonment.clone()).await.unwrap();

        let outcome = harness
            .reconciliation
            .record_payment(event(&abandonment, "paid"), "trace-t")
            .await
            .unwrap();

        assert_eq!(
            outcome,
            ReconcileOutcome::Recorded {
                abandonment_id: abandonment.id,
                status: AbandonmentStatus::Converted,
                conversation_closed: false,
            }
        );
    }
}
