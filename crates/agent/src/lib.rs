//! Recovery Agent - LLM-powered conversation handling for abandoned carts
//!
//! This crate provides the conversational core of the winback system - the
//! services that:
//! - Record cart abandonments and open the first contact (`intake`)
//! - Process customer replies end to end (`pipeline`)
//! - Generate reply text through a pluggable LLM provider (`interpreter`)
//! - Detect opt-out requests in two layers (`optout`)
//! - Deliver outbound messages with retries and a durable queue (`outbound`)
//! - Reconcile payment webhooks onto conversations (`reconcile`)
//!
//! # Architecture
//!
//! Inbound handling follows a constrained walk:
//! 1. **Resolution** (`pipeline`) - Webhook → conversation + user
//! 2. **Idempotency** - External message id dedup before any side effect
//! 3. **Compliance** (`optout`) - Keyword scan, then model review
//! 4. **Interpretation** (`interpreter`) - Context + history → reply text
//! 5. **Delivery** (`outbound`) - Channel send, inline retries, durable queue
//!
//! # Key Types
//!
//! - `InboundPipeline` - Main orchestrator (see `pipeline` module)
//! - `Interpreter` - Pluggable trait for OpenAI/Anthropic/Ollama
//! - `DeliveryService` - Outbound sends and their retry policy
//!
//! # Safety Principle
//!
//! The LLM is strictly a copywriter. It NEVER decides compliance, conversation
//! state, or payment outcomes. Those are deterministic decisions made by the
//! core domain rules.

pub mod intake;
pub mod interpreter;
pub mod optout;
pub mod outbound;
pub mod pipeline;
pub mod reconcile;

pub use intake::{AbandonmentEvent, AbandonmentIntake, IntakeError, IntakeOutcome};
pub use interpreter::{
    ConversationContext, HistoryTurn, HttpInterpreter, Interpreter, InterpreterError,
    InterpreterReply, ResilientInterpreter, ScriptedInterpreter,
};
pub use optout::OptOutDetector;
pub use outbound::{DeliveryOutcome, DeliveryService, DispatchError, SendResolution};
pub use pipeline::{InboundOutcome, InboundPipeline, PipelineError};
pub use reconcile::{
    map_payment_status, PaymentEvent, PaymentReconciliation, ReconcileError, ReconcileOutcome,
};
