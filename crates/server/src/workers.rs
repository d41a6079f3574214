//! Background workers for the durable job queues.
//!
//! One supervisor task per queue kind polls for due jobs and fans each batch
//! out to short-lived Tokio tasks. Claims and settlements are persisted under
//! the row's `state_version` guard, so two pollers racing the same job lose
//! cleanly instead of running it twice. Jobs that touch the same conversation
//! additionally serialize behind an in-process lock keyed by conversation id,
//! keeping status transitions single-file within one process.
//!
//! Settlement follows the error class: transient failures reschedule with the
//! engine's backoff until the attempt cap, terminal failures keep the row for
//! inspection. A terminal delivery failure is also mirrored onto the message
//! and the conversation, since from the customer's side that reply simply
//! never arrived.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use winback_agent::outbound::{DeliveryService, SendResolution};
use winback_agent::pipeline::InboundPipeline;
use winback_core::config::QueueConfig;
use winback_core::domain::conversation::ConversationStatus;
use winback_core::domain::job::{DeliveryJob, InboundJob, JobKind, JobState, QueueJob};
use winback_core::domain::message::MessageStatus;
use winback_core::lifecycle::reasons;
use winback_core::queue::{QueueEngine, RetryPolicy};
use winback_db::repositories::{ConversationRepository, MessageRepository, QueueRepository};

/// How one executed job should be settled.
enum JobVerdict {
    Done,
    Failed { detail: String, policy: RetryPolicy },
}

/// Polls both queues and drives due jobs through claim, execution, and
/// settlement. Shared behind an [`Arc`] so each poll cycle can fan out.
pub struct WorkerPool {
    queue: Arc<dyn QueueRepository>,
    engine: QueueEngine,
    pipeline: Arc<InboundPipeline>,
    delivery: Arc<DeliveryService>,
    conversations: Arc<dyn ConversationRepository>,
    messages: Arc<dyn MessageRepository>,
    inbound_concurrency: usize,
    outbound_concurrency: usize,
    poll_interval: Duration,
    claim_timeout_secs: i64,
    /// One lock per conversation currently being worked on. Entries are
    /// pruned once no task holds them anymore.
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

/// Running supervisors plus the switch that stops them.
pub struct WorkerPoolHandle {
    shutdown: watch::Sender<bool>,
    supervisors: Vec<JoinHandle<()>>,
}

impl WorkerPoolHandle {
    /// Signal every supervisor and wait for in-flight jobs to settle.
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for supervisor in self.supervisors {
            let _ = supervisor.await;
        }
    }
}

impl WorkerPool {
    pub fn new(
        queue: Arc<dyn QueueRepository>,
        engine: QueueEngine,
        pipeline: Arc<InboundPipeline>,
        delivery: Arc<DeliveryService>,
        conversations: Arc<dyn ConversationRepository>,
        messages: Arc<dyn MessageRepository>,
        config: &QueueConfig,
    ) -> Self {
        Self {
            queue,
            engine,
            pipeline,
            delivery,
            conversations,
            messages,
            inbound_concurrency: config.inbound_concurrency,
            outbound_concurrency: config.outbound_concurrency,
            poll_interval: Duration::from_millis(config.poll_interval_ms),
            claim_timeout_secs: config.claim_timeout_secs,
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Spawn one supervisor per queue kind and hand back their shutdown
    /// switch.
    pub fn start(self: Arc<Self>) -> WorkerPoolHandle {
        let (shutdown, _) = watch::channel(false);
        let mut supervisors = Vec::with_capacity(2);

        for kind in [JobKind::InboundMessage, JobKind::OutboundDelivery] {
            let pool = Arc::clone(&self);
            let receiver = shutdown.subscribe();
            supervisors.push(tokio::spawn(pool.run_queue(kind, receiver)));
        }

        WorkerPoolHandle { shutdown, supervisors }
    }

    async fn run_queue(self: Arc<Self>, kind: JobKind, mut shutdown: watch::Receiver<bool>) {
        let worker_id = format!("winback-{}-{}", kind.as_str(), Uuid::new_v4().simple());
        info!(
            event_name = "worker.started",
            kind = kind.as_str(),
            worker_id = %worker_id,
            "queue worker started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            Arc::clone(&self).drain(kind, &worker_id).await;

            tokio::select! {
                _ = shutdown.changed() => {}
                _ = tokio::time::sleep(self.poll_interval) => {}
            }
        }

        info!(
            event_name = "worker.stopped",
            kind = kind.as_str(),
            worker_id = %worker_id,
            "queue worker stopped"
        );
    }

    /// One poll cycle: fetch due jobs for `kind` and run them concurrently,
    /// waiting for the whole batch before returning.
    async fn drain(self: Arc<Self>, kind: JobKind, worker_id: &str) {
        let limit = match kind {
            JobKind::InboundMessage => self.inbound_concurrency,
            JobKind::OutboundDelivery => self.outbound_concurrency,
        };
        let now = Utc::now();
        let stale_before = now - chrono::Duration::seconds(self.claim_timeout_secs);

        let due = match self.queue.find_due(kind, now, stale_before, limit as u32).await {
            Ok(due) => due,
            Err(error) => {
                warn!(
                    event_name = "worker.poll_failed",
                    kind = kind.as_str(),
                    %error,
                    "could not poll for due jobs"
                );
                return;
            }
        };

        let mut running = Vec::with_capacity(due.len());
        for job in due {
            let pool = Arc::clone(&self);
            let worker_id = worker_id.to_string();
            running.push(tokio::spawn(async move { pool.run_job(job, worker_id).await }));
        }
        for task in running {
            if let Err(error) = task.await {
                warn!(
                    event_name = "worker.task_panicked",
                    kind = kind.as_str(),
                    %error,
                    "job task aborted"
                );
            }
        }
    }

    /// Claim the job under its stored version, then dispatch on kind. A lost
    /// claim is routine when pollers overlap; it only means someone else ran
    /// the job.
    async fn run_job(self: Arc<Self>, job: QueueJob, worker_id: String) {
        let stored_version = job.state_version;
        let job_id = job.id.clone();
        let kind = job.kind;

        let claimed = match self.engine.claim(job, worker_id) {
            Ok(claimed) => claimed,
            Err(error) => {
                debug!(
                    event_name = "worker.claim_skipped",
                    job_id = %job_id,
                    %error,
                    "job not claimable"
                );
                return;
            }
        };

        match self.queue.update_guarded(&claimed, stored_version).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(
                    event_name = "worker.claim_raced",
                    job_id = %job_id,
                    "lost the claim race"
                );
                return;
            }
            Err(error) => {
                warn!(
                    event_name = "worker.claim_write_failed",
                    job_id = %job_id,
                    %error,
                    "could not persist the claim"
                );
                return;
            }
        }

        match kind {
            JobKind::InboundMessage => self.run_inbound(claimed).await,
            JobKind::OutboundDelivery => self.run_outbound(claimed).await,
        }
    }

    async fn run_inbound(&self, job: QueueJob) {
        let payload: InboundJob = match serde_json::from_str(&job.payload_json) {
            Ok(payload) => payload,
            Err(error) => {
                let detail = format!("inbound payload did not decode: {error}");
                self.settle(
                    job,
                    JobVerdict::Failed { detail, policy: RetryPolicy::FailTerminal },
                )
                .await;
                return;
            }
        };

        // Webhooks for brand-new conversations carry no conversation id yet;
        // the sender address is the closest stable key.
        let lock_key = payload
            .conversation_id
            .as_ref()
            .map(|id| id.0.clone())
            .unwrap_or_else(|| payload.recipient_address.clone());
        let lock = self.lock_for(&lock_key).await;
        {
            let _serialized = lock.lock().await;

            let verdict = match self.pipeline.process(&payload).await {
                Ok(outcome) => {
                    debug!(
                        event_name = "worker.inbound_processed",
                        job_id = %job.id,
                        trace_id = %payload.trace_id,
                        processed = outcome.processed(),
                        "inbound job finished"
                    );
                    JobVerdict::Done
                }
                Err(error) => {
                    let policy = if error.is_transient() {
                        RetryPolicy::Retry
                    } else {
                        RetryPolicy::FailTerminal
                    };
                    JobVerdict::Failed { detail: error.to_string(), policy }
                }
            };

            self.settle(job, verdict).await;
        }
        drop(lock);
        self.release(&lock_key).await;
    }

    async fn run_outbound(&self, job: QueueJob) {
        let payload: DeliveryJob = match serde_json::from_str(&job.payload_json) {
            Ok(payload) => payload,
            Err(error) => {
                let detail = format!("delivery payload did not decode: {error}");
                self.settle(
                    job,
                    JobVerdict::Failed { detail, policy: RetryPolicy::FailTerminal },
                )
                .await;
                return;
            }
        };

        let lock_key = payload.conversation_id.0.clone();
        let lock = self.lock_for(&lock_key).await;
        {
            let _serialized = lock.lock().await;

            let verdict = match self.delivery.send(&payload).await {
                SendResolution::Sent { external_id } => {
                    debug!(
                        event_name = "worker.delivery_sent",
                        job_id = %job.id,
                        message_id = %payload.message_id,
                        external_id = %external_id,
                        trace_id = %payload.trace_id,
                        "outbound job delivered"
                    );
                    JobVerdict::Done
                }
                SendResolution::Abandoned { detail } => {
                    JobVerdict::Failed { detail, policy: RetryPolicy::FailTerminal }
                }
                SendResolution::Exhausted { detail } => {
                    JobVerdict::Failed { detail, policy: RetryPolicy::Retry }
                }
            };

            let settled = self.settle(job, verdict).await;
            if let Some(settled) = settled {
                if settled.state == JobState::FailedTerminal {
                    let detail = settled.last_error.as_deref().unwrap_or("delivery failed");
                    self.record_delivery_breakdown(&payload, detail).await;
                }
            }
        }
        drop(lock);
        self.release(&lock_key).await;
    }

    /// Apply the verdict through the engine and persist it under the claimed
    /// version. Returns the stored job, or `None` when the write lost a race.
    async fn settle(&self, job: QueueJob, verdict: JobVerdict) -> Option<QueueJob> {
        let claimed_version = job.state_version;
        let job_id = job.id.clone();

        let settled = match verdict {
            JobVerdict::Done => self.engine.complete(job),
            JobVerdict::Failed { detail, policy } => self.engine.fail(job, detail, policy),
        };
        let settled = match settled {
            Ok(settled) => settled,
            Err(error) => {
                warn!(
                    event_name = "worker.settle_rejected",
                    job_id = %job_id,
                    %error,
                    "illegal queue transition"
                );
                return None;
            }
        };

        match self.queue.update_guarded(&settled, claimed_version).await {
            Ok(true) => {}
            Ok(false) => {
                warn!(
                    event_name = "worker.settle_raced",
                    job_id = %job_id,
                    "job row changed underneath the worker"
                );
                return None;
            }
            Err(error) => {
                warn!(
                    event_name = "worker.settle_write_failed",
                    job_id = %job_id,
                    %error,
                    "could not persist the settled job"
                );
                return None;
            }
        }

        match settled.state {
            JobState::Completed => {
                debug!(
                    event_name = "worker.job_completed",
                    job_id = %job_id,
                    attempt = settled.attempt_count,
                    "job settled"
                );
            }
            JobState::RetryableFailed => {
                info!(
                    event_name = "worker.job_rescheduled",
                    job_id = %job_id,
                    attempt = settled.attempt_count,
                    available_at = %settled.available_at,
                    error = settled.last_error.as_deref().unwrap_or_default(),
                    "job rescheduled after failure"
                );
            }
            JobState::FailedTerminal => {
                warn!(
                    event_name = "worker.job_failed_terminal",
                    job_id = %job_id,
                    attempt = settled.attempt_count,
                    error = settled.last_error.as_deref().unwrap_or_default(),
                    "job failed for good; row kept for inspection"
                );
            }
            JobState::Queued | JobState::Running => {}
        }

        Some(settled)
    }

    /// Mirror a terminal delivery failure onto the message row and park the
    /// conversation. An engaged conversation waits in `Error` until the
    /// customer writes again; an opening that never went out closes outright,
    /// since `AwaitingResponse` has no path to `Error`.
    async fn record_delivery_breakdown(&self, payload: &DeliveryJob, detail: &str) {
        match self.messages.find_by_id(&payload.message_id).await {
            Ok(Some(mut message)) => {
                if message.status != MessageStatus::Failed {
                    message.status = MessageStatus::Failed;
                    message.error = Some(detail.to_string());
                    message.updated_at = Utc::now();
                    if let Err(error) = self.messages.save(message).await {
                        warn!(
                            event_name = "worker.breakdown_mirror_failed",
                            message_id = %payload.message_id,
                            %error,
                            "could not mark the message failed"
                        );
                    }
                }
            }
            Ok(None) => {
                warn!(
                    event_name = "worker.breakdown_mirror_failed",
                    message_id = %payload.message_id,
                    "message row missing"
                );
            }
            Err(error) => {
                warn!(
                    event_name = "worker.breakdown_mirror_failed",
                    message_id = %payload.message_id,
                    %error,
                    "could not load the message"
                );
            }
        }

        let conversation = match self.conversations.find_by_id(&payload.conversation_id).await {
            Ok(Some(conversation)) => conversation,
            Ok(None) => {
                warn!(
                    event_name = "worker.breakdown_transition_failed",
                    conversation_id = %payload.conversation_id,
                    "conversation row missing"
                );
                return;
            }
            Err(error) => {
                warn!(
                    event_name = "worker.breakdown_transition_failed",
                    conversation_id = %payload.conversation_id,
                    %error,
                    "could not load the conversation"
                );
                return;
            }
        };

        let target = match conversation.status {
            ConversationStatus::Active => ConversationStatus::Error,
            ConversationStatus::AwaitingResponse => ConversationStatus::Closed,
            ConversationStatus::Closed | ConversationStatus::Error => return,
        };

        match self
            .conversations
            .transition_status(
                &payload.conversation_id,
                conversation.status,
                target,
                Some(reasons::DELIVERY_FAILED),
                Utc::now(),
            )
            .await
        {
            Ok(true) => {
                info!(
                    event_name = "worker.conversation_parked",
                    conversation_id = %payload.conversation_id,
                    status = target.as_str(),
                    "conversation parked after terminal delivery failure"
                );
            }
            Ok(false) => {
                debug!(
                    event_name = "worker.conversation_park_raced",
                    conversation_id = %payload.conversation_id,
                    "status moved concurrently; leaving it"
                );
            }
            Err(error) => {
                warn!(
                    event_name = "worker.breakdown_transition_failed",
                    conversation_id = %payload.conversation_id,
                    %error,
                    "could not park the conversation"
                );
            }
        }
    }

    async fn lock_for(&self, key: &str) -> Arc<Mutex<()>> {
        let mut locks = self.locks.lock().await;
        locks.entry(key.to_string()).or_default().clone()
    }

    /// Prune the registry entry once only the map itself still holds it.
    async fn release(&self, key: &str) {
        let mut locks = self.locks.lock().await;
        if let Some(entry) = locks.get(key) {
            if Arc::strong_count(entry) == 1 {
                locks.remove(key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::{Duration as ChronoDuration, Utc};
    use rust_decimal::Decimal;

    use winback_channel::template::TemplateEngine;
    use winback_channel::transport::{ChannelError, ScriptedTransport, SendReceipt};
    use winback_core::config::{ChannelConfig, QueueConfig};
    use winback_core::domain::abandonment::Abandonment;
    use winback_core::domain::conversation::{Conversation, ConversationStatus};
    use winback_core::domain::job::{
        DeliveryJob, InboundJob, JobKind, JobState, OutboundContent, QueueJob,
    };
    use winback_core::domain::message::{Message, MessageStatus, MessageType};
    use winback_core::domain::user::User;
    use winback_core::queue::{QueueEngine, QueueEngineConfig};
    use winback_db::repositories::{
        AbandonmentRepository, ConversationRepository, InMemoryAbandonmentRepository,
        InMemoryConversationRepository, InMemoryMessageRepository, InMemoryQueueRepository,
        InMemoryUserRepository, MessageRepository, QueueRepository, UserRepository,
    };

    use winback_agent::interpreter::{InterpreterError, ScriptedInterpreter};
    use winback_agent::optout::OptOutDetector;
    use winback_agent::outbound::DeliveryService;
    use winback_agent::pipeline::InboundPipeline;

    use super::WorkerPool;

    struct Harness {
        pool: Arc<WorkerPool>,
        queue: Arc<InMemoryQueueRepository>,
        users: Arc<InMemoryUserRepository>,
        abandonments: Arc<InMemoryAbandonmentRepository>,
        conversations: Arc<InMemoryConversationRepository>,
        messages: Arc<InMemoryMessageRepository>,
        transport: Arc<ScriptedTransport>,
        engine: QueueEngine,
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

    fn queue_config() -> QueueConfig {
        QueueConfig {
            max_attempts: 5,
            // Reschedules are due immediately; the tests drive drain() by hand.
            base_delay_secs: 0,
            backoff_multiplier: 2,
            claim_timeout_secs: 300,
            inbound_concurrency: 5,
            outbound_concurrency: 10,
            poll_interval_ms: 100,
        }
    }

    fn harness(
        interpreter: ScriptedInterpreter,
        transport: ScriptedTransport,
        config: QueueConfig,
    ) -> Harness {
        let users = Arc::new(InMemoryUserRepository::default());
        let abandonments = Arc::new(InMemoryAbandonmentRepository::default());
        let conversations = Arc::new(InMemoryConversationRepository::default());
        let messages = Arc::new(InMemoryMessageRepository::default());
        let queue = Arc::new(InMemoryQueueRepository::default());
        let transport = Arc::new(transport);
        let interpreter = Arc::new(interpreter);
        let engine = QueueEngine::with_config(QueueEngineConfig::from(&config));

        let delivery = Arc::new(DeliveryService::new(
            transport.clone(),
            Arc::new(TemplateEngine::new().unwrap()),
            messages.clone(),
            conversations.clone(),
            queue.clone(),
            engine.clone(),
            channel_config(),
        ));
        let pipeline = Arc::new(InboundPipeline::new(
            users.clone(),
            abandonments.clone(),
            conversations.clone(),
            messages.clone(),
            interpreter.clone(),
            OptOutDetector::new(interpreter.clone()),
            delivery.clone(),
            10,
        ));
        let pool = Arc::new(WorkerPool::new(
            queue.clone(),
            engine.clone(),
            pipeline,
            delivery,
            conversations.clone(),
            messages.clone(),
            &config,
        ));

        Harness {
            pool,
            queue,
            users,
            abandonments,
            conversations,
            messages,
            transport,
            engine,
        }
    }

    /// User, abandonment, engaged conversation, and the sent opening message,
    /// the way intake leaves them.
    async fn seed_engaged(harness: &Harness) -> (User, Abandonment, Conversation) {
        let user = User::new("+5511999887766", Some("Ana Souza".to_string()));
        let abandonment = Abandonment::new(
            user.id.clone(),
            "EXT-100",
            "Tênis Corrida Azul",
            None,
            Decimal::new(34_990, 2),
            "BRL",
        );
        let mut conversation = Conversation::new(abandonment.id.clone(), user.id.clone());
        conversation.cycle_count = 1;
        conversation.message_count = 1;

        let mut opening = Message::outbound(
            conversation.id.clone(),
            "Oi, Ana! Vi que o produto Tênis Corrida Azul ficou no seu carrinho.",
            MessageType::Template,
        );
        opening.status = MessageStatus::Sent;
        opening.external_id = Some("wamid.opening".to_string());

        harness.users.save(user.clone()).await.unwrap();
        harness.abandonments.save(abandonment.clone()).await.unwrap();
        harness.conversations.save(conversation.clone()).await.unwrap();
        harness.messages.save(opening).await.unwrap();

        (user, abandonment, conversation)
    }

    async fn enqueue_inbound(
        harness: &Harness,
        conversation: &Conversation,
        external_id: &str,
        text: &str,
    ) -> QueueJob {
        let payload = InboundJob {
            conversation_id: Some(conversation.id.clone()),
            external_message_id: external_id.to_string(),
            recipient_address: "+5511999887766".to_string(),
            text: text.to_string(),
            trace_id: "trace-t".to_string(),
        };
        let job = harness.engine.create_job(
            JobKind::InboundMessage,
            Some(conversation.id.clone()),
            serde_json::to_string(&payload).unwrap(),
        );
        harness.queue.insert(job.clone()).await.unwrap();
        job
    }

    /// Pending reply row plus the delivery job that should send it.
    async fn enqueue_outbound(
        harness: &Harness,
        conversation: &Conversation,
    ) -> (Message, QueueJob) {
        let reply = Message::outbound(
            conversation.id.clone(),
            "Temos sim! Posso fechar o pedido?",
            MessageType::Text,
        );
        harness.messages.save(reply.clone()).await.unwrap();

        let payload = DeliveryJob {
            conversation_id: conversation.id.clone(),
            recipient_address: "+5511999887766".to_string(),
            message_id: reply.id.clone(),
            content: OutboundContent::text(reply.text.clone()),
            proactive: false,
            trace_id: "trace-t".to_string(),
        };
        let job = harness.engine.create_job(
            JobKind::OutboundDelivery,
            Some(conversation.id.clone()),
            serde_json::to_string(&payload).unwrap(),
        );
        harness.queue.insert(job.clone()).await.unwrap();
        (reply, job)
    }

    async fn drain(harness: &Harness, kind: JobKind) {
        Arc::clone(&harness.pool).drain(kind, "test-worker").await;
    }

    async fn stored_job(harness: &Harness, job: &QueueJob) -> QueueJob {
        harness.queue.find_by_id(&job.id).await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn inbound_job_runs_the_pipeline_and_completes() {
        let harness = harness(
            ScriptedInterpreter::replying("Temos sim! Posso fechar o pedido?"),
            ScriptedTransport::accepting("wamid.50"),
            queue_config(),
        );
        let (_user, _abandonment, conversation) = seed_engaged(&harness).await;
        let job = enqueue_inbound(&harness, &conversation, "wamid.10", "vocês têm em tamanho 42?")
            .await;

        drain(&harness, JobKind::InboundMessage).await;

        let settled = stored_job(&harness, &job).await;
        assert_eq!(settled.state, JobState::Completed);
        assert_eq!(settled.attempt_count, 1);
        assert!(settled.claimed_by.is_none());

        let sent = harness.transport.sent().await;
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].1, "Temos sim! Posso fechar o pedido?");
        let stored = harness.conversations.find_by_id(&conversation.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ConversationStatus::Active);
    }

    #[tokio::test]
    async fn transient_inbound_failure_reschedules_the_job() {
        let harness = harness(
            ScriptedInterpreter::with_outcomes(vec![Err(InterpreterError::RateLimited(
                "429 too many requests".to_string(),
            ))]),
            ScriptedTransport::with_outcomes(vec![]),
            queue_config(),
        );
        let (_user, _abandonment, conversation) = seed_engaged(&harness).await;
        let job = enqueue_inbound(&harness, &conversation, "wamid.11", "ainda tem?").await;

        drain(&harness, JobKind::InboundMessage).await;

        let settled = stored_job(&harness, &job).await;
        assert_eq!(settled.state, JobState::RetryableFailed);
        assert_eq!(settled.attempt_count, 1);
        assert!(settled.last_error.as_deref().unwrap().contains("rate limited"));
        assert!(harness.transport.sent().await.is_empty());
    }

    #[tokio::test]
    async fn undecodable_inbound_payload_fails_terminally() {
        let harness = harness(
            ScriptedInterpreter::with_outcomes(vec![]),
            ScriptedTransport::with_outcomes(vec![]),
            queue_config(),
        );
        let job = harness.engine.create_job(JobKind::InboundMessage, None, "not json");
        harness.queue.insert(job.clone()).await.unwrap();

        drain(&harness, JobKind::InboundMessage).await;

        let settled = stored_job(&harness, &job).await;
        assert_eq!(settled.state, JobState::FailedTerminal);
        assert!(settled.last_error.as_deref().unwrap().contains("did not decode"));
    }

    #[tokio::test]
    async fn interpreter_auth_failure_is_terminal() {
        let harness = harness(
            ScriptedInterpreter::with_outcomes(vec![Err(InterpreterError::Auth(
                "401 bad key".to_string(),
            ))]),
            ScriptedTransport::with_outcomes(vec![]),
            queue_config(),
        );
        let (_user, _abandonment, conversation) = seed_engaged(&harness).await;
        let job = enqueue_inbound(&harness, &conversation, "wamid.12", "oi").await;

        drain(&harness, JobKind::InboundMessage).await;

        let settled = stored_job(&harness, &job).await;
        assert_eq!(settled.state, JobState::FailedTerminal);
        assert_eq!(settled.attempt_count, 1);
    }

    #[tokio::test]
    async fn outbound_job_sends_and_completes() {
        let harness = harness(
            ScriptedInterpreter::with_outcomes(vec![]),
            ScriptedTransport::accepting("wamid.60"),
            queue_config(),
        );
        let (_user, _abandonment, conversation) = seed_engaged(&harness).await;
        harness
            .conversations
            .transition_status(
                &conversation.id,
                ConversationStatus::AwaitingResponse,
                ConversationStatus::Active,
                Some("user_replied"),
                Utc::now(),
            )
            .await
            .unwrap();
        let (reply, job) = enqueue_outbound(&harness, &conversation).await;

        drain(&harness, JobKind::OutboundDelivery).await;

        let settled = stored_job(&harness, &job).await;
        assert_eq!(settled.state, JobState::Completed);
        let message = harness.messages.find_by_id(&reply.id).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Sent);
        assert_eq!(message.external_id.as_deref(), Some("wamid.60"));
    }

    #[tokio::test(start_paused = true)]
    async fn exhausted_delivery_parks_the_conversation_in_error() {
        let rate_limited = || Err(ChannelError::RateLimited("429".to_string()));
        let harness = harness(
            ScriptedInterpreter::with_outcomes(vec![]),
            // Two drains, four in-process attempts each.
            ScriptedTransport::with_outcomes((0..8).map(|_| rate_limited()).collect()),
            QueueConfig { max_attempts: 2, ..queue_config() },
        );
        let (_user, _abandonment, conversation) = seed_engaged(&harness).await;
        harness
            .conversations
            .transition_status(
                &conversation.id,
                ConversationStatus::AwaitingResponse,
                ConversationStatus::Active,
                Some("user_replied"),
                Utc::now(),
            )
            .await
            .unwrap();
        let (reply, job) = enqueue_outbound(&harness, &conversation).await;

        drain(&harness, JobKind::OutboundDelivery).await;
        let after_first = stored_job(&harness, &job).await;
        assert_eq!(after_first.state, JobState::RetryableFailed);

        drain(&harness, JobKind::OutboundDelivery).await;

        let settled = stored_job(&harness, &job).await;
        assert_eq!(settled.state, JobState::FailedTerminal);
        assert_eq!(settled.attempt_count, 2);

        let message = harness.messages.find_by_id(&reply.id).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Failed);
        let stored = harness.conversations.find_by_id(&conversation.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ConversationStatus::Error);
        assert_eq!(stored.status_reason.as_deref(), Some("delivery_failed"));
    }

    #[tokio::test]
    async fn rejected_opening_closes_the_awaiting_conversation() {
        let harness = harness(
            ScriptedInterpreter::with_outcomes(vec![]),
            ScriptedTransport::with_outcomes(vec![Err(ChannelError::Auth(
                "401 invalid token".to_string(),
            ))]),
            queue_config(),
        );
        let (_user, _abandonment, conversation) = seed_engaged(&harness).await;
        let (reply, job) = enqueue_outbound(&harness, &conversation).await;

        drain(&harness, JobKind::OutboundDelivery).await;

        let settled = stored_job(&harness, &job).await;
        assert_eq!(settled.state, JobState::FailedTerminal);
        assert_eq!(settled.attempt_count, 1);

        let message = harness.messages.find_by_id(&reply.id).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Failed);
        assert!(message.error.as_deref().unwrap().contains("401"));
        let stored = harness.conversations.find_by_id(&conversation.id).await.unwrap().unwrap();
        assert_eq!(stored.status, ConversationStatus::Closed);
        assert_eq!(stored.status_reason.as_deref(), Some("delivery_failed"));
    }

    #[tokio::test]
    async fn stale_running_claims_are_stolen() {
        let harness = harness(
            ScriptedInterpreter::with_outcomes(vec![]),
            ScriptedTransport::accepting("wamid.70"),
            queue_config(),
        );
        let (_user, _abandonment, conversation) = seed_engaged(&harness).await;
        harness
            .conversations
            .transition_status(
                &conversation.id,
                ConversationStatus::AwaitingResponse,
                ConversationStatus::Active,
                Some("user_replied"),
                Utc::now(),
            )
            .await
            .unwrap();
        let (reply, job) = enqueue_outbound(&harness, &conversation).await;

        // A crashed worker left the job running past the claim timeout.
        let mut abandoned = harness.engine.claim(job.clone(), "worker-crashed").unwrap();
        abandoned.claimed_at = Some(Utc::now() - ChronoDuration::seconds(600));
        assert!(harness.queue.update_guarded(&abandoned, job.state_version).await.unwrap());

        drain(&harness, JobKind::OutboundDelivery).await;

        let settled = stored_job(&harness, &job).await;
        assert_eq!(settled.state, JobState::Completed);
        assert_eq!(settled.attempt_count, 2);
        let message = harness.messages.find_by_id(&reply.id).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Sent);
    }

    #[tokio::test(start_paused = true)]
    async fn started_pool_consumes_jobs_until_shutdown() {
        let harness = harness(
            ScriptedInterpreter::with_outcomes(vec![]),
            ScriptedTransport::with_outcomes(vec![Ok(SendReceipt {
                external_id: "wamid.80".to_string(),
            })]),
            queue_config(),
        );
        let (_user, _abandonment, conversation) = seed_engaged(&harness).await;
        harness
            .conversations
            .transition_status(
                &conversation.id,
                ConversationStatus::AwaitingResponse,
                ConversationStatus::Active,
                Some("user_replied"),
                Utc::now(),
            )
            .await
            .unwrap();
        let (reply, job) = enqueue_outbound(&harness, &conversation).await;

        let handle = Arc::clone(&harness.pool).start();
        tokio::time::sleep(std::time::Duration::from_millis(700)).await;
        handle.shutdown().await;

        let settled = stored_job(&harness, &job).await;
        assert_eq!(settled.state, JobState::Completed);
        let message = harness.messages.find_by_id(&reply.id).await.unwrap().unwrap();
        assert_eq!(message.status, MessageStatus::Sent);
    }
}
