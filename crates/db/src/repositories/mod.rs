use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use winback_core::domain::abandonment::{Abandonment, AbandonmentId};
use winback_core::domain::conversation::{Conversation, ConversationId, ConversationStatus};
use winback_core::domain::job::{JobId, JobKind, QueueJob, QueueStats};
use winback_core::domain::message::{Message, MessageId};
use winback_core::domain::user::{User, UserId};
use winback_core::lifecycle::TransitionError;

pub mod abandonment;
pub mod conversation;
pub mod memory;
pub mod message;
pub mod queue;
pub mod user;

pub use abandonment::SqlAbandonmentRepository;
pub use conversation::SqlConversationRepository;
pub use memory::{
    InMemoryAbandonmentRepository, InMemoryConversationRepository, InMemoryMessageRepository,
    InMemoryQueueRepository, InMemoryUserRepository,
};
pub use message::SqlMessageRepository;
pub use queue::SqlQueueRepository;
pub use user::SqlUserRepository;

#[derive(Debug, Error)]
pub enum RepositoryError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("decode error: {0}")]
    Decode(String),
    #[error(transparent)]
    InvalidTransition(#[from] TransitionError),
}

#[async_trait]
pub trait UserRepository: Send + Sync {
    async fn find_by_id(&self, id: &UserId) -> Result<Option<User>, RepositoryError>;

    async fn find_by_address(&self, address: &str) -> Result<Option<User>, RepositoryError>;

    /// Insert the user, or return the row already holding this address.
    /// A fresh display name overwrites an absent one; opt-out fields on an
    /// existing row are never touched by this path.
    async fn upsert_by_address(&self, user: User) -> Result<User, RepositoryError>;

    async fn save(&self, user: User) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait AbandonmentRepository: Send + Sync {
    async fn find_by_id(&self, id: &AbandonmentId) -> Result<Option<Abandonment>, RepositoryError>;

    async fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Abandonment>, RepositoryError>;

    async fn find_by_payment_id(
        &self,
        payment_id: &str,
    ) -> Result<Option<Abandonment>, RepositoryError>;

    async fn save(&self, abandonment: Abandonment) -> Result<(), RepositoryError>;
}

#[async_trait]
pub trait ConversationRepository: Send + Sync {
    async fn find_by_id(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError>;

    async fn find_by_abandonment_id(
        &self,
        abandonment_id: &AbandonmentId,
    ) -> Result<Option<Conversation>, RepositoryError>;

    /// Most recently created conversation for the user, regardless of status.
    async fn find_latest_by_user(
        &self,
        user_id: &UserId,
    ) -> Result<Option<Conversation>, RepositoryError>;

    /// Persist everything except `status`/`status_reason`, which advance only
    /// through [`ConversationRepository::transition_status`] so a stale
    /// snapshot can never roll a conversation backwards.
    async fn save(&self, conversation: Conversation) -> Result<(), RepositoryError>;

    /// Compare-and-set status change. Pairs outside the lifecycle table are
    /// rejected outright; returns false when the row no longer holds `from`,
    /// in which case the caller must reload and re-decide.
    async fn transition_status(
        &self,
        id: &ConversationId,
        from: ConversationStatus,
        to: ConversationStatus,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError>;
}

#[async_trait]
pub trait MessageRepository: Send + Sync {
    async fn find_by_id(&self, id: &MessageId) -> Result<Option<Message>, RepositoryError>;

    async fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Message>, RepositoryError>;

    async fn save(&self, message: Message) -> Result<(), RepositoryError>;

    /// The newest `limit` messages of the conversation in chronological order.
    async fn list_recent(
        &self,
        conversation_id: &ConversationId,
        limit: u32,
    ) -> Result<Vec<Message>, RepositoryError>;
}

#[async_trait]
pub trait QueueRepository: Send + Sync {
    async fn find_by_id(&self, id: &JobId) -> Result<Option<QueueJob>, RepositoryError>;

    async fn insert(&self, job: QueueJob) -> Result<(), RepositoryError>;

    /// Unsettled job carrying the same payload, used as the duplicate-enqueue
    /// guard before insert.
    async fn find_unsettled_by_payload(
        &self,
        kind: JobKind,
        payload_hash: &str,
    ) -> Result<Option<QueueJob>, RepositoryError>;

    /// Jobs a worker may claim right now: queued or retryable jobs whose
    /// `available_at` has passed, plus running jobs whose claim lapsed before
    /// `stale_before`.
    async fn find_due(
        &self,
        kind: JobKind,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<QueueJob>, RepositoryError>;

    /// Persist a transitioned job if the stored row still carries
    /// `expected_version`. Returns false when another worker won the race.
    async fn update_guarded(
        &self,
        job: &QueueJob,
        expected_version: u32,
    ) -> Result<bool, RepositoryError>;

    async fn stats(&self, kind: JobKind, now: DateTime<Utc>) -> Result<QueueStats, RepositoryError>;
}
