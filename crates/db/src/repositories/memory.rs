use std::collections::HashMap;

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;

use winback_core::domain::abandonment::{Abandonment, AbandonmentId};
use winback_core::domain::conversation::{Conversation, ConversationId, ConversationStatus};
use winback_core::domain::job::{JobId, JobKind, JobState, QueueJob, QueueStats};
use winback_core::domain::message::{Message, MessageId};
use winback_core::domain::user::{User, UserId};
use winback_core::lifecycle;

use super::{
    AbandonmentRepository, ConversationRepository, MessageRepository, QueueRepository,
    RepositoryError, UserRepository,
};

#[derive(Default)]
pub struct InMemoryUserRepository {
    users: RwLock<HashMap<String, User>>,
}

#[async_trait::async_trait]
impl UserRepository for InMemoryUserRepository {
    async fn find_by_id(&self, id: &UserId) -> Result<Option<User>, RepositoryError> {
        let users = self.users.read().await;
        Ok(users.get(&id.0).cloned())
    }

    async fn find_by_address(&self, address: &str) -> Result<Option<User>, RepositoryError> {
        let users = self.users.read().await;
        Ok(users.values().find(|user| user.address == address).cloned())
    }

    async fn upsert_by_address(&self, user: User) -> Result<User, RepositoryError> {
        let mut users = self.users.write().await;

        if let Some(existing) = users.values_mut().find(|stored| stored.address == user.address) {
            if user.display_name.is_some() {
                existing.display_name = user.display_name;
            }
            existing.updated_at = user.updated_at;
            return Ok(existing.clone());
        }

        users.insert(user.id.0.clone(), user.clone());
        Ok(user)
    }

    async fn save(&self, user: User) -> Result<(), RepositoryError> {
        let mut users = self.users.write().await;
        users.insert(user.id.0.clone(), user);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryAbandonmentRepository {
    abandonments: RwLock<HashMap<String, Abandonment>>,
}

#[async_trait::async_trait]
impl AbandonmentRepository for InMemoryAbandonmentRepository {
    async fn find_by_id(&self, id: &AbandonmentId) -> Result<Option<Abandonment>, RepositoryError> {
        let abandonments = self.abandonments.read().await;
        Ok(abandonments.get(&id.0).cloned())
    }

    async fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Abandonment>, RepositoryError> {
        let abandonments = self.abandonments.read().await;
        Ok(abandonments.values().find(|row| row.external_id == external_id).cloned())
    }

    async fn find_by_payment_id(
        &self,
        payment_id: &str,
    ) -> Result<Option<Abandonment>, RepositoryError> {
        let abandonments = self.abandonments.read().await;
        Ok(abandonments.values().find(|row| row.payment_id.as_deref() == Some(payment_id)).cloned())
    }

    async fn save(&self, abandonment: Abandonment) -> Result<(), RepositoryError> {
        let mut abandonments = self.abandonments.write().await;
        abandonments.insert(abandonment.id.0.clone(), abandonment);
        Ok(())
    }
}

#[derive(Default)]
pub struct InMemoryConversationRepository {
    conversations: RwLock<HashMap<String, Conversation>>,
}

#[async_trait::async_trait]
impl ConversationRepository for InMemoryConversationRepository {
    async fn find_by_id(
        &self,
        id: &ConversationId,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let conversations = self.conversations.read().await;
        Ok(conversations.get(&id.0).cloned())
    }

    async fn find_by_abandonment_id(
        &self,
        abandonment_id: &AbandonmentId,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let conversations = self.conversations.read().await;
        Ok(conversations
            .values()
            .filter(|conversation| conversation.abandonment_id == *abandonment_id)
            .max_by_key(|conversation| conversation.created_at)
            .cloned())
    }

    async fn find_latest_by_user(
        &self,
        user_id: &UserId,
    ) -> Result<Option<Conversation>, RepositoryError> {
        let conversations = self.conversations.read().await;
        Ok(conversations
            .values()
            .filter(|conversation| conversation.user_id == *user_id)
            .max_by_key(|conversation| conversation.created_at)
            .cloned())
    }

    async fn save(&self, conversation: Conversation) -> Result<(), RepositoryError> {
        let mut conversations = self.conversations.write().await;

        let mut next = conversation;
        if let Some(existing) = conversations.get(&next.id.0) {
            next.status = existing.status;
            next.status_reason = existing.status_reason.clone();
        }
        conversations.insert(next.id.0.clone(), next);
        Ok(())
    }

    async fn transition_status(
        &self,
        id: &ConversationId,
        from: ConversationStatus,
        to: ConversationStatus,
        reason: Option<&str>,
        at: DateTime<Utc>,
    ) -> Result<bool, RepositoryError> {
        lifecycle::validate_transition(from, to)?;

        let mut conversations = self.conversations.write().await;

        match conversations.get_mut(&id.0) {
            Some(conversation) if conversation.status == from => {
                conversation.status = to;
                conversation.status_reason = reason.map(String::from);
                conversation.updated_at = at;
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[derive(Default)]
pub struct InMemoryMessageRepository {
    messages: RwLock<HashMap<String, Message>>,
}

#[async_trait::async_trait]
impl MessageRepository for InMemoryMessageRepository {
    async fn find_by_id(&self, id: &MessageId) -> Result<Option<Message>, RepositoryError> {
        let messages = self.messages.read().await;
        Ok(messages.get(&id.0).cloned())
    }

    async fn find_by_external_id(
        &self,
        external_id: &str,
    ) -> Result<Option<Message>, RepositoryError> {
        let messages = self.messages.read().await;
        Ok(messages.values().find(|row| row.external_id.as_deref() == Some(external_id)).cloned())
    }

    async fn save(&self, message: Message) -> Result<(), RepositoryError> {
        let mut messages = self.messages.write().await;

        // Mirror the append-only schema: existing rows only take backfills
        let next = match messages.get(&message.id.0) {
            Some(existing) => {
                let mut updated = existing.clone();
                updated.external_id = message.external_id;
                updated.metadata = message.metadata;
                updated.status = message.status;
                updated.error = message.error;
                updated.updated_at = message.updated_at;
                updated
            }
            None => message,
        };
        messages.insert(next.id.0.clone(), next);
        Ok(())
    }

    async fn list_recent(
        &self,
        conversation_id: &ConversationId,
        limit: u32,
    ) -> Result<Vec<Message>, RepositoryError> {
        let messages = self.messages.read().await;

        let mut history: Vec<Message> = messages
            .values()
            .filter(|message| message.conversation_id == *conversation_id)
            .cloned()
            .collect();
        history.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.0.cmp(&b.id.0)));

        let skip = history.len().saturating_sub(limit as usize);
        Ok(history.split_off(skip))
    }
}

#[derive(Default)]
pub struct InMemoryQueueRepository {
    jobs: RwLock<HashMap<String, QueueJob>>,
}

#[async_trait::async_trait]
impl QueueRepository for InMemoryQueueRepository {
    async fn find_by_id(&self, id: &JobId) -> Result<Option<QueueJob>, RepositoryError> {
        let jobs = self.jobs.read().await;
        Ok(jobs.get(&id.0).cloned())
    }

    async fn insert(&self, job: QueueJob) -> Result<(), RepositoryError> {
        let mut jobs = self.jobs.write().await;
        jobs.insert(job.id.0.clone(), job);
        Ok(())
    }

    async fn find_unsettled_by_payload(
        &self,
        kind: JobKind,
        payload_hash: &str,
    ) -> Result<Option<QueueJob>, RepositoryError> {
        let jobs = self.jobs.read().await;
        Ok(jobs
            .values()
            .find(|job| {
                job.kind == kind && job.payload_hash == payload_hash && !job.state.is_settled()
            })
            .cloned())
    }

    async fn find_due(
        &self,
        kind: JobKind,
        now: DateTime<Utc>,
        stale_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<QueueJob>, RepositoryError> {
        let jobs = self.jobs.read().await;

        let mut due: Vec<QueueJob> = jobs
            .values()
            .filter(|job| job.kind == kind)
            .filter(|job| match job.state {
                JobState::Queued | JobState::RetryableFailed => job.available_at <= now,
                JobState::Running => {
                    job.claimed_at.is_some_and(|claimed_at| claimed_at < stale_before)
                }
                JobState::Completed | JobState::FailedTerminal => false,
            })
            .cloned()
            .collect();
        due.sort_by(|a, b| {
            a.available_at.cmp(&b.available_at).then_with(|| a.created_at.cmp(&b.created_at))
        });
        due.truncate(limit as usize);
        Ok(due)
    }

    async fn update_guarded(
        &self,
        job: &QueueJob,
        expected_version: u32,
    ) -> Result<bool, RepositoryError> {
        let mut jobs = self.jobs.write().await;

        match jobs.get_mut(&job.id.0) {
            Some(stored) if stored.state_version == expected_version => {
                *stored = job.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn stats(&self, kind: JobKind, now: DateTime<Utc>) -> Result<QueueStats, RepositoryError> {
        let jobs = self.jobs.read().await;

        let mut stats = QueueStats::default();
        for job in jobs.values().filter(|job| job.kind == kind) {
            match job.state {
                JobState::Running => stats.active += 1,
                JobState::Completed => stats.completed += 1,
                JobState::FailedTerminal => stats.failed += 1,
                JobState::Queued | JobState::RetryableFailed => {
                    if job.available_at <= now {
                        stats.waiting += 1;
                    } else {
                        stats.delayed += 1;
                    }
                }
            }
        }
        Ok(stats)
    }
}
