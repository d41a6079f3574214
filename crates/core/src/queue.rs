//! Durable job queue state machine.
//!
//! Pure transition logic for queue jobs: which transitions are legal, when a
//! claim has gone stale, and how retry backoff is scheduled. Persistence and
//! the duplicate-enqueue guard live in the repository layer; this module only
//! decides what the next state of a job is.

use chrono::{Duration, Utc};
use thiserror::Error;

use crate::domain::conversation::ConversationId;
use crate::domain::job::{new_job_id, JobId, JobKind, JobState, QueueJob};

/// Configuration for the queue engine
#[derive(Clone, Debug)]
pub struct QueueEngineConfig {
    /// How long before a claimed job is considered stale
    pub claim_timeout_seconds: i64,
    /// Attempts before a retryable failure becomes terminal
    pub max_attempts: u32,
    /// Backoff multiplier between retries
    pub backoff_multiplier: u32,
    /// Base delay in seconds between retries
    pub base_delay_seconds: i64,
}

impl Default for QueueEngineConfig {
    fn default() -> Self {
        Self {
            claim_timeout_seconds: 300, // 5 minutes
            max_attempts: 5,
            backoff_multiplier: 2,
            base_delay_seconds: 5,
        }
    }
}

impl From<&crate::config::QueueConfig> for QueueEngineConfig {
    fn from(value: &crate::config::QueueConfig) -> Self {
        Self {
            claim_timeout_seconds: value.claim_timeout_secs,
            max_attempts: value.max_attempts,
            backoff_multiplier: value.backoff_multiplier,
            base_delay_seconds: value.base_delay_secs,
        }
    }
}

/// Errors that can occur while driving a job through the queue
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("invalid job transition from {from:?} to {to:?}: {reason}")]
    InvalidTransition { from: JobState, to: JobState, reason: String },
    #[error("claim conflict: job {0} already claimed by {1}")]
    ClaimConflict(JobId, String),
    #[error("job not yet due: {0}")]
    NotYetDue(JobId),
}

/// Policy for handling failures
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RetryPolicy {
    /// Retry with exponential backoff
    Retry,
    /// Mark as failed terminal, no more retries
    FailTerminal,
}

/// Queue engine
///
/// Jobs pass through here by value: callers load a row, apply a transition,
/// and persist the result under the row's `state_version` guard.
#[derive(Clone, Debug, Default)]
pub struct QueueEngine {
    config: QueueEngineConfig,
}

impl QueueEngine {
    /// Create a new engine with default configuration
    pub fn new() -> Self {
        Self::with_config(QueueEngineConfig::default())
    }

    /// Create a new engine with custom configuration
    pub fn with_config(config: QueueEngineConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &QueueEngineConfig {
        &self.config
    }

    /// Create a new job ready for enqueueing
    ///
    /// The payload hash is what the repository layer compares against
    /// unsettled jobs to reject duplicate enqueues.
    pub fn create_job(
        &self,
        kind: JobKind,
        conversation_id: Option<ConversationId>,
        payload_json: impl Into<String>,
    ) -> QueueJob {
        let now = Utc::now();
        let payload_json = payload_json.into();

        QueueJob {
            id: new_job_id(),
            kind,
            conversation_id,
            payload_hash: hash_payload(&payload_json),
            payload_json,
            state: JobState::Queued,
            attempt_count: 0,
            max_attempts: self.config.max_attempts,
            available_at: now,
            claimed_by: None,
            claimed_at: None,
            last_error: None,
            state_version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Claim a job for execution
    ///
    /// Transitions Queued|RetryableFailed -> Running and counts the attempt.
    /// A Running job whose claim has outlived the claim timeout may be
    /// stolen; a fresh claim is a conflict.
    pub fn claim(
        &self,
        mut job: QueueJob,
        worker_id: impl Into<String>,
    ) -> Result<QueueJob, QueueError> {
        let worker_id = worker_id.into();
        let now = Utc::now();

        match job.state {
            JobState::Queued | JobState::RetryableFailed => {}
            JobState::Running => {
                if let Some(claimed_at) = job.claimed_at {
                    let stale_threshold =
                        claimed_at + Duration::seconds(self.config.claim_timeout_seconds);
                    if now < stale_threshold {
                        return Err(QueueError::ClaimConflict(
                            job.id.clone(),
                            job.claimed_by.clone().unwrap_or_default(),
                        ));
                    }
                    // Claim is stale, allow stealing
                }
            }
            JobState::Completed | JobState::FailedTerminal => {
                return Err(QueueError::InvalidTransition {
                    from: job.state,
                    to: JobState::Running,
                    reason: "job already settled".to_string(),
                });
            }
        }

        if now < job.available_at {
            return Err(QueueError::NotYetDue(job.id.clone()));
        }

        job.state = JobState::Running;
        job.attempt_count += 1;
        job.claimed_by = Some(worker_id);
        job.claimed_at = Some(now);
        job.state_version += 1;
        job.updated_at = now;

        Ok(job)
    }

    /// Complete a job successfully
    ///
    /// Transitions Running -> Completed and releases the claim. Settled jobs
    /// are kept so operators can inspect what ran.
    pub fn complete(&self, mut job: QueueJob) -> Result<QueueJob, QueueError> {
        self.validate_transition(&job, JobState::Completed)?;

        let now = Utc::now();
        job.state = JobState::Completed;
        job.state_version += 1;
        job.updated_at = now;
        job.claimed_by = None;
        job.claimed_at = None;

        Ok(job)
    }

    /// Mark a job as failed
    ///
    /// Depending on retry policy and attempt count, transitions to either:
    /// - RetryableFailed, scheduled after exponential backoff
    /// - FailedTerminal, no more retries
    pub fn fail(
        &self,
        mut job: QueueJob,
        error: impl Into<String>,
        retry_policy: RetryPolicy,
    ) -> Result<QueueJob, QueueError> {
        self.validate_transition(&job, JobState::RetryableFailed)?;

        let now = Utc::now();
        let error = error.into();

        let should_retry =
            matches!(retry_policy, RetryPolicy::Retry) && job.attempt_count < job.max_attempts;

        if should_retry {
            let backoff_seconds = self.config.base_delay_seconds
                * i64::from(self.config.backoff_multiplier.pow(job.attempt_count.saturating_sub(1)));

            job.state = JobState::RetryableFailed;
            job.available_at = now + Duration::seconds(backoff_seconds);
        } else {
            job.state = JobState::FailedTerminal;
        }

        job.last_error = Some(error);
        job.state_version += 1;
        job.updated_at = now;
        job.claimed_by = None;
        job.claimed_at = None;

        Ok(job)
    }

    /// Validate that a transition is allowed
    fn validate_transition(&self, job: &QueueJob, to_state: JobState) -> Result<(), QueueError> {
        let valid = match (job.state, to_state) {
            // Can only complete or fail from Running state
            (JobState::Running, JobState::Completed) => true,
            (JobState::Running, JobState::RetryableFailed) => true,
            (JobState::Running, JobState::FailedTerminal) => true,
            // Can claim from Queued or RetryableFailed
            (JobState::Queued, JobState::Running) => true,
            (JobState::RetryableFailed, JobState::Running) => true,
            // Same state is always valid (idempotent)
            (from, to) if from == to => true,
            _ => false,
        };

        if valid {
            Ok(())
        } else {
            Err(QueueError::InvalidTransition {
                from: job.state,
                to: to_state,
                reason: format!("cannot transition from {:?} to {:?}", job.state, to_state),
            })
        }
    }
}

/// Hash a payload for duplicate-enqueue detection
pub fn hash_payload(payload: &str) -> String {
    use sha2::{Digest, Sha256};
    let mut hasher = Sha256::new();
    hasher.update(payload.as_bytes());
    format!("{:x}", hasher.finalize())
}
