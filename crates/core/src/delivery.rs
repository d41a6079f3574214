use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Failure classes a channel transport can report. The class, not the
/// concrete error, decides the retry behavior.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelErrorClass {
    Auth,
    BadRequest,
    RateLimited,
    ServerError,
    Network,
}

impl ChannelErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::BadRequest => "bad_request",
            Self::RateLimited => "rate_limited",
            Self::ServerError => "server_error",
            Self::Network => "network",
        }
    }
}

/// What the sender does after a failed attempt.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeliveryAction {
    /// Resubmission cannot succeed; mark the message failed.
    Abandon,
    /// Transient blip; retry in-process after the delay.
    RetryAfter(Duration),
    /// In-process budget exhausted or systemic failure; hand the send to
    /// the durable queue.
    Requeue,
}

/// In-process retry policy for one send call: doubling delays from
/// `base_delay` up to `max_delay`, at most `max_inline_retries` retries
/// after the initial attempt.
#[derive(Clone, Debug)]
pub struct DeliveryPolicy {
    pub max_inline_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for DeliveryPolicy {
    fn default() -> Self {
        Self {
            max_inline_retries: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl DeliveryPolicy {
    /// Decide the follow-up for the `failed_attempts`-th consecutive
    /// failure of one send call (1-based, counting the failure being
    /// classified).
    pub fn action_for(&self, class: ChannelErrorClass, failed_attempts: u32) -> DeliveryAction {
        match class {
            ChannelErrorClass::Auth | ChannelErrorClass::BadRequest => DeliveryAction::Abandon,
            ChannelErrorClass::RateLimited | ChannelErrorClass::ServerError => {
                if failed_attempts <= self.max_inline_retries {
                    DeliveryAction::RetryAfter(self.backoff(failed_attempts.saturating_sub(1)))
                } else {
                    DeliveryAction::Requeue
                }
            }
            ChannelErrorClass::Network => DeliveryAction::Requeue,
        }
    }

    /// Delay before retry number `attempt` (0-based): `base << attempt`,
    /// capped at `max_delay`.
    pub fn backoff(&self, attempt: u32) -> Duration {
        let shift = attempt.min(16);
        let factor = 1u64 << shift;
        let delay = self.base_delay.saturating_mul(factor.min(u64::from(u32::MAX)) as u32);
        delay.min(self.max_delay)
    }
}
