pub mod compliance;
pub mod config;
pub mod delivery;
pub mod domain;
pub mod errors;
pub mod lifecycle;
pub mod queue;

pub use compliance::{ComplianceGate, ComplianceRefusal, OptOutScanner};
pub use config::{AppConfig, ConfigError, ConfigOverrides, LoadOptions, LogFormat};
pub use delivery::{ChannelErrorClass, DeliveryAction, DeliveryPolicy};
pub use domain::abandonment::{Abandonment, AbandonmentId, AbandonmentStatus};
pub use domain::conversation::{Conversation, ConversationId, ConversationStatus};
pub use domain::job::{
    DeliveryJob, InboundJob, JobId, JobKind, JobState, OutboundContent, QueueJob, QueueStats,
};
pub use domain::message::{
    Message, MessageId, MessageMetadata, MessageStatus, MessageType, SenderType,
};
pub use domain::user::{User, UserId};
pub use errors::{ApplicationError, DomainError, InterfaceError};
pub use lifecycle::TransitionError;
pub use queue::{QueueEngine, QueueEngineConfig, QueueError, RetryPolicy};
