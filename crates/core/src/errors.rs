use thiserror::Error;

use crate::lifecycle::TransitionError;
use crate::queue::QueueError;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum DomainError {
    #[error(transparent)]
    ConversationTransition(#[from] TransitionError),
    #[error(transparent)]
    JobTransition(#[from] QueueError),
    #[error("validation failure: {0}")]
    Validation(String),
    #[error("domain invariant violation: {0}")]
    InvariantViolation(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error(transparent)]
    Domain(#[from] DomainError),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("integration failure: {0}")]
    Integration(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, trace_id: String },
    #[error("not found: {message}")]
    NotFound { message: String, trace_id: String },
    #[error("service unavailable: {message}")]
    ServiceUnavailable { message: String, trace_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, trace_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::NotFound { .. } => "The referenced record does not exist.",
            Self::ServiceUnavailable { .. } => {
                "The service is temporarily unavailable. Please retry shortly."
            }
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, trace_id: impl Into<String>) -> InterfaceError {
        let trace_id = trace_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { trace_id: id, .. }
            | InterfaceError::NotFound { trace_id: id, .. }
            | InterfaceError::ServiceUnavailable { trace_id: id, .. }
            | InterfaceError::Internal { trace_id: id, .. } => *id = trace_id,
        }
        mapped
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        match value {
            ApplicationError::Domain(inner) => Self::BadRequest {
                message: inner.to_string(),
                trace_id: "unassigned".to_owned(),
            },
            ApplicationError::NotFound(message) => {
                Self::NotFound { message, trace_id: "unassigned".to_owned() }
            }
            ApplicationError::Persistence(message) | ApplicationError::Integration(message) => {
                Self::ServiceUnavailable { message, trace_id: "unassigned".to_owned() }
            }
            ApplicationError::Configuration(message) => {
                Self::Internal { message, trace_id: "unassigned".to_owned() }
            }
        }
    }
}
