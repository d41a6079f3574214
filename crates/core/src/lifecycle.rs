use thiserror::Error;

use crate::domain::conversation::ConversationStatus;

/// Reasons recorded alongside a status change. Free text is allowed; these
/// constants cover the transitions the services themselves initiate.
pub mod reasons {
    pub const USER_REPLIED: &str = "user_replied";
    pub const OPTED_OUT: &str = "opted_out";
    pub const PAYMENT_CONVERTED: &str = "payment_converted";
    pub const PAYMENT_DECLINED: &str = "payment_declined";
    pub const MAX_CYCLES_REACHED: &str = "max_cycles_reached";
    pub const DELIVERY_FAILED: &str = "delivery_failed";
    pub const RECOVERED: &str = "recovered";
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("invalid conversation transition from {from:?} to {to:?}")]
    InvalidTransition { from: ConversationStatus, to: ConversationStatus },
}

/// Targets reachable from `current`. `Closed` is terminal and reaches
/// nothing.
pub fn allowed_targets(current: ConversationStatus) -> &'static [ConversationStatus] {
    use ConversationStatus::{Active, AwaitingResponse, Closed, Error};

    match current {
        AwaitingResponse => &[Active, Closed],
        Active => &[Closed, Error],
        Error => &[Active, Closed],
        Closed => &[],
    }
}

pub fn validate_transition(
    current: ConversationStatus,
    target: ConversationStatus,
) -> Result<(), TransitionError> {
    if allowed_targets(current).contains(&target) {
        return Ok(());
    }

    Err(TransitionError::InvalidTransition { from: current, to: target })
}
