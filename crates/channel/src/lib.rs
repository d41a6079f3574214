//! Messaging-channel integration for winback.
//!
//! This crate owns everything between "the agent decided to say X" and the
//! provider's HTTP API:
//!
//! - **Transport** (`transport`) - the `ChannelTransport` send contract, the
//!   reqwest-backed implementation, and error classification (auth, bad
//!   request, rate limit, server, network) that drives the retry policy in
//!   `winback_core::delivery`.
//! - **Payload rules** (`payload`) - recipient address and message length
//!   validation, applied before any network call.
//! - **Templates** (`template`) - tera rendering of named outbound templates
//!   (the opening outreach) into plain message text.
//!
//! The transport is deliberately dumb: it does not validate, retry, or touch
//! the database. Callers in `winback-agent` sequence those steps.

pub mod payload;
pub mod template;
pub mod transport;

pub use payload::validate_outbound;
pub use template::{TemplateEngine, TemplateError};
pub use transport::{ChannelError, ChannelTransport, HttpChannelTransport, SendReceipt};
