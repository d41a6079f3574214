pub mod abandonment;
pub mod conversation;
pub mod job;
pub mod message;
pub mod user;
