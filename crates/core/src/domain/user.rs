use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(pub String);

impl fmt::Display for UserId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A message recipient. Created on the first abandonment event for an
/// address and never deleted; the opt-out fields are the only mutable part.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub id: UserId,
    /// Channel address (E.164-style phone number for the default channel).
    pub address: String,
    pub display_name: Option<String>,
    pub opted_out: bool,
    pub opted_out_at: Option<DateTime<Utc>>,
    pub opted_out_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    pub fn new(address: impl Into<String>, display_name: Option<String>) -> Self {
        let now = Utc::now();
        Self {
            id: UserId(format!("usr-{}", Uuid::new_v4().simple())),
            address: address.into(),
            display_name,
            opted_out: false,
            opted_out_at: None,
            opted_out_reason: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn mark_opted_out(&mut self, reason: impl Into<String>, at: DateTime<Utc>) {
        self.opted_out = true;
        self.opted_out_at = Some(at);
        self.opted_out_reason = Some(reason.into());
        self.updated_at = at;
    }
}
