use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// An account (service root) row in the standard store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountRecord {
    pub id: i64,
    pub title: String,
}

/// A subscribed feed row in the standard store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedRecord {
    pub id: i64,
    pub account_id: i64,
    /// Provider-specific ID. Standard feeds use their row ID.
    pub custom_id: String,
    pub title: String,
    pub url: String,
    pub last_checked: Option<DateTime<Utc>>,
    /// Whether the last fetch reported a soft error.
    pub has_error: bool,
}
