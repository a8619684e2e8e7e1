use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A single article fetched from a feed.
///
/// Messages are transient: built fresh on every fetch and handed to the
/// feed's persistence step. `id` stays `None` until the store assigns one.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Message {
    pub id: Option<i64>,
    /// Provider-specific ID (RSS `<guid>`), if the feed supplies one.
    pub custom_id: Option<String>,
    pub title: String,
    pub url: String,
    pub author: String,
    pub contents: String,
    pub created: DateTime<Utc>,
    /// `false` when the feed had no date and `created` is the fetch time.
    pub created_from_feed: bool,
    // Scratch fields writable by filter scripts:
    pub is_read: bool,
    pub is_important: bool,
    pub score: f64,
}

impl Message {
    /// Create a message stamped with the current time.
    pub fn new(title: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            url: url.into(),
            created: Utc::now(),
            ..Default::default()
        }
    }
}
