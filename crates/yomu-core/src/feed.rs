//! Interfaces the update pipeline consumes.
//!
//! The downloader never knows what kind of feed or account it is working
//! with. Standard RSS feeds live in [`crate::standard`]; online services
//! would provide their own implementations.

use std::sync::Arc;

use crate::error::YomuError;
use crate::filter::FilterHandle;
use crate::models::Message;

/// Messages obtained by one fetch, plus the soft error flag.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchedMessages {
    pub messages: Vec<Message>,
    /// Set when the fetch went wrong in a non-fatal way. Whatever messages
    /// were obtained still go through the pipeline.
    pub soft_error: bool,
}

impl FetchedMessages {
    pub fn ok(messages: Vec<Message>) -> Self {
        Self {
            messages,
            soft_error: false,
        }
    }

    pub fn failed() -> Self {
        Self {
            messages: Vec::new(),
            soft_error: true,
        }
    }
}

/// A subscribed content source.
pub trait Feed: Send + Sync {
    fn id(&self) -> i64;

    /// Provider-specific identifier.
    fn custom_id(&self) -> &str;

    fn title(&self) -> &str;

    fn url(&self) -> &str;

    fn account_id(&self) -> i64;

    /// Ordered filter chain. Handles may dangle.
    fn message_filters(&self) -> Vec<FilterHandle>;

    /// Owning account, used to flush write-back caches before an update.
    fn service_root(&self) -> Option<Arc<dyn ServiceRoot>>;

    /// Fetch new messages. Ordinary network and parse failures are reported
    /// through [`FetchedMessages::soft_error`], never as a panic.
    fn obtain_new_messages(&self) -> FetchedMessages;

    /// Persist a batch in one transaction, returning how many messages were
    /// new or updated.
    fn update_messages(&self, messages: &[Message], soft_error: bool) -> Result<usize, YomuError>;
}

/// An account owning feeds.
///
/// Batch-wide message state operations have no agreed behaviour for
/// accounts in general, so they fail with [`YomuError::Unsupported`] unless
/// an account overrides them.
pub trait ServiceRoot: Send + Sync {
    fn account_id(&self) -> i64;

    fn title(&self) -> &str;

    /// The account's write-back cache, if it keeps one.
    fn as_cache(&self) -> Option<&dyn CacheForServiceRoot> {
        None
    }

    fn mark_all_read(&self, _read: bool) -> Result<(), YomuError> {
        Err(YomuError::Unsupported(format!(
            "marking all messages read in account '{}'",
            self.title()
        )))
    }

    fn mark_all_deleted(&self, _deleted: bool) -> Result<(), YomuError> {
        Err(YomuError::Unsupported(format!(
            "deleting all messages in account '{}'",
            self.title()
        )))
    }

    fn switch_all_importance(&self) -> Result<(), YomuError> {
        Err(YomuError::Unsupported(format!(
            "switching importance of all messages in account '{}'",
            self.title()
        )))
    }
}

/// Write-back cache of message state changes held by an account.
pub trait CacheForServiceRoot: Send + Sync {
    /// Flush every pending change. With `ignore_errors`, a failed flush
    /// still discards the pending changes and reports success.
    fn save_all_cached_data(&self, ignore_errors: bool) -> Result<(), YomuError>;
}
