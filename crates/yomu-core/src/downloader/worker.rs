use std::time::Instant;

use tracing::{debug, error, info};

use crate::feed::{Feed, FetchedMessages};
use crate::filter::{filter_messages, ScriptEngineFactory};
use crate::sanitize::sanitize_all;

/// Pipeline stage of a single feed update.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateStage {
    Fetching,
    Sanitizing,
    Filtering,
    Persisting,
    Done,
    Failed,
}

impl std::fmt::Display for UpdateStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Fetching => write!(f, "fetching"),
            Self::Sanitizing => write!(f, "sanitizing"),
            Self::Filtering => write!(f, "filtering"),
            Self::Persisting => write!(f, "persisting"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Outcome of updating one feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedUpdate {
    /// `Done` or `Failed`.
    pub stage: UpdateStage,
    pub fetched: usize,
    pub filtered_out: usize,
    /// New or updated messages reported by the feed's persistence.
    pub updated: usize,
    pub soft_error: bool,
}

/// Update one feed end-to-end: fetch, sanitize, filter, persist.
///
/// Never fails. Soft fetch errors flow through to persistence and a failed
/// persist is reported as `UpdateStage::Failed` with zero updates.
pub fn update_one_feed(feed: &dyn Feed, engines: &dyn ScriptEngineFactory) -> FeedUpdate {
    enter(feed, UpdateStage::Fetching);
    info!(
        feed_id = feed.id(),
        custom_id = feed.custom_id(),
        url = feed.url(),
        title = feed.title(),
        "Downloading new messages"
    );

    let started = Instant::now();
    let FetchedMessages {
        mut messages,
        soft_error,
    } = feed.obtain_new_messages();
    let fetched = messages.len();
    debug!(
        feed_id = feed.id(),
        count = fetched,
        soft_error,
        elapsed_us = started.elapsed().as_micros() as u64,
        "Downloaded messages"
    );

    enter(feed, UpdateStage::Sanitizing);
    sanitize_all(&mut messages);

    let mut filters = feed.message_filters();
    if !filters.is_empty() {
        enter(feed, UpdateStage::Filtering);
        let started = Instant::now();
        let mut engine = engines.create(feed);
        debug!(
            feed_id = feed.id(),
            elapsed_us = started.elapsed().as_micros() as u64,
            "Set up filter engine"
        );
        messages = filter_messages(&mut *engine, &mut filters, messages);
    }
    let filtered_out = fetched - messages.len();

    enter(feed, UpdateStage::Persisting);
    let (stage, updated) = match feed.update_messages(&messages, soft_error) {
        Ok(updated) => {
            info!(
                feed_id = feed.id(),
                custom_id = feed.custom_id(),
                updated,
                filtered_out,
                "Stored messages"
            );
            (UpdateStage::Done, updated)
        }
        Err(e) => {
            error!(feed_id = feed.id(), title = feed.title(), error = %e, "Failed to store messages");
            (UpdateStage::Failed, 0)
        }
    };
    enter(feed, stage);

    FeedUpdate {
        stage,
        fetched,
        filtered_out,
        updated,
        soft_error,
    }
}

fn enter(feed: &dyn Feed, stage: UpdateStage) {
    debug!(feed_id = feed.id(), %stage, "Feed update stage");
}
