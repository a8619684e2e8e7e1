//! Batch feed updates.
//!
//! [`FeedDownloader`] drains a queue of feeds one at a time on the calling
//! thread and reports progress through an event channel. Another thread may
//! cancel the batch with [`FeedDownloader::stop_running_update`]; the feed in
//! flight always runs to completion.

mod results;
mod worker;

#[cfg(test)]
pub(crate) mod mock;

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::feed::Feed;
use crate::filter::ScriptEngineFactory;

pub use results::FeedDownloadResults;
pub use worker::{update_one_feed, FeedUpdate, UpdateStage};

/// Batch lifecycle notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEvent {
    Started,
    Progress {
        feed_id: i64,
        feed_title: String,
        completed: usize,
        total: usize,
    },
    Finished(FeedDownloadResults),
}

pub type EventSender = mpsc::UnboundedSender<DownloadEvent>;
pub type EventReceiver = mpsc::UnboundedReceiver<DownloadEvent>;

#[derive(Default)]
struct BatchState {
    pending: VecDeque<Arc<dyn Feed>>,
    original_count: usize,
    completed: usize,
}

pub struct FeedDownloader {
    update_lock: Mutex<()>,
    state: Mutex<BatchState>,
    engines: Arc<dyn ScriptEngineFactory>,
    events: EventSender,
}

impl FeedDownloader {
    pub fn new(engines: Arc<dyn ScriptEngineFactory>, events: EventSender) -> Self {
        Self {
            update_lock: Mutex::new(()),
            state: Mutex::new(BatchState::default()),
            engines,
            events,
        }
    }

    /// Update `feeds` in order and return the sorted per-feed counts.
    ///
    /// Blocks until the queue drains or the batch is stopped. Concurrent
    /// calls wait for each other. An empty list is a no-op and emits nothing.
    pub fn update_feeds(&self, feeds: Vec<Arc<dyn Feed>>) -> FeedDownloadResults {
        let _guard = self.update_lock.lock().unwrap_or_else(|e| e.into_inner());

        if feeds.is_empty() {
            debug!("No feeds to update, aborting update");
            return FeedDownloadResults::default();
        }

        let total = feeds.len();
        {
            let mut state = self.state();
            state.pending = feeds.iter().cloned().collect();
            state.original_count = total;
            state.completed = 0;
        }
        info!(count = total, "Starting feed update");
        self.emit(DownloadEvent::Started);

        flush_caches(&feeds);

        let mut results = FeedDownloadResults::default();
        let mut completed = 0;
        while let Some(feed) = self.next_feed() {
            let update = update_one_feed(feed.as_ref(), self.engines.as_ref());
            results.append_updated_feed(feed.title(), update.updated);

            completed += 1;
            {
                let mut state = self.state();
                state.completed = (state.completed + 1).min(state.original_count);
            }
            self.emit(DownloadEvent::Progress {
                feed_id: feed.id(),
                feed_title: feed.title().to_string(),
                completed,
                total,
            });
        }

        results.sort();
        info!(
            processed = completed,
            updated = results.total_updated(),
            "Feed update finished"
        );
        self.emit(DownloadEvent::Finished(results.clone()));
        results
    }

    /// Drop every queued feed. The feed currently being processed finishes.
    pub fn stop_running_update(&self) {
        let mut state = self.state();
        if !state.pending.is_empty() {
            info!(skipped = state.pending.len(), "Stopping feed update");
        }
        state.pending.clear();
        state.original_count = 0;
        state.completed = 0;
    }

    pub fn is_update_running(&self) -> bool {
        !self.state().pending.is_empty()
    }

    /// `(completed, total)` of the current batch.
    pub fn progress(&self) -> (usize, usize) {
        let state = self.state();
        (state.completed, state.original_count)
    }

    fn next_feed(&self) -> Option<Arc<dyn Feed>> {
        self.state().pending.pop_front()
    }

    fn state(&self) -> MutexGuard<'_, BatchState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: DownloadEvent) {
        let _ = self.events.send(event);
    }
}

/// Flush the write-back cache of every account owning one of `feeds`, once
/// per account. Failures are logged and never stop the batch.
fn flush_caches(feeds: &[Arc<dyn Feed>]) {
    let mut flushed = HashSet::new();
    for root in feeds.iter().filter_map(|f| f.service_root()) {
        if !flushed.insert(root.account_id()) {
            continue;
        }
        let Some(cache) = root.as_cache() else {
            continue;
        };
        debug!(account_id = root.account_id(), account = root.title(), "Saving cached data");
        if let Err(e) = cache.save_all_cached_data(false) {
            warn!(account_id = root.account_id(), error = %e, "Failed to save cached data");
        }
    }
}
