use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use yomu_core::downloader::{EventReceiver, FeedDownloadResults, FeedDownloader};
use yomu_core::feed::Feed;
use yomu_core::filter::ScriptEngineFactory;

use crate::RuntimeError;

/// Handle to the `feed-update` thread.
///
/// Batches run one after another on that thread. Cancellation and state
/// queries go straight to the shared [`FeedDownloader`] so they work while a
/// batch is in progress.
#[derive(Clone)]
pub struct UpdaterHandle {
    tx: mpsc::UnboundedSender<UpdaterCommand>,
    downloader: Arc<FeedDownloader>,
}

enum UpdaterCommand {
    UpdateFeeds {
        feeds: Vec<Arc<dyn Feed>>,
        reply: Option<oneshot::Sender<FeedDownloadResults>>,
    },
}

impl UpdaterHandle {
    /// Spawn the update thread. Batch events arrive on the returned receiver.
    pub fn spawn(
        engines: Arc<dyn ScriptEngineFactory>,
    ) -> Result<(Self, EventReceiver), RuntimeError> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let downloader = Arc::new(FeedDownloader::new(engines, events_tx));
        let (tx, rx) = mpsc::unbounded_channel();

        let worker = Arc::clone(&downloader);
        std::thread::Builder::new()
            .name("feed-update".into())
            .spawn(move || updater_loop(worker, rx))
            .map_err(|e| RuntimeError::Updater(format!("failed to spawn update thread: {e}")))?;

        Ok((Self { tx, downloader }, events_rx))
    }

    /// Queue a batch without waiting for it.
    pub fn start_update(&self, feeds: Vec<Arc<dyn Feed>>) {
        let _ = self.tx.send(UpdaterCommand::UpdateFeeds { feeds, reply: None });
    }

    /// Queue a batch and wait for its results.
    pub async fn update_feeds(
        &self,
        feeds: Vec<Arc<dyn Feed>>,
    ) -> Result<FeedDownloadResults, RuntimeError> {
        let (reply, rx) = oneshot::channel();
        let _ = self.tx.send(UpdaterCommand::UpdateFeeds {
            feeds,
            reply: Some(reply),
        });
        rx.await
            .map_err(|_| RuntimeError::Updater("update thread closed".into()))
    }

    pub fn stop_running_update(&self) {
        self.downloader.stop_running_update();
    }

    pub fn is_update_running(&self) -> bool {
        self.downloader.is_update_running()
    }

    /// `(completed, total)` of the batch in progress.
    pub fn progress(&self) -> (usize, usize) {
        self.downloader.progress()
    }
}

fn updater_loop(downloader: Arc<FeedDownloader>, mut rx: mpsc::UnboundedReceiver<UpdaterCommand>) {
    while let Some(cmd) = rx.blocking_recv() {
        match cmd {
            UpdaterCommand::UpdateFeeds { feeds, reply } => {
                let results = downloader.update_feeds(feeds);
                if let Some(reply) = reply {
                    let _ = reply.send(results);
                }
            }
        }
    }
    tracing::debug!("Update thread stopped");
}
