mod updater;

use std::path::Path;
use std::sync::Arc;

use reqwest::blocking::Client;

use yomu_core::config::AppConfig;
use yomu_core::downloader::EventReceiver;
use yomu_core::feed::Feed;
use yomu_core::filter::{FilterId, FilterRegistry, MessageFilter, MessageLookup, RhaiEngineFactory};
use yomu_core::models::FeedRecord;
use yomu_core::standard::{build_http_client, validate_feed_url, StandardServiceRoot};
use yomu_core::storage::{Storage, LOCAL_ACCOUNT_ID};

pub use updater::UpdaterHandle;

#[derive(Debug, thiserror::Error)]
pub enum RuntimeError {
    #[error("config error: {0}")]
    Config(String),
    #[error("database error: {0}")]
    Database(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("invalid feed URL: {0}")]
    InvalidUrl(String),
    #[error("updater error: {0}")]
    Updater(String),
}

/// Application state shared by the front ends.
///
/// Owns two connections to the same database: one for the caller's thread
/// and one handed to the feed-update thread through the service root.
pub struct Runtime {
    config: AppConfig,
    storage: Storage,
    root: Arc<StandardServiceRoot>,
    registry: Arc<FilterRegistry>,
    client: Client,
    updater: UpdaterHandle,
    events: EventReceiver,
}

impl Runtime {
    /// Open the runtime with the user's config and database.
    pub fn new() -> Result<Self, RuntimeError> {
        let config = AppConfig::load().map_err(|e| RuntimeError::Config(e.to_string()))?;
        let db_path =
            AppConfig::ensure_db_path().map_err(|e| RuntimeError::Config(e.to_string()))?;
        Self::open(config, &db_path)
    }

    pub fn open(config: AppConfig, db_path: &Path) -> Result<Self, RuntimeError> {
        let storage = Storage::open(db_path).map_err(database)?;
        let update_storage = Storage::open(db_path).map_err(database)?.into_shared();

        let root = Arc::new(
            StandardServiceRoot::load(LOCAL_ACCOUNT_ID, Arc::clone(&update_storage))
                .map_err(database)?,
        );
        let client =
            build_http_client(&config.general).map_err(|e| RuntimeError::Config(e.to_string()))?;

        let lookup: Arc<dyn MessageLookup> = update_storage;
        let engines = Arc::new(RhaiEngineFactory::new(Some(lookup), config.filters.clone()));
        let (updater, events) = UpdaterHandle::spawn(engines)?;

        let runtime = Self {
            config,
            storage,
            root,
            registry: FilterRegistry::new(),
            client,
            updater,
            events,
        };
        runtime.reload_filters()?;
        tracing::debug!(path = %db_path.display(), "Runtime opened");
        Ok(runtime)
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn root(&self) -> &Arc<StandardServiceRoot> {
        &self.root
    }

    pub fn updater(&self) -> &UpdaterHandle {
        &self.updater
    }

    /// Batch events from the update thread.
    pub fn events(&mut self) -> &mut EventReceiver {
        &mut self.events
    }

    // ── Feeds ───────────────────────────────────────────────────

    pub fn add_feed(&self, title: &str, url: &str) -> Result<i64, RuntimeError> {
        validate_feed_url(url).map_err(|e| RuntimeError::InvalidUrl(e.to_string()))?;
        self.storage
            .insert_feed(LOCAL_ACCOUNT_ID, title, url)
            .map_err(database)
    }

    pub fn list_feeds(&self) -> Result<Vec<FeedRecord>, RuntimeError> {
        self.storage.get_feeds().map_err(database)
    }

    pub fn remove_feed(&self, id: i64) -> Result<(), RuntimeError> {
        self.storage.delete_feed(id).map_err(database)
    }

    // ── Filters ─────────────────────────────────────────────────

    pub fn add_filter(&self, name: &str, script: &str) -> Result<FilterId, RuntimeError> {
        let id = self.storage.insert_filter(name, script).map_err(database)?;
        self.registry.insert(MessageFilter {
            id,
            name: name.to_string(),
            script: script.to_string(),
        });
        Ok(id)
    }

    pub fn list_filters(&self) -> Result<Vec<MessageFilter>, RuntimeError> {
        self.storage.get_filters().map_err(database)
    }

    /// Delete a filter. Feeds already queued for update skip it.
    pub fn remove_filter(&self, id: FilterId) -> Result<(), RuntimeError> {
        self.storage.delete_filter(id).map_err(database)?;
        self.registry.remove(id);
        Ok(())
    }

    /// Append a filter to a feed's chain.
    pub fn attach_filter(&self, feed_id: i64, filter_id: FilterId) -> Result<(), RuntimeError> {
        if self.storage.get_feed(feed_id).map_err(database)?.is_none() {
            return Err(RuntimeError::NotFound(format!("feed {feed_id}")));
        }
        if self.registry.get(filter_id).is_none() {
            return Err(RuntimeError::NotFound(format!("filter {filter_id}")));
        }
        self.storage
            .assign_filter(feed_id, filter_id)
            .map_err(database)
    }

    /// Sync the in-memory filter registry with the database.
    pub fn reload_filters(&self) -> Result<(), RuntimeError> {
        let stored = self.storage.get_filters().map_err(database)?;
        for id in self.registry.ids() {
            if !stored.iter().any(|f| f.id == id) {
                self.registry.remove(id);
            }
        }
        for filter in stored {
            self.registry.insert(filter);
        }
        Ok(())
    }

    // ── Updates ─────────────────────────────────────────────────

    /// Feeds with the given IDs, or every feed when `ids` is empty.
    pub fn load_feeds(&self, ids: &[i64]) -> Result<Vec<Arc<dyn Feed>>, RuntimeError> {
        let all = self
            .root
            .load_feeds(&self.registry, &self.client)
            .map_err(database)?;
        if ids.is_empty() {
            return Ok(all.into_iter().map(|f| f as Arc<dyn Feed>).collect());
        }

        ids.iter()
            .map(|id| {
                all.iter()
                    .find(|f| f.id() == *id)
                    .map(|f| Arc::clone(f) as Arc<dyn Feed>)
                    .ok_or_else(|| RuntimeError::NotFound(format!("feed {id}")))
            })
            .collect()
    }

    /// Queue an update of the given feeds (all feeds when `ids` is empty).
    /// Returns how many feeds were queued.
    pub fn start_update(&self, ids: &[i64]) -> Result<usize, RuntimeError> {
        let feeds = self.load_feeds(ids)?;
        let count = feeds.len();
        tracing::info!(count, "Queueing feed update");
        self.updater.start_update(feeds);
        Ok(count)
    }

    pub fn stop_update(&self) {
        self.updater.stop_running_update();
    }

    pub fn is_update_running(&self) -> bool {
        self.updater.is_update_running()
    }
}

fn database(e: yomu_core::error::YomuError) -> RuntimeError {
    match e {
        yomu_core::error::YomuError::NotFound(what) => RuntimeError::NotFound(what),
        other => RuntimeError::Database(other.to_string()),
    }
}
