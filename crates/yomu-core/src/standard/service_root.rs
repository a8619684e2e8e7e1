use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tracing::{debug, warn};

use crate::error::YomuError;
use crate::feed::{CacheForServiceRoot, ServiceRoot};
use crate::filter::FilterRegistry;
use crate::models::AccountRecord;
use crate::standard::feed::StandardFeed;
use crate::storage::SharedStorage;

/// Message state changes not yet written to the database, keyed by message ID.
#[derive(Debug, Default)]
pub struct MessageStateCache {
    pending: Mutex<PendingChanges>,
}

#[derive(Debug, Default, Clone)]
struct PendingChanges {
    read: BTreeMap<i64, bool>,
    important: BTreeMap<i64, bool>,
}

impl MessageStateCache {
    pub fn mark_read(&self, ids: &[i64], read: bool) {
        let mut pending = self.pending();
        for id in ids {
            pending.read.insert(*id, read);
        }
    }

    pub fn mark_important(&self, ids: &[i64], important: bool) {
        let mut pending = self.pending();
        for id in ids {
            pending.important.insert(*id, important);
        }
    }

    pub fn is_empty(&self) -> bool {
        let pending = self.pending();
        pending.read.is_empty() && pending.important.is_empty()
    }

    /// Write every pending change through `storage`.
    ///
    /// Without `ignore_errors` a failed write puts the changes back so the
    /// next flush retries them; later changes to the same message win.
    pub fn flush(&self, storage: &SharedStorage, ignore_errors: bool) -> Result<(), YomuError> {
        let taken = std::mem::take(&mut *self.pending());
        if taken.read.is_empty() && taken.important.is_empty() {
            return Ok(());
        }

        match write_changes(storage, &taken) {
            Ok(()) => Ok(()),
            Err(e) if ignore_errors => {
                warn!(error = %e, "Discarding cached message state");
                Ok(())
            }
            Err(e) => {
                let mut pending = self.pending();
                for (id, read) in taken.read {
                    pending.read.entry(id).or_insert(read);
                }
                for (id, important) in taken.important {
                    pending.important.entry(id).or_insert(important);
                }
                Err(e)
            }
        }
    }

    fn pending(&self) -> MutexGuard<'_, PendingChanges> {
        self.pending.lock().unwrap_or_else(|e| e.into_inner())
    }
}

fn write_changes(storage: &SharedStorage, changes: &PendingChanges) -> Result<(), YomuError> {
    let storage = storage.lock().unwrap_or_else(|e| e.into_inner());
    for value in [true, false] {
        let ids = ids_with(&changes.read, value);
        storage.set_messages_read(&ids, value)?;
        let ids = ids_with(&changes.important, value);
        storage.set_messages_important(&ids, value)?;
    }
    debug!(
        read = changes.read.len(),
        important = changes.important.len(),
        "Flushed message state"
    );
    Ok(())
}

fn ids_with(changes: &BTreeMap<i64, bool>, value: bool) -> Vec<i64> {
    changes
        .iter()
        .filter(|(_, v)| **v == value)
        .map(|(id, _)| *id)
        .collect()
}

/// The local account holding standard RSS feeds.
pub struct StandardServiceRoot {
    account: AccountRecord,
    storage: SharedStorage,
    cache: MessageStateCache,
}

impl StandardServiceRoot {
    pub fn new(account: AccountRecord, storage: SharedStorage) -> Self {
        Self {
            account,
            storage,
            cache: MessageStateCache::default(),
        }
    }

    /// Load the account from `storage`.
    pub fn load(account_id: i64, storage: SharedStorage) -> Result<Self, YomuError> {
        let account = storage
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get_account(account_id)?
            .ok_or_else(|| YomuError::NotFound(format!("account {account_id}")))?;
        Ok(Self::new(account, storage))
    }

    pub fn cache(&self) -> &MessageStateCache {
        &self.cache
    }

    pub fn storage(&self) -> &SharedStorage {
        &self.storage
    }

    /// Build every feed of this account with its filter chain resolved
    /// against `registry`.
    pub fn load_feeds(
        self: &Arc<Self>,
        registry: &Arc<FilterRegistry>,
        client: &reqwest::blocking::Client,
    ) -> Result<Vec<Arc<StandardFeed>>, YomuError> {
        let storage = self.storage.lock().unwrap_or_else(|e| e.into_inner());
        let mut feeds = Vec::new();
        for record in storage
            .get_feeds()?
            .into_iter()
            .filter(|f| f.account_id == self.account.id)
        {
            let filters = storage
                .filters_for_feed(record.id)?
                .into_iter()
                .map(|id| registry.handle(id))
                .collect();
            feeds.push(Arc::new(StandardFeed::new(
                record,
                filters,
                Arc::clone(self),
                client.clone(),
            )));
        }
        Ok(feeds)
    }
}

impl ServiceRoot for StandardServiceRoot {
    fn account_id(&self) -> i64 {
        self.account.id
    }

    fn title(&self) -> &str {
        &self.account.title
    }

    fn as_cache(&self) -> Option<&dyn CacheForServiceRoot> {
        Some(self)
    }
}

impl CacheForServiceRoot for StandardServiceRoot {
    fn save_all_cached_data(&self, ignore_errors: bool) -> Result<(), YomuError> {
        self.cache.flush(&self.storage, ignore_errors)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Message;
    use crate::storage::{Storage, LOCAL_ACCOUNT_ID};

    fn root_with_messages() -> (StandardServiceRoot, i64, Vec<i64>) {
        let storage = Storage::open_memory().unwrap();
        let feed_id = storage
            .insert_feed(LOCAL_ACCOUNT_ID, "Feed", "https://example.com/rss")
            .unwrap();
        storage
            .update_messages(
                feed_id,
                LOCAL_ACCOUNT_ID,
                &[Message::new("a", "https://a"), Message::new("b", "https://b")],
            )
            .unwrap();
        let ids = storage
            .get_messages(feed_id)
            .unwrap()
            .iter()
            .filter_map(|m| m.id)
            .collect();
        let root = StandardServiceRoot::load(LOCAL_ACCOUNT_ID, storage.into_shared()).unwrap();
        (root, feed_id, ids)
    }

    #[test]
    fn test_flush_writes_pending_state() {
        let (root, feed_id, ids) = root_with_messages();
        root.cache().mark_read(&ids, true);
        root.cache().mark_important(&ids[..1], true);
        root.cache().mark_read(&ids[1..], false);

        root.save_all_cached_data(false).unwrap();

        assert!(root.cache().is_empty());
        let storage = root.storage().lock().unwrap();
        let messages = storage.get_messages(feed_id).unwrap();
        let by_id = |id| messages.iter().find(|m| m.id == Some(id)).unwrap();
        assert!(by_id(ids[0]).is_read);
        assert!(by_id(ids[0]).is_important);
        assert!(!by_id(ids[1]).is_read);
    }

    #[test]
    fn test_root_exposes_cache() {
        let (root, _, _) = root_with_messages();
        assert_eq!(root.account_id(), LOCAL_ACCOUNT_ID);
        assert_eq!(root.title(), "Local feeds");
        assert!(root.as_cache().is_some());
    }

    #[test]
    fn test_batch_state_operations_unsupported() {
        let (root, _, _) = root_with_messages();
        assert!(matches!(root.mark_all_read(true), Err(YomuError::Unsupported(_))));
        assert!(matches!(root.mark_all_deleted(true), Err(YomuError::Unsupported(_))));
        assert!(matches!(root.switch_all_importance(), Err(YomuError::Unsupported(_))));
    }

    #[test]
    fn test_failed_flush_keeps_changes() {
        let (root, _, ids) = root_with_messages();
        root.cache().mark_read(&ids, true);

        let broken = Storage::open_memory().unwrap();
        broken.execute_batch("DROP TABLE messages").unwrap();
        let broken = broken.into_shared();

        assert!(root.cache().flush(&broken, false).is_err());
        assert!(!root.cache().is_empty());

        assert!(root.cache().flush(&broken, true).is_ok());
        assert!(root.cache().is_empty());
    }

    #[test]
    fn test_load_feeds_resolves_filters() {
        let (root, feed_id, _) = root_with_messages();
        let registry = FilterRegistry::new();
        {
            let storage = root.storage().lock().unwrap();
            let filter = storage.insert_filter("all", "MSG_ACCEPT").unwrap();
            storage.assign_filter(feed_id, filter).unwrap();
            for f in storage.get_filters().unwrap() {
                registry.insert(f);
            }
        }
        let root = Arc::new(root);
        let client = reqwest::blocking::Client::new();

        let feeds = root.load_feeds(&registry, &client).unwrap();

        assert_eq!(feeds.len(), 1);
        let filters = crate::feed::Feed::message_filters(feeds[0].as_ref());
        assert_eq!(filters.len(), 1);
        assert!(filters[0].resolve().is_some());
    }
}
