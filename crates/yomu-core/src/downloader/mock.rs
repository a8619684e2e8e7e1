//! In-memory feed used by the downloader tests.

use std::sync::{Arc, Mutex};

use crate::error::YomuError;
use crate::feed::{Feed, FetchedMessages, ServiceRoot};
use crate::filter::FilterHandle;
use crate::models::Message;

pub type Journal = Arc<Mutex<Vec<String>>>;

type Hook = Box<dyn Fn() + Send + Sync>;

pub struct MockFeed {
    id: i64,
    title: String,
    messages: Vec<Message>,
    soft_error: bool,
    failing_persist: bool,
    updated: Option<usize>,
    filters: Vec<FilterHandle>,
    root: Option<Arc<dyn ServiceRoot>>,
    journal: Option<Journal>,
    on_persist: Option<Hook>,
    persisted: Mutex<Vec<Message>>,
    last_soft_error: Mutex<Option<bool>>,
}

impl MockFeed {
    pub fn new(id: i64, title: &str) -> Self {
        Self {
            id,
            title: title.into(),
            messages: Vec::new(),
            soft_error: false,
            failing_persist: false,
            updated: None,
            filters: Vec::new(),
            root: None,
            journal: None,
            on_persist: None,
            persisted: Mutex::new(Vec::new()),
            last_soft_error: Mutex::new(None),
        }
    }

    pub fn with_messages(mut self, messages: Vec<Message>) -> Self {
        self.messages = messages;
        self
    }

    /// Report `count` updates regardless of what was persisted.
    pub fn with_updated(mut self, count: usize) -> Self {
        self.updated = Some(count);
        self
    }

    pub fn with_soft_error(mut self) -> Self {
        self.soft_error = true;
        self
    }

    pub fn with_failing_persist(mut self) -> Self {
        self.failing_persist = true;
        self
    }

    pub fn with_filters(mut self, filters: Vec<FilterHandle>) -> Self {
        self.filters = filters;
        self
    }

    pub fn with_root(mut self, root: Arc<dyn ServiceRoot>) -> Self {
        self.root = Some(root);
        self
    }

    pub fn with_journal(mut self, journal: Journal) -> Self {
        self.journal = Some(journal);
        self
    }

    pub fn on_persist(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_persist = Some(Box::new(hook));
        self
    }

    pub fn persisted(&self) -> Vec<Message> {
        self.persisted.lock().unwrap().clone()
    }

    pub fn last_soft_error(&self) -> Option<bool> {
        *self.last_soft_error.lock().unwrap()
    }

    fn record(&self, entry: String) {
        if let Some(journal) = &self.journal {
            journal.lock().unwrap().push(entry);
        }
    }
}

impl Feed for MockFeed {
    fn id(&self) -> i64 {
        self.id
    }

    fn custom_id(&self) -> &str {
        &self.title
    }

    fn title(&self) -> &str {
        &self.title
    }

    fn url(&self) -> &str {
        "https://example.com/feed.xml"
    }

    fn account_id(&self) -> i64 {
        self.root.as_ref().map_or(1, |r| r.account_id())
    }

    fn message_filters(&self) -> Vec<FilterHandle> {
        self.filters.clone()
    }

    fn service_root(&self) -> Option<Arc<dyn ServiceRoot>> {
        self.root.clone()
    }

    fn obtain_new_messages(&self) -> FetchedMessages {
        self.record(format!("fetch {}", self.title));
        FetchedMessages {
            messages: self.messages.clone(),
            soft_error: self.soft_error,
        }
    }

    fn update_messages(&self, messages: &[Message], soft_error: bool) -> Result<usize, YomuError> {
        self.record(format!("persist {}", self.title));
        *self.last_soft_error.lock().unwrap() = Some(soft_error);
        if let Some(hook) = &self.on_persist {
            hook();
        }
        if self.failing_persist {
            return Err(YomuError::Storage(rusqlite::Error::InvalidQuery));
        }
        self.persisted.lock().unwrap().extend_from_slice(messages);
        Ok(self.updated.unwrap_or(messages.len()))
    }
}

/// Messages with the given titles and nothing else set.
pub fn titled(titles: &[&str]) -> Vec<Message> {
    titles
        .iter()
        .map(|t| Message {
            title: t.to_string(),
            ..Default::default()
        })
        .collect()
}
