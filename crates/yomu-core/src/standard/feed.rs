use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use reqwest::blocking::Client;
use reqwest::header::ACCEPT;
use tracing::warn;

use crate::config::GeneralConfig;
use crate::error::YomuError;
use crate::feed::{Feed, FetchedMessages, ServiceRoot};
use crate::filter::FilterHandle;
use crate::models::{FeedRecord, Message};
use crate::standard::parser::parse_feed;
use crate::standard::service_root::StandardServiceRoot;

const FEED_ACCEPT: &str =
    "application/rss+xml, application/atom+xml, application/xml;q=0.9, text/xml;q=0.8, */*;q=0.5";

/// HTTP client for feed downloads with the configured user agent and timeout.
pub fn build_http_client(config: &GeneralConfig) -> Result<Client, YomuError> {
    Client::builder()
        .user_agent(config.user_agent.as_str())
        .timeout(Duration::from_millis(config.download_timeout_ms))
        .build()
        .map_err(|e| YomuError::Network(e.to_string()))
}

/// Check that `url` is an absolute http(s) URL.
pub fn validate_feed_url(url: &str) -> Result<url::Url, YomuError> {
    let parsed = url::Url::parse(url).map_err(|e| YomuError::Parse(format!("{url}: {e}")))?;
    match parsed.scheme() {
        "http" | "https" => Ok(parsed),
        other => Err(YomuError::Parse(format!("unsupported scheme `{other}` in {url}"))),
    }
}

/// An RSS or Atom feed fetched over HTTP and stored through its account's storage.
pub struct StandardFeed {
    record: FeedRecord,
    filters: Vec<FilterHandle>,
    root: Arc<StandardServiceRoot>,
    client: Client,
}

impl StandardFeed {
    pub fn new(
        record: FeedRecord,
        filters: Vec<FilterHandle>,
        root: Arc<StandardServiceRoot>,
        client: Client,
    ) -> Self {
        Self {
            record,
            filters,
            root,
            client,
        }
    }

    pub fn record(&self) -> &FeedRecord {
        &self.record
    }

    fn download(&self) -> Result<Vec<Message>, YomuError> {
        let bytes = self
            .client
            .get(&self.record.url)
            .header(ACCEPT, FEED_ACCEPT)
            .send()
            .and_then(|r| r.error_for_status())
            .and_then(|r| r.bytes())
            .map_err(|e| YomuError::Network(format!("fetch {}: {e}", self.record.title)))?;

        parse_feed(&bytes, Utc::now())
    }
}

impl Feed for StandardFeed {
    fn id(&self) -> i64 {
        self.record.id
    }

    fn custom_id(&self) -> &str {
        &self.record.custom_id
    }

    fn title(&self) -> &str {
        &self.record.title
    }

    fn url(&self) -> &str {
        &self.record.url
    }

    fn account_id(&self) -> i64 {
        self.record.account_id
    }

    fn message_filters(&self) -> Vec<FilterHandle> {
        self.filters.clone()
    }

    fn service_root(&self) -> Option<Arc<dyn ServiceRoot>> {
        Some(self.root.clone())
    }

    fn obtain_new_messages(&self) -> FetchedMessages {
        match self.download() {
            Ok(messages) => FetchedMessages::ok(messages),
            Err(e) => {
                warn!(feed_id = self.record.id, url = %self.record.url, error = %e, "Feed download failed");
                FetchedMessages::failed()
            }
        }
    }

    fn update_messages(&self, messages: &[Message], soft_error: bool) -> Result<usize, YomuError> {
        let storage = self
            .root
            .storage()
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        storage.record_fetch(self.record.id, self.record.account_id, messages, soft_error)
    }
}
