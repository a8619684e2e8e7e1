use serde::{Deserialize, Serialize};

/// Per-feed counts of new or updated messages from one batch.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeedDownloadResults {
    updated_feeds: Vec<(String, usize)>,
}

impl FeedDownloadResults {
    /// Record a feed's count. Zero counts are never stored.
    pub fn append_updated_feed(&mut self, title: impl Into<String>, updated: usize) {
        if updated > 0 {
            self.updated_feeds.push((title.into(), updated));
        }
    }

    /// Order by count, highest first. Ties keep insertion order.
    pub fn sort(&mut self) {
        self.updated_feeds.sort_by(|a, b| b.1.cmp(&a.1));
    }

    pub fn clear(&mut self) {
        self.updated_feeds.clear();
    }

    pub fn updated_feeds(&self) -> &[(String, usize)] {
        &self.updated_feeds
    }

    pub fn is_empty(&self) -> bool {
        self.updated_feeds.is_empty()
    }

    pub fn total_updated(&self) -> usize {
        self.updated_feeds.iter().map(|(_, n)| n).sum()
    }

    /// Human-readable "title: count" lines, at most `max_entries` of them.
    pub fn overview(&self, max_entries: usize) -> String {
        let mut out = self
            .updated_feeds
            .iter()
            .take(max_entries)
            .map(|(title, count)| format!("{title}: {count}"))
            .collect::<Vec<_>>()
            .join("\n");

        let hidden = self.updated_feeds.len().saturating_sub(max_entries);
        if hidden > 0 {
            if !out.is_empty() {
                out.push_str("\n\n");
            }
            let noun = if hidden == 1 { "feed" } else { "feeds" };
            out.push_str(&format!("+ {hidden} other {noun}."));
        }
        out
    }
}
