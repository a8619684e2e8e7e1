use chrono::{DateTime, Utc};

use crate::error::YomuError;
use crate::models::Message;

/// Parse an RSS 2.0, RSS 1.0 (RDF) or Atom document into messages.
///
/// The format is picked from the document's root element.
pub fn parse_feed(bytes: &[u8], fetched_at: DateTime<Utc>) -> Result<Vec<Message>, YomuError> {
    match root_element(bytes) {
        Some("feed") => parse_atom(bytes, fetched_at),
        _ => parse_channel(bytes, fetched_at),
    }
}

/// Local name of the first element, skipping the prolog.
fn root_element(bytes: &[u8]) -> Option<&str> {
    let mut rest = bytes;
    while let Some(start) = rest.iter().position(|&b| b == b'<') {
        rest = &rest[start + 1..];
        match *rest.first()? {
            b'?' | b'!' => continue,
            _ => {
                let end = rest
                    .iter()
                    .position(|&b| b.is_ascii_whitespace() || matches!(b, b'>' | b'/'))
                    .unwrap_or(rest.len());
                let name = std::str::from_utf8(&rest[..end]).ok()?;
                return Some(name.rsplit_once(':').map_or(name, |(_, local)| local));
            }
        }
    }
    None
}

/// Parse an Atom document into messages.
///
/// Same fallbacks as [`parse_channel`]: entries without an author take the
/// feed's, entries without a date are stamped with `fetched_at`.
pub fn parse_atom(bytes: &[u8], fetched_at: DateTime<Utc>) -> Result<Vec<Message>, YomuError> {
    let feed =
        atom_syndication::Feed::read_from(bytes).map_err(|e| YomuError::Parse(e.to_string()))?;

    let feed_author = feed
        .authors()
        .first()
        .map(|p| p.name().to_string())
        .unwrap_or_default();

    let messages = feed
        .entries()
        .iter()
        .map(|entry| {
            let author = entry
                .authors()
                .first()
                .map(|p| p.name().to_string())
                .filter(|name| !name.is_empty())
                .unwrap_or_else(|| feed_author.clone());

            // A missing <updated> is read as the Unix epoch.
            let published = entry
                .published()
                .copied()
                .or_else(|| Some(*entry.updated()).filter(|dt| dt.timestamp() != 0))
                .map(|dt| dt.with_timezone(&Utc));

            let url = entry
                .links()
                .iter()
                .find(|l| l.rel() == "alternate")
                .or_else(|| entry.links().first())
                .map(|l| l.href().to_string())
                .unwrap_or_default();

            Message {
                id: None,
                custom_id: Some(entry.id().to_string()).filter(|id| !id.is_empty()),
                title: entry.title().value.clone(),
                url,
                author,
                contents: entry
                    .content()
                    .and_then(|c| c.value())
                    .or_else(|| entry.summary().map(|s| s.value.as_str()))
                    .unwrap_or("")
                    .to_string(),
                created: published.unwrap_or(fetched_at),
                created_from_feed: published.is_some(),
                ..Default::default()
            }
        })
        .collect();

    Ok(messages)
}

/// Parse an RSS document into messages.
///
/// Items without an author take the channel's; items without a usable date
/// are stamped with `fetched_at`.
pub fn parse_channel(bytes: &[u8], fetched_at: DateTime<Utc>) -> Result<Vec<Message>, YomuError> {
    let channel = rss::Channel::read_from(bytes).map_err(|e| YomuError::Parse(e.to_string()))?;

    let channel_author = channel
        .dublin_core_ext()
        .and_then(|dc| dc.creators().first().cloned())
        .or_else(|| channel.managing_editor().map(|s| s.to_string()))
        .unwrap_or_default();

    let messages = channel
        .items()
        .iter()
        .map(|item: &rss::Item| {
            let author = item
                .author()
                .map(|s| s.to_string())
                .or_else(|| {
                    item.dublin_core_ext()
                        .and_then(|dc| dc.creators().first().cloned())
                })
                .unwrap_or_else(|| channel_author.clone());

            let published = item
                .pub_date()
                .and_then(|s| DateTime::parse_from_rfc2822(s).ok())
                .or_else(|| {
                    item.dublin_core_ext()
                        .and_then(|dc| dc.dates().first())
                        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                })
                .map(|dt| dt.with_timezone(&Utc));

            Message {
                id: None,
                custom_id: item.guid().map(|g| g.value().to_string()),
                title: item.title().unwrap_or("").to_string(),
                url: item.link().unwrap_or("").to_string(),
                author,
                contents: item
                    .content()
                    .or_else(|| item.description())
                    .unwrap_or("")
                    .to_string(),
                created: published.unwrap_or(fetched_at),
                created_from_feed: published.is_some(),
                ..Default::default()
            }
        })
        .collect();

    Ok(messages)
}
