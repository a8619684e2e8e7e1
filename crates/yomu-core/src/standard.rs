//! Plain RSS feeds stored in the local database.

mod feed;
mod parser;
mod service_root;

pub use feed::{build_http_client, validate_feed_url, StandardFeed};
pub use parser::{parse_atom, parse_channel, parse_feed};
pub use service_root::{MessageStateCache, StandardServiceRoot};
