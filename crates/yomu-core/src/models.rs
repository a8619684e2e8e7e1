mod feed;
mod message;

pub use feed::{AccountRecord, FeedRecord};
pub use message::Message;
