use std::path::Path;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use rusqlite::types::Value;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use crate::error::YomuError;
use crate::filter::{DuplicateCheck, FilterId, MessageFilter, MessageLookup};
use crate::models::{AccountRecord, FeedRecord, Message};

const SCHEMA_V1: &str = include_str!("../../../migrations/001_initial.sql");

/// Account created by the initial migration for standard RSS feeds.
pub const LOCAL_ACCOUNT_ID: i64 = 1;

/// SQLite-backed store for feeds, filters and messages.
pub struct Storage {
    conn: Connection,
}

/// A connection shared between the feeds and filter scripts of one thread.
pub type SharedStorage = Arc<Mutex<Storage>>;

impl Storage {
    /// Open (or create) the database at the given path and run migrations.
    pub fn open(path: &Path) -> Result<Self, YomuError> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        run_migrations(&conn)?;
        Ok(Self { conn })
    }

    /// Open an in-memory database (for tests).
    pub fn open_memory() -> Result<Self, YomuError> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        run_migrations(&conn)?;
        Ok(Self { conn })
    }

    pub fn into_shared(self) -> SharedStorage {
        Arc::new(Mutex::new(self))
    }

    #[cfg(test)]
    pub(crate) fn execute_batch(&self, sql: &str) -> Result<(), YomuError> {
        self.conn.execute_batch(sql).map_err(Into::into)
    }

    // ── Accounts ────────────────────────────────────────────────

    pub fn insert_account(&self, title: &str) -> Result<i64, YomuError> {
        self.conn
            .execute("INSERT INTO accounts (title) VALUES (?1)", params![title])?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_account(&self, id: i64) -> Result<Option<AccountRecord>, YomuError> {
        self.conn
            .query_row(
                "SELECT id, title FROM accounts WHERE id = ?1",
                params![id],
                |row| {
                    Ok(AccountRecord {
                        id: row.get(0)?,
                        title: row.get(1)?,
                    })
                },
            )
            .optional()
            .map_err(Into::into)
    }

    // ── Feeds ───────────────────────────────────────────────────

    /// Insert a feed, returning its ID. The custom ID defaults to the row ID.
    pub fn insert_feed(&self, account_id: i64, title: &str, url: &str) -> Result<i64, YomuError> {
        self.conn.execute(
            "INSERT INTO feeds (account_id, title, url) VALUES (?1, ?2, ?3)",
            params![account_id, title, url],
        )?;
        let id = self.conn.last_insert_rowid();
        self.conn.execute(
            "UPDATE feeds SET custom_id = CAST(id AS TEXT) WHERE id = ?1",
            params![id],
        )?;
        Ok(id)
    }

    pub fn get_feeds(&self) -> Result<Vec<FeedRecord>, YomuError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, account_id, custom_id, title, url, last_checked, has_error
             FROM feeds ORDER BY title, id",
        )?;
        let rows = stmt
            .query_map([], row_to_feed)?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn get_feed(&self, id: i64) -> Result<Option<FeedRecord>, YomuError> {
        self.conn
            .query_row(
                "SELECT id, account_id, custom_id, title, url, last_checked, has_error
                 FROM feeds WHERE id = ?1",
                params![id],
                row_to_feed,
            )
            .optional()
            .map_err(Into::into)
    }

    /// Delete a feed with its messages and filter assignments.
    pub fn delete_feed(&self, id: i64) -> Result<(), YomuError> {
        let deleted = self
            .conn
            .execute("DELETE FROM feeds WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(YomuError::NotFound(format!("feed {id}")));
        }
        Ok(())
    }

    // ── Message filters ─────────────────────────────────────────

    pub fn insert_filter(&self, name: &str, script: &str) -> Result<FilterId, YomuError> {
        self.conn.execute(
            "INSERT INTO message_filters (name, script) VALUES (?1, ?2)",
            params![name, script],
        )?;
        Ok(self.conn.last_insert_rowid())
    }

    pub fn get_filters(&self) -> Result<Vec<MessageFilter>, YomuError> {
        let mut stmt = self
            .conn
            .prepare("SELECT id, name, script FROM message_filters ORDER BY id")?;
        let rows = stmt
            .query_map([], |row| {
                Ok(MessageFilter {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    script: row.get(2)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn delete_filter(&self, id: FilterId) -> Result<(), YomuError> {
        let deleted = self
            .conn
            .execute("DELETE FROM message_filters WHERE id = ?1", params![id])?;
        if deleted == 0 {
            return Err(YomuError::NotFound(format!("filter {id}")));
        }
        Ok(())
    }

    /// Append a filter to the end of a feed's chain. Re-assigning is a no-op.
    pub fn assign_filter(&self, feed_id: i64, filter_id: FilterId) -> Result<(), YomuError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO feed_filters (feed_id, filter_id, position)
             SELECT ?1, ?2, COALESCE(MAX(position) + 1, 0)
             FROM feed_filters WHERE feed_id = ?1",
            params![feed_id, filter_id],
        )?;
        Ok(())
    }

    /// Filter IDs attached to a feed, in chain order.
    pub fn filters_for_feed(&self, feed_id: i64) -> Result<Vec<FilterId>, YomuError> {
        let mut stmt = self.conn.prepare(
            "SELECT filter_id FROM feed_filters WHERE feed_id = ?1 ORDER BY position",
        )?;
        let rows = stmt
            .query_map(params![feed_id], |row| row.get(0))?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    // ── Messages ────────────────────────────────────────────────

    /// Merge a fetched batch into a feed in one transaction.
    ///
    /// Messages match stored rows by custom ID when they have one, otherwise
    /// by title, URL and author. A matched row is rewritten when the incoming
    /// feed-supplied date is newer or the contents changed; read and important
    /// state of stored rows is kept. Returns the number of inserted plus
    /// updated rows.
    pub fn update_messages(
        &self,
        feed_id: i64,
        account_id: i64,
        messages: &[Message],
    ) -> Result<usize, YomuError> {
        let tx = self.conn.unchecked_transaction()?;
        let changed = merge_messages(&tx, feed_id, account_id, messages)?;
        tx.commit()?;
        Ok(changed)
    }

    /// Merge a fetched batch and record the fetch outcome on the feed.
    ///
    /// Both writes share one transaction: when the merge fails the feed's
    /// `last_checked` and `has_error` stay as they were.
    pub fn record_fetch(
        &self,
        feed_id: i64,
        account_id: i64,
        messages: &[Message],
        has_error: bool,
    ) -> Result<usize, YomuError> {
        let tx = self.conn.unchecked_transaction()?;
        let changed = merge_messages(&tx, feed_id, account_id, messages)?;
        write_feed_status(&tx, feed_id, has_error)?;
        tx.commit()?;
        Ok(changed)
    }

    /// Messages of a feed, newest first.
    pub fn get_messages(&self, feed_id: i64) -> Result<Vec<Message>, YomuError> {
        let mut stmt = self.conn.prepare(
            "SELECT id, custom_id, title, url, author, contents, created,
             is_read, is_important, score
             FROM messages WHERE feed_id = ?1 ORDER BY created DESC, id DESC",
        )?;
        let rows = stmt
            .query_map(params![feed_id], |row| {
                let created: String = row.get(6)?;
                Ok(Message {
                    id: row.get(0)?,
                    custom_id: row.get(1)?,
                    title: row.get(2)?,
                    url: row.get(3)?,
                    author: row.get(4)?,
                    contents: row.get(5)?,
                    created: parse_datetime(&created),
                    created_from_feed: true,
                    is_read: row.get::<_, i32>(7)? != 0,
                    is_important: row.get::<_, i32>(8)? != 0,
                    score: row.get(9)?,
                })
            })?
            .filter_map(|r| r.ok())
            .collect();
        Ok(rows)
    }

    pub fn set_messages_read(&self, ids: &[i64], read: bool) -> Result<usize, YomuError> {
        self.set_message_flag("is_read", ids, read)
    }

    pub fn set_messages_important(&self, ids: &[i64], important: bool) -> Result<usize, YomuError> {
        self.set_message_flag("is_important", ids, important)
    }

    fn set_message_flag(&self, column: &str, ids: &[i64], value: bool) -> Result<usize, YomuError> {
        if ids.is_empty() {
            return Ok(0);
        }
        let tx = self.conn.unchecked_transaction()?;
        let mut changed = 0;
        {
            let mut stmt = tx.prepare(&format!("UPDATE messages SET {column} = ?1 WHERE id = ?2"))?;
            for id in ids {
                changed += stmt.execute(params![value as i32, id])?;
            }
        }
        tx.commit()?;
        Ok(changed)
    }

    /// Whether a stored message shares the selected attributes with `message`.
    ///
    /// Searches the feed with `feed_custom_id` unless `check` includes
    /// [`DuplicateCheck::ALL_FEEDS`]. A check without any attribute never
    /// matches.
    pub fn is_duplicate(
        &self,
        feed_custom_id: &str,
        account_id: i64,
        message: &Message,
        check: DuplicateCheck,
    ) -> Result<bool, YomuError> {
        if !check.has_attributes() {
            return Ok(false);
        }

        let mut sql = String::from(
            "SELECT COUNT(*) FROM messages m JOIN feeds f ON f.id = m.feed_id
             WHERE m.account_id = ?",
        );
        let mut values = vec![Value::Integer(account_id)];
        if !check.contains(DuplicateCheck::ALL_FEEDS) {
            sql.push_str(" AND f.custom_id = ?");
            values.push(Value::Text(feed_custom_id.to_string()));
        }
        let attributes = [
            (DuplicateCheck::SAME_TITLE, "m.title", &message.title),
            (DuplicateCheck::SAME_URL, "m.url", &message.url),
            (DuplicateCheck::SAME_AUTHOR, "m.author", &message.author),
        ];
        for (flag, column, value) in attributes {
            if check.contains(flag) {
                sql.push_str(&format!(" AND {column} = ?"));
                values.push(Value::Text(value.clone()));
            }
        }

        let count: i64 = self
            .conn
            .query_row(&sql, params_from_iter(values), |row| row.get(0))?;
        Ok(count > 0)
    }
}

impl MessageLookup for Mutex<Storage> {
    fn is_duplicate(
        &self,
        feed_custom_id: &str,
        account_id: i64,
        message: &Message,
        check: DuplicateCheck,
    ) -> Result<bool, YomuError> {
        self.lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_duplicate(feed_custom_id, account_id, message, check)
    }
}

// ── Migrations ──────────────────────────────────────────────────

fn run_migrations(conn: &Connection) -> Result<(), YomuError> {
    let version: i32 = conn
        .pragma_query_value(None, "user_version", |row| row.get(0))
        .unwrap_or(0);

    if version < 1 {
        conn.execute_batch(SCHEMA_V1)?;
        conn.pragma_update(None, "user_version", 1)?;
    }
    Ok(())
}

// ── Helpers ─────────────────────────────────────────────────────

/// Parse a datetime string from SQLite (either RFC 3339 or SQLite's `datetime('now')` format).
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(naive) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return naive.and_utc();
    }
    DateTime::default()
}

fn row_to_feed(row: &rusqlite::Row<'_>) -> rusqlite::Result<FeedRecord> {
    let last_checked: Option<String> = row.get(5)?;
    Ok(FeedRecord {
        id: row.get(0)?,
        account_id: row.get(1)?,
        custom_id: row.get(2)?,
        title: row.get(3)?,
        url: row.get(4)?,
        last_checked: last_checked.map(|s| parse_datetime(&s)),
        has_error: row.get::<_, i32>(6)? != 0,
    })
}

fn stored_message(row: &rusqlite::Row<'_>) -> rusqlite::Result<(i64, String, String)> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?))
}

fn write_feed_status(conn: &Connection, id: i64, has_error: bool) -> Result<(), YomuError> {
    conn.execute(
        "UPDATE feeds SET last_checked = ?1, has_error = ?2 WHERE id = ?3",
        params![Utc::now().to_rfc3339(), has_error as i32, id],
    )?;
    Ok(())
}

fn merge_messages(
    conn: &Connection,
    feed_id: i64,
    account_id: i64,
    messages: &[Message],
) -> Result<usize, YomuError> {
    let mut changed = 0;
    let mut by_custom_id = conn.prepare(
        "SELECT id, created, contents FROM messages
         WHERE feed_id = ?1 AND custom_id = ?2",
    )?;
    let mut by_attributes = conn.prepare(
        "SELECT id, created, contents FROM messages
         WHERE feed_id = ?1 AND custom_id IS NULL
           AND title = ?2 AND url = ?3 AND author = ?4",
    )?;
    let mut update = conn.prepare(
        "UPDATE messages SET title = ?1, url = ?2, author = ?3, contents = ?4,
         created = ?5 WHERE id = ?6",
    )?;
    let mut insert = conn.prepare(
        "INSERT INTO messages (feed_id, account_id, custom_id, title, url, author,
         contents, created, is_read, is_important, score)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
    )?;

    for msg in messages {
        let existing = match &msg.custom_id {
            Some(custom_id) => by_custom_id
                .query_row(params![feed_id, custom_id], stored_message)
                .optional()?,
            None => by_attributes
                .query_row(params![feed_id, msg.title, msg.url, msg.author], stored_message)
                .optional()?,
        };

        match existing {
            Some((id, created, contents)) => {
                let newer = msg.created_from_feed && msg.created > parse_datetime(&created);
                if newer || contents != msg.contents {
                    update.execute(params![
                        msg.title,
                        msg.url,
                        msg.author,
                        msg.contents,
                        msg.created.to_rfc3339(),
                        id,
                    ])?;
                    changed += 1;
                }
            }
            None => {
                insert.execute(params![
                    feed_id,
                    account_id,
                    msg.custom_id,
                    msg.title,
                    msg.url,
                    msg.author,
                    msg.contents,
                    msg.created.to_rfc3339(),
                    msg.is_read as i32,
                    msg.is_important as i32,
                    msg.score,
                ])?;
                changed += 1;
            }
        }
    }
    Ok(changed)
}
