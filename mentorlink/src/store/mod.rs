//! Durable message store — the single source of truth for every message
//! this device has produced or received, tagged with its sync state.
//!
//! Writes follow the outbox pattern: a message is persisted here *before*
//! any network attempt, so a failed or never-attempted transmission can
//! never lose data. Saving an id that already exists is an upsert, never a
//! duplicate row; on conflict the incoming (remote-authoritative) copy wins
//! for every field except the purely local `read`/`delivered` flags, which
//! merge monotonically, and an existing `server_timestamp`, which is never
//! reverted to unknown.

pub mod record;

use std::path::Path;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use rusqlite::{Connection, params};

use mentorlink_proto::envelope::{ConversationId, MessageId, MessageKind, UserId};

use self::record::{ConversationSummary, MessageRecord, StatusCounts, SyncStatus};

/// Errors raised by durable storage operations.
///
/// Write failures always propagate to the caller — a failed durable write
/// must never be silently swallowed.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The underlying database operation failed.
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// The storage location could not be prepared.
    #[error("storage path error: {0}")]
    Path(#[from] std::io::Error),
}

/// Current schema version, tracked via `PRAGMA user_version`.
const SCHEMA_VERSION: i32 = 1;

/// Column list shared by every message SELECT.
const MESSAGE_COLUMNS: &str = "id, conversation_id, sender_id, sender_name, kind, content, \
     created_at_local, server_timestamp, read_flag, delivered_flag, sync_status, retry_count";

/// SQLite-backed durable message store.
///
/// A single connection behind a mutex: enqueue-style writes from user
/// actions and reconnection-triggered sync bookkeeping interleave safely,
/// and the engine assumes at most one writer process per store file.
pub struct MessageStore {
    conn: Mutex<Connection>,
}

impl MessageStore {
    /// Opens (creating if needed) a store at the given path.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the parent directory cannot be created or
    /// the database cannot be opened/migrated.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Opens a transient in-memory store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the database cannot be created.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::migrate(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Applies schema migrations up to [`SCHEMA_VERSION`].
    fn migrate(conn: &Connection) -> Result<(), StoreError> {
        let version: i32 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
        if version < 1 {
            conn.execute_batch(
                "CREATE TABLE IF NOT EXISTS messages (
                     id TEXT PRIMARY KEY,
                     conversation_id TEXT NOT NULL,
                     sender_id TEXT NOT NULL,
                     sender_name TEXT NOT NULL,
                     kind TEXT NOT NULL,
                     content TEXT NOT NULL,
                     created_at_local INTEGER NOT NULL,
                     server_timestamp INTEGER,
                     read_flag INTEGER NOT NULL DEFAULT 0,
                     delivered_flag INTEGER NOT NULL DEFAULT 0,
                     sync_status TEXT NOT NULL,
                     retry_count INTEGER NOT NULL DEFAULT 0
                 );
                 CREATE INDEX IF NOT EXISTS idx_messages_conversation
                     ON messages (conversation_id, created_at_local);
                 CREATE INDEX IF NOT EXISTS idx_messages_sync_status
                     ON messages (sync_status);
                 CREATE TABLE IF NOT EXISTS conversations (
                     id TEXT PRIMARY KEY,
                     participant_a TEXT NOT NULL,
                     participant_b TEXT NOT NULL,
                     subject TEXT
                 );
                 CREATE TABLE IF NOT EXISTS sync_meta (
                     key TEXT PRIMARY KEY,
                     value TEXT NOT NULL
                 );",
            )?;
        }
        if version != SCHEMA_VERSION {
            conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
        }
        Ok(())
    }

    /// Persists a message, upserting by id (outbox pattern).
    ///
    /// `mark_for_sync = true` stores the record as `Pending` (locally
    /// authored, must be pushed); `false` stores it as `Synced` (already
    /// known to the remote — pulled records MUST use this, or they would be
    /// re-pushed forever). On conflict with an existing row the incoming
    /// copy wins, except: `read`/`delivered` merge monotonically, an
    /// existing `server_timestamp` is kept when the incoming one is absent,
    /// and `retry_count` is untouched.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    pub fn save_local(&self, record: &MessageRecord, mark_for_sync: bool) -> Result<(), StoreError> {
        let status = if mark_for_sync {
            SyncStatus::Pending
        } else {
            SyncStatus::Synced
        };
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO messages (id, conversation_id, sender_id, sender_name, kind, content,
                                   created_at_local, server_timestamp, read_flag, delivered_flag,
                                   sync_status, retry_count)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
             ON CONFLICT(id) DO UPDATE SET
                 sender_name = excluded.sender_name,
                 kind = excluded.kind,
                 content = excluded.content,
                 server_timestamp = COALESCE(excluded.server_timestamp, messages.server_timestamp),
                 read_flag = MAX(messages.read_flag, excluded.read_flag),
                 delivered_flag = MAX(messages.delivered_flag, excluded.delivered_flag),
                 sync_status = excluded.sync_status",
            params![
                record.id.to_string(),
                record.conversation_id.to_string(),
                record.sender_id.as_str(),
                record.sender_name,
                record.kind.as_str(),
                record.content,
                record.created_at_local.timestamp_millis(),
                record.server_timestamp.map(|t| t.timestamp_millis()),
                i64::from(record.read),
                i64::from(record.delivered),
                status.as_str(),
                i64::from(record.retry_count),
            ],
        )?;
        Ok(())
    }

    /// Fetches a single record by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    pub fn get(&self, id: &MessageId) -> Result<Option<MessageRecord>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE id = ?1"
        ))?;
        let mut rows = stmt.query(params![id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_record(row)?)),
            None => Ok(None),
        }
    }

    /// Returns one page of a conversation, oldest→newest within the page.
    ///
    /// Pages are delimited by `offset` over a timestamp-descending query
    /// internally and reversed on return, so pagination stays stable as new
    /// messages arrive: offset 0 is always the most recent page, and
    /// concatenating pages in fetch order walks backwards through history.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    pub fn messages_page(
        &self,
        conversation: &ConversationId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<MessageRecord>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages WHERE conversation_id = ?1
             ORDER BY created_at_local DESC, id DESC LIMIT ?2 OFFSET ?3"
        ))?;
        let rows = stmt.query_map(
            params![conversation.to_string(), i64::from(limit), i64::from(offset)],
            row_to_record,
        )?;
        let mut records = rows.collect::<Result<Vec<_>, _>>()?;
        records.reverse();
        Ok(records)
    }

    /// Returns records that still need pushing: `pending` or `failed`, with
    /// retry budget left, oldest first so a long backlog cannot starve
    /// early messages.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    pub fn unsynced(&self, max_retries: u32) -> Result<Vec<MessageRecord>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "SELECT {MESSAGE_COLUMNS} FROM messages
             WHERE sync_status IN ('pending', 'failed') AND retry_count < ?1
             ORDER BY created_at_local ASC, id ASC"
        ))?;
        let rows = stmt.query_map(params![i64::from(max_retries)], row_to_record)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Marks a message as read by the local user.
    ///
    /// A read-state change must propagate, so a `synced` record drops back
    /// to `pending`; in-flight or failed records keep their status (the
    /// flag rides along with the eventual push).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    pub fn mark_read(&self, id: &MessageId) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE messages SET read_flag = 1,
                 sync_status = CASE WHEN sync_status = 'synced' THEN 'pending'
                                    ELSE sync_status END
             WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(changed > 0)
    }

    /// Marks delivery of a message as confirmed by the counterpart.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    pub fn mark_delivered(&self, id: &MessageId) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE messages SET delivered_flag = 1 WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(changed > 0)
    }

    /// Transitions a record into `syncing` ahead of a push attempt.
    ///
    /// Only `pending` and `failed` records may enter `syncing`.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    pub fn mark_syncing(&self, id: &MessageId) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE messages SET sync_status = 'syncing'
             WHERE id = ?1 AND sync_status IN ('pending', 'failed')",
            params![id.to_string()],
        )?;
        Ok(changed > 0)
    }

    /// Records a successful push: the record is `synced` and carries the
    /// authoritative timestamp from the remote store.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    pub fn record_sync_success(
        &self,
        id: &MessageId,
        server_timestamp: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE messages SET sync_status = 'synced', server_timestamp = ?2 WHERE id = ?1",
            params![id.to_string(), server_timestamp.timestamp_millis()],
        )?;
        Ok(changed > 0)
    }

    /// Records a failed push: increments the retry counter and parks the
    /// record in `failed`. Once the counter reaches the cap, [`unsynced`]
    /// stops returning the record and no further automatic attempts occur.
    ///
    /// [`unsynced`]: Self::unsynced
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    pub fn record_sync_failure(&self, id: &MessageId) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE messages SET sync_status = 'failed', retry_count = retry_count + 1
             WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(changed > 0)
    }

    /// Explicit retry of a `failed` record: back to `pending` with a fresh
    /// retry budget. This is the only path out of terminal failure.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    pub fn retry_message(&self, id: &MessageId) -> Result<bool, StoreError> {
        let conn = self.conn.lock();
        let changed = conn.execute(
            "UPDATE messages SET sync_status = 'pending', retry_count = 0
             WHERE id = ?1 AND sync_status = 'failed'",
            params![id.to_string()],
        )?;
        Ok(changed > 0)
    }

    /// Aggregate record counts per sync status.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    pub fn status_counts(&self) -> Result<StatusCounts, StoreError> {
        let conn = self.conn.lock();
        let mut stmt =
            conn.prepare("SELECT sync_status, COUNT(*) FROM messages GROUP BY sync_status")?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        let mut counts = StatusCounts::default();
        for row in rows {
            let (status, count) = row?;
            let count = u32::try_from(count).unwrap_or(u32::MAX);
            match SyncStatus::parse(&status) {
                Some(SyncStatus::Pending) => counts.pending = count,
                Some(SyncStatus::Syncing) => counts.syncing = count,
                Some(SyncStatus::Synced) => counts.synced = count,
                Some(SyncStatus::Failed) => counts.failed = count,
                None => {}
            }
        }
        Ok(counts)
    }

    /// Registers (or updates the subject of) a conversation.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    pub fn upsert_conversation(
        &self,
        id: &ConversationId,
        participant_a: &UserId,
        participant_b: &UserId,
        subject: Option<&str>,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO conversations (id, participant_a, participant_b, subject)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(id) DO UPDATE SET
                 subject = COALESCE(excluded.subject, conversations.subject)",
            params![
                id.to_string(),
                participant_a.as_str(),
                participant_b.as_str(),
                subject,
            ],
        )?;
        Ok(())
    }

    /// Fetches one conversation with derived activity data.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    pub fn conversation(
        &self,
        id: &ConversationId,
        local_user: &UserId,
    ) -> Result<Option<ConversationSummary>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(CONVERSATION_QUERY)?;
        let mut rows = stmt.query(params![local_user.as_str(), id.to_string()])?;
        match rows.next()? {
            Some(row) => Ok(Some(row_to_conversation(row)?)),
            None => Ok(None),
        }
    }

    /// Lists all conversations, most recently active first. `unread_count`
    /// counts unread messages authored by the counterpart.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    pub fn conversations(
        &self,
        local_user: &UserId,
    ) -> Result<Vec<ConversationSummary>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(&format!(
            "{CONVERSATION_QUERY_BASE} ORDER BY last_activity IS NULL, last_activity DESC"
        ))?;
        let rows = stmt.query_map(params![local_user.as_str()], row_to_conversation)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// Returns the persisted pull cursor, if a pull has ever completed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the read fails.
    pub fn pull_cursor(&self) -> Result<Option<DateTime<Utc>>, StoreError> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare("SELECT value FROM sync_meta WHERE key = 'pull_cursor'")?;
        let mut rows = stmt.query([])?;
        match rows.next()? {
            Some(row) => {
                let raw: String = row.get(0)?;
                let millis = raw
                    .parse::<i64>()
                    .map_err(|e| conversion_error(0, e.to_string()))?;
                let cursor = DateTime::from_timestamp_millis(millis)
                    .ok_or_else(|| conversion_error(0, format!("timestamp out of range: {millis}")))?;
                Ok(Some(cursor))
            }
            None => Ok(None),
        }
    }

    /// Advances the persisted pull cursor.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the write fails.
    pub fn set_pull_cursor(&self, cursor: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT OR REPLACE INTO sync_meta (key, value) VALUES ('pull_cursor', ?1)",
            params![cursor.timestamp_millis().to_string()],
        )?;
        Ok(())
    }
}

/// Base of the conversation summary query; callers append ORDER BY / WHERE.
const CONVERSATION_QUERY_BASE: &str = "SELECT c.id, c.participant_a, c.participant_b, c.subject,
        (SELECT MAX(m.created_at_local) FROM messages m
          WHERE m.conversation_id = c.id) AS last_activity,
        (SELECT COUNT(*) FROM messages m
          WHERE m.conversation_id = c.id AND m.read_flag = 0 AND m.sender_id != ?1)
     FROM conversations c";

/// Single-conversation variant of [`CONVERSATION_QUERY_BASE`].
const CONVERSATION_QUERY: &str = "SELECT c.id, c.participant_a, c.participant_b, c.subject,
        (SELECT MAX(m.created_at_local) FROM messages m
          WHERE m.conversation_id = c.id) AS last_activity,
        (SELECT COUNT(*) FROM messages m
          WHERE m.conversation_id = c.id AND m.read_flag = 0 AND m.sender_id != ?1)
     FROM conversations c WHERE c.id = ?2";

/// Builds a column conversion error in rusqlite's own error shape.
fn conversion_error(index: usize, message: String) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(
        index,
        rusqlite::types::Type::Text,
        message.into(),
    )
}

/// Converts a database row into a [`MessageRecord`].
fn row_to_record(row: &rusqlite::Row<'_>) -> rusqlite::Result<MessageRecord> {
    let id: String = row.get(0)?;
    let conversation: String = row.get(1)?;
    let kind: String = row.get(4)?;
    let created_at: i64 = row.get(6)?;
    let server_ts: Option<i64> = row.get(7)?;
    let status: String = row.get(10)?;
    let retry_count: i64 = row.get(11)?;

    Ok(MessageRecord {
        id: MessageId::from_uuid(
            uuid::Uuid::parse_str(&id).map_err(|e| conversion_error(0, e.to_string()))?,
        ),
        conversation_id: ConversationId::from_uuid(
            uuid::Uuid::parse_str(&conversation)
                .map_err(|e| conversion_error(1, e.to_string()))?,
        ),
        sender_id: UserId::new(row.get::<_, String>(2)?),
        sender_name: row.get(3)?,
        kind: MessageKind::parse(&kind)
            .ok_or_else(|| conversion_error(4, format!("unknown message kind: {kind}")))?,
        content: row.get(5)?,
        created_at_local: DateTime::from_timestamp_millis(created_at)
            .ok_or_else(|| conversion_error(6, format!("timestamp out of range: {created_at}")))?,
        server_timestamp: match server_ts {
            Some(ms) => Some(DateTime::from_timestamp_millis(ms).ok_or_else(|| {
                conversion_error(7, format!("timestamp out of range: {ms}"))
            })?),
            None => None,
        },
        read: row.get::<_, i64>(8)? != 0,
        delivered: row.get::<_, i64>(9)? != 0,
        sync_status: SyncStatus::parse(&status)
            .ok_or_else(|| conversion_error(10, format!("unknown sync status: {status}")))?,
        retry_count: u32::try_from(retry_count)
            .map_err(|e| conversion_error(11, e.to_string()))?,
    })
}

/// Converts a database row into a [`ConversationSummary`].
fn row_to_conversation(row: &rusqlite::Row<'_>) -> rusqlite::Result<ConversationSummary> {
    let id: String = row.get(0)?;
    let last_activity: Option<i64> = row.get(4)?;
    let unread: i64 = row.get(5)?;
    Ok(ConversationSummary {
        id: ConversationId::from_uuid(
            uuid::Uuid::parse_str(&id).map_err(|e| conversion_error(0, e.to_string()))?,
        ),
        participant_a: UserId::new(row.get::<_, String>(1)?),
        participant_b: UserId::new(row.get::<_, String>(2)?),
        subject: row.get(3)?,
        last_activity: match last_activity {
            Some(ms) => Some(DateTime::from_timestamp_millis(ms).ok_or_else(|| {
                conversion_error(4, format!("timestamp out of range: {ms}"))
            })?),
            None => None,
        },
        unread_count: u32::try_from(unread).unwrap_or(u32::MAX),
    })
}
