//! Message record types persisted by the durable store.

use chrono::{DateTime, Utc};

use mentorlink_proto::envelope::{ConversationId, MessageId, MessageKind, UserId};

/// Synchronization state of a locally stored message.
///
/// Lifecycle: `Pending → Syncing → Synced` on success, `Syncing → Failed`
/// on error. `Failed` records with retry budget left re-enter the push
/// queue on the next pass; once the retry cap is reached the record stays
/// `Failed` until an explicit retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncStatus {
    /// Authored locally, not yet confirmed by the remote store.
    Pending,
    /// A push attempt is in flight.
    Syncing,
    /// The remote store has confirmed this record.
    Synced,
    /// The last push attempt failed.
    Failed,
}

impl SyncStatus {
    /// Returns the stored string form of this status.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Syncing => "syncing",
            Self::Synced => "synced",
            Self::Failed => "failed",
        }
    }

    /// Parses a stored status string.
    #[must_use]
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "syncing" => Some(Self::Syncing),
            "synced" => Some(Self::Synced),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A single message as persisted on this device.
///
/// `conversation_id`, `sender_id`, `kind`, `content`, and
/// `created_at_local` are fixed at creation; only the flags, sync
/// bookkeeping, and the authoritative `server_timestamp` change afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageRecord {
    /// Device-assigned, globally unique id.
    pub id: MessageId,
    /// Conversation the message belongs to.
    pub conversation_id: ConversationId,
    /// Authoring user.
    pub sender_id: UserId,
    /// Display name of the sender at creation time.
    pub sender_name: String,
    /// Content kind.
    pub kind: MessageKind,
    /// Message content.
    pub content: String,
    /// Creation instant observed on the producing device.
    pub created_at_local: DateTime<Utc>,
    /// Authoritative instant, present once the remote copy is known.
    pub server_timestamp: Option<DateTime<Utc>>,
    /// Whether the local user has read the message.
    pub read: bool,
    /// Whether delivery to the counterpart was confirmed.
    pub delivered: bool,
    /// Synchronization state.
    pub sync_status: SyncStatus,
    /// Automatic push attempts consumed so far.
    pub retry_count: u32,
}

impl MessageRecord {
    /// Creates a freshly authored, not-yet-synced record.
    #[must_use]
    pub fn new(
        conversation_id: ConversationId,
        sender_id: UserId,
        sender_name: impl Into<String>,
        kind: MessageKind,
        content: impl Into<String>,
    ) -> Self {
        Self {
            id: MessageId::new(),
            conversation_id,
            sender_id,
            sender_name: sender_name.into(),
            kind,
            content: content.into(),
            created_at_local: Utc::now(),
            server_timestamp: None,
            read: false,
            delivered: false,
            sync_status: SyncStatus::Pending,
            retry_count: 0,
        }
    }
}

/// A conversation with derived activity data.
///
/// `last_activity` and `unread_count` are recomputed from message records
/// on every query; they are cache values, never stored authoritatively.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConversationSummary {
    /// Conversation id.
    pub id: ConversationId,
    /// First participant (by convention, the mentor).
    pub participant_a: UserId,
    /// Second participant (by convention, the mentee).
    pub participant_b: UserId,
    /// Optional subject label.
    pub subject: Option<String>,
    /// Creation instant of the newest message, if any exist.
    pub last_activity: Option<DateTime<Utc>>,
    /// Messages from the counterpart not yet read locally.
    pub unread_count: u32,
}

/// Aggregate per-status record counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StatusCounts {
    /// Records awaiting a push.
    pub pending: u32,
    /// Records with a push in flight.
    pub syncing: u32,
    /// Records confirmed by the remote.
    pub synced: u32,
    /// Records whose last push failed.
    pub failed: u32,
}
