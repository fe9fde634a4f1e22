//! Collaborator interfaces consumed by the engine.
//!
//! The hosted record store and the push-notification dispatcher are
//! external services; the engine reaches them through the [`RemoteStore`]
//! and [`Notifier`] traits so tests substitute deterministic doubles.
//! [`InMemoryRemote`] is that double: an in-process remote with failure
//! injection and an authoritative clock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use mentorlink_proto::envelope::{ConversationId, MessageId, MessageKind, UserId};

use crate::store::record::{MessageRecord, SyncStatus};

/// Errors surfaced by the remote record store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum RemoteError {
    /// A record with the same id already exists remotely.
    ///
    /// Push treats this as an idempotent skip, never a duplicate insert.
    #[error("record already exists: {0}")]
    AlreadyExists(MessageId),

    /// The addressed record does not exist remotely.
    #[error("record not found: {0}")]
    NotFound(MessageId),

    /// The remote service could not be reached or answered with an error.
    #[error("remote unavailable: {0}")]
    Unavailable(String),
}

/// A message as the remote store holds it.
///
/// Unlike a local [`MessageRecord`], the `server_timestamp` is always
/// present — the remote assigns it on insert and it is authoritative.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteMessage {
    /// Device-assigned message id.
    pub id: MessageId,
    /// Conversation the message belongs to.
    pub conversation_id: ConversationId,
    /// Authoring user.
    pub sender_id: UserId,
    /// Display name of the sender at send time.
    pub sender_name: String,
    /// Content kind.
    pub kind: MessageKind,
    /// Message content.
    pub content: String,
    /// Creation instant observed on the producing device.
    pub created_at_local: DateTime<Utc>,
    /// Authoritative instant assigned by the remote store.
    pub server_timestamp: DateTime<Utc>,
    /// Read flag as the remote last saw it.
    pub read: bool,
    /// Delivered flag as the remote last saw it.
    pub delivered: bool,
}

impl RemoteMessage {
    /// Builds the remote representation of a locally authored record.
    ///
    /// The placeholder `server_timestamp` is replaced by the remote on
    /// insert; callers use the returned authoritative copy.
    #[must_use]
    pub fn from_local(record: &MessageRecord) -> Self {
        Self {
            id: record.id.clone(),
            conversation_id: record.conversation_id.clone(),
            sender_id: record.sender_id.clone(),
            sender_name: record.sender_name.clone(),
            kind: record.kind,
            content: record.content.clone(),
            created_at_local: record.created_at_local,
            server_timestamp: record.server_timestamp.unwrap_or(record.created_at_local),
            read: record.read,
            delivered: record.delivered,
        }
    }

    /// Converts the authoritative copy into a local record, entering the
    /// store directly as `Synced`.
    #[must_use]
    pub fn into_local_record(self) -> MessageRecord {
        MessageRecord {
            id: self.id,
            conversation_id: self.conversation_id,
            sender_id: self.sender_id,
            sender_name: self.sender_name,
            kind: self.kind,
            content: self.content,
            created_at_local: self.created_at_local,
            server_timestamp: Some(self.server_timestamp),
            read: self.read,
            delivered: self.delivered,
            sync_status: SyncStatus::Synced,
            retry_count: 0,
        }
    }
}

/// Patch of the remotely mutable message fields.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MessagePatch {
    /// New read flag, when it changed.
    pub read: Option<bool>,
    /// New delivered flag, when it changed.
    pub delivered: Option<bool>,
}

/// Typed filtered CRUD over the hosted record store.
///
/// No transactions are assumed; every operation stands alone and pulls are
/// safe to repeat.
pub trait RemoteStore: Send + Sync + 'static {
    /// Inserts a record, returning the authoritative stored copy.
    fn insert_message(
        &self,
        message: &RemoteMessage,
    ) -> impl std::future::Future<Output = Result<RemoteMessage, RemoteError>> + Send;

    /// Patches an existing record's mutable fields.
    fn update_message(
        &self,
        id: &MessageId,
        patch: MessagePatch,
    ) -> impl std::future::Future<Output = Result<(), RemoteError>> + Send;

    /// Fetches a single record by id.
    fn fetch_message(
        &self,
        id: &MessageId,
    ) -> impl std::future::Future<Output = Result<Option<RemoteMessage>, RemoteError>> + Send;

    /// Fetches records for `user`'s conversations with a server timestamp
    /// strictly newer than `cursor`, oldest first, at most `limit`.
    fn messages_since(
        &self,
        user: &UserId,
        cursor: DateTime<Utc>,
        limit: u32,
    ) -> impl std::future::Future<Output = Result<Vec<RemoteMessage>, RemoteError>> + Send;

    /// Fetches one page of a conversation, newest first, offset-paginated.
    fn conversation_page(
        &self,
        conversation: &ConversationId,
        limit: u32,
        offset: u32,
    ) -> impl std::future::Future<Output = Result<Vec<RemoteMessage>, RemoteError>> + Send;
}

impl<R: RemoteStore> RemoteStore for std::sync::Arc<R> {
    async fn insert_message(&self, message: &RemoteMessage) -> Result<RemoteMessage, RemoteError> {
        (**self).insert_message(message).await
    }

    async fn update_message(&self, id: &MessageId, patch: MessagePatch) -> Result<(), RemoteError> {
        (**self).update_message(id, patch).await
    }

    async fn fetch_message(&self, id: &MessageId) -> Result<Option<RemoteMessage>, RemoteError> {
        (**self).fetch_message(id).await
    }

    async fn messages_since(
        &self,
        user: &UserId,
        cursor: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<RemoteMessage>, RemoteError> {
        (**self).messages_since(user, cursor, limit).await
    }

    async fn conversation_page(
        &self,
        conversation: &ConversationId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<RemoteMessage>, RemoteError> {
        (**self).conversation_page(conversation, limit, offset).await
    }
}

/// A push notification about a freshly synced message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageNotification {
    /// The message that was delivered to the remote store.
    pub message_id: MessageId,
    /// Its conversation.
    pub conversation_id: ConversationId,
    /// Sender display name for the notification banner.
    pub sender_name: String,
    /// Short content preview.
    pub preview: String,
}

/// Fire-and-forget push-notification dispatch.
///
/// Delivery is somebody else's problem: implementations never block and
/// never report failure to the caller.
pub trait Notifier: Send + Sync + 'static {
    /// Dispatches a notification to a user.
    fn notify(&self, user: &UserId, notification: &MessageNotification);
}

/// Default [`Notifier`]: records the dispatch in the log and nothing else.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, user: &UserId, notification: &MessageNotification) {
        tracing::debug!(
            user = %user,
            message = %notification.message_id,
            "push notification dispatched"
        );
    }
}

/// Test [`Notifier`] capturing every dispatch.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<(UserId, MessageNotification)>>,
}

impl RecordingNotifier {
    /// Creates an empty recorder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns every dispatch captured so far.
    pub fn sent(&self) -> Vec<(UserId, MessageNotification)> {
        self.sent.lock().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, user: &UserId, notification: &MessageNotification) {
        self.sent.lock().push((user.clone(), notification.clone()));
    }
}

impl<N: Notifier> Notifier for std::sync::Arc<N> {
    fn notify(&self, user: &UserId, notification: &MessageNotification) {
        (**self).notify(user, notification);
    }
}

/// Deterministic in-process [`RemoteStore`] for tests and the local demo.
///
/// Supports failure injection per operation family and an optional
/// artificial latency so concurrency guards can be exercised.
#[derive(Default)]
pub struct InMemoryRemote {
    messages: Mutex<HashMap<MessageId, RemoteMessage>>,
    fail_inserts: AtomicU32,
    fail_fetches: AtomicU32,
    latency: Mutex<Option<Duration>>,
}

impl InMemoryRemote {
    /// Creates an empty remote.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `n` inserts fail with [`RemoteError::Unavailable`].
    pub fn fail_next_inserts(&self, n: u32) {
        self.fail_inserts.store(n, Ordering::SeqCst);
    }

    /// Makes the next `n` fetch/pull operations fail.
    pub fn fail_next_fetches(&self, n: u32) {
        self.fail_fetches.store(n, Ordering::SeqCst);
    }

    /// Adds an artificial delay to every operation.
    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock() = Some(latency);
    }

    /// Seeds a record as if another device had inserted it at `timestamp`.
    pub fn seed(&self, mut message: RemoteMessage, timestamp: DateTime<Utc>) {
        message.server_timestamp = timestamp;
        self.messages.lock().insert(message.id.clone(), message);
    }

    /// Number of records held.
    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    /// Returns `true` when no records are held.
    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }

    /// Fetches a stored record without failure injection.
    pub fn get(&self, id: &MessageId) -> Option<RemoteMessage> {
        self.messages.lock().get(id).cloned()
    }

    async fn apply_latency(&self) {
        let latency = *self.latency.lock();
        if let Some(latency) = latency {
            tokio::time::sleep(latency).await;
        }
    }

    fn take_failure(counter: &AtomicU32) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

impl RemoteStore for InMemoryRemote {
    async fn insert_message(&self, message: &RemoteMessage) -> Result<RemoteMessage, RemoteError> {
        self.apply_latency().await;
        if Self::take_failure(&self.fail_inserts) {
            return Err(RemoteError::Unavailable("injected insert failure".into()));
        }
        let mut messages = self.messages.lock();
        if messages.contains_key(&message.id) {
            return Err(RemoteError::AlreadyExists(message.id.clone()));
        }
        let mut stored = message.clone();
        stored.server_timestamp = Utc::now();
        messages.insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    async fn update_message(&self, id: &MessageId, patch: MessagePatch) -> Result<(), RemoteError> {
        self.apply_latency().await;
        let mut messages = self.messages.lock();
        let Some(stored) = messages.get_mut(id) else {
            return Err(RemoteError::NotFound(id.clone()));
        };
        if let Some(read) = patch.read {
            stored.read = read;
        }
        if let Some(delivered) = patch.delivered {
            stored.delivered = delivered;
        }
        Ok(())
    }

    async fn fetch_message(&self, id: &MessageId) -> Result<Option<RemoteMessage>, RemoteError> {
        self.apply_latency().await;
        if Self::take_failure(&self.fail_fetches) {
            return Err(RemoteError::Unavailable("injected fetch failure".into()));
        }
        Ok(self.messages.lock().get(id).cloned())
    }

    async fn messages_since(
        &self,
        _user: &UserId,
        cursor: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<RemoteMessage>, RemoteError> {
        self.apply_latency().await;
        if Self::take_failure(&self.fail_fetches) {
            return Err(RemoteError::Unavailable("injected pull failure".into()));
        }
        // Test double: every record is visible to every user.
        let mut records: Vec<RemoteMessage> = self
            .messages
            .lock()
            .values()
            .filter(|m| m.server_timestamp > cursor)
            .cloned()
            .collect();
        records.sort_by(|a, b| a.server_timestamp.cmp(&b.server_timestamp));
        records.truncate(limit as usize);
        Ok(records)
    }

    async fn conversation_page(
        &self,
        conversation: &ConversationId,
        limit: u32,
        offset: u32,
    ) -> Result<Vec<RemoteMessage>, RemoteError> {
        self.apply_latency().await;
        if Self::take_failure(&self.fail_fetches) {
            return Err(RemoteError::Unavailable("injected page failure".into()));
        }
        let mut records: Vec<RemoteMessage> = self
            .messages
            .lock()
            .values()
            .filter(|m| m.conversation_id == *conversation)
            .cloned()
            .collect();
        records.sort_by(|a, b| b.created_at_local.cmp(&a.created_at_local));
        Ok(records
            .into_iter()
            .skip(offset as usize)
            .take(limit as usize)
            .collect())
    }
}
