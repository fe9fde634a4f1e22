//! Sync coordinator — reconciles the local durable store with the remote
//! authoritative store.
//!
//! One pass = push phase (drain locally pending records to the remote,
//! oldest first, rate-limited) then pull phase (fetch remote records newer
//! than the persisted cursor and upsert them locally as already-synced).
//! Passes run periodically while connected and on demand via
//! [`SyncCoordinator::sync_now`]; a guard flag keeps them mutually
//! exclusive — an overlapping tick is skipped, never queued.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use mentorlink_proto::codec::{self, EventPayload};
use mentorlink_proto::envelope::{UserId, WireEnvelope};

use crate::connection::ConnectionManager;
use crate::remote::{
    MessageNotification, MessagePatch, Notifier, RemoteError, RemoteMessage, RemoteStore,
};
use crate::store::record::MessageRecord;
use crate::store::{MessageStore, StoreError};
use crate::transport::Transport;

/// Maximum characters of message content carried in a notification preview.
const PREVIEW_CHARS: usize = 80;

/// Configuration for the sync coordinator.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Interval between periodic passes.
    pub interval: Duration,
    /// Delay between consecutive pushes within a pass (remote rate limit).
    pub batch_delay: Duration,
    /// Automatic retry cap per record.
    pub max_retries: u32,
    /// Maximum records fetched per pull.
    pub pull_limit: u32,
    /// Capacity of the sync event broadcast channel.
    pub event_buffer: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(120),
            batch_delay: Duration::from_millis(150),
            max_retries: 5,
            pull_limit: 200,
            event_buffer: 64,
        }
    }
}

/// Outcome counts of one sync pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncReport {
    /// Records newly written (or patched) on the remote.
    pub pushed: u32,
    /// Records the remote already had (idempotent skips).
    pub skipped: u32,
    /// Push attempts that failed and were recorded against the record.
    pub failed: u32,
    /// Remote records pulled into the local store.
    pub pulled: u32,
}

/// Progress events published by the coordinator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    /// A pass began.
    Started {
        /// Whether the pass was caller-triggered rather than periodic.
        forced: bool,
    },
    /// A pass finished.
    Completed(SyncReport),
    /// A pass aborted; per-record failures are *not* reported here, they
    /// live in the records themselves.
    Failed {
        /// Human-readable failure description.
        reason: String,
    },
}

/// Errors returned by sync operations.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// The connection is not currently live; forced syncs fail fast
    /// rather than queueing silently.
    #[error("not connected")]
    NotConnected,

    /// Another pass holds the single-in-flight guard.
    #[error("a sync pass is already running")]
    AlreadyRunning,

    /// The durable store failed mid-pass.
    #[error("durable store error: {0}")]
    Store(#[from] StoreError),

    /// The pull phase failed. The cursor is left unchanged, so the next
    /// pass safely retries from the same point.
    #[error("pull failed, cursor unchanged: {0}")]
    Pull(RemoteError),
}

/// Result of pushing a single record.
enum PushOutcome {
    /// The remote accepted the write; carries the authoritative timestamp.
    Completed(DateTime<Utc>),
    /// The remote already had the record (idempotent skip).
    AlreadyRemote(DateTime<Utc>),
    /// The attempt failed; counted against the record's retry budget.
    Failed(RemoteError),
}

/// Drives local/remote reconciliation.
pub struct SyncCoordinator<T: Transport, R: RemoteStore, N: Notifier> {
    store: Arc<MessageStore>,
    remote: R,
    notifier: N,
    connection: Arc<ConnectionManager<T>>,
    local_user: UserId,
    settings: SyncSettings,
    /// Single-in-flight guard; an overlapping pass is refused, not queued.
    running: AtomicBool,
    event_tx: broadcast::Sender<SyncEvent>,
}

impl<T: Transport, R: RemoteStore, N: Notifier> SyncCoordinator<T, R, N> {
    /// Creates a coordinator.
    pub fn new(
        store: Arc<MessageStore>,
        remote: R,
        notifier: N,
        connection: Arc<ConnectionManager<T>>,
        local_user: UserId,
        settings: SyncSettings,
    ) -> Arc<Self> {
        let (event_tx, _) = broadcast::channel(settings.event_buffer);
        Arc::new(Self {
            store,
            remote,
            notifier,
            connection,
            local_user,
            settings,
            running: AtomicBool::new(false),
            event_tx,
        })
    }

    /// Subscribes to sync progress events.
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.event_tx.subscribe()
    }

    /// Runs one caller-triggered pass, bypassing the timer.
    ///
    /// # Errors
    ///
    /// Fails fast with [`SyncError::NotConnected`] when the connection is
    /// down and [`SyncError::AlreadyRunning`] when a pass holds the guard;
    /// neither waits nor queues.
    pub async fn sync_now(&self) -> Result<SyncReport, SyncError> {
        self.run_pass(true).await
    }

    /// Spawns the periodic sync task.
    ///
    /// Ticks are units of work behind guard conditions: a tick while
    /// disconnected or while a pass is running is skipped.
    pub fn spawn_periodic(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(coordinator.settings.interval);
            interval.tick().await; // the first tick fires immediately
            loop {
                interval.tick().await;
                if !coordinator.connection.is_connected() {
                    tracing::trace!("sync tick skipped: not connected");
                    continue;
                }
                match coordinator.run_pass(false).await {
                    Ok(report) => tracing::debug!(?report, "periodic sync pass complete"),
                    Err(SyncError::AlreadyRunning) => {
                        tracing::debug!("sync tick skipped: pass already running");
                    }
                    Err(e) => tracing::warn!(err = %e, "periodic sync pass failed"),
                }
            }
        })
    }

    /// Spawns the live inbound listener: remote-originated envelopes are
    /// persisted immediately instead of waiting for the next pull.
    pub fn spawn_inbound_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let coordinator = Arc::clone(self);
        let mut inbound = self.connection.subscribe_inbound();
        tokio::spawn(async move {
            loop {
                match inbound.recv().await {
                    Ok(envelope) => coordinator.handle_inbound(&envelope),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        // Anything missed here is recovered by the next pull.
                        tracing::warn!(skipped, "inbound listener lagged");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }

    /// One guarded pass: push then pull.
    async fn run_pass(&self, forced: bool) -> Result<SyncReport, SyncError> {
        if !self.connection.is_connected() {
            return Err(SyncError::NotConnected);
        }
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SyncError::AlreadyRunning);
        }
        let _ = self.event_tx.send(SyncEvent::Started { forced });

        let result = self.pass_inner().await;
        self.running.store(false, Ordering::SeqCst);

        match &result {
            Ok(report) => {
                let _ = self.event_tx.send(SyncEvent::Completed(*report));
            }
            Err(e) => {
                let _ = self.event_tx.send(SyncEvent::Failed {
                    reason: e.to_string(),
                });
            }
        }
        result
    }

    async fn pass_inner(&self) -> Result<SyncReport, SyncError> {
        let mut report = SyncReport::default();
        self.push_phase(&mut report).await?;
        self.pull_phase(&mut report).await?;
        Ok(report)
    }

    /// Push phase: drain unsynced records oldest-first with an
    /// inter-message delay so a large backlog cannot trip remote abuse
    /// limits.
    async fn push_phase(&self, report: &mut SyncReport) -> Result<(), SyncError> {
        let pending = self.store.unsynced(self.settings.max_retries)?;
        if pending.is_empty() {
            return Ok(());
        }
        tracing::debug!(count = pending.len(), "pushing unsynced records");

        for (i, record) in pending.into_iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.settings.batch_delay).await;
            }
            self.store.mark_syncing(&record.id)?;
            match self.push_one(&record).await {
                PushOutcome::Completed(server_timestamp) => {
                    self.store.record_sync_success(&record.id, server_timestamp)?;
                    self.notify_recipient(&record);
                    report.pushed += 1;
                }
                PushOutcome::AlreadyRemote(server_timestamp) => {
                    self.store.record_sync_success(&record.id, server_timestamp)?;
                    report.skipped += 1;
                }
                PushOutcome::Failed(e) => {
                    self.store.record_sync_failure(&record.id)?;
                    tracing::warn!(message = %record.id, err = %e, "push attempt failed");
                    report.failed += 1;
                }
            }
        }
        Ok(())
    }

    /// Pushes one record: fresh records are inserted, records the remote
    /// already knows get a flag patch, and an id conflict is resolved as
    /// already-synced.
    async fn push_one(&self, record: &MessageRecord) -> PushOutcome {
        if let Some(server_timestamp) = record.server_timestamp {
            // The remote has the record; only local flags can have changed.
            let patch = MessagePatch {
                read: Some(record.read),
                delivered: Some(record.delivered),
            };
            return match self.remote.update_message(&record.id, patch).await {
                Ok(()) => PushOutcome::Completed(server_timestamp),
                // The remote lost it somehow; re-create.
                Err(RemoteError::NotFound(_)) => self.insert_remote(record).await,
                Err(e) => PushOutcome::Failed(e),
            };
        }
        self.insert_remote(record).await
    }

    async fn insert_remote(&self, record: &MessageRecord) -> PushOutcome {
        match self
            .remote
            .insert_message(&RemoteMessage::from_local(record))
            .await
        {
            Ok(stored) => PushOutcome::Completed(stored.server_timestamp),
            Err(RemoteError::AlreadyExists(_)) => {
                // Another pass (or device) won the race; adopt its copy.
                match self.remote.fetch_message(&record.id).await {
                    Ok(Some(existing)) => PushOutcome::AlreadyRemote(existing.server_timestamp),
                    Ok(None) => PushOutcome::Failed(RemoteError::Unavailable(
                        "record vanished during push".to_string(),
                    )),
                    Err(e) => PushOutcome::Failed(e),
                }
            }
            Err(e) => PushOutcome::Failed(e),
        }
    }

    /// Pull phase: fetch records newer than the persisted cursor and
    /// upsert them locally as already-synced. The cursor only advances
    /// after the whole pull lands, so a failed pull is retried from the
    /// same watermark.
    async fn pull_phase(&self, report: &mut SyncReport) -> Result<(), SyncError> {
        let cursor = self
            .store
            .pull_cursor()?
            .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);
        // Captured before the fetch: records landing remotely mid-pull are
        // picked up again next pass, and upserts make the overlap harmless.
        let fence = Utc::now();

        let records = self
            .remote
            .messages_since(&self.local_user, cursor, self.settings.pull_limit)
            .await
            .map_err(SyncError::Pull)?;

        for remote_record in records {
            let record = remote_record.into_local_record();
            if record.sender_id != self.local_user {
                self.store.upsert_conversation(
                    &record.conversation_id,
                    &record.sender_id,
                    &self.local_user,
                    None,
                )?;
            }
            // Never marked for sync: a pulled record pushed back would
            // ping-pong between the stores forever.
            self.store.save_local(&record, false)?;
            report.pulled += 1;
        }

        self.store.set_pull_cursor(fence)?;
        Ok(())
    }

    /// Persists a live-delivered envelope without waiting for a pull.
    fn handle_inbound(&self, envelope: &WireEnvelope) {
        match codec::payload(envelope) {
            Ok(Some(EventPayload::Chat(chat))) => {
                let Some(sender) = envelope.sender_id.clone() else {
                    tracing::warn!(envelope = %envelope.id, "chat envelope without sender, dropped");
                    return;
                };
                let record = MessageRecord {
                    id: chat.message_id,
                    conversation_id: chat.conversation_id,
                    sender_id: sender.clone(),
                    sender_name: chat.sender_name,
                    kind: chat.kind,
                    content: chat.content,
                    created_at_local: chat.created_at,
                    server_timestamp: Some(envelope.timestamp),
                    read: false,
                    delivered: true,
                    sync_status: crate::store::record::SyncStatus::Synced,
                    retry_count: 0,
                };
                if sender != self.local_user
                    && let Err(e) = self.store.upsert_conversation(
                        &record.conversation_id,
                        &sender,
                        &self.local_user,
                        None,
                    )
                {
                    tracing::warn!(err = %e, "failed to upsert conversation for inbound message");
                }
                if let Err(e) = self.store.save_local(&record, false) {
                    tracing::warn!(err = %e, message = %record.id, "failed to persist inbound message");
                }
            }
            Ok(Some(EventPayload::ReadReceipt(receipt))) => {
                // The counterpart read our message: delivery is confirmed.
                if let Err(e) = self.store.mark_delivered(&receipt.message_id) {
                    tracing::warn!(err = %e, message = %receipt.message_id, "failed to record read receipt");
                }
            }
            Ok(Some(_)) => {
                // Presence, typing, call signaling, heartbeats: not the
                // sync layer's business.
            }
            Ok(None) => {
                tracing::trace!(event = %envelope.event, "ignoring unrecognized event");
            }
            Err(e) => {
                tracing::warn!(err = %e, envelope = %envelope.id, "malformed inbound payload, skipped");
            }
        }
    }

    /// Fire-and-forget recipient notification for a freshly pushed message.
    fn notify_recipient(&self, record: &MessageRecord) {
        let Ok(Some(conversation)) = self
            .store
            .conversation(&record.conversation_id, &self.local_user)
        else {
            return;
        };
        let recipient = if conversation.participant_a == record.sender_id {
            conversation.participant_b
        } else {
            conversation.participant_a
        };
        let notification = MessageNotification {
            message_id: record.id.clone(),
            conversation_id: record.conversation_id.clone(),
            sender_name: record.sender_name.clone(),
            preview: record.content.chars().take(PREVIEW_CHARS).collect(),
        };
        self.notifier.notify(&recipient, &notification);
    }
}
