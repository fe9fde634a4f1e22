// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_panics_doc,
    clippy::missing_docs_in_private_items,
    clippy::future_not_send
)]

//! Pull phase and merge precedence.
//!
//! Validates:
//! - Pulled records enter the store as `synced` and are never re-pushed.
//! - Merge precedence: the remote wins for authoritative fields, but a
//!   locally set read flag survives a pull that does not know about it.
//! - The pull cursor only advances after a fully successful pull.
//! - A message seen both live and via pull lands exactly once.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;

use mentorlink::connection::{ConnectionConfig, ConnectionManager};
use mentorlink::remote::{InMemoryRemote, RecordingNotifier, RemoteMessage};
use mentorlink::store::MessageStore;
use mentorlink::store::record::SyncStatus;
use mentorlink::sync::{SyncCoordinator, SyncError, SyncSettings};
use mentorlink::transport::SessionIdentity;
use mentorlink::transport::loopback::{LoopbackRemote, LoopbackTransport};

use mentorlink_proto::codec;
use mentorlink_proto::envelope::{ConversationId, MessageId, MessageKind, UserId};
use mentorlink_proto::event::{ChatPayload, EventKind};

struct Harness {
    store: Arc<MessageStore>,
    remote: Arc<InMemoryRemote>,
    connection: Arc<ConnectionManager<LoopbackTransport>>,
    loopback: LoopbackRemote,
    coordinator: Arc<
        SyncCoordinator<LoopbackTransport, Arc<InMemoryRemote>, Arc<RecordingNotifier>>,
    >,
    me: UserId,
    mentor: UserId,
    conversation: ConversationId,
}

fn harness() -> Harness {
    let store = Arc::new(MessageStore::open_in_memory().unwrap());
    let remote = Arc::new(InMemoryRemote::new());
    let (transport, loopback) = LoopbackTransport::pair();
    let connection = ConnectionManager::new(transport, ConnectionConfig::default());

    let me = UserId::new("mentee-1");
    let mentor = UserId::new("mentor-9");
    let conversation = ConversationId::new();
    store
        .upsert_conversation(&conversation, &mentor, &me, None)
        .unwrap();

    let coordinator = SyncCoordinator::new(
        Arc::clone(&store),
        Arc::clone(&remote),
        Arc::new(RecordingNotifier::new()),
        Arc::clone(&connection),
        me.clone(),
        SyncSettings {
            interval: Duration::from_secs(120),
            batch_delay: Duration::from_millis(1),
            max_retries: 5,
            pull_limit: 100,
            event_buffer: 64,
        },
    );

    Harness {
        store,
        remote,
        connection,
        loopback,
        coordinator,
        me,
        mentor,
        conversation,
    }
}

async fn connect(h: &Harness) {
    h.connection
        .connect(SessionIdentity::new(h.me.clone(), "token", "test device"))
        .await
        .unwrap();
}

fn mentor_message(h: &Harness, content: &str) -> RemoteMessage {
    RemoteMessage {
        id: MessageId::new(),
        conversation_id: h.conversation.clone(),
        sender_id: h.mentor.clone(),
        sender_name: "Sam".to_string(),
        kind: MessageKind::Text,
        content: content.to_string(),
        created_at_local: Utc::now(),
        server_timestamp: Utc::now(),
        read: false,
        delivered: false,
    }
}

#[tokio::test]
async fn pulled_records_enter_as_synced_and_stay_put() {
    let h = harness();
    connect(&h).await;

    let incoming = mentor_message(&h, "from the mentor");
    h.remote.seed(incoming.clone(), Utc::now());

    let report = h.coordinator.sync_now().await.unwrap();
    assert_eq!(report.pulled, 1);

    let local = h.store.get(&incoming.id).unwrap().unwrap();
    assert_eq!(local.sync_status, SyncStatus::Synced);
    assert!(h.store.unsynced(5).unwrap().is_empty());

    // Nothing to ping-pong: the next pass pushes nothing.
    let report = h.coordinator.sync_now().await.unwrap();
    assert_eq!(report.pushed, 0);
    assert_eq!(h.remote.len(), 1);
}

#[tokio::test]
async fn merge_preserves_local_read_flag_against_stale_remote() {
    let h = harness();
    connect(&h).await;

    // A mentor message we already hold and have read locally; the remote
    // copy predates the read receipt.
    let incoming = mentor_message(&h, "read me");
    let record = incoming.clone().into_local_record();
    h.store.save_local(&record, false).unwrap();
    h.store.mark_read(&record.id).unwrap();

    let remote_stamp = Utc::now();
    h.remote.seed(incoming.clone(), remote_stamp);

    h.coordinator.sync_now().await.unwrap();

    let merged = h.store.get(&record.id).unwrap().unwrap();
    assert!(merged.read, "local read flag must survive the pull merge");
    assert_eq!(
        merged.server_timestamp.map(|t| t.timestamp_millis()),
        Some(remote_stamp.timestamp_millis()),
        "authoritative timestamp must be adopted"
    );
}

#[tokio::test]
async fn pull_failure_keeps_cursor_for_a_clean_retry() {
    let h = harness();
    connect(&h).await;

    // First pass establishes a cursor.
    h.coordinator.sync_now().await.unwrap();
    let cursor = h.store.pull_cursor().unwrap().unwrap();

    // Seed a record, then fail the pull that would fetch it.
    let incoming = mentor_message(&h, "delayed delivery");
    h.remote.seed(incoming.clone(), Utc::now());
    h.remote.fail_next_fetches(1);

    let result = h.coordinator.sync_now().await;
    assert!(matches!(result, Err(SyncError::Pull(_))));
    assert_eq!(h.store.pull_cursor().unwrap().unwrap(), cursor);
    assert!(h.store.get(&incoming.id).unwrap().is_none());

    // The retry picks up exactly where the failed pull left off.
    let report = h.coordinator.sync_now().await.unwrap();
    assert_eq!(report.pulled, 1);
    assert!(h.store.get(&incoming.id).unwrap().is_some());
}

#[tokio::test]
async fn live_delivery_then_pull_yields_one_record() {
    let h = harness();
    connect(&h).await;
    let _listener = h.coordinator.spawn_inbound_listener();

    // The same message arrives live over the session and sits in the
    // remote store for the next pull.
    let incoming = mentor_message(&h, "exactly once");
    h.remote.seed(incoming.clone(), Utc::now());

    let chat = ChatPayload {
        message_id: incoming.id.clone(),
        conversation_id: h.conversation.clone(),
        sender_name: incoming.sender_name.clone(),
        kind: incoming.kind,
        content: incoming.content.clone(),
        created_at: incoming.created_at_local,
    };
    let envelope = codec::envelope(EventKind::MessageSent, &chat)
        .unwrap()
        .with_sender(h.mentor.clone())
        .with_receiver(h.me.clone());
    assert!(h.loopback.inject(envelope));

    // Wait for the live path to persist it.
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while h.store.get(&incoming.id).unwrap().is_none() {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    // The pull sees the same id: an upsert, not a duplicate.
    h.coordinator.sync_now().await.unwrap();
    let page = h.store.messages_page(&h.conversation, 50, 0).unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].id, incoming.id);
}

#[tokio::test]
async fn forced_sync_fails_fast_when_not_connected() {
    let h = harness();
    let result = h.coordinator.sync_now().await;
    assert!(matches!(result, Err(SyncError::NotConnected)));

    // Nothing was queued silently: connecting and syncing later works
    // from a clean slate.
    connect(&h).await;
    let report = h.coordinator.sync_now().await.unwrap();
    assert_eq!(report.pushed, 0);
}

#[tokio::test]
async fn conversations_are_registered_for_pulled_counterpart_messages() {
    let h = harness();
    connect(&h).await;

    // A message in a conversation this device has never seen.
    let new_conversation = ConversationId::new();
    let mut incoming = mentor_message(&h, "new thread");
    incoming.conversation_id = new_conversation.clone();
    h.remote.seed(incoming, Utc::now());

    h.coordinator.sync_now().await.unwrap();

    let summary = h
        .store
        .conversation(&new_conversation, &h.me)
        .unwrap()
        .unwrap();
    assert_eq!(summary.participant_a, h.mentor);
    assert_eq!(summary.participant_b, h.me);
    assert_eq!(summary.unread_count, 1);
}
