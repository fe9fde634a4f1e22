// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_panics_doc,
    clippy::missing_docs_in_private_items,
    clippy::future_not_send
)]

//! Per-record retry exhaustion.
//!
//! Validates:
//! - A record whose every push fails transitions `pending → failed`
//!   exactly `max_retries` times, then stays permanently `failed` with
//!   `retry_count == max_retries`.
//! - Exhausted records are excluded from further automatic passes.
//! - Failures are surfaced in aggregate via `status_counts`.
//! - An explicit retry resets the record and lets it converge.

use std::sync::Arc;
use std::time::Duration;

use mentorlink::connection::{ConnectionConfig, ConnectionManager};
use mentorlink::remote::{InMemoryRemote, RecordingNotifier};
use mentorlink::store::MessageStore;
use mentorlink::store::record::{MessageRecord, SyncStatus};
use mentorlink::sync::{SyncCoordinator, SyncSettings};
use mentorlink::transport::SessionIdentity;
use mentorlink::transport::loopback::LoopbackTransport;

use mentorlink_proto::envelope::{ConversationId, MessageKind, UserId};

const MAX_RETRIES: u32 = 5;

struct Harness {
    store: Arc<MessageStore>,
    remote: Arc<InMemoryRemote>,
    coordinator: Arc<
        SyncCoordinator<LoopbackTransport, Arc<InMemoryRemote>, Arc<RecordingNotifier>>,
    >,
    record: MessageRecord,
}

async fn failing_harness() -> Harness {
    let store = Arc::new(MessageStore::open_in_memory().unwrap());
    let remote = Arc::new(InMemoryRemote::new());
    let (transport, _loopback) = LoopbackTransport::pair();
    let connection = ConnectionManager::new(transport, ConnectionConfig::default());

    let me = UserId::new("mentee-1");
    let conversation = ConversationId::new();
    store
        .upsert_conversation(&conversation, &UserId::new("mentor-9"), &me, None)
        .unwrap();

    let record = MessageRecord::new(
        conversation,
        me.clone(),
        "Mia",
        MessageKind::Text,
        "doomed message",
    );
    store.save_local(&record, true).unwrap();

    let coordinator = SyncCoordinator::new(
        Arc::clone(&store),
        Arc::clone(&remote),
        Arc::new(RecordingNotifier::new()),
        Arc::clone(&connection),
        me,
        SyncSettings {
            interval: Duration::from_secs(120),
            batch_delay: Duration::from_millis(1),
            max_retries: MAX_RETRIES,
            pull_limit: 100,
            event_buffer: 64,
        },
    );

    connection
        .connect(SessionIdentity::new(
            UserId::new("mentee-1"),
            "token",
            "test device",
        ))
        .await
        .unwrap();

    Harness {
        store,
        remote,
        coordinator,
        record,
    }
}

#[tokio::test]
async fn every_failing_push_consumes_exactly_one_retry() {
    let h = failing_harness().await;
    h.remote.fail_next_inserts(u32::MAX);

    for expected_count in 1..=MAX_RETRIES {
        let report = h.coordinator.sync_now().await.unwrap();
        assert_eq!(report.failed, 1, "pass {expected_count} should fail once");

        let record = h.store.get(&h.record.id).unwrap().unwrap();
        assert_eq!(record.sync_status, SyncStatus::Failed);
        assert_eq!(record.retry_count, expected_count);
    }
}

#[tokio::test]
async fn exhausted_record_is_terminal_and_excluded() {
    let h = failing_harness().await;
    h.remote.fail_next_inserts(u32::MAX);

    for _ in 0..MAX_RETRIES {
        h.coordinator.sync_now().await.unwrap();
    }

    // Two more passes: the record is no longer attempted.
    for _ in 0..2 {
        let report = h.coordinator.sync_now().await.unwrap();
        assert_eq!(report.failed, 0);
        assert_eq!(report.pushed, 0);
    }

    let record = h.store.get(&h.record.id).unwrap().unwrap();
    assert_eq!(record.sync_status, SyncStatus::Failed);
    assert_eq!(record.retry_count, MAX_RETRIES);
    assert!(h.store.unsynced(MAX_RETRIES).unwrap().is_empty());
}

#[tokio::test]
async fn aggregate_counts_surface_the_failure() {
    let h = failing_harness().await;
    h.remote.fail_next_inserts(u32::MAX);

    for _ in 0..MAX_RETRIES {
        h.coordinator.sync_now().await.unwrap();
    }

    let counts = h.store.status_counts().unwrap();
    assert_eq!(counts.failed, 1);
    assert_eq!(counts.pending, 0);
    assert_eq!(counts.synced, 0);
}

#[tokio::test]
async fn manual_retry_reopens_the_budget_and_converges() {
    let h = failing_harness().await;
    h.remote.fail_next_inserts(u32::MAX);
    for _ in 0..MAX_RETRIES {
        h.coordinator.sync_now().await.unwrap();
    }

    // The user taps "retry"; the remote has recovered.
    h.remote.fail_next_inserts(0);
    assert!(h.store.retry_message(&h.record.id).unwrap());

    let reopened = h.store.get(&h.record.id).unwrap().unwrap();
    assert_eq!(reopened.sync_status, SyncStatus::Pending);
    assert_eq!(reopened.retry_count, 0);

    let report = h.coordinator.sync_now().await.unwrap();
    assert_eq!(report.pushed, 1);
    assert_eq!(
        h.store.get(&h.record.id).unwrap().unwrap().sync_status,
        SyncStatus::Synced
    );
    assert_eq!(h.remote.len(), 1);
}

#[tokio::test]
async fn one_bad_record_does_not_block_the_rest() {
    let h = failing_harness().await;
    // Only the first insert of the pass fails; the second record lands.
    let mut second = MessageRecord::new(
        h.record.conversation_id.clone(),
        h.record.sender_id.clone(),
        "Mia",
        MessageKind::Text,
        "healthy message",
    );
    // Clearly newer than the doomed record, so oldest-first is deterministic.
    second.created_at_local = h.record.created_at_local + chrono::Duration::seconds(1);
    h.store.save_local(&second, true).unwrap();
    h.remote.fail_next_inserts(1);

    let report = h.coordinator.sync_now().await.unwrap();
    assert_eq!(report.failed, 1);
    assert_eq!(report.pushed, 1);

    // Oldest-first fairness: the doomed record (older) consumed the
    // injected failure, the newer one synced anyway.
    assert_eq!(
        h.store.get(&h.record.id).unwrap().unwrap().sync_status,
        SyncStatus::Failed
    );
    assert_eq!(
        h.store.get(&second.id).unwrap().unwrap().sync_status,
        SyncStatus::Synced
    );
}
