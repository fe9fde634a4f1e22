// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_panics_doc,
    clippy::missing_docs_in_private_items,
    clippy::future_not_send
)]

//! Bounded offline queue semantics through the connection manager.
//!
//! Validates:
//! - Sends while disconnected are queued, never lost silently.
//! - At capacity the oldest entry is evicted — FIFO, not a hard failure.
//! - With capacity 100, 105 sends keep exactly entries #6..#105.
//! - Disabled queueing surfaces an immediate error instead.
//! - Disconnect clears the queue (session-scoped, not a durable outbox).

use mentorlink::connection::{ConnectionConfig, ConnectionManager, SendError, SendOutcome};
use mentorlink::transport::SessionIdentity;
use mentorlink::transport::loopback::LoopbackTransport;

use mentorlink_proto::envelope::{UserId, WireEnvelope};
use mentorlink_proto::event::EventKind;

fn numbered(n: usize) -> WireEnvelope {
    WireEnvelope::new(EventKind::Typing, serde_json::json!({ "n": n }))
}

fn identity() -> SessionIdentity {
    SessionIdentity::new(UserId::new("mentee-1"), "token", "test device")
}

#[tokio::test]
async fn sends_while_disconnected_are_queued() {
    let (transport, _loopback) = LoopbackTransport::pair();
    let manager = ConnectionManager::new(transport, ConnectionConfig::default());

    for n in 0..3 {
        assert_eq!(
            manager.send(numbered(n)).await.unwrap(),
            SendOutcome::Queued
        );
    }
    assert_eq!(manager.queued(), 3);
    assert_eq!(manager.evicted(), 0);
}

#[tokio::test]
async fn capacity_100_keeps_entries_6_through_105() {
    let (transport, loopback) = LoopbackTransport::pair();
    let manager = ConnectionManager::new(
        transport,
        ConnectionConfig {
            queue_capacity: 100,
            ..ConnectionConfig::default()
        },
    );

    // 105 distinct envelopes, numbered 1..=105.
    for n in 1..=105 {
        manager.send(numbered(n)).await.unwrap();
    }
    assert_eq!(manager.queued(), 100);
    assert_eq!(manager.evicted(), 5);

    // Connect and read back what actually survived: #6..#105 in order.
    manager.connect(identity()).await.unwrap();
    let flushed: Vec<_> = loopback
        .sent()
        .into_iter()
        .filter(|e| e.event == "typing")
        .collect();
    assert_eq!(flushed.len(), 100);
    for (i, envelope) in flushed.iter().enumerate() {
        assert_eq!(envelope.data["n"], i + 6);
    }
}

#[tokio::test]
async fn queueing_disabled_errors_immediately() {
    let (transport, _loopback) = LoopbackTransport::pair();
    let manager = ConnectionManager::new(
        transport,
        ConnectionConfig {
            queue_enabled: false,
            ..ConnectionConfig::default()
        },
    );

    assert!(matches!(
        manager.send(numbered(1)).await,
        Err(SendError::QueueDisabled)
    ));
}

#[tokio::test]
async fn disconnect_clears_the_session_scoped_queue() {
    let (transport, loopback) = LoopbackTransport::pair();
    let manager = ConnectionManager::new(transport, ConnectionConfig::default());

    for n in 0..4 {
        manager.send(numbered(n)).await.unwrap();
    }
    assert_eq!(manager.queued(), 4);

    manager.disconnect().await;
    assert_eq!(manager.queued(), 0);

    // Reconnecting later flushes nothing: the slots were transient.
    manager.connect(identity()).await.unwrap();
    let typing: Vec<_> = loopback
        .sent()
        .into_iter()
        .filter(|e| e.event == "typing")
        .collect();
    assert!(typing.is_empty());
}

#[tokio::test]
async fn send_during_live_session_bypasses_queue() {
    let (transport, loopback) = LoopbackTransport::pair();
    let manager = ConnectionManager::new(transport, ConnectionConfig::default());
    manager.connect(identity()).await.unwrap();

    assert_eq!(manager.send(numbered(1)).await.unwrap(), SendOutcome::Sent);
    assert_eq!(manager.queued(), 0);
    assert_eq!(
        loopback
            .sent()
            .iter()
            .filter(|e| e.event == "typing")
            .count(),
        1
    );
}

#[tokio::test]
async fn send_failure_falls_back_to_queue_and_recovers() {
    let (transport, loopback) = LoopbackTransport::pair();
    let manager = ConnectionManager::new(transport, ConnectionConfig::default());
    manager.connect(identity()).await.unwrap();

    // Sever behind the manager's back: the next send fails at the
    // transport, gets queued, and the session is torn down for reconnect.
    loopback.sever();
    assert_eq!(
        manager.send(numbered(42)).await.unwrap(),
        SendOutcome::Queued
    );
    assert_eq!(manager.queued(), 1);

    // The automatic reconnect flushes the queued envelope.
    let deadline = tokio::time::Instant::now() + std::time::Duration::from_secs(3);
    loop {
        let delivered = loopback
            .sent()
            .iter()
            .any(|e| e.event == "typing" && e.data["n"] == 42);
        if delivered {
            break;
        }
        assert!(
            tokio::time::Instant::now() < deadline,
            "queued envelope never flushed after reconnect"
        );
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
}
