// Test-specific lint overrides: integration tests use unwrap/expect freely,
// and some pedantic/nursery lints are not appropriate for test code.
#![allow(
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::missing_panics_doc,
    clippy::missing_docs_in_private_items,
    clippy::future_not_send
)]

//! Reconnection behavior: backoff growth, attempt exhaustion, terminal
//! error state, and the connectivity-signal short-circuit.

use std::time::{Duration, Instant};

use tokio::sync::watch;

use mentorlink::connection::{ConnectionConfig, ConnectionManager, ConnectionState};
use mentorlink::connection::backoff::ReconnectPolicy;
use mentorlink::transport::SessionIdentity;
use mentorlink::transport::loopback::LoopbackTransport;

use mentorlink_proto::envelope::UserId;

fn identity() -> SessionIdentity {
    SessionIdentity::new(UserId::new("mentee-1"), "token", "test device")
}

fn config(base_ms: u64, max_attempts: u32) -> ConnectionConfig {
    ConnectionConfig {
        connect_timeout: Duration::from_secs(2),
        heartbeat_interval: Duration::from_secs(30),
        reconnect: ReconnectPolicy {
            base_delay: Duration::from_millis(base_ms),
            max_delay: Duration::from_secs(10),
            jitter: 0.0,
            max_attempts,
        },
        queue_capacity: 100,
        queue_enabled: true,
        event_buffer: 64,
    }
}

/// Polls until the loopback has seen `count` connect attempts, recording
/// the instant each new attempt was observed.
async fn wait_for_attempts(
    loopback: &mentorlink::transport::loopback::LoopbackRemote,
    count: u32,
    timeout: Duration,
) -> Vec<Instant> {
    let mut instants = Vec::new();
    let mut seen = 0;
    let deadline = tokio::time::Instant::now() + timeout;
    while instants.len() < count as usize {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {count} connect attempts, saw {seen}"
        );
        let now = loopback.connect_count();
        if now > seen {
            // One instant per newly observed attempt.
            for _ in seen..now {
                instants.push(Instant::now());
            }
            seen = now;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    instants
}

#[tokio::test]
async fn backoff_gaps_grow_exponentially() {
    let (transport, loopback) = LoopbackTransport::pair();
    let manager = ConnectionManager::new(transport, config(100, 3));

    loopback.set_accepting(false);
    assert!(manager.connect(identity()).await.is_err());

    // Explicit attempt + 3 automatic ones; delays 100ms, 200ms, 400ms.
    let instants = wait_for_attempts(&loopback, 4, Duration::from_secs(5)).await;

    let gap_1 = instants[2] - instants[1];
    let gap_2 = instants[3] - instants[2];
    assert!(
        gap_1 >= Duration::from_millis(150),
        "gap before attempt 3 too short: {gap_1:?}"
    );
    assert!(
        gap_2 >= Duration::from_millis(300),
        "gap before attempt 4 too short: {gap_2:?}"
    );
    assert!(
        gap_2 > gap_1,
        "backoff should grow: {gap_2:?} vs {gap_1:?}"
    );
}

#[tokio::test]
async fn exhausted_attempts_surface_terminal_error() {
    let (transport, loopback) = LoopbackTransport::pair();
    let manager = ConnectionManager::new(transport, config(20, 3));

    loopback.set_accepting(false);
    assert!(manager.connect(identity()).await.is_err());

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while manager.state() != ConnectionState::Error {
        assert!(
            tokio::time::Instant::now() < deadline,
            "never reached the terminal error state"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(loopback.connect_count(), 4);

    // No further automatic attempts, even with the server back.
    loopback.set_accepting(true);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(loopback.connect_count(), 4);
    assert_eq!(manager.state(), ConnectionState::Error);
}

#[tokio::test]
async fn explicit_connect_recovers_from_terminal_error() {
    let (transport, loopback) = LoopbackTransport::pair();
    let manager = ConnectionManager::new(transport, config(10, 2));

    loopback.set_accepting(false);
    let _ = manager.connect(identity()).await;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while manager.state() != ConnectionState::Error {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    loopback.set_accepting(true);
    manager.connect(identity()).await.unwrap();
    assert_eq!(manager.state(), ConnectionState::Connected);
}

#[tokio::test]
async fn session_loss_recovers_within_the_attempt_budget() {
    let (transport, loopback) = LoopbackTransport::pair();
    let manager = ConnectionManager::new(transport, config(20, 5));
    manager.connect(identity()).await.unwrap();

    // Two consecutive partitions, each healing after one refused attempt.
    for _ in 0..2 {
        loopback.refuse_next(1);
        loopback.sever();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
        loop {
            if manager.is_connected() && loopback.has_session() {
                break;
            }
            assert!(
                tokio::time::Instant::now() < deadline,
                "did not recover from partition"
            );
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

#[tokio::test]
async fn connectivity_restored_signal_skips_the_backoff_wait() {
    let (transport, loopback) = LoopbackTransport::pair();
    // A very long base delay: only the signal can reconnect us quickly.
    let manager = ConnectionManager::new(transport, config(30_000, 5));
    let (online_tx, online_rx) = watch::channel(true);
    let _signal_task = manager.attach_connectivity(online_rx);

    manager.connect(identity()).await.unwrap();
    loopback.sever();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while manager.state() != ConnectionState::Reconnecting {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    let before = Instant::now();
    online_tx.send(false).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;
    online_tx.send(true).unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !manager.is_connected() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "signal-triggered reconnect never happened"
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(
        before.elapsed() < Duration::from_secs(5),
        "reconnect took the backoff path instead of the signal"
    );
}

#[tokio::test]
async fn state_stream_reports_the_full_lifecycle() {
    let (transport, loopback) = LoopbackTransport::pair();
    let manager = ConnectionManager::new(transport, config(20, 5));
    let mut states = manager.subscribe_state();

    manager.connect(identity()).await.unwrap();
    loopback.sever();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while !(manager.is_connected() && loopback.connect_count() >= 2) {
        assert!(tokio::time::Instant::now() < deadline);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    manager.disconnect().await;

    let mut observed = Vec::new();
    while let Ok(state) = states.try_recv() {
        observed.push(state);
    }
    assert!(observed.contains(&ConnectionState::Connecting));
    assert!(observed.contains(&ConnectionState::Connected));
    assert!(observed.contains(&ConnectionState::Reconnecting));
    assert_eq!(observed.last(), Some(&ConnectionState::Disconnected));
}
