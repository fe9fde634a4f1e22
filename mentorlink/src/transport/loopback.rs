//! In-process transport for testing.
//!
//! [`LoopbackTransport::pair`] yields a transport plus a [`LoopbackRemote`]
//! handle playing the server role: tests refuse or accept connects, observe
//! every envelope the engine sends, inject inbound envelopes, and sever the
//! live session to simulate a network partition.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use parking_lot::Mutex;
use tokio::sync::mpsc;

use mentorlink_proto::envelope::{UserId, WireEnvelope};

use super::{SessionIdentity, Transport, TransportError, TransportSession};

/// State shared between the transport and its remote handle.
struct Shared {
    /// Number of upcoming connect attempts to refuse.
    refuse_connects: AtomicU32,
    /// When `false`, every connect attempt is refused.
    accepting: AtomicBool,
    /// Total connect attempts observed (accepted or not).
    connect_count: AtomicU32,
    /// Identities presented on accepted connects, in order.
    identities: Mutex<Vec<UserId>>,
    /// Every envelope sent by the engine, across all sessions, in order.
    outbound: Mutex<Vec<WireEnvelope>>,
    /// The currently live session, if any.
    session: Mutex<Option<SessionHandle>>,
}

/// Remote-side handle onto a live session.
struct SessionHandle {
    /// Injects inbound envelopes into the session.
    inbound_tx: mpsc::UnboundedSender<WireEnvelope>,
    /// Cleared when the session is severed or closed.
    alive: Arc<AtomicBool>,
}

/// In-process [`Transport`] implementation.
pub struct LoopbackTransport {
    shared: Arc<Shared>,
}

/// Test-side controller for a [`LoopbackTransport`].
pub struct LoopbackRemote {
    shared: Arc<Shared>,
}

impl LoopbackTransport {
    /// Creates a connected transport/remote pair.
    #[must_use]
    pub fn pair() -> (Self, LoopbackRemote) {
        let shared = Arc::new(Shared {
            refuse_connects: AtomicU32::new(0),
            accepting: AtomicBool::new(true),
            connect_count: AtomicU32::new(0),
            identities: Mutex::new(Vec::new()),
            outbound: Mutex::new(Vec::new()),
            session: Mutex::new(None),
        });
        (
            Self {
                shared: Arc::clone(&shared),
            },
            LoopbackRemote { shared },
        )
    }
}

impl Transport for LoopbackTransport {
    type Session = LoopbackSession;

    async fn connect(&self, identity: &SessionIdentity) -> Result<LoopbackSession, TransportError> {
        self.shared.connect_count.fetch_add(1, Ordering::SeqCst);

        if !self.shared.accepting.load(Ordering::SeqCst) {
            return Err(TransportError::Handshake(
                "loopback remote is not accepting".to_string(),
            ));
        }
        if self
            .shared
            .refuse_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(TransportError::Handshake(
                "loopback remote refused the connect".to_string(),
            ));
        }

        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();
        let alive = Arc::new(AtomicBool::new(true));

        // A new session supersedes any previous one.
        let previous = self.shared.session.lock().replace(SessionHandle {
            inbound_tx,
            alive: Arc::clone(&alive),
        });
        if let Some(old) = previous {
            old.alive.store(false, Ordering::SeqCst);
        }
        self.shared.identities.lock().push(identity.user_id.clone());

        Ok(LoopbackSession {
            shared: Arc::clone(&self.shared),
            inbound: tokio::sync::Mutex::new(inbound_rx),
            alive,
        })
    }
}

/// A live loopback session.
pub struct LoopbackSession {
    shared: Arc<Shared>,
    inbound: tokio::sync::Mutex<mpsc::UnboundedReceiver<WireEnvelope>>,
    alive: Arc<AtomicBool>,
}

impl TransportSession for LoopbackSession {
    async fn send(&self, envelope: &WireEnvelope) -> Result<(), TransportError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionClosed);
        }
        self.shared.outbound.lock().push(envelope.clone());
        Ok(())
    }

    async fn recv(&self) -> Result<WireEnvelope, TransportError> {
        let mut rx = self.inbound.lock().await;
        match rx.recv().await {
            Some(envelope) if self.alive.load(Ordering::SeqCst) => Ok(envelope),
            _ => Err(TransportError::ConnectionClosed),
        }
    }

    async fn close(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let mut session = self.shared.session.lock();
        let is_current = session
            .as_ref()
            .is_some_and(|handle| Arc::ptr_eq(&handle.alive, &self.alive));
        if is_current {
            session.take();
        }
    }
}

impl LoopbackRemote {
    /// Refuses the next `n` connect attempts.
    pub fn refuse_next(&self, n: u32) {
        self.shared.refuse_connects.store(n, Ordering::SeqCst);
    }

    /// Enables or disables accepting connects entirely.
    pub fn set_accepting(&self, accepting: bool) {
        self.shared.accepting.store(accepting, Ordering::SeqCst);
    }

    /// Total connect attempts observed so far.
    pub fn connect_count(&self) -> u32 {
        self.shared.connect_count.load(Ordering::SeqCst)
    }

    /// Identity presented on the most recent accepted connect.
    pub fn last_identity(&self) -> Option<UserId> {
        self.shared.identities.lock().last().cloned()
    }

    /// Returns `true` while a session is live.
    pub fn has_session(&self) -> bool {
        self.shared
            .session
            .lock()
            .as_ref()
            .is_some_and(|h| h.alive.load(Ordering::SeqCst))
    }

    /// Every envelope the engine has sent, in send order.
    pub fn sent(&self) -> Vec<WireEnvelope> {
        self.shared.outbound.lock().clone()
    }

    /// Drains and returns the captured outbound envelopes.
    pub fn take_sent(&self) -> Vec<WireEnvelope> {
        std::mem::take(&mut *self.shared.outbound.lock())
    }

    /// Injects an inbound envelope into the live session.
    ///
    /// Returns `false` when no session is live.
    pub fn inject(&self, envelope: WireEnvelope) -> bool {
        let session = self.shared.session.lock();
        match session.as_ref() {
            Some(handle) if handle.alive.load(Ordering::SeqCst) => {
                handle.inbound_tx.send(envelope).is_ok()
            }
            _ => false,
        }
    }

    /// Severs the live session, as a dropped network would.
    ///
    /// The engine side observes a closed connection on its next receive or
    /// send.
    pub fn sever(&self) {
        if let Some(handle) = self.shared.session.lock().take() {
            handle.alive.store(false, Ordering::SeqCst);
            // Dropping `inbound_tx` wakes any blocked recv with a close.
        }
    }
}
