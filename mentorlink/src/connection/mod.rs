//! Connection manager — owns the single live session to the server.
//!
//! Absorbs network instability without losing messages: sends while
//! disconnected land in a bounded offline queue that drains on
//! reconnection, session loss schedules exponential-backoff reconnects,
//! and a heartbeat keeps the session honest. State changes and inbound
//! envelopes are published on multi-subscriber broadcast streams.
//!
//! Background schedules (heartbeat, reconnect timer) are independent
//! spawned tasks. None is cancelled mid-execution; each checks a
//! generation guard before its next unit of work, so a superseded task
//! drains out harmlessly.

pub mod backoff;
pub mod queue;

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use mentorlink_proto::envelope::WireEnvelope;
use mentorlink_proto::event::EventKind;

use crate::transport::{SessionIdentity, Transport, TransportError, TransportSession};
use self::backoff::ReconnectPolicy;
use self::queue::OfflineQueue;

/// Connection lifecycle states.
///
/// One instance per engine session: created on login, torn down on logout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No session and none wanted.
    Disconnected,
    /// A connect attempt is in flight.
    Connecting,
    /// A live, authenticated session exists.
    Connected,
    /// The session was lost; a reconnect is scheduled.
    Reconnecting,
    /// Auto-reconnect gave up; an explicit `connect` is required.
    Error,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
            Self::Reconnecting => write!(f, "reconnecting"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Outcome of a [`ConnectionManager::send`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendOutcome {
    /// The envelope was handed to the live session.
    Sent,
    /// No session was live; the envelope waits in the offline queue.
    Queued,
}

/// Error returned by [`ConnectionManager::send`].
///
/// Queue overflow is deliberately absent: a full queue evicts its oldest
/// entry and admits the new one, it never fails the send.
#[derive(Debug, thiserror::Error)]
pub enum SendError {
    /// Not connected and the offline queue is disabled.
    #[error("not connected and offline queueing is disabled")]
    QueueDisabled,
}

/// Configuration for the connection manager.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Bound on the whole connect handshake.
    pub connect_timeout: Duration,
    /// Interval between liveness pings on an established session.
    pub heartbeat_interval: Duration,
    /// Reconnect backoff policy.
    pub reconnect: ReconnectPolicy,
    /// Offline queue capacity.
    pub queue_capacity: usize,
    /// Whether sends while disconnected are queued at all.
    pub queue_enabled: bool,
    /// Capacity of the state/inbound broadcast channels.
    pub event_buffer: usize,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(20),
            heartbeat_interval: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
            queue_capacity: 100,
            queue_enabled: true,
            event_buffer: 256,
        }
    }
}

/// Owns the single live transport session.
///
/// Constructed behind an `Arc` so background tasks (reader, heartbeat,
/// reconnect timer) can hold the manager across awaits.
pub struct ConnectionManager<T: Transport> {
    transport: T,
    config: ConnectionConfig,
    state: Mutex<ConnectionState>,
    session: Mutex<Option<Arc<T::Session>>>,
    identity: Mutex<Option<SessionIdentity>>,
    queue: OfflineQueue,
    /// Reconnect attempts consumed since the last successful connect.
    attempts: AtomicU32,
    /// Bumped on every session change; stale tasks observe it and exit.
    generation: AtomicU64,
    state_tx: broadcast::Sender<ConnectionState>,
    inbound_tx: broadcast::Sender<WireEnvelope>,
    /// Reader + heartbeat of the current session.
    session_tasks: Mutex<Vec<JoinHandle<()>>>,
    /// The pending backoff timer, if a reconnect is scheduled.
    reconnect_task: Mutex<Option<JoinHandle<()>>>,
}

impl<T: Transport> ConnectionManager<T> {
    /// Creates a manager in the `Disconnected` state.
    pub fn new(transport: T, config: ConnectionConfig) -> Arc<Self> {
        let (state_tx, _) = broadcast::channel(config.event_buffer);
        let (inbound_tx, _) = broadcast::channel(config.event_buffer);
        Arc::new(Self {
            queue: OfflineQueue::new(config.queue_capacity),
            transport,
            config,
            state: Mutex::new(ConnectionState::Disconnected),
            session: Mutex::new(None),
            identity: Mutex::new(None),
            attempts: AtomicU32::new(0),
            generation: AtomicU64::new(0),
            state_tx,
            inbound_tx,
            session_tasks: Mutex::new(Vec::new()),
            reconnect_task: Mutex::new(None),
        })
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Returns `true` while a live session exists.
    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Subscribes to connection-state changes.
    pub fn subscribe_state(&self) -> broadcast::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// Subscribes to inbound application envelopes.
    pub fn subscribe_inbound(&self) -> broadcast::Receiver<WireEnvelope> {
        self.inbound_tx.subscribe()
    }

    /// Number of envelopes waiting in the offline queue.
    pub fn queued(&self) -> usize {
        self.queue.len()
    }

    /// Total offline-queue evictions since construction.
    pub fn evicted(&self) -> u64 {
        self.queue.evicted_count()
    }

    /// Establishes the session, replacing any scheduled reconnect.
    ///
    /// Idempotent: calling while already connected (or with a connect in
    /// flight) is a no-op. On success the reconnect-attempt counter resets,
    /// the heartbeat starts, and the offline queue drains in enqueue
    /// order. On failure a reconnect is scheduled (or, once the attempt
    /// budget is spent, the manager parks in `Error`).
    ///
    /// # Errors
    ///
    /// Returns the first attempt's [`TransportError`]; later automatic
    /// attempts report through the state stream instead.
    pub async fn connect(self: &Arc<Self>, identity: SessionIdentity) -> Result<(), TransportError> {
        *self.identity.lock() = Some(identity);
        self.attempts.store(0, Ordering::SeqCst);
        self.cancel_scheduled_reconnect();
        self.attempt_connect().await
    }

    /// Tears the session down and stops all reconnection machinery.
    ///
    /// The offline queue is cleared deliberately: it is session-scoped, not
    /// a durable outbox — message content survives in the store.
    pub async fn disconnect(&self) {
        self.set_state(ConnectionState::Disconnected);
        self.generation.fetch_add(1, Ordering::SeqCst);
        self.cancel_scheduled_reconnect();
        {
            let mut tasks = self.session_tasks.lock();
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        let session = self.session.lock().take();
        if let Some(session) = session {
            session.close().await;
        }
        let cleared = self.queue.clear();
        if cleared > 0 {
            tracing::debug!(cleared, "offline queue cleared on disconnect");
        }
        self.attempts.store(0, Ordering::SeqCst);
        tracing::info!("disconnected");
    }

    /// Sends an envelope, or queues it when no session is live.
    ///
    /// A transport failure mid-send is an infrastructure event, not a
    /// per-message error: the session is torn down, a reconnect is
    /// scheduled, and the envelope falls back to the queue.
    ///
    /// # Errors
    ///
    /// Returns [`SendError::QueueDisabled`] when disconnected and queueing
    /// is off.
    pub async fn send(self: &Arc<Self>, envelope: WireEnvelope) -> Result<SendOutcome, SendError> {
        let (session, generation) = {
            (
                self.session.lock().clone(),
                self.generation.load(Ordering::SeqCst),
            )
        };
        if let Some(session) = session
            && self.is_connected()
        {
            match session.send(&envelope).await {
                Ok(()) => return Ok(SendOutcome::Sent),
                Err(e) => {
                    tracing::warn!(err = %e, "send failed, session lost");
                    self.handle_session_failure(generation);
                    // Not transmitted — fall through to the queue.
                }
            }
        }

        if !self.config.queue_enabled {
            return Err(SendError::QueueDisabled);
        }
        if let Some(evicted) = self.queue.enqueue(envelope) {
            tracing::warn!(
                envelope = %evicted.envelope.id,
                "offline queue full, evicted oldest entry"
            );
        }
        Ok(SendOutcome::Queued)
    }

    /// Consumes the host connectivity signal.
    ///
    /// An offline→online transition short-circuits a scheduled backoff
    /// wait with an immediate reconnect attempt. The attempt counter is
    /// reset only if that attempt succeeds; a terminal `Error` state is
    /// left alone — it requires an explicit `connect`.
    pub fn attach_connectivity(
        self: &Arc<Self>,
        mut signal: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            let mut was_online = *signal.borrow();
            while signal.changed().await.is_ok() {
                let online = *signal.borrow();
                if online && !was_online && manager.state() == ConnectionState::Reconnecting {
                    tracing::info!("connectivity restored, reconnecting immediately");
                    manager.cancel_scheduled_reconnect();
                    if let Err(e) = manager.attempt_connect().await {
                        tracing::debug!(err = %e, "connectivity-triggered reconnect failed");
                    }
                }
                was_online = online;
            }
        })
    }

    /// One connect attempt against the transport, shared by explicit
    /// connects, reconnect timers, and the connectivity signal.
    async fn attempt_connect(self: &Arc<Self>) -> Result<(), TransportError> {
        {
            let mut state = self.state.lock();
            if matches!(
                *state,
                ConnectionState::Connected | ConnectionState::Connecting
            ) {
                return Ok(());
            }
            *state = ConnectionState::Connecting;
        }
        let _ = self.state_tx.send(ConnectionState::Connecting);

        let identity = self.identity.lock().clone();
        let Some(identity) = identity else {
            self.set_state(ConnectionState::Error);
            return Err(TransportError::Handshake(
                "no session identity set".to_string(),
            ));
        };

        let attempt = tokio::time::timeout(
            self.config.connect_timeout,
            self.transport.connect(&identity),
        )
        .await;

        match attempt {
            Ok(Ok(session)) => {
                self.install_session(session).await;
                Ok(())
            }
            Ok(Err(e)) => {
                tracing::warn!(err = %e, "connect attempt failed");
                self.schedule_reconnect();
                Err(e)
            }
            Err(_) => {
                tracing::warn!(
                    timeout_ms = self.config.connect_timeout.as_millis() as u64,
                    "connect handshake timed out"
                );
                self.schedule_reconnect();
                Err(TransportError::Timeout)
            }
        }
    }

    /// Installs a fresh session: resets the attempt counter, spawns the
    /// reader and heartbeat tasks, and flushes the offline queue.
    async fn install_session(self: &Arc<Self>, session: T::Session) {
        let session = Arc::new(session);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        {
            let mut tasks = self.session_tasks.lock();
            for task in tasks.drain(..) {
                task.abort();
            }
        }
        *self.session.lock() = Some(Arc::clone(&session));
        self.attempts.store(0, Ordering::SeqCst);
        self.set_state(ConnectionState::Connected);
        tracing::info!("session established");

        let reader = {
            let manager = Arc::clone(self);
            let session = Arc::clone(&session);
            tokio::spawn(async move { manager.reader_loop(&session, generation).await })
        };
        let heartbeat = {
            let manager = Arc::clone(self);
            let session = Arc::clone(&session);
            tokio::spawn(async move { manager.heartbeat_loop(&session, generation).await })
        };
        self.session_tasks.lock().extend([reader, heartbeat]);

        self.flush_queue(&session).await;
    }

    /// Forwards inbound envelopes until the session is lost or superseded.
    async fn reader_loop(self: &Arc<Self>, session: &Arc<T::Session>, generation: u64) {
        loop {
            match session.recv().await {
                Ok(envelope) => {
                    let _ = self.inbound_tx.send(envelope);
                }
                Err(e) => {
                    if self.generation.load(Ordering::SeqCst) == generation {
                        tracing::warn!(err = %e, "session lost");
                        self.handle_session_failure(generation);
                    }
                    break;
                }
            }
            if self.generation.load(Ordering::SeqCst) != generation {
                break;
            }
        }
    }

    /// Sends a liveness ping every interval while the session is current.
    async fn heartbeat_loop(self: &Arc<Self>, session: &Arc<T::Session>, generation: u64) {
        let mut interval = tokio::time::interval(self.config.heartbeat_interval);
        interval.tick().await; // the first tick fires immediately
        loop {
            interval.tick().await;
            if self.generation.load(Ordering::SeqCst) != generation {
                break;
            }
            let ping = WireEnvelope::new(EventKind::Ping, serde_json::json!({}));
            if let Err(e) = session.send(&ping).await {
                if self.generation.load(Ordering::SeqCst) == generation {
                    tracing::warn!(err = %e, "heartbeat failed, session lost");
                    self.handle_session_failure(generation);
                }
                break;
            }
            tracing::trace!("heartbeat ping sent");
        }
    }

    /// Drains the offline queue strictly in enqueue order.
    ///
    /// A failing entry is reported and skipped; it does not block the rest.
    async fn flush_queue(&self, session: &Arc<T::Session>) {
        let entries = self.queue.drain_all();
        if entries.is_empty() {
            return;
        }
        let total = entries.len();
        let mut sent = 0usize;
        let mut failed = 0usize;
        for entry in entries {
            match session.send(&entry.envelope).await {
                Ok(()) => sent += 1,
                Err(e) => {
                    failed += 1;
                    tracing::warn!(
                        err = %e,
                        envelope = %entry.envelope.id,
                        "offline queue flush entry failed"
                    );
                }
            }
        }
        tracing::info!(sent, failed, total, "offline queue flushed");
    }

    /// Reacts to a lost session: tears it down once (stale reporters are
    /// ignored via the generation guard) and schedules a reconnect.
    fn handle_session_failure(self: &Arc<Self>, generation: u64) {
        {
            let state = self.state.lock();
            if self.generation.load(Ordering::SeqCst) != generation
                || *state != ConnectionState::Connected
            {
                return;
            }
        }
        self.generation.fetch_add(1, Ordering::SeqCst);
        *self.session.lock() = None;
        self.schedule_reconnect();
    }

    /// Schedules the next reconnect attempt, or parks in `Error` when the
    /// attempt budget is spent.
    fn schedule_reconnect(self: &Arc<Self>) {
        let attempts = self.attempts.load(Ordering::SeqCst);
        if self.config.reconnect.is_exhausted(attempts) {
            self.set_state(ConnectionState::Error);
            tracing::warn!(
                attempts,
                "reconnect attempts exhausted, waiting for an explicit connect"
            );
            return;
        }

        let delay = self.config.reconnect.delay(attempts);
        self.set_state(ConnectionState::Reconnecting);
        tracing::info!(
            attempt = attempts + 1,
            max_attempts = self.config.reconnect.max_attempts,
            delay_ms = delay.as_millis() as u64,
            "reconnect scheduled"
        );

        let manager = Arc::clone(self);
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if manager.is_connected() {
                return;
            }
            manager.attempts.fetch_add(1, Ordering::SeqCst);
            if let Err(e) = manager.attempt_connect().await {
                tracing::debug!(err = %e, "reconnect attempt failed");
            }
        });
        let previous = self.reconnect_task.lock().replace(task);
        if let Some(previous) = previous {
            previous.abort();
        }
    }

    /// Aborts a scheduled (not yet started) reconnect attempt.
    fn cancel_scheduled_reconnect(&self) {
        if let Some(task) = self.reconnect_task.lock().take() {
            task.abort();
        }
    }

    /// Stores and publishes a state transition.
    fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
        let _ = self.state_tx.send(state);
    }
}
