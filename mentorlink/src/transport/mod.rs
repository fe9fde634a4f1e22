//! Transport layer abstraction for the engine's single live session.
//!
//! A [`Transport`] knows how to establish an authenticated session with the
//! server; a [`TransportSession`] carries [`WireEnvelope`]s in both
//! directions until it is closed or lost. Concrete implementations:
//! - [`ws::WsTransport`] — WebSocket client (production)
//! - [`loopback::LoopbackTransport`] — in-process transport for testing

pub mod loopback;
pub mod ws;

use mentorlink_proto::envelope::{UserId, WireEnvelope};

/// Credentials and device metadata presented during the session handshake.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionIdentity {
    /// The authenticating user.
    pub user_id: UserId,
    /// Bearer token from the hosted auth service.
    pub auth_token: String,
    /// Human-readable device label.
    pub device_name: String,
}

impl SessionIdentity {
    /// Creates a session identity.
    pub fn new(
        user_id: UserId,
        auth_token: impl Into<String>,
        device_name: impl Into<String>,
    ) -> Self {
        Self {
            user_id,
            auth_token: auth_token.into(),
            device_name: device_name.into(),
        }
    }
}

/// Errors that can occur during transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The session to the server has been closed or lost.
    #[error("connection closed")]
    ConnectionClosed,

    /// The operation timed out before completing.
    #[error("transport operation timed out")]
    Timeout,

    /// The session handshake was rejected or malformed.
    #[error("handshake failed: {0}")]
    Handshake(String),

    /// The server URL could not be parsed.
    #[error("invalid server url: {0}")]
    InvalidUrl(String),

    /// An underlying I/O error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Factory for authenticated sessions.
///
/// `connect` performs the full transport handshake (including
/// authentication) and yields a live session. The connection manager owns
/// the overall connect timeout; implementations bound only their internal
/// handshake waits.
pub trait Transport: Send + Sync + 'static {
    /// The session type this transport produces.
    type Session: TransportSession + 'static;

    /// Establishes an authenticated session with the server.
    fn connect(
        &self,
        identity: &SessionIdentity,
    ) -> impl std::future::Future<Output = Result<Self::Session, TransportError>> + Send;
}

/// A live, bidirectional envelope channel to the server.
///
/// Sessions are shared behind an `Arc` by the connection manager: sends may
/// happen concurrently with the single reader task, so both operations take
/// `&self` and use interior synchronization.
pub trait TransportSession: Send + Sync {
    /// Sends an envelope to the server.
    ///
    /// Returning `Ok(())` means the envelope was handed to the transport,
    /// not that it was delivered — delivery confirmation is the sync
    /// layer's job.
    fn send(
        &self,
        envelope: &WireEnvelope,
    ) -> impl std::future::Future<Output = Result<(), TransportError>> + Send;

    /// Receives the next envelope from the server.
    ///
    /// Blocks asynchronously until an envelope arrives or the session is
    /// lost.
    fn recv(
        &self,
    ) -> impl std::future::Future<Output = Result<WireEnvelope, TransportError>> + Send;

    /// Closes the session. Best-effort; never fails.
    fn close(&self) -> impl std::future::Future<Output = ()> + Send;
}
