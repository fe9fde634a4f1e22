//! WebSocket transport for the live server session.
//!
//! Implements [`Transport`] over a WebSocket connection. Envelopes travel
//! as JSON text frames. Connecting performs the `auth` → `auth-ok`
//! handshake before the session is handed to the caller; a background
//! reader task then feeds inbound envelopes to [`TransportSession::recv`].
//! Malformed inbound frames are logged and skipped — bad data from the
//! server must never kill the session.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use mentorlink_proto::codec::{self, EventPayload};
use mentorlink_proto::envelope::WireEnvelope;
use mentorlink_proto::event::{AuthPayload, EventKind};

use super::{SessionIdentity, Transport, TransportError, TransportSession};

/// Type alias for the write half of a WebSocket connection.
type WsSink = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    Message,
>;

/// Type alias for the read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Timeout for waiting for the `auth-ok` acknowledgment.
const AUTH_TIMEOUT: Duration = Duration::from_secs(5);

/// Capacity of the inbound envelope channel fed by the reader task.
const INBOUND_BUFFER: usize = 256;

/// WebSocket [`Transport`] implementation.
#[derive(Debug, Clone)]
pub struct WsTransport {
    /// The server URL (`ws://` or `wss://`).
    url: String,
}

impl WsTransport {
    /// Creates a transport targeting the given server URL.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::InvalidUrl`] if the URL does not parse or
    /// uses a non-WebSocket scheme.
    pub fn new(url: impl Into<String>) -> Result<Self, TransportError> {
        let url = url.into();
        let parsed =
            url::Url::parse(&url).map_err(|e| TransportError::InvalidUrl(e.to_string()))?;
        if parsed.scheme() != "ws" && parsed.scheme() != "wss" {
            return Err(TransportError::InvalidUrl(format!(
                "unsupported scheme: {}",
                parsed.scheme()
            )));
        }
        Ok(Self { url })
    }

    /// Returns the server URL this transport targets.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

impl Transport for WsTransport {
    type Session = WsSession;

    /// Connects, authenticates, and spawns the session reader.
    ///
    /// Steps:
    /// 1. Open the WebSocket connection.
    /// 2. Send an `auth` envelope carrying the identity.
    /// 3. Wait for `auth-ok` (bounded by [`AUTH_TIMEOUT`]).
    /// 4. Spawn the background reader task.
    ///
    /// # Errors
    ///
    /// - [`TransportError::Timeout`] if the acknowledgment never arrives.
    /// - [`TransportError::Handshake`] if the server rejects or answers
    ///   with something other than `auth-ok`.
    /// - [`TransportError::ConnectionClosed`] if the server hangs up
    ///   mid-handshake.
    async fn connect(&self, identity: &SessionIdentity) -> Result<WsSession, TransportError> {
        let (ws_stream, _response) = connect_async(&self.url).await.map_err(|e| {
            tracing::warn!(url = %self.url, err = %e, "WebSocket connect failed");
            map_ws_error(&e)
        })?;
        let (mut sink, mut reader) = ws_stream.split();

        // Authenticate before handing the session over.
        let auth = AuthPayload {
            user_id: identity.user_id.clone(),
            token: identity.auth_token.clone(),
            device_name: identity.device_name.clone(),
        };
        let envelope = codec::envelope(EventKind::Auth, &auth)
            .map_err(|e| TransportError::Handshake(e.to_string()))?
            .with_sender(identity.user_id.clone());
        let frame = codec::encode(&envelope)
            .map_err(|e| TransportError::Handshake(e.to_string()))?;
        sink.send(Message::Text(frame.into())).await.map_err(|e| {
            tracing::warn!(err = %e, "failed to send auth envelope");
            TransportError::Handshake(format!("failed to send auth: {e}"))
        })?;

        await_auth_ack(&mut reader).await?;
        tracing::info!(url = %self.url, user = %identity.user_id, "session authenticated");

        let (tx, rx) = mpsc::channel(INBOUND_BUFFER);
        let connected = Arc::new(AtomicBool::new(true));
        let reader_handle = tokio::spawn(reader_loop(reader, tx, Arc::clone(&connected)));

        Ok(WsSession {
            sink: Arc::new(Mutex::new(sink)),
            incoming: Mutex::new(rx),
            connected,
            reader_handle,
        })
    }
}

/// A live WebSocket session.
pub struct WsSession {
    /// Write half, shared for concurrent sends.
    sink: Arc<Mutex<WsSink>>,
    /// Envelopes produced by the background reader task.
    incoming: Mutex<mpsc::Receiver<WireEnvelope>>,
    /// Whether the underlying connection is still up.
    connected: Arc<AtomicBool>,
    /// Background reader task, aborted on close.
    reader_handle: tokio::task::JoinHandle<()>,
}

impl TransportSession for WsSession {
    async fn send(&self, envelope: &WireEnvelope) -> Result<(), TransportError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(TransportError::ConnectionClosed);
        }
        let frame =
            codec::encode(envelope).map_err(|e| TransportError::Handshake(e.to_string()))?;
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(frame.into())).await.map_err(|e| {
            tracing::warn!(err = %e, "WebSocket send failed");
            self.connected.store(false, Ordering::Relaxed);
            TransportError::ConnectionClosed
        })
    }

    async fn recv(&self) -> Result<WireEnvelope, TransportError> {
        let mut rx = self.incoming.lock().await;
        rx.recv().await.ok_or(TransportError::ConnectionClosed)
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::Relaxed);
        self.reader_handle.abort();
        let mut sink = self.sink.lock().await;
        let _ = sink.close().await;
    }
}

/// Waits for the server's `auth-ok` during the handshake.
async fn await_auth_ack(reader: &mut WsReader) -> Result<(), TransportError> {
    let deadline = tokio::time::Instant::now() + AUTH_TIMEOUT;
    loop {
        let remaining = deadline.saturating_duration_since(tokio::time::Instant::now());
        let frame = tokio::time::timeout(remaining, reader.next())
            .await
            .map_err(|_| {
                tracing::warn!("auth acknowledgment timed out");
                TransportError::Timeout
            })?;

        match frame {
            Some(Ok(Message::Text(text))) => match codec::decode(text.as_str()) {
                Ok(env) => match codec::payload(&env) {
                    Ok(Some(EventPayload::AuthOk(_))) => return Ok(()),
                    Ok(Some(EventPayload::Ping | EventPayload::Pong)) | Ok(None) => {
                        // Heartbeats or unknown events may interleave; keep waiting.
                    }
                    Ok(Some(other)) => {
                        tracing::warn!(?other, "unexpected envelope during auth");
                        return Err(TransportError::Handshake(
                            "unexpected envelope during auth".to_string(),
                        ));
                    }
                    Err(e) => {
                        tracing::warn!(err = %e, "malformed auth response payload");
                        return Err(TransportError::Handshake(format!(
                            "malformed auth response: {e}"
                        )));
                    }
                },
                Err(e) => {
                    tracing::warn!(err = %e, "malformed frame during auth");
                    return Err(TransportError::Handshake(format!(
                        "malformed auth frame: {e}"
                    )));
                }
            },
            Some(Ok(Message::Close(_))) | None => {
                tracing::warn!("server closed connection during auth");
                return Err(TransportError::ConnectionClosed);
            }
            Some(Ok(_)) => {
                // Binary/ping/pong control frames during auth are ignored.
            }
            Some(Err(e)) => {
                tracing::warn!(err = %e, "WebSocket error during auth");
                return Err(TransportError::Handshake(format!(
                    "WebSocket error during auth: {e}"
                )));
            }
        }
    }
}

/// Background task reading frames and forwarding decoded envelopes.
///
/// Malformed frames are logged and skipped. Sets `connected` to `false`
/// when the socket closes or errors out.
async fn reader_loop(
    mut reader: WsReader,
    tx: mpsc::Sender<WireEnvelope>,
    connected: Arc<AtomicBool>,
) {
    while let Some(frame) = reader.next().await {
        match frame {
            Ok(Message::Text(text)) => match codec::decode(text.as_str()) {
                Ok(envelope) => {
                    if tx.send(envelope).await.is_err() {
                        // Session dropped; exit.
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!(err = %e, "malformed frame, skipping");
                }
            },
            Ok(Message::Close(_)) => {
                tracing::info!("WebSocket closed by server");
                break;
            }
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Binary(_) | Message::Frame(_)) => {
                // Control and binary frames carry no envelopes.
            }
            Err(e) => {
                tracing::warn!(err = %e, "WebSocket read error");
                break;
            }
        }
    }
    connected.store(false, Ordering::Relaxed);
    tracing::debug!("session reader exiting");
}

/// Maps a tungstenite error to a [`TransportError`].
fn map_ws_error(err: &tokio_tungstenite::tungstenite::Error) -> TransportError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => TransportError::Io(std::io::Error::new(io_err.kind(), err.to_string())),
        WsError::Url(e) => TransportError::InvalidUrl(e.to_string()),
        WsError::ConnectionClosed | WsError::AlreadyClosed => TransportError::ConnectionClosed,
        other => TransportError::Handshake(other.to_string()),
    }
}
