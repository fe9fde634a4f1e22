//! Event vocabulary and typed per-event payloads.
//!
//! The `event` field of a [`crate::envelope::WireEnvelope`] names one of the
//! [`EventKind`] entries below. Each directed event carries a typed payload
//! struct in the envelope's `data` object; [`crate::codec::payload`] decodes
//! and validates it at the boundary.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::envelope::{ConversationId, MessageId, MessageKind, UserId};

/// Maximum allowed message content size in bytes (64 KB).
pub const MAX_CONTENT_SIZE: usize = 64 * 1024;

/// The closed set of event names this build understands.
///
/// Unrecognized names on the wire are not represented here; receivers
/// resolve them to `None` and skip the envelope.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// Session authentication request (client → server).
    Auth,
    /// Authentication acknowledgment (server → client).
    AuthOk,
    /// Heartbeat liveness ping (client → server).
    Ping,
    /// Heartbeat response (server → client).
    Pong,
    /// A chat message was produced.
    MessageSent,
    /// A previously delivered message was read by its recipient.
    MessageRead,
    /// Presence status change for a user.
    Presence,
    /// Typing indicator for a conversation.
    Typing,
    /// Call signaling (offer/answer/hangup); media transport is external.
    CallSignal,
}

impl EventKind {
    /// Returns the wire name of this event.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Auth => "auth",
            Self::AuthOk => "auth-ok",
            Self::Ping => "ping",
            Self::Pong => "pong",
            Self::MessageSent => "message-sent",
            Self::MessageRead => "message-read",
            Self::Presence => "presence",
            Self::Typing => "typing",
            Self::CallSignal => "call-signal",
        }
    }

    /// Parses a wire event name. Returns `None` for names outside the
    /// vocabulary.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "auth" => Some(Self::Auth),
            "auth-ok" => Some(Self::AuthOk),
            "ping" => Some(Self::Ping),
            "pong" => Some(Self::Pong),
            "message-sent" => Some(Self::MessageSent),
            "message-read" => Some(Self::MessageRead),
            "presence" => Some(Self::Presence),
            "typing" => Some(Self::Typing),
            "call-signal" => Some(Self::CallSignal),
            _ => None,
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Error returned when an event payload fails validation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// Message content is empty.
    #[error("message content is empty")]
    Empty,
    /// Message content exceeds the maximum allowed size.
    #[error("message too large ({size} bytes, max {max} bytes)")]
    TooLarge {
        /// Actual size of the content in bytes.
        size: usize,
        /// Maximum allowed size in bytes.
        max: usize,
    },
}

/// Payload of a `message-sent` event.
///
/// The sender is carried on the envelope (`sender_id`), not duplicated here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatPayload {
    /// Device-assigned message id.
    pub message_id: MessageId,
    /// Conversation the message belongs to.
    pub conversation_id: ConversationId,
    /// Display name of the sender at send time.
    pub sender_name: String,
    /// Content kind.
    pub kind: MessageKind,
    /// Message content (text, or a media reference).
    pub content: String,
    /// Creation instant observed on the producing device.
    pub created_at: DateTime<Utc>,
}

impl ChatPayload {
    /// Validates this payload for sending.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError::Empty`] if the content is empty, or
    /// [`ValidationError::TooLarge`] if it exceeds [`MAX_CONTENT_SIZE`].
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.content.is_empty() {
            return Err(ValidationError::Empty);
        }
        let size = self.content.len();
        if size > MAX_CONTENT_SIZE {
            return Err(ValidationError::TooLarge {
                size,
                max: MAX_CONTENT_SIZE,
            });
        }
        Ok(())
    }
}

/// Payload of a `message-read` receipt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReadReceiptPayload {
    /// The message that was read.
    pub message_id: MessageId,
    /// Its conversation.
    pub conversation_id: ConversationId,
    /// When the reader observed it.
    pub read_at: DateTime<Utc>,
}

/// Presence status of a user.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    /// Actively using the app.
    Online,
    /// Idle.
    Away,
    /// Disconnected.
    Offline,
}

impl std::fmt::Display for PresenceStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Away => write!(f, "away"),
            Self::Offline => write!(f, "offline"),
        }
    }
}

/// Payload of a `presence` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PresencePayload {
    /// The user whose presence changed.
    pub user_id: UserId,
    /// The new status.
    pub status: PresenceStatus,
}

/// Payload of a `typing` indicator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TypingPayload {
    /// Conversation being typed in.
    pub conversation_id: ConversationId,
    /// Whether typing started (`true`) or stopped (`false`).
    pub is_typing: bool,
}

/// Call signaling action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallAction {
    /// Initiate a call.
    Offer,
    /// Accept a call.
    Answer,
    /// Decline a call.
    Reject,
    /// End an active call.
    Hangup,
}

/// Payload of a `call-signal` event.
///
/// The `detail` object is opaque to the engine; it is relayed to the call
/// stack, which owns media negotiation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallSignalPayload {
    /// Conversation the call belongs to.
    pub conversation_id: ConversationId,
    /// Call session id, assigned by the offering side.
    pub call_id: String,
    /// Signaling action.
    pub action: CallAction,
    /// Opaque signaling detail (SDP blobs etc.).
    #[serde(default)]
    pub detail: serde_json::Value,
}

/// Payload of an `auth` handshake request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthPayload {
    /// Authenticating user.
    pub user_id: UserId,
    /// Bearer token from the hosted auth service.
    pub token: String,
    /// Human-readable device label.
    pub device_name: String,
}

/// Payload of an `auth-ok` handshake acknowledgment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthAckPayload {
    /// Server-assigned session id.
    pub session_id: String,
}
