//! Serialization and boundary validation for the `MentorLink` wire protocol.
//!
//! Envelopes travel as JSON text frames. [`encode`]/[`decode`] handle the
//! envelope itself; [`payload`] resolves the event name and decodes the
//! event-specific `data` object into a typed [`EventPayload`]. Unrecognized
//! event names decode to `Ok(None)` — new server events must never break
//! older clients.

use serde::Serialize;

use crate::envelope::WireEnvelope;
use crate::event::{
    AuthAckPayload, AuthPayload, CallSignalPayload, ChatPayload, EventKind, PresencePayload,
    ReadReceiptPayload, TypingPayload, ValidationError,
};

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Envelope serialization or deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The `data` object does not match the event's payload schema.
    #[error("malformed {event} payload: {reason}")]
    Payload {
        /// The event whose payload failed to decode.
        event: &'static str,
        /// Decode failure detail.
        reason: String,
    },
    /// The payload decoded but failed validation.
    #[error("invalid payload: {0}")]
    Validation(#[from] ValidationError),
}

/// A decoded, validated event payload.
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    /// `auth` handshake request.
    Auth(AuthPayload),
    /// `auth-ok` handshake acknowledgment.
    AuthOk(AuthAckPayload),
    /// `ping` heartbeat (no payload).
    Ping,
    /// `pong` heartbeat response (no payload).
    Pong,
    /// `message-sent` chat message.
    Chat(ChatPayload),
    /// `message-read` receipt.
    ReadReceipt(ReadReceiptPayload),
    /// `presence` status change.
    Presence(PresencePayload),
    /// `typing` indicator.
    Typing(TypingPayload),
    /// `call-signal` signaling action.
    CallSignal(CallSignalPayload),
}

/// Encodes an envelope to its JSON text frame.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the envelope cannot be serialized.
pub fn encode(envelope: &WireEnvelope) -> Result<String, CodecError> {
    serde_json::to_string(envelope).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes a JSON text frame into an envelope.
///
/// The event name is not checked here — an envelope with an unknown event
/// decodes successfully and is resolved (or skipped) by [`payload`].
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the frame is not a valid envelope.
pub fn decode(text: &str) -> Result<WireEnvelope, CodecError> {
    serde_json::from_str(text).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Builds an envelope for an event from its typed payload.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the payload cannot be converted
/// to a JSON object.
pub fn envelope(event: EventKind, data: &impl Serialize) -> Result<WireEnvelope, CodecError> {
    let value = serde_json::to_value(data).map_err(|e| CodecError::Serialization(e.to_string()))?;
    Ok(WireEnvelope::new(event, value))
}

/// Decodes and validates the typed payload of an envelope.
///
/// Returns `Ok(None)` when the event name is outside this build's
/// vocabulary; such envelopes are skipped, never fatal.
///
/// # Errors
///
/// Returns [`CodecError::Payload`] when a *recognized* event carries a
/// `data` object that does not match its schema, and
/// [`CodecError::Validation`] when a chat payload fails content validation.
pub fn payload(env: &WireEnvelope) -> Result<Option<EventPayload>, CodecError> {
    let Some(kind) = env.event_kind() else {
        return Ok(None);
    };

    let decoded = match kind {
        EventKind::Auth => EventPayload::Auth(decode_data(kind, &env.data)?),
        EventKind::AuthOk => EventPayload::AuthOk(decode_data(kind, &env.data)?),
        EventKind::Ping => EventPayload::Ping,
        EventKind::Pong => EventPayload::Pong,
        EventKind::MessageSent => {
            let chat: ChatPayload = decode_data(kind, &env.data)?;
            chat.validate()?;
            EventPayload::Chat(chat)
        }
        EventKind::MessageRead => EventPayload::ReadReceipt(decode_data(kind, &env.data)?),
        EventKind::Presence => EventPayload::Presence(decode_data(kind, &env.data)?),
        EventKind::Typing => EventPayload::Typing(decode_data(kind, &env.data)?),
        EventKind::CallSignal => EventPayload::CallSignal(decode_data(kind, &env.data)?),
    };

    Ok(Some(decoded))
}

/// Internal: decode an event's `data` object into its payload type.
fn decode_data<T: serde::de::DeserializeOwned>(
    event: EventKind,
    data: &serde_json::Value,
) -> Result<T, CodecError> {
    serde_json::from_value(data.clone()).map_err(|e| CodecError::Payload {
        event: event.as_str(),
        reason: e.to_string(),
    })
}
