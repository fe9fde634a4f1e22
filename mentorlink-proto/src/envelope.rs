//! Wire envelope and identifier types for the `MentorLink` protocol.
//!
//! Every frame exchanged with the server is a JSON-encoded [`WireEnvelope`]:
//! an event name, an opaque `data` object interpreted per event, optional
//! sender/receiver addressing, and an ISO-8601 timestamp. The envelope is
//! deliberately schema-stable: new event names may appear on the wire at any
//! time, and receivers ignore the ones they do not recognize.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::event::EventKind;

/// Unique identifier for a message, based on UUID v7 for time-ordering.
///
/// Assigned once by the producing device at creation time and never
/// reassigned, so the same id names the same message locally and remotely.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(Uuid);

impl MessageId {
    /// Creates a new time-ordered message identifier (UUID v7).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a `MessageId` from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID value.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a conversation between two participants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConversationId(Uuid);

impl ConversationId {
    /// Creates a new conversation identifier (UUID v7).
    #[must_use]
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }

    /// Creates a `ConversationId` from an existing UUID.
    #[must_use]
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the inner UUID value.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for ConversationId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConversationId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a user account.
///
/// User ids are minted by the hosted auth service and are opaque to this
/// crate; they are carried as strings on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct UserId(String);

impl UserId {
    /// Creates a user identifier from its string representation.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Returns the string representation of this user id.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The kind of content a message carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    /// Plain text.
    Text,
    /// A media attachment reference (URL or storage key in `content`).
    Media,
    /// A system-generated notice (session booked, call ended, etc.).
    System,
}

impl MessageKind {
    /// Returns the lowercase wire name of this kind.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Text => "text",
            Self::Media => "media",
            Self::System => "system",
        }
    }

    /// Parses a wire name back into a kind.
    #[must_use]
    pub fn parse(name: &str) -> Option<Self> {
        match name {
            "text" => Some(Self::Text),
            "media" => Some(Self::Media),
            "system" => Some(Self::System),
            _ => None,
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Top-level envelope wrapping every wire-level protocol message.
///
/// The `event` field names one of the [`EventKind`] vocabulary entries;
/// `data` is the event-specific payload object, decoded lazily by
/// [`crate::codec::payload`]. Envelopes with unrecognized event names are
/// valid — receivers skip them.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WireEnvelope {
    /// Globally unique envelope id, assigned by the sending side.
    pub id: String,
    /// Event name from the protocol vocabulary.
    pub event: String,
    /// Event-specific payload object.
    pub data: serde_json::Value,
    /// Originating user, when the event has one.
    pub sender_id: Option<UserId>,
    /// Addressed user, when the event is directed.
    pub receiver_id: Option<UserId>,
    /// When the envelope was produced (ISO-8601 on the wire).
    pub timestamp: DateTime<Utc>,
}

impl WireEnvelope {
    /// Creates an envelope for the given event with a fresh id and the
    /// current timestamp.
    #[must_use]
    pub fn new(event: EventKind, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::now_v7().to_string(),
            event: event.as_str().to_string(),
            data,
            sender_id: None,
            receiver_id: None,
            timestamp: Utc::now(),
        }
    }

    /// Sets the originating user.
    #[must_use]
    pub fn with_sender(mut self, sender: UserId) -> Self {
        self.sender_id = Some(sender);
        self
    }

    /// Sets the addressed user.
    #[must_use]
    pub fn with_receiver(mut self, receiver: UserId) -> Self {
        self.receiver_id = Some(receiver);
        self
    }

    /// Resolves the event name against the known vocabulary.
    ///
    /// Returns `None` for event names this build does not recognize;
    /// such envelopes are skipped, never treated as errors.
    #[must_use]
    pub fn event_kind(&self) -> Option<EventKind> {
        EventKind::parse(&self.event)
    }
}
