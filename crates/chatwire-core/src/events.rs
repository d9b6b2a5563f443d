//! Inbound event union and outbound frames.
//!
//! Every frame that reaches a subscriber has passed through the parse
//! boundary here: JSON is decoded once, the discriminator is extracted
//! (`type` on the bidirectional channel, the SSE event name on the stream),
//! and the payload is validated into an [`EventPayload`] variant. Unknown
//! discriminators are kept as [`EventPayload::Other`] so server vocabulary
//! can grow without breaking the client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::errors::ParseError;
use crate::ids::{MessageId, UserId};
use crate::model::{Message, MessageOrigin, WireMessage};

/// Discriminator field on bidirectional frames.
pub const SOCKET_DISCRIMINATOR: &str = "type";

/// Event names the stream channel subscribes to.
pub const STREAM_EVENTS: [&str; 7] = [
    "connected",
    "message",
    "typing",
    "read_receipt",
    "notification",
    "heartbeat",
    "disconnected",
];

/// Which transport delivered an event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Channel {
    /// Bidirectional socket.
    Socket,
    /// Unidirectional event stream.
    Stream,
}

/// Typing signal from a peer.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct TypingPayload {
    /// Who is typing.
    #[serde(alias = "user_id")]
    pub sender_id: UserId,
    /// `false` is an explicit stop.
    #[serde(default = "default_true")]
    pub is_typing: bool,
}

fn default_true() -> bool {
    true
}

/// A peer read messages the local user sent.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
pub struct ReadReceiptPayload {
    /// Who read them.
    #[serde(alias = "user_id")]
    pub reader_id: UserId,
    /// Specific messages. Empty means everything sent to the reader.
    #[serde(default)]
    pub message_ids: Vec<MessageId>,
    /// When they were read.
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
}

/// Validated payload of an inbound event.
#[derive(Clone, Debug, PartialEq)]
pub enum EventPayload {
    /// A new message (`chat_message` on the socket, `message` on the stream).
    Message(Message),
    /// Server echo confirming a message the local user sent.
    MessageSent(Message),
    /// Peer typing start/stop.
    Typing(TypingPayload),
    /// Peer read receipt.
    ReadReceipt(ReadReceiptPayload),
    /// Free-form notification.
    Notification(Value),
    /// Stream greeting.
    Connected(Value),
    /// Keepalive.
    Heartbeat(Value),
    /// Server announces it is closing the stream.
    Disconnected(Value),
    /// Server-reported error on the socket.
    ServerError {
        /// Error text from the server.
        message: String,
    },
    /// Discriminator this client does not model.
    Other(Value),
}

impl EventPayload {
    /// Validate `value` as the payload for `discriminator`.
    pub fn parse(discriminator: &str, value: Value) -> Result<Self, ParseError> {
        let invalid = |err: serde_json::Error| ParseError::InvalidPayload {
            discriminator: discriminator.to_owned(),
            message: err.to_string(),
        };
        Ok(match discriminator {
            "chat_message" | "message" => Self::Message(
                message_object(value)
                    .map_err(invalid)?
                    .into_message(MessageOrigin::Push),
            ),
            "message_sent" => Self::MessageSent(
                message_object(value)
                    .map_err(invalid)?
                    .into_message(MessageOrigin::Push),
            ),
            "typing" => Self::Typing(serde_json::from_value(value).map_err(invalid)?),
            "read_receipt" | "messages_read" => {
                Self::ReadReceipt(serde_json::from_value(value).map_err(invalid)?)
            }
            "notification" => Self::Notification(value),
            "connected" => Self::Connected(value),
            "heartbeat" => Self::Heartbeat(value),
            "disconnected" => Self::Disconnected(value),
            "error" => Self::ServerError {
                message: value
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("unknown server error")
                    .to_owned(),
            },
            _ => Self::Other(value),
        })
    }
}

/// Message payloads come either wrapped (`{"type", "message": {..}}`) or flat.
fn message_object(value: Value) -> Result<WireMessage, serde_json::Error> {
    match value {
        Value::Object(mut map) if map.get("message").is_some_and(Value::is_object) => {
            let inner = map.remove("message").unwrap_or(Value::Null);
            serde_json::from_value(inner)
        }
        other => serde_json::from_value(other),
    }
}

/// An event produced by the parse boundary. Immutable once built.
#[derive(Clone, Debug, PartialEq)]
pub struct InboundEvent {
    /// Raw discriminator (`chat_message`, `typing`, …).
    pub discriminator: String,
    /// Validated payload.
    pub payload: EventPayload,
    /// When the frame was parsed.
    pub received_at: DateTime<Utc>,
    /// Which transport delivered it.
    pub channel: Channel,
}

impl InboundEvent {
    /// Parse a bidirectional text frame (`type` discriminator).
    pub fn from_socket_frame(raw: &str) -> Result<Self, ParseError> {
        let value: Value = serde_json::from_str(raw)?;
        let discriminator = match &value {
            Value::Object(map) => map
                .get(SOCKET_DISCRIMINATOR)
                .and_then(Value::as_str)
                .ok_or(ParseError::MissingDiscriminator {
                    field: SOCKET_DISCRIMINATOR,
                })?
                .to_owned(),
            _ => return Err(ParseError::NotAnObject),
        };
        let payload = EventPayload::parse(&discriminator, value)?;
        Ok(Self {
            discriminator,
            payload,
            received_at: Utc::now(),
            channel: Channel::Socket,
        })
    }

    /// Parse a stream frame. An empty event name is the SSE default `message`;
    /// empty data is an empty object.
    pub fn from_stream_frame(event: &str, data: &str) -> Result<Self, ParseError> {
        let discriminator = if event.is_empty() { "message" } else { event };
        let value = if data.trim().is_empty() {
            Value::Object(Map::new())
        } else {
            serde_json::from_str(data)?
        };
        let payload = EventPayload::parse(discriminator, value)?;
        Ok(Self {
            discriminator: discriminator.to_owned(),
            payload,
            received_at: Utc::now(),
            channel: Channel::Stream,
        })
    }
}

/// Frames the client sends on the bidirectional channel.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    /// Send a chat message.
    ChatMessage {
        /// Addressee.
        recipient_id: UserId,
        /// Text body.
        message: String,
    },
    /// Typing start/stop.
    Typing {
        /// Who should see the indicator.
        recipient_id: UserId,
        /// Start (`true`) or stop (`false`).
        is_typing: bool,
    },
    /// Mark everything from `sender_id` as read.
    MarkRead {
        /// Author whose messages were read.
        sender_id: UserId,
    },
}

impl OutboundFrame {
    /// Serialize to the wire text.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
