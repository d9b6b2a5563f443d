//! Chat model: messages, conversation summaries, presence.
//!
//! [`WireMessage`] is the server's message object as it arrives from REST
//! pages and push events; [`Message`] is the engine's view of it, which also
//! covers optimistic entries that have no server id yet.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::ids::{ConversationId, MessageId, PendingId, UserId};

/// Longest preview kept on a conversation summary, in characters.
pub const PREVIEW_CHARS: usize = 100;

/// Preview shown for a message that carries only an attachment.
pub const ATTACHMENT_PREVIEW: &str = "[attachment]";

/// Where a message entry came from.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageOrigin {
    /// Paginated REST history.
    Fetch,
    /// Push event from either transport.
    Push,
    /// Local insert made before server confirmation.
    Optimistic,
}

/// Identity of a message entry.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageKey {
    /// Server-assigned id.
    Confirmed(MessageId),
    /// Temporary id of an optimistic entry.
    Pending(PendingId),
}

/// A chat message as held by the store.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Message {
    /// Server id, or pending id for optimistic entries.
    pub key: MessageKey,
    /// Server conversation id when the payload carried one.
    pub conversation_id: Option<ConversationId>,
    /// Author.
    pub sender_id: UserId,
    /// Addressee.
    pub receiver_id: UserId,
    /// Text body (may be empty for attachment-only messages).
    pub body: String,
    /// Attachment URL.
    pub attachment: Option<String>,
    /// Server timestamp, or local insert time for optimistic entries.
    pub timestamp: DateTime<Utc>,
    /// Whether the receiver has read it.
    pub is_read: bool,
    /// When the read receipt arrived.
    pub delivered_at: Option<DateTime<Utc>>,
    /// Which path produced this entry.
    pub origin: MessageOrigin,
}

impl Message {
    /// Build an optimistic entry for a message the local user is sending.
    pub fn optimistic(
        sender_id: UserId,
        receiver_id: UserId,
        body: impl Into<String>,
        attachment: Option<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            key: MessageKey::Pending(PendingId::new()),
            conversation_id: None,
            sender_id,
            receiver_id,
            body: body.into(),
            attachment,
            timestamp: now,
            is_read: false,
            delivered_at: None,
            origin: MessageOrigin::Optimistic,
        }
    }

    /// Server id, if confirmed.
    pub fn confirmed_id(&self) -> Option<MessageId> {
        match &self.key {
            MessageKey::Confirmed(id) => Some(*id),
            MessageKey::Pending(_) => None,
        }
    }

    /// Pending id, if optimistic.
    pub fn pending_id(&self) -> Option<&PendingId> {
        match &self.key {
            MessageKey::Pending(id) => Some(id),
            MessageKey::Confirmed(_) => None,
        }
    }

    /// Whether this entry still awaits confirmation.
    pub fn is_pending(&self) -> bool {
        matches!(self.key, MessageKey::Pending(_))
    }

    /// The other participant, seen from `me`.
    pub fn peer_of(&self, me: UserId) -> UserId {
        if self.sender_id == me {
            self.receiver_id
        } else {
            self.sender_id
        }
    }

    /// Whether sender, receiver and body match `other` (attachment ignored).
    pub fn same_content(&self, other: &Self) -> bool {
        self.sender_id == other.sender_id
            && self.receiver_id == other.receiver_id
            && self.body == other.body
    }

    /// Short text for a conversation summary.
    pub fn preview(&self) -> String {
        if self.body.trim().is_empty() && self.attachment.is_some() {
            return ATTACHMENT_PREVIEW.to_owned();
        }
        self.body.chars().take(PREVIEW_CHARS).collect()
    }
}

/// Server message object.
///
/// Accepts the field spellings the server uses across endpoints:
/// `receiver_id`/`recipient_id`, `message`/`body`/`content`,
/// `timestamp`/`created_at`. When several spellings are present the first
/// non-null one in that order wins.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(try_from = "RawWireMessage")]
pub struct WireMessage {
    /// Server id.
    pub id: MessageId,
    /// Conversation id, when the endpoint includes it.
    pub conversation_id: Option<ConversationId>,
    /// Author.
    pub sender_id: UserId,
    /// Addressee.
    pub receiver_id: UserId,
    /// Text body.
    pub message: Option<String>,
    /// Attachment URL.
    pub attachment: Option<String>,
    /// Server timestamp.
    pub timestamp: DateTime<Utc>,
    /// Read flag.
    pub is_read: bool,
    /// Read-receipt time.
    pub delivered_at: Option<DateTime<Utc>>,
}

#[derive(Deserialize)]
struct RawWireMessage {
    id: MessageId,
    #[serde(default)]
    conversation_id: Option<ConversationId>,
    sender_id: UserId,
    #[serde(default)]
    receiver_id: Option<UserId>,
    #[serde(default)]
    recipient_id: Option<UserId>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    body: Option<String>,
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    attachment: Option<String>,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    is_read: bool,
    #[serde(default)]
    delivered_at: Option<DateTime<Utc>>,
}

impl TryFrom<RawWireMessage> for WireMessage {
    type Error = &'static str;

    fn try_from(raw: RawWireMessage) -> Result<Self, Self::Error> {
        Ok(Self {
            id: raw.id,
            conversation_id: raw.conversation_id,
            sender_id: raw.sender_id,
            receiver_id: raw
                .receiver_id
                .or(raw.recipient_id)
                .ok_or("missing field `receiver_id`")?,
            message: raw.message.or(raw.body).or(raw.content),
            attachment: raw.attachment,
            timestamp: raw
                .timestamp
                .or(raw.created_at)
                .ok_or("missing field `timestamp`")?,
            is_read: raw.is_read,
            delivered_at: raw.delivered_at,
        })
    }
}

impl WireMessage {
    /// Convert into a store entry tagged with its origin.
    pub fn into_message(self, origin: MessageOrigin) -> Message {
        Message {
            key: MessageKey::Confirmed(self.id),
            conversation_id: self.conversation_id,
            sender_id: self.sender_id,
            receiver_id: self.receiver_id,
            body: self.message.unwrap_or_default(),
            attachment: self.attachment.filter(|a| !a.is_empty()),
            timestamp: self.timestamp,
            is_read: self.is_read,
            delivered_at: self.delivered_at,
            origin,
        }
    }
}

/// Summary row of a one-to-one conversation.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Conversation {
    /// Server id, when known.
    pub id: Option<ConversationId>,
    /// The participant who is not the local user.
    pub other_user_id: UserId,
    /// Preview of the most recent message.
    pub last_message_preview: String,
    /// Timestamp of the most recent message.
    pub last_message_at: Option<DateTime<Utc>>,
    /// Inbound messages not yet read locally.
    pub unread_count: u32,
}

impl Conversation {
    /// Empty summary for a peer.
    pub fn new(other_user_id: UserId) -> Self {
        Self {
            id: None,
            other_user_id,
            last_message_preview: String::new(),
            last_message_at: None,
            unread_count: 0,
        }
    }
}

/// The set of users reported online by the latest successful poll.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PresenceSet {
    /// Online user ids.
    pub online_user_ids: HashSet<UserId>,
    /// When the set was last replaced. `None` before the first poll.
    pub last_refreshed_at: Option<DateTime<Utc>>,
}

impl PresenceSet {
    /// Whether `user` was online at the last refresh.
    pub fn contains(&self, user: UserId) -> bool {
        self.online_user_ids.contains(&user)
    }

    /// Replace the whole set.
    pub fn replace(&mut self, ids: impl IntoIterator<Item = UserId>, at: DateTime<Utc>) {
        self.online_user_ids = ids.into_iter().collect();
        self.last_refreshed_at = Some(at);
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
