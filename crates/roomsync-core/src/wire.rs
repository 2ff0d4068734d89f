//! Wire types exchanged with the transport and the history API.
//!
//! Raw types are tolerant: every field is optional, the loosely typed ones
//! (ids, kinds, timestamps) accept several encodings with a catch-all
//! fallback, and each message field decodes on its own, so a JSON object
//! never fails on a single bad field. The normalizer turns them into typed [`crate::Message`] values.

use serde::{Deserialize, Deserializer, Serialize, de::DeserializeOwned};
use serde_json::Value;

use crate::message::{Message, MessageId, MessageKind, RoomId, Timestamp, UserId};

/// Identifier as sent by the server: number or string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawId {
    /// Integer id.
    Num(i64),
    /// Textual id.
    Text(String),
    /// Anything else (floats, objects). Kept for best-effort decoding.
    Other(Value),
}

impl RawId {
    /// Canonical string form. `None` for empty or unusable values.
    pub fn to_id_string(&self) -> Option<String> {
        match self {
            Self::Num(n) => Some(n.to_string()),
            Self::Text(s) => {
                let trimmed = s.trim();
                (!trimmed.is_empty()).then(|| trimmed.to_string())
            },
            Self::Other(Value::Number(n)) => n.as_f64().map(|f| format!("{}", f.trunc() as i64)),
            Self::Other(_) => None,
        }
    }
}

impl From<&str> for RawId {
    fn from(id: &str) -> Self {
        Self::Text(id.to_string())
    }
}

impl From<i64> for RawId {
    fn from(id: i64) -> Self {
        Self::Num(id)
    }
}

/// Message kind as sent by the server: numeric code or free-form name.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawKind {
    /// Numeric code (0 text, 1 image, 2 file, 3 system).
    Code(i64),
    /// Name such as `"IMAGE"`, `"system_notice"`, `"file-upload"`.
    Name(String),
    /// Anything else.
    Other(Value),
}

impl From<MessageKind> for RawKind {
    fn from(kind: MessageKind) -> Self {
        Self::Code(i64::from(kind.code()))
    }
}

/// Timestamp as sent by the server: epoch number or date string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RawTimestamp {
    /// Epoch milliseconds (or seconds, for small values).
    Millis(i64),
    /// RFC 3339 or `YYYY-MM-DD HH:MM:SS` string, or a numeric string.
    Text(String),
    /// Anything else.
    Other(Value),
}

impl From<Timestamp> for RawTimestamp {
    fn from(ts: Timestamp) -> Self {
        Self::Millis(ts.millis())
    }
}

/// Decode one field, turning a value of the wrong shape into `None` instead of
/// failing the whole message.
fn lenient<'de, D, T>(deserializer: D) -> Result<Option<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    let value = Value::deserialize(deserializer)?;
    Ok(serde_json::from_value(value).ok())
}

/// Boolean flag that also accepts `0`/`1` and `"true"`/`"false"`.
fn lenient_flag<'de, D>(deserializer: D) -> Result<Option<bool>, D::Error>
where
    D: Deserializer<'de>,
{
    let flag = match Value::deserialize(deserializer)? {
        Value::Bool(b) => Some(b),
        Value::Number(n) => n.as_f64().map(|f| f != 0.0),
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" => Some(true),
            "false" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    };
    Ok(flag)
}

/// A message as received from history or push, or as published on send.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct RawMessage {
    /// Server id.
    #[serde(
        alias = "messageId",
        alias = "message_id",
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub id: Option<RawId>,
    /// Room id.
    #[serde(
        alias = "room_id",
        alias = "chatRoomId",
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub room_id: Option<RawId>,
    /// Author id.
    #[serde(
        alias = "sender_id",
        alias = "userId",
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub sender_id: Option<RawId>,
    /// Author display name.
    #[serde(
        alias = "sender_name",
        alias = "senderNickname",
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub sender_name: Option<String>,
    /// Content.
    #[serde(deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Kind.
    #[serde(
        rename = "type",
        alias = "messageType",
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub kind: Option<RawKind>,
    /// Attachment URL.
    #[serde(alias = "file_url", deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub file_url: Option<String>,
    /// Replied-to message id.
    #[serde(
        alias = "replyId",
        alias = "reply_id",
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub reply_to: Option<RawId>,
    /// Send time.
    #[serde(
        alias = "sent_at",
        alias = "createdAt",
        alias = "timestamp",
        deserialize_with = "lenient",
        skip_serializing_if = "Option::is_none"
    )]
    pub sent_at: Option<RawTimestamp>,
    /// Readers.
    #[serde(alias = "read_by", deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub read_by: Option<Vec<RawId>>,
    /// Deleted flag.
    #[serde(
        alias = "isDeleted",
        deserialize_with = "lenient_flag",
        skip_serializing_if = "Option::is_none"
    )]
    pub deleted: Option<bool>,
    /// Local temp id echoed back by servers that support it.
    #[serde(alias = "temp_id", deserialize_with = "lenient", skip_serializing_if = "Option::is_none")]
    pub temp_id: Option<String>,
}

impl RawMessage {
    /// Decode from a JSON value. Never fails: an undecodable value yields an
    /// empty message that the normalizer fills with defaults.
    pub fn from_value(value: Value) -> Self {
        match serde_json::from_value(value) {
            Ok(raw) => raw,
            Err(e) => {
                tracing::warn!("Undecodable raw message, using defaults: {e}");
                Self::default()
            },
        }
    }

    /// Room id as a typed value, if present.
    pub fn room(&self) -> Option<RoomId> {
        self.room_id.as_ref().and_then(RawId::to_id_string).map(RoomId::from)
    }

    /// Server id as a typed value, if present.
    pub fn message_id(&self) -> Option<MessageId> {
        self.id.as_ref().and_then(RawId::to_id_string).map(MessageId::from)
    }

    /// Outgoing payload for a local message.
    pub fn outgoing(msg: &Message) -> Self {
        Self {
            id: msg.id.as_ref().map(|id| RawId::Text(id.to_string())),
            room_id: Some(RawId::Text(msg.room_id.to_string())),
            sender_id: Some(RawId::Text(msg.sender_id.to_string())),
            sender_name: None,
            content: Some(msg.content.clone()),
            kind: Some(msg.kind.into()),
            file_url: msg.file_url.clone(),
            reply_to: msg.reply_to.as_ref().map(|id| RawId::Text(id.to_string())),
            sent_at: Some(msg.sent_at.into()),
            read_by: None,
            deleted: None,
            temp_id: msg.temp_id.clone(),
        }
    }
}

/// A "user X has read room Y" notification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadUpdate {
    /// Room the update applies to.
    pub room_id: RoomId,
    /// Reader.
    pub user_id: UserId,
    /// Only messages sent at or before this instant qualify. `None` means all.
    pub up_to: Option<Timestamp>,
}

#[derive(Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawReadUpdate {
    #[serde(alias = "room_id")]
    room_id: Option<RawId>,
    #[serde(alias = "user_id", alias = "readerId")]
    user_id: Option<RawId>,
    #[serde(alias = "up_to", alias = "readAt")]
    up_to: Option<RawTimestamp>,
}

impl ReadUpdate {
    /// Decode from a JSON value. `None` when room or user is missing.
    pub fn from_value(value: Value) -> Option<Self> {
        let raw: RawReadUpdate = serde_json::from_value(value).ok()?;
        let room_id = raw.room_id.as_ref().and_then(RawId::to_id_string)?;
        let user_id = raw.user_id.as_ref().and_then(RawId::to_id_string)?;
        let up_to = raw.up_to.as_ref().and_then(crate::normalize::parse_timestamp);
        Some(Self { room_id: RoomId::from(room_id), user_id: UserId::from(user_id), up_to })
    }
}

/// Envelope action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EnvelopeAction {
    /// New message (data: message).
    Send,
    /// Message deleted (data: message with id).
    Delete,
    /// Message content changed (data: message with id and content).
    Edit,
    /// Read receipt (data: read update).
    MarkRead,
}

/// Unit exchanged over the publish/subscribe transport.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// What happened.
    pub action: EnvelopeAction,
    /// Payload; shape depends on `action`.
    pub data: Value,
}

impl Envelope {
    /// Envelope carrying a message payload.
    pub fn message(action: EnvelopeAction, raw: &RawMessage) -> Self {
        let data = serde_json::to_value(raw).unwrap_or(Value::Null);
        Self { action, data }
    }

    /// Envelope carrying a read update.
    pub fn read_update(update: &ReadUpdate) -> Self {
        let mut data = serde_json::Map::new();
        data.insert("roomId".into(), Value::String(update.room_id.to_string()));
        data.insert("userId".into(), Value::String(update.user_id.to_string()));
        if let Some(up_to) = update.up_to {
            data.insert("upTo".into(), Value::from(up_to.millis()));
        }
        Self { action: EnvelopeAction::MarkRead, data: Value::Object(data) }
    }

    /// Decode an envelope from JSON text.
    pub fn from_json(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Encode as JSON text.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}
