//! Raw message normalization.
//!
//! Maps a [`RawMessage`] from history or push into a canonical [`Message`].
//! Pure: no I/O, no clock access (the caller passes `now`), never fails.

use chrono::{DateTime, NaiveDateTime};
use serde_json::Value;

use crate::{
    message::{DELETED_PLACEHOLDER, Message, MessageId, MessageKind, RoomId, Timestamp, UserId},
    wire::{RawId, RawKind, RawMessage, RawTimestamp},
};

/// Epoch values below this are taken to be seconds rather than milliseconds.
const SECONDS_EPOCH_LIMIT: i64 = 100_000_000_000;

/// Naive date formats accepted in addition to RFC 3339. Interpreted as UTC.
const NAIVE_FORMATS: [&str; 2] = ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"];

/// Normalize a raw message.
///
/// - `kind` is inferred by [`infer_kind`]
/// - missing `content` becomes an empty string
/// - missing or unparseable `sent_at` becomes `now`
/// - `is_me` compares the sender with `current_user`
/// - a missing room id is left empty for the caller to fill in
pub fn normalize(raw: RawMessage, current_user: &UserId, now: Timestamp) -> Message {
    let sender_id = raw
        .sender_id
        .as_ref()
        .and_then(RawId::to_id_string)
        .map_or_else(|| UserId::new(""), UserId::from);

    let sender_name = raw
        .sender_name
        .filter(|name| !name.trim().is_empty())
        .unwrap_or_else(|| sender_id.to_string());

    let deleted = raw.deleted.unwrap_or(false);
    let content = if deleted { DELETED_PLACEHOLDER.to_string() } else { raw.content.unwrap_or_default() };

    Message {
        id: raw.id.as_ref().and_then(RawId::to_id_string).map(MessageId::from),
        temp_id: raw.temp_id.filter(|t| !t.is_empty()),
        room_id: raw.room_id.as_ref().and_then(RawId::to_id_string).map_or_else(|| RoomId::new(""), RoomId::from),
        is_me: !sender_id.as_str().is_empty() && &sender_id == current_user,
        sender_name,
        sender_id,
        content,
        kind: infer_kind(raw.kind.as_ref()),
        file_url: if deleted { None } else { raw.file_url.filter(|u| !u.is_empty()) },
        reply_to: raw.reply_to.as_ref().and_then(RawId::to_id_string).map(MessageId::from),
        sent_at: raw.sent_at.as_ref().and_then(parse_timestamp).unwrap_or(now),
        read_by: raw
            .read_by
            .unwrap_or_default()
            .iter()
            .filter_map(RawId::to_id_string)
            .map(UserId::from)
            .collect(),
        deleted,
        edited: false,
        is_temp: false,
        send_failed: false,
    }
}

/// Normalize a message straight from JSON.
pub fn normalize_value(value: Value, current_user: &UserId, now: Timestamp) -> Message {
    normalize(RawMessage::from_value(value), current_user, now)
}

/// Infer the message kind.
///
/// Names match case-insensitively by substring against `SYSTEM`, `IMAGE` and
/// `FILE` (in that order); numeric codes, including numeric strings, decode
/// directly. Everything else is text.
pub fn infer_kind(raw: Option<&RawKind>) -> MessageKind {
    match raw {
        Some(RawKind::Code(code)) => MessageKind::from_code(*code),
        Some(RawKind::Name(name)) => {
            if let Ok(code) = name.trim().parse::<i64>() {
                return MessageKind::from_code(code);
            }
            let upper = name.to_ascii_uppercase();
            if upper.contains("SYSTEM") {
                MessageKind::System
            } else if upper.contains("IMAGE") {
                MessageKind::Image
            } else if upper.contains("FILE") {
                MessageKind::File
            } else {
                MessageKind::Text
            }
        },
        Some(RawKind::Other(Value::Number(n))) => {
            n.as_f64().map_or(MessageKind::Text, |f| MessageKind::from_code(f as i64))
        },
        Some(RawKind::Other(_)) | None => MessageKind::Text,
    }
}

/// Parse a raw timestamp. `None` if it cannot be interpreted.
pub(crate) fn parse_timestamp(raw: &RawTimestamp) -> Option<Timestamp> {
    match raw {
        RawTimestamp::Millis(n) => Some(from_epoch_number(*n)),
        RawTimestamp::Text(text) => parse_text_timestamp(text),
        RawTimestamp::Other(Value::Number(n)) => n.as_f64().map(|f| from_epoch_number(f as i64)),
        RawTimestamp::Other(_) => None,
    }
}

fn from_epoch_number(n: i64) -> Timestamp {
    if n.abs() < SECONDS_EPOCH_LIMIT { Timestamp(n.saturating_mul(1000)) } else { Timestamp(n) }
}

fn parse_text_timestamp(text: &str) -> Option<Timestamp> {
    let text = text.trim();
    if let Ok(n) = text.parse::<i64>() {
        return Some(from_epoch_number(n));
    }
    if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
        return Some(Timestamp(dt.timestamp_millis()));
    }
    NAIVE_FORMATS.iter().find_map(|format| {
        NaiveDateTime::parse_from_str(text, format)
            .ok()
            .map(|naive| Timestamp(naive.and_utc().timestamp_millis()))
    })
}

/// Render a send time for display: `HH:MM` on the same UTC day as `now`,
/// `YYYY-MM-DD HH:MM` otherwise. Empty for out-of-range values.
pub fn format_sent_at(sent_at: Timestamp, now: Timestamp) -> String {
    let (Some(at), Some(today)) =
        (DateTime::from_timestamp_millis(sent_at.millis()), DateTime::from_timestamp_millis(now.millis()))
    else {
        return String::new();
    };

    if at.date_naive() == today.date_naive() {
        at.format("%H:%M").to_string()
    } else {
        at.format("%Y-%m-%d %H:%M").to_string()
    }
}
