//! Canonical message model.
//!
//! Everything past the normalizer works on these statically typed values.
//! Identifiers are string newtypes because servers hand out both numeric and
//! textual ids; the normalizer folds both into the same representation.

use std::{collections::BTreeSet, fmt, time::Duration};

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create an id from anything string-like.
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            /// Id as a string slice.
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(id: &str) -> Self {
                Self(id.to_string())
            }
        }

        impl From<String> for $name {
            fn from(id: String) -> Self {
                Self(id)
            }
        }
    };
}

string_id!(
    /// Room identifier.
    RoomId
);

string_id!(
    /// User identifier.
    UserId
);

string_id!(
    /// Server-assigned message identifier.
    MessageId
);

/// Milliseconds since the Unix epoch.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Milliseconds since the Unix epoch.
    pub fn millis(self) -> i64 {
        self.0
    }

    /// Absolute distance between two timestamps.
    pub fn abs_diff(self, other: Timestamp) -> Duration {
        Duration::from_millis(self.0.abs_diff(other.0))
    }

    /// Timestamp shifted forward by `duration`.
    #[must_use]
    pub fn plus(self, duration: Duration) -> Timestamp {
        Timestamp(self.0.saturating_add(duration.as_millis() as i64))
    }
}

/// Message kind, decoded once at the boundary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum MessageKind {
    /// Server-generated notice (joins, renames).
    System,
    /// Plain text.
    #[default]
    Text,
    /// Image attachment; `file_url` points at it.
    Image,
    /// Generic file attachment; `file_url` points at it.
    File,
}

impl MessageKind {
    /// Numeric wire code.
    pub fn code(self) -> u8 {
        match self {
            Self::Text => 0,
            Self::Image => 1,
            Self::File => 2,
            Self::System => 3,
        }
    }

    /// Decode a numeric wire code. Unknown codes are treated as text.
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => Self::Image,
            2 => Self::File,
            3 => Self::System,
            _ => Self::Text,
        }
    }
}

/// Placeholder shown in place of deleted content.
pub const DELETED_PLACEHOLDER: &str = "This message has been deleted";

/// A message in a room's visible list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    /// Server identity. `None` until the server confirms an optimistic send.
    pub id: Option<MessageId>,
    /// Local identity of an optimistic message (`temp-N`).
    pub temp_id: Option<String>,
    /// Room the message belongs to.
    pub room_id: RoomId,
    /// Author.
    pub sender_id: UserId,
    /// Author display name.
    pub sender_name: String,
    /// Text content, or the caption of an attachment.
    pub content: String,
    /// Message kind.
    pub kind: MessageKind,
    /// Attachment location for image and file messages.
    pub file_url: Option<String>,
    /// Message this one replies to.
    pub reply_to: Option<MessageId>,
    /// Send time.
    pub sent_at: Timestamp,
    /// Authored by the current user.
    pub is_me: bool,
    /// Users that have read the message.
    pub read_by: BTreeSet<UserId>,
    /// Deleted; content holds [`DELETED_PLACEHOLDER`].
    pub deleted: bool,
    /// Content was edited after sending.
    pub edited: bool,
    /// Optimistic entry awaiting server confirmation.
    pub is_temp: bool,
    /// Optimistic entry the transport refused to dispatch.
    pub send_failed: bool,
}

impl Message {
    /// Build an optimistic message for the current user.
    pub fn optimistic(
        temp_id: String,
        room_id: RoomId,
        sender_id: UserId,
        content: String,
        sent_at: Timestamp,
    ) -> Self {
        Self {
            id: None,
            temp_id: Some(temp_id),
            room_id,
            sender_name: sender_id.to_string(),
            sender_id,
            content,
            kind: MessageKind::Text,
            file_url: None,
            reply_to: None,
            sent_at,
            is_me: true,
            read_by: BTreeSet::new(),
            deleted: false,
            edited: false,
            is_temp: true,
            send_failed: false,
        }
    }

    /// Number of users that have read the message.
    pub fn read_count(&self) -> usize {
        self.read_by.len()
    }

    /// Mark as deleted, keeping the entry in place.
    pub fn mark_deleted(&mut self) {
        self.deleted = true;
        self.content = DELETED_PLACEHOLDER.to_string();
        self.file_url = None;
    }

    /// Key used to match an optimistic entry with its confirmation.
    pub fn matches_pending(&self, other: &Message, window: Duration) -> bool {
        self.sender_id == other.sender_id
            && self.content == other.content
            && self.sent_at.abs_diff(other.sent_at) <= window
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_codes_roundtrip_known_values() {
        for kind in [MessageKind::Text, MessageKind::Image, MessageKind::File, MessageKind::System]
        {
            assert_eq!(MessageKind::from_code(i64::from(kind.code())), kind);
        }
        assert_eq!(MessageKind::from_code(42), MessageKind::Text);
    }

    #[test]
    fn delete_keeps_entry_and_replaces_content() {
        let mut msg =
            Message::optimistic("temp-1".into(), "r".into(), "u".into(), "hi".into(), Timestamp(0));
        msg.file_url = Some("https://files/x.png".into());
        msg.mark_deleted();
        assert!(msg.deleted);
        assert_eq!(msg.content, DELETED_PLACEHOLDER);
        assert!(msg.file_url.is_none());
    }

    #[test]
    fn pending_match_respects_window() {
        let a = Message::optimistic("t".into(), "r".into(), "u".into(), "hi".into(), Timestamp(0));
        let mut b = a.clone();
        b.sent_at = Timestamp(2_000);
        assert!(a.matches_pending(&b, Duration::from_secs(10)));
        b.sent_at = Timestamp(11_000);
        assert!(!a.matches_pending(&b, Duration::from_secs(10)));
        b.sent_at = Timestamp(1_000);
        b.content = "other".into();
        assert!(!a.matches_pending(&b, Duration::from_secs(10)));
    }
}
