//! Error types for the sync engine.
//!
//! Errors returned from [`crate::SyncEngine::handle`] reject a single event and
//! leave the engine state untouched. Failures of the collaborators (history
//! fetch, transport, mark-read) never surface as `Err`; the engine turns them
//! into state transitions and, when the user needs to know, a
//! [`crate::SyncAction::RoomSyncError`].

use thiserror::Error;

use crate::message::{MessageId, RoomId};

/// Errors produced by the sync engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    /// Sending requires a connected transport.
    #[error("not connected")]
    NotConnected,

    /// The operation needs an active room.
    #[error("no active room")]
    NoActiveRoom,

    /// The operation is rejected while a room switch is settling.
    #[error("room transition in progress")]
    Transitioning,

    /// Message content is empty.
    #[error("message is empty")]
    EmptyMessage,

    /// Same content was sent moments ago.
    #[error("duplicate send suppressed")]
    Debounced,

    /// The transport refused to dispatch an optimistic message.
    #[error("send rejected for {temp_id}")]
    SendRejected {
        /// Local id of the message, kept and marked failed.
        temp_id: String,
    },

    /// Edit for a message that is not present locally.
    #[error("edit for unknown message {id}")]
    EditOnUnknownMessage {
        /// Message id from the edit.
        id: MessageId,
    },

    /// Resend for a message that is not a failed optimistic entry.
    #[error("no failed message {temp_id}")]
    UnknownTempMessage {
        /// Local id from the request.
        temp_id: String,
    },

    /// History loading gave up.
    #[error("loading {room_id} failed after {attempts} attempts: {reason}")]
    RetriesExhausted {
        /// Room whose history failed.
        room_id: RoomId,
        /// Attempts made.
        attempts: u32,
        /// Last failure reason.
        reason: String,
    },
}

impl SyncError {
    /// Returns true if the same request may succeed later without user action.
    ///
    /// Connection and transition rejections clear up on their own; everything
    /// else needs the user to do something different.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::NotConnected | Self::Transitioning)
    }
}
