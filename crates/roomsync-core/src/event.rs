//! Engine events and actions.

use std::time::Duration;

use crate::{
    error::SyncError,
    message::{Message, MessageId, MessageKind, RoomId, UserId},
    pagination::{LoadState, RequestId},
    room::RoomSyncState,
    wire::{Envelope, RawMessage},
};

/// Why a history fetch did not produce a page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadFailure {
    /// The fetch was cancelled by the engine. Not an error.
    Cancelled,
    /// Network or server failure; retried with backoff.
    Transient(String),
}

/// Events the caller feeds into the engine.
///
/// The caller is responsible for:
/// - Forwarding UI intents (select room, load, send, edit, delete)
/// - Reporting the outcome of every action it executes
/// - Delivering push envelopes and connection signals
/// - Driving time forward via ticks
///
/// Generic over `I` (Instant type) to support both production and simulated
/// clocks.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncEvent<I = std::time::Instant> {
    /// Switch the active room. `None` leaves the current room.
    SelectRoom {
        /// Target room.
        room_id: Option<RoomId>,
    },

    /// Load the next older history page of the active room.
    LoadOlder,

    /// Manual retry after a terminal load failure.
    RetryLoad,

    /// Send a text message to the active room.
    SendMessage {
        /// Text content.
        content: String,
        /// Message being replied to.
        reply_to: Option<MessageId>,
    },

    /// Send an already uploaded attachment to the active room.
    SendAttachment {
        /// Attachment kind (image or file).
        kind: MessageKind,
        /// Location returned by the upload.
        file_url: String,
        /// Display name, used as content.
        name: String,
    },

    /// Publish a failed optimistic message again.
    Resend {
        /// Local id of the failed message.
        temp_id: String,
    },

    /// Ask the server to delete a message.
    DeleteMessage {
        /// Message to delete.
        id: MessageId,
    },

    /// Ask the server to change a message's content.
    EditMessage {
        /// Message to edit.
        id: MessageId,
        /// New content.
        content: String,
    },

    /// Mark the active room read.
    MarkRead,

    /// Forget a room. Leaving the active room behaves like selecting `None`.
    LeaveRoom {
        /// Room to forget.
        room_id: RoomId,
    },

    /// Update a room's member count.
    SetParticipants {
        /// Room.
        room_id: RoomId,
        /// Number of members, including the current user.
        count: usize,
    },

    /// A history page arrived.
    PageLoaded {
        /// Fetch the page answers.
        request: RequestId,
        /// Room the fetch was for.
        room_id: RoomId,
        /// Raw items, any order.
        items: Vec<RawMessage>,
    },

    /// A history fetch failed or was cancelled.
    PageFailed {
        /// Fetch that failed.
        request: RequestId,
        /// Room the fetch was for.
        room_id: RoomId,
        /// Failure kind.
        failure: LoadFailure,
    },

    /// A mark-read call finished.
    MarkReadCompleted {
        /// Room that was marked.
        room_id: RoomId,
        /// Server acknowledged the call.
        success: bool,
    },

    /// The transport refused to dispatch a published message.
    PublishRejected {
        /// Local id of the rejected message.
        temp_id: String,
    },

    /// Push envelope received on a subscribed topic.
    Envelope {
        /// Topic it was delivered on.
        topic: String,
        /// Decoded envelope.
        envelope: Envelope,
    },

    /// Transport connected (or reconnected).
    Connected,

    /// Transport lost its connection.
    Disconnected,

    /// Time tick for settle, watchdog, retry and deferred mark-read timers.
    Tick {
        /// Current time from the environment.
        now: I,
    },
}

/// Load state as presented to observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadStatus {
    /// Nothing in flight.
    Idle,
    /// Fetching a page.
    Loading {
        /// Page being fetched.
        page: u32,
    },
    /// Waiting before the next attempt.
    RetryScheduled {
        /// Attempts made so far.
        attempt: u32,
        /// Backoff before the next attempt.
        delay: Duration,
    },
    /// Attempts exhausted; manual retry available.
    Failed {
        /// Last failure reason.
        reason: String,
    },
}

impl LoadStatus {
    /// Presentable status of a room's load state.
    pub fn of<I>(state: &RoomSyncState<I>) -> Self {
        match &state.load {
            LoadState::Idle => Self::Idle,
            LoadState::Loading { page, .. } => Self::Loading { page: *page },
            LoadState::RetryScheduled { delay, .. } => {
                Self::RetryScheduled { attempt: state.retry_count, delay: *delay }
            },
            LoadState::Failed { reason } => Self::Failed { reason: reason.clone() },
        }
    }
}

/// Actions the engine produces for the caller to execute.
#[derive(Debug, Clone, PartialEq)]
pub enum SyncAction {
    /// Subscribe to a room's live topic.
    Subscribe {
        /// Topic to subscribe.
        topic: String,
        /// Room the topic belongs to.
        room_id: RoomId,
    },

    /// Drop a topic subscription.
    Unsubscribe {
        /// Topic to drop.
        topic: String,
    },

    /// Fetch a history page. Report the result as
    /// [`SyncEvent::PageLoaded`] or [`SyncEvent::PageFailed`].
    FetchPage {
        /// Fetch identity.
        request: RequestId,
        /// Room to fetch.
        room_id: RoomId,
        /// Page index, 0 is newest.
        page: u32,
        /// Page size.
        size: u32,
    },

    /// Cancel an in-flight fetch.
    CancelFetch {
        /// Fetch to cancel.
        request: RequestId,
    },

    /// Publish an envelope. If the transport refuses and `temp_id` is set,
    /// report [`SyncEvent::PublishRejected`].
    Publish {
        /// Destination.
        destination: String,
        /// Envelope to publish.
        envelope: Envelope,
        /// Optimistic message the envelope carries.
        temp_id: Option<String>,
    },

    /// Call the mark-read API. Report [`SyncEvent::MarkReadCompleted`].
    PostMarkRead {
        /// Room to mark.
        room_id: RoomId,
        /// Reader.
        user_id: UserId,
    },

    /// The visible list changed.
    MessagesChanged {
        /// Active room, `None` after leaving.
        room_id: Option<RoomId>,
        /// Full visible list, `sent_at` ascending.
        messages: Vec<Message>,
    },

    /// A room's load state changed.
    LoadStateChanged {
        /// Room.
        room_id: RoomId,
        /// New status.
        status: LoadStatus,
        /// More history is available.
        has_more: bool,
    },

    /// An error worth showing to the user.
    RoomSyncError {
        /// Room the error belongs to.
        room_id: RoomId,
        /// Error.
        error: SyncError,
    },

    /// A room selection started.
    TransitionStarted {
        /// Transition identity.
        transition: u64,
        /// Target room.
        room_id: Option<RoomId>,
    },

    /// A room selection completed.
    TransitionSettled {
        /// Transition identity.
        transition: u64,
    },

    /// A room selection was superseded before it settled.
    TransitionAborted {
        /// Transition identity.
        transition: u64,
    },
}
