//! Cloneable handle to a running [`crate::SyncRuntime`].

use roomsync_core::{
    LoadStatus, Message, MessageId, MessageKind, RoomId, SyncError, SyncEvent,
};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::{
    error::RuntimeError,
    observer::{ErrorObserver, LoadStateObserver, MessagesObserver},
    runtime::{Command, Registration},
};

/// Point-in-time view of the active room.
#[derive(Debug, Clone, PartialEq)]
pub struct RoomView {
    /// Active room.
    pub room_id: RoomId,
    /// Visible messages, ascending by `sent_at`.
    pub messages: Vec<Message>,
    /// Load status.
    pub status: LoadStatus,
    /// Whether older history may exist.
    pub has_more: bool,
    /// Next history page to request.
    pub page: u32,
    /// Consecutive failed attempts for the current page.
    pub retry_count: u32,
    /// A room transition has not settled yet.
    pub transitioning: bool,
    /// Transport connection state.
    pub connected: bool,
}

/// Handle used by UI code to drive the sync runtime.
///
/// Every method is a request to the runtime task; none of them touch room
/// state directly.
#[derive(Debug)]
pub struct SyncHandle<I = tokio::time::Instant> {
    commands: mpsc::UnboundedSender<Command<I>>,
    shutdown: CancellationToken,
}

impl<I> Clone for SyncHandle<I> {
    fn clone(&self) -> Self {
        Self { commands: self.commands.clone(), shutdown: self.shutdown.clone() }
    }
}

impl<I> SyncHandle<I> {
    pub(crate) fn new(commands: mpsc::UnboundedSender<Command<I>>, shutdown: CancellationToken) -> Self {
        Self { commands, shutdown }
    }

    /// Switch to `room_id`, or leave the active room with `None`.
    ///
    /// Resolves `true` once the transition settles, `false` if a later
    /// selection superseded it or the runtime stopped.
    pub async fn select_room(&self, room_id: Option<RoomId>) -> bool {
        let (reply, rx) = oneshot::channel();
        if self.commands.send(Command::Select { room_id, reply }).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Request the next page of older history for the active room.
    pub async fn load_older_messages(&self) -> Result<(), RuntimeError> {
        self.intent(SyncEvent::LoadOlder).await
    }

    /// Clear a failed load and request the current page again.
    pub async fn retry_load(&self) -> Result<(), RuntimeError> {
        self.intent(SyncEvent::RetryLoad).await
    }

    /// Send a text message to the active room.
    ///
    /// `true` when the message was accepted and published optimistically.
    pub async fn send_message(&self, content: impl Into<String>, reply_to: Option<MessageId>) -> bool {
        let event = SyncEvent::SendMessage { content: content.into(), reply_to };
        self.accepted(event).await
    }

    /// Send an already uploaded file or image.
    pub async fn send_attachment(
        &self,
        kind: MessageKind,
        file_url: impl Into<String>,
        name: impl Into<String>,
    ) -> bool {
        let event = SyncEvent::SendAttachment { kind, file_url: file_url.into(), name: name.into() };
        self.accepted(event).await
    }

    /// Publish a failed optimistic message again.
    pub async fn resend(&self, temp_id: impl Into<String>) -> bool {
        self.accepted(SyncEvent::Resend { temp_id: temp_id.into() }).await
    }

    /// Ask the server to delete a message.
    pub async fn delete_message(&self, id: MessageId) -> Result<(), RuntimeError> {
        self.intent(SyncEvent::DeleteMessage { id }).await
    }

    /// Ask the server to replace a message's content.
    pub async fn edit_message(
        &self,
        id: MessageId,
        content: impl Into<String>,
    ) -> Result<(), RuntimeError> {
        self.intent(SyncEvent::EditMessage { id, content: content.into() }).await
    }

    /// Mark the active room as read, subject to throttling.
    pub async fn mark_read(&self) -> Result<(), RuntimeError> {
        self.intent(SyncEvent::MarkRead).await
    }

    /// Forget a room; leaving the active room deselects it.
    pub async fn leave_room(&self, room_id: RoomId) -> Result<(), RuntimeError> {
        self.intent(SyncEvent::LeaveRoom { room_id }).await
    }

    /// Record a room's participant count, which feeds read-receipt status.
    pub async fn set_participant_count(
        &self,
        room_id: RoomId,
        count: usize,
    ) -> Result<(), RuntimeError> {
        self.intent(SyncEvent::SetParticipants { room_id, count }).await
    }

    /// Register a messages-changed observer.
    pub fn on_messages_changed(&self, observer: MessagesObserver) -> Result<(), RuntimeError> {
        self.observe(Registration::Messages(observer))
    }

    /// Register a room sync error observer.
    pub fn on_room_sync_error(&self, observer: ErrorObserver) -> Result<(), RuntimeError> {
        self.observe(Registration::Errors(observer))
    }

    /// Register a load-state observer.
    pub fn on_load_state(&self, observer: LoadStateObserver) -> Result<(), RuntimeError> {
        self.observe(Registration::LoadState(observer))
    }

    /// View of the active room, `None` when no room is selected.
    pub async fn snapshot(&self) -> Result<Option<RoomView>, RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(Command::Snapshot { reply }).map_err(|_| RuntimeError::Stopped)?;
        rx.await.map_err(|_| RuntimeError::Stopped)
    }

    /// Stop the runtime. In-flight fetches are cancelled.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    /// Whether the runtime is still accepting commands.
    pub fn is_running(&self) -> bool {
        !self.shutdown.is_cancelled() && !self.commands.is_closed()
    }

    async fn intent(&self, event: SyncEvent<I>) -> Result<(), RuntimeError> {
        let (reply, rx) = oneshot::channel();
        self.commands.send(Command::Intent { event, reply }).map_err(|_| RuntimeError::Stopped)?;
        let result: Result<(), SyncError> = rx.await.map_err(|_| RuntimeError::Stopped)?;
        Ok(result?)
    }

    async fn accepted(&self, event: SyncEvent<I>) -> bool {
        match self.intent(event).await {
            Ok(()) => true,
            Err(e) => {
                tracing::debug!("Send rejected: {e}");
                false
            },
        }
    }

    fn observe(&self, registration: Registration) -> Result<(), RuntimeError> {
        self.commands.send(Command::Observe(registration)).map_err(|_| RuntimeError::Stopped)
    }
}
