//! Observer registration.
//!
//! Observers are plain callbacks owned by the runtime task and invoked
//! synchronously, in registration order, after each engine step.

use roomsync_core::{LoadStatus, Message, RoomId, SyncError};

/// Called with the active room and its full visible list.
pub type MessagesObserver = Box<dyn Fn(Option<&RoomId>, &[Message]) + Send + Sync>;

/// Called with an error the user should see.
pub type ErrorObserver = Box<dyn Fn(&RoomId, &SyncError) + Send + Sync>;

/// Called with a room's load status and whether more history exists.
pub type LoadStateObserver = Box<dyn Fn(&RoomId, &LoadStatus, bool) + Send + Sync>;

/// Registered observers.
#[derive(Default)]
pub struct Observers {
    messages: Vec<MessagesObserver>,
    errors: Vec<ErrorObserver>,
    load_state: Vec<LoadStateObserver>,
}

impl Observers {
    /// No observers.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a messages-changed observer.
    pub fn add_messages(&mut self, observer: MessagesObserver) {
        self.messages.push(observer);
    }

    /// Register a sync-error observer.
    pub fn add_errors(&mut self, observer: ErrorObserver) {
        self.errors.push(observer);
    }

    /// Register a load-state observer.
    pub fn add_load_state(&mut self, observer: LoadStateObserver) {
        self.load_state.push(observer);
    }

    /// Notify messages observers.
    pub fn messages_changed(&self, room_id: Option<&RoomId>, messages: &[Message]) {
        for observer in &self.messages {
            observer(room_id, messages);
        }
    }

    /// Notify error observers.
    pub fn sync_error(&self, room_id: &RoomId, error: &SyncError) {
        for observer in &self.errors {
            observer(room_id, error);
        }
    }

    /// Notify load-state observers.
    pub fn load_state_changed(&self, room_id: &RoomId, status: &LoadStatus, has_more: bool) {
        for observer in &self.load_state {
            observer(room_id, status, has_more);
        }
    }

    /// Total number of registered observers.
    pub fn len(&self) -> usize {
        self.messages.len() + self.errors.len() + self.load_state.len()
    }

    /// Whether no observer is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl std::fmt::Debug for Observers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Observers")
            .field("messages", &self.messages.len())
            .field("errors", &self.errors.len())
            .field("load_state", &self.load_state.len())
            .finish()
    }
}
