//! Observable state extracted for invariant checking.

use std::{
    collections::{BTreeMap, HashSet},
    time::Duration,
};

use roomsync_core::{
    DEFAULT_TEMP_MATCH_WINDOW, Environment, Message, MessageId, RoomId, RoomSyncState, SyncEngine,
};

/// State of one room as seen by one client.
#[derive(Debug, Clone, Default)]
pub struct RoomSnapshot {
    /// Visible messages in list order.
    pub messages: Vec<Message>,
    /// Ids recorded as seen.
    pub seen_ids: HashSet<MessageId>,
    /// Next page to request.
    pub page: u32,
    /// Whether a history fetch is in flight.
    pub loading: bool,
}

impl RoomSnapshot {
    /// Snapshot with the given messages; every confirmed id is marked seen.
    pub fn with_messages(messages: Vec<Message>) -> Self {
        let seen_ids = messages.iter().filter_map(|m| m.id.clone()).collect();
        Self { messages, seen_ids, ..Self::default() }
    }

    /// Override the seen-id set.
    #[must_use]
    pub fn with_seen_ids(mut self, ids: impl IntoIterator<Item = MessageId>) -> Self {
        self.seen_ids = ids.into_iter().collect();
        self
    }

    /// Mark a fetch as in flight.
    #[must_use]
    pub fn loading(mut self) -> Self {
        self.loading = true;
        self
    }

    fn of<I: Copy + Ord + std::ops::Sub<Output = Duration>>(
        state: &RoomSyncState<I>,
    ) -> Self {
        Self {
            messages: state.messages.clone(),
            seen_ids: state.seen_ids.clone(),
            page: state.page,
            loading: state.in_flight().is_some(),
        }
    }
}

/// State of one client.
#[derive(Debug, Clone)]
pub struct ClientSnapshot {
    /// Client index within the simulation.
    pub id: usize,
    /// Selected room.
    pub active_room: Option<RoomId>,
    /// Live topic the client is subscribed to.
    pub subscription: Option<String>,
    /// Topic the active room should be subscribed on.
    pub expected_topic: Option<String>,
    /// Active and cached rooms.
    pub rooms: BTreeMap<RoomId, RoomSnapshot>,
    /// Window the client matches echoes to optimistic messages in.
    pub temp_match_window: Duration,
}

impl Default for ClientSnapshot {
    fn default() -> Self {
        Self {
            id: 0,
            active_room: None,
            subscription: None,
            expected_topic: None,
            rooms: BTreeMap::new(),
            temp_match_window: DEFAULT_TEMP_MATCH_WINDOW,
        }
    }
}

impl ClientSnapshot {
    /// Capture a client's engine.
    pub fn from_engine<E: Environment>(id: usize, engine: &SyncEngine<E>) -> Self {
        let session = engine.session();
        let mut rooms = BTreeMap::new();

        if let Some(state) = session.active() {
            rooms.insert(state.room_id.clone(), RoomSnapshot::of(state));
        }
        for state in session.cache().iter() {
            rooms.insert(state.room_id.clone(), RoomSnapshot::of(state));
        }

        let active_room = engine.active_room().cloned();
        Self {
            id,
            expected_topic: active_room.as_ref().map(|r| engine.config().topic_for(r)),
            active_room,
            subscription: session.subscription().map(str::to_string),
            rooms,
            temp_match_window: engine.config().temp_match_window,
        }
    }
}

/// State of every simulated client.
#[derive(Debug, Clone, Default)]
pub struct SystemSnapshot {
    /// Clients in index order.
    pub clients: Vec<ClientSnapshot>,
}

impl SystemSnapshot {
    /// No clients.
    pub fn empty() -> Self {
        Self::default()
    }

    /// A single client.
    pub fn single(client: ClientSnapshot) -> Self {
        Self { clients: vec![client] }
    }
}
