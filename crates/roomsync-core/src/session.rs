//! Room session: the active room, the per-room cache and the subscription.
//!
//! ```text
//!  ┌────────┐ select(Some)  ┌───────────────┐ settle delay ┌────────┐
//!  │ NoRoom │──────────────>│ Transitioning │─────────────>│ Active │
//!  └────────┘               └───────────────┘              └────────┘
//!      ^                        │       ^                       │
//!      │ select(None)           │       │ select(Some)          │
//!      └────────────────────────┴───────┴───────────────────────┘
//! ```
//!
//! Navigating away caches a room's state instead of dropping it, so returning
//! restores pagination progress and the visible list. The cache is bounded and
//! evicts the least recently used room.

use std::{
    collections::{HashMap, VecDeque},
    ops::Sub,
    time::Duration,
};

use crate::{
    message::RoomId,
    pagination::RequestId,
    room::RoomSyncState,
};

/// Session phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase<I> {
    /// No room selected.
    NoRoom,
    /// A room was selected and the switch is settling.
    Transitioning {
        /// Transition identity.
        transition: u64,
        /// When the switch started.
        started_at: I,
    },
    /// A room is active.
    Active,
}

/// Bounded LRU cache of room states.
#[derive(Debug, Clone)]
pub struct RoomCache<I> {
    rooms: HashMap<RoomId, RoomSyncState<I>>,
    recency: VecDeque<RoomId>,
    capacity: usize,
}

impl<I> RoomCache<I> {
    /// Empty cache holding at most `capacity` rooms.
    pub fn new(capacity: usize) -> Self {
        Self { rooms: HashMap::new(), recency: VecDeque::new(), capacity }
    }

    /// Store a room state as most recently used. Returns the evicted room, if
    /// any. With zero capacity the state itself is dropped.
    pub fn insert(&mut self, state: RoomSyncState<I>) -> Option<RoomId> {
        let room_id = state.room_id.clone();
        if self.capacity == 0 {
            return Some(room_id);
        }

        self.recency.retain(|id| *id != room_id);
        self.recency.push_back(room_id.clone());
        self.rooms.insert(room_id, state);

        if self.rooms.len() > self.capacity
            && let Some(evicted) = self.recency.pop_front()
        {
            self.rooms.remove(&evicted);
            tracing::debug!(room = %evicted, "evicted room state from cache");
            return Some(evicted);
        }
        None
    }

    /// Remove and return a room state.
    pub fn take(&mut self, room_id: &RoomId) -> Option<RoomSyncState<I>> {
        let state = self.rooms.remove(room_id)?;
        self.recency.retain(|id| id != room_id);
        Some(state)
    }

    /// Drop a room state. Returns whether it was cached.
    pub fn remove(&mut self, room_id: &RoomId) -> bool {
        self.take(room_id).is_some()
    }

    /// Cached state of a room.
    pub fn get(&self, room_id: &RoomId) -> Option<&RoomSyncState<I>> {
        self.rooms.get(room_id)
    }

    /// Cached state of a room, mutable. Does not affect recency.
    pub fn get_mut(&mut self, room_id: &RoomId) -> Option<&mut RoomSyncState<I>> {
        self.rooms.get_mut(room_id)
    }

    /// Whether a room is cached.
    pub fn contains(&self, room_id: &RoomId) -> bool {
        self.rooms.contains_key(room_id)
    }

    /// Cached rooms, least recently used first.
    pub fn iter(&self) -> impl Iterator<Item = &RoomSyncState<I>> {
        self.recency.iter().filter_map(|id| self.rooms.get(id))
    }

    /// Number of cached rooms.
    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    /// Whether the cache is empty.
    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }
}

/// What a room switch did, for the engine to turn into actions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Switch {
    /// Identity of the new transition.
    pub transition: u64,
    /// Unsettled transition this one replaced.
    pub superseded: Option<u64>,
    /// Topic to unsubscribe.
    pub unsubscribe: Option<String>,
    /// Fetch of the outgoing room to cancel.
    pub cancel: Option<RequestId>,
    /// Room pushed out of the cache by the outgoing room.
    pub evicted: Option<RoomId>,
    /// The target room's state came from the cache.
    pub restored: bool,
}

/// Owner of every room's sync state.
#[derive(Debug, Clone)]
pub struct RoomSession<I> {
    phase: SessionPhase<I>,
    active: Option<RoomSyncState<I>>,
    cache: RoomCache<I>,
    subscription: Option<String>,
    transitions: u64,
}

impl<I> RoomSession<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    /// Session with no room selected.
    pub fn new(max_cached_rooms: usize) -> Self {
        Self {
            phase: SessionPhase::NoRoom,
            active: None,
            cache: RoomCache::new(max_cached_rooms),
            subscription: None,
            transitions: 0,
        }
    }

    /// Current phase.
    pub fn phase(&self) -> SessionPhase<I> {
        self.phase
    }

    /// Whether a switch is settling.
    pub fn is_transitioning(&self) -> bool {
        matches!(self.phase, SessionPhase::Transitioning { .. })
    }

    /// State of the active room.
    pub fn active(&self) -> Option<&RoomSyncState<I>> {
        self.active.as_ref()
    }

    /// State of the active room, mutable.
    pub fn active_mut(&mut self) -> Option<&mut RoomSyncState<I>> {
        self.active.as_mut()
    }

    /// Id of the active room.
    pub fn active_room_id(&self) -> Option<&RoomId> {
        self.active.as_ref().map(|state| &state.room_id)
    }

    /// Subscribed topic.
    pub fn subscription(&self) -> Option<&str> {
        self.subscription.as_deref()
    }

    /// Cached (inactive) rooms.
    pub fn cache(&self) -> &RoomCache<I> {
        &self.cache
    }

    /// State of a room, active or cached.
    pub fn state_mut(&mut self, room_id: &RoomId) -> Option<&mut RoomSyncState<I>> {
        match &mut self.active {
            Some(active) if active.room_id == *room_id => Some(active),
            _ => self.cache.get_mut(room_id),
        }
    }

    /// Switch to `target`, subscribing to `topic`.
    ///
    /// The outgoing room's pending load is suspended and its state cached
    /// (or dropped when `target` is `None`). The target's state is restored
    /// from the cache or created fresh.
    pub fn switch(&mut self, target: Option<RoomId>, topic: Option<String>, now: I) -> Switch {
        let superseded = self.pending_transition();
        self.transitions += 1;
        let transition = self.transitions;

        let unsubscribe = self.subscription.take();
        let mut cancel = None;
        let mut evicted = None;

        if let Some(mut outgoing) = self.active.take() {
            cancel = outgoing.suspend_load();
            if target.is_some() {
                evicted = self.cache.insert(outgoing);
            } else {
                tracing::debug!(room = %outgoing.room_id, "discarding room state");
            }
        }

        let mut restored = false;
        match target {
            Some(room_id) => {
                let state = match self.cache.take(&room_id) {
                    Some(state) => {
                        restored = true;
                        state
                    },
                    None => RoomSyncState::new(room_id),
                };
                self.active = Some(state);
                self.subscription = topic;
                self.phase = SessionPhase::Transitioning { transition, started_at: now };
            },
            None => self.phase = SessionPhase::NoRoom,
        }

        Switch { transition, superseded, unsubscribe, cancel, evicted, restored }
    }

    /// Re-select the room that is already active or settling.
    ///
    /// Returns the new transition and the unsettled one it replaces. An active
    /// session stays active; a settling one keeps its original start time.
    pub fn reselect(&mut self) -> (u64, Option<u64>) {
        let superseded = self.pending_transition();
        self.transitions += 1;
        let transition = self.transitions;
        if let SessionPhase::Transitioning { started_at, .. } = self.phase {
            self.phase = SessionPhase::Transitioning { transition, started_at };
        }
        (transition, superseded)
    }

    /// Complete the pending transition if the settle delay has elapsed.
    pub fn settle_if_due(&mut self, now: I, delay: Duration) -> Option<u64> {
        match self.phase {
            SessionPhase::Transitioning { transition, started_at } if now - started_at >= delay => {
                self.phase = SessionPhase::Active;
                Some(transition)
            },
            _ => None,
        }
    }

    /// Time until the pending transition settles.
    pub fn next_settle(&self, now: I, delay: Duration) -> Option<Duration> {
        match self.phase {
            SessionPhase::Transitioning { started_at, .. } => {
                Some(delay.saturating_sub(now - started_at))
            },
            _ => None,
        }
    }

    /// Drop a cached room's state. Returns whether it was cached.
    pub fn forget(&mut self, room_id: &RoomId) -> bool {
        self.cache.remove(room_id)
    }

    fn pending_transition(&self) -> Option<u64> {
        match self.phase {
            SessionPhase::Transitioning { transition, .. } => Some(transition),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;

    const SETTLE: Duration = Duration::from_millis(300);

    fn room(id: &str) -> Option<RoomId> {
        Some(RoomId::from(id))
    }

    #[test]
    fn switch_caches_outgoing_room() {
        let t0 = Instant::now();
        let mut session = RoomSession::new(4);
        session.switch(room("a"), Some("/t/a".into()), t0);
        if let Some(state) = session.active_mut() {
            state.page = 3;
        }

        let switch = session.switch(room("b"), Some("/t/b".into()), t0);
        assert_eq!(switch.unsubscribe.as_deref(), Some("/t/a"));
        assert!(!switch.restored);
        assert!(session.cache().contains(&RoomId::from("a")));

        let switch = session.switch(room("a"), Some("/t/a".into()), t0);
        assert!(switch.restored);
        assert_eq!(session.active().map(|s| s.page), Some(3));
        assert_eq!(session.subscription(), Some("/t/a"));
    }

    #[test]
    fn selecting_none_discards_state() {
        let t0 = Instant::now();
        let mut session = RoomSession::new(4);
        session.switch(room("a"), Some("/t/a".into()), t0);
        let switch = session.switch(None, None, t0);
        assert_eq!(switch.unsubscribe.as_deref(), Some("/t/a"));
        assert_eq!(session.phase(), SessionPhase::NoRoom);
        assert!(session.cache().is_empty());
        assert!(session.subscription().is_none());
    }

    #[test]
    fn superseded_transition_is_reported() {
        let t0 = Instant::now();
        let mut session = RoomSession::new(4);
        let first = session.switch(room("a"), None, t0);
        let second = session.switch(room("b"), None, t0);
        assert_eq!(second.superseded, Some(first.transition));

        assert_eq!(session.settle_if_due(t0 + SETTLE, SETTLE), Some(second.transition));
        let third = session.switch(room("c"), None, t0 + SETTLE);
        assert_eq!(third.superseded, None);
    }

    #[test]
    fn settles_after_delay() {
        let t0 = Instant::now();
        let mut session = RoomSession::new(4);
        session.switch(room("a"), None, t0);
        assert!(session.is_transitioning());
        assert_eq!(session.settle_if_due(t0 + Duration::from_millis(100), SETTLE), None);
        assert_eq!(session.next_settle(t0 + Duration::from_millis(100), SETTLE), Some(Duration::from_millis(200)));
        assert!(session.settle_if_due(t0 + SETTLE, SETTLE).is_some());
        assert_eq!(session.phase(), SessionPhase::Active);
    }

    #[test]
    fn reselect_keeps_active_phase() {
        let t0 = Instant::now();
        let mut session = RoomSession::new(4);
        session.switch(room("a"), None, t0);
        session.settle_if_due(t0 + SETTLE, SETTLE);
        let (_, superseded) = session.reselect();
        assert_eq!(superseded, None);
        assert_eq!(session.phase(), SessionPhase::Active);
    }

    #[test]
    fn cache_evicts_least_recently_used() {
        let mut cache = RoomCache::<Instant>::new(2);
        cache.insert(RoomSyncState::new("a".into()));
        cache.insert(RoomSyncState::new("b".into()));
        cache.insert(RoomSyncState::new("a".into()));
        assert_eq!(cache.insert(RoomSyncState::new("c".into())), Some(RoomId::from("b")));
        assert!(cache.contains(&RoomId::from("a")));
        assert!(cache.contains(&RoomId::from("c")));
    }

    #[test]
    fn zero_capacity_cache_keeps_nothing() {
        let mut cache = RoomCache::<Instant>::new(0);
        assert_eq!(cache.insert(RoomSyncState::new("a".into())), Some(RoomId::from("a")));
        assert!(cache.is_empty());
    }
}
