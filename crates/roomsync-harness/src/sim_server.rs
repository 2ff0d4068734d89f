//! In-memory chat server.
//!
//! `SimServer` owns authoritative room histories and answers the three server
//! calls a client makes: paged history reads, publishes (send, delete, edit)
//! and mark-read. Publishes return the envelope the server would broadcast to
//! the room's subscribers; delivering it is the transport's job.

#![allow(clippy::disallowed_types, reason = "Synchronous locking operations only")]

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use roomsync_core::{
    Envelope, EnvelopeAction, MessageId, RawId, RawMessage, RawTimestamp, ReadUpdate, RoomId,
    Timestamp, UserId,
};

use crate::sim_env::{SIM_EPOCH, SimEnv};

/// Source of server-side timestamps.
pub type ServerClock = Arc<dyn Fn() -> Timestamp + Send + Sync>;

/// Authoritative state of every room.
pub struct SimServer {
    rooms: BTreeMap<RoomId, Vec<RawMessage>>,
    clock: ServerClock,
    last_stamp: Timestamp,
    next_id: i64,
    echo_temp_ids: bool,
    read_calls: Vec<(UserId, RoomId)>,
}

impl std::fmt::Debug for SimServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimServer")
            .field("rooms", &self.rooms.len())
            .field("next_id", &self.next_id)
            .field("echo_temp_ids", &self.echo_temp_ids)
            .finish_non_exhaustive()
    }
}

impl SimServer {
    /// Server stamping messages with `clock`.
    pub fn new(clock: ServerClock) -> Self {
        Self {
            rooms: BTreeMap::new(),
            clock,
            last_stamp: Timestamp(0),
            next_id: 1,
            echo_temp_ids: true,
            read_calls: Vec::new(),
        }
    }

    /// Server sharing the virtual clock of `env`.
    pub fn with_env(env: &SimEnv) -> Self {
        let env = env.clone();
        Self::new(Arc::new(move || roomsync_core::Environment::wall_clock(&env)))
    }

    /// Whether confirmations carry the client's temp id back.
    ///
    /// Servers that drop it force clients onto content matching.
    pub fn set_echo_temp_ids(&mut self, echo: bool) {
        self.echo_temp_ids = echo;
    }

    /// Create `count` history messages in `room_id`, one second apart, ending
    /// at the current server time.
    pub fn seed_history(&mut self, room_id: &RoomId, sender: &UserId, count: usize) {
        let now = (self.clock)();
        let start = Timestamp(now.millis() - 1_000 * count as i64);
        for i in 0..count {
            let at = Timestamp(start.millis() + 1_000 * i as i64);
            self.store(room_id, sender, format!("history {i}"), at);
        }
    }

    /// Post a message from another user. Returns the broadcast envelope.
    pub fn post(&mut self, room_id: &RoomId, sender: &UserId, content: &str) -> Envelope {
        let at = self.stamp();
        let raw = self.store(room_id, sender, content.to_string(), at);
        Envelope::message(EnvelopeAction::Send, &raw)
    }

    /// Page `page` (0 is newest) of at most `size` messages, newest first.
    pub fn page(&self, room_id: &RoomId, page: u32, size: u32) -> Vec<RawMessage> {
        let Some(history) = self.rooms.get(room_id) else {
            return Vec::new();
        };
        let size = size as usize;
        let end = history.len().saturating_sub(page as usize * size);
        let start = end.saturating_sub(size);
        history[start..end].iter().rev().cloned().collect()
    }

    /// Apply a client publish addressed to `room_id`.
    ///
    /// Returns the envelope to broadcast, or `None` when the publish was
    /// malformed or targets an unknown message.
    pub fn publish(&mut self, room_id: &RoomId, envelope: &Envelope) -> Option<Envelope> {
        let raw = RawMessage::from_value(envelope.data.clone());
        match envelope.action {
            EnvelopeAction::Send => {
                if raw.sender_id.as_ref().and_then(RawId::to_id_string).is_none() {
                    return None;
                }
                let at = self.stamp();
                let temp_id = if self.echo_temp_ids { raw.temp_id.clone() } else { None };
                let mut stored = RawMessage { temp_id, ..raw };
                self.assign(room_id, &mut stored, at);
                self.insert(room_id, stored.clone(), at);
                Some(Envelope::message(EnvelopeAction::Send, &stored))
            },
            EnvelopeAction::Delete => {
                let id = raw.message_id()?;
                let stored = self.find_mut(room_id, &id)?;
                stored.deleted = Some(true);
                stored.content = None;
                let ack = RawMessage {
                    id: stored.id.clone(),
                    room_id: Some(RawId::from(room_id.as_str())),
                    deleted: Some(true),
                    ..RawMessage::default()
                };
                Some(Envelope::message(EnvelopeAction::Delete, &ack))
            },
            EnvelopeAction::Edit => {
                let id = raw.message_id()?;
                let content = raw.content?;
                let stored = self.find_mut(room_id, &id)?;
                stored.content = Some(content.clone());
                let ack = RawMessage {
                    id: stored.id.clone(),
                    room_id: Some(RawId::from(room_id.as_str())),
                    content: Some(content),
                    ..RawMessage::default()
                };
                Some(Envelope::message(EnvelopeAction::Edit, &ack))
            },
            EnvelopeAction::MarkRead => Some(envelope.clone()),
        }
    }

    /// Record that `user_id` read `room_id`. Returns the broadcast envelope.
    pub fn mark_read(&mut self, user_id: &UserId, room_id: &RoomId) -> Envelope {
        self.read_calls.push((user_id.clone(), room_id.clone()));
        let reader = RawId::from(user_id.as_str());
        for msg in self.rooms.get_mut(room_id).into_iter().flatten() {
            let readers = msg.read_by.get_or_insert_with(Vec::new);
            if !readers.contains(&reader) {
                readers.push(reader.clone());
            }
        }
        Envelope::read_update(&ReadUpdate {
            room_id: room_id.clone(),
            user_id: user_id.clone(),
            up_to: None,
        })
    }

    /// Every message stored for `room_id`, oldest first.
    pub fn history(&self, room_id: &RoomId) -> &[RawMessage] {
        self.rooms.get(room_id).map_or(&[], Vec::as_slice)
    }

    /// Mark-read calls received so far.
    pub fn read_calls(&self) -> &[(UserId, RoomId)] {
        &self.read_calls
    }

    fn store(
        &mut self,
        room_id: &RoomId,
        sender: &UserId,
        content: String,
        at: Timestamp,
    ) -> RawMessage {
        let mut raw = RawMessage {
            sender_id: Some(RawId::from(sender.as_str())),
            sender_name: Some(sender.to_string()),
            content: Some(content),
            ..RawMessage::default()
        };
        self.assign(room_id, &mut raw, at);
        self.insert(room_id, raw.clone(), at);
        raw
    }

    fn insert(&mut self, room_id: &RoomId, raw: RawMessage, at: Timestamp) {
        let history = self.rooms.entry(room_id.clone()).or_default();
        let pos = history.partition_point(|m| stamp_of(m) <= at);
        history.insert(pos, raw);
    }

    fn assign(&mut self, room_id: &RoomId, raw: &mut RawMessage, at: Timestamp) {
        raw.id = Some(RawId::Num(self.next_id));
        raw.room_id = Some(RawId::from(room_id.as_str()));
        raw.sent_at = Some(RawTimestamp::from(at));
        self.next_id += 1;
    }

    /// Server time, strictly increasing across calls.
    fn stamp(&mut self) -> Timestamp {
        let now = (self.clock)();
        let at = if now > self.last_stamp { now } else { Timestamp(self.last_stamp.millis() + 1) };
        self.last_stamp = at;
        at
    }

    fn find_mut(&mut self, room_id: &RoomId, id: &MessageId) -> Option<&mut RawMessage> {
        self.rooms
            .get_mut(room_id)?
            .iter_mut()
            .find(|m| m.message_id().as_ref() == Some(id))
    }
}

impl Default for SimServer {
    fn default() -> Self {
        Self::new(Arc::new(|| SIM_EPOCH))
    }
}

fn stamp_of(raw: &RawMessage) -> Timestamp {
    match raw.sent_at {
        Some(RawTimestamp::Millis(ms)) => Timestamp(ms),
        _ => Timestamp(0),
    }
}

/// Server shared between the transport and the test.
#[derive(Debug, Clone)]
pub struct SharedSimServer(Arc<Mutex<SimServer>>);

impl SharedSimServer {
    /// Wrap a server.
    pub fn new(server: SimServer) -> Self {
        Self(Arc::new(Mutex::new(server)))
    }

    /// Lock the server. A poisoned lock is recovered; the server holds no
    /// invariants a panicking test could break halfway.
    pub fn lock(&self) -> MutexGuard<'_, SimServer> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Create a shared server on the virtual clock of `env`.
pub fn create_shared_server(env: &SimEnv) -> SharedSimServer {
    SharedSimServer::new(SimServer::with_env(env))
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn room() -> RoomId {
        RoomId::from("r1")
    }

    #[test]
    fn pages_are_newest_first_and_stop_at_the_start() {
        let env = SimEnv::new();
        env.advance(Duration::from_secs(3600));
        let mut server = SimServer::with_env(&env);
        server.seed_history(&room(), &UserId::from("bob"), 25);

        let first = server.page(&room(), 0, 20);
        assert_eq!(first.len(), 20);
        assert_eq!(first[0].content.as_deref(), Some("history 24"));

        let second = server.page(&room(), 1, 20);
        assert_eq!(second.len(), 5);
        assert_eq!(second[4].content.as_deref(), Some("history 0"));

        assert!(server.page(&room(), 2, 20).is_empty());
    }

    #[test]
    fn send_publish_assigns_id_and_echoes_temp_id() {
        let mut server = SimServer::default();
        let raw = RawMessage {
            sender_id: Some(RawId::from("alice")),
            content: Some("hi".into()),
            temp_id: Some("temp-1".into()),
            ..RawMessage::default()
        };

        let broadcast = server
            .publish(&room(), &Envelope::message(EnvelopeAction::Send, &raw))
            .unwrap();
        let echoed = RawMessage::from_value(broadcast.data);

        assert_eq!(echoed.id, Some(RawId::Num(1)));
        assert_eq!(echoed.temp_id.as_deref(), Some("temp-1"));
        assert_eq!(server.history(&room()).len(), 1);
    }

    #[test]
    fn server_stamps_are_strictly_increasing() {
        let mut server = SimServer::default();
        server.post(&room(), &UserId::from("bob"), "a");
        server.post(&room(), &UserId::from("bob"), "b");

        let stamps: Vec<_> = server.history(&room()).iter().map(stamp_of).collect();
        assert!(stamps[0] < stamps[1]);
    }

    #[test]
    fn edit_of_unknown_message_is_dropped() {
        let mut server = SimServer::default();
        let raw = RawMessage {
            id: Some(RawId::Num(99)),
            content: Some("x".into()),
            ..RawMessage::default()
        };
        assert!(server.publish(&room(), &Envelope::message(EnvelopeAction::Edit, &raw)).is_none());
    }

    #[test]
    fn mark_read_adds_reader_once() {
        let mut server = SimServer::default();
        server.post(&room(), &UserId::from("bob"), "a");
        server.mark_read(&UserId::from("alice"), &room());
        server.mark_read(&UserId::from("alice"), &room());

        let readers = server.history(&room())[0].read_by.clone().unwrap_or_default();
        assert_eq!(readers, vec![RawId::from("alice")]);
        assert_eq!(server.read_calls().len(), 2);
    }
}
