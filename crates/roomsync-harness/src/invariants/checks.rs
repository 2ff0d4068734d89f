//! Standard invariant checks.
//!
//! Each check states a property of the visible message lists that must hold
//! after every processed event, whatever order events arrived in.

use std::collections::HashSet;

use super::{Invariant, InvariantResult, SystemSnapshot, Violation};

/// A server id appears at most once per room.
pub struct UniqueMessageIds;

impl Invariant for UniqueMessageIds {
    fn name(&self) -> &'static str {
        "unique_message_ids"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for client in &state.clients {
            for (room_id, room) in &client.rooms {
                let mut seen = HashSet::new();
                for id in room.messages.iter().filter_map(|m| m.id.as_ref()) {
                    if !seen.insert(id) {
                        return Err(Violation {
                            invariant: self.name(),
                            message: format!("client {} room {room_id}: id {id} twice", client.id),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

/// Messages are ordered by `sent_at`, oldest first.
pub struct ChronologicalOrder;

impl Invariant for ChronologicalOrder {
    fn name(&self) -> &'static str {
        "chronological_order"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for client in &state.clients {
            for (room_id, room) in &client.rooms {
                if let Some(pair) = room.messages.windows(2).find(|w| w[1].sent_at < w[0].sent_at)
                {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!(
                            "client {} room {room_id}: {:?} listed before {:?}",
                            client.id, pair[0].sent_at, pair[1].sent_at
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// Every message in a room's list belongs to that room.
pub struct RoomIsolation;

impl Invariant for RoomIsolation {
    fn name(&self) -> &'static str {
        "room_isolation"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for client in &state.clients {
            for (room_id, room) in &client.rooms {
                if let Some(stray) = room.messages.iter().find(|m| m.room_id != *room_id) {
                    return Err(Violation {
                        invariant: self.name(),
                        message: format!(
                            "client {} room {room_id}: message from room {}",
                            client.id, stray.room_id
                        ),
                    });
                }
            }
        }
        Ok(())
    }
}

/// At most one optimistic entry waits per sender, content and time window.
pub struct SinglePendingTemp;

impl Invariant for SinglePendingTemp {
    fn name(&self) -> &'static str {
        "single_pending_temp"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for client in &state.clients {
            for (room_id, room) in &client.rooms {
                let temps: Vec<_> = room.messages.iter().filter(|m| m.is_temp).collect();
                for (i, a) in temps.iter().enumerate() {
                    if temps[i + 1..].iter().any(|b| a.matches_pending(b, client.temp_match_window)) {
                        return Err(Violation {
                            invariant: self.name(),
                            message: format!(
                                "client {} room {room_id}: duplicate pending {:?}",
                                client.id, a.content
                            ),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

/// Every confirmed message id is recorded as seen, and temp entries carry no
/// server id.
pub struct SeenIdsCoverMessages;

impl Invariant for SeenIdsCoverMessages {
    fn name(&self) -> &'static str {
        "seen_ids_cover_messages"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for client in &state.clients {
            for (room_id, room) in &client.rooms {
                for msg in &room.messages {
                    let fault = match &msg.id {
                        Some(id) if !room.seen_ids.contains(id) => Some(format!("id {id} unseen")),
                        Some(id) if msg.is_temp => Some(format!("temp entry has id {id}")),
                        _ => None,
                    };
                    if let Some(fault) = fault {
                        return Err(Violation {
                            invariant: self.name(),
                            message: format!("client {} room {room_id}: {fault}", client.id),
                        });
                    }
                }
            }
        }
        Ok(())
    }
}

/// A client with an active room is subscribed to exactly that room's topic.
pub struct ActiveRoomSubscribed;

impl Invariant for ActiveRoomSubscribed {
    fn name(&self) -> &'static str {
        "active_room_subscribed"
    }

    fn check(&self, state: &SystemSnapshot) -> InvariantResult {
        for client in &state.clients {
            if client.subscription != client.expected_topic {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!(
                        "client {}: subscribed to {:?}, active room wants {:?}",
                        client.id, client.subscription, client.expected_topic
                    ),
                });
            }
            if let Some(active) = &client.active_room
                && !client.rooms.contains_key(active)
            {
                return Err(Violation {
                    invariant: self.name(),
                    message: format!("client {}: active room {active} has no state", client.id),
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use roomsync_core::{Message, MessageId, RoomId, Timestamp, UserId};

    use super::*;
    use crate::invariants::{ClientSnapshot, RoomSnapshot};

    fn confirmed(id: &str, room: &str, at: i64) -> Message {
        let mut msg = Message::optimistic(
            format!("t-{id}"),
            RoomId::from(room),
            UserId::from("bob"),
            format!("msg {id}"),
            Timestamp(at),
        );
        msg.id = Some(MessageId::from(id));
        msg.is_temp = false;
        msg
    }

    fn snapshot(room: &str, messages: Vec<Message>) -> SystemSnapshot {
        let mut client = ClientSnapshot::default();
        client.rooms.insert(RoomId::from(room), RoomSnapshot::with_messages(messages));
        SystemSnapshot::single(client)
    }

    #[test]
    fn duplicate_ids_are_reported() {
        let state = snapshot("r1", vec![confirmed("1", "r1", 1), confirmed("1", "r1", 2)]);
        assert!(UniqueMessageIds.check(&state).is_err());
    }

    #[test]
    fn out_of_order_list_is_reported() {
        let state = snapshot("r1", vec![confirmed("1", "r1", 5), confirmed("2", "r1", 1)]);
        assert!(ChronologicalOrder.check(&state).is_err());
        assert!(UniqueMessageIds.check(&state).is_ok());
    }

    #[test]
    fn foreign_message_is_reported() {
        let state = snapshot("r1", vec![confirmed("1", "r2", 1)]);
        let violation = RoomIsolation.check(&state).unwrap_err();
        assert_eq!(violation.invariant, "room_isolation");
    }

    #[test]
    fn two_equivalent_temps_are_reported() {
        let temp = |t: &str| {
            Message::optimistic(
                t.into(),
                RoomId::from("r1"),
                UserId::from("me"),
                "hi".into(),
                Timestamp(0),
            )
        };
        let state = snapshot("r1", vec![temp("temp-1"), temp("temp-2")]);
        assert!(SinglePendingTemp.check(&state).is_err());
    }

    #[test]
    fn pending_temps_are_matched_within_the_client_window() {
        let temp = |t: &str, at: i64| {
            Message::optimistic(
                t.into(),
                RoomId::from("r1"),
                UserId::from("me"),
                "hi".into(),
                Timestamp(at),
            )
        };
        let mut state = snapshot("r1", vec![temp("temp-1", 0), temp("temp-2", 5_000)]);
        assert!(SinglePendingTemp.check(&state).is_err());

        state.clients[0].temp_match_window = Duration::from_secs(2);
        assert!(SinglePendingTemp.check(&state).is_ok());
    }

    #[test]
    fn unseen_id_is_reported() {
        let mut client = ClientSnapshot::default();
        client.rooms.insert(
            RoomId::from("r1"),
            RoomSnapshot::with_messages(vec![confirmed("1", "r1", 1)]).with_seen_ids([]),
        );
        assert!(SeenIdsCoverMessages.check(&SystemSnapshot::single(client)).is_err());
    }

    #[test]
    fn stale_subscription_is_reported() {
        let client = ClientSnapshot {
            subscription: Some("/topic/rooms/r1".into()),
            expected_topic: Some("/topic/rooms/r2".into()),
            ..ClientSnapshot::default()
        };
        assert!(ActiveRoomSubscribed.check(&SystemSnapshot::single(client)).is_err());
    }
}
