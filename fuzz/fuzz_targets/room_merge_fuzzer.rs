//! Fuzz target for room message merging
//!
//! Drives a single room through interleaved history pages, pushes, optimistic
//! sends, deletes, edits and read updates.
//!
//! # Invariants
//!
//! - A server id appears at most once in the list
//! - The list stays sorted by send time
//! - Every listed server id is in `seen_ids`
//! - Deleted messages keep their placeholder content through later edits

#![no_main]

use std::{
    collections::HashSet,
    time::{Duration, Instant},
};

use arbitrary::Arbitrary;
use libfuzzer_sys::fuzz_target;
use roomsync_core::{
    MergeOrigin, Message, MessageId, ReadUpdate, RoomId, RoomSyncState, Timestamp, UserId,
};

const WINDOW: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Arbitrary)]
enum RoomOp {
    History(Vec<Item>),
    Push(Item),
    Optimistic { content: u8, at: u16 },
    Delete(u8),
    Edit { id: u8, content: u8 },
    Read { reader: u8, up_to: Option<u16> },
}

#[derive(Debug, Clone, Arbitrary)]
struct Item {
    id: u8,
    at: u16,
    mine: bool,
    content: u8,
    temp: Option<u8>,
}

fn room() -> RoomId {
    RoomId::from("r1")
}

fn confirmed(item: &Item) -> Message {
    let sender = if item.mine { "me" } else { "bob" };
    let mut msg = Message::optimistic(
        String::new(),
        room(),
        UserId::from(sender),
        format!("line {}", item.content % 8),
        Timestamp(i64::from(item.at) * 100),
    );
    msg.id = Some(MessageId::new(item.id.to_string()));
    msg.temp_id = item.temp.map(|t| format!("temp-{}", t % 4));
    msg.is_temp = false;
    msg.is_me = item.mine;
    msg
}

fuzz_target!(|ops: Vec<RoomOp>| {
    let mut state: RoomSyncState<Instant> = RoomSyncState::new(room());
    let mut deleted = HashSet::new();
    let mut next_temp = 0u32;

    for op in ops {
        match op {
            RoomOp::History(items) => {
                state.merge(items.iter().map(confirmed).collect(), MergeOrigin::History, WINDOW);
            },
            RoomOp::Push(item) => {
                state.merge(vec![confirmed(&item)], MergeOrigin::Push, WINDOW);
            },
            RoomOp::Optimistic { content, at } => {
                next_temp += 1;
                let msg = Message::optimistic(
                    format!("temp-{}", next_temp % 4),
                    room(),
                    UserId::from("me"),
                    format!("line {}", content % 8),
                    Timestamp(i64::from(at) * 100),
                );
                state.push_optimistic(msg, WINDOW);
            },
            RoomOp::Delete(id) => {
                let id = MessageId::new(id.to_string());
                if state.apply_delete(&id) {
                    deleted.insert(id);
                }
            },
            RoomOp::Edit { id, content } => {
                state.apply_edit(&MessageId::new(id.to_string()), format!("edited {content}"));
            },
            RoomOp::Read { reader, up_to } => {
                state.apply_read(&ReadUpdate {
                    room_id: room(),
                    user_id: UserId::from(format!("user-{}", reader % 3)),
                    up_to: up_to.map(|at| Timestamp(i64::from(at) * 100)),
                });
            },
        }

        let mut ids = HashSet::new();
        for msg in &state.messages {
            if let Some(id) = &msg.id {
                assert!(ids.insert(id.clone()), "duplicate id {id}");
                assert!(state.seen_ids.contains(id), "unseen id {id}");
                if deleted.contains(id) {
                    assert!(msg.deleted);
                }
            }
        }
        assert!(state.messages.is_sorted_by_key(|m| m.sent_at));
    }
});
