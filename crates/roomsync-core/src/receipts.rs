//! Read-receipt aggregation.
//!
//! Local mark-read and remote read updates go through [`merge_reader`], a set
//! union guarded by membership, so applying the same update twice (or both
//! paths in any order) converges to the same state.

use std::{ops::Sub, time::Duration};

use crate::message::{Message, Timestamp, UserId};

/// How an outgoing message's read state is presented.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadStatus {
    /// Every other participant has read it.
    ReadByAll,
    /// Some, but not all, other participants have read it.
    ReadBy(usize),
    /// Nobody else has read it.
    Unread,
}

/// Add `reader` to `read_by` of every qualifying message.
///
/// Qualifying messages have a server id and, when `up_to` is given, were sent
/// at or before it. Returns the number of messages that changed.
pub fn merge_reader(messages: &mut [Message], reader: &UserId, up_to: Option<Timestamp>) -> usize {
    let mut changed = 0;
    for msg in messages
        .iter_mut()
        .filter(|m| m.id.is_some())
        .filter(|m| up_to.is_none_or(|limit| m.sent_at <= limit))
    {
        if msg.read_by.insert(reader.clone()) {
            changed += 1;
        }
    }
    changed
}

/// Read status of an outgoing message. `None` for messages by others.
///
/// `others = |read_by \ {sender}|`, `total = max(participants, 2)`; read by all
/// when `others >= total - 1`.
pub fn read_status(msg: &Message, participant_count: Option<usize>) -> Option<ReadStatus> {
    if !msg.is_me {
        return None;
    }

    let others = msg.read_by.iter().filter(|reader| **reader != msg.sender_id).count();
    let total = participant_count.unwrap_or(2).max(2);

    Some(if others >= total - 1 {
        ReadStatus::ReadByAll
    } else if others > 0 {
        ReadStatus::ReadBy(others)
    } else {
        ReadStatus::Unread
    })
}

/// Whether a mark-read at `now` falls inside the throttle window of `last`.
pub fn is_throttled<I>(last: Option<I>, now: I, min_interval: Duration) -> bool
where
    I: Copy + Sub<Output = Duration>,
{
    last.is_some_and(|last| now - last < min_interval)
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::message::{MessageId, RoomId};

    fn msg(id: Option<&str>, at: i64, is_me: bool) -> Message {
        let mut m = Message::optimistic(
            "t".into(),
            RoomId::from("r"),
            UserId::from("me"),
            "x".into(),
            Timestamp(at),
        );
        m.id = id.map(MessageId::from);
        m.is_temp = id.is_none();
        m.is_me = is_me;
        m
    }

    #[test]
    fn merge_is_idempotent_and_skips_temps() {
        let mut list = vec![msg(Some("1"), 0, true), msg(None, 1, true)];
        let bob = UserId::from("bob");
        assert_eq!(merge_reader(&mut list, &bob, None), 1);
        assert_eq!(merge_reader(&mut list, &bob, None), 0);
        assert_eq!(list[0].read_count(), 1);
        assert_eq!(list[1].read_count(), 0);
    }

    #[test]
    fn merge_respects_up_to() {
        let mut list = vec![msg(Some("1"), 0, true), msg(Some("2"), 10, true)];
        merge_reader(&mut list, &UserId::from("bob"), Some(Timestamp(5)));
        assert_eq!(list[0].read_count(), 1);
        assert_eq!(list[1].read_count(), 0);
    }

    #[test]
    fn status_for_direct_chat() {
        let mut m = msg(Some("1"), 0, true);
        assert_eq!(read_status(&m, None), Some(ReadStatus::Unread));
        m.read_by.insert(UserId::from("me"));
        assert_eq!(read_status(&m, None), Some(ReadStatus::Unread), "own read does not count");
        m.read_by.insert(UserId::from("bob"));
        assert_eq!(read_status(&m, Some(1)), Some(ReadStatus::ReadByAll));
    }

    #[test]
    fn status_for_group() {
        let mut m = msg(Some("1"), 0, true);
        m.read_by.insert(UserId::from("a"));
        assert_eq!(read_status(&m, Some(4)), Some(ReadStatus::ReadBy(1)));
        m.read_by.insert(UserId::from("b"));
        m.read_by.insert(UserId::from("c"));
        assert_eq!(read_status(&m, Some(4)), Some(ReadStatus::ReadByAll));
    }

    #[test]
    fn no_status_for_incoming() {
        assert_eq!(read_status(&msg(Some("1"), 0, false), Some(3)), None);
    }

    #[test]
    fn throttle_window() {
        let t0 = Instant::now();
        let window = Duration::from_secs(3);
        assert!(!is_throttled(None, t0, window));
        assert!(is_throttled(Some(t0), t0 + Duration::from_secs(2), window));
        assert!(!is_throttled(Some(t0), t0 + Duration::from_secs(3), window));
    }
}
