//! Per-room sync state and the dedup/merge rules.
//!
//! [`RoomSyncState`] owns the identity set (`seen_ids`) and the ordered message
//! list for one room. All list mutations go through the methods here, which
//! maintain two invariants:
//!
//! - no two entries share a server id
//! - entries are ordered by `sent_at` ascending (stable for ties)
//!
//! Temp reconciliation is a heuristic (same sender, same content, `sent_at`
//! within a window). Two identical sends inside the window can be matched to
//! the wrong confirmation; the resulting list is still correct because both
//! confirmations end up visible exactly once.

use std::{collections::HashSet, time::Duration};

use crate::{
    message::{Message, MessageId, RoomId},
    pagination::LoadState,
    wire::ReadUpdate,
};

/// Where a batch of incoming messages came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOrigin {
    /// A history page.
    History,
    /// A live push event from another user.
    Push,
    /// The server echo of one of our own sends.
    OptimisticEcho,
}

/// Outcome of a merge.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MergeReport {
    /// New entries appended.
    pub appended: usize,
    /// Temp entries replaced by their confirmation.
    pub reconciled: usize,
    /// Duplicates dropped.
    pub dropped: usize,
    /// The list had to be re-sorted.
    pub resorted: bool,
}

impl MergeReport {
    /// The visible list changed.
    pub fn changed(&self) -> bool {
        self.appended > 0 || self.reconciled > 0
    }
}

/// Sync state for one room.
///
/// Generic over the instant type so the same state works with real and
/// virtual clocks.
#[derive(Debug, Clone)]
pub struct RoomSyncState<I> {
    /// Room this state belongs to.
    pub room_id: RoomId,
    /// Next history page to fetch (0-based).
    pub page: u32,
    /// More history is available.
    pub has_more: bool,
    /// Server ids already merged.
    pub seen_ids: HashSet<MessageId>,
    /// Visible messages, `sent_at` ascending.
    pub messages: Vec<Message>,
    /// Consecutive failed load attempts.
    pub retry_count: u32,
    /// Last mark-read dispatch, for throttling.
    pub last_read_processed_at: Option<I>,
    /// Pagination state machine.
    pub load: LoadState<I>,
    /// Last load error shown to the user. Cleared on success.
    pub last_error: Option<String>,
    /// Room members, for read status presentation. `None` if unknown.
    pub participant_count: Option<usize>,
}

impl<I: Copy> RoomSyncState<I> {
    /// Fresh state: page 0, more history available, nothing seen.
    pub fn new(room_id: RoomId) -> Self {
        Self {
            room_id,
            page: 0,
            has_more: true,
            seen_ids: HashSet::new(),
            messages: Vec::new(),
            retry_count: 0,
            last_read_processed_at: None,
            load: LoadState::Idle,
            last_error: None,
            participant_count: None,
        }
    }

    /// Merge a batch of normalized messages.
    ///
    /// 1. History items already in `seen_ids` are dropped.
    /// 2. Push/echo items whose id is already present are dropped.
    /// 3. Otherwise a pending temp entry matching the item is replaced in
    ///    place (exact `temp_id` first, then the sender/content/window
    ///    heuristic).
    /// 4. Otherwise the item is appended.
    /// 5. The list is stable-sorted by `sent_at` only if it ended up out of
    ///    order.
    pub fn merge(
        &mut self,
        incoming: Vec<Message>,
        origin: MergeOrigin,
        window: Duration,
    ) -> MergeReport {
        let mut report = MergeReport::default();

        for mut msg in incoming {
            if let Some(id) = &msg.id
                && self.seen_ids.contains(id)
            {
                tracing::debug!(room = %self.room_id, %id, ?origin, "dropping duplicate message");
                report.dropped += 1;
                continue;
            }

            msg.is_temp = false;
            msg.send_failed = false;

            if let Some(pos) = self.find_pending(&msg, window) {
                if let Some(id) = &msg.id {
                    self.seen_ids.insert(id.clone());
                }
                let slot = &mut self.messages[pos];
                msg.read_by.extend(std::mem::take(&mut slot.read_by));
                if msg.temp_id.is_none() {
                    msg.temp_id = slot.temp_id.take();
                }
                *slot = msg;
                report.reconciled += 1;
                continue;
            }

            if let Some(id) = &msg.id {
                self.seen_ids.insert(id.clone());
            }
            self.messages.push(msg);
            report.appended += 1;
        }

        if !self.messages.is_sorted_by_key(|m| m.sent_at) {
            self.messages.sort_by_key(|m| m.sent_at);
            report.resorted = true;
        }

        report
    }

    /// Append a local optimistic message.
    ///
    /// At most one temp entry may exist per pending key. If an equivalent temp
    /// entry is already waiting, no new entry is added and `false` is returned;
    /// the second confirmation then arrives as a regular new message.
    pub fn push_optimistic(&mut self, msg: Message, window: Duration) -> bool {
        if self.messages.iter().any(|m| m.is_temp && m.matches_pending(&msg, window)) {
            return false;
        }
        let pos = self.messages.partition_point(|m| m.sent_at <= msg.sent_at);
        self.messages.insert(pos, msg);
        true
    }

    fn find_pending(&self, msg: &Message, window: Duration) -> Option<usize> {
        if let Some(temp_id) = &msg.temp_id
            && let Some(pos) =
                self.messages.iter().position(|m| m.is_temp && m.temp_id.as_ref() == Some(temp_id))
        {
            return Some(pos);
        }
        self.messages.iter().position(|m| m.is_temp && m.matches_pending(msg, window))
    }

    /// Entry with the given server id.
    pub fn find_mut(&mut self, id: &MessageId) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.id.as_ref() == Some(id))
    }

    /// Optimistic entry with the given temp id.
    pub fn find_temp_mut(&mut self, temp_id: &str) -> Option<&mut Message> {
        self.messages.iter_mut().find(|m| m.is_temp && m.temp_id.as_deref() == Some(temp_id))
    }

    /// Mark a message deleted in place. `false` if the id is unknown.
    pub fn apply_delete(&mut self, id: &MessageId) -> bool {
        match self.find_mut(id) {
            Some(msg) => {
                msg.mark_deleted();
                true
            },
            None => false,
        }
    }

    /// Replace a message's content in place. `false` if the id is unknown.
    pub fn apply_edit(&mut self, id: &MessageId, content: String) -> bool {
        match self.find_mut(id) {
            Some(msg) if msg.deleted => true,
            Some(msg) => {
                msg.content = content;
                msg.edited = true;
                true
            },
            None => false,
        }
    }

    /// Add `reader` to every qualifying message. Returns how many changed.
    ///
    /// Shared by local mark-read and remote read updates so both paths are
    /// commutative and idempotent. Qualifying messages are confirmed (have a
    /// server id) and, when `update.up_to` is set, were sent at or before it.
    pub fn apply_read(&mut self, update: &ReadUpdate) -> usize {
        crate::receipts::merge_reader(&mut self.messages, &update.user_id, update.up_to)
    }

    /// Drop all messages and pagination progress.
    pub fn reset(&mut self) {
        *self = Self { participant_count: self.participant_count, ..Self::new(self.room_id.clone()) };
    }
}

#[cfg(test)]
mod tests {
    use std::time::Instant;

    use super::*;
    use crate::message::{DELETED_PLACEHOLDER, Timestamp, UserId};

    const WINDOW: Duration = Duration::from_secs(10);

    fn state() -> RoomSyncState<Instant> {
        RoomSyncState::new(RoomId::from("r1"))
    }

    fn confirmed(id: &str, sender: &str, content: &str, at: i64) -> Message {
        let mut msg = Message::optimistic(
            String::new(),
            RoomId::from("r1"),
            UserId::from(sender),
            content.to_string(),
            Timestamp(at),
        );
        msg.id = Some(MessageId::from(id));
        msg.temp_id = None;
        msg.is_temp = false;
        msg.is_me = false;
        msg
    }

    fn temp(temp_id: &str, sender: &str, content: &str, at: i64) -> Message {
        Message::optimistic(
            temp_id.to_string(),
            RoomId::from("r1"),
            UserId::from(sender),
            content.to_string(),
            Timestamp(at),
        )
    }

    #[test]
    fn history_duplicates_are_dropped() {
        let mut s = state();
        let report = s.merge(vec![confirmed("1", "a", "x", 10)], MergeOrigin::History, WINDOW);
        assert_eq!(report.appended, 1);

        let report = s.merge(vec![confirmed("1", "a", "x", 10)], MergeOrigin::History, WINDOW);
        assert_eq!(report.dropped, 1);
        assert_eq!(s.messages.len(), 1);
    }

    #[test]
    fn push_redelivery_is_dropped() {
        let mut s = state();
        s.merge(vec![confirmed("9", "a", "x", 10)], MergeOrigin::Push, WINDOW);
        let report = s.merge(vec![confirmed("9", "a", "x", 10)], MergeOrigin::Push, WINDOW);
        assert!(!report.changed());
        assert_eq!(s.messages.len(), 1);
    }

    #[test]
    fn temp_is_reconciled_in_place() {
        let mut s = state();
        s.merge(vec![confirmed("1", "b", "before", 0)], MergeOrigin::History, WINDOW);
        assert!(s.push_optimistic(temp("temp-1", "me", "hi", 1_000), WINDOW));
        s.merge(vec![confirmed("2", "b", "after", 5_000)], MergeOrigin::Push, WINDOW);

        let report =
            s.merge(vec![confirmed("42", "me", "hi", 1_000 + 2_000)], MergeOrigin::OptimisticEcho, WINDOW);

        assert_eq!(report.reconciled, 1);
        assert_eq!(s.messages.len(), 3);
        let pos = s.messages.iter().position(|m| m.content == "hi").unwrap();
        assert_eq!(pos, 1, "confirmed entry keeps the temp entry's position");
        assert_eq!(s.messages[pos].id, Some(MessageId::from("42")));
        assert!(!s.messages[pos].is_temp);
        assert_eq!(s.messages[pos].temp_id.as_deref(), Some("temp-1"));
        assert!(s.seen_ids.contains(&MessageId::from("42")));
    }

    #[test]
    fn temp_outside_window_is_not_reconciled() {
        let mut s = state();
        s.push_optimistic(temp("temp-1", "me", "hi", 0), WINDOW);
        let report = s.merge(vec![confirmed("42", "me", "hi", 20_000)], MergeOrigin::OptimisticEcho, WINDOW);
        assert_eq!(report.appended, 1);
        assert_eq!(s.messages.len(), 2);
    }

    #[test]
    fn exact_temp_id_echo_wins_over_heuristic() {
        let mut s = state();
        s.push_optimistic(temp("temp-1", "me", "hi", 0), WINDOW);
        s.push_optimistic(temp("temp-2", "me", "hi!", 100), WINDOW);

        let mut echo = confirmed("7", "me", "hi!", 200);
        echo.temp_id = Some("temp-2".to_string());
        s.merge(vec![echo], MergeOrigin::OptimisticEcho, WINDOW);

        assert!(s.messages[0].is_temp);
        assert_eq!(s.messages[1].id, Some(MessageId::from("7")));
    }

    #[test]
    fn second_identical_temp_is_not_added() {
        let mut s = state();
        assert!(s.push_optimistic(temp("temp-1", "me", "ok", 0), WINDOW));
        assert!(!s.push_optimistic(temp("temp-2", "me", "ok", 1_000), WINDOW));
        assert_eq!(s.messages.iter().filter(|m| m.is_temp).count(), 1);

        // Both confirmations still become visible exactly once.
        s.merge(vec![confirmed("1", "me", "ok", 500)], MergeOrigin::OptimisticEcho, WINDOW);
        s.merge(vec![confirmed("2", "me", "ok", 1_500)], MergeOrigin::OptimisticEcho, WINDOW);
        assert_eq!(s.messages.len(), 2);
        assert!(s.messages.iter().all(|m| !m.is_temp));
    }

    #[test]
    fn older_history_is_sorted_to_the_head() {
        let mut s = state();
        s.merge(vec![confirmed("10", "a", "new", 10_000)], MergeOrigin::Push, WINDOW);
        let report = s.merge(
            vec![confirmed("2", "a", "older", 2_000), confirmed("1", "a", "oldest", 1_000)],
            MergeOrigin::History,
            WINDOW,
        );
        assert!(report.resorted);
        let order: Vec<_> = s.messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(order, ["oldest", "older", "new"]);
    }

    #[test]
    fn delete_marks_in_place() {
        let mut s = state();
        s.merge(vec![confirmed("1", "a", "x", 0), confirmed("2", "a", "y", 1)], MergeOrigin::History, WINDOW);
        assert!(s.apply_delete(&MessageId::from("1")));
        assert_eq!(s.messages.len(), 2);
        assert!(s.messages[0].deleted);
        assert_eq!(s.messages[0].content, DELETED_PLACEHOLDER);
        assert!(!s.apply_delete(&MessageId::from("404")));
    }

    #[test]
    fn edit_unknown_id_is_reported() {
        let mut s = state();
        s.merge(vec![confirmed("1", "a", "x", 0)], MergeOrigin::History, WINDOW);
        assert!(s.apply_edit(&MessageId::from("1"), "x2".into()));
        assert_eq!(s.messages[0].content, "x2");
        assert!(s.messages[0].edited);
        assert!(!s.apply_edit(&MessageId::from("2"), "nope".into()));
    }

    #[test]
    fn edit_does_not_resurrect_deleted() {
        let mut s = state();
        s.merge(vec![confirmed("1", "a", "x", 0)], MergeOrigin::History, WINDOW);
        s.apply_delete(&MessageId::from("1"));
        assert!(s.apply_edit(&MessageId::from("1"), "back".into()));
        assert_eq!(s.messages[0].content, DELETED_PLACEHOLDER);
    }

    #[test]
    fn reset_keeps_participants() {
        let mut s = state();
        s.participant_count = Some(4);
        s.page = 3;
        s.merge(vec![confirmed("1", "a", "x", 0)], MergeOrigin::History, WINDOW);
        s.reset();
        assert_eq!(s.page, 0);
        assert!(s.messages.is_empty());
        assert!(s.seen_ids.is_empty());
        assert_eq!(s.participant_count, Some(4));
    }
}
