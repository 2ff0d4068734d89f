//! End-to-end engine scenarios on the simulation harness.
//!
//! Each test drives one engine against the in-memory server on virtual time,
//! with every standard invariant checked after each step.

use std::time::Duration;

use roomsync_core::{
    LoadStatus, RoomId, SyncConfig, SyncError, SyncEvent, UserId, DEFAULT_MARK_READ_DELAY,
    DEFAULT_SETTLE_DELAY, DEFAULT_WATCHDOG_TIMEOUT,
};
use roomsync_harness::{InvariantRegistry, SimDriver};

fn driver() -> SimDriver {
    SimDriver::new("me", SyncConfig::default()).with_invariants(InvariantRegistry::standard())
}

fn seed(driver: &SimDriver, room: &str, count: usize) {
    driver.server().lock().seed_history(&RoomId::from(room), &UserId::from("bob"), count);
}

fn select(driver: &mut SimDriver, room: &str) {
    driver.dispatch(SyncEvent::SelectRoom { room_id: Some(RoomId::from(room)) }).unwrap();
}

/// Open a room, answer its first page and let the transition settle.
fn open_loaded(driver: &mut SimDriver, room: &str) {
    select(driver, room);
    driver.respond_fetches();
    driver.advance(DEFAULT_SETTLE_DELAY);
}

fn last_status(driver: &SimDriver) -> LoadStatus {
    driver.load_states().last().map(|(_, status, _)| status.clone()).unwrap()
}

#[test]
fn fresh_open_loads_newest_page_and_marks_read() {
    let mut driver = driver();
    seed(&driver, "r1", 25);

    select(&mut driver, "r1");
    assert_eq!(driver.subscription(), Some("/topic/rooms/r1"));
    let fetch = driver.pending_fetches().front().cloned().unwrap();
    assert_eq!((fetch.page, fetch.size), (0, 20));

    driver.respond_fetches();
    assert_eq!(driver.visible().len(), 20);
    assert_eq!(driver.visible().last().unwrap().content, "history 24");
    assert!(driver.engine().active_state().unwrap().has_more);

    driver.advance(DEFAULT_SETTLE_DELAY);
    assert_eq!(driver.settled().len(), 1);
    assert_eq!(driver.pending_mark_reads(), 0);

    driver.advance(DEFAULT_MARK_READ_DELAY);
    assert_eq!(driver.pending_mark_reads(), 1);

    driver.complete_mark_reads(true);
    driver.deliver();
    let me = UserId::from("me");
    assert!(driver.visible().iter().all(|m| m.read_by.contains(&me)));
}

#[test]
fn load_older_until_history_is_exhausted() {
    let mut driver = driver();
    seed(&driver, "r1", 25);
    open_loaded(&mut driver, "r1");

    driver.dispatch(SyncEvent::LoadOlder).unwrap();
    let fetch = driver.pending_fetches().front().cloned().unwrap();
    assert_eq!(fetch.page, 1);
    driver.respond_fetches();

    let state = driver.engine().active_state().unwrap();
    assert_eq!(driver.visible().len(), 25);
    assert_eq!(driver.visible()[0].content, "history 0");
    assert!(!state.has_more);

    driver.dispatch(SyncEvent::LoadOlder).unwrap();
    assert_eq!(driver.fetch_count(), 2);
}

#[test]
fn load_older_is_single_flight() {
    let mut driver = driver();
    seed(&driver, "r1", 60);
    open_loaded(&mut driver, "r1");

    driver.dispatch(SyncEvent::LoadOlder).unwrap();
    driver.dispatch(SyncEvent::LoadOlder).unwrap();
    driver.dispatch(SyncEvent::LoadOlder).unwrap();

    assert_eq!(driver.pending_fetches().len(), 1);
    assert_eq!(driver.fetch_count(), 2);
}

#[test]
fn load_older_during_transition_is_rejected() {
    let mut driver = driver();
    select(&mut driver, "r1");

    assert_eq!(driver.dispatch(SyncEvent::LoadOlder), Err(SyncError::Transitioning));
}

#[test]
fn revisiting_a_room_restores_it_without_refetching() {
    let mut driver = driver();
    seed(&driver, "r1", 5);
    seed(&driver, "r2", 3);

    open_loaded(&mut driver, "r1");
    let first_visit = driver.visible().to_vec();
    open_loaded(&mut driver, "r2");
    assert_eq!(driver.visible().len(), 3);

    select(&mut driver, "r1");
    assert_eq!(driver.fetch_count(), 2);
    assert_eq!(driver.visible(), first_visit.as_slice());
    assert_eq!(driver.subscription(), Some("/topic/rooms/r1"));
}

#[test]
fn stale_page_for_previous_room_is_dropped() {
    let mut driver = driver();
    seed(&driver, "r1", 5);
    seed(&driver, "r2", 2);

    select(&mut driver, "r1");
    let r1_fetch = driver.take_fetch().unwrap();
    select(&mut driver, "r2");
    driver.respond_fetches();

    driver.respond_stale(r1_fetch);

    assert_eq!(driver.engine().active_room(), Some(&RoomId::from("r2")));
    assert_eq!(driver.visible().len(), 2);
    assert!(driver.visible().iter().all(|m| m.room_id == RoomId::from("r2")));
}

#[test]
fn rapid_switches_abort_superseded_transitions() {
    let mut driver = driver();
    select(&mut driver, "r1");
    select(&mut driver, "r2");
    select(&mut driver, "r3");
    driver.advance(DEFAULT_SETTLE_DELAY);

    assert_eq!(driver.aborted().len(), 2);
    assert_eq!(driver.settled().len(), 1);
    assert_eq!(driver.subscription(), Some("/topic/rooms/r3"));
}

#[test]
fn transient_failure_retries_after_backoff() {
    let mut driver = driver();
    seed(&driver, "r1", 3);
    select(&mut driver, "r1");

    driver.fail_fetches("connection reset");
    assert_eq!(
        last_status(&driver),
        LoadStatus::RetryScheduled { attempt: 1, delay: Duration::from_millis(500) }
    );

    driver.advance(Duration::from_millis(499));
    assert_eq!(driver.fetch_count(), 1);
    driver.advance(Duration::from_millis(1));
    assert_eq!(driver.fetch_count(), 2);

    driver.respond_fetches();
    assert_eq!(driver.visible().len(), 3);
    assert_eq!(driver.engine().active_state().unwrap().retry_count, 0);
}

#[test]
fn watchdog_exhausts_retries_then_manual_retry_recovers() {
    let mut driver = driver();
    seed(&driver, "r1", 3);
    select(&mut driver, "r1");

    driver.advance(DEFAULT_WATCHDOG_TIMEOUT);
    assert_eq!(driver.fetch_count(), 2);
    assert_eq!(driver.pending_fetches().len(), 1);

    driver.advance(DEFAULT_WATCHDOG_TIMEOUT);
    assert_eq!(driver.fetch_count(), 3);

    driver.advance(DEFAULT_WATCHDOG_TIMEOUT);
    assert_eq!(driver.fetch_count(), 3);
    assert!(driver.pending_fetches().is_empty());
    assert!(matches!(last_status(&driver), LoadStatus::Failed { .. }));
    assert!(matches!(
        driver.errors(),
        [(_, SyncError::RetriesExhausted { attempts: 3, .. })]
    ));

    driver.dispatch(SyncEvent::LoadOlder).unwrap();
    assert_eq!(driver.fetch_count(), 3);

    driver.dispatch(SyncEvent::RetryLoad).unwrap();
    assert_eq!(driver.fetch_count(), 4);
    driver.respond_fetches();
    assert_eq!(driver.visible().len(), 3);
}

#[test]
fn optimistic_send_is_replaced_by_its_echo() {
    let mut driver = driver();
    seed(&driver, "r1", 2);
    open_loaded(&mut driver, "r1");

    driver.send("hello").unwrap();
    let temp = driver.visible().last().cloned().unwrap();
    assert!(temp.is_temp);
    assert_eq!(temp.content, "hello");
    assert_eq!(driver.published().len(), 1);

    driver.deliver();
    let confirmed = driver.visible().last().cloned().unwrap();
    assert!(!confirmed.is_temp);
    assert!(confirmed.id.is_some());
    assert_eq!(driver.visible().len(), 3);
}

#[test]
fn echo_without_temp_id_reconciles_by_content() {
    let mut driver = driver();
    driver.server().lock().set_echo_temp_ids(false);
    open_loaded(&mut driver, "r1");

    driver.send("hello").unwrap();
    driver.deliver();

    assert_eq!(driver.visible().len(), 1);
    assert!(!driver.visible()[0].is_temp);
}

#[test]
fn duplicate_send_within_debounce_is_suppressed() {
    let mut driver = driver();
    open_loaded(&mut driver, "r1");

    driver.send("hello").unwrap();
    assert_eq!(driver.send("hello"), Err(SyncError::Debounced));
    assert_eq!(driver.published().len(), 1);
}

#[test]
fn send_while_disconnected_is_rejected() {
    let mut driver = driver();
    open_loaded(&mut driver, "r1");
    driver.set_connected(false);

    assert_eq!(driver.send("hello"), Err(SyncError::NotConnected));
    assert!(driver.visible().is_empty());
}

#[test]
fn refused_publish_can_be_resent() {
    let mut driver = driver();
    open_loaded(&mut driver, "r1");

    driver.refuse_sends(true);
    driver.send("hello").unwrap();
    let failed = driver.visible()[0].clone();
    assert!(failed.send_failed);
    assert!(matches!(driver.errors(), [(_, SyncError::SendRejected { .. })]));

    driver.refuse_sends(false);
    let temp_id = failed.temp_id.unwrap();
    driver.dispatch(SyncEvent::Resend { temp_id }).unwrap();
    driver.deliver();

    assert_eq!(driver.visible().len(), 1);
    assert!(!driver.visible()[0].is_temp);
    assert!(!driver.visible()[0].send_failed);
}

#[test]
fn pushes_during_transition_arrive_through_history() {
    let mut driver = driver();
    select(&mut driver, "r1");
    driver.post("r1", "bob", "early");
    driver.deliver();
    assert!(driver.visible().is_empty());

    driver.respond_fetches();
    driver.advance(DEFAULT_SETTLE_DELAY);
    assert_eq!(driver.visible().len(), 1);

    driver.post("r1", "bob", "late");
    driver.deliver();
    assert_eq!(driver.visible().len(), 2);
}

#[test]
fn pushes_for_other_rooms_are_ignored() {
    let mut driver = driver();
    open_loaded(&mut driver, "r1");

    driver.post("r2", "bob", "elsewhere");
    assert_eq!(driver.deliver(), 0);
    assert!(driver.visible().is_empty());
}

#[test]
fn incoming_messages_mark_read_at_most_once_per_throttle_window() {
    let mut driver = driver();
    seed(&driver, "r1", 2);
    open_loaded(&mut driver, "r1");
    driver.advance(DEFAULT_MARK_READ_DELAY);
    assert_eq!(driver.complete_mark_reads(true), 1);
    driver.deliver();

    driver.post("r1", "bob", "one");
    driver.deliver();
    assert_eq!(driver.pending_mark_reads(), 0);

    driver.advance(Duration::from_secs(3));
    driver.post("r1", "bob", "two");
    driver.deliver();
    assert_eq!(driver.pending_mark_reads(), 1);
}

#[test]
fn pending_mark_read_in_one_room_does_not_block_the_next_room() {
    let mut driver = driver();
    seed(&driver, "a", 2);
    seed(&driver, "b", 2);

    open_loaded(&mut driver, "a");
    driver.advance(DEFAULT_MARK_READ_DELAY);
    assert_eq!(driver.pending_mark_reads(), 1);

    open_loaded(&mut driver, "b");
    driver.advance(DEFAULT_MARK_READ_DELAY);
    assert_eq!(driver.pending_mark_reads(), 2);

    assert_eq!(driver.complete_mark_reads(true), 2);
    driver.advance(Duration::from_secs(10));

    let me = UserId::from("me");
    let calls = driver.server().lock().read_calls().to_vec();
    assert_eq!(calls, vec![(me.clone(), RoomId::from("a")), (me, RoomId::from("b"))]);
}

#[test]
fn failed_mark_read_clears_the_throttle() {
    let mut driver = driver();
    open_loaded(&mut driver, "r1");

    driver.dispatch(SyncEvent::MarkRead).unwrap();
    driver.complete_mark_reads(false);
    driver.dispatch(SyncEvent::MarkRead).unwrap();

    assert_eq!(driver.pending_mark_reads(), 1);
}

#[test]
fn delete_and_edit_apply_when_the_server_confirms() {
    let mut driver = driver();
    seed(&driver, "r1", 2);
    open_loaded(&mut driver, "r1");
    let first = driver.visible()[0].id.clone().unwrap();
    let second = driver.visible()[1].id.clone().unwrap();

    driver.dispatch(SyncEvent::DeleteMessage { id: first }).unwrap();
    driver.dispatch(SyncEvent::EditMessage { id: second, content: "fixed".into() }).unwrap();
    assert!(!driver.visible()[0].deleted);

    driver.deliver();
    assert!(driver.visible()[0].deleted);
    assert_eq!(driver.visible()[1].content, "fixed");
    assert!(driver.visible()[1].edited);
}

#[test]
fn leaving_the_active_room_clears_the_view() {
    let mut driver = driver();
    seed(&driver, "r1", 2);
    open_loaded(&mut driver, "r1");

    driver.dispatch(SyncEvent::LeaveRoom { room_id: RoomId::from("r1") }).unwrap();

    assert_eq!(driver.engine().active_room(), None);
    assert_eq!(driver.subscription(), None);
    assert!(driver.visible().is_empty());
    assert!(driver.engine().cached_state(&RoomId::from("r1")).is_none());
}

#[test]
fn reconnect_resubscribes_the_active_room() {
    let mut driver = driver();
    open_loaded(&mut driver, "r1");

    driver.set_connected(false);
    driver.set_connected(true);

    assert_eq!(driver.subscription(), Some("/topic/rooms/r1"));
}
