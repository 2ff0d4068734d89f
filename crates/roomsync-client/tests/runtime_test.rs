//! Runtime tests against the simulated server.
//!
//! The tokio clock is paused, so settle delays, watchdog timeouts and backoff
//! elapse instantly and deterministically.

#![allow(clippy::disallowed_types, reason = "Test observers collect under a std mutex")]

use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

use roomsync_client::{SyncHandle, SyncRuntime, SystemEnv};
use roomsync_core::{Environment, LoadStatus, RoomId, SyncConfig, SyncError, UserId};
use roomsync_harness::{FetchFault, SharedSimServer, SimServer, SimTransport};
use tokio::task::JoinHandle;

fn server() -> SharedSimServer {
    SharedSimServer::new(SimServer::new(Arc::new(|| SystemEnv.wall_clock())))
}

fn start(transport: &SimTransport) -> (SyncHandle, JoinHandle<()>) {
    SyncRuntime::spawn(SystemEnv, UserId::from("me"), SyncConfig::default(), transport.services())
}

fn setup() -> (SimTransport, SyncHandle, JoinHandle<()>) {
    let transport = SimTransport::new(server(), &SyncConfig::default());
    let (handle, task) = start(&transport);
    (transport, handle, task)
}

fn r1() -> RoomId {
    RoomId::from("r1")
}

/// Let spawned fetch and mark-read tasks report back.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

#[tokio::test(start_paused = true)]
async fn select_room_loads_history_and_notifies_observers() {
    let (transport, handle, _task) = setup();
    transport.server().lock().seed_history(&r1(), &UserId::from("bob"), 5);

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    handle
        .on_messages_changed(Box::new(move |room, messages| {
            sink.lock().unwrap().push((room.cloned(), messages.len()));
        }))
        .unwrap();

    assert!(handle.select_room(Some(r1())).await);

    let view = handle.snapshot().await.unwrap().unwrap();
    assert_eq!(view.room_id, r1());
    assert_eq!(view.messages.len(), 5);
    assert_eq!(view.status, LoadStatus::Idle);
    assert!(!view.has_more);
    assert!(!view.transitioning);
    assert_eq!(transport.subscribed_topics(), vec!["/topic/rooms/r1".to_string()]);
    assert_eq!(seen.lock().unwrap().last(), Some(&(Some(r1()), 5)));
}

#[tokio::test(start_paused = true)]
async fn superseded_selection_resolves_false() {
    let (transport, handle, _task) = setup();
    let other = handle.clone();

    let (first, second) = tokio::join!(
        handle.select_room(Some(r1())),
        other.select_room(Some(RoomId::from("r2")))
    );

    assert!(!first);
    assert!(second);
    assert_eq!(transport.subscribed_topics(), vec!["/topic/rooms/r2".to_string()]);
}

#[tokio::test(start_paused = true)]
async fn sent_message_is_confirmed_by_the_echo() {
    let (transport, handle, _task) = setup();
    assert!(handle.select_room(Some(r1())).await);

    assert!(handle.send_message("hello", None).await);

    let view = handle.snapshot().await.unwrap().unwrap();
    assert_eq!(view.messages.len(), 1);
    assert!(!view.messages[0].is_temp);
    assert!(view.messages[0].is_me);
    assert_eq!(transport.published().len(), 1);
    assert_eq!(transport.server().lock().history(&r1()).len(), 1);
}

#[tokio::test(start_paused = true)]
async fn send_is_rejected_while_disconnected() {
    let (transport, handle, _task) = setup();
    assert!(handle.select_room(Some(r1())).await);

    transport.set_connected(false);
    assert!(!handle.send_message("hello", None).await);

    let view = handle.snapshot().await.unwrap().unwrap();
    assert!(view.messages.is_empty());
    assert!(!view.connected);
}

#[tokio::test(start_paused = true)]
async fn refused_publish_is_reported_and_kept_for_resend() {
    let (transport, handle, _task) = setup();
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    handle
        .on_room_sync_error(Box::new(move |_, error| sink.lock().unwrap().push(error.clone())))
        .unwrap();
    assert!(handle.select_room(Some(r1())).await);

    transport.refuse_sends(true);
    assert!(handle.send_message("hello", None).await);

    let view = handle.snapshot().await.unwrap().unwrap();
    assert!(view.messages[0].send_failed);
    assert!(errors.lock().unwrap().iter().any(|e| matches!(e, SyncError::SendRejected { .. })));

    transport.refuse_sends(false);
    tokio::time::sleep(Duration::from_secs(1)).await;
    let temp_id = view.messages[0].temp_id.clone().unwrap();
    assert!(handle.resend(temp_id).await);

    let view = handle.snapshot().await.unwrap().unwrap();
    assert!(!view.messages[0].is_temp);
}

#[tokio::test(start_paused = true)]
async fn hanging_fetches_exhaust_retries_then_manual_retry_loads() {
    let (transport, handle, _task) = setup();
    transport.server().lock().seed_history(&r1(), &UserId::from("bob"), 3);
    for _ in 0..3 {
        transport.script_fetch(FetchFault::Hang);
    }
    let errors = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&errors);
    handle
        .on_room_sync_error(Box::new(move |room, error| {
            sink.lock().unwrap().push((room.clone(), error.clone()));
        }))
        .unwrap();

    assert!(handle.select_room(Some(r1())).await);
    tokio::time::sleep(Duration::from_secs(31)).await;

    let view = handle.snapshot().await.unwrap().unwrap();
    assert!(matches!(view.status, LoadStatus::Failed { .. }));
    assert_eq!(transport.fetches().len(), 3);
    assert!(
        errors
            .lock()
            .unwrap()
            .iter()
            .any(|(room, e)| *room == r1() && matches!(e, SyncError::RetriesExhausted { .. }))
    );

    handle.retry_load().await.unwrap();
    settle().await;

    let view = handle.snapshot().await.unwrap().unwrap();
    assert_eq!(view.status, LoadStatus::Idle);
    assert_eq!(view.messages.len(), 3);
}

#[tokio::test(start_paused = true)]
async fn failed_fetch_is_retried_with_backoff() {
    let (transport, handle, _task) = setup();
    transport.server().lock().seed_history(&r1(), &UserId::from("bob"), 2);
    transport.script_fetch(FetchFault::Fail(roomsync_client::FetchError::Network("reset".into())));

    assert!(handle.select_room(Some(r1())).await);
    tokio::time::sleep(Duration::from_secs(1)).await;

    let view = handle.snapshot().await.unwrap().unwrap();
    assert_eq!(view.messages.len(), 2);
    assert_eq!(transport.fetches().len(), 2);
}

#[tokio::test(start_paused = true)]
async fn incoming_message_triggers_mark_read() {
    let (transport, handle, _task) = setup();
    assert!(handle.select_room(Some(r1())).await);

    transport.post(&r1(), &UserId::from("bob"), "hi");
    tokio::time::sleep(Duration::from_secs(1)).await;

    let view = handle.snapshot().await.unwrap().unwrap();
    assert_eq!(view.messages.len(), 1);
    let calls = transport.server().lock().read_calls().to_vec();
    assert!(!calls.is_empty());
    assert!(calls.iter().all(|call| *call == (UserId::from("me"), r1())));
}

#[tokio::test(start_paused = true)]
async fn shutdown_stops_the_runtime() {
    let (_transport, handle, task) = setup();

    handle.shutdown();
    task.await.unwrap();

    assert!(!handle.is_running());
    assert!(!handle.select_room(Some(r1())).await);
    assert_eq!(handle.load_older_messages().await, Err(roomsync_client::RuntimeError::Stopped));
}

#[tokio::test(start_paused = true)]
async fn dropping_every_handle_stops_the_runtime() {
    let (transport, handle, task) = setup();
    assert!(handle.select_room(Some(r1())).await);
    let other = handle.clone();

    drop(handle);
    drop(other);

    let finished = tokio::time::timeout(Duration::from_secs(7200), task).await;
    assert!(finished.is_ok());
    assert!(transport.subscribed_topics().is_empty());
}
