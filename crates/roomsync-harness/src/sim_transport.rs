//! Simulated collaborators for the client runtime.
//!
//! `SimTransport` implements [`Transport`], [`HistoryFetcher`] and
//! [`ReadReceiptApi`] on top of a [`SharedSimServer`]. Tests script faults
//! (failed, slow or hanging fetches, refused publishes, dropped connections)
//! and inspect what the client sent.

#![allow(clippy::disallowed_types, reason = "Synchronous locking operations only")]

use std::{
    collections::{BTreeMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use roomsync_client::{
    ConnectionSignal, EnvelopeHandler, FetchError, HistoryFetcher, HistoryPage, MarkReadResponse,
    ReadReceiptApi, Services, SignalHandler, SubscriptionHandle, Transport,
};
use roomsync_core::{Envelope, RoomId, SyncConfig, UserId};
use tokio_util::sync::CancellationToken;

use crate::sim_server::SharedSimServer;

/// Scripted outcome for the next history fetch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchFault {
    /// Fail immediately with this error.
    Fail(FetchError),
    /// Never answer; only cancellation ends the call.
    Hang,
    /// Answer normally after this extra delay.
    Delay(Duration),
}

/// A fetch the client issued.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchRecord {
    /// Requested room.
    pub room_id: RoomId,
    /// Requested page.
    pub page: u32,
    /// Requested page size.
    pub size: u32,
}

#[derive(Default)]
struct TransportState {
    connected: bool,
    refuse_sends: bool,
    fail_mark_reads: bool,
    on_signal: Option<SignalHandler>,
    subscriptions: BTreeMap<String, (u64, EnvelopeHandler)>,
    next_subscription: u64,
    published: Vec<(String, Envelope)>,
    fetches: Vec<FetchRecord>,
    faults: VecDeque<FetchFault>,
    latency: Duration,
}

/// In-memory transport, history API and read-receipt API.
#[derive(Clone)]
pub struct SimTransport {
    server: SharedSimServer,
    state: Arc<Mutex<TransportState>>,
    topic_prefix: String,
    destination_prefix: String,
}

impl std::fmt::Debug for SimTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimTransport")
            .field("topic_prefix", &self.topic_prefix)
            .field("destination_prefix", &self.destination_prefix)
            .finish_non_exhaustive()
    }
}

impl SimTransport {
    /// Transport routing topics and destinations the way `config` names them.
    pub fn new(server: SharedSimServer, config: &SyncConfig) -> Self {
        Self {
            server,
            state: Arc::new(Mutex::new(TransportState::default())),
            topic_prefix: config.topic_prefix.clone(),
            destination_prefix: config.destination_prefix.clone(),
        }
    }

    /// Runtime services backed by this transport.
    pub fn services(&self) -> Services {
        Services {
            transport: Arc::new(self.clone()),
            history: Arc::new(self.clone()),
            receipts: Arc::new(self.clone()),
        }
    }

    /// Backing server.
    pub fn server(&self) -> &SharedSimServer {
        &self.server
    }

    /// Drop or restore the connection, notifying the client.
    pub fn set_connected(&self, connected: bool) {
        let handler = {
            let mut state = self.lock();
            state.connected = connected;
            state.on_signal.clone()
        };
        if let Some(on_signal) = handler {
            let signal =
                if connected { ConnectionSignal::Connected } else { ConnectionSignal::Disconnected };
            on_signal(signal);
        }
    }

    /// Refuse every publish while set.
    pub fn refuse_sends(&self, refuse: bool) {
        self.lock().refuse_sends = refuse;
    }

    /// Fail every mark-read call while set.
    pub fn fail_mark_reads(&self, fail: bool) {
        self.lock().fail_mark_reads = fail;
    }

    /// Queue a fault for the next unscripted fetch.
    pub fn script_fetch(&self, fault: FetchFault) {
        self.lock().faults.push_back(fault);
    }

    /// Latency added to every fetch.
    pub fn set_latency(&self, latency: Duration) {
        self.lock().latency = latency;
    }

    /// Fetches issued so far.
    pub fn fetches(&self) -> Vec<FetchRecord> {
        self.lock().fetches.clone()
    }

    /// Publishes accepted so far, with their destinations.
    pub fn published(&self) -> Vec<(String, Envelope)> {
        self.lock().published.clone()
    }

    /// Topics with an active subscription.
    pub fn subscribed_topics(&self) -> Vec<String> {
        self.lock().subscriptions.keys().cloned().collect()
    }

    /// Post a message from another user and broadcast it.
    pub fn post(&self, room_id: &RoomId, sender: &UserId, content: &str) {
        let envelope = self.server.lock().post(room_id, sender, content);
        self.broadcast(room_id, envelope);
    }

    /// Deliver `envelope` to subscribers of `room_id`'s topic.
    pub fn broadcast(&self, room_id: &RoomId, envelope: Envelope) {
        let topic = format!("{}{}", self.topic_prefix, room_id);
        let handler = self.lock().subscriptions.get(&topic).map(|(_, h)| Arc::clone(h));
        match handler {
            Some(handler) => handler(envelope),
            None => tracing::trace!(%topic, "broadcast without subscriber"),
        }
    }

    fn lock(&self) -> MutexGuard<'_, TransportState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl Transport for SimTransport {
    async fn connect(&self, on_signal: SignalHandler) -> Result<(), FetchError> {
        {
            let mut state = self.lock();
            state.on_signal = Some(Arc::clone(&on_signal));
            state.connected = true;
        }
        on_signal(ConnectionSignal::Connected);
        Ok(())
    }

    async fn subscribe(&self, topic: &str, handler: EnvelopeHandler) -> Option<SubscriptionHandle> {
        let mut state = self.lock();
        if !state.connected {
            return None;
        }
        state.next_subscription += 1;
        let id = state.next_subscription;
        state.subscriptions.insert(topic.to_string(), (id, handler));
        Some(SubscriptionHandle { topic: topic.to_string(), id })
    }

    async fn unsubscribe(&self, topic: &str) {
        self.lock().subscriptions.remove(topic);
    }

    async fn send(&self, destination: &str, envelope: &Envelope) -> bool {
        {
            let mut state = self.lock();
            if !state.connected || state.refuse_sends {
                return false;
            }
            state.published.push((destination.to_string(), envelope.clone()));
        }

        let Some(room) = destination.strip_prefix(&self.destination_prefix) else {
            tracing::warn!(destination, "publish to unknown destination");
            return true;
        };
        let room_id = RoomId::from(room);
        let broadcast = self.server.lock().publish(&room_id, envelope);
        if let Some(broadcast) = broadcast {
            self.broadcast(&room_id, broadcast);
        }
        true
    }
}

#[async_trait]
impl HistoryFetcher for SimTransport {
    async fn fetch_page(
        &self,
        room_id: &RoomId,
        page: u32,
        size: u32,
        cancel: CancellationToken,
    ) -> Result<HistoryPage, FetchError> {
        let (fault, latency) = {
            let mut state = self.lock();
            state.fetches.push(FetchRecord { room_id: room_id.clone(), page, size });
            (state.faults.pop_front(), state.latency)
        };

        let delay = match fault {
            Some(FetchFault::Fail(e)) => return Err(e),
            Some(FetchFault::Hang) => {
                cancel.cancelled().await;
                return Err(FetchError::Cancelled);
            },
            Some(FetchFault::Delay(extra)) => latency + extra,
            None => latency,
        };

        if !delay.is_zero() {
            tokio::select! {
                () = tokio::time::sleep(delay) => {},
                () = cancel.cancelled() => return Err(FetchError::Cancelled),
            }
        }

        Ok(HistoryPage { items: self.server.lock().page(room_id, page, size) })
    }
}

#[async_trait]
impl ReadReceiptApi for SimTransport {
    async fn mark_read(
        &self,
        user_id: &UserId,
        room_id: &RoomId,
    ) -> Result<MarkReadResponse, FetchError> {
        if self.lock().fail_mark_reads {
            return Err(FetchError::Status { status: 503 });
        }
        let envelope = self.server.lock().mark_read(user_id, room_id);
        self.broadcast(room_id, envelope);
        Ok(MarkReadResponse { success: true })
    }
}

#[cfg(test)]
mod tests {
    use roomsync_core::{EnvelopeAction, RawMessage};

    use super::*;
    use crate::sim_server::SimServer;

    fn transport() -> SimTransport {
        SimTransport::new(SharedSimServer::new(SimServer::default()), &SyncConfig::default())
    }

    #[tokio::test]
    async fn refuses_sends_until_connected() {
        let transport = transport();
        let envelope = Envelope::message(EnvelopeAction::Send, &RawMessage::default());
        assert!(!transport.send("/app/rooms/r1", &envelope).await);

        transport.connect(Arc::new(|_| {})).await.unwrap();
        assert!(transport.send("/app/rooms/r1", &envelope).await);
        assert_eq!(transport.published().len(), 1);
    }

    #[tokio::test]
    async fn scripted_failure_is_returned_once() {
        let transport = transport();
        transport.script_fetch(FetchFault::Fail(FetchError::Status { status: 500 }));
        let room = RoomId::from("r1");

        let first = transport.fetch_page(&room, 0, 20, CancellationToken::new()).await;
        let second = transport.fetch_page(&room, 0, 20, CancellationToken::new()).await;

        assert_eq!(first, Err(FetchError::Status { status: 500 }));
        assert!(second.is_ok());
        assert_eq!(transport.fetches().len(), 2);
    }

    #[tokio::test]
    async fn hanging_fetch_ends_on_cancel() {
        let transport = transport();
        transport.script_fetch(FetchFault::Hang);
        let token = CancellationToken::new();
        token.cancel();

        let result = transport.fetch_page(&RoomId::from("r1"), 0, 20, token).await;
        assert_eq!(result, Err(FetchError::Cancelled));
    }
}
