//! Collaborator traits.
//!
//! The runtime is written against these traits so production code can plug in
//! a STOMP/WebSocket client and a REST client, and tests can plug in the
//! in-memory simulation from `roomsync-harness`.

use std::sync::Arc;

use async_trait::async_trait;
use roomsync_core::{Envelope, RawMessage, RoomId, UserId};
use tokio_util::sync::CancellationToken;

use crate::error::FetchError;

/// Connection state change reported by the transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionSignal {
    /// Connected or reconnected.
    Connected,
    /// Connection lost.
    Disconnected,
    /// Connection failed; treated as disconnected.
    Error(String),
}

/// Callback receiving connection signals.
pub type SignalHandler = Arc<dyn Fn(ConnectionSignal) + Send + Sync>;

/// Callback receiving envelopes pushed on a subscribed topic.
pub type EnvelopeHandler = Arc<dyn Fn(Envelope) + Send + Sync>;

/// Proof of an active subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionHandle {
    /// Subscribed topic.
    pub topic: String,
    /// Transport-assigned subscription id.
    pub id: u64,
}

/// Publish/subscribe transport.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Open the connection. Later state changes go to `on_signal`.
    async fn connect(&self, on_signal: SignalHandler) -> Result<(), FetchError>;

    /// Route envelopes on `topic` to `handler`. `None` when the transport
    /// cannot subscribe right now (e.g. disconnected).
    async fn subscribe(&self, topic: &str, handler: EnvelopeHandler) -> Option<SubscriptionHandle>;

    /// Drop the subscription for `topic`.
    async fn unsubscribe(&self, topic: &str);

    /// Publish an envelope. `false` when the transport refused to dispatch it.
    async fn send(&self, destination: &str, envelope: &Envelope) -> bool;
}

/// One page of history.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistoryPage {
    /// Raw messages, any order.
    pub items: Vec<RawMessage>,
}

/// Paginated history API.
#[async_trait]
pub trait HistoryFetcher: Send + Sync + 'static {
    /// Fetch page `page` (0 is newest) of `size` messages. Implementations
    /// should stop early and return [`FetchError::Cancelled`] once `cancel`
    /// fires.
    async fn fetch_page(
        &self,
        room_id: &RoomId,
        page: u32,
        size: u32,
        cancel: CancellationToken,
    ) -> Result<HistoryPage, FetchError>;
}

/// Mark-read API response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MarkReadResponse {
    /// Server accepted the call.
    pub success: bool,
}

/// Read-receipt API.
#[async_trait]
pub trait ReadReceiptApi: Send + Sync + 'static {
    /// Record that `user_id` has read `room_id`.
    async fn mark_read(
        &self,
        user_id: &UserId,
        room_id: &RoomId,
    ) -> Result<MarkReadResponse, FetchError>;
}
