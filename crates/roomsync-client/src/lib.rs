//! Roomsync client runtime
//!
//! Drives a [`roomsync_core::SyncEngine`] against the outside world. One task
//! owns the engine; the UI talks to it through a cloneable [`SyncHandle`], and
//! the collaborators ([`Transport`], [`HistoryFetcher`], [`ReadReceiptApi`])
//! report back through the same command channel, so sync state is never
//! shared or locked.
//!
//! # Usage
//!
//! ```ignore
//! let services = Services { transport, history, receipts };
//! let (handle, task) = SyncRuntime::spawn(SystemEnv, user_id, SyncConfig::default(), services);
//! handle.on_messages_changed(|room, messages| render(room, messages)).await?;
//! handle.select_room(Some(room_id)).await;
//! ```

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod env;
mod error;
mod handle;
mod observer;
mod runtime;
mod transport;

pub use env::SystemEnv;
pub use error::{FetchError, RuntimeError};
pub use handle::{RoomView, SyncHandle};
pub use observer::{ErrorObserver, LoadStateObserver, MessagesObserver, Observers};
pub use runtime::{Services, SyncRuntime};
pub use transport::{
    ConnectionSignal, EnvelopeHandler, HistoryFetcher, HistoryPage, MarkReadResponse,
    ReadReceiptApi, SignalHandler, SubscriptionHandle, Transport,
};
