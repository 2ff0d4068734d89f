//! Roomsync core
//!
//! Sans-IO state machines that keep a chat room's visible message list
//! correct while messages arrive from paginated history, live push events and
//! local optimistic sends.
//!
//! # Architecture
//!
//! The engine receives events ([`SyncEvent`]), processes them through pure
//! state machine logic, and returns actions ([`SyncAction`]) for the caller to
//! execute. Time comes from an [`Environment`] so the same code runs against a
//! real clock in production and a virtual clock in simulation.
//!
//! # Components
//!
//! - [`normalize`]: raw wire/REST message to canonical [`Message`]
//! - [`RoomSyncState`]: per-room identity set, ordered list and merge rules
//! - [`LoadState`] and [`OperationQueue`]: pagination, watchdog and retry
//! - [`RoomSession`]: room transitions, per-room cache, subscription tracking
//! - [`receipts`]: read-receipt merging and read status presentation
//! - [`SyncEngine`]: composition of the above behind one `handle` entry point

#![forbid(unsafe_code)]
#![deny(missing_docs)]

mod config;
mod engine;
mod env;
mod error;
mod event;
mod message;
mod normalize;
mod pagination;
pub mod receipts;
mod room;
mod session;
mod wire;

pub use config::{
    DEFAULT_MARK_READ_DELAY, DEFAULT_MAX_CACHED_ROOMS, DEFAULT_MAX_RETRIES, DEFAULT_PAGE_SIZE,
    DEFAULT_READ_THROTTLE, DEFAULT_RETRY_BACKOFF, DEFAULT_RETRY_BACKOFF_CAP, DEFAULT_SEND_DEBOUNCE,
    DEFAULT_SETTLE_DELAY, DEFAULT_TEMP_MATCH_WINDOW, DEFAULT_WATCHDOG_TIMEOUT, SyncConfig,
};
pub use engine::SyncEngine;
pub use env::Environment;
pub use error::SyncError;
pub use event::{LoadFailure, LoadStatus, SyncAction, SyncEvent};
pub use message::{Message, MessageId, MessageKind, RoomId, Timestamp, UserId};
pub use normalize::{format_sent_at, normalize, normalize_value};
pub use pagination::{FailureStep, LoadOp, LoadState, OperationQueue, RequestId, retry_delay};
pub use receipts::ReadStatus;
pub use room::{MergeOrigin, MergeReport, RoomSyncState};
pub use session::{RoomCache, RoomSession, SessionPhase, Switch};
pub use wire::{Envelope, EnvelopeAction, RawId, RawKind, RawMessage, RawTimestamp, ReadUpdate};
