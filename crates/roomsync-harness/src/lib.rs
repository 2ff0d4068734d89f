//! Deterministic simulation harness for roomsync testing.
//!
//! Virtual-time [`SimEnv`], an in-memory [`SimServer`], a synchronous
//! [`SimDriver`] for step-by-step engine tests, and [`SimTransport`] for
//! running the async client runtime against the same server.
//!
//! # Invariant Testing
//!
//! The `invariants` module checks behavioral properties of the visible
//! message lists after every step. Use [`InvariantRegistry::standard()`] for
//! the full set, and [`Scenario`] for seeded random runs.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod invariants;
pub mod scenario;
pub mod sim_driver;
pub mod sim_env;
pub mod sim_server;
pub mod sim_transport;

pub use invariants::{
    ActiveRoomSubscribed, ChronologicalOrder, ClientSnapshot, Invariant, InvariantRegistry,
    InvariantResult, RoomIsolation, RoomSnapshot, SeenIdsCoverMessages, SinglePendingTemp,
    SystemSnapshot, UniqueMessageIds, Violation,
};
pub use scenario::{Op, Scenario, ScenarioReport, SimError};
pub use sim_driver::{PendingFetch, SimDriver};
pub use sim_env::{SIM_EPOCH, SimEnv, SimInstant};
pub use sim_server::{ServerClock, SharedSimServer, SimServer, create_shared_server};
pub use sim_transport::{FetchFault, FetchRecord, SimTransport};
