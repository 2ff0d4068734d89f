//! Environment abstraction for deterministic testing.
//!
//! Decouples sync logic from system resources (monotonic time, wall-clock
//! time). Enables deterministic simulation with a virtual clock and production
//! use with the real system clock.

use std::{fmt, time::Duration};

use crate::message::Timestamp;

/// Abstract environment providing time and async sleeping.
///
/// # Invariants
///
/// Implementations MUST guarantee:
///
/// - `now()` never goes backwards
/// - `wall_clock()` is only used for message timestamps, never for timers
pub trait Environment: Clone + Send + Sync + 'static {
    /// The specific instant type used by this environment.
    ///
    /// Production environments use a real monotonic instant, while simulation
    /// environments use virtual time.
    type Instant: Copy + Ord + Send + Sync + fmt::Debug + std::ops::Sub<Output = Duration> + 'static;

    /// Current time (monotonic).
    ///
    /// # Invariants
    ///
    /// - This method MUST return values that never decrease within a single
    ///   execution context.
    fn now(&self) -> Self::Instant;

    /// Current wall-clock time in milliseconds since the Unix epoch.
    ///
    /// Used to stamp optimistic messages and to fill missing `sent_at` values.
    fn wall_clock(&self) -> Timestamp;

    /// Sleeps for the specified duration.
    ///
    /// This is the ONLY async method in the trait, and it should only be used
    /// by driver code (not sync logic).
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send;
}
