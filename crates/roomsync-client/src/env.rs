//! Production environment.

use std::time::Duration;

use roomsync_core::{Environment, Timestamp};

/// Environment backed by the tokio clock and the system wall clock.
///
/// Uses [`tokio::time::Instant`] so a runtime with a paused clock (tests)
/// sees consistent monotonic time in both the engine and the timers.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemEnv;

impl Environment for SystemEnv {
    type Instant = tokio::time::Instant;

    fn now(&self) -> Self::Instant {
        tokio::time::Instant::now()
    }

    fn wall_clock(&self) -> Timestamp {
        Timestamp(chrono::Utc::now().timestamp_millis())
    }

    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        tokio::time::sleep(duration)
    }
}
