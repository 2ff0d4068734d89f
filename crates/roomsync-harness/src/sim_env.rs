//! Virtual-time environment.
//!
//! `SimEnv` keeps a shared virtual clock that only moves when the harness
//! advances it, so timer-driven behavior (watchdog, backoff, throttles,
//! settle delays) replays identically on every run.

use std::{
    ops::Sub,
    sync::{
        Arc,
        atomic::{AtomicU64, Ordering},
    },
    time::Duration,
};

use roomsync_core::{Environment, Timestamp};

/// Wall-clock time at virtual time zero (2024-01-01T00:00:00Z).
pub const SIM_EPOCH: Timestamp = Timestamp(1_704_067_200_000);

/// Virtual monotonic instant: time elapsed since the simulation started.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SimInstant(Duration);

impl SimInstant {
    /// Elapsed virtual time.
    pub fn elapsed(self) -> Duration {
        self.0
    }
}

impl Sub for SimInstant {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Duration {
        self.0.saturating_sub(rhs.0)
    }
}

/// Environment with a virtual clock shared between clones.
#[derive(Debug, Clone, Default)]
pub struct SimEnv {
    micros: Arc<AtomicU64>,
}

impl SimEnv {
    /// Clock at virtual time zero.
    pub fn new() -> Self {
        Self::default()
    }

    /// Move the clock forward.
    pub fn advance(&self, by: Duration) {
        self.micros.fetch_add(by.as_micros() as u64, Ordering::SeqCst);
    }

    /// Elapsed virtual time.
    pub fn elapsed(&self) -> Duration {
        Duration::from_micros(self.micros.load(Ordering::SeqCst))
    }
}

impl Environment for SimEnv {
    type Instant = SimInstant;

    fn now(&self) -> SimInstant {
        SimInstant(self.elapsed())
    }

    fn wall_clock(&self) -> Timestamp {
        SIM_EPOCH.plus(self.elapsed())
    }

    /// Advances the virtual clock by `duration`, then yields once.
    fn sleep(&self, duration: Duration) -> impl std::future::Future<Output = ()> + Send {
        let env = self.clone();
        async move {
            tokio::task::yield_now().await;
            env.advance(duration);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clones_share_the_clock() {
        let env = SimEnv::new();
        let other = env.clone();
        let start = env.now();

        other.advance(Duration::from_millis(250));

        assert_eq!(env.now() - start, Duration::from_millis(250));
        assert_eq!(env.wall_clock(), Timestamp(SIM_EPOCH.millis() + 250));
    }

    #[test]
    fn instants_never_underflow() {
        let early = SimInstant(Duration::from_secs(1));
        let late = SimInstant(Duration::from_secs(3));
        assert_eq!(early - late, Duration::ZERO);
        assert_eq!(late - early, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn sleep_advances_virtual_time() {
        let env = SimEnv::new();
        env.sleep(Duration::from_secs(5)).await;
        assert_eq!(env.elapsed(), Duration::from_secs(5));
    }
}
