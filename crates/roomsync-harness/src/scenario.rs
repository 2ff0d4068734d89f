//! Seeded random scenarios.
//!
//! A scenario drives one [`SimDriver`] through a random but reproducible mix
//! of user intents, server responses, pushes, failures and clock advances,
//! checking every standard invariant after each step. The same seed always
//! produces the same run.

use std::time::Duration;

use rand::{Rng, SeedableRng, seq::SliceRandom};
use rand_chacha::ChaCha8Rng;
use roomsync_core::{RoomId, SyncConfig, SyncEvent, UserId};
use serde::Serialize;
use thiserror::Error;

use crate::{
    invariants::{InvariantRegistry, Violation},
    sim_driver::SimDriver,
};

const ROOMS: [&str; 3] = ["general", "random", "ops"];
const PEERS: [&str; 2] = ["bob", "carol"];
const LINES: [&str; 4] = ["hi", "hello", "on my way", "ok"];

/// Scenario failure.
#[derive(Error, Debug)]
pub enum SimError {
    /// An invariant did not hold after a step.
    #[error("seed {seed} step {step} ({op:?}): {}", format_violations(.violations))]
    InvariantViolated {
        /// Scenario seed.
        seed: u64,
        /// Step index.
        step: usize,
        /// Operation applied at that step.
        op: Op,
        /// Every violation found.
        violations: Vec<Violation>,
    },
}

fn format_violations(violations: &[Violation]) -> String {
    violations.iter().map(ToString::to_string).collect::<Vec<_>>().join("; ")
}

/// One scenario step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum Op {
    /// Select a room (or leave with `None`).
    Select(Option<&'static str>),
    /// Request older history.
    LoadOlder,
    /// Manual retry.
    Retry,
    /// Send a message.
    Send(&'static str),
    /// Resend the first failed message.
    Resend,
    /// Mark the active room read.
    MarkRead,
    /// Another user posts.
    Post {
        /// Room.
        room: &'static str,
        /// Author.
        sender: &'static str,
        /// Content.
        content: &'static str,
    },
    /// Deliver queued pushes.
    Deliver,
    /// Answer pending fetches.
    RespondFetches,
    /// Fail pending fetches.
    FailFetches,
    /// Complete pending mark-read calls.
    CompleteMarkReads(bool),
    /// Toggle the connection.
    SetConnected(bool),
    /// Toggle publish refusal.
    RefuseSends(bool),
    /// Advance the clock.
    Advance(u64),
}

/// Summary of a finished scenario.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScenarioReport {
    /// Scenario seed.
    pub seed: u64,
    /// Steps applied.
    pub steps: usize,
    /// Fetches the engine issued.
    pub fetches: usize,
    /// Publishes the server accepted.
    pub published: usize,
    /// Errors reported to the user.
    pub errors: usize,
    /// Visible messages at the end.
    pub visible: usize,
    /// Virtual time elapsed, in milliseconds.
    pub elapsed_ms: u64,
}

/// Seeded scenario generator and runner.
#[derive(Debug)]
pub struct Scenario {
    seed: u64,
    steps: usize,
    config: SyncConfig,
}

impl Scenario {
    /// Scenario of `steps` operations from `seed`.
    pub fn new(seed: u64, steps: usize) -> Self {
        Self { seed, steps, config: SyncConfig::default().with_page_size(5) }
    }

    /// Use a custom engine configuration.
    #[must_use]
    pub fn with_config(mut self, config: SyncConfig) -> Self {
        self.config = config;
        self
    }

    /// Generate the operation sequence without running it.
    pub fn ops(&self) -> Vec<Op> {
        let mut rng = ChaCha8Rng::seed_from_u64(self.seed);
        (0..self.steps).map(|_| random_op(&mut rng)).collect()
    }

    /// Run the scenario, stopping at the first invariant violation.
    pub fn run(&self) -> Result<ScenarioReport, SimError> {
        let mut driver = SimDriver::new("me", self.config.clone());
        {
            let mut server = driver.server().lock();
            for (i, room) in ROOMS.iter().enumerate() {
                server.seed_history(&RoomId::from(*room), &UserId::from(PEERS[i % 2]), 12);
            }
        }

        let registry = InvariantRegistry::standard();
        let ops = self.ops();
        for (step, op) in ops.iter().enumerate() {
            apply(&mut driver, op);
            if let Err(violations) = registry.check_all(&driver.snapshot()) {
                return Err(SimError::InvariantViolated {
                    seed: self.seed,
                    step,
                    op: op.clone(),
                    violations,
                });
            }
        }

        tracing::debug!(seed = self.seed, steps = ops.len(), "scenario passed");
        Ok(ScenarioReport {
            seed: self.seed,
            steps: ops.len(),
            fetches: driver.fetch_count(),
            published: driver.published().len(),
            errors: driver.errors().len(),
            visible: driver.visible().len(),
            elapsed_ms: driver.env().elapsed().as_millis() as u64,
        })
    }
}

fn random_op(rng: &mut ChaCha8Rng) -> Op {
    let pick = |rng: &mut ChaCha8Rng, items: &[&'static str]| -> &'static str {
        items.choose(rng).copied().unwrap_or_default()
    };

    match rng.gen_range(0..100) {
        0..10 => Op::Select(if rng.gen_bool(0.9) { Some(pick(rng, &ROOMS)) } else { None }),
        10..18 => Op::LoadOlder,
        18..21 => Op::Retry,
        21..31 => Op::Send(pick(rng, &LINES)),
        31..33 => Op::Resend,
        33..37 => Op::MarkRead,
        37..47 => Op::Post {
            room: pick(rng, &ROOMS),
            sender: pick(rng, &PEERS),
            content: pick(rng, &LINES),
        },
        47..59 => Op::Deliver,
        59..71 => Op::RespondFetches,
        71..75 => Op::FailFetches,
        75..79 => Op::CompleteMarkReads(rng.gen_bool(0.8)),
        79..82 => Op::SetConnected(rng.gen_bool(0.7)),
        82..84 => Op::RefuseSends(rng.gen_bool(0.3)),
        _ => Op::Advance(rng.gen_range(50..12_000)),
    }
}

/// Apply one operation. Engine rejections are part of normal behavior and
/// are ignored here; invariants judge the outcome.
pub fn apply(driver: &mut SimDriver, op: &Op) {
    match op {
        Op::Select(room) => {
            let room_id = room.map(RoomId::from);
            let _ = driver.dispatch(SyncEvent::SelectRoom { room_id });
        },
        Op::LoadOlder => {
            let _ = driver.dispatch(SyncEvent::LoadOlder);
        },
        Op::Retry => {
            let _ = driver.dispatch(SyncEvent::RetryLoad);
        },
        Op::Send(content) => {
            let _ = driver.send(content);
        },
        Op::Resend => {
            let failed = driver
                .engine()
                .active_state()
                .and_then(|s| s.messages.iter().find(|m| m.send_failed))
                .and_then(|m| m.temp_id.clone());
            if let Some(temp_id) = failed {
                let _ = driver.dispatch(SyncEvent::Resend { temp_id });
            }
        },
        Op::MarkRead => {
            let _ = driver.dispatch(SyncEvent::MarkRead);
        },
        Op::Post { room, sender, content } => driver.post(room, sender, content),
        Op::Deliver => {
            driver.deliver();
        },
        Op::RespondFetches => {
            driver.respond_fetches();
        },
        Op::FailFetches => {
            driver.fail_fetches("connection reset");
        },
        Op::CompleteMarkReads(success) => {
            driver.complete_mark_reads(*success);
        },
        Op::SetConnected(connected) => driver.set_connected(*connected),
        Op::RefuseSends(refuse) => driver.refuse_sends(*refuse),
        Op::Advance(ms) => driver.advance(Duration::from_millis(*ms)),
    }
}
