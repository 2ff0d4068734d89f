//! Seeded simulation runner.
//!
//! # Usage
//!
//! ```bash
//! # 100 random scenarios of 500 steps, starting at seed 0
//! roomsync-sim --runs 100 --steps 500
//!
//! # Replay one failing seed with engine logs
//! roomsync-sim --seed 4242 --runs 1 --log-level debug
//!
//! # Aggressive timers and a tiny room cache
//! roomsync-sim --watchdog-ms 2000 --settle-ms 50 --max-cached-rooms 1
//! ```

use std::{process::ExitCode, time::Duration};

use clap::Parser;
use roomsync_core::{
    DEFAULT_MAX_CACHED_ROOMS, DEFAULT_MAX_RETRIES, DEFAULT_READ_THROTTLE, DEFAULT_SETTLE_DELAY,
    DEFAULT_TEMP_MATCH_WINDOW, DEFAULT_WATCHDOG_TIMEOUT, SyncConfig,
};
use roomsync_harness::Scenario;
use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Roomsync simulation runner
#[derive(Parser, Debug)]
#[command(name = "roomsync-sim")]
#[command(about = "Run seeded message sync scenarios and check invariants")]
#[command(version)]
struct Args {
    /// First seed
    #[arg(long, default_value = "0")]
    seed: u64,

    /// Number of consecutive seeds to run
    #[arg(long, default_value = "50")]
    runs: u64,

    /// Operations per scenario
    #[arg(long, default_value = "500")]
    steps: usize,

    /// History page size
    #[arg(long, default_value = "5")]
    page_size: u32,

    /// History fetch watchdog, in milliseconds
    #[arg(long, default_value_t = DEFAULT_WATCHDOG_TIMEOUT.as_millis() as u64)]
    watchdog_ms: u64,

    /// Attempts before a history load fails for good
    #[arg(long, default_value_t = DEFAULT_MAX_RETRIES)]
    max_retries: u32,

    /// Room transition settle delay, in milliseconds
    #[arg(long, default_value_t = DEFAULT_SETTLE_DELAY.as_millis() as u64)]
    settle_ms: u64,

    /// Minimum interval between mark-read calls per room, in milliseconds
    #[arg(long, default_value_t = DEFAULT_READ_THROTTLE.as_millis() as u64)]
    read_throttle_ms: u64,

    /// Window for matching an echo to its optimistic message, in milliseconds
    #[arg(long, default_value_t = DEFAULT_TEMP_MATCH_WINDOW.as_millis() as u64)]
    temp_window_ms: u64,

    /// Rooms kept in the session cache
    #[arg(long, default_value_t = DEFAULT_MAX_CACHED_ROOMS)]
    max_cached_rooms: usize,

    /// Log filter (e.g. `debug` for engine logs)
    #[arg(long, default_value = "warn,roomsync_sim=info")]
    log_level: String,
}

impl Args {
    fn config(&self) -> SyncConfig {
        SyncConfig::default()
            .with_page_size(self.page_size)
            .with_watchdog_timeout(Duration::from_millis(self.watchdog_ms))
            .with_max_retries(self.max_retries)
            .with_settle_delay(Duration::from_millis(self.settle_ms))
            .with_read_throttle(Duration::from_millis(self.read_throttle_ms))
            .with_temp_match_window(Duration::from_millis(self.temp_window_ms))
            .with_max_cached_rooms(self.max_cached_rooms)
    }
}

fn main() -> ExitCode {
    let args = Args::parse();
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    tracing_subscriber::registry().with(fmt::layer()).with(filter).init();

    let config = args.config();
    let mut failures = 0u64;

    for seed in args.seed..args.seed.saturating_add(args.runs) {
        match Scenario::new(seed, args.steps).with_config(config.clone()).run() {
            Ok(report) => match serde_json::to_string(&report) {
                Ok(json) => tracing::info!("{json}"),
                Err(e) => tracing::warn!("Failed to encode report: {e}"),
            },
            Err(e) => {
                failures += 1;
                tracing::error!("{e}");
            },
        }
    }

    if failures == 0 {
        tracing::info!(runs = args.runs, steps = args.steps, "all scenarios passed");
        ExitCode::SUCCESS
    } else {
        tracing::error!(failures, runs = args.runs, "scenarios failed");
        ExitCode::FAILURE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_the_engine_defaults() {
        let config = Args::parse_from(["roomsync-sim"]).config();
        let defaults = SyncConfig::default();
        assert_eq!(config.page_size, 5);
        assert_eq!(config.watchdog_timeout, defaults.watchdog_timeout);
        assert_eq!(config.max_retries, defaults.max_retries);
        assert_eq!(config.settle_delay, defaults.settle_delay);
        assert_eq!(config.read_throttle, defaults.read_throttle);
        assert_eq!(config.temp_match_window, defaults.temp_match_window);
        assert_eq!(config.max_cached_rooms, defaults.max_cached_rooms);
    }

    #[test]
    fn tunables_reach_the_config() {
        let config = Args::parse_from([
            "roomsync-sim",
            "--watchdog-ms",
            "2000",
            "--max-retries",
            "5",
            "--settle-ms",
            "50",
            "--read-throttle-ms",
            "1000",
            "--temp-window-ms",
            "4000",
            "--max-cached-rooms",
            "1",
        ])
        .config();
        assert_eq!(config.watchdog_timeout, Duration::from_secs(2));
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.settle_delay, Duration::from_millis(50));
        assert_eq!(config.read_throttle, Duration::from_secs(1));
        assert_eq!(config.temp_match_window, Duration::from_secs(4));
        assert_eq!(config.max_cached_rooms, 1);
    }
}
