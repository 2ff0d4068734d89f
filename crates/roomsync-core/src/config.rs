//! Sync engine configuration.

use std::time::Duration;

/// Number of messages requested per history page.
pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// Time a history fetch may take before the watchdog fires.
pub const DEFAULT_WATCHDOG_TIMEOUT: Duration = Duration::from_secs(10);

/// Consecutive failed attempts before a load becomes terminal.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// First backoff step after a failed fetch. Doubles per attempt.
pub const DEFAULT_RETRY_BACKOFF: Duration = Duration::from_millis(500);

/// Upper bound for the retry backoff.
pub const DEFAULT_RETRY_BACKOFF_CAP: Duration = Duration::from_secs(5);

/// Minimum spacing between two mark-read posts for the same room.
pub const DEFAULT_READ_THROTTLE: Duration = Duration::from_secs(3);

/// Time a room transition stays in `Transitioning` before becoming active.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(300);

/// Delay between a successful first page and the automatic mark-read.
pub const DEFAULT_MARK_READ_DELAY: Duration = Duration::from_millis(800);

/// Identical sends closer together than this are dropped.
pub const DEFAULT_SEND_DEBOUNCE: Duration = Duration::from_millis(500);

/// Maximum `sent_at` distance between a temp message and its confirmation.
pub const DEFAULT_TEMP_MATCH_WINDOW: Duration = Duration::from_secs(10);

/// Number of rooms whose sync state is kept after navigating away.
pub const DEFAULT_MAX_CACHED_ROOMS: usize = 32;

/// Sync engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncConfig {
    /// Messages per history page.
    pub page_size: u32,
    /// History fetch watchdog.
    pub watchdog_timeout: Duration,
    /// Attempts before a load is terminal.
    pub max_retries: u32,
    /// Base retry backoff after a failed fetch.
    pub retry_backoff: Duration,
    /// Retry backoff ceiling.
    pub retry_backoff_cap: Duration,
    /// Mark-read throttle per room.
    pub read_throttle: Duration,
    /// Room transition settle delay.
    pub settle_delay: Duration,
    /// Deferred mark-read after the first page.
    pub mark_read_delay: Duration,
    /// Duplicate send debounce.
    pub send_debounce: Duration,
    /// Temp reconciliation window.
    pub temp_match_window: Duration,
    /// Room cache capacity.
    pub max_cached_rooms: usize,
    /// Prefix of the live topic for a room (`{prefix}{room_id}`).
    pub topic_prefix: String,
    /// Prefix of the publish destination for a room (`{prefix}{room_id}`).
    pub destination_prefix: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            page_size: DEFAULT_PAGE_SIZE,
            watchdog_timeout: DEFAULT_WATCHDOG_TIMEOUT,
            max_retries: DEFAULT_MAX_RETRIES,
            retry_backoff: DEFAULT_RETRY_BACKOFF,
            retry_backoff_cap: DEFAULT_RETRY_BACKOFF_CAP,
            read_throttle: DEFAULT_READ_THROTTLE,
            settle_delay: DEFAULT_SETTLE_DELAY,
            mark_read_delay: DEFAULT_MARK_READ_DELAY,
            send_debounce: DEFAULT_SEND_DEBOUNCE,
            temp_match_window: DEFAULT_TEMP_MATCH_WINDOW,
            max_cached_rooms: DEFAULT_MAX_CACHED_ROOMS,
            topic_prefix: "/topic/rooms/".to_string(),
            destination_prefix: "/app/rooms/".to_string(),
        }
    }
}

impl SyncConfig {
    /// Set the history page size. Zero is clamped to one.
    #[must_use]
    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Set the history fetch watchdog.
    #[must_use]
    pub fn with_watchdog_timeout(mut self, timeout: Duration) -> Self {
        self.watchdog_timeout = timeout;
        self
    }

    /// Set the number of attempts before a load is terminal.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Set the mark-read throttle.
    #[must_use]
    pub fn with_read_throttle(mut self, throttle: Duration) -> Self {
        self.read_throttle = throttle;
        self
    }

    /// Set the room transition settle delay.
    #[must_use]
    pub fn with_settle_delay(mut self, delay: Duration) -> Self {
        self.settle_delay = delay;
        self
    }

    /// Set the temp reconciliation window.
    #[must_use]
    pub fn with_temp_match_window(mut self, window: Duration) -> Self {
        self.temp_match_window = window;
        self
    }

    /// Set the room cache capacity.
    #[must_use]
    pub fn with_max_cached_rooms(mut self, max: usize) -> Self {
        self.max_cached_rooms = max;
        self
    }

    /// Live topic for a room.
    pub fn topic_for(&self, room_id: &crate::RoomId) -> String {
        format!("{}{}", self.topic_prefix, room_id)
    }

    /// Publish destination for a room.
    pub fn destination_for(&self, room_id: &crate::RoomId) -> String {
        format!("{}{}", self.destination_prefix, room_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::RoomId;

    #[test]
    fn defaults_match_documented_constants() {
        let config = SyncConfig::default();
        assert_eq!(config.page_size, 20);
        assert_eq!(config.watchdog_timeout, Duration::from_secs(10));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.read_throttle, Duration::from_secs(3));
        assert_eq!(config.settle_delay, Duration::from_millis(300));
    }

    #[test]
    fn topic_and_destination_use_prefixes() {
        let config = SyncConfig::default();
        let room = RoomId::from("r1");
        assert_eq!(config.topic_for(&room), "/topic/rooms/r1");
        assert_eq!(config.destination_for(&room), "/app/rooms/r1");
    }

    #[test]
    fn zero_page_size_is_clamped() {
        assert_eq!(SyncConfig::default().with_page_size(0).page_size, 1);
    }
}
