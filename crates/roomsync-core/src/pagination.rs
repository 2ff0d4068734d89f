//! Pagination, watchdog and retry.
//!
//! Each room carries a [`LoadState`]:
//!
//! ```text
//!  ┌──────┐ load  ┌─────────┐ page ok  ┌──────┐
//!  │ Idle │──────>│ Loading │─────────>│ Idle │
//!  └──────┘       └─────────┘          └──────┘
//!                   │     ^
//!    error/watchdog │     │ backoff elapsed
//!                   v     │
//!            ┌────────────────┐  attempts exhausted  ┌────────┐
//!            │ RetryScheduled │─────────────────────>│ Failed │
//!            └────────────────┘                      └────────┘
//! ```
//!
//! Load requests are funneled through an [`OperationQueue`] scoped to the
//! current room transition. Clearing the queue bumps its generation, so
//! requests queued for a room that is no longer active are discarded.

use std::{collections::VecDeque, fmt, ops::Sub, time::Duration};

use crate::{
    config::SyncConfig,
    message::{Message, RoomId},
    room::{MergeOrigin, MergeReport, RoomSyncState},
};

/// Identifier of one history fetch. Never reused within an engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RequestId(pub u64);

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "req-{}", self.0)
    }
}

/// Per-room pagination state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadState<I> {
    /// Nothing in flight.
    Idle,
    /// A fetch is in flight.
    Loading {
        /// Fetch identity; responses for any other id are stale.
        request: RequestId,
        /// Page being fetched.
        page: u32,
        /// When the fetch started, for the watchdog.
        started_at: I,
    },
    /// The last attempt failed; another one starts once `delay` has elapsed.
    RetryScheduled {
        /// When the failure was recorded.
        since: I,
        /// Backoff before the next attempt.
        delay: Duration,
    },
    /// Attempts exhausted. Only a manual retry leaves this state.
    Failed {
        /// Last failure reason.
        reason: String,
    },
}

/// What to do after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureStep {
    /// Try again after the given backoff.
    RetryAfter(Duration),
    /// Give up and surface the error.
    Terminal,
}

/// Backoff before retry number `attempt` (1-based): base doubled per attempt,
/// capped.
pub fn retry_delay(attempt: u32, config: &SyncConfig) -> Duration {
    let factor = 1u32 << attempt.saturating_sub(1).min(16);
    config.retry_backoff.saturating_mul(factor).min(config.retry_backoff_cap)
}

impl<I> RoomSyncState<I>
where
    I: Copy + Ord + Sub<Output = Duration>,
{
    /// Reason a load request would be a no-op, if any.
    ///
    /// Retries are never blocked. Regular loads are blocked while a fetch or
    /// retry is pending, after a terminal failure, and once history is
    /// exhausted.
    pub fn load_blocker(&self, retry: bool) -> Option<&'static str> {
        if retry {
            return None;
        }
        match self.load {
            LoadState::Loading { .. } => Some("already loading"),
            LoadState::RetryScheduled { .. } => Some("retry already scheduled"),
            LoadState::Failed { .. } => Some("load failed, manual retry required"),
            LoadState::Idle if !self.has_more && self.page > 0 => Some("no more history"),
            LoadState::Idle => None,
        }
    }

    /// Fetch currently in flight.
    pub fn in_flight(&self) -> Option<RequestId> {
        match self.load {
            LoadState::Loading { request, .. } => Some(request),
            _ => None,
        }
    }

    /// Enter `Loading` for `request`. Returns the fetch it supersedes.
    pub fn begin_load(&mut self, request: RequestId, now: I) -> Option<RequestId> {
        let previous = self.in_flight();
        self.load = LoadState::Loading { request, page: self.page, started_at: now };
        previous
    }

    /// Apply a successful page of normalized messages.
    ///
    /// Advances `page`, resets the retry counter and clears the error. A page
    /// shorter than `page_size` marks history as exhausted.
    pub fn complete_load(
        &mut self,
        items: Vec<Message>,
        page_size: u32,
        window: Duration,
    ) -> MergeReport {
        let received = items.len();
        let report = self.merge(items, MergeOrigin::History, window);

        self.page += 1;
        self.retry_count = 0;
        self.last_error = None;
        self.load = LoadState::Idle;
        if received < page_size as usize {
            self.has_more = false;
        }
        report
    }

    /// Record a failed or timed-out attempt.
    ///
    /// The attempt counter is incremented first; reaching `max_retries` is
    /// terminal. With `backoff` off (watchdog expiry) the retry is due
    /// immediately.
    pub fn record_failure(
        &mut self,
        reason: String,
        now: I,
        backoff: bool,
        config: &SyncConfig,
    ) -> FailureStep {
        self.retry_count += 1;
        self.last_error = Some(reason.clone());

        if self.retry_count >= config.max_retries {
            self.load = LoadState::Failed { reason };
            return FailureStep::Terminal;
        }

        let delay = if backoff { retry_delay(self.retry_count, config) } else { Duration::ZERO };
        self.load = LoadState::RetryScheduled { since: now, delay };
        FailureStep::RetryAfter(delay)
    }

    /// Fetch whose watchdog has expired at `now`.
    pub fn watchdog_expired(&self, now: I, timeout: Duration) -> Option<RequestId> {
        match self.load {
            LoadState::Loading { request, started_at, .. } if now - started_at >= timeout => {
                Some(request)
            },
            _ => None,
        }
    }

    /// Whether a scheduled retry is due at `now`.
    pub fn retry_due(&self, now: I) -> bool {
        matches!(self.load, LoadState::RetryScheduled { since, delay } if now - since >= delay)
    }

    /// Time until the next pagination timer (watchdog or retry) fires.
    pub fn next_timer(&self, now: I, watchdog: Duration) -> Option<Duration> {
        match self.load {
            LoadState::Loading { started_at, .. } => {
                Some(watchdog.saturating_sub(now - started_at))
            },
            LoadState::RetryScheduled { since, delay } => Some(delay.saturating_sub(now - since)),
            LoadState::Idle | LoadState::Failed { .. } => None,
        }
    }

    /// Manual retry: the attempt counter and `has_more` reset, `page` is kept.
    pub fn reset_for_manual_retry(&mut self) {
        self.retry_count = 0;
        self.has_more = true;
        self.last_error = None;
        self.load = LoadState::Idle;
    }

    /// Abandon pending work when the room is left. Returns the fetch to cancel.
    ///
    /// A terminal failure is kept so the error is still shown on return.
    pub fn suspend_load(&mut self) -> Option<RequestId> {
        let in_flight = self.in_flight();
        if matches!(self.load, LoadState::Loading { .. } | LoadState::RetryScheduled { .. }) {
            self.load = LoadState::Idle;
        }
        in_flight
    }
}

/// A queued load request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadOp {
    /// Room to load.
    pub room_id: RoomId,
    /// Retry loads bypass the no-op rules and supersede in-flight fetches.
    pub retry: bool,
    /// Queue generation the op was enqueued under.
    pub generation: u64,
}

/// Single-flight FIFO of load requests scoped to a room transition.
#[derive(Debug, Clone, Default)]
pub struct OperationQueue {
    ops: VecDeque<LoadOp>,
    generation: u64,
}

impl OperationQueue {
    /// Empty queue at generation 0.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current generation.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Enqueue a load for `room_id` under the current generation.
    pub fn push(&mut self, room_id: RoomId, retry: bool) {
        self.ops.push_back(LoadOp { room_id, retry, generation: self.generation });
    }

    /// Next op of the current generation. Stale ops are discarded.
    pub fn pop(&mut self) -> Option<LoadOp> {
        while let Some(op) = self.ops.pop_front() {
            if op.generation == self.generation {
                return Some(op);
            }
            tracing::debug!(room = %op.room_id, "discarding stale load request");
        }
        None
    }

    /// Drop everything and start a new generation.
    pub fn clear(&mut self) {
        self.ops.clear();
        self.generation += 1;
    }

    /// Number of queued ops.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the queue is empty.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }
}
