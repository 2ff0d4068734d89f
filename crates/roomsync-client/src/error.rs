//! Client runtime errors.
//!
//! [`FetchError`] is what collaborators return; the runtime converts it into
//! engine events at the boundary and never hands it to UI code.
//! [`RuntimeError`] is what [`crate::SyncHandle`] returns.

use std::time::Duration;

use roomsync_core::SyncError;
use thiserror::Error;

/// Failure of a history fetch, mark-read call or connect attempt.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FetchError {
    /// The request was cancelled through its token.
    #[error("request cancelled")]
    Cancelled,

    /// No response in time.
    #[error("request timed out after {elapsed:?}")]
    Timeout {
        /// How long we waited.
        elapsed: Duration,
    },

    /// Connection-level failure.
    #[error("network error: {0}")]
    Network(String),

    /// The server answered with an error status.
    #[error("server returned status {status}")]
    Status {
        /// HTTP-like status code.
        status: u16,
    },

    /// The response could not be decoded.
    #[error("invalid response: {0}")]
    InvalidResponse(String),
}

impl FetchError {
    /// Returns true if the same request may succeed on retry.
    ///
    /// Timeouts, network failures, server errors (5xx) and throttling (429)
    /// are transient. Client errors and undecodable responses are not.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Timeout { .. } | Self::Network(_) => true,
            Self::Status { status } => *status >= 500 || *status == 429,
            Self::Cancelled | Self::InvalidResponse(_) => false,
        }
    }
}

/// Errors returned by [`crate::SyncHandle`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RuntimeError {
    /// The runtime task has stopped.
    #[error("sync runtime stopped")]
    Stopped,

    /// The engine rejected the request.
    #[error(transparent)]
    Sync(#[from] SyncError),
}
