// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Error taxonomy for the embeddable API.

use gyre_poll::PollError;
use thiserror::Error;

/// Errors surfaced by loop operations.
#[derive(Debug, Error)]
pub enum LoopError {
    /// `run` called while another `run` owns the loop.
    #[error("event loop is already running")]
    AlreadyRunning,
    /// Operation requires a live loop.
    #[error("event loop is not running")]
    NotRunning,
    /// The loop has terminated; submissions are rejected.
    #[error("event loop has terminated")]
    Terminated,
    /// Timer id unknown, already fired, or already canceled.
    #[error("timer not found")]
    TimerNotFound,
    /// An ingress queue could not be fully drained this tick.
    #[error("ingress queue overloaded")]
    Overloaded,
    /// A cancellation token fired.
    #[error("operation canceled")]
    Canceled,
    /// A shutdown deadline expired before the loop thread exited.
    #[error("deadline exceeded")]
    DeadlineExceeded,
    /// Readiness poller failure.
    #[error(transparent)]
    Poll(#[from] PollError),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn poll_error_converts() {
        let err: LoopError = PollError::Closed.into();
        assert!(matches!(err, LoopError::Poll(PollError::Closed)));
    }

    #[test]
    fn display_messages() {
        assert_eq!(LoopError::Terminated.to_string(), "event loop has terminated");
        assert_eq!(LoopError::TimerNotFound.to_string(), "timer not found");
    }
}
