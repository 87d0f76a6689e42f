// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Loop lifecycle state machine.
//!
//! `Awake → Running ⇄ Sleeping → Terminating → Terminated`, with
//! `Terminating` reachable from any live state. Transitions are
//! compare-and-set; a failed CAS reports the observed state so the
//! caller can react instead of retrying blindly.

use std::sync::atomic::{AtomicU8, Ordering};

/// Pad a hot field out to its own cache line (128 bytes assumed, which
/// covers adjacent-line prefetching on common hardware).
#[repr(align(128))]
pub(crate) struct CachePadded<T>(pub T);

/// Lifecycle states of the loop.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    /// Constructed, `run` not yet called.
    Awake = 0,
    /// Loop thread executing tasks.
    Running = 1,
    /// Loop thread parked in the poll step.
    Sleeping = 2,
    /// Shutdown requested; final drain in progress.
    Terminating = 3,
    /// Loop thread exited; submissions are rejected.
    Terminated = 4,
}

impl LoopState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Awake,
            1 => Self::Running,
            2 => Self::Sleeping,
            3 => Self::Terminating,
            _ => Self::Terminated,
        }
    }

    /// True for states that still accept submissions.
    pub fn is_live(self) -> bool {
        matches!(self, Self::Awake | Self::Running | Self::Sleeping)
    }
}

/// Atomic holder for the loop state.
pub(crate) struct StateCell {
    state: CachePadded<AtomicU8>,
}

impl StateCell {
    pub fn new() -> Self {
        Self {
            state: CachePadded(AtomicU8::new(LoopState::Awake as u8)),
        }
    }

    pub fn load(&self) -> LoopState {
        LoopState::from_u8(self.state.0.load(Ordering::Acquire))
    }

    /// Attempt `from → to`. On failure returns the state actually
    /// observed.
    pub fn transition(&self, from: LoopState, to: LoopState) -> Result<(), LoopState> {
        self.state
            .0
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(LoopState::from_u8)
    }

    /// Move any live state to `Terminating`. Returns the state that was
    /// current before the request, whether or not a transition happened.
    pub fn request_terminate(&self) -> LoopState {
        loop {
            let current = self.load();
            if !current.is_live() {
                return current;
            }
            match self.transition(current, LoopState::Terminating) {
                Ok(()) => return current,
                Err(_) => continue,
            }
        }
    }

    /// Unconditional store, used only for `Terminating → Terminated`.
    pub fn finalize(&self) {
        self.state
            .0
            .store(LoopState::Terminated as u8, Ordering::Release);
    }
}
