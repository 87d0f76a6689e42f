// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! I/O readiness polling for the gyre event loop.
//!
//! A single `Poller` capability over the platform readiness facility.
//! The loop crate decides *when* to sleep; this crate decides *how*:
//! registered file descriptors get a per-fd callback dispatched on the
//! polling thread, and a wake pipe lets other threads interrupt a
//! blocking poll without dispatching anything.
//!
//! Components:
//! - `Poller` trait — register/unregister/modify, blocking poll, wakeup
//! - `wake`   — self-pipe wake mechanism shared by the backends
//! - `epoll`  — Linux backend
//! - `kqueue` — macOS/BSD backend
//!
//! The same contract is satisfiable by IOCP: wakeup posts a zero-byte
//! completion (`PostQueuedCompletionStatus(port, 0, 0, NULL)`) and the
//! poll side treats a null `Overlapped` as a wake rather than an I/O
//! completion. No Windows backend is built here.

mod wake;

#[cfg(target_os = "linux")]
mod epoll;
#[cfg(any(target_os = "macos", target_os = "freebsd"))]
mod kqueue;

#[cfg(target_os = "linux")]
pub use epoll::EpollPoller;
#[cfg(any(target_os = "macos", target_os = "freebsd"))]
pub use kqueue::KqueuePoller;
pub use wake::WakePipe;

use std::fmt;
use std::io;
use std::os::unix::io::RawFd;
use std::sync::Arc;

use thiserror::Error;

/// Highest file descriptor value accepted for registration (exclusive).
pub const MAX_FD: RawFd = 100_000_000;

/// Readiness event set. Used both as the watched interest mask and as
/// the delivered result mask.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct Events(u8);

impl Events {
    pub const NONE: Events = Events(0);
    pub const READABLE: Events = Events(1 << 0);
    pub const WRITABLE: Events = Events(1 << 1);
    pub const ERROR: Events = Events(1 << 2);
    pub const HUP: Events = Events(1 << 3);

    pub fn contains(self, other: Events) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl std::ops::BitOr for Events {
    type Output = Events;

    fn bitor(self, rhs: Events) -> Events {
        Events(self.0 | rhs.0)
    }
}

impl std::ops::BitOrAssign for Events {
    fn bitor_assign(&mut self, rhs: Events) {
        self.0 |= rhs.0;
    }
}

impl fmt::Debug for Events {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut parts = Vec::new();
        if self.contains(Events::READABLE) {
            parts.push("READABLE");
        }
        if self.contains(Events::WRITABLE) {
            parts.push("WRITABLE");
        }
        if self.contains(Events::ERROR) {
            parts.push("ERROR");
        }
        if self.contains(Events::HUP) {
            parts.push("HUP");
        }
        if parts.is_empty() {
            write!(f, "Events(NONE)")
        } else {
            write!(f, "Events({})", parts.join("|"))
        }
    }
}

/// Per-fd readiness callback. Dispatched on the polling thread, outside
/// the fd-map lock. A callback may therefore still run once after
/// `unregister_fd` returns; callers must coordinate fd closure with
/// outstanding dispatches.
pub type IoCallback = Arc<dyn Fn(Events) + Send + Sync>;

/// Errors from poller operations.
#[derive(Debug, Error)]
pub enum PollError {
    #[error("poller is closed")]
    Closed,
    #[error("fd {0} is outside the supported range")]
    FdOutOfRange(RawFd),
    #[error("fd {0} is already registered")]
    AlreadyRegistered(RawFd),
    #[error("fd {0} is not registered")]
    NotRegistered(RawFd),
    #[error("poll syscall failed: {0}")]
    Os(#[from] io::Error),
}

/// Readiness poller capability.
///
/// Construction allocates the platform resources (the constructor is the
/// `init` step); `close` releases the right to poll and is idempotent.
/// One thread (the loop thread) calls `poll_io`; any thread may call
/// the rest.
pub trait Poller: Send + Sync {
    /// Watch `fd` for `events`, invoking `cb` with the delivered set each
    /// time the fd becomes ready. Fails if the fd is out of
    /// `[0, MAX_FD)`, already registered, or the poller is closed.
    fn register_fd(&self, fd: RawFd, events: Events, cb: IoCallback) -> Result<(), PollError>;

    /// Stop watching `fd`. Fails if not registered. Already-dispatched
    /// callbacks may still complete after this returns.
    fn unregister_fd(&self, fd: RawFd) -> Result<(), PollError>;

    /// Replace the watched event mask for `fd`.
    fn modify_fd(&self, fd: RawFd, events: Events) -> Result<(), PollError>;

    /// Block up to `timeout_ms` (`-1` = indefinite, `0` = non-blocking)
    /// waiting for readiness, then dispatch callbacks inline on the
    /// calling thread. Returns the number of dispatched callbacks.
    /// An EINTR-class interruption counts as a successful empty poll.
    fn poll_io(&self, timeout_ms: i32) -> Result<usize, PollError>;

    /// Unblock a concurrent `poll_io` without dispatching any callback.
    fn wakeup(&self);

    /// Stop accepting polls. Idempotent. Descriptors are released when
    /// the poller is dropped, so a concurrent `poll_io` never sees its
    /// fds closed out from under it.
    fn close(&self);

    /// Number of user fds currently registered.
    fn registered_count(&self) -> usize;
}

/// Construct the default poller for this platform.
pub fn platform_poller() -> io::Result<Arc<dyn Poller>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(EpollPoller::new()?))
    }
    #[cfg(any(target_os = "macos", target_os = "freebsd"))]
    {
        Ok(Arc::new(KqueuePoller::new()?))
    }
}
