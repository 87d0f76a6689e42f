// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Cooperative cancellation.
//!
//! An atomic flag with an attached condvar so waiters can park instead
//! of spinning. `run` checks the token at tick boundaries; `promisify`
//! watchers park on it with a timeout.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

/// Cancellation token shared between the requester and the observer.
#[derive(Debug)]
pub struct CancelToken {
    flag: AtomicBool,
    parked: Mutex<()>,
    cv: Condvar,
}

impl CancelToken {
    pub fn new() -> Self {
        Self {
            flag: AtomicBool::new(false),
            parked: Mutex::new(()),
            cv: Condvar::new(),
        }
    }

    /// Set the cancellation flag and release any parked waiters.
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::Release);
        let _guard = self.parked.lock().unwrap();
        self.cv.notify_all();
    }

    /// Check whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::Acquire)
    }

    /// Park up to `timeout` waiting for cancellation. Returns true if
    /// cancelled (possibly before the call).
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_cancelled() {
            return true;
        }
        let deadline = Instant::now() + timeout;
        // cancel() publishes the flag before taking the lock, so a flag
        // observed under it means the notify happened or is imminent.
        let mut guard = self.parked.lock().unwrap();
        while !self.is_cancelled() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (g, _result) = self.cv.wait_timeout(guard, deadline - now).unwrap();
            guard = g;
        }
        self.is_cancelled()
    }
}

impl Default for CancelToken {
    fn default() -> Self {
        Self::new()
    }
}

/// Arm a watcher thread that cancels `token` after `delay`. Used for
/// deadline-bounded shutdown in hosts and tests.
pub fn cancel_after(token: Arc<CancelToken>, delay: Duration) {
    std::thread::spawn(move || {
        std::thread::sleep(delay);
        token.cancel();
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_sets_flag() {
        let token = CancelToken::new();
        assert!(!token.is_cancelled());
        token.cancel();
        assert!(token.is_cancelled());
    }

    #[test]
    fn wait_returns_immediately_when_already_cancelled() {
        let token = CancelToken::new();
        token.cancel();
        assert!(token.wait_timeout(Duration::from_secs(10)));
    }

    #[test]
    fn wait_times_out_without_cancel() {
        let token = CancelToken::new();
        assert!(!token.wait_timeout(Duration::from_millis(10)));
    }

    #[test]
    fn wait_wakes_on_concurrent_cancel() {
        let token = Arc::new(CancelToken::new());
        let t2 = token.clone();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            t2.cancel();
        });
        assert!(token.wait_timeout(Duration::from_secs(5)));
    }

    #[test]
    fn cancel_after_fires() {
        let token = Arc::new(CancelToken::new());
        cancel_after(token.clone(), Duration::from_millis(10));
        assert!(token.wait_timeout(Duration::from_secs(5)));
    }
}
