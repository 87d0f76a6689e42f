// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Wakeup subsystem: the fast-path park channel and signal
//! de-duplication.
//!
//! The loop parks either on this channel (fast path, no user fds) or in
//! the poller's blocking wait (I/O path). Producers go through a single
//! pending flag so that any number of wake requests between two parks
//! emit at most one signal.

use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::state::CachePadded;

/// Where the loop thread parks, published just before the
/// Running→Sleeping transition so `wake` can pick the right signal.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ParkMode {
    Channel = 0,
    Poller = 1,
}

pub(crate) struct ParkModeCell(CachePadded<AtomicU8>);

impl ParkModeCell {
    pub fn new() -> Self {
        Self(CachePadded(AtomicU8::new(ParkMode::Channel as u8)))
    }

    pub fn set(&self, mode: ParkMode) {
        self.0 .0.store(mode as u8, Ordering::Release);
    }

    pub fn get(&self) -> ParkMode {
        if self.0 .0.load(Ordering::Acquire) == ParkMode::Poller as u8 {
            ParkMode::Poller
        } else {
            ParkMode::Channel
        }
    }
}

/// Single-slot wakeup channel. `notify` is sticky: a signal sent while
/// the loop is not parked is consumed by the next park.
pub(crate) struct WakeChannel {
    signaled: Mutex<bool>,
    cv: Condvar,
}

impl WakeChannel {
    pub fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub fn notify(&self) {
        let mut signaled = self.signaled.lock().unwrap();
        *signaled = true;
        self.cv.notify_one();
    }

    /// Park until notified or until `timeout` elapses (`None` = park
    /// indefinitely). Consumes the pending signal, if any.
    pub fn park(&self, timeout: Option<Duration>) {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut signaled = self.signaled.lock().unwrap();
        while !*signaled {
            match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break;
                    }
                    let (guard, _result) =
                        self.cv.wait_timeout(signaled, deadline - now).unwrap();
                    signaled = guard;
                }
                None => {
                    signaled = self.cv.wait(signaled).unwrap();
                }
            }
        }
        *signaled = false;
    }
}

/// De-duplicating wake flag. The 0→1 transition elects the caller that
/// actually emits the signal; everyone else elides it. The loop clears
/// the flag when it comes back from a park.
pub(crate) struct WakeSignal {
    pending: CachePadded<AtomicBool>,
}

impl WakeSignal {
    pub fn new() -> Self {
        Self {
            pending: CachePadded(AtomicBool::new(false)),
        }
    }

    /// Returns true exactly once per park cycle: the caller that wins
    /// sends the actual signal.
    pub fn arm(&self) -> bool {
        self.pending
            .0
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn clear(&self) {
        self.pending.0.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn park_returns_on_notify() {
        let ch = Arc::new(WakeChannel::new());
        let ch2 = ch.clone();
        let start = Instant::now();
        std::thread::spawn(move || {
            std::thread::sleep(Duration::from_millis(10));
            ch2.notify();
        });
        ch.park(Some(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_secs(5));
    }

    #[test]
    fn sticky_notify_consumed_by_next_park() {
        let ch = WakeChannel::new();
        ch.notify();
        let start = Instant::now();
        ch.park(Some(Duration::from_secs(10)));
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[test]
    fn park_times_out() {
        let ch = WakeChannel::new();
        let start = Instant::now();
        ch.park(Some(Duration::from_millis(10)));
        assert!(start.elapsed() >= Duration::from_millis(9));
    }

    #[test]
    fn signal_dedup_elects_one_sender() {
        let signal = WakeSignal::new();
        assert!(signal.arm());
        assert!(!signal.arm());
        assert!(!signal.arm());
        signal.clear();
        assert!(signal.arm());
    }

    #[test]
    fn concurrent_arm_has_single_winner() {
        let signal = Arc::new(WakeSignal::new());
        let mut handles = Vec::new();
        for _ in 0..8 {
            let s = signal.clone();
            handles.push(std::thread::spawn(move || s.arm() as usize));
        }
        let winners: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(winners, 1);
    }

    #[test]
    fn park_mode_round_trip() {
        let cell = ParkModeCell::new();
        assert_eq!(cell.get(), ParkMode::Channel);
        cell.set(ParkMode::Poller);
        assert_eq!(cell.get(), ParkMode::Poller);
    }
}
