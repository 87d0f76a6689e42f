// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Timer subsystem.
//!
//! Min-heap keyed by fire time with indexed cancellation: an id→slot map
//! doubles as the heap-membership record and is maintained through every
//! sift, so cancel is O(log n) instead of a scan. Fired one-shot timers
//! return their shells to a pool; intervals rearm anchored on the prior
//! deadline so repeated fires do not drift.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Opaque timer identifier, monotonically assigned per loop.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct TimerId(pub(crate) u64);

/// Timer callbacks may fire more than once (intervals), so they are
/// `FnMut`.
pub(crate) type TimerCallback = Box<dyn FnMut() + Send>;

struct Timer {
    id: u64,
    when: Instant,
    period: Option<Duration>,
    /// Checked out while the callback runs; `None` in the heap marks an
    /// interval currently firing.
    callback: Option<TimerCallback>,
    canceled: Arc<AtomicBool>,
    /// HTML timer-clamping input for host `setTimeout` wrappers.
    #[allow(dead_code)]
    nesting_level: u16,
}

/// A due timer checked out for firing. The `canceled` flag is shared
/// with the registry so a cancel that lands between collection and
/// execution still suppresses the callback.
pub(crate) struct FireEntry {
    pub id: TimerId,
    pub callback: TimerCallback,
    pub canceled: Arc<AtomicBool>,
    pub interval: bool,
}

impl FireEntry {
    pub fn is_canceled(&self) -> bool {
        self.canceled.load(Ordering::Acquire)
    }
}

/// Timer heap, id map, and shell pool. Guarded by one mutex in the loop
/// shared state; all methods assume the caller holds it.
pub(crate) struct Timers {
    heap: Vec<Timer>,
    by_id: HashMap<u64, usize>,
    pool: Vec<Timer>,
    next_id: u64,
    allocated: usize,
}

impl Timers {
    pub fn new() -> Self {
        Self {
            heap: Vec::new(),
            by_id: HashMap::new(),
            pool: Vec::new(),
            next_id: 1,
            allocated: 0,
        }
    }

    /// Schedule a timer. Returns the new id and whether it displaced the
    /// heap top (the sleeping poll must be woken to honor the earlier
    /// deadline).
    pub fn schedule(
        &mut self,
        now: Instant,
        delay: Duration,
        period: Option<Duration>,
        callback: TimerCallback,
    ) -> (TimerId, bool) {
        let id = self.next_id;
        self.next_id += 1;

        let mut timer = match self.pool.pop() {
            Some(t) => t,
            None => {
                self.allocated += 1;
                Timer {
                    id: 0,
                    when: now,
                    period: None,
                    callback: None,
                    canceled: Arc::new(AtomicBool::new(false)),
                    nesting_level: 0,
                }
            }
        };
        timer.id = id;
        timer.when = now + delay;
        timer.period = period;
        timer.callback = Some(callback);
        match Arc::get_mut(&mut timer.canceled) {
            Some(flag) => flag.store(false, Ordering::Release),
            // A fire entry still holds the old flag; detach from it.
            None => timer.canceled = Arc::new(AtomicBool::new(false)),
        }

        let slot = self.heap.len();
        self.by_id.insert(id, slot);
        self.heap.push(timer);
        self.sift_up(slot);

        (TimerId(id), self.heap[0].id == id)
    }

    /// Cancel by id. True if the timer was found (and removed).
    pub fn cancel(&mut self, id: TimerId) -> bool {
        let Some(&slot) = self.by_id.get(&id.0) else {
            return false;
        };
        self.heap[slot].canceled.store(true, Ordering::Release);
        let timer = self.remove_at(slot);
        self.recycle(timer);
        true
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.heap.first().map(|t| t.when)
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    /// Check out every timer due at `now`. Intervals are rearmed
    /// (anchored on the prior deadline) and reinserted before their
    /// callback runs, so a cancel from inside the callback defers to the
    /// next fire.
    pub fn collect_due(&mut self, now: Instant, out: &mut Vec<FireEntry>) {
        while let Some(top) = self.heap.first() {
            if top.when > now {
                break;
            }
            if top.callback.is_none() {
                // Interval whose callback is checked out right now; it
                // will be restored after this firing pass.
                break;
            }

            let mut timer = self.remove_at(0);
            if timer.canceled.load(Ordering::Acquire) {
                self.recycle(timer);
                continue;
            }

            let callback = timer.callback.take().expect("checked above");
            let entry = FireEntry {
                id: TimerId(timer.id),
                callback,
                canceled: timer.canceled.clone(),
                interval: timer.period.is_some(),
            };

            if let Some(period) = timer.period {
                timer.when += period;
                let slot = self.heap.len();
                self.by_id.insert(timer.id, slot);
                self.heap.push(timer);
                self.sift_up(slot);
            } else {
                self.recycle(timer);
            }

            out.push(entry);
        }
    }

    /// Hand an interval's callback back after a fire. Dropped silently
    /// if the timer was canceled in the meantime.
    pub fn restore_callback(&mut self, id: TimerId, callback: TimerCallback) {
        if let Some(&slot) = self.by_id.get(&id.0) {
            self.heap[slot].callback = Some(callback);
        }
    }

    /// Discard all timers without firing. Shutdown path.
    pub fn clear(&mut self) {
        while let Some(timer) = self.heap.pop() {
            self.by_id.remove(&timer.id);
            self.recycle(timer);
        }
    }

    /// Lifetime shell allocations, stable once the pool is warm.
    #[cfg(test)]
    pub fn allocated_shells(&self) -> usize {
        self.allocated
    }

    fn recycle(&mut self, mut timer: Timer) {
        timer.callback = None;
        timer.period = None;
        self.pool.push(timer);
    }

    /// Remove the timer at `slot`, preserving heap order and the id map.
    fn remove_at(&mut self, slot: usize) -> Timer {
        let last = self.heap.len() - 1;
        self.heap.swap(slot, last);
        let timer = self.heap.pop().unwrap();
        self.by_id.remove(&timer.id);

        if slot < self.heap.len() {
            self.by_id.insert(self.heap[slot].id, slot);
            self.sift_down(slot);
            self.sift_up(slot);
        }
        timer
    }

    fn earlier(&self, a: usize, b: usize) -> bool {
        let (ta, tb) = (&self.heap[a], &self.heap[b]);
        // Id tie-break keeps equal deadlines stable.
        (ta.when, ta.id) < (tb.when, tb.id)
    }

    fn swap_slots(&mut self, a: usize, b: usize) {
        self.heap.swap(a, b);
        self.by_id.insert(self.heap[a].id, a);
        self.by_id.insert(self.heap[b].id, b);
    }

    fn sift_up(&mut self, mut slot: usize) {
        while slot > 0 {
            let parent = (slot - 1) / 2;
            if !self.earlier(slot, parent) {
                break;
            }
            self.swap_slots(slot, parent);
            slot = parent;
        }
    }

    fn sift_down(&mut self, mut slot: usize) {
        loop {
            let left = 2 * slot + 1;
            if left >= self.heap.len() {
                break;
            }
            let right = left + 1;
            let mut smallest = slot;
            if self.earlier(left, smallest) {
                smallest = left;
            }
            if right < self.heap.len() && self.earlier(right, smallest) {
                smallest = right;
            }
            if smallest == slot {
                break;
            }
            self.swap_slots(slot, smallest);
            slot = smallest;
        }
    }
}
