// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! The loop core.
//!
//! One dedicated loop thread owns all task execution and runs the
//! poll → tasks → microtasks → timers cycle. Producers on other threads
//! only ever enqueue and wake. Sleeping happens either on the wakeup
//! channel (fast path, no user fds) or inside the poller's blocking
//! wait (I/O path); the choice is re-evaluated every tick.

use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::ThreadId;
use std::time::{Duration, Instant};

use gyre_poll::{Events, IoCallback, Poller};

use crate::cancel::CancelToken;
use crate::error::LoopError;
use crate::ingress::{effective_chunk_size, ChunkedQueue};
use crate::metrics::{MetricsCollector, MetricsSnapshot};
use crate::promise::ChainedPromise;
use crate::ring::MicrotaskRing;
use crate::state::{LoopState, StateCell};
use crate::task::{panic_message, run_guarded, run_hook_guarded, Task};
use crate::timer::{FireEntry, TimerId, Timers};
use crate::unhandled::{RejectionHook, RejectionTracker};
use crate::wake::{ParkMode, ParkModeCell, WakeChannel, WakeSignal};

/// How many tasks one ingress drain moves into the scratch buffer.
const SCRATCH_BATCH: usize = 256;

/// Fast-path policy for the wakeup subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FastPathMode {
    /// Fast path active exactly while zero user fds are registered.
    Auto,
    /// Always sleep on the channel, even with fds registered.
    Forced,
    /// Always sleep in the poller.
    Disabled,
}

/// Host callback for ticks that could not fully drain an ingress queue.
pub type OverloadHook = Box<dyn Fn(&LoopError) + Send + Sync>;

/// Loop construction options.
pub struct Options {
    pub fast_path_mode: FastPathMode,
    /// Drain microtasks after every individual task instead of after
    /// each batch.
    pub strict_microtasks: bool,
    /// Ingress chunk capacity; non-positive takes the default, the rest
    /// is clamped to [16, 4096] and rounded down to a power of two.
    pub ingress_chunk_size: i64,
    /// Capture creation backtraces for unhandled-rejection reports.
    pub debug_mode: bool,
    pub metrics: bool,
    /// Dispatcher installed for the loop thread; defaults to the global
    /// subscriber.
    pub logger: Option<tracing::Dispatch>,
    pub on_overload: Option<OverloadHook>,
    pub on_unhandled_rejection: Option<RejectionHook>,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            fast_path_mode: FastPathMode::Auto,
            strict_microtasks: false,
            ingress_chunk_size: 0,
            debug_mode: false,
            metrics: false,
            logger: None,
            on_overload: None,
            on_unhandled_rejection: None,
        }
    }
}

/// State shared between the loop thread and producers.
pub(crate) struct Shared {
    state: StateCell,
    external: ChunkedQueue,
    internal: ChunkedQueue,
    microtasks: MicrotaskRing,
    next_tick: Mutex<VecDeque<Task>>,
    /// Loop-thread submissions while the fast path is active.
    aux_jobs: Mutex<Vec<Task>>,
    timers: Mutex<Timers>,
    poller: Arc<dyn Poller>,
    wake_channel: WakeChannel,
    wake_signal: WakeSignal,
    park_mode: ParkModeCell,
    fast_path_mode: FastPathMode,
    strict: bool,
    debug: bool,
    logger: Option<tracing::Dispatch>,
    on_overload: Option<OverloadHook>,
    on_unhandled_rejection: Option<RejectionHook>,
    rejections: RejectionTracker,
    metrics: Option<MetricsCollector>,
    loop_thread: Mutex<Option<ThreadId>>,
    /// Loop-thread-exited notification for `shutdown` waiters.
    exited: (Mutex<bool>, Condvar),
}

impl Shared {
    fn on_loop_thread(&self) -> bool {
        self.loop_thread
            .lock()
            .unwrap()
            .map_or(false, |id| id == std::thread::current().id())
    }

    fn fast_path_active(&self) -> bool {
        match self.fast_path_mode {
            FastPathMode::Forced => true,
            FastPathMode::Disabled => false,
            FastPathMode::Auto => self.poller.registered_count() == 0,
        }
    }

    fn has_pending_work(&self) -> bool {
        !self.external.is_empty()
            || !self.internal.is_empty()
            || !self.microtasks.is_empty()
            || !self.next_tick.lock().unwrap().is_empty()
            || !self.aux_jobs.lock().unwrap().is_empty()
    }

    /// De-duplicated wake. No-op unless the loop is sleeping; the park
    /// mode published before the Sleeping transition picks the signal.
    fn wake(&self) {
        if self.state.load() != LoopState::Sleeping {
            return;
        }
        if !self.wake_signal.arm() {
            return;
        }
        match self.park_mode.get() {
            ParkMode::Channel => self.wake_channel.notify(),
            ParkMode::Poller => self.poller.wakeup(),
        }
    }

    /// Unconditional wake for termination: the state is already
    /// Terminating, so the de-duplicated path would elide the signal.
    fn wake_for_terminate(&self) {
        self.wake_channel.notify();
        self.poller.wakeup();
    }

    /// Microtask entry for promise handler dispatch. Accepted while the
    /// final drain can still run it; dropped after Terminated.
    pub(crate) fn promise_microtask(&self, task: Task) {
        if self.state.load() == LoopState::Terminated {
            return;
        }
        self.microtasks.push(task);
        self.wake();
    }

    pub(crate) fn enroll_rejection(&self, promise: ChainedPromise) {
        self.rejections.enroll(promise);
    }

    pub(crate) fn debug_mode(&self) -> bool {
        self.debug
    }
}

/// Handle to one event loop. Clones share the loop; any clone may
/// submit, and exactly one thread runs `run`.
#[derive(Clone)]
pub struct EventLoop {
    shared: Arc<Shared>,
}

impl EventLoop {
    pub fn new(options: Options) -> Result<Self, LoopError> {
        let poller = gyre_poll::platform_poller()
            .map_err(|e| LoopError::Poll(gyre_poll::PollError::Os(e)))?;
        Ok(Self::with_poller(options, poller))
    }

    /// Construction seam for tests and hosts with their own poller.
    pub fn with_poller(options: Options, poller: Arc<dyn Poller>) -> Self {
        let chunk_size = effective_chunk_size(options.ingress_chunk_size);
        Self {
            shared: Arc::new(Shared {
                state: StateCell::new(),
                external: ChunkedQueue::new(chunk_size),
                internal: ChunkedQueue::new(chunk_size),
                microtasks: MicrotaskRing::new(),
                next_tick: Mutex::new(VecDeque::new()),
                aux_jobs: Mutex::new(Vec::new()),
                timers: Mutex::new(Timers::new()),
                poller,
                wake_channel: WakeChannel::new(),
                wake_signal: WakeSignal::new(),
                park_mode: ParkModeCell::new(),
                fast_path_mode: options.fast_path_mode,
                strict: options.strict_microtasks,
                debug: options.debug_mode,
                logger: options.logger,
                on_overload: options.on_overload,
                on_unhandled_rejection: options.on_unhandled_rejection,
                rejections: RejectionTracker::new(),
                metrics: options.metrics.then(MetricsCollector::new),
                loop_thread: Mutex::new(None),
                exited: (Mutex::new(false), Condvar::new()),
            }),
        }
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    /// Current lifecycle state.
    pub fn state(&self) -> LoopState {
        self.shared.state.load()
    }

    /// Run the loop on the calling thread until `shutdown` is requested
    /// or `cancel` fires. Returns `Canceled` when the token stopped it.
    pub fn run(&self, cancel: Option<Arc<CancelToken>>) -> Result<(), LoopError> {
        match self
            .shared
            .state
            .transition(LoopState::Awake, LoopState::Running)
        {
            Ok(()) => {}
            Err(LoopState::Running) | Err(LoopState::Sleeping) => {
                return Err(LoopError::AlreadyRunning)
            }
            Err(_) => return Err(LoopError::Terminated),
        }

        *self.shared.loop_thread.lock().unwrap() = Some(std::thread::current().id());

        // The parked loop cannot observe the token, so a watcher thread
        // turns a cancellation into a terminate-and-wake.
        if let Some(token) = cancel.clone() {
            let shared = self.shared.clone();
            std::thread::spawn(move || loop {
                if token.wait_timeout(Duration::from_millis(5)) {
                    shared.state.request_terminate();
                    shared.wake_for_terminate();
                    return;
                }
                if !shared.state.load().is_live() {
                    return;
                }
            });
        }

        match self.shared.logger.clone() {
            Some(dispatch) => {
                tracing::dispatcher::with_default(&dispatch, || self.run_loop(cancel))
            }
            None => self.run_loop(cancel),
        }
    }

    fn run_loop(&self, cancel: Option<Arc<CancelToken>>) -> Result<(), LoopError> {
        let shared = &self.shared;
        let mut scratch: Vec<Task> = Vec::with_capacity(SCRATCH_BATCH);
        let mut due: Vec<FireEntry> = Vec::new();
        let mut outcome = Ok(());

        tracing::debug!("event loop running");

        loop {
            if let Some(token) = &cancel {
                if token.is_cancelled() {
                    shared.state.request_terminate();
                }
            }
            if !shared.state.load().is_live() {
                break;
            }

            let mut overload_reported = false;

            // 1–2. Ingress drains, one scratch batch each.
            self.drain_ingress(&shared.external, &mut scratch, &mut overload_reported);
            self.drain_ingress(&shared.internal, &mut scratch, &mut overload_reported);

            // 3–4. Next-tick then microtasks, to exhaustion.
            self.microtask_checkpoint();

            // Rejections settled this tick get one scan.
            shared
                .rejections
                .scan(shared.on_unhandled_rejection.as_ref());

            // 5. Expired timers.
            self.fire_timers(&mut due);

            if let Some(metrics) = &shared.metrics {
                metrics.sample_depths(
                    shared.external.len(),
                    shared.internal.len(),
                    shared.microtasks.len(),
                );
            }

            // 6–7. Publish the park mode, then go to sleep state. Wakers
            // that observe Sleeping signal exactly the published mode.
            let io_path = !shared.fast_path_active();
            shared.park_mode.set(if io_path {
                ParkMode::Poller
            } else {
                ParkMode::Channel
            });
            if shared
                .state
                .transition(LoopState::Running, LoopState::Sleeping)
                .is_err()
            {
                // Terminating; the top-of-loop check exits.
                continue;
            }

            // 8. Park. Timeout, pending work, and the fast-path decision
            // are all re-read after the Sleeping transition: producers
            // that saw Running have already published their work, and
            // producers that see Sleeping will signal the published
            // mode. A fast-path flip in the gap just skips this park.
            let timeout = self.compute_timeout();
            let mode_stale = io_path == shared.fast_path_active();
            if !mode_stale && !shared.has_pending_work() {
                if io_path {
                    match shared.poller.poll_io(timeout_to_ms(timeout)) {
                        Ok(_) => {}
                        Err(gyre_poll::PollError::Closed) => {}
                        Err(err) => {
                            tracing::error!(error = %err, "poller failed; terminating loop");
                            let _ = shared
                                .state
                                .transition(LoopState::Sleeping, LoopState::Terminating);
                            outcome = Err(err.into());
                            break;
                        }
                    }
                } else {
                    shared.wake_channel.park(timeout);
                }
            }

            // 9. Back to Running; a failure means shutdown arrived while
            // we slept.
            shared.wake_signal.clear();
            if shared
                .state
                .transition(LoopState::Sleeping, LoopState::Running)
                .is_err()
            {
                break;
            }

            // 10. Fast-path loop-thread submissions.
            self.drain_aux();
        }

        if outcome.is_ok() {
            if let Some(token) = &cancel {
                if token.is_cancelled() {
                    outcome = Err(LoopError::Canceled);
                }
            }
        }

        // Final drain: pending external/internal/microtask/aux work runs,
        // timers are discarded unfired.
        self.shutdown_drain(&mut scratch);
        shared.timers.lock().unwrap().clear();
        shared.poller.close();
        shared.state.finalize();
        // Submissions now fail; sweep anything that raced the drain.
        self.shutdown_drain(&mut scratch);
        *shared.loop_thread.lock().unwrap() = None;

        let (lock, cv) = &shared.exited;
        let mut done = lock.lock().unwrap();
        *done = true;
        cv.notify_all();
        drop(done);

        tracing::debug!("event loop terminated");
        outcome
    }

    /// Submit a task from any thread. On the loop thread with the fast
    /// path active it lands in aux-jobs; otherwise it goes through the
    /// external queue with a wake.
    pub fn submit<F>(&self, f: F) -> Result<(), LoopError>
    where
        F: FnOnce() + Send + 'static,
    {
        self.submit_task(Box::new(f))
    }

    fn submit_task(&self, task: Task) -> Result<(), LoopError> {
        let shared = &self.shared;
        if !shared.state.load().is_live() {
            return Err(LoopError::Terminated);
        }
        if shared.fast_path_active() && shared.on_loop_thread() {
            shared.aux_jobs.lock().unwrap().push(task);
            return Ok(());
        }
        shared.external.push(task);
        shared.wake();
        Ok(())
    }

    /// Submit core-internal work. On the loop thread with no pending
    /// external work the task executes inline.
    pub fn submit_internal<F>(&self, f: F) -> Result<(), LoopError>
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = &self.shared;
        if !shared.state.load().is_live() {
            return Err(LoopError::Terminated);
        }
        if shared.on_loop_thread() && shared.external.is_empty() {
            // Double-check the state: a concurrent shutdown may have
            // landed between the queue check and here, and a task must
            // never start after Terminating.
            if shared.state.load() == LoopState::Running {
                self.exec_task(Box::new(f));
                return Ok(());
            }
        }
        shared.internal.push(Box::new(f));
        shared.wake();
        Ok(())
    }

    /// Queue a microtask: runs before the loop next re-enters poll.
    pub fn schedule_microtask<F>(&self, f: F) -> Result<(), LoopError>
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = &self.shared;
        if !shared.state.load().is_live() {
            return Err(LoopError::Terminated);
        }
        shared.microtasks.push(Box::new(f));
        shared.wake();
        Ok(())
    }

    /// Queue a next-tick task: runs at the next operation boundary,
    /// before microtasks.
    pub fn schedule_next_tick<F>(&self, f: F) -> Result<(), LoopError>
    where
        F: FnOnce() + Send + 'static,
    {
        let shared = &self.shared;
        if !shared.state.load().is_live() {
            return Err(LoopError::Terminated);
        }
        shared.next_tick.lock().unwrap().push_back(Box::new(f));
        shared.wake();
        Ok(())
    }

    /// One-shot timer after `delay`.
    pub fn schedule_timer<F>(&self, delay: Duration, f: F) -> Result<TimerId, LoopError>
    where
        F: FnOnce() + Send + 'static,
    {
        let mut f = Some(f);
        self.schedule_timer_inner(delay, None, Box::new(move || {
            if let Some(f) = f.take() {
                f()
            }
        }))
    }

    /// Repeating timer: first fire after `delay`, then every `period`,
    /// anchored on the prior deadline.
    pub fn schedule_interval<F>(
        &self,
        delay: Duration,
        period: Duration,
        f: F,
    ) -> Result<TimerId, LoopError>
    where
        F: FnMut() + Send + 'static,
    {
        self.schedule_timer_inner(delay, Some(period), Box::new(f))
    }

    fn schedule_timer_inner(
        &self,
        delay: Duration,
        period: Option<Duration>,
        callback: Box<dyn FnMut() + Send>,
    ) -> Result<TimerId, LoopError> {
        let shared = &self.shared;
        if !shared.state.load().is_live() {
            return Err(LoopError::Terminated);
        }
        let (id, displaced_top) = shared
            .timers
            .lock()
            .unwrap()
            .schedule(Instant::now(), delay, period, callback);
        if displaced_top {
            // The sleeping poll is waiting on a later deadline.
            shared.wake();
        }
        Ok(id)
    }

    /// Cancel a timer. After success its callback never runs.
    pub fn cancel_timer(&self, id: TimerId) -> Result<(), LoopError> {
        let shared = &self.shared;
        if !shared.state.load().is_live() {
            return Err(LoopError::NotRunning);
        }
        if shared.timers.lock().unwrap().cancel(id) {
            Ok(())
        } else {
            Err(LoopError::TimerNotFound)
        }
    }

    /// Batched cancel; one result per id, in order.
    pub fn cancel_timers(&self, ids: &[TimerId]) -> Vec<Result<(), LoopError>> {
        ids.iter().map(|&id| self.cancel_timer(id)).collect()
    }

    /// Watch `fd`, invoking `cb` on the loop thread when ready. Flips
    /// the loop onto the I/O sleeping path (in `Auto` mode).
    pub fn register_fd<F>(&self, fd: i32, events: Events, cb: F) -> Result<(), LoopError>
    where
        F: Fn(Events) + Send + Sync + 'static,
    {
        if !self.shared.state.load().is_live() {
            return Err(LoopError::Terminated);
        }
        let guarded: IoCallback = Arc::new(move |revents| {
            run_hook_guarded("io_callback", || cb(revents));
        });
        self.shared.poller.register_fd(fd, events, guarded)?;
        // Re-park: a channel sleeper would never see this fd.
        self.shared.wake();
        Ok(())
    }

    pub fn unregister_fd(&self, fd: i32) -> Result<(), LoopError> {
        self.shared.poller.unregister_fd(fd)?;
        self.shared.wake();
        Ok(())
    }

    pub fn modify_fd(&self, fd: i32, events: Events) -> Result<(), LoopError> {
        self.shared.poller.modify_fd(fd, events)?;
        self.shared.wake();
        Ok(())
    }

    /// De-duplicated wake; no-op unless sleeping.
    pub fn wake(&self) {
        self.shared.wake();
    }

    /// Request cooperative termination and wait (up to `deadline`) for
    /// the loop thread to finish its final drain and exit. Idempotent:
    /// returns Ok after full termination, `Terminated` while another
    /// shutdown is still in flight.
    pub fn shutdown(&self, deadline: Option<Duration>) -> Result<(), LoopError> {
        let shared = &self.shared;
        match shared.state.request_terminate() {
            LoopState::Terminated => return Ok(()),
            LoopState::Terminating => return Err(LoopError::Terminated),
            LoopState::Awake => {
                // Never ran: drain on the caller.
                self.inline_terminate();
                return Ok(());
            }
            LoopState::Running | LoopState::Sleeping => {}
        }

        if shared.on_loop_thread() {
            // Requested from inside a task; the loop exits at the next
            // tick boundary and cannot be waited on from here.
            return Ok(());
        }

        shared.wake_for_terminate();

        let limit = deadline.map(|d| Instant::now() + d);
        let (lock, cv) = &shared.exited;
        let mut done = lock.lock().unwrap();
        while !*done {
            match limit {
                Some(limit) => {
                    let now = Instant::now();
                    if now >= limit {
                        return Err(LoopError::DeadlineExceeded);
                    }
                    let (guard, _result) = cv.wait_timeout(done, limit - now).unwrap();
                    done = guard;
                }
                None => done = cv.wait(done).unwrap(),
            }
        }
        Ok(())
    }

    /// Forceful synchronous shutdown for loops that never ran.
    pub fn close(&self) -> Result<(), LoopError> {
        if self.shared.state.load() == LoopState::Terminated {
            return Ok(());
        }
        self.shutdown(None)
    }

    /// Metrics snapshot; zeros when metrics are disabled.
    pub fn metrics(&self) -> MetricsSnapshot {
        self.shared
            .metrics
            .as_ref()
            .map(|m| m.snapshot())
            .unwrap_or_default()
    }

    // ---- loop internals ----

    fn exec_task(&self, task: Task) {
        match &self.shared.metrics {
            Some(metrics) => {
                let start = Instant::now();
                run_guarded(task);
                metrics.record_task(start.elapsed());
            }
            None => run_guarded(task),
        }
    }

    fn drain_ingress(
        &self,
        queue: &ChunkedQueue,
        scratch: &mut Vec<Task>,
        overload_reported: &mut bool,
    ) {
        let shared = &self.shared;
        scratch.clear();
        queue.pop_batch(scratch, SCRATCH_BATCH);
        for task in scratch.drain(..) {
            self.exec_task(task);
            if shared.strict {
                self.microtask_checkpoint();
            }
        }

        if !queue.is_empty() && !*overload_reported {
            *overload_reported = true;
            match &shared.on_overload {
                Some(hook) => run_hook_guarded("on_overload", || hook(&LoopError::Overloaded)),
                None => tracing::warn!("ingress queue overloaded"),
            }
        }
    }

    /// Drain next-tick tasks then microtasks, repeating until both are
    /// empty; anything they enqueue runs in the same checkpoint.
    fn microtask_checkpoint(&self) {
        let shared = &self.shared;
        loop {
            let mut progressed = false;
            loop {
                let task = shared.next_tick.lock().unwrap().pop_front();
                match task {
                    Some(task) => {
                        progressed = true;
                        self.exec_task(task);
                    }
                    None => break,
                }
            }
            while let Some(task) = shared.microtasks.pop() {
                progressed = true;
                self.exec_task(task);
            }
            if !progressed {
                break;
            }
        }
    }

    fn fire_timers(&self, due: &mut Vec<FireEntry>) {
        let shared = &self.shared;
        let now = Instant::now();
        shared.timers.lock().unwrap().collect_due(now, due);

        for mut entry in due.drain(..) {
            // A cancel that landed after collection still wins.
            if entry.is_canceled() {
                continue;
            }

            let start = shared.metrics.as_ref().map(|_| Instant::now());
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| (entry.callback)())) {
                tracing::error!(
                    panic = %panic_message(payload.as_ref()),
                    "timer callback panicked"
                );
            }
            if let (Some(metrics), Some(start)) = (&shared.metrics, start) {
                metrics.record_task(start.elapsed());
            }

            if entry.interval && !entry.is_canceled() {
                shared
                    .timers
                    .lock()
                    .unwrap()
                    .restore_callback(entry.id, entry.callback);
            }

            if shared.strict {
                self.microtask_checkpoint();
            }
        }
    }

    fn drain_aux(&self) {
        let jobs = std::mem::take(&mut *self.shared.aux_jobs.lock().unwrap());
        for task in jobs {
            self.exec_task(task);
            if self.shared.strict {
                self.microtask_checkpoint();
            }
        }
    }

    fn compute_timeout(&self) -> Option<Duration> {
        let shared = &self.shared;
        if shared.has_pending_work() {
            return Some(Duration::ZERO);
        }
        shared
            .timers
            .lock()
            .unwrap()
            .next_deadline()
            .map(|when| when.saturating_duration_since(Instant::now()))
    }

    /// Run everything still queued. Used for the Terminating →
    /// Terminated drain and its post-finalize sweep.
    fn shutdown_drain(&self, scratch: &mut Vec<Task>) {
        let shared = &self.shared;
        loop {
            let mut progressed = false;

            scratch.clear();
            if shared.external.pop_batch(scratch, SCRATCH_BATCH) > 0 {
                progressed = true;
            }
            for task in scratch.drain(..) {
                self.exec_task(task);
            }

            scratch.clear();
            if shared.internal.pop_batch(scratch, SCRATCH_BATCH) > 0 {
                progressed = true;
            }
            for task in scratch.drain(..) {
                self.exec_task(task);
            }

            {
                let has_checkpoint_work = !shared.microtasks.is_empty()
                    || !shared.next_tick.lock().unwrap().is_empty();
                if has_checkpoint_work {
                    progressed = true;
                    self.microtask_checkpoint();
                }
            }

            let jobs = std::mem::take(&mut *shared.aux_jobs.lock().unwrap());
            if !jobs.is_empty() {
                progressed = true;
                for task in jobs {
                    self.exec_task(task);
                }
            }

            if !progressed {
                break;
            }
        }

        shared
            .rejections
            .scan(shared.on_unhandled_rejection.as_ref());
    }

    /// Shutdown for a loop that never ran: drain on the calling thread.
    fn inline_terminate(&self) {
        let shared = &self.shared;
        let mut scratch = Vec::with_capacity(SCRATCH_BATCH);
        self.shutdown_drain(&mut scratch);
        shared.timers.lock().unwrap().clear();
        shared.poller.close();
        shared.state.finalize();
        self.shutdown_drain(&mut scratch);

        let (lock, cv) = &shared.exited;
        let mut done = lock.lock().unwrap();
        *done = true;
        cv.notify_all();
    }
}

fn timeout_to_ms(timeout: Option<Duration>) -> i32 {
    match timeout {
        None => -1,
        Some(d) if d.is_zero() => 0,
        Some(d) => {
            // Round up so sub-millisecond waits don't spin.
            let ms = (d.as_micros() + 999) / 1000;
            ms.min(i32::MAX as u128) as i32
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::thread::JoinHandle;

    fn start(options: Options) -> (EventLoop, JoinHandle<Result<(), LoopError>>) {
        let ev = EventLoop::new(options).unwrap();
        let runner = ev.clone();
        let handle = std::thread::spawn(move || runner.run(None));
        while ev.state() == LoopState::Awake {
            std::thread::yield_now();
        }
        (ev, handle)
    }

    fn wait_for(deadline: Duration, mut done: impl FnMut() -> bool) -> bool {
        let limit = Instant::now() + deadline;
        while Instant::now() < limit {
            if done() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        done()
    }

    type OrderLog = Arc<Mutex<Vec<&'static str>>>;

    fn record(log: &OrderLog, label: &'static str) {
        log.lock().unwrap().push(label);
    }

    /// Submit A (queues microtask M1) and B (queues M2); batch mode runs
    /// both tasks before any microtask.
    #[test]
    fn batch_mode_orders_tasks_before_microtasks() {
        let (ev, handle) = start(Options::default());
        let log: OrderLog = Arc::new(Mutex::new(Vec::new()));

        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        ev.submit(move || gate_rx.recv().unwrap()).unwrap();

        for (task_label, micro_label) in [("A", "M1"), ("B", "M2")] {
            let log_task = log.clone();
            let ev_inner = ev.clone();
            ev.submit(move || {
                record(&log_task, task_label);
                let log_micro = log_task.clone();
                ev_inner
                    .schedule_microtask(move || record(&log_micro, micro_label))
                    .unwrap();
            })
            .unwrap();
        }
        gate_tx.send(()).unwrap();

        assert!(wait_for(Duration::from_secs(5), || log.lock().unwrap().len() == 4));
        assert_eq!(*log.lock().unwrap(), vec!["A", "B", "M1", "M2"]);

        ev.shutdown(None).unwrap();
        handle.join().unwrap().unwrap();
    }

    /// Same scenario under strict ordering: the checkpoint follows every
    /// task individually.
    #[test]
    fn strict_mode_interleaves_microtasks() {
        let options = Options {
            strict_microtasks: true,
            ..Options::default()
        };
        let (ev, handle) = start(options);
        let log: OrderLog = Arc::new(Mutex::new(Vec::new()));

        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        ev.submit(move || gate_rx.recv().unwrap()).unwrap();

        for (task_label, micro_label) in [("A", "M1"), ("B", "M2")] {
            let log_task = log.clone();
            let ev_inner = ev.clone();
            ev.submit(move || {
                record(&log_task, task_label);
                let log_micro = log_task.clone();
                ev_inner
                    .schedule_microtask(move || record(&log_micro, micro_label))
                    .unwrap();
            })
            .unwrap();
        }
        gate_tx.send(()).unwrap();

        assert!(wait_for(Duration::from_secs(5), || log.lock().unwrap().len() == 4));
        assert_eq!(*log.lock().unwrap(), vec!["A", "M1", "B", "M2"]);

        ev.shutdown(None).unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn next_tick_runs_before_microtasks() {
        let (ev, handle) = start(Options::default());
        let log: OrderLog = Arc::new(Mutex::new(Vec::new()));

        let ev_inner = ev.clone();
        let log_outer = log.clone();
        ev.submit(move || {
            let log_micro = log_outer.clone();
            ev_inner
                .schedule_microtask(move || record(&log_micro, "micro"))
                .unwrap();
            let log_tick = log_outer.clone();
            ev_inner
                .schedule_next_tick(move || record(&log_tick, "tick"))
                .unwrap();
        })
        .unwrap();

        assert!(wait_for(Duration::from_secs(5), || log.lock().unwrap().len() == 2));
        assert_eq!(*log.lock().unwrap(), vec!["tick", "micro"]);

        ev.shutdown(None).unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn submitted_tasks_run_exactly_once_across_producers() {
        let (ev, handle) = start(Options::default());
        let count = Arc::new(AtomicUsize::new(0));

        let mut producers = Vec::new();
        for _ in 0..4 {
            let ev = ev.clone();
            let count = count.clone();
            producers.push(std::thread::spawn(move || {
                for _ in 0..500 {
                    let count = count.clone();
                    ev.submit(move || {
                        count.fetch_add(1, Ordering::SeqCst);
                    })
                    .unwrap();
                }
            }));
        }
        for p in producers {
            p.join().unwrap();
        }

        assert!(wait_for(Duration::from_secs(5), || {
            count.load(Ordering::SeqCst) == 2000
        }));

        ev.shutdown(None).unwrap();
        handle.join().unwrap().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 2000);
    }

    #[test]
    fn submit_internal_executes_inline_on_loop_thread() {
        let (ev, handle) = start(Options::default());
        let log: OrderLog = Arc::new(Mutex::new(Vec::new()));

        let ev_inner = ev.clone();
        let log_outer = log.clone();
        ev.submit(move || {
            let log_inline = log_outer.clone();
            ev_inner
                .submit_internal(move || record(&log_inline, "inline"))
                .unwrap();
            record(&log_outer, "after");
        })
        .unwrap();

        assert!(wait_for(Duration::from_secs(5), || log.lock().unwrap().len() == 2));
        assert_eq!(*log.lock().unwrap(), vec!["inline", "after"]);

        ev.shutdown(None).unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn panicking_task_does_not_kill_the_loop() {
        let (ev, handle) = start(Options::default());
        let ran = Arc::new(AtomicBool::new(false));

        ev.submit(|| panic!("boom")).unwrap();
        let ran2 = ran.clone();
        ev.submit(move || ran2.store(true, Ordering::SeqCst)).unwrap();

        assert!(wait_for(Duration::from_secs(5), || ran.load(Ordering::SeqCst)));

        ev.shutdown(None).unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn timer_fires_after_delay() {
        let (ev, handle) = start(Options::default());
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();

        ev.schedule_timer(Duration::from_millis(10), move || {
            fired2.store(true, Ordering::SeqCst);
        })
        .unwrap();

        assert!(wait_for(Duration::from_secs(5), || fired.load(Ordering::SeqCst)));

        ev.shutdown(None).unwrap();
        handle.join().unwrap().unwrap();
    }

    /// Cancel an hour-long timer immediately; its callback never runs
    /// and the second cancel misses.
    #[test]
    fn timer_cancel_before_fire() {
        let (ev, handle) = start(Options::default());
        let fired = Arc::new(AtomicBool::new(false));
        let fired2 = fired.clone();

        let id = ev
            .schedule_timer(Duration::from_secs(3600), move || {
                fired2.store(true, Ordering::SeqCst);
            })
            .unwrap();
        ev.cancel_timer(id).unwrap();

        std::thread::sleep(Duration::from_millis(50));
        assert!(!fired.load(Ordering::SeqCst));
        assert!(matches!(ev.cancel_timer(id), Err(LoopError::TimerNotFound)));

        ev.shutdown(None).unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn interval_repeats_until_canceled() {
        let (ev, handle) = start(Options::default());
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();

        let id = ev
            .schedule_interval(Duration::from_millis(5), Duration::from_millis(5), move || {
                count2.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();

        assert!(wait_for(Duration::from_secs(5), || {
            count.load(Ordering::SeqCst) >= 3
        }));
        ev.cancel_timer(id).unwrap();

        // Let a fire that was already in flight at cancel time finish.
        std::thread::sleep(Duration::from_millis(20));
        let settled = count.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(count.load(Ordering::SeqCst), settled);

        ev.shutdown(None).unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn batched_cancel_reports_per_entry() {
        let (ev, handle) = start(Options::default());
        let a = ev.schedule_timer(Duration::from_secs(3600), || {}).unwrap();
        let b = ev.schedule_timer(Duration::from_secs(3600), || {}).unwrap();
        ev.cancel_timer(b).unwrap();

        let results = ev.cancel_timers(&[a, b]);
        assert!(results[0].is_ok());
        assert!(matches!(results[1], Err(LoopError::TimerNotFound)));

        ev.shutdown(None).unwrap();
        handle.join().unwrap().unwrap();
    }

    /// Rejected promise with no handler: the host hook hears about it
    /// exactly once, with the reason.
    #[test]
    fn unhandled_rejection_reported_once() {
        let reports: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
        let reports2 = reports.clone();
        let options = Options {
            on_unhandled_rejection: Some(Box::new(move |report| {
                let reason = report
                    .reason
                    .downcast_ref::<String>()
                    .cloned()
                    .unwrap_or_default();
                reports2.lock().unwrap().push(reason);
            })),
            ..Options::default()
        };
        let (ev, handle) = start(options);

        let p = ChainedPromise::new(&ev);
        p.reject(crate::promise::value(String::from("boom")));
        // Give the loop a tick to scan.
        ev.submit(|| {}).unwrap();

        assert!(wait_for(Duration::from_secs(5), || {
            !reports.lock().unwrap().is_empty()
        }));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(*reports.lock().unwrap(), vec!["boom".to_string()]);

        ev.shutdown(None).unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn handled_rejection_is_not_reported() {
        let reports = Arc::new(AtomicUsize::new(0));
        let reports2 = reports.clone();
        let options = Options {
            on_unhandled_rejection: Some(Box::new(move |_| {
                reports2.fetch_add(1, Ordering::SeqCst);
            })),
            ..Options::default()
        };
        let (ev, handle) = start(options);

        let p = ChainedPromise::new(&ev);
        let caught = Arc::new(AtomicBool::new(false));
        let caught2 = caught.clone();
        p.catch_err(move |r| {
            caught2.store(true, Ordering::SeqCst);
            r
        });
        p.reject(crate::promise::value(String::from("handled")));

        assert!(wait_for(Duration::from_secs(5), || caught.load(Ordering::SeqCst)));
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(reports.load(Ordering::SeqCst), 0);

        ev.shutdown(None).unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn debug_mode_attaches_creation_stack() {
        let stacks: Arc<Mutex<Vec<Option<String>>>> = Arc::new(Mutex::new(Vec::new()));
        let stacks2 = stacks.clone();
        let options = Options {
            debug_mode: true,
            on_unhandled_rejection: Some(Box::new(move |report| {
                stacks2.lock().unwrap().push(report.creation_stack);
            })),
            ..Options::default()
        };
        let (ev, handle) = start(options);

        let p = ChainedPromise::new(&ev);
        p.reject(crate::promise::value(0u8));
        ev.submit(|| {}).unwrap();

        assert!(wait_for(Duration::from_secs(5), || {
            !stacks.lock().unwrap().is_empty()
        }));
        assert!(stacks.lock().unwrap()[0].is_some());

        ev.shutdown(None).unwrap();
        handle.join().unwrap().unwrap();
    }

    /// FD registration moves the loop onto the I/O sleeping path and
    /// dispatches readiness callbacks; unregistering reverts it.
    #[test]
    fn fd_registration_toggles_io_path() {
        let (ev, handle) = start(Options::default());

        let mut fds = [0i32; 2];
        assert_eq!(
            unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_NONBLOCK | libc::O_CLOEXEC) },
            0
        );
        let (read_fd, write_fd) = (fds[0], fds[1]);

        let hits = Arc::new(AtomicUsize::new(0));
        let hits2 = hits.clone();
        let drain_fd = read_fd;
        ev.register_fd(read_fd, Events::READABLE, move |_| {
            let mut buf = [0u8; 16];
            unsafe { libc::read(drain_fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len()) };
            hits2.fetch_add(1, Ordering::SeqCst);
        })
        .unwrap();

        unsafe { libc::write(write_fd, b"x".as_ptr() as *const libc::c_void, 1) };
        assert!(wait_for(Duration::from_secs(5), || {
            hits.load(Ordering::SeqCst) >= 1
        }));

        ev.unregister_fd(read_fd).unwrap();
        let before = hits.load(Ordering::SeqCst);
        unsafe { libc::write(write_fd, b"y".as_ptr() as *const libc::c_void, 1) };
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(hits.load(Ordering::SeqCst), before);

        // Channel-path sleep again: submissions still wake the loop.
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        ev.submit(move || ran2.store(true, Ordering::SeqCst)).unwrap();
        assert!(wait_for(Duration::from_secs(5), || ran.load(Ordering::SeqCst)));

        unsafe {
            libc::close(read_fd);
            libc::close(write_fd);
        }
        ev.shutdown(None).unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn overload_hook_fires_at_most_once_per_tick() {
        let overloads = Arc::new(AtomicUsize::new(0));
        let overloads2 = overloads.clone();
        let options = Options {
            on_overload: Some(Box::new(move |err| {
                assert!(matches!(err, LoopError::Overloaded));
                overloads2.fetch_add(1, Ordering::SeqCst);
            })),
            ..Options::default()
        };
        let (ev, handle) = start(options);

        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        ev.submit(move || gate_rx.recv().unwrap()).unwrap();

        let done = Arc::new(AtomicUsize::new(0));
        for _ in 0..(SCRATCH_BATCH + 50) {
            let done = done.clone();
            ev.submit(move || {
                done.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        gate_tx.send(()).unwrap();

        assert!(wait_for(Duration::from_secs(5), || {
            done.load(Ordering::SeqCst) == SCRATCH_BATCH + 50
        }));
        // The backlog exceeded one scratch batch, so at least one tick
        // reported; each reporting tick reported exactly once.
        let reported = overloads.load(Ordering::SeqCst);
        assert!((1..=2).contains(&reported), "reported {reported}");

        ev.shutdown(None).unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn run_twice_is_rejected() {
        let (ev, handle) = start(Options::default());
        assert!(matches!(ev.run(None), Err(LoopError::AlreadyRunning)));
        ev.shutdown(None).unwrap();
        handle.join().unwrap().unwrap();
        assert!(matches!(ev.run(None), Err(LoopError::Terminated)));
    }

    #[test]
    fn shutdown_is_idempotent_and_rejects_submissions() {
        let (ev, handle) = start(Options::default());
        ev.shutdown(None).unwrap();
        handle.join().unwrap().unwrap();

        assert!(ev.shutdown(None).is_ok());
        assert!(matches!(ev.submit(|| {}), Err(LoopError::Terminated)));
        assert!(matches!(
            ev.schedule_microtask(|| {}),
            Err(LoopError::Terminated)
        ));
        assert!(matches!(
            ev.schedule_timer(Duration::from_millis(1), || {}),
            Err(LoopError::Terminated)
        ));
        assert_eq!(ev.state(), LoopState::Terminated);
    }

    #[test]
    fn shutdown_drains_pending_tasks() {
        let (ev, handle) = start(Options::default());
        let count = Arc::new(AtomicUsize::new(0));

        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        ev.submit(move || gate_rx.recv().unwrap()).unwrap();
        for _ in 0..100 {
            let count = count.clone();
            ev.submit(move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }

        let closer = {
            let ev = ev.clone();
            std::thread::spawn(move || ev.shutdown(None))
        };
        // Let the shutdown request land while the loop is blocked.
        std::thread::sleep(Duration::from_millis(20));
        gate_tx.send(()).unwrap();

        closer.join().unwrap().unwrap();
        handle.join().unwrap().unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 100);
    }

    #[test]
    fn shutdown_deadline_expires_while_loop_is_stuck() {
        let (ev, handle) = start(Options::default());

        let (gate_tx, gate_rx) = mpsc::channel::<()>();
        ev.submit(move || gate_rx.recv().unwrap()).unwrap();
        std::thread::sleep(Duration::from_millis(10));

        assert!(matches!(
            ev.shutdown(Some(Duration::from_millis(30))),
            Err(LoopError::DeadlineExceeded)
        ));

        gate_tx.send(()).unwrap();
        handle.join().unwrap().unwrap();
        assert_eq!(ev.state(), LoopState::Terminated);
    }

    #[test]
    fn close_never_run_drains_inline() {
        let ev = EventLoop::new(Options::default()).unwrap();
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        ev.submit(move || ran2.store(true, Ordering::SeqCst)).unwrap();

        ev.close().unwrap();
        assert!(ran.load(Ordering::SeqCst));
        assert_eq!(ev.state(), LoopState::Terminated);

        // Close ∘ Close = Close.
        ev.close().unwrap();
        assert!(matches!(ev.run(None), Err(LoopError::Terminated)));
    }

    #[test]
    fn cancel_token_stops_run() {
        let ev = EventLoop::new(Options::default()).unwrap();
        let token = Arc::new(CancelToken::new());
        let runner = ev.clone();
        let token2 = token.clone();
        let handle = std::thread::spawn(move || runner.run(Some(token2)));
        while ev.state() == LoopState::Awake {
            std::thread::yield_now();
        }

        token.cancel();
        ev.wake();
        assert!(matches!(handle.join().unwrap(), Err(LoopError::Canceled)));
        assert_eq!(ev.state(), LoopState::Terminated);
    }

    #[test]
    fn wake_without_sleep_is_a_noop() {
        let (ev, handle) = start(Options::default());
        for _ in 0..100 {
            ev.wake();
        }
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        ev.submit(move || ran2.store(true, Ordering::SeqCst)).unwrap();
        assert!(wait_for(Duration::from_secs(5), || ran.load(Ordering::SeqCst)));
        ev.shutdown(None).unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn metrics_observe_task_flow() {
        let options = Options {
            metrics: true,
            ..Options::default()
        };
        let (ev, handle) = start(options);

        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..8 {
            let count = count.clone();
            ev.submit(move || {
                std::thread::sleep(Duration::from_millis(2));
                count.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
        }
        assert!(wait_for(Duration::from_secs(5), || {
            count.load(Ordering::SeqCst) == 8
        }));

        // Eight 2ms tasks put the median latency well above 100µs.
        let snapshot = ev.metrics();
        assert!(
            snapshot.task_latency_p50_us > 100.0,
            "p50 {}",
            snapshot.task_latency_p50_us
        );

        ev.shutdown(None).unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn forced_fast_path_keeps_channel_sleep_with_fds() {
        let options = Options {
            fast_path_mode: FastPathMode::Forced,
            ..Options::default()
        };
        let (ev, handle) = start(options);

        // Submissions keep flowing on the channel path.
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        ev.submit(move || ran2.store(true, Ordering::SeqCst)).unwrap();
        assert!(wait_for(Duration::from_secs(5), || ran.load(Ordering::SeqCst)));

        ev.shutdown(None).unwrap();
        handle.join().unwrap().unwrap();
    }

    #[test]
    fn disabled_fast_path_sleeps_in_poller() {
        let options = Options {
            fast_path_mode: FastPathMode::Disabled,
            ..Options::default()
        };
        let (ev, handle) = start(options);

        let count = Arc::new(AtomicUsize::new(0));
        for _ in 0..10 {
            let count = count.clone();
            ev.submit(move || {
                count.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
            std::thread::sleep(Duration::from_millis(2));
        }
        assert!(wait_for(Duration::from_secs(5), || {
            count.load(Ordering::SeqCst) == 10
        }));

        ev.shutdown(None).unwrap();
        handle.join().unwrap().unwrap();
    }
}
