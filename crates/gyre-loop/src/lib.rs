// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! gyre: an embeddable event-loop runtime.
//!
//! A single loop thread owns all task execution and runs a
//! poll → tasks → microtasks → timers cycle; producers on any thread
//! submit work through low-contention ingress queues and de-duplicated
//! wakeups. On top of the scheduler sits a JavaScript-style surface:
//! microtasks, one-shot and interval timers, and Promises/A+ chained
//! promises with unhandled-rejection tracking.
//!
//! Components:
//! - `event_loop` — tick orchestration, submit surface, lifecycle
//! - `ingress`    — chunked multi-producer task queues
//! - `ring`       — microtask ring with overflow
//! - `timer`      — deadline min-heap with indexed cancellation
//! - `state`      — Awake/Running/Sleeping/Terminating/Terminated CAS
//! - `wake`       — park channel + wake-signal de-duplication
//! - `promise`    — promise state machine and combinators
//! - `unhandled`  — rejection tracking
//! - `metrics`    — queue-depth EMA, P² latency quantiles
//!
//! I/O readiness (epoll/kqueue) lives in the `gyre-poll` crate; the
//! loop only sees its `Poller` capability.

mod cancel;
mod error;
mod event_loop;
mod ingress;
mod metrics;
mod promise;
mod ring;
mod state;
mod task;
mod timer;
mod unhandled;
mod wake;

pub use cancel::{cancel_after, CancelToken};
pub use error::LoopError;
pub use event_loop::{EventLoop, FastPathMode, Options, OverloadHook};
pub use metrics::MetricsSnapshot;
pub use promise::{
    promisify, value, ChainedPromise, HandlerFn, PanicError, PromiseState, SettleFn, Thenable,
    TypeError, Value,
};
pub use state::LoopState;
pub use task::Task;
pub use timer::TimerId;
pub use unhandled::{RejectionHook, RejectionReport};

pub use gyre_poll::{Events, PollError, Poller};
