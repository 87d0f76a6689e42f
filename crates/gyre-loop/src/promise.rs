// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Promise state machine and combinators.
//!
//! Promises/A+ semantics over dynamically-typed values: one-shot
//! settlement, handler registration with an inline first slot, chain
//! resolution with cycle detection, thenable adoption, and combinators.
//! Handlers always execute as microtasks on the owning loop; a promise
//! holds only a weak reference to its loop and never keeps it alive.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};

use crate::cancel::CancelToken;
use crate::error::LoopError;
use crate::event_loop::{EventLoop, Shared};
use crate::task::panic_message;

/// Dynamically-typed promise value: fulfillment values and rejection
/// reasons alike.
pub type Value = Arc<dyn Any + Send + Sync>;

/// Wrap an arbitrary value for the promise surface.
pub fn value<T: Any + Send + Sync>(v: T) -> Value {
    Arc::new(v)
}

/// JS-style type error, used for chain-cycle rejections.
#[derive(Debug, Clone)]
pub struct TypeError {
    pub message: String,
}

/// A panic captured at a handler boundary, delivered as a rejection
/// reason to the chained child.
#[derive(Debug, Clone)]
pub struct PanicError {
    pub message: String,
}

/// Settlement callbacks handed to a foreign thenable.
pub type SettleFn = Box<dyn FnOnce(Value) + Send>;

/// Foreign-thenable capability. Resolving a promise with a
/// `Value` containing an `Arc<dyn Thenable>` adopts its settlement.
/// Implementations must eventually call at most one of the two
/// callbacks; the adopter's one-shot settlement tolerates overcalls.
pub trait Thenable: Send + Sync {
    fn then(&self, on_fulfilled: SettleFn, on_rejected: SettleFn);
}

/// Promise settlement states.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromiseState {
    Pending = 0,
    Fulfilled = 1,
    Rejected = 2,
}

impl PromiseState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => Self::Pending,
            1 => Self::Fulfilled,
            _ => Self::Rejected,
        }
    }
}

/// Transform applied to the settlement value before it reaches the
/// chained child.
pub type HandlerFn = Box<dyn FnOnce(Value) -> Value + Send>;

pub(crate) struct Handler {
    on_fulfilled: Option<HandlerFn>,
    on_rejected: Option<HandlerFn>,
    /// Child settled with the handler outcome. `None` for handlers that
    /// settle other promises themselves (`finally`, `all`).
    target: Option<ChainedPromise>,
}

struct Slots {
    result: Option<Value>,
    h0: Option<Handler>,
    overflow: Option<Vec<Handler>>,
}

struct PromiseInner {
    state: AtomicU8,
    /// Guards result and the handler slots. Never held across user code.
    slots: Mutex<Slots>,
    has_handler: AtomicBool,
    creation_stack: Option<String>,
    loop_ref: Weak<Shared>,
    debug: bool,
}

/// A chainable promise bound to one event loop. Cloning shares the
/// underlying state.
#[derive(Clone)]
pub struct ChainedPromise {
    inner: Arc<PromiseInner>,
}

impl ChainedPromise {
    pub fn new(ev: &EventLoop) -> Self {
        Self::with_shared(Arc::downgrade(ev.shared()), ev.shared().debug_mode())
    }

    pub(crate) fn with_shared(loop_ref: Weak<Shared>, debug: bool) -> Self {
        let creation_stack = if debug {
            Some(std::backtrace::Backtrace::force_capture().to_string())
        } else {
            None
        };
        Self {
            inner: Arc::new(PromiseInner {
                state: AtomicU8::new(PromiseState::Pending as u8),
                slots: Mutex::new(Slots {
                    result: None,
                    h0: None,
                    overflow: None,
                }),
                has_handler: AtomicBool::new(false),
                creation_stack,
                loop_ref,
                debug,
            }),
        }
    }

    /// An already-fulfilled promise.
    pub fn resolved(ev: &EventLoop, v: Value) -> Self {
        let p = Self::new(ev);
        p.resolve(v);
        p
    }

    /// An already-rejected promise.
    pub fn rejected(ev: &EventLoop, reason: Value) -> Self {
        let p = Self::new(ev);
        p.reject(reason);
        p
    }

    pub fn state(&self) -> PromiseState {
        PromiseState::from_u8(self.inner.state.load(Ordering::Acquire))
    }

    /// Settled result (fulfillment value or rejection reason).
    pub fn result(&self) -> Option<Value> {
        if self.state() == PromiseState::Pending {
            return None;
        }
        self.inner.slots.lock().unwrap().result.clone()
    }

    pub(crate) fn has_handler_flag(&self) -> bool {
        self.inner.has_handler.load(Ordering::Acquire)
    }

    pub(crate) fn creation_stack(&self) -> Option<String> {
        self.inner.creation_stack.clone()
    }

    fn new_child(&self) -> ChainedPromise {
        Self::with_shared(self.inner.loop_ref.clone(), self.inner.debug)
    }

    /// Resolve with a value. Resolving with the promise itself rejects
    /// with a chaining-cycle `TypeError`; resolving with another promise
    /// or a thenable adopts its settlement; anything else fulfills.
    /// A no-op once settled.
    pub fn resolve(&self, v: Value) {
        if let Some(other) = v.downcast_ref::<ChainedPromise>() {
            if Arc::ptr_eq(&other.inner, &self.inner) {
                self.reject(value(TypeError {
                    message: "Chaining cycle detected for promise".to_string(),
                }));
                return;
            }
            // Adopt: a bare-target handler forwards the eventual
            // settlement to us.
            other.add_handler(Handler {
                on_fulfilled: None,
                on_rejected: None,
                target: Some(self.clone()),
            });
            return;
        }

        if let Some(thenable) = v.downcast_ref::<Arc<dyn Thenable>>() {
            let on_f = {
                let this = self.clone();
                Box::new(move |v| this.resolve(v)) as SettleFn
            };
            let on_r = {
                let this = self.clone();
                Box::new(move |r| this.reject(r)) as SettleFn
            };
            thenable.then(on_f, on_r);
            return;
        }

        self.settle(PromiseState::Fulfilled, v);
    }

    /// Reject with a reason. A no-op once settled. Enrolls with the
    /// loop's unhandled-rejection tracker.
    pub fn reject(&self, reason: Value) {
        if self.settle(PromiseState::Rejected, reason) {
            if let Some(shared) = self.inner.loop_ref.upgrade() {
                shared.enroll_rejection(self.clone());
            }
        }
    }

    /// One-shot settlement. Returns true when this call performed the
    /// transition.
    fn settle(&self, to: PromiseState, result: Value) -> bool {
        if self
            .inner
            .state
            .compare_exchange(
                PromiseState::Pending as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return false;
        }

        let mut handlers = Vec::new();
        {
            let mut slots = self.inner.slots.lock().unwrap();
            slots.result = Some(result.clone());
            if let Some(h0) = slots.h0.take() {
                handlers.push(h0);
            }
            if let Some(overflow) = slots.overflow.take() {
                handlers.extend(overflow);
            }
        }

        for handler in handlers {
            self.dispatch(handler, to, result.clone());
        }
        true
    }

    /// Register a handler: runs when settled, exactly once. Handlers
    /// attached after settlement dispatch straight to the microtask
    /// queue.
    pub(crate) fn add_handler(&self, handler: Handler) {
        self.inner.has_handler.store(true, Ordering::Release);

        // Optimistic read; no lock needed for the settled case.
        let state = self.state();
        if state != PromiseState::Pending {
            let result = self.inner.slots.lock().unwrap().result.clone();
            self.dispatch(handler, state, result.expect("settled without result"));
            return;
        }

        let late = {
            let mut slots = self.inner.slots.lock().unwrap();
            // Settlement may have raced ahead of us; re-check under the
            // lock, where a settled promise's result is already visible.
            let state = self.state();
            if state == PromiseState::Pending {
                if slots.h0.is_none() {
                    slots.h0 = Some(handler);
                } else {
                    slots.overflow.get_or_insert_with(Vec::new).push(handler);
                }
                None
            } else {
                let result = slots.result.clone().expect("settled without result");
                Some((handler, state, result))
            }
        };

        if let Some((handler, state, result)) = late {
            self.dispatch(handler, state, result);
        }
    }

    fn dispatch(&self, handler: Handler, state: PromiseState, result: Value) {
        let Some(shared) = self.inner.loop_ref.upgrade() else {
            // Loop is gone; the handler can never run on it.
            return;
        };
        shared.promise_microtask(Box::new(move || run_handler(handler, state, result)));
    }

    /// Chain with a fulfillment transform: `p.then(f)`.
    pub fn then<F>(&self, on_fulfilled: F) -> ChainedPromise
    where
        F: FnOnce(Value) -> Value + Send + 'static,
    {
        self.then_with(Some(Box::new(on_fulfilled)), None)
    }

    /// Chain with a rejection transform: `p.catch(f)`.
    pub fn catch_err<F>(&self, on_rejected: F) -> ChainedPromise
    where
        F: FnOnce(Value) -> Value + Send + 'static,
    {
        self.then_with(None, Some(Box::new(on_rejected)))
    }

    /// Full `then` form. Missing callbacks pass the settlement through
    /// to the child unchanged.
    pub fn then_with(
        &self,
        on_fulfilled: Option<HandlerFn>,
        on_rejected: Option<HandlerFn>,
    ) -> ChainedPromise {
        let child = self.new_child();
        self.add_handler(Handler {
            on_fulfilled,
            on_rejected,
            target: Some(child.clone()),
        });
        child
    }

    /// Run `f` on either settlement, then forward the original
    /// settlement to the child. A panic inside `f` still forwards.
    pub fn finally<F>(&self, f: F) -> ChainedPromise
    where
        F: FnOnce() + Send + 'static,
    {
        let child = self.new_child();
        let cell = Arc::new(Mutex::new(Some(f)));

        let on_fulfilled = {
            let child = child.clone();
            let cell = cell.clone();
            Box::new(move |v: Value| {
                run_finally_cell(&cell);
                child.resolve(v.clone());
                v
            }) as HandlerFn
        };
        let on_rejected = {
            let child = child.clone();
            Box::new(move |r: Value| {
                run_finally_cell(&cell);
                child.reject(r.clone());
                r
            }) as HandlerFn
        };

        self.add_handler(Handler {
            on_fulfilled: Some(on_fulfilled),
            on_rejected: Some(on_rejected),
            target: None,
        });
        child
    }

    /// Resolve to the list of all fulfillment values (as `Vec<Value>`),
    /// or reject with the first rejection.
    pub fn all(ev: &EventLoop, promises: Vec<ChainedPromise>) -> ChainedPromise {
        let child = ChainedPromise::new(ev);
        let n = promises.len();
        if n == 0 {
            child.resolve(value(Vec::<Value>::new()));
            return child;
        }

        let results: Arc<Mutex<Vec<Option<Value>>>> = Arc::new(Mutex::new(vec![None; n]));
        let remaining = Arc::new(AtomicUsize::new(n));

        for (i, p) in promises.into_iter().enumerate() {
            let on_fulfilled = {
                let child = child.clone();
                let results = results.clone();
                let remaining = remaining.clone();
                Box::new(move |v: Value| {
                    results.lock().unwrap()[i] = Some(v.clone());
                    if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        let collected: Vec<Value> = results
                            .lock()
                            .unwrap()
                            .iter()
                            .map(|slot| slot.clone().expect("all slots filled"))
                            .collect();
                        child.resolve(value(collected));
                    }
                    v
                }) as HandlerFn
            };
            let on_rejected = {
                let child = child.clone();
                Box::new(move |r: Value| {
                    child.reject(r.clone());
                    r
                }) as HandlerFn
            };
            p.add_handler(Handler {
                on_fulfilled: Some(on_fulfilled),
                on_rejected: Some(on_rejected),
                target: None,
            });
        }

        child
    }
}

impl std::fmt::Debug for ChainedPromise {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChainedPromise")
            .field("state", &self.state())
            .field("has_handler", &self.has_handler_flag())
            .finish()
    }
}

fn run_finally_cell<F: FnOnce() + Send>(cell: &Arc<Mutex<Option<F>>>) {
    if let Some(f) = cell.lock().unwrap().take() {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(f)) {
            tracing::error!(
                panic = %panic_message(payload.as_ref()),
                "finally callback panicked"
            );
        }
    }
}

/// Execute a stored handler against a settlement. Runs as a microtask.
fn run_handler(handler: Handler, state: PromiseState, result: Value) {
    let callback = match state {
        PromiseState::Fulfilled => handler.on_fulfilled,
        PromiseState::Rejected => handler.on_rejected,
        PromiseState::Pending => unreachable!("dispatched while pending"),
    };

    match (callback, handler.target) {
        (Some(f), Some(target)) => match catch_unwind(AssertUnwindSafe(|| f(result))) {
            Ok(out) => target.resolve(out),
            Err(payload) => target.reject(value(PanicError {
                message: panic_message(payload.as_ref()),
            })),
        },
        (Some(f), None) => {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| f(result))) {
                tracing::error!(
                    panic = %panic_message(payload.as_ref()),
                    "promise handler panicked"
                );
            }
        }
        (None, Some(target)) => match state {
            PromiseState::Fulfilled => target.resolve(result),
            PromiseState::Rejected => target.reject(result),
            PromiseState::Pending => unreachable!(),
        },
        (None, None) => {}
    }
}

/// Complete a promise from work running off the loop thread. `f` runs
/// on a fresh producer thread; a fired `token` settles the promise with
/// `LoopError::Canceled` instead, without interrupting `f`.
pub fn promisify<F>(ev: &EventLoop, token: Option<Arc<CancelToken>>, f: F) -> ChainedPromise
where
    F: FnOnce() -> Result<Value, Value> + Send + 'static,
{
    let promise = ChainedPromise::new(ev);

    {
        let promise = promise.clone();
        std::thread::spawn(move || match f() {
            Ok(v) => promise.resolve(v),
            Err(r) => promise.reject(r),
        });
    }

    if let Some(token) = token {
        let promise = promise.clone();
        std::thread::spawn(move || loop {
            if promise.state() != PromiseState::Pending {
                return;
            }
            if token.wait_timeout(std::time::Duration::from_millis(5)) {
                promise.reject(value(LoopError::Canceled));
                return;
            }
        });
    }

    promise
}
