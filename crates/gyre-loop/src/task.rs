// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Task type and the panic barrier.
//!
//! A task is an owned, parameterless callable. Every user callback runs
//! behind `run_guarded`: a panicking task is one bad input, not a bad
//! loop.

use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};

/// An owned unit of work, uniquely held from submission to execution.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Render a panic payload for logs and `PanicError` values.
pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Run a task behind the panic barrier. Panics are logged and swallowed;
/// the loop continues.
pub(crate) fn run_guarded(task: Task) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(task)) {
        tracing::error!(panic = %panic_message(payload.as_ref()), "task panicked");
    }
}

/// Run a host-supplied hook behind the panic barrier, naming it in the
/// log line when it misbehaves.
pub(crate) fn run_hook_guarded(name: &str, hook: impl FnOnce()) {
    if let Err(payload) = catch_unwind(AssertUnwindSafe(hook)) {
        tracing::error!(hook = name, panic = %panic_message(payload.as_ref()), "hook panicked");
    }
}
