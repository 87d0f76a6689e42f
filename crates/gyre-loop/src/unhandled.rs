// SPDX-License-Identifier: (MIT OR Apache-2.0)
//! Unhandled-rejection tracking.
//!
//! Rejected promises enroll here; once per tick the loop scans the set
//! and reports every promise that still has no handler attached. Every
//! scanned promise is unenrolled whether or not it was reported, so the
//! set never grows without bound.

use std::sync::Mutex;

use crate::promise::{ChainedPromise, Value};
use crate::task::run_hook_guarded;

/// What the host's rejection hook receives. `creation_stack` is
/// populated when the loop runs in debug mode.
pub struct RejectionReport {
    pub reason: Value,
    pub creation_stack: Option<String>,
}

/// Host callback for rejections nobody handled.
pub type RejectionHook = Box<dyn Fn(RejectionReport) + Send + Sync>;

pub(crate) struct RejectionTracker {
    enrolled: Mutex<Vec<ChainedPromise>>,
}

impl RejectionTracker {
    pub fn new() -> Self {
        Self {
            enrolled: Mutex::new(Vec::new()),
        }
    }

    pub fn enroll(&self, promise: ChainedPromise) {
        self.enrolled.lock().unwrap().push(promise);
    }

    /// Report still-unhandled rejections and clear the set. Called once
    /// per tick on the loop thread.
    pub fn scan(&self, hook: Option<&RejectionHook>) {
        let scanned = {
            let mut enrolled = self.enrolled.lock().unwrap();
            if enrolled.is_empty() {
                return;
            }
            std::mem::take(&mut *enrolled)
        };

        for promise in scanned {
            if promise.has_handler_flag() {
                continue;
            }
            let Some(reason) = promise.result() else {
                continue;
            };
            if let Some(hook) = hook {
                let report = RejectionReport {
                    reason,
                    creation_stack: promise.creation_stack(),
                };
                run_hook_guarded("on_unhandled_rejection", || hook(report));
            } else {
                tracing::warn!("unhandled promise rejection");
            }
        }
    }

    #[cfg(test)]
    pub fn enrolled_count(&self) -> usize {
        self.enrolled.lock().unwrap().len()
    }
}
