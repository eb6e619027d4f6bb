// SPDX-License-Identifier: MPL-2.0

//! Cross-processor requests.
//!
//! This module provides a way to ask another processor to execute a short
//! handler, standing in for an inter-processor interrupt. A request is posted
//! to the target processor's queue; the target's execution context drains the
//! queue at every operation boundary at which an interrupt could have been
//! taken. Handlers run on the target's own context with the queue lock held,
//! so they cannot interleave with the target's other processor-local work.
//!
//! Posting does not wait for the target to acknowledge the request. Callers
//! that need to observe the handler's effect poll the state the handler
//! publishes.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex as SpinLock;

/// A request for a remote processor.
pub(crate) enum CrossCall {
    /// Publish the current global grace-period version into the target's
    /// slot, unless the target is inside a read-side critical section.
    ReportQuiescent,
}

/// A per-processor queue of pending [`CrossCall`]s.
pub(crate) struct CallQueue {
    /// A copy of `calls.is_empty()`, so the empty check on the reader fast
    /// path is a single plain load.
    pending: AtomicBool,
    calls: SpinLock<VecDeque<CrossCall>>,
}

impl CallQueue {
    pub(crate) fn new() -> Self {
        Self {
            pending: AtomicBool::new(false),
            calls: SpinLock::new(VecDeque::new()),
        }
    }

    /// Posts a request to this processor.
    pub(crate) fn post(&self, call: CrossCall) {
        let mut calls = self.calls.lock();
        calls.push_back(call);
        self.pending.store(true, Ordering::Release);
    }

    /// Returns whether any request is waiting to be drained.
    pub(crate) fn has_pending(&self) -> bool {
        self.pending.load(Ordering::Relaxed)
    }

    /// Drains the queue, running `handle` for each request.
    ///
    /// Must be called on the owning processor's execution context. The queue
    /// lock is held across the handlers.
    pub(crate) fn drain(&self, mut handle: impl FnMut(CrossCall)) {
        let mut calls = self.calls.lock();
        self.pending.store(false, Ordering::Relaxed);
        while let Some(call) = calls.pop_front() {
            handle(call);
        }
    }
}
