// SPDX-License-Identifier: MPL-2.0

use parking_lot::{Condvar, Mutex};

/// A one-shot event latch.
///
/// A completion starts (and can be re-armed) in the not-done state. Waiters
/// block until some thread calls [`Completion::complete`]. Waiting on a
/// completed latch returns immediately, no matter how the calls interleave.
pub(crate) struct Completion {
    done: Mutex<bool>,
    cond: Condvar,
}

impl Completion {
    pub(crate) const fn new() -> Self {
        Self {
            done: Mutex::new(false),
            cond: Condvar::new(),
        }
    }

    /// Re-arms the latch. No thread may be waiting on it when this is called.
    pub(crate) fn reinit(&self) {
        *self.done.lock() = false;
    }

    /// Completes the latch and wakes up all waiters.
    pub(crate) fn complete(&self) {
        let mut done = self.done.lock();
        *done = true;
        self.cond.notify_all();
    }

    /// Blocks until the latch is completed.
    pub(crate) fn wait(&self) {
        let mut done = self.done.lock();
        while !*done {
            self.cond.wait(&mut done);
        }
    }
}
