// SPDX-License-Identifier: MPL-2.0

use parking_lot::{Condvar, Mutex};

// # Explanation on the memory orders
//
// ```
// [the waker]             [the waiter]
// cond = true;
// wake_all();
//                         wait_until(|| cond);
// ```
//
// As soon as the waiter is woken up, it must see the true condition. The
// waiter re-tests the condition while holding the internal mutex, and the
// waker notifies while holding the same mutex, so a waker that changes the
// condition before calling `wake_all` cannot slip its notification into the
// window between the waiter's test and its sleep.

/// A wait queue.
///
/// One may wait on a wait queue to put its executing thread to sleep until
/// some condition is met. Other threads make the condition true and then
/// invoke [`WaitQueue::wake_all`] to wake up the waiting threads.
pub(crate) struct WaitQueue {
    lock: Mutex<()>,
    cond: Condvar,
}

impl WaitQueue {
    /// Creates a new, empty wait queue.
    pub(crate) const fn new() -> Self {
        Self {
            lock: Mutex::new(()),
            cond: Condvar::new(),
        }
    }

    /// Waits until some condition is met.
    ///
    /// This method takes a closure that tests a user-given condition and
    /// only returns once the condition returns `Some(_)`. A waker should
    /// first make the condition `Some(_)`, then invoke [`Self::wake_all`],
    /// so that no wakeup notification is lost.
    pub(crate) fn wait_until<F, R>(&self, mut cond: F) -> R
    where
        F: FnMut() -> Option<R>,
    {
        // Fast path
        if let Some(res) = cond() {
            return res;
        }

        let mut guard = self.lock.lock();
        loop {
            if let Some(res) = cond() {
                return res;
            }
            self.cond.wait(&mut guard);
        }
    }

    /// Wakes up all waiting threads.
    pub(crate) fn wake_all(&self) {
        let _guard = self.lock.lock();
        self.cond.notify_all();
    }
}
