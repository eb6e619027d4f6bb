// SPDX-License-Identifier: MPL-2.0

//! The deferred-callback subsystem: registration, the drainer, and the
//! callback barrier.

use std::sync::atomic::{
    AtomicI32,
    Ordering::{AcqRel, Acquire, Release},
};
use std::sync::Arc;

use crate::prcu::{PerCpu, Prcu};
use crate::sync::Completion;

/// The rendezvous state for [`Prcu::barrier`], shared with the sentinel
/// callbacks it plants.
pub(crate) struct BarrierState {
    cpu_count: AtomicI32,
    completion: Completion,
}

impl BarrierState {
    pub(crate) fn new() -> Self {
        Self {
            cpu_count: AtomicI32::new(0),
            completion: Completion::new(),
        }
    }

    /// Drops one count; the last arrival completes the latch.
    fn arrive(&self) {
        if self.cpu_count.fetch_sub(1, AcqRel) == 1 {
            self.completion.complete();
        }
    }
}

impl Prcu {
    /// Registers `func` to run after a future grace period ends.
    ///
    /// The callback is queued on the current processor and stamped with the
    /// grace-period version the processor has acknowledged so far; it runs
    /// on this processor's deferred-work path once the global callback
    /// version passes the stamp. Callbacks must not block; they may register
    /// further callbacks.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread is not bound to a processor.
    pub fn call<F>(&self, func: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let local = self.local();
        let mut cblist = local.cblist.lock();
        cblist.enqueue(local.version(), Box::new(func));
    }

    /// Returns whether the current processor has callbacks that a completed
    /// grace period has authorized since the drainer last ran here.
    ///
    /// Returns `false` on a thread with no processor binding.
    pub fn pending(&self) -> bool {
        let Some(local) = self.local_opt() else {
            return false;
        };
        self.pending_on(local)
    }

    fn pending_on(&self, local: &PerCpu) -> bool {
        local.cb_version.load(Acquire) < self.global.cb_version.load(Acquire)
            && !local.cblist.lock().is_empty()
    }

    /// The periodic tick hook: raises the deferred-work line when callbacks
    /// are ready, and dispatches it.
    ///
    /// Does nothing on a thread with no processor binding.
    pub fn check_callbacks(&self) {
        let Some(local) = self.local_opt() else {
            return;
        };
        self.poll_cross_calls(local);

        if self.pending_on(local) {
            local.softirq_raised.store(true, Release);
        }
        // The end of the tick is also the dispatch point for the line.
        if local.softirq_raised.swap(false, AcqRel) {
            self.process_callbacks();
        }
    }

    /// The callback drainer.
    ///
    /// Invokes, in enqueue order, every callback on the current processor
    /// whose stamp precedes the global callback version. Runs from the
    /// deferred-work path of [`Self::check_callbacks`]; it is public so an
    /// embedder with its own deferred-work context can drive it directly.
    ///
    /// Does nothing on a thread with no processor binding.
    pub fn process_callbacks(&self) {
        let Some(local) = self.local_opt() else {
            return;
        };
        let cb_version = self.global.cb_version.load(Acquire);

        // Callbacks may call back into this domain, so they run after the
        // list lock is released.
        let ready = {
            let mut cblist = local.cblist.lock();
            let mut ready = Vec::new();
            while let Some(callback) = cblist.dequeue_ready(cb_version) {
                ready.push(callback);
            }
            local.cb_version.store(cb_version, Release);
            ready
        };

        if !ready.is_empty() {
            log::trace!("invoking {} callbacks at version {cb_version}", ready.len());
        }
        for callback in ready {
            callback.invoke();
        }
    }

    /// Waits until every callback already registered at the moment of the
    /// call has been invoked.
    ///
    /// A grace period is driven internally, so the wait does not depend on
    /// concurrent [`Self::synchronize`] callers. Sentinels planted on other
    /// processors fire from those processors' ticks.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread is not bound to a processor.
    pub fn barrier(&self) {
        // Sentinel planting and the internal grace period both need a
        // processor under the caller.
        let _ = self.local();

        let _serialized = self.lock_surrendering(&self.global.barrier_mtx);
        let barrier = &self.global.barrier;
        barrier.completion.reinit();
        // Start the count at one so that a short grace period cannot
        // complete the latch while sentinels are still being planted.
        barrier.cpu_count.store(1, Release);

        let mut planted = 0;
        for slot in self.cpus.iter() {
            let mut cblist = slot.cblist.lock();
            // A processor with nothing queued has nothing for a sentinel to
            // order, and on an idle processor the sentinel could never fire.
            if cblist.is_empty() {
                continue;
            }
            barrier.cpu_count.fetch_add(1, AcqRel);
            let state = Arc::clone(barrier);
            cblist.enqueue(slot.version(), Box::new(move || state.arrive()));
            planted += 1;
        }
        log::debug!("callback barrier planted {planted} sentinels");

        // Drop the initial count.
        barrier.arrive();

        if planted > 0 {
            // Authorize every sentinel, then flush our own processor; the
            // rest drain from their ticks.
            self.synchronize();
            self.process_callbacks();
            self.note_context_switch();
            barrier.completion.wait();
        }
    }
}
