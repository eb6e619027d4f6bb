// SPDX-License-Identifier: MPL-2.0

//! The grace-period protocol: per-processor reader state, the scheduler
//! hooks, and the writer path.

use core::marker::PhantomData;
use std::sync::Arc;

use core::sync::atomic::{
    compiler_fence, fence, AtomicBool, AtomicI32, AtomicU32, AtomicU64,
    Ordering::{AcqRel, Acquire, Relaxed, Release, SeqCst},
};

use crossbeam_utils::{Backoff, CachePadded};
use parking_lot::{Mutex, MutexGuard};
use spin::Mutex as SpinLock;

use crate::callback::BarrierState;
use crate::cblist::CallbackList;
use crate::cpu::{self, CpuId, CpuSet};
use crate::smp::{CallQueue, CrossCall};
use crate::sync::WaitQueue;

// # Explanation on the memory orders
//
// ```
// [the reader]                     [the writer]
// online = 1;
// fence(SeqCst);                   global_version += 1;
// locked += 1;                     fence(SeqCst);
// load shared pointer;             if online == 0 { skip cpu; }
// ```
//
// The two fences order the reader's `online` store against the writer's
// probe. Either the reader's fence comes first, in which case the probe sees
// `online == 1` and the writer asks the processor to report (and then waits
// for `locked` to drain through `report` or the context-switch hook), or the
// writer's fence comes first, in which case the reader's later loads see the
// writer's already-published update and the critical section needs no
// waiting.
//
// A reader leaving its outermost critical section publishes the global
// version into its slot with a release compare-exchange (`report`), and the
// writer's await loop loads slot versions with acquire, so everything read
// inside the critical section happens before the writer observes the
// processor as passed. Readers whose depth was donated synchronize with the
// writer through the acq-rel updates of `active_ctr` instead.
//
// `locked` itself is only ever written by the owning processor's context, so
// plain (relaxed) loads and stores suffice for it; the reader fast path
// performs no atomic read-modify-write.

/// The state of one processor.
///
/// Mutated only by the owning processor's execution context; the quiescent
/// handler also runs on that context, when the mailbox is drained. Other
/// processors only read `online` and `version`.
pub(crate) struct PerCpu {
    /// Nesting depth of read-side critical sections on this processor.
    locked: AtomicU32,
    /// 1 from the first `read_lock` after a context switch until the next
    /// context switch.
    online: AtomicU32,
    /// The grace-period version this processor has acknowledged.
    /// Monotonically non-decreasing.
    version: AtomicU64,
    /// The most recent callback version the drainer has observed here.
    pub(crate) cb_version: AtomicU64,
    /// Callbacks awaiting a grace period, oldest first.
    pub(crate) cblist: SpinLock<CallbackList>,
    /// Incoming cross-processor requests.
    mailbox: CallQueue,
    /// The deferred-work line for the callback drainer.
    pub(crate) softirq_raised: AtomicBool,
    /// Whether some thread currently is this processor's execution context.
    occupied: AtomicBool,
}

impl PerCpu {
    fn new() -> Self {
        Self {
            locked: AtomicU32::new(0),
            online: AtomicU32::new(0),
            version: AtomicU64::new(0),
            cb_version: AtomicU64::new(0),
            cblist: SpinLock::new(CallbackList::new()),
            mailbox: CallQueue::new(),
            softirq_raised: AtomicBool::new(false),
            occupied: AtomicBool::new(false),
        }
    }

    /// Reads the version this processor has acknowledged.
    pub(crate) fn version(&self) -> u64 {
        self.version.load(Acquire)
    }
}

/// The process-wide state shared by all processors.
pub(crate) struct Global {
    /// Incremented by each `synchronize` to define a new grace period.
    global_version: AtomicU64,
    /// Trails `global_version`; authorizes callbacks stamped below it.
    pub(crate) cb_version: AtomicU64,
    /// Read-side nesting depth donated by context-switched readers.
    active_ctr: AtomicI32,
    /// Serializes the probe/await/drain phases of `synchronize`.
    mtx: Mutex<()>,
    /// Serializes `barrier`.
    pub(crate) barrier_mtx: Mutex<()>,
    /// Where `synchronize` sleeps while donated readers remain.
    wait_q: WaitQueue,
    /// The latch `barrier` waits on. Shared with the sentinel callbacks.
    pub(crate) barrier: Arc<BarrierState>,
}

/// A preemptible read-copy-update domain over a fixed set of processors.
///
/// `Prcu` models a machine with `num_cpus` processors. The embedding
/// scheduler or test harness binds threads to processors with
/// [`Prcu::enter`], invokes [`Prcu::note_context_switch`] whenever a context
/// leaves its processor, and calls [`Prcu::check_callbacks`] from a periodic
/// per-processor tick. Under that contract, readers are nearly wait-free:
/// the `read_lock`/`read_unlock` fast path is a handful of plain loads and
/// stores on the processor's own cache line.
///
/// # Examples
///
/// ```
/// use prcu::{CpuId, Prcu};
///
/// let prcu = Prcu::new(2);
/// let cpu = prcu.enter(CpuId::new(0));
///
/// prcu.read_lock();
/// // ... read shared state ...
/// prcu.read_unlock();
///
/// // Wait until every critical section that was active here has ended.
/// prcu.synchronize();
/// drop(cpu);
/// ```
pub struct Prcu {
    pub(crate) global: Global,
    pub(crate) cpus: Box<[CachePadded<PerCpu>]>,
}

/// A guard that makes the calling thread the execution context of one
/// processor.
///
/// Dropping the guard performs a context switch on the processor, exactly as
/// [`Prcu::note_context_switch`] would, and then releases the processor for
/// another context to enter.
#[clippy::has_significant_drop]
#[must_use]
pub struct ProcessorGuard<'a> {
    prcu: &'a Prcu,
    cpu: CpuId,
    // Bindings are thread-local; the guard must be dropped where it was
    // created.
    _not_send: PhantomData<*mut ()>,
}

impl ProcessorGuard<'_> {
    /// Returns the processor this guard binds to.
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }
}

impl Drop for ProcessorGuard<'_> {
    fn drop(&mut self) {
        self.prcu.note_context_switch();
        cpu::clear_current();
        // Release-store pairs with the acquire in `enter`, handing the slot
        // to the next context with everything this one did made visible.
        self.prcu.slot(self.cpu).occupied.store(false, Release);
    }
}

impl Prcu {
    /// Creates a new domain with `num_cpus` processors, all idle.
    ///
    /// # Panics
    ///
    /// Panics if `num_cpus` is zero.
    pub fn new(num_cpus: usize) -> Self {
        assert!(num_cpus > 0, "a machine needs at least one processor");
        Self {
            global: Global {
                global_version: AtomicU64::new(0),
                cb_version: AtomicU64::new(0),
                active_ctr: AtomicI32::new(0),
                mtx: Mutex::new(()),
                barrier_mtx: Mutex::new(()),
                wait_q: WaitQueue::new(),
                barrier: Arc::new(BarrierState::new()),
            },
            cpus: (0..num_cpus)
                .map(|_| CachePadded::new(PerCpu::new()))
                .collect(),
        }
    }

    /// Returns the number of processors in this domain.
    pub fn num_cpus(&self) -> usize {
        self.cpus.len()
    }

    /// Binds the calling thread to `cpu`, making it the processor's current
    /// execution context.
    ///
    /// # Panics
    ///
    /// Panics if `cpu` is out of range, if the calling thread is already
    /// bound to a processor, or if `cpu` already has an execution context.
    pub fn enter(&self, cpu: CpuId) -> ProcessorGuard<'_> {
        assert!(
            cpu.as_usize() < self.num_cpus(),
            "{cpu} does not exist in this domain"
        );
        assert!(
            cpu::current().is_none(),
            "the thread is already running on a processor"
        );
        let slot = self.slot(cpu);
        assert!(
            !slot.occupied.swap(true, Acquire),
            "{cpu} already has an execution context"
        );
        cpu::set_current(cpu);
        ProcessorGuard {
            prcu: self,
            cpu,
            _not_send: PhantomData,
        }
    }

    /// Marks the beginning of a read-side critical section.
    ///
    /// Never blocks and never fails; critical sections may be nested to any
    /// depth. A section may be preempted and migrated: run
    /// [`Self::note_context_switch`] on the old processor, then finish the
    /// section from a context on any other processor.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread is not bound to a processor.
    pub fn read_lock(&self) {
        let local = self.local();
        self.poll_cross_calls(local);

        if local.online.load(Relaxed) == 0 {
            local.online.store(1, Relaxed);
            // Pairs with the writer's fence between bumping the global
            // version and probing `online`; see the top of this file.
            fence(SeqCst);
        }

        local.locked.store(local.locked.load(Relaxed) + 1, Relaxed);
    }

    /// Marks the end of a read-side critical section.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread is not bound to a processor. Calling
    /// this without a matching [`Self::read_lock`] on the same logical
    /// reader is a caller error; debug builds assert against it.
    pub fn read_unlock(&self) {
        // Keep the critical section's accesses ahead of the decrement.
        compiler_fence(SeqCst);

        let local = self.local();
        self.poll_cross_calls(local);

        let locked = local.locked.load(Relaxed);
        if locked != 0 {
            local.locked.store(locked - 1, Relaxed);
            if locked == 1 {
                self.report(local);
            }
        } else {
            // The section's depth was donated to `active_ctr` by a context
            // switch; pay the debt back globally.
            let remaining = self.global.active_ctr.fetch_sub(1, AcqRel) - 1;
            debug_assert!(remaining >= 0, "read_unlock without a matching read_lock");
            if remaining == 0 {
                self.global.wait_q.wake_all();
            }
        }
    }

    /// Waits until every read-side critical section that was active when
    /// this method was called has ended.
    ///
    /// Concurrent callers serialize internally; each gets its own,
    /// monotonically increasing grace-period version.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread is not bound to a processor.
    pub fn synchronize(&self) {
        self.synchronize_inner();
    }

    pub(crate) fn synchronize_inner(&self) -> u64 {
        let this_cpu = self.this_cpu();
        let version = self.global.global_version.fetch_add(1, Relaxed) + 1;
        let _writer = self.lock_surrendering(&self.global.mtx);
        log::trace!("grace period {version} started on {this_cpu}");

        // The writer itself trivially passes the grace period. `fetch_max`
        // rather than a store: a concurrent writer may already have advanced
        // this slot past `version` through `report`.
        self.slot(this_cpu).version.fetch_max(version, AcqRel);

        // Pairs with the fence on the reader's `online` 0 -> 1 transition.
        fence(SeqCst);

        // Probe phase: ask every lagging online processor to report. A
        // processor with `online == 0` had a context switch that already
        // published a version on its behalf.
        let mut lagging = CpuSet::new_empty(self.num_cpus());
        for (id, slot) in self.cpus.iter().enumerate() {
            if slot.online.load(Acquire) == 0 {
                continue;
            }
            if slot.version.load(Acquire) < version {
                slot.mailbox.post(CrossCall::ReportQuiescent);
                lagging.add(CpuId::new(id as u32));
            }
        }

        // Await phase: a lagging processor reports through its handler, its
        // outermost `read_unlock`, or its next context switch.
        for cpu in lagging.iter() {
            let slot = self.slot(cpu);
            let backoff = Backoff::new();
            while slot.version.load(Acquire) < version {
                backoff.snooze();
            }
        }

        // Drain phase: wait out readers whose depth was donated by a
        // context switch.
        if self.global.active_ctr.load(Acquire) != 0 {
            self.note_context_switch();
            self.global
                .wait_q
                .wait_until(|| (self.global.active_ctr.load(Acquire) == 0).then_some(()));
        }

        // Authorize every callback enqueued before this grace period.
        // `fetch_max` keeps the callback version monotonic when a writer
        // with a smaller version finishes later.
        self.global.cb_version.fetch_max(version, AcqRel);
        log::trace!("grace period {version} complete");
        version
    }

    /// Tells the domain that the current processor's context is about to be
    /// switched out.
    ///
    /// Any read-side nesting depth held here is donated to the global pool,
    /// the processor goes offline until its next `read_lock`, and the
    /// current global version is published on the processor's behalf.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread is not bound to a processor.
    pub fn note_context_switch(&self) {
        let local = self.local();
        self.poll_cross_calls(local);

        let locked = local.locked.load(Relaxed);
        if locked != 0 {
            self.global.active_ctr.fetch_add(locked as i32, AcqRel);
            local.locked.store(0, Relaxed);
        }
        local.online.store(0, Release);
        self.report(local);
    }

    /// Publishes the current global version into `local` if it is ahead.
    ///
    /// A failed compare-exchange means a concurrent writer already advanced
    /// this processor past our load; that is fine and is not retried.
    fn report(&self, local: &PerCpu) {
        let global_version = self.global.global_version.load(Acquire);
        let local_version = local.version.load(Acquire);
        if global_version > local_version {
            let _ = local
                .version
                .compare_exchange(local_version, global_version, AcqRel, Acquire);
        }
    }

    /// The cross-call handler: report this processor as passed, unless a
    /// reader is mid-section here, in which case its unlock will report.
    fn report_quiescent(&self, local: &PerCpu) {
        if local.locked.load(Relaxed) == 0 {
            local
                .version
                .store(self.global.global_version.load(Acquire), Release);
        }
    }

    /// Drains the current processor's mailbox, if anything is in it.
    pub(crate) fn poll_cross_calls(&self, local: &PerCpu) {
        if !local.mailbox.has_pending() {
            return;
        }
        local.mailbox.drain(|call| match call {
            CrossCall::ReportQuiescent => self.report_quiescent(local),
        });
    }

    /// Takes `mtx`, surrendering the processor first if that would block.
    ///
    /// Sleeping inside the kernel means the scheduler switches the processor
    /// to another task, so a writer that blocks here must not keep its
    /// processor counted as online.
    pub(crate) fn lock_surrendering<'a>(&self, mtx: &'a Mutex<()>) -> MutexGuard<'a, ()> {
        if let Some(guard) = mtx.try_lock() {
            return guard;
        }
        self.note_context_switch();
        mtx.lock()
    }

    pub(crate) fn slot(&self, cpu: CpuId) -> &PerCpu {
        &self.cpus[cpu.as_usize()]
    }

    /// The state of the processor the calling thread is bound to.
    pub(crate) fn local(&self) -> &PerCpu {
        self.slot(self.this_cpu())
    }

    pub(crate) fn local_opt(&self) -> Option<&PerCpu> {
        let cpu = cpu::current()?;
        Some(self.slot(cpu))
    }

    fn this_cpu(&self) -> CpuId {
        let cpu = cpu::current().expect("not running on a processor");
        assert!(
            cpu.as_usize() < self.num_cpus(),
            "{cpu} does not exist in this domain"
        );
        cpu
    }

    #[cfg(test)]
    pub(crate) fn active_ctr(&self) -> i32 {
        self.global.active_ctr.load(Acquire)
    }

    #[cfg(test)]
    pub(crate) fn versions(&self) -> (u64, u64) {
        (
            self.global.global_version.load(Acquire),
            self.global.cb_version.load(Acquire),
        )
    }
}
