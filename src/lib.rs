// SPDX-License-Identifier: MPL-2.0

//! Preemptible read-copy-update (PRCU).
//!
//! PRCU is a read-mostly mutual-exclusion mechanism. Readers mark their
//! critical sections with [`Prcu::read_lock`] and [`Prcu::read_unlock`],
//! which touch nothing but their own processor's cache line and perform no
//! atomic read-modify-write. Writers publish a new version of the shared
//! state and then either wait for a _grace period_ with
//! [`Prcu::synchronize`], or defer reclamation with [`Prcu::call`] and let
//! the per-processor drainer run it once a grace period has passed. A grace
//! period ends when every processor has been observed outside any read-side
//! critical section that was active at its start.
//!
//! Unlike classic RCU, readers may be preempted and migrated while inside a
//! critical section. The scheduler hook [`Prcu::note_context_switch`]
//! donates a preempted reader's nesting depth to a global counter, and the
//! reader's eventual `read_unlock`, possibly on another processor, pays the
//! debt back there.
//!
//! # The machine model
//!
//! A [`Prcu`] domain models a machine with a fixed number of processors.
//! The embedding scheduler, runtime, or test harness supplies the
//! environment the mechanism expects from a kernel:
//!
//! - a thread becomes a processor's execution context via [`Prcu::enter`];
//! - the context runs [`Prcu::note_context_switch`] when it is switched out
//!   (dropping the [`ProcessorGuard`] does this automatically);
//! - a periodic per-processor tick calls [`Prcu::check_callbacks`], which
//!   also delivers pending cross-processor requests and dispatches the
//!   callback drainer.
//!
//! # Examples
//!
//! ```
//! use std::sync::atomic::{AtomicPtr, Ordering};
//!
//! use prcu::{CpuId, Prcu};
//!
//! let prcu = Prcu::new(2);
//! let shared = AtomicPtr::new(Box::into_raw(Box::new(1u32)));
//!
//! let cpu = prcu.enter(CpuId::new(0));
//!
//! // A reader dereferences the shared pointer only inside a critical
//! // section.
//! prcu.read_lock();
//! let value = unsafe { *shared.load(Ordering::Acquire) };
//! assert_eq!(value, 1);
//! prcu.read_unlock();
//!
//! // A writer unpublishes the old value, waits for a grace period, and
//! // only then frees it.
//! let old = shared.swap(Box::into_raw(Box::new(2u32)), Ordering::AcqRel);
//! prcu.synchronize();
//! drop(unsafe { Box::from_raw(old) });
//!
//! drop(unsafe { Box::from_raw(shared.load(Ordering::Acquire)) });
//! drop(cpu);
//! ```

#![warn(missing_docs)]

mod callback;
mod cblist;
mod cpu;
mod prcu;
mod smp;
mod sync;

pub use self::cpu::{CpuId, CpuSet};
pub use self::prcu::{Prcu, ProcessorGuard};
