// SPDX-License-Identifier: MPL-2.0

//! Blocking synchronization primitives used by the grace-period machinery.

mod completion;
mod wait;

pub(crate) use self::{completion::Completion, wait::WaitQueue};
