// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: AXON kernel core: scheduler, timekeeping, tasks and address spaces
//! OWNERS: @kernel-team
//! PUBLIC API: Kernel, config, hal::{Cpu, Mmu}, mm, sched, task, time, types
//! DEPENDS_ON: axon-sync (SpinLock, irq), alloc
//! INVARIANTS: No ISA code outside `hal`; host builds link std only for tests

#![cfg_attr(not(test), no_std)]
#![forbid(clippy::unwrap_used)]

extern crate alloc;

pub mod collections;
pub mod config;
pub mod diag;
pub mod hal;
pub mod heap;
pub mod kernel;
pub mod mm;
pub mod sched;
pub mod task;
pub mod time;
pub mod types;

mod panic;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub mod uart;

pub use diag::log;
pub use kernel::Kernel;
