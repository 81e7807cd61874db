// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Architecture collaborators consumed by the kernel core
//! OWNERS: @kernel-arch-team
//! PUBLIC API: Cpu, Mmu, Continuation, Resume, PageRights, PageTableRoot, MmuError
//! DEPENDS_ON: types::{CpuId, PhysAddr}
//! INVARIANTS: A Continuation is only read by restore_context after a
//!             save_context or prepare_context filled it; page-table edits
//!             happen under the owning mspace lock
//!
//! The core never touches registers or page-table entries itself. Everything
//! ISA specific sits behind these two traits; `hal::sim` implements them on
//! the host for tests and `hal::riscv` on bare-metal RISC-V.

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub mod riscv;
#[cfg(test)]
pub mod sim;

use core::ptr::NonNull;

use bitflags::bitflags;

use crate::types::{CpuId, PhysAddr};

/// Machine words reserved for one saved register file.
pub const CONTEXT_WORDS: usize = 32;

/// Opaque saved register file of a suspended task.
#[derive(Clone, Debug, PartialEq, Eq)]
#[repr(C, align(16))]
pub struct Continuation {
    words: [usize; CONTEXT_WORDS],
}

static_assertions::assert_eq_size!(Continuation, [usize; CONTEXT_WORDS]);

impl Continuation {
    pub const fn zeroed() -> Self {
        Self { words: [0; CONTEXT_WORDS] }
    }

    pub fn words(&self) -> &[usize; CONTEXT_WORDS] {
        &self.words
    }

    pub fn words_mut(&mut self) -> &mut [usize; CONTEXT_WORDS] {
        &mut self.words
    }
}

impl Default for Continuation {
    fn default() -> Self {
        Self::zeroed()
    }
}

/// Outcome of [`Cpu::save_context`]: the checkpoint call itself, or a later
/// arrival through [`Cpu::restore_context`].
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    Checkpoint,
    Resumed,
}

/// First instruction of a new task; never returns.
pub type TaskEntry = extern "C" fn() -> !;

/// Processor-local primitives.
pub trait Cpu: Sync {
    fn current_processor_id(&self) -> CpuId;

    /// Free-running hardware counter; diagnostic only.
    fn monotonic_clock_ticks(&self) -> u64;

    /// Fills `ctx` so that restoring it starts `entry` on `stack_top`.
    fn prepare_context(&self, ctx: &mut Continuation, entry: TaskEntry, stack_top: usize);

    /// Captures the calling register state into `ctx`.
    ///
    /// Returns [`Resume::Checkpoint`] immediately and [`Resume::Resumed`]
    /// when a later `restore_context(ctx)` lands here.
    ///
    /// # Safety
    /// `ctx` must stay valid until restored or discarded, and the caller's
    /// frame must still be live when the checkpoint is resumed.
    unsafe fn save_context(&self, ctx: NonNull<Continuation>) -> Resume;

    /// Jumps into a checkpoint taken by `save_context` or built by
    /// `prepare_context`.
    ///
    /// # Safety
    /// `ctx` must hold a valid continuation whose stack is not in use.
    unsafe fn restore_context(&self, ctx: NonNull<Continuation>) -> !;

    /// Stack loaded by trap entry while the next task runs.
    fn set_trap_stack(&self, top: usize);

    /// Unmasks interrupt delivery, waits for one interrupt, masks again.
    fn halt(&self);

    /// Programs the next periodic tick `period_us` from now.
    fn arm_tick(&self, period_us: u64);
}

bitflags! {
    /// Rights installed into a hardware page-table entry.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct PageRights: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXECUTE = 1 << 2;
        const USER = 1 << 3;
    }
}

/// Opaque root of one hardware page table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageTableRoot(usize);

impl PageTableRoot {
    pub const fn from_raw(raw: usize) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> usize {
        self.0
    }
}

/// Errors reported by page-table edits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmuError {
    /// No memory left for intermediate table levels or a new root.
    OutOfMemory,
    /// The root is unknown to the MMU.
    InvalidRoot,
}

/// Page tables and physical frames.
pub trait Mmu: Send + Sync {
    fn create_root(&self) -> Result<PageTableRoot, MmuError>;
    fn destroy_root(&self, root: PageTableRoot);

    /// Makes `root` the active translation on the calling processor;
    /// `None` selects the kernel-only table.
    fn activate(&self, root: Option<PageTableRoot>);

    fn alloc_frame(&self) -> Option<PhysAddr>;
    fn free_frame(&self, frame: PhysAddr);
    fn zero_frame(&self, frame: PhysAddr);
    fn copy_frame(&self, dst: PhysAddr, src: PhysAddr);
    /// Runs `f` over the bytes of `frame`.
    fn with_frame(&self, frame: PhysAddr, f: &mut dyn FnMut(&mut [u8]));

    /// Installs or replaces the translation of the page at `vaddr`.
    fn resolve_page(
        &self,
        root: PageTableRoot,
        vaddr: usize,
        frame: PhysAddr,
        rights: PageRights,
    ) -> Result<(), MmuError>;
    fn drop_page(&self, root: PageTableRoot, vaddr: usize);
    fn protect_page(&self, root: PageTableRoot, vaddr: usize, rights: PageRights);
}
