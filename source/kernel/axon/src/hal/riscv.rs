// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Bare-metal RISC-V (S-mode, SBI) implementation of `Cpu`
//! OWNERS: @kernel-arch-team
//! PUBLIC API: RiscvCpu, IRQ_OPS, install_irq_ops()
//! DEPENDS_ON: riscv::register::{sstatus, time}, sbi_rt::set_timer,
//!             axon_context_save/axon_context_restore from the arch assembly
//! INVARIANTS: `tp` holds the logical hart id; the continuation layout is
//!             owned by the assembly (ra at word 0, sp at word 1)

use core::ptr::NonNull;

use riscv::register::{sstatus, time};

use crate::types::CpuId;

use super::{Continuation, Cpu, Resume, TaskEntry};

/// Timebase of the QEMU `virt` machine.
#[cfg(feature = "timer_irq")]
const TIMEBASE_HZ: u64 = 10_000_000;
#[cfg(feature = "timer_irq")]
const CYCLES_PER_US: u64 = TIMEBASE_HZ / 1_000_000;

const RA: usize = 0;
const SP: usize = 1;

extern "C" {
    /// Stores callee-saved registers, `ra` and `sp` into `ctx`; returns 0,
    /// or 1 when entered again through `axon_context_restore`.
    fn axon_context_save(ctx: *mut Continuation) -> usize;
    /// Loads `ctx` and returns into it with 1 in `a0`.
    fn axon_context_restore(ctx: *const Continuation) -> !;
}

#[inline]
fn hart_index() -> usize {
    let id: usize;
    // SAFETY: reads `tp`, which boot glue loads with the hart index.
    unsafe { core::arch::asm!("mv {}, tp", out(reg) id, options(nomem, nostack, preserves_flags)) };
    id
}

fn irq_disable() -> bool {
    let was = sstatus::read().sie();
    // SAFETY: masking supervisor interrupts is always sound.
    unsafe { sstatus::clear_sie() };
    was
}

fn irq_enable() {
    // SAFETY: only reached from pop_off once no spin lock is held here.
    unsafe { sstatus::set_sie() };
}

pub static IRQ_OPS: axon_sync::irq::IrqOps =
    axon_sync::irq::IrqOps { disable: irq_disable, enable: irq_enable, cpu_id: hart_index };

/// Wires `axon_sync` nesting to `sstatus.SIE`. Call before the first lock.
pub fn install_irq_ops() {
    axon_sync::irq::install(&IRQ_OPS);
}

#[derive(Debug, Default)]
pub struct RiscvCpu;

impl Cpu for RiscvCpu {
    fn current_processor_id(&self) -> CpuId {
        CpuId::from_raw(hart_index() as u32)
    }

    fn monotonic_clock_ticks(&self) -> u64 {
        time::read64()
    }

    fn prepare_context(&self, ctx: &mut Continuation, entry: TaskEntry, stack_top: usize) {
        *ctx = Continuation::zeroed();
        let words = ctx.words_mut();
        words[RA] = entry as usize;
        words[SP] = stack_top;
    }

    unsafe fn save_context(&self, ctx: NonNull<Continuation>) -> Resume {
        // SAFETY: forwarded from the caller's contract.
        match unsafe { axon_context_save(ctx.as_ptr()) } {
            0 => Resume::Checkpoint,
            _ => Resume::Resumed,
        }
    }

    unsafe fn restore_context(&self, ctx: NonNull<Continuation>) -> ! {
        // SAFETY: forwarded from the caller's contract.
        unsafe { axon_context_restore(ctx.as_ptr()) }
    }

    fn set_trap_stack(&self, top: usize) {
        // SAFETY: sscratch is only read by the trap entry of this hart.
        unsafe { riscv::register::sscratch::write(top) };
    }

    fn halt(&self) {
        irq_enable();
        // SAFETY: wfi has no memory effects.
        unsafe { core::arch::asm!("wfi", options(nomem, nostack, preserves_flags)) };
        irq_disable();
    }

    fn arm_tick(&self, period_us: u64) {
        #[cfg(feature = "timer_irq")]
        {
            let next = time::read64().wrapping_add(period_us.saturating_mul(CYCLES_PER_US));
            let _ = sbi_rt::set_timer(next);
        }
        #[cfg(not(feature = "timer_irq"))]
        let _ = period_us;
    }
}
