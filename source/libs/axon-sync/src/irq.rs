// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-processor interrupt masking with nesting
//! OWNERS: @kernel-sync-team
//! PUBLIC API: install(), push_off(), pop_off(), IrqGuard, outer_enabled()
//! DEPENDS_ON: platform IrqOps installed at boot
//! INVARIANTS: Delivery stays masked while depth > 0; only the outermost
//!             pop re-enables, and only if delivery was on at the first push
//!
//! Until a platform installs its [`IrqOps`] every call is a no-op. Host
//! builds and tests therefore never share nesting state between threads.

use core::marker::PhantomData;
use core::ptr;
use core::sync::atomic::{AtomicBool, AtomicPtr, AtomicUsize, Ordering};

/// Upper bound on processor ids accepted from [`IrqOps::cpu_id`].
pub const MAX_CPUS: usize = 64;

/// Platform hooks operating on the calling processor.
pub struct IrqOps {
    /// Masks interrupt delivery and reports whether it was enabled before.
    pub disable: fn() -> bool,
    /// Unmasks interrupt delivery.
    pub enable: fn(),
    /// Index of the calling processor, `< MAX_CPUS`.
    pub cpu_id: fn() -> usize,
}

struct CpuIrq {
    depth: AtomicUsize,
    outer_enabled: AtomicBool,
}

impl CpuIrq {
    const fn new() -> Self {
        Self { depth: AtomicUsize::new(0), outer_enabled: AtomicBool::new(false) }
    }
}

#[allow(clippy::declare_interior_mutable_const)]
const CPU_IRQ_INIT: CpuIrq = CpuIrq::new();

static CPUS: [CpuIrq; MAX_CPUS] = [CPU_IRQ_INIT; MAX_CPUS];
static OPS: AtomicPtr<IrqOps> = AtomicPtr::new(ptr::null_mut());

/// Installs the platform hooks. Call once during early boot, before any
/// lock is taken with interrupts enabled.
pub fn install(ops: &'static IrqOps) {
    OPS.store(ops as *const IrqOps as *mut IrqOps, Ordering::Release);
}

fn ops() -> Option<&'static IrqOps> {
    let raw = OPS.load(Ordering::Acquire);
    // SAFETY: OPS only ever holds null or a pointer derived from a `&'static IrqOps`.
    unsafe { raw.as_ref() }
}

fn local(ops: &IrqOps) -> &'static CpuIrq {
    let id = (ops.cpu_id)();
    assert!(id < MAX_CPUS, "irq: cpu id {id} out of range");
    &CPUS[id]
}

/// Returns true once platform hooks are installed.
pub fn installed() -> bool {
    ops().is_some()
}

/// Index of the calling processor, `0` before installation.
pub fn cpu_id() -> usize {
    ops().map_or(0, |ops| (ops.cpu_id)())
}

/// Masks delivery and bumps the nesting depth of the calling processor.
pub fn push_off() {
    let Some(ops) = ops() else {
        return;
    };
    let was_enabled = (ops.disable)();
    let cpu = local(ops);
    if cpu.depth.load(Ordering::Relaxed) == 0 {
        cpu.outer_enabled.store(was_enabled, Ordering::Relaxed);
    }
    cpu.depth.fetch_add(1, Ordering::Relaxed);
}

/// Drops one nesting level; unmasks when the outermost level is released
/// and delivery was enabled before it.
pub fn pop_off() {
    let Some(ops) = ops() else {
        return;
    };
    let cpu = local(ops);
    let depth = cpu.depth.load(Ordering::Relaxed);
    assert!(depth > 0, "irq: pop_off without matching push_off");
    cpu.depth.store(depth - 1, Ordering::Relaxed);
    if depth == 1 && cpu.outer_enabled.load(Ordering::Relaxed) {
        (ops.enable)();
    }
}

/// Current nesting depth of the calling processor.
pub fn depth() -> usize {
    ops().map_or(0, |ops| local(ops).depth.load(Ordering::Relaxed))
}

/// Delivery state recorded at the outermost `push_off` of this processor.
pub fn outer_enabled() -> bool {
    ops().is_some_and(|ops| local(ops).outer_enabled.load(Ordering::Relaxed))
}

/// Overrides the recorded outer state. Used by the context switch, where the
/// resumed task carries its own view of the outer state.
pub fn set_outer_enabled(enabled: bool) {
    if let Some(ops) = ops() {
        local(ops).outer_enabled.store(enabled, Ordering::Relaxed);
    }
}

/// RAII form of [`push_off`]/[`pop_off`]. Pinned to the processor that
/// created it.
#[must_use]
pub struct IrqGuard {
    _not_send: PhantomData<*mut ()>,
}

impl IrqGuard {
    pub fn new() -> Self {
        push_off();
        Self { _not_send: PhantomData }
    }
}

impl Default for IrqGuard {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for IrqGuard {
    fn drop(&mut self) {
        pop_off();
    }
}
