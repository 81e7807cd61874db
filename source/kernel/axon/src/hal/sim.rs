// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Host simulation of the CPU and MMU collaborators
//! OWNERS: @kernel-arch-team
//! NOTE: Tests only. `restore_context` and `halt` cannot return on hardware;
//!       here they unwind with a typed payload that `dispatch` decodes.

use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::panic::{self, AssertUnwindSafe};
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Once};

use crate::config::KernelConfig;
use crate::kernel::Kernel;
use crate::mm::{Inode, IoError, PAGE_SIZE};
use crate::types::{CpuId, PhysAddr};

use super::{Continuation, Cpu, Mmu, MmuError, PageRights, PageTableRoot, Resume, TaskEntry};

pub type SimKernel = Kernel<SimCpu, SimMmu>;

/// Unwind payload standing in for a jump into another continuation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Restored(pub usize);

/// Unwind payload standing in for a parked processor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Halted;

/// How a simulated call into the scheduler ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// Control jumped into the continuation at this address.
    Restored(usize),
    /// The processor parked with nothing to run.
    Halted,
    /// The call came back normally.
    Returned,
}

pub extern "C" fn idle_entry() -> ! {
    loop {
        std::hint::spin_loop();
    }
}

fn quiet_unwinds() {
    static HOOK: Once = Once::new();
    HOOK.call_once(|| {
        let default = panic::take_hook();
        panic::set_hook(Box::new(move |info| {
            let payload = info.payload();
            if payload.is::<Restored>() || payload.is::<Halted>() {
                return;
            }
            default(info);
        }));
    });
}

/// Runs `f`, translating the simulated non-local exits into [`Dispatch`].
pub fn dispatch<R>(f: impl FnOnce() -> R) -> Dispatch {
    quiet_unwinds();
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(_) => Dispatch::Returned,
        Err(payload) => decode(payload),
    }
}

fn decode(payload: Box<dyn Any + Send>) -> Dispatch {
    if let Some(Restored(addr)) = payload.downcast_ref::<Restored>() {
        return Dispatch::Restored(*addr);
    }
    if payload.is::<Halted>() {
        return Dispatch::Halted;
    }
    panic::resume_unwind(payload)
}

#[derive(Default)]
pub struct SimCpu {
    id: AtomicU32,
    ticks: AtomicU64,
    resume_next_save: AtomicBool,
    pub saves: AtomicUsize,
    pub restores: AtomicUsize,
    pub halts: AtomicUsize,
    pub armed: AtomicUsize,
    pub trap_stack: AtomicUsize,
}

impl SimCpu {
    pub fn set_cpu(&self, id: u32) {
        self.id.store(id, Ordering::SeqCst);
    }

    /// Makes the next `save_context` report an arrival through restore.
    pub fn resume_next_save(&self) {
        self.resume_next_save.store(true, Ordering::SeqCst);
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

impl Cpu for SimCpu {
    fn current_processor_id(&self) -> CpuId {
        CpuId::from_raw(self.id.load(Ordering::SeqCst))
    }

    fn monotonic_clock_ticks(&self) -> u64 {
        self.ticks.fetch_add(1, Ordering::SeqCst)
    }

    fn prepare_context(&self, ctx: &mut Continuation, entry: TaskEntry, stack_top: usize) {
        let words = ctx.words_mut();
        words[0] = entry as usize;
        words[1] = stack_top;
    }

    unsafe fn save_context(&self, _ctx: NonNull<Continuation>) -> Resume {
        self.saves.fetch_add(1, Ordering::SeqCst);
        if self.resume_next_save.swap(false, Ordering::SeqCst) {
            Resume::Resumed
        } else {
            Resume::Checkpoint
        }
    }

    unsafe fn restore_context(&self, ctx: NonNull<Continuation>) -> ! {
        self.restores.fetch_add(1, Ordering::SeqCst);
        quiet_unwinds();
        panic::panic_any(Restored(ctx.as_ptr() as usize))
    }

    fn set_trap_stack(&self, top: usize) {
        self.trap_stack.store(top, Ordering::SeqCst);
    }

    fn halt(&self) {
        self.halts.fetch_add(1, Ordering::SeqCst);
        quiet_unwinds();
        panic::panic_any(Halted)
    }

    fn arm_tick(&self, _period_us: u64) {
        self.armed.fetch_add(1, Ordering::SeqCst);
    }
}

const FRAME_BASE: usize = 0x8000_0000;

#[derive(Default)]
struct MmuState {
    next_root: usize,
    roots: BTreeSet<usize>,
    next_frame: usize,
    recycled: Vec<PhysAddr>,
    frames: BTreeMap<PhysAddr, Vec<u8>>,
    entries: BTreeMap<(usize, usize), (PhysAddr, PageRights)>,
    active: Option<PageTableRoot>,
}

/// Page tables as a map of `(root, vaddr)` entries, frames as byte vectors.
pub struct SimMmu {
    state: spin::Mutex<MmuState>,
    frame_limit: usize,
}

impl SimMmu {
    pub fn new() -> Arc<Self> {
        Self::with_frame_limit(usize::MAX)
    }

    pub fn with_frame_limit(frame_limit: usize) -> Arc<Self> {
        Arc::new(Self { state: spin::Mutex::new(MmuState::default()), frame_limit })
    }

    pub fn translation(&self, root: PageTableRoot, vaddr: usize) -> Option<(PhysAddr, PageRights)> {
        self.state.lock().entries.get(&(root.raw(), vaddr)).copied()
    }

    pub fn mapped_pages(&self, root: PageTableRoot) -> usize {
        self.state.lock().entries.keys().filter(|(r, _)| *r == root.raw()).count()
    }

    pub fn live_frames(&self) -> usize {
        self.state.lock().frames.len()
    }

    pub fn live_roots(&self) -> usize {
        self.state.lock().roots.len()
    }

    pub fn active(&self) -> Option<PageTableRoot> {
        self.state.lock().active
    }

    pub fn read_frame(&self, frame: PhysAddr) -> Vec<u8> {
        self.state.lock().frames.get(&frame).cloned().unwrap_or_default()
    }

    pub fn write_frame(&self, frame: PhysAddr, offset: usize, bytes: &[u8]) {
        if let Some(data) = self.state.lock().frames.get_mut(&frame) {
            data[offset..offset + bytes.len()].copy_from_slice(bytes);
        }
    }
}

impl Mmu for SimMmu {
    fn create_root(&self) -> Result<PageTableRoot, MmuError> {
        let mut state = self.state.lock();
        state.next_root += 1;
        let raw = state.next_root;
        state.roots.insert(raw);
        Ok(PageTableRoot::from_raw(raw))
    }

    fn destroy_root(&self, root: PageTableRoot) {
        let mut state = self.state.lock();
        assert!(state.roots.remove(&root.raw()), "sim mmu: root {root:?} destroyed twice");
        state.entries.retain(|(r, _), _| *r != root.raw());
        if state.active == Some(root) {
            state.active = None;
        }
    }

    fn activate(&self, root: Option<PageTableRoot>) {
        self.state.lock().active = root;
    }

    fn alloc_frame(&self) -> Option<PhysAddr> {
        let mut state = self.state.lock();
        if state.frames.len() >= self.frame_limit {
            return None;
        }
        let frame = match state.recycled.pop() {
            Some(frame) => frame,
            None => {
                let frame = PhysAddr::new(FRAME_BASE + state.next_frame * PAGE_SIZE);
                state.next_frame += 1;
                frame
            }
        };
        state.frames.insert(frame, vec![0xa5; PAGE_SIZE]);
        Some(frame)
    }

    fn free_frame(&self, frame: PhysAddr) {
        let mut state = self.state.lock();
        assert!(state.frames.remove(&frame).is_some(), "sim mmu: double free of {frame}");
        state.recycled.push(frame);
    }

    fn zero_frame(&self, frame: PhysAddr) {
        if let Some(data) = self.state.lock().frames.get_mut(&frame) {
            data.fill(0);
        }
    }

    fn copy_frame(&self, dst: PhysAddr, src: PhysAddr) {
        let mut state = self.state.lock();
        let bytes = state.frames.get(&src).cloned().unwrap_or_default();
        if let Some(data) = state.frames.get_mut(&dst) {
            data.copy_from_slice(&bytes);
        }
    }

    fn with_frame(&self, frame: PhysAddr, f: &mut dyn FnMut(&mut [u8])) {
        if let Some(data) = self.state.lock().frames.get_mut(&frame) {
            f(data);
        }
    }

    fn resolve_page(
        &self,
        root: PageTableRoot,
        vaddr: usize,
        frame: PhysAddr,
        rights: PageRights,
    ) -> Result<(), MmuError> {
        let mut state = self.state.lock();
        if !state.roots.contains(&root.raw()) {
            return Err(MmuError::InvalidRoot);
        }
        state.entries.insert((root.raw(), vaddr), (frame, rights));
        Ok(())
    }

    fn drop_page(&self, root: PageTableRoot, vaddr: usize) {
        self.state.lock().entries.remove(&(root.raw(), vaddr));
    }

    fn protect_page(&self, root: PageTableRoot, vaddr: usize, rights: PageRights) {
        if let Some(entry) = self.state.lock().entries.get_mut(&(root.raw(), vaddr)) {
            entry.1 = rights;
        }
    }
}

/// In-memory file for file-backed mappings.
pub struct MemInode {
    id: u64,
    data: Vec<u8>,
    fail: bool,
}

impl MemInode {
    pub fn new(id: u64, data: Vec<u8>) -> Arc<Self> {
        Arc::new(Self { id, data, fail: false })
    }

    pub fn broken(id: u64) -> Arc<Self> {
        Arc::new(Self { id, data: Vec::new(), fail: true })
    }
}

impl Inode for MemInode {
    fn id(&self) -> u64 {
        self.id
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, IoError> {
        if self.fail {
            return Err(IoError::Device);
        }
        let start = (offset as usize).min(self.data.len());
        let n = buf.len().min(self.data.len() - start);
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        Ok(n)
    }
}

pub fn kernel() -> SimKernel {
    kernel_with(KernelConfig::default())
}

pub fn kernel_with(config: KernelConfig) -> SimKernel {
    match Kernel::new(SimCpu::default(), SimMmu::new(), config) {
        Ok(kernel) => kernel,
        Err(err) => panic!("sim kernel config rejected: {err:?}"),
    }
}
