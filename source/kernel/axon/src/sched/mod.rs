// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: FIFO run-queue, wait list and the cooperative context switch
//! OWNERS: @kernel-sched-team
//! PUBLIC API: Kernel::{scheduler_add, scheduler_remove, scheduler_switch},
//!             RunQueue, PerCpu
//! DEPENDS_ON: hal::Cpu (save/restore/halt), hal::Mmu::activate, task::TaskTable
//! INVARIANTS: A task is linked into at most one of {ready, waiting}; only
//!             READY tasks sit on the ready list; no lock is held across
//!             restore_context; round-robin with strict FIFO tie-break
//!
//! ## Switch protocol
//!
//! `scheduler_switch` checkpoints the outgoing task first and only then
//! picks a successor. While a task's continuation is being written the task
//! is still `current` on its processor, and `pick_next` never hands out a
//! task that is current elsewhere, so a wakeup racing with the checkpoint
//! cannot resume a half-saved continuation.

#[cfg(test)]
mod tests;

use core::ptr::NonNull;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use axon_sync::irq::{self, IrqGuard, MAX_CPUS};

use crate::collections::IndexList;
use crate::hal::{Continuation, Cpu, Mmu, PageTableRoot, Resume};
use crate::kernel::Kernel;
use crate::task::{TaskStatus, TaskTable};
use crate::types::Pid;
use crate::{log_debug, log_trace};

static_assertions::const_assert!(MAX_CPUS <= u32::MAX as usize);

/// Ready tasks in dispatch order plus the parked (waiting) tasks.
#[derive(Debug, Default)]
pub struct RunQueue {
    pub(crate) ready: IndexList<Pid>,
    pub(crate) waiting: IndexList<Pid>,
}

impl RunQueue {
    pub const fn new() -> Self {
        Self { ready: IndexList::new(), waiting: IndexList::new() }
    }

    /// Appends at the tail. A task already queued keeps its position.
    pub(crate) fn push_ready(&mut self, pid: Pid) {
        self.waiting.remove(pid);
        self.ready.push_back(pid);
        self.check(pid);
    }

    /// Moves a task that is about to block onto the wait list.
    pub(crate) fn park(&mut self, pid: Pid) {
        self.ready.remove(pid);
        self.waiting.push_back(pid);
        self.check(pid);
    }

    /// Unlinks from whichever list holds the task.
    pub(crate) fn detach(&mut self, pid: Pid) {
        self.ready.remove(pid);
        self.waiting.remove(pid);
    }

    pub fn ready_len(&self) -> usize {
        self.ready.len()
    }

    pub fn is_queued(&self, pid: Pid) -> bool {
        self.ready.contains(pid)
    }

    fn check(&self, pid: Pid) {
        assert!(
            !(self.ready.contains(pid) && self.waiting.contains(pid)),
            "run-queue: pid {pid} linked twice"
        );
    }
}

const NO_TASK: u32 = u32::MAX;

/// Per-processor dispatch state.
pub struct PerCpu {
    current: [AtomicU32; MAX_CPUS],
    idle: [AtomicBool; MAX_CPUS],
}

impl PerCpu {
    pub fn new() -> Self {
        Self {
            current: core::array::from_fn(|_| AtomicU32::new(NO_TASK)),
            idle: core::array::from_fn(|_| AtomicBool::new(false)),
        }
    }

    pub fn current(&self, cpu: usize) -> Option<Pid> {
        match self.current[cpu].load(Ordering::Acquire) {
            NO_TASK => None,
            raw => Some(Pid::from_raw(raw)),
        }
    }

    pub(crate) fn set_current(&self, cpu: usize, pid: Option<Pid>) {
        self.current[cpu].store(pid.map_or(NO_TASK, Pid::as_raw), Ordering::Release);
    }

    /// Processor whose stack `pid` currently occupies, if any.
    pub fn running_on(&self, pid: Pid) -> Option<usize> {
        self.current.iter().position(|slot| slot.load(Ordering::Acquire) == pid.as_raw())
    }

    pub fn is_idle(&self, cpu: usize) -> bool {
        self.idle[cpu].load(Ordering::Acquire)
    }

    pub(crate) fn set_idle(&self, cpu: usize, idle: bool) {
        self.idle[cpu].store(idle, Ordering::Release);
    }
}

impl Default for PerCpu {
    fn default() -> Self {
        Self::new()
    }
}

/// Marks a processor idle for as long as it is parked in `halt`.
struct IdleGuard<'a> {
    percpu: &'a PerCpu,
    cpu: usize,
}

impl<'a> IdleGuard<'a> {
    fn enter(percpu: &'a PerCpu, cpu: usize) -> Self {
        percpu.set_idle(cpu, true);
        Self { percpu, cpu }
    }
}

impl Drop for IdleGuard<'_> {
    fn drop(&mut self) {
        self.percpu.set_idle(self.cpu, false);
    }
}

/// What `pick_next` decided.
enum Pick {
    /// The outgoing task was picked again; keep running it.
    Same,
    /// Jump into another task.
    Switch {
        pid: Pid,
        ctx: NonNull<Continuation>,
        stack_top: usize,
        root: Option<PageTableRoot>,
    },
    /// Nothing runnable.
    Idle,
}

impl<C: Cpu, M: Mmu> Kernel<C, M> {
    /// Makes `pid` runnable: its wait advents are dropped, the status
    /// becomes READY and it is appended to the ready tail once. A running
    /// task is left alone.
    pub fn scheduler_add(&self, pid: Pid) {
        let mut tasks = self.tasks.lock();
        let mut advents = self.advents.lock();
        let mut rq = self.run_queue.lock();
        advents.purge_task(pid);
        make_ready(&mut tasks, &mut rq, pid);
    }

    /// Sets `status` and unlinks `pid` from any queue.
    pub fn scheduler_remove(&self, pid: Pid, status: TaskStatus) {
        let mut tasks = self.tasks.lock();
        let mut rq = self.run_queue.lock();
        if let Some(task) = tasks.get_mut(pid) {
            task.status = status;
            rq.detach(pid);
        }
    }

    /// Gives up the processor.
    ///
    /// With `requeue == Ready` a still-running caller goes to the ready tail
    /// first; any other status is applied to it as is. A caller that already
    /// changed its own status (a registered wait, an exit) is not requeued.
    /// A waiting status is ignored for a caller whose wait was already ended
    /// and who was picked again before getting here.
    /// Returns when the caller is picked again.
    pub fn scheduler_switch(&self, requeue: TaskStatus) {
        assert!(requeue != TaskStatus::Running, "sched: cannot requeue as RUNNING");
        let irq = IrqGuard::new();
        let outer = irq::outer_enabled();
        let cpu = self.cpu_index();
        let prev = self.percpu.current(cpu);

        if let Some(prev) = prev {
            let ctx = match self.tasks.lock().get(prev) {
                Some(task) => task.context_ptr(),
                None => panic!("sched: current pid {prev} has no record"),
            };
            // SAFETY: the continuation box lives as long as the record, and
            // the record is not reaped while `prev` is current here.
            if unsafe { self.cpu.save_context(ctx) } == Resume::Resumed {
                irq::set_outer_enabled(outer);
                drop(irq);
                return;
            }
        }

        loop {
            match self.pick_next(cpu, prev, requeue) {
                Pick::Same => return,
                Pick::Switch { pid, ctx, stack_top, root } => {
                    log_trace!(target: "sched", "cpu{} switch {:?} -> {}", cpu, prev, pid);
                    self.mmu.activate(root);
                    self.cpu.set_trap_stack(stack_top);
                    // SAFETY: `pid` was READY, so its continuation was either
                    // saved by its own switch or prepared at creation, and no
                    // other processor runs on its stack.
                    unsafe { self.cpu.restore_context(ctx) }
                }
                Pick::Idle => {
                    let _idle = IdleGuard::enter(&self.percpu, cpu);
                    self.cpu.halt();
                }
            }
        }
    }

    fn pick_next(&self, cpu: usize, prev: Option<Pid>, requeue: TaskStatus) -> Pick {
        let mut tasks = self.tasks.lock();
        let mut rq = self.run_queue.lock();
        if let Some(prev) = prev {
            let task = tasks.expect_mut(prev);
            if task.status == TaskStatus::Running {
                // A wait that already ended (the wake landed before this
                // switch) must not be re-entered: keep running instead.
                let requeue = match requeue {
                    status if status.is_waiting() && task.wake.is_some() => TaskStatus::Ready,
                    status => status,
                };
                match requeue {
                    TaskStatus::Ready => {
                        task.status = TaskStatus::Ready;
                        rq.push_ready(prev);
                    }
                    status => {
                        task.status = status;
                        rq.detach(prev);
                    }
                }
            }
        }

        let Some(next) = self.pop_ready(&mut rq, cpu) else {
            return Pick::Idle;
        };
        let task = tasks.expect_mut(next);
        assert_eq!(task.status, TaskStatus::Ready, "sched: pid {next} queued while not READY");
        task.status = TaskStatus::Running;
        self.percpu.set_current(cpu, Some(next));
        if Some(next) == prev {
            return Pick::Same;
        }
        Pick::Switch {
            pid: next,
            ctx: task.context_ptr(),
            stack_top: task.stack_top(),
            root: task.mspace.as_ref().map(|space| space.root()),
        }
    }

    /// Front of the ready list, skipping tasks still current on another
    /// processor (their continuation may not be saved yet).
    fn pop_ready(&self, rq: &mut RunQueue, cpu: usize) -> Option<Pid> {
        for _ in 0..rq.ready.len() {
            let pid = rq.ready.pop_front()?;
            match self.percpu.running_on(pid) {
                Some(other) if other != cpu => {
                    rq.ready.push_back(pid);
                }
                _ => return Some(pid),
            }
        }
        None
    }
}

/// READY + ready tail for a non-running, live task.
pub(crate) fn make_ready<M: Mmu>(tasks: &mut TaskTable<M>, rq: &mut RunQueue, pid: Pid) {
    let Some(task) = tasks.get_mut(pid) else {
        return;
    };
    match task.status {
        TaskStatus::Running => {}
        TaskStatus::Zombie => log_debug!(target: "sched", "ignoring wake of zombie {}", pid),
        _ => {
            task.status = TaskStatus::Ready;
            rq.push_ready(pid);
        }
    }
}
