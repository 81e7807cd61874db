// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Task records, the bounded task table and kernel stacks
//! OWNERS: @kernel-sched-team
//! STATUS: Functional
//! PUBLIC API: Task, TaskStatus, TaskInfo, TaskTable, TaskError, CollectError,
//!             CloneMode, WaitOutcome, KILLED_STATUS, FAULT_STATUS
//! DEPENDS_ON: hal::Continuation, mm::MspaceRef, types::{Pid, Signal}
//! INVARIANTS: pid == slot index; the continuation is only touched while the
//!             task is not RUNNING; the kernel stack is freed only with the
//!             record, never while the task is current on a processor;
//!             exit status is written once
//!
//! Lifecycle operations on the kernel context live in `task::lifecycle`.

mod lifecycle;


use alloc::boxed::Box;
use alloc::collections::VecDeque;
use alloc::string::String;
use alloc::vec::Vec;
use core::cell::UnsafeCell;
use core::ptr::NonNull;

use crate::hal::{Continuation, Mmu};
use crate::mm::{MmError, MspaceRef};
use crate::types::{MspaceId, Pid, Signal};

/// Exit status recorded by `task_kill`.
pub const KILLED_STATUS: i32 = -9;
/// Exit status of a task terminated by an unresolvable page fault.
pub const FAULT_STATUS: i32 = -11;

/// Scheduling state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskStatus {
    Ready,
    Running,
    /// Waiting on a listener or deadline; interruptible.
    Blocked,
    /// Timed sleep; signals do not end it.
    Sleeping,
    /// Waiting for a child to exit; interruptible.
    Waiting,
    Zombie,
}

impl TaskStatus {
    /// True for the states parked on the wait list.
    pub const fn is_waiting(self) -> bool {
        matches!(self, TaskStatus::Blocked | TaskStatus::Sleeping | TaskStatus::Waiting)
    }

    /// True for waits a signal may cut short.
    pub const fn is_interruptible(self) -> bool {
        matches!(self, TaskStatus::Blocked | TaskStatus::Waiting)
    }
}

/// Why a wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    TimedOut,
    Notified,
    Interrupted,
}

/// Address-space inheritance for `task_spawn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloneMode {
    /// Child runs in the parent's mspace.
    ShareMemory,
    /// Child gets a copy-on-write clone of the parent's mspace.
    CopyMemory,
}

#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskError {
    /// Task table is at `max_tasks`.
    NoFreeSlot,
    /// Kernel stack allocation failed.
    OutOfMemory,
    NoSuchTask,
    NoSuchParent,
    /// The task is running on another processor.
    Busy,
    Mm(MmError),
}

impl From<MmError> for TaskError {
    fn from(err: MmError) -> Self {
        Self::Mm(err)
    }
}

/// Errors returned when collecting exited children.
#[must_use = "collect errors must be handled explicitly"]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectError {
    /// The caller has no children at all.
    NoChildren,
    /// The requested pid is not a child of the caller.
    NoSuchChild,
    /// Children exist but none has exited yet.
    WouldBlock,
    /// A blocking collect was cut short by a signal.
    Interrupted,
}

/// Kernel stack owned by exactly one task.
pub struct KernelStack {
    mem: Box<[u8]>,
}

impl KernelStack {
    /// Allocates `size` zeroed bytes, reporting exhaustion instead of
    /// aborting.
    pub fn new(size: usize) -> Result<Self, TaskError> {
        let mut mem = Vec::new();
        mem.try_reserve_exact(size).map_err(|_| TaskError::OutOfMemory)?;
        mem.resize(size, 0u8);
        Ok(Self { mem: mem.into_boxed_slice() })
    }

    /// Initial stack pointer, 16-byte aligned.
    pub fn top(&self) -> usize {
        let end = self.mem.as_ptr() as usize + self.mem.len();
        end & !0xf
    }

    pub fn len(&self) -> usize {
        self.mem.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mem.is_empty()
    }
}

/// Per-task kernel record.
pub struct Task<M: Mmu> {
    pid: Pid,
    name: String,
    pub(crate) parent: Option<Pid>,
    pub(crate) children: Vec<Pid>,
    pub(crate) status: TaskStatus,
    context: Box<UnsafeCell<Continuation>>,
    stack: Option<KernelStack>,
    pub(crate) mspace: Option<MspaceRef<M>>,
    pub(crate) exit_status: Option<i32>,
    /// Outcome handed to the next return from a wait.
    pub(crate) wake: Option<WaitOutcome>,
    pub(crate) signals: VecDeque<Signal>,
}

impl<M: Mmu> Task<M> {
    pub(crate) fn new(
        pid: Pid,
        name: &str,
        parent: Option<Pid>,
        context: Continuation,
        stack: KernelStack,
        mspace: Option<MspaceRef<M>>,
    ) -> Self {
        Self {
            pid,
            name: String::from(name),
            parent,
            children: Vec::new(),
            status: TaskStatus::Ready,
            context: Box::new(UnsafeCell::new(context)),
            stack: Some(stack),
            mspace,
            exit_status: None,
            wake: None,
            signals: VecDeque::new(),
        }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn status(&self) -> TaskStatus {
        self.status
    }

    /// Stable address of the saved continuation; the box never moves while
    /// the record lives.
    pub(crate) fn context_ptr(&self) -> NonNull<Continuation> {
        // SAFETY: UnsafeCell::get on a live box is never null.
        unsafe { NonNull::new_unchecked(self.context.get()) }
    }

    pub(crate) fn stack_top(&self) -> usize {
        self.stack.as_ref().map_or(0, KernelStack::top)
    }

    /// Records the exit status; later calls keep the first one.
    pub(crate) fn set_exit_status(&mut self, status: i32) {
        if self.exit_status.is_none() {
            self.exit_status = Some(status);
        }
    }

    pub fn info(&self) -> TaskInfo {
        TaskInfo {
            pid: self.pid,
            name: self.name.clone(),
            parent: self.parent,
            children: self.children.clone(),
            status: self.status,
            exit_status: self.exit_status,
            mspace: self.mspace.as_ref().map(|space| space.id()),
            pending_signals: self.signals.len(),
            has_stack: self.stack.is_some(),
        }
    }
}

/// Snapshot of a task for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub pid: Pid,
    pub name: String,
    pub parent: Option<Pid>,
    pub children: Vec<Pid>,
    pub status: TaskStatus,
    pub exit_status: Option<i32>,
    pub mspace: Option<MspaceId>,
    pub pending_signals: usize,
    pub has_stack: bool,
}

/// Bounded table of task records indexed by pid.
pub struct TaskTable<M: Mmu> {
    slots: Vec<Option<Task<M>>>,
    max: usize,
    /// Exited tasks without a parent, reaped once no processor runs on
    /// their stack.
    pub(crate) orphans: Vec<Pid>,
}

impl<M: Mmu> TaskTable<M> {
    pub fn new(max: usize) -> Self {
        Self { slots: Vec::new(), max, orphans: Vec::new() }
    }

    /// Lowest free pid, if the table has room.
    pub(crate) fn free_pid(&self) -> Option<Pid> {
        match self.slots.iter().position(Option::is_none) {
            Some(index) => Some(Pid::from_raw(index as u32)),
            None if self.slots.len() < self.max => Some(Pid::from_raw(self.slots.len() as u32)),
            None => None,
        }
    }

    pub(crate) fn insert(&mut self, task: Task<M>) {
        let index = task.pid.as_index();
        if index >= self.slots.len() {
            self.slots.resize_with(index + 1, || None);
        }
        assert!(self.slots[index].is_none(), "task table: pid {} already live", task.pid);
        self.slots[index] = Some(task);
    }

    pub(crate) fn remove(&mut self, pid: Pid) -> Option<Task<M>> {
        self.slots.get_mut(pid.as_index()).and_then(Option::take)
    }

    pub fn get(&self, pid: Pid) -> Option<&Task<M>> {
        self.slots.get(pid.as_index()).and_then(Option::as_ref)
    }

    pub(crate) fn get_mut(&mut self, pid: Pid) -> Option<&mut Task<M>> {
        self.slots.get_mut(pid.as_index()).and_then(Option::as_mut)
    }

    /// Looks up a task that must exist.
    pub(crate) fn expect_mut(&mut self, pid: Pid) -> &mut Task<M> {
        match self.get_mut(pid) {
            Some(task) => task,
            None => panic!("task table: pid {pid} vanished"),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = &Task<M>> {
        self.slots.iter().filter_map(Option::as_ref)
    }
}
