// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Task creation, exit, collection, kill/resume and signals
//! OWNERS: @kernel-sched-team
//! PUBLIC API: Kernel::{task_create, task_spawn, task_exit, task_collect,
//!             task_wait_child, task_kill, task_resume, task_started,
//!             signal_enqueue, signal_dequeue, handle_page_fault, task_info}
//! DEPENDS_ON: task::TaskTable, time::AdventRegistry, sched::RunQueue, mm::Mspace
//! INVARIANTS: Locks are taken tasks -> advents -> run_queue; a task leaves
//!             every queue and loses every advent before it turns ZOMBIE;
//!             records are dropped outside the locks

use alloc::vec::Vec;

use axon_sync::irq;

use crate::hal::{Continuation, Cpu, Mmu, TaskEntry};
use crate::kernel::Kernel;
use crate::mm::{FaultError, FaultReason, MspaceRef};
use crate::sched::RunQueue;
use crate::time::{wake, AdventRegistry};
use crate::types::{Listener, Pid, Signal};
use crate::{log_debug, log_error, log_info};

use super::{
    CloneMode, CollectError, KernelStack, Task, TaskError, TaskInfo, TaskStatus, TaskTable,
    WaitOutcome, FAULT_STATUS, KILLED_STATUS,
};

impl<C: Cpu, M: Mmu> Kernel<C, M> {
    /// Creates a READY task that starts at `entry` on a fresh kernel stack.
    pub fn task_create(
        &self,
        name: &str,
        parent: Option<Pid>,
        entry: TaskEntry,
        mspace: Option<MspaceRef<M>>,
    ) -> Result<Pid, TaskError> {
        let stack = KernelStack::new(self.config.kernel_stack_size)?;
        let mut context = Continuation::zeroed();
        self.cpu.prepare_context(&mut context, entry, stack.top());

        let mut tasks = self.tasks.lock();
        if let Some(parent) = parent {
            match tasks.get(parent) {
                Some(task) if task.status != TaskStatus::Zombie => {}
                _ => return Err(TaskError::NoSuchParent),
            }
        }
        let pid = tasks.free_pid().ok_or(TaskError::NoFreeSlot)?;
        tasks.insert(Task::new(pid, name, parent, context, stack, mspace));
        if let Some(parent) = parent {
            tasks.expect_mut(parent).children.push(pid);
        }
        self.run_queue.lock().push_ready(pid);
        drop(tasks);
        log_debug!(target: "task", "created {} '{}' parent={:?}", pid, name, parent);
        Ok(pid)
    }

    /// Creates a child of `parent` that shares or copies its mspace.
    pub fn task_spawn(
        &self,
        parent: Pid,
        name: &str,
        entry: TaskEntry,
        mode: CloneMode,
    ) -> Result<Pid, TaskError> {
        let space = match self.tasks.lock().get(parent) {
            Some(task) => task.mspace.clone(),
            None => return Err(TaskError::NoSuchParent),
        };
        let space = match (space, mode) {
            (Some(space), CloneMode::ShareMemory) => Some(space),
            (Some(space), CloneMode::CopyMemory) => Some(space.clone_space()?),
            (None, _) => None,
        };
        self.task_create(name, Some(parent), entry, space)
    }

    /// Called first thing by a new task's entry trampoline: drops the
    /// interrupt nesting level inherited from the switch that started it.
    pub fn task_started(&self) {
        irq::set_outer_enabled(true);
        irq::pop_off();
    }

    /// Terminates the current task with `status`.
    pub fn task_exit(&self, status: i32) -> ! {
        let pid = self.expect_current("exit");
        {
            let mut tasks = self.tasks.lock();
            let mut advents = self.advents.lock();
            let mut rq = self.run_queue.lock();
            advents.sweep_task(pid);
            retire(&mut tasks, &mut advents, &mut rq, pid, status);
        }
        log_debug!(target: "task", "{} exited with {}", pid, status);
        self.scheduler_switch(TaskStatus::Zombie);
        panic!("task: zombie {pid} resumed");
    }

    /// Reaps an exited child of `parent`; `target = None` takes any.
    /// A child still occupying a processor's stack is not reaped yet.
    pub fn task_collect(
        &self,
        parent: Pid,
        target: Option<Pid>,
    ) -> Result<(Pid, i32), CollectError> {
        let (pid, status, record) = {
            let mut tasks = self.tasks.lock();
            self.collect_locked(&mut tasks, parent, target)?
        };
        drop(record);
        log_debug!(target: "task", "{} collected {} ({})", parent, pid, status);
        Ok((pid, status))
    }

    /// Blocking form of [`Kernel::task_collect`] for the current task.
    pub fn task_wait_child(&self, target: Option<Pid>) -> Result<(Pid, i32), CollectError> {
        let parent = self.expect_current("wait for a child");
        loop {
            {
                let mut tasks = self.tasks.lock();
                let mut advents = self.advents.lock();
                let mut rq = self.run_queue.lock();
                match self.collect_locked(&mut tasks, parent, target) {
                    Ok((pid, status, record)) => {
                        drop(rq);
                        drop(advents);
                        drop(tasks);
                        drop(record);
                        return Ok((pid, status));
                    }
                    Err(CollectError::WouldBlock) => {}
                    Err(err) => return Err(err),
                }
                let task = tasks.expect_mut(parent);
                if !task.signals.is_empty() {
                    return Err(CollectError::Interrupted);
                }
                advents.register_wait(parent, Some(Listener::ChildExit(parent)), None);
                task.status = TaskStatus::Waiting;
                task.wake = None;
                rq.park(parent);
            }
            if self.finish_wait(parent, TaskStatus::Waiting) == WaitOutcome::Interrupted {
                return Err(CollectError::Interrupted);
            }
        }
    }

    /// Forced termination with [`KILLED_STATUS`]. Killing the current task
    /// does not return.
    pub fn task_kill(&self, pid: Pid) -> Result<(), TaskError> {
        if self.current() == Some(pid) {
            self.task_exit(KILLED_STATUS);
        }
        {
            let mut tasks = self.tasks.lock();
            let mut advents = self.advents.lock();
            let mut rq = self.run_queue.lock();
            let status = tasks.get(pid).map(|task| task.status).ok_or(TaskError::NoSuchTask)?;
            if status == TaskStatus::Zombie {
                return Ok(());
            }
            // A waiting task may still be `current` on a processor that is
            // idling; only one actually executing is out of reach.
            if status == TaskStatus::Running && self.percpu.running_on(pid).is_some() {
                return Err(TaskError::Busy);
            }
            advents.sweep_task(pid);
            retire(&mut tasks, &mut advents, &mut rq, pid, KILLED_STATUS);
        }
        log_info!(target: "task", "killed {}", pid);
        self.reap_orphans();
        Ok(())
    }

    /// Ends a wait out of band; the waiter sees `Interrupted`.
    pub fn task_resume(&self, pid: Pid) -> Result<(), TaskError> {
        let mut tasks = self.tasks.lock();
        let mut advents = self.advents.lock();
        let mut rq = self.run_queue.lock();
        let status = tasks.get(pid).map(|task| task.status).ok_or(TaskError::NoSuchTask)?;
        if status.is_waiting() {
            advents.purge_task(pid);
            wake(&mut tasks, &mut rq, pid, WaitOutcome::Interrupted);
        }
        Ok(())
    }

    /// Queues `signal` for `pid` and interrupts an interruptible wait.
    pub fn signal_enqueue(&self, pid: Pid, signal: Signal) -> Result<(), TaskError> {
        let mut tasks = self.tasks.lock();
        let mut advents = self.advents.lock();
        let mut rq = self.run_queue.lock();
        let task = tasks.get_mut(pid).ok_or(TaskError::NoSuchTask)?;
        if task.status == TaskStatus::Zombie {
            return Ok(());
        }
        task.signals.push_back(signal);
        if task.status.is_interruptible() {
            advents.purge_task(pid);
            wake(&mut tasks, &mut rq, pid, WaitOutcome::Interrupted);
        }
        Ok(())
    }

    /// Oldest pending signal of `pid`.
    pub fn signal_dequeue(&self, pid: Pid) -> Option<Signal> {
        self.tasks.lock().get_mut(pid).and_then(|task| task.signals.pop_front())
    }

    /// Resolves a user page fault of the current task. A fatal fault
    /// terminates the task with [`FAULT_STATUS`]; other failures are
    /// returned for the trap layer to retry or escalate.
    pub fn handle_page_fault(&self, addr: usize, reason: FaultReason) -> Result<(), FaultError> {
        let pid = self.current().ok_or(FaultError::NoMapping)?;
        let space = self.tasks.lock().get(pid).and_then(|task| task.mspace.clone());
        let result = match space {
            Some(space) => space.page_fault(addr, reason),
            None => Err(FaultError::NoMapping),
        };
        match result {
            Err(err) if err.is_fatal() => {
                log_error!(
                    target: "mm",
                    "task {}: fatal {:?} fault at {:#x}: {:?}",
                    pid,
                    reason.access,
                    addr,
                    err
                );
                self.task_exit(FAULT_STATUS)
            }
            other => other,
        }
    }

    pub fn task_info(&self, pid: Pid) -> Option<TaskInfo> {
        self.tasks.lock().get(pid).map(Task::info)
    }

    /// Destroys parentless zombies that no processor is running on.
    pub(crate) fn reap_orphans(&self) {
        let reaped: Vec<Task<M>> = {
            let mut tasks = self.tasks.lock();
            let orphans = core::mem::take(&mut tasks.orphans);
            let (busy, free): (Vec<Pid>, Vec<Pid>) =
                orphans.into_iter().partition(|pid| self.percpu.running_on(*pid).is_some());
            tasks.orphans = busy;
            free.into_iter().filter_map(|pid| tasks.remove(pid)).collect()
        };
        for task in &reaped {
            log_debug!(target: "task", "reaped orphan {}", task.pid());
        }
    }

    fn collect_locked(
        &self,
        tasks: &mut TaskTable<M>,
        parent: Pid,
        target: Option<Pid>,
    ) -> Result<(Pid, i32, Task<M>), CollectError> {
        let children = match tasks.get(parent) {
            Some(task) if !task.children.is_empty() => task.children.clone(),
            _ => return Err(CollectError::NoChildren),
        };
        if let Some(target) = target {
            if !children.contains(&target) {
                return Err(CollectError::NoSuchChild);
            }
        }
        let found = children
            .iter()
            .copied()
            .filter(|child| target.map_or(true, |target| target == *child))
            .find(|child| {
                tasks.get(*child).is_some_and(|task| task.status == TaskStatus::Zombie)
                    && self.percpu.running_on(*child).is_none()
            })
            .ok_or(CollectError::WouldBlock)?;
        tasks.expect_mut(parent).children.retain(|child| *child != found);
        let record = match tasks.remove(found) {
            Some(record) => record,
            None => panic!("task: child {found} vanished while collecting"),
        };
        Ok((found, record.exit_status.unwrap_or(0), record))
    }
}

/// Turns `pid` into a zombie: recorded status, detached from the queues,
/// children orphaned, parent notified. Advents are already swept.
fn retire<M: Mmu>(
    tasks: &mut TaskTable<M>,
    advents: &mut AdventRegistry,
    rq: &mut RunQueue,
    pid: Pid,
    status: i32,
) {
    rq.detach(pid);
    let task = tasks.expect_mut(pid);
    task.status = TaskStatus::Zombie;
    task.set_exit_status(status);
    let parent = task.parent;
    let children = core::mem::take(&mut task.children);

    for child in children {
        let record = tasks.expect_mut(child);
        record.parent = None;
        if record.status == TaskStatus::Zombie {
            tasks.orphans.push(child);
        }
    }

    match parent {
        Some(parent) => {
            for waiter in advents.wake_listener(Listener::ChildExit(parent), None) {
                wake(tasks, rq, waiter, WaitOutcome::Notified);
            }
        }
        None => tasks.orphans.push(pid),
    }
}
