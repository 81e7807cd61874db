// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Tick handling, blocking waits, listener wakeups and itimers
//! OWNERS: @kernel-sched-team
//! PUBLIC API: Kernel::{tick, clock_tick, task_wait, task_sleep, wake_listener,
//!             futex_wait, futex_wake, itimer_create, itimer_cancel}
//! DEPENDS_ON: time::{clock, advent}, sched (make_ready, scheduler_switch)
//! INVARIANTS: register-then-switch: the advent exists and the task is parked
//!             before the processor is given up; expired advents are removed
//!             before the owner is made runnable; notifications run unlocked
//!
//! A waiter is never woken before its deadline and at most one tick after
//! it, since expiry runs on every tick with `deadline <= now`.

mod advent;
mod clock;


use alloc::sync::Arc;

use crate::hal::{Cpu, Mmu};
use crate::kernel::Kernel;
use crate::sched::{make_ready, RunQueue};
use crate::task::{TaskStatus, TaskTable, WaitOutcome};
use crate::types::{Listener, Pid, TimerId};
use crate::{log_debug, log_trace};

pub use advent::{AdventRegistry, Expired, Notification, NotifyTarget};
pub use clock::{Clock, ClockSnapshot};

#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeError {
    NoSuchTimer,
    /// Futex calls need the caller to own an mspace.
    NoAddressSpace,
}

impl<C: Cpu, M: Mmu> Kernel<C, M> {
    /// Timer interrupt entry: re-arms the tick, runs the clock work and
    /// preempts the running task. A processor already idling inside
    /// `scheduler_switch` only does the clock work.
    pub fn tick(&self) {
        self.cpu.arm_tick(self.config.tick_period_us());
        self.clock_tick();
        if !self.percpu.is_idle(self.cpu_index()) {
            self.scheduler_switch(TaskStatus::Ready);
        }
    }

    /// Clock advance (timekeeper only), advent expiry, timer delivery and
    /// orphan reaping. Never switches.
    pub fn clock_tick(&self) {
        if self.cpu.current_processor_id() == self.config.timekeeper {
            self.clock.lock().advance();
        }
        let now = self.now_us();
        let expired = {
            let mut tasks = self.tasks.lock();
            let mut advents = self.advents.lock();
            let mut rq = self.run_queue.lock();
            let expired = advents.expire(now);
            for pid in &expired.woken {
                wake(&mut tasks, &mut rq, *pid, WaitOutcome::TimedOut);
            }
            expired
        };
        if !expired.woken.is_empty() {
            log_trace!(target: "advent", "t={}us woke {:?}", now, expired.woken);
        }
        for (target, note) in expired.notifications {
            target.notify(note);
        }
        self.reap_orphans();
    }

    /// Blocks the current task until `listener` fires, `timeout_us` passes,
    /// or the wait is interrupted. `Some(0)` polls: it returns `TimedOut`
    /// without giving up the processor.
    pub fn task_wait(&self, listener: Option<Listener>, timeout_us: Option<u64>) -> WaitOutcome {
        self.block_current(TaskStatus::Blocked, listener, timeout_us)
    }

    /// Uninterruptible timed sleep.
    pub fn task_sleep(&self, us: u64) -> WaitOutcome {
        self.block_current(TaskStatus::Sleeping, None, Some(us))
    }

    /// Wakes up to `limit` tasks waiting on `listener` (all for `None`), in
    /// the order they started waiting. Returns how many were woken.
    pub fn wake_listener(&self, listener: Listener, limit: Option<usize>) -> usize {
        let mut tasks = self.tasks.lock();
        let mut advents = self.advents.lock();
        let mut rq = self.run_queue.lock();
        let woken = advents.wake_listener(listener, limit);
        for pid in &woken {
            wake(&mut tasks, &mut rq, *pid, WaitOutcome::Notified);
        }
        woken.len()
    }

    /// Waits on the futex word at `addr` of the caller's mspace. The caller
    /// has already checked the word's value.
    pub fn futex_wait(&self, addr: usize, timeout_us: Option<u64>) -> Result<WaitOutcome, TimeError> {
        let listener = self.futex_key(addr)?;
        Ok(self.task_wait(Some(listener), timeout_us))
    }

    pub fn futex_wake(&self, addr: usize, count: usize) -> Result<usize, TimeError> {
        let listener = self.futex_key(addr)?;
        Ok(self.wake_listener(listener, Some(count)))
    }

    fn futex_key(&self, addr: usize) -> Result<Listener, TimeError> {
        let pid = self.current().ok_or(TimeError::NoAddressSpace)?;
        let tasks = self.tasks.lock();
        let space = tasks
            .get(pid)
            .and_then(|task| task.mspace.as_ref())
            .ok_or(TimeError::NoAddressSpace)?;
        Ok(Listener::Futex { space: space.id(), addr })
    }

    /// Arms an interval timer delivering to `target` after `delay_us`, then
    /// every `interval_us` (`0` for one-shot). A timer created from a task
    /// is cancelled when that task dies.
    pub fn itimer_create(
        &self,
        target: Arc<dyn NotifyTarget>,
        delay_us: u64,
        interval_us: u64,
    ) -> TimerId {
        let owner = self.current();
        let deadline = self.now_us().saturating_add(delay_us);
        let id = self.advents.lock().create_timer(target, deadline, interval_us, owner);
        log_debug!(
            target: "advent",
            "itimer {} armed at {}us every {}us",
            id.as_raw(),
            deadline,
            interval_us
        );
        id
    }

    pub fn itimer_cancel(&self, id: TimerId) -> Result<(), TimeError> {
        if self.advents.lock().cancel_timer(id) {
            Ok(())
        } else {
            Err(TimeError::NoSuchTimer)
        }
    }

    /// Register-then-switch core of every blocking call.
    pub(crate) fn block_current(
        &self,
        status: TaskStatus,
        listener: Option<Listener>,
        timeout_us: Option<u64>,
    ) -> WaitOutcome {
        let pid = self.expect_current("wait");
        if timeout_us == Some(0) {
            return WaitOutcome::TimedOut;
        }
        {
            let mut tasks = self.tasks.lock();
            let mut advents = self.advents.lock();
            let mut rq = self.run_queue.lock();
            let deadline = timeout_us.map(|us| self.clock.lock().now_us().saturating_add(us));
            let task = tasks.expect_mut(pid);
            if status.is_interruptible() && !task.signals.is_empty() {
                return WaitOutcome::Interrupted;
            }
            advents.register_wait(pid, listener, deadline);
            task.status = status;
            task.wake = None;
            rq.park(pid);
        }
        self.finish_wait(pid, status)
    }

    /// Switches away from a parked task and reports how its wait ended.
    pub(crate) fn finish_wait(&self, pid: Pid, status: TaskStatus) -> WaitOutcome {
        self.scheduler_switch(status);
        let mut tasks = self.tasks.lock();
        tasks.get_mut(pid).and_then(|task| task.wake.take()).unwrap_or(WaitOutcome::Interrupted)
    }
}

/// Ends a wait: records the outcome and makes the task runnable. Callers
/// have already removed its advents.
pub(crate) fn wake<M: Mmu>(
    tasks: &mut TaskTable<M>,
    rq: &mut RunQueue,
    pid: Pid,
    outcome: WaitOutcome,
) {
    if let Some(task) = tasks.get_mut(pid) {
        if task.status.is_waiting() {
            task.wake = Some(outcome);
        }
    }
    make_ready(tasks, rq, pid);
}
