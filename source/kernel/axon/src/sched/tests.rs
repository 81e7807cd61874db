// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Dispatch-order tests for the run-queue and context switch
//! OWNERS: @kernel-sched-team
//! NOTE: Tests only; `dispatch` decodes the simulated restore/halt exits
//!
//! TEST_SCENARIOS:
//!   - round_robin_is_fifo(): A, B, C ready from boot dispatch as A, B, C, A
//!   - add_never_double_queues(): repeated adds leave one queue entry
//!   - resumed_checkpoint_returns(): a Resumed save returns without picking

use crate::hal::sim::{dispatch, idle_entry, kernel, Dispatch, SimCpu, SimKernel};
use crate::mm::{Backing, MapFlags, Prot};
use crate::task::TaskStatus;
use crate::types::Pid;

fn spawn(k: &SimKernel, name: &str) -> Pid {
    k.task_create(name, None, idle_entry, None).expect("create task")
}

fn switch(k: &SimKernel) -> Dispatch {
    dispatch(|| k.scheduler_switch(TaskStatus::Ready))
}

#[test]
fn round_robin_is_fifo() {
    let k = kernel();
    let a = spawn(&k, "a");
    let b = spawn(&k, "b");
    let c = spawn(&k, "c");
    let order: Vec<Dispatch> = (0..4).map(|_| switch(&k)).collect();
    // The boot path has no current task to save.
    let expected: Vec<Dispatch> =
        [a, b, c, a].iter().map(|pid| Dispatch::Restored(k.context_addr(*pid))).collect();
    assert_eq!(order, expected);
    assert_eq!(k.current(), Some(a));
    assert_eq!(k.status(a), Some(TaskStatus::Running));
    assert_eq!(k.ready_pids(), vec![b, c]);
    assert_eq!(SimCpu::count(&k.cpu().saves), 3);
}

#[test]
fn add_never_double_queues() {
    let k = kernel();
    let a = spawn(&k, "a");
    k.scheduler_add(a);
    k.scheduler_add(a);
    assert_eq!(k.ready_pids(), vec![a]);

    k.scheduler_remove(a, TaskStatus::Blocked);
    assert_eq!(k.status(a), Some(TaskStatus::Blocked));
    assert!(k.ready_pids().is_empty());
    k.scheduler_remove(a, TaskStatus::Blocked);

    k.scheduler_add(a);
    assert_eq!(k.status(a), Some(TaskStatus::Ready));
    assert_eq!(k.ready_pids(), vec![a]);
}

#[test]
fn running_task_is_not_added() {
    let k = kernel();
    let a = spawn(&k, "a");
    assert_eq!(switch(&k), Dispatch::Restored(k.context_addr(a)));
    k.scheduler_add(a);
    assert_eq!(k.status(a), Some(TaskStatus::Running));
    assert!(k.ready_pids().is_empty());
}

#[test]
fn resumed_checkpoint_returns() {
    let k = kernel();
    let a = spawn(&k, "a");
    let b = spawn(&k, "b");
    assert_eq!(switch(&k), Dispatch::Restored(k.context_addr(a)));
    k.cpu().resume_next_save();
    assert_eq!(switch(&k), Dispatch::Returned);
    assert_eq!(k.current(), Some(a));
    assert_eq!(k.ready_pids(), vec![b]);
    assert_eq!(SimCpu::count(&k.cpu().restores), 1);
}

#[test]
fn sole_task_keeps_running_after_preemption() {
    let k = kernel();
    let a = spawn(&k, "a");
    assert_eq!(switch(&k), Dispatch::Restored(k.context_addr(a)));
    assert_eq!(switch(&k), Dispatch::Returned);
    assert_eq!(k.status(a), Some(TaskStatus::Running));
    assert_eq!(SimCpu::count(&k.cpu().restores), 1);
}

#[test]
fn empty_queue_halts_and_clears_idle() {
    let k = kernel();
    assert_eq!(switch(&k), Dispatch::Halted);
    assert_eq!(SimCpu::count(&k.cpu().halts), 1);
    assert!(!k.percpu.is_idle(0));
    assert_eq!(k.current(), None);
}

#[test]
fn non_ready_requeue_status_is_applied() {
    let k = kernel();
    let a = spawn(&k, "a");
    assert_eq!(switch(&k), Dispatch::Restored(k.context_addr(a)));
    assert_eq!(dispatch(|| k.scheduler_switch(TaskStatus::Sleeping)), Dispatch::Halted);
    assert_eq!(k.status(a), Some(TaskStatus::Sleeping));
    assert!(k.ready_pids().is_empty());
}

#[test]
fn task_that_left_running_is_not_requeued() {
    let k = kernel();
    let a = spawn(&k, "a");
    let b = spawn(&k, "b");
    assert_eq!(switch(&k), Dispatch::Restored(k.context_addr(a)));
    k.scheduler_remove(a, TaskStatus::Blocked);
    assert_eq!(switch(&k), Dispatch::Restored(k.context_addr(b)));
    assert_eq!(k.status(a), Some(TaskStatus::Blocked));
    assert!(k.ready_pids().is_empty());
}

#[test]
fn switch_activates_space_and_trap_stack() {
    let k = kernel();
    let space = k.mspace_create().expect("mspace");
    space
        .map(0, 0x1000, Backing::Anonymous, Prot::RW, MapFlags::empty())
        .expect("map");
    let a = k.task_create("user", None, idle_entry, Some(space.clone())).expect("create");
    let b = spawn(&k, "kthread");
    assert_eq!(switch(&k), Dispatch::Restored(k.context_addr(a)));
    assert_eq!(k.mmu().active(), Some(space.root()));
    let stack = SimCpu::count(&k.cpu().trap_stack);
    assert!(stack != 0 && stack % 16 == 0);

    assert_eq!(switch(&k), Dispatch::Restored(k.context_addr(b)));
    assert_eq!(k.mmu().active(), None);
}

#[test]
fn task_current_elsewhere_is_skipped() {
    let k = kernel();
    let a = spawn(&k, "a");
    let b = spawn(&k, "b");
    assert_eq!(switch(&k), Dispatch::Restored(k.context_addr(a)));
    // `a` was preempted on cpu0 but has not finished switching out yet.
    {
        let mut tasks = k.tasks.lock();
        if let Some(task) = tasks.get_mut(a) {
            task.status = TaskStatus::Ready;
        }
        let mut rq = k.run_queue.lock();
        rq.detach(b);
        rq.push_ready(a);
        rq.push_ready(b);
    }
    k.cpu().set_cpu(1);
    assert_eq!(k.ready_pids(), vec![a, b]);
    assert_eq!(switch(&k), Dispatch::Restored(k.context_addr(b)));
    assert_eq!(k.ready_pids(), vec![a]);
    assert_eq!(k.current(), Some(b));
}
