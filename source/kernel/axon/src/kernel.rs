// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: The kernel context owning every scheduler and timekeeping singleton
//! OWNERS: @kernel-team
//! PUBLIC API: Kernel::{new, cpu, mmu, config, current, now_us, clock_snapshot,
//!             mspace_create}
//! DEPENDS_ON: axon_sync::SpinLock, hal::{Cpu, Mmu}, config::KernelConfig
//! INVARIANTS: Built once at boot and passed by reference to every entry point;
//!             lock order is tasks -> advents -> run_queue -> clock; mspace
//!             locks are independent of these
//!
//! Operations are spread over the modules that own their state: scheduling in
//! `sched`, waits and ticks in `time`, lifecycle in `task`.

use alloc::sync::Arc;

use axon_sync::irq::MAX_CPUS;
use axon_sync::SpinLock;

use crate::config::{ConfigError, KernelConfig};
use crate::hal::{Cpu, Mmu};
use crate::log_info;
use crate::mm::{MmError, Mspace, MspaceRef};
use crate::sched::{PerCpu, RunQueue};
use crate::task::TaskTable;
use crate::time::{AdventRegistry, Clock, ClockSnapshot};
use crate::types::Pid;

pub struct Kernel<C: Cpu, M: Mmu> {
    pub(crate) cpu: C,
    pub(crate) mmu: Arc<M>,
    pub(crate) config: KernelConfig,
    pub(crate) tasks: SpinLock<TaskTable<M>>,
    pub(crate) advents: SpinLock<AdventRegistry>,
    pub(crate) run_queue: SpinLock<RunQueue>,
    pub(crate) clock: SpinLock<Clock>,
    pub(crate) percpu: PerCpu,
}

impl<C: Cpu, M: Mmu> Kernel<C, M> {
    /// Builds the kernel context from validated configuration.
    pub fn new(cpu: C, mmu: Arc<M>, config: KernelConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        log_info!(
            target: "boot",
            "axon: tick={}Hz timekeeper={} max_tasks={} kstack={}",
            config.tick_hz,
            config.timekeeper,
            config.max_tasks,
            config.kernel_stack_size
        );
        Ok(Self {
            cpu,
            mmu,
            tasks: SpinLock::new(TaskTable::new(config.max_tasks)),
            advents: SpinLock::new(AdventRegistry::new()),
            run_queue: SpinLock::new(RunQueue::new()),
            clock: SpinLock::new(Clock::new(config.tick_period_us())),
            percpu: PerCpu::new(),
            config,
        })
    }

    pub fn cpu(&self) -> &C {
        &self.cpu
    }

    pub fn mmu(&self) -> &Arc<M> {
        &self.mmu
    }

    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    /// Task running on the calling processor.
    pub fn current(&self) -> Option<Pid> {
        self.percpu.current(self.cpu_index())
    }

    /// Monotonic time in microseconds.
    pub fn now_us(&self) -> u64 {
        self.clock.lock().now_us()
    }

    pub fn clock_snapshot(&self) -> ClockSnapshot {
        let clock = self.clock.lock();
        ClockSnapshot {
            now_us: clock.now_us(),
            ticks: clock.ticks(),
            hw_ticks: self.cpu.monotonic_clock_ticks(),
        }
    }

    /// Fresh, empty user address space over the configured bounds.
    pub fn mspace_create(&self) -> Result<MspaceRef<M>, MmError> {
        Mspace::create(&self.mmu, self.config.user_bounds.clone())
    }

    pub(crate) fn cpu_index(&self) -> usize {
        let cpu = self.cpu.current_processor_id();
        assert!(cpu.as_index() < MAX_CPUS, "kernel: {cpu} beyond MAX_CPUS");
        cpu.as_index()
    }

    /// Task context is required; calling from an interrupt or boot path is
    /// a bug.
    pub(crate) fn expect_current(&self, what: &str) -> Pid {
        match self.current() {
            Some(pid) => pid,
            None => panic!("kernel: {what} outside task context"),
        }
    }
}

#[cfg(test)]
impl<C: Cpu, M: Mmu> Kernel<C, M> {
    /// Address a dispatch to `pid` restores from; matches `Dispatch::Restored`.
    pub(crate) fn context_addr(&self, pid: Pid) -> usize {
        match self.tasks.lock().get(pid) {
            Some(task) => task.context_ptr().as_ptr() as usize,
            None => panic!("no task {pid}"),
        }
    }

    pub(crate) fn ready_pids(&self) -> alloc::vec::Vec<Pid> {
        self.run_queue.lock().ready.iter().collect()
    }

    pub(crate) fn status(&self, pid: Pid) -> Option<crate::task::TaskStatus> {
        self.tasks.lock().get(pid).map(|task| task.status())
    }
}
