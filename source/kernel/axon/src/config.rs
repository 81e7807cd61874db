// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Boot-time kernel knobs (tick rate, timekeeper, task and stack limits)
//! OWNERS: @kernel-team
//! PUBLIC API: KernelConfig, ConfigError, DEFAULT_* constants
//! DEPENDS_ON: mm::PAGE_SIZE, types::CpuId
//! INVARIANTS: Validated once before the kernel context is built; immutable after
//!
//! The defaults reproduce the classic configuration: a 100 Hz tick (10 ms),
//! processor 0 as timekeeper, 16 KiB kernel stacks.

use core::ops::Range;

use crate::mm::PAGE_SIZE;
use crate::types::CpuId;

pub const DEFAULT_TICK_HZ: u32 = 100;
pub const DEFAULT_MAX_TASKS: usize = 256;
pub const DEFAULT_KERNEL_STACK_SIZE: usize = 16 * 1024;
pub const DEFAULT_USER_BASE: usize = 0x1000;
pub const DEFAULT_USER_TOP: usize = 0x0000_4000_0000_0000;

const MAX_TICK_HZ: u32 = 1_000_000;

static_assertions::const_assert!(DEFAULT_KERNEL_STACK_SIZE % PAGE_SIZE == 0);
static_assertions::const_assert!(DEFAULT_USER_BASE % PAGE_SIZE == 0);

/// Configuration consumed by `Kernel::new`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KernelConfig {
    /// Timer interrupts per second.
    pub tick_hz: u32,
    /// Processor that advances the monotonic clock.
    pub timekeeper: CpuId,
    /// Upper bound on live task slots, zombies included.
    pub max_tasks: usize,
    /// Bytes of kernel stack per task; a whole number of pages.
    pub kernel_stack_size: usize,
    /// Bounds handed to `mspace_create`.
    pub user_bounds: Range<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigError {
    ZeroTickRate,
    TickRateTooHigh,
    NoTaskSlots,
    StackNotPageMultiple,
    EmptyBounds,
    UnalignedBounds,
}

impl KernelConfig {
    /// Length of one tick in microseconds.
    pub fn tick_period_us(&self) -> u64 {
        1_000_000 / u64::from(self.tick_hz.max(1))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.tick_hz == 0 {
            return Err(ConfigError::ZeroTickRate);
        }
        if self.tick_hz > MAX_TICK_HZ {
            return Err(ConfigError::TickRateTooHigh);
        }
        if self.max_tasks == 0 || self.max_tasks > u32::MAX as usize {
            return Err(ConfigError::NoTaskSlots);
        }
        if self.kernel_stack_size == 0 || self.kernel_stack_size % PAGE_SIZE != 0 {
            return Err(ConfigError::StackNotPageMultiple);
        }
        if self.user_bounds.start >= self.user_bounds.end {
            return Err(ConfigError::EmptyBounds);
        }
        if self.user_bounds.start % PAGE_SIZE != 0 || self.user_bounds.end % PAGE_SIZE != 0 {
            return Err(ConfigError::UnalignedBounds);
        }
        Ok(())
    }
}

impl Default for KernelConfig {
    fn default() -> Self {
        Self {
            tick_hz: DEFAULT_TICK_HZ,
            timekeeper: CpuId::BOOT,
            max_tasks: DEFAULT_MAX_TASKS,
            kernel_stack_size: DEFAULT_KERNEL_STACK_SIZE,
            user_bounds: DEFAULT_USER_BASE..DEFAULT_USER_TOP,
        }
    }
}
