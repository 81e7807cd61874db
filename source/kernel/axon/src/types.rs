// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Identifier newtypes shared by the scheduler, advent registry and mm
//! OWNERS: @kernel-team
//! PUBLIC API: Pid, CpuId, PhysAddr, MspaceId, TimerId, Listener, Signal
//! DEPENDS_ON: collections::Handle
//! INVARIANTS: Pids index the task table; PhysAddr of a frame is page aligned
//!
//! Newtypes keep task slots, processors, frames and wait keys from being
//! mixed up at call sites that otherwise only see integers.

use core::fmt;

use crate::collections::Handle;

/// Process identifier, equal to the task's slot in the task table.
///
/// **Ownership**: Only `TaskTable` hands out PIDs. A PID is reused once its
/// slot has been reaped.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Pid(u32);

impl Pid {
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }
}

impl Handle for Pid {
    #[inline]
    fn index(self) -> usize {
        self.as_index()
    }

    #[inline]
    fn from_index(index: usize) -> Self {
        Self(index as u32)
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Logical processor index as reported by the CPU collaborator.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct CpuId(u32);

impl CpuId {
    pub const BOOT: Self = Self(0);

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

/// Physical address of a frame or device page.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct PhysAddr(usize);

impl PhysAddr {
    #[inline]
    pub const fn new(raw: usize) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn offset(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Identity of an address space; stable for the space's lifetime.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct MspaceId(u32);

impl MspaceId {
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

/// Handle returned by `itimer_create`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct TimerId(u32);

impl TimerId {
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

/// Event source a blocked task can wait on besides its deadline.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Listener {
    /// Opaque channel owned by a collaborator (pipe, device, VFS object).
    Channel(u64),
    /// Fires when any child of the given parent becomes a zombie.
    ChildExit(Pid),
    /// Futex word at `addr` inside the address space `space`.
    Futex { space: MspaceId, addr: usize },
}

/// Pending signal number; delivery semantics belong to the syscall layer.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Signal(pub u8);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pid_indexes_its_slot() {
        let pid = Pid::from_raw(7);
        assert_eq!(pid.as_index(), 7);
        assert_eq!(Handle::index(pid), 7);
        assert_eq!(pid.to_string(), "7");
    }

    #[test]
    fn listeners_order_by_kind_then_key() {
        let a = Listener::Channel(9);
        let b = Listener::ChildExit(Pid::from_raw(0));
        let c = Listener::Futex { space: MspaceId::from_raw(1), addr: 0x1000 };
        assert!(a < b && b < c);
    }
}
