// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Virtual memory spaces: mspace/VMA tree, frames and fault resolution.

mod fault;
mod frame;
mod inode;
mod mspace;
mod vma;

#[cfg(test)]
mod tests_prop;

use bitflags::bitflags;

use crate::hal::{MmuError, PageRights};

pub use fault::{Access, FaultReason};
pub use frame::Frame;
pub use inode::{Inode, IoError};
pub use mspace::{Mspace, MspaceRef, MspaceStats};
pub use vma::{Backing, BackingKind, Sharing, VmaInfo};

/// Size of a page in bytes.
pub const PAGE_SIZE: usize = 4096;

static_assertions::const_assert!(PAGE_SIZE.is_power_of_two());

bitflags! {
    /// Access rights of a VMA.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Prot: u8 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

impl Prot {
    pub const RW: Self = Self::READ.union(Self::WRITE);
    pub const RX: Self = Self::READ.union(Self::EXEC);

    /// Hardware rights for a user page with these access rights.
    pub fn page_rights(self) -> PageRights {
        let mut rights = PageRights::USER;
        rights.set(PageRights::READ, self.contains(Prot::READ));
        rights.set(PageRights::WRITE, self.contains(Prot::WRITE));
        rights.set(PageRights::EXECUTE, self.contains(Prot::EXEC));
        rights
    }

    pub fn permits(self, access: Access) -> bool {
        match access {
            Access::Read => self.contains(Prot::READ),
            Access::Write => self.contains(Prot::WRITE),
            Access::Execute => self.contains(Prot::EXEC),
        }
    }
}

bitflags! {
    /// Placement and sharing requests for `Mspace::map`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct MapFlags: u8 {
        /// Place exactly at the hint or fail.
        const FIXED = 1 << 0;
        /// Writes are visible to every space sharing the pages.
        const SHARED = 1 << 1;
    }
}

/// Error returned by mspace operations.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MmError {
    /// Zero length or an address computation that overflows.
    InvalidArgs,
    /// Address, length, file offset or physical base not page aligned.
    Unaligned,
    /// Fixed request outside the space bounds.
    OutOfBounds,
    /// Fixed request collides with an existing VMA.
    Overlap,
    /// No free range large enough inside the bounds.
    NoSpace,
    /// Part of the range is not covered by any VMA.
    NotMapped,
    /// Physical frames exhausted.
    OutOfFrames,
    /// The page-table collaborator refused the edit.
    PageTable(MmuError),
}

impl From<MmuError> for MmError {
    fn from(err: MmuError) -> Self {
        Self::PageTable(err)
    }
}

/// Why a page fault could not be resolved.
#[must_use]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultError {
    /// No VMA covers the address.
    NoMapping,
    /// The covering VMA forbids the access.
    AccessViolation,
    OutOfFrames,
    /// The backing inode failed to deliver the page.
    Io(IoError),
    PageTable(MmuError),
}

impl FaultError {
    /// True when the faulting task cannot continue.
    pub const fn is_fatal(self) -> bool {
        matches!(self, FaultError::NoMapping | FaultError::AccessViolation | FaultError::Io(_))
    }
}

impl From<MmuError> for FaultError {
    fn from(err: MmuError) -> Self {
        Self::PageTable(err)
    }
}

#[inline]
pub const fn is_page_aligned(addr: usize) -> bool {
    addr & (PAGE_SIZE - 1) == 0
}

#[inline]
pub const fn align_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

/// Rounds up to the next page boundary, `None` on overflow.
#[inline]
pub const fn align_up(addr: usize) -> Option<usize> {
    match addr.checked_add(PAGE_SIZE - 1) {
        Some(sum) => Some(sum & !(PAGE_SIZE - 1)),
        None => None,
    }
}
