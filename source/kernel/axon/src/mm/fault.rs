// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Page-fault resolution against an mspace
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Mspace::page_fault, FaultReason, Access
//! DEPENDS_ON: mm::mspace, mm::Frame, Inode::read_at
//! INVARIANTS: Lookup is O(log n) under the space lock; a write to a shared
//!             private frame gets a fresh copy before it is mapped writable

use alloc::sync::Arc;

use crate::hal::Mmu;
use crate::log_debug;

use super::mspace::covering_mut;
use super::vma::{Page, Vma};
use super::{align_down, Backing, FaultError, Frame, Mspace, Sharing};

/// Kind of access that trapped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Execute,
}

/// Decoded fault cause handed in by the trap layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FaultReason {
    pub access: Access,
    /// The translation existed but forbade the access.
    pub present: bool,
}

impl FaultReason {
    pub const fn missing(access: Access) -> Self {
        Self { access, present: false }
    }

    pub const fn protection(access: Access) -> Self {
        Self { access, present: true }
    }
}

impl<M: Mmu> Mspace<M> {
    /// Resolves the page containing `addr`.
    ///
    /// An address outside every VMA, an access the VMA forbids, or a
    /// protection fault on a page that was never made resident is fatal for
    /// the faulting task; the caller decides how to terminate it.
    pub fn page_fault(&self, addr: usize, reason: FaultReason) -> Result<(), FaultError> {
        let vaddr = align_down(addr);
        let mut tree = self.vmas.lock();
        let vma = covering_mut(&mut tree, addr).ok_or(FaultError::NoMapping)?;
        if !vma.prot.permits(reason.access) {
            return Err(FaultError::AccessViolation);
        }
        // A protection fault implies a resident page behind the translation.
        if reason.present && !vma.pages.contains_key(&vaddr) {
            log_debug!(target: "mm", "protection fault at {:#x} with no resident page", vaddr);
            return Err(FaultError::AccessViolation);
        }

        let write_private = reason.access == Access::Write && vma.sharing == Sharing::Private;
        let page = match vma.pages.remove(&vaddr) {
            Some(Page::Frame(frame)) if write_private && Arc::strong_count(&frame) > 1 => {
                match frame.duplicate() {
                    Ok(copy) => Page::Frame(copy),
                    Err(_) => {
                        vma.pages.insert(vaddr, Page::Frame(frame));
                        return Err(FaultError::OutOfFrames);
                    }
                }
            }
            Some(page) => page,
            None => self.fetch(vma, vaddr)?,
        };
        let rights = vma.page_rights(&page);
        let paddr = page.paddr();
        vma.pages.insert(vaddr, page);
        self.mmu.resolve_page(self.root, vaddr, paddr, rights)?;
        Ok(())
    }

    fn fetch(&self, vma: &Vma<M>, vaddr: usize) -> Result<Page<M>, FaultError> {
        let offset = vaddr - vma.start;
        match &vma.backing {
            Backing::Anonymous | Backing::Heap | Backing::Stack => {
                let frame = Frame::zeroed(&self.mmu).map_err(|_| FaultError::OutOfFrames)?;
                Ok(Page::Frame(frame))
            }
            Backing::File { inode, offset: base } => {
                let frame = Frame::zeroed(&self.mmu).map_err(|_| FaultError::OutOfFrames)?;
                let mut read = Ok(0);
                self.mmu.with_frame(frame.paddr(), &mut |buf| {
                    read = inode.read_at(base + offset as u64, buf);
                });
                read.map_err(FaultError::Io)?;
                Ok(Page::Frame(frame))
            }
            Backing::Physical { base } => Ok(Page::Device(base.offset(offset))),
        }
    }
}
