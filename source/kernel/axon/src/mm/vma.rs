// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Virtual memory areas and their resident pages
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Backing, BackingKind, Sharing, VmaInfo
//! DEPENDS_ON: mm::{Frame, Inode}, hal::Mmu
//! INVARIANTS: start/len page aligned; resident pages lie inside [start, end);
//!             a private page whose frame is shared is never mapped writable

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use core::fmt;
use core::ops::Range;

use crate::hal::{Mmu, PageRights, PageTableRoot};
use crate::types::PhysAddr;

use super::{is_page_aligned, Frame, Inode, MmError, Prot};

/// Whether writes are private (copy-on-write) or visible to every sharer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Sharing {
    Private,
    Shared,
}

/// Where the pages of a VMA come from on first touch.
#[derive(Clone)]
pub enum Backing {
    Anonymous,
    File { inode: Arc<dyn Inode>, offset: u64 },
    Physical { base: PhysAddr },
    Heap,
    Stack,
}

impl Backing {
    pub fn kind(&self) -> BackingKind {
        match self {
            Backing::Anonymous => BackingKind::Anonymous,
            Backing::File { inode, offset } => BackingKind::File { inode: inode.id(), offset: *offset },
            Backing::Physical { base } => BackingKind::Physical { base: *base },
            Backing::Heap => BackingKind::Heap,
            Backing::Stack => BackingKind::Stack,
        }
    }

    pub(crate) fn check_alignment(&self) -> Result<(), MmError> {
        match self {
            Backing::File { offset, .. } if *offset % super::PAGE_SIZE as u64 != 0 => {
                Err(MmError::Unaligned)
            }
            Backing::Physical { base } if !is_page_aligned(base.raw()) => Err(MmError::Unaligned),
            _ => Ok(()),
        }
    }

    /// The same backing viewed `bytes` further into the region.
    fn advanced(&self, bytes: usize) -> Self {
        match self {
            Backing::File { inode, offset } => {
                Backing::File { inode: Arc::clone(inode), offset: offset + bytes as u64 }
            }
            Backing::Physical { base } => Backing::Physical { base: base.offset(bytes) },
            other => other.clone(),
        }
    }
}

impl fmt::Debug for Backing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.kind(), f)
    }
}

/// Lock-free description of a backing, for snapshots.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackingKind {
    Anonymous,
    File { inode: u64, offset: u64 },
    Physical { base: PhysAddr },
    Heap,
    Stack,
}

/// Snapshot of one VMA returned by lookups.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VmaInfo {
    pub start: usize,
    pub len: usize,
    pub prot: Prot,
    pub sharing: Sharing,
    pub backing: BackingKind,
    pub resident_pages: usize,
}

impl VmaInfo {
    pub fn end(&self) -> usize {
        self.start + self.len
    }

    pub fn range(&self) -> Range<usize> {
        self.start..self.end()
    }
}

/// A page that has been fetched for a VMA.
pub(crate) enum Page<M: Mmu> {
    /// Kernel-allocated frame; shared with clones until a write fault.
    Frame(Arc<Frame<M>>),
    /// Device or firmware memory passed through, never freed.
    Device(PhysAddr),
}

impl<M: Mmu> Page<M> {
    pub(crate) fn paddr(&self) -> PhysAddr {
        match self {
            Page::Frame(frame) => frame.paddr(),
            Page::Device(paddr) => *paddr,
        }
    }

    pub(crate) fn share(&self) -> Self {
        match self {
            Page::Frame(frame) => Page::Frame(Arc::clone(frame)),
            Page::Device(paddr) => Page::Device(*paddr),
        }
    }
}

pub(crate) struct Vma<M: Mmu> {
    pub(crate) start: usize,
    pub(crate) len: usize,
    pub(crate) prot: Prot,
    pub(crate) sharing: Sharing,
    pub(crate) backing: Backing,
    /// Resident pages keyed by virtual address.
    pub(crate) pages: BTreeMap<usize, Page<M>>,
}

impl<M: Mmu> Vma<M> {
    pub(crate) fn new(start: usize, len: usize, prot: Prot, sharing: Sharing, backing: Backing) -> Self {
        debug_assert!(is_page_aligned(start) && is_page_aligned(len) && len > 0);
        Self { start, len, prot, sharing, backing, pages: BTreeMap::new() }
    }

    pub(crate) fn end(&self) -> usize {
        self.start + self.len
    }

    pub(crate) fn contains(&self, addr: usize) -> bool {
        addr >= self.start && addr < self.end()
    }

    pub(crate) fn info(&self) -> VmaInfo {
        VmaInfo {
            start: self.start,
            len: self.len,
            prot: self.prot,
            sharing: self.sharing,
            backing: self.backing.kind(),
            resident_pages: self.pages.len(),
        }
    }

    /// Same metadata, no resident pages; used by clone before pages are shared.
    pub(crate) fn empty_copy(&self) -> Self {
        Self::new(self.start, self.len, self.prot, self.sharing, self.backing.clone())
    }

    /// Cuts the VMA at `at`; `self` keeps `[start, at)` and the returned VMA
    /// covers `[at, end)` with its resident pages.
    pub(crate) fn split_off(&mut self, at: usize) -> Self {
        assert!(
            at > self.start && at < self.end() && is_page_aligned(at),
            "vma: split at {at:#x} outside ({:#x}, {:#x})",
            self.start,
            self.end()
        );
        let upper_pages = self.pages.split_off(&at);
        let upper = Self {
            start: at,
            len: self.end() - at,
            prot: self.prot,
            sharing: self.sharing,
            backing: self.backing.advanced(at - self.start),
            pages: upper_pages,
        };
        self.len = at - self.start;
        upper
    }

    /// Rights to install for `page`, withholding write while a private frame
    /// is still shared with another space.
    pub(crate) fn page_rights(&self, page: &Page<M>) -> PageRights {
        let mut rights = self.prot.page_rights();
        if let (Sharing::Private, Page::Frame(frame)) = (self.sharing, page) {
            if Arc::strong_count(frame) > 1 {
                rights.remove(PageRights::WRITE);
            }
        }
        rights
    }

    /// Unresolves and drops every resident page.
    pub(crate) fn release_pages(&mut self, mmu: &M, root: PageTableRoot) {
        for (vaddr, _) in core::mem::take(&mut self.pages) {
            mmu.drop_page(root, vaddr);
        }
    }
}
