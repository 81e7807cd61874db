// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Address spaces as ordered VMA trees with lazy paging
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Mspace::{create, clone_space, map, unmap, protect, search_vma,
//!             grow_heap, stats, vmas}, MspaceRef
//! DEPENDS_ON: axon_sync::SpinLock, hal::Mmu, mm::vma
//! INVARIANTS: VMAs are disjoint and inside the bounds; every resident page
//!             belongs to exactly one VMA; all tree access holds the space lock;
//!             the last MspaceRef releases pages and the page-table root

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ops::Range;
use core::sync::atomic::{AtomicU32, Ordering};

use axon_sync::SpinLock;

use crate::hal::{Mmu, PageTableRoot};
use crate::log_trace;
use crate::types::MspaceId;

use super::vma::{Page, Vma};
use super::{align_up, is_page_aligned, Backing, MapFlags, MmError, Prot, Sharing, VmaInfo};

/// Shared handle; tasks cloned with shared memory hold the same space.
pub type MspaceRef<M> = Arc<Mspace<M>>;

pub(super) type VmaTree<M> = BTreeMap<usize, Vma<M>>;

static NEXT_MSPACE_ID: AtomicU32 = AtomicU32::new(1);

/// Diagnostic counters; computed on demand, not authoritative.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MspaceStats {
    pub vma_count: usize,
    pub resident_pages: usize,
    pub virtual_bytes: usize,
    /// Bytes backed by inodes.
    pub backing_bytes: usize,
}

pub struct Mspace<M: Mmu> {
    id: MspaceId,
    pub(super) mmu: Arc<M>,
    pub(super) root: PageTableRoot,
    bounds: Range<usize>,
    pub(super) vmas: SpinLock<VmaTree<M>>,
}

impl<M: Mmu> Mspace<M> {
    /// Creates an empty space covering `bounds`.
    pub fn create(mmu: &Arc<M>, bounds: Range<usize>) -> Result<MspaceRef<M>, MmError> {
        if bounds.start >= bounds.end {
            return Err(MmError::InvalidArgs);
        }
        if !is_page_aligned(bounds.start) || !is_page_aligned(bounds.end) {
            return Err(MmError::Unaligned);
        }
        let root = mmu.create_root()?;
        Ok(Arc::new(Self::with_root(mmu, root, bounds)))
    }

    fn with_root(mmu: &Arc<M>, root: PageTableRoot, bounds: Range<usize>) -> Self {
        Self {
            id: MspaceId::from_raw(NEXT_MSPACE_ID.fetch_add(1, Ordering::Relaxed)),
            mmu: Arc::clone(mmu),
            root,
            bounds,
            vmas: SpinLock::new(BTreeMap::new()),
        }
    }

    pub fn id(&self) -> MspaceId {
        self.id
    }

    pub fn root(&self) -> PageTableRoot {
        self.root
    }

    pub fn bounds(&self) -> Range<usize> {
        self.bounds.clone()
    }

    /// Fork-style copy: the VMA tree is duplicated, resident private pages
    /// become copy-on-write in both spaces, shared pages stay shared.
    pub fn clone_space(&self) -> Result<MspaceRef<M>, MmError> {
        let root = self.mmu.create_root()?;
        let child = Arc::new(Self::with_root(&self.mmu, root, self.bounds()));
        let tree = self.vmas.lock();
        let mut child_tree = child.vmas.lock();
        for (start, vma) in tree.iter() {
            let mut copy = vma.empty_copy();
            for (vaddr, page) in &vma.pages {
                copy.pages.insert(*vaddr, page.share());
            }
            child_tree.insert(*start, copy);
        }
        for vma in tree.values().filter(|vma| vma.sharing == Sharing::Private) {
            for (vaddr, page) in vma.pages.iter().filter(|(_, page)| matches!(page, Page::Frame(_))) {
                self.mmu.protect_page(self.root, *vaddr, vma.page_rights(page));
            }
        }
        for vma in child_tree.values() {
            for (vaddr, page) in &vma.pages {
                self.mmu.resolve_page(root, *vaddr, page.paddr(), vma.page_rights(page))?;
            }
        }
        log_trace!(
            target: "mm",
            "clone space {} -> {} ({} vmas)",
            self.id.as_raw(),
            child.id.as_raw(),
            child_tree.len()
        );
        drop(child_tree);
        drop(tree);
        Ok(child)
    }

    /// Reserves a VMA; no page is resolved until it is touched.
    ///
    /// Without `MapFlags::FIXED` a page-aligned, non-zero `hint` is used when
    /// it is free; otherwise the lowest free range is chosen.
    pub fn map(
        &self,
        hint: usize,
        len: usize,
        backing: Backing,
        prot: Prot,
        flags: MapFlags,
    ) -> Result<usize, MmError> {
        if len == 0 {
            return Err(MmError::InvalidArgs);
        }
        let len = align_up(len).ok_or(MmError::InvalidArgs)?;
        backing.check_alignment()?;
        let sharing =
            if flags.contains(MapFlags::SHARED) { Sharing::Shared } else { Sharing::Private };

        let mut tree = self.vmas.lock();
        let start = if flags.contains(MapFlags::FIXED) {
            if !is_page_aligned(hint) {
                return Err(MmError::Unaligned);
            }
            let end = hint.checked_add(len).ok_or(MmError::OutOfBounds)?;
            if hint < self.bounds.start || end > self.bounds.end {
                return Err(MmError::OutOfBounds);
            }
            if !is_free(&tree, hint, end) {
                return Err(MmError::Overlap);
            }
            hint
        } else {
            match self.hint_fits(&tree, hint, len) {
                Some(start) => start,
                None => first_fit(&tree, &self.bounds, len).ok_or(MmError::NoSpace)?,
            }
        };
        tree.insert(start, Vma::new(start, len, prot, sharing, backing));
        log_trace!(target: "mm", "map {:#x}+{:#x} {:?} {:?}", start, len, prot, sharing);
        Ok(start)
    }

    fn hint_fits(&self, tree: &VmaTree<M>, hint: usize, len: usize) -> Option<usize> {
        if hint == 0 || !is_page_aligned(hint) || hint < self.bounds.start {
            return None;
        }
        let end = hint.checked_add(len)?;
        (end <= self.bounds.end && is_free(tree, hint, end)).then_some(hint)
    }

    /// Removes `[addr, addr + len)`, splitting VMAs that straddle the edges.
    /// Holes in the range are ignored.
    pub fn unmap(&self, addr: usize, len: usize) -> Result<(), MmError> {
        let end = checked_range(addr, len)?;
        let mut tree = self.vmas.lock();
        split_at(&mut tree, addr);
        split_at(&mut tree, end);
        let doomed: Vec<usize> = tree.range(addr..end).map(|(start, _)| *start).collect();
        for start in doomed {
            if let Some(mut vma) = tree.remove(&start) {
                vma.release_pages(&self.mmu, self.root);
            }
        }
        log_trace!(target: "mm", "unmap {:#x}+{:#x}", addr, len);
        Ok(())
    }

    /// Changes the rights of a fully mapped range and re-applies them to
    /// every resident page in it.
    pub fn protect(&self, addr: usize, len: usize, prot: Prot) -> Result<(), MmError> {
        let end = checked_range(addr, len)?;
        let mut tree = self.vmas.lock();
        if !is_covered(&tree, addr, end) {
            return Err(MmError::NotMapped);
        }
        split_at(&mut tree, addr);
        split_at(&mut tree, end);
        for vma in tree.range_mut(addr..end).map(|(_, vma)| vma) {
            vma.prot = prot;
            let vma = &*vma;
            for (vaddr, page) in &vma.pages {
                self.mmu.protect_page(self.root, *vaddr, vma.page_rights(page));
            }
        }
        Ok(())
    }

    /// Covering VMA of `addr`, if any.
    pub fn search_vma(&self, addr: usize) -> Option<VmaInfo> {
        let tree = self.vmas.lock();
        covering(&tree, addr).map(Vma::info)
    }

    /// Snapshot of every VMA in address order.
    pub fn vmas(&self) -> Vec<VmaInfo> {
        self.vmas.lock().values().map(Vma::info).collect()
    }

    pub fn stats(&self) -> MspaceStats {
        let tree = self.vmas.lock();
        tree.values().fold(MspaceStats::default(), |mut stats, vma| {
            stats.vma_count += 1;
            stats.resident_pages += vma.pages.len();
            stats.virtual_bytes += vma.len;
            if matches!(vma.backing, Backing::File { .. }) {
                stats.backing_bytes += vma.len;
            }
            stats
        })
    }

    /// Moves the program break up by `delta` bytes (page rounded) and returns
    /// the previous break. The first call places the heap at the lowest free
    /// range.
    pub fn grow_heap(&self, delta: usize) -> Result<usize, MmError> {
        let delta = align_up(delta).ok_or(MmError::InvalidArgs)?;
        let mut tree = self.vmas.lock();
        let heap = tree
            .values()
            .filter(|vma| matches!(vma.backing, Backing::Heap))
            .map(|vma| (vma.start, vma.end()))
            .last();
        match heap {
            None => {
                if delta == 0 {
                    return Err(MmError::NotMapped);
                }
                let start = first_fit(&tree, &self.bounds, delta).ok_or(MmError::NoSpace)?;
                tree.insert(start, Vma::new(start, delta, Prot::RW, Sharing::Private, Backing::Heap));
                Ok(start)
            }
            Some((start, old_end)) => {
                if delta == 0 {
                    return Ok(old_end);
                }
                let new_end = old_end.checked_add(delta).ok_or(MmError::NoSpace)?;
                if new_end > self.bounds.end || !is_free(&tree, old_end, new_end) {
                    return Err(MmError::NoSpace);
                }
                if let Some(vma) = tree.get_mut(&start) {
                    vma.len += delta;
                }
                Ok(old_end)
            }
        }
    }
}

impl<M: Mmu> Drop for Mspace<M> {
    fn drop(&mut self) {
        let tree = core::mem::take(self.vmas.get_mut());
        for (_, mut vma) in tree {
            vma.release_pages(&self.mmu, self.root);
        }
        self.mmu.destroy_root(self.root);
    }
}

fn checked_range(addr: usize, len: usize) -> Result<usize, MmError> {
    if len == 0 {
        return Err(MmError::InvalidArgs);
    }
    if !is_page_aligned(addr) || !is_page_aligned(len) {
        return Err(MmError::Unaligned);
    }
    addr.checked_add(len).ok_or(MmError::InvalidArgs)
}

pub(super) fn covering<M: Mmu>(tree: &VmaTree<M>, addr: usize) -> Option<&Vma<M>> {
    tree.range(..=addr).next_back().map(|(_, vma)| vma).filter(|vma| vma.contains(addr))
}

pub(super) fn covering_mut<M: Mmu>(tree: &mut VmaTree<M>, addr: usize) -> Option<&mut Vma<M>> {
    tree.range_mut(..=addr).next_back().map(|(_, vma)| vma).filter(|vma| vma.contains(addr))
}

/// True when no VMA intersects `[start, end)`. Only the last VMA starting
/// below `end` can reach into the range.
fn is_free<M: Mmu>(tree: &VmaTree<M>, start: usize, end: usize) -> bool {
    tree.range(..end).next_back().map_or(true, |(_, vma)| vma.end() <= start)
}

fn is_covered<M: Mmu>(tree: &VmaTree<M>, start: usize, end: usize) -> bool {
    let first = tree.range(..=start).next_back().map_or(start, |(key, _)| *key);
    let mut cursor = start;
    for vma in tree.range(first..end).map(|(_, vma)| vma).filter(|vma| vma.end() > start) {
        if vma.start > cursor {
            return false;
        }
        cursor = vma.end();
        if cursor >= end {
            return true;
        }
    }
    false
}

fn first_fit<M: Mmu>(tree: &VmaTree<M>, bounds: &Range<usize>, len: usize) -> Option<usize> {
    let mut cursor = bounds.start;
    for vma in tree.values() {
        if vma.end() <= cursor {
            continue;
        }
        if vma.start >= cursor.checked_add(len)? {
            break;
        }
        cursor = vma.end();
    }
    let end = cursor.checked_add(len)?;
    (end <= bounds.end).then_some(cursor)
}

/// Splits the VMA strictly containing `addr` so that `addr` becomes a
/// VMA boundary.
fn split_at<M: Mmu>(tree: &mut VmaTree<M>, addr: usize) {
    let upper = match covering_mut(tree, addr) {
        Some(vma) if vma.start < addr => vma.split_off(addr),
        _ => return,
    };
    tree.insert(upper.start, upper);
}
