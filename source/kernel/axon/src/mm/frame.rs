// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Reference-counted physical frames; the last handle returns the frame.

use alloc::sync::Arc;

use crate::hal::Mmu;
use crate::types::PhysAddr;

use super::MmError;

/// One allocated physical frame. Shared between spaces through `Arc` while
/// copy-on-write is pending.
#[derive(Debug)]
pub struct Frame<M: Mmu> {
    paddr: PhysAddr,
    mmu: Arc<M>,
}

impl<M: Mmu> Frame<M> {
    /// Allocates a zero-filled frame.
    pub fn zeroed(mmu: &Arc<M>) -> Result<Arc<Self>, MmError> {
        let paddr = mmu.alloc_frame().ok_or(MmError::OutOfFrames)?;
        mmu.zero_frame(paddr);
        Ok(Arc::new(Self { paddr, mmu: Arc::clone(mmu) }))
    }

    /// Allocates a frame holding a copy of `self`.
    pub fn duplicate(&self) -> Result<Arc<Self>, MmError> {
        let paddr = self.mmu.alloc_frame().ok_or(MmError::OutOfFrames)?;
        self.mmu.copy_frame(paddr, self.paddr);
        Ok(Arc::new(Self { paddr, mmu: Arc::clone(&self.mmu) }))
    }

    pub fn paddr(&self) -> PhysAddr {
        self.paddr
    }
}

impl<M: Mmu> Drop for Frame<M> {
    fn drop(&mut self) {
        self.mmu.free_frame(self.paddr);
    }
}
