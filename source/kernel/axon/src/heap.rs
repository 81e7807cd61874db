// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Kernel heap backing `alloc` on bare-metal images.

#[cfg(not(test))]
use linked_list_allocator::LockedHeap;

#[cfg(not(test))]
#[global_allocator]
static HEAP: LockedHeap = LockedHeap::empty();

/// Hands `[start, start + size)` to the global allocator.
///
/// # Safety
/// Call once during early boot, before the first allocation. The range must
/// be unused, writable RAM that stays reserved for the heap.
#[cfg(not(test))]
pub unsafe fn init(start: usize, size: usize) {
    // SAFETY: forwarded from the caller's contract.
    unsafe { HEAP.lock().init(start as *mut u8, size) };
    crate::log_info!(target: "boot", "heap {:#x}+{:#x}", start, size);
}

/// Bytes currently handed out by the kernel heap.
#[cfg(not(test))]
pub fn used() -> usize {
    HEAP.lock().used()
}
