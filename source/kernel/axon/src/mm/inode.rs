// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Inode handle contract consumed by file-backed VMAs.

/// Failure reported by an inode read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoError {
    /// The device or filesystem reported an error.
    Device,
    /// The inode was truncated or removed underneath the mapping.
    Stale,
}

/// A file object that can back a VMA. Held through `Arc<dyn Inode>`; each
/// VMA (and each split fragment) keeps its own handle.
pub trait Inode: Send + Sync {
    /// Stable identity for diagnostics.
    fn id(&self) -> u64;

    /// Reads from `offset` into `buf`; returns bytes read. Short reads at
    /// end-of-file are fine, the rest of the page stays zero.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize, IoError>;
}
