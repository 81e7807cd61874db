// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! CONTEXT: Property-based tests for the VMA tree
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; no kernel logic. Ensures placement never overlaps.
//!
//! TEST_SCOPE:
//!   - Arbitrary map/unmap/protect sequences keep VMAs disjoint and in bounds
//!   - Mapping then unmapping a fresh region restores the previous tree
//!
//! TEST_SCENARIOS:
//!   - vmas_stay_disjoint(): any op sequence leaves a sorted, disjoint tree
//!   - map_unmap_is_identity(): a fresh map followed by its unmap is a no-op

use proptest::prelude::*;

use super::{Backing, MapFlags, Mspace, MspaceRef, Prot, VmaInfo, PAGE_SIZE};
use crate::hal::sim::SimMmu;

const SPACE_PAGES: usize = 256;

#[derive(Clone, Debug)]
enum Op {
    Map { hint: usize, pages: usize, fixed: bool },
    Unmap { page: usize, pages: usize },
    Protect { page: usize, pages: usize },
}

fn arb_op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (0usize..SPACE_PAGES, 1usize..16, any::<bool>())
            .prop_map(|(hint, pages, fixed)| Op::Map { hint, pages, fixed }),
        (0usize..SPACE_PAGES, 1usize..32).prop_map(|(page, pages)| Op::Unmap { page, pages }),
        (0usize..SPACE_PAGES, 1usize..8).prop_map(|(page, pages)| Op::Protect { page, pages }),
    ]
}

fn apply(space: &Mspace<SimMmu>, op: &Op) {
    // Errors are expected for colliding or out-of-range requests.
    let _ = match *op {
        Op::Map { hint, pages, fixed } => {
            let flags = if fixed { MapFlags::FIXED } else { MapFlags::empty() };
            space
                .map(hint * PAGE_SIZE, pages * PAGE_SIZE, Backing::Anonymous, Prot::RW, flags)
                .map(|_| ())
        }
        Op::Unmap { page, pages } => space.unmap(page * PAGE_SIZE, pages * PAGE_SIZE),
        Op::Protect { page, pages } => space.protect(page * PAGE_SIZE, pages * PAGE_SIZE, Prot::READ),
    };
}

fn fresh() -> MspaceRef<SimMmu> {
    match Mspace::create(&SimMmu::new(), 0..SPACE_PAGES * PAGE_SIZE) {
        Ok(space) => space,
        Err(err) => panic!("create space: {err:?}"),
    }
}

fn check_layout(vmas: &[VmaInfo]) -> Result<(), TestCaseError> {
    for vma in vmas {
        prop_assert!(vma.len > 0);
        prop_assert!(vma.end() <= SPACE_PAGES * PAGE_SIZE);
        prop_assert_eq!(vma.start % PAGE_SIZE, 0);
    }
    for pair in vmas.windows(2) {
        prop_assert!(pair[0].end() <= pair[1].start, "{:?} overlaps {:?}", pair[0], pair[1]);
    }
    Ok(())
}

proptest! {
    #[test]
    fn vmas_stay_disjoint(ops in proptest::collection::vec(arb_op(), 1..48)) {
        let space = fresh();
        for op in &ops {
            apply(&space, op);
            check_layout(&space.vmas())?;
        }
    }

    #[test]
    fn map_unmap_is_identity(
        ops in proptest::collection::vec(arb_op(), 0..24),
        hint in 0usize..SPACE_PAGES,
        pages in 1usize..8,
    ) {
        let space = fresh();
        for op in &ops {
            apply(&space, op);
        }
        let before = space.vmas();
        if let Ok(addr) =
            space.map(hint * PAGE_SIZE, pages * PAGE_SIZE, Backing::Anonymous, Prot::RW, MapFlags::empty())
        {
            prop_assert!(space.search_vma(addr).is_some());
            prop_assert!(space.unmap(addr, pages * PAGE_SIZE).is_ok());
        }
        prop_assert_eq!(space.vmas(), before);
    }
}
