// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Interrupt nesting behaviour with installed platform hooks
//! NOTE: One test function; the hooks are process-global.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};

use axon_sync::{irq, SpinLock};

static ENABLED: AtomicBool = AtomicBool::new(true);

fn disable() -> bool {
    ENABLED.swap(false, Ordering::SeqCst)
}

fn enable() {
    ENABLED.store(true, Ordering::SeqCst);
}

fn cpu_id() -> usize {
    0
}

static OPS: irq::IrqOps = irq::IrqOps { disable, enable, cpu_id };

fn delivery() -> bool {
    ENABLED.load(Ordering::SeqCst)
}

#[test]
fn nesting_restores_delivery_only_at_outermost_release() {
    irq::install(&OPS);
    let outer = SpinLock::new(0_u8);
    let inner = SpinLock::new(0_u8);

    // Nested locks keep delivery masked until the last guard is gone.
    let a = outer.lock();
    assert!(!delivery());
    let b = inner.lock();
    assert_eq!(irq::depth(), 2);
    drop(b);
    assert!(!delivery());
    assert_eq!(irq::depth(), 1);
    drop(a);
    assert!(delivery());
    assert_eq!(irq::depth(), 0);

    // Delivery that was off at the outermost acquisition stays off.
    ENABLED.store(false, Ordering::SeqCst);
    drop(outer.lock());
    assert!(!delivery());
    ENABLED.store(true, Ordering::SeqCst);

    // A failed try_lock gives back its nesting level.
    let held = outer.lock();
    assert!(outer.try_lock().is_none());
    assert_eq!(irq::depth(), 1);
    drop(held);
    assert!(delivery());

    // Recursive acquisition is caught in debug builds.
    if cfg!(debug_assertions) {
        let result = panic::catch_unwind(AssertUnwindSafe(|| {
            let _first = outer.lock();
            let _second = outer.lock();
        }));
        assert!(result.is_err());
        assert_eq!(irq::depth(), 0);
        assert!(delivery());
        assert!(!outer.is_locked());
    }
}
