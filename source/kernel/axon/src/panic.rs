// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Panic handler for bare-metal images
//! OWNERS: @kernel-team
//! PUBLIC API: panic handler (no_std)
//! DEPENDS_ON: diag::log (installed sink)
//! INVARIANTS: No allocation; parks the processor with interrupts masked

#[cfg(not(test))]
use core::panic::PanicInfo;

#[cfg(not(test))]
#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    axon_sync::irq::push_off();
    match info.location() {
        Some(location) => crate::log_error!(
            target: "panic",
            "{}:{}: {}",
            location.file(),
            location.line(),
            info.message()
        ),
        None => crate::log_error!(target: "panic", "{}", info.message()),
    }
    loop {
        #[cfg(all(target_arch = "riscv64", target_os = "none"))]
        // SAFETY: wfi has no memory effects.
        unsafe {
            core::arch::asm!("wfi", options(nomem, nostack, preserves_flags))
        };
        #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
        core::hint::spin_loop();
    }
}
