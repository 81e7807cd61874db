// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! 16550 UART on the `virt` machine, used as the kernel log sink.

use core::fmt::{self, Arguments, Write};

use spin::Mutex;

use crate::diag::log::LogSink;

const UART0_BASE: usize = 0x1000_0000;
const UART_TX: usize = 0x0;
const UART_LSR: usize = 0x5;
const LSR_TX_IDLE: u8 = 1 << 5;

static UART0: Mutex<KernelUart> = Mutex::new(KernelUart::new(UART0_BASE));

#[derive(Clone, Copy)]
pub struct KernelUart {
    base: usize,
}

impl KernelUart {
    pub const fn new(base: usize) -> Self {
        Self { base }
    }

    fn put(&self, byte: u8) {
        // SAFETY: `base` is the identity-mapped MMIO window of the UART.
        unsafe {
            while core::ptr::read_volatile((self.base + UART_LSR) as *const u8) & LSR_TX_IDLE == 0 {}
            core::ptr::write_volatile((self.base + UART_TX) as *mut u8, byte);
        }
    }
}

impl Write for KernelUart {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &byte in s.as_bytes() {
            if byte == b'\n' {
                self.put(b'\r');
            }
            self.put(byte);
        }
        Ok(())
    }
}

/// Log sink writing one line per record. Falls back to an unlocked writer
/// when the UART lock is held, so a panic mid-line still gets out.
pub struct UartSink;

impl LogSink for UartSink {
    fn write_line(&self, line: Arguments<'_>) {
        match UART0.try_lock() {
            Some(mut uart) => {
                let _ = writeln!(uart, "{}", line);
            }
            None => {
                let _ = writeln!(KernelUart::new(UART0_BASE), "{}", line);
            }
        }
    }
}

pub static SINK: UartSink = UartSink;

/// Routes kernel logging to UART0.
pub fn init() {
    crate::diag::log::install_sink(&SINK);
}
