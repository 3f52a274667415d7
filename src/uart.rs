// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Minimal UART sink for kernel diagnostics.

use core::fmt::{self, Write};
use spin::Mutex;

/// Address of the first UART on the `virt` machine.
const UART0_BASE: usize = 0x1000_0000;
const UART_TX: usize = 0x0;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
const UART_LSR: usize = 0x5;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
const LSR_TX_IDLE: u8 = 1 << 5;

/// Global UART writer used for kernel logs.
static UART0: Mutex<KernelUart> = Mutex::new(KernelUart::new(UART0_BASE));

/// UART implementation capable of formatted writes.
#[derive(Clone, Copy)]
pub struct KernelUart {
    base: usize,
}

impl KernelUart {
    /// Creates a UART abstraction rooted at `base`.
    pub const fn new(base: usize) -> Self {
        Self { base }
    }

    /// Returns a guard for the kernel UART singleton.
    pub fn lock() -> spin::MutexGuard<'static, KernelUart> {
        UART0.lock()
    }

    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    fn write_raw(&self, offset: usize, value: u8) {
        let addr = (self.base + offset) as *mut u8;
        unsafe {
            while core::ptr::read_volatile((self.base + UART_LSR) as *const u8) & LSR_TX_IDLE == 0 {
            }
            core::ptr::write_volatile(addr, value);
        }
    }

    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    fn write_raw(&self, _offset: usize, _value: u8) {
        let _ = self.base;
    }
}

impl Write for KernelUart {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for &byte in s.as_bytes() {
            if byte == b'\n' {
                self.write_raw(UART_TX, b'\r');
            }
            self.write_raw(UART_TX, byte);
        }
        Ok(())
    }
}

/// Lock-free writer for panic contexts where the mutex may already be held.
pub struct RawUart;

impl Write for RawUart {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        let uart = KernelUart::new(UART0_BASE);
        for &byte in s.as_bytes() {
            if byte == b'\n' {
                uart.write_raw(UART_TX, b'\r');
            }
            uart.write_raw(UART_TX, byte);
        }
        Ok(())
    }
}

pub fn raw_writer() -> RawUart {
    RawUart
}
