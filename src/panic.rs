// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Opt-in panic handler for no_std kernel images.
//!
//! A panic in the paging core means a perform-phase invariant broke; emit
//! the location over the raw UART and hand the hart back to the platform.

use core::{fmt::Write, panic::PanicInfo};

use crate::uart;

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    let mut w = uart::raw_writer();

    let _ = w.write_str("\nPANIC: ");
    if let Some(location) = info.location() {
        let _ = w.write_str(location.file());
        let _ = w.write_str(": ");
    }
    if let Some(msg) = info.message().as_str() {
        let _ = w.write_str(msg);
    } else {
        let _ = w.write_str("<complex msg>");
    }
    let _ = w.write_str("\n");

    sbi_rt::system_reset(sbi_rt::Shutdown, sbi_rt::SystemFailure);
    loop {
        // SAFETY: parking the hart after a failed reset request.
        unsafe { core::arch::asm!("wfi", options(nomem, nostack, preserves_flags)) };
    }
}
