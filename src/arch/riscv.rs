// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! RISC-V translation primitives used by the paging core.
//!
//! Each function is the hardware barrier or CSR write on the bare-metal
//! target and a no-op on the host, so high-level logic runs unmodified in
//! tests. The fence functions are the "commit ordering" primitive: after
//! they return, all prior writes to translation structures are visible to
//! address translation on this hart.

use crate::types::{Asid, PhysAddr};

/// Orders all prior page-table writes before subsequent translation.
#[inline]
pub fn sfence_vma() {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    unsafe {
        core::arch::asm!("sfence.vma", options(nostack));
    }
}

/// Flushes cached translations tagged with `asid` on this hart.
#[inline]
pub fn sfence_vma_asid(asid: Asid) {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    unsafe {
        core::arch::asm!("sfence.vma x0, {0}", in(reg) asid.as_raw() as usize, options(nostack));
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        let _ = asid;
    }
}

/// Synchronizes the instruction stream after code pages change.
#[inline]
pub fn fence_i() {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    unsafe {
        core::arch::asm!("fence.i", options(nostack));
    }
}

/// Installs `root` as the active translation root tagged with `asid`.
#[inline]
pub fn set_translation_root(root: PhysAddr, asid: Asid) {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    unsafe {
        #[cfg(feature = "sv48")]
        let mode = riscv::register::satp::Mode::Sv48;
        #[cfg(not(feature = "sv48"))]
        let mode = riscv::register::satp::Mode::Sv39;
        riscv::register::satp::set(mode, asid.as_raw() as usize, root.ppn());
        core::arch::asm!("sfence.vma", options(nostack));
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        let _ = (root, asid);
    }
}

/// Address that faulted, as latched by the trap hardware.
#[inline]
pub fn read_fault_address() -> usize {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        riscv::register::stval::read()
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        0
    }
}
