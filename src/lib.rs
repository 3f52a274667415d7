// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! AXON: the virtual-address-space management core of a capability-based
//! microkernel.
//!
//! The crate walks and mutates the radix hardware page tables, binds address
//! spaces to ASIDs through a two-level directory, exposes the paging
//! invocations (page table, frame, ASID control and ASID pool) behind a
//! pure-decode / infallible-perform split, and replicates the privileged
//! range across independent kernel images. Host builds exercise the full
//! logic; hardware barriers and CSR writes live behind target gates in
//! `arch`.

#![no_std]

#[cfg(test)]
extern crate std;

#[macro_use]
pub mod log;

pub mod arch;
pub mod cap;
pub mod invocation;
pub mod kimage;
pub mod mem;
pub mod types;
pub mod uart;
pub mod vm;

#[cfg(all(feature = "panic_handler", target_arch = "riscv64", target_os = "none"))]
mod panic;
