// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Architecture backends. Only RISC-V is modeled; host builds get inert
//! stubs so the paging logic stays testable off-target.

pub mod riscv;
