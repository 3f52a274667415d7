// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Translation of raw hardware fault causes into the structured VM-fault
//! record handed to the fault-delivery layer.

/// Raw exception cause codes of the hardware trap register.
pub const CAUSE_INSTRUCTION_ACCESS_FAULT: usize = 1;
pub const CAUSE_LOAD_ACCESS_FAULT: usize = 5;
pub const CAUSE_STORE_ACCESS_FAULT: usize = 7;
pub const CAUSE_INSTRUCTION_PAGE_FAULT: usize = 12;
pub const CAUSE_LOAD_PAGE_FAULT: usize = 13;
pub const CAUSE_STORE_PAGE_FAULT: usize = 15;

/// Kind of access that faulted.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmFaultKind {
    LoadAccess,
    StoreAccess,
    InstructionAccess,
}

/// Structured fault record delivered to the faulting thread's handler.
///
/// Not an error of the paging core: a running user context hit a missing or
/// forbidden translation, and the registered handler decides what happens.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VmFault {
    /// Faulting virtual address.
    pub addr: usize,
    /// Access kind; page faults fold into the matching access fault.
    pub kind: VmFaultKind,
    /// True for instruction-fetch faults, where the reported program counter
    /// needs the next-instruction fixup in the trap layer.
    pub instruction: bool,
}

/// Builds a fault record from a raw cause and the faulting address.
///
/// Returns `None` for causes that are not VM faults; those belong to the
/// trap dispatcher, not to this subsystem.
pub fn vm_fault_from_cause(cause: usize, addr: usize) -> Option<VmFault> {
    let (kind, instruction) = match cause {
        CAUSE_LOAD_PAGE_FAULT | CAUSE_LOAD_ACCESS_FAULT => (VmFaultKind::LoadAccess, false),
        CAUSE_STORE_PAGE_FAULT | CAUSE_STORE_ACCESS_FAULT => (VmFaultKind::StoreAccess, false),
        CAUSE_INSTRUCTION_PAGE_FAULT | CAUSE_INSTRUCTION_ACCESS_FAULT => {
            (VmFaultKind::InstructionAccess, true)
        }
        _ => return None,
    };
    Some(VmFault { addr, kind, instruction })
}
