// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Radix-tree page-table walkers.
//!
//! Three variants cover every consumer in the paging core:
//!
//! * [`lookup_slot`] walks an address towards a target level and always
//!   reports the deepest slot it reached, so callers can either insist on the
//!   target level or install the missing level themselves.
//! * [`lookup_slot_bounded`] is the depth-bounded walker used by the
//!   kernel-image code; it accounts in untranslated bits instead of levels.
//! * [`lookup_parent_slot`] recovers the parent slot referencing a given
//!   table node. Nodes store no back-pointers, so the path is rebuilt by
//!   walking the address again.

use crate::types::{PhysAddr, VirtAddr};
use crate::vm::pte::{PageTable, PtSlot};
use crate::vm::{level_page_bits, pt_index, PAGE_BITS, PT_INDEX_BITS, PT_LEVELS, VADDR_BITS};

/// Reason a walk terminated before the requested depth.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LookupFault {
    /// The root was null or the ASID had no directory entry.
    InvalidRoot,
    /// An intermediate level was absent; carries the width of the region the
    /// empty slot covers (the missing level's page-size class).
    MissingCapability { bits_left: usize },
}

/// Outcome of an address-based walk.
#[derive(Clone, Copy, Debug)]
pub struct PtWalk {
    /// Deepest slot reached.
    pub slot: PtSlot,
    /// Level the slot lives at, root being level 1.
    pub level: usize,
    /// Set when the walk stopped short of the target level.
    pub fault: Option<LookupFault>,
}

impl PtWalk {
    /// The reached slot, or the fault if the target level was not reached.
    #[inline]
    pub fn slot_checked(&self) -> Result<PtSlot, LookupFault> {
        match self.fault {
            None => Ok(self.slot),
            Some(fault) => Err(fault),
        }
    }
}

/// Walks `root` for `vaddr`, descending while entries are valid table
/// pointers, until the slot at `target_level` is reached.
///
/// A null root is rejected without being dereferenced. On an early stop the
/// returned walk carries the deepest slot together with a
/// [`LookupFault::MissingCapability`] naming the absent level's size class.
pub fn lookup_slot(
    root: PhysAddr,
    vaddr: VirtAddr,
    target_level: usize,
) -> Result<PtWalk, LookupFault> {
    debug_assert!(target_level >= 1 && target_level <= PT_LEVELS);
    if root.is_null() {
        return Err(LookupFault::InvalidRoot);
    }

    // SAFETY: root is a non-null bound table node for the whole walk; each
    // descent target came out of a valid table entry.
    let mut slot = unsafe { PageTable::slot(root, pt_index(vaddr.raw(), 1)) };
    let mut level = 1;
    while level < target_level {
        let pte = slot.read();
        if !pte.is_table() {
            return Ok(PtWalk {
                slot,
                level,
                fault: Some(LookupFault::MissingCapability { bits_left: level_page_bits(level) }),
            });
        }
        level += 1;
        slot = unsafe { PageTable::slot(pte.phys_addr(), pt_index(vaddr.raw(), level)) };
    }
    Ok(PtWalk { slot, level, fault: None })
}

/// Outcome of a depth-bounded walk: the stopping slot and how many address
/// bits remain untranslated there.
#[derive(Clone, Copy, Debug)]
pub struct PtSpan {
    pub slot: PtSlot,
    pub bits_left: usize,
}

/// Depth-bounded walker used by kernel-image construction and cloning.
///
/// Descends at most `depth` steps, stopping early at anything that is not a
/// valid table pointer (an empty slot or an installed leaf). `bits_left`
/// names the size of the region the stopping slot covers.
pub fn lookup_slot_bounded(root: PhysAddr, vaddr: VirtAddr, depth: usize) -> PtSpan {
    debug_assert!(!root.is_null() && depth >= 1);
    let mut bits_left = VADDR_BITS;
    let mut table = root;
    let mut remaining = depth;
    loop {
        bits_left -= PT_INDEX_BITS;
        let index = (vaddr.raw() >> bits_left) & ((1 << PT_INDEX_BITS) - 1);
        // SAFETY: `table` is the non-null root or came out of a table entry.
        let slot = unsafe { PageTable::slot(table, index) };
        let pte = slot.read();
        remaining -= 1;
        if remaining == 0 || !pte.is_table() || bits_left == PAGE_BITS {
            return PtSpan { slot, bits_left };
        }
        table = pte.phys_addr();
    }
}

/// Structure-based walk: finds the slot in `root`'s tree whose pointee is the
/// table node at `target`.
///
/// Used by page-table unmap, where the capability records the mapped address
/// but not the parent slot.
pub fn lookup_parent_slot(
    root: PhysAddr,
    vaddr: VirtAddr,
    target: PhysAddr,
) -> Result<PtSlot, LookupFault> {
    if root.is_null() {
        return Err(LookupFault::InvalidRoot);
    }

    // SAFETY: as in lookup_slot; every descent target is a valid table entry.
    let mut slot = unsafe { PageTable::slot(root, pt_index(vaddr.raw(), 1)) };
    for level in 2..=PT_LEVELS {
        let pte = slot.read();
        if !pte.is_table() {
            return Err(LookupFault::MissingCapability { bits_left: level_page_bits(level - 1) });
        }
        let table = pte.phys_addr();
        if table == target {
            return Ok(slot);
        }
        slot = unsafe { PageTable::slot(table, pt_index(vaddr.raw(), level)) };
    }

    // The address resolved all the way down without passing through `target`.
    Err(LookupFault::MissingCapability { bits_left: level_page_bits(PT_LEVELS) })
}
