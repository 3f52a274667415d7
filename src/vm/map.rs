// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Mapping operations: leaf-entry construction, safe-entry bundling and the
//! map/unmap primitives shared by the invocation layer and boot code.
//!
//! Every function here either computes without touching hardware state or
//! performs exactly one slot write followed by the translation commit fence;
//! the decode/perform split in the invocation layer relies on that.

use crate::arch::riscv as hw;
use crate::types::{Asid, PhysAddr, VirtAddr};
use crate::vm::asid::AsidDirectory;
use crate::vm::pte::{PageSize, Pte, PteFlags, PtSlot, VmAttributes, VmRights};
use crate::vm::walk::{lookup_parent_slot, lookup_slot, LookupFault};
use crate::vm::PAGE_BITS;
use crate::mem;

/// Builds a user leaf entry from the abstract rights.
///
/// The global bit is never set here; only kernel-window mappings are global.
pub fn make_user_leaf(base: PhysAddr, executable: bool, rights: VmRights) -> Pte {
    let mut flags = PteFlags::VALID | PteFlags::ACCESSED | PteFlags::DIRTY;
    if rights.grants_read() {
        flags |= PteFlags::READ;
    }
    if rights.grants_write() {
        flags |= PteFlags::WRITE;
    }
    if rights.grants_user() {
        flags |= PteFlags::USER;
    }
    if executable {
        flags |= PteFlags::EXECUTE;
    }
    Pte::new(base, flags)
}

/// Leaf entry for the privileged window: global, never user-accessible.
pub fn make_kernel_leaf(base: PhysAddr, executable: bool) -> Pte {
    let mut flags = PteFlags::VALID
        | PteFlags::READ
        | PteFlags::WRITE
        | PteFlags::GLOBAL
        | PteFlags::ACCESSED
        | PteFlags::DIRTY;
    if executable {
        flags |= PteFlags::EXECUTE;
    }
    Pte::new(base, flags)
}

/// A computed hardware entry together with the exact slot it must land in.
#[derive(Clone, Copy, Debug)]
pub struct MappingEntries {
    pub pte: Pte,
    pub slot: PtSlot,
}

/// Validates that a frame mapping can be placed and computes the entry.
///
/// Pure with respect to hardware state: the tables are only read. All
/// fallible checks happen here so that writing the result later cannot fail.
pub fn create_safe_mapping_entries(
    base: PhysAddr,
    vaddr: VirtAddr,
    size: PageSize,
    rights: VmRights,
    attrs: VmAttributes,
    root: PhysAddr,
) -> Result<MappingEntries, LookupFault> {
    let pte = make_user_leaf(base, !attrs.execute_never(), rights);
    let slot = lookup_slot(root, vaddr, size.level())?.slot_checked()?;
    Ok(MappingEntries { pte, slot })
}

/// Installs `table` as the next level under `root` for `vaddr`.
///
/// `level` is the level the new table will occupy; the pointer entry goes
/// into the slot one level above. Used on the boot path where the parent
/// chain is known to exist.
pub fn map_page_table(
    root: PhysAddr,
    vaddr: VirtAddr,
    table: PhysAddr,
    level: usize,
) -> Result<(), LookupFault> {
    let slot = lookup_slot(root, vaddr, level - 1)?.slot_checked()?;
    slot.write(Pte::next_table(table));
    hw::sfence_vma();
    Ok(())
}

/// Removes the page table at `table` from the address space bound to `asid`.
///
/// Idempotent with respect to a torn-down address space: when the ASID no
/// longer resolves, or the parent entry is already gone, the table is
/// unreachable and nothing needs doing.
pub fn unmap_page_table(dir: &AsidDirectory, asid: Asid, vaddr: VirtAddr, table: PhysAddr) {
    let root = match dir.find_root(asid) {
        Ok(root) => root,
        Err(_) => return,
    };
    let slot = match lookup_parent_slot(root, vaddr, table) {
        Ok(slot) => slot,
        Err(_) => {
            log_debug!(target: "vm", "unmap_pt: no parent entry for {} at {}", table, vaddr);
            return;
        }
    };
    slot.write(Pte::INVALID);
    hw::sfence_vma();
}

/// Removes the leaf for `frame` at `vaddr` from the address space bound to
/// `asid`.
///
/// A missing address space, an absent slot or a slot that no longer points
/// at `frame` all make this a no-op.
pub fn unmap_frame(dir: &AsidDirectory, size: PageSize, asid: Asid, vaddr: VirtAddr, frame: PhysAddr) {
    let root = match dir.find_root(asid) {
        Ok(root) => root,
        Err(_) => return,
    };
    let slot = match lookup_slot(root, vaddr, size.level()).map(|walk| walk.slot_checked()) {
        Ok(Ok(slot)) => slot,
        _ => return,
    };
    let pte = slot.read();
    if !pte.is_leaf() || pte.phys_addr() != frame {
        return;
    }
    slot.write(Pte::INVALID);
    hw::sfence_vma();
}

/// Zeroes a page-table node that fell out of the tree so a later reinstall
/// starts from an empty table.
pub fn clear_page_table(table: PhysAddr) {
    mem::zero_region(table, PAGE_BITS);
}
