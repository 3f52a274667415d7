// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! Unit tests for the PTE codec, the walkers, the ASID directory and the
//! mapping primitives.

use core::ptr::NonNull;

use super::asid::{AsidDirectory, AsidPool, ASID_POOL_BITS};
use super::fault::{
    vm_fault_from_cause, VmFaultKind, CAUSE_INSTRUCTION_PAGE_FAULT, CAUSE_LOAD_ACCESS_FAULT,
    CAUSE_LOAD_PAGE_FAULT, CAUSE_STORE_PAGE_FAULT,
};
use super::map::{
    clear_page_table, create_safe_mapping_entries, make_user_leaf, unmap_frame, unmap_page_table,
};
use super::pte::{PageSize, PageTable, Pte, PteFlags, VmAttributes, VmRights};
use super::walk::{lookup_parent_slot, lookup_slot, lookup_slot_bounded, LookupFault};
use super::{
    level_page_bits, pt_index, KernelMapError, VspaceContext, KERNEL_BASE, PAGE_BITS, PT_ENTRIES,
    PT_LEVELS,
};
use crate::mem;
use crate::types::{Asid, PhysAddr, VirtAddr};

fn new_table() -> PhysAddr {
    mem::alloc_region(PAGE_BITS).expect("table region")
}

fn slot(table: PhysAddr, vaddr: usize, level: usize) -> super::pte::PtSlot {
    unsafe { PageTable::slot(table, pt_index(vaddr, level)) }
}

/// Links a full chain of intermediate tables for `vaddr` below `root` and
/// returns the tables, root first.
fn link_chain(root: PhysAddr, vaddr: usize) -> [PhysAddr; PT_LEVELS] {
    let mut tables = [root; PT_LEVELS];
    let mut parent = root;
    for level in 1..PT_LEVELS {
        let child = new_table();
        slot(parent, vaddr, level).write(Pte::next_table(child));
        tables[level] = child;
        parent = child;
    }
    tables
}

fn new_pool() -> NonNull<AsidPool> {
    let base = mem::alloc_region(ASID_POOL_BITS).expect("pool region");
    NonNull::new(base.as_mut_ptr::<AsidPool>()).unwrap()
}

/// Directory with `asid` bound to a fresh root; returns directory and root.
fn bound_directory(asid: Asid) -> (AsidDirectory, PhysAddr) {
    let mut dir = AsidDirectory::new();
    dir.install_pool(asid.pool_index(), new_pool());
    let root = new_table();
    dir.bind_root(asid, NonNull::new(root.as_mut_ptr::<PageTable>()).unwrap());
    (dir, root)
}

#[test]
fn leaf_entry_encodes_rights() {
    let base = PhysAddr::new(0x8020_0000);

    let ro = make_user_leaf(base, false, VmRights::ReadOnly);
    assert!(ro.flags().contains(PteFlags::VALID | PteFlags::READ | PteFlags::USER));
    assert!(!ro.flags().intersects(PteFlags::WRITE | PteFlags::EXECUTE | PteFlags::GLOBAL));

    let rw = make_user_leaf(base, false, VmRights::ReadWrite);
    assert!(rw.flags().contains(PteFlags::READ | PteFlags::WRITE));

    let wo = make_user_leaf(base, false, VmRights::WriteOnly);
    assert!(wo.flags().contains(PteFlags::WRITE));
    assert!(!wo.flags().contains(PteFlags::READ));

    let kernel = make_user_leaf(base, true, VmRights::KernelOnly);
    assert!(!kernel.flags().contains(PteFlags::USER));
    assert!(kernel.flags().contains(PteFlags::EXECUTE));

    let none = make_user_leaf(base, false, VmRights::NoAccess);
    assert!(!none.flags().intersects(PteFlags::READ | PteFlags::WRITE));

    assert_eq!(ro.phys_addr(), base);
}

#[test]
fn pointer_entry_is_table_not_leaf() {
    let table = new_table();
    let pte = Pte::next_table(table);
    assert!(pte.is_valid() && pte.is_table() && !pte.is_leaf());
    assert_eq!(pte.phys_addr(), table);

    assert!(!Pte::INVALID.is_valid());
    assert!(!Pte::INVALID.is_table());

    let leaf = make_user_leaf(table, false, VmRights::ReadWrite);
    assert!(leaf.is_leaf() && !leaf.is_table());
}

#[test]
fn walk_rejects_null_root() {
    assert_eq!(
        lookup_slot(PhysAddr::NULL, VirtAddr::new(0x1000), PT_LEVELS).unwrap_err(),
        LookupFault::InvalidRoot
    );
    assert_eq!(
        lookup_parent_slot(PhysAddr::NULL, VirtAddr::new(0x1000), new_table()).unwrap_err(),
        LookupFault::InvalidRoot
    );
}

#[test]
fn walk_reports_missing_top_level() {
    let root = new_table();
    let walk = lookup_slot(root, VirtAddr::new(0x1000), PT_LEVELS).unwrap();
    assert_eq!(walk.level, 1);
    assert_eq!(walk.fault, Some(LookupFault::MissingCapability { bits_left: level_page_bits(1) }));
    assert!(walk.slot_checked().is_err());
}

#[test]
fn walk_descends_linked_tables() {
    let vaddr = 0x40_3000usize;
    let root = new_table();
    let tables = link_chain(root, vaddr);

    let walk = lookup_slot(root, VirtAddr::new(vaddr), PT_LEVELS).unwrap();
    assert_eq!(walk.level, PT_LEVELS);
    assert!(walk.fault.is_none());
    assert_eq!(walk.slot.addr(), slot(tables[PT_LEVELS - 1], vaddr, PT_LEVELS).addr());

    let partial = lookup_slot(root, VirtAddr::new(vaddr), 2).unwrap();
    assert_eq!(partial.level, 2);
    assert_eq!(partial.slot.addr(), slot(tables[1], vaddr, 2).addr());
}

#[test]
fn walk_stops_at_intermediate_leaf() {
    let vaddr = 0x20_0000usize;
    let root = new_table();
    let l2 = new_table();
    slot(root, vaddr, 1).write(Pte::next_table(l2));
    slot(l2, vaddr, 2).write(make_user_leaf(PhysAddr::new(0x8020_0000), false, VmRights::ReadWrite));

    let walk = lookup_slot(root, VirtAddr::new(vaddr), PT_LEVELS).unwrap();
    assert_eq!(walk.level, 2);
    assert_eq!(walk.fault, Some(LookupFault::MissingCapability { bits_left: level_page_bits(2) }));
    assert!(walk.slot.read().is_leaf());
}

#[test]
fn bounded_walk_accounts_untranslated_bits() {
    let vaddr = 0x40_0000usize;
    let root = new_table();
    link_chain(root, vaddr);

    let span = lookup_slot_bounded(root, VirtAddr::new(vaddr), 1);
    assert_eq!(span.bits_left, level_page_bits(1));

    let full = lookup_slot_bounded(root, VirtAddr::new(vaddr), PT_LEVELS);
    assert_eq!(full.bits_left, PAGE_BITS);
}

#[test]
fn parent_slot_recovery() {
    let vaddr = 0x7f_c000usize;
    let root = new_table();
    let tables = link_chain(root, vaddr);

    for level in 1..PT_LEVELS {
        let parent = lookup_parent_slot(root, VirtAddr::new(vaddr), tables[level]).unwrap();
        assert_eq!(parent.addr(), slot(tables[level - 1], vaddr, level).addr());
    }

    let stranger = new_table();
    assert!(lookup_parent_slot(root, VirtAddr::new(vaddr), stranger).is_err());
}

#[test]
fn map_then_unmap_is_restorative() {
    let asid = Asid::from_raw(7);
    let vaddr = VirtAddr::new(0x1000);
    let frame = PhysAddr::new(0x8040_0000);
    let (dir, root) = bound_directory(asid);
    link_chain(root, vaddr.raw());

    let leaf = lookup_slot(root, vaddr, PT_LEVELS).unwrap().slot_checked().unwrap();
    let before = leaf.read().bits();

    let entries = create_safe_mapping_entries(
        frame,
        vaddr,
        PageSize::Page4K,
        VmRights::ReadWrite,
        VmAttributes::default(),
        root,
    )
    .unwrap();
    entries.slot.write(entries.pte);
    assert!(leaf.read().is_leaf());

    unmap_frame(&dir, PageSize::Page4K, asid, vaddr, frame);
    assert_eq!(leaf.read().bits(), before);
}

#[test]
fn safe_entries_are_pure() {
    let vaddr = VirtAddr::new(0x9000);
    let frame = PhysAddr::new(0x8060_0000);
    let root = new_table();
    let tables = link_chain(root, vaddr.raw());

    let leaf_before = slot(tables[PT_LEVELS - 1], vaddr.raw(), PT_LEVELS).read();
    let root_before = slot(root, vaddr.raw(), 1).read();

    let first = create_safe_mapping_entries(
        frame,
        vaddr,
        PageSize::Page4K,
        VmRights::ReadOnly,
        VmAttributes::default(),
        root,
    )
    .unwrap();
    let second = create_safe_mapping_entries(
        frame,
        vaddr,
        PageSize::Page4K,
        VmRights::ReadOnly,
        VmAttributes::default(),
        root,
    )
    .unwrap();

    assert_eq!(first.pte, second.pte);
    assert_eq!(first.slot.addr(), second.slot.addr());
    assert_eq!(slot(tables[PT_LEVELS - 1], vaddr.raw(), PT_LEVELS).read(), leaf_before);
    assert_eq!(slot(root, vaddr.raw(), 1).read(), root_before);
}

#[test]
fn unmap_frame_ignores_mismatched_leaf() {
    let asid = Asid::from_raw(3);
    let vaddr = VirtAddr::new(0x4000);
    let (dir, root) = bound_directory(asid);
    link_chain(root, vaddr.raw());

    let mapped = PhysAddr::new(0x8080_0000);
    let entries = create_safe_mapping_entries(
        mapped,
        vaddr,
        PageSize::Page4K,
        VmRights::ReadWrite,
        VmAttributes::default(),
        root,
    )
    .unwrap();
    entries.slot.write(entries.pte);

    unmap_frame(&dir, PageSize::Page4K, asid, vaddr, PhysAddr::new(0x8090_0000));
    assert_eq!(entries.slot.read(), entries.pte);

    // Unknown ASID: nothing to do, nothing touched.
    unmap_frame(&dir, PageSize::Page4K, Asid::from_raw(9), vaddr, mapped);
    assert_eq!(entries.slot.read(), entries.pte);
}

#[test]
fn unmap_page_table_clears_parent_entry() {
    let asid = Asid::from_raw(5);
    let vaddr = VirtAddr::new(0x80_0000);
    let (dir, root) = bound_directory(asid);
    let tables = link_chain(root, vaddr.raw());
    let victim = tables[PT_LEVELS - 1];

    let parent = lookup_parent_slot(root, vaddr, victim).unwrap();
    assert!(parent.read().is_table());

    unmap_page_table(&dir, asid, vaddr, victim);
    assert_eq!(parent.read(), Pte::INVALID);

    // Torn-down address space: unmap is a no-op, not an error.
    unmap_page_table(&dir, Asid::from_raw(200), vaddr, victim);
}

#[test]
fn clear_page_table_zeroes_node() {
    let table = new_table();
    slot(table, 0, PT_LEVELS).write(Pte::next_table(new_table()));
    clear_page_table(table);
    for index in 0..PT_ENTRIES {
        assert_eq!(unsafe { PageTable::slot(table, index) }.read(), Pte::INVALID);
    }
}

#[test]
fn find_root_distinguishes_missing_levels() {
    let mut dir = AsidDirectory::new();
    let asid = Asid::from_raw(0x203);

    assert_eq!(dir.find_root(asid), Err(LookupFault::InvalidRoot));

    dir.install_pool(asid.pool_index(), new_pool());
    assert_eq!(
        dir.find_root(asid),
        Err(LookupFault::MissingCapability { bits_left: level_page_bits(1) })
    );

    let root = new_table();
    dir.bind_root(asid, NonNull::new(root.as_mut_ptr()).unwrap());
    assert_eq!(dir.find_root(asid), Ok(root));
    assert!(dir.is_root_of(root, asid));
    assert!(!dir.is_root_of(new_table(), asid));
}

#[test]
fn unbind_root_checks_identity() {
    let asid = Asid::from_raw(11);
    let (mut dir, root) = bound_directory(asid);

    assert!(!dir.unbind_root(asid, PhysAddr::new(0xdead_f000)));
    assert_eq!(dir.find_root(asid), Ok(root));

    assert!(dir.unbind_root(asid, root));
    assert!(dir.find_root(asid).is_err());
}

#[test]
fn delete_asid_flushes_only_matching_binding() {
    let asid = Asid::from_raw(13);
    let kernel_root = new_table();
    let mut ctx = VspaceContext::new(kernel_root);
    let pool = new_pool();
    ctx.asid_table_mut().install_pool(asid.pool_index(), pool);
    let root = ctx.create_address_space_root().unwrap();
    ctx.asid_table_mut()
        .bind_root(asid, NonNull::new(root.as_mut_ptr::<PageTable>()).unwrap());

    // A stale root reference leaves the binding alone.
    ctx.delete_asid(asid, new_table());
    assert_eq!(ctx.find_root(asid), Ok(root));

    ctx.delete_asid(asid, root);
    assert!(ctx.find_root(asid).is_err());

    ctx.delete_asid_pool(Asid::from_parts(asid.pool_index(), 0), pool);
    assert_eq!(ctx.find_root(asid), Err(LookupFault::InvalidRoot));
}

#[test]
fn pool_never_yields_asid_zero() {
    let pool = new_pool();
    let base = Asid::from_raw(0);
    // SAFETY: freshly allocated zeroed pool.
    let pool_ref = unsafe { pool.as_ref() };
    assert_eq!(pool_ref.first_free_offset(base), Some(1));

    let nonzero_base = Asid::from_parts(1, 0);
    assert_eq!(pool_ref.first_free_offset(nonzero_base), Some(0));
}

#[test]
fn copy_global_mappings_seeds_upper_half() {
    let ctx = VspaceContext::new(new_table());
    let kernel_slot = ctx.kernel_root_slot(pt_index(KERNEL_BASE, 1));
    kernel_slot.write(Pte::next_table(new_table()));

    let root = ctx.create_address_space_root().unwrap();
    for index in pt_index(KERNEL_BASE, 1)..PT_ENTRIES {
        assert_eq!(
            unsafe { PageTable::slot(root, index) }.read(),
            ctx.kernel_root_slot(index).read()
        );
    }
    for index in 0..pt_index(KERNEL_BASE, 1) {
        assert_eq!(unsafe { PageTable::slot(root, index) }.read(), Pte::INVALID);
    }
}

#[test]
fn kernel_window_uses_global_level1_leaves() {
    let mut ctx = VspaceContext::new(new_table());
    let window = 2 << level_page_bits(1);
    ctx.map_kernel_window(VirtAddr::new(KERNEL_BASE), PhysAddr::new(0x8000_0000), window);

    for i in 0..2 {
        let pte = ctx.kernel_root_slot(pt_index(KERNEL_BASE, 1) + i).read();
        assert!(pte.is_leaf());
        assert!(pte.flags().contains(PteFlags::GLOBAL));
        assert!(!pte.flags().contains(PteFlags::USER));
        assert_eq!(pte.phys_addr(), PhysAddr::new(0x8000_0000 + (i << level_page_bits(1))));
    }
    assert_eq!(ctx.kernel_root_slot(pt_index(KERNEL_BASE, 1) + 2).read(), Pte::INVALID);
}

#[test]
fn map_kernel_frame_allocates_chain_and_rejects_overlap() {
    let mut ctx = VspaceContext::new(new_table());
    let vaddr = VirtAddr::new(KERNEL_BASE + 0x1_5000);
    let paddr = PhysAddr::new(0x1000_0000);

    ctx.map_kernel_frame(paddr, vaddr, false).unwrap();

    let walk = lookup_slot(ctx.kernel_root(), vaddr, PT_LEVELS).unwrap();
    assert!(walk.fault.is_none());
    let pte = walk.slot.read();
    assert!(pte.is_leaf());
    assert_eq!(pte.phys_addr(), paddr);
    assert!(pte.flags().contains(PteFlags::GLOBAL));
    assert!(!pte.flags().contains(PteFlags::USER));

    assert_eq!(ctx.map_kernel_frame(paddr, vaddr, false), Err(KernelMapError::Overlap));
}

#[test]
fn vm_fault_translation() {
    let load = vm_fault_from_cause(CAUSE_LOAD_PAGE_FAULT, 0x1234).unwrap();
    assert_eq!(load.kind, VmFaultKind::LoadAccess);
    assert!(!load.instruction);

    let load_access = vm_fault_from_cause(CAUSE_LOAD_ACCESS_FAULT, 0x1234).unwrap();
    assert_eq!(load_access.kind, VmFaultKind::LoadAccess);

    let store = vm_fault_from_cause(CAUSE_STORE_PAGE_FAULT, 0x5678).unwrap();
    assert_eq!(store.kind, VmFaultKind::StoreAccess);
    assert!(!store.instruction);

    let instr = vm_fault_from_cause(CAUSE_INSTRUCTION_PAGE_FAULT, 0x9abc).unwrap();
    assert_eq!(instr.kind, VmFaultKind::InstructionAccess);
    assert!(instr.instruction);
    assert_eq!(instr.addr, 0x9abc);

    // An ecall is not a VM fault.
    assert_eq!(vm_fault_from_cause(8, 0), None);
}
