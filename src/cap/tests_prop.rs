// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! Property-based tests for capability values and rights narrowing.

use proptest::prelude::*;

use super::{CapError, CapRights, CapTable, Capability, FrameCap, PageTableCap};
use crate::types::{Asid, PhysAddr, VirtAddr};
use crate::vm::pte::{PageSize, VmRights};

fn arb_vm_rights() -> impl Strategy<Value = VmRights> {
    prop_oneof![
        Just(VmRights::NoAccess),
        Just(VmRights::KernelOnly),
        Just(VmRights::ReadOnly),
        Just(VmRights::ReadWrite),
        Just(VmRights::WriteOnly),
    ]
}

fn arb_cap_rights() -> impl Strategy<Value = CapRights> {
    (0usize..4).prop_map(CapRights::from_word)
}

fn arb_frame_cap() -> impl Strategy<Value = FrameCap> {
    (any::<usize>(), arb_vm_rights(), any::<bool>()).prop_map(|(base, rights, device)| {
        FrameCap::new_unmapped(
            PhysAddr::new((base & 0xff_ffff) << 12),
            PageSize::Page4K,
            rights,
            device,
        )
    })
}

proptest! {
    /// Narrowing by any mask never grants an access the original withheld.
    #[test]
    fn mask_never_escalates(rights in arb_vm_rights(), mask in arb_cap_rights()) {
        let masked = rights.mask(mask);
        prop_assert!(!masked.grants_read() || rights.grants_read());
        prop_assert!(!masked.grants_write() || rights.grants_write());
        prop_assert!(!masked.grants_user() || rights.grants_user());
    }

    /// A full mask leaves the rights unchanged.
    #[test]
    fn full_mask_is_identity(rights in arb_vm_rights()) {
        prop_assert_eq!(rights.mask(CapRights::READ | CapRights::WRITE), rights);
    }

    /// Map and unmap walk the frame state machine without disturbing the
    /// payload fields.
    #[test]
    fn frame_mapping_roundtrip(cap in arb_frame_cap(), asid in 1u16..512, vaddr in 0usize..0x40_0000) {
        let asid = Asid::from_raw(asid);
        let vaddr = VirtAddr::new(vaddr << 12);

        let mapped = cap.mapped(asid, vaddr);
        let mapping = mapped.mapping().unwrap();
        prop_assert_eq!(mapping.asid, asid);
        prop_assert_eq!(mapping.vaddr, vaddr);
        prop_assert_eq!(mapped.base(), cap.base());
        prop_assert_eq!(mapped.rights(), cap.rights());
        prop_assert_eq!(mapped.is_device(), cap.is_device());

        prop_assert_eq!(mapped.unmapped(), cap);
    }

    /// Slot set/get roundtrips, and a populated slot is not empty.
    #[test]
    fn table_set_and_get_roundtrip(slot in 0usize..64, cap in arb_frame_cap()) {
        let mut table = CapTable::new();
        table.set(slot, Capability::Frame(cap)).unwrap();
        prop_assert_eq!(table.get(slot).unwrap(), Capability::Frame(cap));
        prop_assert_eq!(table.ensure_empty(slot), Err(CapError::Occupied));
    }
}

#[test]
fn table_rejects_out_of_range_slots() {
    let mut table = CapTable::with_capacity(4);
    let cap = Capability::PageTable(PageTableCap::new_unmapped(PhysAddr::new(0x8000_1000)));
    assert_eq!(table.set(4, cap), Err(CapError::InvalidSlot));
    assert_eq!(table.get(9), Err(CapError::InvalidSlot));
    assert_eq!(table.ensure_empty(9), Err(CapError::InvalidSlot));
}

#[test]
fn take_empties_the_slot() {
    let mut table = CapTable::with_capacity(4);
    let cap = Capability::PageTable(PageTableCap::new_unmapped(PhysAddr::new(0x8000_1000)));
    table.set(2, cap).unwrap();
    assert_eq!(table.take(2), Ok(cap));
    assert_eq!(table.get(2), Err(CapError::InvalidSlot));
    assert!(table.ensure_empty(2).is_ok());
}
