// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Hardware page-table entry codec for the Sv radix formats.
//!
//! The bit layout (PPN at bit 10, permission bits in the low byte) is an
//! architecture contract; everything else in the paging core goes through the
//! constructors and predicates here.

use core::ptr::NonNull;

use bitflags::bitflags;
use static_assertions::const_assert_eq;

use crate::cap::CapRights;
use crate::types::PhysAddr;
use crate::vm::{level_page_bits, PAGE_SIZE, PT_ENTRIES, PT_LEVELS};

/// Bit position of the physical page number inside an entry.
const PTE_PPN_SHIFT: usize = 10;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Flag bits of a hardware page-table entry.
    pub struct PteFlags: usize {
        const VALID = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const EXECUTE = 1 << 3;
        const USER = 1 << 4;
        const GLOBAL = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY = 1 << 7;
        const SW0 = 1 << 8;
        const SW1 = 1 << 9;
    }
}

const LEAF_PERMS: PteFlags = PteFlags::READ.union(PteFlags::WRITE).union(PteFlags::EXECUTE);

/// One hardware translation entry.
///
/// A non-valid entry carries no other meaningful fields. A valid entry is a
/// leaf when any of R/W/X is set, otherwise it points at the next-level
/// table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(transparent)]
pub struct Pte(usize);

const_assert_eq!(core::mem::size_of::<Pte>(), 8);

impl Pte {
    pub const INVALID: Self = Self(0);

    #[inline]
    pub fn new(base: PhysAddr, flags: PteFlags) -> Self {
        Self((base.ppn() << PTE_PPN_SHIFT) | flags.bits())
    }

    /// Pointer entry to the next-level table: valid, no permission bits.
    #[inline]
    pub fn next_table(table: PhysAddr) -> Self {
        Self::new(table, PteFlags::VALID)
    }

    #[inline]
    pub const fn bits(self) -> usize {
        self.0
    }

    #[inline]
    pub fn flags(self) -> PteFlags {
        PteFlags::from_bits_truncate(self.0)
    }

    #[inline]
    pub const fn ppn(self) -> usize {
        self.0 >> PTE_PPN_SHIFT
    }

    /// Base address of the frame or table this entry translates to.
    #[inline]
    pub const fn phys_addr(self) -> PhysAddr {
        PhysAddr::from_ppn(self.ppn())
    }

    #[inline]
    pub fn is_valid(self) -> bool {
        self.flags().contains(PteFlags::VALID)
    }

    #[inline]
    pub fn is_leaf(self) -> bool {
        self.is_valid() && self.flags().intersects(LEAF_PERMS)
    }

    #[inline]
    pub fn is_table(self) -> bool {
        self.is_valid() && !self.flags().intersects(LEAF_PERMS)
    }

    #[inline]
    pub fn with_ppn(self, ppn: usize) -> Self {
        Self((ppn << PTE_PPN_SHIFT) | (self.0 & ((1 << PTE_PPN_SHIFT) - 1)))
    }
}

/// One page-table node: a page-sized array of entries.
#[repr(C, align(4096))]
pub struct PageTable {
    entries: [Pte; PT_ENTRIES],
}

const_assert_eq!(core::mem::size_of::<PageTable>(), PAGE_SIZE);

impl PageTable {
    /// Returns the slot at `index` of the node at `base`.
    ///
    /// # Safety
    ///
    /// `base` must point at a live, page-aligned table node in the kernel
    /// window.
    #[inline]
    pub unsafe fn slot(base: PhysAddr, index: usize) -> PtSlot {
        debug_assert!(!base.is_null() && index < PT_ENTRIES);
        let table = base.as_mut_ptr::<PageTable>();
        PtSlot(NonNull::new_unchecked(core::ptr::addr_of_mut!((*table).entries[index])))
    }
}

/// A reference to one entry inside a live page-table node.
///
/// Reads and writes are volatile: the node is concurrently consumed by the
/// hardware walker.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PtSlot(NonNull<Pte>);

impl PtSlot {
    #[inline]
    pub fn read(self) -> Pte {
        // SAFETY: constructed via PageTable::slot from a live node.
        unsafe { self.0.as_ptr().read_volatile() }
    }

    #[inline]
    pub fn write(self, pte: Pte) {
        // SAFETY: constructed via PageTable::slot from a live node.
        unsafe { self.0.as_ptr().write_volatile(pte) }
    }

    #[inline]
    pub fn addr(self) -> PhysAddr {
        PhysAddr::from_ptr(self.0.as_ptr())
    }
}

/// Abstract access rights attached to a frame capability.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VmRights {
    NoAccess,
    KernelOnly,
    ReadOnly,
    ReadWrite,
    WriteOnly,
}

impl VmRights {
    #[inline]
    pub fn grants_write(self) -> bool {
        !matches!(self, VmRights::NoAccess | VmRights::ReadOnly)
    }

    #[inline]
    pub fn grants_read(self) -> bool {
        !matches!(self, VmRights::NoAccess | VmRights::WriteOnly)
    }

    #[inline]
    pub fn grants_user(self) -> bool {
        self != VmRights::KernelOnly
    }

    /// Narrows these rights by an invocation-supplied mask.
    ///
    /// The result never grants an access the original rights withheld.
    pub fn mask(self, mask: CapRights) -> VmRights {
        match self {
            VmRights::NoAccess => VmRights::NoAccess,
            VmRights::KernelOnly => VmRights::KernelOnly,
            VmRights::ReadOnly if mask.contains(CapRights::READ) => VmRights::ReadOnly,
            VmRights::WriteOnly if mask.contains(CapRights::WRITE) => VmRights::WriteOnly,
            VmRights::ReadWrite if mask.intersects(CapRights::READ | CapRights::WRITE) => {
                if !mask.contains(CapRights::WRITE) {
                    VmRights::ReadOnly
                } else if !mask.contains(CapRights::READ) {
                    VmRights::WriteOnly
                } else {
                    VmRights::ReadWrite
                }
            }
            _ => VmRights::NoAccess,
        }
    }
}

/// Mapping attributes supplied with a frame invocation.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct VmAttributes {
    execute_never: bool,
}

impl VmAttributes {
    pub const fn new(execute_never: bool) -> Self {
        Self { execute_never }
    }

    #[inline]
    pub fn from_word(word: usize) -> Self {
        Self { execute_never: word & 1 != 0 }
    }

    #[inline]
    pub fn execute_never(self) -> bool {
        self.execute_never
    }
}

/// Size classes a frame capability can carry.
///
/// The class determines the table level its leaf entry lives at; classes
/// above the configured level count are not mappable.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PageSize {
    Page4K,
    Mega,
    Giga,
    Tera,
}

impl PageSize {
    const fn index(self) -> usize {
        match self {
            PageSize::Page4K => 0,
            PageSize::Mega => 1,
            PageSize::Giga => 2,
            PageSize::Tera => 3,
        }
    }

    /// The table level whose slots hold leaves of this size.
    #[inline]
    pub const fn level(self) -> usize {
        PT_LEVELS - self.index()
    }

    #[inline]
    pub const fn is_supported(self) -> bool {
        self.index() < PT_LEVELS
    }

    /// Width of the region one leaf of this size covers.
    #[inline]
    pub const fn bits(self) -> usize {
        level_page_bits(self.level())
    }
}
