// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Virtual-address-space management: radix page tables, the ASID directory
//! and the privileged kernel window.
//!
//! All mutable paging state hangs off [`VspaceContext`]; nothing here is a
//! free-floating static, so tests instantiate independent instances.

pub mod asid;
pub mod fault;
pub mod map;
pub mod pte;
pub mod walk;

use core::ptr::NonNull;

use crate::arch::riscv as hw;
use crate::cap::PageTableCap;
use crate::mem;
use crate::types::{Asid, PhysAddr, VirtAddr};
use self::asid::{AsidDirectory, AsidPool};
use self::pte::{PageTable, Pte, PtSlot};
use self::walk::LookupFault;

/// Width of one translated page.
pub const PAGE_BITS: usize = 12;
pub const PAGE_SIZE: usize = 1 << PAGE_BITS;

/// Index bits consumed per table level.
pub const PT_INDEX_BITS: usize = 9;
pub const PT_ENTRIES: usize = 1 << PT_INDEX_BITS;

/// Configured number of radix levels.
#[cfg(feature = "sv48")]
pub const PT_LEVELS: usize = 4;
#[cfg(not(feature = "sv48"))]
pub const PT_LEVELS: usize = 3;

/// Total translated virtual-address width.
pub const VADDR_BITS: usize = PT_LEVELS * PT_INDEX_BITS + PAGE_BITS;

/// First privileged address; user mappings must stay below it.
pub const KERNEL_BASE: usize = 1 << (VADDR_BITS - 1);

/// ASID split: low bits index a pool, high bits index the directory.
pub const ASID_LOW_BITS: usize = 9;
pub const ASID_HIGH_BITS: usize = 7;

/// Width of the region one slot at `level` covers (root slots are level 1).
#[inline]
pub const fn level_page_bits(level: usize) -> usize {
    PAGE_BITS + PT_INDEX_BITS * (PT_LEVELS - level)
}

/// Index of `vaddr` into the table at `level`.
#[inline]
pub const fn pt_index(vaddr: usize, level: usize) -> usize {
    (vaddr >> level_page_bits(level)) & (PT_ENTRIES - 1)
}

/// Errors raised while populating the privileged kernel window.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelMapError {
    /// The region allocator could not provide an intermediate table.
    OutOfMemory,
    /// The target slot already holds a mapping.
    Overlap,
}

/// Kernel-held paging state: the ASID directory plus the global root whose
/// upper half seeds every new address space.
pub struct VspaceContext {
    asid_table: AsidDirectory,
    kernel_root: PhysAddr,
}

impl VspaceContext {
    /// Wraps a zero-initialized root table as the global kernel root.
    pub fn new(kernel_root: PhysAddr) -> Self {
        debug_assert!(!kernel_root.is_null() && kernel_root.is_aligned(PAGE_BITS));
        Self { asid_table: AsidDirectory::new(), kernel_root }
    }

    /// Allocates a fresh global root from the region allocator.
    pub fn bootstrap() -> Option<Self> {
        let root = mem::alloc_region(PAGE_BITS)?;
        Some(Self::new(root))
    }

    #[inline]
    pub fn kernel_root(&self) -> PhysAddr {
        self.kernel_root
    }

    #[inline]
    pub fn asid_table(&self) -> &AsidDirectory {
        &self.asid_table
    }

    #[inline]
    pub fn asid_table_mut(&mut self) -> &mut AsidDirectory {
        &mut self.asid_table
    }

    #[inline]
    pub fn find_root(&self, asid: Asid) -> Result<PhysAddr, LookupFault> {
        self.asid_table.find_root(asid)
    }

    /// Maps the privileged window with level-1 global superpage leaves.
    ///
    /// `vbase` and `pbase` must be aligned to the level-1 page size; the
    /// window length is rounded up to whole level-1 pages.
    pub fn map_kernel_window(&mut self, vbase: VirtAddr, pbase: PhysAddr, len: usize) {
        let lvl1_bits = level_page_bits(1);
        debug_assert!(vbase.raw() >= KERNEL_BASE);
        debug_assert!(vbase.is_aligned(lvl1_bits) && pbase.is_aligned(lvl1_bits));

        let entries = (len + (1 << lvl1_bits) - 1) >> lvl1_bits;
        for i in 0..entries {
            let pa = PhysAddr::new(pbase.raw() + (i << lvl1_bits));
            // SAFETY: kernel_root is a live node owned by this context.
            let slot = unsafe {
                PageTable::slot(self.kernel_root, pt_index(vbase.raw(), 1) + i)
            };
            slot.write(map::make_kernel_leaf(pa, true));
        }
        hw::sfence_vma();
        hw::fence_i();
        log_info!(target: "vm", "kernel window {} -> {} ({} lvl1 entries)", vbase, pbase, entries);
    }

    /// Maps a single privileged 4 KiB frame, allocating intermediate tables
    /// on demand. Used for device windows above the linear kernel window.
    pub fn map_kernel_frame(
        &mut self,
        paddr: PhysAddr,
        vaddr: VirtAddr,
        executable: bool,
    ) -> Result<(), KernelMapError> {
        debug_assert!(vaddr.raw() >= KERNEL_BASE);
        let mut table = self.kernel_root;
        for level in 1..PT_LEVELS {
            // SAFETY: `table` is the live kernel root or a node linked below it.
            let slot = unsafe { PageTable::slot(table, pt_index(vaddr.raw(), level)) };
            let pte = slot.read();
            table = if pte.is_table() {
                pte.phys_addr()
            } else if pte.is_valid() {
                return Err(KernelMapError::Overlap);
            } else {
                let next = mem::alloc_region(PAGE_BITS).ok_or(KernelMapError::OutOfMemory)?;
                slot.write(Pte::next_table(next));
                next
            };
        }
        // SAFETY: the loop above just linked the full parent chain.
        let leaf = unsafe { PageTable::slot(table, pt_index(vaddr.raw(), PT_LEVELS)) };
        if leaf.read().is_valid() {
            return Err(KernelMapError::Overlap);
        }
        leaf.write(map::make_kernel_leaf(paddr, executable));
        hw::sfence_vma();
        Ok(())
    }

    /// Copies the privileged upper half of the kernel root into `new_root`.
    pub fn copy_global_mappings(&self, new_root: PhysAddr) {
        for index in pt_index(KERNEL_BASE, 1)..PT_ENTRIES {
            // SAFETY: both nodes are live and page-sized; indices are in range.
            let src = unsafe { PageTable::slot(self.kernel_root, index) };
            let dst = unsafe { PageTable::slot(new_root, index) };
            dst.write(src.read());
        }
    }

    /// Allocates and seeds a fresh address-space root: zeroed, with the
    /// global kernel mappings copied in. Binding to an ASID happens later.
    pub fn create_address_space_root(&self) -> Option<PhysAddr> {
        let root = mem::alloc_region(PAGE_BITS)?;
        self.copy_global_mappings(root);
        Some(root)
    }

    /// Installs the translation root for the thread's address space.
    ///
    /// A missing capability, or one whose recorded root is stale with respect
    /// to the directory, falls back to the bare kernel root with ASID 0.
    pub fn set_vm_root(&self, root_cap: Option<&PageTableCap>) {
        let fallback = (self.kernel_root, Asid::from_raw(0));
        let (root, asid) = match root_cap {
            Some(cap) => match cap.mapping() {
                Some(m) if self.asid_table.is_root_of(cap.base(), m.asid) => (cap.base(), m.asid),
                _ => fallback,
            },
            None => fallback,
        };
        hw::set_translation_root(root, asid);
    }

    /// Unbinds `asid` if it is still bound to `root`, flushing its cached
    /// translations before the slot can be reused.
    pub fn delete_asid(&mut self, asid: Asid, root: PhysAddr) {
        if self.asid_table.unbind_root(asid, root) {
            hw::sfence_vma_asid(asid);
            hw::set_translation_root(self.kernel_root, Asid::from_raw(0));
        }
    }

    /// Removes a pool from the directory if the slot still holds it.
    pub fn delete_asid_pool(&mut self, base: Asid, pool: NonNull<AsidPool>) {
        if self.asid_table.remove_pool(base, pool) {
            hw::set_translation_root(self.kernel_root, Asid::from_raw(0));
        }
    }

    /// Raw slot of the kernel root, for boot-time inspection.
    pub fn kernel_root_slot(&self, index: usize) -> PtSlot {
        // SAFETY: kernel_root is a live node owned by this context.
        unsafe { PageTable::slot(self.kernel_root, index) }
    }
}

#[cfg(test)]
mod tests;
