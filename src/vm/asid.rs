// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Two-level ASID directory: directory slots resolve to pools, pool slots
//! resolve to bound address-space roots.

use core::ptr::NonNull;

use static_assertions::const_assert_eq;

use crate::types::{Asid, PhysAddr};
use crate::vm::pte::PageTable;
use crate::vm::walk::LookupFault;
use crate::vm::{level_page_bits, ASID_HIGH_BITS, ASID_LOW_BITS, PAGE_SIZE};

/// Number of pools the directory can hold.
pub const ASID_POOL_COUNT: usize = 1 << ASID_HIGH_BITS;
/// Number of root slots per pool.
pub const ASID_POOL_SLOTS: usize = 1 << ASID_LOW_BITS;
/// A pool is carved from exactly one page of untyped memory.
pub const ASID_POOL_BITS: usize = 12;

/// One ASID pool: a page-sized array of optional root pointers.
///
/// Pools live in retyped untyped memory; the all-zero state of freshly
/// zeroed backing is the all-empty pool.
#[repr(C, align(4096))]
pub struct AsidPool {
    roots: [Option<NonNull<PageTable>>; ASID_POOL_SLOTS],
}

const_assert_eq!(core::mem::size_of::<AsidPool>(), PAGE_SIZE);
const_assert_eq!(1 << ASID_POOL_BITS, PAGE_SIZE);

impl AsidPool {
    #[inline]
    pub fn root_at(&self, offset: usize) -> Option<NonNull<PageTable>> {
        self.roots[offset]
    }

    #[inline]
    pub fn set_root(&mut self, offset: usize, root: Option<NonNull<PageTable>>) {
        self.roots[offset] = root;
    }

    /// First free slot whose resulting ASID would be non-zero.
    ///
    /// ASID 0 is not a valid user ASID, so the slot that would produce it is
    /// treated as reserved.
    pub fn first_free_offset(&self, base: Asid) -> Option<usize> {
        (0..ASID_POOL_SLOTS)
            .find(|&i| base.as_raw() as usize + i != 0 && self.roots[i].is_none())
    }
}

/// Top level of the ASID table, indexed by the pool bits of an ASID.
pub struct AsidDirectory {
    pools: [Option<NonNull<AsidPool>>; ASID_POOL_COUNT],
}

impl AsidDirectory {
    pub const fn new() -> Self {
        Self { pools: [None; ASID_POOL_COUNT] }
    }

    #[inline]
    pub fn pool_at(&self, index: usize) -> Option<NonNull<AsidPool>> {
        self.pools[index]
    }

    /// Index of the first directory slot without a pool.
    pub fn first_free_pool(&self) -> Option<usize> {
        (0..ASID_POOL_COUNT).find(|&i| self.pools[i].is_none())
    }

    pub fn install_pool(&mut self, index: usize, pool: NonNull<AsidPool>) {
        debug_assert!(self.pools[index].is_none());
        self.pools[index] = Some(pool);
    }

    /// Clears the directory slot holding `pool`, if it still does.
    pub fn remove_pool(&mut self, base: Asid, pool: NonNull<AsidPool>) -> bool {
        let index = base.pool_index();
        if self.pools[index] == Some(pool) {
            self.pools[index] = None;
            return true;
        }
        false
    }

    /// Resolves `asid` to its bound root.
    ///
    /// An empty directory slot faults as an invalid root; a present pool with
    /// an empty slot faults as a missing capability tagged with the top-level
    /// page-size class, so the two cases stay distinguishable.
    pub fn find_root(&self, asid: Asid) -> Result<PhysAddr, LookupFault> {
        let pool = self.pools[asid.pool_index()].ok_or(LookupFault::InvalidRoot)?;
        // SAFETY: directory entries only ever point at live pools installed
        // by the ASID-control invocation.
        let root = unsafe { pool.as_ref() }.root_at(asid.pool_offset()).ok_or(
            LookupFault::MissingCapability { bits_left: level_page_bits(1) },
        )?;
        Ok(PhysAddr::from_ptr(root.as_ptr()))
    }

    /// True iff `base` is exactly the root the directory binds to `asid`.
    ///
    /// Rejects stale or forged root capabilities before anything is mutated
    /// through them.
    pub fn is_root_of(&self, base: PhysAddr, asid: Asid) -> bool {
        matches!(self.find_root(asid), Ok(root) if root == base)
    }

    /// Binds `root` to `asid`. The pool for `asid` must be present.
    pub fn bind_root(&mut self, asid: Asid, root: NonNull<PageTable>) {
        let pool = self.pools[asid.pool_index()];
        debug_assert!(pool.is_some());
        if let Some(mut pool) = pool {
            // SAFETY: as in find_root; binding is serialized by the caller.
            unsafe { pool.as_mut() }.set_root(asid.pool_offset(), Some(root));
        }
    }

    /// Clears the binding for `asid` if it still refers to `root`.
    pub fn unbind_root(&mut self, asid: Asid, root: PhysAddr) -> bool {
        if let Some(mut pool) = self.pools[asid.pool_index()] {
            // SAFETY: as in find_root.
            let pool = unsafe { pool.as_mut() };
            let offset = asid.pool_offset();
            if pool.root_at(offset).map(|r| PhysAddr::from_ptr(r.as_ptr())) == Some(root) {
                pool.set_root(offset, None);
                return true;
            }
        }
        false
    }
}

impl Default for AsidDirectory {
    fn default() -> Self {
        Self::new()
    }
}
