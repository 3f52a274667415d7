// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Address and identifier newtypes shared across the paging core.
//!
//! Newtypes keep virtual addresses, physical addresses and ASIDs from being
//! mixed up at the invocation boundary at zero runtime cost.

use core::fmt;

use crate::vm::{ASID_LOW_BITS, PAGE_BITS};

/// Virtual address as supplied by an invocation or recorded in a capability.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct VirtAddr(usize);

impl VirtAddr {
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    /// True when the address is aligned to a `2^bits` boundary.
    #[inline]
    pub const fn is_aligned(self, bits: usize) -> bool {
        self.0 & ((1 << bits) - 1) == 0
    }

    #[inline]
    pub fn checked_add(self, offset: usize) -> Option<Self> {
        self.0.checked_add(offset).map(Self)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Physical address inside the identity-translated kernel window.
///
/// The kernel window maps physical memory one-to-one, so a `PhysAddr` can be
/// reinterpreted as a kernel pointer without an offset. Zero is the null
/// sentinel and is never a valid table or frame base.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
#[repr(transparent)]
pub struct PhysAddr(usize);

impl PhysAddr {
    pub const NULL: Self = Self(0);

    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn from_ppn(ppn: usize) -> Self {
        Self(ppn << PAGE_BITS)
    }

    #[inline]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn ppn(self) -> usize {
        self.0 >> PAGE_BITS
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn is_aligned(self, bits: usize) -> bool {
        self.0 & ((1 << bits) - 1) == 0
    }

    /// Reinterprets the address as a kernel pointer.
    #[inline]
    pub const fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as *mut T
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Address-space identifier.
///
/// The raw value splits into a pool index (high bits) and an in-pool offset
/// (low bits). ASID 0 never names a user address space; capabilities record
/// "unmapped" as `Option::None` rather than carrying the zero sentinel.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
#[repr(transparent)]
pub struct Asid(u16);

impl Asid {
    #[inline]
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn from_parts(pool: usize, offset: usize) -> Self {
        Self(((pool << ASID_LOW_BITS) | offset) as u16)
    }

    #[inline]
    pub const fn as_raw(self) -> u16 {
        self.0
    }

    /// Index into the ASID directory.
    #[inline]
    pub const fn pool_index(self) -> usize {
        (self.0 as usize) >> ASID_LOW_BITS
    }

    /// Index into the resolved pool.
    #[inline]
    pub const fn pool_offset(self) -> usize {
        (self.0 as usize) & ((1 << ASID_LOW_BITS) - 1)
    }
}

impl fmt::Display for Asid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
