// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Paging capability values and the slot table they live in.
//!
//! Capabilities are plain values with pure constructors: decoding an
//! invocation computes the next capability state without touching the slot,
//! and the perform phase writes it back in one step. Mapping metadata uses
//! `Option` for the unmapped sentinel so stale ASIDs cannot leak through.

extern crate alloc;

use alloc::vec::Vec;
use bitflags::bitflags;

use crate::types::{Asid, PhysAddr, VirtAddr};
use crate::vm::pte::{PageSize, VmRights};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Access mask supplied with a map or remap invocation.
    pub struct CapRights: usize {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
    }
}

impl CapRights {
    /// Decodes a raw rights word, ignoring unknown bits.
    #[inline]
    pub fn from_word(word: usize) -> Self {
        Self::from_bits_truncate(word)
    }
}

/// Where a frame capability is currently installed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameMapping {
    pub asid: Asid,
    pub vaddr: VirtAddr,
}

/// Capability to a physical frame, with cached mapping metadata.
///
/// When `mapping` is set, the hardware leaf at that ASID's root and address
/// points at this frame; map/unmap keep the two in lockstep.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FrameCap {
    base: PhysAddr,
    size: PageSize,
    rights: VmRights,
    device: bool,
    mapping: Option<FrameMapping>,
}

impl FrameCap {
    pub fn new_unmapped(base: PhysAddr, size: PageSize, rights: VmRights, device: bool) -> Self {
        Self { base, size, rights, device, mapping: None }
    }

    #[inline]
    pub fn base(&self) -> PhysAddr {
        self.base
    }

    #[inline]
    pub fn size(&self) -> PageSize {
        self.size
    }

    #[inline]
    pub fn rights(&self) -> VmRights {
        self.rights
    }

    #[inline]
    pub fn is_device(&self) -> bool {
        self.device
    }

    #[inline]
    pub fn mapping(&self) -> Option<FrameMapping> {
        self.mapping
    }

    /// New value recording an installed mapping.
    #[must_use]
    pub fn mapped(self, asid: Asid, vaddr: VirtAddr) -> Self {
        Self { mapping: Some(FrameMapping { asid, vaddr }), ..self }
    }

    /// New value with the mapping metadata cleared.
    #[must_use]
    pub fn unmapped(self) -> Self {
        Self { mapping: None, ..self }
    }
}

/// Where a page-table capability is currently installed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PtMapping {
    pub asid: Asid,
    pub vaddr: VirtAddr,
}

/// Capability to one page-table node.
///
/// The node is "mapped" exactly when installed below a bound root, or when
/// it is itself the root the directory binds for its ASID.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageTableCap {
    base: PhysAddr,
    mapping: Option<PtMapping>,
}

impl PageTableCap {
    pub fn new_unmapped(base: PhysAddr) -> Self {
        Self { base, mapping: None }
    }

    #[inline]
    pub fn base(&self) -> PhysAddr {
        self.base
    }

    #[inline]
    pub fn mapping(&self) -> Option<PtMapping> {
        self.mapping
    }

    #[inline]
    pub fn is_mapped(&self) -> bool {
        self.mapping.is_some()
    }

    #[must_use]
    pub fn mapped(self, asid: Asid, vaddr: VirtAddr) -> Self {
        Self { mapping: Some(PtMapping { asid, vaddr }), ..self }
    }

    #[must_use]
    pub fn unmapped(self) -> Self {
        Self { mapping: None, ..self }
    }
}

/// Capability to one ASID pool.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AsidPoolCap {
    base: Asid,
    pool: PhysAddr,
}

impl AsidPoolCap {
    pub fn new(base: Asid, pool: PhysAddr) -> Self {
        Self { base, pool }
    }

    /// First ASID covered by this pool.
    #[inline]
    pub fn base(&self) -> Asid {
        self.base
    }

    #[inline]
    pub fn pool(&self) -> PhysAddr {
        self.pool
    }
}

/// Capability to a span of untyped memory.
///
/// `used` tracks whether anything was ever carved out of the span; pool
/// creation requires previously untouched memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UntypedCap {
    base: PhysAddr,
    size_bits: usize,
    device: bool,
    used: bool,
}

impl UntypedCap {
    pub fn new(base: PhysAddr, size_bits: usize, device: bool) -> Self {
        Self { base, size_bits, device, used: false }
    }

    #[inline]
    pub fn base(&self) -> PhysAddr {
        self.base
    }

    #[inline]
    pub fn size_bits(&self) -> usize {
        self.size_bits
    }

    #[inline]
    pub fn is_device(&self) -> bool {
        self.device
    }

    /// True when the span has outstanding derived objects.
    #[inline]
    pub fn has_children(&self) -> bool {
        self.used
    }

    /// New value with the whole span accounted as consumed.
    #[must_use]
    pub fn exhausted(self) -> Self {
        Self { used: true, ..self }
    }
}

/// Capability handle types the paging core dispatches on.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Capability {
    /// Untyped memory, the source for retyping into pools.
    Untyped(UntypedCap),
    /// Physical frame.
    Frame(FrameCap),
    /// Page-table node (an address-space root is one of these, bound via the
    /// ASID directory).
    PageTable(PageTableCap),
    /// Authority to create ASID pools.
    AsidControl,
    /// One ASID pool.
    AsidPool(AsidPoolCap),
}

/// Errors produced when manipulating the capability table.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CapError {
    /// Provided slot is out of range or empty when a capability was needed.
    InvalidSlot,
    /// Destination slot already holds a capability.
    Occupied,
}

/// Per-client capability table.
///
/// Stands in for the surrounding capability system's slot storage; the
/// invocation layer only ever reads slots during decode and writes them
/// during perform.
#[derive(Default, Clone)]
pub struct CapTable {
    slots: Vec<Option<Capability>>,
}

impl CapTable {
    /// Creates an empty table sized for `slots` entries.
    pub fn with_capacity(slots: usize) -> Self {
        let mut table: Vec<Option<Capability>> = Vec::with_capacity(slots);
        for _ in 0..slots {
            table.push(None);
        }
        Self { slots: table }
    }

    /// Convenience constructor sized for the bootstrap client.
    pub fn new() -> Self {
        Self::with_capacity(64)
    }

    /// Inserts or overwrites a slot.
    pub fn set(&mut self, slot: usize, cap: Capability) -> Result<(), CapError> {
        let entry = self.slots.get_mut(slot).ok_or(CapError::InvalidSlot)?;
        *entry = Some(cap);
        Ok(())
    }

    /// Returns a capability without consuming it.
    pub fn get(&self, slot: usize) -> Result<Capability, CapError> {
        self.slots.get(slot).and_then(|entry| *entry).ok_or(CapError::InvalidSlot)
    }

    /// Removes and returns the capability stored in `slot`.
    pub fn take(&mut self, slot: usize) -> Result<Capability, CapError> {
        let entry = self.slots.get_mut(slot).ok_or(CapError::InvalidSlot)?;
        entry.take().ok_or(CapError::InvalidSlot)
    }

    /// Checks that `slot` exists and is empty, for use as a destination.
    pub fn ensure_empty(&self, slot: usize) -> Result<(), CapError> {
        match self.slots.get(slot) {
            None => Err(CapError::InvalidSlot),
            Some(Some(_)) => Err(CapError::Occupied),
            Some(None) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests_prop;
