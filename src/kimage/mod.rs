// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Kernel-image replication: several independent translations of the
//! privileged range, sharing leaf pages for global regions and deep-copying
//! them for per-image private regions such as the execution stack.

use crate::arch::riscv as hw;
use crate::types::{Asid, PhysAddr, VirtAddr};
use crate::vm::map::make_kernel_leaf;
use crate::vm::pte::{Pte, PteFlags};
use crate::vm::walk::lookup_slot_bounded;
use crate::vm::{PAGE_BITS, PAGE_SIZE, PT_INDEX_BITS, PT_LEVELS, VADDR_BITS};

/// Translation levels of a kernel image; level 0 is the root itself.
pub const KI_NUM_LEVELS: usize = PT_LEVELS + 1;

/// Address bits still untranslated at `level` of an image.
#[inline]
pub const fn ki_untranslated_bits(level: usize) -> usize {
    VADDR_BITS - level * PT_INDEX_BITS
}

/// Region classes of the privileged range.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KiRegion {
    /// Identical in every image; leaves are aliased between images.
    Shared,
    /// Per-image state (e.g. the execution stack); leaves are deep-copied.
    Private,
}

impl KiRegion {
    /// How leaves of this region replicate into a new image.
    #[inline]
    pub fn clone_strategy(self) -> CloneStrategy {
        match self {
            KiRegion::Shared => CloneStrategy::Shared,
            KiRegion::Private => CloneStrategy::Copied,
        }
    }
}

/// One step of populating an image: which region, which level, what address.
#[derive(Clone, Copy, Debug)]
pub struct KiMapping {
    pub region: KiRegion,
    pub level: usize,
    pub map_addr: VirtAddr,
}

/// How [`clone_entry`] replicates a leaf between two images.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CloneStrategy {
    /// Copy the entry; both images reference the same physical page.
    Shared,
    /// Byte-copy the page; the destination gets an independent replica.
    Copied,
}

/// One kernel image: a root for the privileged range, its ASID, and whether
/// its private stack has received the one-time relocation copy.
pub struct KernelImage {
    root: Option<PhysAddr>,
    asid: Asid,
    stack_initialized: bool,
}

impl KernelImage {
    pub fn new(asid: Asid) -> Self {
        Self { root: None, asid, stack_initialized: false }
    }

    #[inline]
    pub fn root(&self) -> Option<PhysAddr> {
        self.root
    }

    #[inline]
    pub fn asid(&self) -> Asid {
        self.asid
    }

    #[inline]
    pub fn stack_initialized(&self) -> bool {
        self.stack_initialized
    }

    /// Installs one memory region into the image at the mapping's level.
    ///
    /// Level 0 records the root pointer itself; no hardware entry exists for
    /// it. Deeper levels install a pointer entry, and the final level a
    /// global leaf: image leaves are shared across ASIDs and only flushed on
    /// a full image switch.
    pub fn memory_map(&mut self, mapping: &KiMapping, memory_addr: PhysAddr) {
        assert!(mapping.level < KI_NUM_LEVELS);

        if mapping.level == 0 {
            assert!(self.root.is_none());
            self.root = Some(memory_addr);
            return;
        }

        let root = self.root.expect("image root must be mapped first");
        let last_level = mapping.level == KI_NUM_LEVELS - 1;

        let span = lookup_slot_bounded(root, mapping.map_addr, PT_LEVELS);
        assert!(!span.slot.read().is_valid());
        assert_eq!(span.bits_left, ki_untranslated_bits(mapping.level));

        let pte = if last_level {
            make_kernel_leaf(memory_addr, true)
        } else {
            Pte::next_table(memory_addr)
        };
        span.slot.write(pte);
    }
}

/// Resolves the entry translating `addr` at `depth` in `root`, synthesizing
/// a page-grained entry when a superpage covers the address.
fn pt_mapping(root: PhysAddr, addr: VirtAddr, depth: usize) -> Pte {
    let span = lookup_slot_bounded(root, addr, depth);
    let entry = span.slot.read();
    if span.bits_left > ki_untranslated_bits(depth) {
        // Superpage: shift the PPN to the page within it.
        let offset = addr.raw() & ((1 << span.bits_left) - 1)
            & !((1 << ki_untranslated_bits(depth)) - 1);
        entry.with_ppn(entry.ppn() + (offset >> PAGE_BITS))
    } else {
        debug_assert_eq!(span.bits_left, ki_untranslated_bits(depth));
        entry
    }
}

/// Physical base of the page translating `addr` at `depth` in `root`.
fn page_base(root: PhysAddr, addr: VirtAddr, depth: usize) -> PhysAddr {
    pt_mapping(root, addr, depth).phys_addr()
}

/// Resolves `addr` through an image's tables to its physical location.
fn resolve(root: PhysAddr, addr: VirtAddr) -> PhysAddr {
    let page = page_base(root, addr, KI_NUM_LEVELS - 1);
    PhysAddr::new(page.raw() + (addr.raw() & (PAGE_SIZE - 1)))
}

/// Replicates the translation of `addr` at `depth` from `src` into `dest`.
///
/// With [`CloneStrategy::Copied`] the destination slot must already hold a
/// valid global placeholder; the referenced region is byte-copied so the
/// images end up physically independent. With [`CloneStrategy::Shared`] the
/// destination slot must be empty and receives the source's entry, aliasing
/// the same physical memory.
pub fn clone_entry(
    dest: &KernelImage,
    src: &KernelImage,
    addr: VirtAddr,
    depth: usize,
    strategy: CloneStrategy,
) {
    assert!(depth > 0 && depth < KI_NUM_LEVELS);
    let dest_root = dest.root.expect("clone into an image without a root");
    let src_root = src.root.expect("clone from an image without a root");

    let dest_span = lookup_slot_bounded(dest_root, addr, depth);
    assert_eq!(dest_span.bits_left, ki_untranslated_bits(depth));

    match strategy {
        CloneStrategy::Copied => {
            let dest_pte = dest_span.slot.read();
            assert!(dest_pte.is_valid() && dest_pte.flags().contains(PteFlags::GLOBAL));
            let src_page = page_base(src_root, addr, depth);
            let dest_page = dest_pte.phys_addr();
            let len = 1usize << ki_untranslated_bits(depth);
            // SAFETY: both pages are live image memory of `len` bytes; the
            // regions are distinct because the strategy demands independence.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    src_page.as_mut_ptr::<u8>(),
                    dest_page.as_mut_ptr::<u8>(),
                    len,
                );
            }
        }
        CloneStrategy::Shared => {
            let dest_pte = dest_span.slot.read();
            assert!(!dest_pte.is_valid() && dest_pte.ppn() == 0);
            dest_span.slot.write(pt_mapping(src_root, addr, depth));
        }
    }
}

/// Activates `image` as the current translation root.
///
/// On first activation the live stack contents are relocated from the
/// current image's private stack region into the new image's before the
/// switch: the root change is only observable once the translation root
/// register is written, and the switching code must not lose its own stack
/// mid-flight.
pub fn set_kernel_image(
    image: &mut KernelImage,
    current: &KernelImage,
    stack_top: VirtAddr,
    stack_bytes: usize,
) {
    let root = image.root.expect("activating an image without a root");

    if !image.stack_initialized {
        let current_root = current.root.expect("current image has no root");
        log_debug!(target: "kimage", "relocating {} stack bytes below {}", stack_bytes, stack_top);
        let mut copied = 0;
        while copied < stack_bytes {
            let addr = VirtAddr::new(stack_top.raw() - stack_bytes + copied);
            let chunk = (PAGE_SIZE - (addr.raw() & (PAGE_SIZE - 1))).min(stack_bytes - copied);
            let src = resolve(current_root, addr);
            let dst = resolve(root, addr);
            // SAFETY: both resolve to live private stack pages; the regions
            // are independent replicas created by the Copied clone.
            unsafe {
                core::ptr::copy_nonoverlapping(
                    src.as_mut_ptr::<u8>(),
                    dst.as_mut_ptr::<u8>(),
                    chunk,
                );
            }
            copied += chunk;
        }
        image.stack_initialized = true;
    }

    hw::set_translation_root(root, image.asid);
}

#[cfg(test)]
mod tests;
