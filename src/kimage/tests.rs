// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![cfg(test)]
//! Kernel-image construction, cloning and activation tests.

use super::*;
use crate::mem;
use crate::types::{Asid, PhysAddr, VirtAddr};
use crate::vm::map::make_kernel_leaf;
use crate::vm::{KERNEL_BASE, PAGE_BITS};

const IMAGE_ADDR: usize = KERNEL_BASE;
const STACK_TOP: usize = KERNEL_BASE + (1 << (PAGE_BITS + 1));

fn page() -> PhysAddr {
    mem::alloc_region(PAGE_BITS).unwrap()
}

fn mapping(region: KiRegion, level: usize, addr: usize) -> KiMapping {
    KiMapping { region, level, map_addr: VirtAddr::new(addr) }
}

/// Image with the intermediate chain for `addr` built, but no leaf yet.
fn image_chain(asid: u16, addr: usize) -> KernelImage {
    let mut image = KernelImage::new(Asid::from_raw(asid));
    image.memory_map(&mapping(KiRegion::Shared, 0, addr), page());
    for level in 1..KI_NUM_LEVELS - 1 {
        image.memory_map(&mapping(KiRegion::Shared, level, addr), page());
    }
    image
}

/// Image with a leaf installed for `addr`; returns the image and the leaf.
fn image_with_leaf(asid: u16, addr: usize, region: KiRegion) -> (KernelImage, PhysAddr) {
    let mut image = image_chain(asid, addr);
    let leaf = page();
    image.memory_map(&mapping(region, KI_NUM_LEVELS - 1, addr), leaf);
    (image, leaf)
}

fn fill(page: PhysAddr, byte: u8) {
    // SAFETY: `page` is a live region of one page.
    unsafe { page.as_mut_ptr::<u8>().write_bytes(byte, crate::vm::PAGE_SIZE) };
}

fn byte_at(page: PhysAddr, offset: usize) -> u8 {
    // SAFETY: `page` is a live region of one page.
    unsafe { page.as_mut_ptr::<u8>().add(offset).read() }
}

#[test]
fn image_builds_level_by_level() {
    let (image, leaf) = image_with_leaf(1, IMAGE_ADDR, KiRegion::Shared);

    let root = image.root().unwrap();
    let span = lookup_slot_bounded(root, VirtAddr::new(IMAGE_ADDR), KI_NUM_LEVELS - 1);
    assert_eq!(span.bits_left, PAGE_BITS);

    let pte = span.slot.read();
    assert!(pte.is_leaf());
    assert!(pte.flags().contains(PteFlags::GLOBAL));
    assert_eq!(pte.phys_addr(), leaf);
}

#[test]
#[should_panic]
fn image_rejects_double_root() {
    let mut image = KernelImage::new(Asid::from_raw(1));
    image.memory_map(&mapping(KiRegion::Shared, 0, IMAGE_ADDR), page());
    image.memory_map(&mapping(KiRegion::Shared, 0, IMAGE_ADDR), page());
}

#[test]
fn clone_shared_aliases_the_physical_page() {
    let (src, src_leaf) = image_with_leaf(1, IMAGE_ADDR, KiRegion::Shared);
    let dest = image_chain(2, IMAGE_ADDR);

    clone_entry(
        &dest,
        &src,
        VirtAddr::new(IMAGE_ADDR),
        KI_NUM_LEVELS - 1,
        CloneStrategy::Shared,
    );

    let span =
        lookup_slot_bounded(dest.root().unwrap(), VirtAddr::new(IMAGE_ADDR), KI_NUM_LEVELS - 1);
    let src_span =
        lookup_slot_bounded(src.root().unwrap(), VirtAddr::new(IMAGE_ADDR), KI_NUM_LEVELS - 1);
    assert_eq!(span.slot.read().ppn(), src_span.slot.read().ppn());
    assert_eq!(span.slot.read().phys_addr(), src_leaf);
}

#[test]
fn clone_shared_from_superpage_synthesizes_page_entry() {
    // Source translates the whole level-2 span with one superpage leaf.
    let mut src = KernelImage::new(Asid::from_raw(1));
    src.memory_map(&mapping(KiRegion::Shared, 0, IMAGE_ADDR), page());
    let superpage = PhysAddr::new(0x8000_0000);
    let root = src.root().unwrap();
    let span = lookup_slot_bounded(root, VirtAddr::new(IMAGE_ADDR), 1);
    span.slot.write(make_kernel_leaf(superpage, true));

    let dest = image_chain(2, IMAGE_ADDR);
    let page_addr = IMAGE_ADDR + 5 * crate::vm::PAGE_SIZE;
    clone_entry(
        &dest,
        &src,
        VirtAddr::new(page_addr),
        KI_NUM_LEVELS - 1,
        CloneStrategy::Shared,
    );

    let cloned =
        lookup_slot_bounded(dest.root().unwrap(), VirtAddr::new(page_addr), KI_NUM_LEVELS - 1);
    assert_eq!(cloned.slot.read().ppn(), superpage.ppn() + 5);
}

#[test]
fn clone_copied_is_physically_independent() {
    let (src, src_leaf) = image_with_leaf(1, IMAGE_ADDR, KiRegion::Private);
    let (dest, dest_leaf) = image_with_leaf(2, IMAGE_ADDR, KiRegion::Private);

    fill(src_leaf, 0x5a);
    fill(dest_leaf, 0x00);

    clone_entry(
        &dest,
        &src,
        VirtAddr::new(IMAGE_ADDR),
        KI_NUM_LEVELS - 1,
        CloneStrategy::Copied,
    );
    assert_eq!(byte_at(dest_leaf, 0), 0x5a);
    assert_eq!(byte_at(dest_leaf, crate::vm::PAGE_SIZE - 1), 0x5a);

    // Mutating the replica must not reach the source, and vice versa.
    fill(dest_leaf, 0x11);
    assert_eq!(byte_at(src_leaf, 0), 0x5a);
    fill(src_leaf, 0x22);
    assert_eq!(byte_at(dest_leaf, 0), 0x11);
}

#[test]
fn region_class_picks_the_strategy() {
    assert_eq!(KiRegion::Shared.clone_strategy(), CloneStrategy::Shared);
    assert_eq!(KiRegion::Private.clone_strategy(), CloneStrategy::Copied);
}

#[test]
fn first_activation_relocates_the_live_stack() {
    let stack_page = STACK_TOP - crate::vm::PAGE_SIZE;
    let (current, current_stack) = image_with_leaf(1, stack_page, KiRegion::Private);
    let (mut next, next_stack) = image_with_leaf(2, stack_page, KiRegion::Private);

    fill(current_stack, 0xcd);
    fill(next_stack, 0x00);

    let stack_bytes = 256;
    set_kernel_image(&mut next, &current, VirtAddr::new(STACK_TOP), stack_bytes);
    assert!(next.stack_initialized());

    // The live span below the top was relocated; the rest stayed untouched.
    let top_offset = crate::vm::PAGE_SIZE - stack_bytes;
    assert_eq!(byte_at(next_stack, top_offset), 0xcd);
    assert_eq!(byte_at(next_stack, crate::vm::PAGE_SIZE - 1), 0xcd);
    assert_eq!(byte_at(next_stack, top_offset - 1), 0x00);

    // A second activation switches roots without copying again.
    fill(current_stack, 0xee);
    set_kernel_image(&mut next, &current, VirtAddr::new(STACK_TOP), stack_bytes);
    assert_eq!(byte_at(next_stack, crate::vm::PAGE_SIZE - 1), 0xcd);
}
