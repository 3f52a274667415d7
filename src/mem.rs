// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Region allocation for paging structures.
//!
//! Page-table nodes and ASID pools are carved as naturally aligned,
//! power-of-two regions. On the bare-metal target the backing store is the
//! boot heap handed over by the loader; host builds go through the global
//! allocator so tests can create real, dereferencable nodes.

extern crate alloc;

use alloc::alloc::Layout;

use crate::types::PhysAddr;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
use linked_list_allocator::LockedHeap;

/// Kernel heap backing all region allocations on the target.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
#[global_allocator]
static KERNEL_HEAP: LockedHeap = LockedHeap::empty();

/// Hands the boot memory span to the allocator.
///
/// # Safety
///
/// `start..start + size` must be unused, writable memory that stays owned by
/// the allocator for the kernel's lifetime. Must be called exactly once,
/// before the first allocation.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub unsafe fn init(start: *mut u8, size: usize) {
    KERNEL_HEAP.lock().init(start, size);
}

/// Allocates a zeroed region of `2^size_bits` bytes at natural alignment.
///
/// Returns `None` when the backing store is exhausted; callers surface that
/// as their own out-of-memory condition.
pub fn alloc_region(size_bits: usize) -> Option<PhysAddr> {
    let size = 1usize << size_bits;
    let layout = Layout::from_size_align(size, size).ok()?;
    // SAFETY: layout has non-zero size.
    let ptr = unsafe { alloc::alloc::alloc_zeroed(layout) };
    if ptr.is_null() {
        return None;
    }
    Some(PhysAddr::from_ptr(ptr))
}

/// Zeroes a previously allocated region.
pub fn zero_region(base: PhysAddr, size_bits: usize) {
    debug_assert!(!base.is_null() && base.is_aligned(size_bits));
    // SAFETY: base designates a live region of at least 2^size_bits bytes.
    unsafe {
        core::ptr::write_bytes(base.as_mut_ptr::<u8>(), 0, 1 << size_bits);
    }
}
