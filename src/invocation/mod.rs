// Copyright 2024 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Capability invocation decoding and performing for the paging objects.
//!
//! Every invocation splits into a pure decode phase that may fail with a
//! typed error and a perform phase that cannot. Capability state and
//! hardware state must change atomically from the caller's point of view,
//! so every fallible check lives in decode; by the time perform runs, the
//! computed capability value, hardware entry and target slots are final.

use core::ptr::NonNull;

use crate::arch::riscv as hw;
use crate::cap::{
    AsidPoolCap, CapError, CapRights, CapTable, Capability, FrameCap, PageTableCap, UntypedCap,
};
use crate::mem;
use crate::types::{Asid, PhysAddr, VirtAddr};
use crate::vm::asid::{AsidPool, ASID_POOL_BITS};
use crate::vm::map;
use crate::vm::pte::{PageTable, Pte, PtSlot, VmAttributes, VmRights};
use crate::vm::walk::{lookup_slot, LookupFault};
use crate::vm::{VspaceContext, KERNEL_BASE, PT_LEVELS};

/// Invocation labels handled by the paging core.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Label {
    PageTableMap,
    PageTableUnmap,
    PageMap,
    PageRemap,
    PageUnmap,
    PageGetAddress,
    AsidControlMakePool,
    AsidPoolAssign,
}

impl Label {
    /// Decodes a raw message label. The numbering is part of the syscall ABI.
    pub fn from_raw(raw: usize) -> Option<Self> {
        Some(match raw {
            0 => Label::PageTableMap,
            1 => Label::PageTableUnmap,
            2 => Label::PageMap,
            3 => Label::PageRemap,
            4 => Label::PageUnmap,
            5 => Label::PageGetAddress,
            6 => Label::AsidControlMakePool,
            7 => Label::AsidPoolAssign,
            _ => return None,
        })
    }
}

/// View over the message registers of an invocation.
#[derive(Clone, Copy)]
pub struct Message<'a> {
    args: &'a [usize],
}

impl<'a> Message<'a> {
    pub fn new(args: &'a [usize]) -> Self {
        Self { args }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.args.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.args.is_empty()
    }

    /// Raw argument at `index`; callers validate the length first.
    #[inline]
    pub fn arg(&self, index: usize) -> usize {
        self.args[index]
    }
}

/// Typed decode-phase error, surfaced to the caller with no side effects.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InvocationError {
    /// A capability or table lookup failed; `source` tells which side.
    FailedLookup { source: bool, fault: LookupFault },
    /// A supplied capability was of the wrong type or in the wrong state.
    InvalidCapability { index: usize },
    /// An argument value was out of range.
    InvalidArgument { index: usize },
    /// A virtual address missed its required alignment.
    AlignmentError,
    /// Too few message arguments or extra capabilities.
    TruncatedMessage,
    /// The label is not supported for this capability type.
    IllegalOperation,
    /// No free slot; the caller must delete something first.
    DeleteFirst,
}

/// Thread-layer interface: the restart marker set after a successful decode
/// and the reply register used by get-address.
pub trait ThreadContext {
    fn set_restart(&mut self);
    fn reply(&mut self, value: usize);
}

/// A fully validated invocation, ready to perform.
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Invocation {
    PageTableMap { slot: usize, cap: PageTableCap, pte: Pte, target: PtSlot },
    PageTableUnmap { slot: usize, cap: PageTableCap },
    PageMap { slot: usize, cap: FrameCap, pte: Pte, target: PtSlot },
    PageRemap { pte: Pte, target: PtSlot },
    PageUnmap { slot: usize, cap: FrameCap },
    PageGetAddress { base: PhysAddr },
    AsidControlMakePool { untyped_slot: usize, untyped: UntypedCap, dest_slot: usize, base: Asid },
    AsidPoolAssign { root_slot: usize, root_cap: PageTableCap, asid: Asid },
}

/// Validates an invocation against the capability table and the directory.
///
/// Pure: neither the table, the directory nor any hardware table is written.
pub fn decode(
    label: Label,
    msg: &Message<'_>,
    slot: usize,
    extra_caps: &[usize],
    table: &CapTable,
    ctx: &VspaceContext,
) -> Result<Invocation, InvocationError> {
    let cap = table
        .get(slot)
        .map_err(|_| InvocationError::FailedLookup { source: true, fault: LookupFault::InvalidRoot })?;
    match cap {
        Capability::PageTable(pt) => decode_page_table(label, msg, slot, pt, extra_caps, table, ctx),
        Capability::Frame(frame) => decode_frame(label, msg, slot, frame, extra_caps, table, ctx),
        Capability::AsidControl => decode_asid_control(label, msg, extra_caps, table, ctx),
        Capability::AsidPool(pool) => decode_asid_pool(label, pool, extra_caps, table, ctx),
        Capability::Untyped(_) => Err(InvocationError::IllegalOperation),
    }
}

/// Applies a decoded invocation: capability slot writes, hardware entry
/// writes and the commit fence. Must not fail; decode checked everything.
pub fn perform<T: ThreadContext>(
    invocation: Invocation,
    table: &mut CapTable,
    ctx: &mut VspaceContext,
    thread: &mut T,
) {
    match invocation {
        Invocation::PageTableMap { slot, cap, pte, target } => {
            let wrote = table.set(slot, Capability::PageTable(cap));
            debug_assert!(wrote.is_ok());
            target.write(pte);
            hw::sfence_vma();
        }
        Invocation::PageTableUnmap { slot, cap } => {
            if let Some(m) = cap.mapping() {
                map::unmap_page_table(ctx.asid_table(), m.asid, m.vaddr, cap.base());
                map::clear_page_table(cap.base());
            }
            let wrote = table.set(slot, Capability::PageTable(cap.unmapped()));
            debug_assert!(wrote.is_ok());
        }
        Invocation::PageMap { slot, cap, pte, target } => {
            let wrote = table.set(slot, Capability::Frame(cap));
            debug_assert!(wrote.is_ok());
            target.write(pte);
            hw::sfence_vma();
        }
        Invocation::PageRemap { pte, target } => {
            target.write(pte);
            hw::sfence_vma();
        }
        Invocation::PageUnmap { slot, cap } => {
            if let Some(m) = cap.mapping() {
                map::unmap_frame(ctx.asid_table(), cap.size(), m.asid, m.vaddr, cap.base());
            }
            let wrote = table.set(slot, Capability::Frame(cap.unmapped()));
            debug_assert!(wrote.is_ok());
        }
        Invocation::PageGetAddress { base } => {
            thread.reply(base.raw());
        }
        Invocation::AsidControlMakePool { untyped_slot, untyped, dest_slot, base } => {
            let wrote = table.set(untyped_slot, Capability::Untyped(untyped.exhausted()));
            debug_assert!(wrote.is_ok());
            mem::zero_region(untyped.base(), ASID_POOL_BITS);
            let wrote = table.set(dest_slot, Capability::AsidPool(AsidPoolCap::new(base, untyped.base())));
            debug_assert!(wrote.is_ok());
            // SAFETY: the span is one pool-sized page, just zeroed; the
            // all-zero pool is the all-empty pool.
            let pool = unsafe { NonNull::new_unchecked(untyped.base().as_mut_ptr::<AsidPool>()) };
            ctx.asid_table_mut().install_pool(base.pool_index(), pool);
        }
        Invocation::AsidPoolAssign { root_slot, root_cap, asid } => {
            ctx.copy_global_mappings(root_cap.base());
            // SAFETY: decode checked the capability; its base is a live,
            // page-aligned table node.
            let root = unsafe { NonNull::new_unchecked(root_cap.base().as_mut_ptr::<PageTable>()) };
            ctx.asid_table_mut().bind_root(asid, root);
            let wrote =
                table.set(root_slot, Capability::PageTable(root_cap.mapped(asid, VirtAddr::new(0))));
            debug_assert!(wrote.is_ok());
        }
    }
}

/// Decodes, marks the thread restartable, then performs.
pub fn invoke<T: ThreadContext>(
    label: Label,
    msg: &Message<'_>,
    slot: usize,
    extra_caps: &[usize],
    table: &mut CapTable,
    ctx: &mut VspaceContext,
    thread: &mut T,
) -> Result<(), InvocationError> {
    let invocation = decode(label, msg, slot, extra_caps, table, ctx)?;
    thread.set_restart();
    perform(invocation, table, ctx, thread);
    Ok(())
}

/// Fetches the address-space-root capability at `slot` and checks it is a
/// genuinely bound root: right type, mapped, and the directory still binds
/// its ASID to exactly this table.
///
/// This is the single root check; the type test and the directory test are
/// each reachable on their own, everything further would be redundant.
fn native_root(
    table: &CapTable,
    slot: usize,
    ctx: &VspaceContext,
) -> Result<(PhysAddr, Asid), InvocationError> {
    let cap = table
        .get(slot)
        .map_err(|_| InvocationError::FailedLookup { source: true, fault: LookupFault::InvalidRoot })?;
    let pt = match cap {
        Capability::PageTable(pt) => pt,
        _ => return Err(InvocationError::InvalidCapability { index: 1 }),
    };
    let mapping = pt.mapping().ok_or(InvocationError::InvalidCapability { index: 1 })?;
    let resolved = ctx
        .find_root(mapping.asid)
        .map_err(|fault| InvocationError::FailedLookup { source: false, fault })?;
    if resolved != pt.base() {
        log_debug!(target: "vm", "stale root cap for asid {}", mapping.asid);
        return Err(InvocationError::InvalidCapability { index: 1 });
    }
    Ok((pt.base(), mapping.asid))
}

fn decode_page_table(
    label: Label,
    msg: &Message<'_>,
    slot: usize,
    cap: PageTableCap,
    extra_caps: &[usize],
    table: &CapTable,
    ctx: &VspaceContext,
) -> Result<Invocation, InvocationError> {
    // A bound address-space root supports no page-table invocations; roots
    // are managed through the ASID pool, not mapped like ordinary tables.
    if let Some(m) = cap.mapping() {
        if ctx.asid_table().is_root_of(cap.base(), m.asid) {
            return Err(InvocationError::IllegalOperation);
        }
    }

    match label {
        Label::PageTableUnmap => Ok(Invocation::PageTableUnmap { slot, cap }),
        Label::PageTableMap => {
            if msg.len() < 2 || extra_caps.is_empty() {
                return Err(InvocationError::TruncatedMessage);
            }
            let vaddr = VirtAddr::new(msg.arg(0));
            let _attr = VmAttributes::from_word(msg.arg(1));

            if cap.is_mapped() {
                return Err(InvocationError::InvalidCapability { index: 0 });
            }
            let (root, asid) = native_root(table, extra_caps[0], ctx)?;
            if vaddr.raw() >= KERNEL_BASE {
                return Err(InvocationError::InvalidArgument { index: 0 });
            }

            // Walk to the deepest populated level; the new table goes one
            // level below it. A full chain leaves no level to install at.
            let walk = lookup_slot(root, vaddr, PT_LEVELS)
                .map_err(|fault| InvocationError::FailedLookup { source: false, fault })?;
            if walk.fault.is_none() || walk.slot.read() != Pte::INVALID {
                return Err(InvocationError::DeleteFirst);
            }

            Ok(Invocation::PageTableMap {
                slot,
                cap: cap.mapped(asid, vaddr),
                pte: Pte::next_table(cap.base()),
                target: walk.slot,
            })
        }
        _ => Err(InvocationError::IllegalOperation),
    }
}

fn decode_frame(
    label: Label,
    msg: &Message<'_>,
    slot: usize,
    cap: FrameCap,
    extra_caps: &[usize],
    table: &CapTable,
    ctx: &VspaceContext,
) -> Result<Invocation, InvocationError> {
    match label {
        Label::PageMap => {
            if msg.len() < 3 || extra_caps.is_empty() {
                return Err(InvocationError::TruncatedMessage);
            }
            let vaddr = VirtAddr::new(msg.arg(0));
            let rights_mask = CapRights::from_word(msg.arg(1));
            let attr = VmAttributes::from_word(msg.arg(2));
            let size = cap.size();

            if !size.is_supported() {
                return Err(InvocationError::InvalidCapability { index: 0 });
            }
            // A mapped frame may only be re-mapped in place; its address is
            // immutable until unmapped.
            if let Some(m) = cap.mapping() {
                if m.vaddr != vaddr {
                    log_debug!(target: "vm", "PageMap: frame already mapped at {}", m.vaddr);
                    return Err(InvocationError::InvalidCapability { index: 0 });
                }
            }
            let (root, asid) = native_root(table, extra_caps[0], ctx)?;

            let vtop = vaddr
                .checked_add((1 << size.bits()) - 1)
                .ok_or(InvocationError::InvalidArgument { index: 0 })?;
            if vtop.raw() >= KERNEL_BASE {
                return Err(InvocationError::InvalidArgument { index: 0 });
            }
            if !vaddr.is_aligned(size.bits()) {
                return Err(InvocationError::AlignmentError);
            }

            let rights = cap.rights().mask(rights_mask);
            let entries =
                map::create_safe_mapping_entries(cap.base(), vaddr, size, rights, attr, root)
                    .map_err(|fault| InvocationError::FailedLookup { source: false, fault })?;

            Ok(Invocation::PageMap {
                slot,
                cap: cap.mapped(asid, vaddr),
                pte: entries.pte,
                target: entries.slot,
            })
        }
        Label::PageRemap => {
            if msg.len() < 2 || extra_caps.is_empty() {
                return Err(InvocationError::TruncatedMessage);
            }
            let rights_mask = CapRights::from_word(msg.arg(0));
            let attr = VmAttributes::from_word(msg.arg(1));

            let (root, _asid) = native_root(table, extra_caps[0], ctx)?;
            // Remap changes rights and attributes only; a frame that was
            // never mapped has no place to re-map.
            let mapping = cap.mapping().ok_or(InvocationError::InvalidCapability { index: 0 })?;

            let rights = cap.rights().mask(rights_mask);
            let entries = map::create_safe_mapping_entries(
                cap.base(),
                mapping.vaddr,
                cap.size(),
                rights,
                attr,
                root,
            )
            .map_err(|fault| InvocationError::FailedLookup { source: false, fault })?;

            Ok(Invocation::PageRemap { pte: entries.pte, target: entries.slot })
        }
        Label::PageUnmap => Ok(Invocation::PageUnmap { slot, cap }),
        Label::PageGetAddress => Ok(Invocation::PageGetAddress { base: cap.base() }),
        _ => Err(InvocationError::IllegalOperation),
    }
}

fn decode_asid_control(
    label: Label,
    msg: &Message<'_>,
    extra_caps: &[usize],
    table: &CapTable,
    ctx: &VspaceContext,
) -> Result<Invocation, InvocationError> {
    if label != Label::AsidControlMakePool {
        return Err(InvocationError::IllegalOperation);
    }
    if msg.len() < 2 || extra_caps.is_empty() {
        return Err(InvocationError::TruncatedMessage);
    }
    let dest_slot = msg.arg(0);
    let _depth = msg.arg(1);
    let untyped_slot = extra_caps[0];

    let index = ctx.asid_table().first_free_pool().ok_or(InvocationError::DeleteFirst)?;

    let untyped = match table.get(untyped_slot) {
        Ok(Capability::Untyped(u)) => u,
        Ok(_) => return Err(InvocationError::InvalidCapability { index: 1 }),
        Err(_) => {
            return Err(InvocationError::FailedLookup {
                source: true,
                fault: LookupFault::InvalidRoot,
            })
        }
    };
    // A pool is carved from exactly pool-sized, non-device memory that has
    // never been retyped.
    if untyped.size_bits() != ASID_POOL_BITS || untyped.is_device() || untyped.has_children() {
        return Err(InvocationError::InvalidCapability { index: 1 });
    }

    table.ensure_empty(dest_slot).map_err(|err| match err {
        CapError::InvalidSlot => {
            InvocationError::FailedLookup { source: false, fault: LookupFault::InvalidRoot }
        }
        CapError::Occupied => InvocationError::DeleteFirst,
    })?;

    Ok(Invocation::AsidControlMakePool {
        untyped_slot,
        untyped,
        dest_slot,
        base: Asid::from_parts(index, 0),
    })
}

fn decode_asid_pool(
    label: Label,
    cap: AsidPoolCap,
    extra_caps: &[usize],
    table: &CapTable,
    ctx: &VspaceContext,
) -> Result<Invocation, InvocationError> {
    if label != Label::AsidPoolAssign {
        return Err(InvocationError::IllegalOperation);
    }
    if extra_caps.is_empty() {
        return Err(InvocationError::TruncatedMessage);
    }
    let root_slot = extra_caps[0];

    let root_cap = match table.get(root_slot) {
        Ok(Capability::PageTable(pt)) => pt,
        Ok(_) => return Err(InvocationError::InvalidCapability { index: 1 }),
        Err(_) => {
            return Err(InvocationError::FailedLookup {
                source: true,
                fault: LookupFault::InvalidRoot,
            })
        }
    };
    if root_cap.is_mapped() {
        return Err(InvocationError::InvalidCapability { index: 1 });
    }

    let pool = ctx
        .asid_table()
        .pool_at(cap.base().pool_index())
        .ok_or(InvocationError::FailedLookup { source: false, fault: LookupFault::InvalidRoot })?;
    if PhysAddr::from_ptr(pool.as_ptr()) != cap.pool() {
        return Err(InvocationError::InvalidCapability { index: 0 });
    }

    // SAFETY: directory entries only point at live pools.
    let offset = unsafe { pool.as_ref() }
        .first_free_offset(cap.base())
        .ok_or(InvocationError::DeleteFirst)?;

    Ok(Invocation::AsidPoolAssign {
        root_slot,
        root_cap,
        asid: Asid::from_parts(cap.base().pool_index(), offset),
    })
}

/// Required alignment of an IPC-buffer location inside its frame.
pub const IPC_BUFFER_ALIGN_BITS: usize = 9;

/// Validates a frame capability offered as a thread's IPC buffer.
pub fn check_valid_ipc_buffer(vaddr: VirtAddr, cap: &Capability) -> Result<(), InvocationError> {
    let frame = match cap {
        Capability::Frame(frame) => frame,
        _ => return Err(InvocationError::IllegalOperation),
    };
    if frame.is_device() {
        return Err(InvocationError::IllegalOperation);
    }
    if !vaddr.is_aligned(IPC_BUFFER_ALIGN_BITS) {
        return Err(InvocationError::AlignmentError);
    }
    Ok(())
}

/// Resolves a thread's IPC buffer to its physical location, or `None` when
/// the buffer frame's rights do not admit the access.
pub fn lookup_ipc_buffer(
    is_receiver: bool,
    frame: &FrameCap,
    buffer_ptr: VirtAddr,
) -> Option<PhysAddr> {
    let rights = frame.rights();
    if rights == VmRights::ReadWrite || (!is_receiver && rights == VmRights::ReadOnly) {
        let offset = buffer_ptr.raw() & ((1 << frame.size().bits()) - 1);
        Some(PhysAddr::new(frame.base().raw() + offset))
    } else {
        None
    }
}
