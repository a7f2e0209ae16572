// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Sv39 page-table implementation with lazy allocation of intermediate levels.
//!
//! Every table page is a frame from the injected [`FrameAllocator`] and is
//! recorded in `owned` so it can be returned on drop. Leaves carrying the
//! software [`PageFlags::OWNED`] bit also own their frame.

extern crate alloc;

use alloc::{sync::Arc, vec, vec::Vec};

use bitflags::bitflags;

use super::{phys::FrameAllocator, PAGE_SIZE};
use crate::types::PhysAddr;

/// Number of entries per Sv39 page-table page.
const PT_ENTRIES: usize = 512;
/// Root slots covering the kernel (upper) half.
pub const KERNEL_ROOT_SLOTS: core::ops::Range<usize> = 256..PT_ENTRIES;
/// Root slot holding the kernel identity window over RAM.
pub const IDENTITY_ROOT_SLOT: usize = 2;
/// Identity window bounds (`0x8000_0000..0xc000_0000`), never available to user mappings.
pub const IDENTITY_WINDOW: core::ops::Range<usize> =
    (IDENTITY_ROOT_SLOT << 30)..((IDENTITY_ROOT_SLOT + 1) << 30);
/// First address above the user half.
pub const USER_TOP: usize = 1 << 38;

const PTE_PPN_SHIFT: usize = 10;
const PTE_FLAG_MASK: usize = (1 << PTE_PPN_SHIFT) - 1;

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    /// Flags stored in Sv39 page-table entries.
    pub struct PageFlags: usize {
        const VALID = 1 << 0;
        const READ = 1 << 1;
        const WRITE = 1 << 2;
        const EXECUTE = 1 << 3;
        const USER = 1 << 4;
        const GLOBAL = 1 << 5;
        const ACCESSED = 1 << 6;
        const DIRTY = 1 << 7;
        /// Software bit (RSW): the leaf frame belongs to this table.
        const OWNED = 1 << 8;
    }
}

/// Error returned when manipulating page tables.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapError {
    /// Virtual or physical address was not page aligned.
    Unaligned,
    /// Mapping extends beyond the canonical Sv39 range.
    OutOfRange,
    /// Mapping violates the W^X policy.
    PermissionDenied,
    /// Mapping collides with an existing entry.
    Overlap,
    /// Flags do not describe a valid leaf entry.
    InvalidFlags,
    /// No leaf is installed at the address.
    NotMapped,
    /// The frame allocator could not supply a table page.
    OutOfFrames,
}

/// Leaf entry decoded from a PTE.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Leaf {
    pub pa: PhysAddr,
    pub flags: PageFlags,
}

impl Leaf {
    #[inline]
    pub fn decode(entry: usize) -> Self {
        Self {
            pa: PhysAddr::from_ppn(entry >> PTE_PPN_SHIFT),
            flags: PageFlags::from_bits_truncate(entry & PTE_FLAG_MASK),
        }
    }
}

/// Three-level Sv39 page table allocating intermediate levels on demand.
pub struct PageTable {
    root: PhysAddr,
    owned: Vec<PhysAddr>,
    frames: Arc<dyn FrameAllocator>,
    owns_kernel_half: bool,
}

impl PageTable {
    /// Creates an empty Sv39 page table with a fresh root page.
    pub fn new(frames: Arc<dyn FrameAllocator>) -> Result<Self, MapError> {
        let root = frames.alloc_zeroed().ok_or(MapError::OutOfFrames)?;
        Ok(Self { root, owned: vec![root], frames, owns_kernel_half: false })
    }

    /// Returns the physical address of the root page.
    pub fn root(&self) -> PhysAddr {
        self.root
    }

    /// Returns the physical page number of the root page suitable for SATP.
    pub fn root_ppn(&self) -> usize {
        self.root.ppn()
    }

    pub fn frames(&self) -> &Arc<dyn FrameAllocator> {
        &self.frames
    }

    /// Number of table pages owned (root included).
    pub fn table_pages(&self) -> usize {
        self.owned.len()
    }

    /// Looks up the raw leaf entry mapped at `va` if it exists.
    pub fn lookup(&self, va: usize) -> Option<usize> {
        if va % PAGE_SIZE != 0 || !is_canonical_sv39(va) {
            return None;
        }
        let slot = self.leaf_slot(va)?;
        // SAFETY: `leaf_slot` returns a pointer into a live table page.
        let entry = unsafe { *slot };
        (entry & PageFlags::VALID.bits() != 0).then_some(entry)
    }

    /// Translates `va` (any offset) to its physical address.
    pub fn translate(&self, va: usize) -> Option<PhysAddr> {
        let entry = self.lookup(va & !(PAGE_SIZE - 1))?;
        Some(Leaf::decode(entry).pa.add(va & (PAGE_SIZE - 1)))
    }

    /// Installs a 4 KiB mapping from `va` to `pa` using `flags`.
    pub fn map(&mut self, va: usize, pa: PhysAddr, flags: PageFlags) -> Result<(), MapError> {
        if va % PAGE_SIZE != 0 || !pa.is_page_aligned() {
            return Err(MapError::Unaligned);
        }
        if !is_canonical_sv39(va) {
            return Err(MapError::OutOfRange);
        }
        validate_leaf_flags(flags)?;

        let mut table = self.root;
        for (level, index) in vpn_indices(va).iter().enumerate() {
            let slot = self.slot(table, *index)?;
            // SAFETY: `slot` points into a live table page owned or shared by this table.
            let entry = unsafe { &mut *slot };
            if level == 2 {
                if *entry & PageFlags::VALID.bits() != 0 {
                    return Err(MapError::Overlap);
                }
                *entry = (pa.ppn() << PTE_PPN_SHIFT) | flags.bits();
                return Ok(());
            }

            if *entry & PageFlags::VALID.bits() != 0 {
                if *entry & LEAF_PERMS.bits() != 0 {
                    return Err(MapError::Overlap);
                }
                table = PhysAddr::from_ppn(*entry >> PTE_PPN_SHIFT);
                continue;
            }

            let next = self.frames.alloc_zeroed().ok_or(MapError::OutOfFrames)?;
            self.owned.push(next);
            *entry = (next.ppn() << PTE_PPN_SHIFT) | PageFlags::VALID.bits();
            table = next;
        }
        Ok(())
    }

    /// Removes the leaf at `va`, freeing its frame when it carries `OWNED`.
    pub fn unmap(&mut self, va: usize) -> Result<Leaf, MapError> {
        if va % PAGE_SIZE != 0 {
            return Err(MapError::Unaligned);
        }
        if !is_canonical_sv39(va) {
            return Err(MapError::OutOfRange);
        }
        let slot = self.leaf_slot(va).ok_or(MapError::NotMapped)?;
        // SAFETY: `leaf_slot` returns a pointer into a live table page.
        let entry = unsafe { &mut *slot };
        if *entry & PageFlags::VALID.bits() == 0 {
            return Err(MapError::NotMapped);
        }
        let leaf = Leaf::decode(*entry);
        *entry = 0;
        if leaf.flags.contains(PageFlags::OWNED) {
            self.frames.free_frames(leaf.pa, 1);
        }
        Ok(leaf)
    }

    /// Removes the leaf at `va` without releasing its frame. The caller takes
    /// over the frame when the returned flags carry `OWNED`.
    pub fn take(&mut self, va: usize) -> Result<Leaf, MapError> {
        let slot = self.leaf_slot(va).ok_or(MapError::NotMapped)?;
        // SAFETY: `leaf_slot` returns a pointer into a live table page.
        let entry = unsafe { &mut *slot };
        if *entry & PageFlags::VALID.bits() == 0 {
            return Err(MapError::NotMapped);
        }
        let leaf = Leaf::decode(*entry);
        *entry = 0;
        Ok(leaf)
    }

    /// Replaces the permission bits of an existing leaf, keeping its frame.
    pub fn set_leaf_flags(&mut self, va: usize, flags: PageFlags) -> Result<(), MapError> {
        validate_leaf_flags(flags)?;
        let slot = self.leaf_slot(va).ok_or(MapError::NotMapped)?;
        // SAFETY: `leaf_slot` returns a pointer into a live table page.
        let entry = unsafe { &mut *slot };
        if *entry & PageFlags::VALID.bits() == 0 {
            return Err(MapError::NotMapped);
        }
        let owned = *entry & PageFlags::OWNED.bits();
        *entry = (*entry & !PTE_FLAG_MASK) | flags.bits() | owned;
        Ok(())
    }

    /// Allocates every shared level-1 table (kernel half and identity window)
    /// so later kernel mappings land in pages visible to all address spaces.
    pub fn populate_kernel_half(&mut self) -> Result<(), MapError> {
        for index in shared_root_slots() {
            let slot = self.slot(self.root, index)?;
            // SAFETY: root page is live for the lifetime of `self`.
            let entry = unsafe { &mut *slot };
            if *entry & PageFlags::VALID.bits() != 0 {
                continue;
            }
            let next = self.frames.alloc_zeroed().ok_or(MapError::OutOfFrames)?;
            self.owned.push(next);
            *entry = (next.ppn() << PTE_PPN_SHIFT) | PageFlags::VALID.bits();
        }
        self.owns_kernel_half = true;
        Ok(())
    }

    /// Copies the shared root entries of `kernel` into this table.
    pub fn share_kernel_half(&mut self, kernel: &PageTable) -> Result<(), MapError> {
        for index in shared_root_slots() {
            let src = kernel.slot(kernel.root, index)?;
            let dst = self.slot(self.root, index)?;
            // SAFETY: both root pages are live; distinct tables so no aliasing.
            unsafe { *dst = *src };
        }
        Ok(())
    }

    /// Raw root entry at `index` (used to check kernel-half sharing).
    pub fn root_entry(&self, index: usize) -> Option<usize> {
        let slot = self.slot(self.root, index).ok()?;
        // SAFETY: root page is live.
        Some(unsafe { *slot })
    }

    /// Visits every user-half leaf as `(va, raw entry)`.
    pub fn for_each_user_leaf(&self, f: impl FnMut(usize, usize)) {
        self.for_each_leaf(user_root_slots(), f);
    }

    /// Unmaps every user-half leaf, freeing owned frames.
    pub fn clear_user_half(&mut self) -> usize {
        self.clear_leaves(user_root_slots())
    }

    fn for_each_leaf(&self, roots: impl Iterator<Item = usize>, mut f: impl FnMut(usize, usize)) {
        for i2 in roots {
            let Some(l1) = self.next_table(self.root, i2) else { continue };
            for i1 in 0..PT_ENTRIES {
                let Some(l0) = self.next_table(l1, i1) else { continue };
                for i0 in 0..PT_ENTRIES {
                    let Ok(slot) = self.slot(l0, i0) else { continue };
                    // SAFETY: `l0` is a live table page.
                    let entry = unsafe { *slot };
                    if entry & PageFlags::VALID.bits() != 0 {
                        f(sign_extend((i2 << 30) | (i1 << 21) | (i0 << 12)), entry);
                    }
                }
            }
        }
    }

    fn clear_leaves(&mut self, roots: impl Iterator<Item = usize>) -> usize {
        let mut leaves = Vec::new();
        self.for_each_leaf(roots, |va, _| leaves.push(va));
        let count = leaves.len();
        for va in leaves {
            let _ = self.unmap(va);
        }
        count
    }

    fn next_table(&self, table: PhysAddr, index: usize) -> Option<PhysAddr> {
        let slot = self.slot(table, index).ok()?;
        // SAFETY: `table` is a live table page.
        let entry = unsafe { *slot };
        if entry & PageFlags::VALID.bits() == 0 || entry & LEAF_PERMS.bits() != 0 {
            return None;
        }
        Some(PhysAddr::from_ppn(entry >> PTE_PPN_SHIFT))
    }

    fn leaf_slot(&self, va: usize) -> Option<*mut usize> {
        let [i2, i1, i0] = vpn_indices(va);
        let l1 = self.next_table(self.root, i2)?;
        let l0 = self.next_table(l1, i1)?;
        self.slot(l0, i0).ok()
    }

    fn slot(&self, table: PhysAddr, index: usize) -> Result<*mut usize, MapError> {
        debug_assert!(index < PT_ENTRIES);
        let base = self.frames.frame_ptr(table).ok_or(MapError::OutOfRange)?;
        // SAFETY: a table page holds PT_ENTRIES usize entries.
        Ok(unsafe { (base.as_ptr() as *mut usize).add(index) })
    }
}

impl Drop for PageTable {
    fn drop(&mut self) {
        self.clear_user_half();
        if self.owns_kernel_half {
            self.clear_leaves(shared_root_slots());
        }
        for page in self.owned.drain(..) {
            self.frames.free_frames(page, 1);
        }
    }
}

// SAFETY: table pages are only reached through `&self`/`&mut self`; callers
// serialize mutation behind the owning address-space lock.
unsafe impl Send for PageTable {}
// SAFETY: see above.
unsafe impl Sync for PageTable {}

const LEAF_PERMS: PageFlags = PageFlags::READ.union(PageFlags::WRITE).union(PageFlags::EXECUTE);

fn validate_leaf_flags(flags: PageFlags) -> Result<(), MapError> {
    if flags.intersection(LEAF_PERMS).is_empty() || !flags.contains(PageFlags::VALID) {
        return Err(MapError::InvalidFlags);
    }
    if flags.contains(PageFlags::WRITE) && !flags.contains(PageFlags::READ) {
        return Err(MapError::InvalidFlags);
    }
    if flags.contains(PageFlags::WRITE) && flags.contains(PageFlags::EXECUTE) {
        return Err(MapError::PermissionDenied);
    }
    Ok(())
}

/// VPN indices ordered root first.
fn vpn_indices(va: usize) -> [usize; 3] {
    let vpn2 = (va >> 30) & 0x1ff;
    let vpn1 = (va >> 21) & 0x1ff;
    let vpn0 = (va >> 12) & 0x1ff;
    [vpn2, vpn1, vpn0]
}

/// Root slots whose level-1 tables are owned by the kernel table.
pub fn shared_root_slots() -> impl Iterator<Item = usize> {
    core::iter::once(IDENTITY_ROOT_SLOT).chain(KERNEL_ROOT_SLOTS)
}

fn user_root_slots() -> impl Iterator<Item = usize> {
    (0..KERNEL_ROOT_SLOTS.start).filter(|index| *index != IDENTITY_ROOT_SLOT)
}

fn sign_extend(va: usize) -> usize {
    if (va >> 38) & 1 == 1 {
        va | !((1usize << 39) - 1)
    } else {
        va
    }
}

/// True when bits 63..39 replicate bit 38.
pub fn is_canonical_sv39(va: usize) -> bool {
    let sign = (va >> 38) & 1;
    let upper = va >> 39;
    if sign == 0 {
        upper == 0
    } else {
        upper == usize::MAX >> 39
    }
}
