// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Mapping range tracker (per-address-space Local ranges, shared Global ranges)
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below + address-space mmap/munmap tests
//! PUBLIC API: Prot, MapFlags, Backing, LocalRange, GlobalRange, RangeHit, RangeRegistry
//! DEPENDS_ON: mm::resource::Resource, spin::Mutex
//! INVARIANTS: One Global per (resource, offset, length) while any Local references it;
//!             private/anonymous Locals never carry a Global

extern crate alloc;

use alloc::{sync::{Arc, Weak}, vec::Vec};

use bitflags::bitflags;
use spin::Mutex;

use super::{
    page_table::PageFlags,
    resource::{same_resource, Resource},
    PAGE_SIZE,
};
use crate::types::VirtAddr;

bitflags! {
    /// Access protection requested for a range.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct Prot: u32 {
        const READ = 1 << 0;
        const WRITE = 1 << 1;
        const EXEC = 1 << 2;
    }
}

bitflags! {
    /// Mapping semantics requested by `mmap`.
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct MapFlags: u32 {
        const SHARED = 1 << 0;
        const PRIVATE = 1 << 1;
        const FIXED = 1 << 4;
        const ANONYMOUS = 1 << 5;
    }
}

impl Prot {
    /// Leaf flags for a page of this range. Write implies read on Sv39.
    pub fn page_flags(self, user: bool) -> PageFlags {
        let mut flags = PageFlags::VALID | PageFlags::ACCESSED;
        if self.intersects(Prot::READ | Prot::WRITE) {
            flags |= PageFlags::READ;
        }
        if self.contains(Prot::WRITE) {
            flags |= PageFlags::WRITE | PageFlags::DIRTY;
        }
        if self.contains(Prot::EXEC) {
            flags |= PageFlags::EXECUTE;
        }
        if user {
            flags |= PageFlags::USER;
        }
        flags
    }
}

/// What supplies the pages of a range.
#[derive(Clone, Debug)]
pub enum Backing {
    /// Zero-filled pages allocated on first touch.
    Anonymous,
    Resource(Arc<dyn Resource>),
}

/// Backing object shared by every address space mapping it with shared semantics.
#[derive(Debug)]
pub struct GlobalRange {
    pub resource: Arc<dyn Resource>,
    pub offset: usize,
    pub len: usize,
    /// Base of the first mapping that created this Global.
    pub base: VirtAddr,
}

/// Per-address-space view of a mapping.
#[derive(Clone, Debug)]
pub struct LocalRange {
    pub base: VirtAddr,
    pub len: usize,
    /// Byte offset into the backing resource.
    pub offset: usize,
    pub prot: Prot,
    pub flags: MapFlags,
    pub backing: Backing,
    pub global: Option<Arc<GlobalRange>>,
}

impl LocalRange {
    #[inline]
    pub fn end(&self) -> usize {
        self.base.raw() + self.len
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.base.raw() && addr < self.end()
    }

    #[inline]
    pub fn overlaps(&self, start: usize, end: usize) -> bool {
        start < self.end() && self.base.raw() < end
    }

    #[inline]
    pub fn is_shared(&self) -> bool {
        self.global.is_some()
    }

    /// Resource page index backing `addr`.
    #[inline]
    pub fn file_page(&self, addr: usize) -> usize {
        (self.offset + (addr - self.base.raw())) / PAGE_SIZE
    }

    /// Sub-range `[start, end)` of this range, clamped to its bounds.
    pub(crate) fn slice(&self, start: usize, end: usize) -> Option<LocalRange> {
        let start = start.max(self.base.raw());
        let end = end.min(self.end());
        if start >= end {
            return None;
        }
        let mut piece = self.clone();
        piece.base = VirtAddr::new(start)?;
        piece.len = end - start;
        piece.offset = self.offset + (start - self.base.raw());
        Some(piece)
    }
}

/// Result of looking an address up in the range tracker.
#[derive(Clone, Debug)]
pub struct RangeHit {
    pub range: LocalRange,
    /// Page-aligned address of the faulting page.
    pub mem_page: VirtAddr,
    /// Index of the resource page backing `mem_page`.
    pub file_page: usize,
}

/// Registry of live Global ranges.
///
/// Only weak references are kept: a Global disappears when its last Local is
/// unmapped.
#[derive(Default)]
pub struct RangeRegistry {
    globals: Mutex<Vec<Weak<GlobalRange>>>,
}

impl RangeRegistry {
    pub fn new() -> Self {
        Self { globals: Mutex::new(Vec::new()) }
    }

    /// Returns the Global for `(resource, offset, len)`, creating it if needed.
    pub fn attach(
        &self,
        resource: &Arc<dyn Resource>,
        offset: usize,
        len: usize,
        base: VirtAddr,
    ) -> Arc<GlobalRange> {
        let mut globals = self.globals.lock();
        globals.retain(|weak| weak.strong_count() > 0);
        for weak in globals.iter() {
            if let Some(global) = weak.upgrade() {
                if same_resource(&global.resource, resource)
                    && global.offset == offset
                    && global.len == len
                {
                    return global;
                }
            }
        }
        let global = Arc::new(GlobalRange { resource: resource.clone(), offset, len, base });
        globals.push(Arc::downgrade(&global));
        log_debug!(target: "mm", "range: new global {}+{:#x} len={:#x}", resource.name(), offset, len);
        global
    }

    /// Number of Globals still referenced by at least one Local.
    pub fn live(&self) -> usize {
        self.globals.lock().iter().filter(|weak| weak.strong_count() > 0).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::{phys::FramePool, resource::MemoryObject};

    fn resource() -> Arc<dyn Resource> {
        let pool = Arc::new(FramePool::host(4));
        Arc::new(MemoryObject::new("obj", 4 * PAGE_SIZE, pool))
    }

    fn va(raw: usize) -> VirtAddr {
        VirtAddr::new(raw).expect("canonical")
    }

    #[test]
    fn registry_reuses_matching_global() {
        let registry = RangeRegistry::new();
        let res = resource();
        let a = registry.attach(&res, 0, PAGE_SIZE, va(0x1000));
        let b = registry.attach(&res, 0, PAGE_SIZE, va(0x9000));
        assert!(Arc::ptr_eq(&a, &b));
        let c = registry.attach(&res, PAGE_SIZE, PAGE_SIZE, va(0x9000));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.live(), 2);
    }

    #[test]
    fn global_dies_with_last_local() {
        let registry = RangeRegistry::new();
        let res = resource();
        let global = registry.attach(&res, 0, PAGE_SIZE, va(0x1000));
        assert_eq!(registry.live(), 1);
        drop(global);
        assert_eq!(registry.live(), 0);
    }

    #[test]
    fn slice_adjusts_offset() {
        let range = LocalRange {
            base: va(0x10_000),
            len: 4 * PAGE_SIZE,
            offset: PAGE_SIZE,
            prot: Prot::READ,
            flags: MapFlags::PRIVATE,
            backing: Backing::Anonymous,
            global: None,
        };
        let piece = range.slice(0x12_000, 0x20_000).expect("piece");
        assert_eq!(piece.base.raw(), 0x12_000);
        assert_eq!(piece.len, 2 * PAGE_SIZE);
        assert_eq!(piece.offset, 3 * PAGE_SIZE);
        assert_eq!(range.file_page(0x13_fff), 4);
    }

    #[test]
    fn write_implies_read_in_leaf_flags() {
        let flags = Prot::WRITE.page_flags(true);
        assert!(flags.contains(PageFlags::READ | PageFlags::WRITE | PageFlags::USER));
        assert!(!flags.contains(PageFlags::EXECUTE));
    }
}
