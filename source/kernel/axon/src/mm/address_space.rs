// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Sv39 address spaces with ASID allocation, mapping ranges and demand paging
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below + mm/tests.rs + tests/memory.rs
//! PUBLIC API: MemoryContext, AddressSpace, AsidAllocator, AddressSpaceError,
//!             FaultError, FaultResolution
//! DEPENDS_ON: mm::page_table, mm::mapping, mm::resource, hal::Hal
//! INVARIANTS: One lock per space serializes table and range mutation; the shared root
//!             slots of every user space alias the kernel space; user mappings never
//!             reach the kernel half or the identity window

extern crate alloc;

use alloc::{sync::Arc, vec::Vec};

use spin::Mutex;

use super::{
    align_down, align_up,
    mapping::{Backing, LocalRange, MapFlags, Prot, RangeHit, RangeRegistry},
    page_table::{Leaf, MapError, PageFlags, PageTable, IDENTITY_WINDOW, USER_TOP},
    phys::FrameAllocator,
    resource::{MemoryObject, Resource, ResourceError},
    Access, PAGE_SIZE,
};
use crate::{
    hal::Hal,
    types::{CpuId, PhysAddr, VirtAddr},
};

/// Maximum ASIDs made available by the allocator.
const MAX_ASIDS: usize = 256;
const WORD_BITS: usize = u64::BITS as usize;
const BITMAP_WORDS: usize = (MAX_ASIDS + WORD_BITS - 1) / WORD_BITS;
/// ASID shared by the kernel space and by user spaces created after exhaustion.
const SHARED_ASID: u16 = 0;

/// Placement start for kernel-space `mmap` without a hint.
pub const KERNEL_MMAP_BASE: usize = 0xffff_ffd0_0000_0000;
/// Kernel-half alias of the UART registers.
pub const KERNEL_UART_VA: usize = 0xffff_ffc0_1000_0000;

/// Errors reported while managing address spaces.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AddressSpaceError {
    /// Underlying map operation failed.
    Mapping(MapError),
    /// Arguments supplied by the caller were invalid.
    InvalidArgs,
    /// No free virtual range of the requested size.
    NoSpace,
    /// Demand paging could not supply the page.
    Fault(FaultError),
}

impl From<MapError> for AddressSpaceError {
    fn from(value: MapError) -> Self {
        Self::Mapping(value)
    }
}

impl From<FaultError> for AddressSpaceError {
    fn from(value: FaultError) -> Self {
        Self::Fault(value)
    }
}

/// Reasons a fault cannot be resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultError {
    /// No mapping range covers the address.
    NoRange,
    /// The range (or the resident leaf) forbids the access.
    AccessDenied,
    Resource(ResourceError),
    OutOfFrames,
    Mapping(MapError),
}

impl From<ResourceError> for FaultError {
    fn from(value: ResourceError) -> Self {
        match value {
            ResourceError::OutOfFrames => Self::OutOfFrames,
            other => Self::Resource(other),
        }
    }
}

/// Successful fault resolution.
#[must_use]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultResolution {
    /// A page was installed at the faulting address.
    Mapped(PhysAddr),
    /// Another path mapped the page first with sufficient rights.
    AlreadyMapped,
}

/// Bitmap of hardware ASIDs; ASID 0 is reserved for the kernel.
pub struct AsidAllocator {
    bitmap: [u64; BITMAP_WORDS],
    next: usize,
}

impl AsidAllocator {
    pub const fn new() -> Self {
        let mut bitmap = [0u64; BITMAP_WORDS];
        bitmap[0] |= 1;
        Self { bitmap, next: 1 }
    }

    pub fn allocate(&mut self) -> Option<u16> {
        for _ in 0..MAX_ASIDS {
            let index = self.next % MAX_ASIDS;
            self.next = (index + 1) % MAX_ASIDS;
            let (word, bit) = (index / WORD_BITS, index % WORD_BITS);
            if self.bitmap[word] & (1 << bit) == 0 {
                self.bitmap[word] |= 1 << bit;
                return Some(index as u16);
            }
        }
        None
    }

    pub fn free(&mut self, asid: u16) {
        let index = asid as usize;
        if index == 0 || index >= MAX_ASIDS {
            return;
        }
        self.bitmap[index / WORD_BITS] &= !(1 << (index % WORD_BITS));
    }
}

impl Default for AsidAllocator {
    fn default() -> Self {
        Self::new()
    }
}

/// Allocators shared by every address space of one kernel instance.
#[derive(Clone)]
pub struct MemoryContext {
    frames: Arc<dyn FrameAllocator>,
    registry: Arc<RangeRegistry>,
    asids: Arc<Mutex<AsidAllocator>>,
}

impl MemoryContext {
    pub fn new(frames: Arc<dyn FrameAllocator>) -> Self {
        Self {
            frames,
            registry: Arc::new(RangeRegistry::new()),
            asids: Arc::new(Mutex::new(AsidAllocator::new())),
        }
    }

    pub fn frames(&self) -> &Arc<dyn FrameAllocator> {
        &self.frames
    }

    pub fn registry(&self) -> &RangeRegistry {
        &self.registry
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SpaceKind {
    Kernel,
    User,
}

struct SpaceInner {
    table: PageTable,
    ranges: Vec<LocalRange>,
    mmap_base: usize,
}

/// One translation root plus the mapping ranges registered against it.
pub struct AddressSpace {
    inner: Mutex<SpaceInner>,
    root: PhysAddr,
    asid: u16,
    kind: SpaceKind,
    ctx: MemoryContext,
}

impl AddressSpace {
    /// Builds the kernel space: every shared root slot is populated and, on
    /// the target, the kernel image and UART are mapped.
    pub fn new_kernel(ctx: &MemoryContext) -> Result<Self, AddressSpaceError> {
        let mut table = PageTable::new(ctx.frames.clone())?;
        table.populate_kernel_half()?;
        map_kernel_segments(&mut table)?;
        log_info!(target: "mm", "kernel space ready ({} table pages)", table.table_pages());
        Ok(Self::assemble(ctx, table, SHARED_ASID, SpaceKind::Kernel, KERNEL_MMAP_BASE))
    }

    /// Builds an empty user space sharing the kernel half of `kernel`.
    pub fn new_user(
        ctx: &MemoryContext,
        kernel: &AddressSpace,
        mmap_base: usize,
    ) -> Result<Self, AddressSpaceError> {
        let mut table = PageTable::new(ctx.frames.clone())?;
        table.share_kernel_half(&kernel.inner.lock().table)?;
        let asid = allocate_asid(ctx);
        Ok(Self::assemble(ctx, table, asid, SpaceKind::User, align_down(mmap_base)))
    }

    fn assemble(
        ctx: &MemoryContext,
        table: PageTable,
        asid: u16,
        kind: SpaceKind,
        mmap_base: usize,
    ) -> Self {
        let root = table.root();
        Self {
            inner: Mutex::new(SpaceInner { table, ranges: Vec::new(), mmap_base }),
            root,
            asid,
            kind,
            ctx: ctx.clone(),
        }
    }

    /// Returns the hardware ASID backing this address space.
    pub fn asid(&self) -> u16 {
        self.asid
    }

    pub fn root(&self) -> PhysAddr {
        self.root
    }

    pub fn kind(&self) -> SpaceKind {
        self.kind
    }

    #[inline]
    pub fn is_kernel(&self) -> bool {
        self.kind == SpaceKind::Kernel
    }

    /// Returns the SATP value describing this address space.
    pub fn satp_value(&self) -> usize {
        const MODE_SV39: usize = 8;
        let mode = MODE_SV39 << 60;
        let asid = (self.asid as usize) << 44;
        mode | asid | self.root.ppn()
    }

    /// Loads this space on `cpu`. Takes no lock: root and ASID never change.
    pub fn switch_to(&self, hal: &dyn Hal, cpu: CpuId) {
        hal.switch_address_space(cpu, self.satp_value());
    }

    fn check_region(&self, start: usize, len: usize) -> Result<(), MapError> {
        let end = start.checked_add(len).ok_or(MapError::OutOfRange)?;
        let inside = match self.kind {
            SpaceKind::User => {
                end <= USER_TOP && !(start < IDENTITY_WINDOW.end && IDENTITY_WINDOW.start < end)
            }
            SpaceKind::Kernel => {
                let upper = VirtAddr::new(start).map_or(false, VirtAddr::is_kernel);
                upper || (IDENTITY_WINDOW.contains(&start) && end <= IDENTITY_WINDOW.end)
            }
        };
        if inside {
            Ok(())
        } else {
            Err(MapError::OutOfRange)
        }
    }

    fn leaf_flags(&self, flags: PageFlags) -> PageFlags {
        match self.kind {
            SpaceKind::User => flags | PageFlags::USER,
            SpaceKind::Kernel => flags,
        }
    }

    /// Installs one page.
    pub fn map_mem(&self, va: VirtAddr, pa: PhysAddr, flags: PageFlags) -> Result<(), AddressSpaceError> {
        self.check_region(va.raw(), PAGE_SIZE)?;
        self.inner.lock().table.map(va.raw(), pa, flags)?;
        Ok(())
    }

    /// Installs `len` bytes of contiguous frames. Nothing stays mapped on failure.
    pub fn map_range(
        &self,
        va: VirtAddr,
        pa: PhysAddr,
        len: usize,
        flags: PageFlags,
    ) -> Result<(), AddressSpaceError> {
        let len = align_up(len).ok_or(AddressSpaceError::InvalidArgs)?;
        self.check_region(va.raw(), len)?;
        let mut inner = self.inner.lock();
        for offset in (0..len).step_by(PAGE_SIZE) {
            if let Err(err) = inner.table.map(va.raw() + offset, pa.add(offset), flags) {
                for undo in (0..offset).step_by(PAGE_SIZE) {
                    let _ = inner.table.take(va.raw() + undo);
                }
                return Err(err.into());
            }
        }
        Ok(())
    }

    /// Removes the page at `va`, returning the frame it mapped.
    pub fn unmap_mem(&self, va: VirtAddr) -> Result<PhysAddr, AddressSpaceError> {
        self.check_region(va.raw(), PAGE_SIZE)?;
        let leaf = self.inner.lock().table.unmap(va.raw())?;
        Ok(leaf.pa)
    }

    /// Moves the page at `old` to `new` with `flags`, keeping frame ownership.
    pub fn remap_mem(
        &self,
        old: VirtAddr,
        new: VirtAddr,
        flags: PageFlags,
    ) -> Result<(), AddressSpaceError> {
        self.check_region(old.raw(), PAGE_SIZE)?;
        self.check_region(new.raw(), PAGE_SIZE)?;
        let mut inner = self.inner.lock();
        let leaf = inner.table.take(old.raw())?;
        let owned = leaf.flags & PageFlags::OWNED;
        if let Err(err) = inner.table.map(new.raw(), leaf.pa, flags | owned) {
            inner.table.map(old.raw(), leaf.pa, leaf.flags)?;
            return Err(err.into());
        }
        Ok(())
    }

    /// Raw leaf entry covering `va`.
    pub fn virt2pte(&self, va: VirtAddr) -> Option<usize> {
        self.inner.lock().table.lookup(va.page_base().raw())
    }

    pub fn virt2phys(&self, va: VirtAddr) -> Option<PhysAddr> {
        self.inner.lock().table.translate(va.raw())
    }

    /// Duplicates a user space. Owned pages are copied; shared pages and
    /// frames owned elsewhere are mapped again. Ranges keep their Globals.
    pub fn fork(&self) -> Result<AddressSpace, AddressSpaceError> {
        if self.is_kernel() {
            return Err(AddressSpaceError::InvalidArgs);
        }
        let frames = self.ctx.frames.clone();
        let inner = self.inner.lock();
        let mut table = PageTable::new(frames.clone())?;
        table.share_kernel_half(&inner.table)?;

        let mut leaves = Vec::new();
        inner.table.for_each_user_leaf(|va, entry| leaves.push((va, Leaf::decode(entry))));
        for (va, leaf) in leaves {
            if leaf.flags.contains(PageFlags::OWNED) {
                let copy = frames.alloc_frames(1).ok_or(MapError::OutOfFrames)?;
                if !frames.copy_frame(copy, leaf.pa) {
                    frames.free_frames(copy, 1);
                    return Err(MapError::OutOfRange.into());
                }
                if let Err(err) = table.map(va, copy, leaf.flags) {
                    frames.free_frames(copy, 1);
                    return Err(err.into());
                }
            } else {
                table.map(va, leaf.pa, leaf.flags)?;
            }
        }

        let asid = allocate_asid(&self.ctx);
        let child = Self::assemble(&self.ctx, table, asid, SpaceKind::User, inner.mmap_base);
        child.inner.lock().ranges = inner.ranges.clone();
        Ok(child)
    }

    /// Drops every range and user mapping, returning the number of pages unmapped.
    pub fn delete_this(&self) -> usize {
        let mut inner = self.inner.lock();
        inner.ranges.clear();
        inner.table.clear_user_half()
    }

    /// Registers a mapping range and returns its base.
    ///
    /// `FIXED` places the range at `hint` without checking for overlap. A
    /// plain hint is honoured when free, otherwise the first gap at or above
    /// the space's mmap base is used. Shared mappings attach to (or create)
    /// the Global for `(resource, offset, len)`; shared anonymous mappings get
    /// a fresh memory object.
    pub fn mmap(
        &self,
        hint: Option<VirtAddr>,
        len: usize,
        prot: Prot,
        flags: MapFlags,
        resource: Option<Arc<dyn Resource>>,
        offset: usize,
    ) -> Result<VirtAddr, AddressSpaceError> {
        let shared = flags.contains(MapFlags::SHARED);
        if len == 0
            || offset % PAGE_SIZE != 0
            || shared == flags.contains(MapFlags::PRIVATE)
            || (flags.contains(MapFlags::ANONYMOUS) && resource.is_some())
        {
            return Err(AddressSpaceError::InvalidArgs);
        }
        if prot.contains(Prot::WRITE | Prot::EXEC) {
            return Err(MapError::PermissionDenied.into());
        }
        let len = align_up(len).ok_or(AddressSpaceError::InvalidArgs)?;

        let mut inner = self.inner.lock();
        let base = match hint {
            Some(hint) if flags.contains(MapFlags::FIXED) => {
                if hint.page_offset() != 0 {
                    return Err(AddressSpaceError::InvalidArgs);
                }
                self.check_region(hint.raw(), len)?;
                hint.raw()
            }
            Some(hint)
                if hint.page_offset() == 0
                    && self.check_region(hint.raw(), len).is_ok()
                    && !inner.ranges.iter().any(|r| r.overlaps(hint.raw(), hint.raw() + len)) =>
            {
                hint.raw()
            }
            _ => self.find_free(&inner, len).ok_or(AddressSpaceError::NoSpace)?,
        };
        let base = VirtAddr::new(base).ok_or(AddressSpaceError::NoSpace)?;

        let resource = match resource {
            Some(resource) => Some(resource),
            None if shared => {
                let object: Arc<dyn Resource> =
                    Arc::new(MemoryObject::new("anon-shared", len, self.ctx.frames.clone()));
                Some(object)
            }
            None => None,
        };
        let global = match (&resource, shared) {
            (Some(res), true) => Some(self.ctx.registry.attach(res, offset, len, base)),
            _ => None,
        };
        let backing = match resource {
            Some(res) => Backing::Resource(res),
            None => Backing::Anonymous,
        };
        inner.ranges.push(LocalRange { base, len, offset, prot, flags, backing, global });
        log_debug!(target: "mm", "mmap {}+{:#x} prot={:?} flags={:?}", base, len, prot, flags);
        Ok(base)
    }

    fn find_free(&self, inner: &SpaceInner, len: usize) -> Option<usize> {
        let limit = match self.kind {
            SpaceKind::User => USER_TOP,
            SpaceKind::Kernel => usize::MAX,
        };
        let mut candidate = inner.mmap_base;
        loop {
            let end = candidate.checked_add(len)?;
            if end > limit {
                return None;
            }
            if self.kind == SpaceKind::User
                && candidate < IDENTITY_WINDOW.end
                && IDENTITY_WINDOW.start < end
            {
                candidate = IDENTITY_WINDOW.end;
                continue;
            }
            let blocker =
                inner.ranges.iter().filter(|r| r.overlaps(candidate, end)).map(LocalRange::end).max();
            match blocker {
                Some(next) => candidate = align_up(next)?,
                None => return Some(candidate),
            }
        }
    }

    /// Removes `[addr, addr+len)` from every range, splitting as needed, and
    /// unmaps the resident pages in it.
    pub fn munmap(&self, addr: VirtAddr, len: usize) -> Result<(), AddressSpaceError> {
        if addr.page_offset() != 0 || len == 0 {
            return Err(AddressSpaceError::InvalidArgs);
        }
        let len = align_up(len).ok_or(AddressSpaceError::InvalidArgs)?;
        let start = addr.raw();
        let end = start.checked_add(len).ok_or(AddressSpaceError::InvalidArgs)?;

        let mut inner = self.inner.lock();
        let mut kept = Vec::with_capacity(inner.ranges.len() + 1);
        for range in core::mem::take(&mut inner.ranges) {
            if !range.overlaps(start, end) {
                kept.push(range);
                continue;
            }
            let cut_start = start.max(range.base.raw());
            let cut_end = end.min(range.end());
            for page in (cut_start..cut_end).step_by(PAGE_SIZE) {
                let _ = inner.table.unmap(page);
            }
            kept.extend(range.slice(range.base.raw(), cut_start));
            kept.extend(range.slice(cut_end, range.end()));
        }
        inner.ranges = kept;
        Ok(())
    }

    /// Changes the protection of `[addr, addr+len)` in the ranges and in
    /// every resident leaf.
    pub fn protect(&self, addr: VirtAddr, len: usize, prot: Prot) -> Result<(), AddressSpaceError> {
        if addr.page_offset() != 0 || len == 0 || prot.is_empty() {
            return Err(AddressSpaceError::InvalidArgs);
        }
        if prot.contains(Prot::WRITE | Prot::EXEC) {
            return Err(MapError::PermissionDenied.into());
        }
        let len = align_up(len).ok_or(AddressSpaceError::InvalidArgs)?;
        let start = addr.raw();
        let end = start.checked_add(len).ok_or(AddressSpaceError::InvalidArgs)?;
        let flags = self.leaf_flags(prot.page_flags(false));

        let mut inner = self.inner.lock();
        if !inner.ranges.iter().any(|r| r.overlaps(start, end)) {
            return Err(MapError::NotMapped.into());
        }
        let mut updated = Vec::with_capacity(inner.ranges.len() + 2);
        for range in core::mem::take(&mut inner.ranges) {
            if !range.overlaps(start, end) {
                updated.push(range);
                continue;
            }
            let cut_start = start.max(range.base.raw());
            let cut_end = end.min(range.end());
            updated.extend(range.slice(range.base.raw(), cut_start));
            if let Some(mut middle) = range.slice(cut_start, cut_end) {
                middle.prot = prot;
                updated.push(middle);
            }
            updated.extend(range.slice(cut_end, range.end()));
            for page in (cut_start..cut_end).step_by(PAGE_SIZE) {
                match inner.table.set_leaf_flags(page, flags) {
                    Ok(()) | Err(MapError::NotMapped) => {}
                    Err(err) => return Err(err.into()),
                }
            }
        }
        inner.ranges = updated;
        Ok(())
    }

    /// First registered range containing `addr`.
    pub fn addr2range(&self, addr: VirtAddr) -> Option<RangeHit> {
        find_range(&self.inner.lock().ranges, addr)
    }

    /// Resolves a fault at `addr` by installing the page its range supplies.
    pub fn resolve_fault(
        &self,
        addr: VirtAddr,
        access: Access,
    ) -> Result<FaultResolution, FaultError> {
        let mut inner = self.inner.lock();
        self.resolve_locked(&mut inner, addr, access)
    }

    fn resolve_locked(
        &self,
        inner: &mut SpaceInner,
        addr: VirtAddr,
        access: Access,
    ) -> Result<FaultResolution, FaultError> {
        let hit = find_range(&inner.ranges, addr).ok_or(FaultError::NoRange)?;
        if !prot_allows(hit.range.prot, access) {
            return Err(FaultError::AccessDenied);
        }
        let page = hit.mem_page.raw();
        if let Some(entry) = inner.table.lookup(page) {
            return if leaf_allows(Leaf::decode(entry).flags, access) {
                Ok(FaultResolution::AlreadyMapped)
            } else {
                Err(FaultError::AccessDenied)
            };
        }

        let flags = self.leaf_flags(hit.range.prot.page_flags(false));
        let frames = &self.ctx.frames;
        let (pa, owned) = match &hit.range.backing {
            Backing::Anonymous => (frames.alloc_zeroed().ok_or(FaultError::OutOfFrames)?, true),
            Backing::Resource(resource) => {
                let mode = hit.range.flags & (MapFlags::SHARED | MapFlags::PRIVATE);
                let page = resource.mmap(hit.file_page, mode)?;
                (page.pa, page.owned)
            }
        };
        let flags = if owned { flags | PageFlags::OWNED } else { flags };
        if let Err(err) = inner.table.map(page, pa, flags) {
            if owned {
                frames.free_frames(pa, 1);
            }
            return Err(FaultError::Mapping(err));
        }
        log_trace!(target: "mm", "fault {} -> {} ({:?})", hit.mem_page, pa, access);
        Ok(FaultResolution::Mapped(pa))
    }

    /// Frame behind `va`, faulting it in when absent.
    fn user_frame(&self, va: VirtAddr, access: Access) -> Result<PhysAddr, AddressSpaceError> {
        let mut inner = self.inner.lock();
        let page = va.page_base();
        match inner.table.lookup(page.raw()) {
            Some(entry) if leaf_allows(Leaf::decode(entry).flags, access) => {
                Ok(Leaf::decode(entry).pa)
            }
            Some(_) => Err(FaultError::AccessDenied.into()),
            None => {
                let _ = self.resolve_locked(&mut inner, page, access)?;
                inner
                    .table
                    .translate(page.raw())
                    .ok_or(AddressSpaceError::Mapping(MapError::NotMapped))
            }
        }
    }

    /// Copies `data` into this space at `va`, demand-faulting missing pages.
    pub fn copy_to_user(&self, va: VirtAddr, data: &[u8]) -> Result<(), AddressSpaceError> {
        let mut done = 0;
        while done < data.len() {
            let cursor = va.checked_add(done).ok_or(MapError::OutOfRange)?;
            let chunk = (PAGE_SIZE - cursor.page_offset()).min(data.len() - done);
            let pa = self.user_frame(cursor, Access::Write)?;
            if !self.ctx.frames.write_bytes(pa, cursor.page_offset(), &data[done..done + chunk]) {
                return Err(MapError::OutOfRange.into());
            }
            done += chunk;
        }
        Ok(())
    }

    /// Copies bytes at `va` out of this space into `buf`.
    pub fn copy_from_user(&self, va: VirtAddr, buf: &mut [u8]) -> Result<(), AddressSpaceError> {
        let mut done = 0;
        while done < buf.len() {
            let cursor = va.checked_add(done).ok_or(MapError::OutOfRange)?;
            let chunk = (PAGE_SIZE - cursor.page_offset()).min(buf.len() - done);
            let pa = self.user_frame(cursor, Access::Read)?;
            if !self.ctx.frames.read_bytes(pa, cursor.page_offset(), &mut buf[done..done + chunk]) {
                return Err(MapError::OutOfRange.into());
            }
            done += chunk;
        }
        Ok(())
    }

    /// Snapshot of the registered ranges in registration order.
    pub fn ranges(&self) -> Vec<LocalRange> {
        self.inner.lock().ranges.clone()
    }

    /// Number of resident user-half pages.
    pub fn resident_pages(&self) -> usize {
        let mut count = 0;
        self.inner.lock().table.for_each_user_leaf(|_, _| count += 1);
        count
    }

    pub fn table_pages(&self) -> usize {
        self.inner.lock().table.table_pages()
    }

    /// Raw root entry, used to check that kernel slots are shared.
    pub fn root_entry(&self, index: usize) -> Option<usize> {
        self.inner.lock().table.root_entry(index)
    }
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        if self.asid != SHARED_ASID {
            self.ctx.asids.lock().free(self.asid);
        }
    }
}

impl core::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("kind", &self.kind)
            .field("asid", &self.asid)
            .field("root", &self.root)
            .finish()
    }
}

fn allocate_asid(ctx: &MemoryContext) -> u16 {
    match ctx.asids.lock().allocate() {
        Some(asid) => asid,
        None => {
            log_warn!(target: "mm", "ASIDs exhausted; sharing ASID {}", SHARED_ASID);
            SHARED_ASID
        }
    }
}

fn find_range(ranges: &[LocalRange], addr: VirtAddr) -> Option<RangeHit> {
    let range = ranges.iter().find(|range| range.contains(addr.raw()))?;
    let mem_page = addr.page_base();
    Some(RangeHit { file_page: range.file_page(mem_page.raw()), mem_page, range: range.clone() })
}

fn prot_allows(prot: Prot, access: Access) -> bool {
    match access {
        Access::Read => prot.intersects(Prot::READ | Prot::WRITE),
        Access::Write => prot.contains(Prot::WRITE),
        Access::Execute => prot.contains(Prot::EXEC),
    }
}

fn leaf_allows(flags: PageFlags, access: Access) -> bool {
    match access {
        Access::Read => flags.contains(PageFlags::READ),
        Access::Write => flags.contains(PageFlags::WRITE),
        Access::Execute => flags.contains(PageFlags::EXECUTE),
    }
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
fn map_kernel_segments(table: &mut PageTable) -> Result<(), MapError> {
    extern "C" {
        static __text_start: u8;
        static __text_end: u8;
        static __frames_end: u8;
    }

    // SAFETY: linker-provided symbols; only their addresses are taken.
    let (text_start, text_end, image_end) = unsafe {
        (
            align_down(&__text_start as *const u8 as usize),
            align_up(&__text_end as *const u8 as usize).ok_or(MapError::OutOfRange)?,
            align_up(&__frames_end as *const u8 as usize).ok_or(MapError::OutOfRange)?,
        )
    };
    if text_end <= text_start || image_end < text_end || image_end > IDENTITY_WINDOW.end {
        return Err(MapError::OutOfRange);
    }
    let rx = PageFlags::VALID | PageFlags::READ | PageFlags::EXECUTE | PageFlags::GLOBAL;
    let rw = PageFlags::VALID | PageFlags::READ | PageFlags::WRITE | PageFlags::GLOBAL;
    map_identity_range(table, text_start, text_end, rx)?;
    // Data, stacks, heap and the frame pool: the pool is reached through its
    // physical address, so it must stay identity-mapped.
    map_identity_range(table, text_end, image_end, rw)?;

    const UART_LEN: usize = 0x1000;
    let uart = PhysAddr::new(crate::uart::UART0_PHYS);
    table.map(KERNEL_UART_VA, uart, rw)?;
    // Identity alias keeps early diagnostics working until the console is relocated.
    map_identity_range(table, uart.raw(), uart.raw() + UART_LEN, rw)?;
    log_info!(target: "mm", "map kernel segments ok");
    Ok(())
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
fn map_identity_range(
    table: &mut PageTable,
    start: usize,
    end: usize,
    flags: PageFlags,
) -> Result<(), MapError> {
    for addr in (start..end).step_by(PAGE_SIZE) {
        table.map(addr, PhysAddr::new(addr), flags)?;
    }
    Ok(())
}

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
fn map_kernel_segments(_table: &mut PageTable) -> Result<(), MapError> {
    Ok(())
}

static_assertions::assert_impl_all!(AddressSpace: Send, Sync);

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::phys::FramePool;

    fn setup() -> (Arc<FramePool>, MemoryContext, AddressSpace) {
        let pool = Arc::new(FramePool::host(1024));
        let ctx = MemoryContext::new(pool.clone());
        let kernel = AddressSpace::new_kernel(&ctx).expect("kernel space");
        (pool, ctx, kernel)
    }

    fn va(raw: usize) -> VirtAddr {
        VirtAddr::new(raw).expect("canonical")
    }

    const RW: Prot = Prot::READ.union(Prot::WRITE);
    const ANON: MapFlags = MapFlags::PRIVATE.union(MapFlags::ANONYMOUS);

    #[test]
    fn allocate_unique_asids() {
        let mut asids = AsidAllocator::new();
        let mut seen = alloc::collections::BTreeSet::new();
        for _ in 0..(MAX_ASIDS - 1) {
            let asid = asids.allocate().expect("allocate");
            assert_ne!(asid, 0);
            assert!(seen.insert(asid));
        }
        assert_eq!(asids.allocate(), None);
        asids.free(7);
        assert_eq!(asids.allocate(), Some(7));
    }

    #[test]
    fn satp_encodes_mode_asid_and_root() {
        let (_pool, ctx, kernel) = setup();
        let user = AddressSpace::new_user(&ctx, &kernel, 0x10_0000_0000).expect("user");
        let satp = user.satp_value();
        assert_eq!(satp >> 60, 8);
        assert_eq!((satp >> 44) & 0xffff, user.asid() as usize);
        assert_eq!(satp & ((1 << 44) - 1), user.root().ppn());
        assert_eq!(kernel.asid(), 0);
    }

    #[test]
    fn user_space_rejects_kernel_and_identity_addresses() {
        let (pool, ctx, kernel) = setup();
        let user = AddressSpace::new_user(&ctx, &kernel, 0x10_0000_0000).expect("user");
        let frame = pool.alloc_zeroed().expect("frame");
        let flags = PageFlags::VALID | PageFlags::READ;
        assert_eq!(
            user.map_mem(va(0xffff_ffc0_0000_0000), frame, flags),
            Err(AddressSpaceError::Mapping(MapError::OutOfRange))
        );
        assert_eq!(
            user.map_mem(va(0x8000_0000), frame, flags),
            Err(AddressSpaceError::Mapping(MapError::OutOfRange))
        );
        assert!(user.map_mem(va(0x4000_0000), frame, flags).is_ok());
        assert_eq!(user.virt2phys(va(0x4000_0010)), Some(frame.add(0x10)));
    }

    #[test]
    fn first_fit_placement_skips_taken_ranges() {
        let (_pool, ctx, kernel) = setup();
        let user = AddressSpace::new_user(&ctx, &kernel, 0x10_0000).expect("user");
        let a = user.mmap(None, PAGE_SIZE, RW, ANON, None, 0).expect("a");
        let b = user.mmap(None, 3 * PAGE_SIZE, RW, ANON, None, 0).expect("b");
        assert_eq!(a.raw(), 0x10_0000);
        assert_eq!(b.raw(), 0x10_0000 + PAGE_SIZE);
        user.munmap(a, PAGE_SIZE).expect("munmap");
        let c = user.mmap(None, PAGE_SIZE, RW, ANON, None, 0).expect("c");
        assert_eq!(c, a);
    }

    #[test]
    fn placement_never_enters_identity_window() {
        let (_pool, ctx, kernel) = setup();
        let user = AddressSpace::new_user(&ctx, &kernel, IDENTITY_WINDOW.start - PAGE_SIZE)
            .expect("user");
        let base = user.mmap(None, 2 * PAGE_SIZE, RW, ANON, None, 0).expect("mmap");
        assert_eq!(base.raw(), IDENTITY_WINDOW.end);
    }

    #[test]
    fn mmap_rejects_inconsistent_requests() {
        let (_pool, ctx, kernel) = setup();
        let user = AddressSpace::new_user(&ctx, &kernel, 0x10_0000).expect("user");
        assert_eq!(
            user.mmap(None, 0, RW, ANON, None, 0),
            Err(AddressSpaceError::InvalidArgs)
        );
        assert_eq!(
            user.mmap(None, PAGE_SIZE, RW, MapFlags::SHARED | MapFlags::PRIVATE, None, 0),
            Err(AddressSpaceError::InvalidArgs)
        );
        assert_eq!(
            user.mmap(None, PAGE_SIZE, Prot::WRITE | Prot::EXEC, ANON, None, 0),
            Err(AddressSpaceError::Mapping(MapError::PermissionDenied))
        );
    }

    #[test]
    fn munmap_splits_ranges_and_unmaps_pages() {
        let (pool, ctx, kernel) = setup();
        let user = AddressSpace::new_user(&ctx, &kernel, 0x10_0000).expect("user");
        let base = user.mmap(None, 4 * PAGE_SIZE, RW, ANON, None, 0).expect("mmap");
        for page in 0..4 {
            let addr = base.checked_add(page * PAGE_SIZE).expect("addr");
            assert!(user.resolve_fault(addr, Access::Write).is_ok());
        }
        let free_before = pool.free_count();
        let hole = base.checked_add(PAGE_SIZE).expect("hole");
        user.munmap(hole, 2 * PAGE_SIZE).expect("munmap");
        assert_eq!(pool.free_count(), free_before + 2);
        let ranges = user.ranges();
        assert_eq!(ranges.len(), 2);
        assert_eq!(ranges[0].len, PAGE_SIZE);
        assert_eq!(ranges[1].base.raw(), base.raw() + 3 * PAGE_SIZE);
        assert!(user.addr2range(hole).is_none());
        assert_eq!(user.resolve_fault(hole, Access::Read), Err(FaultError::NoRange));
    }

    #[test]
    fn anonymous_fault_maps_zeroed_owned_page() {
        let (_pool, ctx, kernel) = setup();
        let user = AddressSpace::new_user(&ctx, &kernel, 0x10_0000).expect("user");
        let base = user.mmap(None, PAGE_SIZE, RW, ANON, None, 0).expect("mmap");
        let addr = base.checked_add(0x123).expect("addr");
        let Ok(FaultResolution::Mapped(_)) = user.resolve_fault(addr, Access::Write) else {
            panic!("fault not resolved");
        };
        let flags = Leaf::decode(user.virt2pte(addr).expect("pte")).flags;
        assert!(flags.contains(PageFlags::READ | PageFlags::WRITE | PageFlags::USER | PageFlags::OWNED));
        let mut buf = [0xffu8; 16];
        user.copy_from_user(addr, &mut buf).expect("read");
        assert_eq!(buf, [0u8; 16]);
        assert_eq!(user.resolve_fault(addr, Access::Read), Ok(FaultResolution::AlreadyMapped));
    }

    #[test]
    fn write_fault_on_read_only_range_is_denied() {
        let (_pool, ctx, kernel) = setup();
        let user = AddressSpace::new_user(&ctx, &kernel, 0x10_0000).expect("user");
        let base = user.mmap(None, PAGE_SIZE, Prot::READ, ANON, None, 0).expect("mmap");
        assert_eq!(user.resolve_fault(base, Access::Write), Err(FaultError::AccessDenied));
        assert!(user.resolve_fault(base, Access::Read).is_ok());
        assert_eq!(user.resolve_fault(base, Access::Execute), Err(FaultError::AccessDenied));
    }

    #[test]
    fn protect_updates_range_and_resident_leaf() {
        let (_pool, ctx, kernel) = setup();
        let user = AddressSpace::new_user(&ctx, &kernel, 0x10_0000).expect("user");
        let base = user.mmap(None, 2 * PAGE_SIZE, RW, ANON, None, 0).expect("mmap");
        user.copy_to_user(base, b"data").expect("write");
        user.protect(base, PAGE_SIZE, Prot::READ).expect("protect");
        let flags = Leaf::decode(user.virt2pte(base).expect("pte")).flags;
        assert!(!flags.contains(PageFlags::WRITE));
        assert!(flags.contains(PageFlags::OWNED));
        assert_eq!(
            user.copy_to_user(base, b"x"),
            Err(AddressSpaceError::Fault(FaultError::AccessDenied))
        );
        assert_eq!(user.ranges().len(), 2);
        let tail = base.checked_add(PAGE_SIZE).expect("tail");
        assert!(user.copy_to_user(tail, b"ok").is_ok());
    }

    #[test]
    fn remap_moves_owned_frame() {
        let (pool, ctx, kernel) = setup();
        let user = AddressSpace::new_user(&ctx, &kernel, 0x10_0000).expect("user");
        let base = user.mmap(None, PAGE_SIZE, RW, ANON, None, 0).expect("mmap");
        user.copy_to_user(base, b"moved").expect("write");
        let pa = user.virt2phys(base).expect("pa");
        let target = va(0x20_0000);
        let flags = Leaf::decode(user.virt2pte(base).expect("pte")).flags & !PageFlags::OWNED;
        user.remap_mem(base, target, flags).expect("remap");
        assert_eq!(user.virt2phys(base), None);
        assert_eq!(user.virt2phys(target), Some(pa));
        let free_before = pool.free_count();
        assert_eq!(user.unmap_mem(target), Ok(pa));
        assert_eq!(pool.free_count(), free_before + 1);
    }

    #[test]
    fn map_range_rolls_back_on_overlap() {
        let (pool, ctx, kernel) = setup();
        let user = AddressSpace::new_user(&ctx, &kernel, 0x10_0000).expect("user");
        let frames = pool.alloc_frames(3).expect("frames");
        let flags = PageFlags::VALID | PageFlags::READ | PageFlags::USER;
        user.map_mem(va(0x42_000), frames.add(2 * PAGE_SIZE), flags).expect("map");
        assert_eq!(
            user.map_range(va(0x40_000), frames, 3 * PAGE_SIZE, flags),
            Err(AddressSpaceError::Mapping(MapError::Overlap))
        );
        assert!(user.virt2pte(va(0x40_000)).is_none());
        assert!(user.virt2pte(va(0x41_000)).is_none());
        assert!(user.virt2pte(va(0x42_000)).is_some());
    }

    #[test]
    fn kernel_space_maps_only_shared_slots() {
        let (pool, _ctx, kernel) = setup();
        let frame = pool.alloc_zeroed().expect("frame");
        let flags = PageFlags::VALID | PageFlags::READ | PageFlags::WRITE;
        assert_eq!(
            kernel.map_mem(va(0x4000_0000), frame, flags),
            Err(AddressSpaceError::Mapping(MapError::OutOfRange))
        );
        assert!(kernel.map_mem(va(KERNEL_MMAP_BASE), frame, flags).is_ok());
        let base = kernel.mmap(None, PAGE_SIZE, RW, ANON, None, 0).expect("mmap");
        assert!(base.is_kernel());
    }

    #[test]
    fn dropping_user_space_returns_every_frame() {
        let (pool, ctx, kernel) = setup();
        let free_before = pool.free_count();
        {
            let user = AddressSpace::new_user(&ctx, &kernel, 0x10_0000).expect("user");
            let base = user.mmap(None, 8 * PAGE_SIZE, RW, ANON, None, 0).expect("mmap");
            user.copy_to_user(base, &[1u8; 8 * PAGE_SIZE]).expect("fill");
            assert_eq!(user.resident_pages(), 8);
        }
        assert_eq!(pool.free_count(), free_before);
    }
}
