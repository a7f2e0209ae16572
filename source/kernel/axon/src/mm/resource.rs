// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Backing objects for resource mappings and the in-kernel page-cache object
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below + tests/memory.rs shared-mapping coherence
//! PUBLIC API: Resource (trait), ResourcePage, ResourceError, MemoryObject
//! DEPENDS_ON: mm::phys::FrameAllocator, spin::Mutex
//! INVARIANTS: Shared pages are owned by the resource; private pages are handed to the caller

extern crate alloc;

use alloc::{collections::BTreeMap, string::String, sync::Arc};
use core::fmt;

use spin::Mutex;

use super::{mapping::MapFlags, phys::FrameAllocator, PAGE_SIZE};
use crate::types::PhysAddr;

/// Errors reported by a backing object.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ResourceError {
    /// Operation not implemented by this resource.
    Unsupported,
    /// Page index lies past the end of the object.
    OutOfRange,
    /// No frame could be allocated for the page.
    OutOfFrames,
}

/// Page handed back by [`Resource::mmap`].
#[must_use]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ResourcePage {
    pub pa: PhysAddr,
    /// True for a private copy the mapping now owns.
    pub owned: bool,
}

/// Object that can back a mapping range.
pub trait Resource: Send + Sync {
    /// Materializes page `page` of the object.
    ///
    /// With [`MapFlags::SHARED`] the same frame is returned to every caller;
    /// otherwise a private copy is produced and ownership moves to the caller.
    fn mmap(&self, page: usize, flags: MapFlags) -> Result<ResourcePage, ResourceError>;

    fn read(&self, _offset: usize, _buf: &mut [u8]) -> Result<usize, ResourceError> {
        Err(ResourceError::Unsupported)
    }

    fn write(&self, _offset: usize, _data: &[u8]) -> Result<usize, ResourceError> {
        Err(ResourceError::Unsupported)
    }

    fn name(&self) -> &str {
        "resource"
    }
}

impl fmt::Debug for dyn Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Resource({})", self.name())
    }
}

/// True when both handles refer to the same object.
#[inline]
pub fn same_resource(a: &Arc<dyn Resource>, b: &Arc<dyn Resource>) -> bool {
    core::ptr::eq(Arc::as_ptr(a) as *const u8, Arc::as_ptr(b) as *const u8)
}

/// Page-cache backed memory object.
///
/// Pages materialize zero-filled on first touch and stay cached until the
/// object is dropped.
pub struct MemoryObject {
    name: String,
    len: usize,
    frames: Arc<dyn FrameAllocator>,
    pages: Mutex<BTreeMap<usize, PhysAddr>>,
}

impl MemoryObject {
    pub fn new(name: &str, len: usize, frames: Arc<dyn FrameAllocator>) -> Self {
        Self { name: String::from(name), len, frames, pages: Mutex::new(BTreeMap::new()) }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of pages currently held in the cache.
    pub fn cached_pages(&self) -> usize {
        self.pages.lock().len()
    }

    fn page_count(&self) -> usize {
        (self.len + PAGE_SIZE - 1) / PAGE_SIZE
    }

    fn cached_or_insert(
        &self,
        pages: &mut BTreeMap<usize, PhysAddr>,
        page: usize,
    ) -> Result<PhysAddr, ResourceError> {
        if let Some(pa) = pages.get(&page) {
            return Ok(*pa);
        }
        let pa = self.frames.alloc_zeroed().ok_or(ResourceError::OutOfFrames)?;
        pages.insert(page, pa);
        Ok(pa)
    }

    fn transfer(
        &self,
        offset: usize,
        len: usize,
        mut f: impl FnMut(PhysAddr, usize, core::ops::Range<usize>) -> bool,
    ) -> Result<usize, ResourceError> {
        let end = offset.checked_add(len).ok_or(ResourceError::OutOfRange)?;
        if end > self.len {
            return Err(ResourceError::OutOfRange);
        }
        let mut pages = self.pages.lock();
        let mut cursor = offset;
        while cursor < end {
            let page = cursor / PAGE_SIZE;
            let in_page = cursor % PAGE_SIZE;
            let chunk = (PAGE_SIZE - in_page).min(end - cursor);
            let pa = self.cached_or_insert(&mut pages, page)?;
            let done = cursor - offset;
            if !f(pa, in_page, done..done + chunk) {
                return Err(ResourceError::OutOfRange);
            }
            cursor += chunk;
        }
        Ok(len)
    }
}

impl Resource for MemoryObject {
    fn mmap(&self, page: usize, flags: MapFlags) -> Result<ResourcePage, ResourceError> {
        if page >= self.page_count() {
            return Err(ResourceError::OutOfRange);
        }
        let mut pages = self.pages.lock();
        if flags.contains(MapFlags::SHARED) {
            let pa = self.cached_or_insert(&mut pages, page)?;
            return Ok(ResourcePage { pa, owned: false });
        }
        let copy = self.frames.alloc_frames(1).ok_or(ResourceError::OutOfFrames)?;
        let filled = match pages.get(&page) {
            Some(src) => self.frames.copy_frame(copy, *src),
            None => self.frames.zero_frame(copy),
        };
        if !filled {
            self.frames.free_frames(copy, 1);
            return Err(ResourceError::OutOfRange);
        }
        Ok(ResourcePage { pa: copy, owned: true })
    }

    fn read(&self, offset: usize, buf: &mut [u8]) -> Result<usize, ResourceError> {
        let frames = &self.frames;
        self.transfer(offset, buf.len(), |pa, in_page, range| {
            frames.read_bytes(pa, in_page, &mut buf[range])
        })
    }

    fn write(&self, offset: usize, data: &[u8]) -> Result<usize, ResourceError> {
        let frames = &self.frames;
        self.transfer(offset, data.len(), |pa, in_page, range| {
            frames.write_bytes(pa, in_page, &data[range])
        })
    }

    fn name(&self) -> &str {
        &self.name
    }
}

impl Drop for MemoryObject {
    fn drop(&mut self) {
        for (_, pa) in core::mem::take(&mut *self.pages.lock()) {
            self.frames.free_frames(pa, 1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::phys::FramePool;

    fn object(len: usize) -> (Arc<FramePool>, MemoryObject) {
        let pool = Arc::new(FramePool::host(16));
        let obj = MemoryObject::new("test-object", len, pool.clone());
        (pool, obj)
    }

    #[test]
    fn shared_pages_are_cached() {
        let (_pool, obj) = object(2 * PAGE_SIZE);
        let a = obj.mmap(1, MapFlags::SHARED).expect("page");
        let b = obj.mmap(1, MapFlags::SHARED).expect("page");
        assert_eq!(a, b);
        assert!(!a.owned);
        assert_eq!(obj.cached_pages(), 1);
    }

    #[test]
    fn private_pages_copy_cached_content() {
        let (pool, obj) = object(PAGE_SIZE);
        obj.write(16, b"cached").expect("write");
        let private = obj.mmap(0, MapFlags::PRIVATE).expect("page");
        assert!(private.owned);
        let mut buf = [0u8; 6];
        assert!(pool.read_bytes(private.pa, 16, &mut buf));
        assert_eq!(&buf, b"cached");
        pool.free_frames(private.pa, 1);
    }

    #[test]
    fn pages_past_the_end_are_rejected() {
        let (_pool, obj) = object(PAGE_SIZE);
        assert_eq!(obj.mmap(1, MapFlags::SHARED), Err(ResourceError::OutOfRange));
        assert_eq!(obj.write(PAGE_SIZE - 1, b"xy"), Err(ResourceError::OutOfRange));
    }

    #[test]
    fn drop_returns_cached_frames() {
        let (pool, obj) = object(3 * PAGE_SIZE);
        let _ = obj.mmap(0, MapFlags::SHARED).expect("page");
        let _ = obj.mmap(2, MapFlags::SHARED).expect("page");
        assert_eq!(pool.free_count(), 14);
        drop(obj);
        assert_eq!(pool.free_count(), 16);
    }

    #[test]
    fn reads_span_page_boundaries() {
        let (_pool, obj) = object(2 * PAGE_SIZE);
        let data = [0x5au8; 32];
        obj.write(PAGE_SIZE - 16, &data).expect("write");
        let mut back = [0u8; 32];
        assert_eq!(obj.read(PAGE_SIZE - 16, &mut back), Ok(32));
        assert_eq!(back, data);
    }
}
