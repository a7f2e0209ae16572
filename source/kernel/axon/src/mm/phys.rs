// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Physical frame allocation contract and the in-kernel bitmap pool
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below; exercised by every mm test through FramePool::host
//! PUBLIC API: FrameAllocator (trait), FramePool
//! DEPENDS_ON: spin::Mutex, alloc::alloc (host arena)
//! INVARIANTS: A frame is handed out at most once until freed; frame_ptr is valid for PAGE_SIZE bytes
//!
//! The pool keeps a direct map from physical address to a kernel pointer.
//! On the bare-metal target that map is the identity; host builds back the
//! pool with a page-aligned heap arena and translate through it.

extern crate alloc;

use alloc::{vec, vec::Vec};
use core::ptr::NonNull;
#[cfg(feature = "failpoints")]
use core::sync::atomic::{AtomicBool, Ordering};

use spin::Mutex;

use super::PAGE_SIZE;
use crate::types::PhysAddr;

const WORD_BITS: usize = u64::BITS as usize;

/// Physical base reported by host pools, chosen to look like RAM on virt.
#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
const HOST_PHYS_BASE: usize = 0x8040_0000;

/// Source of physical page frames.
///
/// Implementations must return frames that are not in use anywhere else and
/// must keep `frame_ptr` valid for as long as the frame stays allocated.
pub trait FrameAllocator: Send + Sync {
    /// Allocates `count` physically contiguous frames.
    fn alloc_frames(&self, count: usize) -> Option<PhysAddr>;

    /// Returns frames obtained from `alloc_frames`.
    fn free_frames(&self, base: PhysAddr, count: usize);

    /// Kernel pointer to the first byte of the frame containing `pa`.
    fn frame_ptr(&self, pa: PhysAddr) -> Option<NonNull<u8>>;

    /// Number of frames currently available.
    fn free_count(&self) -> usize;

    /// Allocates one frame and fills it with zeroes.
    fn alloc_zeroed(&self) -> Option<PhysAddr> {
        let pa = self.alloc_frames(1)?;
        if self.zero_frame(pa) {
            Some(pa)
        } else {
            self.free_frames(pa, 1);
            None
        }
    }

    fn zero_frame(&self, pa: PhysAddr) -> bool {
        match self.frame_ptr(pa) {
            Some(ptr) => {
                // SAFETY: `frame_ptr` guarantees PAGE_SIZE writable bytes.
                unsafe { core::ptr::write_bytes(ptr.as_ptr(), 0, PAGE_SIZE) };
                true
            }
            None => false,
        }
    }

    fn copy_frame(&self, dst: PhysAddr, src: PhysAddr) -> bool {
        match (self.frame_ptr(dst), self.frame_ptr(src)) {
            (Some(d), Some(s)) if d != s => {
                // SAFETY: distinct frames, each valid for PAGE_SIZE bytes.
                unsafe { core::ptr::copy_nonoverlapping(s.as_ptr(), d.as_ptr(), PAGE_SIZE) };
                true
            }
            _ => false,
        }
    }

    /// Copies bytes out of a frame starting at `offset`.
    fn read_bytes(&self, pa: PhysAddr, offset: usize, buf: &mut [u8]) -> bool {
        if offset.checked_add(buf.len()).map_or(true, |end| end > PAGE_SIZE) {
            return false;
        }
        match self.frame_ptr(pa) {
            Some(ptr) => {
                // SAFETY: bounds checked above.
                unsafe {
                    core::ptr::copy_nonoverlapping(ptr.as_ptr().add(offset), buf.as_mut_ptr(), buf.len())
                };
                true
            }
            None => false,
        }
    }

    /// Copies bytes into a frame starting at `offset`.
    fn write_bytes(&self, pa: PhysAddr, offset: usize, data: &[u8]) -> bool {
        if offset.checked_add(data.len()).map_or(true, |end| end > PAGE_SIZE) {
            return false;
        }
        match self.frame_ptr(pa) {
            Some(ptr) => {
                // SAFETY: bounds checked above.
                unsafe {
                    core::ptr::copy_nonoverlapping(data.as_ptr(), ptr.as_ptr().add(offset), data.len())
                };
                true
            }
            None => false,
        }
    }
}

struct PoolState {
    bitmap: Vec<u64>,
    free: usize,
    next: usize,
}

impl PoolState {
    fn new(frames: usize) -> Self {
        let words = (frames + WORD_BITS - 1) / WORD_BITS;
        let mut bitmap = vec![0u64; words];
        // Mark the tail bits past `frames` as used so scans never return them.
        for index in frames..words * WORD_BITS {
            bitmap[index / WORD_BITS] |= 1 << (index % WORD_BITS);
        }
        Self { bitmap, free: frames, next: 0 }
    }

    fn is_used(&self, index: usize) -> bool {
        self.bitmap[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }

    fn set(&mut self, index: usize, used: bool) {
        let word = &mut self.bitmap[index / WORD_BITS];
        if used {
            *word |= 1 << (index % WORD_BITS);
        } else {
            *word &= !(1 << (index % WORD_BITS));
        }
    }

    fn take_run(&mut self, total: usize, count: usize) -> Option<usize> {
        if count == 0 || count > self.free {
            return None;
        }
        let mut start = self.next;
        let mut scanned = 0;
        while scanned < total {
            if start + count > total {
                scanned += total - start;
                start = 0;
                continue;
            }
            match (start..start + count).find(|idx| self.is_used(*idx)) {
                Some(used) => {
                    scanned += used + 1 - start;
                    start = used + 1;
                    if start >= total {
                        start = 0;
                    }
                }
                None => {
                    for idx in start..start + count {
                        self.set(idx, true);
                    }
                    self.free -= count;
                    self.next = (start + count) % total;
                    return Some(start);
                }
            }
        }
        None
    }
}

enum PoolMemory {
    /// Physical addresses are directly dereferenceable.
    Direct,
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    Host { arena: NonNull<u8>, layout: core::alloc::Layout },
}

/// Bitmap frame pool over one contiguous physical region.
pub struct FramePool {
    base: PhysAddr,
    frames: usize,
    state: Mutex<PoolState>,
    memory: PoolMemory,
    #[cfg(feature = "failpoints")]
    deny_next: AtomicBool,
}

// SAFETY: the arena pointer is owned by the pool and only handed out per frame;
// bitmap updates are serialized by `state`.
unsafe impl Send for FramePool {}
// SAFETY: see above.
unsafe impl Sync for FramePool {}

impl FramePool {
    /// Creates a pool over an identity-mapped physical region.
    ///
    /// # Safety
    /// `[base, base + frames * PAGE_SIZE)` must be RAM that nothing else uses
    /// and that is accessible at its physical address.
    pub unsafe fn from_region(base: PhysAddr, frames: usize) -> Self {
        Self {
            base,
            frames,
            state: Mutex::new(PoolState::new(frames)),
            memory: PoolMemory::Direct,
            #[cfg(feature = "failpoints")]
            deny_next: AtomicBool::new(false),
        }
    }

    /// Creates a pool backed by a zeroed heap arena (host builds).
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    pub fn host(frames: usize) -> Self {
        let frames = frames.max(1);
        let layout = match core::alloc::Layout::from_size_align(frames * PAGE_SIZE, PAGE_SIZE) {
            Ok(layout) => layout,
            Err(_) => panic!("frame pool: arena of {} frames exceeds address space", frames),
        };
        // SAFETY: layout has non-zero size.
        let raw = unsafe { alloc::alloc::alloc_zeroed(layout) };
        let Some(arena) = NonNull::new(raw) else {
            alloc::alloc::handle_alloc_error(layout);
        };
        Self {
            base: PhysAddr::new(HOST_PHYS_BASE),
            frames,
            state: Mutex::new(PoolState::new(frames)),
            memory: PoolMemory::Host { arena, layout },
            #[cfg(feature = "failpoints")]
            deny_next: AtomicBool::new(false),
        }
    }

    pub fn base(&self) -> PhysAddr {
        self.base
    }

    pub fn total_frames(&self) -> usize {
        self.frames
    }

    /// Forces the next allocation from this pool to fail.
    #[cfg(feature = "failpoints")]
    pub fn deny_next_alloc(&self) {
        self.deny_next.store(true, Ordering::SeqCst);
    }

    fn index_of(&self, pa: PhysAddr) -> Option<usize> {
        let offset = pa.raw().checked_sub(self.base.raw())?;
        let index = offset / PAGE_SIZE;
        (index < self.frames).then_some(index)
    }
}

impl FrameAllocator for FramePool {
    fn alloc_frames(&self, count: usize) -> Option<PhysAddr> {
        #[cfg(feature = "failpoints")]
        if self.deny_next.swap(false, Ordering::SeqCst) {
            log_debug!(target: "mm", "frame pool: failpoint denied {} frame(s)", count);
            return None;
        }
        let index = self.state.lock().take_run(self.frames, count)?;
        Some(self.base.add(index * PAGE_SIZE))
    }

    fn free_frames(&self, base: PhysAddr, count: usize) {
        let Some(first) = self.index_of(base) else {
            log_error!(target: "mm", "frame pool: free of foreign frame {}", base);
            return;
        };
        let mut state = self.state.lock();
        for index in first..(first + count).min(self.frames) {
            if !state.is_used(index) {
                log_error!(target: "mm", "frame pool: double free at index {}", index);
                continue;
            }
            state.set(index, false);
            state.free += 1;
        }
    }

    fn frame_ptr(&self, pa: PhysAddr) -> Option<NonNull<u8>> {
        let index = self.index_of(pa)?;
        match &self.memory {
            PoolMemory::Direct => NonNull::new((self.base.raw() + index * PAGE_SIZE) as *mut u8),
            #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
            PoolMemory::Host { arena, .. } => {
                // SAFETY: index < frames, so the offset stays inside the arena.
                Some(unsafe { NonNull::new_unchecked(arena.as_ptr().add(index * PAGE_SIZE)) })
            }
        }
    }

    fn free_count(&self) -> usize {
        self.state.lock().free
    }
}

impl Drop for FramePool {
    fn drop(&mut self) {
        match &self.memory {
            PoolMemory::Direct => {}
            #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
            PoolMemory::Host { arena, layout } => {
                // SAFETY: allocated in `host` with the same layout.
                unsafe { alloc::alloc::dealloc(arena.as_ptr(), *layout) };
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_distinct_frames_until_exhausted() {
        let pool = FramePool::host(4);
        let frames: Vec<_> = (0..4).filter_map(|_| pool.alloc_frames(1)).collect();
        assert_eq!(frames.len(), 4);
        for (i, a) in frames.iter().enumerate() {
            for b in frames.iter().skip(i + 1) {
                assert_ne!(a, b);
            }
        }
        assert!(pool.alloc_frames(1).is_none());
        pool.free_frames(frames[2], 1);
        assert_eq!(pool.alloc_frames(1), Some(frames[2]));
    }

    #[test]
    fn contiguous_runs_skip_holes() {
        let pool = FramePool::host(8);
        let a = pool.alloc_frames(1).expect("a");
        let b = pool.alloc_frames(1).expect("b");
        pool.free_frames(a, 1);
        let run = pool.alloc_frames(3).expect("run");
        assert!(run.raw() > b.raw());
        assert_eq!(pool.free_count(), 8 - 4);
    }

    #[test]
    fn zeroed_frames_and_byte_access() {
        let pool = FramePool::host(2);
        let pa = pool.alloc_zeroed().expect("frame");
        assert!(pool.write_bytes(pa, 8, b"axon"));
        let mut buf = [0u8; 4];
        assert!(pool.read_bytes(pa, 8, &mut buf));
        assert_eq!(&buf, b"axon");
        assert!(!pool.write_bytes(pa, PAGE_SIZE - 1, b"xx"));
        pool.free_frames(pa, 1);
        let again = pool.alloc_zeroed().expect("frame");
        let mut check = [0xffu8; 4];
        assert!(pool.read_bytes(again, 8, &mut check));
        assert_eq!(check, [0; 4]);
    }

    #[test]
    fn foreign_addresses_have_no_pointer() {
        let pool = FramePool::host(1);
        assert!(pool.frame_ptr(PhysAddr::new(0x1000)).is_none());
    }

    #[cfg(feature = "failpoints")]
    #[test]
    fn failpoint_denies_exactly_one_allocation() {
        let pool = FramePool::host(2);
        pool.deny_next_alloc();
        assert!(pool.alloc_frames(1).is_none());
        assert!(pool.alloc_frames(1).is_some());
    }
}
