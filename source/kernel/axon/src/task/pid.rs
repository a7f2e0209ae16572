// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: PID bitmap and RAII leases
//! OWNERS: @kernel-sched-team
//! PUBLIC API: MAX_PIDS, PidAllocator, PidLease
//! INVARIANTS: PID 0 is reserved; a PID is free again only once its lease drops

extern crate alloc;

use alloc::sync::Arc;

use spin::Mutex;

use crate::types::Pid;

/// Compile-time ceiling on concurrently live PIDs (PID 0 included).
pub const MAX_PIDS: usize = 1024;
const WORD_BITS: usize = u64::BITS as usize;
const BITMAP_WORDS: usize = MAX_PIDS / WORD_BITS;

struct PidBitmap {
    bits: [u64; BITMAP_WORDS],
    limit: usize,
    next: usize,
}

impl PidBitmap {
    fn allocate(&mut self) -> Option<Pid> {
        for _ in 0..self.limit {
            let index = self.next;
            self.next = if index + 1 >= self.limit { 1 } else { index + 1 };
            let (word, bit) = (index / WORD_BITS, index % WORD_BITS);
            if self.bits[word] & (1 << bit) == 0 {
                self.bits[word] |= 1 << bit;
                return Some(Pid::from_raw(index as u32));
            }
        }
        None
    }

    fn release(&mut self, pid: Pid) {
        let index = pid.as_index();
        if index == 0 || index >= self.limit {
            return;
        }
        self.bits[index / WORD_BITS] &= !(1 << (index % WORD_BITS));
    }

    fn in_use(&self, pid: Pid) -> bool {
        let index = pid.as_index();
        index < self.limit && self.bits[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }
}

/// Shared PID bitmap. Cloning yields another handle to the same bitmap.
#[derive(Clone)]
pub struct PidAllocator {
    bitmap: Arc<Mutex<PidBitmap>>,
}

impl PidAllocator {
    /// Creates an allocator handing out PIDs `1..limit`.
    pub fn new(limit: usize) -> Self {
        let mut bits = [0u64; BITMAP_WORDS];
        bits[0] |= 1;
        let limit = limit.clamp(2, MAX_PIDS);
        Self { bitmap: Arc::new(Mutex::new(PidBitmap { bits, limit, next: 1 })) }
    }

    /// Reserves the next free PID (round-robin from the last grant).
    pub fn allocate(&self) -> Option<PidLease> {
        let pid = self.bitmap.lock().allocate()?;
        Some(PidLease { pid, owner: self.clone() })
    }

    pub fn in_use(&self, pid: Pid) -> bool {
        self.bitmap.lock().in_use(pid)
    }
}

/// Reservation of one PID, released on drop.
pub struct PidLease {
    pid: Pid,
    owner: PidAllocator,
}

impl PidLease {
    #[inline]
    pub fn pid(&self) -> Pid {
        self.pid
    }
}

impl Drop for PidLease {
    fn drop(&mut self) {
        self.owner.bitmap.lock().release(self.pid);
    }
}

impl core::fmt::Debug for PidLease {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_tuple("PidLease").field(&self.pid).finish()
    }
}
