// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Newtypes shared by the memory and scheduling layers
//! OWNERS: @kernel-team
//! PUBLIC API: VirtAddr, PhysAddr, Pid, Tid, CpuId, HartId
//! DEPENDS_ON: mm::page_table::is_canonical_sv39, PAGE_SIZE
//! INVARIANTS: VirtAddr is canonical Sv39; PhysAddr is the only handle to a frame
//!
//! Newtypes keep PIDs, TIDs and CPU numbers from being mixed up, and make
//! it impossible to hand a virtual address to code expecting a frame.

use core::fmt;

use crate::mm::{page_table::is_canonical_sv39, PAGE_SIZE};

/// Canonical Sv39 virtual address.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct VirtAddr(usize);

impl VirtAddr {
    #[inline]
    pub fn new(addr: usize) -> Option<Self> {
        if is_canonical_sv39(addr) {
            Some(Self(addr))
        } else {
            None
        }
    }

    #[inline]
    pub fn page_aligned(addr: usize) -> Option<Self> {
        Self::new(addr).filter(|va| va.0 % PAGE_SIZE == 0)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Rounds down to the containing page.
    #[inline]
    pub const fn page_base(self) -> Self {
        Self(self.0 & !(PAGE_SIZE - 1))
    }

    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }

    #[inline]
    pub fn checked_add(self, v: usize) -> Option<Self> {
        self.0.checked_add(v).and_then(Self::new)
    }

    /// True when the address lies in the kernel (upper) half.
    #[inline]
    pub const fn is_kernel(self) -> bool {
        (self.0 >> 38) & 1 == 1
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Physical address of a frame (or a byte inside one).
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct PhysAddr(usize);

impl PhysAddr {
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn ppn(self) -> usize {
        self.0 / PAGE_SIZE
    }

    #[inline]
    pub const fn from_ppn(ppn: usize) -> Self {
        Self(ppn * PAGE_SIZE)
    }

    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.0 % PAGE_SIZE == 0
    }

    #[inline]
    pub const fn add(self, bytes: usize) -> Self {
        Self(self.0 + bytes)
    }
}

impl fmt::Display for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

/// Process identifier.
///
/// **Ownership**: PIDs are leased from `task::pid::PidAllocator`; the lease is
/// held by the owning `Process` and returned when the Process is dropped.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Pid(u32);

impl Pid {
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    #[inline]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Thread identifier, unique within its Process and never reused.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Tid(u32);

impl Tid {
    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Hardware hart identifier as reported by firmware.
///
/// Kept distinct from `CpuId` so call-sites cannot mix hardware identity with
/// the logical index used for per-core tables.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct HartId(u16);

impl HartId {
    #[inline]
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u16 {
        self.0
    }

    #[inline]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }
}

/// Logical CPU identifier used by the dispatcher and per-core state.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct CpuId(u16);

impl CpuId {
    pub const BOOT: Self = Self(0);

    #[inline]
    pub const fn from_raw(raw: u16) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn from_hart(hart: HartId) -> Self {
        Self(hart.as_raw())
    }

    #[inline]
    pub const fn as_raw(self) -> u16 {
        self.0
    }

    #[inline]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }

    #[inline]
    pub const fn is_boot(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Display for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_non_canonical_addresses() {
        assert!(VirtAddr::new(1usize << 40).is_none());
        assert!(VirtAddr::new(0xffff_ffc0_0000_0000).is_some());
        assert!(VirtAddr::page_aligned(0x1001).is_none());
    }

    #[test]
    fn kernel_half_detection() {
        assert!(VirtAddr::new(0xffff_ffc0_0000_1000).map(VirtAddr::is_kernel).unwrap_or(false));
        assert!(!VirtAddr::new(0x4000_0000).map(VirtAddr::is_kernel).unwrap_or(true));
    }

    #[test]
    fn page_helpers() {
        let va = VirtAddr::new(0x1234).expect("canonical");
        assert_eq!(va.page_base().raw(), 0x1000);
        assert_eq!(va.page_offset(), 0x234);
        assert_eq!(PhysAddr::from_ppn(3).raw(), 3 * PAGE_SIZE);
    }
}
