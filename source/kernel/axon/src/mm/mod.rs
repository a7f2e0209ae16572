// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Virtual memory subsystem (Sv39 tables, address spaces, mapping ranges, demand paging)
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module + mm/tests.rs + tests/memory.rs
//! PUBLIC API: PAGE_SIZE, PageTable, AddressSpace, FrameAllocator, FramePool, Resource, mapping::*
//! DEPENDS_ON: bitflags, spin
//! INVARIANTS: Page-table pages are allocator frames; kernel half identical in every address space

pub mod address_space;
pub mod fault;
pub mod mapping;
pub mod page_table;
pub mod phys;
pub mod resource;

/// Size of a page in bytes.
pub const PAGE_SIZE: usize = 4096;

pub use address_space::{
    AddressSpace, AddressSpaceError, AsidAllocator, FaultError, FaultResolution, MemoryContext,
};
pub use mapping::{Backing, GlobalRange, LocalRange, MapFlags, Prot, RangeHit, RangeRegistry};
pub use page_table::{MapError, PageFlags, PageTable};
pub use phys::{FrameAllocator, FramePool};
pub use resource::{MemoryObject, Resource, ResourceError, ResourcePage};

/// Kind of memory access that triggered a fault or a user copy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
    Execute,
}

#[inline]
pub(crate) const fn align_down(addr: usize) -> usize {
    addr & !(PAGE_SIZE - 1)
}

#[inline]
pub(crate) fn align_up(addr: usize) -> Option<usize> {
    addr.checked_add(PAGE_SIZE - 1).map(align_down)
}
