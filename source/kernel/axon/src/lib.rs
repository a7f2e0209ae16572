// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: AXON scheduler and virtual-memory core
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Host unit tests, proptest suites, tests/ scenarios
//! PUBLIC API: Kernel, KernelConfig, mm::*, task::*, sched::*, timer, smp, hal::Hal
//! DEPENDS_ON: spin, bitflags, static_assertions, riscv (target), sbi-rt (target)
//! INVARIANTS: Hardware access confined to hal/arch; lock order table -> AS -> registry -> resource

#![cfg_attr(not(test), no_std)]
#![cfg_attr(not(test), forbid(clippy::unwrap_used))]

extern crate alloc;

#[macro_use]
pub mod diag;

pub mod arch;
pub mod config;
pub mod hal;
pub mod kernel;
pub mod mm;
pub mod sched;
pub mod smp;
pub mod task;
pub mod timer;
pub mod trap;
pub mod types;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
mod uart;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub mod boot;
#[cfg(all(target_arch = "riscv64", target_os = "none", feature = "panic_handler"))]
mod panic;

pub use config::KernelConfig;
pub use kernel::Kernel;
pub use types::{CpuId, Pid, PhysAddr, Tid, VirtAddr};
