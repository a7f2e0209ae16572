// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Run-time kernel knobs handed to `Kernel::new`
//! OWNERS: @kernel-team
//! PUBLIC API: KernelConfig (Default + with_* overrides)
//! DEPENDS_ON: smp::MAX_CPUS, task::{Priority, pid::MAX_PIDS}, timer::TimerMode
//! INVARIANTS: Values are clamped to compile-time ceilings; defaults stable across boots

use crate::{
    mm::PAGE_SIZE,
    smp::MAX_CPUS,
    task::{pid::MAX_PIDS, Priority},
    timer::TimerMode,
};

const DEFAULT_TIMESLICE_LOW_MS: u64 = 5;
const DEFAULT_TIMESLICE_MID_MS: u64 = 10;
const DEFAULT_TIMESLICE_HIGH_MS: u64 = 20;

/// Top of the initial user stack (exclusive), just below the Sv39 user ceiling.
const DEFAULT_USER_STACK_TOP: usize = 0x3f_ffff_0000;
const DEFAULT_USER_STACK_PAGES: usize = 16;
/// First address considered when `mmap` has to pick a placement.
const DEFAULT_MMAP_BASE: usize = 0x10_0000_0000;
const DEFAULT_KERNEL_STACK_PAGES: usize = 4;
const DEFAULT_LEGACY_TICK_MS: u64 = 10;
const DEFAULT_FD_TABLE_SIZE: usize = 64;
const DEFAULT_IDLE_STACK_PAGES: usize = 1;

/// Kernel configuration. Construct with `KernelConfig::default()` and adjust
/// with the `with_*` helpers.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct KernelConfig {
    pub max_cpus: usize,
    /// Timeslice per priority class, indexed by `Priority::index()`.
    pub timeslice_ms: [u64; 3],
    pub max_pids: usize,
    pub user_stack_top: usize,
    pub user_stack_pages: usize,
    pub mmap_base: usize,
    pub kernel_stack_pages: usize,
    pub idle_stack_pages: usize,
    /// Slots in every Process's descriptor table.
    pub fd_table_size: usize,
    pub timer_mode: TimerMode,
    pub legacy_tick_ms: u64,
}

impl Default for KernelConfig {
    fn default() -> Self {
        let timer_mode =
            if cfg!(feature = "legacy_timer") { TimerMode::LegacyGlobal } else { TimerMode::PerCore };
        Self {
            max_cpus: MAX_CPUS,
            timeslice_ms: [
                DEFAULT_TIMESLICE_LOW_MS,
                DEFAULT_TIMESLICE_MID_MS,
                DEFAULT_TIMESLICE_HIGH_MS,
            ],
            max_pids: MAX_PIDS,
            user_stack_top: DEFAULT_USER_STACK_TOP,
            user_stack_pages: DEFAULT_USER_STACK_PAGES,
            mmap_base: DEFAULT_MMAP_BASE,
            kernel_stack_pages: DEFAULT_KERNEL_STACK_PAGES,
            idle_stack_pages: DEFAULT_IDLE_STACK_PAGES,
            fd_table_size: DEFAULT_FD_TABLE_SIZE,
            timer_mode,
            legacy_tick_ms: DEFAULT_LEGACY_TICK_MS,
        }
    }
}

impl KernelConfig {
    pub fn with_max_cpus(mut self, cpus: usize) -> Self {
        self.max_cpus = cpus.clamp(1, MAX_CPUS);
        self
    }

    pub fn with_timeslice(mut self, priority: Priority, ms: u64) -> Self {
        self.timeslice_ms[priority.index()] = ms.max(1);
        self
    }

    pub fn with_max_pids(mut self, pids: usize) -> Self {
        // PID 0 is never handed out.
        self.max_pids = pids.clamp(2, MAX_PIDS);
        self
    }

    pub fn with_user_stack(mut self, top: usize, pages: usize) -> Self {
        self.user_stack_top = top & !(PAGE_SIZE - 1);
        self.user_stack_pages = pages.max(1);
        self
    }

    pub fn with_mmap_base(mut self, base: usize) -> Self {
        self.mmap_base = base & !(PAGE_SIZE - 1);
        self
    }

    pub fn with_kernel_stack_pages(mut self, pages: usize) -> Self {
        self.kernel_stack_pages = pages.max(1);
        self
    }

    pub fn with_fd_table_size(mut self, slots: usize) -> Self {
        self.fd_table_size = slots.max(1);
        self
    }

    pub fn with_timer_mode(mut self, mode: TimerMode) -> Self {
        self.timer_mode = mode;
        self
    }

    /// Returns the timeslice for `priority` in milliseconds.
    #[inline]
    pub fn timeslice_for(&self, priority: Priority) -> u64 {
        self.timeslice_ms[priority.index()]
    }

    #[inline]
    pub fn kernel_stack_bytes(&self) -> usize {
        self.kernel_stack_pages * PAGE_SIZE
    }

    #[inline]
    pub fn idle_stack_bytes(&self) -> usize {
        self.idle_stack_pages * PAGE_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn higher_priority_gets_longer_slice() {
        let cfg = KernelConfig::default();
        assert!(cfg.timeslice_for(Priority::High) > cfg.timeslice_for(Priority::Mid));
        assert!(cfg.timeslice_for(Priority::Mid) > cfg.timeslice_for(Priority::Low));
    }

    #[test]
    fn overrides_are_clamped() {
        let cfg = KernelConfig::default()
            .with_max_cpus(MAX_CPUS + 8)
            .with_max_pids(0)
            .with_timeslice(Priority::Low, 0);
        assert_eq!(cfg.max_cpus, MAX_CPUS);
        assert_eq!(cfg.max_pids, 2);
        assert_eq!(cfg.timeslice_for(Priority::Low), 1);
    }
}
