// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Recording HAL for host builds.
//!
//! Every hook stores what it was asked to do so tests can assert on address
//! space switches, timer re-arms and yield requests. `start_core` runs the
//! common core initializer synchronously.

extern crate alloc;

use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, AtomicUsize, Ordering};

use spin::Mutex;

use super::{CoreStart, Hal, HalError, PerCoreState};
use crate::{arch::FpuKind, smp::MAX_CPUS, types::CpuId};

const NOT_ARMED: u64 = u64::MAX;

#[derive(Default)]
struct HostCore {
    satp: AtomicUsize,
    trap_stack_top: AtomicUsize,
    thread_stack_top: AtomicUsize,
    armed_ms: AtomicU64,
    arm_count: AtomicUsize,
    yields: AtomicUsize,
    tables_loaded: AtomicBool,
    syscalls_enabled: AtomicBool,
}

/// HAL backend that records hardware requests instead of performing them.
pub struct HostHal {
    current: AtomicU16,
    present: usize,
    fpu: FpuKind,
    irq_depth: AtomicUsize,
    cores: [HostCore; MAX_CPUS],
    started: Mutex<Vec<CpuId>>,
}

impl HostHal {
    /// Creates a machine with `cores` present cores and a double-precision FPU.
    pub fn new(cores: usize) -> Self {
        Self::with_fpu(cores, FpuKind::Double)
    }

    pub fn with_fpu(cores: usize, fpu: FpuKind) -> Self {
        let hal = Self {
            current: AtomicU16::new(0),
            present: cores.clamp(1, MAX_CPUS),
            fpu,
            irq_depth: AtomicUsize::new(0),
            cores: Default::default(),
            started: Mutex::new(Vec::new()),
        };
        for core in hal.cores.iter() {
            core.armed_ms.store(NOT_ARMED, Ordering::Relaxed);
        }
        hal
    }

    /// Makes subsequent `current_cpu` calls report `cpu`.
    pub fn set_current_cpu(&self, cpu: CpuId) {
        self.current.store(cpu.as_raw(), Ordering::SeqCst);
    }

    fn core(&self, cpu: CpuId) -> &HostCore {
        &self.cores[cpu.as_index() % MAX_CPUS]
    }

    /// Last `satp` value loaded on `cpu`.
    pub fn satp(&self, cpu: CpuId) -> usize {
        self.core(cpu).satp.load(Ordering::SeqCst)
    }

    pub fn per_core_state(&self, cpu: CpuId) -> PerCoreState {
        let core = self.core(cpu);
        PerCoreState {
            trap_stack_top: core.trap_stack_top.load(Ordering::SeqCst),
            thread_stack_top: core.thread_stack_top.load(Ordering::SeqCst),
        }
    }

    /// Timeslice of the most recent arm on `cpu`.
    pub fn armed_ms(&self, cpu: CpuId) -> Option<u64> {
        let ms = self.core(cpu).armed_ms.load(Ordering::SeqCst);
        (ms != NOT_ARMED).then_some(ms)
    }

    pub fn arm_count(&self, cpu: CpuId) -> usize {
        self.core(cpu).arm_count.load(Ordering::SeqCst)
    }

    pub fn yield_requests(&self, cpu: CpuId) -> usize {
        self.core(cpu).yields.load(Ordering::SeqCst)
    }

    pub fn tables_loaded(&self, cpu: CpuId) -> bool {
        self.core(cpu).tables_loaded.load(Ordering::SeqCst)
    }

    pub fn syscalls_enabled(&self, cpu: CpuId) -> bool {
        self.core(cpu).syscalls_enabled.load(Ordering::SeqCst)
    }

    /// True while at least one `IrqGuard` is alive.
    pub fn irqs_masked(&self) -> bool {
        self.irq_depth.load(Ordering::SeqCst) > 0
    }

    /// Cores passed to `start_core`, in order.
    pub fn started_cores(&self) -> Vec<CpuId> {
        self.started.lock().clone()
    }
}

impl Hal for HostHal {
    fn current_cpu(&self) -> CpuId {
        CpuId::from_raw(self.current.load(Ordering::SeqCst))
    }

    fn switch_address_space(&self, cpu: CpuId, satp: usize) {
        self.core(cpu).satp.store(satp, Ordering::SeqCst);
    }

    fn set_per_core_state(&self, cpu: CpuId, state: PerCoreState) {
        let core = self.core(cpu);
        core.trap_stack_top.store(state.trap_stack_top, Ordering::SeqCst);
        core.thread_stack_top.store(state.thread_stack_top, Ordering::SeqCst);
    }

    fn arm_timer(&self, cpu: CpuId, ms: u64) {
        let core = self.core(cpu);
        core.armed_ms.store(ms, Ordering::SeqCst);
        core.arm_count.fetch_add(1, Ordering::SeqCst);
    }

    fn detect_fpu(&self, _cpu: CpuId) -> FpuKind {
        self.fpu
    }

    fn irq_save(&self) -> bool {
        self.irq_depth.fetch_add(1, Ordering::SeqCst) == 0
    }

    fn irq_restore(&self, _was_enabled: bool) {
        self.irq_depth.fetch_sub(1, Ordering::SeqCst);
    }

    fn request_yield(&self, cpu: CpuId) {
        self.core(cpu).yields.fetch_add(1, Ordering::SeqCst);
    }

    fn load_descriptor_tables(&self, cpu: CpuId) {
        self.core(cpu).tables_loaded.store(true, Ordering::SeqCst);
    }

    fn enable_syscalls(&self, cpu: CpuId) {
        self.core(cpu).syscalls_enabled.store(true, Ordering::SeqCst);
    }

    fn start_core(&self, start: &CoreStart<'_>) -> Result<(), HalError> {
        if start.cpu.as_index() >= self.present {
            return Err(HalError::NoSuchCore);
        }
        self.started.lock().push(start.cpu);
        start.kernel.init_core(start.cpu, start.trap_stack_top);
        Ok(())
    }

    fn wait_for_interrupt(&self) {
        core::hint::spin_loop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::IrqGuard;

    #[test]
    fn irq_guard_nests() {
        let hal = HostHal::new(1);
        {
            let _outer = IrqGuard::new(&hal);
            {
                let _inner = IrqGuard::new(&hal);
                assert!(hal.irqs_masked());
            }
            assert!(hal.irqs_masked());
        }
        assert!(!hal.irqs_masked());
    }

    #[test]
    fn records_timer_and_yield_requests() {
        let hal = HostHal::new(2);
        let cpu = CpuId::from_raw(1);
        assert_eq!(hal.armed_ms(cpu), None);
        hal.arm_timer(cpu, 10);
        hal.request_yield(cpu);
        assert_eq!(hal.armed_ms(cpu), Some(10));
        assert_eq!(hal.arm_count(cpu), 1);
        assert_eq!(hal.yield_requests(cpu), 1);
        assert_eq!(hal.yield_requests(CpuId::BOOT), 0);
    }
}
