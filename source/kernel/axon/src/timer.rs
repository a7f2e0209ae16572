// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Preemption trigger (per-core one-shot or legacy global timer)
//! OWNERS: @kernel-sched-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below + tests/scenarios.rs
//! PUBLIC API: TimerMode, PreemptionTimer (yield_after, on_timer_interrupt)
//! DEPENDS_ON: hal::Hal::arm_timer, sched::schedule
//! INVARIANTS: The handler is the only caller of the dispatcher; it does not re-enter on the
//!             same core and re-arms only once the dispatch decision is complete

use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use crate::{config::KernelConfig, hal::Hal, smp::MAX_CPUS, trap::TrapFrame, types::CpuId, Kernel};

/// Source of preemption interrupts.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerMode {
    /// Every core arms its own one-shot timer with its thread's timeslice.
    PerCore,
    /// One periodic timer on the boot core; other cores are kicked with
    /// resched requests on every tick.
    LegacyGlobal,
}

pub struct PreemptionTimer {
    mode: TimerMode,
    legacy_tick_ms: u64,
    in_handler: [AtomicBool; MAX_CPUS],
    ticks: [AtomicU64; MAX_CPUS],
}

impl PreemptionTimer {
    pub fn new(config: &KernelConfig) -> Self {
        Self {
            mode: config.timer_mode,
            legacy_tick_ms: config.legacy_tick_ms.max(1),
            in_handler: [const { AtomicBool::new(false) }; MAX_CPUS],
            ticks: [const { AtomicU64::new(0) }; MAX_CPUS],
        }
    }

    #[inline]
    pub fn mode(&self) -> TimerMode {
        self.mode
    }

    /// Arms the next trigger for `cpu` `ms` milliseconds from now.
    ///
    /// In legacy mode only the boot core owns a timer and it always ticks at
    /// the legacy period.
    pub fn yield_after(&self, hal: &dyn Hal, cpu: CpuId, ms: u64) {
        match self.mode {
            TimerMode::PerCore => hal.arm_timer(cpu, ms.max(1)),
            TimerMode::LegacyGlobal if cpu.is_boot() => hal.arm_timer(cpu, self.legacy_tick_ms),
            TimerMode::LegacyGlobal => {}
        }
    }

    /// Handles a preemption interrupt on `cpu` by running the dispatcher on
    /// `frame`. Returns false when the handler is already active on `cpu`.
    pub fn on_timer_interrupt(&self, kernel: &Kernel, cpu: CpuId, frame: &mut TrapFrame) -> bool {
        let index = cpu.as_index();
        let Some(busy) = self.in_handler.get(index) else {
            log_error!(target: "timer", "tick on unknown cpu {}", cpu);
            return false;
        };
        if busy.swap(true, Ordering::Acquire) {
            log_trace!(target: "timer", "nested tick on cpu {} ignored", cpu);
            return false;
        }

        if self.mode == TimerMode::LegacyGlobal && cpu.is_boot() {
            for other in kernel.online_cores().filter(|other| *other != cpu) {
                let _ = crate::smp::request_resched(kernel, other);
            }
        }

        let dispatch = crate::sched::schedule(kernel, cpu, frame);
        self.ticks[index].fetch_add(1, Ordering::Relaxed);
        self.yield_after(kernel.hal(), cpu, dispatch.timeslice_ms);
        busy.store(false, Ordering::Release);
        true
    }

    /// Preemption interrupts handled on `cpu`.
    pub fn ticks(&self, cpu: CpuId) -> u64 {
        self.ticks.get(cpu.as_index()).map_or(0, |t| t.load(Ordering::Relaxed))
    }

    #[cfg(test)]
    pub(crate) fn enter_for_test(&self, cpu: CpuId) {
        self.in_handler[cpu.as_index()].store(true, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    extern crate alloc;

    use alloc::sync::Arc;

    use super::*;
    use crate::{hal::host::HostHal, mm::FramePool};

    fn kernel(mode: TimerMode, cores: usize) -> (Arc<HostHal>, Kernel) {
        let hal = Arc::new(HostHal::new(cores));
        let config = KernelConfig::default().with_max_cpus(cores).with_timer_mode(mode);
        let kernel =
            Kernel::new(config, hal.clone(), Arc::new(FramePool::host(1024))).expect("kernel");
        (hal, kernel)
    }

    #[test]
    fn per_core_mode_arms_the_requested_slice() {
        let (hal, kernel) = kernel(TimerMode::PerCore, 2);
        kernel.timer().yield_after(kernel.hal(), CpuId::from_raw(1), 20);
        assert_eq!(hal.armed_ms(CpuId::from_raw(1)), Some(20));
    }

    #[test]
    fn legacy_mode_only_arms_boot_core() {
        let (hal, kernel) = kernel(TimerMode::LegacyGlobal, 2);
        kernel.timer().yield_after(kernel.hal(), CpuId::from_raw(1), 20);
        kernel.timer().yield_after(kernel.hal(), CpuId::BOOT, 20);
        assert_eq!(hal.armed_ms(CpuId::from_raw(1)), None);
        assert_eq!(hal.armed_ms(CpuId::BOOT), Some(kernel.config().legacy_tick_ms));
    }

    #[test]
    fn tick_dispatches_and_rearms_last() {
        let (hal, kernel) = kernel(TimerMode::PerCore, 1);
        kernel.init_core(CpuId::BOOT, 0x8000_0000);
        let mut frame = TrapFrame::default();
        assert!(kernel.timer().on_timer_interrupt(&kernel, CpuId::BOOT, &mut frame));
        assert_eq!(hal.arm_count(CpuId::BOOT), 1);
        assert_eq!(hal.armed_ms(CpuId::BOOT), Some(kernel.config().timeslice_ms[0]));
        assert_eq!(kernel.timer().ticks(CpuId::BOOT), 1);
    }

    #[test]
    fn nested_tick_is_ignored() {
        let (hal, kernel) = kernel(TimerMode::PerCore, 1);
        kernel.timer().enter_for_test(CpuId::BOOT);
        let mut frame = TrapFrame::default();
        assert!(!kernel.timer().on_timer_interrupt(&kernel, CpuId::BOOT, &mut frame));
        assert_eq!(hal.arm_count(CpuId::BOOT), 0);
    }

    #[test]
    fn legacy_tick_kicks_other_online_cores() {
        let (hal, kernel) = kernel(TimerMode::LegacyGlobal, 3);
        kernel.init_core(CpuId::BOOT, 0x8000_0000);
        assert_eq!(crate::smp::bring_up(&kernel), 3);
        let mut frame = TrapFrame::default();
        assert!(kernel.timer().on_timer_interrupt(&kernel, CpuId::BOOT, &mut frame));
        assert_eq!(hal.yield_requests(CpuId::from_raw(1)), 1);
        assert_eq!(hal.yield_requests(CpuId::from_raw(2)), 1);
        assert_eq!(hal.yield_requests(CpuId::BOOT), 0);
    }
}
