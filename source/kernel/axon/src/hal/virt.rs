// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! HAL implementation targeting QEMU's `virt` machine.

use sbi_rt as sbi;

use super::{CoreStart, Hal, HalError, PerCoreState};
use crate::{arch::riscv, arch::FpuKind, types::CpuId};

/// QEMU models a 10 MHz `time` counter.
const TICKS_PER_MS: u64 = 10_000;
const SBI_ERR_ALREADY_AVAILABLE: usize = (-6isize) as usize;
const SBI_ERR_ALREADY_STARTED: usize = (-7isize) as usize;

/// HAL facade for the virt machine.
pub struct VirtHal;

impl VirtHal {
    pub const fn new() -> Self {
        Self
    }
}

impl Hal for VirtHal {
    fn current_cpu(&self) -> CpuId {
        CpuId::from_raw(riscv::read_tp() as u16)
    }

    fn switch_address_space(&self, _cpu: CpuId, satp: usize) {
        riscv::write_satp(satp);
    }

    fn set_per_core_state(&self, cpu: CpuId, state: PerCoreState) {
        riscv::write_per_core(state.trap_stack_top, cpu.as_index());
    }

    fn arm_timer(&self, _cpu: CpuId, ms: u64) {
        let deadline = riscv::read_time().wrapping_add(ms.saturating_mul(TICKS_PER_MS));
        sbi::set_timer(deadline);
        #[cfg(feature = "timer_irq")]
        // SAFETY: the trap vector is installed before the first arm.
        unsafe {
            ::riscv::register::sie::set_stimer();
        }
    }

    fn detect_fpu(&self, _cpu: CpuId) -> FpuKind {
        riscv::probe_fpu()
    }

    fn irq_save(&self) -> bool {
        riscv::irq_save()
    }

    fn irq_restore(&self, was_enabled: bool) {
        riscv::irq_restore(was_enabled)
    }

    fn request_yield(&self, cpu: CpuId) {
        if cpu == self.current_cpu() {
            // Fire the local timer immediately; the trap path runs the dispatcher.
            sbi::set_timer(riscv::read_time());
            return;
        }
        let ret = sbi::send_ipi(1usize << cpu.as_index(), 0);
        if ret.error != 0 {
            log_warn!(target: "hal", "resched ipi to cpu {} failed err={}", cpu, ret.error);
        }
    }

    fn load_descriptor_tables(&self, _cpu: CpuId) {
        riscv::install_trap_vector();
    }

    fn enable_syscalls(&self, _cpu: CpuId) {
        // `ecall` traps land in the shared vector; enabling soft interrupts lets
        // resched IPIs reach the dispatcher.
        riscv::enable_soft_interrupts();
    }

    fn start_core(&self, start: &CoreStart<'_>) -> Result<(), HalError> {
        let entry = riscv::secondary_entry_addr();
        let ret = sbi::hart_start(start.cpu.as_index(), entry, start.stack_top);
        match ret.error {
            0 | SBI_ERR_ALREADY_AVAILABLE | SBI_ERR_ALREADY_STARTED => Ok(()),
            err => Err(HalError::CoreStartFailed(err)),
        }
    }

    fn wait_for_interrupt(&self) {
        riscv::wait_for_interrupt();
    }
}
