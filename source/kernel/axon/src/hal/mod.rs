// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Hardware abstraction consumed by the dispatcher, timer, fault and SMP paths
//! OWNERS: @kernel-arch-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: hal::host recording backend drives every host test
//! PUBLIC API: Hal (trait), IrqGuard, CoreStart, PerCoreState, HalError
//! DEPENDS_ON: arch::FpuKind, types::CpuId
//! INVARIANTS: Only hal::virt and arch::riscv touch hardware; every method is callable
//!             with local interrupts disabled

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub mod host;
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub mod virt;

use crate::{arch::FpuKind, types::CpuId, Kernel};

/// Errors reported by HAL operations that can fail.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HalError {
    /// Firmware refused to start the core (raw SBI error code).
    CoreStartFailed(usize),
    /// The core is not present on this machine.
    NoSuchCore,
}

/// Per-core register state installed on every switch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PerCoreState {
    /// Top of the per-core trap stack.
    pub trap_stack_top: usize,
    /// Top of the incoming thread's kernel stack.
    pub thread_stack_top: usize,
}

/// Arguments for starting a secondary core.
pub struct CoreStart<'a> {
    pub cpu: CpuId,
    pub stack_top: usize,
    pub trap_stack_top: usize,
    pub kernel: &'a Kernel,
}

/// Hardware hooks used by the kernel core.
pub trait Hal: Send + Sync {
    /// Logical id of the calling core.
    fn current_cpu(&self) -> CpuId;

    /// Loads the translation root described by `satp` on `cpu`.
    fn switch_address_space(&self, cpu: CpuId, satp: usize);

    fn set_per_core_state(&self, cpu: CpuId, state: PerCoreState);

    /// Arms the one-shot preemption timer of `cpu` to fire after `ms`.
    fn arm_timer(&self, cpu: CpuId, ms: u64);

    /// Probes the floating-point capability of the calling core.
    fn detect_fpu(&self, cpu: CpuId) -> FpuKind;

    /// Masks local interrupts and returns whether they were enabled.
    fn irq_save(&self) -> bool;

    fn irq_restore(&self, was_enabled: bool);

    /// Asks `cpu` to run its dispatcher as soon as possible.
    fn request_yield(&self, cpu: CpuId);

    /// Installs the trap vector of `cpu`.
    fn load_descriptor_tables(&self, cpu: CpuId);

    fn enable_syscalls(&self, cpu: CpuId);

    /// Signals a secondary core into the common initializer.
    fn start_core(&self, start: &CoreStart<'_>) -> Result<(), HalError>;

    fn wait_for_interrupt(&self);
}

/// RAII guard keeping local interrupts masked while alive.
#[must_use = "interrupts are re-enabled when the guard drops"]
pub struct IrqGuard<'a> {
    hal: &'a dyn Hal,
    was_enabled: bool,
}

impl<'a> IrqGuard<'a> {
    pub fn new(hal: &'a dyn Hal) -> Self {
        let was_enabled = hal.irq_save();
        Self { hal, was_enabled }
    }
}

impl Drop for IrqGuard<'_> {
    fn drop(&mut self) {
        self.hal.irq_restore(self.was_enabled);
    }
}
