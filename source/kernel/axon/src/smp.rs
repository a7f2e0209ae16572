// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Core descriptors and secondary-core bring-up
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below + tests/scenarios.rs (bring-up through HostHal)
//! PUBLIC API: MAX_CPUS, CoreDescriptor, CoreState, bring_up(), request_resched(),
//!             publish_trap_stack(), trap_stack_top(), enter_dispatcher()
//! DEPENDS_ON: hal::Hal (start_core, request_yield), Kernel::init_core, task::KernelStack
//! INVARIANTS: CoreState is only touched with local interrupts masked; cores come up one at a
//!             time; the trap stack of a core is published before the core is started

extern crate alloc;

use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use spin::{Mutex, MutexGuard};

use crate::{
    arch::{FpuKind, FpuOps},
    hal::CoreStart,
    task::{KernelStack, Priority, Thread, ThreadRef},
    types::CpuId,
    Kernel,
};

/// Fixed CPU ceiling for bounded per-core state.
pub const MAX_CPUS: usize = 4;

const TRAP_STACK_BYTES: usize = 16 * 1024;
/// Iterations the boot core waits for a started core to report online.
const ONLINE_SPIN_BUDGET: usize = 50_000_000;

/// Trap stack tops looked up by the secondary entry path, which only knows its hart id.
static TRAP_STACK_TOPS: [AtomicUsize; MAX_CPUS] = [const { AtomicUsize::new(0) }; MAX_CPUS];

/// Mutable per-core scheduling state.
pub struct CoreState {
    /// Thread executing on the core; `None` while idle.
    pub current: Option<ThreadRef>,
    /// Lazily created idle thread.
    pub idle: Option<Thread>,
    pub idle_running: bool,
    /// Resolved once in `Kernel::init_core`.
    pub fpu: Option<FpuOps>,
    pub trap_stack_top: usize,
    // Held for the lifetime of the core; only their addresses are used.
    #[allow(dead_code)]
    exec_stack: Option<KernelStack>,
    #[allow(dead_code)]
    trap_stack: Option<KernelStack>,
}

impl CoreState {
    const fn new() -> Self {
        Self {
            current: None,
            idle: None,
            idle_running: false,
            fpu: None,
            trap_stack_top: 0,
            exec_stack: None,
            trap_stack: None,
        }
    }

    /// FPU routines for this core (no-ops until the core is initialized).
    #[inline]
    pub fn fpu_ops(&self) -> FpuOps {
        self.fpu.unwrap_or_else(|| FpuOps::for_kind(FpuKind::None))
    }
}

/// Per-hardware-thread descriptor owned by the kernel.
pub struct CoreDescriptor {
    cpu: CpuId,
    online: AtomicBool,
    resched_requests: AtomicUsize,
    state: Mutex<CoreState>,
}

impl CoreDescriptor {
    pub const fn new(cpu: CpuId) -> Self {
        Self {
            cpu,
            online: AtomicBool::new(false),
            resched_requests: AtomicUsize::new(0),
            state: Mutex::new(CoreState::new()),
        }
    }

    #[inline]
    pub fn cpu(&self) -> CpuId {
        self.cpu
    }

    #[inline]
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    pub(crate) fn mark_online(&self) {
        if !self.online.swap(true, Ordering::AcqRel) {
            log_info!(target: "smp", "cpu {} online", self.cpu);
        }
    }

    pub fn resched_requests(&self) -> usize {
        self.resched_requests.load(Ordering::Acquire)
    }

    /// Locks the mutable state. Callers hold an `IrqGuard`.
    pub fn lock(&self) -> MutexGuard<'_, CoreState> {
        self.state.lock()
    }

    /// Thread currently executing on this core.
    pub fn current(&self) -> Option<ThreadRef> {
        self.state.lock().current
    }

    /// Allocates the execution and trap stacks of this core, returning their tops.
    fn install_stacks(&self, exec_bytes: usize) -> (usize, usize) {
        let exec = KernelStack::new(exec_bytes);
        let trap = KernelStack::new(TRAP_STACK_BYTES);
        let tops = (exec.top(), trap.top());
        let mut state = self.state.lock();
        state.exec_stack = Some(exec);
        state.trap_stack = Some(trap);
        tops
    }

    /// Allocates a trap stack for a core that keeps its boot stack.
    pub fn install_trap_stack(&self) -> usize {
        let trap = KernelStack::new(TRAP_STACK_BYTES);
        let top = trap.top();
        self.state.lock().trap_stack = Some(trap);
        top
    }
}

/// Records the trap stack of `cpu` for the secondary entry path.
pub fn publish_trap_stack(cpu: CpuId, top: usize) {
    if let Some(slot) = TRAP_STACK_TOPS.get(cpu.as_index()) {
        slot.store(top, Ordering::Release);
    }
}

pub fn trap_stack_top(cpu: CpuId) -> Option<usize> {
    let top = TRAP_STACK_TOPS.get(cpu.as_index())?.load(Ordering::Acquire);
    (top != 0).then_some(top)
}

/// Starts every configured secondary core, one at a time, and returns how
/// many cores are online afterwards (boot core included).
pub fn bring_up(kernel: &Kernel) -> usize {
    let cores = kernel.config().max_cpus.min(MAX_CPUS);
    for index in 1..cores {
        let cpu = CpuId::from_raw(index as u16);
        let descriptor = kernel.core(cpu);
        if descriptor.is_online() {
            continue;
        }
        let (stack_top, trap_stack_top) =
            descriptor.install_stacks(kernel.config().kernel_stack_bytes());
        publish_trap_stack(cpu, trap_stack_top);
        let start = CoreStart { cpu, stack_top, trap_stack_top, kernel };
        if let Err(err) = kernel.hal().start_core(&start) {
            log_warn!(target: "smp", "cpu {} not started: {:?}", cpu, err);
            continue;
        }
        if !wait_online(descriptor) {
            log_error!(target: "smp", "cpu {} did not come online", cpu);
        }
    }
    let online = kernel.online_cores().count();
    log_info!(target: "smp", "{} core(s) online", online);
    online
}

fn wait_online(descriptor: &CoreDescriptor) -> bool {
    for _ in 0..ONLINE_SPIN_BUDGET {
        if descriptor.is_online() {
            return true;
        }
        core::hint::spin_loop();
    }
    descriptor.is_online()
}

/// Asks `target` to run its dispatcher. Returns false for cores that are not online.
pub fn request_resched(kernel: &Kernel, target: CpuId) -> bool {
    let Some(descriptor) = kernel.try_core(target).filter(|core| core.is_online()) else {
        return false;
    };
    descriptor.resched_requests.fetch_add(1, Ordering::AcqRel);
    kernel.hal().request_yield(target);
    true
}

/// Arms the first timeslice, unmasks interrupts and waits for the
/// preemption trigger to hand the core its first thread.
pub fn enter_dispatcher(kernel: &Kernel, cpu: CpuId) -> ! {
    kernel.timer().yield_after(kernel.hal(), cpu, kernel.config().timeslice_for(Priority::Mid));
    crate::arch::riscv::irq_restore(true);
    loop {
        kernel.hal().wait_for_interrupt();
    }
}

/// Rust entry of a secondary core (`a0 = hart id`, `sp` already set).
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
#[no_mangle]
extern "C" fn __axon_secondary_rust(hartid: usize) -> ! {
    let cpu = CpuId::from_hart(crate::types::HartId::from_raw(hartid as u16));
    let top = trap_stack_top(cpu).unwrap_or(0);
    crate::arch::riscv::write_per_core(top, cpu.as_index());
    let Some(kernel) = crate::kernel::registered() else {
        panic!("cpu {} started before kernel registration", cpu);
    };
    kernel.init_core(cpu, top);
    enter_dispatcher(kernel, cpu)
}

#[cfg(test)]
mod tests {
    use super::*;

    static TEST_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn trap_stacks_are_published_per_core() {
        let _guard = TEST_LOCK.lock();
        publish_trap_stack(CpuId::from_raw(2), 0x8800_0000);
        assert_eq!(trap_stack_top(CpuId::from_raw(2)), Some(0x8800_0000));
        assert_eq!(trap_stack_top(CpuId::from_raw(MAX_CPUS as u16)), None);
        publish_trap_stack(CpuId::from_raw(2), 0);
        assert_eq!(trap_stack_top(CpuId::from_raw(2)), None);
    }

    #[test]
    fn uninitialized_core_uses_noop_fpu() {
        let core = CoreDescriptor::new(CpuId::from_raw(3));
        assert!(!core.is_online());
        assert_eq!(core.lock().fpu_ops().kind, FpuKind::None);
        let top = core.install_trap_stack();
        assert_eq!(top % 16, 0);
        core.mark_online();
        assert!(core.is_online());
    }
}
