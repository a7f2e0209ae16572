// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Page fault resolver registered with the trap layer
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: unit tests (fatal fault in init's last thread, ordinary thread killed);
//!                tests/scenarios.rs (anonymous fault, unresolvable fault kills thread)
//! PUBLIC API: handle_page_fault(), unresolvable(), FaultOutcome
//! DEPENDS_ON: Kernel (current thread, address spaces), AddressSpace::resolve_fault
//! INVARIANTS: The run-table lock is released before the address-space lock is taken;
//!             an unresolvable fault with no current thread halts the kernel

use super::{Access, FaultError};
use crate::{
    task::ThreadRef,
    types::{CpuId, VirtAddr},
    Kernel,
};

/// Result of handling a fault on behalf of the interrupted context.
#[must_use]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The page is mapped; the faulting instruction can be retried.
    Resolved,
    /// The faulting thread was terminated and must not resume.
    ThreadKilled,
    /// The faulting thread may not be terminated (the last thread of init);
    /// the fault cannot be survived.
    Fatal,
}

/// Resolves a fault at `addr` taken on `cpu`.
///
/// The current thread's address space is consulted, or the kernel space when
/// the core runs no thread.
pub fn handle_page_fault(kernel: &Kernel, cpu: CpuId, addr: VirtAddr, access: Access) -> FaultOutcome {
    let current = kernel.current_on(cpu);
    let space = current
        .and_then(|thread| kernel.address_space(thread.pid))
        .unwrap_or_else(|| kernel.kernel_space().clone());
    match space.resolve_fault(addr, access) {
        Ok(_) => FaultOutcome::Resolved,
        Err(err) => terminate(kernel, cpu, current, addr.raw(), access, err),
    }
}

/// Handles a fault whose address cannot be resolved at all (non-canonical).
pub fn unresolvable(kernel: &Kernel, cpu: CpuId, addr: usize, access: Access) -> FaultOutcome {
    terminate(kernel, cpu, kernel.current_on(cpu), addr, access, FaultError::NoRange)
}

fn terminate(
    kernel: &Kernel,
    cpu: CpuId,
    current: Option<ThreadRef>,
    addr: usize,
    access: Access,
    err: FaultError,
) -> FaultOutcome {
    let Some(thread) = current else {
        panic!("unresolvable kernel fault at {:#x} ({:?} on cpu {}): {:?}", addr, access, cpu, err);
    };
    log_warn!(
        target: "fault",
        "{:?} fault at {:#x} by {} unresolved ({:?}); terminating",
        access,
        addr,
        thread,
        err
    );
    if let Err(reject) = kernel.kill_thread(thread) {
        log_error!(target: "fault", "terminate {} rejected: {:?}", thread, reject);
        return FaultOutcome::Fatal;
    }
    kernel.hal().request_yield(cpu);
    FaultOutcome::ThreadKilled
}

#[cfg(test)]
mod tests {
    use alloc::sync::Arc;

    use super::*;
    use crate::{
        hal::host::HostHal,
        mm::FramePool,
        task::{Priority, Process, RunState},
        trap::TrapFrame,
        KernelConfig,
    };

    extern "C" fn spin(_arg: usize) {}

    fn kernel() -> Kernel {
        let kernel = Kernel::new(
            KernelConfig::default().with_max_cpus(1),
            Arc::new(HostHal::new(1)),
            Arc::new(FramePool::host(512)),
        )
        .expect("kernel");
        kernel.init_core(CpuId::BOOT, 0x8000_0000);
        kernel
    }

    fn unmapped() -> VirtAddr {
        VirtAddr::new(0x2000_0000).expect("canonical")
    }

    #[test]
    fn fault_in_init_last_thread_is_fatal() {
        let kernel = kernel();
        let init = Process::with_thread(&kernel, "init", spin, 0, Priority::Mid).expect("init");
        let init = kernel.enqueue(init).expect("enqueue");
        let mut frame = TrapFrame::default();
        let _ = kernel.schedule(CpuId::BOOT, &mut frame);
        let thread = kernel.this_thread().expect("running");
        assert_eq!(thread.pid, init);

        let outcome = handle_page_fault(&kernel, CpuId::BOOT, unmapped(), Access::Write);
        assert_eq!(outcome, FaultOutcome::Fatal);
        assert_eq!(kernel.thread_state(thread), Some(RunState::Running));
    }

    #[test]
    fn fault_in_ordinary_thread_kills_it() {
        let kernel = kernel();
        let init = Process::with_thread(&kernel, "init", spin, 0, Priority::Mid).expect("init");
        let _ = kernel.enqueue(init).expect("enqueue");
        let worker = Process::with_thread(&kernel, "worker", spin, 0, Priority::Mid).expect("worker");
        let worker = kernel.enqueue(worker).expect("enqueue");
        let mut frame = TrapFrame::default();
        let _ = kernel.schedule(CpuId::BOOT, &mut frame);
        let _ = kernel.schedule(CpuId::BOOT, &mut frame);
        let thread = kernel.this_thread().expect("running");
        assert_eq!(thread.pid, worker);

        let outcome = unresolvable(&kernel, CpuId::BOOT, usize::MAX, Access::Read);
        assert_eq!(outcome, FaultOutcome::ThreadKilled);
        assert_eq!(kernel.thread_state(thread), Some(RunState::Killed));
    }
}
