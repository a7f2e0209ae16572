// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Trap frame layout, cause decoding and routing to the timer and fault handlers
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below + tests/scenarios.rs (dispatch of timer and fault traps)
//! PUBLIC API: TrapFrame, TrapCause, TrapOutcome, dispatch(), describe_cause(), fmt_trap()
//! DEPENDS_ON: timer::on_timer_interrupt, mm::fault::handle_page_fault
//! INVARIANTS: TrapFrame layout matches the assembly vector (x0..x31, sepc, sstatus, scause, stval)

use core::fmt::{self, Write};

use spin::Mutex;

use crate::{
    mm::{fault::FaultOutcome, Access},
    types::{CpuId, VirtAddr},
    Kernel,
};

pub const REG_RA: usize = 1;
pub const REG_SP: usize = 2;
pub const REG_FP: usize = 8;
pub const REG_A0: usize = 10;

const INTERRUPT_FLAG: usize = usize::MAX - (usize::MAX >> 1);
const SSTATUS_SPP: usize = 1 << 8;

static LAST_TRAP: Mutex<Option<TrapFrame>> = Mutex::new(None);

/// Register snapshot saved on trap entry and restored on `sret`.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TrapFrame {
    pub x: [usize; 32],
    pub sepc: usize,
    pub sstatus: usize,
    pub scause: usize,
    pub stval: usize,
}

static_assertions::const_assert_eq!(core::mem::size_of::<TrapFrame>(), 36 * 8);

impl TrapFrame {
    #[inline]
    pub fn pc(&self) -> usize {
        self.sepc
    }

    #[inline]
    pub fn set_pc(&mut self, pc: usize) {
        self.sepc = pc;
    }

    #[inline]
    pub fn sp(&self) -> usize {
        self.x[REG_SP]
    }

    #[inline]
    pub fn set_sp(&mut self, sp: usize) {
        self.x[REG_SP] = sp;
    }

    #[inline]
    pub fn fp(&self) -> usize {
        self.x[REG_FP]
    }

    #[inline]
    pub fn set_fp(&mut self, fp: usize) {
        self.x[REG_FP] = fp;
    }

    /// Argument register `a<index>`.
    #[inline]
    pub fn arg(&self, index: usize) -> usize {
        self.x[REG_A0 + index]
    }

    #[inline]
    pub fn set_arg(&mut self, index: usize, value: usize) {
        self.x[REG_A0 + index] = value;
    }

    /// True when the trap was taken from U-mode.
    #[inline]
    pub fn from_user(&self) -> bool {
        self.sstatus & SSTATUS_SPP == 0
    }
}

/// Decoded `scause`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrapCause {
    Timer,
    /// Supervisor software interrupt (resched IPI).
    Software,
    External,
    PageFault(Access),
    /// `ecall` from U- or S-mode.
    Syscall,
    Other(usize),
}

impl TrapCause {
    pub fn from_scause(scause: usize) -> Self {
        let code = scause & !INTERRUPT_FLAG;
        if is_interrupt(scause) {
            return match code {
                1 => Self::Software,
                5 => Self::Timer,
                9 => Self::External,
                _ => Self::Other(scause),
            };
        }
        match code {
            8 | 9 => Self::Syscall,
            12 => Self::PageFault(Access::Execute),
            13 => Self::PageFault(Access::Read),
            15 => Self::PageFault(Access::Write),
            _ => Self::Other(scause),
        }
    }
}

/// What `dispatch` did with a trap.
#[must_use]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TrapOutcome {
    /// The interrupted context resumes unchanged.
    Resumed,
    /// The dispatcher ran; the frame now holds the selected thread.
    Rescheduled,
    /// A system call is pending in the frame for the external syscall layer.
    Syscall,
}

#[inline]
pub fn is_interrupt(scause: usize) -> bool {
    scause & INTERRUPT_FLAG != 0
}

pub fn describe_cause(scause: usize) -> &'static str {
    let code = scause & (usize::MAX >> 1);
    if is_interrupt(scause) {
        match code {
            1 => "SupervisorSoftInt",
            5 => "SupervisorTimerInt",
            9 => "SupervisorExternalInt",
            _ => "Interrupt",
        }
    } else {
        match code {
            0 => "InstructionAddressMisaligned",
            1 => "InstructionAccessFault",
            2 => "IllegalInstruction",
            3 => "Breakpoint",
            4 => "LoadAddressMisaligned",
            5 => "LoadAccessFault",
            6 => "StoreAMOAddressMisaligned",
            7 => "StoreAMOAccessFault",
            8 => "EnvironmentCallFromUMode",
            9 => "EnvironmentCallFromSMode",
            12 => "InstructionPageFault",
            13 => "LoadPageFault",
            15 => "StoreAMOPageFault",
            _ => "Exception",
        }
    }
}

pub fn fmt_trap<W: Write>(frame: &TrapFrame, f: &mut W) -> fmt::Result {
    writeln!(f, " sepc=0x{:016x}", frame.sepc)?;
    writeln!(f, " scause=0x{:016x} ({})", frame.scause, describe_cause(frame.scause))?;
    writeln!(f, " stval=0x{:016x}", frame.stval)?;
    writeln!(f, " a0..a7 = {:016x?}", &frame.x[10..=17])
}

pub fn record(frame: &TrapFrame) {
    *LAST_TRAP.lock() = Some(*frame);
}

pub fn last_trap() -> Option<TrapFrame> {
    *LAST_TRAP.lock()
}

/// Routes one trap taken on `cpu`.
///
/// Timer and resched interrupts go to the preemption trigger. Page faults go
/// to the fault resolver; when it terminates the current thread the trigger
/// runs right away so the frame never returns into killed work. Any other
/// exception from U-mode kills the thread; from S-mode it is fatal.
pub fn dispatch(kernel: &Kernel, cpu: CpuId, frame: &mut TrapFrame) -> TrapOutcome {
    match TrapCause::from_scause(frame.scause) {
        TrapCause::Timer | TrapCause::Software => {
            if kernel.timer().on_timer_interrupt(kernel, cpu, frame) {
                TrapOutcome::Rescheduled
            } else {
                TrapOutcome::Resumed
            }
        }
        TrapCause::External => TrapOutcome::Resumed,
        TrapCause::Syscall => {
            // Resume after the `ecall` once the syscall layer has run.
            frame.sepc = frame.sepc.wrapping_add(4);
            TrapOutcome::Syscall
        }
        TrapCause::PageFault(access) => {
            let outcome = match VirtAddr::new(frame.stval) {
                Some(addr) => crate::mm::fault::handle_page_fault(kernel, cpu, addr, access),
                None => crate::mm::fault::unresolvable(kernel, cpu, frame.stval, access),
            };
            match outcome {
                FaultOutcome::Resolved => TrapOutcome::Resumed,
                FaultOutcome::ThreadKilled => leave_killed(kernel, cpu, frame),
                FaultOutcome::Fatal => {
                    record(frame);
                    panic!(
                        "unsurvivable {:?} fault at {:#x} sepc=0x{:x} on cpu {}",
                        access, frame.stval, frame.sepc, cpu
                    );
                }
            }
        }
        TrapCause::Other(scause) => {
            record(frame);
            if frame.from_user() {
                if let Some(current) = kernel.current_on(cpu) {
                    log_warn!(
                        target: "trap",
                        "{} at sepc={:#x} kills {}",
                        describe_cause(scause),
                        frame.sepc,
                        current
                    );
                    if let Err(err) = kernel.kill_thread(current) {
                        panic!("EXC: {} in {} which cannot be killed: {:?}", describe_cause(scause), current, err);
                    }
                    return leave_killed(kernel, cpu, frame);
                }
            }
            panic!("EXC: {} scause=0x{:x} sepc=0x{:x}", describe_cause(scause), scause, frame.sepc);
        }
    }
}

/// Runs the dispatcher so `frame` no longer holds a killed thread.
fn leave_killed(kernel: &Kernel, cpu: CpuId, frame: &mut TrapFrame) -> TrapOutcome {
    if !kernel.timer().on_timer_interrupt(kernel, cpu, frame) {
        record(frame);
        panic!("killed thread trapped inside the dispatcher on cpu {} sepc=0x{:x}", cpu, frame.sepc);
    }
    TrapOutcome::Rescheduled
}

/// Entry from the assembly trap vector.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
#[no_mangle]
extern "C" fn __axon_trap_rust(frame: &mut TrapFrame) {
    let Some(kernel) = crate::kernel::registered() else {
        record(frame);
        panic!("trap before kernel registration: {}", describe_cause(frame.scause));
    };
    let cpu = kernel.hal().current_cpu();
    let _ = dispatch(kernel, cpu, frame);
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::string::String;

    #[test]
    fn record_and_query_last_trap() {
        let mut frame = TrapFrame::default();
        frame.sepc = 0x1000;
        record(&frame);
        let recorded = last_trap().expect("trap stored");
        assert_eq!(recorded.sepc, 0x1000);
    }

    #[test]
    fn fmt_includes_registers() {
        let mut frame = TrapFrame::default();
        frame.x[10..=17].copy_from_slice(&[1; 8]);
        frame.sepc = 0x2000;
        frame.scause = 9;
        frame.stval = 0x3000;
        let mut out = String::new();
        fmt_trap(&frame, &mut out).unwrap();
        assert!(out.contains("sepc"));
        assert!(out.contains("EnvironmentCallFromSMode"));
        assert!(out.contains("a0..a7"));
    }

    #[test]
    fn decodes_causes() {
        assert_eq!(TrapCause::from_scause(INTERRUPT_FLAG | 5), TrapCause::Timer);
        assert_eq!(TrapCause::from_scause(INTERRUPT_FLAG | 1), TrapCause::Software);
        assert_eq!(TrapCause::from_scause(15), TrapCause::PageFault(Access::Write));
        assert_eq!(TrapCause::from_scause(13), TrapCause::PageFault(Access::Read));
        assert_eq!(TrapCause::from_scause(12), TrapCause::PageFault(Access::Execute));
        assert_eq!(TrapCause::from_scause(8), TrapCause::Syscall);
        assert_eq!(TrapCause::from_scause(2), TrapCause::Other(2));
    }

    #[test]
    fn frame_accessors_alias_registers() {
        let mut frame = TrapFrame::default();
        frame.set_sp(0x8000);
        frame.set_fp(0x7ff0);
        frame.set_arg(1, 42);
        assert_eq!(frame.x[REG_SP], 0x8000);
        assert_eq!(frame.x[REG_FP], 0x7ff0);
        assert_eq!(frame.x[11], 42);
        frame.sstatus = SSTATUS_SPP;
        assert!(!frame.from_user());
    }

    mod routing {
        use alloc::sync::Arc;

        use super::*;
        use crate::{
            hal::host::HostHal,
            mm::FramePool,
            task::{Priority, Process},
            KernelConfig,
        };

        extern "C" fn spin(_arg: usize) {}

        fn kernel_with(names: &[&str]) -> Kernel {
            let kernel = Kernel::new(
                KernelConfig::default().with_max_cpus(1),
                Arc::new(HostHal::new(1)),
                Arc::new(FramePool::host(512)),
            )
            .expect("kernel");
            kernel.init_core(CpuId::BOOT, 0x8000_0000);
            for name in names {
                let process = Process::with_thread(&kernel, name, spin, 0, Priority::Mid).expect("process");
                kernel.enqueue(process).expect("enqueue");
            }
            kernel
        }

        fn store_fault(frame: &mut TrapFrame) {
            frame.scause = 15;
            frame.stval = 0x2000_0000;
        }

        #[test]
        #[should_panic(expected = "unsurvivable")]
        fn fault_in_last_init_thread_halts() {
            let kernel = kernel_with(&["init"]);
            let mut frame = TrapFrame::default();
            let _ = kernel.schedule(CpuId::BOOT, &mut frame);
            store_fault(&mut frame);
            let _ = dispatch(&kernel, CpuId::BOOT, &mut frame);
        }

        #[test]
        #[should_panic(expected = "inside the dispatcher")]
        fn killed_thread_cannot_resume_when_dispatcher_is_busy() {
            let kernel = kernel_with(&["init", "worker"]);
            let mut frame = TrapFrame::default();
            let _ = kernel.schedule(CpuId::BOOT, &mut frame);
            let _ = kernel.schedule(CpuId::BOOT, &mut frame);
            kernel.timer().enter_for_test(CpuId::BOOT);
            store_fault(&mut frame);
            let _ = dispatch(&kernel, CpuId::BOOT, &mut frame);
        }

        #[test]
        fn fault_kill_switches_the_frame_away() {
            let kernel = kernel_with(&["init", "worker"]);
            let mut frame = TrapFrame::default();
            let _ = kernel.schedule(CpuId::BOOT, &mut frame);
            let _ = kernel.schedule(CpuId::BOOT, &mut frame);
            let victim = kernel.current_on(CpuId::BOOT).expect("worker running");
            store_fault(&mut frame);
            assert_eq!(dispatch(&kernel, CpuId::BOOT, &mut frame), TrapOutcome::Rescheduled);
            assert_ne!(kernel.current_on(CpuId::BOOT), Some(victim));
        }
    }
}
