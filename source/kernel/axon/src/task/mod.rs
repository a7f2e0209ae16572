// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Process and thread model (lifecycle states, priorities, entry trampolines)
//! OWNERS: @kernel-sched-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module + task/tests_prop.rs + tests/scenarios.rs
//! PUBLIC API: Process, Thread, RunState, Priority, ThreadRef, TaskError, LoadedImage, AuxVector
//! DEPENDS_ON: mm::AddressSpace, trap::TrapFrame, arch::FpuArea, task::pid
//! INVARIANTS: KILLED is terminal; TIDs grow monotonically per process; a PID is released
//!             only when its Process is dropped

extern crate alloc;

use alloc::sync::Arc;
use core::fmt;

use crate::{
    mm::{AddressSpaceError, MapError},
    types::{Pid, Tid},
};

pub mod pid;
mod process;
mod stack;
mod thread;

#[cfg(test)]
mod tests_prop;

pub use process::{FileHandle, Process};
pub use stack::{auxv, AuxVector, LoadedImage, StackLayout};
pub use thread::{KernelStack, Thread, ThreadKind};

/// Lifecycle state shared by processes and threads.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    Initial,
    Ready,
    Running,
    Blocked,
    /// Reserved; no path enters it.
    Sleeping,
    Killed,
}

impl RunState {
    /// Legal edges of the lifecycle machine.
    pub const fn can_transition_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Initial, Ready)
                | (Ready, Running)
                | (Running, Ready)
                | (Ready, Blocked)
                | (Running, Blocked)
                | (Blocked, Ready)
                | (Initial, Killed)
                | (Ready, Killed)
                | (Running, Killed)
                | (Blocked, Killed)
        )
    }

    #[inline]
    pub const fn is_runnable(self) -> bool {
        matches!(self, RunState::Ready)
    }
}

/// Scheduling priority; only the timeslice length depends on it.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    #[default]
    Mid,
    High,
}

impl Priority {
    #[inline]
    pub const fn index(self) -> usize {
        match self {
            Priority::Low => 0,
            Priority::Mid => 1,
            Priority::High => 2,
        }
    }
}

/// Stable name of a thread across the run table.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ThreadRef {
    pub pid: Pid,
    pub tid: Tid,
}

impl ThreadRef {
    pub const fn new(pid: Pid, tid: Tid) -> Self {
        Self { pid, tid }
    }
}

impl fmt::Display for ThreadRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.pid, self.tid)
    }
}

/// Errors produced by process and thread operations.
#[must_use = "task errors must be handled explicitly"]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TaskError {
    PidExhausted,
    FdExhausted,
    BadFd,
    /// The requested lifecycle edge is illegal (or targets the init process).
    InvalidTransition,
    /// A process without threads or children cannot be enqueued.
    EmptyProcess,
    NoSuchProcess,
    NoSuchThread,
    /// The target is not a child of the caller.
    NotChild,
    /// argv/envp/auxv do not fit on the initial user stack.
    ArgumentsTooLarge,
    AddressSpace(AddressSpaceError),
}

impl From<AddressSpaceError> for TaskError {
    fn from(value: AddressSpaceError) -> Self {
        Self::AddressSpace(value)
    }
}

impl From<MapError> for TaskError {
    fn from(value: MapError) -> Self {
        Self::AddressSpace(AddressSpaceError::Mapping(value))
    }
}

/// Entry point of a kernel thread.
pub type ThreadEntry = extern "C" fn(usize);

/// Current working directory handle supplied by the filesystem layer.
pub trait Directory: Send + Sync {
    fn path(&self) -> &str;
}

/// Directory handle for `/`, used when no filesystem has seeded one.
#[derive(Debug, Default)]
pub struct RootDirectory;

impl Directory for RootDirectory {
    fn path(&self) -> &str {
        "/"
    }
}

impl fmt::Debug for dyn Directory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Directory({})", self.path())
    }
}

pub(crate) fn root_directory() -> Arc<dyn Directory> {
    Arc::new(RootDirectory)
}

/// First code run by every kernel thread (`a0 = entry`, `a1 = arg`).
///
/// Returning from `entry` terminates the thread.
pub extern "C" fn kthread_trampoline(entry: usize, arg: usize) -> ! {
    // SAFETY: `Thread::new_kernel` stores a `ThreadEntry` in `a0`.
    let entry: ThreadEntry = unsafe { core::mem::transmute::<usize, ThreadEntry>(entry) };
    entry(arg);
    if let Some(kernel) = crate::kernel::registered() {
        if let Err(err) = kernel.exit_current(0) {
            log_error!(target: "task", "kthread exit failed: {:?}", err);
        }
    }
    loop {
        crate::arch::riscv::wait_for_interrupt();
    }
}

/// First code run by every user thread (`a0 = entry`, `a1 = user sp`, `a2 = arg`).
pub extern "C" fn user_trampoline(entry: usize, sp: usize, arg: usize) -> ! {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        crate::arch::riscv::enter_user(entry, sp, arg)
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        panic!("user entry {:#x} (sp={:#x}, arg={:#x}) needs U-mode", entry, sp, arg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn killed_is_terminal() {
        use RunState::*;
        for next in [Initial, Ready, Running, Blocked, Sleeping, Killed] {
            assert!(!Killed.can_transition_to(next));
        }
    }

    #[test]
    fn sleeping_is_never_entered() {
        use RunState::*;
        for from in [Initial, Ready, Running, Blocked, Sleeping, Killed] {
            assert!(!from.can_transition_to(Sleeping));
        }
    }

    #[test]
    fn priority_indices_are_dense() {
        assert_eq!(Priority::Low.index(), 0);
        assert_eq!(Priority::Mid.index(), 1);
        assert_eq!(Priority::High.index(), 2);
        assert_eq!(Priority::default(), Priority::Mid);
    }
}
