// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Process control blocks.
//!
//! A Process owns its address space, descriptor table and threads. Children
//! are named by PID; the run table owns every Process.

extern crate alloc;

use alloc::{string::String, sync::Arc, vec, vec::Vec};

use super::{
    pid::PidLease,
    root_directory,
    stack::{map_initial_stack, AuxVector},
    Directory, Priority, RunState, TaskError, Thread, ThreadEntry, ThreadRef,
};
use crate::{
    config::KernelConfig,
    mm::{AddressSpace, PAGE_SIZE},
    types::{Pid, Tid},
    Kernel,
};

/// Open file object installed in a descriptor slot.
pub type FileHandle = Arc<dyn crate::mm::Resource>;

/// Unmapped gap kept below each user stack.
const USER_STACK_GUARD_PAGES: usize = 1;

pub struct Process {
    name: String,
    lease: PidLease,
    state: RunState,
    space: Arc<AddressSpace>,
    cwd: Arc<dyn Directory>,
    fds: Vec<Option<FileHandle>>,
    threads: Vec<Thread>,
    children: Vec<Pid>,
    parent: Option<Pid>,
    next_tid: u32,
    exit_status: Option<i32>,
    /// Exit statuses of reclaimed children not yet collected by `wait_child`.
    reaped: Vec<(Pid, i32)>,
    /// Top of the next user stack handed out by `add_user_thread`.
    next_user_stack: usize,
    config: KernelConfig,
}

impl Process {
    /// Builds a Process without threads. It cannot be enqueued until a thread
    /// or child is added.
    pub fn empty(kernel: &Kernel, name: &str) -> Result<Self, TaskError> {
        let config = *kernel.config();
        let lease = kernel.pids().allocate().ok_or(TaskError::PidExhausted)?;
        let space =
            AddressSpace::new_user(kernel.memory(), kernel.kernel_space(), config.mmap_base)?;
        let cwd = kernel.current_cwd().unwrap_or_else(root_directory);
        Ok(Self {
            name: String::from(name),
            lease,
            state: RunState::Initial,
            space: Arc::new(space),
            cwd,
            fds: vec![None; config.fd_table_size],
            threads: Vec::new(),
            children: Vec::new(),
            parent: kernel.this_proc(),
            next_tid: 1,
            exit_status: None,
            reaped: Vec::new(),
            next_user_stack: config.user_stack_top,
            config,
        })
    }

    /// Builds a Process with one kernel thread running `entry(arg)`.
    pub fn with_thread(
        kernel: &Kernel,
        name: &str,
        entry: ThreadEntry,
        arg: usize,
        priority: Priority,
    ) -> Result<Self, TaskError> {
        let mut process = Self::empty(kernel, name)?;
        process.add_thread(entry, arg, priority)?;
        Ok(process)
    }

    #[inline]
    pub fn pid(&self) -> Pid {
        self.lease.pid()
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn state(&self) -> RunState {
        self.state
    }

    #[inline]
    pub fn space(&self) -> &Arc<AddressSpace> {
        &self.space
    }

    #[inline]
    pub fn cwd(&self) -> &Arc<dyn Directory> {
        &self.cwd
    }

    pub fn set_cwd(&mut self, cwd: Arc<dyn Directory>) {
        self.cwd = cwd;
    }

    #[inline]
    pub fn parent(&self) -> Option<Pid> {
        self.parent
    }

    pub(crate) fn set_parent(&mut self, parent: Option<Pid>) {
        self.parent = parent;
    }

    #[inline]
    pub fn children(&self) -> &[Pid] {
        &self.children
    }

    pub(crate) fn adopt(&mut self, child: Pid) {
        if !self.children.contains(&child) {
            self.children.push(child);
        }
    }

    /// Drops `child` from the child list and records its exit status.
    pub(crate) fn record_reaped(&mut self, child: Pid, status: i32) {
        self.children.retain(|pid| *pid != child);
        self.reaped.push((child, status));
    }

    /// Removes and returns the recorded exit status of `child`.
    pub(crate) fn take_reaped(&mut self, child: Pid) -> Option<i32> {
        let index = self.reaped.iter().position(|(pid, _)| *pid == child)?;
        Some(self.reaped.remove(index).1)
    }

    #[inline]
    pub fn threads(&self) -> &[Thread] {
        &self.threads
    }

    pub fn thread(&self, tid: Tid) -> Option<&Thread> {
        self.threads.iter().find(|t| t.tid() == tid)
    }

    pub fn thread_mut(&mut self, tid: Tid) -> Option<&mut Thread> {
        self.threads.iter_mut().find(|t| t.tid() == tid)
    }

    pub(crate) fn thread_at_mut(&mut self, index: usize) -> Option<&mut Thread> {
        self.threads.get_mut(index)
    }

    /// Threads not yet KILLED.
    pub fn live_threads(&self) -> usize {
        self.threads.iter().filter(|t| t.state() != RunState::Killed).count()
    }

    #[inline]
    pub fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }

    /// True when the Process has no threads and no children left.
    #[inline]
    pub fn is_reclaimable(&self) -> bool {
        self.threads.is_empty() && self.children.is_empty()
    }

    /// True when at least one thread is READY.
    pub fn has_ready_thread(&self) -> bool {
        self.threads.iter().any(|t| t.state() == RunState::Ready)
    }

    /// Applies a lifecycle edge to the Process itself.
    pub fn transition(&mut self, next: RunState) -> Result<(), TaskError> {
        if !self.state.can_transition_to(next) {
            return Err(TaskError::InvalidTransition);
        }
        self.state = next;
        Ok(())
    }

    /// Marks the Process and every thread KILLED.
    pub(crate) fn kill(&mut self, status: i32) -> Result<(), TaskError> {
        self.transition(RunState::Killed)?;
        self.exit_status = Some(status);
        let pid = self.pid();
        for thread in self.threads.iter_mut().filter(|t| t.state() != RunState::Killed) {
            if let Err(err) = thread.kill(status) {
                log_warn!(target: "task", "pid {} kill of thread {} rejected: {:?}", pid, thread.tid(), err);
            }
        }
        Ok(())
    }

    fn next_tid(&mut self) -> Tid {
        let tid = Tid::from_raw(self.next_tid);
        self.next_tid += 1;
        tid
    }

    fn admit(&mut self, mut thread: Thread) -> Result<Tid, TaskError> {
        if self.state == RunState::Killed {
            return Err(TaskError::InvalidTransition);
        }
        thread.transition(RunState::Ready)?;
        let tid = thread.tid();
        self.threads.push(thread);
        if self.state == RunState::Initial {
            self.state = RunState::Ready;
        }
        Ok(tid)
    }

    /// Adds a kernel thread running `entry(arg)`; it terminates when `entry` returns.
    pub fn add_thread(
        &mut self,
        entry: ThreadEntry,
        arg: usize,
        priority: Priority,
    ) -> Result<Tid, TaskError> {
        if self.state == RunState::Killed {
            return Err(TaskError::InvalidTransition);
        }
        let tid = self.next_tid();
        let thread = Thread::new_kernel(
            self.pid(),
            tid,
            entry,
            arg,
            priority,
            self.config.kernel_stack_bytes(),
        );
        self.admit(thread)
    }

    /// Adds a user thread entering `entry` on a fresh user stack carrying
    /// argc/argv/envp/auxv.
    pub fn add_user_thread(
        &mut self,
        entry: usize,
        arg: usize,
        priority: Priority,
        auxv: &AuxVector,
        argv: &[&str],
        envp: &[&str],
    ) -> Result<Tid, TaskError> {
        if self.state == RunState::Killed {
            return Err(TaskError::InvalidTransition);
        }
        let stack_len = self.config.user_stack_pages * PAGE_SIZE;
        let top = self.next_user_stack;
        let bottom = top.checked_sub(stack_len).ok_or(TaskError::ArgumentsTooLarge)?;
        let layout = map_initial_stack(&self.space, top, stack_len, argv, envp, auxv)?;
        self.next_user_stack = bottom.saturating_sub(USER_STACK_GUARD_PAGES * PAGE_SIZE);

        let tid = self.next_tid();
        let thread = Thread::new_user(
            self.pid(),
            tid,
            entry,
            layout.sp,
            arg,
            priority,
            self.config.kernel_stack_bytes(),
        );
        log_debug!(target: "task", "pid {} user thread {} sp={:#x}", self.pid(), tid, layout.sp);
        self.admit(thread)
    }

    /// Duplicates this Process for fork. Only the forking thread is copied.
    pub(crate) fn fork(&self, kernel: &Kernel, forking: Tid) -> Result<Process, TaskError> {
        let source = self.thread(forking).ok_or(TaskError::NoSuchThread)?;
        let lease = kernel.pids().allocate().ok_or(TaskError::PidExhausted)?;
        let space = self.space.fork()?;
        let mut child = Process {
            name: self.name.clone(),
            lease,
            state: RunState::Initial,
            space: Arc::new(space),
            cwd: self.cwd.clone(),
            fds: self.fds.clone(),
            threads: Vec::new(),
            children: Vec::new(),
            parent: Some(self.pid()),
            next_tid: 1,
            exit_status: None,
            reaped: Vec::new(),
            next_user_stack: self.next_user_stack,
            config: self.config,
        };
        let tid = child.next_tid();
        let thread = source.fork(child.pid(), tid);
        child.admit(thread)?;
        Ok(child)
    }

    /// Installs `file` in the lowest free descriptor slot.
    pub fn fd_install(&mut self, file: FileHandle) -> Result<usize, TaskError> {
        let (fd, slot) = self
            .fds
            .iter_mut()
            .enumerate()
            .find(|(_, slot)| slot.is_none())
            .ok_or(TaskError::FdExhausted)?;
        *slot = Some(file);
        Ok(fd)
    }

    pub fn fd_get(&self, fd: usize) -> Option<FileHandle> {
        self.fds.get(fd).and_then(|slot| slot.clone())
    }

    pub fn fd_close(&mut self, fd: usize) -> Result<FileHandle, TaskError> {
        self.fds.get_mut(fd).and_then(Option::take).ok_or(TaskError::BadFd)
    }

    /// Frees KILLED threads that no core is still running. Returns how many went.
    pub fn clean_proc(&mut self) -> usize {
        let before = self.threads.len();
        self.threads.retain(|t| !t.is_reclaimable());
        let freed = before - self.threads.len();
        if freed > 0 {
            log_debug!(target: "task", "pid {} freed {} thread(s)", self.pid(), freed);
        }
        freed
    }

    /// Thread refs in table order, for diagnostics and tests.
    pub fn thread_refs(&self) -> Vec<ThreadRef> {
        self.threads.iter().map(Thread::id).collect()
    }
}

impl core::fmt::Debug for Process {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Process")
            .field("pid", &self.pid())
            .field("name", &self.name)
            .field("state", &self.state)
            .field("threads", &self.threads.len())
            .field("children", &self.children)
            .finish()
    }
}
