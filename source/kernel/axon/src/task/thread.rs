// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Thread control blocks: saved registers, kernel stack and FPU area.

extern crate alloc;

use alloc::{boxed::Box, vec, vec::Vec};

use super::{kthread_trampoline, user_trampoline, Priority, RunState, TaskError, ThreadEntry, ThreadRef};
use crate::{
    arch::FpuArea,
    trap::TrapFrame,
    types::{CpuId, Pid, Tid},
};

const SSTATUS_SPIE: usize = 1 << 5;
const SSTATUS_SPP: usize = 1 << 8;
const SSTATUS_SUM: usize = 1 << 18;
/// Threads start in S-mode with interrupts enabled after `sret` and user
/// memory accessible.
const KERNEL_SSTATUS: usize = SSTATUS_SPP | SSTATUS_SPIE | SSTATUS_SUM;

const STACK_ALIGN: usize = core::mem::size_of::<u128>();

/// Owned, 16-byte aligned kernel stack.
pub struct KernelStack {
    words: Vec<u128>,
}

impl KernelStack {
    pub fn new(bytes: usize) -> Self {
        let words = (bytes + STACK_ALIGN - 1) / STACK_ALIGN;
        Self { words: vec![0; words.max(1)] }
    }

    #[inline]
    pub fn bottom(&self) -> usize {
        self.words.as_ptr() as usize
    }

    #[inline]
    pub fn top(&self) -> usize {
        self.bottom() + self.len()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.words.len() * STACK_ALIGN
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.words.is_empty()
    }

    #[inline]
    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.bottom() && addr <= self.top()
    }

    fn duplicate(&self) -> Self {
        Self { words: self.words.clone() }
    }
}

/// Privilege level a thread ultimately runs at.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ThreadKind {
    Kernel,
    User,
}

/// Schedulable execution context owned by a Process.
pub struct Thread {
    tid: Tid,
    pid: Pid,
    state: RunState,
    kind: ThreadKind,
    priority: Priority,
    frame: TrapFrame,
    stack: KernelStack,
    fpu: Box<FpuArea>,
    last_cpu: Option<CpuId>,
    on_cpu: Option<CpuId>,
    exit_status: Option<i32>,
}

impl Thread {
    fn blank(pid: Pid, tid: Tid, kind: ThreadKind, priority: Priority, stack_bytes: usize) -> Self {
        let stack = KernelStack::new(stack_bytes);
        let mut frame = TrapFrame::default();
        frame.sstatus = KERNEL_SSTATUS;
        frame.set_sp(stack.top());
        Self {
            tid,
            pid,
            state: RunState::Initial,
            kind,
            priority,
            frame,
            stack,
            fpu: Box::new(FpuArea::zeroed()),
            last_cpu: None,
            on_cpu: None,
            exit_status: None,
        }
    }

    /// Kernel thread starting in `kthread_trampoline(entry, arg)`.
    pub(crate) fn new_kernel(
        pid: Pid,
        tid: Tid,
        entry: ThreadEntry,
        arg: usize,
        priority: Priority,
        stack_bytes: usize,
    ) -> Self {
        let mut thread = Self::blank(pid, tid, ThreadKind::Kernel, priority, stack_bytes);
        thread.frame.set_pc(kthread_trampoline as usize);
        thread.frame.set_arg(0, entry as usize);
        thread.frame.set_arg(1, arg);
        thread
    }

    /// User thread starting in `user_trampoline(entry, user_sp, arg)`.
    pub(crate) fn new_user(
        pid: Pid,
        tid: Tid,
        entry: usize,
        user_sp: usize,
        arg: usize,
        priority: Priority,
        stack_bytes: usize,
    ) -> Self {
        let mut thread = Self::blank(pid, tid, ThreadKind::User, priority, stack_bytes);
        thread.frame.set_pc(user_trampoline as usize);
        thread.frame.set_arg(0, entry);
        thread.frame.set_arg(1, user_sp);
        thread.frame.set_arg(2, arg);
        thread
    }

    /// Copy of this thread for process `pid`.
    ///
    /// Registers, kernel-stack contents and FPU state are duplicated; `sp`
    /// and `fp` are shifted by the distance between the two stacks when they
    /// point into the kernel stack.
    pub(crate) fn fork(&self, pid: Pid, tid: Tid) -> Self {
        let stack = self.stack.duplicate();
        let delta = stack.top().wrapping_sub(self.stack.top());
        let mut frame = self.frame;
        if self.stack.contains(frame.sp()) {
            frame.set_sp(frame.sp().wrapping_add(delta));
        }
        if self.stack.contains(frame.fp()) {
            frame.set_fp(frame.fp().wrapping_add(delta));
        }
        Self {
            tid,
            pid,
            state: RunState::Initial,
            kind: self.kind,
            priority: self.priority,
            frame,
            stack,
            fpu: Box::new(*self.fpu),
            last_cpu: None,
            on_cpu: None,
            exit_status: None,
        }
    }

    #[inline]
    pub fn tid(&self) -> Tid {
        self.tid
    }

    #[inline]
    pub fn pid(&self) -> Pid {
        self.pid
    }

    #[inline]
    pub fn id(&self) -> ThreadRef {
        ThreadRef::new(self.pid, self.tid)
    }

    #[inline]
    pub fn state(&self) -> RunState {
        self.state
    }

    #[inline]
    pub fn kind(&self) -> ThreadKind {
        self.kind
    }

    #[inline]
    pub fn priority(&self) -> Priority {
        self.priority
    }

    pub fn set_priority(&mut self, priority: Priority) {
        self.priority = priority;
    }

    #[inline]
    pub fn frame(&self) -> &TrapFrame {
        &self.frame
    }

    #[inline]
    pub fn frame_mut(&mut self) -> &mut TrapFrame {
        &mut self.frame
    }

    #[inline]
    pub fn stack(&self) -> &KernelStack {
        &self.stack
    }

    #[inline]
    pub fn fpu(&self) -> &FpuArea {
        &self.fpu
    }

    #[inline]
    pub(crate) fn fpu_mut(&mut self) -> &mut FpuArea {
        &mut self.fpu
    }

    /// Core that last ran this thread.
    #[inline]
    pub fn last_cpu(&self) -> Option<CpuId> {
        self.last_cpu
    }

    /// Core currently executing this thread.
    #[inline]
    pub fn on_cpu(&self) -> Option<CpuId> {
        self.on_cpu
    }

    pub fn exit_status(&self) -> Option<i32> {
        self.exit_status
    }

    /// Applies a lifecycle edge, rejecting illegal ones.
    pub fn transition(&mut self, next: RunState) -> Result<(), TaskError> {
        if !self.state.can_transition_to(next) {
            return Err(TaskError::InvalidTransition);
        }
        self.state = next;
        Ok(())
    }

    pub(crate) fn kill(&mut self, status: i32) -> Result<(), TaskError> {
        self.transition(RunState::Killed)?;
        self.exit_status = Some(status);
        Ok(())
    }

    /// Marks the thread as executing on `cpu`.
    pub(crate) fn dispatch_on(&mut self, cpu: CpuId) -> Result<(), TaskError> {
        self.transition(RunState::Running)?;
        self.on_cpu = Some(cpu);
        self.last_cpu = Some(cpu);
        Ok(())
    }

    /// Records that the thread left its core. A RUNNING thread becomes READY;
    /// blocked or killed threads keep their state.
    pub(crate) fn leave_cpu(&mut self) {
        self.on_cpu = None;
        if self.state == RunState::Running {
            self.state = RunState::Ready;
        }
    }

    /// True once the thread is KILLED and no core still executes on its stack.
    #[inline]
    pub fn is_reclaimable(&self) -> bool {
        self.state == RunState::Killed && self.on_cpu.is_none()
    }
}

impl core::fmt::Debug for Thread {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Thread")
            .field("id", &self.id())
            .field("state", &self.state)
            .field("kind", &self.kind)
            .field("priority", &self.priority)
            .field("last_cpu", &self.last_cpu)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::trap::{REG_FP, REG_SP};

    extern "C" fn noop(_arg: usize) {}

    fn kernel_thread() -> Thread {
        Thread::new_kernel(Pid::from_raw(3), Tid::from_raw(1), noop, 0x55, Priority::High, 4096)
    }

    #[test]
    fn kernel_thread_enters_trampoline() {
        let thread = kernel_thread();
        assert_eq!(thread.state(), RunState::Initial);
        assert_eq!(thread.frame().pc(), kthread_trampoline as usize);
        assert_eq!(thread.frame().arg(0), noop as usize);
        assert_eq!(thread.frame().arg(1), 0x55);
        assert_eq!(thread.frame().sp(), thread.stack().top());
        assert_eq!(thread.frame().sp() % 16, 0);
        assert!(!thread.frame().from_user());
    }

    #[test]
    fn fork_shifts_stack_pointers_into_new_stack() {
        let mut parent = kernel_thread();
        let top = parent.stack().top();
        parent.frame_mut().x[REG_SP] = top - 64;
        parent.frame_mut().x[REG_FP] = top - 32;
        parent.frame_mut().x[5] = 0xdead;
        parent.fpu_mut().f[3] = 0x4000_0000_0000_0000;

        let child = parent.fork(Pid::from_raw(9), Tid::from_raw(1));
        let child_top = child.stack().top();
        assert_ne!(child_top, top);
        assert_eq!(child.frame().sp(), child_top - 64);
        assert_eq!(child.frame().fp(), child_top - 32);
        assert_eq!(child.frame().x[5], 0xdead);
        assert_eq!(child.fpu().f[3], 0x4000_0000_0000_0000);
        assert_eq!(child.pid(), Pid::from_raw(9));
        assert_eq!(child.state(), RunState::Initial);
    }

    #[test]
    fn fork_copies_kernel_stack_contents() {
        let mut parent = kernel_thread();
        for (index, word) in parent.stack.words.iter_mut().enumerate() {
            *word = 0xa5a5_0000_0000_0000_0000_0000_0000_0000 | index as u128;
        }
        let top = parent.stack().top();
        let frame_slot = top - 3 * STACK_ALIGN;
        parent.frame_mut().set_sp(frame_slot);

        let child = parent.fork(Pid::from_raw(9), Tid::from_raw(1));
        assert_ne!(child.stack().bottom(), parent.stack().bottom());
        assert_eq!(child.stack.words, parent.stack.words);
        let rebased = child.frame().sp();
        assert!(child.stack().contains(rebased));
        assert!(!parent.stack().contains(rebased));
        assert_eq!(child.stack().top() - rebased, 3 * STACK_ALIGN);
        let slot = (rebased - child.stack().bottom()) / STACK_ALIGN;
        assert_eq!(child.stack.words[slot], parent.stack.words[slot]);
        assert_eq!(child.stack.words[slot] & 0xffff, slot as u128);
    }

    #[test]
    fn user_stack_pointer_is_not_shifted() {
        let mut parent = Thread::new_user(
            Pid::from_raw(2),
            Tid::from_raw(1),
            0x1_0000,
            0x3f_ffff_0000,
            0,
            Priority::Mid,
            4096,
        );
        parent.frame_mut().set_sp(0x3f_fffe_ff00);
        let child = parent.fork(Pid::from_raw(4), Tid::from_raw(1));
        assert_eq!(child.frame().sp(), 0x3f_fffe_ff00);
        assert_eq!(child.frame().arg(1), 0x3f_ffff_0000);
    }

    #[test]
    fn dispatch_and_leave_track_cores() {
        let mut thread = kernel_thread();
        assert_eq!(thread.dispatch_on(CpuId::BOOT), Err(TaskError::InvalidTransition));
        thread.transition(RunState::Ready).expect("ready");
        thread.dispatch_on(CpuId::from_raw(1)).expect("run");
        assert_eq!(thread.on_cpu(), Some(CpuId::from_raw(1)));
        thread.kill(3).expect("kill");
        assert!(!thread.is_reclaimable());
        thread.leave_cpu();
        assert_eq!(thread.state(), RunState::Killed);
        assert_eq!(thread.last_cpu(), Some(CpuId::from_raw(1)));
        assert!(thread.is_reclaimable());
        assert_eq!(thread.exit_status(), Some(3));
    }
}
