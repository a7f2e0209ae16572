// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Run table and per-core dispatcher (round robin across processes and threads)
//! OWNERS: @kernel-sched-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below + sched/tests_prop.rs + tests/scenarios.rs
//! PUBLIC API: RunTable, RunView, Candidate, select_next(), schedule(), Dispatch, Dispatcher
//! DEPENDS_ON: task::{Process, Thread}, smp::CoreState, hal::{Hal, IrqGuard}, mm::AddressSpace
//! INVARIANTS: Selection is pure; Dispatcher::switch_to is the only place a thread is put on a
//!             core; a thread only runs on the core it first ran on; nothing is freed while a
//!             core still executes on it

extern crate alloc;

use alloc::{sync::Arc, vec::Vec};

use crate::{
    hal::{IrqGuard, PerCoreState},
    mm::AddressSpace,
    smp::CoreState,
    task::{Priority, Process, RunState, Thread, ThreadRef},
    trap::TrapFrame,
    types::{CpuId, Pid, Tid},
    Kernel,
};

#[cfg(test)]
mod tests_prop;

/// Exit status recorded for processes reaped without an explicit one.
const DEFAULT_EXIT_STATUS: i32 = 0;

/// Scheduling facts about one thread slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Candidate {
    pub id: ThreadRef,
    pub state: RunState,
    pub last_cpu: Option<CpuId>,
    pub on_cpu: Option<CpuId>,
}

impl Candidate {
    pub fn of(thread: &Thread) -> Self {
        Self {
            id: thread.id(),
            state: thread.state(),
            last_cpu: thread.last_cpu(),
            on_cpu: thread.on_cpu(),
        }
    }

    /// READY, not executing anywhere, and never run on another core.
    #[inline]
    pub fn eligible_on(&self, cpu: CpuId) -> bool {
        self.state.is_runnable()
            && self.on_cpu.is_none()
            && self.last_cpu.map_or(true, |last| last == cpu)
    }
}

/// Read-only view of the run table used by [`select_next`].
pub trait RunView {
    fn process_count(&self) -> usize;

    /// True when the process at `index` may have threads dispatched.
    fn process_runnable(&self, index: usize) -> bool;

    fn thread_count(&self, index: usize) -> usize;

    fn thread_at(&self, index: usize, slot: usize) -> Option<Candidate>;

    /// Position of `id` as `(process index, thread slot)`.
    fn locate(&self, id: ThreadRef) -> Option<(usize, usize)> {
        (0..self.process_count()).find_map(|index| {
            (0..self.thread_count(index))
                .find(|slot| self.thread_at(index, *slot).map(|c| c.id) == Some(id))
                .map(|slot| (index, slot))
        })
    }
}

fn eligible<V: RunView + ?Sized>(view: &V, index: usize, slot: usize, cpu: CpuId) -> Option<ThreadRef> {
    if !view.process_runnable(index) {
        return None;
    }
    view.thread_at(index, slot).filter(|c| c.eligible_on(cpu)).map(|c| c.id)
}

/// Picks the thread `cpu` runs next.
///
/// Without a current thread the table is scanned from the start. Otherwise
/// the scan continues after `current` within its process, then through the
/// following processes, wrapping around and ending with `current` itself.
pub fn select_next<V: RunView + ?Sized>(
    view: &V,
    cpu: CpuId,
    current: Option<ThreadRef>,
) -> Option<ThreadRef> {
    let processes = view.process_count();
    let Some((home, slot)) = current.and_then(|id| view.locate(id)) else {
        return (0..processes).find_map(|index| {
            (0..view.thread_count(index)).find_map(|slot| eligible(view, index, slot, cpu))
        });
    };

    let rest_of_home =
        (slot + 1..view.thread_count(home)).find_map(|slot| eligible(view, home, slot, cpu));
    if rest_of_home.is_some() {
        return rest_of_home;
    }
    (1..=processes).find_map(|step| {
        let index = (home + step) % processes;
        let threads = if index == home { slot + 1 } else { view.thread_count(index) };
        (0..threads).find_map(|slot| eligible(view, index, slot, cpu))
    })
}

/// Every enqueued process, in insertion order.
#[derive(Default)]
pub struct RunTable {
    processes: Vec<Process>,
}

impl RunTable {
    pub const fn new() -> Self {
        Self { processes: Vec::new() }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.processes.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn insert(&mut self, process: Process) {
        self.processes.push(process);
    }

    pub fn iter(&self) -> impl Iterator<Item = &Process> {
        self.processes.iter()
    }

    pub fn contains(&self, pid: Pid) -> bool {
        self.get(pid).is_some()
    }

    pub fn get(&self, pid: Pid) -> Option<&Process> {
        self.processes.iter().find(|p| p.pid() == pid)
    }

    pub fn get_mut(&mut self, pid: Pid) -> Option<&mut Process> {
        self.processes.iter_mut().find(|p| p.pid() == pid)
    }

    pub fn thread(&self, id: ThreadRef) -> Option<&Thread> {
        self.get(id.pid).and_then(|p| p.thread(id.tid))
    }

    pub fn thread_mut(&mut self, id: ThreadRef) -> Option<&mut Thread> {
        self.get_mut(id.pid).and_then(|p| p.thread_mut(id.tid))
    }

    pub fn space_of(&self, pid: Pid) -> Option<Arc<AddressSpace>> {
        self.get(pid).map(|p| p.space().clone())
    }

    /// Runs the per-process cleanup over every process.
    pub fn clean_all(&mut self) -> usize {
        self.processes.iter_mut().map(Process::clean_proc).sum()
    }

    /// Removes KILLED processes with no threads and no children left and
    /// records their exit status in the parent.
    ///
    /// The removed processes are returned so the caller can drop them (and
    /// release their PIDs and address spaces) outside its locks.
    pub fn reap(&mut self) -> Vec<Process> {
        let mut reaped = Vec::new();
        loop {
            let Some(index) = self
                .processes
                .iter()
                .position(|p| p.state() == RunState::Killed && p.is_reclaimable())
            else {
                break;
            };
            let process = self.processes.remove(index);
            let status = process.exit_status().unwrap_or(DEFAULT_EXIT_STATUS);
            if let Some(parent) = process.parent().and_then(|ppid| self.get_mut(ppid)) {
                parent.record_reaped(process.pid(), status);
            }
            log_info!(target: "sched", "reaped pid {} ({}) status={}", process.pid(), process.name(), status);
            reaped.push(process);
        }
        reaped
    }
}

impl RunView for RunTable {
    fn process_count(&self) -> usize {
        self.processes.len()
    }

    fn process_runnable(&self, index: usize) -> bool {
        self.processes.get(index).map_or(false, |p| p.state().is_runnable())
    }

    fn thread_count(&self, index: usize) -> usize {
        self.processes.get(index).map_or(0, |p| p.threads().len())
    }

    fn thread_at(&self, index: usize, slot: usize) -> Option<Candidate> {
        self.processes.get(index)?.threads().get(slot).map(Candidate::of)
    }

    fn locate(&self, id: ThreadRef) -> Option<(usize, usize)> {
        let index = self.processes.iter().position(|p| p.pid() == id.pid)?;
        let slot = self.processes[index].threads().iter().position(|t| t.tid() == id.tid)?;
        Some((index, slot))
    }
}

/// Result of one dispatch decision.
#[must_use]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Dispatch {
    /// Thread now loaded in the frame; `None` means the idle thread.
    pub next: Option<ThreadRef>,
    /// Timeslice to arm before returning to the frame.
    pub timeslice_ms: u64,
    /// Threads and processes freed by the cleanup pass.
    pub reclaimed: usize,
}

/// Dispatcher for one core.
pub struct Dispatcher<'k> {
    kernel: &'k Kernel,
    cpu: CpuId,
}

impl<'k> Dispatcher<'k> {
    pub fn new(kernel: &'k Kernel, cpu: CpuId) -> Self {
        Self { kernel, cpu }
    }

    /// Stores the interrupted context in the outgoing thread and takes it off the core.
    fn save_outgoing(
        &self,
        table: &mut RunTable,
        core: &mut CoreState,
        frame: &TrapFrame,
    ) -> Option<ThreadRef> {
        let fpu = core.fpu_ops();
        if let Some(id) = core.current.take() {
            if let Some(thread) = table.thread_mut(id) {
                *thread.frame_mut() = *frame;
                (fpu.save)(thread.fpu_mut());
                thread.leave_cpu();
            }
            return Some(id);
        }
        if core.idle_running {
            if let Some(idle) = core.idle.as_mut() {
                *idle.frame_mut() = *frame;
                (fpu.save)(idle.fpu_mut());
                idle.leave_cpu();
            }
            core.idle_running = false;
        }
        None
    }

    /// Loads `next` (or the idle thread) into `frame` and onto the core.
    pub fn switch_to(
        &self,
        table: &mut RunTable,
        core: &mut CoreState,
        next: Option<ThreadRef>,
        frame: &mut TrapFrame,
    ) -> (Option<ThreadRef>, u64) {
        let hal = self.kernel.hal();
        let config = self.kernel.config();
        let fpu = core.fpu_ops();

        if let Some(id) = next {
            let space = table.space_of(id.pid);
            if let (Some(space), Some(thread)) = (space, table.thread_mut(id)) {
                match thread.dispatch_on(self.cpu) {
                    Ok(()) => {
                        *frame = *thread.frame();
                        (fpu.restore)(thread.fpu());
                        space.switch_to(hal, self.cpu);
                        hal.set_per_core_state(
                            self.cpu,
                            PerCoreState {
                                trap_stack_top: core.trap_stack_top,
                                thread_stack_top: thread.stack().top(),
                            },
                        );
                        core.current = Some(id);
                        log_trace!(target: "sched", "cpu {} -> {}", self.cpu, id);
                        return (Some(id), config.timeslice_for(thread.priority()));
                    }
                    Err(err) => {
                        log_error!(target: "sched", "cannot dispatch {}: {:?}", id, err);
                    }
                }
            }
        }

        let idle_bytes = config.idle_stack_bytes();
        let cpu = self.cpu;
        let idle = core.idle.get_or_insert_with(|| new_idle_thread(cpu, idle_bytes));
        if let Err(err) = idle.dispatch_on(cpu) {
            log_error!(target: "sched", "idle thread on cpu {} not runnable: {:?}", cpu, err);
        }
        *frame = *idle.frame();
        (fpu.restore)(idle.fpu());
        let stack_top = idle.stack().top();
        self.kernel.kernel_space().switch_to(hal, cpu);
        hal.set_per_core_state(
            cpu,
            PerCoreState { trap_stack_top: core.trap_stack_top, thread_stack_top: stack_top },
        );
        core.idle_running = true;
        (None, config.timeslice_for(Priority::Low))
    }
}

/// Runs one dispatch decision on `cpu`: saves the interrupted thread from
/// `frame`, picks the next one, reclaims dead threads and processes, and
/// loads the choice back into `frame`.
pub fn schedule(kernel: &Kernel, cpu: CpuId, frame: &mut TrapFrame) -> Dispatch {
    let dispatcher = Dispatcher::new(kernel, cpu);
    let _irq = IrqGuard::new(kernel.hal());
    let mut table = kernel.run_table().lock();
    let mut core = kernel.core(cpu).lock();

    let outgoing = dispatcher.save_outgoing(&mut table, &mut core, frame);
    let next = select_next(&*table, cpu, outgoing);
    let freed_threads = table.clean_all();
    let reaped = table.reap();
    let (next, timeslice_ms) = dispatcher.switch_to(&mut table, &mut core, next, frame);
    let reclaimed = freed_threads + reaped.len();
    drop(core);
    drop(table);
    drop(reaped);
    Dispatch { next, timeslice_ms, reclaimed }
}

/// Idle thread entry; never returns.
extern "C" fn idle_main(_cpu: usize) {
    loop {
        crate::arch::riscv::wait_for_interrupt();
    }
}

fn new_idle_thread(cpu: CpuId, stack_bytes: usize) -> Thread {
    // PID 0 is never leased, so idle threads cannot collide with a process.
    let mut idle = Thread::new_kernel(
        Pid::from_raw(0),
        Tid::from_raw(cpu.as_raw() as u32 + 1),
        idle_main,
        cpu.as_index(),
        Priority::Low,
        stack_bytes,
    );
    if let Err(err) = idle.transition(RunState::Ready) {
        log_error!(target: "sched", "idle thread for cpu {}: {:?}", cpu, err);
    }
    log_debug!(target: "sched", "idle thread created for cpu {}", cpu);
    idle
}
