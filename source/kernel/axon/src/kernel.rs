// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel state object owning the run table, PID bitmap, core descriptors and
//!          the kernel address space
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests below + tests/scenarios.rs + tests/memory.rs
//! PUBLIC API: Kernel (new, enqueue, block/unblock/exit/kill, fork, wait_child, init_core,
//!             this_thread, this_proc), register(), registered()
//! DEPENDS_ON: sched::RunTable, smp::CoreDescriptor, mm::{AddressSpace, MemoryContext},
//!             task::pid::PidAllocator, timer::PreemptionTimer, hal::Hal
//! INVARIANTS: Every lifecycle transition runs under an IrqGuard; the run-table lock is taken
//!             before any core-state or address-space lock and never while one is held;
//!             the init process is never killed

extern crate alloc;

use alloc::{sync::Arc, vec::Vec};

use spin::{Mutex, Once};

use crate::{
    arch::FpuOps,
    config::KernelConfig,
    hal::{Hal, IrqGuard, PerCoreState},
    mm::{fault::FaultOutcome, Access, AddressSpace, AddressSpaceError, FrameAllocator, MemoryContext},
    sched::{Dispatch, RunTable},
    smp::{CoreDescriptor, MAX_CPUS},
    task::{pid::PidAllocator, Directory, Process, RunState, TaskError, ThreadRef},
    timer::PreemptionTimer,
    trap::TrapFrame,
    types::{CpuId, Pid, Tid, VirtAddr},
};

/// Exit status recorded for threads and processes terminated by the kernel.
pub const KILLED_STATUS: i32 = -1;

static KERNEL: Once<&'static Kernel> = Once::new();

/// Publishes `kernel` to the trap and secondary-core entry paths. Only the
/// first registration takes effect.
pub fn register(kernel: &'static Kernel) {
    KERNEL.call_once(|| kernel);
}

pub fn registered() -> Option<&'static Kernel> {
    KERNEL.get().copied()
}

/// Global scheduler and memory state of one machine.
pub struct Kernel {
    config: KernelConfig,
    hal: Arc<dyn Hal>,
    memory: MemoryContext,
    kernel_space: Arc<AddressSpace>,
    pids: PidAllocator,
    run_table: Mutex<RunTable>,
    cores: [CoreDescriptor; MAX_CPUS],
    timer: PreemptionTimer,
    init: Once<Pid>,
}

impl Kernel {
    /// Builds the kernel address space and empty tables. No core is online
    /// until `init_core` runs on it.
    pub fn new(
        config: KernelConfig,
        hal: Arc<dyn Hal>,
        frames: Arc<dyn FrameAllocator>,
    ) -> Result<Self, AddressSpaceError> {
        let memory = MemoryContext::new(frames);
        let kernel_space = Arc::new(AddressSpace::new_kernel(&memory)?);
        log_info!(
            target: "kernel",
            "kernel state ready: {} cpu(s), {} pid(s), timer {:?}",
            config.max_cpus,
            config.max_pids,
            config.timer_mode
        );
        Ok(Self {
            pids: PidAllocator::new(config.max_pids),
            run_table: Mutex::new(RunTable::new()),
            cores: core::array::from_fn(|index| CoreDescriptor::new(CpuId::from_raw(index as u16))),
            timer: PreemptionTimer::new(&config),
            init: Once::new(),
            config,
            hal,
            memory,
            kernel_space,
        })
    }

    #[inline]
    pub fn config(&self) -> &KernelConfig {
        &self.config
    }

    #[inline]
    pub fn hal(&self) -> &dyn Hal {
        &*self.hal
    }

    #[inline]
    pub fn memory(&self) -> &MemoryContext {
        &self.memory
    }

    #[inline]
    pub fn kernel_space(&self) -> &Arc<AddressSpace> {
        &self.kernel_space
    }

    #[inline]
    pub fn pids(&self) -> &PidAllocator {
        &self.pids
    }

    #[inline]
    pub fn timer(&self) -> &PreemptionTimer {
        &self.timer
    }

    /// Run table lock. Callers mask interrupts first.
    #[inline]
    pub fn run_table(&self) -> &Mutex<RunTable> {
        &self.run_table
    }

    /// Descriptor of `cpu`.
    ///
    /// `cpu` must come from the HAL or from `0..MAX_CPUS`; any other id
    /// panics. Use [`Kernel::try_core`] for ids taken from elsewhere.
    #[inline]
    pub fn core(&self, cpu: CpuId) -> &CoreDescriptor {
        &self.cores[cpu.as_index()]
    }

    #[inline]
    pub fn try_core(&self, cpu: CpuId) -> Option<&CoreDescriptor> {
        self.cores.get(cpu.as_index())
    }

    pub fn online_cores(&self) -> impl Iterator<Item = CpuId> + '_ {
        self.cores.iter().filter(|core| core.is_online()).map(CoreDescriptor::cpu)
    }

    /// PID of the init process, once one is enqueued.
    pub fn init_pid(&self) -> Option<Pid> {
        self.init.get().copied()
    }

    fn is_init(&self, pid: Pid) -> bool {
        self.init_pid() == Some(pid)
    }

    // -- core-local reads -------------------------------------------------

    /// Thread executing on `cpu`. Takes only the core lock.
    pub fn current_on(&self, cpu: CpuId) -> Option<ThreadRef> {
        self.try_core(cpu)?.current()
    }

    /// Thread running on the calling core.
    pub fn this_thread(&self) -> Option<ThreadRef> {
        let _irq = IrqGuard::new(self.hal());
        self.current_on(self.hal.current_cpu())
    }

    /// Process owning the thread running on the calling core.
    pub fn this_proc(&self) -> Option<Pid> {
        self.this_thread().map(|thread| thread.pid)
    }

    /// Working directory of the calling process.
    pub fn current_cwd(&self) -> Option<Arc<dyn Directory>> {
        let pid = self.this_proc()?;
        let _irq = IrqGuard::new(self.hal());
        self.run_table.lock().get(pid).map(|process| process.cwd().clone())
    }

    pub fn address_space(&self, pid: Pid) -> Option<Arc<AddressSpace>> {
        let _irq = IrqGuard::new(self.hal());
        self.run_table.lock().space_of(pid)
    }

    /// Runs `f` on the process `pid` while the run table is locked.
    pub fn with_process<R>(&self, pid: Pid, f: impl FnOnce(&Process) -> R) -> Option<R> {
        let _irq = IrqGuard::new(self.hal());
        self.run_table.lock().get(pid).map(f)
    }

    /// Mutable variant of [`Kernel::with_process`].
    pub fn with_process_mut<R>(&self, pid: Pid, f: impl FnOnce(&mut Process) -> R) -> Option<R> {
        let _irq = IrqGuard::new(self.hal());
        self.run_table.lock().get_mut(pid).map(f)
    }

    pub fn thread_state(&self, thread: ThreadRef) -> Option<RunState> {
        let _irq = IrqGuard::new(self.hal());
        self.run_table.lock().thread(thread).map(|t| t.state())
    }

    pub fn process_count(&self) -> usize {
        let _irq = IrqGuard::new(self.hal());
        self.run_table.lock().len()
    }

    // -- lifecycle --------------------------------------------------------

    /// Inserts `process` into the run table and links it to its parent.
    ///
    /// A process with no threads and no children is rejected; dropping it
    /// returns its PID. The first parentless process becomes init.
    pub fn enqueue(&self, mut process: Process) -> Result<Pid, TaskError> {
        if process.threads().is_empty() && process.children().is_empty() {
            log_warn!(target: "kernel", "enqueue of empty process {} rejected", process.name());
            return Err(TaskError::EmptyProcess);
        }
        let pid = process.pid();
        let _irq = IrqGuard::new(self.hal());
        let mut table = self.run_table.lock();
        if let Some(ppid) = process.parent() {
            match table.get_mut(ppid) {
                Some(parent) => parent.adopt(pid),
                None => process.set_parent(None),
            }
        }
        if process.parent().is_none() {
            self.init.call_once(|| pid);
        }
        log_info!(
            target: "kernel",
            "enqueued pid {} ({}) with {} thread(s)",
            pid,
            process.name(),
            process.threads().len()
        );
        table.insert(process);
        Ok(pid)
    }

    /// Moves `thread` to BLOCKED; the core running it is asked to reschedule.
    pub fn block_thread(&self, thread: ThreadRef) -> Result<(), TaskError> {
        let _irq = IrqGuard::new(self.hal());
        let on_cpu = {
            let mut table = self.run_table.lock();
            let entry = table.thread_mut(thread).ok_or(TaskError::NoSuchThread)?;
            if let Err(err) = entry.transition(RunState::Blocked) {
                log_warn!(target: "kernel", "block {} from {:?} rejected", thread, entry.state());
                return Err(err);
            }
            entry.on_cpu()
        };
        self.kick(on_cpu);
        Ok(())
    }

    pub fn unblock_thread(&self, thread: ThreadRef) -> Result<(), TaskError> {
        let _irq = IrqGuard::new(self.hal());
        let mut table = self.run_table.lock();
        let entry = table.thread_mut(thread).ok_or(TaskError::NoSuchThread)?;
        entry.transition(RunState::Ready).map_err(|err| {
            log_warn!(target: "kernel", "unblock {} from {:?} rejected", thread, entry.state());
            err
        })
    }

    /// Blocks the calling thread and yields the core.
    pub fn block_current(&self) -> Result<(), TaskError> {
        let thread = self.this_thread().ok_or(TaskError::NoSuchThread)?;
        self.block_thread(thread)
    }

    /// Moves the whole process to BLOCKED; none of its threads is selected
    /// until it is unblocked.
    pub fn block_process(&self, pid: Pid) -> Result<(), TaskError> {
        let _irq = IrqGuard::new(self.hal());
        let running = {
            let mut table = self.run_table.lock();
            let process = table.get_mut(pid).ok_or(TaskError::NoSuchProcess)?;
            if let Err(err) = process.transition(RunState::Blocked) {
                log_warn!(target: "kernel", "block pid {} from {:?} rejected", pid, process.state());
                return Err(err);
            }
            running_cores(process)
        };
        running.into_iter().for_each(|cpu| self.kick(Some(cpu)));
        Ok(())
    }

    pub fn unblock_process(&self, pid: Pid) -> Result<(), TaskError> {
        let _irq = IrqGuard::new(self.hal());
        let mut table = self.run_table.lock();
        let process = table.get_mut(pid).ok_or(TaskError::NoSuchProcess)?;
        process.transition(RunState::Ready).map_err(|err| {
            log_warn!(target: "kernel", "unblock pid {} from {:?} rejected", pid, process.state());
            err
        })
    }

    /// Marks `thread` KILLED with `status`. Exiting the last live thread
    /// exits the process. Storage is reclaimed by the dispatcher.
    pub fn exit_thread(&self, thread: ThreadRef, status: i32) -> Result<(), TaskError> {
        let _irq = IrqGuard::new(self.hal());
        let running = {
            let mut table = self.run_table.lock();
            let init = self.is_init(thread.pid);
            let process = table.get_mut(thread.pid).ok_or(TaskError::NoSuchProcess)?;
            let entry = process.thread(thread.tid).ok_or(TaskError::NoSuchThread)?;
            let last = entry.state() != RunState::Killed && process.live_threads() == 1;
            if last && init {
                log_warn!(target: "kernel", "exit of last init thread {} rejected", thread);
                return Err(TaskError::InvalidTransition);
            }
            let entry = process.thread_mut(thread.tid).ok_or(TaskError::NoSuchThread)?;
            let on_cpu = entry.on_cpu();
            if let Err(err) = entry.kill(status) {
                log_warn!(target: "kernel", "exit {} from {:?} rejected", thread, entry.state());
                return Err(err);
            }
            log_debug!(target: "kernel", "thread {} exited status={}", thread, status);
            if last {
                let running = running_cores(process);
                process.kill(status)?;
                log_info!(target: "kernel", "pid {} exited with its last thread", thread.pid);
                on_cpu.into_iter().chain(running).collect::<Vec<_>>()
            } else {
                on_cpu.into_iter().collect::<Vec<_>>()
            }
        };
        running.into_iter().for_each(|cpu| self.kick(Some(cpu)));
        Ok(())
    }

    /// Terminates the calling thread with `status`.
    pub fn exit_current(&self, status: i32) -> Result<(), TaskError> {
        let thread = self.this_thread().ok_or(TaskError::NoSuchThread)?;
        self.exit_thread(thread, status)
    }

    pub fn kill_thread(&self, thread: ThreadRef) -> Result<(), TaskError> {
        self.exit_thread(thread, KILLED_STATUS)
    }

    /// Marks the process and every thread KILLED with `status`.
    pub fn exit_process(&self, pid: Pid, status: i32) -> Result<(), TaskError> {
        if self.is_init(pid) {
            log_warn!(target: "kernel", "exit of init pid {} rejected", pid);
            return Err(TaskError::InvalidTransition);
        }
        let _irq = IrqGuard::new(self.hal());
        let running = {
            let mut table = self.run_table.lock();
            let process = table.get_mut(pid).ok_or(TaskError::NoSuchProcess)?;
            let running = running_cores(process);
            if let Err(err) = process.kill(status) {
                log_warn!(target: "kernel", "kill pid {} from {:?} rejected", pid, process.state());
                return Err(err);
            }
            log_info!(target: "kernel", "pid {} killed status={}", pid, status);
            running
        };
        running.into_iter().for_each(|cpu| self.kick(Some(cpu)));
        Ok(())
    }

    pub fn kill_process(&self, pid: Pid) -> Result<(), TaskError> {
        self.exit_process(pid, KILLED_STATUS)
    }

    /// Duplicates process `pid` around its thread `tid` and enqueues the
    /// child. The child's thread sees 0 in `a0`.
    pub fn fork_process(&self, pid: Pid, tid: Tid) -> Result<Pid, TaskError> {
        let _irq = IrqGuard::new(self.hal());
        let mut table = self.run_table.lock();
        let parent = table.get(pid).ok_or(TaskError::NoSuchProcess)?;
        let mut child = parent.fork(self, tid)?;
        if let Some(thread) = child.thread_at_mut(0) {
            thread.frame_mut().set_arg(0, 0);
        }
        let child_pid = child.pid();
        if let Some(parent) = table.get_mut(pid) {
            parent.adopt(child_pid);
        }
        log_info!(target: "kernel", "pid {} forked pid {} from thread {}", pid, child_pid, tid);
        table.insert(child);
        Ok(child_pid)
    }

    /// Forks the thread running on `cpu` whose live registers are in
    /// `frame`. The parent's `a0` receives the child PID.
    pub fn fork_current(&self, cpu: CpuId, frame: &mut TrapFrame) -> Result<Pid, TaskError> {
        let current = self.current_on(cpu).ok_or(TaskError::NoSuchThread)?;
        {
            let _irq = IrqGuard::new(self.hal());
            let mut table = self.run_table.lock();
            let thread = table.thread_mut(current).ok_or(TaskError::NoSuchThread)?;
            *thread.frame_mut() = *frame;
        }
        let child = self.fork_process(current.pid, current.tid)?;
        frame.set_arg(0, child.as_raw() as usize);
        Ok(child)
    }

    /// Collects the exit status of `child`.
    ///
    /// Returns `Ok(None)` while the child is still in the run table and
    /// `Ok(Some(status))` once it has been reaped; the status is handed out once.
    pub fn wait_child(&self, parent: Pid, child: Pid) -> Result<Option<i32>, TaskError> {
        let _irq = IrqGuard::new(self.hal());
        let mut table = self.run_table.lock();
        let process = table.get_mut(parent).ok_or(TaskError::NoSuchProcess)?;
        if let Some(status) = process.take_reaped(child) {
            return Ok(Some(status));
        }
        if process.children().contains(&child) {
            Ok(None)
        } else {
            Err(TaskError::NotChild)
        }
    }

    /// Drops every process. Returns how many were removed.
    pub fn teardown(&self) -> usize {
        let processes = {
            let _irq = IrqGuard::new(self.hal());
            core::mem::take(&mut *self.run_table.lock())
        };
        let count = processes.len();
        drop(processes);
        log_info!(target: "kernel", "teardown released {} process(es)", count);
        count
    }

    // -- per-core entry points ------------------------------------------------

    /// Common initializer run by every core (boot included) before it
    /// dispatches.
    pub fn init_core(&self, cpu: CpuId, trap_stack_top: usize) {
        let hal = self.hal();
        let _irq = IrqGuard::new(hal);
        hal.load_descriptor_tables(cpu);
        self.kernel_space.switch_to(hal, cpu);
        let fpu = FpuOps::for_kind(hal.detect_fpu(cpu));
        hal.enable_syscalls(cpu);
        hal.set_per_core_state(cpu, PerCoreState { trap_stack_top, thread_stack_top: 0 });
        let core = self.core(cpu);
        {
            let mut state = core.lock();
            state.fpu = Some(fpu);
            state.trap_stack_top = trap_stack_top;
        }
        log_debug!(target: "smp", "cpu {} initialized, fpu {:?}", cpu, fpu.kind);
        core.mark_online();
    }

    pub fn schedule(&self, cpu: CpuId, frame: &mut TrapFrame) -> Dispatch {
        crate::sched::schedule(self, cpu, frame)
    }

    pub fn on_timer_interrupt(&self, cpu: CpuId, frame: &mut TrapFrame) -> bool {
        self.timer.on_timer_interrupt(self, cpu, frame)
    }

    pub fn handle_page_fault(&self, cpu: CpuId, addr: VirtAddr, access: Access) -> FaultOutcome {
        crate::mm::fault::handle_page_fault(self, cpu, addr, access)
    }

    fn kick(&self, cpu: Option<CpuId>) {
        let Some(cpu) = cpu else { return };
        if !crate::smp::request_resched(self, cpu) {
            self.hal.request_yield(cpu);
        }
    }
}

fn running_cores(process: &Process) -> Vec<CpuId> {
    process.threads().iter().filter_map(|thread| thread.on_cpu()).collect()
}

static_assertions::assert_impl_all!(Kernel: Send, Sync);
