// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Boot-core entry for the QEMU virt image (heap, frame pool, kernel state, SMP)
//! OWNERS: @kernel-boot-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: No tests (bare-metal only; the host suites cover every step it calls)
//! PUBLIC API: kmain()
//! DEPENDS_ON: linked_list_allocator::Heap, mm::FramePool, hal::virt::VirtHal, smp::bring_up
//! INVARIANTS: Runs once on the boot hart with interrupts masked; .bss is cleared before any
//!             static is touched; the kernel is registered before the first trap can fire

extern crate alloc;

use alloc::{boxed::Box, sync::Arc};
use core::{
    alloc::{GlobalAlloc, Layout},
    ptr::NonNull,
};

use linked_list_allocator::Heap;
use spin::Mutex;

use crate::{
    arch::riscv,
    hal::virt::VirtHal,
    mm::{address_space::KERNEL_UART_VA, FramePool, PAGE_SIZE},
    smp,
    task::{Priority, Process},
    types::{CpuId, PhysAddr},
    Kernel, KernelConfig,
};

extern "C" {
    static mut __bss_start: u8;
    static mut __bss_end: u8;
    static mut __heap_start: u8;
    static mut __heap_end: u8;
    static __frames_start: u8;
    static __frames_end: u8;
}

core::arch::global_asm!(
    r#"
    .section .text.entry, "ax", @progbits
    .globl _start
_start:
    .option push
    .option norelax
    la    gp, __global_pointer$
    .option pop
    la    sp, __boot_stack_top
    mv    tp, a0
    tail  kmain
"#
);

/// Kernel heap backed by `linked_list_allocator`.
struct KernelHeap(Mutex<Heap>);

// SAFETY: every access goes through the spin lock; callers in interrupt
// context run with interrupts masked.
unsafe impl GlobalAlloc for KernelHeap {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.0
            .lock()
            .allocate_first_fit(layout)
            .map_or(core::ptr::null_mut(), |ptr| ptr.as_ptr())
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        if let Some(ptr) = NonNull::new(ptr) {
            // SAFETY: `ptr` was returned by `alloc` with the same layout.
            unsafe { self.0.lock().deallocate(ptr, layout) };
        }
    }
}

#[global_allocator]
static HEAP: KernelHeap = KernelHeap(Mutex::new(Heap::empty()));

fn init_heap() {
    // SAFETY: linker-provided bounds of a region reserved for the heap; only
    // their addresses are taken and the region is handed over exactly once.
    unsafe {
        let start = core::ptr::addr_of_mut!(__heap_start);
        let end = core::ptr::addr_of_mut!(__heap_end) as usize;
        HEAP.0.lock().init(start, end - start as usize);
    }
}

fn frame_pool() -> FramePool {
    // SAFETY: only the addresses of the linker symbols are read.
    let (start, end) = unsafe {
        (
            core::ptr::addr_of!(__frames_start) as usize,
            core::ptr::addr_of!(__frames_end) as usize,
        )
    };
    let base = (start + PAGE_SIZE - 1) & !(PAGE_SIZE - 1);
    let frames = end.saturating_sub(base) / PAGE_SIZE;
    // SAFETY: the linker script reserves `[__frames_start, __frames_end)` for
    // the frame pool; it is identity-mapped RAM and nothing else uses it.
    unsafe { FramePool::from_region(PhysAddr::new(base), frames) }
}

extern "C" fn init_main(_arg: usize) {
    log_info!(target: "boot", "init running");
    loop {
        riscv::wait_for_interrupt();
    }
}

/// Rust entry of the boot hart (`a0 = hart id`).
#[no_mangle]
pub extern "C" fn kmain(hartid: usize) -> ! {
    // SAFETY: first code to run; nothing has touched .bss yet.
    unsafe {
        riscv::clear_bss(core::ptr::addr_of_mut!(__bss_start), core::ptr::addr_of_mut!(__bss_end));
    }
    init_heap();
    log_info!(target: "boot", "axon: boot hart {}", hartid);

    let pool = frame_pool();
    log_info!(target: "boot", "frame pool: {} frames at {}", pool.total_frames(), pool.base());
    let kernel = match Kernel::new(KernelConfig::default(), Arc::new(VirtHal::new()), Arc::new(pool)) {
        Ok(kernel) => Box::leak(Box::new(kernel)),
        Err(err) => panic!("kernel state init failed: {:?}", err),
    };
    crate::kernel::register(kernel);

    let cpu = CpuId::BOOT;
    let trap_top = kernel.core(cpu).install_trap_stack();
    smp::publish_trap_stack(cpu, trap_top);
    riscv::write_per_core(trap_top, cpu.as_index());
    kernel.init_core(cpu, trap_top);
    crate::uart::relocate(KERNEL_UART_VA);

    let online = smp::bring_up(kernel);
    log_info!(target: "boot", "{} core(s) online", online);

    match Process::with_thread(kernel, "init", init_main, 0, Priority::Mid)
        .and_then(|init| kernel.enqueue(init))
    {
        Ok(pid) => log_info!(target: "boot", "init is pid {}", pid),
        Err(err) => panic!("init process: {:?}", err),
    }

    smp::enter_dispatcher(kernel, cpu)
}
