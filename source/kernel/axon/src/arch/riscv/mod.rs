// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! RISC-V specific helpers used across the AXON kernel.
//!
//! Written so host builds still exercise the high level logic: every CSR
//! access has a `#[cfg(not(target_arch = "riscv64"))]` stand-in, and the FPU
//! save/restore routines fall back to an emulated register file.

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
use spin::Mutex;

const SSTATUS_SIE: usize = 1 << 1;

/// Clears the `.bss` region defined by the linker.
#[inline]
pub fn clear_bss(start: *mut u8, end: *mut u8) {
    let len = end as usize - start as usize;
    // SAFETY: caller passes the linker-provided `.bss` bounds.
    unsafe { core::ptr::write_bytes(start, 0, len) };
}

/// Disables supervisor interrupts and returns whether they were enabled.
#[inline]
pub fn irq_save() -> bool {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        let prev: usize;
        // SAFETY: clearing SIE only masks interrupts on the calling hart.
        unsafe {
            core::arch::asm!("csrrc {0}, sstatus, {1}", out(reg) prev, in(reg) SSTATUS_SIE,
                options(nostack));
        }
        prev & SSTATUS_SIE != 0
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        let _ = SSTATUS_SIE;
        false
    }
}

/// Restores the interrupt-enable state returned by [`irq_save`].
#[inline]
pub fn irq_restore(was_enabled: bool) {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    if was_enabled {
        // SAFETY: re-enables interrupts that were enabled before `irq_save`.
        unsafe {
            core::arch::asm!("csrs sstatus, {0}", in(reg) SSTATUS_SIE, options(nostack));
        }
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    let _ = was_enabled;
}

/// Loads `satp` and flushes the TLB.
#[inline]
pub fn write_satp(value: usize) {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    // SAFETY: `value` describes a root table that maps the kernel half.
    unsafe {
        core::arch::asm!("csrw satp, {0}", "sfence.vma x0, x0", in(reg) value, options(nostack));
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    let _ = value;
}

/// Stores the trap stack top in `sscratch`, the CPU index in `tp` and in the
/// slot just below the trap stack top that the trap vector reloads `tp` from.
#[inline]
pub fn write_per_core(trap_stack_top: usize, cpu_index: usize) {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    // SAFETY: both registers are reserved for the trap entry path; the slot lies
    // inside the per-core trap stack reserved by `TRAP_FRAME_RESERVE`.
    unsafe {
        core::ptr::write_volatile((trap_stack_top - 8) as *mut usize, cpu_index);
        core::arch::asm!("csrw sscratch, {0}", "mv tp, {1}", in(reg) trap_stack_top,
            in(reg) cpu_index, options(nostack));
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    let _ = (trap_stack_top, cpu_index);
}

/// Reads the timer CSR (10 MHz counter on virt).
#[inline]
pub fn read_time() -> u64 {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    {
        riscv::register::time::read() as u64
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    {
        0
    }
}

/// Issues a WFI instruction or spins on the host.
#[inline]
pub fn wait_for_interrupt() {
    #[cfg(all(target_arch = "riscv64", target_os = "none"))]
    // SAFETY: `wfi` has no memory effects.
    unsafe {
        core::arch::asm!("wfi", options(nomem, nostack, preserves_flags));
    }
    #[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
    core::hint::spin_loop();
}

/// Reads `tp`, which holds the logical CPU index while in the kernel.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
#[inline]
pub fn read_tp() -> usize {
    let tp: usize;
    // SAFETY: reading a general-purpose register has no side effects.
    unsafe { core::arch::asm!("mv {0}, tp", out(reg) tp, options(nomem, nostack)) };
    tp
}

/// Enables supervisor software interrupts (resched IPIs).
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
#[inline]
pub fn enable_soft_interrupts() {
    // SAFETY: the trap vector is installed before this is called.
    unsafe { riscv::register::sie::set_ssoft() };
}

/// Points `stvec` at the shared trap vector.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub fn install_trap_vector() {
    extern "C" {
        fn __axon_trap_vector();
    }
    // SAFETY: `__axon_trap_vector` is the 4-byte aligned entry defined below.
    unsafe {
        riscv::register::stvec::write(
            __axon_trap_vector as usize,
            riscv::register::mtvec::TrapMode::Direct,
        );
    }
}

/// Entry address handed to SBI `hart_start` for secondary cores.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub fn secondary_entry_addr() -> usize {
    extern "C" {
        fn __axon_secondary_start();
    }
    __axon_secondary_start as usize
}

/// Drops to U-mode at `entry` with stack `sp` and `a0 = arg0`.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub fn enter_user(entry: usize, sp: usize, arg0: usize) -> ! {
    const SSTATUS_SPP: usize = 1 << 8;
    const SSTATUS_SPIE: usize = 1 << 5;
    // SAFETY: the current address space maps `entry` and `sp` for user access.
    unsafe {
        core::arch::asm!(
            "csrc sstatus, {spp}",
            "csrs sstatus, {spie}",
            "csrw sepc, {entry}",
            "mv sp, {sp}",
            "mv a0, {arg0}",
            "sret",
            spp = in(reg) SSTATUS_SPP,
            spie = in(reg) SSTATUS_SPIE,
            entry = in(reg) entry,
            sp = in(reg) sp,
            arg0 = in(reg) arg0,
            options(noreturn)
        );
    }
}

/// Checks whether the F/D extension is usable by toggling `sstatus.FS`.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
pub fn probe_fpu() -> FpuKind {
    const SSTATUS_FS: usize = 3 << 13;
    let fs: usize;
    // SAFETY: setting FS is harmless without an FPU (the field reads back zero).
    unsafe {
        core::arch::asm!("csrs sstatus, {0}", "csrr {1}, sstatus", in(reg) SSTATUS_FS_INITIAL,
            out(reg) fs, options(nostack));
    }
    if fs & SSTATUS_FS == 0 {
        FpuKind::None
    } else if cfg!(target_feature = "d") {
        FpuKind::Double
    } else {
        FpuKind::Single
    }
}

// Trap vector: swap to the per-core trap stack held in `sscratch`, save a full
// `TrapFrame`, reload the kernel `tp` stored just above the frame and call the
// Rust dispatcher. The frame may have been rewritten by a context switch, so
// everything is restored from memory before `sret`.
#[cfg(all(target_arch = "riscv64", target_os = "none"))]
core::arch::global_asm!(
    r#"
    .section .text.__axon_trap_vector, "ax", @progbits
    .globl __axon_trap_vector
    .align 4
__axon_trap_vector:
    csrrw sp, sscratch, sp
    addi  sp, sp, -{frame}
    sd    x1, 8(sp)
    sd    x3, 24(sp)
    sd    x4, 32(sp)
    sd    x5, 40(sp)
    sd    x6, 48(sp)
    sd    x7, 56(sp)
    sd    x8, 64(sp)
    sd    x9, 72(sp)
    sd    x10, 80(sp)
    sd    x11, 88(sp)
    sd    x12, 96(sp)
    sd    x13, 104(sp)
    sd    x14, 112(sp)
    sd    x15, 120(sp)
    sd    x16, 128(sp)
    sd    x17, 136(sp)
    sd    x18, 144(sp)
    sd    x19, 152(sp)
    sd    x20, 160(sp)
    sd    x21, 168(sp)
    sd    x22, 176(sp)
    sd    x23, 184(sp)
    sd    x24, 192(sp)
    sd    x25, 200(sp)
    sd    x26, 208(sp)
    sd    x27, 216(sp)
    sd    x28, 224(sp)
    sd    x29, 232(sp)
    sd    x30, 240(sp)
    sd    x31, 248(sp)
    csrr  t0, sscratch
    sd    t0, 16(sp)
    csrr  t0, sepc
    sd    t0, 256(sp)
    csrr  t0, sstatus
    sd    t0, 264(sp)
    csrr  t0, scause
    sd    t0, 272(sp)
    csrr  t0, stval
    sd    t0, 280(sp)
    ld    tp, {cpu_slot}(sp)
    addi  t0, sp, {frame}
    csrw  sscratch, t0
    mv    a0, sp
    call  __axon_trap_rust
    ld    t0, 256(sp)
    csrw  sepc, t0
    ld    t0, 264(sp)
    csrw  sstatus, t0
    ld    x1, 8(sp)
    ld    x3, 24(sp)
    ld    x4, 32(sp)
    ld    x5, 40(sp)
    ld    x6, 48(sp)
    ld    x7, 56(sp)
    ld    x8, 64(sp)
    ld    x9, 72(sp)
    ld    x10, 80(sp)
    ld    x11, 88(sp)
    ld    x12, 96(sp)
    ld    x13, 104(sp)
    ld    x14, 112(sp)
    ld    x15, 120(sp)
    ld    x16, 128(sp)
    ld    x17, 136(sp)
    ld    x18, 144(sp)
    ld    x19, 152(sp)
    ld    x20, 160(sp)
    ld    x21, 168(sp)
    ld    x22, 176(sp)
    ld    x23, 184(sp)
    ld    x24, 192(sp)
    ld    x25, 200(sp)
    ld    x26, 208(sp)
    ld    x27, 216(sp)
    ld    x28, 224(sp)
    ld    x29, 232(sp)
    ld    x30, 240(sp)
    ld    x31, 248(sp)
    ld    x2, 16(sp)
    sret

    .section .text.__axon_secondary_start, "ax", @progbits
    .globl __axon_secondary_start
    .align 4
__axon_secondary_start:
    /* SBI HSM contract: a0=hartid, a1=opaque. We pass stack-top via opaque. */
    mv    sp, a1
    .option push
    .option norelax
    la    gp, __global_pointer$
    .option pop
    tail  __axon_secondary_rust
"#,
    frame = const TRAP_FRAME_RESERVE,
    cpu_slot = const TRAP_FRAME_RESERVE - 8,
);

/// Bytes reserved below the trap stack top: the frame plus the CPU slot.
pub const TRAP_FRAME_RESERVE: usize = core::mem::size_of::<crate::trap::TrapFrame>() + 16;

/// FPU capability detected on a hart.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FpuKind {
    /// No floating-point unit; save/restore are no-ops.
    None,
    /// F extension only (32-bit registers).
    Single,
    /// D extension (64-bit registers).
    Double,
}

/// Floating-point register file save area owned by each thread.
#[repr(C, align(16))]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FpuArea {
    pub f: [u64; 32],
    pub fcsr: u32,
}

impl FpuArea {
    pub const fn zeroed() -> Self {
        Self { f: [0; 32], fcsr: 0 }
    }
}

impl Default for FpuArea {
    fn default() -> Self {
        Self::zeroed()
    }
}

/// Save/restore routines resolved once per core at bring-up.
#[derive(Clone, Copy)]
pub struct FpuOps {
    pub kind: FpuKind,
    pub save: fn(&mut FpuArea),
    pub restore: fn(&FpuArea),
}

impl FpuOps {
    pub fn for_kind(kind: FpuKind) -> Self {
        match kind {
            FpuKind::None => Self { kind, save: fpu_save_none, restore: fpu_restore_none },
            FpuKind::Single => Self { kind, save: fpu_save_single, restore: fpu_restore_single },
            FpuKind::Double => Self { kind, save: fpu_save_double, restore: fpu_restore_double },
        }
    }
}

impl core::fmt::Debug for FpuOps {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FpuOps").field("kind", &self.kind).finish()
    }
}

fn fpu_save_none(_area: &mut FpuArea) {}
fn fpu_restore_none(_area: &FpuArea) {}

// Emulated register file for host builds; lets the dispatcher's save/restore
// path run unchanged in unit tests.
#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
static HOST_FPREGS: Mutex<FpuArea> = Mutex::new(FpuArea::zeroed());

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
fn fpu_save_single(area: &mut FpuArea) {
    let regs = HOST_FPREGS.lock();
    for (dst, src) in area.f.iter_mut().zip(regs.f.iter()) {
        *dst = *src & 0xffff_ffff;
    }
    area.fcsr = regs.fcsr;
}

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
fn fpu_restore_single(area: &FpuArea) {
    let mut regs = HOST_FPREGS.lock();
    for (dst, src) in regs.f.iter_mut().zip(area.f.iter()) {
        *dst = *src & 0xffff_ffff;
    }
    regs.fcsr = area.fcsr;
}

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
fn fpu_save_double(area: &mut FpuArea) {
    *area = *HOST_FPREGS.lock();
}

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
fn fpu_restore_double(area: &FpuArea) {
    *HOST_FPREGS.lock() = *area;
}

/// Returns a copy of the emulated host FPU register file.
#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub fn host_fpu_registers() -> FpuArea {
    *HOST_FPREGS.lock()
}

/// Overwrites the emulated host FPU register file.
#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub fn set_host_fpu_registers(area: &FpuArea) {
    *HOST_FPREGS.lock() = *area;
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
const SSTATUS_FS_INITIAL: usize = 1 << 13;

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
#[inline]
fn enable_fs() {
    // SAFETY: setting FS lets the following instructions touch f-registers.
    unsafe {
        core::arch::asm!("csrs sstatus, {0}", in(reg) SSTATUS_FS_INITIAL, options(nostack));
    }
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
macro_rules! fp_regs_op {
    ($op:literal, $stride:literal, $base:expr) => {
        core::arch::asm!(
            concat!($op, " f0, 0*", $stride, "({0})"), concat!($op, " f1, 1*", $stride, "({0})"),
            concat!($op, " f2, 2*", $stride, "({0})"), concat!($op, " f3, 3*", $stride, "({0})"),
            concat!($op, " f4, 4*", $stride, "({0})"), concat!($op, " f5, 5*", $stride, "({0})"),
            concat!($op, " f6, 6*", $stride, "({0})"), concat!($op, " f7, 7*", $stride, "({0})"),
            concat!($op, " f8, 8*", $stride, "({0})"), concat!($op, " f9, 9*", $stride, "({0})"),
            concat!($op, " f10, 10*", $stride, "({0})"), concat!($op, " f11, 11*", $stride, "({0})"),
            concat!($op, " f12, 12*", $stride, "({0})"), concat!($op, " f13, 13*", $stride, "({0})"),
            concat!($op, " f14, 14*", $stride, "({0})"), concat!($op, " f15, 15*", $stride, "({0})"),
            concat!($op, " f16, 16*", $stride, "({0})"), concat!($op, " f17, 17*", $stride, "({0})"),
            concat!($op, " f18, 18*", $stride, "({0})"), concat!($op, " f19, 19*", $stride, "({0})"),
            concat!($op, " f20, 20*", $stride, "({0})"), concat!($op, " f21, 21*", $stride, "({0})"),
            concat!($op, " f22, 22*", $stride, "({0})"), concat!($op, " f23, 23*", $stride, "({0})"),
            concat!($op, " f24, 24*", $stride, "({0})"), concat!($op, " f25, 25*", $stride, "({0})"),
            concat!($op, " f26, 26*", $stride, "({0})"), concat!($op, " f27, 27*", $stride, "({0})"),
            concat!($op, " f28, 28*", $stride, "({0})"), concat!($op, " f29, 29*", $stride, "({0})"),
            concat!($op, " f30, 30*", $stride, "({0})"), concat!($op, " f31, 31*", $stride, "({0})"),
            in(reg) $base,
            options(nostack),
        )
    };
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
fn fpu_save_single(area: &mut FpuArea) {
    enable_fs();
    let base = area.f.as_mut_ptr() as usize;
    let fcsr: usize;
    // SAFETY: `base` points at 32 * 8 writable bytes; stride 8 keeps each value in its own slot.
    unsafe {
        fp_regs_op!("fsw", "8", base);
        core::arch::asm!("frcsr {0}", out(reg) fcsr, options(nostack));
    }
    area.fcsr = fcsr as u32;
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
fn fpu_restore_single(area: &FpuArea) {
    enable_fs();
    let base = area.f.as_ptr() as usize;
    // SAFETY: `base` points at the saved register image.
    unsafe {
        fp_regs_op!("flw", "8", base);
        core::arch::asm!("fscsr {0}", in(reg) area.fcsr as usize, options(nostack));
    }
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
fn fpu_save_double(area: &mut FpuArea) {
    enable_fs();
    let base = area.f.as_mut_ptr() as usize;
    let fcsr: usize;
    // SAFETY: `base` points at 32 * 8 writable bytes.
    unsafe {
        fp_regs_op!("fsd", "8", base);
        core::arch::asm!("frcsr {0}", out(reg) fcsr, options(nostack));
    }
    area.fcsr = fcsr as u32;
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
fn fpu_restore_double(area: &FpuArea) {
    enable_fs();
    let base = area.f.as_ptr() as usize;
    // SAFETY: `base` points at the saved register image.
    unsafe {
        fp_regs_op!("fld", "8", base);
        core::arch::asm!("fscsr {0}", in(reg) area.fcsr as usize, options(nostack));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_ops_leave_area_untouched() {
        let ops = FpuOps::for_kind(FpuKind::None);
        let mut area = FpuArea::zeroed();
        area.f[3] = 0xdead;
        (ops.save)(&mut area);
        assert_eq!(area.f[3], 0xdead);
    }

    #[test]
    fn single_precision_truncates_to_32_bits() {
        let ops = FpuOps::for_kind(FpuKind::Single);
        let mut area = FpuArea::zeroed();
        area.f[0] = 0x1_0000_0001;
        (ops.restore)(&area);
        let mut saved = FpuArea::zeroed();
        (ops.save)(&mut saved);
        assert_eq!(saved.f[0] & !0xffff_ffff, 0);
    }
}
