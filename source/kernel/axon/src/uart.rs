// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! NS16550A UART on the QEMU `virt` machine, used as the log sink.
//!
//! The device is reached at its physical address until the kernel address
//! space is live; `relocate` then moves accesses to the kernel-half alias so
//! logging keeps working while a user address space is loaded.

use core::fmt::{self, Write};
use core::sync::atomic::{AtomicUsize, Ordering};
use spin::Mutex;

pub const UART0_PHYS: usize = 0x1000_0000;
const UART_TX: usize = 0x0;
const UART_LSR: usize = 0x5;
const LSR_TX_IDLE: u8 = 1 << 5;

static UART_BASE: AtomicUsize = AtomicUsize::new(UART0_PHYS);
static UART0: Mutex<KernelUart> = Mutex::new(KernelUart);

/// Switches MMIO accesses to `base` (the kernel-half alias of the device).
pub fn relocate(base: usize) {
    UART_BASE.store(base, Ordering::Release);
}

/// UART implementation capable of formatted writes.
pub struct KernelUart;

impl KernelUart {
    /// Returns a guard for the boot UART singleton.
    pub fn lock() -> spin::MutexGuard<'static, KernelUart> {
        UART0.lock()
    }
}

fn put(value: u8) {
    let base = UART_BASE.load(Ordering::Acquire);
    // SAFETY: `base` is the UART MMIO window mapped in the active address space.
    unsafe {
        while core::ptr::read_volatile((base + UART_LSR) as *const u8) & LSR_TX_IDLE == 0 {}
        core::ptr::write_volatile((base + UART_TX) as *mut u8, value);
    }
}

fn put_str(s: &str) {
    for &byte in s.as_bytes() {
        if byte == b'\n' {
            put(b'\r');
        }
        put(byte);
    }
}

impl Write for KernelUart {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        put_str(s);
        Ok(())
    }
}

/// Lock-free writer for panic context, where the UART mutex may already be held.
pub struct RawUart;

impl Write for RawUart {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        put_str(s);
        Ok(())
    }
}

pub fn raw_writer() -> RawUart {
    RawUart
}
