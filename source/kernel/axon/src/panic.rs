// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Panic handler: prints the failure and the last trap, then parks the hart
//! OWNERS: @kernel-team
//! PUBLIC API: panic handler (no_std)
//! DEPENDS_ON: trap::last_trap(), trap::fmt_trap(), uart::raw_writer()
//! INVARIANTS: No allocations; never takes the logging lock

use core::{fmt::Write, panic::PanicInfo};

use crate::{trap, uart};

#[panic_handler]
fn panic(info: &PanicInfo) -> ! {
    crate::arch::riscv::irq_save();
    let mut w = uart::raw_writer();
    let _ = w.write_str("\nPANIC");
    if let Some(location) = info.location() {
        let _ = write!(w, " at {}:{}", location.file(), location.line());
    }
    let _ = writeln!(w, ": {}", info.message());
    if let Some(frame) = trap::last_trap() {
        let _ = w.write_str("last trap:\n");
        let _ = trap::fmt_trap(&frame, &mut w);
    }
    let _ = w.write_str("hart parked\n");
    loop {
        crate::arch::riscv::wait_for_interrupt();
    }
}
