// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Minimal structured logging with severity levels
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests (host sink)
//! PUBLIC API: log_* macros, emit(level,target,args), recent_lines() (host)
//! DEPENDS_ON: uart::KernelUart (target), spin::Mutex (host ring)
//! INVARIANTS: Debug/Trace only in debug builds or with `debug_uart`; single-line emission

use core::fmt::Arguments;

/// Logging severity used by the kernel.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Level {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

impl Level {
    const fn tag(self) -> &'static str {
        match self {
            Level::Error => "ERROR",
            Level::Warn => "WARN",
            Level::Info => "INFO",
            Level::Debug => "DEBUG",
            Level::Trace => "TRACE",
        }
    }

    const fn enabled(self) -> bool {
        match self {
            Level::Debug | Level::Trace => cfg!(debug_assertions) || cfg!(feature = "debug_uart"),
            _ => true,
        }
    }
}

/// Emits a structured log line if the level is enabled for the current build.
pub fn emit(level: Level, target: &'static str, args: Arguments<'_>) {
    if !level.enabled() {
        return;
    }
    sink::write_line(level.tag(), target, args);
}

#[cfg(all(target_arch = "riscv64", target_os = "none"))]
mod sink {
    use core::fmt::{Arguments, Write};

    pub(super) fn write_line(tag: &str, target: &str, args: Arguments<'_>) {
        let mut uart = crate::uart::KernelUart::lock();
        let writer = &mut *uart;
        let _ = write!(writer, "[{} {}] ", tag, target);
        let _ = writer.write_fmt(args);
        let _ = writer.write_char('\n');
    }
}

#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
mod sink {
    use alloc::{collections::VecDeque, format, string::String, vec::Vec};
    use core::fmt::Arguments;
    use spin::Mutex;

    /// Lines kept by the host ring before the oldest is dropped.
    const HOST_RING_LINES: usize = 1024;

    static HOST_RING: Mutex<VecDeque<String>> = Mutex::new(VecDeque::new());

    pub(super) fn write_line(tag: &str, target: &str, args: Arguments<'_>) {
        let line = format!("[{} {}] {}", tag, target, args);
        let mut ring = HOST_RING.lock();
        if ring.len() == HOST_RING_LINES {
            ring.pop_front();
        }
        ring.push_back(line);
    }

    pub(super) fn snapshot() -> Vec<String> {
        HOST_RING.lock().iter().cloned().collect()
    }
}

/// Returns the lines currently held by the host log ring (oldest first).
#[cfg(not(all(target_arch = "riscv64", target_os = "none")))]
pub fn recent_lines() -> alloc::vec::Vec<alloc::string::String> {
    sink::snapshot()
}

#[macro_export]
macro_rules! log_error {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Error, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Error, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_warn {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Warn, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Warn, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_info {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Info, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Info, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_debug {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Debug, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Debug, module_path!(), format_args!($($arg)+));
    }};
}

#[macro_export]
macro_rules! log_trace {
    (target: $target:expr, $($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Trace, $target, format_args!($($arg)+));
    }};
    ($($arg:tt)+) => {{
        $crate::diag::log::emit($crate::diag::log::Level::Trace, module_path!(), format_args!($($arg)+));
    }};
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn info_lines_reach_host_ring() {
        log_info!(target: "diag-test", "marker value={}", 7);
        let lines = recent_lines();
        assert!(lines.iter().any(|l| l == "[INFO diag-test] marker value=7"));
    }

    #[test]
    fn debug_respects_build_profile() {
        assert_eq!(Level::Debug.enabled(), cfg!(debug_assertions) || cfg!(feature = "debug_uart"));
        assert!(Level::Error.enabled());
    }
}
