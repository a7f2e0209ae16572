// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Kernel diagnostics (structured logging)
//! OWNERS: @kernel-team
//! PUBLIC API: log_* macros, log::emit, log::recent_lines (host)

#[macro_use]
pub mod log;
