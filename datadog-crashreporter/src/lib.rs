// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! In-process crash capture to structured on-disk reports.
//!
//! When the host process hits a fatal fault (a fatal POSIX signal, a
//! Rust panic, a wedged main thread, or a condition the host reports
//! itself), this engine captures a self-contained JSON snapshot of the
//! process to disk: every thread's backtrace and registers, the loaded
//! images, system facts, application state, and (when a runtime
//! introspector is registered) the objects reachable from the crashed
//! thread's registers and stack. A later, unconstrained pass
//! ([`fixer::ReportFixer`]) demangles symbol names and reformats
//! timestamps without needing the dead process.
//!
//! The capture path is the hard part: from the moment a signal handler
//! runs until the report file is closed, the engine restricts itself to
//! async-signal-safe syscalls and pre-allocated or static storage. See
//! [`json`] for the allocation-free encoder and [`monitors`] for how
//! fault sources cooperate and how recursive faults degrade to a minimal
//! "recrash" report instead of losing the first capture.
//!
//! ```no_run
//! use datadog_crashreporter::{install, CrashReporterConfiguration, MonitorType};
//!
//! let config = CrashReporterConfiguration::new(
//!     "/var/lib/myapp/crash".into(),
//!     "myapp".to_string(),
//!     MonitorType::PRODUCTION_SAFE_MINIMAL,
//! )?;
//! install(config)?;
//! # Ok::<(), anyhow::Error>(())
//! ```

#![cfg(unix)]

pub mod api;
pub mod context;
pub mod fault;
pub mod fixer;
pub mod introspect;
pub mod json;
pub mod memory;
pub mod monitors;
pub mod report;
pub mod shared;
pub mod stack;
pub mod state;
pub mod store;
pub mod system;

pub use api::{
    add_user_report, crashed_last_launch, delete_all_reports, delete_report, install,
    notify_app_active, notify_app_in_foreground, notify_app_terminate, read_fixed_report,
    read_report, report_count, report_ids, report_user_exception, set_user_info_json,
    watch_current_thread_for_deadlocks, watchdog_pulse,
};
pub use context::add_reserved_thread;
pub use fault::{FaultContext, FaultKind, FaultPayload};
pub use fixer::{Demangler, ReportFixer};
pub use introspect::{
    install_introspector, note_deallocated, note_deallocated_exception, note_reallocated,
    ObjectClass, ObjectIntrospector,
};
pub use monitors::{get_active_monitors, set_active_monitors, MonitorType};
pub use shared::configuration::{CrashReporterConfiguration, UserSectionCallback};

/// Writes directly to stderr, bypassing the allocator and any locks.
/// The only logging primitive legal inside a compromised context.
pub fn write_stderr(s: &str) {
    // SAFETY: writing caller bytes to fd 2.
    unsafe {
        libc::write(2, s.as_ptr() as *const libc::c_void, s.len());
    }
}
