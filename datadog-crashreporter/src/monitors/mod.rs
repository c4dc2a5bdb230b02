// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fault-source registry and the dispatcher that serializes captures.
//!
//! Each fault source is a monitor with three capabilities: arm/disarm,
//! report armed state, and enrich a `FaultContext` built by whichever
//! monitor actually fired. The dispatcher owns the process-wide capture
//! state: the sticky "a signal-context capture happened" bit, the
//! handling-fatal flag that detects recursive faults, and the single
//! on-fault callback wired by the installer.

pub mod deadlock;
pub mod panic;
pub mod signal;
pub mod user;

use crate::context;
use crate::fault::FaultContext;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::ptr;
use std::sync::atomic::{AtomicBool, AtomicPtr, Ordering::SeqCst};
use std::sync::OnceLock;

/// Bit-flag identifying a fault source. Flag-set compatible so enrichers
/// and the installer mask can test membership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct MonitorType(pub u32);

impl MonitorType {
    /// Hardware exception port. No fault source on this platform; the bit
    /// exists so masks and reports stay portable.
    pub const MACH_EXCEPTION: Self = Self(0x01);
    /// Fatal POSIX signals.
    pub const SIGNAL: Self = Self(0x02);
    /// Foreign C++ exceptions. No fault source on this platform.
    pub const CPP_EXCEPTION: Self = Self(0x04);
    /// The language-runtime hook: the Rust panic hook.
    pub const PANIC: Self = Self(0x08);
    /// Main-thread watchdog.
    pub const MAIN_THREAD_DEADLOCK: Self = Self(0x10);
    /// Host-invoked captures.
    pub const USER_REPORTED: Self = Self(0x20);
    /// Injects the system-information snapshot into every capture.
    pub const SYSTEM: Self = Self(0x40);
    /// Injects application state into every capture.
    pub const APPLICATION_STATE: Self = Self(0x80);
    /// Tracks recently deallocated objects.
    pub const ZOMBIE: Self = Self(0x100);

    pub const NONE: Self = Self(0);
    pub const ALL: Self = Self(0x1FF);

    /// Sources that take over fault delivery and so fight a debugger.
    pub const DEBUGGER_UNSAFE: Self =
        Self(Self::MACH_EXCEPTION.0 | Self::SIGNAL.0 | Self::CPP_EXCEPTION.0 | Self::PANIC.0);
    /// Sources whose capture runs in an async-signal context.
    pub const ASYNC_SAFE: Self = Self(Self::MACH_EXCEPTION.0 | Self::SIGNAL.0);
    pub const ASYNC_UNSAFE: Self = Self(Self::ALL.0 & !Self::ASYNC_SAFE.0);
    /// Safe to keep armed under a debugger.
    pub const DEBUGGER_SAFE: Self = Self(Self::ALL.0 & !Self::DEBUGGER_UNSAFE.0);
    pub const EXPERIMENTAL: Self = Self(Self::MAIN_THREAD_DEADLOCK.0);
    pub const PRODUCTION_SAFE: Self = Self(Self::ALL.0 & !Self::EXPERIMENTAL.0);
    pub const OPTIONAL: Self = Self(Self::ZOMBIE.0);
    pub const PRODUCTION_SAFE_MINIMAL: Self = Self(Self::PRODUCTION_SAFE.0 & !Self::OPTIONAL.0);
    /// Enrichment-only sources that never trigger a report themselves.
    pub const REQUIRED: Self = Self(Self::SYSTEM.0 | Self::APPLICATION_STATE.0);
    /// Disables automatic capture; only user reports produce reports.
    pub const MANUAL: Self = Self(Self::REQUIRED.0 | Self::USER_REPORTED.0);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Self) -> bool {
        self.0 & other.0 != 0
    }
}

impl std::ops::BitOr for MonitorType {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl std::ops::BitAnd for MonitorType {
    type Output = Self;
    fn bitand(self, rhs: Self) -> Self {
        Self(self.0 & rhs.0)
    }
}

impl std::ops::Not for MonitorType {
    type Output = Self;
    fn not(self) -> Self {
        Self(!self.0 & Self::ALL.0)
    }
}

pub fn monitor_type_name(monitor_type: MonitorType) -> &'static str {
    match monitor_type {
        MonitorType::MACH_EXCEPTION => "mach exception",
        MonitorType::SIGNAL => "signal",
        MonitorType::CPP_EXCEPTION => "c++ exception",
        MonitorType::PANIC => "panic",
        MonitorType::MAIN_THREAD_DEADLOCK => "main thread deadlock",
        MonitorType::USER_REPORTED => "user reported",
        MonitorType::SYSTEM => "system",
        MonitorType::APPLICATION_STATE => "application state",
        MonitorType::ZOMBIE => "zombie",
        _ => "unknown",
    }
}

/// Capability triple every fault source exposes to the registry.
pub(crate) trait Monitor: Sync {
    fn monitor_type(&self) -> MonitorType;
    fn set_enabled(&self, enabled: bool);
    fn is_enabled(&self) -> bool;
    /// Contributes whatever this source knows to a capture in progress.
    /// Runs on the faulting thread, possibly in signal context.
    fn add_contextual_info(&self, ctx: &mut FaultContext);
}

/// Enrichment-only monitor: injects the install-time system snapshot.
struct SystemMonitor {
    enabled: AtomicBool,
}

impl Monitor for SystemMonitor {
    fn monitor_type(&self) -> MonitorType {
        MonitorType::SYSTEM
    }
    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, SeqCst);
    }
    fn is_enabled(&self) -> bool {
        self.enabled.load(SeqCst)
    }
    fn add_contextual_info(&self, ctx: &mut FaultContext) {
        if let Some(global) = crate::api::global() {
            ctx.system = Some(&global.system);
        }
    }
}

static SYSTEM_MONITOR: SystemMonitor = SystemMonitor {
    enabled: AtomicBool::new(false),
};

/// Enrichment-only monitor: embeds the current application-state counters.
struct AppStateMonitor {
    enabled: AtomicBool,
}

impl Monitor for AppStateMonitor {
    fn monitor_type(&self) -> MonitorType {
        MonitorType::APPLICATION_STATE
    }
    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, SeqCst);
    }
    fn is_enabled(&self) -> bool {
        self.enabled.load(SeqCst)
    }
    fn add_contextual_info(&self, ctx: &mut FaultContext) {
        if let Some(global) = crate::api::global() {
            ctx.app_state = global.state.try_snapshot();
        }
    }
}

static APP_STATE_MONITOR: AppStateMonitor = AppStateMonitor {
    enabled: AtomicBool::new(false),
};

/// Gate for the zombie registry. The registry itself is fed by the host
/// runtime and consulted directly by the writer; the monitor only
/// controls whether that happens.
struct ZombieMonitor {
    enabled: AtomicBool,
}

impl Monitor for ZombieMonitor {
    fn monitor_type(&self) -> MonitorType {
        MonitorType::ZOMBIE
    }
    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, SeqCst);
    }
    fn is_enabled(&self) -> bool {
        self.enabled.load(SeqCst)
    }
    fn add_contextual_info(&self, _ctx: &mut FaultContext) {}
}

static ZOMBIE_MONITOR: ZombieMonitor = ZombieMonitor {
    enabled: AtomicBool::new(false),
};

pub(crate) fn zombie_monitor_enabled() -> bool {
    ZOMBIE_MONITOR.is_enabled()
}

/// Registry order is enrichment order.
fn registry() -> [&'static dyn Monitor; 7] {
    [
        &signal::SIGNAL_MONITOR,
        &panic::PANIC_MONITOR,
        &deadlock::DEADLOCK_MONITOR,
        &user::USER_MONITOR,
        &SYSTEM_MONITOR,
        &APP_STATE_MONITOR,
        &ZOMBIE_MONITOR,
    ]
}

// Process-wide capture state. Initialized by the installer, mutated only
// here, never destroyed.
static HANDLING_FATAL: AtomicBool = AtomicBool::new(false);
static REQUIRES_ASYNC_SAFETY: AtomicBool = AtomicBool::new(false);
static CRASHED_DURING_CRASH_HANDLING: AtomicBool = AtomicBool::new(false);

type FaultCallback = Box<dyn Fn(&mut FaultContext) + Send + Sync>;
static ON_FAULT: AtomicPtr<FaultCallback> = AtomicPtr::new(ptr::null_mut());

/// Wires the single on-fault callback. Old callbacks are leaked: the
/// fault path may be holding one.
pub(crate) fn set_fault_callback(callback: FaultCallback) {
    let ptr = Box::into_raw(Box::new(callback));
    ON_FAULT.swap(ptr, SeqCst);
}

fn fault_callback() -> Option<&'static FaultCallback> {
    let ptr = ON_FAULT.load(SeqCst);
    if ptr.is_null() {
        return None;
    }
    // SAFETY: set only from Box::into_raw above and never freed.
    Some(unsafe { &*ptr })
}

/// Applies `mask` after the two safety filters:
/// - with a debugger attached, debugger-unsafe bits are cleared (with a
///   one-time warning);
/// - once any signal-context capture has happened, async-unsafe bits are
///   cleared for the remainder of the process.
pub fn set_active_monitors(mask: MonitorType) {
    let mut effective = mask;
    if is_debugger_attached() && effective.intersects(MonitorType::DEBUGGER_UNSAFE) {
        warn_about_debugger_once();
        effective = effective & !MonitorType::DEBUGGER_UNSAFE;
    }
    if REQUIRES_ASYNC_SAFETY.load(SeqCst) && effective.intersects(MonitorType::ASYNC_UNSAFE) {
        effective = effective & !MonitorType::ASYNC_UNSAFE;
    }
    for monitor in registry() {
        monitor.set_enabled(effective.contains(monitor.monitor_type()));
    }
}

/// The monitors currently armed, as reported by each monitor.
pub fn get_active_monitors() -> MonitorType {
    let mut active = MonitorType::NONE;
    for monitor in registry() {
        if monitor.is_enabled() {
            active = active | monitor.monitor_type();
        }
    }
    active
}

/// Called by a monitor the moment it commits to capturing a fatal fault,
/// before it builds the `FaultContext`. Returns true when this capture is
/// itself interrupting an earlier one (the recrash case).
pub fn notify_fatal_exception_captured(is_async_safe_environment: bool) -> bool {
    if is_async_safe_environment {
        // Sticky for the life of the process.
        REQUIRES_ASYNC_SAFETY.store(true, SeqCst);
    }
    if HANDLING_FATAL.swap(true, SeqCst) {
        CRASHED_DURING_CRASH_HANDLING.store(true, SeqCst);
        set_active_monitors(MonitorType::NONE);
        return true;
    }
    false
}

/// Routes a populated `FaultContext` through enrichment to the installed
/// on-fault callback, then settles the monitor state for what comes next:
/// a user report lets the process continue; a fatal capture disarms
/// everything so the re-raised fault reaches the OS default action.
pub fn handle_exception(ctx: &mut FaultContext) {
    ctx.requires_async_safety = REQUIRES_ASYNC_SAFETY.load(SeqCst);
    ctx.crashed_during_crash_handling = CRASHED_DURING_CRASH_HANDLING.load(SeqCst);

    // Freeze the peers for the duration of enrichment and writing. On a
    // recrash they are already frozen and this is a no-op.
    if !ctx.offending_context.is_null() && !ctx.omit_peer_threads {
        // SAFETY: the triggering monitor owns the context for this call.
        context::suspend_environment(unsafe { &*ctx.offending_context });
    }

    for monitor in registry() {
        if monitor.is_enabled() {
            monitor.add_contextual_info(ctx);
        }
    }

    if let Some(callback) = fault_callback() {
        callback(ctx);
    }

    if ctx.is_user_reported {
        HANDLING_FATAL.store(false, SeqCst);
        context::resume_environment();
    } else if !ctx.crashed_during_crash_handling {
        // Disarming everything lets the re-raised fault take the default
        // action; peers are thawed so the kernel can terminate them
        // normally. On a recrash the peers stay frozen and the second
        // fault ends the process directly.
        set_active_monitors(MonitorType::NONE);
        context::resume_environment();
    }
}

pub(crate) fn is_handling_fatal_exception() -> bool {
    HANDLING_FATAL.load(SeqCst)
}

#[cfg(test)]
pub(crate) fn reset_dispatcher_for_tests() {
    HANDLING_FATAL.store(false, SeqCst);
    REQUIRES_ASYNC_SAFETY.store(false, SeqCst);
    CRASHED_DURING_CRASH_HANDLING.store(false, SeqCst);
}

/// Whether a debugger is tracing this process, per the TracerPid field.
/// Checked once; attaching mid-run does not retroactively disarm.
pub fn is_debugger_attached() -> bool {
    static ATTACHED: OnceLock<bool> = OnceLock::new();
    *ATTACHED.get_or_init(|| {
        let mut contents = String::new();
        let Ok(mut file) = std::fs::File::open("/proc/self/status") else {
            return false;
        };
        if file.read_to_string(&mut contents).is_err() {
            return false;
        }
        contents
            .lines()
            .find_map(|line| line.strip_prefix("TracerPid:"))
            .and_then(|rest| rest.trim().parse::<i32>().ok())
            .map(|pid| pid != 0)
            .unwrap_or(false)
    })
}

fn warn_about_debugger_once() {
    static WARNED: AtomicBool = AtomicBool::new(false);
    if !WARNED.swap(true, SeqCst) {
        log::warn!(
            "a debugger is attached; fault-interception monitors stay disarmed \
             so breakpoints keep working"
        );
    }
}

// Dispatcher state is process-global; tests that touch it serialize.
#[cfg(test)]
pub(crate) static DISPATCH_LOCK: std::sync::Mutex<()> = std::sync::Mutex::new(());

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fault::{FaultContext, FaultKind};
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_mask_algebra_matches_flag_table() {
        assert_eq!(MonitorType::ALL.0, 0x1FF);
        assert!(MonitorType::ALL.contains(MonitorType::SIGNAL));
        assert!(MonitorType::DEBUGGER_UNSAFE.contains(MonitorType::PANIC));
        assert!(!MonitorType::ASYNC_SAFE.contains(MonitorType::USER_REPORTED));
        assert_eq!(
            MonitorType::ASYNC_UNSAFE,
            MonitorType::ALL & !MonitorType::ASYNC_SAFE
        );
        assert!(MonitorType::MANUAL.contains(MonitorType::USER_REPORTED));
        assert!(MonitorType::MANUAL.contains(MonitorType::SYSTEM));
        assert!(!MonitorType::PRODUCTION_SAFE.contains(MonitorType::MAIN_THREAD_DEADLOCK));
        assert!(!MonitorType::PRODUCTION_SAFE_MINIMAL.contains(MonitorType::ZOMBIE));
    }

    #[test]
    fn test_monitor_type_names() {
        assert_eq!(monitor_type_name(MonitorType::SIGNAL), "signal");
        assert_eq!(monitor_type_name(MonitorType::ZOMBIE), "zombie");
        assert_eq!(monitor_type_name(MonitorType(0x8000)), "unknown");
    }

    #[test]
    fn test_enrichment_only_monitors_toggle() {
        let _guard = DISPATCH_LOCK.lock().unwrap();
        set_active_monitors(MonitorType::REQUIRED);
        let active = get_active_monitors();
        assert!(active.contains(MonitorType::SYSTEM));
        assert!(active.contains(MonitorType::APPLICATION_STATE));
        assert!(!active.contains(MonitorType::ZOMBIE));
        set_active_monitors(MonitorType::NONE);
        assert_eq!(get_active_monitors(), MonitorType::NONE);
    }

    #[test]
    fn test_async_unsafe_bits_cleared_after_signal_capture() {
        let _guard = DISPATCH_LOCK.lock().unwrap();
        reset_dispatcher_for_tests();
        // First fatal capture in an async-safe environment...
        assert!(!notify_fatal_exception_captured(true));
        // ...permanently filters async-unsafe monitors from any mask.
        set_active_monitors(MonitorType::REQUIRED | MonitorType::ZOMBIE);
        assert_eq!(get_active_monitors(), MonitorType::NONE);
        reset_dispatcher_for_tests();
        set_active_monitors(MonitorType::NONE);
    }

    #[test]
    fn test_recursion_detected() {
        let _guard = DISPATCH_LOCK.lock().unwrap();
        reset_dispatcher_for_tests();
        assert!(!notify_fatal_exception_captured(false));
        assert!(notify_fatal_exception_captured(false));
        assert!(is_handling_fatal_exception());
        reset_dispatcher_for_tests();
    }

    #[test]
    fn test_user_report_clears_handling_flag() {
        let _guard = DISPATCH_LOCK.lock().unwrap();
        reset_dispatcher_for_tests();
        static CALLS: AtomicUsize = AtomicUsize::new(0);
        set_fault_callback(Box::new(|_ctx| {
            CALLS.fetch_add(1, SeqCst);
        }));
        assert!(!notify_fatal_exception_captured(false));
        let mut ctx = FaultContext::new(FaultKind::UserReported);
        ctx.is_user_reported = true;
        handle_exception(&mut ctx);
        assert_eq!(CALLS.load(SeqCst), 1);
        assert!(!is_handling_fatal_exception());
        reset_dispatcher_for_tests();
    }

    #[test]
    fn test_fatal_capture_disarms_monitors() {
        let _guard = DISPATCH_LOCK.lock().unwrap();
        reset_dispatcher_for_tests();
        set_fault_callback(Box::new(|_ctx| {}));
        set_active_monitors(MonitorType::REQUIRED);
        assert!(!notify_fatal_exception_captured(false));
        let mut ctx = FaultContext::new(FaultKind::LanguageException);
        handle_exception(&mut ctx);
        assert_eq!(get_active_monitors(), MonitorType::NONE);
        reset_dispatcher_for_tests();
    }
}
