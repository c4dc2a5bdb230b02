// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The installer: composes the capture engine and wires the on-crash
//! callback.
//!
//! All process-wide state lives in one heap-allocated [`GlobalState`]
//! reached through an atomic pointer established here. Monitors and the
//! report writer read it without locks; the installer is the only writer.

use crate::context;
use crate::fault::FaultContext;
use crate::fixer::ReportFixer;
use crate::introspect;
use crate::monitors::{self, deadlock::DEADLOCK_MONITOR};
use crate::report::images::refresh_image_table;
use crate::report::writer::{write_recrash_report, write_standard_report};
use crate::shared::configuration::CrashReporterConfiguration;
use crate::shared::constants::MAX_REPORT_PATH;
use crate::state::CrashStateTracker;
use crate::store::ReportStore;
use crate::system::{self, SystemInfo};
use anyhow::Context;
use std::ptr;
use std::sync::atomic::{AtomicPtr, Ordering::SeqCst};
use std::sync::Mutex;

struct PreparedPath {
    bytes: [u8; MAX_REPORT_PATH],
    id: u64,
}

/// Everything the capture path needs, assembled once at install.
pub struct GlobalState {
    pub config: CrashReporterConfiguration,
    pub system: SystemInfo,
    pub state: CrashStateTracker,
    pub store: ReportStore,
    pub console_log_path: Option<String>,
    // The capture path reads the user-info blob without locking; the
    // mutation side swaps whole strings. Replaced strings leak: a capture
    // may still be reading them.
    user_info: AtomicPtr<String>,
    user_info_write_lock: Mutex<()>,
    prepared: AtomicPtr<PreparedPath>,
}

impl GlobalState {
    pub(crate) fn new(config: CrashReporterConfiguration) -> anyhow::Result<Self> {
        config.validate()?;
        std::fs::create_dir_all(&config.install_dir).with_context(|| {
            format!("failed to create {}", config.install_dir.display())
        })?;

        let store = ReportStore::new(
            config.install_dir.join("reports"),
            config.app_name.clone(),
            config.max_report_count,
        )?;
        let state = CrashStateTracker::new(config.install_dir.join("app_state.json"))?;
        let system = system::collect(&config.app_name);

        let console_log_path = rotate_console_log(&config.install_dir, config.print_previous_log);

        let global = Self {
            system,
            state,
            store,
            console_log_path,
            user_info: AtomicPtr::new(ptr::null_mut()),
            user_info_write_lock: Mutex::new(()),
            prepared: AtomicPtr::new(ptr::null_mut()),
            config,
        };
        if let Some(json) = global.config.user_info_json.clone() {
            global.set_user_info(Some(&json))?;
        }
        global.prepare_next_path()?;
        Ok(global)
    }

    /// Replaces the user-info blob appended under the report's `user`
    /// object. Must be a JSON object; stored as its inner key/value pairs
    /// so the writer can splice it without parsing.
    pub fn set_user_info(&self, json: Option<&str>) -> anyhow::Result<()> {
        let _guard = self.user_info_write_lock.lock().unwrap();
        let fresh = match json {
            None => ptr::null_mut(),
            Some(json) => {
                let value: serde_json::Value =
                    serde_json::from_str(json).context("user info is not valid JSON")?;
                anyhow::ensure!(value.is_object(), "user info must be a JSON object");
                let canonical = serde_json::to_string(&value)?;
                let inner = canonical[1..canonical.len() - 1].to_string();
                Box::into_raw(Box::new(inner))
            }
        };
        self.user_info.swap(fresh, SeqCst);
        Ok(())
    }

    /// The `"key":value` pairs of the user-info blob, or None.
    pub(crate) fn user_info_pairs(&self) -> Option<&str> {
        let ptr = self.user_info.load(SeqCst);
        if ptr.is_null() {
            return None;
        }
        // SAFETY: set only from Box::into_raw and never freed.
        let pairs = unsafe { (*ptr).as_str() };
        if pairs.is_empty() {
            None
        } else {
            Some(pairs)
        }
    }

    /// Claims the next report id and renders its path for the fault path.
    pub(crate) fn prepare_next_path(&self) -> anyhow::Result<u64> {
        let id = self.store.next_report_id();
        let mut prepared = PreparedPath {
            bytes: [0; MAX_REPORT_PATH],
            id,
        };
        self.store
            .render_next_path(id, &mut prepared.bytes)
            .context("report path does not fit the prepared buffer")?;
        // Old prepared paths leak; the fault path may hold one.
        self.prepared.swap(Box::into_raw(Box::new(prepared)), SeqCst);
        Ok(id)
    }

    pub(crate) fn prepared_path(&self) -> Option<(&[u8], u64)> {
        let ptr = self.prepared.load(SeqCst);
        if ptr.is_null() {
            return None;
        }
        // SAFETY: set only from Box::into_raw and never freed.
        let prepared = unsafe { &*ptr };
        Some((&prepared.bytes, prepared.id))
    }
}

static GLOBAL: AtomicPtr<GlobalState> = AtomicPtr::new(ptr::null_mut());

pub(crate) fn global() -> Option<&'static GlobalState> {
    let ptr = GLOBAL.load(SeqCst);
    if ptr.is_null() {
        return None;
    }
    // SAFETY: set only from Box::into_raw at install and never freed.
    Some(unsafe { &*ptr })
}

/// Installs the crash reporter: builds the global state, arms the
/// requested monitors, and wires the callback that writes reports through
/// the rotation store.
///
/// PRECONDITIONS:
///     None. Reinstalling replaces the configuration; the previous global
///     state is leaked because the fault path may reference it.
/// SAFETY:
///     Crash-capture functions are not reentrant. No other engine
///     functions should be called concurrently with install.
pub fn install(config: CrashReporterConfiguration) -> anyhow::Result<()> {
    let monitor_mask = config.monitor_mask;
    let watchdog_interval = config.deadlock_watchdog_interval;
    let do_not_introspect = config.do_not_introspect_classes.clone();

    let global_state = Box::new(GlobalState::new(config)?);
    let crashed_last_launch = global_state.state.crashed_last_launch();
    // Earlier launches may have crashed their way past the cap.
    global_state.store.prune_old_reports();
    GLOBAL.swap(Box::into_raw(global_state), SeqCst);

    refresh_image_table();
    if let Err(e) = context::install_suspension_handlers() {
        log::warn!("thread suspension unavailable; peer snapshots will be partial: {e}");
    }
    introspect::set_do_not_introspect_classes(do_not_introspect);
    DEADLOCK_MONITOR.set_interval(watchdog_interval);

    monitors::set_fault_callback(Box::new(on_fault));
    monitors::set_active_monitors(monitor_mask);

    if crashed_last_launch {
        log::info!("previous launch ended in a crash; a report should be on disk");
    }
    log::debug!(
        "crash reporter installed; active monitors: {:#x}",
        monitors::get_active_monitors().0
    );
    Ok(())
}

/// The single on-crash callback: routes the capture to the writer against
/// the pre-rendered report path, then settles state for the outcome.
fn on_fault(ctx: &mut FaultContext) {
    let Some(global) = global() else {
        return;
    };
    if ctx.console_log_path.is_none() {
        ctx.console_log_path = global.console_log_path.as_deref();
    }
    let Some((path, _id)) = global.prepared_path() else {
        return;
    };

    if ctx.crashed_during_crash_handling {
        // The first captor's partial report is at the prepared path;
        // preserve it inside the minimal shell.
        write_recrash_report(ctx, path, global);
    } else {
        write_standard_report(ctx, path, global);
    }

    if ctx.is_user_reported {
        // The process lives on: get ready for the next fault.
        if let Err(e) = global.prepare_next_path() {
            log::error!("could not prepare the next report path: {e:#}");
        }
    } else {
        global.state.notify_app_crash();
    }
    // The rotation cap holds on every capture, fatal ones included;
    // otherwise one crash per launch accumulates past the cap across
    // process lifetimes. Runs last: the report and the crash flag are
    // already safe on disk before this walks the directory.
    global.store.prune_old_reports();
}

/// Captures a user-reported exception. See
/// [`monitors::user::report_user_exception`] for semantics; this is the
/// public entry point once installed.
#[allow(clippy::too_many_arguments)]
pub fn report_user_exception(
    name: &str,
    reason: Option<&str>,
    language: Option<&str>,
    line_of_code: Option<&str>,
    custom_stack: Option<&[usize]>,
    log_all_threads: bool,
    terminate_program: bool,
) {
    monitors::user::report_user_exception(
        name,
        reason,
        language,
        line_of_code,
        custom_stack,
        log_all_threads,
        terminate_program,
    );
}

/// Replaces the user-info JSON appended under the report's `user` object.
pub fn set_user_info_json(json: Option<&str>) -> anyhow::Result<()> {
    match global() {
        Some(global) => global.set_user_info(json),
        None => anyhow::bail!("crash reporter is not installed"),
    }
}

pub fn notify_app_active(active: bool) {
    if let Some(global) = global() {
        global.state.notify_app_active(active);
    }
}

pub fn notify_app_in_foreground(in_foreground: bool) {
    if let Some(global) = global() {
        global.state.notify_app_in_foreground(in_foreground);
    }
}

pub fn notify_app_terminate() {
    if let Some(global) = global() {
        global.state.notify_app_terminate();
    }
}

/// Whether the previous launch ended in a crash.
pub fn crashed_last_launch() -> bool {
    global().map(|g| g.state.crashed_last_launch()).unwrap_or(false)
}

/// Marks the calling thread as the deadlock watchdog's subject.
pub fn watch_current_thread_for_deadlocks() {
    DEADLOCK_MONITOR.watch_current_thread();
}

/// Proof-of-life pulse from the watched thread's event loop.
pub fn watchdog_pulse() {
    DEADLOCK_MONITOR.pulse();
}

pub fn report_count() -> usize {
    global().map(|g| g.store.report_count()).unwrap_or(0)
}

pub fn report_ids() -> Vec<u64> {
    global().map(|g| g.store.report_ids()).unwrap_or_default()
}

pub fn read_report(id: u64) -> anyhow::Result<String> {
    match global() {
        Some(global) => global.store.read_report(id),
        None => anyhow::bail!("crash reporter is not installed"),
    }
}

/// Reads a report and runs the post-mortem fixer over it. An unparseable
/// report comes back unchanged, per the fixer contract.
pub fn read_fixed_report(id: u64) -> anyhow::Result<String> {
    let raw = read_report(id)?;
    Ok(ReportFixer::default().fix_or_raw(&raw).into_owned())
}

pub fn add_user_report(contents: &str) -> anyhow::Result<u64> {
    match global() {
        Some(global) => global.store.add_user_report(contents),
        None => anyhow::bail!("crash reporter is not installed"),
    }
}

pub fn delete_report(id: u64) -> anyhow::Result<()> {
    match global() {
        Some(global) => global.store.delete_report(id),
        None => anyhow::bail!("crash reporter is not installed"),
    }
}

pub fn delete_all_reports() {
    if let Some(global) = global() {
        global.store.delete_all_reports();
    }
}

/// Moves last session's console log aside and optionally echoes it.
fn rotate_console_log(install_dir: &std::path::Path, print_previous: bool) -> Option<String> {
    let current = install_dir.join("console.log");
    let previous = install_dir.join("console.log.previous");
    if current.exists() {
        if let Err(e) = std::fs::rename(&current, &previous) {
            log::warn!("could not rotate console log: {e}");
        }
    }
    if print_previous && previous.exists() {
        match std::fs::read_to_string(&previous) {
            Ok(contents) => print!("{contents}"),
            Err(e) => log::warn!("could not read previous console log: {e}"),
        }
    }
    current.to_str().map(|s| s.to_string())
}
