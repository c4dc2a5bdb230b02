// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Main-thread deadlock watchdog.
//!
//! The host registers its main thread and pulses the watchdog from that
//! thread's event loop. A dedicated watchdog thread (registered as
//! reserved, so captures never freeze it) checks for the pulse on the
//! configured interval; a missed pulse means the main thread has been
//! wedged for at least one full interval, and a fault of kind
//! `MainThreadDeadlock` is synthesized against it.

use super::{Monitor, MonitorType};
use crate::context::{self, MachineContext, Tid};
use crate::fault::{FaultContext, FaultKind};
use crate::stack::StackCursor;
use crate::shared::constants::{MAX_THREADS, STACK_OVERFLOW_THRESHOLD};
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering::SeqCst};
use std::time::Duration;

pub(crate) struct DeadlockMonitor {
    enabled: AtomicBool,
    interval_ms: AtomicU64,
    watched_tid: AtomicI32,
    pulsed: AtomicBool,
    watchdog_running: AtomicBool,
}

pub(crate) static DEADLOCK_MONITOR: DeadlockMonitor = DeadlockMonitor {
    enabled: AtomicBool::new(false),
    interval_ms: AtomicU64::new(0),
    watched_tid: AtomicI32::new(0),
    pulsed: AtomicBool::new(true),
    watchdog_running: AtomicBool::new(false),
};

impl DeadlockMonitor {
    /// Sets the watchdog interval. Zero keeps the monitor dormant no
    /// matter what the monitor mask says.
    pub(crate) fn set_interval(&self, interval: Duration) {
        self.interval_ms.store(interval.as_millis() as u64, SeqCst);
    }

    /// Marks the calling thread as the one being watched. Must be called
    /// from the host's main thread before pulses begin.
    pub(crate) fn watch_current_thread(&self) {
        self.watched_tid.store(context::gettid(), SeqCst);
    }

    /// Proof of life, called from the watched thread's event loop.
    pub(crate) fn pulse(&self) {
        self.pulsed.store(true, SeqCst);
    }

    fn spawn_watchdog(&'static self) {
        if self.watchdog_running.swap(true, SeqCst) {
            return;
        }
        let spawned = std::thread::Builder::new()
            .name("crash-watchdog".to_string())
            .spawn(move || {
                context::add_reserved_thread(context::gettid());
                self.watchdog_loop();
            });
        if let Err(e) = spawned {
            log::error!("could not start deadlock watchdog: {e}");
            self.watchdog_running.store(false, SeqCst);
        }
    }

    fn watchdog_loop(&self) {
        loop {
            let interval_ms = self.interval_ms.load(SeqCst);
            if !self.enabled.load(SeqCst) || interval_ms == 0 {
                // Dormant; poll for re-arming at a slow cadence.
                std::thread::sleep(Duration::from_millis(500));
                continue;
            }
            self.pulsed.store(false, SeqCst);
            std::thread::sleep(Duration::from_millis(interval_ms));
            if !self.enabled.load(SeqCst) {
                continue;
            }
            let watched = self.watched_tid.load(SeqCst);
            if watched == 0 {
                continue;
            }
            if !self.pulsed.load(SeqCst) {
                capture_deadlock(watched);
                // Capture disarms all monitors; the abort below delivers
                // the fatal action on the watchdog thread.
                std::process::abort();
            }
        }
    }
}

impl Monitor for DeadlockMonitor {
    fn monitor_type(&self) -> MonitorType {
        MonitorType::MAIN_THREAD_DEADLOCK
    }

    fn set_enabled(&self, enabled: bool) {
        let armed = enabled && self.interval_ms.load(SeqCst) > 0;
        self.enabled.store(armed, SeqCst);
        if armed {
            DEADLOCK_MONITOR.spawn_watchdog();
        }
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(SeqCst)
    }

    fn add_contextual_info(&self, _ctx: &mut FaultContext) {}
}

fn capture_deadlock(watched: Tid) {
    super::notify_fatal_exception_captured(false);

    // A peer's registers only exist in its suspension slot once it has
    // parked, so the environment is frozen before the wedged thread's
    // context is read. The dispatcher's own suspend call later in
    // `handle_exception` is a no-op within this fault.
    let mut threads = [0 as Tid; MAX_THREADS];
    let count = context::enumerate_task_threads(&mut threads);
    context::suspend::suspend_environment(&threads[..count]);

    let mut machine_context = MachineContext::zeroed();
    context::get_context_for_thread(watched, &mut machine_context, true);
    let mut cursor = StackCursor::from_machine_context(&machine_context, STACK_OVERFLOW_THRESHOLD);

    let mut ctx = FaultContext::new(FaultKind::MainThreadDeadlock);
    ctx.offending_context = &machine_context;
    ctx.stack_cursor = &mut cursor;
    ctx.crash_reason = Some("main thread deadlocked");
    // The parked register image is the wedged thread at the moment of
    // interception; without a park slot there is nothing to vouch for.
    ctx.registers_are_valid = machine_context.has_regs;
    super::handle_exception(&mut ctx);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_disabled_without_interval() {
        let _guard = super::super::DISPATCH_LOCK.lock().unwrap();
        DEADLOCK_MONITOR.set_interval(Duration::ZERO);
        DEADLOCK_MONITOR.set_enabled(true);
        assert!(
            !DEADLOCK_MONITOR.is_enabled(),
            "zero interval must keep the watchdog dormant"
        );
    }

    #[test]
    fn test_pulse_keeps_watchdog_quiet() {
        // Exercise the bookkeeping without arming the real watchdog.
        DEADLOCK_MONITOR.watch_current_thread();
        DEADLOCK_MONITOR.pulse();
        assert!(DEADLOCK_MONITOR.pulsed.load(SeqCst));
        DEADLOCK_MONITOR.pulsed.store(false, SeqCst);
        DEADLOCK_MONITOR.pulse();
        assert!(DEADLOCK_MONITOR.pulsed.load(SeqCst));
    }

    #[test]
    fn test_capture_walks_wedged_thread() {
        use std::sync::atomic::AtomicUsize;
        use std::sync::Arc;

        let _guard = super::super::DISPATCH_LOCK.lock().unwrap();
        super::super::reset_dispatcher_for_tests();
        context::install_suspension_handlers().unwrap();

        // A thread spinning the way a deadlocked event loop would.
        let (tx, rx) = std::sync::mpsc::channel();
        let stop = Arc::new(AtomicBool::new(false));
        let stop_clone = stop.clone();
        let handle = std::thread::spawn(move || {
            tx.send(context::gettid()).unwrap();
            while !stop_clone.load(SeqCst) {
                std::thread::yield_now();
            }
        });
        let wedged = rx.recv().unwrap();

        static CAPTURES: AtomicUsize = AtomicUsize::new(0);
        super::super::set_fault_callback(Box::new(|ctx| {
            assert_eq!(ctx.kind, FaultKind::MainThreadDeadlock);
            assert_eq!(ctx.crash_reason, Some("main thread deadlocked"));
            // SAFETY: the capture keeps the context and cursor alive.
            let mc = unsafe { &*ctx.offending_context };
            assert!(mc.has_regs, "the parked thread must have left registers");
            assert!(ctx.registers_are_valid);
            let cursor = unsafe { &mut *ctx.stack_cursor };
            let mut frames = 0;
            while cursor.advance() {
                assert_ne!(cursor.frame().instruction_address, 0);
                frames += 1;
            }
            assert!(frames >= 1, "the wedged thread's pc must be walkable");
            CAPTURES.fetch_add(1, SeqCst);
        }));

        capture_deadlock(wedged);
        assert_eq!(CAPTURES.load(SeqCst), 1);

        // The fatal path resumed the environment; the peer can be released.
        stop.store(true, SeqCst);
        handle.join().unwrap();
        super::super::set_active_monitors(MonitorType::NONE);
        super::super::reset_dispatcher_for_tests();
    }
}
