// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Language-runtime fault source: the Rust panic hook.
//!
//! A panic is not a signal: the hook runs in ordinary execution context on
//! the panicking thread, so allocation is allowed and the capture can be
//! built on the stack. The previous hook is chained afterwards so the
//! host's own panic reporting keeps working.

use super::{Monitor, MonitorType};
use crate::context::{self, MachineContext};
use crate::fault::{FaultContext, FaultKind, FaultPayload};
use crate::stack::StackCursor;
use crate::shared::constants::STACK_OVERFLOW_THRESHOLD;
use std::panic::PanicHookInfo;
use std::sync::atomic::{AtomicBool, Ordering::SeqCst};
use std::sync::Mutex;

type PanicHook = Box<dyn Fn(&PanicHookInfo<'_>) + Sync + Send>;

static PREVIOUS_HOOK: Mutex<Option<PanicHook>> = Mutex::new(None);
static HOOK_INSTALLED: AtomicBool = AtomicBool::new(false);

pub(crate) struct PanicMonitor {
    enabled: AtomicBool,
}

pub(crate) static PANIC_MONITOR: PanicMonitor = PanicMonitor {
    enabled: AtomicBool::new(false),
};

impl Monitor for PanicMonitor {
    fn monitor_type(&self) -> MonitorType {
        MonitorType::PANIC
    }

    fn set_enabled(&self, enabled: bool) {
        if enabled && !HOOK_INSTALLED.swap(true, SeqCst) {
            // The hook stays installed for the life of the process; the
            // enabled flag decides whether it captures.
            let previous = std::panic::take_hook();
            *PREVIOUS_HOOK.lock().unwrap() = Some(previous);
            std::panic::set_hook(Box::new(panic_hook));
        }
        self.enabled.store(enabled, SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(SeqCst)
    }

    fn add_contextual_info(&self, _ctx: &mut FaultContext) {}
}

fn panic_message(info: &PanicHookInfo<'_>) -> String {
    if let Some(message) = info.payload().downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = info.payload().downcast_ref::<String>() {
        message.clone()
    } else {
        "Box<dyn Any>".to_string()
    }
}

fn panic_hook(info: &PanicHookInfo<'_>) {
    if PANIC_MONITOR.is_enabled() {
        capture_panic(info);
    }
    if let Some(previous) = PREVIOUS_HOOK.lock().ok().and_then(|mut p| p.take()) {
        previous(info);
        if let Ok(mut slot) = PREVIOUS_HOOK.lock() {
            *slot = Some(previous);
        }
    }
}

fn capture_panic(info: &PanicHookInfo<'_>) {
    let recursion = super::notify_fatal_exception_captured(false);
    if recursion {
        // A panic inside a capture: let the dispatcher's recrash path
        // handle the fault that is already in flight.
        return;
    }

    let message = panic_message(info);
    let location = info
        .location()
        .map(|l| format!("{}:{}:{}", l.file(), l.line(), l.column()))
        .unwrap_or_default();

    // Addresses only; resolution happens per-frame through the cursor.
    let mut addresses = [0usize; STACK_OVERFLOW_THRESHOLD];
    let mut count = 0usize;
    // SAFETY: walking our own thread. The synchronized variant takes a
    // lock that can already be held mid-panic.
    unsafe {
        backtrace::trace_unsynchronized(|frame| {
            if count < addresses.len() {
                addresses[count] = frame.ip() as usize;
                count += 1;
                true
            } else {
                false
            }
        });
    }

    let mut machine_context = MachineContext::zeroed();
    context::get_context_for_thread(context::gettid(), &mut machine_context, true);
    let mut cursor = StackCursor::from_backtrace(&addresses[..count]);

    let mut ctx = FaultContext::new(FaultKind::LanguageException);
    ctx.offending_context = &machine_context;
    ctx.stack_cursor = &mut cursor;
    ctx.registers_are_valid = false;
    ctx.crash_reason = Some(&message);
    ctx.payload = FaultPayload::Panic {
        name: "panic",
        message: &message,
        location: &location,
    };
    super::handle_exception(&mut ctx);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_hook_chains_previous() {
        let _guard = super::super::DISPATCH_LOCK.lock().unwrap();
        super::super::reset_dispatcher_for_tests();
        static PREVIOUS_CALLS: AtomicUsize = AtomicUsize::new(0);
        static CAPTURES: AtomicUsize = AtomicUsize::new(0);

        std::panic::set_hook(Box::new(|_| {
            PREVIOUS_CALLS.fetch_add(1, SeqCst);
        }));
        PANIC_MONITOR.set_enabled(true);
        super::super::set_fault_callback(Box::new(|ctx| {
            assert_eq!(ctx.kind, FaultKind::LanguageException);
            assert!(!ctx.registers_are_valid);
            if let FaultPayload::Panic { message, .. } = ctx.payload {
                assert!(message.contains("exercising the panic monitor"));
            } else {
                panic!("wrong payload variant");
            }
            CAPTURES.fetch_add(1, SeqCst);
        }));

        let result = std::panic::catch_unwind(|| {
            panic!("exercising the panic monitor");
        });
        assert!(result.is_err());
        assert_eq!(CAPTURES.load(SeqCst), 1);
        assert_eq!(PREVIOUS_CALLS.load(SeqCst), 1, "previous hook must chain");

        PANIC_MONITOR.set_enabled(false);
        super::super::reset_dispatcher_for_tests();
        let _ = std::panic::take_hook();
    }

    #[test]
    fn test_disabled_monitor_does_not_capture() {
        let _guard = super::super::DISPATCH_LOCK.lock().unwrap();
        super::super::reset_dispatcher_for_tests();
        static CAPTURES: AtomicUsize = AtomicUsize::new(0);
        PANIC_MONITOR.set_enabled(true);
        PANIC_MONITOR.set_enabled(false);
        super::super::set_fault_callback(Box::new(|_| {
            CAPTURES.fetch_add(1, SeqCst);
        }));
        let _ = std::panic::catch_unwind(|| panic!("quiet"));
        assert_eq!(CAPTURES.load(SeqCst), 0);
        super::super::reset_dispatcher_for_tests();
    }
}
