// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Host-invoked captures: "something fatal happened that the OS will
//! never see", or a non-fatal diagnostic snapshot of the whole process.

use super::{Monitor, MonitorType};
use crate::context::{self, MachineContext};
use crate::fault::{FaultContext, FaultKind, FaultPayload};
use crate::stack::StackCursor;
use crate::shared::constants::STACK_OVERFLOW_THRESHOLD;
use std::sync::atomic::{AtomicBool, Ordering::SeqCst};

pub(crate) struct UserMonitor {
    enabled: AtomicBool,
}

pub(crate) static USER_MONITOR: UserMonitor = UserMonitor {
    enabled: AtomicBool::new(false),
};

impl Monitor for UserMonitor {
    fn monitor_type(&self) -> MonitorType {
        MonitorType::USER_REPORTED
    }

    fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, SeqCst);
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(SeqCst)
    }

    fn add_contextual_info(&self, _ctx: &mut FaultContext) {}
}

/// Captures a user-reported exception on the calling thread.
///
/// With `terminate_program` the capture is treated as fatal (the process
/// aborts after the report is written); otherwise the process continues
/// and the report is of the standard kind with `registers_are_valid`
/// false, since the thread is healthy.
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
    if !USER_MONITOR.is_enabled() {
        log::warn!("user-report monitor is not armed; the exception was not recorded");
        return;
    }
    if terminate_program {
        super::notify_fatal_exception_captured(false);
    }

    let mut machine_context = MachineContext::zeroed();
    context::get_context_for_thread(context::gettid(), &mut machine_context, true);

    // Own-thread addresses; a custom stack from the host wins.
    let mut addresses = [0usize; STACK_OVERFLOW_THRESHOLD];
    let mut count = 0usize;
    if custom_stack.is_none() {
        // SAFETY: walking our own healthy thread.
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
    }
    let mut cursor = match custom_stack {
        Some(stack) => StackCursor::from_backtrace(stack),
        None => StackCursor::from_backtrace(&addresses[..count]),
    };

    let mut ctx = FaultContext::new(FaultKind::UserReported);
    ctx.offending_context = &machine_context;
    ctx.stack_cursor = &mut cursor;
    ctx.registers_are_valid = false;
    ctx.crash_reason = reason;
    ctx.is_user_reported = !terminate_program;
    ctx.omit_peer_threads = !log_all_threads;
    ctx.payload = FaultPayload::UserReported {
        name,
        language,
        line_of_code,
        custom_stack,
    };
    super::handle_exception(&mut ctx);

    if terminate_program {
        std::process::abort();
    }
}
