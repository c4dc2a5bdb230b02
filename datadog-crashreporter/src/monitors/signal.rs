// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Fatal-signal fault source.
//!
//! Arms `sigaction` handlers (SA_SIGINFO | SA_ONSTACK, all fatal signals
//! masked during handling) for the fatal signal set, saving whatever
//! handlers were there before so disarming restores them exactly. The
//! installing thread also gets an alternate stack so a stack overflow can
//! still be captured; note that an altstack is per-thread, so threads the
//! host creates later overflow onto their own stacks unless it installs
//! one for them.
//!
//! The capture itself builds the `FaultContext` in static storage: a
//! signal delivered for a stack overflow cannot afford stack frames for a
//! machine context, a cursor, and the fault record.
//!
//! Re-raise semantics: monitors are disarmed (old handlers restored) by
//! the dispatcher before the handler returns, so a synchronous hard fault
//! re-triggers on return and takes the previous/default action. Signals
//! that arrived via `kill` (si_code <= 0) and SIGABRT do not re-trigger on
//! their own and are re-queued to this thread with `tgkill`. This relies
//! on the signal being delivered to the same thread with the default
//! action, which is platform-specific behavior.

use super::{Monitor, MonitorType};
use crate::context::{self, MachineContext};
use crate::fault::{EventId, FaultContext, FaultKind, FaultPayload};
use crate::stack::StackCursor;
use std::cell::UnsafeCell;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering::SeqCst};

// These si_code values are standard Linux/glibc siginfo.h constants that
// this version of the `libc` crate does not expose for this target.
pub(crate) const SEGV_MAPERR: libc::c_int = 1;
pub(crate) const SEGV_ACCERR: libc::c_int = 2;
pub(crate) const FPE_INTDIV: libc::c_int = 1;
pub(crate) const FPE_INTOVF: libc::c_int = 2;
pub(crate) const FPE_FLTDIV: libc::c_int = 3;
pub(crate) const FPE_FLTOVF: libc::c_int = 4;
pub(crate) const FPE_FLTUND: libc::c_int = 5;
pub(crate) const FPE_FLTRES: libc::c_int = 6;
pub(crate) const FPE_FLTINV: libc::c_int = 7;
pub(crate) const ILL_ILLOPC: libc::c_int = 1;
pub(crate) const ILL_ILLOPN: libc::c_int = 2;
pub(crate) const ILL_ILLADR: libc::c_int = 3;
pub(crate) const ILL_ILLTRP: libc::c_int = 4;
pub(crate) const ILL_PRVOPC: libc::c_int = 5;
pub(crate) const ILL_COPROC: libc::c_int = 6;
pub(crate) const ILL_BADSTK: libc::c_int = 7;

pub(crate) const FATAL_SIGNALS: [libc::c_int; 8] = [
    libc::SIGABRT,
    libc::SIGBUS,
    libc::SIGFPE,
    libc::SIGILL,
    libc::SIGPIPE,
    libc::SIGSEGV,
    libc::SIGSYS,
    libc::SIGTRAP,
];

pub fn signal_name(signum: i32) -> &'static str {
    match signum {
        libc::SIGABRT => "SIGABRT",
        libc::SIGBUS => "SIGBUS",
        libc::SIGFPE => "SIGFPE",
        libc::SIGILL => "SIGILL",
        libc::SIGPIPE => "SIGPIPE",
        libc::SIGSEGV => "SIGSEGV",
        libc::SIGSYS => "SIGSYS",
        libc::SIGTRAP => "SIGTRAP",
        libc::SIGTERM => "SIGTERM",
        libc::SIGQUIT => "SIGQUIT",
        _ => "UNKNOWN",
    }
}

/// Human name for a signal-specific si_code value.
pub fn signal_code_name(signum: i32, code: i32) -> &'static str {
    match (signum, code) {
        (libc::SIGSEGV, SEGV_MAPERR) => "SEGV_MAPERR",
        (libc::SIGSEGV, SEGV_ACCERR) => "SEGV_ACCERR",
        (libc::SIGBUS, libc::BUS_ADRALN) => "BUS_ADRALN",
        (libc::SIGBUS, libc::BUS_ADRERR) => "BUS_ADRERR",
        (libc::SIGBUS, libc::BUS_OBJERR) => "BUS_OBJERR",
        (libc::SIGFPE, FPE_INTDIV) => "FPE_INTDIV",
        (libc::SIGFPE, FPE_INTOVF) => "FPE_INTOVF",
        (libc::SIGFPE, FPE_FLTDIV) => "FPE_FLTDIV",
        (libc::SIGFPE, FPE_FLTOVF) => "FPE_FLTOVF",
        (libc::SIGFPE, FPE_FLTUND) => "FPE_FLTUND",
        (libc::SIGFPE, FPE_FLTRES) => "FPE_FLTRES",
        (libc::SIGFPE, FPE_FLTINV) => "FPE_FLTINV",
        (libc::SIGILL, ILL_ILLOPC) => "ILL_ILLOPC",
        (libc::SIGILL, ILL_ILLOPN) => "ILL_ILLOPN",
        (libc::SIGILL, ILL_ILLADR) => "ILL_ILLADR",
        (libc::SIGILL, ILL_ILLTRP) => "ILL_ILLTRP",
        (libc::SIGILL, ILL_PRVOPC) => "ILL_PRVOPC",
        (libc::SIGILL, ILL_COPROC) => "ILL_COPROC",
        (libc::SIGILL, ILL_BADSTK) => "ILL_BADSTK",
        (_, 0) => "SI_USER",
        (_, libc::SI_QUEUE) => "SI_QUEUE",
        (_, libc::SI_TKILL) => "SI_TKILL",
        _ => "",
    }
}

/// si_addr is only meaningful for fault-describing signals.
fn fault_address_from(signum: i32, info: *const libc::siginfo_t) -> usize {
    match signum {
        libc::SIGILL | libc::SIGFPE | libc::SIGSEGV | libc::SIGBUS | libc::SIGTRAP => {
            // SAFETY: the kernel fills si_addr for these signals.
            unsafe { (*info).si_addr() as usize }
        }
        _ => 0,
    }
}

// Minimum 64 KiB: the capture path puts the JSON encoder scratch and the
// probe buffers on this stack.
const SIG_STACK_SIZE: usize = 64 * 1024;

struct SavedHandlers {
    actions: UnsafeCell<[libc::sigaction; FATAL_SIGNALS.len()]>,
    saved: AtomicBool,
}

// The actions array is written once under the install path and read by
// the handler only after `saved` is set.
unsafe impl Sync for SavedHandlers {}

static OLD_HANDLERS: SavedHandlers = SavedHandlers {
    actions: UnsafeCell::new(unsafe { mem::zeroed() }),
    saved: AtomicBool::new(false),
};

// Capture-path storage. A faulting stack (especially an overflowed one)
// cannot hold these.
struct CaptureSlots {
    machine_context: UnsafeCell<MachineContext>,
    cursor: UnsafeCell<StackCursor>,
    fault: UnsafeCell<FaultContext<'static>>,
}

// Only the single thread that wins the handling-fatal flag writes here;
// a recrash overwrites the slots of a captor that is already dead.
unsafe impl Sync for CaptureSlots {}

static SLOTS: CaptureSlots = CaptureSlots {
    machine_context: UnsafeCell::new(MachineContext::zeroed()),
    cursor: UnsafeCell::new(StackCursor::zeroed()),
    fault: UnsafeCell::new(FaultContext::zeroed(FaultKind::Signal)),
};

pub(crate) struct SignalMonitor {
    enabled: AtomicBool,
}

pub(crate) static SIGNAL_MONITOR: SignalMonitor = SignalMonitor {
    enabled: AtomicBool::new(false),
};

impl Monitor for SignalMonitor {
    fn monitor_type(&self) -> MonitorType {
        MonitorType::SIGNAL
    }

    fn set_enabled(&self, enabled: bool) {
        if enabled == self.enabled.load(SeqCst) {
            return;
        }
        if enabled {
            // SAFETY: installation mutates process signal state; callers
            // serialize through the installer.
            let ok = unsafe { install_sigaltstack() && install_handlers() };
            self.enabled.store(ok, SeqCst);
            if !ok {
                log::error!("failed to arm the signal monitor");
            }
        } else {
            self.enabled.store(false, SeqCst);
            // SAFETY: restores previously saved dispositions.
            unsafe { restore_handlers() };
        }
    }

    fn is_enabled(&self) -> bool {
        self.enabled.load(SeqCst)
    }

    fn add_contextual_info(&self, _ctx: &mut FaultContext) {}
}

/// Gives the calling thread an alternate signal stack if it does not
/// already have an adequate one.
unsafe fn install_sigaltstack() -> bool {
    let mut old: libc::stack_t = mem::zeroed();
    if libc::sigaltstack(ptr::null(), &mut old) != 0 {
        return false;
    }
    if old.ss_flags & libc::SS_DISABLE == 0 && old.ss_size >= SIG_STACK_SIZE {
        return true;
    }
    let guard = page_size::get();
    let alloc = guard + SIG_STACK_SIZE;
    let base = libc::mmap(
        ptr::null_mut(),
        alloc,
        libc::PROT_NONE,
        libc::MAP_PRIVATE | libc::MAP_ANON,
        -1,
        0,
    );
    if base == libc::MAP_FAILED {
        return false;
    }
    let stack = (base as usize + guard) as *mut libc::c_void;
    if libc::mprotect(stack, SIG_STACK_SIZE, libc::PROT_READ | libc::PROT_WRITE) != 0 {
        libc::munmap(base, alloc);
        return false;
    }
    let new_stack = libc::stack_t {
        ss_sp: stack,
        ss_flags: 0,
        ss_size: SIG_STACK_SIZE,
    };
    libc::sigaltstack(&new_stack, ptr::null_mut()) == 0
}

unsafe fn install_handlers() -> bool {
    if !OLD_HANDLERS.saved.load(SeqCst) {
        let actions = &mut *OLD_HANDLERS.actions.get();
        for (signum, slot) in FATAL_SIGNALS.iter().zip(actions.iter_mut()) {
            if libc::sigaction(*signum, ptr::null(), slot) != 0 {
                return false;
            }
        }
        OLD_HANDLERS.saved.store(true, SeqCst);
    }

    let mut action: libc::sigaction = mem::zeroed();
    libc::sigemptyset(&mut action.sa_mask);
    for signum in FATAL_SIGNALS {
        libc::sigaddset(&mut action.sa_mask, signum);
    }
    action.sa_sigaction = signal_handler as usize;
    action.sa_flags = libc::SA_ONSTACK | libc::SA_SIGINFO;

    let mut ok = true;
    for signum in FATAL_SIGNALS {
        if libc::sigaction(signum, &action, ptr::null_mut()) != 0 {
            // Keep arming the rest; one unhookable signal should not cost
            // the others.
            ok = false;
        }
    }
    ok
}

/// Restores the dispositions saved at install, falling back to SIG_DFL.
/// Callable from the handler itself (raw sigaction only).
unsafe fn restore_handlers() {
    if !OLD_HANDLERS.saved.load(SeqCst) {
        return;
    }
    let actions = &*OLD_HANDLERS.actions.get();
    for (signum, saved) in FATAL_SIGNALS.iter().zip(actions.iter()) {
        if libc::sigaction(*signum, saved, ptr::null_mut()) != 0 {
            libc::signal(*signum, libc::SIG_DFL);
        }
    }
}

extern "C" fn signal_handler(
    signum: libc::c_int,
    info: *mut libc::siginfo_t,
    ucontext: *mut libc::c_void,
) {
    if SIGNAL_MONITOR.is_enabled() {
        super::notify_fatal_exception_captured(true);
        // SAFETY: only the thread holding the handling-fatal flag runs
        // this; a recrash clobbers a dead captor's slots by design.
        unsafe {
            let machine_context = &mut *SLOTS.machine_context.get();
            context::get_context_for_signal(ucontext as *const libc::ucontext_t, machine_context);

            let cursor = &mut *SLOTS.cursor.get();
            *cursor = StackCursor::from_machine_context(
                machine_context,
                crate::shared::constants::STACK_OVERFLOW_THRESHOLD,
            );

            let ctx = &mut *SLOTS.fault.get();
            *ctx = FaultContext::zeroed(FaultKind::Signal);
            ctx.event_id = EventId::generate();
            ctx.offending_context = machine_context;
            ctx.stack_cursor = cursor;
            ctx.fault_address = fault_address_from(signum, info);
            ctx.payload = FaultPayload::Signal {
                signum,
                sigcode: (*info).si_code,
            };
            super::handle_exception(ctx);
        }
    }

    // The dispatcher restored the previous handlers. A synchronous hard
    // fault re-triggers on return; kill-delivered signals and SIGABRT
    // must be re-queued by hand.
    // SAFETY: raw syscalls.
    unsafe {
        let si_code = if info.is_null() { 0 } else { (*info).si_code };
        if si_code <= 0 || signum == libc::SIGABRT {
            let tid = libc::syscall(libc::SYS_gettid);
            if libc::syscall(libc::SYS_tgkill, libc::getpid(), tid, signum) < 0 {
                libc::_exit(1);
            }
        }
    }
}
