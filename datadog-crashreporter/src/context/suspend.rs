// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Peer-thread suspension for the capture path.
//!
//! Linux has no `thread_suspend`; the equivalent here is a pair of
//! realtime signals. To suspend the environment, the capture thread sends
//! every peer the park signal via `tgkill`. The park handler copies the
//! interrupted thread's registers into a static slot (which is how
//! peer-thread register capture works at all on this platform) and then
//! blocks in `sigsuspend` until the resume signal arrives. Both handlers
//! touch only atomics and their own slot.
//!
//! Per-thread failures are tolerated everywhere: a thread that cannot be
//! signalled or never parks is skipped and the snapshot proceeds with
//! whichever threads were reachable.

use super::cpu::{registers_from_ucontext, MachineRegisters};
use crate::shared::constants::MAX_THREADS;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, Ordering::SeqCst};

pub type Tid = libc::pid_t;

fn park_signal() -> libc::c_int {
    libc::SIGRTMIN() + 6
}

fn resume_signal() -> libc::c_int {
    libc::SIGRTMIN() + 7
}

// Slot lifecycle.
const FREE: u32 = 0;
const SIGNALED: u32 = 1;
const PARKED: u32 = 2;
const RESUMING: u32 = 3;

struct ThreadSlot {
    tid: AtomicI32,
    state: AtomicU32,
    regs: UnsafeCell<MachineRegisters>,
}

// Slot register images are only written by the parked thread before it
// publishes PARKED, and only read afterwards.
unsafe impl Sync for ThreadSlot {}

impl ThreadSlot {
    const fn new() -> Self {
        Self {
            tid: AtomicI32::new(0),
            state: AtomicU32::new(FREE),
            regs: UnsafeCell::new(MachineRegisters::zeroed()),
        }
    }
}

static SLOTS: [ThreadSlot; MAX_THREADS] = {
    const SLOT: ThreadSlot = ThreadSlot::new();
    [SLOT; MAX_THREADS]
};

static HANDLERS_INSTALLED: AtomicBool = AtomicBool::new(false);
static SUSPENDED: AtomicBool = AtomicBool::new(false);

// Threads exempt from suspend/resume, e.g. the deadlock watchdog.
const MAX_RESERVED_THREADS: usize = 16;
static RESERVED_THREADS: [AtomicI32; MAX_RESERVED_THREADS] = {
    const ZERO: AtomicI32 = AtomicI32::new(0);
    [ZERO; MAX_RESERVED_THREADS]
};

pub fn gettid() -> Tid {
    // SAFETY: no arguments, always succeeds.
    unsafe { libc::syscall(libc::SYS_gettid) as Tid }
}

/// Registers `tid` as exempt from suspension.
pub fn add_reserved_thread(tid: Tid) {
    for slot in &RESERVED_THREADS {
        if slot
            .compare_exchange(0, tid, SeqCst, SeqCst)
            .is_ok()
        {
            return;
        }
    }
    log::error!("too many reserved threads; {tid} will be suspended during capture");
}

pub fn is_reserved_thread(tid: Tid) -> bool {
    RESERVED_THREADS.iter().any(|t| t.load(SeqCst) == tid)
}

extern "C" fn park_handler(
    _signum: libc::c_int,
    _info: *mut libc::siginfo_t,
    ucontext: *mut libc::c_void,
) {
    let tid = gettid();
    let Some(slot) = SLOTS
        .iter()
        .find(|s| s.tid.load(SeqCst) == tid && s.state.load(SeqCst) == SIGNALED)
    else {
        // Stray signal; nothing claimed a slot for us.
        return;
    };

    if !ucontext.is_null() {
        // SAFETY: the kernel hands a live ucontext_t to SA_SIGINFO handlers;
        // the slot is ours until we publish PARKED.
        unsafe {
            *slot.regs.get() = registers_from_ucontext(ucontext as *const libc::ucontext_t);
        }
    }
    slot.state.store(PARKED, SeqCst);

    // Park until resumed. sigsuspend atomically unblocks the resume signal
    // and waits; its (no-op) handler just breaks the wait.
    let mut wait_mask = unsafe { std::mem::zeroed::<libc::sigset_t>() };
    unsafe {
        libc::sigfillset(&mut wait_mask);
        libc::sigdelset(&mut wait_mask, resume_signal());
    }
    while slot.state.load(SeqCst) != RESUMING {
        // SAFETY: wait_mask is initialized above.
        unsafe { libc::sigsuspend(&wait_mask) };
    }
    slot.tid.store(0, SeqCst);
    slot.state.store(FREE, SeqCst);
}

extern "C" fn resume_handler(
    _signum: libc::c_int,
    _info: *mut libc::siginfo_t,
    _ucontext: *mut libc::c_void,
) {
    // Only exists to interrupt the sigsuspend in park_handler.
}

/// Installs the park/resume handlers. Called once by the installer, off
/// the fault path.
///
/// Raw `libc::sigaction` rather than the nix wrapper: nix's `Signal` enum
/// has no realtime members.
pub fn install_suspension_handlers() -> std::io::Result<()> {
    if HANDLERS_INSTALLED.swap(true, SeqCst) {
        return Ok(());
    }
    // SAFETY: installing handlers for two realtime signals this crate owns.
    unsafe {
        let mut park: libc::sigaction = std::mem::zeroed();
        libc::sigfillset(&mut park.sa_mask);
        park.sa_sigaction = park_handler as usize;
        park.sa_flags = libc::SA_SIGINFO;
        if libc::sigaction(park_signal(), &park, std::ptr::null_mut()) != 0 {
            HANDLERS_INSTALLED.store(false, SeqCst);
            return Err(std::io::Error::last_os_error());
        }

        let mut resume: libc::sigaction = std::mem::zeroed();
        libc::sigemptyset(&mut resume.sa_mask);
        resume.sa_sigaction = resume_handler as usize;
        resume.sa_flags = libc::SA_SIGINFO;
        if libc::sigaction(resume_signal(), &resume, std::ptr::null_mut()) != 0 {
            HANDLERS_INSTALLED.store(false, SeqCst);
            return Err(std::io::Error::last_os_error());
        }
    }
    Ok(())
}

pub fn suspension_available() -> bool {
    HANDLERS_INSTALLED.load(SeqCst)
}

/// Suspends every thread except the caller and any reserved threads.
///
/// Idempotent only within a single fault: a second call before
/// [`resume_environment`] is a no-op.
///
/// SIGNAL SAFETY:
///     tgkill, nanosleep and atomics only.
pub fn suspend_environment(threads: &[Tid]) {
    if !suspension_available() || SUSPENDED.swap(true, SeqCst) {
        return;
    }
    let this_tid = gettid();
    let mut pending = 0usize;
    for &tid in threads {
        if tid == this_tid || is_reserved_thread(tid) {
            continue;
        }
        let Some(slot) = claim_slot(tid) else {
            continue;
        };
        // SAFETY: tgkill with our own pid; a dead tid just returns ESRCH.
        let rc = unsafe { libc::syscall(libc::SYS_tgkill, libc::getpid(), tid, park_signal()) };
        if rc != 0 {
            slot.tid.store(0, SeqCst);
            slot.state.store(FREE, SeqCst);
            continue;
        }
        pending += 1;
    }
    if pending == 0 {
        return;
    }

    // Bounded wait for the parks to land; threads that never park are
    // simply absent from the snapshot.
    let deadline = 2000; // ~200ms in 100us steps
    let sleep = libc::timespec {
        tv_sec: 0,
        tv_nsec: 100_000,
    };
    for _ in 0..deadline {
        let parked = SLOTS
            .iter()
            .filter(|s| s.state.load(SeqCst) == SIGNALED)
            .count();
        if parked == 0 {
            break;
        }
        // SAFETY: valid timespec; remainder discarded.
        unsafe { libc::nanosleep(&sleep, std::ptr::null_mut()) };
    }
}

/// Resumes every thread parked by [`suspend_environment`].
pub fn resume_environment() {
    if !SUSPENDED.swap(false, SeqCst) {
        return;
    }
    for slot in &SLOTS {
        let state = slot.state.load(SeqCst);
        if state != PARKED && state != SIGNALED {
            continue;
        }
        let tid = slot.tid.load(SeqCst);
        slot.state.store(RESUMING, SeqCst);
        // SAFETY: as above.
        unsafe { libc::syscall(libc::SYS_tgkill, libc::getpid(), tid, resume_signal()) };
    }
}

fn claim_slot(tid: Tid) -> Option<&'static ThreadSlot> {
    for slot in &SLOTS {
        if slot
            .state
            .compare_exchange(FREE, SIGNALED, SeqCst, SeqCst)
            .is_ok()
        {
            slot.tid.store(tid, SeqCst);
            return Some(slot);
        }
    }
    None
}

/// Registers captured for `tid` by its park handler, if it parked.
pub fn parked_registers(tid: Tid) -> Option<MachineRegisters> {
    let slot = SLOTS
        .iter()
        .find(|s| s.tid.load(SeqCst) == tid && s.state.load(SeqCst) == PARKED)?;
    // SAFETY: PARKED publishes the register image; the thread will not
    // touch it again until RESUMING.
    Some(unsafe { *slot.regs.get() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;

    #[test]
    fn test_reserved_thread_registry() {
        add_reserved_thread(424242);
        assert!(is_reserved_thread(424242));
        assert!(!is_reserved_thread(424243));
    }

    #[test]
    fn test_suspend_and_resume_peer() {
        // Suspension state is process-global; serialize with dispatcher
        // tests that also suspend.
        let _guard = crate::monitors::DISPATCH_LOCK.lock().unwrap();
        install_suspension_handlers().unwrap();

        let peer_tid = Arc::new(AtomicI32::new(0));
        let progress = Arc::new(AtomicUsize::new(0));
        let stop = Arc::new(AtomicBool::new(false));
        let tid_clone = peer_tid.clone();
        let progress_clone = progress.clone();
        let stop_clone = stop.clone();
        let handle = std::thread::spawn(move || {
            tid_clone.store(gettid(), SeqCst);
            while !stop_clone.load(SeqCst) {
                progress_clone.fetch_add(1, SeqCst);
                std::thread::yield_now();
            }
        });
        while peer_tid.load(SeqCst) == 0 {
            std::thread::yield_now();
        }
        let tid = peer_tid.load(SeqCst);

        suspend_environment(&[tid]);
        let regs = parked_registers(tid);
        assert!(regs.is_some(), "peer should have parked and left registers");
        let frozen = progress.load(SeqCst);
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(
            progress.load(SeqCst),
            frozen,
            "suspended peer must make no progress"
        );

        resume_environment();
        std::thread::sleep(std::time::Duration::from_millis(50));
        assert!(
            progress.load(SeqCst) != frozen,
            "resumed peer must make progress again"
        );
        stop.store(true, SeqCst);
        handle.join().unwrap();
    }

    #[test]
    fn test_suspend_skips_self_and_reserved() {
        let _guard = crate::monitors::DISPATCH_LOCK.lock().unwrap();
        install_suspension_handlers().unwrap();
        let this = gettid();
        // Suspending only ourselves must be a no-op that leaves the flag
        // consistent for the next fault.
        suspend_environment(&[this]);
        assert!(parked_registers(this).is_none());
        resume_environment();
    }
}
