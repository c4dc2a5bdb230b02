// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Machine context capture: registers, the process's thread list, and the
//! suspend/resume primitives the dispatcher uses around a capture.

pub mod cpu;
pub mod suspend;

use crate::shared::constants::{MAX_THREADS, STACK_OVERFLOW_THRESHOLD};
use crate::stack::StackCursor;
use cpu::MachineRegisters;
pub use suspend::{
    add_reserved_thread, gettid, install_suspension_handlers, is_reserved_thread,
    resume_environment, suspension_available, Tid,
};

/// Register state and thread census for one thread at one moment.
///
/// `all_threads` is populated only for the crashed context; peer records
/// built from it leave it empty.
pub struct MachineContext {
    pub this_thread: Tid,
    pub is_current_thread: bool,
    pub is_crashed_context: bool,
    pub is_signal_context: bool,
    pub is_stack_overflow: bool,
    pub regs: MachineRegisters,
    /// Whether `regs` was actually captured. A current-thread,
    /// non-signal context has nothing trustworthy to capture.
    pub has_regs: bool,
    all_threads: [Tid; MAX_THREADS],
    thread_count: usize,
}

impl MachineContext {
    pub const fn zeroed() -> Self {
        Self {
            this_thread: 0,
            is_current_thread: false,
            is_crashed_context: false,
            is_signal_context: false,
            is_stack_overflow: false,
            regs: MachineRegisters::zeroed(),
            has_regs: false,
            all_threads: [0; MAX_THREADS],
            thread_count: 0,
        }
    }

    pub fn thread_count(&self) -> usize {
        self.thread_count
    }

    pub fn thread_at(&self, index: usize) -> Option<Tid> {
        self.all_threads.get(..self.thread_count)?.get(index).copied()
    }

    pub fn index_of_thread(&self, tid: Tid) -> Option<usize> {
        self.all_threads[..self.thread_count]
            .iter()
            .position(|&t| t == tid)
    }
}

pub const fn context_size() -> usize {
    std::mem::size_of::<MachineContext>()
}

/// Registers are meaningful for a peer thread (its state was parked) or
/// for a signal-context capture of the current thread. A current-thread
/// snapshot outside a signal has no saved register state worth reporting.
pub fn can_have_cpu_state(ctx: &MachineContext) -> bool {
    !ctx.is_current_thread || ctx.is_signal_context
}

pub fn has_valid_exception_registers(ctx: &MachineContext) -> bool {
    can_have_cpu_state(ctx) && ctx.is_crashed_context
}

/// Fills `out` for a peer (or the current) thread.
///
/// Peer registers come from the suspension slot table, so peers must have
/// been suspended first; a peer with no parked slot yields `has_regs =
/// false` and the snapshot carries on. When `is_crashed`, the process's
/// thread census and the stack-overflow determination are also filled.
pub fn get_context_for_thread(tid: Tid, out: &mut MachineContext, is_crashed: bool) -> bool {
    *out = MachineContext::zeroed();
    out.this_thread = tid;
    out.is_current_thread = tid == gettid();
    out.is_crashed_context = is_crashed;
    if can_have_cpu_state(out) {
        if let Some(regs) = suspend::parked_registers(tid) {
            out.regs = regs;
            out.has_regs = true;
        }
    }
    if is_crashed {
        out.thread_count = enumerate_task_threads(&mut out.all_threads);
        if out.has_regs {
            out.is_stack_overflow = walk_hits_cutoff(out);
        }
    }
    true
}

/// Extracts the machine context from an OS signal's user context. Always
/// marked crashed.
///
/// # Safety
/// `ucontext` must be the live pointer handed to an `SA_SIGINFO` handler.
pub unsafe fn get_context_for_signal(
    ucontext: *const libc::ucontext_t,
    out: &mut MachineContext,
) {
    *out = MachineContext::zeroed();
    out.this_thread = gettid();
    out.is_current_thread = true;
    out.is_crashed_context = true;
    out.is_signal_context = true;
    if !ucontext.is_null() {
        out.regs = cpu::registers_from_ucontext(ucontext);
        out.has_regs = true;
    }
    out.thread_count = enumerate_task_threads(&mut out.all_threads);
    if out.has_regs {
        out.is_stack_overflow = walk_hits_cutoff(out);
    }
}

/// Suspends every peer of the current thread recorded in `ctx`.
pub fn suspend_environment(ctx: &MachineContext) {
    suspend::suspend_environment(&ctx.all_threads[..ctx.thread_count]);
}

// Stack overflow is specifically a walk that runs past the frame cutoff;
// a walk that gives up early on a corrupt chain does not count.
fn walk_hits_cutoff(ctx: &MachineContext) -> bool {
    let mut cursor = StackCursor::from_machine_context(ctx, STACK_OVERFLOW_THRESHOLD);
    while cursor.advance() {}
    cursor.has_given_up() && cursor.depth() >= STACK_OVERFLOW_THRESHOLD
}

/// Enumerates the process's threads by reading `/proc/self/task` with raw
/// `getdents64` into a fixed buffer. open/getdents64/close only, so this
/// is callable from the signal handler.
pub fn enumerate_task_threads(out: &mut [Tid; MAX_THREADS]) -> usize {
    // SAFETY: raw syscalls on a path literal; the dirent buffer is local.
    unsafe {
        let fd = libc::open(
            c"/proc/self/task".as_ptr(),
            libc::O_RDONLY | libc::O_DIRECTORY | libc::O_CLOEXEC,
        );
        if fd < 0 {
            return 0;
        }
        let mut count = 0usize;
        let mut buf = [0u8; 4096];
        loop {
            let nread = libc::syscall(
                libc::SYS_getdents64,
                fd,
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
            );
            if nread <= 0 {
                break;
            }
            let mut at = 0usize;
            while at < nread as usize {
                let entry = buf.as_ptr().add(at) as *const libc::dirent64;
                let reclen = (*entry).d_reclen as usize;
                if reclen == 0 {
                    break;
                }
                let name = (*entry).d_name.as_ptr() as *const u8;
                if let Some(tid) = parse_tid(name) {
                    if count < MAX_THREADS {
                        out[count] = tid;
                        count += 1;
                    }
                }
                at += reclen;
            }
        }
        libc::close(fd);
        count
    }
}

/// Parses a decimal thread id from a NUL-terminated directory entry name.
/// Returns None for "." and "..".
unsafe fn parse_tid(name: *const u8) -> Option<Tid> {
    let mut value: Tid = 0;
    let mut len = 0;
    loop {
        let b = *name.add(len);
        if b == 0 {
            break;
        }
        if !b.is_ascii_digit() || len > 10 {
            return None;
        }
        value = value.wrapping_mul(10).wrapping_add((b - b'0') as Tid);
        len += 1;
    }
    if len == 0 {
        None
    } else {
        Some(value)
    }
}

/// Reads a thread's name from `/proc/self/task/<tid>/comm` into `buf`,
/// returning the name length. Signal-safe: open/read/close and integer
/// formatting into the caller's buffer.
pub fn thread_name(tid: Tid, buf: &mut [u8]) -> usize {
    let mut path = [0u8; 64];
    let mut at = 0;
    for b in b"/proc/self/task/" {
        path[at] = *b;
        at += 1;
    }
    at += crate::json::format_u64(tid as u64, &mut path[at..]);
    for b in b"/comm\0" {
        path[at] = *b;
        at += 1;
    }
    // SAFETY: path is NUL-terminated above; buf is caller storage.
    unsafe {
        let fd = libc::open(path.as_ptr() as *const libc::c_char, libc::O_RDONLY);
        if fd < 0 {
            return 0;
        }
        let n = libc::read(fd, buf.as_mut_ptr() as *mut libc::c_void, buf.len());
        libc::close(fd);
        if n <= 0 {
            return 0;
        }
        let mut len = n as usize;
        // Trim the trailing newline comm carries.
        while len > 0 && (buf[len - 1] == b'\n' || buf[len - 1] == 0) {
            len -= 1;
        }
        len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enumerate_includes_current_thread() {
        let mut threads = [0 as Tid; MAX_THREADS];
        let count = enumerate_task_threads(&mut threads);
        assert!(count >= 1);
        let me = gettid();
        assert!(threads[..count].contains(&me));
    }

    #[test]
    fn test_enumerate_sees_spawned_thread() {
        let (tx, rx) = std::sync::mpsc::channel();
        let (done_tx, done_rx) = std::sync::mpsc::channel::<()>();
        let handle = std::thread::spawn(move || {
            tx.send(gettid()).unwrap();
            done_rx.recv().ok();
        });
        let peer = rx.recv().unwrap();
        let mut threads = [0 as Tid; MAX_THREADS];
        let count = enumerate_task_threads(&mut threads);
        assert!(threads[..count].contains(&peer));
        done_tx.send(()).unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_thread_name_reads_comm() {
        let handle = std::thread::Builder::new()
            .name("ctx-probe".to_string())
            .spawn(|| {
                let mut buf = [0u8; 32];
                let len = thread_name(gettid(), &mut buf);
                assert_eq!(&buf[..len], b"ctx-probe");
            })
            .unwrap();
        handle.join().unwrap();
    }

    #[test]
    fn test_current_thread_context_census() {
        let mut ctx = MachineContext::zeroed();
        assert!(get_context_for_thread(gettid(), &mut ctx, true));
        assert!(ctx.is_current_thread);
        assert!(ctx.is_crashed_context);
        // Current thread outside a signal: no meaningful registers.
        assert!(!can_have_cpu_state(&ctx));
        assert!(ctx.thread_count() >= 1);
        assert!(ctx.index_of_thread(gettid()).is_some());
    }
}
