// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Validate-and-copy of arbitrary process memory without faulting.
//!
//! The capture path sweeps register values and raw stack words, most of
//! which are not pointers at all. Every dereference therefore goes through
//! this probe, which asks the kernel instead of touching the page directly.
//!
//! Two mechanisms are used, in preference order:
//!
//! 1. `process_vm_readv(2)` against our own pid. The kernel walks the page
//!    tables and fails with `EFAULT` on any unmapped byte, which doubles as
//!    the validity answer. One syscall, no signal juggling.
//! 2. `mincore(2)` as the page-presence query on kernels where
//!    `process_vm_readv` is unavailable or blocked (seccomp), followed by a
//!    plain copy of the now-known-mapped range.
//!
//! Both are raw syscalls with no allocator involvement, so the probe is
//! usable from a signal handler.

use std::sync::atomic::{AtomicBool, Ordering::Relaxed};

// Latched when process_vm_readv reports ENOSYS/EPERM so we stop retrying it.
static VM_READ_UNAVAILABLE: AtomicBool = AtomicBool::new(false);

/// Copies `dst.len()` bytes from the raw address `src`.
///
/// Returns false if any byte in `[src, src + dst.len())` is unmapped or
/// otherwise unreadable; `dst` contents are unspecified on failure.
///
/// SIGNAL SAFETY:
///     Performs only raw syscalls and a bounded stack-buffer copy.
pub fn copy_safely(src: usize, dst: &mut [u8]) -> bool {
    if src == 0 || dst.is_empty() {
        return false;
    }
    if src.checked_add(dst.len()).is_none() {
        return false;
    }

    #[cfg(target_os = "linux")]
    if !VM_READ_UNAVAILABLE.load(Relaxed) {
        match vm_read(src, dst) {
            VmReadResult::Ok => return true,
            VmReadResult::Fault => return false,
            VmReadResult::Unsupported => VM_READ_UNAVAILABLE.store(true, Relaxed),
        }
    }

    if !is_memory_readable(src, dst.len()) {
        return false;
    }
    // The range was mapped an instant ago. A racing munmap could still fault
    // here, but peers are suspended during capture, which is when this runs.
    unsafe {
        std::ptr::copy_nonoverlapping(src as *const u8, dst.as_mut_ptr(), dst.len());
    }
    true
}

/// Asks the kernel whether every page covering `[addr, addr + len)` is
/// mapped, via `mincore(2)`. Does not touch the memory itself.
pub fn is_memory_readable(addr: usize, len: usize) -> bool {
    if addr == 0 || len == 0 {
        return false;
    }
    let page = page_size::get();
    let start = addr & !(page - 1);
    let end = match addr.checked_add(len) {
        Some(e) => e,
        None => return false,
    };
    let span = end - start;
    let page_count = span.div_ceil(page);

    // One vector byte per page; bound the probe so a garbage "length" read
    // from a register cannot make us scan gigabytes.
    const MAX_PROBE_PAGES: usize = 256;
    if page_count > MAX_PROBE_PAGES {
        return false;
    }
    let mut vec = [0u8; MAX_PROBE_PAGES];
    // SAFETY: start/span describe whole pages; vec is large enough for
    // page_count entries. mincore only writes the vector.
    let rc = unsafe {
        libc::mincore(
            start as *mut libc::c_void,
            span,
            vec.as_mut_ptr() as *mut libc::c_uchar,
        )
    };
    // ENOMEM means part of the range is unmapped. Any other failure is also
    // treated as unreadable.
    rc == 0
}

#[cfg(target_os = "linux")]
enum VmReadResult {
    Ok,
    Fault,
    Unsupported,
}

#[cfg(target_os = "linux")]
fn vm_read(src: usize, dst: &mut [u8]) -> VmReadResult {
    let local = libc::iovec {
        iov_base: dst.as_mut_ptr() as *mut libc::c_void,
        iov_len: dst.len(),
    };
    let remote = libc::iovec {
        iov_base: src as *mut libc::c_void,
        iov_len: dst.len(),
    };
    // SAFETY: getpid is async-signal-safe; the iovecs describe valid local
    // storage and an arbitrary remote range the kernel validates for us.
    let read = unsafe { libc::process_vm_readv(libc::getpid(), &local, 1, &remote, 1, 0) };
    if read == dst.len() as isize {
        return VmReadResult::Ok;
    }
    if read >= 0 {
        // Partial read: the tail of the range crossed into an unmapped page.
        return VmReadResult::Fault;
    }
    let errno = std::io::Error::last_os_error().raw_os_error().unwrap_or(0);
    match errno {
        libc::ENOSYS | libc::EPERM => VmReadResult::Unsupported,
        _ => VmReadResult::Fault,
    }
}

/// Copies a NUL-terminated string starting at `addr` into `dst`.
///
/// Returns the string length in bytes (terminator excluded), or `None` if
/// the region is unreadable, unterminated within `dst.len()`, or not valid
/// UTF-8. On success `dst[..len]` holds the bytes.
pub fn copy_string_safely(addr: usize, dst: &mut [u8]) -> Option<usize> {
    if !copy_chunked(addr, dst) {
        return None;
    }
    let len = dst.iter().position(|&b| b == 0)?;
    std::str::from_utf8(&dst[..len]).ok()?;
    Some(len)
}

/// Whether `addr` points at a NUL-terminated UTF-8 string of at least
/// `min_len` bytes, looking at most `max_len` bytes ahead. Used to classify
/// register and stack-slot values during the notable-address sweep.
pub fn is_valid_null_terminated_utf8(addr: usize, min_len: usize, max_len: usize) -> bool {
    let mut buf = [0u8; crate::shared::constants::CSTRING_COPY_MAX];
    let cap = max_len.min(buf.len());
    if cap == 0 {
        return false;
    }
    let dst = &mut buf[..cap];
    if !copy_chunked(addr, dst) {
        return false;
    }
    match dst.iter().position(|&b| b == 0) {
        Some(len) => len >= min_len && std::str::from_utf8(&dst[..len]).is_ok(),
        None => false,
    }
}

/// Copies as much of `[addr, addr + dst.len())` as is mapped, stopping at
/// the first unreadable page. Returns false only if nothing was readable.
///
/// A string may end just before an unmapped page, so an all-or-nothing copy
/// would reject valid strings near region boundaries.
fn copy_chunked(addr: usize, dst: &mut [u8]) -> bool {
    let page = page_size::get();
    let mut copied = 0usize;
    while copied < dst.len() {
        let at = match addr.checked_add(copied) {
            Some(a) => a,
            None => break,
        };
        // Stop at each page boundary so one bad page doesn't reject the
        // readable prefix.
        let until_boundary = page - (at & (page - 1));
        let chunk = until_boundary.min(dst.len() - copied);
        if !copy_safely(at, &mut dst[copied..copied + chunk]) {
            break;
        }
        copied += chunk;
    }
    if copied == 0 {
        return false;
    }
    // Zero the tail so terminator scans never read stale bytes.
    for b in &mut dst[copied..] {
        *b = 0;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_valid_memory() {
        let src = [0xAAu8, 0xBB, 0xCC, 0xDD];
        let mut dst = [0u8; 4];
        assert!(copy_safely(src.as_ptr() as usize, &mut dst));
        assert_eq!(src, dst);
    }

    #[test]
    fn test_copy_null_fails() {
        let mut dst = [0u8; 8];
        assert!(!copy_safely(0, &mut dst));
    }

    #[test]
    fn test_copy_unmapped_fails() {
        // Map a page and unmap it again so we hold a known-dead address.
        let page = page_size::get();
        let addr = unsafe {
            let p = libc::mmap(
                std::ptr::null_mut(),
                page,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            );
            assert_ne!(p, libc::MAP_FAILED);
            libc::munmap(p, page);
            p as usize
        };
        let mut dst = [0u8; 16];
        assert!(!copy_safely(addr, &mut dst));
        assert!(!is_memory_readable(addr, 16));
    }

    #[test]
    fn test_valid_utf8_string() {
        let s = b"hello world\0";
        assert!(is_valid_null_terminated_utf8(s.as_ptr() as usize, 4, 64));
        // Minimum length not met.
        assert!(!is_valid_null_terminated_utf8(s.as_ptr() as usize, 40, 64));
    }

    #[test]
    fn test_unterminated_string_rejected() {
        let s = [b'a'; 32];
        assert!(!is_valid_null_terminated_utf8(s.as_ptr() as usize, 1, 16));
    }

    #[test]
    fn test_invalid_utf8_rejected() {
        let s = [0xFFu8, 0xFE, 0xFD, 0x00];
        assert!(!is_valid_null_terminated_utf8(s.as_ptr() as usize, 1, 16));
    }

    #[test]
    fn test_copy_string() {
        let s = b"notable\0junkjunk";
        let mut buf = [0u8; 64];
        let len = copy_string_safely(s.as_ptr() as usize, &mut buf).unwrap();
        assert_eq!(&buf[..len], b"notable");
    }

    #[test]
    fn test_string_ending_near_page_boundary() {
        // Place "hi\0" so the probe window extends past the end of the
        // mapping; the chunked copy must still find the terminator.
        let page = page_size::get();
        unsafe {
            let p = libc::mmap(
                std::ptr::null_mut(),
                page,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANON,
                -1,
                0,
            );
            assert_ne!(p, libc::MAP_FAILED);
            let base = p as *mut u8;
            let at = base.add(page - 3);
            at.copy_from_nonoverlapping(b"hi\0".as_ptr(), 3);
            assert!(is_valid_null_terminated_utf8(at as usize, 1, 64));
            libc::munmap(p, page);
        }
    }
}
