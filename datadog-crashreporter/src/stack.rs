// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Pull-style stack walking from a saved machine context.
//!
//! The cursor produces one frame per `advance()` call using only the
//! register context and the frame-pointer convention; there is no debug
//! runtime involved, and every memory read goes through the safe probe.
//! Symbolication is split from advancement so the signal-safe path can
//! emit raw addresses first and consult the dynamic linker's image table
//! (`dladdr`) lazily, per frame.

use crate::context::{cpu, MachineContext};
use crate::memory;
use crate::shared::constants::STACK_OVERFLOW_THRESHOLD;

/// The frame the cursor currently points at. Name pointers come from
/// `dladdr` and reference linker-owned storage that outlives the capture.
#[derive(Clone, Copy)]
pub struct StackFrame {
    pub instruction_address: usize,
    pub image_address: usize,
    pub image_name: *const libc::c_char,
    pub symbol_address: usize,
    pub symbol_name: *const libc::c_char,
}

impl StackFrame {
    const fn zeroed() -> Self {
        Self {
            instruction_address: 0,
            image_address: 0,
            image_name: std::ptr::null(),
            symbol_address: 0,
            symbol_name: std::ptr::null(),
        }
    }
}

enum Source {
    /// Addresses already collected, e.g. by the panic monitor on its own
    /// thread or supplied with a user report.
    Backtrace {
        addresses: [usize; STACK_OVERFLOW_THRESHOLD],
        count: usize,
    },
    /// Live walk by the frame-pointer chain.
    Walk {
        frame_pointer: usize,
        /// First frame comes straight from the program counter.
        pending_pc: usize,
        /// Second frame from the link register, where the architecture
        /// has one and the chain has not produced it already.
        pending_lr: usize,
        stack_pointer: usize,
    },
}

pub struct StackCursor {
    source: Source,
    frame: StackFrame,
    depth: usize,
    max_entries: usize,
    has_given_up: bool,
    finished: bool,
}

/// One frame record under the frame-pointer convention: the saved caller
/// frame pointer, then the return address.
#[repr(C)]
#[derive(Clone, Copy, Default)]
struct FrameRecord {
    previous: usize,
    return_address: usize,
}

impl StackCursor {
    /// Cursor over addresses that were already collected. Copies up to the
    /// overflow threshold; anything longer was going to be cut off anyway.
    pub fn from_backtrace(addresses: &[usize]) -> Self {
        let mut copy = [0usize; STACK_OVERFLOW_THRESHOLD];
        let count = addresses.len().min(copy.len());
        copy[..count].copy_from_slice(&addresses[..count]);
        Self {
            source: Source::Backtrace {
                addresses: copy,
                count,
            },
            frame: StackFrame::zeroed(),
            depth: 0,
            max_entries: STACK_OVERFLOW_THRESHOLD,
            has_given_up: false,
            finished: false,
        }
    }

    /// Cursor that walks live stack memory from `ctx`'s registers.
    pub fn from_machine_context(ctx: &MachineContext, max_entries: usize) -> Self {
        let lr = cpu::link_register(&ctx.regs);
        Self {
            source: Source::Walk {
                frame_pointer: cpu::frame_pointer(&ctx.regs),
                pending_pc: cpu::instruction_pointer(&ctx.regs),
                pending_lr: lr,
                stack_pointer: cpu::stack_pointer(&ctx.regs),
            },
            frame: StackFrame::zeroed(),
            depth: 0,
            max_entries,
            has_given_up: false,
            finished: false,
        }
    }

    pub const fn zeroed() -> Self {
        Self {
            source: Source::Backtrace {
                addresses: [0; STACK_OVERFLOW_THRESHOLD],
                count: 0,
            },
            frame: StackFrame::zeroed(),
            depth: 0,
            max_entries: STACK_OVERFLOW_THRESHOLD,
            has_given_up: false,
            finished: false,
        }
    }

    pub fn frame(&self) -> &StackFrame {
        &self.frame
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn has_given_up(&self) -> bool {
        self.has_given_up
    }

    /// Moves to the next frame. Returns false when the walk is exhausted,
    /// corrupt, or past the overflow cutoff (which also sets
    /// [`has_given_up`](Self::has_given_up)).
    pub fn advance(&mut self) -> bool {
        if self.finished || self.has_given_up {
            return false;
        }
        if self.depth >= self.max_entries {
            self.has_given_up = true;
            return false;
        }
        let next = match &mut self.source {
            Source::Backtrace { addresses, count } => {
                if self.depth >= *count {
                    self.finished = true;
                    return false;
                }
                Some(addresses[self.depth])
            }
            Source::Walk {
                frame_pointer,
                pending_pc,
                pending_lr,
                stack_pointer,
            } => {
                if *pending_pc != 0 {
                    let pc = *pending_pc;
                    *pending_pc = 0;
                    Some(pc)
                } else if *pending_lr != 0 {
                    let lr = *pending_lr;
                    *pending_lr = 0;
                    Some(lr)
                } else {
                    let fp = *frame_pointer;
                    if fp == 0 {
                        self.finished = true;
                        return false;
                    }
                    // A frame pointer below the stack pointer, misaligned,
                    // or walking the wrong way means the chain is corrupt.
                    if fp < *stack_pointer || fp % std::mem::align_of::<usize>() != 0 {
                        self.has_given_up = true;
                        return false;
                    }
                    let mut record = FrameRecord::default();
                    let dst = unsafe {
                        std::slice::from_raw_parts_mut(
                            &mut record as *mut FrameRecord as *mut u8,
                            std::mem::size_of::<FrameRecord>(),
                        )
                    };
                    if !memory::copy_safely(fp, dst) {
                        self.has_given_up = true;
                        return false;
                    }
                    if record.return_address == 0 {
                        self.finished = true;
                        return false;
                    }
                    if record.previous != 0 && record.previous <= fp {
                        // Chain must move toward older (higher) frames.
                        self.has_given_up = true;
                        return false;
                    }
                    *frame_pointer = record.previous;
                    Some(record.return_address)
                }
            }
        };
        match next {
            Some(address) => {
                self.frame = StackFrame {
                    instruction_address: address,
                    ..StackFrame::zeroed()
                };
                self.depth += 1;
                true
            }
            None => false,
        }
    }

    /// Attempts to resolve the current frame's image and symbol from the
    /// dynamic linker's tables. Returns whether anything was resolved;
    /// failure leaves the address-only frame intact.
    pub fn symbolicate(&mut self) -> bool {
        let address = self.frame.instruction_address;
        if address == 0 {
            return false;
        }
        // Return addresses point one instruction past the call; back up so
        // the lookup lands inside the calling symbol. The first frame is
        // the faulting instruction itself.
        let lookup = if self.depth > 1 { address - 1 } else { address };
        let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
        // SAFETY: dladdr only reads linker metadata for the given address.
        if unsafe { libc::dladdr(lookup as *const libc::c_void, &mut info) } == 0 {
            return false;
        }
        self.frame.image_address = info.dli_fbase as usize;
        self.frame.image_name = info.dli_fname;
        self.frame.symbol_address = info.dli_saddr as usize;
        self.frame.symbol_name = info.dli_sname;
        self.frame.symbol_address != 0 || self.frame.image_address != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backtrace_cursor_yields_all_addresses() {
        let addrs = [0x1000usize, 0x2000, 0x3000];
        let mut cursor = StackCursor::from_backtrace(&addrs);
        let mut seen = Vec::new();
        while cursor.advance() {
            seen.push(cursor.frame().instruction_address);
        }
        assert_eq!(seen, addrs);
        assert!(!cursor.has_given_up());
    }

    #[test]
    fn test_cutoff_sets_given_up() {
        let addrs = vec![0x1000usize; STACK_OVERFLOW_THRESHOLD + 10];
        let mut cursor = StackCursor::from_backtrace(&addrs);
        let mut produced = 0;
        while cursor.advance() {
            produced += 1;
        }
        assert_eq!(produced, STACK_OVERFLOW_THRESHOLD);
        assert!(cursor.has_given_up());
    }

    #[test]
    fn test_walk_synthetic_frame_chain() {
        // Lay out three frame records on the heap the way a real stack
        // would hold them, growing toward higher addresses.
        let mut stack = vec![0usize; 64];
        let base = stack.as_ptr() as usize;
        // frame 0 at offset 0 -> frame 1 at offset 16 -> frame 2 at 32.
        stack[0] = base + 16 * std::mem::size_of::<usize>();
        stack[1] = 0xAAA0;
        stack[16] = base + 32 * std::mem::size_of::<usize>();
        stack[17] = 0xBBB0;
        stack[32] = 0; // end of chain
        stack[33] = 0xCCC0;

        let mut ctx = MachineContext::zeroed();
        set_walk_registers(&mut ctx, base, 0xF00);
        let mut cursor = StackCursor::from_machine_context(&ctx, 150);

        let mut seen = Vec::new();
        while cursor.advance() {
            seen.push(cursor.frame().instruction_address);
        }
        #[cfg(target_arch = "x86_64")]
        assert_eq!(seen, vec![0xF00, 0xAAA0, 0xBBB0, 0xCCC0]);
        assert!(!cursor.has_given_up());
    }

    #[test]
    fn test_walk_gives_up_on_backwards_chain() {
        let mut stack = vec![0usize; 8];
        let base = stack.as_ptr() as usize;
        // Frame record points at itself: no forward progress.
        stack[0] = base;
        stack[1] = 0xAAA0;

        let mut ctx = MachineContext::zeroed();
        set_walk_registers(&mut ctx, base, 0xF00);
        let mut cursor = StackCursor::from_machine_context(&ctx, 150);

        assert!(cursor.advance()); // pc frame
        assert!(!cursor.advance()); // record makes no forward progress
        assert!(cursor.has_given_up());
    }

    #[test]
    fn test_walk_gives_up_on_unreadable_frame() {
        let mut ctx = MachineContext::zeroed();
        // A frame pointer in unmapped space: the probe must refuse it.
        set_walk_registers(&mut ctx, 0x10, 0xF00);
        let mut cursor = StackCursor::from_machine_context(&ctx, 150);
        assert!(cursor.advance()); // pc frame still comes out
        assert!(!cursor.advance());
        assert!(cursor.has_given_up());
    }

    #[test]
    fn test_symbolicate_known_function() {
        // dladdr against a libc symbol must resolve at least the image.
        let addr = libc::close as usize;
        let mut cursor = StackCursor::from_backtrace(&[addr]);
        assert!(cursor.advance());
        assert!(cursor.symbolicate());
        assert_ne!(cursor.frame().image_address, 0);
        assert!(!cursor.frame().image_name.is_null());
    }

    fn set_walk_registers(ctx: &mut MachineContext, frame_pointer: usize, pc: usize) {
        ctx.has_regs = true;
        #[cfg(target_arch = "x86_64")]
        {
            ctx.regs.gregs[libc::REG_RBP as usize] = frame_pointer as i64;
            ctx.regs.gregs[libc::REG_RIP as usize] = pc as i64;
            ctx.regs.gregs[libc::REG_RSP as usize] = frame_pointer as i64;
        }
        #[cfg(target_arch = "aarch64")]
        {
            ctx.regs.regs[29] = frame_pointer as u64;
            ctx.regs.pc = pc as u64;
            ctx.regs.sp = frame_pointer as u64;
        }
    }
}
