// Copyright 2024-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-architecture register access.
//!
//! A `MachineRegisters` is a plain copy of the general-purpose register
//! image from a `ucontext_t`, detached from the kernel structure so it can
//! live in static storage and be copied between threads. Everything the
//! rest of the engine needs (stack/frame/instruction pointers, named
//! register enumeration for the report's `registers` block) is answered
//! from that copy.

/// Raw register image. x86_64 keeps the full greg array (which includes
/// the fault-describing trapno/err/cr2 slots); aarch64 keeps x0-x30 plus
/// sp/pc/pstate and the fault address.
#[derive(Clone, Copy)]
#[cfg(target_arch = "x86_64")]
pub struct MachineRegisters {
    pub gregs: [i64; 23],
}

#[derive(Clone, Copy)]
#[cfg(target_arch = "aarch64")]
pub struct MachineRegisters {
    pub regs: [u64; 31],
    pub sp: u64,
    pub pc: u64,
    pub pstate: u64,
    pub fault_address: u64,
}

impl MachineRegisters {
    pub const fn zeroed() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            Self { gregs: [0; 23] }
        }
        #[cfg(target_arch = "aarch64")]
        {
            Self {
                regs: [0; 31],
                sp: 0,
                pc: 0,
                pstate: 0,
                fault_address: 0,
            }
        }
    }
}

impl Default for MachineRegisters {
    fn default() -> Self {
        Self::zeroed()
    }
}

/// Copies the general-purpose registers out of a signal's user context.
///
/// # Safety
/// `ucontext` must point to a live `ucontext_t`, normally the third
/// argument of an `SA_SIGINFO` handler.
#[cfg(all(target_os = "linux", target_arch = "x86_64"))]
pub unsafe fn registers_from_ucontext(ucontext: *const libc::ucontext_t) -> MachineRegisters {
    let mut out = MachineRegisters::zeroed();
    let gregs = &(*ucontext).uc_mcontext.gregs;
    for (i, slot) in out.gregs.iter_mut().enumerate() {
        *slot = gregs[i];
    }
    out
}

#[cfg(all(target_os = "linux", target_arch = "aarch64"))]
pub unsafe fn registers_from_ucontext(ucontext: *const libc::ucontext_t) -> MachineRegisters {
    let mc = &(*ucontext).uc_mcontext;
    MachineRegisters {
        regs: mc.regs,
        sp: mc.sp,
        pc: mc.pc,
        pstate: mc.pstate,
        fault_address: mc.fault_address,
    }
}

#[cfg(target_arch = "x86_64")]
mod arch {
    use super::MachineRegisters;

    // Names and their indices into the Linux greg array.
    const BASIC: &[(&str, usize)] = &[
        ("rax", libc::REG_RAX as usize),
        ("rbx", libc::REG_RBX as usize),
        ("rcx", libc::REG_RCX as usize),
        ("rdx", libc::REG_RDX as usize),
        ("rdi", libc::REG_RDI as usize),
        ("rsi", libc::REG_RSI as usize),
        ("rbp", libc::REG_RBP as usize),
        ("rsp", libc::REG_RSP as usize),
        ("r8", libc::REG_R8 as usize),
        ("r9", libc::REG_R9 as usize),
        ("r10", libc::REG_R10 as usize),
        ("r11", libc::REG_R11 as usize),
        ("r12", libc::REG_R12 as usize),
        ("r13", libc::REG_R13 as usize),
        ("r14", libc::REG_R14 as usize),
        ("r15", libc::REG_R15 as usize),
        ("rip", libc::REG_RIP as usize),
        ("rflags", libc::REG_EFL as usize),
        ("csgsfs", libc::REG_CSGSFS as usize),
    ];

    const EXCEPTION: &[(&str, usize)] = &[
        ("trapno", libc::REG_TRAPNO as usize),
        ("err", libc::REG_ERR as usize),
        ("faultvaddr", libc::REG_CR2 as usize),
    ];

    pub fn register_count() -> usize {
        BASIC.len()
    }

    pub fn register_name(index: usize) -> &'static str {
        BASIC.get(index).map(|(n, _)| *n).unwrap_or("")
    }

    pub fn register_value(regs: &MachineRegisters, index: usize) -> u64 {
        BASIC
            .get(index)
            .map(|&(_, g)| regs.gregs[g] as u64)
            .unwrap_or(0)
    }

    pub fn exception_register_count() -> usize {
        EXCEPTION.len()
    }

    pub fn exception_register_name(index: usize) -> &'static str {
        EXCEPTION.get(index).map(|(n, _)| *n).unwrap_or("")
    }

    pub fn exception_register_value(regs: &MachineRegisters, index: usize) -> u64 {
        EXCEPTION
            .get(index)
            .map(|&(_, g)| regs.gregs[g] as u64)
            .unwrap_or(0)
    }

    pub fn stack_pointer(regs: &MachineRegisters) -> usize {
        regs.gregs[libc::REG_RSP as usize] as usize
    }

    pub fn frame_pointer(regs: &MachineRegisters) -> usize {
        regs.gregs[libc::REG_RBP as usize] as usize
    }

    pub fn instruction_pointer(regs: &MachineRegisters) -> usize {
        regs.gregs[libc::REG_RIP as usize] as usize
    }

    // The return address lives in the frame record, not a register.
    pub fn link_register(_regs: &MachineRegisters) -> usize {
        0
    }
}

#[cfg(target_arch = "aarch64")]
mod arch {
    use super::MachineRegisters;

    const NAMES: &[&str] = &[
        "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13",
        "x14", "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26",
        "x27", "x28", "fp", "lr", "sp", "pc", "cpsr",
    ];

    pub fn register_count() -> usize {
        NAMES.len()
    }

    pub fn register_name(index: usize) -> &'static str {
        NAMES.get(index).copied().unwrap_or("")
    }

    pub fn register_value(regs: &MachineRegisters, index: usize) -> u64 {
        match index {
            0..=30 => regs.regs[index],
            31 => regs.sp,
            32 => regs.pc,
            33 => regs.pstate,
            _ => 0,
        }
    }

    const EXCEPTION: &[&str] = &["far"];

    pub fn exception_register_count() -> usize {
        EXCEPTION.len()
    }

    pub fn exception_register_name(index: usize) -> &'static str {
        EXCEPTION.get(index).copied().unwrap_or("")
    }

    pub fn exception_register_value(regs: &MachineRegisters, index: usize) -> u64 {
        match index {
            0 => regs.fault_address,
            _ => 0,
        }
    }

    pub fn stack_pointer(regs: &MachineRegisters) -> usize {
        regs.sp as usize
    }

    pub fn frame_pointer(regs: &MachineRegisters) -> usize {
        regs.regs[29] as usize
    }

    pub fn instruction_pointer(regs: &MachineRegisters) -> usize {
        regs.pc as usize
    }

    pub fn link_register(regs: &MachineRegisters) -> usize {
        regs.regs[30] as usize
    }
}

pub use arch::{
    exception_register_count, exception_register_name, exception_register_value, frame_pointer,
    instruction_pointer, link_register, register_count, register_name, register_value,
    stack_pointer,
};

/// Both supported architectures grow the stack toward lower addresses.
pub const fn stack_grows_down() -> bool {
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_register_tables_are_consistent() {
        assert!(register_count() > 0);
        for i in 0..register_count() {
            assert!(!register_name(i).is_empty());
        }
        assert_eq!(register_name(register_count()), "");
        assert!(exception_register_count() > 0);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_pointer_accessors_read_expected_slots() {
        let mut regs = MachineRegisters::zeroed();
        regs.gregs[libc::REG_RSP as usize] = 0x7fff_0000;
        regs.gregs[libc::REG_RBP as usize] = 0x7fff_0100;
        regs.gregs[libc::REG_RIP as usize] = 0x40_0000;
        assert_eq!(stack_pointer(&regs), 0x7fff_0000);
        assert_eq!(frame_pointer(&regs), 0x7fff_0100);
        assert_eq!(instruction_pointer(&regs), 0x40_0000);
    }

    #[cfg(target_arch = "x86_64")]
    #[test]
    fn test_named_lookup_matches_accessor() {
        let mut regs = MachineRegisters::zeroed();
        regs.gregs[libc::REG_RSP as usize] = 42;
        let rsp_index = (0..register_count())
            .find(|&i| register_name(i) == "rsp")
            .unwrap();
        assert_eq!(register_value(&regs, rsp_index), 42);
    }
}
