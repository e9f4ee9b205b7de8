//! Information and types for the architectures REIL programs are lifted
//! from.
//!
//! The analysis core never decodes native instructions, but it does need a
//! few facts about the source architecture: the register sets used by the
//! call-site approximation and by dead-code elimination, and how encoding
//! mode bits are carried in addresses.

use crate::il;
use std::fmt::Debug;

/// Necessary facts for analysis over a source architecture.
pub trait Architecture: Debug {
    /// A short name for this architecture, e.g. `"x86"`.
    fn name(&self) -> &'static str;

    /// The width of a natural word for this architecture.
    fn word_width(&self) -> il::Width;

    /// The architecture's flag registers.
    ///
    /// These are assumed never to carry meaningful values across a function
    /// call, and are never part of a caller-visible result.
    fn flag_registers(&self) -> &'static [&'static str];

    /// The architecture's general-purpose registers.
    ///
    /// A called function is assumed to be able to read and write any of
    /// these.
    fn general_registers(&self) -> &'static [&'static str];

    /// The register used as the instruction pointer by this architecture's
    /// translator.
    fn instruction_pointer(&self) -> &'static str;

    /// The register used as the stack pointer by this architecture's
    /// translator.
    fn stack_pointer(&self) -> &'static str;

    /// Split encoding-mode bits out of a branch-target address.
    ///
    /// Architectures with multiple encoding modes fold the active mode into
    /// branch targets (e.g. the Thumb bit on Arm). Returns the plain address
    /// and the mode bits. The default is a single-mode architecture.
    fn split_mode(&self, address: u64) -> (u64, u64) {
        (address, 0)
    }
}

/// The 32-bit x86 architecture.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct X86 {}

impl X86 {
    pub fn new() -> X86 {
        X86 {}
    }
}

impl Default for X86 {
    fn default() -> X86 {
        X86::new()
    }
}

impl Architecture for X86 {
    fn name(&self) -> &'static str {
        "x86"
    }
    fn word_width(&self) -> il::Width {
        il::Width::U32
    }
    fn flag_registers(&self) -> &'static [&'static str] {
        &["R_ZF", "R_PF", "R_CF", "R_AF", "R_SF", "R_OF", "R_DFLAG"]
    }
    fn general_registers(&self) -> &'static [&'static str] {
        &[
            "R_EAX", "R_EBX", "R_ECX", "R_EDX", "R_ESI", "R_EDI", "R_EBP", "R_ESP",
        ]
    }
    fn instruction_pointer(&self) -> &'static str {
        "R_EIP"
    }
    fn stack_pointer(&self) -> &'static str {
        "R_ESP"
    }
}

/// The 32-bit Arm architecture.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Arm {}

impl Arm {
    pub fn new() -> Arm {
        Arm {}
    }
}

impl Default for Arm {
    fn default() -> Arm {
        Arm::new()
    }
}

impl Architecture for Arm {
    fn name(&self) -> &'static str {
        "arm"
    }
    fn word_width(&self) -> il::Width {
        il::Width::U32
    }
    fn flag_registers(&self) -> &'static [&'static str] {
        &["R_NF", "R_ZF", "R_CF", "R_VF"]
    }
    fn general_registers(&self) -> &'static [&'static str] {
        &[
            "R_R0", "R_R1", "R_R2", "R_R3", "R_R4", "R_R5", "R_R6", "R_R7", "R_R8", "R_R9",
            "R_R10", "R_R11", "R_R12", "R_R13", "R_R14", "R_R15T",
        ]
    }
    fn instruction_pointer(&self) -> &'static str {
        "R_R15T"
    }
    fn stack_pointer(&self) -> &'static str {
        "R_R13"
    }

    /// Bit 0 of an Arm branch target selects the Thumb instruction set.
    fn split_mode(&self, address: u64) -> (u64, u64) {
        (address & !1, address & 1)
    }
}
