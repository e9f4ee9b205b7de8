//! The REIL instruction and its derived facts.

use bitflags::bitflags;
use serde::{Deserialize, Serialize};
use std::fmt;

use super::Operand;

/// The address of a single REIL instruction: the virtual address of the
/// native instruction it came from, and its sub-index within that native
/// instruction's expansion.
///
/// This pair is the primary key for instruction storage. Sub-indices are
/// dense, starting at 0 for every native instruction.
#[derive(
    Clone, Copy, Debug, Default, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub struct IrAddr(pub u64, pub u16);

impl IrAddr {
    /// The native virtual address.
    pub fn addr(&self) -> u64 {
        self.0
    }

    /// The sub-index within the native instruction's expansion.
    pub fn inum(&self) -> u16 {
        self.1
    }
}

impl fmt::Display for IrAddr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:x}.{:02x}", self.0, self.1)
    }
}

impl From<u64> for IrAddr {
    fn from(addr: u64) -> IrAddr {
        IrAddr(addr, 0)
    }
}

/// A REIL operation code.
#[derive(
    Clone, Copy, Debug, Deserialize, Eq, Hash, Ord, PartialEq, PartialOrd, Serialize,
)]
pub enum Opcode {
    /// No operation. Placeholder for eliminated expansions.
    None,
    /// An opaque native instruction the translator could not capture.
    /// Operands live in the instruction's attributes, not its slots.
    Unknown,
    /// Jump to `c` if `a` is non-zero.
    Jcc,
    /// Move `a` into `c`.
    Str,
    /// Store the value `a` to memory at address `c`.
    Stm,
    /// Load `c` from memory at address `a`.
    Ldm,
    Add,
    Sub,
    Neg,
    Mul,
    Div,
    Mod,
    Smul,
    Sdiv,
    Smod,
    Shl,
    Shr,
    And,
    Or,
    Xor,
    Not,
    Eq,
    Lt,
}

impl Opcode {
    /// The opcode for a raw operation number, as used by numeric wire
    /// formats.
    /// # Errors
    /// Error if the number falls outside the REIL opcode set.
    pub fn from_u32(op: u32) -> Result<Opcode, crate::Error> {
        const OPCODES: [Opcode; 23] = [
            Opcode::None,
            Opcode::Unknown,
            Opcode::Jcc,
            Opcode::Str,
            Opcode::Stm,
            Opcode::Ldm,
            Opcode::Add,
            Opcode::Sub,
            Opcode::Neg,
            Opcode::Mul,
            Opcode::Div,
            Opcode::Mod,
            Opcode::Smul,
            Opcode::Sdiv,
            Opcode::Smod,
            Opcode::Shl,
            Opcode::Shr,
            Opcode::And,
            Opcode::Or,
            Opcode::Xor,
            Opcode::Not,
            Opcode::Eq,
            Opcode::Lt,
        ];
        OPCODES
            .get(op as usize)
            .cloned()
            .ok_or(crate::Error::InvalidOpcode(op))
    }

    /// The mnemonic for this opcode.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            Opcode::None => "NONE",
            Opcode::Unknown => "UNK",
            Opcode::Jcc => "JCC",
            Opcode::Str => "STR",
            Opcode::Stm => "STM",
            Opcode::Ldm => "LDM",
            Opcode::Add => "ADD",
            Opcode::Sub => "SUB",
            Opcode::Neg => "NEG",
            Opcode::Mul => "MUL",
            Opcode::Div => "DIV",
            Opcode::Mod => "MOD",
            Opcode::Smul => "SMUL",
            Opcode::Sdiv => "SDIV",
            Opcode::Smod => "SMOD",
            Opcode::Shl => "SHL",
            Opcode::Shr => "SHR",
            Opcode::And => "AND",
            Opcode::Or => "OR",
            Opcode::Xor => "XOR",
            Opcode::Not => "NOT",
            Opcode::Eq => "EQ",
            Opcode::Lt => "LT",
        }
    }

    /// Returns true for operators where swapping the operands leaves the
    /// result unchanged.
    pub fn is_commutative(&self) -> bool {
        matches!(
            self,
            Opcode::Add
                | Opcode::Mul
                | Opcode::Smul
                | Opcode::And
                | Opcode::Or
                | Opcode::Xor
                | Opcode::Eq
        )
    }

    /// Returns true for operators taking a single source operand.
    pub fn is_unary(&self) -> bool {
        matches!(self, Opcode::Neg | Opcode::Not | Opcode::Str)
    }
}

impl fmt::Display for Opcode {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.mnemonic())
    }
}

bitflags! {
    /// Flags attached to a REIL instruction by the translator or by the
    /// optimization machinery.
    #[derive(Deserialize, Serialize)]
    pub struct InsnFlags: u32 {
        /// This instruction transfers control to another function.
        const CALL = 0x0000_0001;
        /// This instruction returns from the current function.
        const RET = 0x0000_0002;
        /// This instruction ends a basic block.
        const BB_END = 0x0000_0004;
        /// This instruction is the last of its native instruction's
        /// expansion.
        const ASM_END = 0x0000_0008;
        /// This instruction was removed by an optimization pass and exists
        /// only to keep its native address populated.
        const ELIMINATED = 0x0000_0010;
    }
}

impl Default for InsnFlags {
    fn default() -> InsnFlags {
        InsnFlags::empty()
    }
}

mod b64 {
    //! Raw instruction bytes serialize as base64 rather than as an integer
    //! array.

    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(bytes: &Option<Vec<u8>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match bytes {
            Some(bytes) => serializer.serialize_some(&STANDARD.encode(bytes)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Vec<u8>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded: Option<String> = Option::deserialize(deserializer)?;
        encoded
            .map(|encoded| STANDARD.decode(encoded).map_err(D::Error::custom))
            .transpose()
    }
}

/// The optional attributes of an instruction.
///
/// Every field is statically present and individually optional; there is no
/// open attribute dictionary.
#[derive(Clone, Debug, Default, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct Attributes {
    /// The disassembly text of the originating native instruction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub asm: Option<String>,
    /// The raw bytes of the originating native instruction.
    #[serde(default, skip_serializing_if = "Option::is_none", with = "b64")]
    pub bytes: Option<Vec<u8>>,
    /// An explicit override for the fall-through successor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<IrAddr>,
    /// Source operands of an opaque instruction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub src: Option<Vec<Operand>>,
    /// Destination operands of an opaque instruction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dst: Option<Vec<Operand>>,
}

/// A single REIL instruction.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct Insn {
    addr: u64,
    inum: u16,
    /// The byte length of the originating native instruction.
    size: u64,
    op: Opcode,
    a: Operand,
    b: Operand,
    c: Operand,
    flags: InsnFlags,
    #[serde(default)]
    attr: Attributes,
}

impl Insn {
    /// Create a new instruction with empty operand slots and no flags.
    pub fn new(ir_addr: IrAddr, op: Opcode) -> Insn {
        Insn {
            addr: ir_addr.addr(),
            inum: ir_addr.inum(),
            size: 0,
            op,
            a: Operand::None,
            b: Operand::None,
            c: Operand::None,
            flags: InsnFlags::empty(),
            attr: Attributes::default(),
        }
    }

    pub fn ir_addr(&self) -> IrAddr {
        IrAddr(self.addr, self.inum)
    }

    pub fn addr(&self) -> u64 {
        self.addr
    }

    pub fn inum(&self) -> u16 {
        self.inum
    }

    pub fn set_inum(&mut self, inum: u16) {
        self.inum = inum;
    }

    /// The byte length of the originating native instruction.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn set_size(&mut self, size: u64) {
        self.size = size;
    }

    pub fn op(&self) -> Opcode {
        self.op
    }

    pub fn a(&self) -> &Operand {
        &self.a
    }

    pub fn b(&self) -> &Operand {
        &self.b
    }

    pub fn c(&self) -> &Operand {
        &self.c
    }

    pub fn set_a(&mut self, operand: Operand) {
        self.a = operand;
    }

    pub fn set_b(&mut self, operand: Operand) {
        self.b = operand;
    }

    pub fn set_c(&mut self, operand: Operand) {
        self.c = operand;
    }

    pub fn set_operands(&mut self, a: Operand, b: Operand, c: Operand) {
        self.a = a;
        self.b = b;
        self.c = c;
    }

    pub fn flags(&self) -> InsnFlags {
        self.flags
    }

    pub fn set_flag(&mut self, flag: InsnFlags) {
        self.flags.insert(flag);
    }

    pub fn clear_flag(&mut self, flag: InsnFlags) {
        self.flags.remove(flag);
    }

    pub fn has_flag(&self, flag: InsnFlags) -> bool {
        self.flags.contains(flag)
    }

    pub fn attr(&self) -> &Attributes {
        &self.attr
    }

    pub fn attr_mut(&mut self) -> &mut Attributes {
        &mut self.attr
    }

    /// The source operands of this instruction which are registers or
    /// temporaries.
    pub fn src(&self) -> Vec<&Operand> {
        self.collect_src(Operand::is_var)
    }

    /// Every non-empty source operand of this instruction, constants
    /// included.
    pub fn src_all(&self) -> Vec<&Operand> {
        self.collect_src(|operand| !matches!(operand, Operand::None))
    }

    /// The destination operands of this instruction which are registers or
    /// temporaries.
    pub fn dst(&self) -> Vec<&Operand> {
        self.collect_dst(Operand::is_var)
    }

    /// Every non-empty destination operand of this instruction.
    pub fn dst_all(&self) -> Vec<&Operand> {
        self.collect_dst(|operand| !matches!(operand, Operand::None))
    }

    fn collect_src(&self, cond: impl Fn(&Operand) -> bool) -> Vec<&Operand> {
        match self.op {
            // Opaque and placeholder instructions carry their operands in
            // attributes.
            Opcode::None | Opcode::Unknown => self
                .attr
                .src
                .iter()
                .flatten()
                .filter(|operand| cond(operand))
                .collect(),
            _ => {
                let mut operands = Vec::new();
                if cond(&self.a) {
                    operands.push(&self.a);
                }
                if cond(&self.b) {
                    operands.push(&self.b);
                }
                // The third slot of a jump is its target, and the third slot
                // of a memory store is its address. Both are reads.
                if matches!(self.op, Opcode::Jcc | Opcode::Stm) && cond(&self.c) {
                    operands.push(&self.c);
                }
                operands
            }
        }
    }

    fn collect_dst(&self, cond: impl Fn(&Operand) -> bool) -> Vec<&Operand> {
        match self.op {
            Opcode::None | Opcode::Unknown => self
                .attr
                .dst
                .iter()
                .flatten()
                .filter(|operand| cond(operand))
                .collect(),
            Opcode::Jcc | Opcode::Stm => Vec::new(),
            _ => {
                if cond(&self.c) {
                    vec![&self.c]
                } else {
                    Vec::new()
                }
            }
        }
    }

    /// The IR address execution falls through to after this instruction, or
    /// `None` when control never falls through (function return,
    /// unconditional jump).
    pub fn next(&self) -> Option<IrAddr> {
        if let Some(next) = self.attr.next {
            return Some(next);
        }

        if self.has_flag(InsnFlags::RET) {
            return None;
        }

        // An unconditional jump has no fall-through, unless it is a call,
        // which returns to the following native instruction.
        if self.op == Opcode::Jcc
            && !self.has_flag(InsnFlags::CALL)
            && self
                .a
                .constant()
                .map(|condition| condition.value() != 0)
                .unwrap_or(false)
        {
            return None;
        }

        if self.has_flag(InsnFlags::ASM_END) {
            Some(IrAddr(self.addr + self.size, 0))
        } else {
            Some(IrAddr(self.addr, self.inum + 1))
        }
    }

    /// The branch target of this instruction, when it is a jump with a
    /// statically-known target.
    pub fn jcc_loc(&self) -> Option<IrAddr> {
        if self.op != Opcode::Jcc {
            return None;
        }
        match &self.c {
            Operand::Constant(constant) => Some(IrAddr(constant.value(), 0)),
            Operand::Location(ir_addr) => Some(*ir_addr),
            _ => None,
        }
    }

    /// Turn this instruction into an eliminated placeholder.
    pub fn eliminate(&mut self) {
        self.op = Opcode::None;
        self.a = Operand::None;
        self.b = Operand::None;
        self.c = Operand::None;
        self.attr.src = None;
        self.attr.dst = None;
        self.set_flag(InsnFlags::ELIMINATED);
    }
}

impl fmt::Display for Insn {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "{:08x}.{:02x} {:>7} {:>16}, {:>16}, {:>16}",
            self.addr,
            self.inum,
            self.op.mnemonic(),
            self.a,
            self.b,
            self.c
        )
    }
}
