//! A basic block of REIL instructions.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::{Insn, IrAddr};

/// A maximal straight-line run of instructions, ending with the one
/// instruction flagged [`super::InsnFlags::BB_END`].
///
/// A block is never empty; builders only construct blocks from at least one
/// fetched instruction.
#[derive(Clone, Debug, Deserialize, Eq, PartialEq, Serialize)]
pub struct BasicBlock {
    insns: Vec<Insn>,
}

impl BasicBlock {
    pub fn new(insns: Vec<Insn>) -> BasicBlock {
        debug_assert!(!insns.is_empty());
        BasicBlock { insns }
    }

    pub fn insns(&self) -> &[Insn] {
        &self.insns
    }

    pub fn first(&self) -> &Insn {
        &self.insns[0]
    }

    pub fn last(&self) -> &Insn {
        &self.insns[self.insns.len() - 1]
    }

    /// The IR address of the first instruction in this block, which is the
    /// block's key in a control flow graph.
    pub fn ir_addr(&self) -> IrAddr {
        self.first().ir_addr()
    }

    /// The native byte length of this block.
    pub fn size(&self) -> u64 {
        self.last().addr() + self.last().size() - self.first().addr()
    }

    /// The successor pair of this block, computed from its final
    /// instruction only: the fall-through address, and the taken-branch
    /// target.
    pub fn successors(&self) -> (Option<IrAddr>, Option<IrAddr>) {
        (self.last().next(), self.last().jcc_loc())
    }
}

impl fmt::Display for BasicBlock {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for insn in &self.insns {
            writeln!(f, "{}", insn)?;
        }
        Ok(())
    }
}
