//! Address-keyed instruction stores.
//!
//! Everything the analysis core needs from persistence is four operations:
//! fetch, insert, delete, and the renumbering repair. How a store keeps its
//! instructions - an in-memory map, a flat file, an external database - is
//! invisible behind [`CodeStorage`].
//!
//! # The density invariant
//!
//! For every native address present in a store, the sub-indices of its
//! instructions must be exactly `0..N`, and only the instruction with the
//! highest sub-index may carry [`crate::il::InsnFlags::ASM_END`]. Any
//! mutation that can break this (deleting from the middle of an expansion)
//! must be followed by [`CodeStorage::renumber`] before the store is
//! queried again.

use crate::il;
use crate::Error;

mod memory;
mod translator;

pub use self::memory::*;
pub use self::translator::*;

/// The persistence contract the analysis core depends on.
///
/// Lookup takes `&mut self` so that decode-on-miss front ends like
/// [`TranslatorStorage`] can populate themselves during reads.
pub trait CodeStorage {
    /// Fetch the single instruction at an IR address.
    fn insn(&mut self, ir_addr: il::IrAddr) -> Result<il::Insn, Error>;

    /// Fetch the full expansion of the native instruction at `addr`,
    /// walking sub-indices from 0 until the end-of-expansion flag.
    fn machine_insn(&mut self, addr: u64) -> Result<Vec<il::Insn>, Error>;

    /// Insert an instruction, replacing any instruction with the same IR
    /// address.
    fn put_insn(&mut self, insn: il::Insn);

    /// Insert a list of instructions.
    fn put_insns(&mut self, insns: Vec<il::Insn>) {
        for insn in insns {
            self.put_insn(insn);
        }
    }

    /// Delete and return the instruction at an IR address.
    fn del_insn(&mut self, ir_addr: il::IrAddr) -> Result<il::Insn, Error>;

    /// Delete every instruction of the native instruction at `addr`.
    fn del_machine_insn(&mut self, addr: u64) -> Result<(), Error>;

    /// Repair the density invariant: for each native address present,
    /// reassign sub-indices densely from 0 and move the end-of-expansion
    /// flag to the final instruction.
    fn renumber(&mut self);

    /// The number of instructions in the store.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove every instruction from the store.
    fn clear(&mut self);
}
