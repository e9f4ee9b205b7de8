//! A decode-on-miss front end over any instruction store.

use log::trace;

use super::{CodeStorage, MemoryStorage};
use crate::il;
use crate::reader::Reader;
use crate::translator::Translator;
use crate::Error;

/// A `CodeStorage` which fills itself from a translator on a miss.
///
/// Lookups are served from the backing store when possible. On a miss the
/// reader supplies raw bytes, the translator decodes them, and the
/// expansion is cached in the backing store before the lookup is answered.
/// A miss with no reader configured is a read failure.
pub struct TranslatorStorage<S: CodeStorage = MemoryStorage> {
    storage: S,
    translator: Box<dyn Translator>,
    reader: Option<Box<dyn Reader>>,
}

impl TranslatorStorage<MemoryStorage> {
    /// Create a translator storage over a fresh in-memory store.
    pub fn new(
        translator: Box<dyn Translator>,
        reader: Option<Box<dyn Reader>>,
    ) -> TranslatorStorage<MemoryStorage> {
        TranslatorStorage {
            storage: MemoryStorage::new(),
            translator,
            reader,
        }
    }
}

impl<S: CodeStorage> TranslatorStorage<S> {
    /// Create a translator storage over an existing store.
    pub fn with_storage(
        storage: S,
        translator: Box<dyn Translator>,
        reader: Option<Box<dyn Reader>>,
    ) -> TranslatorStorage<S> {
        TranslatorStorage {
            storage,
            translator,
            reader,
        }
    }

    /// The backing store.
    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn storage_mut(&mut self) -> &mut S {
        &mut self.storage
    }

    /// Decode the native instruction at `addr` and cache its expansion.
    fn fault_in(&mut self, addr: u64) -> Result<(), Error> {
        let reader = self.reader.as_ref().ok_or(Error::Read(addr))?;
        let bytes = reader.read_insn(addr)?;

        trace!("translating instruction at 0x{:x}", addr);
        let records = self.translator.translate(&bytes, addr)?;

        let last = records.last().ok_or(Error::InvalidExpansion(addr))?;
        if !last.has_flag(il::InsnFlags::ASM_END) {
            return Err(Error::InvalidExpansion(addr));
        }

        self.storage.put_insns(collapse_unknown(records));
        Ok(())
    }
}

/// Collapse an expansion of opaque records into a single `Unknown`
/// instruction carrying the gathered operand lists in its attributes.
///
/// A translator that cannot capture an instruction's semantics still
/// reports which operands it touches, one record per operand pair. The rest
/// of the library expects exactly one instruction at sub-index 0 for such
/// an instruction. Expansions with any captured semantics pass through
/// untouched.
fn collapse_unknown(records: Vec<il::Insn>) -> Vec<il::Insn> {
    if !records.iter().all(|insn| insn.op() == il::Opcode::Unknown) {
        return records;
    }

    let mut src: Vec<il::Operand> = Vec::new();
    let mut dst: Vec<il::Operand> = Vec::new();
    let mut size = 0;
    let addr = records[0].addr();

    for insn in &records {
        if !matches!(insn.a(), il::Operand::None) {
            src.push(insn.a().clone());
        }
        if !matches!(insn.c(), il::Operand::None) {
            dst.push(insn.c().clone());
        }
        size = std::cmp::max(size, insn.size());
    }

    let mut collapsed = il::Insn::new(il::IrAddr(addr, 0), il::Opcode::Unknown);
    collapsed.set_size(size);
    collapsed.set_flag(il::InsnFlags::ASM_END);
    if !src.is_empty() {
        collapsed.attr_mut().src = Some(src);
    }
    if !dst.is_empty() {
        collapsed.attr_mut().dst = Some(dst);
    }

    vec![collapsed]
}

impl<S: CodeStorage> CodeStorage for TranslatorStorage<S> {
    fn insn(&mut self, ir_addr: il::IrAddr) -> Result<il::Insn, Error> {
        match self.storage.insn(ir_addr) {
            Ok(insn) => Ok(insn),
            Err(Error::StorageMiss(_)) => {
                self.fault_in(ir_addr.addr())?;
                self.storage.insn(ir_addr)
            }
            Err(e) => Err(e),
        }
    }

    fn machine_insn(&mut self, addr: u64) -> Result<Vec<il::Insn>, Error> {
        match self.storage.machine_insn(addr) {
            Ok(insns) => Ok(insns),
            Err(Error::StorageMiss(_)) => {
                self.fault_in(addr)?;
                self.storage.machine_insn(addr)
            }
            Err(e) => Err(e),
        }
    }

    fn put_insn(&mut self, insn: il::Insn) {
        self.storage.put_insn(insn);
    }

    fn del_insn(&mut self, ir_addr: il::IrAddr) -> Result<il::Insn, Error> {
        self.storage.del_insn(ir_addr)
    }

    fn del_machine_insn(&mut self, addr: u64) -> Result<(), Error> {
        self.storage.del_machine_insn(addr)
    }

    fn renumber(&mut self) {
        self.storage.renumber();
    }

    fn len(&self) -> usize {
        self.storage.len()
    }

    fn clear(&mut self) {
        self.storage.clear();
    }
}
