//! An in-memory instruction store.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use super::CodeStorage;
use crate::il;
use crate::Error;

/// A `CodeStorage` backed by an ordered in-memory map.
///
/// Instructions are keyed by IR address, so iteration yields them in
/// address order with expansions contiguous.
#[derive(Clone, Debug, Default)]
pub struct MemoryStorage {
    items: BTreeMap<il::IrAddr, il::Insn>,
}

impl MemoryStorage {
    pub fn new() -> MemoryStorage {
        MemoryStorage {
            items: BTreeMap::new(),
        }
    }

    /// All instructions in the store, in IR address order.
    pub fn insns(&self) -> impl Iterator<Item = &il::Insn> {
        self.items.values()
    }

    /// Write the store to a file, one JSON-serialized instruction per line.
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), Error> {
        let mut file = BufWriter::new(File::create(path)?);
        for insn in self.items.values() {
            serde_json::to_writer(&mut file, insn)?;
            writeln!(file)?;
        }
        file.flush()?;
        Ok(())
    }

    /// Load a store from a file written by [`MemoryStorage::to_file`].
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<MemoryStorage, Error> {
        let file = BufReader::new(File::open(path)?);
        let mut storage = MemoryStorage::new();
        for line in file.lines() {
            let line = line?;
            if line.is_empty() {
                continue;
            }
            let insn: il::Insn = serde_json::from_str(&line)?;
            storage.put_insn(insn);
        }
        Ok(storage)
    }
}

impl CodeStorage for MemoryStorage {
    fn insn(&mut self, ir_addr: il::IrAddr) -> Result<il::Insn, Error> {
        self.items
            .get(&ir_addr)
            .cloned()
            .ok_or(Error::StorageMiss(ir_addr))
    }

    fn machine_insn(&mut self, addr: u64) -> Result<Vec<il::Insn>, Error> {
        let mut insns = Vec::new();
        let mut inum = 0;
        loop {
            let ir_addr = il::IrAddr(addr, inum);
            let insn = self
                .items
                .get(&ir_addr)
                .ok_or(Error::StorageMiss(ir_addr))?;
            let end = insn.has_flag(il::InsnFlags::ASM_END);
            insns.push(insn.clone());
            if end {
                return Ok(insns);
            }
            inum += 1;
        }
    }

    fn put_insn(&mut self, insn: il::Insn) {
        self.items.insert(insn.ir_addr(), insn);
    }

    fn del_insn(&mut self, ir_addr: il::IrAddr) -> Result<il::Insn, Error> {
        self.items.remove(&ir_addr).ok_or(Error::StorageMiss(ir_addr))
    }

    fn del_machine_insn(&mut self, addr: u64) -> Result<(), Error> {
        let keys: Vec<il::IrAddr> = self
            .items
            .range(il::IrAddr(addr, 0)..=il::IrAddr(addr, u16::MAX))
            .map(|(ir_addr, _)| *ir_addr)
            .collect();
        if keys.is_empty() {
            return Err(Error::StorageMiss(il::IrAddr(addr, 0)));
        }
        for key in keys {
            self.items.remove(&key);
        }
        Ok(())
    }

    fn renumber(&mut self) {
        let mut items = BTreeMap::new();
        let mut expansion: Vec<il::Insn> = Vec::new();

        let mut flush = |expansion: &mut Vec<il::Insn>, items: &mut BTreeMap<_, _>| {
            let last = expansion.len().wrapping_sub(1);
            for (inum, insn) in expansion.drain(..).enumerate() {
                let mut insn = insn;
                insn.set_inum(inum as u16);
                if inum == last {
                    insn.set_flag(il::InsnFlags::ASM_END);
                } else {
                    insn.clear_flag(il::InsnFlags::ASM_END);
                }
                items.insert(insn.ir_addr(), insn);
            }
        };

        for insn in std::mem::take(&mut self.items).into_values() {
            if let Some(previous) = expansion.last() {
                if previous.addr() != insn.addr() {
                    flush(&mut expansion, &mut items);
                }
            }
            expansion.push(insn);
        }
        if !expansion.is_empty() {
            flush(&mut expansion, &mut items);
        }

        self.items = items;
    }

    fn len(&self) -> usize {
        self.items.len()
    }

    fn clear(&mut self) {
        self.items.clear();
    }
}

impl fmt::Display for MemoryStorage {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for insn in self.items.values() {
            writeln!(f, "{}", insn)?;
        }
        Ok(())
    }
}
