//! End-to-end tests over the whole pipeline: bytes, decode-on-miss
//! storage, graph construction, optimization, and commit.

#![cfg(test)]

use crate::analysis::{optimize, CfgBuilder, DfgBuilder, Options};
use crate::architecture::X86;
use crate::il::{const_, reg, temp, Insn, InsnFlags, IrAddr, Opcode, Operand, Width};
use crate::reader::BufferReader;
use crate::storage::{CodeStorage, MemoryStorage, TranslatorStorage};
use crate::translator::Translator;
use crate::Error;

/// A hand-written decoder for the handful of x86 encodings these tests
/// assemble. Real decoding belongs to an external collaborator; this one
/// exists so the tests can drive the decode-on-miss path end to end.
struct ToyX86;

impl ToyX86 {
    fn insn(ir_addr: IrAddr, op: Opcode, size: u64, a: Operand, b: Operand, c: Operand) -> Insn {
        let mut insn = Insn::new(ir_addr, op);
        insn.set_size(size);
        insn.set_operands(a, b, c);
        insn
    }
}

impl Translator for ToyX86 {
    fn translate(&self, bytes: &[u8], address: u64) -> Result<Vec<Insn>, Error> {
        let mut insns = match *bytes.first().ok_or(Error::Read(address))? {
            // nop
            0x90 => vec![Self::insn(
                IrAddr(address, 0),
                Opcode::None,
                1,
                Operand::None,
                Operand::None,
                Operand::None,
            )],
            // ret
            0xc3 => {
                let mut ret = Self::insn(
                    IrAddr(address, 2),
                    Opcode::Jcc,
                    1,
                    const_(1, Width::U1),
                    Operand::None,
                    temp("V_02", Width::U32),
                );
                ret.set_flag(InsnFlags::RET | InsnFlags::BB_END);
                vec![
                    Self::insn(
                        IrAddr(address, 0),
                        Opcode::Ldm,
                        1,
                        reg("R_ESP", Width::U32),
                        Operand::None,
                        temp("V_02", Width::U32),
                    ),
                    Self::insn(
                        IrAddr(address, 1),
                        Opcode::Add,
                        1,
                        reg("R_ESP", Width::U32),
                        const_(4, Width::U32),
                        reg("R_ESP", Width::U32),
                    ),
                    ret,
                ]
            }
            // mov edx, imm32
            0xba => {
                let imm = u32::from_le_bytes(
                    bytes
                        .get(1..5)
                        .ok_or(Error::Read(address))?
                        .try_into()
                        .unwrap(),
                );
                vec![Self::insn(
                    IrAddr(address, 0),
                    Opcode::Str,
                    5,
                    const_(imm as u64, Width::U32),
                    Operand::None,
                    reg("R_EDX", Width::U32),
                )]
            }
            // add ecx, edx
            0x01 => vec![
                Self::insn(
                    IrAddr(address, 0),
                    Opcode::Add,
                    2,
                    reg("R_ECX", Width::U32),
                    reg("R_EDX", Width::U32),
                    temp("V_00", Width::U32),
                ),
                Self::insn(
                    IrAddr(address, 1),
                    Opcode::Eq,
                    2,
                    temp("V_00", Width::U32),
                    const_(0, Width::U32),
                    reg("R_ZF", Width::U1),
                ),
                Self::insn(
                    IrAddr(address, 2),
                    Opcode::Str,
                    2,
                    temp("V_00", Width::U32),
                    Operand::None,
                    reg("R_ECX", Width::U32),
                ),
            ],
            // jne rel8
            0x75 => {
                let rel = *bytes.get(1).ok_or(Error::Read(address))? as i8;
                let target = (address + 2).wrapping_add(rel as u64);
                let mut jcc = Self::insn(
                    IrAddr(address, 2),
                    Opcode::Jcc,
                    2,
                    temp("V_01", Width::U1),
                    Operand::None,
                    const_(target, Width::U32),
                );
                jcc.set_flag(InsnFlags::BB_END);
                vec![
                    Self::insn(
                        IrAddr(address, 0),
                        Opcode::Str,
                        2,
                        reg("R_ZF", Width::U1),
                        Operand::None,
                        temp("V_00", Width::U1),
                    ),
                    Self::insn(
                        IrAddr(address, 1),
                        Opcode::Eq,
                        2,
                        temp("V_00", Width::U1),
                        const_(0, Width::U1),
                        temp("V_01", Width::U1),
                    ),
                    jcc,
                ]
            }
            byte => {
                return Err(Error::Custom(format!(
                    "no encoding for 0x{:02x} at 0x{:x}",
                    byte, address
                )))
            }
        };

        insns.last_mut().unwrap().set_flag(InsnFlags::ASM_END);
        Ok(insns)
    }
}

fn storage_for(bytes: Vec<u8>, base: u64) -> TranslatorStorage<MemoryStorage> {
    TranslatorStorage::new(
        Box::new(ToyX86),
        Some(Box::new(BufferReader::new(bytes, base))),
    )
}

#[test]
fn cfg_split_on_conditional_branch() {
    // jne L; nop; L: ret
    let mut storage = storage_for(vec![0x75, 0x01, 0x90, 0xc3], 0x1000);
    let arch = X86::new();
    let mut builder = CfgBuilder::new(&mut storage, &arch);

    let block = builder.basic_block(IrAddr(0x1000, 0)).unwrap();
    assert_eq!(block.insns().len(), 3);
    assert_eq!(
        block.successors(),
        (Some(IrAddr(0x1002, 0)), Some(IrAddr(0x1003, 0)))
    );

    let cfg = builder.traverse(0x1000).unwrap();
    assert_eq!(cfg.num_blocks(), 3);
    let mut successors = cfg.successor_addrs(IrAddr(0x1000, 0)).unwrap();
    successors.sort();
    assert_eq!(successors, vec![IrAddr(0x1002, 0), IrAddr(0x1003, 0)]);
}

#[test]
fn optimized_exit_liveness() {
    // mov edx, 1; add ecx, edx; ret
    let mut storage = storage_for(
        vec![0xba, 0x01, 0x00, 0x00, 0x00, 0x01, 0xd1, 0xc3],
        0x1000,
    );
    let arch = X86::new();

    let mut dfg = DfgBuilder::new(&mut storage, &arch).traverse(0x1000).unwrap();

    // before optimization, the exit set over-approximates: flags and
    // registers alike
    let exit = dfg.exit_names();
    for name in ["R_ZF", "R_ECX", "R_EDX", "R_ESP"] {
        assert!(exit.contains(name), "{} missing from EXIT", name);
    }

    let deleted = optimize(&mut dfg, &arch, &Options::new()).unwrap();
    assert!(deleted > 0);

    let exit: Vec<String> = dfg.exit_names().into_iter().collect();
    assert_eq!(exit, vec!["R_ECX", "R_EDX", "R_ESP"]);
}

#[test]
fn optimization_is_idempotent_through_storage() {
    let bytes = vec![0xba, 0x01, 0x00, 0x00, 0x00, 0x01, 0xd1, 0xc3];
    let mut storage = storage_for(bytes, 0x1000);
    let arch = X86::new();

    let mut dfg = DfgBuilder::new(&mut storage, &arch).traverse(0x1000).unwrap();
    let first = optimize(&mut dfg, &arch, &Options::new()).unwrap();
    assert!(first > 0);
    dfg.commit(&mut storage).unwrap();
    let after_first = storage.len();

    // a second full build-optimize-commit pass finds nothing further
    let mut dfg = DfgBuilder::new(&mut storage, &arch).traverse(0x1000).unwrap();
    assert_eq!(optimize(&mut dfg, &arch, &Options::new()).unwrap(), 0);
    dfg.commit(&mut storage).unwrap();
    assert_eq!(storage.len(), after_first);
}

#[test]
fn function_insns_cover_all_paths() {
    let mut storage = storage_for(vec![0x75, 0x01, 0x90, 0xc3], 0x1000);
    let arch = X86::new();
    let insns = CfgBuilder::new(&mut storage, &arch)
        .function_insns(0x1000)
        .unwrap();

    // jne expands to three instructions, nop and ret follow
    assert_eq!(insns.len(), 3 + 1 + 3);
    assert_eq!(insns.first().unwrap().ir_addr(), IrAddr(0x1000, 0));
    assert_eq!(insns.last().unwrap().ir_addr(), IrAddr(0x1003, 2));
}
