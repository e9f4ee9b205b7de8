//! Copy and common-subexpression elimination over a data flow graph.

use log::{debug, trace};

use super::data_flow_graph::{DataFlowGraph, DfgEdge, ENTRY, EXIT};
use crate::graph::Edge;
use crate::il;
use crate::Error;

/// Remove redundant move instructions, rewiring consumers to the original
/// producer.
///
/// Only pure moves between registers and temporaries with a non-constant
/// source are considered. A move into a *temporary* is removed by renaming:
/// when every producer feeding the move has the move as its only consumer,
/// each producer's destination is renamed to the move's destination and the
/// producers are wired straight to the move's consumers. A move into an
/// *architectural register* is removed by forward propagation: when the
/// moved value has a single, unambiguous definition and no consumer is
/// opaque or outside the function, each consumer's matching slot is
/// rewritten to read the source directly.
///
/// Returns the number of moves deleted.
pub fn subexpression_elimination(dfg: &mut DataFlowGraph) -> Result<usize, Error> {
    let mut total = 0;

    loop {
        let mut deleted = 0;

        'nodes: for index in dfg.graph().vertex_indices() {
            if index == ENTRY || index == EXIT {
                continue;
            }
            let insn = match dfg.insn(index) {
                Some(insn) => insn.clone(),
                None => continue,
            };

            if insn.op() != il::Opcode::Str
                || insn.has_flag(il::InsnFlags::CALL)
                || !insn.a().is_var()
                || !insn.c().is_var()
                || insn.a().width() != insn.c().width()
            {
                continue;
            }

            let source = insn.a().clone();
            let destination = insn.c().clone();
            let source_name = source.name().unwrap().to_string();
            let destination_name = destination.name().unwrap().to_string();

            let in_edges: Vec<DfgEdge> =
                dfg.graph().edges_in(index)?.into_iter().cloned().collect();
            let out_edges: Vec<DfgEdge> =
                dfg.graph().edges_out(index)?.into_iter().cloned().collect();

            if destination.is_temp() {
                // rename the producers: sound only when this move is the one
                // consumer of every producer
                if in_edges.is_empty() {
                    continue;
                }
                for edge in &in_edges {
                    if edge.head() == ENTRY {
                        continue 'nodes;
                    }
                    let producer = dfg.insn(edge.head()).unwrap();
                    if producer.op() == il::Opcode::Unknown
                        || producer.has_flag(il::InsnFlags::CALL)
                    {
                        continue 'nodes;
                    }
                    if dfg.graph().edges_out(edge.head())?.len() != 1 {
                        continue 'nodes;
                    }
                }
                // the destination name must have no other definition, or
                // the renamed producer could be shadowed in program order
                for other in dfg.graph().vertex_indices() {
                    if other == index {
                        continue;
                    }
                    if let Some(other_insn) = dfg.insn(other) {
                        if other_insn
                            .dst()
                            .iter()
                            .any(|operand| operand.name() == Some(&destination_name))
                        {
                            continue 'nodes;
                        }
                    }
                }

                trace!("renaming producers of {} through {}", source_name, insn);
                for edge in &in_edges {
                    let producer = dfg.insn_mut(edge.head()).unwrap();
                    producer.set_c(destination.clone());
                }
                for in_edge in &in_edges {
                    for out_edge in &out_edges {
                        dfg.graph_mut().insert_edge(DfgEdge::new(
                            in_edge.head(),
                            out_edge.tail(),
                            destination_name.clone(),
                        ))?;
                    }
                }
                dfg.remove_insn(index)?;
                deleted += 1;
            } else {
                // propagate the source forward into each consumer
                if out_edges.is_empty() {
                    continue;
                }
                for edge in &out_edges {
                    // a register flowing to EXIT is observable; an opaque or
                    // call consumer cannot have its slots rewritten
                    if edge.tail() == EXIT {
                        continue 'nodes;
                    }
                    let consumer = dfg.insn(edge.tail()).unwrap();
                    if consumer.op() == il::Opcode::Unknown
                        || consumer.has_flag(il::InsnFlags::CALL)
                    {
                        continue 'nodes;
                    }
                }
                // the source must reach every consumer unchanged: require
                // that its one definition here is its only definition
                // anywhere in the graph
                if in_edges.len() != 1 {
                    continue;
                }
                let producer = in_edges[0].head();
                for other in dfg.graph().vertex_indices() {
                    if other == index || other == producer || other == ENTRY || other == EXIT {
                        continue;
                    }
                    let other_insn = match dfg.insn(other) {
                        Some(other_insn) => other_insn,
                        None => continue,
                    };
                    let redefines = other_insn.has_flag(il::InsnFlags::CALL)
                        || other_insn
                            .dst()
                            .iter()
                            .any(|operand| operand.name() == Some(&source_name));
                    if redefines {
                        continue 'nodes;
                    }
                }

                trace!("propagating {} forward through {}", source_name, insn);
                for edge in &out_edges {
                    let consumer = dfg.insn_mut(edge.tail()).unwrap();
                    substitute(consumer, &destination_name, &source);
                    dfg.graph_mut().insert_edge(DfgEdge::new(
                        producer,
                        edge.tail(),
                        source_name.clone(),
                    ))?;
                }
                dfg.remove_insn(index)?;
                deleted += 1;
            }
        }

        if deleted == 0 {
            break;
        }
        total += deleted;
    }

    debug!("subexpression elimination deleted {} moves", total);
    Ok(total)
}

/// Replace every source slot of `insn` reading `name` with `operand`.
fn substitute(insn: &mut il::Insn, name: &str, operand: &il::Operand) {
    if insn.a().name() == Some(name) {
        insn.set_a(operand.clone());
    }
    if insn.b().name() == Some(name) {
        insn.set_b(operand.clone());
    }
    if matches!(insn.op(), il::Opcode::Jcc | il::Opcode::Stm) && insn.c().name() == Some(name) {
        insn.set_c(operand.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::super::data_flow_graph::DfgBuilder;
    use super::*;
    use crate::architecture::X86;
    use crate::graph::Edge;
    use crate::il::{const_, reg, temp, IrAddr, Insn, InsnFlags, Opcode, Operand, Width};
    use crate::storage::{CodeStorage, MemoryStorage};

    fn ret_insn(addr: u64) -> Insn {
        let mut ret = Insn::new(IrAddr(addr, 0), Opcode::Jcc);
        ret.set_size(1);
        ret.set_operands(const_(1, Width::U1), Operand::None, temp("V_09", Width::U32));
        ret.set_flag(InsnFlags::RET | InsnFlags::ASM_END | InsnFlags::BB_END);
        ret
    }

    #[test]
    fn move_into_temporary_renames_the_producer() {
        // V_00 = R_ECX + R_EDX; V_01 = V_00; [R_ESP] = V_01
        let mut storage = MemoryStorage::new();

        let mut add = Insn::new(IrAddr(0x1000, 0), Opcode::Add);
        add.set_operands(
            reg("R_ECX", Width::U32),
            reg("R_EDX", Width::U32),
            temp("V_00", Width::U32),
        );
        storage.put_insn(add);

        let mut mv = Insn::new(IrAddr(0x1000, 1), Opcode::Str);
        mv.set_operands(
            temp("V_00", Width::U32),
            Operand::None,
            temp("V_01", Width::U32),
        );
        storage.put_insn(mv);

        let mut stm = Insn::new(IrAddr(0x1000, 2), Opcode::Stm);
        stm.set_size(3);
        stm.set_operands(
            temp("V_01", Width::U32),
            Operand::None,
            reg("R_ESP", Width::U32),
        );
        stm.set_flag(InsnFlags::ASM_END);
        storage.put_insn(stm);

        storage.put_insn(ret_insn(0x1003));

        let arch = X86::new();
        let mut dfg = DfgBuilder::new(&mut storage, &arch).traverse(0x1000).unwrap();

        // sever the temporaries' exit edges first, as the driver does
        super::super::dead_code_elimination(&mut dfg, &arch).unwrap();
        let deleted = subexpression_elimination(&mut dfg).unwrap();
        assert_eq!(deleted, 1);

        // the move is gone and the producer now writes V_01 directly
        assert!(dfg.index_of(IrAddr(0x1000, 1)).is_none());
        let add = dfg.index_of(IrAddr(0x1000, 0)).unwrap();
        assert_eq!(dfg.insn(add).unwrap().c(), &temp("V_01", Width::U32));

        // and feeds the store directly
        let stm = dfg.index_of(IrAddr(0x1000, 2)).unwrap();
        assert!(dfg
            .graph()
            .edges_out(add)
            .unwrap()
            .iter()
            .any(|e| e.tail() == stm && e.name() == "V_01"));
    }

    #[test]
    fn move_into_register_propagates_the_source() {
        // V_00 = [R_ESP]; R_EAX = V_00; [R_ESP] = R_EAX; R_EAX = 0
        let mut storage = MemoryStorage::new();

        let mut load = Insn::new(IrAddr(0x1000, 0), Opcode::Ldm);
        load.set_operands(
            reg("R_ESP", Width::U32),
            Operand::None,
            temp("V_00", Width::U32),
        );
        storage.put_insn(load);

        let mut mv = Insn::new(IrAddr(0x1000, 1), Opcode::Str);
        mv.set_operands(
            temp("V_00", Width::U32),
            Operand::None,
            reg("R_EAX", Width::U32),
        );
        storage.put_insn(mv);

        let mut stm = Insn::new(IrAddr(0x1000, 2), Opcode::Stm);
        stm.set_operands(
            reg("R_EAX", Width::U32),
            Operand::None,
            reg("R_ESP", Width::U32),
        );
        storage.put_insn(stm);

        // a later redefinition keeps R_EAX off the move's consumer list at
        // EXIT
        let mut clear = Insn::new(IrAddr(0x1000, 3), Opcode::Str);
        clear.set_size(4);
        clear.set_operands(
            const_(0, Width::U32),
            Operand::None,
            reg("R_EAX", Width::U32),
        );
        clear.set_flag(InsnFlags::ASM_END);
        storage.put_insn(clear);

        storage.put_insn(ret_insn(0x1004));

        let arch = X86::new();
        let mut dfg = DfgBuilder::new(&mut storage, &arch).traverse(0x1000).unwrap();

        let deleted = subexpression_elimination(&mut dfg).unwrap();
        assert_eq!(deleted, 1);

        // the store now reads the temporary straight from the load
        assert!(dfg.index_of(IrAddr(0x1000, 1)).is_none());
        let load = dfg.index_of(IrAddr(0x1000, 0)).unwrap();
        let stm = dfg.index_of(IrAddr(0x1000, 2)).unwrap();
        assert_eq!(dfg.insn(stm).unwrap().a(), &temp("V_00", Width::U32));
        assert!(dfg
            .graph()
            .edges_out(load)
            .unwrap()
            .iter()
            .any(|e| e.tail() == stm && e.name() == "V_00"));
    }

    #[test]
    fn register_move_reaching_exit_is_kept() {
        // R_EAX = V_00 with R_EAX live out must survive
        let mut storage = MemoryStorage::new();

        let mut load = Insn::new(IrAddr(0x1000, 0), Opcode::Ldm);
        load.set_operands(
            reg("R_ESP", Width::U32),
            Operand::None,
            temp("V_00", Width::U32),
        );
        storage.put_insn(load);

        let mut mv = Insn::new(IrAddr(0x1000, 1), Opcode::Str);
        mv.set_size(4);
        mv.set_operands(
            temp("V_00", Width::U32),
            Operand::None,
            reg("R_EAX", Width::U32),
        );
        mv.set_flag(InsnFlags::ASM_END);
        storage.put_insn(mv);

        storage.put_insn(ret_insn(0x1004));

        let arch = X86::new();
        let mut dfg = DfgBuilder::new(&mut storage, &arch).traverse(0x1000).unwrap();

        assert_eq!(subexpression_elimination(&mut dfg).unwrap(), 0);
        assert!(dfg.index_of(IrAddr(0x1000, 1)).is_some());
    }

    #[test]
    fn producer_with_other_consumers_blocks_renaming() {
        // V_00 feeds both the move and a store: renaming would break the
        // store's read
        let mut storage = MemoryStorage::new();

        let mut add = Insn::new(IrAddr(0x1000, 0), Opcode::Add);
        add.set_operands(
            reg("R_ECX", Width::U32),
            reg("R_EDX", Width::U32),
            temp("V_00", Width::U32),
        );
        storage.put_insn(add);

        let mut stm = Insn::new(IrAddr(0x1000, 1), Opcode::Stm);
        stm.set_operands(
            temp("V_00", Width::U32),
            Operand::None,
            reg("R_ESP", Width::U32),
        );
        storage.put_insn(stm);

        let mut mv = Insn::new(IrAddr(0x1000, 2), Opcode::Str);
        mv.set_size(3);
        mv.set_operands(
            temp("V_00", Width::U32),
            Operand::None,
            temp("V_01", Width::U32),
        );
        mv.set_flag(InsnFlags::ASM_END);
        storage.put_insn(mv);

        storage.put_insn(ret_insn(0x1003));

        let arch = X86::new();
        let mut dfg = DfgBuilder::new(&mut storage, &arch).traverse(0x1000).unwrap();

        assert_eq!(subexpression_elimination(&mut dfg).unwrap(), 0);
        assert!(dfg.index_of(IrAddr(0x1000, 2)).is_some());
    }
}
