//! Dead code elimination over a data flow graph.

use log::{debug, trace};

use super::data_flow_graph::{DataFlowGraph, ENTRY, EXIT};
use crate::architecture::Architecture;
use crate::graph::Edge;
use crate::il;
use crate::Error;

/// Remove instructions whose results are never consumed.
///
/// First, values reaching EXIT which a caller can never observe are cut
/// loose: temporaries, which by definition do not outlive their expansion,
/// and flag registers, which the architecture's calling contract does not
/// carry out of a function. Then any vertex with no outgoing edges is
/// deleted, unless its opcode has control or memory side effects
/// (conditional jumps, memory stores, opaque instructions) or it is the
/// no-op placeholder. Deletion exposes new dead vertices, so the scan
/// repeats to a fixed point.
///
/// Returns the number of vertices deleted.
pub fn dead_code_elimination(
    dfg: &mut DataFlowGraph,
    arch: &dyn Architecture,
) -> Result<usize, Error> {
    // values live at the end of the function which nothing can observe
    let exit_edges: Vec<_> = dfg
        .graph()
        .edges_in(EXIT)?
        .into_iter()
        .cloned()
        .collect();
    for edge in exit_edges {
        let producer = match dfg.insn(edge.head()) {
            Some(producer) => producer,
            None => continue,
        };
        let unobservable = producer.dst().iter().any(|operand| {
            operand.name() == Some(edge.name())
                && (operand.is_temp()
                    || arch
                        .flag_registers()
                        .iter()
                        .any(|flag| Some(*flag) == operand.name()))
        });
        if unobservable {
            trace!("severing unobservable exit value {}", edge.name());
            dfg.graph_mut().remove_edge(&edge)?;
        }
    }

    let mut total = 0;
    loop {
        let mut deleted = 0;

        for index in dfg.graph().vertex_indices() {
            if index == ENTRY || index == EXIT {
                continue;
            }
            let insn = match dfg.insn(index) {
                Some(insn) => insn,
                None => continue,
            };
            // side effects keep an instruction alive without consumers
            if matches!(
                insn.op(),
                il::Opcode::Jcc | il::Opcode::Stm | il::Opcode::None | il::Opcode::Unknown
            ) {
                continue;
            }
            if !dfg.graph().edges_out(index)?.is_empty() {
                continue;
            }

            trace!("deleting dead instruction {}", insn);
            dfg.remove_insn(index)?;
            deleted += 1;
        }

        if deleted == 0 {
            break;
        }
        total += deleted;
    }

    debug!("dead code elimination deleted {} instructions", total);
    Ok(total)
}
