//! Constant folding over a data flow graph.

use log::{debug, trace};

use super::data_flow_graph::{DataFlowGraph, ENTRY, EXIT};
use crate::graph::Edge;
use crate::il;
use crate::symbolic::eval;
use crate::Error;

/// Fold instructions computing over literal constants into their results.
///
/// A vertex qualifies when it has no incoming edges, every source slot
/// holds a constant, every destination is a temporary (an architectural
/// register is externally visible and is never rewritten here), and no
/// consumer is opaque - the operand roles of an opaque instruction are
/// unknown, so nothing can be substituted into it. The computed constant
/// replaces the matching operand slot in every consumer and the vertex is
/// deleted. The scan repeats until no vertex qualifies.
///
/// Returns the number of vertices deleted.
pub fn constant_folding(dfg: &mut DataFlowGraph) -> Result<usize, Error> {
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

            if !foldable(insn) || !dfg.graph().edges_in(index)?.is_empty() {
                continue;
            }

            // an opaque consumer blocks substitution; EXIT blocks deletion
            // outright since its value is still observable
            let blocked = dfg.graph().edges_out(index)?.iter().any(|edge| {
                dfg.insn(edge.tail())
                    .map(|consumer| consumer.op() == il::Opcode::Unknown)
                    .unwrap_or(true)
            });
            if blocked {
                continue;
            }

            let value = match eval::eval_insn(insn) {
                Ok(value) => value,
                // unevaluatable arithmetic (division by zero) stays put
                Err(Error::Arithmetic(_)) => continue,
                Err(e) => return Err(e),
            };

            trace!("folding {} to {}", insn, value);

            let out_edges: Vec<_> = dfg
                .graph()
                .edges_out(index)?
                .into_iter()
                .cloned()
                .collect();
            for edge in &out_edges {
                let consumer = dfg
                    .insn_mut(edge.tail())
                    .ok_or(Error::GraphVertexNotFound(edge.tail()))?;
                substitute(consumer, edge.name(), value);
            }

            dfg.remove_insn(index)?;
            deleted += 1;
        }

        if deleted == 0 {
            break;
        }
        total += deleted;
    }

    debug!("constant folding deleted {} instructions", total);
    Ok(total)
}

fn foldable(insn: &il::Insn) -> bool {
    if matches!(
        insn.op(),
        il::Opcode::None
            | il::Opcode::Unknown
            | il::Opcode::Jcc
            | il::Opcode::Stm
            | il::Opcode::Ldm
    ) {
        return false;
    }
    // a call's data flow is approximated, not literal
    if insn.has_flag(il::InsnFlags::CALL) {
        return false;
    }
    insn.src_all()
        .iter()
        .all(|operand| operand.constant().is_some())
        && insn.dst_all().iter().all(|operand| operand.is_temp())
}

/// Replace every source slot of `insn` reading `name` with the constant.
fn substitute(insn: &mut il::Insn, name: &str, value: il::Constant) {
    let replacement = il::Operand::Constant(value);
    if insn.a().name() == Some(name) {
        insn.set_a(replacement.clone());
    }
    if insn.b().name() == Some(name) {
        insn.set_b(replacement.clone());
    }
    // the third slot is a source for jumps and memory stores
    if matches!(insn.op(), il::Opcode::Jcc | il::Opcode::Stm) && insn.c().name() == Some(name) {
        insn.set_c(replacement);
    }
}
