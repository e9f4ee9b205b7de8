//! Control flow graph construction.
//!
//! Blocks are fetched from a [`CodeStorage`] one native expansion at a
//! time, decode-on-miss included, and grouped into basic blocks ending at
//! the first instruction flagged [`il::InsnFlags::BB_END`]. The traversal
//! is an explicit-stack, iterative pre-order walk; there is no recursion
//! anywhere in graph construction.

use log::trace;
use rustc_hash::{FxHashMap, FxHashSet};

use crate::architecture::Architecture;
use crate::graph;
use crate::il;
use crate::storage::CodeStorage;
use crate::Error;

/// A basic block vertex of a control flow graph.
#[derive(Clone, Debug)]
pub struct CfgVertex {
    index: usize,
    block: il::BasicBlock,
    /// The encoding mode this block was reached in.
    mode: u64,
}

impl CfgVertex {
    pub fn block(&self) -> &il::BasicBlock {
        &self.block
    }

    pub fn mode(&self) -> u64 {
        self.mode
    }
}

impl graph::Vertex for CfgVertex {
    fn index(&self) -> usize {
        self.index
    }
    fn dot_label(&self) -> String {
        format!("{}", self.block)
    }
}

/// An edge between two basic blocks.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct CfgEdge {
    head: usize,
    tail: usize,
}

impl graph::Edge for CfgEdge {
    fn head(&self) -> usize {
        self.head
    }
    fn tail(&self) -> usize {
        self.tail
    }
    fn dot_label(&self) -> String {
        String::new()
    }
}

/// A graph of basic blocks, keyed by each block's starting IR address.
#[derive(Clone, Debug, Default)]
pub struct ControlFlowGraph {
    graph: graph::Graph<CfgVertex, CfgEdge>,
    blocks: FxHashMap<il::IrAddr, usize>,
    next_index: usize,
    entry: Option<il::IrAddr>,
}

impl ControlFlowGraph {
    pub fn new() -> ControlFlowGraph {
        ControlFlowGraph::default()
    }

    /// The starting IR address the graph was traversed from.
    pub fn entry(&self) -> Option<il::IrAddr> {
        self.entry
    }

    pub fn num_blocks(&self) -> usize {
        self.blocks.len()
    }

    /// Fetch a block by its starting IR address.
    pub fn block(&self, ir_addr: il::IrAddr) -> Result<&il::BasicBlock, Error> {
        let index = self
            .blocks
            .get(&ir_addr)
            .ok_or_else(|| Error::Custom(format!("no block at {}", ir_addr)))?;
        Ok(self.graph.vertex(*index)?.block())
    }

    /// Every block in the graph, in insertion (pre-order) order by handle.
    pub fn blocks(&self) -> Vec<&il::BasicBlock> {
        self.graph
            .vertices()
            .into_iter()
            .map(|vertex| vertex.block())
            .collect()
    }

    /// The starting addresses of the successors of the block at `ir_addr`.
    pub fn successor_addrs(&self, ir_addr: il::IrAddr) -> Result<Vec<il::IrAddr>, Error> {
        let index = self
            .blocks
            .get(&ir_addr)
            .ok_or_else(|| Error::Custom(format!("no block at {}", ir_addr)))?;
        Ok(self
            .graph
            .successor_indices(*index)?
            .into_iter()
            .map(|successor| self.graph.vertex(successor).unwrap().block().ir_addr())
            .collect())
    }

    pub fn graph(&self) -> &graph::Graph<CfgVertex, CfgEdge> {
        &self.graph
    }

    fn insert_block(&mut self, block: il::BasicBlock, mode: u64) -> usize {
        let ir_addr = block.ir_addr();
        if let Some(index) = self.blocks.get(&ir_addr) {
            return *index;
        }
        let index = self.next_index;
        self.next_index += 1;
        self.graph
            .insert_vertex(CfgVertex { index, block, mode })
            .expect("fresh vertex handle");
        self.blocks.insert(ir_addr, index);
        index
    }
}

/// The successor pair of a block, with encoding modes resolved.
///
/// Returns `(fall-through, taken-branch)`, each a target IR address and the
/// mode it is reached in. A branch whose mode-stripped target is exactly
/// the fall-through boundary only switches modes and is folded into the
/// fall-through successor rather than reported as a branch.
pub fn block_successors(
    block: &il::BasicBlock,
    arch: &dyn Architecture,
    mode: u64,
) -> (Option<(il::IrAddr, u64)>, Option<(il::IrAddr, u64)>) {
    let (fall, branch) = block.successors();

    let fall = fall.map(|ir_addr| (ir_addr, mode));
    // a call's branch side leaves the function; the callee is opaque to
    // this analysis and control resumes at the fall-through
    let branch = if block.last().has_flag(il::InsnFlags::CALL) {
        None
    } else {
        branch
    };
    let branch = branch.map(|ir_addr| {
        let (addr, branch_mode) = arch.split_mode(ir_addr.addr());
        (il::IrAddr(addr, ir_addr.inum()), branch_mode)
    });

    if let Some((branch_addr, branch_mode)) = branch {
        // conditional branch to the fall-through boundary: a mode toggle,
        // not a control split
        if let Some((fall_addr, _)) = fall {
            if branch_addr == fall_addr {
                return (Some((fall_addr, branch_mode)), None);
            }
        }
        // unconditional branch to the next native instruction: likewise
        if fall.is_none() {
            let last = block.last();
            let boundary = il::IrAddr(last.addr() + last.size(), 0);
            if branch_addr == boundary {
                return (Some((boundary, branch_mode)), None);
            }
        }
    }

    (fall, branch)
}

/// Builds control flow graphs over an instruction store.
pub struct CfgBuilder<'a> {
    storage: &'a mut dyn CodeStorage,
    arch: &'a dyn Architecture,
}

impl<'a> CfgBuilder<'a> {
    pub fn new(storage: &'a mut dyn CodeStorage, arch: &'a dyn Architecture) -> CfgBuilder<'a> {
        CfgBuilder { storage, arch }
    }

    pub fn arch(&self) -> &dyn Architecture {
        self.arch
    }

    /// Fetch the basic block containing `ir_addr`, pulling native
    /// expansions from the store until one carries the block-end flag.
    pub fn basic_block(&mut self, ir_addr: il::IrAddr) -> Result<il::BasicBlock, Error> {
        let mut insns: Vec<il::Insn> = Vec::new();
        let mut addr = ir_addr.addr();

        loop {
            let expansion = self.storage.machine_insn(addr)?;
            let size = expansion.last().map(|insn| insn.size()).unwrap_or(0);
            insns.extend(expansion);
            if insns.last().unwrap().has_flag(il::InsnFlags::BB_END) {
                break;
            }
            addr += size;
        }

        // split the accumulated run at the requested sub-index and the
        // first block end after it
        let start = ir_addr.inum() as usize;
        let mut end = start;
        for insn in insns.iter().skip(start) {
            end += 1;
            if insn.has_flag(il::InsnFlags::BB_END) {
                return Ok(il::BasicBlock::new(insns[start..end].to_vec()));
            }
        }

        Err(Error::Custom(format!("no basic block at {}", ir_addr)))
    }

    /// Build the graph of every basic block reachable from `addr` by
    /// fall-through and taken-branch edges.
    ///
    /// A read failure on any path aborts the traversal with the error; it
    /// is never swallowed.
    pub fn traverse(&mut self, addr: u64) -> Result<ControlFlowGraph, Error> {
        let (addr, mode) = self.arch.split_mode(addr);
        let entry = il::IrAddr(addr, 0);

        let mut cfg = ControlFlowGraph::new();
        cfg.entry = Some(entry);

        let mut stack: Vec<(il::IrAddr, u64)> = vec![(entry, mode)];
        let mut visited: FxHashSet<il::IrAddr> = FxHashSet::default();
        let mut edges: Vec<(il::IrAddr, il::IrAddr)> = Vec::new();
        let mut recorded: FxHashSet<(il::IrAddr, il::IrAddr)> = FxHashSet::default();

        while let Some((ir_addr, mode)) = stack.pop() {
            if !visited.insert(ir_addr) {
                continue;
            }

            let block = self.basic_block(ir_addr)?;
            trace!("visiting block at {}", ir_addr);

            let (fall, branch) = block_successors(&block, self.arch, mode);
            cfg.insert_block(block, mode);

            // the branch side is pushed first so fall-through paths are
            // walked first
            for successor in [branch, fall].iter().flatten() {
                let (target, target_mode) = *successor;
                if recorded.insert((ir_addr, target)) {
                    edges.push((ir_addr, target));
                }
                if !visited.contains(&target) {
                    stack.push((target, target_mode));
                }
            }
        }

        for (from, to) in edges {
            let head = cfg.blocks[&from];
            let tail = cfg.blocks[&to];
            cfg.graph.insert_edge(CfgEdge { head, tail })?;
        }

        Ok(cfg)
    }

    /// Collect the instructions of every block reachable from `addr`, in
    /// address order.
    pub fn function_insns(&mut self, addr: u64) -> Result<Vec<il::Insn>, Error> {
        let cfg = self.traverse(addr)?;
        let mut insns: Vec<il::Insn> = cfg
            .blocks()
            .into_iter()
            .flat_map(|block| block.insns().iter().cloned())
            .collect();
        insns.sort_by_key(|insn| insn.ir_addr());
        insns.dedup_by_key(|insn| insn.ir_addr());
        Ok(insns)
    }
}
