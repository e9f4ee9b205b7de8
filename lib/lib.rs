//! A library for representing binary programs in the REIL intermediate
//! language, and for analyzing and optimizing that representation.
//!
//! REIL is a small, side-effect-explicit, three-address instruction set.
//! A native instruction is decoded into an *expansion* of one or more REIL
//! instructions, keyed by the pair of its virtual address and a sub-index
//! within the expansion. This library does not decode any native
//! architecture itself; decoding is supplied by an implementation of
//! [`translator::Translator`].
//!
//! The pieces fit together as follows:
//!
//! * [`il`] - The instruction and operand model.
//! * [`storage`] - Address-keyed instruction stores, including the
//!   decode-on-miss [`storage::TranslatorStorage`].
//! * [`analysis`] - Control-flow and data-flow graph construction, and the
//!   optimization passes which rewrite those graphs.
//! * [`symbolic`] - Symbolic expression trees over instruction sequences,
//!   and the width-exact constant evaluator behind constant folding.

use thiserror::Error;

pub mod analysis;
pub mod architecture;
pub mod graph;
pub mod il;
pub mod reader;
pub mod storage;
pub mod symbolic;
mod tests;
pub mod translator;

#[derive(Debug, Error)]
pub enum Error {
    /// No bytes could be produced for the given address.
    #[error("read failed at address 0x{0:x}")]
    Read(u64),

    /// No instruction in storage for the given IR address, and no reader
    /// available to fault one in.
    #[error("no instruction in storage at {0}")]
    StorageMiss(il::IrAddr),

    /// A serialized instruction carried an opcode outside the REIL set.
    #[error("invalid opcode {0} while deserializing instruction")]
    InvalidOpcode(u32),

    /// A serialized operand carried a width which is not 1/8/16/32/64.
    #[error("invalid operand width {0}")]
    InvalidWidth(u32),

    /// A decoded expansion was empty or did not terminate with the
    /// end-of-instruction flag.
    #[error("translator returned an invalid expansion at 0x{0:x}")]
    InvalidExpansion(u64),

    /// Two operands of differing widths were combined.
    #[error("operand width mismatch")]
    Sort,

    /// Arithmetic could not be evaluated, e.g. division by zero.
    #[error("arithmetic error: {0}")]
    Arithmetic(String),

    #[error("graph vertex not found: {0}")]
    GraphVertexNotFound(usize),

    #[error("graph edge not found: ({0}, {1})")]
    GraphEdgeNotFound(usize, usize),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Custom(String),
}

impl From<&str> for Error {
    fn from(s: &str) -> Error {
        Error::Custom(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Error {
        Error::Custom(s)
    }
}
