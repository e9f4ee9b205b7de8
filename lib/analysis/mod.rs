//! Analyses over REIL programs.

mod constant_folding;
mod control_flow_graph;
mod data_flow_graph;
mod dead_code_elimination;
mod optimize;
mod subexpression_elimination;

pub use self::constant_folding::constant_folding;
pub use self::control_flow_graph::*;
pub use self::data_flow_graph::*;
pub use self::dead_code_elimination::dead_code_elimination;
pub use self::optimize::*;
pub use self::subexpression_elimination::subexpression_elimination;
