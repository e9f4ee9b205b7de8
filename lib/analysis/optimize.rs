//! The optimization driver.
//!
//! The three passes are independent, but each can expose opportunities for
//! the others: folding a constant can leave a move redundant, removing a
//! move can leave its producer dead. The driver runs folding, then
//! subexpression elimination, then dead code elimination, and repeats the
//! round until a full round deletes nothing. Termination is inherited from
//! the passes: every change deletes at least one vertex, and vertices are
//! never added.

use log::debug;
use std::default;

use super::constant_folding::constant_folding;
use super::data_flow_graph::DataFlowGraph;
use super::dead_code_elimination::dead_code_elimination;
use super::subexpression_elimination::subexpression_elimination;
use crate::architecture::Architecture;
use crate::Error;

/// Options controlling which passes the driver runs.
#[derive(Clone, Debug)]
pub struct Options {
    constant_folding: bool,
    subexpression_elimination: bool,
    dead_code_elimination: bool,
}

impl Options {
    /// Create a new set of options with every pass enabled.
    pub fn new() -> Options {
        Options::default()
    }

    pub fn constant_folding(&self) -> bool {
        self.constant_folding
    }

    pub fn subexpression_elimination(&self) -> bool {
        self.subexpression_elimination
    }

    pub fn dead_code_elimination(&self) -> bool {
        self.dead_code_elimination
    }
}

impl default::Default for Options {
    fn default() -> Options {
        Options {
            constant_folding: true,
            subexpression_elimination: true,
            dead_code_elimination: true,
        }
    }
}

/// Create driver options with the builder pattern.
pub struct OptionsBuilder {
    options: Options,
}

impl OptionsBuilder {
    pub fn new() -> OptionsBuilder {
        OptionsBuilder {
            options: Options::default(),
        }
    }

    pub fn constant_folding(mut self, enabled: bool) -> OptionsBuilder {
        self.options.constant_folding = enabled;
        self
    }

    pub fn subexpression_elimination(mut self, enabled: bool) -> OptionsBuilder {
        self.options.subexpression_elimination = enabled;
        self
    }

    pub fn dead_code_elimination(mut self, enabled: bool) -> OptionsBuilder {
        self.options.dead_code_elimination = enabled;
        self
    }

    pub fn build(self) -> Options {
        self.options
    }
}

impl default::Default for OptionsBuilder {
    fn default() -> OptionsBuilder {
        OptionsBuilder::new()
    }
}

/// Run the enabled passes over `dfg` to a joint fixed point.
///
/// Returns the total number of instructions deleted. Commit the graph back
/// to storage afterwards with [`DataFlowGraph::commit`].
pub fn optimize(
    dfg: &mut DataFlowGraph,
    arch: &dyn Architecture,
    options: &Options,
) -> Result<usize, Error> {
    let mut total = 0;

    loop {
        let mut round = 0;
        if options.constant_folding {
            round += constant_folding(dfg)?;
        }
        if options.subexpression_elimination {
            round += subexpression_elimination(dfg)?;
        }
        if options.dead_code_elimination {
            round += dead_code_elimination(dfg, arch)?;
        }
        if round == 0 {
            break;
        }
        total += round;
        debug!("optimization round deleted {} instructions", round);
    }

    Ok(total)
}
