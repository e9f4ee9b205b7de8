//! Symbolic expression trees over REIL instruction sequences.
//!
//! A straight-line run of instructions folds into a [`SymState`]: a mapping
//! from symbolic names and memory locations to the expression trees that
//! produce their values. This backs human-readable inspection of what a
//! piece of code computes, and the constant evaluation behind the folding
//! pass lives in [`eval`].
//!
//! Equality over [`SymExpr`] is a matching relation, not an equivalence:
//! the wildcard [`SymExpr::Any`] compares equal to every expression, which
//! makes pattern-based assertions cheap to write, and operator nodes over
//! commutative opcodes compare equal under operand swap.

pub mod eval;

use std::fmt;

use crate::il::{Constant, Insn, IrAddr, Opcode, Operand, Width};

/// A node in a symbolic expression tree.
#[derive(Clone, Debug)]
pub enum SymExpr {
    /// The wildcard. Compares equal to anything.
    Any,
    /// A named register or temporary value of unknown origin.
    Value { name: String, width: Width },
    /// A constant.
    Const(Constant),
    /// The contents of memory at the address given by the inner expression.
    Ptr(Box<SymExpr>),
    /// A reference to an IR location.
    Addr(IrAddr),
    /// An operator applied to one or two sub-expressions.
    Expr {
        op: Opcode,
        a: Box<SymExpr>,
        b: Option<Box<SymExpr>>,
    },
}

impl SymExpr {
    pub fn value<S: Into<String>>(name: S, width: Width) -> SymExpr {
        SymExpr::Value {
            name: name.into(),
            width,
        }
    }

    pub fn constant(constant: Constant) -> SymExpr {
        SymExpr::Const(constant)
    }

    pub fn ptr(address: SymExpr) -> SymExpr {
        SymExpr::Ptr(Box::new(address))
    }

    /// Apply an operator, reducing a constant-only application to a
    /// constant immediately.
    pub fn expr(op: Opcode, a: SymExpr, b: Option<SymExpr>) -> SymExpr {
        let reduced = match (&a, &b) {
            (SymExpr::Const(ca), Some(SymExpr::Const(cb))) => {
                eval::eval_op(op, ca, Some(cb)).ok()
            }
            (SymExpr::Const(ca), None) => eval::eval_op(op, ca, None).ok(),
            _ => None,
        };
        match reduced {
            Some(constant) => SymExpr::Const(constant),
            None => SymExpr::raw_expr(op, a, b),
        }
    }

    fn raw_expr(op: Opcode, a: SymExpr, b: Option<SymExpr>) -> SymExpr {
        SymExpr::Expr {
            op,
            a: Box::new(a),
            b: b.map(Box::new),
        }
    }
}

impl PartialEq for SymExpr {
    fn eq(&self, other: &SymExpr) -> bool {
        match (self, other) {
            (SymExpr::Any, _) | (_, SymExpr::Any) => true,
            (
                SymExpr::Value { name, width },
                SymExpr::Value {
                    name: other_name,
                    width: other_width,
                },
            ) => name == other_name && width == other_width,
            (SymExpr::Const(a), SymExpr::Const(b)) => a == b,
            (SymExpr::Ptr(a), SymExpr::Ptr(b)) => a == b,
            (SymExpr::Addr(a), SymExpr::Addr(b)) => a == b,
            (
                SymExpr::Expr { op, a, b },
                SymExpr::Expr {
                    op: other_op,
                    a: other_a,
                    b: other_b,
                },
            ) => {
                if op != other_op {
                    return false;
                }
                if a == other_a && b == other_b {
                    return true;
                }
                // operand swap over a commutative operator
                if op.is_commutative() {
                    if let (Some(b), Some(other_b)) = (b, other_b) {
                        return a.as_ref() == other_b.as_ref() && b.as_ref() == other_a.as_ref();
                    }
                }
                false
            }
            _ => false,
        }
    }
}

impl fmt::Display for SymExpr {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            SymExpr::Any => write!(f, "@"),
            SymExpr::Value { name, .. } => write!(f, "{}", name),
            SymExpr::Const(constant) => write!(f, "0x{:x}", constant.value()),
            SymExpr::Ptr(address) => write!(f, "*{}", address),
            SymExpr::Addr(ir_addr) => write!(f, "&{}", ir_addr),
            SymExpr::Expr { op, a, b } => match b {
                Some(b) => write!(f, "({} {} {})", op.mnemonic(), a, b),
                None => write!(f, "({} {})", op.mnemonic(), a),
            },
        }
    }
}

/// The symbolic state of a computation: which expression produces each
/// named value and each touched memory location.
///
/// Keys are compared structurally, so lookups are linear; states stay small
/// (they are bounded by the names one function touches).
#[derive(Clone, Debug, Default)]
pub struct SymState {
    items: Vec<(SymExpr, SymExpr)>,
}

impl SymState {
    pub fn new() -> SymState {
        SymState { items: Vec::new() }
    }

    pub fn get(&self, key: &SymExpr) -> Option<&SymExpr> {
        self.items
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v)
    }

    pub fn update(&mut self, key: SymExpr, value: SymExpr) {
        if let Some(slot) = self.items.iter_mut().find(|(k, _)| *k == key) {
            slot.1 = value;
        } else {
            self.items.push((key, value));
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = &(SymExpr, SymExpr)> {
        self.items.iter()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl fmt::Display for SymState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for (key, value) in &self.items {
            writeln!(f, "{}: {}", key, value)?;
        }
        Ok(())
    }
}

fn operand_to_sym(operand: &Operand, state: &SymState) -> Option<SymExpr> {
    match operand {
        Operand::Register { name, width } | Operand::Temporary { name, width } => {
            let value = SymExpr::value(name.clone(), *width);
            Some(state.get(&value).cloned().unwrap_or(value))
        }
        Operand::Constant(constant) => Some(SymExpr::Const(*constant)),
        Operand::Location(ir_addr) => Some(SymExpr::Addr(*ir_addr)),
        Operand::None => None,
    }
}

/// Fold an instruction sequence into a symbolic state, threading state
/// left-to-right from `state`.
pub fn to_symbolic(insns: &[Insn], state: SymState) -> SymState {
    let mut state = state;

    for insn in insns {
        match insn.op() {
            // no state to update
            Opcode::Jcc | Opcode::None => continue,
            // an opaque instruction clobbers whatever it declares it writes
            Opcode::Unknown => {
                for operand in insn.dst() {
                    if let (Some(name), Some(width)) = (operand.name(), operand.width()) {
                        state.update(SymExpr::value(name, width), SymExpr::Any);
                    }
                }
                continue;
            }
            _ => {}
        }

        let mut a = operand_to_sym(insn.a(), &state);
        let mut b = operand_to_sym(insn.b(), &state);

        // canonicalize constants into the second slot of commutative
        // operators
        if insn.op().is_commutative()
            && matches!(a, Some(SymExpr::Const(_)))
            && matches!(b, Some(SymExpr::Value { .. }))
        {
            std::mem::swap(&mut a, &mut b);
        }

        let a = match a {
            Some(a) => a,
            None => continue,
        };

        // memory write: the third slot holds the address, not a name
        if insn.op() == Opcode::Stm {
            if let Some(address) = operand_to_sym(insn.c(), &state) {
                state.update(SymExpr::ptr(address), a);
            }
            continue;
        }

        let dst = match (insn.c().name(), insn.c().width()) {
            (Some(name), Some(width)) => SymExpr::value(name, width),
            _ => continue,
        };

        match insn.op() {
            // move from one value to another
            Opcode::Str => state.update(dst, a),
            // memory read
            Opcode::Ldm => state.update(dst, SymExpr::ptr(a)),
            // operator application
            op => state.update(dst, SymExpr::expr(op, a, b)),
        }
    }

    state
}
