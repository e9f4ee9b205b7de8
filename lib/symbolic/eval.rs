//! Width-exact constant evaluation of REIL operators.
//!
//! All arithmetic here goes through [`crate::il::Constant`], whose value is
//! always read through its width mask. Signed operators sign-extend their
//! operands from the declared operand width, never from the host integer
//! width.

use crate::il::{Constant, Insn, Opcode, Width};
use crate::Error;

/// Evaluate a single operator application over constants.
///
/// The result carries the operator's natural width: the first operand's
/// width for data operators, one bit for comparisons. Unary operators
/// ignore `b`.
///
/// # Errors
/// `Error::Arithmetic` on division or modulo by zero; `Error::Custom` when
/// the opcode is not a pure operator or a required operand is missing.
pub fn eval_op(op: Opcode, a: &Constant, b: Option<&Constant>) -> Result<Constant, Error> {
    let width = a.width();

    // shifts take their count at any width; everything else requires equal
    // operand widths
    if !matches!(op, Opcode::Shl | Opcode::Shr) {
        if let Some(b) = b {
            if b.width() != width {
                return Err(Error::Sort);
            }
        }
    }

    let binary = |f: fn(u64, u64) -> u64| -> Result<Constant, Error> {
        let b = b.ok_or_else(|| Error::Custom(format!("{} requires two operands", op)))?;
        Ok(Constant::new(f(a.value(), b.value()), width))
    };

    let binary_signed = |f: fn(i64, i64) -> i64| -> Result<Constant, Error> {
        let b = b.ok_or_else(|| Error::Custom(format!("{} requires two operands", op)))?;
        Ok(Constant::new(
            f(a.value_signed(), b.value_signed()) as u64,
            width,
        ))
    };

    let nonzero = |c: Option<&Constant>| -> Result<u64, Error> {
        let value = c
            .ok_or_else(|| Error::Custom(format!("{} requires two operands", op)))?
            .value();
        if value == 0 {
            Err(Error::Arithmetic("division by zero".to_string()))
        } else {
            Ok(value)
        }
    };

    match op {
        Opcode::Str => Ok(*a),
        Opcode::Add => binary(u64::wrapping_add),
        Opcode::Sub => binary(u64::wrapping_sub),
        Opcode::Neg => Ok(Constant::new(a.value().wrapping_neg(), width)),
        Opcode::Mul => binary(u64::wrapping_mul),
        Opcode::Div => Ok(Constant::new(a.value() / nonzero(b)?, width)),
        Opcode::Mod => Ok(Constant::new(a.value() % nonzero(b)?, width)),
        Opcode::Smul => binary_signed(i64::wrapping_mul),
        Opcode::Sdiv => {
            nonzero(b)?;
            binary_signed(i64::wrapping_div)
        }
        Opcode::Smod => {
            nonzero(b)?;
            binary_signed(i64::wrapping_rem)
        }
        // Shifting past the host width yields zero rather than wrapping the
        // shift amount.
        Opcode::Shl => binary(|a, b| a.checked_shl(b as u32).unwrap_or(0)),
        Opcode::Shr => binary(|a, b| a.checked_shr(b as u32).unwrap_or(0)),
        Opcode::And => binary(|a, b| a & b),
        Opcode::Or => binary(|a, b| a | b),
        Opcode::Xor => binary(|a, b| a ^ b),
        Opcode::Not => Ok(Constant::new(!a.value(), width)),
        Opcode::Eq => {
            let b = b.ok_or_else(|| Error::Custom(format!("{} requires two operands", op)))?;
            Ok(Constant::new((a.value() == b.value()) as u64, Width::U1))
        }
        Opcode::Lt => {
            let b = b.ok_or_else(|| Error::Custom(format!("{} requires two operands", op)))?;
            Ok(Constant::new((a.value() < b.value()) as u64, Width::U1))
        }
        Opcode::None
        | Opcode::Unknown
        | Opcode::Jcc
        | Opcode::Stm
        | Opcode::Ldm => Err(Error::Custom(format!("{} is not evaluatable", op))),
    }
}

/// Evaluate an instruction whose source slots are all constants, producing
/// a constant masked to the destination operand's width.
///
/// # Errors
/// As [`eval_op`]; additionally `Error::Custom` when a source slot is not a
/// constant or the destination has no width.
pub fn eval_insn(insn: &Insn) -> Result<Constant, Error> {
    let a = insn
        .a()
        .constant()
        .ok_or_else(|| Error::Custom(format!("non-constant operand in {}", insn)))?;
    let b = match insn.b() {
        crate::il::Operand::None => None,
        operand => Some(
            operand
                .constant()
                .ok_or_else(|| Error::Custom(format!("non-constant operand in {}", insn)))?,
        ),
    };
    let out_width = insn
        .c()
        .width()
        .ok_or_else(|| Error::Custom(format!("destination has no width in {}", insn)))?;

    let result = eval_op(insn.op(), a, b)?;
    Ok(Constant::new(result.value(), out_width))
}
