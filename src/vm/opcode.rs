//! The opcode set the compiler emits and the interpreter runs.
//!
//! Each compiled statement is a flat `Vec<Op>` executed block-by-block over
//! the rows of one data tablet at a time (see [`crate::vm::interpreter`]);
//! registers and result tablets are addressed by plain indices (`p1`/`p2`)
//! rather than by pointer, and the fourth, type-varying argument is a small
//! enum instead of a union. The outer "open a table, loop over its tablet
//! chain, allocate a result chain" driver is native Rust rather than
//! bytecode — only the per-row-block condition and projection program
//! compiles down to this opcode set; that native driver plays the role of
//! the original's `Parallel`/`Converge`/`Table`/`Finish` ops.

use crate::types::{Value, VirgType};

/// The operation a compiled [`Op`] performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    /// Load an integer constant (`p4.i`) into register `p1`.
    Integer,
    /// Load a floating point constant (`p4.f`) into register `p1`.
    Float,
    /// Load the current row block of column `p2` into register `p1`.
    Column,
    /// Load the current row block of the key/rowid strip into register `p1`.
    Rowid,
    /// Binary arithmetic: `reg[p1] = reg[p2] <op> reg[p3]`, op chosen by `p4.math`.
    Math,
    /// Binary comparison. If `reg[p1] <cmp> reg[p2]` holds for a lane
    /// (`p4.cmp` is the predicate), that lane's row PC jumps to `p3`.
    /// Otherwise it falls through to the next instruction unchanged. The
    /// compiler always places an unconditional `Goto` immediately after a
    /// `Compare`, so "falls through" and "takes the false branch" are the
    /// same thing.
    Compare,
    /// Per-lane unconditional jump to instruction `p1`, used as the
    /// compiled condition tree's "this row matched no branch" sink (plays
    /// the role of the original's `Invalid` op) and as the forward jump
    /// that closes an OR/AND landmark.
    Goto,
    /// No-op, used only as a jump landmark during compilation; never
    /// reaches the interpreter (pass 3 collapses it away).
    Nop,
    /// Cast register `p2` from its current type to `p4.cast_to`, writing
    /// the result into register `p1`.
    Cast,
    /// Copy register `p2` into register `p1`, same type. Used only by the
    /// compiler's register-compaction pass, to land each projected output
    /// in a fresh, contiguous register regardless of where its value was
    /// originally computed or memoized.
    Move,
    /// Emit the current row block's registers `p1..p1+p2` as output rows:
    /// a lane contributes a row iff its row PC equals this op's PC.
    Result,
}

/// The comparison predicate baked into a `Compare` op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    pub fn invert(self) -> CmpOp {
        match self {
            CmpOp::Eq => CmpOp::Ne,
            CmpOp::Ne => CmpOp::Eq,
            CmpOp::Lt => CmpOp::Ge,
            CmpOp::Le => CmpOp::Gt,
            CmpOp::Gt => CmpOp::Le,
            CmpOp::Ge => CmpOp::Lt,
        }
    }

    /// Evaluates the predicate over two register values, comparing as
    /// `f64` the same way the interpreter's `Compare` op does.
    pub fn eval(self, a: Value, b: Value) -> bool {
        let (a, b) = (a.as_f64(), b.as_f64());
        match self {
            CmpOp::Eq => a == b,
            CmpOp::Ne => a != b,
            CmpOp::Lt => a < b,
            CmpOp::Le => a <= b,
            CmpOp::Gt => a > b,
            CmpOp::Ge => a >= b,
        }
    }
}

/// The arithmetic operator baked into a `Math` op.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MathOp {
    Add,
    Sub,
    Mul,
    Div,
}

impl MathOp {
    /// Evaluates the operator over two register values, widening through
    /// `f64` and casting the result down to `target` — the generalized
    /// type the compiler assigned this operation's output register.
    pub fn eval(self, a: Value, b: Value, target: VirgType) -> Value {
        let (x, y) = (a.as_f64(), b.as_f64());
        let result = match self {
            MathOp::Add => x + y,
            MathOp::Sub => x - y,
            MathOp::Mul => x * y,
            MathOp::Div => x / y,
        };
        Value::Double(result).cast(target)
    }
}

/// The fourth, type-varying operand. Plays the role of the original's
/// `virg_var` tagged union argument.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum P4 {
    None,
    Int(i64),
    Float(f64),
    Cmp(CmpOp),
    Math(MathOp),
    Cast(VirgType),
}

impl P4 {
    pub fn as_value(self, vtype: VirgType) -> Value {
        match (self, vtype) {
            (P4::Int(v), VirgType::Int) => Value::Int(v as i32),
            (P4::Int(v), VirgType::Int64) => Value::Int64(v),
            (P4::Int(v), VirgType::Char) => Value::Char(v as u8),
            (P4::Float(v), VirgType::Float) => Value::Float(v as f32),
            (P4::Float(v), VirgType::Double) => Value::Double(v),
            _ => panic!("P4 operand does not match the constant's declared type"),
        }
    }
}

/// One compiled instruction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Op {
    pub op: Opcode,
    pub p1: i32,
    pub p2: i32,
    pub p3: i32,
    pub p4: P4,
}

impl Op {
    pub fn new(op: Opcode, p1: i32, p2: i32, p3: i32, p4: P4) -> Op {
        Op { op, p1, p2, p3, p4 }
    }
}
