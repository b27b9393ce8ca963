//! The expression and statement tree the parser (or a caller building
//! queries programmatically) hands to the compiler.

use crate::vm::opcode::{CmpOp, MathOp};

/// A scalar or boolean expression over a single table's columns.
#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
    Column(String),
    IntLit(i64),
    FloatLit(f64),
    Arith(Box<Expr>, MathOp, Box<Expr>),
    Compare(Box<Expr>, CmpOp, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Or(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
}

/// One projected output column: a display name plus the expression that
/// produces it. Plain `select col0` projections are `("col0",
/// Expr::Column("col0"))`; computed projections like `select col0 + 1` need
/// a name supplied by the caller, since there is no SQL text to derive one
/// from here.
#[derive(Debug, Clone, PartialEq)]
pub struct ResultColumn {
    pub name: String,
    pub expr: Expr,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Select {
    pub table: String,
    /// Empty means `SELECT *` (every fixed column, in declaration order).
    pub columns: Vec<ResultColumn>,
    pub filter: Option<Expr>,
}
