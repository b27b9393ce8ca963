//! Lowers a [`Select`] into a flat opcode program.
//!
//! Compilation runs in passes, each consuming the previous one's output:
//!
//! 1. **Type resolution** (`resolve_value`/`resolve_cond`) — every `Column`
//!    node is looked up against a [`Schema`], every `Arith` node's output
//!    type is the generalization of its operands (`Int < Int64 < Float <
//!    Double`), and a mismatched comparison or non-numeric arithmetic is a
//!    [`EngineError::CompileError`].
//! 2. **Constant folding**, fused into the same recursion: an `Arith` node
//!    whose operands both resolved to constants evaluates immediately
//!    instead of emitting a `Math` op.
//! 3. **Structural emission** (`Builder::compile_scalar`/`compile_cond`) —
//!    walks the typed tree into registers and opcodes. Scalar
//!    sub-expressions are memoized by structural equality so two
//!    references to the same column or the same computed value share a
//!    register (the register-machine equivalent of common subexpression
//!    elimination). Boolean trees compile via continuation-passing style:
//!    each node takes an "on true" and "on false" jump target and is
//!    responsible only for reaching one or the other, which is what lets
//!    `AND`/`OR`/`NOT` compose into a jump graph without a separate
//!    bytecode representation for any of them.
//! 4. **Placement** (`Builder::finish`) — assigns a dense program counter
//!    to every real op, skipping the `Nop` landmarks pass 3 left behind;
//!    each `Nop` resolves to whichever real op follows it (or one past the
//!    end, for a landmark placed at the very end of the program).
//! 5. **Patching** — every deferred jump target recorded during emission is
//!    resolved against the placement map and written into the op's `p1` or
//!    `p3` field.
//! 6. **Cleanup** — `Nop`s are dropped from the final `Vec<Op>` entirely;
//!    the interpreter never sees one.

pub mod ast;

use ast::{Expr, Select};
use crate::error::{EngineError, Result};
use crate::types::{Value, VirgType};
use crate::vm::opcode::{MathOp, Op, Opcode, P4};

/// A table's columns as the compiler sees them, with no dependency on the
/// paging layer: the caller (`crate::engine::Engine`) reads this out of a
/// `Database`'s tablet chain once, before compiling.
#[derive(Debug, Clone)]
pub struct Schema {
    pub table: String,
    pub table_id: u32,
    pub key_type: VirgType,
    pub columns: Vec<(String, VirgType)>,
}

impl Schema {
    fn resolve(&self, name: &str) -> Option<ColumnRef> {
        if name == "rowid" {
            return Some(ColumnRef::Key(self.key_type));
        }
        self.columns
            .iter()
            .position(|(n, _)| n == name)
            .map(|i| ColumnRef::Fixed(i, self.columns[i].1))
    }
}

#[derive(Debug, Clone, Copy)]
enum ColumnRef {
    Fixed(usize, VirgType),
    Key(VirgType),
}

/// One output column of a compiled program.
#[derive(Debug, Clone)]
pub struct OutputColumn {
    pub name: String,
    pub vtype: VirgType,
}

/// A compiled `SELECT`, ready for the interpreter.
#[derive(Debug, Clone)]
pub struct Program {
    pub table_id: u32,
    pub ops: Vec<Op>,
    /// The declared type of each register, indexed by register number.
    /// Parallel to the register space the ops address, not to `ops` itself.
    pub reg_types: Vec<VirgType>,
    pub output: Vec<OutputColumn>,
}

/// Compiles `select` (which must name `schema.table`) into a [`Program`],
/// rejecting it if the result would exceed `max_ops` opcodes or `max_regs`
/// registers.
pub fn compile(schema: &Schema, select: &Select, max_ops: usize, max_regs: usize) -> Result<Program> {
    if select.table != schema.table {
        return Err(EngineError::compile(format!(
            "compiled schema is for table {:?}, select names {:?}",
            schema.table, select.table
        )));
    }

    let mut builder = Builder::new();
    let output = if let Some(filter) = &select.filter {
        let cond = resolve_cond(schema, filter)?;
        let success = builder.new_label();
        let failure = builder.new_label();
        builder.compile_cond(&cond, success, failure);
        builder.place_label(success);
        let output = compile_projection(&mut builder, schema, select)?;
        builder.place_label(failure);
        output
    } else {
        compile_projection(&mut builder, schema, select)?
    };

    let (ops, reg_types) = builder.finish();
    if ops.len() > max_ops {
        return Err(EngineError::compile(format!(
            "compiled program has {} ops, exceeding the limit of {max_ops}",
            ops.len()
        )));
    }
    if reg_types.len() > max_regs {
        return Err(EngineError::compile(format!(
            "compiled program needs {} registers, exceeding the limit of {max_regs}",
            reg_types.len()
        )));
    }

    Ok(Program {
        table_id: schema.table_id,
        ops,
        reg_types,
        output,
    })
}

fn compile_projection(builder: &mut Builder, schema: &Schema, select: &Select) -> Result<Vec<OutputColumn>> {
    let columns: Vec<(String, Expr)> = if select.columns.is_empty() {
        schema
            .columns
            .iter()
            .map(|(name, _)| (name.clone(), Expr::Column(name.clone())))
            .collect()
    } else {
        select
            .columns
            .iter()
            .map(|c| (c.name.clone(), c.expr.clone()))
            .collect()
    };
    if columns.is_empty() {
        return Err(EngineError::compile(
            "select has no output columns, and the table has no columns to default to",
        ));
    }

    let mut src_regs = Vec::with_capacity(columns.len());
    let mut output = Vec::with_capacity(columns.len());
    for (name, expr) in &columns {
        let typed = resolve_value(schema, expr)?;
        let reg = builder.compile_scalar(&typed);
        src_regs.push(reg);
        output.push(OutputColumn {
            name: name.clone(),
            vtype: typed.vtype(),
        });
    }

    // Register-compaction pass: land every projected value in a fresh,
    // contiguous block of registers so `Result`'s p1..p1+p2 addressing is
    // valid even when two projections share a memoized source register.
    let mut dst_regs = Vec::with_capacity(src_regs.len());
    for src in &src_regs {
        let vtype = builder.reg_types[*src as usize];
        let dst = builder.alloc_reg(vtype);
        builder.push_plain(Opcode::Move, dst, *src, 0, P4::None);
        dst_regs.push(dst);
    }
    builder.push_plain(Opcode::Result, dst_regs[0], columns.len() as i32, 0, P4::None);

    Ok(output)
}

// ---- type resolution + constant folding --------------------------------

#[derive(Debug, Clone, PartialEq)]
enum TypedExpr {
    Const(Value),
    Column { idx: usize, vtype: VirgType },
    Rowid { vtype: VirgType },
    Arith(Box<TypedExpr>, MathOp, Box<TypedExpr>, VirgType),
    Cast(Box<TypedExpr>, VirgType),
}

impl TypedExpr {
    fn vtype(&self) -> VirgType {
        match self {
            TypedExpr::Const(v) => v.vtype(),
            TypedExpr::Column { vtype, .. } => *vtype,
            TypedExpr::Rowid { vtype } => *vtype,
            TypedExpr::Arith(_, _, _, t) => *t,
            TypedExpr::Cast(_, t) => *t,
        }
    }

    fn as_const(&self) -> Option<Value> {
        match self {
            TypedExpr::Const(v) => Some(*v),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
enum TypedCond {
    Compare(TypedExpr, crate::vm::opcode::CmpOp, TypedExpr),
    And(Box<TypedCond>, Box<TypedCond>),
    Or(Box<TypedCond>, Box<TypedCond>),
    Not(Box<TypedCond>),
}

fn resolve_value(schema: &Schema, expr: &Expr) -> Result<TypedExpr> {
    match expr {
        Expr::IntLit(v) => Ok(TypedExpr::Const(int_literal(*v))),
        Expr::FloatLit(v) => Ok(TypedExpr::Const(Value::Float(*v as f32))),
        Expr::Column(name) => match schema.resolve(name) {
            Some(ColumnRef::Fixed(idx, vtype)) => Ok(TypedExpr::Column { idx, vtype }),
            Some(ColumnRef::Key(vtype)) => Ok(TypedExpr::Rowid { vtype }),
            None => Err(EngineError::compile(format!("no such column {name:?}"))),
        },
        Expr::Arith(l, op, r) => {
            let l = resolve_value(schema, l)?;
            let r = resolve_value(schema, r)?;
            let gen_type = l.vtype().generalize(r.vtype()).ok_or_else(|| {
                EngineError::compile(format!(
                    "arithmetic requires two numeric operands of compatible type, got {} and {}",
                    l.vtype(),
                    r.vtype()
                ))
            })?;
            let l = cast_to(l, gen_type);
            let r = cast_to(r, gen_type);
            if let (Some(lc), Some(rc)) = (l.as_const(), r.as_const()) {
                Ok(TypedExpr::Const(op.eval(lc, rc, gen_type)))
            } else {
                Ok(TypedExpr::Arith(Box::new(l), *op, Box::new(r), gen_type))
            }
        }
        Expr::Compare(..) | Expr::And(..) | Expr::Or(..) | Expr::Not(..) => Err(EngineError::compile(
            "a boolean expression cannot appear where a value is expected",
        )),
    }
}

fn resolve_cond(schema: &Schema, expr: &Expr) -> Result<TypedCond> {
    match expr {
        Expr::Compare(l, cmp, r) => {
            let l = resolve_value(schema, l)?;
            let r = resolve_value(schema, r)?;
            if l.vtype() != r.vtype() {
                return Err(EngineError::compile(format!(
                    "comparison operand types disagree: {} vs {}",
                    l.vtype(),
                    r.vtype()
                )));
            }
            Ok(TypedCond::Compare(l, *cmp, r))
        }
        Expr::And(l, r) => Ok(TypedCond::And(
            Box::new(resolve_cond(schema, l)?),
            Box::new(resolve_cond(schema, r)?),
        )),
        Expr::Or(l, r) => Ok(TypedCond::Or(
            Box::new(resolve_cond(schema, l)?),
            Box::new(resolve_cond(schema, r)?),
        )),
        Expr::Not(e) => Ok(TypedCond::Not(Box::new(resolve_cond(schema, e)?))),
        _ => Err(EngineError::compile(
            "a value expression cannot appear where a boolean is expected",
        )),
    }
}

fn cast_to(e: TypedExpr, target: VirgType) -> TypedExpr {
    if e.vtype() == target {
        return e;
    }
    match e {
        TypedExpr::Const(v) => TypedExpr::Const(v.cast(target)),
        other => TypedExpr::Cast(Box::new(other), target),
    }
}

fn int_literal(v: i64) -> Value {
    match i32::try_from(v) {
        Ok(v) => Value::Int(v),
        Err(_) => Value::Int64(v),
    }
}

// ---- structural emission ------------------------------------------------

#[derive(Clone, Copy)]
enum JumpField {
    P1,
    P3,
}

struct PendingOp {
    op: Opcode,
    p1: i32,
    p2: i32,
    p3: i32,
    p4: P4,
    jump: Option<(JumpField, usize)>,
}

struct Builder {
    ops: Vec<PendingOp>,
    reg_types: Vec<VirgType>,
    memo: Vec<(TypedExpr, i32)>,
    labels: Vec<Option<usize>>,
}

impl Builder {
    fn new() -> Builder {
        Builder {
            ops: Vec::new(),
            reg_types: Vec::new(),
            memo: Vec::new(),
            labels: Vec::new(),
        }
    }

    fn new_label(&mut self) -> usize {
        self.labels.push(None);
        self.labels.len() - 1
    }

    fn place_label(&mut self, label: usize) {
        self.labels[label] = Some(self.ops.len());
        self.push_plain(Opcode::Nop, 0, 0, 0, P4::None);
    }

    fn alloc_reg(&mut self, vtype: VirgType) -> i32 {
        self.reg_types.push(vtype);
        (self.reg_types.len() - 1) as i32
    }

    fn push_plain(&mut self, op: Opcode, p1: i32, p2: i32, p3: i32, p4: P4) -> usize {
        self.ops.push(PendingOp {
            op,
            p1,
            p2,
            p3,
            p4,
            jump: None,
        });
        self.ops.len() - 1
    }

    fn push_jump(&mut self, op: Opcode, p1: i32, p2: i32, p4: P4, field: JumpField, target: usize) -> usize {
        self.ops.push(PendingOp {
            op,
            p1,
            p2,
            p3: 0,
            p4,
            jump: Some((field, target)),
        });
        self.ops.len() - 1
    }

    fn compile_scalar(&mut self, texpr: &TypedExpr) -> i32 {
        if let Some((_, reg)) = self.memo.iter().find(|(e, _)| e == texpr) {
            return *reg;
        }
        let reg = match texpr {
            TypedExpr::Const(v) => {
                let r = self.alloc_reg(v.vtype());
                match v {
                    Value::Float(f) => self.push_plain(Opcode::Float, r, 0, 0, P4::Float(*f as f64)),
                    Value::Double(f) => self.push_plain(Opcode::Float, r, 0, 0, P4::Float(*f)),
                    Value::Int(i) => self.push_plain(Opcode::Integer, r, 0, 0, P4::Int(*i as i64)),
                    Value::Int64(i) => self.push_plain(Opcode::Integer, r, 0, 0, P4::Int(*i)),
                    Value::Char(c) => self.push_plain(Opcode::Integer, r, 0, 0, P4::Int(*c as i64)),
                };
                r
            }
            TypedExpr::Column { idx, vtype } => {
                let r = self.alloc_reg(*vtype);
                self.push_plain(Opcode::Column, r, *idx as i32, 0, P4::None);
                r
            }
            TypedExpr::Rowid { vtype } => {
                let r = self.alloc_reg(*vtype);
                self.push_plain(Opcode::Rowid, r, 0, 0, P4::None);
                r
            }
            TypedExpr::Arith(l, op, r_expr, vtype) => {
                let lr = self.compile_scalar(l);
                let rr = self.compile_scalar(r_expr);
                let reg = self.alloc_reg(*vtype);
                self.push_plain(Opcode::Math, reg, lr, rr, P4::Math(*op));
                reg
            }
            TypedExpr::Cast(inner, to) => {
                let ir = self.compile_scalar(inner);
                let reg = self.alloc_reg(*to);
                self.push_plain(Opcode::Cast, reg, ir, 0, P4::Cast(*to));
                reg
            }
        };
        self.memo.push((texpr.clone(), reg));
        reg
    }

    fn compile_cond(&mut self, cond: &TypedCond, on_true: usize, on_false: usize) {
        match cond {
            TypedCond::Compare(l, cmp, r) => {
                let lr = self.compile_scalar(l);
                let rr = self.compile_scalar(r);
                self.push_jump(Opcode::Compare, lr, rr, P4::Cmp(*cmp), JumpField::P3, on_true);
                self.push_jump(Opcode::Goto, 0, 0, P4::None, JumpField::P1, on_false);
            }
            TypedCond::And(a, b) => {
                let mid = self.new_label();
                self.compile_cond(a, mid, on_false);
                self.place_label(mid);
                self.compile_cond(b, on_true, on_false);
            }
            TypedCond::Or(a, b) => {
                let mid = self.new_label();
                self.compile_cond(a, on_true, mid);
                self.place_label(mid);
                self.compile_cond(b, on_true, on_false);
            }
            TypedCond::Not(a) => self.compile_cond(a, on_false, on_true),
        }
    }

    /// Placement, patching, and cleanup in one pass: assigns every real op a
    /// dense program counter, resolves every label against it (a `Nop`
    /// inherits the PC of whichever real op follows it, or one past the end
    /// if none does), patches deferred jump targets, and drops the `Nop`s.
    fn finish(self) -> (Vec<Op>, Vec<VirgType>) {
        let mut pc_of = vec![0usize; self.ops.len()];
        let mut real_count = 0usize;
        for (i, op) in self.ops.iter().enumerate() {
            if op.op != Opcode::Nop {
                pc_of[i] = real_count;
                real_count += 1;
            }
        }
        for i in (0..self.ops.len()).rev() {
            if self.ops[i].op == Opcode::Nop {
                pc_of[i] = if i + 1 < self.ops.len() { pc_of[i + 1] } else { real_count };
            }
        }
        let label_pc: Vec<usize> = self
            .labels
            .iter()
            .map(|pos| pc_of[pos.expect("label referenced but never placed")])
            .collect();

        let mut out = Vec::with_capacity(real_count);
        for op in &self.ops {
            if op.op == Opcode::Nop {
                continue;
            }
            let mut p1 = op.p1;
            let mut p3 = op.p3;
            if let Some((field, label)) = op.jump {
                let target = label_pc[label] as i32;
                match field {
                    JumpField::P1 => p1 = target,
                    JumpField::P3 => p3 = target,
                }
            }
            out.push(Op::new(op.op, p1, op.p2, p3, op.p4));
        }
        (out, self.reg_types)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vm::opcode::CmpOp;

    fn schema() -> Schema {
        Schema {
            table: "test".to_string(),
            table_id: 1,
            key_type: VirgType::Int,
            columns: vec![("col0".to_string(), VirgType::Int), ("col1".to_string(), VirgType::Double)],
        }
    }

    fn col(name: &str) -> ast::ResultColumn {
        ast::ResultColumn {
            name: name.to_string(),
            expr: Expr::Column(name.to_string()),
        }
    }

    #[test]
    fn select_star_projects_every_column_in_order() {
        let select = Select {
            table: "test".to_string(),
            columns: vec![],
            filter: None,
        };
        let program = compile(&schema(), &select, 32, 16).unwrap();
        assert_eq!(program.output.len(), 2);
        assert_eq!(program.output[0].name, "col0");
        assert_eq!(program.output[1].name, "col1");
        assert!(matches!(program.ops.last().unwrap().op, Opcode::Result));
    }

    #[test]
    fn constant_arithmetic_folds_to_a_single_load() {
        // col0 + 10 * (1 + 2)
        let expr = Expr::Arith(
            Box::new(Expr::Column("col0".to_string())),
            MathOp::Add,
            Box::new(Expr::Arith(
                Box::new(Expr::IntLit(10)),
                MathOp::Mul,
                Box::new(Expr::Arith(Box::new(Expr::IntLit(1)), MathOp::Add, Box::new(Expr::IntLit(2)))),
            )),
        );
        let select = Select {
            table: "test".to_string(),
            columns: vec![ast::ResultColumn {
                name: "computed".to_string(),
                expr,
            }],
            filter: None,
        };
        let program = compile(&schema(), &select, 32, 16).unwrap();
        let constant_loads: Vec<&Op> = program
            .ops
            .iter()
            .filter(|op| op.op == Opcode::Integer)
            .collect();
        assert_eq!(constant_loads.len(), 1, "the literal subtree should fold to one constant load");
        assert!(matches!(constant_loads[0].p4, P4::Int(30)));
    }

    #[test]
    fn and_or_precedence_compiles_into_a_jump_graph() {
        // col0 < 9 AND col0 >= 7 OR col0 = 3
        let lt = Expr::Compare(Box::new(Expr::Column("col0".to_string())), CmpOp::Lt, Box::new(Expr::IntLit(9)));
        let ge = Expr::Compare(Box::new(Expr::Column("col0".to_string())), CmpOp::Ge, Box::new(Expr::IntLit(7)));
        let eq = Expr::Compare(Box::new(Expr::Column("col0".to_string())), CmpOp::Eq, Box::new(Expr::IntLit(3)));
        let filter = Expr::Or(Box::new(Expr::And(Box::new(lt), Box::new(ge))), Box::new(eq));
        let select = Select {
            table: "test".to_string(),
            columns: vec![col("col0")],
            filter: Some(filter),
        };
        let program = compile(&schema(), &select, 32, 16).unwrap();
        let compares = program.ops.iter().filter(|op| op.op == Opcode::Compare).count();
        assert_eq!(compares, 3, "one Compare per leaf condition");
    }

    #[test]
    fn mismatched_comparison_types_are_a_compile_error() {
        let filter = Expr::Compare(
            Box::new(Expr::Column("col0".to_string())),
            CmpOp::Eq,
            Box::new(Expr::FloatLit(1.0)),
        );
        let select = Select {
            table: "test".to_string(),
            columns: vec![col("col0")],
            filter: Some(filter),
        };
        assert!(compile(&schema(), &select, 32, 16).is_err());
    }

    #[test]
    fn unknown_column_is_a_compile_error() {
        let select = Select {
            table: "test".to_string(),
            columns: vec![col("nope")],
            filter: None,
        };
        assert!(compile(&schema(), &select, 32, 16).is_err());
    }

    #[test]
    fn duplicate_projection_reuses_the_same_source_register_but_distinct_output_slots() {
        let select = Select {
            table: "test".to_string(),
            columns: vec![col("col0"), col("col0")],
            filter: None,
        };
        let program = compile(&schema(), &select, 32, 16).unwrap();
        let moves: Vec<&Op> = program.ops.iter().filter(|op| op.op == Opcode::Move).collect();
        assert_eq!(moves.len(), 2);
        assert_ne!(moves[0].p1, moves[1].p1, "each projection needs its own output register");
        assert_eq!(moves[0].p2, moves[1].p2, "both read the same memoized column register");
    }
}
