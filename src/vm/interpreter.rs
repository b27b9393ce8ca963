//! Executes a compiled [`Program`] over a table's tablet chain, one
//! fixed-width row block at a time.
//!
//! Within a block every lane (row) carries its own program counter,
//! `row_pc`. The driver walks the program's instructions in order; at each
//! instruction only the lanes whose `row_pc` equals that instruction's PC
//! do any work, and each either advances to the next instruction or jumps
//! (`Compare`/`Goto`) to wherever its row PC says next. A lane that never
//! reaches `Result` this block simply stops mattering — there is no
//! separate "valid" bitmask, because whether a lane contributes a row is
//! exactly the question of whether its row PC lands on `Result`'s PC.

use crate::compiler::{OutputColumn, Program};
use crate::config::Config;
use crate::database::Database;
use crate::error::Result;
use crate::tablet::Tablet;
use crate::types::{read_value, write_value, Value, VirgType};
use crate::vm::opcode::{Opcode, P4};

/// Runs `program` over its table's whole tablet chain, writing matching
/// rows into a freshly allocated result-tablet chain and returning the id
/// of its first tablet. Mirrors the original's single-threaded `Converge`
/// driver; see [`crate::concurrent`] for the worker-pool variant.
pub fn execute(db: &mut Database, program: &Program) -> Result<u32> {
    let block = db.config().block;
    let first = db.table_entry(program.table_id)?.first_tablet;

    let mut writer = ResultWriter::new(db, &program.output)?;

    let mut idx = db.load(first)?;
    loop {
        let rows = run_tablet(db, idx, program, block);
        for row in rows {
            writer.push_row(db, &row)?;
        }
        match db.load_next(idx)? {
            Some(next_idx) => idx = next_idx,
            None => {
                db.unpin(idx);
                break;
            }
        }
    }

    Ok(writer.finish(db))
}

/// Runs every row block of the single, already-pinned tablet at `idx`,
/// returning the rows any lane emitted via `Result`. Pure with respect to
/// `db` — only reads tablet data — so it's the piece [`crate::concurrent`]
/// can safely call while holding nothing but a shared read lock.
pub(crate) fn run_tablet(db: &Database, idx: usize, program: &Program, block: usize) -> Vec<Vec<Value>> {
    let total_rows = db.get(idx).rows;
    let mut emitted = Vec::new();
    let mut start = 0u32;
    while start < total_rows {
        let take = (total_rows - start).min(block as u32);
        emitted.extend(run_block(db, idx, program, start, take));
        start += take;
    }
    emitted
}

fn run_block(db: &Database, idx: usize, program: &Program, start_row: u32, rows: u32) -> Vec<Vec<Value>> {
    let n = rows as usize;
    let mut row_pc = vec![0usize; n];
    let mut regs: Vec<Vec<Value>> = program.reg_types.iter().map(|_| vec![Value::Int(0); n]).collect();
    let mut emitted = Vec::new();

    for (pc, op) in program.ops.iter().enumerate() {
        match op.op {
            Opcode::Integer | Opcode::Float => {
                let vtype = program.reg_types[op.p1 as usize];
                let value = op.p4.as_value(vtype);
                for lane in 0..n {
                    if row_pc[lane] == pc {
                        regs[op.p1 as usize][lane] = value;
                        row_pc[lane] = pc + 1;
                    }
                }
            }
            Opcode::Column => {
                let col = op.p2 as usize;
                let tab = db.get(idx);
                let vtype = tab.columns[col].vtype;
                for lane in 0..n {
                    if row_pc[lane] == pc {
                        let bytes = tab.column_bytes(col, start_row + lane as u32);
                        regs[op.p1 as usize][lane] = read_value(bytes, vtype);
                        row_pc[lane] = pc + 1;
                    }
                }
            }
            Opcode::Rowid => {
                let tab = db.get(idx);
                let vtype = tab.key_type;
                for lane in 0..n {
                    if row_pc[lane] == pc {
                        let bytes = tab.key_bytes(start_row + lane as u32);
                        regs[op.p1 as usize][lane] = read_value(bytes, vtype);
                        row_pc[lane] = pc + 1;
                    }
                }
            }
            Opcode::Math => {
                let math = match op.p4 {
                    P4::Math(m) => m,
                    _ => unreachable!("Math op without a MathOp p4"),
                };
                let vtype = program.reg_types[op.p1 as usize];
                for lane in 0..n {
                    if row_pc[lane] == pc {
                        let a = regs[op.p2 as usize][lane];
                        let b = regs[op.p3 as usize][lane];
                        regs[op.p1 as usize][lane] = math.eval(a, b, vtype);
                        row_pc[lane] = pc + 1;
                    }
                }
            }
            Opcode::Cast => {
                let to = match op.p4 {
                    P4::Cast(t) => t,
                    _ => unreachable!("Cast op without a target type"),
                };
                for lane in 0..n {
                    if row_pc[lane] == pc {
                        let v = regs[op.p2 as usize][lane];
                        regs[op.p1 as usize][lane] = v.cast(to);
                        row_pc[lane] = pc + 1;
                    }
                }
            }
            Opcode::Move => {
                for lane in 0..n {
                    if row_pc[lane] == pc {
                        regs[op.p1 as usize][lane] = regs[op.p2 as usize][lane];
                        row_pc[lane] = pc + 1;
                    }
                }
            }
            Opcode::Compare => {
                let cmp = match op.p4 {
                    P4::Cmp(c) => c,
                    _ => unreachable!("Compare op without a CmpOp p4"),
                };
                for lane in 0..n {
                    if row_pc[lane] == pc {
                        let a = regs[op.p1 as usize][lane];
                        let b = regs[op.p2 as usize][lane];
                        row_pc[lane] = if cmp.eval(a, b) { op.p3 as usize } else { pc + 1 };
                    }
                }
            }
            Opcode::Goto => {
                for lane in 0..n {
                    if row_pc[lane] == pc {
                        row_pc[lane] = op.p1 as usize;
                    }
                }
            }
            Opcode::Nop => unreachable!("Nop never survives compilation"),
            Opcode::Result => {
                let first = op.p1 as usize;
                let count = op.p2 as usize;
                for lane in 0..n {
                    if row_pc[lane] == pc {
                        emitted.push((0..count).map(|r| regs[first + r][lane]).collect());
                        row_pc[lane] = pc + 1;
                    }
                }
            }
        }
    }
    emitted
}

/// Owns the tail of a result-tablet chain and appends rows to it,
/// rotating to a freshly chained tail tablet once fewer than
/// `config.result_margin` rows of headroom remain. Every method takes its
/// `Database` explicitly rather than holding a borrow across the whole
/// scan, so [`crate::concurrent`] can share one `ResultWriter` behind a
/// mutex distinct from the one guarding tablet loads.
pub(crate) struct ResultWriter {
    config: Config,
    idx: usize,
    first_id: u32,
    next_key: i64,
}

impl ResultWriter {
    pub(crate) fn new(db: &mut Database, output: &[OutputColumn]) -> Result<ResultWriter> {
        let config = *db.config();
        let id = db.next_tablet_id();
        let mut tab = Tablet::create(&config, id, VirgType::Int, None);
        for col in output {
            tab.add_column(&config, &col.name, col.vtype)?;
        }
        tab.add_max_rows(&config)?;
        let idx = db.alloc(id, tab)?;
        Ok(ResultWriter {
            config,
            idx,
            first_id: id,
            next_key: 0,
        })
    }

    pub(crate) fn push_row(&mut self, db: &mut Database, values: &[Value]) -> Result<()> {
        let (rows, possible_rows) = {
            let tab = db.get(self.idx);
            (tab.rows, tab.possible_rows)
        };
        if possible_rows.saturating_sub(rows) <= self.config.result_margin {
            self.spill(db)?;
        }

        let row = db.get(self.idx).rows;
        db.get_mut(self.idx)
            .key_bytes_mut(row)
            .copy_from_slice(&(self.next_key as i32).to_le_bytes());
        for (i, value) in values.iter().enumerate() {
            let vtype = db.get(self.idx).columns[i].vtype;
            let cast = value.cast(vtype);
            write_value(db.get_mut(self.idx).column_bytes_mut(i, row), cast);
        }
        db.get_mut(self.idx).rows += 1;
        self.next_key += 1;
        Ok(())
    }

    fn spill(&mut self, db: &mut Database) -> Result<()> {
        let new_id = db.next_tablet_id();
        let mut tail = db.get_mut(self.idx).spawn_tail(&self.config, new_id, self.config.initial_keys);
        // Without this the tail starts at `initial_keys` possible rows, which
        // (for the default config) is already below `result_margin` — every
        // row pushed after the first one would immediately spill again.
        tail.add_max_rows(&self.config)?;
        db.unpin(self.idx);
        self.idx = db.alloc(new_id, tail)?;
        Ok(())
    }

    /// Unpins the current tail and returns the id of the first result
    /// tablet, for handing off to a [`crate::reader::Reader`].
    pub(crate) fn finish(self, db: &mut Database) -> u32 {
        db.unpin(self.idx);
        self.first_id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::{self, Schema};
    use crate::compiler::ast::{Expr, ResultColumn, Select};
    use crate::config::Config;
    use crate::table;
    use crate::vm::opcode::CmpOp;

    fn temp_db(name: &str) -> Database {
        let mut path = std::env::temp_dir();
        path.push(format!("virginian-interp-test-{name}-{}", std::process::id()));
        std::fs::remove_file(&path).ok();
        Database::create(&path, Config::small()).unwrap()
    }

    fn build_test_table(db: &mut Database, rows: i64) -> u32 {
        let table_id = db.create_table("test", VirgType::Int).unwrap();
        table::add_column(db, table_id, "col0", VirgType::Int).unwrap();
        for i in 0..rows {
            table::insert(db, table_id, Value::Int(i as i32), &[Value::Int((5 * i) as i32)]).unwrap();
        }
        table_id
    }

    fn schema_for(db: &mut Database, table_id: u32) -> Schema {
        Schema {
            table: "test".to_string(),
            table_id,
            key_type: VirgType::Int,
            columns: vec![("col0".to_string(), VirgType::Int)],
        }
    }

    #[test]
    fn filters_and_projects_matching_rows() {
        let mut db = temp_db("filter-project");
        let table_id = build_test_table(&mut db, 100);
        let schema = schema_for(&mut db, table_id);

        let select = Select {
            table: "test".to_string(),
            columns: vec![ResultColumn {
                name: "col0".to_string(),
                expr: Expr::Column("col0".to_string()),
            }],
            filter: Some(Expr::Compare(
                Box::new(Expr::Column("col0".to_string())),
                CmpOp::Le,
                Box::new(Expr::IntLit(25)),
            )),
        };
        let program = compiler::compile(&schema, &select, 32, 16).unwrap();
        let result_id = execute(&mut db, &program).unwrap();

        let idx = db.load(result_id).unwrap();
        let mut count = 0u32;
        let mut last = db.get(idx).rows;
        let mut cursor = idx;
        loop {
            count += db.get(cursor).rows;
            match db.load_next(cursor).unwrap() {
                Some(next) => cursor = next,
                None => {
                    last = db.get(cursor).rows;
                    db.unpin(cursor);
                    break;
                }
            }
        }
        let _ = last;
        // col0 = 5*i <= 25 for i in 0..=5, six rows: 0,5,10,15,20,25
        assert_eq!(count, 6);
    }

    #[test]
    fn blocks_spanning_a_tablet_boundary_still_see_every_row() {
        let mut db = temp_db("block-boundary");
        let table_id = build_test_table(&mut db, 5000);
        let schema = schema_for(&mut db, table_id);

        let select = Select {
            table: "test".to_string(),
            columns: vec![ResultColumn {
                name: "col0".to_string(),
                expr: Expr::Column("col0".to_string()),
            }],
            filter: None,
        };
        let program = compiler::compile(&schema, &select, 32, 16).unwrap();
        let result_id = execute(&mut db, &program).unwrap();

        let mut cursor = db.load(result_id).unwrap();
        let mut total = 0u32;
        loop {
            total += db.get(cursor).rows;
            match db.load_next(cursor).unwrap() {
                Some(next) => cursor = next,
                None => {
                    db.unpin(cursor);
                    break;
                }
            }
        }
        assert_eq!(total, 5000);
    }
}
