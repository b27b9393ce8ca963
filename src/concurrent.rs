//! An additive, multi-threaded scan mode over the same compiled
//! [`crate::compiler::Program`] and the same [`crate::database::Database`]
//! the single-threaded interpreter uses.
//!
//! This is deliberately not the core path: it exists for the caller who
//! wants to burn more cores on one big scan, not as the default execution
//! strategy. Concurrency is coarse-grained on purpose — a worker claims one
//! whole tablet at a time from a shared cursor, computes that tablet's
//! matching rows entirely under its own stack, and only then takes the
//! result-writer lock to append them. `Database` isn't `Sync`, so every
//! tablet load/unpin also goes through a single shared lock; the tradeoff
//! only pays off when `run_tablet`'s per-row-block work dominates the time
//! spent holding that lock, which is the case for anything but a trivial
//! projection over tiny tablets.

use std::sync::Mutex;

use crate::compiler::Program;
use crate::database::Database;
use crate::error::Result;
use crate::vm::interpreter::{self, ResultWriter};

/// Runs `program` over its table's tablet chain using `workers` threads,
/// returning the id of the first result tablet. Produces the same rows as
/// [`interpreter::execute`], modulo order: each worker's rows land in the
/// result chain in whatever order it finishes its tablet, not necessarily
/// the table's original tablet order.
pub fn scan(db: &mut Database, program: &Program, workers: usize) -> Result<u32> {
    let block = db.config().block;
    let first = db.table_entry(program.table_id)?.first_tablet;

    let writer = ResultWriter::new(db, &program.output)?;
    let res_lock = Mutex::new(writer);
    let cursor = Mutex::new(Some(first));
    let tab_lock = Mutex::new(db);

    std::thread::scope(|scope| {
        let mut handles = Vec::with_capacity(workers);
        for _ in 0..workers {
            let cursor = &cursor;
            let tab_lock = &tab_lock;
            let res_lock = &res_lock;
            handles.push(scope.spawn(move || worker_loop(cursor, tab_lock, res_lock, program, block)));
        }
        for handle in handles {
            handle.join().expect("scan worker panicked")?;
        }
        Result::Ok(())
    })?;

    let db = tab_lock.into_inner().expect("tab_lock poisoned");
    let writer = res_lock.into_inner().expect("res_lock poisoned");
    Ok(writer.finish(db))
}

fn worker_loop(
    cursor: &Mutex<Option<u32>>,
    tab_lock: &Mutex<&mut Database>,
    res_lock: &Mutex<ResultWriter>,
    program: &Program,
    block: usize,
) -> Result<()> {
    loop {
        let claimed = {
            let mut guard = tab_lock.lock().expect("tab_lock poisoned");
            let mut next = cursor.lock().expect("cursor poisoned");
            match *next {
                None => None,
                Some(id) => {
                    let idx = guard.load(id)?;
                    let (last, following) = {
                        let tab = guard.get(idx);
                        (tab.last_tablet, tab.next)
                    };
                    *next = if last { None } else { Some(following) };
                    Some(idx)
                }
            }
        };

        let idx = match claimed {
            Some(idx) => idx,
            None => return Ok(()),
        };

        let rows = {
            let guard = tab_lock.lock().expect("tab_lock poisoned");
            interpreter::run_tablet(&guard, idx, program, block)
        };

        {
            let mut guard = tab_lock.lock().expect("tab_lock poisoned");
            guard.unpin(idx);
        }

        if !rows.is_empty() {
            let mut writer = res_lock.lock().expect("res_lock poisoned");
            for row in &rows {
                let mut guard = tab_lock.lock().expect("tab_lock poisoned");
                writer.push_row(&mut guard, row)?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ast::{Expr, ResultColumn, Select};
    use crate::compiler::{self, Schema};
    use crate::config::Config;
    use crate::table;
    use crate::types::{Value, VirgType};

    fn temp_db(name: &str) -> Database {
        let mut path = std::env::temp_dir();
        path.push(format!("virginian-concurrent-test-{name}-{}", std::process::id()));
        std::fs::remove_file(&path).ok();
        Database::create(&path, Config::small()).unwrap()
    }

    #[test]
    fn concurrent_scan_matches_single_threaded_row_count() {
        let mut db = temp_db("row-count");
        let table_id = db.create_table("test", VirgType::Int).unwrap();
        table::add_column(&mut db, table_id, "col0", VirgType::Int).unwrap();
        for i in 0..3000 {
            table::insert(&mut db, table_id, Value::Int(i), &[Value::Int(i)]).unwrap();
        }

        let schema = Schema {
            table: "test".to_string(),
            table_id,
            key_type: VirgType::Int,
            columns: vec![("col0".to_string(), VirgType::Int)],
        };
        let select = Select {
            table: "test".to_string(),
            columns: vec![ResultColumn {
                name: "col0".to_string(),
                expr: Expr::Column("col0".to_string()),
            }],
            filter: Some(Expr::Compare(
                Box::new(Expr::Column("col0".to_string())),
                crate::vm::opcode::CmpOp::Lt,
                Box::new(Expr::IntLit(1500)),
            )),
        };
        let program = compiler::compile(&schema, &select, 32, 16).unwrap();
        let result_id = scan(&mut db, &program, 4).unwrap();

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
        assert_eq!(total, 1500);
    }
}
