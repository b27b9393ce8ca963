//! The cursor a caller walks to pull rows out of a compiled query's result
//! chain.
//!
//! A `Reader` owns a whole tablet chain (distinct from any table chain:
//! result tablets are never registered in the catalog, so nothing but this
//! struct can reach them). It must be released explicitly via
//! [`Reader::release`], since dropping it silently would leak those tablets'
//! meta-index entries for the life of the database file.

use crate::database::Database;
use crate::error::Result;
use crate::types::{read_value, Value};

/// Walks the rows of one compiled query's result-tablet chain in order.
pub struct Reader {
    current: usize,
    row: u32,
    released: bool,
}

impl Reader {
    pub(crate) fn new(db: &mut Database, first_tablet: u32) -> Result<Reader> {
        let idx = db.load(first_tablet)?;
        Ok(Reader {
            current: idx,
            row: 0,
            released: false,
        })
    }

    /// Returns the next row as one [`Value`] per output column, or `None`
    /// once the chain is exhausted.
    pub fn next_row(&mut self, db: &mut Database) -> Result<Option<Vec<Value>>> {
        loop {
            let tab = db.get(self.current);
            if self.row < tab.rows {
                let row = self.row;
                let values = (0..tab.columns.len())
                    .map(|col| read_value(tab.column_bytes(col, row), tab.columns[col].vtype))
                    .collect();
                self.row += 1;
                return Ok(Some(values));
            }
            if tab.last_tablet {
                return Ok(None);
            }
            let next_id = tab.next;
            let next_idx = db.load(next_id)?;
            db.unpin(self.current);
            self.current = next_idx;
            self.row = 0;
        }
    }

    /// Number of rows not yet returned by `next_row`, without disturbing the
    /// cursor. Walks the rest of the chain pinning and unpinning each
    /// tablet in turn (never touching `self.current`'s own pin), so this is
    /// not a cheap call on a long result.
    pub fn count_remaining(&self, db: &mut Database) -> Result<u64> {
        let tab = db.get(self.current);
        let mut total = (tab.rows - self.row) as u64;
        let mut next = tab.next;
        let mut last = tab.last_tablet;
        while !last {
            let idx = db.load(next)?;
            let tab = db.get(idx);
            total += tab.rows as u64;
            next = tab.next;
            last = tab.last_tablet;
            db.unpin(idx);
        }
        Ok(total)
    }

    /// Releases every tablet in the result chain back to the database,
    /// freeing their meta-index entries. Must be called before the `Reader`
    /// is dropped.
    pub fn release(mut self, db: &mut Database) -> Result<()> {
        let mut ids = Vec::new();
        let tab = db.get(self.current);
        ids.push(tab.id);
        let mut next = tab.next;
        let mut last = tab.last_tablet;
        db.unpin(self.current);

        while !last {
            let idx = db.load(next)?;
            let tab = db.get(idx);
            ids.push(tab.id);
            next = tab.next;
            last = tab.last_tablet;
            db.unpin(idx);
        }

        for id in ids {
            db.remove(id)?;
        }
        self.released = true;
        Ok(())
    }
}

impl Drop for Reader {
    fn drop(&mut self) {
        if !self.released {
            log::warn!("Reader dropped without release(): its result tablets were leaked");
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
    use crate::types::VirgType;
    use crate::vm::interpreter;

    fn temp_db(name: &str) -> Database {
        let mut path = std::env::temp_dir();
        path.push(format!("virginian-reader-test-{name}-{}", std::process::id()));
        std::fs::remove_file(&path).ok();
        Database::create(&path, Config::small()).unwrap()
    }

    #[test]
    fn next_row_walks_every_row_then_returns_none() {
        let mut db = temp_db("walk");
        let table_id = db.create_table("test", VirgType::Int).unwrap();
        table::add_column(&mut db, table_id, "col0", VirgType::Int).unwrap();
        for i in 0..10 {
            table::insert(&mut db, table_id, Value::Int(i), &[Value::Int(i * 2)]).unwrap();
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
            filter: None,
        };
        let program = compiler::compile(&schema, &select, 32, 16).unwrap();
        let result_id = interpreter::execute(&mut db, &program).unwrap();

        let mut reader = Reader::new(&mut db, result_id).unwrap();
        let mut seen = Vec::new();
        while let Some(row) = reader.next_row(&mut db).unwrap() {
            seen.push(row[0]);
        }
        assert_eq!(seen.len(), 10);
        assert_eq!(seen[3], Value::Int(6));

        reader.release(&mut db).unwrap();
    }

    #[test]
    fn count_remaining_tracks_rows_consumed_so_far() {
        let mut db = temp_db("count-remaining");
        let table_id = db.create_table("test", VirgType::Int).unwrap();
        table::add_column(&mut db, table_id, "col0", VirgType::Int).unwrap();
        for i in 0..20 {
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
            filter: None,
        };
        let program = compiler::compile(&schema, &select, 32, 16).unwrap();
        let result_id = interpreter::execute(&mut db, &program).unwrap();

        let mut reader = Reader::new(&mut db, result_id).unwrap();
        assert_eq!(reader.count_remaining(&mut db).unwrap(), 20);
        for _ in 0..5 {
            reader.next_row(&mut db).unwrap();
        }
        assert_eq!(reader.count_remaining(&mut db).unwrap(), 15);

        reader.release(&mut db).unwrap();
    }
}
