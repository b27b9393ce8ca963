//! The public facade: opens a database file, manages tables, and compiles
//! and runs `SELECT`s against them. Everything below this module is an
//! implementation detail a caller outside the crate shouldn't need to
//! reach directly.

use crate::compiler::ast::Select;
use crate::compiler::{self, Schema};
use crate::config::Config;
use crate::database::Database;
use crate::error::Result;
use crate::reader::Reader;
use crate::table;
use crate::types::{Value, VirgType};
use crate::vm::interpreter;
use std::path::Path;

/// One open database, ready to create tables, insert rows, and run
/// queries against them.
pub struct Engine {
    db: Database,
}

impl Engine {
    /// Creates a brand new database file at `path`, overwriting anything
    /// already there.
    pub fn create<P: AsRef<Path>>(path: P, config: Config) -> Result<Engine> {
        Ok(Engine {
            db: Database::create(path, config)?,
        })
    }

    /// Opens an existing database file. `config` must describe the same
    /// tablet geometry it was created with.
    pub fn open<P: AsRef<Path>>(path: P, config: Config) -> Result<Engine> {
        Ok(Engine {
            db: Database::open(path, config)?,
        })
    }

    /// Flushes every resident tablet back to disk and closes the file.
    pub fn close(self) -> Result<()> {
        self.db.close()
    }

    pub fn create_table(&mut self, name: &str, key_type: VirgType) -> Result<u32> {
        self.db.create_table(name, key_type)
    }

    pub fn find_table(&self, name: &str) -> Option<u32> {
        self.db.find_table(name)
    }

    /// Number of slot-cache entries currently occupied (pinned or not).
    /// Exposed mainly so callers (and this crate's own integration tests)
    /// can check the cache returns to its baseline occupancy after a query
    /// completes and its reader is released.
    pub fn taken(&self) -> usize {
        self.db.taken()
    }

    pub fn add_column(&mut self, table_id: u32, name: &str, vtype: VirgType) -> Result<()> {
        table::add_column(&mut self.db, table_id, name, vtype)
    }

    pub fn insert(&mut self, table_id: u32, key: Value, values: &[Value]) -> Result<()> {
        table::insert(&mut self.db, table_id, key, values)
    }

    pub fn num_rows(&mut self, table_id: u32) -> Result<u64> {
        table::num_rows(&mut self.db, table_id)
    }

    /// Primes the cache with a table's leading tablets before a scan. Not
    /// required for correctness; see `table::load_into_memory`.
    pub fn load_into_memory(&mut self, table_id: u32) -> Result<()> {
        table::load_into_memory(&mut self.db, table_id)
    }

    /// Reads a table's current fixed-column layout into the shape the
    /// compiler needs. Built fresh per call since a column can be added to
    /// a table between queries.
    fn schema_for(&mut self, table_id: u32) -> Result<Schema> {
        let entry = self.db.table_entry(table_id)?.clone();
        let idx = self.db.load(entry.first_tablet)?;
        let columns = self
            .db
            .get(idx)
            .columns
            .iter()
            .map(|c| (c.name.clone(), c.vtype))
            .collect();
        self.db.unpin(idx);
        Ok(Schema {
            table: entry.name,
            table_id,
            key_type: entry.key_type,
            columns,
        })
    }

    /// Compiles and runs `select` single-threaded, returning a [`Reader`]
    /// over its result rows. The caller must call [`Reader::release`] on
    /// the result when it's done with it.
    pub fn execute(&mut self, select: &Select) -> Result<Reader> {
        let table_id = self.db.find_table(&select.table).ok_or_else(|| {
            crate::error::EngineError::invalid_argument(format!("no such table {:?}", select.table))
        })?;
        let schema = self.schema_for(table_id)?;
        let config = *self.db.config();
        let program = compiler::compile(&schema, select, config.max_ops, config.regs)?;
        let result_id = interpreter::execute(&mut self.db, &program)?;
        Reader::new(&mut self.db, result_id)
    }

    /// Compiles and runs `select` across `workers` threads, each claiming
    /// whole tablets from the table's chain. See [`crate::concurrent`] for
    /// the locking strategy; single-threaded `execute` remains the
    /// reference implementation this is verified against.
    pub fn execute_concurrent(&mut self, select: &Select, workers: usize) -> Result<Reader> {
        let table_id = self.db.find_table(&select.table).ok_or_else(|| {
            crate::error::EngineError::invalid_argument(format!("no such table {:?}", select.table))
        })?;
        let schema = self.schema_for(table_id)?;
        let config = *self.db.config();
        let program = compiler::compile(&schema, select, config.max_ops, config.regs)?;
        let result_id = crate::concurrent::scan(&mut self.db, &program, workers)?;
        Reader::new(&mut self.db, result_id)
    }

    /// Pulls `reader`'s next row. Thin pass-through to
    /// [`Reader::next_row`], supplying the `Database` a caller outside this
    /// crate has no way to reach directly.
    pub fn next_row(&mut self, reader: &mut Reader) -> Result<Option<Vec<Value>>> {
        reader.next_row(&mut self.db)
    }

    /// How many rows `reader` has left, without consuming them. Thin
    /// pass-through to [`Reader::count_remaining`].
    pub fn count_remaining(&mut self, reader: &Reader) -> Result<u64> {
        reader.count_remaining(&mut self.db)
    }

    /// Releases `reader`'s result tablets. Thin pass-through to
    /// [`Reader::release`]; must be called once a caller is done with a
    /// query's rows.
    pub fn release(&mut self, reader: Reader) -> Result<()> {
        reader.release(&mut self.db)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compiler::ast::{Expr, ResultColumn};
    use crate::vm::opcode::CmpOp;

    fn temp_path(name: &str) -> std::path::PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("virginian-engine-test-{name}-{}", std::process::id()));
        std::fs::remove_file(&p).ok();
        p
    }

    #[test]
    fn create_insert_and_query_round_trip() {
        let path = temp_path("round-trip");
        let mut engine = Engine::create(&path, Config::small()).unwrap();
        let table_id = engine.create_table("widgets", VirgType::Int).unwrap();
        engine.add_column(table_id, "weight", VirgType::Int).unwrap();

        for i in 0..50 {
            engine
                .insert(table_id, Value::Int(i), &[Value::Int(i)])
                .unwrap();
        }
        assert_eq!(engine.num_rows(table_id).unwrap(), 50);

        let select = Select {
            table: "widgets".to_string(),
            columns: vec![ResultColumn {
                name: "weight".to_string(),
                expr: Expr::Column("weight".to_string()),
            }],
            filter: Some(Expr::Compare(
                Box::new(Expr::Column("weight".to_string())),
                CmpOp::Ge,
                Box::new(Expr::IntLit(40)),
            )),
        };
        let mut reader = engine.execute(&select).unwrap();
        let mut count = 0;
        while engine.next_row(&mut reader).unwrap().is_some() {
            count += 1;
        }
        engine.release(reader).unwrap();
        assert_eq!(count, 10); // weight 40..=49

        engine.close().unwrap();
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn querying_an_unknown_table_is_an_error() {
        let path = temp_path("unknown-table");
        let mut engine = Engine::create(&path, Config::small()).unwrap();
        let select = Select {
            table: "nope".to_string(),
            columns: vec![],
            filter: None,
        };
        assert!(engine.execute(&select).is_err());
        engine.close().unwrap();
        std::fs::remove_file(&path).ok();
    }
}
