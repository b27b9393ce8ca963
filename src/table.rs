//! Operations over a named table's tablet chain: column management and row
//! insertion on top of the tablet/cache/database layers. Table *creation*
//! and catalog lookup live on [`crate::database::Database`] itself, since
//! the catalog is part of the persisted database header; this module is
//! the operations layer above it (`virg_table_*` in the original).

use crate::database::Database;
use crate::error::{EngineError, Result};
use crate::types::{write_value, Value, VirgType};

/// Adds a fixed-size column to every tablet in the table's chain. Not
/// thread-safe with a concurrent query over the same table. Mirrors
/// `virg_table_addcolumn` walking the chain via `tablet/addcolumn.c`.
pub fn add_column(db: &mut Database, table_id: u32, name: &str, vtype: VirgType) -> Result<()> {
    let config = *db.config();
    let first = db.table_entry(table_id)?.first_tablet;
    let mut idx = db.load(first)?;
    loop {
        db.get_mut(idx).add_column(&config, name, vtype)?;
        match db.load_next(idx)? {
            Some(next_idx) => idx = next_idx,
            None => {
                db.unpin(idx);
                break;
            }
        }
    }
    Ok(())
}

/// Number of rows across every tablet in the table's chain. Mirrors
/// `virg_table_numrows`.
pub fn num_rows(db: &mut Database, table_id: u32) -> Result<u64> {
    let first = db.table_entry(table_id)?.first_tablet;
    let mut total = 0u64;
    let mut idx = db.load(first)?;
    loop {
        total += db.get(idx).rows as u64;
        match db.load_next(idx)? {
            Some(next_idx) => idx = next_idx,
            None => {
                db.unpin(idx);
                break;
            }
        }
    }
    Ok(total)
}

/// Finds the column index of `name` within the table's fixed columns,
/// using whichever tablet currently holds the schema (columns are
/// identical across the whole chain). Mirrors `virg_table_getid` applied
/// to columns.
pub fn column_index(db: &mut Database, table_id: u32, name: &str) -> Result<usize> {
    let first = db.table_entry(table_id)?.first_tablet;
    let idx = db.load(first)?;
    let result = db
        .get(idx)
        .columns
        .iter()
        .position(|c| c.name == name)
        .ok_or_else(|| EngineError::invalid_argument(format!("no such column {name:?}")));
    db.unpin(idx);
    result
}

pub fn column_type(db: &mut Database, table_id: u32, col: usize) -> Result<VirgType> {
    let first = db.table_entry(table_id)?.first_tablet;
    let idx = db.load(first)?;
    let vtype = db
        .get(idx)
        .columns
        .get(col)
        .map(|c| c.vtype)
        .ok_or_else(|| EngineError::invalid_argument(format!("no column at index {col}")));
    db.unpin(idx);
    vtype
}

pub fn key_type(db: &mut Database, table_id: u32) -> Result<VirgType> {
    Ok(db.table_entry(table_id)?.key_type)
}

/// Appends one row with the given key and column values, growing the
/// table's tail tablet in place (and chaining a new one, if that's not
/// enough room) as needed. Mirrors `virg_table_insert`.
pub fn insert(db: &mut Database, table_id: u32, key: Value, values: &[Value]) -> Result<()> {
    let config = *db.config();
    let entry = db.table_entry(table_id)?.clone();
    let mut idx = db.load(entry.write_cursor)?;

    {
        let tab = db.get(idx);
        if tab.columns.len() != values.len() {
            db.unpin(idx);
            return Err(EngineError::invalid_argument(format!(
                "expected {} column values, got {}",
                tab.columns.len(),
                values.len()
            )));
        }
        if tab.key_type != key.vtype() {
            db.unpin(idx);
            return Err(EngineError::invalid_argument("key type mismatch on insert"));
        }
    }

    let needs_room = db.get(idx).rows >= db.get(idx).possible_rows;
    let mut spilled_tail: Option<(u32, u32)> = None;

    if needs_room {
        let byte_room = {
            let tab = db.get(idx);
            config.tablet_size.saturating_sub(tab.size) >= tab.row_stride
        };
        if byte_room {
            let residual = db.get_mut(idx).add_rows_in_place(&config, config.key_increment);
            if residual > 0 {
                let (new_idx, new_id) = spill_to_tail(db, idx, residual)?;
                idx = new_idx;
                spilled_tail = Some((new_id, entry.tablet_count + 1));
            }
        } else {
            let (new_idx, new_id) = spill_to_tail(db, idx, config.key_increment)?;
            idx = new_idx;
            spilled_tail = Some((new_id, entry.tablet_count + 1));
        }
    }

    let row = db.get(idx).rows;
    db.get_mut(idx).key_bytes_mut(row).copy_from_slice(&encode(key));
    for (i, value) in values.iter().enumerate() {
        let col_type = db.get(idx).columns[i].vtype;
        let cast = value.cast(col_type);
        write_value(db.get_mut(idx).column_bytes_mut(i, row), cast);
    }
    db.get_mut(idx).rows += 1;
    db.unpin(idx);

    if let Some((new_last, new_count)) = spilled_tail {
        db.set_table_tail(table_id, new_last, new_last, new_count)?;
        log::warn!("table {table_id} spilled into new tail tablet {new_last}");
    }
    Ok(())
}

fn spill_to_tail(db: &mut Database, idx: usize, requested: u32) -> Result<(usize, u32)> {
    let config = *db.config();
    let new_id = db.next_tablet_id();
    let possible_rows = (requested.saturating_add(15) & !0xF).max(config.initial_keys);
    let tail = db.get_mut(idx).spawn_tail(&config, new_id, possible_rows);
    db.unpin(idx);
    let tail_idx = db.alloc(new_id, tail)?;
    Ok((tail_idx, new_id))
}

fn encode(value: Value) -> [u8; 8] {
    let mut buf = [0u8; 8];
    write_value(&mut buf[..value.vtype().size()], value);
    buf
}

/// Prefetches up to half of `n_slots` worth of tablets from the head of
/// the chain, priming the cache before a scan. Not required for
/// correctness — a scan that misses the cache just pays for the load
/// itself — but it gives a full-table scan a warm cache from its first
/// block instead of ramping up one miss at a time. Mirrors
/// `virg_table_loadmem`.
pub fn load_into_memory(db: &mut Database, table_id: u32) -> Result<()> {
    let budget = db.config().n_slots / 2;
    if budget == 0 {
        return Ok(());
    }
    let first = db.table_entry(table_id)?.first_tablet;
    let mut idx = db.load(first)?;
    for _ in 1..budget {
        match db.load_next(idx)? {
            Some(next_idx) => idx = next_idx,
            None => break,
        }
    }
    db.unpin(idx);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn temp_db(name: &str) -> Database {
        let mut path = std::env::temp_dir();
        path.push(format!("virginian-table-test-{name}-{}", std::process::id()));
        std::fs::remove_file(&path).ok();
        Database::create(&path, Config::small()).unwrap()
    }

    #[test]
    fn create_add_column_and_insert_round_trip() {
        let mut db = temp_db("create-insert");
        let table = db.create_table("widgets", VirgType::Int).unwrap();
        add_column(&mut db, table, "weight", VirgType::Double).unwrap();

        insert(&mut db, table, Value::Int(1), &[Value::Double(2.5)]).unwrap();
        insert(&mut db, table, Value::Int(2), &[Value::Double(4.0)]).unwrap();

        assert_eq!(num_rows(&mut db, table).unwrap(), 2);
        let col = column_index(&mut db, table, "weight").unwrap();
        assert_eq!(col, 0);
    }

    #[test]
    fn insert_spills_into_a_tail_tablet_when_full() {
        let mut db = temp_db("spill");
        let table = db.create_table("widgets", VirgType::Int).unwrap();
        add_column(&mut db, table, "weight", VirgType::Double).unwrap();

        for i in 0..2000 {
            insert(&mut db, table, Value::Int(i), &[Value::Double(i as f64)]).unwrap();
        }
        assert_eq!(num_rows(&mut db, table).unwrap(), 2000);
    }

    #[test]
    fn duplicate_table_name_is_rejected() {
        let mut db = temp_db("dup-name");
        db.create_table("widgets", VirgType::Int).unwrap();
        assert!(db.create_table("widgets", VirgType::Int).is_err());
    }
}
