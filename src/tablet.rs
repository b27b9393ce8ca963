//! In-memory representation of one tablet block: header layout, column
//! offset math, and the operations that grow a tablet in place.
//!
//! A tablet is conceptually one contiguous, 64-byte aligned buffer of
//! `config.tablet_size` bytes holding a header followed by the key strip,
//! the (unused) key-pointer strip, the fixed-column strips in column order,
//! and a variable-size region the core never populates. We keep the header
//! as an ordinary Rust struct rather than reinterpreting raw bytes in place
//! — `fixed_name`/`fixed_type`/… become a `Vec<ColumnMeta>` — and reserve a
//! fixed logical `HEADER_SIZE` so every offset computed against the header
//! (`key_block`, `fixed_block`, …) still lines up exactly the way the
//! original layout describes it. `data` holds every byte from `HEADER_SIZE`
//! onward.

use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::types::VirgType;

/// Logical size reserved for the header region. Offsets like `key_block`
/// are defined relative to the start of the tablet, exactly as in the
/// original layout; this constant plays the role of `sizeof(virg_tablet_meta)`.
pub const HEADER_SIZE: u64 = 4096;

/// Per-column metadata, the port's replacement for the four parallel
/// `fixed_name`/`fixed_type`/`fixed_stride`/`fixed_offset` arrays.
#[derive(Debug, Clone)]
pub struct ColumnMeta {
    pub name: String,
    pub vtype: VirgType,
    pub stride: u64,
    pub offset: u64,
}

/// Weak back-pointer into a database's meta index, identifying the disk
/// slot this tablet is (or will be) stored in. Never an owning reference;
/// rewritten wholesale whenever the meta index is reallocated.
pub type MetaRef = usize;

#[derive(Debug, Clone)]
pub struct Tablet {
    pub rows: u32,
    pub possible_rows: u32,
    pub key_type: VirgType,
    pub key_stride: u64,
    pub pointer_stride: u64,
    pub row_stride: u64,
    pub id: u32,
    pub next: u32,
    pub last_tablet: bool,
    pub in_table: bool,
    pub table_id: u32,
    pub key_block: u64,
    pub key_pointers_block: u64,
    pub fixed_block: u64,
    pub variable_block: u64,
    pub size: u64,
    pub columns: Vec<ColumnMeta>,
    pub info: Option<MetaRef>,
    data: Vec<u8>,
}

impl Tablet {
    fn capacity(config: &Config) -> usize {
        (config.tablet_size - HEADER_SIZE) as usize
    }

    fn idx(&self, abs_offset: u64) -> usize {
        debug_assert!(abs_offset >= HEADER_SIZE, "offset {abs_offset} precedes header");
        (abs_offset - HEADER_SIZE) as usize
    }

    /// Create a brand new, empty tablet. Mirrors `virg_tablet_create`: a
    /// key column only, `possible_rows = INITIAL_KEYS`, region offsets set
    /// per the layout invariants, and a reserved but unused variable region.
    pub fn create(config: &Config, id: u32, key_type: VirgType, table_id: Option<u32>) -> Tablet {
        let key_stride = key_type.size() as u64;
        let pointer_stride = std::mem::size_of::<u64>() as u64;
        let possible_rows = config.initial_keys;

        let key_block = HEADER_SIZE;
        let key_pointers_block = key_block + key_stride * possible_rows as u64;
        let fixed_block = key_pointers_block + pointer_stride * possible_rows as u64;
        let variable_block = fixed_block;
        let size = variable_block + config.initial_variable;

        Tablet {
            rows: 0,
            possible_rows,
            key_type,
            key_stride,
            pointer_stride,
            row_stride: key_stride + pointer_stride,
            id,
            next: 0,
            last_tablet: true,
            in_table: table_id.is_some(),
            table_id: table_id.unwrap_or(0),
            key_block,
            key_pointers_block,
            fixed_block,
            variable_block,
            size,
            columns: Vec::new(),
            info: None,
            data: vec![0u8; Self::capacity(config)],
        }
    }

    /// Appends a new fixed-size column. Fails if the column table is full,
    /// the name is too long, or there isn't enough room to grow.
    pub fn add_column(&mut self, config: &Config, name: &str, vtype: VirgType) -> Result<()> {
        if self.columns.len() >= config.max_columns {
            return Err(EngineError::invalid_argument(format!(
                "tablet {} already has the maximum of {} columns",
                self.id, config.max_columns
            )));
        }
        if name.len() >= config.max_column_name {
            return Err(EngineError::invalid_argument(format!(
                "column name {name:?} is too long (max {})",
                config.max_column_name - 1
            )));
        }

        let stride = vtype.size() as u64;
        let offset = match self.columns.last() {
            Some(prev) => prev.offset + prev.stride * self.possible_rows as u64,
            None => 0,
        };

        self.columns.push(ColumnMeta {
            name: name.to_string(),
            vtype,
            stride,
            offset,
        });
        self.row_stride += stride;

        self.grow_fixed(config, stride * self.possible_rows as u64)
    }

    /// Pushes the variable region back by `bytes`, relocating its (empty,
    /// in this core) contents. Fails if the tablet would exceed `tablet_size`.
    pub fn grow_fixed(&mut self, config: &Config, bytes: u64) -> Result<()> {
        if self.size + bytes > config.tablet_size {
            return Err(EngineError::out_of_space(format!(
                "tablet {} cannot grow by {bytes} bytes without exceeding tablet_size",
                self.id
            )));
        }

        if self.size == self.variable_block {
            // nothing in the variable region yet, just slide the offset
            self.variable_block += bytes;
            self.size += bytes;
            return Ok(());
        }

        let new_variable = self.variable_block + bytes;
        let variable_len = (self.size - self.variable_block) as usize;
        let src = self.idx(self.variable_block);
        let dst = self.idx(new_variable);
        self.data.copy_within(src..src + variable_len, dst);

        self.variable_block = new_variable;
        self.size = new_variable + variable_len as u64;
        Ok(())
    }

    /// How many additional rows of the current `row_stride` fit in this
    /// tablet without exceeding `tablet_size`, rounded down to a multiple
    /// of 16.
    fn max_new_rows(&self, config: &Config) -> u32 {
        let room = config.tablet_size.saturating_sub(self.size);
        let max_rows = (room / self.row_stride) as u32;
        max_rows & !0xF
    }

    /// Grows `possible_rows` in place by as much of `requested` (rounded up
    /// to a multiple of 16) as fits, moving every strip forward so no live
    /// row data is overwritten. Returns the number of rows the caller still
    /// needs to satisfy elsewhere (via chained tail tablets) — zero if the
    /// whole request was absorbed in place.
    pub fn add_rows_in_place(&mut self, config: &Config, requested: u32) -> u32 {
        let rounded = requested.saturating_add(15) & !0xF;
        let max_new_rows = self.max_new_rows(config);
        let new_rows = rounded.min(max_new_rows);

        if new_rows != 0 {
            self.possible_rows += new_rows;

            let mut new_offsets = vec![0u64; self.columns.len()];
            for i in 1..self.columns.len() {
                new_offsets[i] =
                    new_offsets[i - 1] + self.columns[i - 1].stride * self.possible_rows as u64;
            }

            let new_fixed_block = self.fixed_block
                + new_rows as u64 * (self.key_stride + self.pointer_stride);

            // move highest-indexed column first so strips never overlap
            // their own not-yet-moved source bytes
            for i in (0..self.columns.len()).rev() {
                let stride = self.columns[i].stride;
                let len = (self.rows as u64 * stride) as usize;
                let src = self.idx(self.fixed_block + self.columns[i].offset);
                let dst = self.idx(new_fixed_block + new_offsets[i]);
                copy_forward_safe(&mut self.data, src, dst, len);
            }

            self.fixed_block = new_fixed_block;
            for (col, off) in self.columns.iter_mut().zip(new_offsets) {
                col.offset = off;
            }

            let new_key_pointers_block = self.key_block + self.key_stride * self.possible_rows as u64;
            let kp_len = (self.rows as u64 * self.pointer_stride) as usize;
            let src = self.idx(self.key_pointers_block);
            let dst = self.idx(new_key_pointers_block);
            copy_forward_safe(&mut self.data, src, dst, kp_len);
            self.key_pointers_block = new_key_pointers_block;
        }

        rounded - new_rows
    }

    /// Grows `possible_rows` to the maximum this tablet can hold given its
    /// current columns, reserving `config.maxed_variable` bytes for the
    /// variable region. Used when allocating a fresh result tablet so it
    /// can absorb as many rows as possible before having to chain another.
    pub fn add_max_rows(&mut self, config: &Config) -> Result<()> {
        let used_per_row = self.row_stride;
        let headroom = config
            .tablet_size
            .saturating_sub(self.fixed_block + config.maxed_variable);
        let max_possible = (headroom / used_per_row) as u32 & !0xF;
        if max_possible > self.possible_rows {
            let add = max_possible - self.possible_rows;
            self.add_rows_in_place(config, add);
        }
        self.variable_block = self.fixed_block
            + self
                .columns
                .last()
                .map(|c| c.offset + c.stride * self.possible_rows as u64)
                .unwrap_or(0);
        self.size = self.variable_block + config.maxed_variable;
        Ok(())
    }

    /// Builds a new tail tablet chained after `self`: copies meta
    /// information, then rewrites the row-dependent offsets for the given
    /// `possible_rows`. Marks `self` as no longer the last tablet.
    pub fn spawn_tail(&mut self, config: &Config, new_id: u32, possible_rows: u32) -> Tablet {
        let mut tail = self.clone();
        tail.id = new_id;
        tail.rows = 0;
        tail.next = 0;
        tail.last_tablet = true;
        tail.info = None;
        tail.possible_rows = possible_rows;
        tail.data = vec![0u8; Self::capacity(config)];

        tail.key_pointers_block = tail.key_block + tail.key_stride * possible_rows as u64;
        tail.fixed_block =
            tail.key_pointers_block + tail.pointer_stride * possible_rows as u64;

        let mut offset = 0u64;
        for col in tail.columns.iter_mut() {
            col.offset = offset;
            offset += col.stride * possible_rows as u64;
        }
        tail.variable_block = tail.fixed_block + offset;
        tail.size = tail.variable_block + config.initial_variable;

        self.last_tablet = false;
        self.next = new_id;

        tail
    }

    pub fn key_bytes(&self, row: u32) -> &[u8] {
        let off = self.idx(self.key_block) + (row as u64 * self.key_stride) as usize;
        &self.data[off..off + self.key_stride as usize]
    }

    pub fn key_bytes_mut(&mut self, row: u32) -> &mut [u8] {
        let stride = self.key_stride as usize;
        let off = self.idx(self.key_block) + row as usize * stride;
        &mut self.data[off..off + stride]
    }

    pub fn column_bytes(&self, col: usize, row: u32) -> &[u8] {
        let c = &self.columns[col];
        let off = self.idx(self.fixed_block + c.offset) + (row as u64 * c.stride) as usize;
        &self.data[off..off + c.stride as usize]
    }

    pub fn column_bytes_mut(&mut self, col: usize, row: u32) -> &mut [u8] {
        let c = &self.columns[col];
        let stride = c.stride as usize;
        let off = self.idx(self.fixed_block + c.offset) + row as usize * stride;
        &mut self.data[off..off + stride]
    }

    /// Contiguous byte slice covering `rows` rows of `col` starting at
    /// `start_row`, used by the interpreter's column-load and result-scatter
    /// fast paths (one `memcpy`-shaped slice instead of per-row copies).
    pub fn column_block(&self, col: usize, start_row: u32, rows: u32) -> &[u8] {
        let c = &self.columns[col];
        let off = self.idx(self.fixed_block + c.offset) + (start_row as u64 * c.stride) as usize;
        let len = rows as usize * c.stride as usize;
        &self.data[off..off + len]
    }

    pub fn column_block_mut(&mut self, col: usize, start_row: u32, rows: u32) -> &mut [u8] {
        let c = &self.columns[col];
        let stride = c.stride as usize;
        let off = self.idx(self.fixed_block + c.offset) + start_row as usize * stride;
        let len = rows as usize * stride;
        &mut self.data[off..off + len]
    }

    pub fn key_block_slice(&self, start_row: u32, rows: u32) -> &[u8] {
        let off = self.idx(self.key_block) + (start_row as u64 * self.key_stride) as usize;
        let len = rows as usize * self.key_stride as usize;
        &self.data[off..off + len]
    }

    /// Raw access to the full data region, used only by the database layer
    /// when writing/reading a tablet's bytes to/from disk.
    pub fn raw_data(&self) -> &[u8] {
        &self.data[..(self.size - HEADER_SIZE) as usize]
    }

    pub fn raw_data_mut(&mut self) -> &mut [u8] {
        let len = (self.size - HEADER_SIZE) as usize;
        &mut self.data[..len]
    }

    pub fn ensure_capacity(&mut self, config: &Config) {
        let needed = Self::capacity(config);
        if self.data.len() < needed {
            self.data.resize(needed, 0);
        }
    }

    /// Recomputes every layout invariant from §3, returning a `Corruption`
    /// error describing the first one that fails. Used in tests.
    pub fn check(&self, config: &Config) -> Result<()> {
        if self.key_block != HEADER_SIZE {
            return Err(EngineError::corruption(format!(
                "tablet {}: key_block {} != HEADER_SIZE {}",
                self.id, self.key_block, HEADER_SIZE
            )));
        }
        if self.key_block % 64 != 0 {
            return Err(EngineError::corruption(format!(
                "tablet {}: key_block {} is not 64-byte aligned",
                self.id, self.key_block
            )));
        }
        if self.size > config.tablet_size {
            return Err(EngineError::corruption(format!(
                "tablet {}: size {} exceeds tablet_size {}",
                self.id, self.size, config.tablet_size
            )));
        }
        if self.key_pointers_block != self.key_block + self.possible_rows as u64 * self.key_stride {
            return Err(EngineError::corruption(format!(
                "tablet {}: key_pointers_block mismatch",
                self.id
            )));
        }
        let expect_fixed = self.key_pointers_block + self.possible_rows as u64 * self.pointer_stride;
        if self.fixed_block != expect_fixed {
            return Err(EngineError::corruption(format!(
                "tablet {}: fixed_block mismatch",
                self.id
            )));
        }
        if let Some(first) = self.columns.first() {
            if first.offset != 0 {
                return Err(EngineError::corruption(format!(
                    "tablet {}: first column offset {} != 0",
                    self.id, first.offset
                )));
            }
            for i in 1..self.columns.len() {
                let expect = self.columns[i - 1].offset
                    + self.columns[i - 1].stride * self.possible_rows as u64;
                if self.columns[i].offset != expect {
                    return Err(EngineError::corruption(format!(
                        "tablet {}: column {i} offset mismatch",
                        self.id
                    )));
                }
            }
            let last = self.columns.last().unwrap();
            let expect_var = self.fixed_block + last.offset + last.stride * self.possible_rows as u64;
            if self.variable_block != expect_var {
                return Err(EngineError::corruption(format!(
                    "tablet {}: variable_block mismatch",
                    self.id
                )));
            }
        } else if self.fixed_block != self.variable_block {
            return Err(EngineError::corruption(format!(
                "tablet {}: variable_block should equal fixed_block with no columns",
                self.id
            )));
        }
        if self.possible_rows & 0xF != 0 {
            return Err(EngineError::corruption(format!(
                "tablet {}: possible_rows {} is not a multiple of 16",
                self.id, self.possible_rows
            )));
        }
        if self.rows > self.possible_rows {
            return Err(EngineError::corruption(format!(
                "tablet {}: rows {} exceeds possible_rows {}",
                self.id, self.rows, self.possible_rows
            )));
        }
        Ok(())
    }
}

/// `copy_within` already handles overlap correctly (it's memmove under the
/// hood), but we keep this named wrapper so the call sites read the same
/// way the original's comments describe the safety argument.
fn copy_forward_safe(data: &mut [u8], src: usize, dst: usize, len: usize) {
    if len == 0 {
        return;
    }
    data.copy_within(src..src + len, dst);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_sets_layout_invariants() {
        let config = Config::small();
        let tab = Tablet::create(&config, 1, VirgType::Int, Some(0));
        tab.check(&config).expect("fresh tablet should satisfy invariants");
        assert_eq!(tab.possible_rows, config.initial_keys);
        assert!(tab.last_tablet);
        assert_eq!(tab.next, 0);
    }

    #[test]
    fn add_column_preserves_invariants_and_offsets() {
        let config = Config::small();
        let mut tab = Tablet::create(&config, 1, VirgType::Int, Some(0));
        tab.add_column(&config, "col0", VirgType::Int).unwrap();
        tab.add_column(&config, "col1", VirgType::Double).unwrap();
        tab.check(&config).unwrap();
        assert_eq!(tab.columns[0].offset, 0);
        assert_eq!(
            tab.columns[1].offset,
            tab.columns[0].stride * tab.possible_rows as u64
        );
    }

    #[test]
    fn add_rows_in_place_rounds_up_to_multiple_of_16() {
        let config = Config::small();
        let mut tab = Tablet::create(&config, 1, VirgType::Int, Some(0));
        tab.add_column(&config, "col0", VirgType::Int).unwrap();
        let before = tab.possible_rows;
        let residual = tab.add_rows_in_place(&config, 5);
        tab.check(&config).unwrap();
        assert_eq!(residual, 0, "plenty of room, nothing should spill");
        assert_eq!(tab.possible_rows, before + 16);
    }

    #[test]
    fn add_rows_in_place_reports_residual_when_tablet_is_nearly_full() {
        let config = Config::small();
        let mut tab = Tablet::create(&config, 1, VirgType::Int, Some(0));
        tab.add_column(&config, "col0", VirgType::Int).unwrap();
        // drive possible_rows up to near the tablet's actual capacity
        loop {
            let residual = tab.add_rows_in_place(&config, 16);
            if residual > 0 {
                assert!(residual > 0);
                break;
            }
        }
        tab.check(&config).unwrap();
    }

    #[test]
    fn spawn_tail_chains_and_resets_row_count() {
        let config = Config::small();
        let mut head = Tablet::create(&config, 1, VirgType::Int, Some(0));
        head.add_column(&config, "col0", VirgType::Int).unwrap();
        let tail = head.spawn_tail(&config, 2, config.initial_keys);
        assert!(!head.last_tablet);
        assert_eq!(head.next, 2);
        assert!(tail.last_tablet);
        assert_eq!(tail.rows, 0);
        tail.check(&config).unwrap();
    }

    #[test]
    fn key_and_column_round_trip() {
        let config = Config::small();
        let mut tab = Tablet::create(&config, 1, VirgType::Int, Some(0));
        tab.add_column(&config, "col0", VirgType::Int).unwrap();
        tab.key_bytes_mut(0).copy_from_slice(&42i32.to_le_bytes());
        tab.column_bytes_mut(0, 0).copy_from_slice(&7i32.to_le_bytes());
        assert_eq!(i32::from_le_bytes(tab.key_bytes(0).try_into().unwrap()), 42);
        assert_eq!(
            i32::from_le_bytes(tab.column_bytes(0, 0).try_into().unwrap()),
            7
        );
    }
}
