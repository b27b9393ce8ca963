//! The on-disk database file: a small header, a persisted table catalog, a
//! meta index of tablet locations, and an arena of fixed-size tablet
//! blocks, fronted by the in-memory [`SlotCache`].
//!
//! Layout on disk, in order: `[header][catalog][meta index][tablet arena]`.
//! The catalog is fixed-size (`config.max_tables` entries, never grows).
//! The meta index starts with room for `config.info_size` entries right
//! after the catalog. When it fills up it grows by `config.info_increment`
//! entries; if that growth would eat into the arena, whichever tablet
//! currently sits closest to the header is relocated to the end of the
//! file first. Only ever the one (or few) tablets actually in the way are
//! moved — everything else keeps its offset for the life of the file.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::Path;

use crate::cache::SlotCache;
use crate::config::Config;
use crate::error::{EngineError, Result};
use crate::tablet::{ColumnMeta, Tablet, HEADER_SIZE};
use crate::types::VirgType;

const MAGIC: &[u8; 8] = b"VIRGDB01";
const HEADER_DISK_SIZE: u64 = 128;
const ENTRY_SIZE: u64 = 24;

#[derive(Debug, Clone, Copy)]
struct MetaEntry {
    id: u32,
    offset: u64,
    in_use: bool,
}

impl MetaEntry {
    const EMPTY: MetaEntry = MetaEntry {
        id: 0,
        offset: 0,
        in_use: false,
    };

    fn encode(self) -> [u8; ENTRY_SIZE as usize] {
        let mut buf = [0u8; ENTRY_SIZE as usize];
        buf[0..4].copy_from_slice(&self.id.to_le_bytes());
        buf[4..12].copy_from_slice(&self.offset.to_le_bytes());
        buf[12] = self.in_use as u8;
        buf
    }

    fn decode(buf: &[u8]) -> MetaEntry {
        MetaEntry {
            id: u32::from_le_bytes(buf[0..4].try_into().unwrap()),
            offset: u64::from_le_bytes(buf[4..12].try_into().unwrap()),
            in_use: buf[12] != 0,
        }
    }
}

/// One named table's catalog entry: everything needed to resume scanning
/// and inserting into its tablet chain after a reopen. Mirrors the
/// per-table slot in the original's database header.
#[derive(Debug, Clone)]
pub struct TableEntry {
    pub id: u32,
    pub name: String,
    pub key_type: VirgType,
    pub first_tablet: u32,
    pub last_tablet: u32,
    pub write_cursor: u32,
    pub tablet_count: u32,
    in_use: bool,
}

impl TableEntry {
    fn table_entry_size(config: &Config) -> u64 {
        // in_use(1) + key_type(1) + id(4) + first(4) + last(4) + cursor(4) + count(4) + name
        22 + config.max_table_name as u64
    }

    fn encode(&self, config: &Config) -> Vec<u8> {
        let mut buf = vec![0u8; Self::table_entry_size(config) as usize];
        buf[0] = self.in_use as u8;
        buf[1] = self.key_type as u8;
        buf[2..6].copy_from_slice(&self.id.to_le_bytes());
        buf[6..10].copy_from_slice(&self.first_tablet.to_le_bytes());
        buf[10..14].copy_from_slice(&self.last_tablet.to_le_bytes());
        buf[14..18].copy_from_slice(&self.write_cursor.to_le_bytes());
        buf[18..22].copy_from_slice(&self.tablet_count.to_le_bytes());
        let name_bytes = self.name.as_bytes();
        let n = name_bytes.len().min(config.max_table_name - 1);
        buf[22..22 + n].copy_from_slice(&name_bytes[..n]);
        buf
    }

    fn decode(buf: &[u8]) -> Result<TableEntry> {
        let in_use = buf[0] != 0;
        let key_type = VirgType::from_u8(buf[1])
            .ok_or_else(|| EngineError::corruption("bad key type byte in table catalog entry"))?;
        let id = u32::from_le_bytes(buf[2..6].try_into().unwrap());
        let first_tablet = u32::from_le_bytes(buf[6..10].try_into().unwrap());
        let last_tablet = u32::from_le_bytes(buf[10..14].try_into().unwrap());
        let write_cursor = u32::from_le_bytes(buf[14..18].try_into().unwrap());
        let tablet_count = u32::from_le_bytes(buf[18..22].try_into().unwrap());
        let name_bytes = &buf[22..];
        let nul = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_bytes.len());
        let name = String::from_utf8_lossy(&name_bytes[..nul]).into_owned();
        Ok(TableEntry {
            id,
            name,
            key_type,
            first_tablet,
            last_tablet,
            write_cursor,
            tablet_count,
            in_use,
        })
    }
}

/// A database file opened for reading and writing. Owns the slot cache, so
/// every tablet access in the crate funnels through here.
pub struct Database {
    file: File,
    config: Config,
    tables: Vec<TableEntry>,
    meta: Vec<MetaEntry>,
    catalog_offset: u64,
    meta_offset: u64,
    block_size: u64,
    arena_end: u64,
    tablet_id_counter: u32,
    table_id_counter: u32,
    cache: SlotCache,
}

impl Database {
    /// Creates a brand new, empty database file at `path`, overwriting
    /// anything already there.
    pub fn create<P: AsRef<Path>>(path: P, config: Config) -> Result<Database> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        let tables = vec![
            TableEntry {
                id: 0,
                name: String::new(),
                key_type: VirgType::Int,
                first_tablet: 0,
                last_tablet: 0,
                write_cursor: 0,
                tablet_count: 0,
                in_use: false,
            };
            config.max_tables
        ];
        let meta = vec![MetaEntry::EMPTY; config.info_size as usize];

        let catalog_offset = HEADER_DISK_SIZE;
        let meta_offset = catalog_offset + config.max_tables as u64 * TableEntry::table_entry_size(&config);
        let block_size = meta_offset + config.info_size as u64 * ENTRY_SIZE;

        let mut db = Database {
            file,
            config,
            tables,
            meta,
            catalog_offset,
            meta_offset,
            block_size,
            arena_end: block_size,
            tablet_id_counter: 1,
            table_id_counter: 1,
            cache: SlotCache::new(config.n_slots),
        };
        db.flush_header()?;
        db.flush_catalog()?;
        db.flush_meta()?;
        log::info!(
            "created database with {} meta slots, block_size {block_size}",
            config.info_size,
        );
        Ok(db)
    }

    /// Opens an existing database file, reading back its header, catalog,
    /// and meta index. The `config` passed in must agree with the file's
    /// tablet geometry; callers normally obtain it from
    /// [`crate::engine::Engine`].
    pub fn open<P: AsRef<Path>>(path: P, config: Config) -> Result<Database> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;

        let mut hdr = [0u8; HEADER_DISK_SIZE as usize];
        file.read_exact_at(&mut hdr, 0)?;
        if &hdr[0..8] != MAGIC {
            return Err(EngineError::corruption("bad magic in database header"));
        }
        let info_capacity = u32::from_le_bytes(hdr[8..12].try_into().unwrap());
        let block_size = u64::from_le_bytes(hdr[12..20].try_into().unwrap());
        let arena_end = u64::from_le_bytes(hdr[20..28].try_into().unwrap());
        let tablet_id_counter = u32::from_le_bytes(hdr[28..32].try_into().unwrap());
        let table_id_counter = u32::from_le_bytes(hdr[32..36].try_into().unwrap());

        let catalog_offset = HEADER_DISK_SIZE;
        let entry_size = TableEntry::table_entry_size(&config);
        let meta_offset = catalog_offset + config.max_tables as u64 * entry_size;

        let mut tables = Vec::with_capacity(config.max_tables);
        for i in 0..config.max_tables as u64 {
            let mut buf = vec![0u8; entry_size as usize];
            file.read_exact_at(&mut buf, catalog_offset + i * entry_size)?;
            tables.push(TableEntry::decode(&buf)?);
        }

        let mut meta = Vec::with_capacity(info_capacity as usize);
        for i in 0..info_capacity as u64 {
            let mut buf = [0u8; ENTRY_SIZE as usize];
            file.read_exact_at(&mut buf, meta_offset + i * ENTRY_SIZE)?;
            meta.push(MetaEntry::decode(&buf));
        }

        log::info!(
            "opened database, {} tables, {} tablets in use",
            tables.iter().filter(|t| t.in_use).count(),
            meta.iter().filter(|e| e.in_use).count()
        );

        Ok(Database {
            file,
            config,
            tables,
            meta,
            catalog_offset,
            meta_offset,
            block_size,
            arena_end,
            tablet_id_counter,
            table_id_counter,
            cache: SlotCache::new(config.n_slots),
        })
    }

    fn flush_header(&self) -> Result<()> {
        let mut buf = [0u8; HEADER_DISK_SIZE as usize];
        buf[0..8].copy_from_slice(MAGIC);
        buf[8..12].copy_from_slice(&(self.meta.len() as u32).to_le_bytes());
        buf[12..20].copy_from_slice(&self.block_size.to_le_bytes());
        buf[20..28].copy_from_slice(&self.arena_end.to_le_bytes());
        buf[28..32].copy_from_slice(&self.tablet_id_counter.to_le_bytes());
        buf[32..36].copy_from_slice(&self.table_id_counter.to_le_bytes());
        self.file.write_all_at(&buf, 0)?;
        Ok(())
    }

    fn flush_catalog(&self) -> Result<()> {
        let entry_size = TableEntry::table_entry_size(&self.config);
        for (i, entry) in self.tables.iter().enumerate() {
            self.file
                .write_all_at(&entry.encode(&self.config), self.catalog_offset + i as u64 * entry_size)?;
        }
        Ok(())
    }

    fn flush_catalog_entry(&self, idx: usize) -> Result<()> {
        let entry_size = TableEntry::table_entry_size(&self.config);
        self.file.write_all_at(
            &self.tables[idx].encode(&self.config),
            self.catalog_offset + idx as u64 * entry_size,
        )?;
        Ok(())
    }

    fn flush_meta(&self) -> Result<()> {
        for (i, entry) in self.meta.iter().enumerate() {
            self.file
                .write_all_at(&entry.encode(), self.meta_offset + i as u64 * ENTRY_SIZE)?;
        }
        Ok(())
    }

    fn flush_meta_entry(&self, idx: usize) -> Result<()> {
        self.file.write_all_at(
            &self.meta[idx].encode(),
            self.meta_offset + idx as u64 * ENTRY_SIZE,
        )?;
        Ok(())
    }

    pub fn next_tablet_id(&mut self) -> u32 {
        let id = self.tablet_id_counter;
        self.tablet_id_counter += 1;
        id
    }

    pub fn next_table_id(&mut self) -> u32 {
        let id = self.table_id_counter;
        self.table_id_counter += 1;
        id
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ---- table catalog -------------------------------------------------

    /// Creates a new table catalog entry with a fresh, empty initial
    /// tablet. Mirrors `virg_table_create`.
    pub fn create_table(&mut self, name: &str, key_type: VirgType) -> Result<u32> {
        if name.len() >= self.config.max_table_name {
            return Err(EngineError::invalid_argument(format!(
                "table name {name:?} is too long (max {})",
                self.config.max_table_name - 1
            )));
        }
        if self.tables.iter().any(|t| t.in_use && t.name == name) {
            return Err(EngineError::invalid_argument(format!(
                "table {name:?} already exists"
            )));
        }
        let slot = self
            .tables
            .iter()
            .position(|t| !t.in_use)
            .ok_or_else(|| {
                EngineError::invalid_argument(format!(
                    "database already has the maximum of {} tables",
                    self.config.max_tables
                ))
            })?;

        let table_id = self.next_table_id();
        let tablet_id = self.next_tablet_id();
        let tablet = Tablet::create(&self.config, tablet_id, key_type, Some(table_id));
        let idx = self.alloc(tablet_id, tablet)?;
        self.unpin(idx);

        self.tables[slot] = TableEntry {
            id: table_id,
            name: name.to_string(),
            key_type,
            first_tablet: tablet_id,
            last_tablet: tablet_id,
            write_cursor: tablet_id,
            tablet_count: 1,
            in_use: true,
        };
        self.flush_catalog_entry(slot)?;
        self.flush_header()?;
        log::info!("created table {name:?} (id {table_id}) with key type {key_type}");
        Ok(table_id)
    }

    fn table_slot(&self, id: u32) -> Result<usize> {
        self.tables
            .iter()
            .position(|t| t.in_use && t.id == id)
            .ok_or_else(|| EngineError::corruption(format!("no catalog entry for table {id}")))
    }

    pub fn find_table(&self, name: &str) -> Option<u32> {
        self.tables.iter().find(|t| t.in_use && t.name == name).map(|t| t.id)
    }

    pub fn table_entry(&self, id: u32) -> Result<&TableEntry> {
        let slot = self.table_slot(id)?;
        Ok(&self.tables[slot])
    }

    /// Updates the bookkeeping fields a spill or chain-walk may change,
    /// persisting them immediately (the original keeps these in the
    /// always-resident database header, so every write is synchronous).
    pub fn set_table_tail(&mut self, id: u32, last_tablet: u32, write_cursor: u32, tablet_count: u32) -> Result<()> {
        let slot = self.table_slot(id)?;
        self.tables[slot].last_tablet = last_tablet;
        self.tables[slot].write_cursor = write_cursor;
        self.tables[slot].tablet_count = tablet_count;
        self.flush_catalog_entry(slot)
    }

    pub fn table_names(&self) -> impl Iterator<Item = &str> {
        self.tables.iter().filter(|t| t.in_use).map(|t| t.name.as_str())
    }

    // ---- tablet arena / cache -------------------------------------------

    fn find_meta(&self, id: u32) -> Option<usize> {
        self.meta.iter().position(|e| e.in_use && e.id == id)
    }

    /// Grows the meta index by `config.info_increment` entries, relocating
    /// any tablet whose on-disk offset now falls inside the region the
    /// index needs to claim.
    fn grow_meta(&mut self) -> Result<()> {
        let old_len = self.meta.len();
        let new_len = old_len + self.config.info_increment as usize;
        let new_block_size = self.meta_offset + new_len as u64 * ENTRY_SIZE;

        self.meta.resize(new_len, MetaEntry::EMPTY);

        while self.block_size < new_block_size {
            let in_the_way = self
                .meta
                .iter()
                .position(|e| e.in_use && e.offset < new_block_size);
            match in_the_way {
                Some(idx) => {
                    self.relocate_tablet(idx)?;
                }
                None => break,
            }
        }

        self.block_size = new_block_size;
        self.flush_meta()?;
        self.flush_header()?;
        log::warn!("grew meta index from {old_len} to {new_len} entries, relocating tablets near the arena start");
        Ok(())
    }

    /// Moves the tablet described by `meta[idx]` to the end of the arena,
    /// freeing up the space it used to occupy near the header.
    fn relocate_tablet(&mut self, idx: usize) -> Result<()> {
        let old_offset = self.meta[idx].offset;
        let mut buf = vec![0u8; self.config.tablet_size as usize];
        self.file.read_exact_at(&mut buf, old_offset)?;

        let new_offset = self.arena_end;
        self.file.write_all_at(&buf, new_offset)?;
        self.arena_end += self.config.tablet_size;

        self.meta[idx].offset = new_offset;
        self.flush_meta_entry(idx)?;

        if let Some(cache_idx) = self.cache.find_by_id(self.meta[idx].id) {
            if let Some(tab) = self.cache.get_mut(cache_idx) {
                tab.info = Some(idx);
            }
        }

        log::debug!(
            "relocated tablet {} from offset {old_offset} to {new_offset}",
            self.meta[idx].id
        );
        Ok(())
    }

    fn register_new_tablet(&mut self, id: u32) -> Result<usize> {
        if !self.meta.iter().any(|e| !e.in_use) {
            self.grow_meta()?;
        }
        let idx = self.meta.iter().position(|e| !e.in_use).expect("grew meta index");
        let offset = self.arena_end;
        self.arena_end += self.config.tablet_size;
        self.meta[idx] = MetaEntry {
            id,
            offset,
            in_use: true,
        };
        self.flush_meta_entry(idx)?;
        self.flush_header()?;
        Ok(idx)
    }

    fn encode_tablet(&self, tab: &Tablet) -> Vec<u8> {
        let mut buf = vec![0u8; self.config.tablet_size as usize];
        let h = &mut buf[0..HEADER_SIZE as usize];
        h[0..4].copy_from_slice(&tab.rows.to_le_bytes());
        h[4..8].copy_from_slice(&tab.possible_rows.to_le_bytes());
        h[8] = tab.key_type as u8;
        h[9..17].copy_from_slice(&tab.key_stride.to_le_bytes());
        h[17..25].copy_from_slice(&tab.pointer_stride.to_le_bytes());
        h[25..33].copy_from_slice(&tab.row_stride.to_le_bytes());
        h[33..37].copy_from_slice(&tab.id.to_le_bytes());
        h[37..41].copy_from_slice(&tab.next.to_le_bytes());
        h[41] = tab.last_tablet as u8;
        h[42] = tab.in_table as u8;
        h[43..47].copy_from_slice(&tab.table_id.to_le_bytes());
        h[47..55].copy_from_slice(&tab.key_block.to_le_bytes());
        h[55..63].copy_from_slice(&tab.key_pointers_block.to_le_bytes());
        h[63..71].copy_from_slice(&tab.fixed_block.to_le_bytes());
        h[71..79].copy_from_slice(&tab.variable_block.to_le_bytes());
        h[79..87].copy_from_slice(&tab.size.to_le_bytes());
        h[87..91].copy_from_slice(&(tab.columns.len() as u32).to_le_bytes());

        let name_width = self.config.max_column_name;
        let mut off = 91;
        for col in &tab.columns {
            let name_bytes = col.name.as_bytes();
            let n = name_bytes.len().min(name_width - 1);
            h[off..off + n].copy_from_slice(&name_bytes[..n]);
            off += name_width;
            h[off] = col.vtype as u8;
            off += 1;
            h[off..off + 8].copy_from_slice(&col.stride.to_le_bytes());
            off += 8;
            h[off..off + 8].copy_from_slice(&col.offset.to_le_bytes());
            off += 8;
        }

        let data = tab.raw_data();
        buf[HEADER_SIZE as usize..HEADER_SIZE as usize + data.len()].copy_from_slice(data);
        buf
    }

    fn decode_tablet(&self, buf: &[u8]) -> Result<Tablet> {
        let h = &buf[0..HEADER_SIZE as usize];
        let rows = u32::from_le_bytes(h[0..4].try_into().unwrap());
        let possible_rows = u32::from_le_bytes(h[4..8].try_into().unwrap());
        let key_type = VirgType::from_u8(h[8])
            .ok_or_else(|| EngineError::corruption("bad key type byte in tablet header"))?;
        let key_stride = u64::from_le_bytes(h[9..17].try_into().unwrap());
        let pointer_stride = u64::from_le_bytes(h[17..25].try_into().unwrap());
        let row_stride = u64::from_le_bytes(h[25..33].try_into().unwrap());
        let id = u32::from_le_bytes(h[33..37].try_into().unwrap());
        let next = u32::from_le_bytes(h[37..41].try_into().unwrap());
        let last_tablet = h[41] != 0;
        let in_table = h[42] != 0;
        let table_id = u32::from_le_bytes(h[43..47].try_into().unwrap());
        let key_block = u64::from_le_bytes(h[47..55].try_into().unwrap());
        let key_pointers_block = u64::from_le_bytes(h[55..63].try_into().unwrap());
        let fixed_block = u64::from_le_bytes(h[63..71].try_into().unwrap());
        let variable_block = u64::from_le_bytes(h[71..79].try_into().unwrap());
        let size = u64::from_le_bytes(h[79..87].try_into().unwrap());
        let num_columns = u32::from_le_bytes(h[87..91].try_into().unwrap()) as usize;

        let name_width = self.config.max_column_name;
        let mut off = 91;
        let mut columns = Vec::with_capacity(num_columns);
        for _ in 0..num_columns {
            let name_bytes = &h[off..off + name_width];
            let nul = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_width);
            let name = String::from_utf8_lossy(&name_bytes[..nul]).into_owned();
            off += name_width;
            let vtype = VirgType::from_u8(h[off])
                .ok_or_else(|| EngineError::corruption("bad column type byte"))?;
            off += 1;
            let stride = u64::from_le_bytes(h[off..off + 8].try_into().unwrap());
            off += 8;
            let offset = u64::from_le_bytes(h[off..off + 8].try_into().unwrap());
            off += 8;
            columns.push(ColumnMeta {
                name,
                vtype,
                stride,
                offset,
            });
        }

        let mut tab = Tablet::create(&self.config, id, key_type, if in_table { Some(table_id) } else { None });
        tab.rows = rows;
        tab.possible_rows = possible_rows;
        tab.key_stride = key_stride;
        tab.pointer_stride = pointer_stride;
        tab.row_stride = row_stride;
        tab.next = next;
        tab.last_tablet = last_tablet;
        tab.key_block = key_block;
        tab.key_pointers_block = key_pointers_block;
        tab.fixed_block = fixed_block;
        tab.variable_block = variable_block;
        tab.size = size;
        tab.columns = columns;
        tab.ensure_capacity(&self.config);

        let data_len = (size - HEADER_SIZE) as usize;
        tab.raw_data_mut()[..data_len]
            .copy_from_slice(&buf[HEADER_SIZE as usize..HEADER_SIZE as usize + data_len]);

        Ok(tab)
    }

    fn write_back(&mut self, cache_idx: usize) -> Result<()> {
        let id = self.cache.id_at(cache_idx).expect("write_back of empty slot");
        let meta_idx = match self.find_meta(id) {
            Some(i) => i,
            None => self.register_new_tablet(id)?,
        };
        let offset = self.meta[meta_idx].offset;
        let encoded = {
            let tab = self.cache.get(cache_idx).expect("write_back of empty slot");
            self.encode_tablet(tab)
        };
        self.file.write_all_at(&encoded, offset)?;
        if let Some(tab) = self.cache.get_mut(cache_idx) {
            tab.info = Some(meta_idx);
        }
        Ok(())
    }

    /// Evicts a slot for a brand new tablet, writing back whatever was
    /// there before. Returns the resulting slot index, with `tablet`
    /// installed and pinned once.
    pub fn alloc(&mut self, id: u32, tablet: Tablet) -> Result<usize> {
        let victim = self.cache.find_victim()?;
        if self.cache.get(victim).is_some() {
            self.write_back(victim)?;
            self.cache.evict(victim);
        }
        self.cache.occupy(victim, id, tablet);
        Ok(victim)
    }

    /// Loads tablet `id` into the cache, pinning it once, reusing a
    /// resident copy if one's already there. Mirrors `virg_db_load`.
    pub fn load(&mut self, id: u32) -> Result<usize> {
        if let Some(idx) = self.cache.find_by_id(id) {
            self.cache.pin(idx);
            return Ok(idx);
        }

        let meta_idx = self
            .find_meta(id)
            .ok_or_else(|| EngineError::corruption(format!("tablet {id} has no meta-index entry")))?;
        let offset = self.meta[meta_idx].offset;

        let mut buf = vec![0u8; self.config.tablet_size as usize];
        self.file.read_exact_at(&mut buf, offset)?;
        let mut tab = self.decode_tablet(&buf)?;
        tab.info = Some(meta_idx);

        let victim = self.cache.find_victim()?;
        if self.cache.get(victim).is_some() {
            self.write_back(victim)?;
            self.cache.evict(victim);
        }
        self.cache.occupy(victim, id, tab);
        Ok(victim)
    }

    /// Follows the tablet resident at `cache_idx`'s `next` pointer, loading
    /// the following tablet in the chain and unpinning the predecessor only
    /// once the successor is safely pinned. Returns `None` if it was the
    /// last tablet. Mirrors `virg_db_loadnext`.
    pub fn load_next(&mut self, cache_idx: usize) -> Result<Option<usize>> {
        let (last, next) = {
            let tab = self.cache.get(cache_idx).expect("load_next of empty slot");
            (tab.last_tablet, tab.next)
        };
        if last {
            return Ok(None);
        }
        let next_idx = self.load(next)?;
        self.unpin(cache_idx);
        Ok(Some(next_idx))
    }

    pub fn pin(&mut self, idx: usize) {
        self.cache.pin(idx);
    }

    pub fn unpin(&mut self, idx: usize) {
        self.cache.unpin(idx);
    }

    pub fn get(&self, idx: usize) -> &Tablet {
        self.cache.get(idx).expect("tablet slot is empty")
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut Tablet {
        self.cache.get_mut(idx).expect("tablet slot is empty")
    }

    pub fn taken(&self) -> usize {
        self.cache.occupied_indices().count()
    }

    /// Removes a tablet permanently: drops it from the cache and marks its
    /// meta-index entry free without ever writing its bytes back out.
    /// Mirrors `virg_tablet_remove`. Used only for result tablets.
    pub fn remove(&mut self, id: u32) -> Result<()> {
        if let Some(idx) = self.cache.find_by_id(id) {
            self.cache.clear(idx);
        }
        if let Some(meta_idx) = self.find_meta(id) {
            self.meta[meta_idx].in_use = false;
            self.flush_meta_entry(meta_idx)?;
        } else {
            return Err(EngineError::corruption(format!(
                "remove: tablet {id} has no meta-index entry"
            )));
        }
        Ok(())
    }

    /// Writes every resident tablet back to disk and flushes metadata.
    /// Idempotent in spirit: callers normally unpin everything before
    /// calling this, but it tolerates pinned slots (just logs a warning)
    /// so an abrupt shutdown still gets a best-effort flush.
    pub fn close(mut self) -> Result<()> {
        for idx in self.cache.occupied_indices().collect::<Vec<_>>() {
            if self.cache.is_pinned(idx) {
                log::warn!("closing database with slot {idx} still pinned");
            }
            self.write_back(idx)?;
        }
        self.flush_header()?;
        self.flush_catalog()?;
        self.flush_meta()?;
        self.file.sync_all()?;
        log::info!("database closed cleanly");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn temp_path(name: &str) -> std::path::PathBuf {
        let mut p = std::env::temp_dir();
        p.push(format!("virginian-test-{}-{}-{}", name, std::process::id(), name.len()));
        p
    }

    #[test]
    fn create_then_reopen_preserves_header() {
        let path = temp_path("create-reopen");
        let config = Config::small();
        {
            let db = Database::create(&path, config).unwrap();
            db.close().unwrap();
        }
        let db = Database::open(&path, config).unwrap();
        assert_eq!(db.meta.len(), config.info_size as usize);
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn alloc_and_reload_round_trips_a_tablet() {
        let path = temp_path("alloc-reload");
        let config = Config::small();
        let mut db = Database::create(&path, config).unwrap();

        let id = db.next_tablet_id();
        let mut tab = Tablet::create(&config, id, VirgType::Int, Some(0));
        tab.add_column(&config, "a", VirgType::Double).unwrap();
        tab.key_bytes_mut(0).copy_from_slice(&9i32.to_le_bytes());
        tab.rows = 1;
        let idx = db.alloc(id, tab).unwrap();
        db.unpin(idx);
        db.write_back(idx).unwrap();

        let reload_idx = db.load(id).unwrap();
        assert_eq!(db.get(reload_idx).rows, 1);
        assert_eq!(
            i32::from_le_bytes(db.get(reload_idx).key_bytes(0).try_into().unwrap()),
            9
        );
        db.unpin(reload_idx);
        db.close().unwrap();
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn meta_growth_relocates_the_first_tablet() {
        let path = temp_path("meta-growth");
        let mut config = Config::small();
        config.info_size = 1;
        config.info_increment = 1;
        let mut db = Database::create(&path, config).unwrap();

        let first_id = db.next_tablet_id();
        let tab = Tablet::create(&config, first_id, VirgType::Int, Some(0));
        let idx = db.alloc(first_id, tab).unwrap();
        db.unpin(idx);
        db.write_back(idx).unwrap();
        let first_offset_before = db.meta[db.find_meta(first_id).unwrap()].offset;

        let second_id = db.next_tablet_id();
        let tab2 = Tablet::create(&config, second_id, VirgType::Int, Some(0));
        let idx2 = db.alloc(second_id, tab2).unwrap();
        db.unpin(idx2);
        db.write_back(idx2).unwrap();

        let first_offset_after = db.meta[db.find_meta(first_id).unwrap()].offset;
        assert_ne!(
            first_offset_before, first_offset_after,
            "growing the meta index should have relocated the first tablet"
        );

        db.close().unwrap();
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn table_catalog_round_trips_through_reopen() {
        let path = temp_path("catalog-reopen");
        let config = Config::small();
        {
            let mut db = Database::create(&path, config).unwrap();
            let id = db.create_table("widgets", VirgType::Int).unwrap();
            assert_eq!(db.find_table("widgets"), Some(id));
            db.close().unwrap();
        }
        let db = Database::open(&path, config).unwrap();
        let id = db.find_table("widgets").expect("table should survive reopen");
        let entry = db.table_entry(id).unwrap();
        assert_eq!(entry.key_type, VirgType::Int);
        assert_eq!(entry.tablet_count, 1);
        std::fs::remove_file(&path).ok();
    }
}
