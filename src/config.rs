//! Tunable constants gathered into a single value.
//!
//! The original engine compiles these in as preprocessor defines; we keep
//! them as runtime configuration instead so a process (and, more to the
//! point, a single test binary) can run more than one tablet geometry at
//! once without `#[cfg]` gymnastics. `Config::default()` matches the
//! original's compiled-in values exactly.

/// Engine-wide tunables. See the external interface tunable table for the
/// meaning of each field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Byte size of one tablet block.
    pub tablet_size: u64,
    /// Number of tablet-sized buffers held in the in-memory slot cache.
    pub n_slots: usize,
    /// Rows allocated to a freshly created tablet.
    pub initial_keys: u32,
    /// Row-slots added in one step when an insert finds no room.
    pub key_increment: u32,
    /// Maximum fixed columns a tablet may carry.
    pub max_columns: usize,
    /// Maximum length of a column name, including the terminator.
    pub max_column_name: usize,
    /// Maximum number of tables a database may hold.
    pub max_tables: usize,
    /// Maximum length of a table name, including the terminator.
    pub max_table_name: usize,
    /// SIMD row-block width used by the interpreter.
    pub block: usize,
    /// Maximum number of opcodes in one compiled statement.
    pub max_ops: usize,
    /// Number of scratch VM registers.
    pub regs: usize,
    /// Initial number of meta-index (`TabletInfo`) entries allocated on create.
    pub info_size: u32,
    /// Meta-index entries added each time the index fills up.
    pub info_increment: u32,
    /// Row headroom the single-threaded `Result` op keeps before rotating to
    /// a new result tablet.
    pub result_margin: u32,
    /// Bytes reserved for the variable region when a tablet's fixed columns
    /// are maxed out (`add_max_rows`).
    pub maxed_variable: u64,
    /// Bytes reserved for the variable region of a freshly created tablet.
    pub initial_variable: u64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            tablet_size: 8 * 1024 * 1024,
            n_slots: 64,
            initial_keys: 256,
            key_increment: 2048 * 128,
            max_columns: 16,
            max_column_name: 16,
            max_tables: 16,
            max_table_name: 32,
            block: 64,
            max_ops: 32,
            regs: 16,
            info_size: 16,
            info_increment: 32,
            result_margin: 300,
            maxed_variable: (8 * 1024 * 1024) / 16,
            initial_variable: 512 * 1024,
        }
    }
}

impl Config {
    /// A configuration with a small tablet size and row counts, useful for
    /// exercising spill and eviction paths without allocating megabytes per
    /// test. `maxed_variable`/`initial_variable` are scaled down with
    /// `tablet_size` (same `tablet_size / 16` ratio `default()` uses) —
    /// left at `default()`'s byte counts, the variable-region reservation
    /// alone would dwarf this tablet's whole `tablet_size`.
    pub fn small() -> Self {
        let tablet_size = 16 * 1024;
        Config {
            tablet_size,
            n_slots: 4,
            initial_keys: 16,
            key_increment: 256,
            maxed_variable: tablet_size / 16,
            initial_variable: tablet_size / 16,
            ..Config::default()
        }
    }
}
