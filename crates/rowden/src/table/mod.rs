//! Table core: a single-file fixed-record primary-key table.
//!
//! A [`Table`] couples three structures and keeps them consistent across
//! every operation:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  RecordFile (disk)                                           │
//! │  - N records of R bytes, slot i at byte range [i*R, (i+1)*R) │
//! │  - dense: no holes, deletion swaps the last record in        │
//! ├──────────────────────────────────────────────────────────────┤
//! │  KeyIndex (RAM, always present)                              │
//! │  - key (first K bytes of a record) → slot                    │
//! ├──────────────────────────────────────────────────────────────┤
//! │  TailStore (RAM, optional)                                   │
//! │  - tail i == bytes [K, R) of the record at slot i            │
//! │  - dropped under memory pressure, never re-created           │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! With the tail shadow live, reads never touch the disk: a record is
//! recomposed from the key and the shadowed tail. Writes always reach the
//! file (through its write-behind buffer) and update the shadow when it is
//! still live. Opening an existing file rebuilds the index in one pass,
//! quarantining malformed records and de-duplicating repeated keys.
//!
//! All mutating operations take `&mut self`; exclusive access is the
//! serialization model. Wrap the table in a lock to share it.

pub mod iter;
pub mod key_index;
pub mod record_file;
pub mod tail_store;

use crate::error::{Result, TableError};
use crate::memory::{MemoryOracle, SystemMemory};
use crate::registry::{MemoryStats, Registry};
use crate::schema::{Row, RowSchema};
use iter::{Keys, OrderedRows, Rows};
use key_index::KeyIndex;
use record_file::RecordFile;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use tail_store::{TailStore, MAX_ARRAY_BYTES};
use tracing::{error, info, warn};

/// Default size of the record file's write-behind buffer, in records.
pub const DEFAULT_BUFFER_RECORDS: usize = 1024;

/// Floor for the abandon threshold and base cost of the key index.
const MIN_MEM_FLOOR: u64 = 400 * 1024 * 1024;

/// Headroom required beyond the tail shadow's own footprint.
const SHADOW_HEADROOM: u64 = 200 * 1024 * 1024;

/// Configuration for opening a [`Table`].
#[derive(Debug, Clone)]
pub struct TableConfig {
    /// Write-behind buffer size in records. Default: 1024.
    pub buffer_records: usize,
    /// Expected record count, used for up-front RAM planning. Default: 0.
    pub initial_capacity: u64,
    /// Whether a tail shadow may be kept at all. Default: true.
    pub tail_shadow: bool,
    /// Lift the in-RAM array size ceiling for very large shadows.
    /// Default: false.
    pub exceed_array_limit: bool,
    /// Oracle consulted for capacity planning and eviction. Default:
    /// [`SystemMemory`].
    pub oracle: Arc<dyn MemoryOracle>,
    /// Registry the table announces itself to. Default: none.
    pub registry: Option<Registry>,
    /// Optional cap on distinct index keys; growth past it raises
    /// [`TableError::OutOfCapacity`]. Default: none.
    pub index_capacity_limit: Option<u64>,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            buffer_records: DEFAULT_BUFFER_RECORDS,
            initial_capacity: 0,
            tail_shadow: true,
            exceed_array_limit: false,
            oracle: Arc::new(SystemMemory),
            registry: None,
            index_capacity_limit: None,
        }
    }
}

impl TableConfig {
    /// Creates the default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the write-behind buffer size in records.
    pub fn with_buffer_records(mut self, records: usize) -> Self {
        self.buffer_records = records;
        self
    }

    /// Sets the expected record count used for RAM planning.
    pub fn with_initial_capacity(mut self, records: u64) -> Self {
        self.initial_capacity = records;
        self
    }

    /// Forbids the tail shadow; reads always go to the file.
    pub fn without_tail_shadow(mut self) -> Self {
        self.tail_shadow = false;
        self
    }

    /// Lifts the in-RAM array size ceiling for the tail shadow.
    pub fn with_exceeded_array_limit(mut self) -> Self {
        self.exceed_array_limit = true;
        self
    }

    /// Replaces the memory oracle.
    pub fn with_oracle(mut self, oracle: Arc<dyn MemoryOracle>) -> Self {
        self.oracle = oracle;
        self
    }

    /// Registers the table in `registry` while it is open.
    pub fn with_registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Caps the index at `entries` distinct keys.
    pub fn with_index_capacity_limit(mut self, entries: u64) -> Self {
        self.index_capacity_limit = Some(entries);
        self
    }
}

/// An open fixed-record primary-key table.
pub struct Table {
    schema: RowSchema,
    pub(crate) file: RecordFile,
    pub(crate) index: KeyIndex,
    pub(crate) tails: Option<TailStore>,
    oracle: Arc<dyn MemoryOracle>,
    min_mem_remaining: u64,
    registry: Option<Registry>,
}

impl Table {
    /// Opens the table at `path`, creating an empty file if absent.
    ///
    /// Rebuilds the key index from the file in one pass. Records whose key
    /// fails the schema's well-formedness check are physically removed;
    /// keys occurring more than once keep their lowest-numbered slot. A
    /// tail shadow is kept only when the configuration allows it and the
    /// oracle reports room for it.
    ///
    /// # Errors
    ///
    /// Fails when the file cannot be opened or repaired, when the index
    /// cannot be built, or when file and index disagree about the record
    /// count after recovery.
    pub fn open<P: AsRef<Path>>(path: P, schema: RowSchema, config: TableConfig) -> Result<Self> {
        let path = path.as_ref();
        let fresh = !path.exists();
        let record_width = schema.record_width();
        let key_width = schema.key_width();
        let oracle = config.oracle.clone();
        let min_mem_remaining = MIN_MEM_FLOOR.max(oracle.available() / 10);

        let mut file = RecordFile::open(path, record_width, config.buffer_records)?;
        let records = file.len().max(config.initial_capacity);

        // Plan the tail shadow, then make sure the index still fits.
        let ram_tails = 3 * records * (record_width as u64 + 4);
        let mut plan_shadow = config.tail_shadow
            && (config.exceed_array_limit || ram_tails < MAX_ARRAY_BYTES as u64)
            && oracle.available() > ram_tails + SHADOW_HEADROOM;
        let ram_index = MIN_MEM_FLOOR + records * (key_width as u64 + 4) * 3 / 2;
        if plan_shadow && !oracle.request(ram_index, false) {
            error!(
                "not enough RAM left for the key index of {} ({} MiB needed); \
                 giving up the tail shadow",
                path.display(),
                ram_index / 1024 / 1024
            );
            plan_shadow = false;
        }
        info!(
            "opening {}: {} records, tail shadow {}, {} MiB available",
            path.display(),
            file.len(),
            if plan_shadow { "planned" } else { "off" },
            oracle.available() / 1024 / 1024
        );

        let mut index = KeyIndex::new(key_width);
        if let Some(limit) = config.index_capacity_limit {
            index = index.with_capacity_limit(limit);
        }
        let mut tails = plan_shadow.then(|| {
            TailStore::new(schema.tail_width(), records, config.exceed_array_limit)
        });

        // One-pass scan. Without a shadow only the key prefix of each
        // record is read; with a shadow the full record is read and the
        // tail mirrored slot for slot, malformed records included, so the
        // shadow stays aligned with the file during quarantine cleanup.
        let mut quarantine: Vec<(Box<[u8]>, u64)> = Vec::new();
        if tails.is_some() {
            let mut slot = 0u64;
            for rec in file.scan_prefixes(record_width)? {
                let rec = rec?;
                let key = &rec[..key_width];
                if schema.wellformed_key(key) {
                    match index.put_unique(key, slot) {
                        Err(TableError::OutOfCapacity(_)) if tails.is_some() => {
                            warn!(
                                "key index out of capacity while loading {}; \
                                 dropping tail shadow and retrying",
                                path.display()
                            );
                            tails = None;
                            index.put_unique(key, slot)?;
                        }
                        other => other?,
                    }
                } else {
                    quarantine.push((key.into(), slot));
                }
                let mut shadow_failed = false;
                if let Some(store) = tails.as_mut() {
                    shadow_failed = store.add_unique(&rec[key_width..]).is_err();
                }
                if shadow_failed
                    || (tails.is_some()
                        && (oracle.short_status() || oracle.available() < min_mem_remaining))
                {
                    warn!(
                        "tail shadow given up while loading {}; continuing index-only",
                        path.display()
                    );
                    tails = None;
                }
                slot += 1;
            }
        } else {
            let mut slot = 0u64;
            for key in file.scan_prefixes(key_width)? {
                let key = key?;
                if schema.wellformed_key(&key) {
                    index.put_unique(&key, slot)?;
                } else {
                    quarantine.push((key, slot));
                }
                slot += 1;
            }
        }

        let mut table = Self {
            schema,
            file,
            index,
            tails,
            oracle,
            min_mem_remaining,
            registry: config.registry,
        };

        // Quarantined slots were never indexed; remove them physically,
        // largest slot first so pending slot numbers stay valid.
        for (key, slot) in quarantine.iter().rev() {
            if *slot >= table.file.len() {
                continue; // already truncated away by an earlier removal
            }
            warn!(
                "removing malformed record at slot {} of {} (key {:?})",
                slot,
                table.file.path().display(),
                key
            );
            table.remove_in_file(*slot)?;
        }
        table.check_loaded_sizes()?;

        if !fresh {
            let doubles = table.dedup_index()?;
            if !doubles.is_empty() {
                info!(
                    "{}: removed {} duplicate key group(s) during load",
                    table.file.path().display(),
                    doubles.len()
                );
            }
            table.check_loaded_sizes()?;
        }

        table.publish_stats();
        Ok(table)
    }

    /// The schema this table was opened with.
    pub fn schema(&self) -> &RowSchema {
        &self.schema
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    /// Number of records.
    pub fn len(&self) -> u64 {
        self.index.len()
    }

    /// True if the table holds no records.
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    /// True while the tail shadow is live.
    pub fn uses_tail_shadow(&self) -> bool {
        self.tails.is_some()
    }

    /// True if `key` is present.
    pub fn has(&self, key: &[u8]) -> bool {
        self.index.has(key)
    }

    /// The record stored under `key`, or `None`.
    pub fn get(&mut self, key: &[u8]) -> Result<Option<Row>> {
        if key.len() != self.schema.key_width() {
            return Ok(None);
        }
        match self.index.get(key) {
            Some(slot) => Ok(Some(self.read_row_at(key, slot)?)),
            None => Ok(None),
        }
    }

    /// Looks up several keys, returning the found records in key order.
    pub fn get_batch(&mut self, keys: &[&[u8]]) -> Result<BTreeMap<Box<[u8]>, Row>> {
        let mut out = BTreeMap::new();
        for key in keys {
            if let Some(row) = self.get(key)? {
                out.insert((*key).into(), row);
            }
        }
        Ok(out)
    }

    /// Inserts or overwrites `row` under its key.
    ///
    /// Returns `true` when the key was new, `false` when an existing record
    /// was overwritten in place.
    pub fn put(&mut self, row: &Row) -> Result<bool> {
        self.validate_row(row)?;
        self.debug_check_sizes();
        match self.index.get(row.key()) {
            None => {
                self.add_unique_inner(row)?;
                Ok(true)
            }
            Some(slot) => {
                self.file.put(slot, row.bytes())?;
                if !self.abandon_shadow_if_low() {
                    let failed = match self.tails.as_mut() {
                        Some(store) => store.set(slot, row.tail()).is_err(),
                        None => false,
                    };
                    if failed {
                        self.drop_shadow("tail overwrite failed");
                    }
                }
                self.debug_check_sizes();
                Ok(false)
            }
        }
    }

    /// Like [`Table::put`], but returns the previous record when the key
    /// already existed.
    pub fn replace(&mut self, row: &Row) -> Result<Option<Row>> {
        self.validate_row(row)?;
        let Some(slot) = self.index.get(row.key()) else {
            self.add_unique_inner(row)?;
            return Ok(None);
        };
        let previous = self.read_row_at(row.key(), slot)?;
        self.file.put(slot, row.bytes())?;
        if !self.abandon_shadow_if_low() {
            let failed = match self.tails.as_mut() {
                Some(store) => store.set(slot, row.tail()).is_err(),
                None => false,
            };
            if failed {
                self.drop_shadow("tail overwrite failed");
            }
        }
        self.debug_check_sizes();
        Ok(Some(previous))
    }

    /// Appends `row`, whose key must not be present yet.
    pub fn add_unique(&mut self, row: &Row) -> Result<()> {
        self.validate_row(row)?;
        debug_assert!(!self.index.has(row.key()), "key already present");
        self.add_unique_inner(row)
    }

    /// Appends several rows with fresh keys.
    pub fn add_unique_batch(&mut self, rows: &[Row]) -> Result<()> {
        for row in rows {
            self.add_unique(row)?;
        }
        Ok(())
    }

    /// Removes `key`, returning the removed record.
    ///
    /// The vacated slot is filled by relocating the last record, keeping
    /// the file dense. Malformed trailing records encountered while
    /// relocating are dropped as well.
    pub fn remove(&mut self, key: &[u8]) -> Result<Option<Row>> {
        if key.len() != self.schema.key_width() {
            return Ok(None);
        }
        self.debug_check_sizes();
        let Some(slot) = self.index.get(key) else {
            return Ok(None);
        };
        let removed = self.read_row_at(key, slot)?;
        self.index.remove(key);
        self.remove_in_file(slot)?;
        self.debug_check_sizes();
        Ok(Some(removed))
    }

    /// Physically removes and returns the record at the last slot.
    pub fn remove_one(&mut self) -> Result<Option<Row>> {
        if self.file.is_empty() {
            return Ok(None);
        }
        let mut rec = vec![0u8; self.schema.record_width()];
        self.file.clean_last_into(&mut rec)?;
        if let Some(store) = self.tails.as_mut() {
            store.remove_one();
        }
        let row = self.schema.new_row(&rec)?;
        self.index.remove(row.key());
        self.debug_check_sizes();
        Ok(Some(row))
    }

    /// The last `n` records in reverse physical order.
    pub fn top(&mut self, n: usize) -> Result<Vec<Row>> {
        let mut out = Vec::with_capacity(n.min(self.file.len() as usize));
        let mut slot = self.file.len();
        let mut rec = vec![0u8; self.schema.record_width()];
        while slot > 0 && out.len() < n {
            slot -= 1;
            self.file.get(slot, &mut rec)?;
            out.push(self.schema.new_row(&rec)?);
        }
        Ok(out)
    }

    /// Removes all records whose key occurs more than once, keeping the
    /// lowest-numbered slot per key.
    ///
    /// Returns the affected records grouped per key, for reconciliation by
    /// the caller. Normal operation never creates duplicates and the load
    /// path already removes any found in the file, so this usually returns
    /// an empty report.
    pub fn remove_doubles(&mut self) -> Result<Vec<Vec<Row>>> {
        self.dedup_index()
    }

    /// Ordered key iteration, optionally starting at `start_key`
    /// (inclusive).
    pub fn keys(&self, ascending: bool, start_key: Option<&[u8]>) -> Keys {
        Keys::new(self.index.ordered_keys(ascending, start_key))
    }

    /// Record iteration in the index's own order. Supports removal of the
    /// current record; see [`Rows::remove_current`].
    pub fn rows(&mut self) -> Rows<'_> {
        Rows::new(self)
    }

    /// Record iteration ordered by key. Fails with
    /// [`TableError::ConcurrentModification`] when the table is mutated
    /// while iterating.
    pub fn rows_ordered(&mut self, ascending: bool, start_key: Option<&[u8]>) -> OrderedRows<'_> {
        OrderedRows::new(self, ascending, start_key)
    }

    /// The smallest key, or `None` when empty.
    pub fn smallest_key(&self) -> Option<&[u8]> {
        self.index.smallest_key()
    }

    /// The largest key, or `None` when empty.
    pub fn largest_key(&self) -> Option<&[u8]> {
        self.index.largest_key()
    }

    /// Empties the table: index, shadow and file.
    ///
    /// A live shadow is emptied and kept; a dropped shadow stays dropped.
    pub fn clear(&mut self) -> Result<()> {
        self.file.reset()?;
        self.index.clear();
        if let Some(store) = self.tails.as_mut() {
            store.clear();
        }
        Ok(())
    }

    /// Writes all buffered records to disk and refreshes published stats.
    pub fn flush(&mut self) -> Result<()> {
        self.file.flush()?;
        self.publish_stats();
        Ok(())
    }

    /// Flushes, syncs and closes the table, deregistering it.
    pub fn close(self) -> Result<()> {
        if let Some(registry) = &self.registry {
            registry.deregister(self.file.path());
        }
        self.file.close()
    }

    /// Removes the backing file when the table is closed.
    pub fn delete_on_close(&mut self) {
        self.file.delete_on_close();
    }

    /// True if file, index and shadow agree about the record count.
    pub fn consistency_check(&self) -> bool {
        self.file.len() == self.index.len()
            && self
                .tails
                .as_ref()
                .map_or(true, |store| store.len() == self.index.len())
    }

    /// Estimated bytes of RAM held by the index and shadow.
    pub fn mem(&self) -> u64 {
        self.index.mem() + self.tails.as_ref().map_or(0, TailStore::mem)
    }

    /// Current memory statistics.
    pub fn memory_stats(&self) -> MemoryStats {
        MemoryStats {
            records: self.index.len(),
            key_width: self.schema.key_width(),
            key_mem: self.index.mem(),
            tail_width: self.schema.tail_width(),
            tail_mem: self.tails.as_ref().map_or(0, TailStore::mem),
            tail_shadow: self.tails.is_some(),
        }
    }

    /// Estimated RAM an index over the existing file at `path` would need.
    pub fn required_index_ram<P: AsRef<Path>>(path: P, schema: &RowSchema) -> Result<u64> {
        let records = RecordFile::record_count(path, schema.record_width())?;
        Ok(MIN_MEM_FLOOR + records * (schema.key_width() as u64 + 4) * 3 / 2)
    }

    /// Recomposes the record for `key` at `slot`, from the shadow when
    /// possible, from the file otherwise.
    pub(crate) fn read_row_at(&mut self, key: &[u8], slot: u64) -> Result<Row> {
        if let Some(store) = &self.tails {
            if let Some(tail) = store.get(slot) {
                return self.schema.row_from_parts(key, tail);
            }
        }
        let mut rec = vec![0u8; self.schema.record_width()];
        self.file.get(slot, &mut rec)?;
        self.schema.new_row(&rec)
    }

    /// Vacates `slot` by truncation (last slot) or by relocating the last
    /// record into it. The caller has already removed the vacated record's
    /// key from the index, if it had one.
    pub(crate) fn remove_in_file(&mut self, slot: u64) -> Result<()> {
        debug_assert!(slot < self.file.len());
        let mut rec = vec![0u8; self.schema.record_width()];
        let key_width = self.schema.key_width();
        loop {
            let len = self.file.len();
            if len <= slot {
                break; // the gap itself was truncated away
            }
            if len == slot + 1 {
                // The gap is the last record; truncating it is enough.
                self.file.clean_last()?;
                if let Some(store) = self.tails.as_mut() {
                    store.remove_one();
                }
                break;
            }
            let from = len - 1;
            self.file.clean_last_into(&mut rec)?;
            let moved_tail = self.tails.as_mut().and_then(TailStore::remove_one);
            if !self.schema.wellformed_key(&rec[..key_width]) {
                warn!(
                    "dropping malformed trailing record while compacting {}",
                    self.file.path().display()
                );
                continue; // keep truncating until a usable record appears
            }
            self.file.put(slot, &rec)?;
            self.index.relocate(&rec[..key_width], from, slot);
            if let Some(tail) = moved_tail {
                let failed = match self.tails.as_mut() {
                    Some(store) => store.set(slot, &tail).is_err(),
                    None => false,
                };
                if failed {
                    self.drop_shadow("tail relocation failed");
                }
            }
            break;
        }
        Ok(())
    }

    fn add_unique_inner(&mut self, row: &Row) -> Result<()> {
        let slot = self.file.add(row.bytes())?;
        let failed = match self.tails.as_mut() {
            Some(store) => store.add_unique(row.tail()).is_err(),
            None => false,
        };
        if failed {
            self.drop_shadow("tail append failed");
        }
        self.abandon_shadow_if_low();
        let key = row.key();
        if let Err(err) = self.retry_after_eviction(|table| table.index.put_unique(key, slot)) {
            // Undo the append so the file never holds an unindexed record;
            // the original error is the one worth surfacing.
            let _ = self.file.clean_last();
            if let Some(store) = self.tails.as_mut() {
                store.remove_one();
            }
            return Err(err);
        }
        self.debug_check_sizes();
        Ok(())
    }

    /// Drains duplicate keys from the index, keeps the lowest slot per key
    /// and removes the other slots from the file, largest first.
    fn dedup_index(&mut self) -> Result<Vec<Vec<Row>>> {
        let groups = self.index.remove_doubles();
        if groups.is_empty() {
            return Ok(Vec::new());
        }
        let mut report = Vec::with_capacity(groups.len());
        let mut delpos: BTreeSet<u64> = BTreeSet::new();
        let mut rec = vec![0u8; self.schema.record_width()];
        for (key, slots) in groups {
            let survivor = slots.iter().copied().min().unwrap_or(0);
            let mut rows = Vec::with_capacity(slots.len());
            for &slot in &slots {
                if slot >= self.file.len() {
                    continue; // stale reference, nothing to report
                }
                self.file.get(slot, &mut rec)?;
                rows.push(self.schema.new_row(&rec)?);
            }
            self.index.put_unique(&key, survivor)?;
            delpos.extend(slots.iter().copied().filter(|&slot| slot != survivor));
            report.push(rows);
        }
        // Largest slot first, otherwise relocation would invalidate the
        // remaining slot numbers.
        while let Some(slot) = delpos.pop_last() {
            if slot >= self.file.len() {
                continue;
            }
            self.remove_in_file(slot)?;
        }
        self.debug_check_sizes();
        Ok(report)
    }

    /// Runs `op`; on out-of-capacity with a live shadow, drops the shadow
    /// and runs it once more.
    fn retry_after_eviction<T>(
        &mut self,
        mut op: impl FnMut(&mut Self) -> Result<T>,
    ) -> Result<T> {
        match op(&mut *self) {
            Err(TableError::OutOfCapacity(_)) if self.tails.is_some() => {
                self.drop_shadow("freeing RAM after out-of-capacity");
                op(self)
            }
            other => other,
        }
    }

    /// Drops the shadow when the oracle reports pressure. Returns true if
    /// it was dropped here.
    fn abandon_shadow_if_low(&mut self) -> bool {
        if self.tails.is_some()
            && (self.oracle.short_status() || self.oracle.available() < self.min_mem_remaining)
        {
            self.drop_shadow("available memory below threshold");
            true
        } else {
            false
        }
    }

    fn drop_shadow(&mut self, why: &str) {
        if self.tails.take().is_some() {
            warn!(
                "dropping tail shadow of {}: {}",
                self.file.path().display(),
                why
            );
            self.publish_stats();
        }
    }

    fn validate_row(&self, row: &Row) -> Result<()> {
        if row.bytes().len() != self.schema.record_width() {
            return Err(TableError::RecordWidth {
                expected: self.schema.record_width(),
                got: row.bytes().len(),
            });
        }
        if row.key().len() != self.schema.key_width() {
            return Err(TableError::KeyWidth {
                expected: self.schema.key_width(),
                got: row.key().len(),
            });
        }
        Ok(())
    }

    fn check_loaded_sizes(&self) -> Result<()> {
        if self.file.len() != self.index.len() {
            return Err(TableError::SizeMismatch {
                file_records: self.file.len(),
                index_entries: self.index.len(),
            });
        }
        if let Some(store) = &self.tails {
            if store.len() != self.index.len() {
                return Err(TableError::SizeMismatch {
                    file_records: store.len(),
                    index_entries: self.index.len(),
                });
            }
        }
        Ok(())
    }

    fn publish_stats(&self) {
        if let Some(registry) = &self.registry {
            registry.publish(self.file.path(), self.memory_stats());
        }
    }

    fn debug_check_sizes(&self) {
        debug_assert_eq!(self.file.len(), self.index.len());
        if let Some(store) = &self.tails {
            debug_assert_eq!(store.len(), self.index.len());
        }
    }
}

impl std::fmt::Debug for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Table")
            .field("path", &self.file.path())
            .field("records", &self.index.len())
            .field("tail_shadow", &self.tails.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::FixedMemory;
    use crate::schema::{Column, NaturalOrder};
    use tempfile::TempDir;

    fn schema() -> RowSchema {
        RowSchema::new(
            vec![Column::new("key", 4), Column::new("value", 4)],
            NaturalOrder,
        )
    }

    fn open(dir: &TempDir, config: TableConfig) -> Table {
        Table::open(dir.path().join("t.tbl"), schema(), config).unwrap()
    }

    fn row(table: &Table, key: &[u8], value: &[u8]) -> Row {
        table.schema().row_from_parts(key, value).unwrap()
    }

    #[test]
    fn test_insert_and_lookup() {
        let dir = TempDir::new().unwrap();
        let mut t = open(&dir, TableConfig::default());
        let a = row(&t, b"AAAA", b"AAAA");
        let b = row(&t, b"BBBB", b"BBBB");
        assert!(t.put(&a).unwrap());
        assert!(t.put(&b).unwrap());
        assert_eq!(t.len(), 2);
        assert_eq!(t.get(b"AAAA").unwrap().unwrap().tail(), b"AAAA");
        assert_eq!(t.get(b"ZZZZ").unwrap(), None);
        assert!(t.has(b"BBBB"));
        assert!(t.consistency_check());
    }

    #[test]
    fn test_put_overwrites_in_place() {
        let dir = TempDir::new().unwrap();
        let mut t = open(&dir, TableConfig::default());
        t.put(&row(&t, b"AAAA", b"AAAA")).unwrap();
        t.put(&row(&t, b"BBBB", b"BBBB")).unwrap();
        assert!(!t.put(&row(&t, b"AAAA", b"ZZZZ")).unwrap());
        assert_eq!(t.len(), 2);
        assert_eq!(t.get(b"AAAA").unwrap().unwrap().tail(), b"ZZZZ");
    }

    #[test]
    fn test_replace_returns_previous() {
        let dir = TempDir::new().unwrap();
        let mut t = open(&dir, TableConfig::default());
        assert_eq!(t.replace(&row(&t, b"AAAA", b"1111")).unwrap(), None);
        let prev = t.replace(&row(&t, b"AAAA", b"2222")).unwrap().unwrap();
        assert_eq!(prev.tail(), b"1111");
        assert_eq!(t.get(b"AAAA").unwrap().unwrap().tail(), b"2222");
    }

    #[test]
    fn test_swap_on_delete_relocates_last() {
        let dir = TempDir::new().unwrap();
        let mut t = open(&dir, TableConfig::default());
        for key in [b"AAAA", b"BBBB", b"CCCC", b"DDDD"] {
            t.put(&row(&t, key, key)).unwrap();
        }
        let removed = t.remove(b"BBBB").unwrap().unwrap();
        assert_eq!(removed.tail(), b"BBBB");
        assert_eq!(t.len(), 3);
        assert_eq!(t.get(b"BBBB").unwrap(), None);
        // Slot 1 now holds the record formerly at slot 3.
        let mut rec = vec![0u8; 8];
        t.file.get(1, &mut rec).unwrap();
        assert_eq!(&rec[..4], b"DDDD");
        for key in [b"AAAA", b"CCCC", b"DDDD"] {
            assert_eq!(t.get(key).unwrap().unwrap().tail(), key);
        }
        assert!(t.consistency_check());
    }

    #[test]
    fn test_remove_one_pops_last_slot() {
        let dir = TempDir::new().unwrap();
        let mut t = open(&dir, TableConfig::default());
        t.put(&row(&t, b"AAAA", b"1111")).unwrap();
        t.put(&row(&t, b"BBBB", b"2222")).unwrap();
        let popped = t.remove_one().unwrap().unwrap();
        assert_eq!(popped.key(), b"BBBB");
        assert_eq!(t.len(), 1);
        assert_eq!(t.remove_one().unwrap().unwrap().key(), b"AAAA");
        assert_eq!(t.remove_one().unwrap(), None);
    }

    #[test]
    fn test_top_returns_reverse_physical_order() {
        let dir = TempDir::new().unwrap();
        let mut t = open(&dir, TableConfig::default());
        for key in [b"AAAA", b"BBBB", b"CCCC"] {
            t.put(&row(&t, key, key)).unwrap();
        }
        let top = t.top(2).unwrap();
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].key(), b"CCCC");
        assert_eq!(top[1].key(), b"BBBB");
        assert_eq!(t.top(10).unwrap().len(), 3);
    }

    #[test]
    fn test_clear_keeps_live_shadow_only() {
        let dir = TempDir::new().unwrap();
        let mut t = open(&dir, TableConfig::default());
        let had_shadow = t.uses_tail_shadow();
        t.put(&row(&t, b"AAAA", b"1111")).unwrap();
        t.clear().unwrap();
        assert!(t.is_empty());
        assert_eq!(t.uses_tail_shadow(), had_shadow);
        assert_eq!(t.get(b"AAAA").unwrap(), None);
        t.put(&row(&t, b"BBBB", b"2222")).unwrap();
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn test_no_shadow_under_tight_memory() {
        let dir = TempDir::new().unwrap();
        let config = TableConfig::default().with_oracle(Arc::new(FixedMemory::new(0)));
        let mut t = open(&dir, config);
        assert!(!t.uses_tail_shadow());
        t.put(&row(&t, b"AAAA", b"1111")).unwrap();
        assert_eq!(t.get(b"AAAA").unwrap().unwrap().tail(), b"1111");
    }

    #[test]
    fn test_index_capacity_drops_shadow_then_surfaces() {
        let dir = TempDir::new().unwrap();
        let config = TableConfig::default()
            .with_oracle(Arc::new(FixedMemory::new(u64::MAX / 4)))
            .with_index_capacity_limit(2);
        let mut t = open(&dir, config);
        assert!(t.uses_tail_shadow());
        t.put(&row(&t, b"AAAA", b"1111")).unwrap();
        t.put(&row(&t, b"BBBB", b"2222")).unwrap();
        // Third distinct key exceeds the cap: the shadow is sacrificed and
        // the insert retried, which still fails, so the error surfaces.
        let err = t.put(&row(&t, b"CCCC", b"3333")).unwrap_err();
        assert!(matches!(err, TableError::OutOfCapacity("key index")));
        assert!(!t.uses_tail_shadow());
        // The failed insert left no partial state behind.
        assert_eq!(t.len(), 2);
        assert!(t.consistency_check());
    }

    #[test]
    fn test_smallest_and_largest_key() {
        let dir = TempDir::new().unwrap();
        let mut t = open(&dir, TableConfig::default());
        assert_eq!(t.smallest_key(), None);
        for key in [b"MMMM", b"AAAA", b"ZZZZ"] {
            t.put(&row(&t, key, key)).unwrap();
        }
        assert_eq!(t.smallest_key(), Some(&b"AAAA"[..]));
        assert_eq!(t.largest_key(), Some(&b"ZZZZ"[..]));
    }

    #[test]
    fn test_get_batch() {
        let dir = TempDir::new().unwrap();
        let mut t = open(&dir, TableConfig::default());
        for key in [b"AAAA", b"BBBB", b"CCCC"] {
            t.put(&row(&t, key, key)).unwrap();
        }
        let found = t.get_batch(&[b"AAAA", b"XXXX", b"CCCC"]).unwrap();
        assert_eq!(found.len(), 2);
        assert!(found.contains_key(&b"AAAA"[..]));
        assert!(!found.contains_key(&b"XXXX"[..]));
    }

    #[test]
    fn test_registry_lifecycle() {
        let dir = TempDir::new().unwrap();
        let registry = Registry::new();
        let path = dir.path().join("t.tbl");
        let mut t = Table::open(
            &path,
            schema(),
            TableConfig::default().with_registry(registry.clone()),
        )
        .unwrap();
        assert_eq!(registry.filenames(), vec![path.clone()]);
        t.put(&t.schema().row_from_parts(b"AAAA", b"1111").unwrap())
            .unwrap();
        t.flush().unwrap();
        let stats = registry.memory_stats(&path).unwrap();
        assert_eq!(stats.records, 1);
        assert_eq!(stats.key_width, 4);
        t.close().unwrap();
        assert!(registry.filenames().is_empty());
    }
}
