//! Key and row iterators over a table.
//!
//! All three iterators work on a snapshot of the index taken when the
//! iterator is created; records themselves are reconstructed lazily on each
//! `next`, from the tail shadow when it is live. The row iterators hold the
//! table mutably for their lifetime, so the table cannot change under them
//! except through the iterator itself.

use super::Table;
use crate::error::{Result, TableError};
use crate::schema::Row;

/// Iterator over keys in order, produced by [`Table::keys`].
#[derive(Debug, Clone)]
pub struct Keys {
    keys: Vec<Box<[u8]>>,
    pos: usize,
}

impl Keys {
    pub(crate) fn new(keys: Vec<Box<[u8]>>) -> Self {
        Self { keys, pos: 0 }
    }

    /// A fresh iterator over the same key snapshot, starting from the top.
    pub fn restarted(&self) -> Keys {
        Keys {
            keys: self.keys.clone(),
            pos: 0,
        }
    }
}

impl Iterator for Keys {
    type Item = Box<[u8]>;

    fn next(&mut self) -> Option<Self::Item> {
        let key = self.keys.get(self.pos)?.clone();
        self.pos += 1;
        Some(key)
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let rest = self.keys.len() - self.pos;
        (rest, Some(rest))
    }
}

/// Record iterator in index order, produced by [`Table::rows`].
///
/// Supports removing the record last returned. Iterating further after a
/// removal is undefined with respect to ordering: the removal relocates the
/// last physical record, so remove only as the final action before
/// discarding the iterator, or call [`Rows::restart`] afterwards.
#[derive(Debug)]
pub struct Rows<'t> {
    table: &'t mut Table,
    entries: Vec<(Box<[u8]>, u64)>,
    pos: usize,
    current: Option<usize>,
}

impl<'t> Rows<'t> {
    pub(crate) fn new(table: &'t mut Table) -> Self {
        let entries = table.index.entries();
        Self {
            table,
            entries,
            pos: 0,
            current: None,
        }
    }

    /// Removes the record last returned by `next`, by key.
    pub fn remove_current(&mut self) -> Result<Option<Row>> {
        let Some(current) = self.current.take() else {
            return Ok(None);
        };
        let key = self.entries[current].0.clone();
        self.table.remove(&key)
    }

    /// Re-snapshots the index and starts over.
    pub fn restart(&mut self) {
        self.entries = self.table.index.entries();
        self.pos = 0;
        self.current = None;
    }
}

impl Iterator for Rows<'_> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        while self.pos < self.entries.len() {
            let idx = self.pos;
            self.pos += 1;
            let key = self.entries[idx].0.clone();
            match self.table.get(&key) {
                Ok(Some(row)) => {
                    self.current = Some(idx);
                    return Some(Ok(row));
                }
                Ok(None) => continue, // key removed since the snapshot
                Err(err) => {
                    self.pos = self.entries.len();
                    return Some(Err(err));
                }
            }
        }
        None
    }
}

/// Record iterator ordered by key, produced by [`Table::rows_ordered`].
///
/// Does not support removal. When a snapshotted key no longer resolves to a
/// slot, the iterator yields [`TableError::ConcurrentModification`] and
/// becomes unusable.
#[derive(Debug)]
pub struct OrderedRows<'t> {
    table: &'t mut Table,
    keys: Vec<Box<[u8]>>,
    ascending: bool,
    start: Option<Box<[u8]>>,
    pos: usize,
    poisoned: bool,
}

impl<'t> OrderedRows<'t> {
    pub(crate) fn new(table: &'t mut Table, ascending: bool, start_key: Option<&[u8]>) -> Self {
        let keys = table.index.ordered_keys(ascending, start_key);
        Self {
            table,
            keys,
            ascending,
            start: start_key.map(Into::into),
            pos: 0,
            poisoned: false,
        }
    }

    /// Re-snapshots the keys with the original direction and start key.
    pub fn restart(&mut self) {
        self.keys = self
            .table
            .index
            .ordered_keys(self.ascending, self.start.as_deref());
        self.pos = 0;
        self.poisoned = false;
    }
}

impl Iterator for OrderedRows<'_> {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.poisoned || self.pos >= self.keys.len() {
            return None;
        }
        let key = self.keys[self.pos].clone();
        self.pos += 1;
        match self.table.index.get(&key) {
            None => {
                self.poisoned = true;
                Some(Err(TableError::ConcurrentModification))
            }
            Some(slot) => match self.table.read_row_at(&key, slot) {
                Ok(row) => Some(Ok(row)),
                Err(err) => {
                    self.poisoned = true;
                    Some(Err(err))
                }
            },
        }
    }
}
