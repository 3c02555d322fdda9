//! In-RAM primary-key index: key → slot.
//!
//! The index is the one structure the table cannot run without. It normally
//! maps each key to exactly one slot; during recovery [`KeyIndex::put_unique`]
//! may accumulate several slots under one key, and
//! [`KeyIndex::remove_doubles`] hands the duplicate groups back for physical
//! cleanup. Keys iterate in lexicographic order on unsigned bytes.

use crate::error::{Result, TableError};
use std::collections::BTreeMap;
use std::ops::Bound;

/// Map from primary key to slot number(s).
#[derive(Debug)]
pub struct KeyIndex {
    key_width: usize,
    entries: BTreeMap<Box<[u8]>, Vec<u64>>,
    len: u64,
    capacity_limit: Option<u64>,
}

impl KeyIndex {
    /// Creates an empty index for keys of `key_width` bytes.
    pub fn new(key_width: usize) -> Self {
        Self {
            key_width,
            entries: BTreeMap::new(),
            len: 0,
            capacity_limit: None,
        }
    }

    /// Caps the index at `entries` distinct keys; growth past the cap
    /// reports [`TableError::OutOfCapacity`]. Used by tests and embedders
    /// that budget index memory themselves.
    pub fn with_capacity_limit(mut self, entries: u64) -> Self {
        self.capacity_limit = Some(entries);
        self
    }

    /// Total slots held, duplicate slots included.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// True if the index holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of distinct keys.
    pub fn key_count(&self) -> u64 {
        self.entries.len() as u64
    }

    /// The slot mapped to `key`, or `None`.
    pub fn get(&self, key: &[u8]) -> Option<u64> {
        self.entries.get(key).and_then(|slots| slots.first().copied())
    }

    /// True if `key` is present.
    pub fn has(&self, key: &[u8]) -> bool {
        self.entries.contains_key(key)
    }

    /// Maps `key` to `slot`, replacing any prior mapping.
    ///
    /// Returns the prior slot when the key was already present.
    pub fn put(&mut self, key: &[u8], slot: u64) -> Result<Option<u64>> {
        debug_assert_eq!(key.len(), self.key_width);
        if let Some(slots) = self.entries.get_mut(key) {
            let prior = slots.first().copied();
            self.len -= slots.len() as u64 - 1;
            *slots = vec![slot];
            Ok(prior)
        } else {
            self.check_growth()?;
            self.entries.insert(key.into(), vec![slot]);
            self.len += 1;
            Ok(None)
        }
    }

    /// Inserts `(key, slot)` without replacing; duplicate keys accumulate.
    ///
    /// Only the recovery scan uses the duplicate-accumulating behavior;
    /// duplicates must be drained with [`KeyIndex::remove_doubles`] before
    /// normal operation.
    pub fn put_unique(&mut self, key: &[u8], slot: u64) -> Result<()> {
        debug_assert_eq!(key.len(), self.key_width);
        if let Some(slots) = self.entries.get_mut(key) {
            slots.push(slot);
        } else {
            self.check_growth()?;
            self.entries.insert(key.into(), vec![slot]);
        }
        self.len += 1;
        Ok(())
    }

    /// Rewrites one `key → from` mapping to `key → to`.
    ///
    /// Used when a record is physically relocated: unlike
    /// [`KeyIndex::put`] this touches a single slot, so duplicate slots
    /// still awaiting cleanup survive untouched. A missing mapping is
    /// (re)created.
    pub fn relocate(&mut self, key: &[u8], from: u64, to: u64) {
        debug_assert_eq!(key.len(), self.key_width);
        match self.entries.get_mut(key) {
            Some(slots) => {
                match slots.iter_mut().find(|slot| **slot == from) {
                    Some(slot) => *slot = to,
                    None => {
                        slots.push(to);
                        self.len += 1;
                    }
                }
            }
            None => {
                self.entries.insert(key.into(), vec![to]);
                self.len += 1;
            }
        }
    }

    /// Removes `key`, returning its slot when present.
    pub fn remove(&mut self, key: &[u8]) -> Option<u64> {
        let slots = self.entries.remove(key)?;
        self.len -= slots.len() as u64;
        slots.first().copied()
    }

    /// Removes every key that maps to more than one slot and returns the
    /// groups as `(key, slots)` pairs, slots in insertion order.
    pub fn remove_doubles(&mut self) -> Vec<(Box<[u8]>, Vec<u64>)> {
        let dup_keys: Vec<Box<[u8]>> = self
            .entries
            .iter()
            .filter(|(_, slots)| slots.len() > 1)
            .map(|(key, _)| key.clone())
            .collect();
        let mut groups = Vec::with_capacity(dup_keys.len());
        for key in dup_keys {
            if let Some(slots) = self.entries.remove(&key) {
                self.len -= slots.len() as u64;
                groups.push((key, slots));
            }
        }
        groups
    }

    /// Keys in order, optionally starting at `start` (inclusive).
    pub fn ordered_keys(&self, ascending: bool, start: Option<&[u8]>) -> Vec<Box<[u8]>> {
        match (ascending, start) {
            (true, None) => self.entries.keys().cloned().collect(),
            (true, Some(s)) => self
                .entries
                .range::<[u8], _>((Bound::Included(s), Bound::Unbounded))
                .map(|(key, _)| key.clone())
                .collect(),
            (false, None) => self.entries.keys().rev().cloned().collect(),
            (false, Some(s)) => self
                .entries
                .range::<[u8], _>((Bound::Unbounded, Bound::Included(s)))
                .rev()
                .map(|(key, _)| key.clone())
                .collect(),
        }
    }

    /// All `(key, slot)` pairs in key order, duplicates flattened.
    pub fn entries(&self) -> Vec<(Box<[u8]>, u64)> {
        self.entries
            .iter()
            .flat_map(|(key, slots)| slots.iter().map(move |&slot| (key.clone(), slot)))
            .collect()
    }

    /// The smallest key, or `None` when empty.
    pub fn smallest_key(&self) -> Option<&[u8]> {
        self.entries.keys().next().map(|key| &**key)
    }

    /// The largest key, or `None` when empty.
    pub fn largest_key(&self) -> Option<&[u8]> {
        self.entries.keys().next_back().map(|key| &**key)
    }

    /// Drops all entries.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.len = 0;
    }

    /// Estimated bytes of RAM held by the index.
    ///
    /// Counts key bytes, the slot vector and fixed per-node overhead; the
    /// estimate feeds stats reporting, not allocation decisions.
    pub fn mem(&self) -> u64 {
        self.entries.len() as u64 * (self.key_width as u64 + 56) + self.len * 8
    }

    fn check_growth(&self) -> Result<()> {
        if let Some(limit) = self.capacity_limit {
            if self.entries.len() as u64 >= limit {
                return Err(TableError::OutOfCapacity("key index"));
            }
        }
        Ok(())
    }
}
