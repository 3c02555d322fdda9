//! Caller-scoped registry of open tables.
//!
//! A [`Registry`] is an explicit, cloneable handle; every clone shares the
//! same underlying map. Pass it to tables through their configuration to
//! make them discoverable for introspection. Tables publish a
//! [`MemoryStats`] snapshot on open, flush and close, and deregister
//! themselves when closed.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

/// Memory statistics published by a table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemoryStats {
    /// Number of records in the table.
    pub records: u64,
    /// Key width in bytes.
    pub key_width: usize,
    /// Estimated RAM held by the key index.
    pub key_mem: u64,
    /// Tail width in bytes.
    pub tail_width: usize,
    /// RAM held by the tail shadow, zero when dropped.
    pub tail_mem: u64,
    /// True while the tail shadow is live.
    pub tail_shadow: bool,
}

/// Shared registry of open tables, keyed by file path.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    inner: Arc<Mutex<BTreeMap<PathBuf, MemoryStats>>>,
}

impl Registry {
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Paths of all currently registered tables.
    pub fn filenames(&self) -> Vec<PathBuf> {
        let map = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        map.keys().cloned().collect()
    }

    /// Latest stats snapshot published for the table at `path`.
    pub fn memory_stats(&self, path: &Path) -> Option<MemoryStats> {
        let map = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        map.get(path).cloned()
    }

    pub(crate) fn publish(&self, path: &Path, stats: MemoryStats) {
        let mut map = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        map.insert(path.to_path_buf(), stats);
    }

    pub(crate) fn deregister(&self, path: &Path) {
        let mut map = self.inner.lock().unwrap_or_else(|err| err.into_inner());
        map.remove(path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publish_and_deregister() {
        let registry = Registry::new();
        let path = Path::new("/tmp/t.tbl");
        assert!(registry.filenames().is_empty());

        let stats = MemoryStats {
            records: 3,
            key_width: 4,
            key_mem: 128,
            tail_width: 4,
            tail_mem: 12,
            tail_shadow: true,
        };
        registry.publish(path, stats.clone());
        assert_eq!(registry.filenames(), vec![path.to_path_buf()]);
        assert_eq!(registry.memory_stats(path), Some(stats));

        registry.deregister(path);
        assert!(registry.filenames().is_empty());
        assert_eq!(registry.memory_stats(path), None);
    }

    #[test]
    fn test_clones_share_state() {
        let a = Registry::new();
        let b = a.clone();
        a.publish(Path::new("x"), MemoryStats::default());
        assert_eq!(b.filenames().len(), 1);
    }
}
