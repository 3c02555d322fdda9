//! Flat file of fixed-width records with a write-behind buffer.
//!
//! The file is a bare sequence of `N` records of `R` bytes each: no header,
//! no tombstones, no version word. Record `i` occupies byte range
//! `[i*R, (i+1)*R)`. Writes collect in a slot-keyed buffer and reach the
//! disk in batches; reads consult the buffer first, so the buffered view is
//! always authoritative. A file length that is not a multiple of `R` is
//! corruption and is repaired by truncating to the largest multiple.

use crate::error::{Result, TableError};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Fixed-record file with buffered random writes.
#[derive(Debug)]
pub struct RecordFile {
    file: File,
    path: PathBuf,
    record_width: usize,
    /// Records physically on disk.
    disk_records: u64,
    /// Logical record count, buffered appends included.
    len: u64,
    buffer: BTreeMap<u64, Box<[u8]>>,
    buffer_limit: usize,
    delete_on_close: bool,
}

impl RecordFile {
    /// Opens (creating if absent) the record file at `path`.
    ///
    /// A trailing partial record is truncated away here; `buffer_limit` is
    /// the number of records the write-behind buffer holds before a forced
    /// flush.
    pub fn open<P: AsRef<Path>>(path: P, record_width: usize, buffer_limit: usize) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        let len = file.metadata()?.len();
        let rem = len % record_width as u64;
        let disk_records = if rem != 0 {
            warn!(
                "table file {} length {} is not a multiple of {}; truncating {} trailing bytes",
                path.display(),
                len,
                record_width,
                rem
            );
            file.set_len(len - rem)?;
            (len - rem) / record_width as u64
        } else {
            len / record_width as u64
        };
        Ok(Self {
            file,
            path,
            record_width,
            disk_records,
            len: disk_records,
            buffer: BTreeMap::new(),
            buffer_limit: buffer_limit.max(1),
            delete_on_close: false,
        })
    }

    /// Record count of the file at `path` without opening a table.
    ///
    /// Errors with [`TableError::BrokenLength`] when the length is not a
    /// multiple of `record_width`.
    pub fn record_count<P: AsRef<Path>>(path: P, record_width: usize) -> Result<u64> {
        let path = path.as_ref();
        let len = fs::metadata(path)?.len();
        if len % record_width as u64 != 0 {
            return Err(TableError::BrokenLength {
                path: path.display().to_string(),
                len,
                record_width,
            });
        }
        Ok(len / record_width as u64)
    }

    /// Truncates the file at `path` to the largest record multiple and
    /// returns the resulting record count.
    pub fn repair_size<P: AsRef<Path>>(path: P, record_width: usize) -> Result<u64> {
        let path = path.as_ref();
        let file = OpenOptions::new().write(true).open(path)?;
        let len = file.metadata()?.len();
        let fixed = len - len % record_width as u64;
        if fixed != len {
            warn!(
                "repairing {}: truncating from {} to {} bytes",
                path.display(),
                len,
                fixed
            );
            file.set_len(fixed)?;
        }
        Ok(fixed / record_width as u64)
    }

    /// Logical record count.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// True if the file holds no records.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Record width in bytes.
    pub fn record_width(&self) -> usize {
        self.record_width
    }

    /// Path of the backing file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Reads the record at `slot` into `buf`.
    pub fn get(&mut self, slot: u64, buf: &mut [u8]) -> Result<()> {
        debug_assert_eq!(buf.len(), self.record_width);
        if slot >= self.len {
            return Err(TableError::SlotRange {
                slot,
                len: self.len,
            });
        }
        if let Some(rec) = self.buffer.get(&slot) {
            buf.copy_from_slice(rec);
            return Ok(());
        }
        debug_assert!(slot < self.disk_records);
        self.file
            .seek(SeekFrom::Start(slot * self.record_width as u64))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    /// Overwrites the record at `slot`. Appends go through [`RecordFile::add`].
    pub fn put(&mut self, slot: u64, rec: &[u8]) -> Result<()> {
        debug_assert_eq!(rec.len(), self.record_width);
        if slot >= self.len {
            return Err(TableError::SlotRange {
                slot,
                len: self.len,
            });
        }
        self.buffer.insert(slot, rec.into());
        self.flush_if_full()
    }

    /// Appends a record, returning its slot.
    pub fn add(&mut self, rec: &[u8]) -> Result<u64> {
        debug_assert_eq!(rec.len(), self.record_width);
        let slot = self.len;
        self.buffer.insert(slot, rec.into());
        self.len += 1;
        self.flush_if_full()?;
        Ok(slot)
    }

    /// Drops the last record without reading it. No-op on an empty file.
    pub fn clean_last(&mut self) -> Result<()> {
        if self.len == 0 {
            return Ok(());
        }
        let last = self.len - 1;
        self.buffer.remove(&last);
        self.len = last;
        self.shrink_disk()
    }

    /// Reads the last record into `buf`, then drops it.
    ///
    /// Returns `false` when the file is empty.
    pub fn clean_last_into(&mut self, buf: &mut [u8]) -> Result<bool> {
        debug_assert_eq!(buf.len(), self.record_width);
        if self.len == 0 {
            return Ok(false);
        }
        let last = self.len - 1;
        if let Some(rec) = self.buffer.remove(&last) {
            buf.copy_from_slice(&rec);
        } else {
            self.file
                .seek(SeekFrom::Start(last * self.record_width as u64))?;
            self.file.read_exact(buf)?;
        }
        self.len = last;
        self.shrink_disk()?;
        Ok(true)
    }

    /// Writes all buffered records to disk.
    ///
    /// Records leave the buffer only once persisted, so a write error
    /// partway through keeps the unwritten remainder buffered and reads
    /// stay consistent.
    pub fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        let count = self.buffer.len();
        while let Some((&slot, rec)) = self.buffer.first_key_value() {
            self.file
                .seek(SeekFrom::Start(slot * self.record_width as u64))?;
            self.file.write_all(rec)?;
            self.disk_records = self.disk_records.max(slot + 1);
            self.buffer.remove(&slot);
        }
        debug!("flushed {} buffered records to {}", count, self.path.display());
        Ok(())
    }

    /// Discards all records, buffered and on disk, leaving an empty file.
    pub fn reset(&mut self) -> Result<()> {
        self.buffer.clear();
        self.file.set_len(0)?;
        self.disk_records = 0;
        self.len = 0;
        Ok(())
    }

    /// Marks the backing file for removal when the file is closed.
    pub fn delete_on_close(&mut self) {
        self.delete_on_close = true;
    }

    /// Flushes, syncs and closes the file, removing it when marked.
    pub fn close(mut self) -> Result<()> {
        self.flush()?;
        self.file.sync_all()?;
        if self.delete_on_close {
            fs::remove_file(&self.path)?;
        }
        Ok(())
    }

    /// Sequential scan yielding the first `prefix_width` bytes of every
    /// record in slot order. Pass the record width to scan full records.
    pub fn scan_prefixes(&mut self, prefix_width: usize) -> Result<PrefixScan> {
        debug_assert!(prefix_width <= self.record_width);
        self.flush()?;
        let mut reader = BufReader::with_capacity(64 * 1024, self.file.try_clone()?);
        reader.seek(SeekFrom::Start(0))?;
        Ok(PrefixScan {
            reader,
            record_width: self.record_width,
            prefix_width,
            remaining: self.len,
        })
    }

    fn flush_if_full(&mut self) -> Result<()> {
        if self.buffer.len() >= self.buffer_limit {
            self.flush()?;
        }
        Ok(())
    }

    /// Truncates the disk image after the logical length shrank.
    fn shrink_disk(&mut self) -> Result<()> {
        if self.disk_records > self.len {
            self.file.set_len(self.len * self.record_width as u64)?;
            self.disk_records = self.len;
        }
        Ok(())
    }
}

impl Drop for RecordFile {
    fn drop(&mut self) {
        if !self.buffer.is_empty() {
            if let Err(err) = self.flush() {
                warn!("failed to flush {} on drop: {:?}", self.path.display(), err);
            }
        }
    }
}

/// Iterator over record prefixes, produced by [`RecordFile::scan_prefixes`].
#[derive(Debug)]
pub struct PrefixScan {
    reader: BufReader<File>,
    record_width: usize,
    prefix_width: usize,
    remaining: u64,
}

impl Iterator for PrefixScan {
    type Item = Result<Box<[u8]>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.remaining == 0 {
            return None;
        }
        self.remaining -= 1;
        let mut prefix = vec![0u8; self.prefix_width];
        if let Err(err) = self.reader.read_exact(&mut prefix) {
            self.remaining = 0;
            return Some(Err(err.into()));
        }
        let skip = (self.record_width - self.prefix_width) as i64;
        if skip > 0 {
            if let Err(err) = self.reader.seek_relative(skip) {
                self.remaining = 0;
                return Some(Err(err.into()));
            }
        }
        Some(Ok(prefix.into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &TempDir, buffer_limit: usize) -> RecordFile {
        RecordFile::open(dir.path().join("t.tbl"), 8, buffer_limit).unwrap()
    }

    #[test]
    fn test_add_get_put() {
        let dir = TempDir::new().unwrap();
        let mut f = open(&dir, 4);
        assert_eq!(f.add(b"AAAAaaaa").unwrap(), 0);
        assert_eq!(f.add(b"BBBBbbbb").unwrap(), 1);
        assert_eq!(f.len(), 2);

        let mut buf = [0u8; 8];
        f.get(0, &mut buf).unwrap();
        assert_eq!(&buf, b"AAAAaaaa");

        f.put(0, b"AAAAzzzz").unwrap();
        f.get(0, &mut buf).unwrap();
        assert_eq!(&buf, b"AAAAzzzz");

        assert!(matches!(
            f.get(2, &mut buf),
            Err(TableError::SlotRange { slot: 2, len: 2 })
        ));
    }

    #[test]
    fn test_buffer_flush_and_reopen() {
        let dir = TempDir::new().unwrap();
        {
            let mut f = open(&dir, 100);
            f.add(b"AAAAaaaa").unwrap();
            f.add(b"BBBBbbbb").unwrap();
            f.close().unwrap();
        }
        let mut f = open(&dir, 100);
        assert_eq!(f.len(), 2);
        let mut buf = [0u8; 8];
        f.get(1, &mut buf).unwrap();
        assert_eq!(&buf, b"BBBBbbbb");
    }

    #[test]
    fn test_forced_flush_at_limit() {
        let dir = TempDir::new().unwrap();
        let mut f = open(&dir, 2);
        f.add(b"AAAAaaaa").unwrap();
        f.add(b"BBBBbbbb").unwrap();
        // Limit reached; records must be on disk even without close().
        assert_eq!(
            fs::metadata(dir.path().join("t.tbl")).unwrap().len(),
            16
        );
    }

    #[test]
    fn test_clean_last() {
        let dir = TempDir::new().unwrap();
        let mut f = open(&dir, 1);
        f.add(b"AAAAaaaa").unwrap();
        f.add(b"BBBBbbbb").unwrap();

        let mut buf = [0u8; 8];
        assert!(f.clean_last_into(&mut buf).unwrap());
        assert_eq!(&buf, b"BBBBbbbb");
        assert_eq!(f.len(), 1);

        f.clean_last().unwrap();
        assert!(f.is_empty());
        assert!(!f.clean_last_into(&mut buf).unwrap());
        assert_eq!(fs::metadata(dir.path().join("t.tbl")).unwrap().len(), 0);
    }

    #[test]
    fn test_buffered_clean_last() {
        let dir = TempDir::new().unwrap();
        let mut f = open(&dir, 100);
        f.add(b"AAAAaaaa").unwrap();
        f.add(b"BBBBbbbb").unwrap();
        let mut buf = [0u8; 8];
        assert!(f.clean_last_into(&mut buf).unwrap());
        assert_eq!(&buf, b"BBBBbbbb");
        f.flush().unwrap();
        assert_eq!(fs::metadata(dir.path().join("t.tbl")).unwrap().len(), 8);
    }

    #[test]
    fn test_partial_trailing_record_is_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.tbl");
        fs::write(&path, b"AAAAaaaaBBB").unwrap();
        let f = RecordFile::open(&path, 8, 4).unwrap();
        assert_eq!(f.len(), 1);
        assert_eq!(fs::metadata(&path).unwrap().len(), 8);
    }

    #[test]
    fn test_record_count_and_repair() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.tbl");
        fs::write(&path, b"AAAAaaaaBBB").unwrap();
        assert!(matches!(
            RecordFile::record_count(&path, 8),
            Err(TableError::BrokenLength { len: 11, .. })
        ));
        assert_eq!(RecordFile::repair_size(&path, 8).unwrap(), 1);
        assert_eq!(RecordFile::record_count(&path, 8).unwrap(), 1);
    }

    #[test]
    fn test_scan_prefixes() {
        let dir = TempDir::new().unwrap();
        let mut f = open(&dir, 100);
        f.add(b"AAAAaaaa").unwrap();
        f.add(b"BBBBbbbb").unwrap();
        f.add(b"CCCCcccc").unwrap();

        let keys: Vec<_> = f.scan_prefixes(4).unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(keys.len(), 3);
        assert_eq!(&*keys[0], b"AAAA");
        assert_eq!(&*keys[2], b"CCCC");

        let full: Vec<_> = f.scan_prefixes(8).unwrap().map(|r| r.unwrap()).collect();
        assert_eq!(&*full[1], b"BBBBbbbb");
    }

    #[test]
    fn test_delete_on_close() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("t.tbl");
        let mut f = RecordFile::open(&path, 8, 4).unwrap();
        f.add(b"AAAAaaaa").unwrap();
        f.delete_on_close();
        f.close().unwrap();
        assert!(!path.exists());
    }
}
