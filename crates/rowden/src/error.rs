//! Error and Result types for table operations.

use std::io;
use thiserror::Error;

/// A convenience `Result` type for table operations.
pub type Result<T> = std::result::Result<T, TableError>;

/// The error type for table operations.
///
/// Absence of a key is never an error; lookup operations return `Option`.
#[derive(Debug, Error)]
pub enum TableError {
    /// An in-RAM structure cannot grow any further.
    ///
    /// Raised by the key index or the tail store when a write would exceed
    /// their capacity. The table reacts by dropping the tail shadow and
    /// retrying once; it only surfaces when no shadow is left to sacrifice.
    #[error("out of capacity growing the {0}")]
    OutOfCapacity(&'static str),

    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// The file length is not a multiple of the record width.
    #[error("broken table file {path}: length {len} is not a multiple of record width {record_width}")]
    BrokenLength {
        /// Path of the damaged file.
        path: String,
        /// Observed file length in bytes.
        len: u64,
        /// Record width the schema prescribes.
        record_width: usize,
    },

    /// File and index disagree about the record count after a load.
    #[error("corrupt table state: file holds {file_records} records, index holds {index_entries}")]
    SizeMismatch {
        /// Records physically present in the file.
        file_records: u64,
        /// Entries held by the key index.
        index_entries: u64,
    },

    /// The table was modified while an ordered iteration was in progress.
    #[error("table modified during ordered iteration")]
    ConcurrentModification,

    /// A key argument does not match the schema's key width.
    #[error("key is {got} bytes, schema expects {expected}")]
    KeyWidth {
        /// Key width defined by the schema.
        expected: usize,
        /// Width of the offending key.
        got: usize,
    },

    /// A record argument does not match the schema's record width.
    #[error("record is {got} bytes, schema expects {expected}")]
    RecordWidth {
        /// Record width defined by the schema.
        expected: usize,
        /// Width of the offending record.
        got: usize,
    },

    /// A slot number beyond the current record range.
    #[error("slot {slot} out of range, table holds {len} records")]
    SlotRange {
        /// The requested slot.
        slot: u64,
        /// Current record count.
        len: u64,
    },
}
