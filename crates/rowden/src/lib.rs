//! Rowden - embedded fixed-record primary-key table.
//!
//! This crate provides a persistent associative container mapping a
//! fixed-width primary key to a fixed-width payload, backed by one flat
//! file of equal-sized records.
//!
//! # Components
//!
//! - [`Table`]: the key→record store, composed of a record file, an in-RAM
//!   key index and an optional in-RAM shadow of the record tails
//! - [`RowSchema`] / [`Row`]: fixed-width column layout and raw record view
//! - [`MemoryOracle`]: pluggable memory accounting that drives the
//!   tail-shadow eviction policy
//! - [`Registry`]: optional introspection over the open tables of a process
//!
//! # Example
//!
//! ```rust,ignore
//! use rowden::{Column, NaturalOrder, RowSchema, Table, TableConfig};
//!
//! let schema = RowSchema::new(
//!     vec![Column::new("key", 12), Column::new("payload", 52)],
//!     NaturalOrder,
//! );
//! let mut table = Table::open("urls.tbl", schema, TableConfig::default())?;
//!
//! let row = table.schema().row_from_parts(key, payload)?;
//! table.put(&row)?;
//!
//! if let Some(found) = table.get(key)? {
//!     println!("payload: {:?}", found.tail());
//! }
//! table.close()?;
//! ```
//!
//! The file format is a bare sequence of records: no header, no tombstones.
//! Deletion keeps the file dense by moving the last record into the vacated
//! slot. Reopening a file rebuilds the index in one pass, dropping damaged
//! records and duplicate keys. When RAM runs low the tail shadow is
//! abandoned at runtime and reads fall back to the file; the key index is
//! never given up.

#![deny(missing_docs)]

pub mod error;
pub mod memory;
pub mod registry;
pub mod schema;
pub mod table;

pub use error::{Result, TableError};
pub use memory::{FixedMemory, MemoryOracle, SystemMemory};
pub use registry::{MemoryStats, Registry};
pub use schema::{Base64Order, Column, KeyOrder, NaturalOrder, Row, RowSchema};
pub use table::{Table, TableConfig};
