//! # SSTable — immutable sorted tables and the read path over them
//!
//! When a memtable fills up it is frozen and written out as a table file:
//! write-once, read-many, never modified in place. This crate owns that
//! file format end to end, plus the iterators that reconcile tables with
//! the live memtables into one snapshot-consistent stream.
//!
//! ## File layout
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │ data block 1 | trailer                                      │
//! │ data block 2 | trailer                                      │
//! │ ...                                                         │
//! ├─────────────────────────────────────────────────────────────┤
//! │ filter block | trailer          (optional)                  │
//! ├─────────────────────────────────────────────────────────────┤
//! │ metaindex block | trailer       "filter.<name>" -> handle   │
//! ├─────────────────────────────────────────────────────────────┤
//! │ index block | trailer           separator key -> handle     │
//! ├─────────────────────────────────────────────────────────────┤
//! │ footer (48 bytes)               two handles + magic         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! Every block trailer is `compression_type (1) | masked crc32 (4)`, the
//! CRC covering the block bytes plus the type tag. Blocks themselves are
//! prefix-compressed with a restart array ([`block`]); the filter block
//! ([`filter_block`]) summarizes keys per 2 KiB window of data offsets.
//!
//! ## Modules
//!
//! | Module           | Role                                        |
//! |------------------|---------------------------------------------|
//! | [`format`]       | handles, footer, trailer, file seam         |
//! | [`block`]        | prefix-compressed block builder/iterator    |
//! | [`filter_block`] | per-range filter builder/reader             |
//! | [`builder`]      | streaming table producer                    |
//! | [`table`]        | open table: point gets + two-level iterator |
//! | [`merge`]        | N-way merge of internal-key streams         |
//! | [`db_iter`]      | snapshot-consistent user-visible iterator   |

use thiserror::Error as ThisError;

pub mod block;
pub mod builder;
pub mod db_iter;
pub mod filter_block;
pub mod format;
pub mod merge;
pub mod table;

pub use block::{Block, BlockBuilder, BlockIter};
pub use builder::{TableBuilder, TableOptions};
pub use db_iter::DbIterator;
pub use filter_block::{FilterBlockBuilder, FilterBlockReader, FILTER_BASE_LG};
pub use format::{
    read_block, BlockHandle, CompressionType, FileSource, Footer, RandomAccess,
    BLOCK_TRAILER_SIZE, FOOTER_LENGTH, TABLE_MAGIC,
};
pub use merge::MergingIterator;
pub use table::{Table, TableIter};

/// Errors from the table format and read path.
///
/// Programmer errors (out-of-order adds, using an invalid iterator) are
/// assertions, not variants; `NotFound` is an `Ok(None)`, not an error.
#[derive(Debug, ThisError)]
pub enum Error {
    /// The bytes on disk cannot be what a builder produced.
    #[error("corruption: {0}")]
    Corruption(String),

    /// The environment failed a read or write.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A caller broke an API contract that is data-dependent (e.g.
    /// switching comparators while building a table).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

pub type Result<T> = std::result::Result<T, Error>;

pub(crate) fn corruption(msg: impl Into<String>) -> Error {
    Error::Corruption(msg.into())
}

#[cfg(test)]
mod tests;
