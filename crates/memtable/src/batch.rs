//! Grouped mutations with one assigned base sequence.
//!
//! A [`WriteBatch`] is a byte buffer the outer engine logs as a single
//! record and then replays into the memtable:
//!
//! ```text
//! sequence (8, LE) | count (4, LE) | record*
//! record := kind (1) | varint32(key_len) | key [ | varint32(value_len) | value ]
//! ```
//!
//! The value half is present only for `Value` records. The engine assigns
//! the batch's base sequence once; replay hands record *i* sequence
//! `base + i`.

use thiserror::Error;

use coding::{
    decode_fixed32, decode_fixed64, get_length_prefixed_slice, put_length_prefixed_slice,
};

use crate::key::{SequenceNumber, ValueKind};
use crate::MemTable;

/// Fixed header: 8-byte sequence then 4-byte count.
const HEADER_SIZE: usize = 12;

/// Decoding failures while replaying a batch. These indicate a corrupt
/// log record, not caller error.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BatchError {
    #[error("corrupt write batch: {0}")]
    Corruption(&'static str),
}

/// Receiver for [`WriteBatch::iterate`].
pub trait BatchHandler {
    fn put(&mut self, key: &[u8], value: &[u8]);
    fn delete(&mut self, key: &[u8]);
}

pub struct WriteBatch {
    rep: Vec<u8>,
}

impl WriteBatch {
    pub fn new() -> Self {
        WriteBatch {
            rep: vec![0; HEADER_SIZE],
        }
    }

    /// Empties the batch, keeping its buffer.
    pub fn clear(&mut self) {
        self.rep.clear();
        self.rep.resize(HEADER_SIZE, 0);
    }

    /// Queues a `key -> value` mapping.
    pub fn put(&mut self, key: &[u8], value: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.push(ValueKind::Value as u8);
        put_length_prefixed_slice(&mut self.rep, key);
        put_length_prefixed_slice(&mut self.rep, value);
    }

    /// Queues a tombstone for `key`.
    pub fn delete(&mut self, key: &[u8]) {
        self.set_count(self.count() + 1);
        self.rep.push(ValueKind::Deletion as u8);
        put_length_prefixed_slice(&mut self.rep, key);
    }

    /// Number of queued records.
    pub fn count(&self) -> u32 {
        decode_fixed32(&self.rep[8..12])
    }

    fn set_count(&mut self, n: u32) {
        self.rep[8..12].copy_from_slice(&n.to_le_bytes());
    }

    /// Base sequence assigned to the batch's first record.
    pub fn sequence(&self) -> SequenceNumber {
        decode_fixed64(&self.rep[..8])
    }

    pub fn set_sequence(&mut self, seq: SequenceNumber) {
        self.rep[..8].copy_from_slice(&seq.to_le_bytes());
    }

    /// Size of the encoded batch — what a log append of it would cost.
    pub fn approximate_size(&self) -> usize {
        self.rep.len()
    }

    /// Appends `src`'s records (not its header) onto `self`, summing the
    /// counts.
    pub fn append(&mut self, src: &WriteBatch) {
        self.set_count(self.count() + src.count());
        self.rep.extend_from_slice(&src.rep[HEADER_SIZE..]);
    }

    /// The encoded form, suitable for a log record.
    pub fn contents(&self) -> &[u8] {
        &self.rep
    }

    /// Replaces the batch with bytes recovered from a log record.
    ///
    /// # Panics
    ///
    /// Asserts the buffer is at least header-sized; shorter input is a
    /// framing bug in the caller, not batch data.
    pub fn set_contents(&mut self, contents: &[u8]) {
        assert!(contents.len() >= HEADER_SIZE);
        self.rep.clear();
        self.rep.extend_from_slice(contents);
    }

    /// Walks the records in order, dispatching each to `handler`.
    ///
    /// Fails with [`BatchError::Corruption`] on a malformed record or when
    /// the records found disagree with the stored count.
    pub fn iterate<H: BatchHandler>(&self, handler: &mut H) -> Result<(), BatchError> {
        if self.rep.len() < HEADER_SIZE {
            return Err(BatchError::Corruption("batch smaller than its header"));
        }
        let mut input = &self.rep[HEADER_SIZE..];
        let mut found: u32 = 0;
        while !input.is_empty() {
            found += 1;
            let kind = input[0];
            input = &input[1..];
            match kind {
                k if k == ValueKind::Value as u8 => {
                    let (key, used) = get_length_prefixed_slice(input)
                        .ok_or(BatchError::Corruption("bad put key"))?;
                    input = &input[used..];
                    let (value, used) = get_length_prefixed_slice(input)
                        .ok_or(BatchError::Corruption("bad put value"))?;
                    input = &input[used..];
                    handler.put(key, value);
                }
                k if k == ValueKind::Deletion as u8 => {
                    let (key, used) = get_length_prefixed_slice(input)
                        .ok_or(BatchError::Corruption("bad delete key"))?;
                    input = &input[used..];
                    handler.delete(key);
                }
                _ => return Err(BatchError::Corruption("unknown record kind")),
            }
        }
        if found != self.count() {
            return Err(BatchError::Corruption("record count mismatch"));
        }
        Ok(())
    }

    /// Replays the batch into `mem`, assigning `sequence() + i` to record
    /// `i`. The caller provides the same single-writer guarantee
    /// [`MemTable::add`] requires.
    pub fn insert_into(&self, mem: &MemTable) -> Result<(), BatchError> {
        let mut inserter = MemTableInserter {
            seq: self.sequence(),
            mem,
        };
        self.iterate(&mut inserter)
    }
}

impl Default for WriteBatch {
    fn default() -> Self {
        Self::new()
    }
}

struct MemTableInserter<'a> {
    seq: SequenceNumber,
    mem: &'a MemTable,
}

impl BatchHandler for MemTableInserter<'_> {
    fn put(&mut self, key: &[u8], value: &[u8]) {
        self.mem.add(self.seq, ValueKind::Value, key, value);
        self.seq += 1;
    }

    fn delete(&mut self, key: &[u8]) {
        self.mem.add(self.seq, ValueKind::Deletion, key, b"");
        self.seq += 1;
    }
}
