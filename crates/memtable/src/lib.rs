//! # Memtable — the in-memory write path
//!
//! Recent writes live here until the table is frozen and flushed to disk as
//! an immutable sorted table. The memtable is a thin shell over a lock-free
//! [`skiplist::SkipList`] whose nodes are carved from an [`arena::Arena`]:
//! one writer at a time (serialized by the caller) inserts entries while
//! readers traverse concurrently without locks.
//!
//! ## Entry layout
//!
//! Each skiplist element is a pointer to one encoded entry:
//!
//! ```text
//! varint32(internal_key_len) | user_key | tag (8, LE) | varint32(value_len) | value
//! ```
//!
//! where `tag = (sequence << 8) | kind`. Entries sort by internal-key
//! order: ascending user key, then *descending* tag, so the newest version
//! of a user key is reached first and a lookup probe built for snapshot S
//! lands on the newest entry with `sequence <= S`.
//!
//! The crate also carries the pieces the rest of the engine shares with
//! the memtable: the internal-key model and comparators ([`key`]), the
//! iterator seam ([`iter`]), and grouped mutations ([`batch`]).

use std::slice;
use std::sync::Arc;

use coding::{varint32_length, write_varint32};

pub mod arena;
pub mod batch;
pub mod iter;
pub mod key;
pub mod skiplist;

pub use arena::Arena;
pub use batch::{BatchError, BatchHandler, WriteBatch};
pub use iter::InternalIterator;
pub use key::{
    append_internal_key, extract_user_key, pack_tag, parse_internal_key, BytewiseComparator,
    Comparator, InternalKeyComparator, LookupKey, SequenceNumber, ValueKind,
    MAX_SEQUENCE_NUMBER, VALUE_KIND_FOR_SEEK,
};

use skiplist::{PointerComparator, SkipList};

/// Decodes a varint32 directly at `p` without forming an oversized slice.
///
/// # Safety
///
/// `p` must point at a varint written by this crate, fully inside a live
/// allocation.
unsafe fn decode_varint32_raw(mut p: *const u8) -> (u32, usize) {
    let mut result: u32 = 0;
    for i in 0..5 {
        let byte = *p;
        p = p.add(1);
        result |= ((byte & 0x7f) as u32) << (7 * i);
        if byte < 0x80 {
            return (result, i + 1);
        }
    }
    unreachable!("corrupt memtable entry: unterminated varint");
}

/// Internal key of the entry at `p`.
///
/// # Safety
///
/// `p` must point at an entry (or lookup-key prefix) encoded by this crate
/// in a live arena.
unsafe fn entry_key<'a>(p: *const u8) -> &'a [u8] {
    let (len, consumed) = decode_varint32_raw(p);
    slice::from_raw_parts(p.add(consumed), len as usize)
}

/// Internal key and value of the full entry at `p`.
///
/// # Safety
///
/// `p` must point at a complete entry encoded by [`MemTable::add`].
unsafe fn entry_key_value<'a>(p: *const u8) -> (&'a [u8], &'a [u8]) {
    let key = entry_key(p);
    let value_ptr = key.as_ptr().add(key.len());
    let (value_len, consumed) = decode_varint32_raw(value_ptr);
    (
        key,
        slice::from_raw_parts(value_ptr.add(consumed), value_len as usize),
    )
}

/// Skiplist comparator that decodes the length-prefixed entries the
/// memtable stores and orders them by internal key.
struct EntryComparator {
    cmp: InternalKeyComparator,
}

impl PointerComparator for EntryComparator {
    unsafe fn compare(&self, a: *const u8, b: *const u8) -> std::cmp::Ordering {
        self.cmp.compare(entry_key(a), entry_key(b))
    }
}

/// In-memory table of recent writes, shared between one (externally
/// serialized) writer and any number of lock-free readers via `Arc`; the
/// last clone to drop releases the arena and every entry in it.
pub struct MemTable {
    comparator: InternalKeyComparator,
    arena: Arc<Arena>,
    table: SkipList<EntryComparator>,
}

impl MemTable {
    pub fn new(comparator: InternalKeyComparator) -> Self {
        let arena = Arc::new(Arena::new());
        let table = SkipList::new(
            EntryComparator {
                cmp: comparator.clone(),
            },
            Arc::clone(&arena),
        );
        MemTable {
            comparator,
            arena,
            table,
        }
    }

    /// Bytes of arena memory backing this table. Readable concurrently
    /// with writes; the estimate may lag by an allocation.
    pub fn approximate_memory_usage(&self) -> usize {
        self.arena.memory_usage()
    }

    /// Adds an entry mapping `user_key` to `value` at `seq` with the given
    /// kind. For a [`ValueKind::Deletion`], `value` is conventionally
    /// empty.
    ///
    /// Writers must be externally serialized (see the skiplist contract);
    /// the same `(user_key, seq, kind)` must not be added twice.
    pub fn add(&self, seq: SequenceNumber, kind: ValueKind, user_key: &[u8], value: &[u8]) {
        let internal_key_len = user_key.len() + 8;
        let encoded_len = varint32_length(internal_key_len as u32)
            + internal_key_len
            + varint32_length(value.len() as u32)
            + value.len();
        let p = self.arena.allocate(encoded_len);
        let buf = unsafe { slice::from_raw_parts_mut(p, encoded_len) };

        let mut offset = write_varint32(buf, internal_key_len as u32);
        buf[offset..offset + user_key.len()].copy_from_slice(user_key);
        offset += user_key.len();
        buf[offset..offset + 8].copy_from_slice(&pack_tag(seq, kind).to_le_bytes());
        offset += 8;
        offset += write_varint32(&mut buf[offset..], value.len() as u32);
        buf[offset..offset + value.len()].copy_from_slice(value);
        debug_assert_eq!(offset + value.len(), encoded_len);

        self.table.insert(p);
    }

    /// Looks up `key`'s user key at its snapshot.
    ///
    /// - `None` — this table holds nothing for the user key.
    /// - `Some(None)` — the newest visible entry is a tombstone.
    /// - `Some(Some(v))` — the newest visible entry is a value.
    pub fn get(&self, key: &LookupKey) -> Option<Option<Vec<u8>>> {
        let mut iter = self.table.iter();
        iter.seek(key.memtable_key().as_ptr());
        if !iter.valid() {
            return None;
        }
        // The probe's tag sorts it before any entry with a larger
        // sequence, so the first entry at or after it is the newest one
        // visible at the snapshot — no sequence re-check needed, only the
        // user-key match.
        let (entry_ikey, value) = unsafe { entry_key_value(iter.key()) };
        let user_key = extract_user_key(entry_ikey);
        if self
            .comparator
            .user_comparator()
            .compare(user_key, key.user_key())
            != std::cmp::Ordering::Equal
        {
            return None;
        }
        match parse_internal_key(entry_ikey) {
            Some((_, _, ValueKind::Value)) => Some(Some(value.to_vec())),
            Some((_, _, ValueKind::Deletion)) => Some(None),
            None => unreachable!("corrupt memtable entry tag"),
        }
    }
}

/// Iterator over a [`MemTable`]. Yields internal keys (the length prefix
/// stripped) and raw values.
pub struct MemTableIterator {
    mem: Arc<MemTable>,
    node: *mut u8,
    /// Seek targets arrive as bare internal keys; the skiplist compares
    /// length-prefixed entries, so seeks re-encode into this buffer.
    scratch: Vec<u8>,
}

impl MemTableIterator {
    /// Cursor over `mem` in internal-key order, not yet positioned. The
    /// iterator's own reference keeps the table (and its arena) alive.
    pub fn new(mem: Arc<MemTable>) -> MemTableIterator {
        MemTableIterator {
            mem,
            node: std::ptr::null_mut(),
            scratch: Vec::new(),
        }
    }
}

impl InternalIterator for MemTableIterator {
    fn valid(&self) -> bool {
        !self.node.is_null()
    }

    fn seek_to_first(&mut self) {
        self.node = self.mem.table.first_raw();
    }

    fn seek_to_last(&mut self) {
        self.node = self.mem.table.last_raw();
    }

    fn seek(&mut self, target: &[u8]) {
        self.scratch.clear();
        coding::encode_varint32(&mut self.scratch, target.len() as u32);
        self.scratch.extend_from_slice(target);
        self.node = self.mem.table.seek_raw(self.scratch.as_ptr());
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        self.node = unsafe { self.mem.table.next_raw(self.node) };
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        self.node = unsafe { self.mem.table.prev_raw(self.node) };
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        unsafe { entry_key(self.mem.table.key_raw(self.node)) }
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.valid());
        unsafe { entry_key_value(self.mem.table.key_raw(self.node)).1 }
    }
}

#[cfg(test)]
mod tests;
