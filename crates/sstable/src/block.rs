//! Prefix-compressed sorted key/value blocks.
//!
//! Each entry shares a prefix with its predecessor:
//!
//! ```text
//! varint32(shared) | varint32(non_shared) | varint32(value_len)
//!   | key_delta (non_shared bytes) | value
//! ```
//!
//! Every `restart_interval` entries the builder forces `shared = 0` and
//! records the entry's offset in a restart array appended at the end:
//!
//! ```text
//! entries... | restart[0] (u32 LE) ... restart[n-1] | n (u32 LE)
//! ```
//!
//! `restart[0]` is always 0. A reader binary-searches the restart array to
//! the right region, then linearly decodes entries, rebuilding each key
//! from the previous one.

use std::sync::Arc;

use coding::{decode_fixed32, decode_varint32, encode_varint32, put_fixed32};
use memtable::{Comparator, InternalIterator};

use crate::{corruption, Result};

/// Streaming builder for one block.
pub struct BlockBuilder {
    restart_interval: usize,
    buffer: Vec<u8>,
    restarts: Vec<u32>,
    /// Entries since the last restart point.
    counter: usize,
    last_key: Vec<u8>,
}

impl BlockBuilder {
    pub fn new(restart_interval: usize) -> Self {
        assert!(restart_interval >= 1);
        BlockBuilder {
            restart_interval,
            buffer: Vec::new(),
            restarts: vec![0],
            counter: 0,
            last_key: Vec::new(),
        }
    }

    /// Appends an entry. Keys must arrive in strictly increasing order;
    /// out-of-order adds are a programmer error upstream (the table
    /// builder asserts against its comparator).
    pub fn add(&mut self, key: &[u8], value: &[u8]) {
        debug_assert!(self.counter <= self.restart_interval);

        let mut shared = 0;
        if self.counter < self.restart_interval {
            let min_len = self.last_key.len().min(key.len());
            while shared < min_len && self.last_key[shared] == key[shared] {
                shared += 1;
            }
        } else {
            // Restart point: abandon prefix compression.
            self.restarts.push(self.buffer.len() as u32);
            self.counter = 0;
        }
        let non_shared = key.len() - shared;

        encode_varint32(&mut self.buffer, shared as u32);
        encode_varint32(&mut self.buffer, non_shared as u32);
        encode_varint32(&mut self.buffer, value.len() as u32);
        self.buffer.extend_from_slice(&key[shared..]);
        self.buffer.extend_from_slice(value);

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.counter += 1;
    }

    /// Changes the restart cadence for entries added from now on.
    pub fn set_restart_interval(&mut self, restart_interval: usize) {
        assert!(restart_interval >= 1);
        self.restart_interval = restart_interval;
    }

    /// Bytes `finish` would currently produce. Drives block-size cutoff
    /// decisions in the table builder.
    pub fn current_size_estimate(&self) -> usize {
        self.buffer.len() + self.restarts.len() * 4 + 4
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Appends the restart array and returns the block, resetting the
    /// builder for the next block.
    pub fn finish(&mut self) -> Vec<u8> {
        for &restart in &self.restarts {
            put_fixed32(&mut self.buffer, restart);
        }
        put_fixed32(&mut self.buffer, self.restarts.len() as u32);

        let block = std::mem::take(&mut self.buffer);
        self.restarts.clear();
        self.restarts.push(0);
        self.counter = 0;
        self.last_key.clear();
        block
    }
}

/// A decoded, immutable block. Shared via `Arc` so cached blocks outlive
/// their cache entries.
pub struct Block {
    data: Vec<u8>,
    /// Where the restart array begins.
    restart_offset: usize,
    num_restarts: u32,
}

impl Block {
    pub fn new(data: Vec<u8>) -> Result<Block> {
        if data.len() < 4 {
            return Err(corruption("block too small for restart count"));
        }
        let num_restarts = decode_fixed32(&data[data.len() - 4..]);
        if num_restarts == 0 {
            // Even an empty block carries restart[0] == 0.
            return Err(corruption("block with no restart points"));
        }
        let max_restarts = (data.len() as u64 - 4) / 4;
        if u64::from(num_restarts) > max_restarts {
            return Err(corruption("block restart array overflows block"));
        }
        let restart_offset = data.len() - 4 - 4 * num_restarts as usize;
        Ok(Block {
            data,
            restart_offset,
            num_restarts,
        })
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    fn restart_point(&self, index: usize) -> usize {
        debug_assert!(index < self.num_restarts as usize);
        decode_fixed32(&self.data[self.restart_offset + 4 * index..]) as usize
    }
}

/// Cursor over a [`Block`]. Owns an `Arc` to the block, so data-block
/// iterators stay valid after their cache handle is gone.
pub struct BlockIter {
    block: Arc<Block>,
    cmp: Arc<dyn Comparator>,
    /// Offset of the current entry; `block.restart_offset` means invalid.
    current: usize,
    /// Restart region containing `current`.
    restart_index: usize,
    /// Current key, rebuilt incrementally from deltas.
    key: Vec<u8>,
    value_start: usize,
    value_len: usize,
    /// A structurally bad entry was hit; the iterator went invalid.
    corrupt: bool,
}

impl BlockIter {
    /// Cursor over `block`, not yet positioned. The iterator holds its own
    /// reference to the block.
    pub fn new(block: Arc<Block>, cmp: Arc<dyn Comparator>) -> BlockIter {
        let current = block.restart_offset;
        let restart_index = block.num_restarts as usize;
        BlockIter {
            block,
            cmp,
            current,
            restart_index,
            key: Vec::new(),
            value_start: 0,
            value_len: 0,
            corrupt: false,
        }
    }

    /// True if decoding ever failed. Blocks are CRC-checked on read, so
    /// this indicates a bug or in-memory corruption; lookups surface it as
    /// a corruption error.
    pub fn corrupt(&self) -> bool {
        self.corrupt
    }

    fn invalidate(&mut self) {
        self.current = self.block.restart_offset;
        self.restart_index = self.block.num_restarts as usize;
        self.key.clear();
        self.value_start = 0;
        self.value_len = 0;
    }

    fn mark_corrupt(&mut self) {
        self.invalidate();
        self.corrupt = true;
    }

    /// Offset just past the current entry.
    fn next_entry_offset(&self) -> usize {
        self.value_start + self.value_len
    }

    fn seek_to_restart_point(&mut self, index: usize) {
        self.key.clear();
        self.restart_index = index;
        // parse_next_entry picks up from the end of a zero-length pseudo
        // entry at the restart offset.
        self.value_start = self.block.restart_point(index);
        self.value_len = 0;
        self.current = self.value_start;
    }

    /// Decodes the entry at `next_entry_offset`, extending `key` from the
    /// shared prefix. Returns false (invalid) at the end of the entries.
    fn parse_next_entry(&mut self) -> bool {
        self.current = self.next_entry_offset();
        if self.current >= self.block.restart_offset {
            self.invalidate();
            return false;
        }

        let data = &self.block.data[..self.block.restart_offset];
        let Some((shared, n1)) = decode_varint32(&data[self.current..]) else {
            self.mark_corrupt();
            return false;
        };
        let Some((non_shared, n2)) = decode_varint32(&data[self.current + n1..]) else {
            self.mark_corrupt();
            return false;
        };
        let Some((value_len, n3)) = decode_varint32(&data[self.current + n1 + n2..]) else {
            self.mark_corrupt();
            return false;
        };
        let delta_start = self.current + n1 + n2 + n3;
        let value_start = delta_start + non_shared as usize;
        if shared as usize > self.key.len()
            || value_start + value_len as usize > self.block.restart_offset
        {
            self.mark_corrupt();
            return false;
        }

        self.key.truncate(shared as usize);
        self.key
            .extend_from_slice(&data[delta_start..delta_start + non_shared as usize]);
        self.value_start = value_start;
        self.value_len = value_len as usize;

        while self.restart_index + 1 < self.block.num_restarts as usize
            && self.block.restart_point(self.restart_index + 1) < self.current
        {
            self.restart_index += 1;
        }
        true
    }

    /// Key stored at a restart point, decoded without moving the cursor.
    /// `None` for structurally impossible offsets or entries.
    fn restart_key(&self, index: usize) -> Option<&[u8]> {
        let offset = self.block.restart_point(index);
        let data = &self.block.data[..self.block.restart_offset];
        let entry = data.get(offset..)?;
        let (shared, n1) = decode_varint32(entry)?;
        if shared != 0 {
            // Restart entries never share a prefix.
            return None;
        }
        let (non_shared, n2) = decode_varint32(&entry[n1..])?;
        let (_, n3) = decode_varint32(&entry[n1 + n2..])?;
        let start = n1 + n2 + n3;
        entry.get(start..start + non_shared as usize)
    }
}

impl InternalIterator for BlockIter {
    fn valid(&self) -> bool {
        self.current < self.block.restart_offset
    }

    fn seek_to_first(&mut self) {
        self.seek_to_restart_point(0);
        self.parse_next_entry();
    }

    fn seek_to_last(&mut self) {
        self.seek_to_restart_point(self.block.num_restarts as usize - 1);
        // Walk forward to the final entry of the final region.
        while self.parse_next_entry() && self.next_entry_offset() < self.block.restart_offset {}
    }

    fn seek(&mut self, target: &[u8]) {
        // Binary search the restart array for the last region whose first
        // key is < target.
        let mut left = 0usize;
        let mut right = self.block.num_restarts as usize - 1;
        while left < right {
            let mid = (left + right + 1) / 2;
            let before_target = self
                .restart_key(mid)
                .map(|key| self.cmp.compare(key, target) == std::cmp::Ordering::Less);
            match before_target {
                Some(true) => left = mid,
                Some(false) => right = mid - 1,
                None => {
                    self.mark_corrupt();
                    return;
                }
            }
        }

        // Linear scan within the region.
        self.seek_to_restart_point(left);
        loop {
            if !self.parse_next_entry() {
                return;
            }
            if self.cmp.compare(&self.key, target) != std::cmp::Ordering::Less {
                return;
            }
        }
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        self.parse_next_entry();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        let original = self.current;
        // Back up to the restart region strictly before the current entry.
        while self.block.restart_point(self.restart_index) >= original {
            if self.restart_index == 0 {
                self.invalidate();
                return;
            }
            self.restart_index -= 1;
        }
        self.seek_to_restart_point(self.restart_index);
        // Scan forward to the entry just before `original`.
        while self.parse_next_entry() && self.next_entry_offset() < original {}
    }

    fn key(&self) -> &[u8] {
        debug_assert!(self.valid());
        &self.key
    }

    fn value(&self) -> &[u8] {
        debug_assert!(self.valid());
        &self.block.data[self.value_start..self.value_start + self.value_len]
    }
}
