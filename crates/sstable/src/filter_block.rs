//! Per-range filter blocks embedded in table files.
//!
//! One filter is generated for every 2 KiB window of data-block *byte
//! offsets*: filter `i` covers the keys of every data block whose file
//! offset falls in `[i << BASE_LG, (i+1) << BASE_LG)`. A point lookup that
//! knows a data block's offset can test membership before reading the
//! block.
//!
//! Layout:
//!
//! ```text
//! filter data... | offset[0] (u32 LE) ... offset[m-1] | offsets_start (u32 LE) | base_lg (u8)
//! ```
//!
//! The builder's call pattern is `(start_block add_key*)* finish`:
//! `start_block(o)` closes out every window that `o` has passed (emitting
//! empty filters for key-less windows), `add_key` accumulates keys for the
//! current window, and `finish` seals the final filter plus the offset
//! array.

use std::sync::Arc;

use bloom::FilterPolicy;
use coding::{decode_fixed32, put_fixed32};

/// Windows are 1 << FILTER_BASE_LG = 2048 bytes of data-block offsets.
pub const FILTER_BASE_LG: u8 = 11;
const FILTER_BASE: u64 = 1 << FILTER_BASE_LG;

pub struct FilterBlockBuilder {
    policy: Arc<dyn FilterPolicy>,
    /// Keys accumulated for the window being built.
    keys: Vec<Vec<u8>>,
    /// Filter data emitted so far.
    result: Vec<u8>,
    /// Start of each emitted filter within `result`.
    filter_offsets: Vec<u32>,
}

impl FilterBlockBuilder {
    pub fn new(policy: Arc<dyn FilterPolicy>) -> Self {
        FilterBlockBuilder {
            policy,
            keys: Vec::new(),
            result: Vec::new(),
            filter_offsets: Vec::new(),
        }
    }

    /// Declares that the next data block starts at `block_offset`,
    /// sealing the filters of every window that offset has moved past.
    pub fn start_block(&mut self, block_offset: u64) {
        let filter_index = block_offset / FILTER_BASE;
        assert!(filter_index >= self.filter_offsets.len() as u64);
        while filter_index > self.filter_offsets.len() as u64 {
            self.generate_filter();
        }
    }

    pub fn add_key(&mut self, key: &[u8]) {
        self.keys.push(key.to_vec());
    }

    /// Seals the block: remaining keys, the offset array, its start, and
    /// the window size exponent.
    pub fn finish(mut self) -> Vec<u8> {
        if !self.keys.is_empty() {
            self.generate_filter();
        }
        let offsets_start = self.result.len() as u32;
        let offsets = std::mem::take(&mut self.filter_offsets);
        for offset in offsets {
            put_fixed32(&mut self.result, offset);
        }
        put_fixed32(&mut self.result, offsets_start);
        self.result.push(FILTER_BASE_LG);
        self.result
    }

    fn generate_filter(&mut self) {
        self.filter_offsets.push(self.result.len() as u32);
        if self.keys.is_empty() {
            // Window with no keys: a zero-length filter.
            return;
        }
        let refs: Vec<&[u8]> = self.keys.iter().map(|k| k.as_slice()).collect();
        self.policy.create_filter(&refs, &mut self.result);
        self.keys.clear();
    }
}

/// Reader half. Malformed contents degrade to "may match" (or to "no
/// match" for a window with an explicitly empty filter) — a filter can
/// only ever suppress reads, never answers wrongly.
pub struct FilterBlockReader {
    policy: Arc<dyn FilterPolicy>,
    contents: Vec<u8>,
    /// Start of the offset array within `contents`.
    offsets_start: usize,
    num_filters: usize,
    base_lg: u8,
}

impl FilterBlockReader {
    pub fn new(policy: Arc<dyn FilterPolicy>, contents: Vec<u8>) -> Self {
        let mut reader = FilterBlockReader {
            policy,
            contents,
            offsets_start: 0,
            num_filters: 0,
            base_lg: 0,
        };
        let n = reader.contents.len();
        if n < 5 {
            return reader; // zero filters: everything may match
        }
        reader.base_lg = reader.contents[n - 1];
        let offsets_start = decode_fixed32(&reader.contents[n - 5..]) as usize;
        if offsets_start > n - 5 {
            return reader;
        }
        reader.offsets_start = offsets_start;
        reader.num_filters = (n - 5 - offsets_start) / 4;
        reader
    }

    /// May `key` be present in the data block starting at `block_offset`?
    pub fn key_may_match(&self, block_offset: u64, key: &[u8]) -> bool {
        let index = (block_offset >> self.base_lg) as usize;
        if index >= self.num_filters {
            // Beyond the covered range: cannot rule anything out.
            return true;
        }
        let start = decode_fixed32(&self.contents[self.offsets_start + 4 * index..]) as usize;
        let limit = if index + 1 < self.num_filters {
            decode_fixed32(&self.contents[self.offsets_start + 4 * (index + 1)..]) as usize
        } else {
            self.offsets_start
        };
        if start > limit || limit > self.offsets_start {
            // Offsets are inconsistent: treat as possibly present.
            return true;
        }
        if start == limit {
            // Empty filter: the window had no keys at all.
            return false;
        }
        self.policy
            .key_may_match(key, &self.contents[start..limit])
    }
}
