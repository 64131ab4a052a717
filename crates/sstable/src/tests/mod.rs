use std::cmp::Ordering;
use std::sync::Arc;

use memtable::{append_internal_key, Comparator, InternalIterator, SequenceNumber, ValueKind};

mod format_tests;
mod table_tests;

/// Internal key literal for test tables.
fn ikey(user_key: &[u8], seq: SequenceNumber, kind: ValueKind) -> Vec<u8> {
    let mut out = Vec::new();
    append_internal_key(&mut out, user_key, seq, kind);
    out
}

/// In-memory [`InternalIterator`] over pre-sorted entries; the reference
/// source for merge and snapshot-iterator tests.
struct VecIter {
    entries: Vec<(Vec<u8>, Vec<u8>)>,
    cmp: Arc<dyn Comparator>,
    /// `entries.len()` encodes "not positioned".
    index: usize,
}

impl VecIter {
    fn new(cmp: Arc<dyn Comparator>, mut entries: Vec<(Vec<u8>, Vec<u8>)>) -> Self {
        entries.sort_by(|a, b| cmp.compare(&a.0, &b.0));
        let index = entries.len();
        VecIter {
            entries,
            cmp,
            index,
        }
    }
}

impl InternalIterator for VecIter {
    fn valid(&self) -> bool {
        self.index < self.entries.len()
    }

    fn seek_to_first(&mut self) {
        self.index = 0;
    }

    fn seek_to_last(&mut self) {
        self.index = if self.entries.is_empty() {
            0
        } else {
            self.entries.len() - 1
        };
    }

    fn seek(&mut self, target: &[u8]) {
        self.index = self
            .entries
            .iter()
            .position(|(k, _)| self.cmp.compare(k, target) != Ordering::Less)
            .unwrap_or(self.entries.len());
    }

    fn next(&mut self) {
        assert!(self.valid());
        self.index += 1;
    }

    fn prev(&mut self) {
        assert!(self.valid());
        self.index = match self.index {
            0 => self.entries.len(),
            i => i - 1,
        };
    }

    fn key(&self) -> &[u8] {
        &self.entries[self.index].0
    }

    fn value(&self) -> &[u8] {
        &self.entries[self.index].1
    }
}
