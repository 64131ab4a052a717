//! N-way merge of internal-key streams.
//!
//! Reconciles the memtable, the frozen memtable, and any number of table
//! iterators into one stream in internal-key order. Duplicate user keys
//! across children are *not* collapsed here — every version flows through,
//! and the snapshot iterator above decides visibility.
//!
//! Child counts are small (a handful of sources per read), so selection is
//! a linear scan rather than a heap. The iterator is bidirectional: a
//! direction switch re-anchors every non-current child around the current
//! key before resuming.

use std::cmp::Ordering;
use std::sync::Arc;

use memtable::{Comparator, InternalIterator};

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

pub struct MergingIterator<'a> {
    cmp: Arc<dyn Comparator>,
    children: Vec<Box<dyn InternalIterator + 'a>>,
    /// Index of the child supplying the current entry.
    current: Option<usize>,
    direction: Direction,
}

impl<'a> MergingIterator<'a> {
    pub fn new(cmp: Arc<dyn Comparator>, children: Vec<Box<dyn InternalIterator + 'a>>) -> Self {
        MergingIterator {
            cmp,
            children,
            current: None,
            direction: Direction::Forward,
        }
    }

    fn find_smallest(&mut self) {
        let mut smallest: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate() {
            if !child.valid() {
                continue;
            }
            match smallest {
                None => smallest = Some(i),
                Some(s) => {
                    if self.cmp.compare(child.key(), self.children[s].key()) == Ordering::Less {
                        smallest = Some(i);
                    }
                }
            }
        }
        self.current = smallest;
    }

    fn find_largest(&mut self) {
        let mut largest: Option<usize> = None;
        for (i, child) in self.children.iter().enumerate().rev() {
            if !child.valid() {
                continue;
            }
            match largest {
                None => largest = Some(i),
                Some(l) => {
                    if self.cmp.compare(child.key(), self.children[l].key()) == Ordering::Greater
                    {
                        largest = Some(i);
                    }
                }
            }
        }
        self.current = largest;
    }
}

impl InternalIterator for MergingIterator<'_> {
    fn valid(&self) -> bool {
        self.current.is_some()
    }

    fn seek_to_first(&mut self) {
        for child in &mut self.children {
            child.seek_to_first();
        }
        self.direction = Direction::Forward;
        self.find_smallest();
    }

    fn seek_to_last(&mut self) {
        for child in &mut self.children {
            child.seek_to_last();
        }
        self.direction = Direction::Reverse;
        self.find_largest();
    }

    fn seek(&mut self, target: &[u8]) {
        for child in &mut self.children {
            child.seek(target);
        }
        self.direction = Direction::Forward;
        self.find_smallest();
    }

    fn next(&mut self) {
        let current = self.current.expect("next on invalid merging iterator");

        if self.direction != Direction::Forward {
            // All non-current children sit before key(); put each at its
            // first entry past the current key so advancing is uniform.
            let key = self.key().to_vec();
            for (i, child) in self.children.iter_mut().enumerate() {
                if i == current {
                    continue;
                }
                child.seek(&key);
                if child.valid() && self.cmp.compare(&key, child.key()) == Ordering::Equal {
                    child.next();
                }
            }
            self.direction = Direction::Forward;
        }

        self.children[current].next();
        self.find_smallest();
    }

    fn prev(&mut self) {
        let current = self.current.expect("prev on invalid merging iterator");

        if self.direction != Direction::Reverse {
            // All non-current children sit at their first entry >= key();
            // step each back to its last entry strictly before it.
            let key = self.key().to_vec();
            for (i, child) in self.children.iter_mut().enumerate() {
                if i == current {
                    continue;
                }
                child.seek(&key);
                if child.valid() {
                    // Positioned at the first entry >= key: one step back.
                    child.prev();
                } else {
                    // Every entry in this child is < key.
                    child.seek_to_last();
                }
            }
            self.direction = Direction::Reverse;
        }

        self.children[current].prev();
        self.find_largest();
    }

    fn key(&self) -> &[u8] {
        let current = self.current.expect("key on invalid merging iterator");
        self.children[current].key()
    }

    fn value(&self) -> &[u8] {
        let current = self.current.expect("value on invalid merging iterator");
        self.children[current].value()
    }
}
