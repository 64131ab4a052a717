//! Snapshot-consistent user-facing iterator.
//!
//! The storage layers store `(user_key, sequence, kind)` versions; this
//! iterator collapses them into the single live value per user key that a
//! caller at snapshot `S` should see: entries above `S` are invisible,
//! the highest visible sequence wins, and a winning tombstone hides the
//! key entirely.
//!
//! ## Direction state machine
//!
//! - Moving **forward**, the inner iterator sits exactly on the entry that
//!   supplies `key()`/`value()`.
//! - Moving **backward**, the inner iterator sits just *before* the block
//!   of entries for `key()`, and the yielded pair lives in saved buffers.
//!   Reverse traversal therefore re-probes more and is intentionally the
//!   expensive direction.
//!
//! Switching direction re-anchors the inner iterator around the saved key
//! so the entry the caller was looking at stays observable.

use std::cmp::Ordering;
use std::sync::Arc;

use memtable::{
    append_internal_key, extract_user_key, parse_internal_key, Comparator, InternalIterator,
    SequenceNumber, ValueKind, VALUE_KIND_FOR_SEEK,
};
use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::{corruption, Error};

/// Average bytes of entries scanned between read samples.
const READ_BYTES_PERIOD: usize = 1_048_576;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Direction {
    Forward,
    Reverse,
}

/// Callback invoked with a sampled internal key; the outer engine feeds
/// these into its compaction statistics.
pub type ReadSampleFn<'a> = Box<dyn FnMut(&[u8]) + 'a>;

pub struct DbIterator<'a> {
    user_cmp: Arc<dyn Comparator>,
    iter: Box<dyn InternalIterator + 'a>,
    /// Snapshot: entries with a sequence above this are invisible.
    sequence: SequenceNumber,
    /// First corruption seen, if any; positioning continues best-effort.
    status: Option<Error>,
    /// Forward: the user key to skip while scanning. Reverse: the current
    /// user key.
    saved_key: Vec<u8>,
    /// Current value while moving in reverse.
    saved_value: Vec<u8>,
    direction: Direction,
    valid: bool,
    rng: SmallRng,
    /// Countdown to the next read sample.
    bytes_until_read_sampling: isize,
    read_sample: Option<ReadSampleFn<'a>>,
}

impl<'a> DbIterator<'a> {
    pub fn new(
        user_cmp: Arc<dyn Comparator>,
        iter: Box<dyn InternalIterator + 'a>,
        sequence: SequenceNumber,
        seed: u64,
    ) -> Self {
        let mut rng = SmallRng::seed_from_u64(seed);
        let bytes_until_read_sampling = random_compaction_period(&mut rng);
        DbIterator {
            user_cmp,
            iter,
            sequence,
            status: None,
            saved_key: Vec::new(),
            saved_value: Vec::new(),
            direction: Direction::Forward,
            valid: false,
            rng,
            bytes_until_read_sampling,
            read_sample: None,
        }
    }

    /// Registers a callback receiving occasional sampled internal keys
    /// (mean period one MiB of scanned entry bytes).
    pub fn sample_reads(&mut self, callback: ReadSampleFn<'a>) {
        self.read_sample = Some(callback);
    }

    pub fn valid(&self) -> bool {
        self.valid
    }

    /// First corruption encountered while iterating, if any.
    pub fn status(&self) -> Result<(), &Error> {
        match &self.status {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    /// REQUIRES: `valid()`
    pub fn key(&self) -> &[u8] {
        debug_assert!(self.valid);
        match self.direction {
            Direction::Forward => extract_user_key(self.iter.key()),
            Direction::Reverse => &self.saved_key,
        }
    }

    /// REQUIRES: `valid()`
    pub fn value(&self) -> &[u8] {
        debug_assert!(self.valid);
        match self.direction {
            Direction::Forward => self.iter.value(),
            Direction::Reverse => &self.saved_value,
        }
    }

    pub fn next(&mut self) {
        assert!(self.valid, "next on invalid iterator");

        if self.direction == Direction::Reverse {
            self.direction = Direction::Forward;
            // The inner iterator is just before the entries for the
            // current key: step into them, then skip them like any other
            // already-yielded key. saved_key already holds the skip key.
            if self.iter.valid() {
                self.iter.next();
            } else {
                self.iter.seek_to_first();
            }
            if !self.iter.valid() {
                self.valid = false;
                self.saved_key.clear();
                return;
            }
        } else {
            // Remember the yielded user key so every remaining version of
            // it gets skipped.
            self.save_current_user_key();
        }

        self.find_next_user_entry(true);
    }

    pub fn prev(&mut self) {
        assert!(self.valid, "prev on invalid iterator");

        if self.direction == Direction::Forward {
            // Back the inner iterator off to just before the current
            // key's entries.
            self.save_current_user_key();
            loop {
                self.iter.prev();
                if !self.iter.valid() {
                    self.valid = false;
                    self.saved_key.clear();
                    self.saved_value.clear();
                    return;
                }
                let user_key = extract_user_key(self.iter.key());
                if self.user_cmp.compare(user_key, &self.saved_key) == Ordering::Less {
                    break;
                }
            }
            self.direction = Direction::Reverse;
        }

        self.find_prev_user_entry();
    }

    /// Positions at the first visible entry with user key >= `target`.
    pub fn seek(&mut self, target: &[u8]) {
        self.direction = Direction::Forward;
        self.saved_value.clear();
        // Probe with the seek kind so the newest visible version of
        // `target` is the first entry at or after the probe.
        self.saved_key.clear();
        append_internal_key(
            &mut self.saved_key,
            target,
            self.sequence,
            VALUE_KIND_FOR_SEEK,
        );
        self.iter.seek(&self.saved_key);
        if self.iter.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    pub fn seek_to_first(&mut self) {
        self.direction = Direction::Forward;
        self.saved_value.clear();
        self.iter.seek_to_first();
        if self.iter.valid() {
            self.find_next_user_entry(false);
        } else {
            self.valid = false;
        }
    }

    pub fn seek_to_last(&mut self) {
        self.direction = Direction::Reverse;
        self.saved_value.clear();
        self.iter.seek_to_last();
        self.find_prev_user_entry();
    }

    /// Forward scan for the next entry to yield. With `skipping`,
    /// everything at or before the user key in `saved_key` is hidden.
    fn find_next_user_entry(&mut self, mut skipping: bool) {
        debug_assert!(self.iter.valid());
        debug_assert!(self.direction == Direction::Forward);

        loop {
            self.note_bytes_read();
            match parse_internal_key(self.iter.key()) {
                None => Self::record_corruption(&mut self.status),
                Some((user_key, sequence, kind)) if sequence <= self.sequence => match kind {
                    ValueKind::Deletion => {
                        // Hides every older entry for this user key.
                        let user_key = user_key.to_vec();
                        self.saved_key.clear();
                        self.saved_key.extend_from_slice(&user_key);
                        skipping = true;
                    }
                    ValueKind::Value => {
                        if skipping
                            && self.user_cmp.compare(user_key, &self.saved_key)
                                != Ordering::Greater
                        {
                            // Shadowed by a newer entry already yielded
                            // or deleted.
                        } else {
                            self.valid = true;
                            self.saved_key.clear();
                            return;
                        }
                    }
                },
                Some(_) => {} // newer than the snapshot: invisible
            }
            self.iter.next();
            if !self.iter.valid() {
                break;
            }
        }
        self.saved_key.clear();
        self.valid = false;
    }

    /// Backward scan: walks to the previous user key and resolves its
    /// newest visible version into the saved buffers.
    fn find_prev_user_entry(&mut self) {
        debug_assert!(self.direction == Direction::Reverse);

        // Kind of the best candidate so far; Deletion doubles as "none".
        let mut kind = ValueKind::Deletion;
        if self.iter.valid() {
            loop {
                self.note_bytes_read();
                match parse_internal_key(self.iter.key()) {
                    None => Self::record_corruption(&mut self.status),
                    Some((user_key, sequence, entry_kind)) if sequence <= self.sequence => {
                        if kind != ValueKind::Deletion
                            && self.user_cmp.compare(user_key, &self.saved_key)
                                == Ordering::Less
                        {
                            // A live candidate exists and this entry is for
                            // an earlier user key: the candidate wins.
                            break;
                        }
                        kind = entry_kind;
                        if kind == ValueKind::Deletion {
                            self.saved_key.clear();
                            self.saved_value.clear();
                        } else {
                            let user_key = user_key.to_vec();
                            self.saved_key.clear();
                            self.saved_key.extend_from_slice(&user_key);
                            self.saved_value.clear();
                            self.saved_value.extend_from_slice(self.iter.value());
                        }
                    }
                    Some(_) => {}
                }
                self.iter.prev();
                if !self.iter.valid() {
                    break;
                }
            }
        }

        if kind == ValueKind::Deletion {
            // Ran off the front of the stream.
            self.valid = false;
            self.saved_key.clear();
            self.saved_value.clear();
            self.direction = Direction::Forward;
        } else {
            self.valid = true;
        }
    }

    fn save_current_user_key(&mut self) {
        let user_key = extract_user_key(self.iter.key()).to_vec();
        self.saved_key.clear();
        self.saved_key.extend_from_slice(&user_key);
    }

    /// Takes the status field alone so callers can record while the inner
    /// iterator's key is still borrowed.
    fn record_corruption(status: &mut Option<Error>) {
        if status.is_none() {
            *status = Some(corruption("malformed internal key in iterator"));
        }
    }

    /// Accounts the current entry against the sampling budget, invoking
    /// the callback when a period elapses.
    fn note_bytes_read(&mut self) {
        let bytes = (self.iter.key().len() + self.iter.value().len()) as isize;
        self.bytes_until_read_sampling -= bytes;
        while self.bytes_until_read_sampling < 0 {
            self.bytes_until_read_sampling += random_compaction_period(&mut self.rng);
            if let Some(callback) = self.read_sample.as_mut() {
                let key = self.iter.key().to_vec();
                callback(&key);
            }
        }
    }
}

/// Uniform in [0, 2 * READ_BYTES_PERIOD): averages one sample per period.
fn random_compaction_period(rng: &mut SmallRng) -> isize {
    rng.gen_range(0..2 * READ_BYTES_PERIOD as isize)
}
