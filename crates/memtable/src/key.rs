//! The internal-key model: tags, comparators, and lookup keys.
//!
//! Every mutation is stored under an *internal key*: the caller's user key
//! followed by an 8-byte little-endian tag packing a 56-bit sequence number
//! with a [`ValueKind`]. Internal keys order ascending by user key and, for
//! the same user key, descending by tag — so the newest version of a key
//! sorts first and a snapshot read stops at the first visible entry.

use std::cmp::Ordering;
use std::sync::Arc;

use coding::{decode_fixed64, encode_varint32, put_fixed64};

/// Kind of a stored entry. `Deletion` is a tombstone hiding every older
/// entry for the same user key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum ValueKind {
    Deletion = 0,
    Value = 1,
}

impl ValueKind {
    fn from_u8(b: u8) -> Option<ValueKind> {
        match b {
            0 => Some(ValueKind::Deletion),
            1 => Some(ValueKind::Value),
            _ => None,
        }
    }
}

/// Kind used when building a seek probe. `Value` has the highest kind byte,
/// so `(seq, VALUE_KIND_FOR_SEEK)` sorts before every real entry with the
/// same user key and sequence <= seq.
pub const VALUE_KIND_FOR_SEEK: ValueKind = ValueKind::Value;

pub type SequenceNumber = u64;

/// Sequence numbers occupy 56 bits; the low byte of the tag is the kind.
pub const MAX_SEQUENCE_NUMBER: SequenceNumber = (1 << 56) - 1;

/// Packs a sequence number and kind into the 8-byte tag.
///
/// # Panics
///
/// Asserts `seq <= MAX_SEQUENCE_NUMBER`; sequence assignment is the outer
/// engine's responsibility and overflow is a programmer error.
#[must_use]
pub fn pack_tag(seq: SequenceNumber, kind: ValueKind) -> u64 {
    assert!(seq <= MAX_SEQUENCE_NUMBER);
    (seq << 8) | kind as u64
}

/// Appends `user_key ++ tag(seq, kind)` to `dst`.
pub fn append_internal_key(dst: &mut Vec<u8>, user_key: &[u8], seq: SequenceNumber, kind: ValueKind) {
    dst.extend_from_slice(user_key);
    put_fixed64(dst, pack_tag(seq, kind));
}

/// The user-key portion of an internal key.
///
/// # Panics
///
/// Asserts the key is at least tag-sized.
#[must_use]
pub fn extract_user_key(internal_key: &[u8]) -> &[u8] {
    assert!(internal_key.len() >= 8, "internal key shorter than its tag");
    &internal_key[..internal_key.len() - 8]
}

/// Splits an internal key into `(user_key, sequence, kind)`.
///
/// Returns `None` on a truncated key or an unknown kind byte — the callers
/// treat that as corruption, not a panic, because the bytes may have come
/// off disk.
#[must_use]
pub fn parse_internal_key(internal_key: &[u8]) -> Option<(&[u8], SequenceNumber, ValueKind)> {
    if internal_key.len() < 8 {
        return None;
    }
    let split = internal_key.len() - 8;
    let tag = decode_fixed64(&internal_key[split..]);
    let kind = ValueKind::from_u8((tag & 0xff) as u8)?;
    Some((&internal_key[..split], tag >> 8, kind))
}

/// Total order over user keys.
///
/// Implementations must form a total order and are shared across threads
/// behind an `Arc`. `name` identifies the order on disk; opening a table
/// with a differently-named comparator is an invalid argument.
pub trait Comparator: Send + Sync {
    fn name(&self) -> &'static str;

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// If possible, shortens `start` to some key in `[start, limit)`.
    /// Used to keep index-block separators small.
    fn find_shortest_separator(&self, start: &mut Vec<u8>, limit: &[u8]);

    /// If possible, replaces `key` with a short key >= `key`.
    fn find_short_successor(&self, key: &mut Vec<u8>);
}

/// Lexicographic byte-wise ordering; the default user comparator.
#[derive(Clone, Copy, Debug, Default)]
pub struct BytewiseComparator;

impl Comparator for BytewiseComparator {
    fn name(&self) -> &'static str {
        "ebbkv.BytewiseComparator"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }

    fn find_shortest_separator(&self, start: &mut Vec<u8>, limit: &[u8]) {
        // Length of the common prefix.
        let min_len = start.len().min(limit.len());
        let mut diff = 0;
        while diff < min_len && start[diff] == limit[diff] {
            diff += 1;
        }
        if diff >= min_len {
            // One is a prefix of the other; leave start alone.
            return;
        }
        let byte = start[diff];
        if byte < 0xff && byte + 1 < limit[diff] {
            start[diff] = byte + 1;
            start.truncate(diff + 1);
            debug_assert_eq!(self.compare(start, limit), Ordering::Less);
        }
    }

    fn find_short_successor(&self, key: &mut Vec<u8>) {
        for i in 0..key.len() {
            if key[i] != 0xff {
                key[i] += 1;
                key.truncate(i + 1);
                return;
            }
        }
        // All 0xff: key is its own successor.
    }
}

/// Orders internal keys: ascending user key under the wrapped comparator,
/// then descending tag, so newer entries for a user key come first.
#[derive(Clone)]
pub struct InternalKeyComparator {
    user: Arc<dyn Comparator>,
}

impl InternalKeyComparator {
    pub fn new(user: Arc<dyn Comparator>) -> Self {
        InternalKeyComparator { user }
    }

    pub fn user_comparator(&self) -> &Arc<dyn Comparator> {
        &self.user
    }
}

impl Comparator for InternalKeyComparator {
    fn name(&self) -> &'static str {
        "ebbkv.InternalKeyComparator"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        match self.user.compare(extract_user_key(a), extract_user_key(b)) {
            Ordering::Equal => {
                let tag_a = decode_fixed64(&a[a.len() - 8..]);
                let tag_b = decode_fixed64(&b[b.len() - 8..]);
                // Descending by tag.
                tag_b.cmp(&tag_a)
            }
            ord => ord,
        }
    }

    fn find_shortest_separator(&self, start: &mut Vec<u8>, limit: &[u8]) {
        // Shorten the user-key portion; if it got shorter, re-append a tag
        // that sorts before every real entry for the new user key.
        let user_start = extract_user_key(start);
        let user_limit = extract_user_key(limit);
        let mut tmp = user_start.to_vec();
        self.user.find_shortest_separator(&mut tmp, user_limit);
        if tmp.len() < user_start.len() && self.user.compare(user_start, &tmp) == Ordering::Less {
            put_fixed64(&mut tmp, pack_tag(MAX_SEQUENCE_NUMBER, VALUE_KIND_FOR_SEEK));
            debug_assert_eq!(self.compare(start, &tmp), Ordering::Less);
            debug_assert_eq!(self.compare(&tmp, limit), Ordering::Less);
            *start = tmp;
        }
    }

    fn find_short_successor(&self, key: &mut Vec<u8>) {
        let user_key = extract_user_key(key);
        let mut tmp = user_key.to_vec();
        self.user.find_short_successor(&mut tmp);
        if tmp.len() < user_key.len() && self.user.compare(user_key, &tmp) == Ordering::Less {
            put_fixed64(&mut tmp, pack_tag(MAX_SEQUENCE_NUMBER, VALUE_KIND_FOR_SEEK));
            debug_assert_eq!(self.compare(key, &tmp), Ordering::Less);
            *key = tmp;
        }
    }
}

/// Pre-encoded probe for memtable lookups at a snapshot.
///
/// Layout: `varint32(user_key.len() + 8) ++ user_key ++ tag(seq, seek)` —
/// the same shape as a stored memtable entry's key prefix, so it can be
/// handed directly to the skiplist.
pub struct LookupKey {
    data: Vec<u8>,
    /// Offset where the internal key starts (after the length prefix).
    kstart: usize,
}

impl LookupKey {
    pub fn new(user_key: &[u8], seq: SequenceNumber) -> Self {
        let mut data = Vec::with_capacity(user_key.len() + 13);
        encode_varint32(&mut data, (user_key.len() + 8) as u32);
        let kstart = data.len();
        append_internal_key(&mut data, user_key, seq, VALUE_KIND_FOR_SEEK);
        LookupKey { data, kstart }
    }

    /// The full length-prefixed form probed into the skiplist.
    pub fn memtable_key(&self) -> &[u8] {
        &self.data
    }

    /// The internal key (user key + tag).
    pub fn internal_key(&self) -> &[u8] {
        &self.data[self.kstart..]
    }

    pub fn user_key(&self) -> &[u8] {
        &self.data[self.kstart..self.data.len() - 8]
    }
}
