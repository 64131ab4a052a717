use std::cmp::Ordering;
use std::sync::Arc;

use crate::key::{
    append_internal_key, extract_user_key, pack_tag, parse_internal_key, BytewiseComparator,
    Comparator, InternalKeyComparator, LookupKey, ValueKind, MAX_SEQUENCE_NUMBER,
};

fn ikey(user_key: &[u8], seq: u64, kind: ValueKind) -> Vec<u8> {
    let mut out = Vec::new();
    append_internal_key(&mut out, user_key, seq, kind);
    out
}

fn icmp() -> InternalKeyComparator {
    InternalKeyComparator::new(Arc::new(BytewiseComparator))
}

#[test]
fn tag_round_trip() {
    for &(user_key, seq, kind) in &[
        (&b""[..], 0u64, ValueKind::Value),
        (b"k", 1, ValueKind::Deletion),
        (b"corruption", 1 << 33, ValueKind::Value),
        (b"z", MAX_SEQUENCE_NUMBER, ValueKind::Deletion),
    ] {
        let encoded = ikey(user_key, seq, kind);
        assert_eq!(extract_user_key(&encoded), user_key);
        let (u, s, k) = parse_internal_key(&encoded).unwrap();
        assert_eq!((u, s, k), (user_key, seq, kind));
    }
}

#[test]
fn parse_rejects_garbage() {
    assert!(parse_internal_key(b"short").is_none());
    // Unknown kind byte.
    let mut bad = ikey(b"k", 7, ValueKind::Value);
    let tag = pack_tag(7, ValueKind::Value) | 0x7f;
    let n = bad.len();
    bad[n - 8..].copy_from_slice(&tag.to_le_bytes());
    assert!(parse_internal_key(&bad).is_none());
}

#[test]
#[should_panic]
fn pack_tag_rejects_oversized_sequence() {
    pack_tag(MAX_SEQUENCE_NUMBER + 1, ValueKind::Value);
}

#[test]
fn internal_key_order_is_user_asc_then_seq_desc() {
    let cmp = icmp();
    // Ascending by user key.
    assert_eq!(
        cmp.compare(&ikey(b"a", 5, ValueKind::Value), &ikey(b"b", 1, ValueKind::Value)),
        Ordering::Less
    );
    // Same user key: higher sequence first.
    assert_eq!(
        cmp.compare(&ikey(b"a", 9, ValueKind::Value), &ikey(b"a", 3, ValueKind::Value)),
        Ordering::Less
    );
    // Same sequence: Value (kind 1) sorts before Deletion (kind 0).
    assert_eq!(
        cmp.compare(
            &ikey(b"a", 5, ValueKind::Value),
            &ikey(b"a", 5, ValueKind::Deletion)
        ),
        Ordering::Less
    );
}

#[test]
fn bytewise_shortest_separator() {
    let cases: &[(&[u8], &[u8], &[u8])] = &[
        // First differing byte can be bumped.
        (b"abcdefghij", b"abcdzz", b"abcdf"),
        // Bump would reach the limit byte: unchanged.
        (b"abc", b"abd", b"abc"),
        // Prefix of the limit: unchanged.
        (b"foo", b"foobar", b"foo"),
        // Equal keys: unchanged.
        (b"same", b"same", b"same"),
        // 0xff cannot be bumped.
        (b"\xff\xff", b"\xff\xff\xff", b"\xff\xff"),
    ];
    for &(start, limit, want) in cases {
        let mut s = start.to_vec();
        BytewiseComparator.find_shortest_separator(&mut s, limit);
        assert_eq!(s, want, "separator({start:?}, {limit:?})");
        // Postcondition: start <= sep, and sep < limit whenever start < limit.
        assert!(s.as_slice() >= start);
        if start < limit {
            assert!(s.as_slice() < limit);
        }
    }
}

#[test]
fn bytewise_short_successor() {
    let mut k = b"hello".to_vec();
    BytewiseComparator.find_short_successor(&mut k);
    assert_eq!(k, b"i");

    let mut k = b"\xff\xffabc".to_vec();
    BytewiseComparator.find_short_successor(&mut k);
    assert_eq!(k, b"\xff\xffb");

    // All 0xff stays put.
    let mut k = vec![0xff, 0xff];
    BytewiseComparator.find_short_successor(&mut k);
    assert_eq!(k, vec![0xff, 0xff]);
}

#[test]
fn internal_separator_preserves_key_validity() {
    let cmp = icmp();
    let start = ikey(b"foo", 100, ValueKind::Value);
    let limit = ikey(b"hello", 200, ValueKind::Value);
    let mut sep = start.clone();
    cmp.find_shortest_separator(&mut sep, &limit);

    // Shortened to user key "g" with the seek tag re-appended.
    assert_eq!(extract_user_key(&sep), b"g");
    let (_, seq, kind) = parse_internal_key(&sep).unwrap();
    assert_eq!(seq, MAX_SEQUENCE_NUMBER);
    assert_eq!(kind, ValueKind::Value);
    assert_eq!(cmp.compare(&start, &sep), Ordering::Less);
    assert_eq!(cmp.compare(&sep, &limit), Ordering::Less);

    // Nothing to shorten when user keys share no improvable prefix gap.
    let start = ikey(b"abc", 1, ValueKind::Value);
    let limit = ikey(b"abd", 9, ValueKind::Value);
    let mut sep = start.clone();
    cmp.find_shortest_separator(&mut sep, &limit);
    assert_eq!(sep, start);
}

#[test]
fn internal_short_successor() {
    let cmp = icmp();
    let key = ikey(b"foo", 42, ValueKind::Deletion);
    let mut succ = key.clone();
    cmp.find_short_successor(&mut succ);
    assert_eq!(extract_user_key(&succ), b"g");
    assert_eq!(cmp.compare(&key, &succ), Ordering::Less);
}

#[test]
fn lookup_key_views() {
    let lk = LookupKey::new(b"user", 99);
    assert_eq!(lk.user_key(), b"user");
    assert_eq!(extract_user_key(lk.internal_key()), b"user");
    let (_, seq, kind) = parse_internal_key(lk.internal_key()).unwrap();
    assert_eq!(seq, 99);
    assert_eq!(kind, ValueKind::Value);
    // memtable_key = varint32(12) + internal key.
    assert_eq!(lk.memtable_key()[0], 12);
    assert_eq!(&lk.memtable_key()[1..], lk.internal_key());
}
