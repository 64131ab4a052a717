use std::sync::Arc;

use crate::iter::InternalIterator;
use crate::key::{
    parse_internal_key, BytewiseComparator, InternalKeyComparator, LookupKey, ValueKind,
};
use crate::{MemTable, MemTableIterator};

fn new_memtable() -> Arc<MemTable> {
    Arc::new(MemTable::new(InternalKeyComparator::new(Arc::new(
        BytewiseComparator,
    ))))
}

#[test]
fn get_miss_on_empty_table() {
    let mem = new_memtable();
    assert_eq!(mem.get(&LookupKey::new(b"nope", 100)), None);
}

#[test]
fn newest_visible_entry_wins() {
    let mem = new_memtable();
    mem.add(4, ValueKind::Deletion, b"a", b"");
    mem.add(5, ValueKind::Value, b"a", b"x");

    // Snapshot above both: the live value.
    assert_eq!(mem.get(&LookupKey::new(b"a", 6)), Some(Some(b"x".to_vec())));
    // Snapshot between: the tombstone hides nothing newer, reports deleted.
    assert_eq!(mem.get(&LookupKey::new(b"a", 4)), Some(None));
    // Snapshot below everything: no visible entry.
    assert_eq!(mem.get(&LookupKey::new(b"a", 3)), None);
    // Unrelated key: plain miss.
    assert_eq!(mem.get(&LookupKey::new(b"b", 6)), None);
}

#[test]
fn overwrites_resolve_by_sequence() {
    let mem = new_memtable();
    mem.add(1, ValueKind::Value, b"k", b"v1");
    mem.add(2, ValueKind::Value, b"k", b"v2");
    mem.add(3, ValueKind::Deletion, b"k", b"");
    mem.add(4, ValueKind::Value, b"k", b"v4");

    assert_eq!(mem.get(&LookupKey::new(b"k", 1)), Some(Some(b"v1".to_vec())));
    assert_eq!(mem.get(&LookupKey::new(b"k", 2)), Some(Some(b"v2".to_vec())));
    assert_eq!(mem.get(&LookupKey::new(b"k", 3)), Some(None));
    assert_eq!(mem.get(&LookupKey::new(b"k", 9)), Some(Some(b"v4".to_vec())));
}

#[test]
fn empty_user_key_and_empty_value() {
    let mem = new_memtable();
    mem.add(1, ValueKind::Value, b"", b"empty-key");
    mem.add(2, ValueKind::Value, b"k", b"");

    assert_eq!(
        mem.get(&LookupKey::new(b"", 5)),
        Some(Some(b"empty-key".to_vec()))
    );
    assert_eq!(mem.get(&LookupKey::new(b"k", 5)), Some(Some(Vec::new())));
}

#[test]
fn iterator_yields_internal_key_order() {
    let mem = new_memtable();
    mem.add(10, ValueKind::Value, b"b", b"vb");
    mem.add(11, ValueKind::Value, b"a", b"va-new");
    mem.add(9, ValueKind::Value, b"a", b"va-old");
    mem.add(12, ValueKind::Deletion, b"c", b"");

    let mut iter = MemTableIterator::new(Arc::clone(&mem));
    iter.seek_to_first();

    let mut got = Vec::new();
    while iter.valid() {
        let (user_key, seq, kind) = parse_internal_key(iter.key()).unwrap();
        got.push((user_key.to_vec(), seq, kind, iter.value().to_vec()));
        iter.next();
    }

    // Ascending user key; descending sequence within a user key.
    assert_eq!(
        got,
        vec![
            (b"a".to_vec(), 11, ValueKind::Value, b"va-new".to_vec()),
            (b"a".to_vec(), 9, ValueKind::Value, b"va-old".to_vec()),
            (b"b".to_vec(), 10, ValueKind::Value, b"vb".to_vec()),
            (b"c".to_vec(), 12, ValueKind::Deletion, Vec::new()),
        ]
    );
}

#[test]
fn iterator_seek_and_reverse() {
    let mem = new_memtable();
    for (seq, key) in [(1u64, &b"a"[..]), (2, b"c"), (3, b"e")] {
        mem.add(seq, ValueKind::Value, key, b"v");
    }

    let mut iter = MemTableIterator::new(Arc::clone(&mem));
    iter.seek(&LookupKey::new(b"b", 100).internal_key().to_vec());
    assert!(iter.valid());
    assert_eq!(parse_internal_key(iter.key()).unwrap().0, b"c");

    iter.prev();
    assert!(iter.valid());
    assert_eq!(parse_internal_key(iter.key()).unwrap().0, b"a");

    iter.prev();
    assert!(!iter.valid());

    iter.seek_to_last();
    assert_eq!(parse_internal_key(iter.key()).unwrap().0, b"e");
}

#[test]
fn memory_usage_grows_with_writes() {
    let mem = new_memtable();
    let before = mem.approximate_memory_usage();
    for i in 0..100u64 {
        mem.add(i, ValueKind::Value, format!("key{i:04}").as_bytes(), &[0u8; 128]);
    }
    let after = mem.approximate_memory_usage();
    assert!(after > before);
    // At least the payload bytes must be accounted for.
    assert!(after - before >= 100 * 128);
}

#[test]
fn iterator_keeps_table_alive() {
    let mut iter = {
        let mem = new_memtable();
        mem.add(1, ValueKind::Value, b"k", b"v");
        MemTableIterator::new(mem)
        // The iterator's own reference keeps the arena alive.
    };
    iter.seek_to_first();
    assert!(iter.valid());
    assert_eq!(iter.value(), b"v");
}
