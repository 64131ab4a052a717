use std::sync::Arc;

use bloom::BloomFilterPolicy;
use cache::ShardedLruCache;
use memtable::{
    extract_user_key, parse_internal_key, BytewiseComparator, InternalIterator,
    InternalKeyComparator, ValueKind,
};

use crate::builder::{TableBuilder, TableOptions};
use crate::table::Table;
use crate::tests::ikey;
use crate::{Error, FOOTER_LENGTH};

fn build_table(options: &TableOptions, entries: &[(Vec<u8>, Vec<u8>)]) -> Vec<u8> {
    let mut builder = TableBuilder::new(options.clone(), Vec::new());
    for (k, v) in entries {
        builder.add(k, v).unwrap();
    }
    builder.finish().unwrap();
    let size = builder.file_size();
    let file = builder.into_inner();
    assert_eq!(file.len() as u64, size);
    file
}

fn open_table(options: TableOptions, file: Vec<u8>) -> Table {
    let size = file.len() as u64;
    Table::open(options, Box::new(file), size).unwrap()
}

fn bytewise_entries(keys: &[&str]) -> Vec<(Vec<u8>, Vec<u8>)> {
    keys.iter()
        .map(|k| (k.as_bytes().to_vec(), b"v".to_vec()))
        .collect()
}

#[test]
fn small_table_round_trip() {
    let options = TableOptions::default();
    let file = build_table(&options, &bytewise_entries(&["a", "b", "c", "d", "e"]));
    let table = open_table(options, file);

    let (key, value) = table.get(b"c").unwrap().unwrap();
    assert_eq!(key, b"c");
    assert_eq!(value, b"v");

    let mut iter = table.iter();
    iter.seek_to_first();
    for expected in ["a", "b", "c", "d", "e"] {
        assert!(iter.valid());
        assert_eq!(iter.key(), expected.as_bytes());
        assert_eq!(iter.value(), b"v");
        iter.next();
    }
    assert!(!iter.valid());
}

#[test]
fn get_lands_on_first_key_at_or_after() {
    let options = TableOptions::default();
    let file = build_table(&options, &bytewise_entries(&["b", "d", "f"]));
    let table = open_table(options, file);

    let (key, _) = table.get(b"c").unwrap().unwrap();
    assert_eq!(key, b"d");
    let (key, _) = table.get(b"").unwrap().unwrap();
    assert_eq!(key, b"b");
    assert!(table.get(b"g").unwrap().is_none());
}

#[test]
fn multi_block_table() {
    // Small blocks force a real index with many entries.
    let options = TableOptions {
        block_size: 256,
        ..TableOptions::default()
    };
    let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..1000u32)
        .map(|i| {
            (
                format!("key{i:06}").into_bytes(),
                format!("value-{i}").into_bytes(),
            )
        })
        .collect();
    let file = build_table(&options, &entries);
    let table = open_table(options, file);

    // Every key resolves through index + block seek.
    for (k, v) in &entries {
        let (fk, fv) = table.get(k).unwrap().unwrap();
        assert_eq!(&fk, k);
        assert_eq!(&fv, v);
    }

    // Full scan, both directions.
    let mut iter = table.iter();
    iter.seek_to_first();
    for (k, v) in &entries {
        assert!(iter.valid());
        assert_eq!(iter.key(), k.as_slice());
        assert_eq!(iter.value(), v.as_slice());
        iter.next();
    }
    assert!(!iter.valid());

    iter.seek_to_last();
    for (k, _) in entries.iter().rev() {
        assert!(iter.valid());
        assert_eq!(iter.key(), k.as_slice());
        iter.prev();
    }
    assert!(!iter.valid());

    // Seek into the middle and walk across a block boundary.
    let mut iter = table.iter();
    iter.seek(b"key000500");
    assert_eq!(iter.key(), b"key000500");
    iter.prev();
    assert_eq!(iter.key(), b"key000499");
    iter.next();
    iter.next();
    assert_eq!(iter.key(), b"key000501");
}

#[test]
fn approximate_offsets_are_monotonic() {
    let options = TableOptions {
        block_size: 256,
        ..TableOptions::default()
    };
    let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..500u32)
        .map(|i| (format!("k{i:05}").into_bytes(), vec![b'x'; 20]))
        .collect();
    let file = build_table(&options, &entries);
    let file_len = file.len() as u64;
    let table = open_table(options, file);

    let first = table.approximate_offset_of(b"k00000");
    let mid = table.approximate_offset_of(b"k00250");
    let past = table.approximate_offset_of(b"zzz");
    assert!(first <= mid);
    assert!(mid < past);
    assert!(past <= file_len);
}

#[test]
fn empty_table() {
    let options = TableOptions::default();
    let file = build_table(&options, &[]);
    let table = open_table(options, file);
    assert!(table.get(b"anything").unwrap().is_none());
    let mut iter = table.iter();
    iter.seek_to_first();
    assert!(!iter.valid());
    iter.seek_to_last();
    assert!(!iter.valid());
}

#[test]
fn internal_key_table_resolves_versions() {
    let options = TableOptions {
        comparator: Arc::new(InternalKeyComparator::new(Arc::new(BytewiseComparator))),
        ..TableOptions::default()
    };
    // Internal-key order: user asc, then sequence desc.
    let entries = vec![
        (ikey(b"a", 5, ValueKind::Value), b"a5".to_vec()),
        (ikey(b"a", 4, ValueKind::Deletion), Vec::new()),
        (ikey(b"a", 2, ValueKind::Value), b"a2".to_vec()),
        (ikey(b"b", 3, ValueKind::Value), b"b3".to_vec()),
    ];
    let file = build_table(&options, &entries);
    let table = open_table(options, file);

    // Probe at snapshot 6: the newest version of "a".
    let probe = ikey(b"a", 6, ValueKind::Value);
    let (found, value) = table.get(&probe).unwrap().unwrap();
    let (user_key, seq, kind) = parse_internal_key(&found).unwrap();
    assert_eq!((user_key, seq, kind), (&b"a"[..], 5, ValueKind::Value));
    assert_eq!(value, b"a5");

    // Probe at snapshot 3: lands on the tombstone-shadowed version.
    let probe = ikey(b"a", 3, ValueKind::Value);
    let (found, _) = table.get(&probe).unwrap().unwrap();
    let (user_key, seq, _) = parse_internal_key(&found).unwrap();
    assert_eq!((user_key, seq), (&b"a"[..], 2));

    // Probe past "a": first entry for "b".
    let probe = ikey(b"a", 1, ValueKind::Value);
    let (found, _) = table.get(&probe).unwrap().unwrap();
    assert_eq!(extract_user_key(&found), b"b");
}

#[test]
fn filter_skips_missing_keys_and_passes_present_ones() {
    let options = TableOptions {
        filter_policy: Some(Arc::new(BloomFilterPolicy::default())),
        ..TableOptions::default()
    };
    let entries = bytewise_entries(&["apple", "banana", "cherry"]);
    let file = build_table(&options, &entries);
    let table = open_table(options, file);

    for k in ["apple", "banana", "cherry"] {
        let (found, _) = table.get(k.as_bytes()).unwrap().unwrap();
        assert_eq!(found, k.as_bytes());
    }
    // Misses stay misses whether the filter short-circuits them or not.
    assert!(table.get(b"durian").unwrap().map(|(k, _)| k != b"durian").unwrap_or(true));
}

#[test]
fn filterless_reader_ignores_filter_block() {
    // Build with a filter, read without configuring one.
    let build_options = TableOptions {
        filter_policy: Some(Arc::new(BloomFilterPolicy::default())),
        ..TableOptions::default()
    };
    let file = build_table(&build_options, &bytewise_entries(&["k1", "k2"]));
    let table = open_table(TableOptions::default(), file);
    let (found, _) = table.get(b"k2").unwrap().unwrap();
    assert_eq!(found, b"k2");
}

#[test]
fn block_cache_serves_repeated_reads() {
    let cache = Arc::new(ShardedLruCache::new(1 << 20));
    let options = TableOptions {
        block_size: 256,
        block_cache: Some(Arc::clone(&cache)),
        ..TableOptions::default()
    };
    let entries: Vec<(Vec<u8>, Vec<u8>)> = (0..200u32)
        .map(|i| (format!("key{i:04}").into_bytes(), vec![b'v'; 50]))
        .collect();
    let file = build_table(&options, &entries);
    let table = open_table(options, file);

    assert_eq!(cache.total_charge(), 0);
    for (k, v) in &entries {
        let (_, fv) = table.get(k).unwrap().unwrap();
        assert_eq!(&fv, v);
    }
    let after_first_pass = cache.total_charge();
    assert!(after_first_pass > 0);

    // A second pass is served from cache: no growth.
    for (k, _) in &entries {
        table.get(k).unwrap().unwrap();
    }
    assert_eq!(cache.total_charge(), after_first_pass);
}

#[test]
fn two_tables_do_not_collide_in_a_shared_cache() {
    let cache = Arc::new(ShardedLruCache::new(1 << 20));
    let options = TableOptions {
        block_cache: Some(Arc::clone(&cache)),
        ..TableOptions::default()
    };
    let file_a = build_table(&options, &bytewise_entries(&["k"]));
    // Same layout, different value: same block offsets in both files.
    let entries_b = vec![(b"k".to_vec(), b"w".to_vec())];
    let file_b = build_table(&options, &entries_b);

    let table_a = open_table(options.clone(), file_a);
    let table_b = open_table(options, file_b);

    let (_, va) = table_a.get(b"k").unwrap().unwrap();
    let (_, vb) = table_b.get(b"k").unwrap().unwrap();
    assert_eq!(va, b"v");
    assert_eq!(vb, b"w");
}

#[test]
fn table_round_trips_through_a_real_file() -> anyhow::Result<()> {
    use crate::format::FileSource;

    let dir = tempfile::tempdir()?;
    let path = dir.path().join("000007.sst");

    let options = TableOptions::default();
    let bytes = build_table(&options, &bytewise_entries(&["alpha", "beta", "gamma"]));
    std::fs::write(&path, &bytes)?;

    let file = std::fs::File::open(&path)?;
    let size = file.metadata()?.len();
    let table = Table::open(options, Box::new(FileSource::new(file)), size)?;

    let (key, value) = table.get(b"beta")?.unwrap();
    assert_eq!(key, b"beta");
    assert_eq!(value, b"v");
    assert!(table.get(b"delta")?.map(|(k, _)| k == b"gamma").unwrap_or(false));
    Ok(())
}

#[test]
fn corruption_is_detected() {
    let options = TableOptions::default();
    let good = build_table(&options, &bytewise_entries(&["a", "b", "c"]));

    // Bad magic.
    let mut bad = good.clone();
    let n = bad.len();
    bad[n - 1] ^= 0xff;
    let size = bad.len() as u64;
    assert!(matches!(
        Table::open(options.clone(), Box::new(bad), size),
        Err(Error::Corruption(_))
    ));

    // Too small to hold a footer.
    let tiny = vec![0u8; FOOTER_LENGTH - 1];
    assert!(matches!(
        Table::open(options.clone(), Box::new(tiny), (FOOTER_LENGTH - 1) as u64),
        Err(Error::Corruption(_))
    ));

    // Flipped data byte: caught by the block CRC at lookup time.
    let mut flipped = good.clone();
    flipped[2] ^= 0x40;
    let size = flipped.len() as u64;
    let table = Table::open(options, Box::new(flipped), size).unwrap();
    assert!(matches!(table.get(b"a"), Err(Error::Corruption(_))));
}

#[test]
#[should_panic(expected = "strictly increasing")]
fn out_of_order_add_asserts() {
    let mut builder = TableBuilder::new(TableOptions::default(), Vec::new());
    builder.add(b"b", b"v").unwrap();
    builder.add(b"a", b"v").unwrap();
}

#[test]
fn change_options_rejects_comparator_swap() {
    let mut builder = TableBuilder::new(TableOptions::default(), Vec::new());
    builder.add(b"a", b"v").unwrap();
    let swapped = TableOptions {
        comparator: Arc::new(InternalKeyComparator::new(Arc::new(BytewiseComparator))),
        ..TableOptions::default()
    };
    assert!(matches!(
        builder.change_options(swapped),
        Err(Error::InvalidArgument(_))
    ));
    // Same comparator is fine.
    builder.change_options(TableOptions::default()).unwrap();
}
