//! # Cache — sharded LRU with explicit handles
//!
//! Caches opaque values under byte keys with a capacity measured in
//! caller-supplied *charge* units. The table layer uses one instance for
//! decoded data blocks; a second instance can cache open table handles.
//!
//! ## Sharding
//!
//! Operations hash the key once and route to one of 16 shards by the top
//! hash bits; each shard has its own mutex and `ceil(capacity/16)` of the
//! budget, so concurrent readers touching different shards never contend.
//!
//! ## Reference counting
//!
//! Every entry tracks how many owners it has: the cache itself (while the
//! entry is `in_cache`) plus one per outstanding [`Handle`]. Within a
//! shard, entries live on exactly one of two circular lists:
//!
//! - **LRU** — entries whose only reference is the cache's, ordered from
//!   oldest (`head.next`) to newest (`head.prev`). Only these are
//!   evictable.
//! - **IN-USE** — entries some client also holds, in no particular order.
//!
//! A lookup moves the entry to IN-USE; releasing the last outside handle
//! moves it back to LRU as the newest entry. When the final reference of
//! any entry disappears (eviction, [`erase`](ShardedLruCache::erase), or a
//! release after eviction), the entry's deleter runs with the key and the
//! value. Deleters run under the shard mutex and must not call back into
//! the cache.
//!
//! Entries live in a per-shard slab addressed by stable slot indices;
//! `prev`/`next` are slot indices and two sentinel slots anchor the
//! rings, so list surgery is index arithmetic with no self-referential
//! pointers. A `HashMap` from key to slot is the lookup index.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

const SHARD_BITS: u32 = 4;
const NUM_SHARDS: usize = 1 << SHARD_BITS;

/// Runs when an entry's final reference disappears.
pub type Deleter<V> = Box<dyn FnOnce(&[u8], V) + Send>;

/// Reference to a cached entry. Holding a handle pins the entry (it will
/// not be evicted and its value stays live) until the handle is passed to
/// [`ShardedLruCache::release`]. Dropping a handle without releasing it
/// leaks the entry's reference and the entry with it.
#[derive(Debug)]
pub struct Handle {
    shard: usize,
    slot: usize,
}

struct Entry<V> {
    key: Box<[u8]>,
    value: Option<V>,
    deleter: Option<Deleter<V>>,
    charge: usize,
    /// References: the cache's own (while `in_cache`) plus outstanding
    /// handles.
    refs: u32,
    in_cache: bool,
    prev: usize,
    next: usize,
}

/// One shard: a slab of entries, the key index, and the two rings.
struct Shard<V> {
    capacity: usize,
    usage: usize,
    slab: Vec<Option<Entry<V>>>,
    free: Vec<usize>,
    table: HashMap<Box<[u8]>, usize>,
}

/// Sentinel slots anchoring the circular lists.
const LRU: usize = 0;
const IN_USE: usize = 1;

impl<V> Shard<V> {
    fn new(capacity: usize) -> Self {
        let mut shard = Shard {
            capacity,
            usage: 0,
            slab: Vec::new(),
            free: Vec::new(),
            table: HashMap::new(),
        };
        for sentinel in [LRU, IN_USE] {
            shard.slab.push(Some(Entry {
                key: Box::default(),
                value: None,
                deleter: None,
                charge: 0,
                refs: 0,
                in_cache: false,
                prev: sentinel,
                next: sentinel,
            }));
        }
        shard
    }

    fn entry(&self, slot: usize) -> &Entry<V> {
        self.slab[slot].as_ref().expect("dangling cache slot")
    }

    fn entry_mut(&mut self, slot: usize) -> &mut Entry<V> {
        self.slab[slot].as_mut().expect("dangling cache slot")
    }

    fn list_remove(&mut self, slot: usize) {
        let (prev, next) = {
            let e = self.entry(slot);
            (e.prev, e.next)
        };
        self.entry_mut(prev).next = next;
        self.entry_mut(next).prev = prev;
    }

    /// Links `slot` in as the newest entry of `list` (just before the
    /// sentinel).
    fn list_append(&mut self, list: usize, slot: usize) {
        let tail = self.entry(list).prev;
        {
            let e = self.entry_mut(slot);
            e.next = list;
            e.prev = tail;
        }
        self.entry_mut(tail).next = slot;
        self.entry_mut(list).prev = slot;
    }

    fn acquire(&mut self, slot: usize) {
        let e = self.entry(slot);
        if e.refs == 1 && e.in_cache {
            // Gaining its first outside reference: leave the LRU ring.
            self.list_remove(slot);
            self.list_append(IN_USE, slot);
        }
        self.entry_mut(slot).refs += 1;
    }

    fn unref(&mut self, slot: usize) {
        let e = self.entry_mut(slot);
        assert!(e.refs > 0);
        e.refs -= 1;
        if e.refs == 0 {
            assert!(!e.in_cache);
            let mut entry = self.slab[slot].take().expect("dangling cache slot");
            self.free.push(slot);
            if let (Some(value), Some(deleter)) = (entry.value.take(), entry.deleter.take()) {
                deleter(&entry.key, value);
            }
        } else if e.in_cache && e.refs == 1 {
            // Last outside reference gone: back to LRU as newest.
            self.list_remove(slot);
            self.list_append(LRU, slot);
        }
    }

    fn insert(
        &mut self,
        key: &[u8],
        value: V,
        charge: usize,
        deleter: Deleter<V>,
    ) -> usize {
        let entry = Entry {
            key: key.to_vec().into_boxed_slice(),
            value: Some(value),
            deleter: Some(deleter),
            charge,
            refs: 1, // the returned handle
            in_cache: false,
            prev: usize::MAX,
            next: usize::MAX,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slab[slot] = Some(entry);
                slot
            }
            None => {
                self.slab.push(Some(entry));
                self.slab.len() - 1
            }
        };

        if self.capacity > 0 {
            {
                let e = self.entry_mut(slot);
                e.refs += 1; // the cache's reference
                e.in_cache = true;
            }
            self.list_append(IN_USE, slot);
            self.usage += charge;
            if let Some(old) = self.table.insert(key.to_vec().into_boxed_slice(), slot) {
                self.finish_erase(old);
            }
        }
        // capacity == 0 turns caching off; the entry lives only through
        // the returned handle.

        while self.usage > self.capacity && self.entry(LRU).next != LRU {
            let oldest = self.entry(LRU).next;
            let key = self.entry(oldest).key.clone();
            let removed = self.table.remove(&key);
            debug_assert_eq!(removed, Some(oldest));
            self.finish_erase(oldest);
        }

        slot
    }

    /// Finishes removing an entry already unlinked from `table`: detaches
    /// it from its ring and drops the cache's reference.
    fn finish_erase(&mut self, slot: usize) {
        let e = self.entry(slot);
        assert!(e.in_cache);
        let charge = e.charge;
        self.list_remove(slot);
        self.entry_mut(slot).in_cache = false;
        self.usage -= charge;
        self.unref(slot);
    }

    fn lookup(&mut self, key: &[u8]) -> Option<usize> {
        let slot = *self.table.get(key)?;
        self.acquire(slot);
        Some(slot)
    }

    fn erase(&mut self, key: &[u8]) {
        if let Some(slot) = self.table.remove(key) {
            self.finish_erase(slot);
        }
    }

    fn prune(&mut self) {
        while self.entry(LRU).next != LRU {
            let slot = self.entry(LRU).next;
            assert_eq!(self.entry(slot).refs, 1);
            let key = self.entry(slot).key.clone();
            self.table.remove(&key);
            self.finish_erase(slot);
        }
    }
}

impl<V> Drop for Shard<V> {
    fn drop(&mut self) {
        // Outstanding handles at teardown are a caller bug; entries still
        // owned solely by the cache get their deleters run.
        for slot in 2..self.slab.len() {
            if let Some(mut entry) = self.slab[slot].take() {
                debug_assert_eq!(entry.refs, 1, "cache dropped with live handle");
                if let (Some(value), Some(deleter)) = (entry.value.take(), entry.deleter.take())
                {
                    deleter(&entry.key, value);
                }
            }
        }
    }
}

/// Sharded LRU cache. See the module docs for semantics.
pub struct ShardedLruCache<V> {
    shards: Vec<Mutex<Shard<V>>>,
    last_id: AtomicU64,
}

impl<V> ShardedLruCache<V> {
    /// Cache with a total capacity of `capacity` charge units, split evenly
    /// across shards. A zero capacity disables caching: inserts only
    /// produce handles.
    pub fn new(capacity: usize) -> Self {
        let per_shard = (capacity + NUM_SHARDS - 1) / NUM_SHARDS;
        ShardedLruCache {
            shards: (0..NUM_SHARDS).map(|_| Mutex::new(Shard::new(per_shard))).collect(),
            last_id: AtomicU64::new(0),
        }
    }

    /// Inserts `key -> value` with the given charge, displacing any
    /// existing entry for the key. Returns a handle the caller must
    /// eventually release.
    pub fn insert(&self, key: &[u8], value: V, charge: usize, deleter: Deleter<V>) -> Handle {
        let shard = Self::shard_of(key);
        let slot = self.shards[shard].lock().unwrap().insert(key, value, charge, deleter);
        Handle { shard, slot }
    }

    /// Looks `key` up, pinning the entry if present.
    pub fn lookup(&self, key: &[u8]) -> Option<Handle> {
        let shard = Self::shard_of(key);
        let slot = self.shards[shard].lock().unwrap().lookup(key)?;
        Some(Handle { shard, slot })
    }

    /// Releases a handle obtained from `insert` or `lookup`.
    pub fn release(&self, handle: Handle) {
        self.shards[handle.shard].lock().unwrap().unref(handle.slot);
    }

    /// Drops the cached entry for `key`, if any. Outstanding handles keep
    /// the value alive; the deleter runs once the last one is released.
    pub fn erase(&self, key: &[u8]) {
        let shard = Self::shard_of(key);
        self.shards[shard].lock().unwrap().erase(key);
    }

    /// Evicts everything not currently pinned.
    pub fn prune(&self) {
        for shard in &self.shards {
            shard.lock().unwrap().prune();
        }
    }

    /// Sum of the charges of all cached entries.
    pub fn total_charge(&self) -> usize {
        self.shards.iter().map(|s| s.lock().unwrap().usage).sum()
    }

    /// A process-unique id, letting cache clients partition one shared
    /// cache's key space (each table prefixes block keys with its id).
    pub fn new_id(&self) -> u64 {
        self.last_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    fn shard_of(key: &[u8]) -> usize {
        (hash32(key) >> (32 - SHARD_BITS)) as usize
    }
}

impl<V: Clone> ShardedLruCache<V> {
    /// The value behind a handle. Values are cheap clones: callers cache
    /// `Arc<T>`, so the clone is a reference-count bump.
    pub fn value(&self, handle: &Handle) -> V {
        self.shards[handle.shard]
            .lock()
            .unwrap()
            .entry(handle.slot)
            .value
            .clone()
            .expect("value taken from live cache entry")
    }
}

/// FNV-1a, 32-bit. Shard routing needs speed and spread, not cryptography.
fn hash32(data: &[u8]) -> u32 {
    const FNV_PRIME: u32 = 0x0100_0193;
    let mut hash: u32 = 0x811c_9dc5;
    for &byte in data {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    hash
}
