//! Lock-free-read skiplist over arena-allocated keys.
//!
//! ## Thread safety
//!
//! Writes require external synchronization (the memtable's caller runs one
//! writer at a time). Reads need only a guarantee that the list outlives
//! them; beyond that they proceed without locks. Correctness rests on:
//!
//! 1. Nodes are allocated in the [`Arena`] and never freed or reused until
//!    the list (and its arena) is dropped.
//! 2. A node's key is immutable once the node is linked in.
//! 3. Forward pointers are published with `Release` stores and traversed
//!    with `Acquire` loads, so a reader that follows a pointer observes a
//!    fully initialized node. The node's own pointers are initialized with
//!    `Relaxed` stores *before* publication — the `Release` on the
//!    predecessor edge is what makes them visible.
//! 4. `max_height` is read with `Relaxed` ordering. A reader observing a
//!    stale low height still finds every node at the lower levels; a reader
//!    observing a new height before the matching head pointer was published
//!    sees null there, and null sorts after every key, so it just drops a
//!    level.

use std::cmp::Ordering as CmpOrdering;
use std::mem;
use std::ptr;
use std::sync::atomic::{AtomicPtr, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rand::rngs::SmallRng;
use rand::{Rng, SeedableRng};

use crate::arena::Arena;

pub const MAX_HEIGHT: usize = 12;
const BRANCHING: u32 = 4;

/// Total order over the raw keys stored in the list.
///
/// Keys are pointers into the owning arena; the comparator knows how to
/// decode whatever the caller stored there (the memtable stores
/// length-prefixed entries).
///
/// # Safety
///
/// `compare` is only ever called with pointers previously handed to
/// [`SkipList::insert`] (or seek targets shaped the same way) that are
/// still live.
pub trait PointerComparator: Send + Sync {
    unsafe fn compare(&self, a: *const u8, b: *const u8) -> CmpOrdering;
}

/// A skiplist node: the key pointer followed by a trailing array of
/// forward pointers, one per level, all carved from a single arena
/// allocation. `next[0]` is the lowest (densest) level.
#[repr(C)]
struct Node {
    key: *const u8,
    next: [AtomicPtr<Node>; 1],
}

impl Node {
    /// Pointer to the level-`n` forward slot. The trailing slots beyond
    /// `next[0]` live in the same arena allocation (see `new_node`).
    unsafe fn next_slot(node: *mut Node, n: usize) -> *const AtomicPtr<Node> {
        (ptr::addr_of!((*node).next) as *const AtomicPtr<Node>).add(n)
    }

    /// Acquire-load of the level-`n` successor: pairs with the Release
    /// store in `set_next`, so the returned node is fully initialized.
    unsafe fn next(node: *mut Node, n: usize) -> *mut Node {
        (*Self::next_slot(node, n)).load(Ordering::Acquire)
    }

    /// Release-store publishing `x` as the level-`n` successor.
    unsafe fn set_next(node: *mut Node, n: usize, x: *mut Node) {
        (*Self::next_slot(node, n)).store(x, Ordering::Release);
    }

    unsafe fn next_relaxed(node: *mut Node, n: usize) -> *mut Node {
        (*Self::next_slot(node, n)).load(Ordering::Relaxed)
    }

    unsafe fn set_next_relaxed(node: *mut Node, n: usize, x: *mut Node) {
        (*Self::next_slot(node, n)).store(x, Ordering::Relaxed);
    }
}

pub struct SkipList<C: PointerComparator> {
    cmp: C,
    arena: Arc<Arena>,
    head: *mut Node,
    /// Height of the entire list. Modified only by `insert`; read racily
    /// by readers (see module docs).
    max_height: AtomicUsize,
    /// Height distribution source. Only `insert` draws from it, and
    /// inserts are externally serialized, so the lock is uncontended.
    rng: Mutex<SmallRng>,
}

unsafe impl<C: PointerComparator> Send for SkipList<C> {}
unsafe impl<C: PointerComparator> Sync for SkipList<C> {}

impl<C: PointerComparator> SkipList<C> {
    pub fn new(cmp: C, arena: Arc<Arena>) -> Self {
        let head = Self::alloc_node(&arena, ptr::null(), MAX_HEIGHT);
        for i in 0..MAX_HEIGHT {
            unsafe { Node::set_next(head, i, ptr::null_mut()) };
        }
        SkipList {
            cmp,
            arena,
            head,
            max_height: AtomicUsize::new(1),
            rng: Mutex::new(SmallRng::seed_from_u64(0xdead_beef)),
        }
    }

    /// Inserts `key` into the list.
    ///
    /// REQUIRES: nothing comparing equal to `key` is currently in the list,
    /// and no other insert runs concurrently (external synchronization).
    pub fn insert(&self, key: *const u8) {
        let mut prev = [ptr::null_mut(); MAX_HEIGHT];
        let x = self.find_greater_or_equal(key, Some(&mut prev));
        assert!(
            x.is_null() || unsafe { self.cmp.compare(key, (*x).key) } != CmpOrdering::Equal,
            "duplicate key inserted into skiplist"
        );

        let height = self.random_height();
        if height > self.max_height() {
            for slot in prev.iter_mut().take(height).skip(self.max_height()) {
                *slot = self.head;
            }
            // A racing reader that sees the new height before the head
            // pointers below are set finds null there and drops a level.
            self.max_height.store(height, Ordering::Relaxed);
        }

        let x = Self::alloc_node(&self.arena, key, height);
        for i in 0..height {
            unsafe {
                // Relaxed suffices for the new node's own pointer: the
                // Release store on prev[i] below publishes it.
                Node::set_next_relaxed(x, i, Node::next_relaxed(prev[i], i));
                Node::set_next(prev[i], i, x);
            }
        }
    }

    /// Returns true iff an entry comparing equal to `key` is in the list.
    pub fn contains(&self, key: *const u8) -> bool {
        let x = self.find_greater_or_equal(key, None);
        !x.is_null() && unsafe { self.cmp.compare(key, (*x).key) } == CmpOrdering::Equal
    }

    pub fn iter(&self) -> Iter<'_, C> {
        Iter {
            list: self,
            node: ptr::null_mut(),
        }
    }

    fn max_height(&self) -> usize {
        self.max_height.load(Ordering::Relaxed)
    }

    fn random_height(&self) -> usize {
        // Increase height with probability 1 in BRANCHING.
        let mut rng = self.rng.lock().unwrap();
        let mut height = 1;
        while height < MAX_HEIGHT && rng.gen_range(0..BRANCHING) == 0 {
            height += 1;
        }
        height
    }

    /// True if `key` sorts after the key in `n`. Null sorts as infinity.
    fn key_is_after_node(&self, key: *const u8, n: *mut Node) -> bool {
        !n.is_null() && unsafe { self.cmp.compare((*n).key, key) } == CmpOrdering::Less
    }

    /// Earliest node at or after `key`, or null. If `prev` is given, fills
    /// `prev[level]` with the predecessor at each level.
    fn find_greater_or_equal(
        &self,
        key: *const u8,
        mut prev: Option<&mut [*mut Node; MAX_HEIGHT]>,
    ) -> *mut Node {
        let mut x = self.head;
        let mut level = self.max_height() - 1;
        loop {
            let next = unsafe { Node::next(x, level) };
            if self.key_is_after_node(key, next) {
                x = next;
            } else {
                if let Some(prev) = prev.as_deref_mut() {
                    prev[level] = x;
                }
                if level == 0 {
                    return next;
                }
                level -= 1;
            }
        }
    }

    /// Latest node with a key strictly less than `key`, or the head.
    fn find_less_than(&self, key: *const u8) -> *mut Node {
        let mut x = self.head;
        let mut level = self.max_height() - 1;
        loop {
            let next = unsafe { Node::next(x, level) };
            if next.is_null() || unsafe { self.cmp.compare((*next).key, key) } != CmpOrdering::Less
            {
                if level == 0 {
                    return x;
                }
                level -= 1;
            } else {
                x = next;
            }
        }
    }

    /// Last node in the list, or the head if empty.
    fn find_last(&self) -> *mut Node {
        let mut x = self.head;
        let mut level = self.max_height() - 1;
        loop {
            let next = unsafe { Node::next(x, level) };
            if next.is_null() {
                if level == 0 {
                    return x;
                }
                level -= 1;
            } else {
                x = next;
            }
        }
    }

    fn alloc_node(arena: &Arena, key: *const u8, height: usize) -> *mut Node {
        debug_assert!((1..=MAX_HEIGHT).contains(&height));
        let size =
            mem::size_of::<Node>() + (height - 1) * mem::size_of::<AtomicPtr<Node>>();
        let node = arena.allocate_aligned(size) as *mut Node;
        unsafe {
            ptr::addr_of_mut!((*node).key).write(key);
            for i in 0..height {
                (Node::next_slot(node, i) as *mut AtomicPtr<Node>)
                    .write(AtomicPtr::new(ptr::null_mut()));
            }
        }
        node
    }

    // Raw cursor primitives for owners that cannot borrow the list (the
    // memtable iterator holds an Arc to its memtable instead).

    pub(crate) fn first_raw(&self) -> *mut u8 {
        unsafe { Node::next(self.head, 0) }.cast()
    }

    pub(crate) fn last_raw(&self) -> *mut u8 {
        let n = self.find_last();
        if n == self.head {
            ptr::null_mut()
        } else {
            n.cast()
        }
    }

    pub(crate) fn seek_raw(&self, target: *const u8) -> *mut u8 {
        self.find_greater_or_equal(target, None).cast()
    }

    /// # Safety
    ///
    /// `node` must be a non-null pointer previously returned by one of the
    /// `*_raw` cursor primitives on this list.
    pub(crate) unsafe fn next_raw(&self, node: *mut u8) -> *mut u8 {
        Node::next(node.cast(), 0).cast()
    }

    /// # Safety
    ///
    /// Same contract as [`next_raw`](SkipList::next_raw).
    pub(crate) unsafe fn prev_raw(&self, node: *mut u8) -> *mut u8 {
        // No back pointers: re-search for the last node before this key.
        let prev = self.find_less_than((*node.cast::<Node>()).key);
        if prev == self.head {
            ptr::null_mut()
        } else {
            prev.cast()
        }
    }

    /// # Safety
    ///
    /// Same contract as [`next_raw`](SkipList::next_raw).
    pub(crate) unsafe fn key_raw(&self, node: *mut u8) -> *const u8 {
        (*node.cast::<Node>()).key
    }
}

/// Borrowing cursor over a skiplist. Not positioned at construction.
pub struct Iter<'a, C: PointerComparator> {
    list: &'a SkipList<C>,
    node: *mut Node,
}

impl<'a, C: PointerComparator> Iter<'a, C> {
    pub fn valid(&self) -> bool {
        !self.node.is_null()
    }

    /// REQUIRES: `valid()`
    pub fn key(&self) -> *const u8 {
        debug_assert!(self.valid());
        unsafe { (*self.node).key }
    }

    /// REQUIRES: `valid()`
    pub fn next(&mut self) {
        debug_assert!(self.valid());
        self.node = unsafe { Node::next(self.node, 0) };
    }

    /// REQUIRES: `valid()`
    pub fn prev(&mut self) {
        debug_assert!(self.valid());
        let prev = self.list.find_less_than(unsafe { (*self.node).key });
        self.node = if prev == self.list.head {
            ptr::null_mut()
        } else {
            prev
        };
    }

    /// Positions at the first entry with a key >= `target`.
    pub fn seek(&mut self, target: *const u8) {
        self.node = self.list.find_greater_or_equal(target, None);
    }

    pub fn seek_to_first(&mut self) {
        self.node = unsafe { Node::next(self.list.head, 0) };
    }

    pub fn seek_to_last(&mut self) {
        let n = self.list.find_last();
        self.node = if n == self.list.head {
            ptr::null_mut()
        } else {
            n
        };
    }
}
