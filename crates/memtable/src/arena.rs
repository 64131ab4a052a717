//! Bump allocator backing the memtable's skiplist.
//!
//! The arena hands out raw byte regions carved from a list of heap chunks.
//! Individual allocations are never reclaimed; everything is released at
//! once when the arena drops. Chunks are boxed slices that never move or
//! shrink, so a pointer returned by [`Arena::allocate`] stays valid (and
//! its contents stable once written) for the arena's whole lifetime — the
//! property the skiplist's lock-free readers depend on.

use std::mem;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

const CHUNK_SIZE: usize = 4096;

struct Core {
    chunks: Vec<Box<[u8]>>,
    /// Bump pointer into the last chunk.
    ptr: *mut u8,
    remaining: usize,
}

// The raw bump pointer always points into a chunk owned by `chunks`; the
// Mutex around Core serializes all mutation.
unsafe impl Send for Core {}

pub struct Arena {
    core: Mutex<Core>,
    /// Total bytes reserved from the heap. Readers may sample this without
    /// holding the allocation lock; staleness is fine for a gauge.
    usage: AtomicUsize,
}

unsafe impl Send for Arena {}
unsafe impl Sync for Arena {}

impl Arena {
    pub fn new() -> Self {
        Arena {
            core: Mutex::new(Core {
                chunks: Vec::new(),
                ptr: std::ptr::null_mut(),
                remaining: 0,
            }),
            usage: AtomicUsize::new(0),
        }
    }

    /// Returns a pointer to `bytes` contiguous writable bytes.
    ///
    /// # Panics
    ///
    /// Panics if `bytes` is zero.
    pub fn allocate(&self, bytes: usize) -> *mut u8 {
        assert!(bytes > 0, "arena allocations must be non-empty");
        let mut core = self.core.lock().unwrap();
        if bytes <= core.remaining {
            let p = core.ptr;
            core.ptr = unsafe { core.ptr.add(bytes) };
            core.remaining -= bytes;
            return p;
        }
        self.allocate_fallback(&mut core, bytes)
    }

    /// Like [`allocate`](Arena::allocate), but the result is aligned to the
    /// machine pointer size, suitable for structures holding atomics.
    pub fn allocate_aligned(&self, bytes: usize) -> *mut u8 {
        const ALIGN: usize = mem::align_of::<usize>();
        assert!(bytes > 0, "arena allocations must be non-empty");
        let mut core = self.core.lock().unwrap();
        let slop = {
            let misalign = core.ptr as usize & (ALIGN - 1);
            if misalign == 0 {
                0
            } else {
                ALIGN - misalign
            }
        };
        let needed = bytes + slop;
        if needed <= core.remaining {
            let p = unsafe { core.ptr.add(slop) };
            core.ptr = unsafe { core.ptr.add(needed) };
            core.remaining -= needed;
            p
        } else {
            // Fresh chunks come from the global allocator and are already
            // pointer-aligned.
            self.allocate_fallback(&mut core, bytes)
        }
    }

    /// Total heap bytes reserved by the arena so far. Safe to read from any
    /// thread without further synchronization.
    pub fn memory_usage(&self) -> usize {
        self.usage.load(Ordering::Relaxed)
    }

    fn allocate_fallback(&self, core: &mut Core, bytes: usize) -> *mut u8 {
        if bytes > CHUNK_SIZE / 4 {
            // Large allocations get their own chunk so the tail of the
            // current chunk is not wasted.
            return self.new_chunk(core, bytes);
        }
        let p = self.new_chunk(core, CHUNK_SIZE);
        core.ptr = unsafe { p.add(bytes) };
        core.remaining = CHUNK_SIZE - bytes;
        p
    }

    fn new_chunk(&self, core: &mut Core, size: usize) -> *mut u8 {
        let mut chunk = vec![0u8; size].into_boxed_slice();
        let p = chunk.as_mut_ptr();
        core.chunks.push(chunk);
        self.usage
            .fetch_add(size + mem::size_of::<Box<[u8]>>(), Ordering::Relaxed);
        p
    }
}

impl Default for Arena {
    fn default() -> Self {
        Self::new()
    }
}
