//! The iterator seam shared by the memtable, table blocks, and merging
//! layers.

/// Cursor over a stream of internal-key entries in internal-key order.
///
/// Implemented by the memtable iterator, block and table iterators, and
/// the merging iterator, so read-path code can reconcile any mix of
/// sources through one interface.
///
/// All accessors besides `valid` and the `seek*` family REQUIRE a valid
/// position; violating that is a programmer error (checked by debug
/// assertions), not a recoverable one.
pub trait InternalIterator {
    /// True iff the cursor is positioned at an entry.
    fn valid(&self) -> bool;

    /// Positions at the first entry, if any.
    fn seek_to_first(&mut self);

    /// Positions at the last entry, if any.
    fn seek_to_last(&mut self);

    /// Positions at the first entry with an internal key >= `target`.
    fn seek(&mut self, target: &[u8]);

    /// Advances to the next entry. REQUIRES: `valid()`.
    fn next(&mut self);

    /// Steps back to the previous entry; invalid if none precede.
    /// REQUIRES: `valid()`.
    fn prev(&mut self);

    /// The internal key at the current position. REQUIRES: `valid()`.
    fn key(&self) -> &[u8];

    /// The value at the current position. REQUIRES: `valid()`.
    fn value(&self) -> &[u8];
}
