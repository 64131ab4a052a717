//! Read side of the table format: open a finished file, look keys up,
//! iterate.

use std::sync::Arc;

use coding::put_fixed64;
use memtable::InternalIterator;

use crate::block::{Block, BlockIter};
use crate::builder::TableOptions;
use crate::filter_block::FilterBlockReader;
use crate::format::{read_block, BlockHandle, Footer, RandomAccess, FOOTER_LENGTH};
use crate::{corruption, Result};

/// An open, immutable table file.
///
/// Holds the parsed index and filter in memory; data blocks are fetched
/// on demand, through the shared block cache when one is configured.
pub struct Table {
    options: TableOptions,
    file: Box<dyn RandomAccess>,
    index_block: Arc<Block>,
    filter: Option<FilterBlockReader>,
    /// Data ends where the metaindex begins; used for offset estimates.
    metaindex_offset: u64,
    /// Partitions the shared block cache's key space per table.
    cache_id: u64,
}

impl Table {
    /// Opens a table of `size` bytes behind `file`.
    ///
    /// Reads and parses the footer, index block, and (when the options
    /// name a filter policy matching the file's) the filter block.
    pub fn open(options: TableOptions, file: Box<dyn RandomAccess>, size: u64) -> Result<Table> {
        if size < FOOTER_LENGTH as u64 {
            return Err(corruption("file too small to be a table"));
        }
        let footer_bytes = file.read(size - FOOTER_LENGTH as u64, FOOTER_LENGTH)?;
        let footer = Footer::decode_from(&footer_bytes)?;

        let index_contents =
            read_block(file.as_ref(), &footer.index_handle, options.verify_checksums)?;
        let index_block = Arc::new(Block::new(index_contents)?);

        let filter = Self::read_filter(&options, file.as_ref(), &footer)?;

        let cache_id = options
            .block_cache
            .as_ref()
            .map_or(0, |cache| cache.new_id());

        Ok(Table {
            options,
            file,
            index_block,
            filter,
            metaindex_offset: footer.metaindex_handle.offset(),
            cache_id,
        })
    }

    fn read_filter(
        options: &TableOptions,
        file: &dyn RandomAccess,
        footer: &Footer,
    ) -> Result<Option<FilterBlockReader>> {
        let Some(policy) = options.filter_policy.as_ref() else {
            return Ok(None);
        };
        let metaindex_contents =
            read_block(file, &footer.metaindex_handle, options.verify_checksums)?;
        let metaindex = Arc::new(Block::new(metaindex_contents)?);

        let mut key = b"filter.".to_vec();
        key.extend_from_slice(policy.name().as_bytes());
        // Metaindex keys are policy names, compared bytewise.
        let mut iter = BlockIter::new(metaindex, Arc::new(memtable::BytewiseComparator));
        iter.seek(&key);
        if !iter.valid() || iter.key() != key.as_slice() {
            // Built without this filter (or with a different policy).
            return Ok(None);
        }
        let (handle, _) = BlockHandle::decode_from(iter.value())?;
        let contents = read_block(file, &handle, options.verify_checksums)?;
        Ok(Some(FilterBlockReader::new(Arc::clone(policy), contents)))
    }

    /// Point lookup. Returns the first entry at or after `key` inside the
    /// data block the index points at, or `None` when the filter or the
    /// block rules the key out. The caller owns interpreting the returned
    /// entry (user-key match, sequence visibility, tombstones).
    pub fn get(&self, key: &[u8]) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let mut index_iter = BlockIter::new(Arc::clone(&self.index_block), Arc::clone(&self.options.comparator));
        index_iter.seek(key);
        if !index_iter.valid() {
            self.check_iter(&index_iter)?;
            return Ok(None);
        }

        let (handle, _) = BlockHandle::decode_from(index_iter.value())?;
        if let Some(filter) = self.filter.as_ref() {
            if !filter.key_may_match(handle.offset(), key) {
                return Ok(None);
            }
        }

        let block = self.block_contents(&handle)?;
        let mut block_iter = BlockIter::new(block, Arc::clone(&self.options.comparator));
        block_iter.seek(key);
        if !block_iter.valid() {
            self.check_iter(&block_iter)?;
            return Ok(None);
        }
        Ok(Some((block_iter.key().to_vec(), block_iter.value().to_vec())))
    }

    /// Cursor over every entry in the table, in comparator order.
    pub fn iter(&self) -> TableIter<'_> {
        TableIter {
            table: self,
            index_iter: BlockIter::new(Arc::clone(&self.index_block), Arc::clone(&self.options.comparator)),
            data_iter: None,
            data_block_handle: BlockHandle::default(),
        }
    }

    /// Approximate file offset where `key`'s data would live. Keys past
    /// the last entry map to the start of the non-data sections.
    pub fn approximate_offset_of(&self, key: &[u8]) -> u64 {
        let mut index_iter = BlockIter::new(Arc::clone(&self.index_block), Arc::clone(&self.options.comparator));
        index_iter.seek(key);
        if index_iter.valid() {
            if let Ok((handle, _)) = BlockHandle::decode_from(index_iter.value()) {
                return handle.offset();
            }
        }
        self.metaindex_offset
    }

    /// Fetches a data block, through the cache when configured.
    fn block_contents(&self, handle: &BlockHandle) -> Result<Arc<Block>> {
        let Some(cache) = self.options.block_cache.as_ref() else {
            let contents = read_block(self.file.as_ref(), handle, self.options.verify_checksums)?;
            return Ok(Arc::new(Block::new(contents)?));
        };

        let mut cache_key = Vec::with_capacity(16);
        put_fixed64(&mut cache_key, self.cache_id);
        put_fixed64(&mut cache_key, handle.offset());

        if let Some(cache_handle) = cache.lookup(&cache_key) {
            let block = cache.value(&cache_handle);
            cache.release(cache_handle);
            return Ok(block);
        }

        let contents = read_block(self.file.as_ref(), handle, self.options.verify_checksums)?;
        let block = Arc::new(Block::new(contents)?);
        let charge = block.size();
        let cache_handle = cache.insert(
            &cache_key,
            Arc::clone(&block),
            charge,
            // The Arc is the ownership; dropping it is the whole cleanup.
            Box::new(|_, _| {}),
        );
        cache.release(cache_handle);
        Ok(block)
    }

    fn check_iter(&self, iter: &BlockIter) -> Result<()> {
        if iter.corrupt() {
            return Err(corruption("malformed entry inside table block"));
        }
        Ok(())
    }
}

/// Two-level cursor: an index-block iterator picks the data block, a
/// data-block iterator walks its entries.
pub struct TableIter<'a> {
    table: &'a Table,
    index_iter: BlockIter,
    data_iter: Option<BlockIter>,
    /// Handle backing `data_iter`, to skip redundant block fetches.
    data_block_handle: BlockHandle,
}

impl TableIter<'_> {
    fn init_data_block(&mut self) {
        if !self.index_iter.valid() {
            self.data_iter = None;
            return;
        }
        let Ok((handle, _)) = BlockHandle::decode_from(self.index_iter.value()) else {
            self.data_iter = None;
            return;
        };
        if self.data_iter.is_some() && handle == self.data_block_handle {
            return; // already positioned in this block
        }
        match self.table.block_contents(&handle) {
            Ok(block) => {
                self.data_iter = Some(BlockIter::new(block, Arc::clone(&self.table.options.comparator)));
                self.data_block_handle = handle;
            }
            Err(_) => self.data_iter = None,
        }
    }

    fn data_iter_exhausted(&self) -> bool {
        self.data_iter.as_ref().map_or(true, |di| !di.valid())
    }

    /// Moves forward past data blocks with no (remaining) entries.
    fn skip_empty_data_blocks_forward(&mut self) {
        while self.data_iter_exhausted() {
            if !self.index_iter.valid() {
                self.data_iter = None;
                return;
            }
            self.index_iter.next();
            self.init_data_block();
            if let Some(di) = self.data_iter.as_mut() {
                di.seek_to_first();
            }
        }
    }

    fn skip_empty_data_blocks_backward(&mut self) {
        while self.data_iter_exhausted() {
            if !self.index_iter.valid() {
                self.data_iter = None;
                return;
            }
            self.index_iter.prev();
            self.init_data_block();
            if let Some(di) = self.data_iter.as_mut() {
                di.seek_to_last();
            }
        }
    }
}

impl InternalIterator for TableIter<'_> {
    fn valid(&self) -> bool {
        self.data_iter.as_ref().map_or(false, |di| di.valid())
    }

    fn seek_to_first(&mut self) {
        self.index_iter.seek_to_first();
        self.init_data_block();
        if let Some(di) = self.data_iter.as_mut() {
            di.seek_to_first();
        }
        self.skip_empty_data_blocks_forward();
    }

    fn seek_to_last(&mut self) {
        self.index_iter.seek_to_last();
        self.init_data_block();
        if let Some(di) = self.data_iter.as_mut() {
            di.seek_to_last();
        }
        self.skip_empty_data_blocks_backward();
    }

    fn seek(&mut self, target: &[u8]) {
        self.index_iter.seek(target);
        self.init_data_block();
        if let Some(di) = self.data_iter.as_mut() {
            di.seek(target);
        }
        self.skip_empty_data_blocks_forward();
    }

    fn next(&mut self) {
        debug_assert!(self.valid());
        self.data_iter.as_mut().expect("valid iterator").next();
        self.skip_empty_data_blocks_forward();
    }

    fn prev(&mut self) {
        debug_assert!(self.valid());
        self.data_iter.as_mut().expect("valid iterator").prev();
        self.skip_empty_data_blocks_backward();
    }

    fn key(&self) -> &[u8] {
        self.data_iter.as_ref().expect("valid iterator").key()
    }

    fn value(&self) -> &[u8] {
        self.data_iter.as_ref().expect("valid iterator").value()
    }
}
