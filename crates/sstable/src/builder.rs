//! Streaming producer of immutable table files.
//!
//! Sections are written in order: data blocks, the filter block, the
//! metaindex block (mapping `filter.<policy>` to the filter's location),
//! the index block (one shortened separator key per data block), and the
//! fixed-size footer.
//!
//! The index entry for a flushed data block is deferred until the first
//! key of the *next* block is known, so the separator can be shortened
//! into the gap between the blocks ("the quick brown fox" / "the who"
//! indexes as "the r").

use std::io::Write;
use std::sync::Arc;

use bloom::FilterPolicy;
use cache::ShardedLruCache;
use coding::crc;
use memtable::{BytewiseComparator, Comparator};

use crate::block::{Block, BlockBuilder};
use crate::filter_block::FilterBlockBuilder;
use crate::format::{BlockHandle, CompressionType, Footer};
use crate::{Error, Result};

/// Knobs shared by the table builder and reader.
///
/// The comparator and filter policy must match between the build side and
/// the read side; the policy is checked by name through the metaindex, and
/// changing the comparator mid-build is refused.
#[derive(Clone)]
pub struct TableOptions {
    pub comparator: Arc<dyn Comparator>,
    /// Uncompressed size at which a data block is cut.
    pub block_size: usize,
    pub block_restart_interval: usize,
    pub filter_policy: Option<Arc<dyn FilterPolicy>>,
    /// Verify block trailer CRCs on every read.
    pub verify_checksums: bool,
    /// Cache of decoded data blocks, shared across tables.
    pub block_cache: Option<Arc<ShardedLruCache<Arc<Block>>>>,
}

impl Default for TableOptions {
    fn default() -> Self {
        TableOptions {
            comparator: Arc::new(BytewiseComparator),
            block_size: 4096,
            block_restart_interval: 16,
            filter_policy: None,
            verify_checksums: true,
            block_cache: None,
        }
    }
}

pub struct TableBuilder<W: Write> {
    options: TableOptions,
    file: W,
    offset: u64,
    data_block: BlockBuilder,
    /// Restart interval 1: index keys rarely share prefixes worth the
    /// decode cost.
    index_block: BlockBuilder,
    last_key: Vec<u8>,
    num_entries: u64,
    closed: bool,
    filter_block: Option<FilterBlockBuilder>,
    /// A data block was flushed and its index entry is still owed.
    /// Invariant: true only while `data_block` is empty.
    pending_index_entry: bool,
    pending_handle: BlockHandle,
}

impl<W: Write> TableBuilder<W> {
    pub fn new(options: TableOptions, file: W) -> Self {
        let mut filter_block = options
            .filter_policy
            .as_ref()
            .map(|policy| FilterBlockBuilder::new(Arc::clone(policy)));
        if let Some(fb) = filter_block.as_mut() {
            fb.start_block(0);
        }
        TableBuilder {
            data_block: BlockBuilder::new(options.block_restart_interval),
            index_block: BlockBuilder::new(1),
            options,
            file,
            offset: 0,
            last_key: Vec::new(),
            num_entries: 0,
            closed: false,
            filter_block,
            pending_index_entry: false,
            pending_handle: BlockHandle::default(),
        }
    }

    /// Refuses option changes that would corrupt the file being built.
    pub fn change_options(&mut self, options: TableOptions) -> Result<()> {
        if options.comparator.name() != self.options.comparator.name() {
            return Err(Error::InvalidArgument(
                "changing comparator while building table".into(),
            ));
        }
        self.data_block.set_restart_interval(options.block_restart_interval);
        self.options = options;
        Ok(())
    }

    /// Appends an entry.
    ///
    /// Keys must arrive in strictly increasing comparator order; violating
    /// that is a programmer error and asserts.
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        assert!(!self.closed, "add after finish/abandon");
        if self.num_entries > 0 {
            assert_eq!(
                self.options.comparator.compare(key, &self.last_key),
                std::cmp::Ordering::Greater,
                "table keys must be added in strictly increasing order"
            );
        }

        if self.pending_index_entry {
            debug_assert!(self.data_block.is_empty());
            self.options
                .comparator
                .find_shortest_separator(&mut self.last_key, key);
            let mut handle_encoding = Vec::new();
            self.pending_handle.encode_to(&mut handle_encoding);
            self.index_block.add(&self.last_key, &handle_encoding);
            self.pending_index_entry = false;
        }

        if let Some(fb) = self.filter_block.as_mut() {
            fb.add_key(key);
        }

        self.last_key.clear();
        self.last_key.extend_from_slice(key);
        self.num_entries += 1;
        self.data_block.add(key, value);

        if self.data_block.current_size_estimate() >= self.options.block_size {
            self.flush()?;
        }
        Ok(())
    }

    /// Cuts the current data block and writes it out.
    pub fn flush(&mut self) -> Result<()> {
        assert!(!self.closed, "flush after finish/abandon");
        if self.data_block.is_empty() {
            return Ok(());
        }
        debug_assert!(!self.pending_index_entry);

        let contents = self.data_block.finish();
        self.pending_handle = self.write_raw_block(&contents, CompressionType::None)?;
        self.pending_index_entry = true;
        self.file.flush()?;

        if let Some(fb) = self.filter_block.as_mut() {
            fb.start_block(self.offset);
        }
        Ok(())
    }

    /// Writes the filter, metaindex, index, and footer. The builder is
    /// finished; only [`file_size`](Self::file_size),
    /// [`num_entries`](Self::num_entries), and
    /// [`into_inner`](Self::into_inner) remain useful.
    pub fn finish(&mut self) -> Result<()> {
        self.flush()?;
        assert!(!self.closed, "finish called twice");
        self.closed = true;

        // Filter block (never compressed: the reader addresses raw bytes).
        let mut filter_handle = None;
        if let Some(fb) = self.filter_block.take() {
            let contents = fb.finish();
            filter_handle = Some(self.write_raw_block(&contents, CompressionType::None)?);
        }

        // Metaindex: filter.<policy name> -> filter handle.
        let mut metaindex_block = BlockBuilder::new(self.options.block_restart_interval);
        if let (Some(handle), Some(policy)) = (filter_handle, self.options.filter_policy.as_ref())
        {
            let mut key = b"filter.".to_vec();
            key.extend_from_slice(policy.name().as_bytes());
            let mut handle_encoding = Vec::new();
            handle.encode_to(&mut handle_encoding);
            metaindex_block.add(&key, &handle_encoding);
        }
        let contents = metaindex_block.finish();
        let metaindex_handle = self.write_raw_block(&contents, CompressionType::None)?;

        // Index block, closing the last data block's entry with a short
        // key past everything in the table.
        if self.pending_index_entry {
            self.options.comparator.find_short_successor(&mut self.last_key);
            let mut handle_encoding = Vec::new();
            self.pending_handle.encode_to(&mut handle_encoding);
            self.index_block.add(&self.last_key, &handle_encoding);
            self.pending_index_entry = false;
        }
        let contents = self.index_block.finish();
        let index_handle = self.write_raw_block(&contents, CompressionType::None)?;

        let footer = Footer {
            metaindex_handle,
            index_handle,
        };
        let mut footer_encoding = Vec::new();
        footer.encode_to(&mut footer_encoding);
        self.file.write_all(&footer_encoding)?;
        self.offset += footer_encoding.len() as u64;
        self.file.flush()?;
        Ok(())
    }

    /// Marks the builder abandoned (the caller is discarding the file).
    pub fn abandon(&mut self) {
        assert!(!self.closed);
        self.closed = true;
    }

    pub fn num_entries(&self) -> u64 {
        self.num_entries
    }

    /// Bytes written so far; the final file size once `finish` returns.
    pub fn file_size(&self) -> u64 {
        self.offset
    }

    pub fn into_inner(self) -> W {
        self.file
    }

    fn write_raw_block(
        &mut self,
        contents: &[u8],
        compression: CompressionType,
    ) -> Result<BlockHandle> {
        let handle = BlockHandle::new(self.offset, contents.len() as u64);
        self.file.write_all(contents)?;

        let mut trailer = [0u8; 5];
        trailer[0] = compression as u8;
        let crc = crc::extend(crc::value(contents), &trailer[..1]);
        trailer[1..].copy_from_slice(&crc::mask(crc).to_le_bytes());
        self.file.write_all(&trailer)?;

        self.offset += contents.len() as u64 + trailer.len() as u64;
        Ok(handle)
    }
}
