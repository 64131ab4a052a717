//! On-disk table format scaffolding: block handles, the footer, the block
//! trailer, and the random-access file seam.

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::sync::Mutex;

use coding::{crc, decode_fixed64, decode_varint64, encode_varint64, put_fixed64};

use crate::{corruption, Error, Result};

/// Identifies a table file; the last 8 bytes of every table.
pub const TABLE_MAGIC: u64 = 0xdb47_7524_8b80_fb57;

/// Compression tag (1 byte) + masked CRC (4 bytes) after every block.
pub const BLOCK_TRAILER_SIZE: usize = 5;

/// Two varint64s: at most 10 bytes each.
pub const MAX_ENCODED_HANDLE_LENGTH: usize = 20;

/// Two padded handles plus the magic number.
pub const FOOTER_LENGTH: usize = 2 * MAX_ENCODED_HANDLE_LENGTH + 8;

/// How a block's bytes are stored. The trailer byte is always written;
/// only identity encoding is produced, and an unrecognized tag reads as
/// corruption.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionType {
    None = 0,
}

impl CompressionType {
    fn from_u8(b: u8) -> Option<CompressionType> {
        match b {
            0 => Some(CompressionType::None),
            _ => None,
        }
    }
}

/// Locates a contiguous byte range inside a table file. The size excludes
/// the block trailer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BlockHandle {
    offset: u64,
    size: u64,
}

impl BlockHandle {
    pub fn new(offset: u64, size: u64) -> Self {
        BlockHandle { offset, size }
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn encode_to(&self, dst: &mut Vec<u8>) {
        encode_varint64(dst, self.offset);
        encode_varint64(dst, self.size);
    }

    /// Decodes a handle from the front of `src`, returning it and the
    /// bytes consumed.
    pub fn decode_from(src: &[u8]) -> Result<(BlockHandle, usize)> {
        let (offset, n1) =
            decode_varint64(src).ok_or_else(|| corruption("bad block handle"))?;
        let (size, n2) =
            decode_varint64(&src[n1..]).ok_or_else(|| corruption("bad block handle"))?;
        Ok((BlockHandle { offset, size }, n1 + n2))
    }
}

/// Fixed-size tail of a table file: the metaindex and index handles,
/// zero-padded to 40 bytes, then the magic number.
#[derive(Clone, Copy, Debug, Default)]
pub struct Footer {
    pub metaindex_handle: BlockHandle,
    pub index_handle: BlockHandle,
}

impl Footer {
    pub fn encode_to(&self, dst: &mut Vec<u8>) {
        let start = dst.len();
        self.metaindex_handle.encode_to(dst);
        self.index_handle.encode_to(dst);
        dst.resize(start + 2 * MAX_ENCODED_HANDLE_LENGTH, 0);
        put_fixed64(dst, TABLE_MAGIC);
        debug_assert_eq!(dst.len(), start + FOOTER_LENGTH);
    }

    pub fn decode_from(src: &[u8]) -> Result<Footer> {
        if src.len() < FOOTER_LENGTH {
            return Err(corruption("footer too short"));
        }
        let magic = decode_fixed64(&src[FOOTER_LENGTH - 8..]);
        if magic != TABLE_MAGIC {
            return Err(corruption("not a table file (bad magic number)"));
        }
        let (metaindex_handle, used) = BlockHandle::decode_from(src)?;
        let (index_handle, _) = BlockHandle::decode_from(&src[used..])?;
        Ok(Footer {
            metaindex_handle,
            index_handle,
        })
    }
}

/// Positional reads against an immutable file, the seam to the outer
/// environment's storage. Implementations must be usable from multiple
/// threads.
pub trait RandomAccess: Send + Sync {
    /// Reads exactly `len` bytes starting at `offset`. A read past the end
    /// of the file fails with `UnexpectedEof`.
    fn read(&self, offset: u64, len: usize) -> io::Result<Vec<u8>>;
}

/// [`RandomAccess`] over an open file. A mutex serializes the seek+read
/// pair so one persistent descriptor serves concurrent readers.
pub struct FileSource {
    file: Mutex<File>,
}

impl FileSource {
    pub fn new(file: File) -> Self {
        FileSource {
            file: Mutex::new(file),
        }
    }
}

impl RandomAccess for FileSource {
    fn read(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let mut file = self.file.lock().unwrap();
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = vec![0u8; len];
        file.read_exact(&mut buf)?;
        Ok(buf)
    }
}

/// In-memory tables, used throughout the tests.
impl RandomAccess for Vec<u8> {
    fn read(&self, offset: u64, len: usize) -> io::Result<Vec<u8>> {
        let start = offset as usize;
        let end = start.checked_add(len).filter(|&e| e <= self.len());
        match end {
            Some(end) => Ok(self[start..end].to_vec()),
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "read past end of table",
            )),
        }
    }
}

/// Reads the block described by `handle` and checks its trailer.
///
/// Returns the raw block contents (restart array included, trailer
/// stripped). With `verify_checksums`, the masked trailer CRC is checked
/// over the block bytes plus the compression tag.
pub fn read_block(
    file: &dyn RandomAccess,
    handle: &BlockHandle,
    verify_checksums: bool,
) -> Result<Vec<u8>> {
    let n = handle.size() as usize;
    let mut raw = match file.read(handle.offset(), n + BLOCK_TRAILER_SIZE) {
        Ok(raw) => raw,
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            return Err(corruption("truncated block read"));
        }
        Err(e) => return Err(Error::Io(e)),
    };

    if verify_checksums {
        let stored = coding::decode_fixed32(&raw[n + 1..]);
        let actual = crc::value(&raw[..n + 1]);
        if actual != crc::unmask(stored) {
            return Err(corruption("block checksum mismatch"));
        }
    }

    match CompressionType::from_u8(raw[n]) {
        Some(CompressionType::None) => {
            raw.truncate(n);
            Ok(raw)
        }
        None => Err(corruption("bad block compression type")),
    }
}
