//! # WAL — block-framed record log
//!
//! Provides crash-safe durability for the write path: every batch of
//! mutations is appended here **before** it becomes visible in the
//! memtable, and replayed on restart.
//!
//! ## Framing
//!
//! A log file is a sequence of 32 KiB blocks. Each physical record is:
//!
//! ```text
//! [masked crc32: u32 LE][length: u16 LE][type: u8][payload ...]
//! ```
//!
//! The 7-byte header's CRC covers the type byte and the payload, masked for
//! storage (see `coding::crc`). A logical record is carried by one FULL
//! fragment, or split into FIRST, zero or more MIDDLE, and LAST fragments —
//! each fragment fits entirely inside one block. When fewer than 7 bytes
//! remain in a block, the tail is zero-filled and writing resumes in the
//! next block, so a reader can locate record boundaries from any block
//! start.
//!
//! A zero-length logical record still emits one FULL fragment with an
//! empty payload.
//!
//! ## Reader
//!
//! [`Reader`] reassembles logical records and verifies every fragment's
//! CRC. The first framing violation (checksum mismatch, fragment sequence
//! error, length running past the block) surfaces as
//! [`LogError::Corrupt`]. A record cut short by a crash mid-write is not
//! corruption: the reader treats a truncated tail as a clean end of log,
//! keeping every complete record before it.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, WriteBytesExt};
use coding::{crc, decode_fixed32};
use thiserror::Error;

/// Logical block size of the log file.
pub const BLOCK_SIZE: usize = 32 * 1024;

/// Physical record header: crc (4) + length (2) + type (1).
pub const HEADER_SIZE: usize = 7;

/// Fragment type of a physical record.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum RecordType {
    /// Reserved for pre-allocated (zeroed) file regions and block padding.
    Zero = 0,
    Full = 1,
    First = 2,
    Middle = 3,
    Last = 4,
}

impl RecordType {
    fn from_u8(b: u8) -> Option<RecordType> {
        match b {
            0 => Some(RecordType::Zero),
            1 => Some(RecordType::Full),
            2 => Some(RecordType::First),
            3 => Some(RecordType::Middle),
            4 => Some(RecordType::Last),
            _ => None,
        }
    }
}

/// Errors surfaced by the log reader and writer.
#[derive(Debug, Error)]
pub enum LogError {
    /// An underlying I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A framing violation: the log bytes cannot be what the writer
    /// produced.
    #[error("corrupt log record: {0}")]
    Corrupt(&'static str),
}

/// Appends logical records to a destination, fragmenting across 32 KiB
/// blocks. The destination is typically an append-mode file; durability
/// (fsync policy) is the caller's concern.
pub struct Writer<W: Write> {
    dest: W,
    /// Write offset within the current block.
    block_offset: usize,
}

impl<W: Write> Writer<W> {
    /// Writer for a fresh (empty) destination.
    pub fn new(dest: W) -> Self {
        Writer {
            dest,
            block_offset: 0,
        }
    }

    /// Writer resuming a log that already holds `dest_length` bytes.
    pub fn with_offset(dest: W, dest_length: u64) -> Self {
        Writer {
            dest,
            block_offset: (dest_length % BLOCK_SIZE as u64) as usize,
        }
    }

    /// Appends one logical record.
    pub fn add_record(&mut self, record: &[u8]) -> Result<(), LogError> {
        let mut left = record;
        let mut begin = true;
        // An empty record still emits a single zero-payload FULL fragment.
        loop {
            let leftover = BLOCK_SIZE - self.block_offset;
            if leftover < HEADER_SIZE {
                // Not enough room for a header: zero-fill and start a new
                // block.
                if leftover > 0 {
                    self.dest.write_all(&[0u8; HEADER_SIZE - 1][..leftover])?;
                }
                self.block_offset = 0;
            }

            let avail = BLOCK_SIZE - self.block_offset - HEADER_SIZE;
            let fragment_length = left.len().min(avail);
            let end = fragment_length == left.len();
            let record_type = match (begin, end) {
                (true, true) => RecordType::Full,
                (true, false) => RecordType::First,
                (false, true) => RecordType::Last,
                (false, false) => RecordType::Middle,
            };

            self.emit_physical_record(record_type, &left[..fragment_length])?;
            left = &left[fragment_length..];
            begin = false;
            if left.is_empty() {
                return Ok(());
            }
        }
    }

    /// Flushes the destination's buffers (not an fsync).
    pub fn flush(&mut self) -> Result<(), LogError> {
        self.dest.flush()?;
        Ok(())
    }

    pub fn get_ref(&self) -> &W {
        &self.dest
    }

    pub fn into_inner(self) -> W {
        self.dest
    }

    fn emit_physical_record(&mut self, t: RecordType, payload: &[u8]) -> Result<(), LogError> {
        debug_assert!(payload.len() <= 0xffff);
        debug_assert!(self.block_offset + HEADER_SIZE + payload.len() <= BLOCK_SIZE);

        // CRC over the type byte then the payload, masked for storage.
        let crc = crc::mask(crc::extend(crc::value(&[t as u8]), payload));

        self.dest.write_u32::<LittleEndian>(crc)?;
        self.dest.write_u16::<LittleEndian>(payload.len() as u16)?;
        self.dest.write_u8(t as u8)?;
        self.dest.write_all(payload)?;
        self.dest.flush()?;
        self.block_offset += HEADER_SIZE + payload.len();
        Ok(())
    }
}

/// One parsed fragment, or the end of the readable log.
enum Physical {
    Fragment(RecordType, Vec<u8>),
    Eof,
}

/// Reassembles logical records from a log byte stream.
pub struct Reader<R: Read> {
    src: R,
    /// Contents of the block being consumed.
    block: Vec<u8>,
    /// Parse offset within `block`.
    offset: usize,
    /// The source returned a short block: this is the file's last block.
    at_last_block: bool,
}

impl<R: Read> Reader<R> {
    pub fn new(src: R) -> Self {
        Reader {
            src,
            block: Vec::new(),
            offset: 0,
            at_last_block: false,
        }
    }

    /// Returns the next logical record, `None` at the end of the log.
    ///
    /// # Errors
    ///
    /// [`LogError::Corrupt`] at the first framing violation;
    /// [`LogError::Io`] if the source fails.
    pub fn read_record(&mut self) -> Result<Option<Vec<u8>>, LogError> {
        let mut assembling = false;
        let mut record = Vec::new();

        loop {
            match self.next_physical()? {
                Physical::Eof => {
                    // A dangling FIRST/MIDDLE prefix means the writer died
                    // mid-record; the partial record is simply dropped.
                    return Ok(None);
                }
                Physical::Fragment(RecordType::Full, payload) => {
                    if assembling {
                        return Err(LogError::Corrupt("full record inside fragmented record"));
                    }
                    return Ok(Some(payload));
                }
                Physical::Fragment(RecordType::First, payload) => {
                    if assembling {
                        return Err(LogError::Corrupt("two first fragments without last"));
                    }
                    assembling = true;
                    record = payload;
                }
                Physical::Fragment(RecordType::Middle, payload) => {
                    if !assembling {
                        return Err(LogError::Corrupt("middle fragment without first"));
                    }
                    record.extend_from_slice(&payload);
                }
                Physical::Fragment(RecordType::Last, payload) => {
                    if !assembling {
                        return Err(LogError::Corrupt("last fragment without first"));
                    }
                    record.extend_from_slice(&payload);
                    return Ok(Some(record));
                }
                Physical::Fragment(RecordType::Zero, _) => {
                    unreachable!("zero fragments are consumed as padding")
                }
            }
        }
    }

    fn next_physical(&mut self) -> Result<Physical, LogError> {
        loop {
            if self.block.len() - self.offset < HEADER_SIZE {
                // Block tail (or an empty buffer): move to the next block.
                if !self.load_block()? {
                    return Ok(Physical::Eof);
                }
                continue;
            }

            let header = &self.block[self.offset..self.offset + HEADER_SIZE];
            let stored_crc = decode_fixed32(&header[..4]);
            let length = u16::from_le_bytes([header[4], header[5]]) as usize;
            let type_byte = header[6];

            if type_byte == RecordType::Zero as u8 && stored_crc == 0 && length == 0 {
                // Zero-filled padding; nothing else lives in this block.
                self.offset = self.block.len();
                continue;
            }

            let Some(record_type) = RecordType::from_u8(type_byte) else {
                return Err(LogError::Corrupt("unknown record type"));
            };

            let payload_start = self.offset + HEADER_SIZE;
            if payload_start + length > self.block.len() {
                if self.at_last_block {
                    // Header written, payload lost to a crash: clean end.
                    return Ok(Physical::Eof);
                }
                return Err(LogError::Corrupt("record length past block end"));
            }

            let payload = &self.block[payload_start..payload_start + length];
            let actual = crc::extend(crc::value(&[type_byte]), payload);
            if actual != crc::unmask(stored_crc) {
                return Err(LogError::Corrupt("checksum mismatch"));
            }

            let payload = payload.to_vec();
            self.offset = payload_start + length;
            return Ok(Physical::Fragment(record_type, payload));
        }
    }

    /// Reads the next block. Returns false at end of input.
    fn load_block(&mut self) -> Result<bool, LogError> {
        if self.at_last_block {
            return Ok(false);
        }
        self.block.clear();
        self.block.resize(BLOCK_SIZE, 0);
        let mut filled = 0;
        while filled < BLOCK_SIZE {
            let n = self.src.read(&mut self.block[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        self.block.truncate(filled);
        self.offset = 0;
        if filled < BLOCK_SIZE {
            self.at_last_block = true;
        }
        Ok(filled > 0)
    }
}
