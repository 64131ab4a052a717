//! Masked CRC32 checksums for log records and block trailers.
//!
//! The log file and the table format both embed checksums in data that is
//! itself checksummed when re-framed (a log record can carry a table block,
//! a table block can carry log bytes). Storing the raw CRC would let a
//! naïve recomputation of the embedded CRC collide with the framing CRC, so
//! every stored checksum is masked: rotated right by 15 bits, plus a
//! constant.

const MASK_DELTA: u32 = 0xa282_ead8;

/// CRC of `data`.
#[must_use]
pub fn value(data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(data);
    hasher.finalize()
}

/// CRC of the concatenation of the bytes behind `init_crc` and `data`.
///
/// `extend(value(a), b) == value(a ++ b)`.
#[must_use]
pub fn extend(init_crc: u32, data: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new_with_initial(init_crc);
    hasher.update(data);
    hasher.finalize()
}

/// Masks `crc` for storage alongside checksummed payloads.
#[must_use]
pub fn mask(crc: u32) -> u32 {
    ((crc >> 15) | (crc << 17)).wrapping_add(MASK_DELTA)
}

/// Inverse of [`mask`].
#[must_use]
pub fn unmask(masked: u32) -> u32 {
    let rot = masked.wrapping_sub(MASK_DELTA);
    (rot >> 17) | (rot << 15)
}
