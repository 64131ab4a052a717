use coding::crc;

use crate::format::{
    read_block, BlockHandle, CompressionType, Footer, RandomAccess, FOOTER_LENGTH, TABLE_MAGIC,
};
use crate::Error;

/// Encodes `contents` as a raw block with its 5-byte trailer, the way the
/// table builder writes one.
fn raw_block(contents: &[u8]) -> Vec<u8> {
    let mut out = contents.to_vec();
    out.push(CompressionType::None as u8);
    let crc = crc::extend(crc::value(contents), &[CompressionType::None as u8]);
    out.extend_from_slice(&crc::mask(crc).to_le_bytes());
    out
}

#[test]
fn block_handle_round_trip() {
    for &(offset, size) in &[(0u64, 0u64), (1, 2), (127, 128), (1 << 30, 1 << 20), (u64::MAX, 1)] {
        let handle = BlockHandle::new(offset, size);
        let mut buf = Vec::new();
        handle.encode_to(&mut buf);
        assert!(buf.len() <= 20);
        let (decoded, used) = BlockHandle::decode_from(&buf).unwrap();
        assert_eq!(decoded, handle);
        assert_eq!(used, buf.len());
    }
}

#[test]
fn block_handle_rejects_truncation() {
    let mut buf = Vec::new();
    BlockHandle::new(u64::MAX, u64::MAX).encode_to(&mut buf);
    assert!(matches!(
        BlockHandle::decode_from(&buf[..3]),
        Err(Error::Corruption(_))
    ));
}

#[test]
fn footer_round_trip() {
    let footer = Footer {
        metaindex_handle: BlockHandle::new(1000, 200),
        index_handle: BlockHandle::new(1205, 4096),
    };
    let mut buf = Vec::new();
    footer.encode_to(&mut buf);
    assert_eq!(buf.len(), FOOTER_LENGTH);
    // Magic sits in the final 8 bytes, little-endian.
    assert_eq!(coding::decode_fixed64(&buf[40..]), TABLE_MAGIC);

    let decoded = Footer::decode_from(&buf).unwrap();
    assert_eq!(decoded.metaindex_handle, footer.metaindex_handle);
    assert_eq!(decoded.index_handle, footer.index_handle);
}

#[test]
fn footer_rejects_bad_magic() {
    let footer = Footer {
        metaindex_handle: BlockHandle::new(1, 2),
        index_handle: BlockHandle::new(3, 4),
    };
    let mut buf = Vec::new();
    footer.encode_to(&mut buf);
    buf[FOOTER_LENGTH - 1] ^= 0xff;
    assert!(matches!(
        Footer::decode_from(&buf),
        Err(Error::Corruption(_))
    ));
    assert!(matches!(
        Footer::decode_from(&buf[..10]),
        Err(Error::Corruption(_))
    ));
}

#[test]
fn read_block_round_trip() {
    let contents = b"some block contents with enough bytes to matter".to_vec();
    let file = raw_block(&contents);
    let handle = BlockHandle::new(0, contents.len() as u64);
    assert_eq!(read_block(&file, &handle, true).unwrap(), contents);
    assert_eq!(read_block(&file, &handle, false).unwrap(), contents);
}

#[test]
fn read_block_at_offset() {
    let mut file = vec![0xaa; 100]; // unrelated leading bytes
    let contents = b"payload".to_vec();
    file.extend_from_slice(&raw_block(&contents));
    let handle = BlockHandle::new(100, contents.len() as u64);
    assert_eq!(read_block(&file, &handle, true).unwrap(), contents);
}

#[test]
fn read_block_detects_corruption() {
    let contents = b"block contents".to_vec();
    let handle = BlockHandle::new(0, contents.len() as u64);

    // Flipped payload byte.
    let mut file = raw_block(&contents);
    file[3] ^= 0x01;
    assert!(matches!(
        read_block(&file, &handle, true),
        Err(Error::Corruption(_))
    ));
    // Without verification the flip sails through.
    assert!(read_block(&file, &handle, false).is_ok());

    // Unknown compression tag (CRC covers it, so check unverified too).
    let mut file = raw_block(&contents);
    let tag_at = contents.len();
    file[tag_at] = 7;
    assert!(matches!(
        read_block(&file, &handle, false),
        Err(Error::Corruption(_))
    ));

    // Truncated file.
    let file = raw_block(&contents);
    let truncated = file[..file.len() - 2].to_vec();
    assert!(matches!(
        read_block(&truncated, &handle, true),
        Err(Error::Corruption(_))
    ));
}

#[test]
fn in_memory_random_access() {
    let data: Vec<u8> = (0..100u8).collect();
    assert_eq!(data.read(10, 5).unwrap(), vec![10, 11, 12, 13, 14]);
    assert!(data.read(99, 2).is_err());
    assert!(data.read(200, 1).is_err());
}
