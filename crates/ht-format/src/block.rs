//! The framed block: a fixed header (10-byte magic, 2-byte header-format version, compression
//! type, uncompressed/compressed lengths, a payload checksum, and a header checksum) followed
//! by a (possibly compressed) payload. Commit-log and cell-store headers extend the base header
//! with their own fields ahead of the header checksum.

use crate::checksum::fletcher32;
use crate::compression::{self, CompressionType};
use crate::error::BlockError;

/// Length, in bytes, of a [`BlockHeader`]'s fixed-size fields, not counting the header checksum
/// appended by [`append_header_checksum`].
pub const BASE_HEADER_LEN: usize = MAGIC_LEN + 2 + 1 + 4 + 4 + 4;

/// Length, in bytes, of the magic field.
pub const MAGIC_LEN: usize = 10;

/// Length, in bytes, of a header checksum field.
pub const HEADER_CHECKSUM_LEN: usize = 4;

/// The currently-written header-format version.
pub const HEADER_VERSION: u16 = 1;

/// The base fields common to every framed block header, in front of whatever extra fields a
/// specific block kind (commit-log, cell-store) inserts ahead of the header checksum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub magic:            [u8; MAGIC_LEN],
    pub version:          u16,
    pub compression:      CompressionType,
    pub uncompressed_len: u32,
    pub compressed_len:   u32,
    pub payload_checksum: u32,
}

impl BlockHeader {
    /// Appends the base header fields (everything but the header checksum) to `output`.
    pub fn append_encoded(&self, output: &mut Vec<u8>) {
        output.extend_from_slice(&self.magic);
        output.extend_from_slice(&self.version.to_be_bytes());
        output.push(u8::from(self.compression));
        output.extend_from_slice(&self.uncompressed_len.to_be_bytes());
        output.extend_from_slice(&self.compressed_len.to_be_bytes());
        output.extend_from_slice(&self.payload_checksum.to_be_bytes());
    }

    /// Decodes the base header fields from the front of `bytes`, returning the header and the
    /// unparsed remainder (any block-kind-specific fields, followed by the header checksum).
    pub fn decode(bytes: &[u8]) -> Result<(Self, &[u8]), BlockError> {
        if bytes.len() < BASE_HEADER_LEN {
            return Err(BlockError::BadHeader);
        }
        let (magic, rest) = bytes.split_at(MAGIC_LEN);
        let (version, rest) = rest.split_at(2);
        let (&compression_byte, rest) = rest.split_first().ok_or(BlockError::BadHeader)?;
        let (uncompressed_len, rest) = rest.split_at(4);
        let (compressed_len, rest) = rest.split_at(4);
        let (payload_checksum, rest) = rest.split_at(4);

        let header = Self {
            magic:            magic.try_into().unwrap(),
            version:          u16::from_be_bytes(version.try_into().unwrap()),
            compression:      CompressionType::from_byte(compression_byte)?,
            uncompressed_len: u32::from_be_bytes(uncompressed_len.try_into().unwrap()),
            compressed_len:   u32::from_be_bytes(compressed_len.try_into().unwrap()),
            payload_checksum: u32::from_be_bytes(payload_checksum.try_into().unwrap()),
        };
        Ok((header, rest))
    }
}

/// Appends a Fletcher-32 checksum of every byte written to `header` so far, finalizing it.
pub fn append_header_checksum(header: &mut Vec<u8>) {
    let checksum = fletcher32(header);
    header.extend_from_slice(&checksum.to_be_bytes());
}

/// Splits the header checksum off the end of `header_with_checksum`, verifies it against the
/// preceding bytes, and returns those preceding bytes (the header proper) on success.
pub fn verify_header_checksum(header_with_checksum: &[u8]) -> Result<&[u8], BlockError> {
    if header_with_checksum.len() < HEADER_CHECKSUM_LEN {
        return Err(BlockError::BadHeader);
    }
    let split = header_with_checksum.len() - HEADER_CHECKSUM_LEN;
    let (header, checksum_bytes) = header_with_checksum.split_at(split);
    let expected = u32::from_be_bytes(checksum_bytes.try_into().unwrap());
    if fletcher32(header) != expected {
        return Err(BlockError::ChecksumMismatch);
    }
    Ok(header)
}

/// Frames and compresses `payload` into a complete block: `magic`, the base header fields, any
/// `extra_header_fields` a caller wants inserted ahead of the header checksum (commit-log
/// revision, cell-store specifics), the header checksum, and finally the compressed payload.
///
/// If compressing does not actually shrink the payload, falls back to [`CompressionType::None`],
/// matching the "deflate" behavior of never writing an inflated block.
pub fn deflate(
    magic:               [u8; MAGIC_LEN],
    payload:             &[u8],
    compression:         CompressionType,
    extra_header_fields: &[u8],
) -> Result<Vec<u8>, BlockError> {
    let (compression, compressed) = match compression {
        CompressionType::None => (CompressionType::None, payload.to_vec()),
        other => {
            let compressed = compression::compress(payload, other)?;
            if compressed.len() < payload.len() {
                (other, compressed)
            } else {
                (CompressionType::None, payload.to_vec())
            }
        }
    };

    let header = BlockHeader {
        magic,
        version: HEADER_VERSION,
        compression,
        uncompressed_len: u32::try_from(payload.len()).map_err(|_err| BlockError::BadHeader)?,
        compressed_len: u32::try_from(compressed.len()).map_err(|_err| BlockError::BadHeader)?,
        payload_checksum: fletcher32(&compressed),
    };

    let mut output = Vec::with_capacity(BASE_HEADER_LEN + extra_header_fields.len()
        + HEADER_CHECKSUM_LEN + compressed.len());
    header.append_encoded(&mut output);
    output.extend_from_slice(extra_header_fields);
    append_header_checksum(&mut output);
    output.extend_from_slice(&compressed);

    Ok(output)
}

/// Inflates a block framed by [`deflate`], verifying its magic, header checksum, and payload
/// checksum. Returns the decoded base header, any block-kind-specific fields that sat between
/// the base header and the header checksum, and the decompressed payload.
pub fn inflate<'a>(
    block:          &'a [u8],
    expected_magic: [u8; MAGIC_LEN],
) -> Result<(BlockHeader, &'a [u8], Vec<u8>), BlockError> {
    let (header, after_base) = BlockHeader::decode(block)?;
    if header.magic != expected_magic {
        return Err(BlockError::BadMagic);
    }
    if header.version != HEADER_VERSION {
        return Err(BlockError::BadHeader);
    }

    // `inflate` only supports blocks with no extra header fields; callers with extra fields
    // (commit-log, cell-store headers) use `inflate_with_extra` instead.
    let base_len = block.len() - after_base.len();
    let checksum_end = base_len + HEADER_CHECKSUM_LEN;
    if block.len() < checksum_end {
        return Err(BlockError::BadHeader);
    }
    let _ = verify_header_checksum(&block[..checksum_end])?;
    let payload = &block[checksum_end..];

    let compressed_len = header.compressed_len as usize;
    if payload.len() < compressed_len {
        return Err(BlockError::BadHeader);
    }
    let compressed = &payload[..compressed_len];
    if fletcher32(compressed) != header.payload_checksum {
        tracing::warn!(magic = ?expected_magic, "block payload checksum mismatch");
        return Err(BlockError::ChecksumMismatch);
    }

    let decompressed = compression::decompress(
        compressed,
        header.compression,
        header.uncompressed_len as usize,
    )?;

    Ok((header, &[][..], decompressed))
}

/// As [`inflate`], but for block kinds that insert `extra_header_len` bytes of their own fields
/// between the base header and the header checksum.
pub fn inflate_with_extra<'a>(
    block:            &'a [u8],
    expected_magic:   [u8; MAGIC_LEN],
    extra_header_len: usize,
) -> Result<(BlockHeader, &'a [u8], Vec<u8>), BlockError> {
    let (header, after_base) = BlockHeader::decode(block)?;
    if header.magic != expected_magic {
        return Err(BlockError::BadMagic);
    }
    if header.version != HEADER_VERSION {
        return Err(BlockError::BadHeader);
    }
    if after_base.len() < extra_header_len + HEADER_CHECKSUM_LEN {
        return Err(BlockError::BadHeader);
    }

    let base_len = block.len() - after_base.len();
    let extra_fields = &after_base[..extra_header_len];
    let checksum_end = base_len + extra_header_len + HEADER_CHECKSUM_LEN;
    let _ = verify_header_checksum(&block[..checksum_end])?;
    let payload = &block[checksum_end..];

    let compressed_len = header.compressed_len as usize;
    if payload.len() < compressed_len {
        return Err(BlockError::BadHeader);
    }
    let compressed = &payload[..compressed_len];
    if fletcher32(compressed) != header.payload_checksum {
        tracing::warn!(magic = ?expected_magic, "block payload checksum mismatch");
        return Err(BlockError::ChecksumMismatch);
    }

    let decompressed = compression::decompress(
        compressed,
        header.compression,
        header.uncompressed_len as usize,
    )?;

    Ok((header, extra_fields, decompressed))
}

#[cfg(test)]
mod tests {
    use super::{deflate, inflate};
    use crate::compression::CompressionType;

    const MAGIC: [u8; 10] = *b"TestBlock-";

    #[test]
    fn round_trips_uncompressed() {
        let payload = b"hello, range server".to_vec();
        let block = deflate(MAGIC, &payload, CompressionType::None, &[]).unwrap();
        let (_, extra, decoded) = inflate(&block, MAGIC).unwrap();
        assert!(extra.is_empty());
        assert_eq!(decoded, payload);
    }

    #[test]
    fn round_trips_compressed() {
        let payload = b"aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa".to_vec();
        let block = deflate(MAGIC, &payload, CompressionType::Zlib, &[]).unwrap();
        let (_, _, decoded) = inflate(&block, MAGIC).unwrap();
        assert_eq!(decoded, payload);
    }

    #[test]
    fn rejects_wrong_magic() {
        let payload = b"hello".to_vec();
        let block = deflate(MAGIC, &payload, CompressionType::None, &[]).unwrap();
        assert!(inflate(&block, *b"Wrongmagic").is_err());
    }

    #[test]
    fn detects_corrupted_payload() {
        let payload = b"hello, range server".to_vec();
        let mut block = deflate(MAGIC, &payload, CompressionType::None, &[]).unwrap();
        let last = block.len() - 1;
        block[last] ^= 0xff;
        assert!(inflate(&block, MAGIC).is_err());
    }

    #[test]
    fn falls_back_to_none_when_compression_does_not_shrink() {
        let payload = b"x".to_vec();
        let block = deflate(MAGIC, &payload, CompressionType::Zlib, &[]).unwrap();
        let (header, _, decoded) = inflate(&block, MAGIC).unwrap();
        assert_eq!(header.compression, CompressionType::None);
        assert_eq!(decoded, payload);
    }
}
