//! The v6 trailer: a fixed-size record at the very end of a cell store file, padded to the
//! direct-IO alignment boundary so a reader can locate it by reading the last aligned page
//! without first knowing the file's exact length semantics.

use bitflags::bitflags;

use ht_format::{CompressionType, fletcher32};

use crate::error::CellStoreReadError;

/// The only trailer format version this crate writes or accepts.
pub const TRAILER_VERSION: u8 = 6;

/// Cell store files are padded so that the trailer starts on a multiple of this boundary,
/// matching the common direct-IO sector size.
pub const DIRECT_IO_ALIGNMENT: u64 = 512;

/// Fixed on-disk size of a [`Trailer`], including its magic and checksum.
pub const TRAILER_LEN: usize = 256;

const TRAILER_MAGIC: [u8; 8] = *b"HTCSTlr6";

bitflags! {
    /// Per-store flags recorded in the trailer.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct TrailerFlags: u32 {
        /// Block index offsets are stored as 64-bit values rather than 32-bit.
        const INDEX_64BIT      = 1 << 0;
        /// This store was produced by (or is shared after) a range split.
        const SPLIT            = 1 << 1;
        /// This store was produced by a major compaction (all sources merged, garbage dropped).
        const MAJOR_COMPACTION = 1 << 2;
    }
}

/// Bloom filter mode recorded in the trailer; see [`crate::bloom`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BloomFilterMode {
    Disabled,
    Rows,
    RowsAndColumns,
}

impl BloomFilterMode {
    const fn to_byte(self) -> u8 {
        match self {
            Self::Disabled       => 0,
            Self::Rows           => 1,
            Self::RowsAndColumns => 2,
        }
    }

    const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            0 => Some(Self::Disabled),
            1 => Some(Self::Rows),
            2 => Some(Self::RowsAndColumns),
            _ => None,
        }
    }
}

/// The v6 cell store trailer. See module docs and spec §4.3 for field semantics.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Trailer {
    pub flags:                  TrailerFlags,
    pub fix_index_offset:       u64,
    pub var_index_offset:       u64,
    pub filter_offset:          u64,
    pub filter_length:          u64,
    pub replaced_files_offset:  u64,
    pub replaced_files_length:  u64,
    pub replaced_files_count:   u32,
    pub blocksize:              u32,
    pub compression:            CompressionType,
    /// `compressed_bytes / uncompressed_bytes`, as a ratio scaled by `1_000_000` for
    /// fixed-point storage.
    pub compression_ratio_ppm:  u32,
    pub total_entries:          u64,
    pub delete_count:           u64,
    pub key_bytes:               u64,
    pub value_bytes:             u64,
    pub expirable_bytes:         u64,
    pub timestamp_min:          i64,
    pub timestamp_max:          i64,
    pub max_revision:           i64,
    pub bloom_filter_mode:      BloomFilterMode,
    pub bloom_hash_count:        u8,
    pub index_entry_count:      u32,
    pub table_id:                u64,
    pub table_generation:        u32,
    pub create_time:             i64,
}

impl Trailer {
    /// Encodes the trailer into exactly [`TRAILER_LEN`] bytes, zero-padded after the checksum.
    #[must_use]
    pub fn encode(&self) -> [u8; TRAILER_LEN] {
        let mut body = Vec::with_capacity(TRAILER_LEN);
        body.extend_from_slice(&TRAILER_MAGIC);
        body.push(TRAILER_VERSION);
        body.push(self.bloom_filter_mode.to_byte());
        body.push(self.bloom_hash_count);
        body.push(u8::from(self.compression));
        body.extend_from_slice(&self.flags.bits().to_be_bytes());
        body.extend_from_slice(&self.fix_index_offset.to_be_bytes());
        body.extend_from_slice(&self.var_index_offset.to_be_bytes());
        body.extend_from_slice(&self.filter_offset.to_be_bytes());
        body.extend_from_slice(&self.filter_length.to_be_bytes());
        body.extend_from_slice(&self.replaced_files_offset.to_be_bytes());
        body.extend_from_slice(&self.replaced_files_length.to_be_bytes());
        body.extend_from_slice(&self.replaced_files_count.to_be_bytes());
        body.extend_from_slice(&self.blocksize.to_be_bytes());
        body.extend_from_slice(&self.compression_ratio_ppm.to_be_bytes());
        body.extend_from_slice(&self.total_entries.to_be_bytes());
        body.extend_from_slice(&self.delete_count.to_be_bytes());
        body.extend_from_slice(&self.key_bytes.to_be_bytes());
        body.extend_from_slice(&self.value_bytes.to_be_bytes());
        body.extend_from_slice(&self.expirable_bytes.to_be_bytes());
        body.extend_from_slice(&self.timestamp_min.to_be_bytes());
        body.extend_from_slice(&self.timestamp_max.to_be_bytes());
        body.extend_from_slice(&self.max_revision.to_be_bytes());
        body.extend_from_slice(&self.index_entry_count.to_be_bytes());
        body.extend_from_slice(&self.table_id.to_be_bytes());
        body.extend_from_slice(&self.table_generation.to_be_bytes());
        body.extend_from_slice(&self.create_time.to_be_bytes());

        let checksum = fletcher32(&body);
        body.extend_from_slice(&checksum.to_be_bytes());

        assert!(body.len() <= TRAILER_LEN, "trailer body grew past TRAILER_LEN, bump it");
        let mut out = [0_u8; TRAILER_LEN];
        out[..body.len()].copy_from_slice(&body);
        out
    }

    /// Decodes a trailer from the last [`TRAILER_LEN`] bytes of a cell store file.
    pub fn decode(bytes: &[u8]) -> Result<Self, CellStoreReadError> {
        if bytes.len() < TRAILER_LEN {
            return Err(CellStoreReadError::BadTrailer);
        }
        let mut cursor = Cursor(bytes);

        let magic = cursor.take(8)?;
        if magic != TRAILER_MAGIC {
            return Err(CellStoreReadError::BadTrailer);
        }
        let version = cursor.byte()?;
        if version != TRAILER_VERSION {
            return Err(CellStoreReadError::UnsupportedVersion(version));
        }
        let bloom_filter_mode = BloomFilterMode::from_byte(cursor.byte()?)
            .ok_or(CellStoreReadError::BadTrailer)?;
        let bloom_hash_count = cursor.byte()?;
        let compression = CompressionType::from_byte(cursor.byte()?)
            .map_err(|_err| CellStoreReadError::BadTrailer)?;
        let flags = TrailerFlags::from_bits_truncate(cursor.u32()?);
        let fix_index_offset = cursor.u64()?;
        let var_index_offset = cursor.u64()?;
        let filter_offset = cursor.u64()?;
        let filter_length = cursor.u64()?;
        let replaced_files_offset = cursor.u64()?;
        let replaced_files_length = cursor.u64()?;
        let replaced_files_count = cursor.u32()?;
        let blocksize = cursor.u32()?;
        let compression_ratio_ppm = cursor.u32()?;
        let total_entries = cursor.u64()?;
        let delete_count = cursor.u64()?;
        let key_bytes = cursor.u64()?;
        let value_bytes = cursor.u64()?;
        let expirable_bytes = cursor.u64()?;
        let timestamp_min = cursor.i64()?;
        let timestamp_max = cursor.i64()?;
        let max_revision = cursor.i64()?;
        let index_entry_count = cursor.u32()?;
        let table_id = cursor.u64()?;
        let table_generation = cursor.u32()?;
        let create_time = cursor.i64()?;

        let checksummed_len = 8 + 1 + 1 + 1 + 1 + 4
            + 8 * 6 + 4 * 3 + 8 * 5 + 8 * 3 + 4 + 8 + 4 + 8;
        let start = bytes.len() - TRAILER_LEN;
        let checksum_field_start = start + checksummed_len;
        let expected = u32::from_be_bytes(
            bytes[checksum_field_start..checksum_field_start + 4].try_into().unwrap(),
        );
        if fletcher32(&bytes[start..checksum_field_start]) != expected {
            return Err(CellStoreReadError::BadTrailer);
        }

        Ok(Self {
            flags,
            fix_index_offset,
            var_index_offset,
            filter_offset,
            filter_length,
            replaced_files_offset,
            replaced_files_length,
            replaced_files_count,
            blocksize,
            compression,
            compression_ratio_ppm,
            total_entries,
            delete_count,
            key_bytes,
            value_bytes,
            expirable_bytes,
            timestamp_min,
            timestamp_max,
            max_revision,
            bloom_filter_mode,
            bloom_hash_count,
            index_entry_count,
            table_id,
            table_generation,
            create_time,
        })
    }
}

/// A tiny fixed-field cursor, just for decoding [`Trailer`] without a varint dependency.
struct Cursor<'a>(&'a [u8]);

impl<'a> Cursor<'a> {
    fn take(&mut self, n: usize) -> Result<&'a [u8], CellStoreReadError> {
        if self.0.len() < n {
            return Err(CellStoreReadError::BadTrailer);
        }
        let (head, rest) = self.0.split_at(n);
        self.0 = rest;
        Ok(head)
    }

    fn byte(&mut self) -> Result<u8, CellStoreReadError> {
        Ok(self.take(1)?[0])
    }

    fn u32(&mut self) -> Result<u32, CellStoreReadError> {
        Ok(u32::from_be_bytes(self.take(4)?.try_into().unwrap()))
    }

    fn u64(&mut self) -> Result<u64, CellStoreReadError> {
        Ok(u64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }

    fn i64(&mut self) -> Result<i64, CellStoreReadError> {
        Ok(i64::from_be_bytes(self.take(8)?.try_into().unwrap()))
    }
}

#[cfg(test)]
mod tests {
    use super::{BloomFilterMode, Trailer, TrailerFlags};
    use ht_format::CompressionType;

    fn sample() -> Trailer {
        Trailer {
            flags: TrailerFlags::MAJOR_COMPACTION,
            fix_index_offset: 100,
            var_index_offset: 200,
            filter_offset: 300,
            filter_length: 40,
            replaced_files_offset: 0,
            replaced_files_length: 0,
            replaced_files_count: 0,
            blocksize: 65536,
            compression: CompressionType::Snappy,
            compression_ratio_ppm: 450_000,
            total_entries: 10_000,
            delete_count: 12,
            key_bytes: 1234,
            value_bytes: 5678,
            expirable_bytes: 0,
            timestamp_min: -5,
            timestamp_max: 999,
            max_revision: 42,
            bloom_filter_mode: BloomFilterMode::Rows,
            bloom_hash_count: 4,
            index_entry_count: 7,
            table_id: 1,
            table_generation: 3,
            create_time: 1_700_000_000,
        }
    }

    #[test]
    fn round_trips() {
        let trailer = sample();
        let encoded = trailer.encode();
        let decoded = Trailer::decode(&encoded).unwrap();
        assert_eq!(decoded, trailer);
    }

    #[test]
    fn rejects_corrupted_trailer() {
        let mut encoded = sample().encode();
        encoded[10] ^= 0xff;
        assert!(Trailer::decode(&encoded).is_err());
    }
}
