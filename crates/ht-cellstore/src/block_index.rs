//! The fixed and variable block indexes: parallel arrays mapping each data block to its file
//! offset and the last key it contains. A reader binary-searches the variable index to find the
//! block (if any) that could hold a given key, then seeks to the matching fixed-index offset.

use integer_encoding::{VarInt as _, VarIntWriter as _};

use ht_format::{cmp_keys, decode_key_prefix};

use crate::error::CellStoreReadError;

/// Accumulates `(offset, last_key)` pairs as data blocks are flushed.
#[derive(Debug, Default)]
pub struct BlockIndexBuilder {
    offsets:   Vec<u64>,
    last_keys: Vec<Vec<u8>>,
}

impl BlockIndexBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Records the just-flushed block's starting offset and its last (highest-sorting) key,
    /// encoded the same way as [`ht_format::CellKey::append_encoded`] without a trailing value.
    pub fn push(&mut self, offset: u64, last_key: Vec<u8>) {
        self.offsets.push(offset);
        self.last_keys.push(last_key);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    #[must_use]
    pub fn needs_64bit(&self) -> bool {
        self.offsets.last().is_some_and(|&last| last > u64::from(u32::MAX))
    }

    /// Serializes the fixed (offsets) and variable (keys) index sections.
    #[must_use]
    pub fn finish(self, use_64bit: bool) -> (Vec<u8>, Vec<u8>) {
        let mut fixed = Vec::with_capacity(self.offsets.len() * if use_64bit { 8 } else { 4 });
        for &offset in &self.offsets {
            if use_64bit {
                fixed.extend_from_slice(&offset.to_be_bytes());
            } else {
                let truncated = u32::try_from(offset).unwrap_or(u32::MAX);
                fixed.extend_from_slice(&truncated.to_be_bytes());
            }
        }

        let mut var = Vec::new();
        for key in &self.last_keys {
            let _ = var.write_varint(key.len());
            var.extend_from_slice(key);
        }

        (fixed, var)
    }
}

/// A parsed block index, giving per-block offsets and last keys.
#[derive(Debug, Clone)]
pub struct BlockIndexReader {
    offsets:   Vec<u64>,
    last_keys: Vec<Vec<u8>>,
}

impl BlockIndexReader {
    /// Parses the fixed and variable index sections. `count` is the number of data blocks,
    /// taken from the trailer's `index_entry_count`.
    pub fn decode(
        fixed: &[u8],
        var:   &[u8],
        count: usize,
        use_64bit: bool,
    ) -> Result<Self, CellStoreReadError> {
        let entry_width = if use_64bit { 8 } else { 4 };
        if fixed.len() < count * entry_width {
            return Err(CellStoreReadError::BadIndex);
        }

        let mut offsets = Vec::with_capacity(count);
        for i in 0..count {
            let chunk = &fixed[i * entry_width..(i + 1) * entry_width];
            let offset = if use_64bit {
                u64::from_be_bytes(chunk.try_into().unwrap())
            } else {
                u64::from(u32::from_be_bytes(chunk.try_into().unwrap()))
            };
            offsets.push(offset);
        }

        let mut last_keys = Vec::with_capacity(count);
        let mut cursor = var;
        for _ in 0..count {
            let (key_len, used) = usize::decode_var(cursor).ok_or(CellStoreReadError::BadIndex)?;
            cursor = cursor.get(used..).ok_or(CellStoreReadError::BadIndex)?;
            if cursor.len() < key_len {
                return Err(CellStoreReadError::BadIndex);
            }
            let (key, rest) = cursor.split_at(key_len);
            last_keys.push(key.to_vec());
            cursor = rest;
        }

        Ok(Self { offsets, last_keys })
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.offsets.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.offsets.is_empty()
    }

    pub fn offset(&self, index: usize) -> Result<u64, CellStoreReadError> {
        self.offsets.get(index).copied().ok_or(CellStoreReadError::IndexOutOfRange(index))
    }

    pub fn last_key(&self, index: usize) -> Result<&[u8], CellStoreReadError> {
        self.last_keys.get(index).map(Vec::as_slice)
            .ok_or(CellStoreReadError::IndexOutOfRange(index))
    }

    /// Returns the index of the first block whose last key is `>= target`, i.e. the only block
    /// that could contain `target`. `None` if `target` sorts past every block's last key.
    #[must_use]
    pub fn find_block(&self, target: &[u8]) -> Option<usize> {
        let (target_ref, _) = decode_key_prefix(target).ok()?;
        let index = self.last_keys.partition_point(|key| {
            decode_key_prefix(key).is_ok_and(|(key_ref, _)| cmp_keys(&key_ref, &target_ref).is_lt())
        });
        (index < self.last_keys.len()).then_some(index)
    }
}

#[cfg(test)]
mod tests {
    use ht_format::{CellFlag, CellKey};

    use super::{BlockIndexBuilder, BlockIndexReader};

    fn key_bytes(row: &str) -> Vec<u8> {
        let mut buf = Vec::new();
        CellKey::new(row.as_bytes(), 1, b"".as_slice(), CellFlag::Insert, 100, 1)
            .append_encoded(&mut buf);
        buf
    }

    #[test]
    fn round_trips_offsets_and_keys() {
        let mut builder = BlockIndexBuilder::new();
        builder.push(0, key_bytes("b"));
        builder.push(128, key_bytes("d"));
        builder.push(256, key_bytes("f"));
        let (fixed, var) = builder.finish(false);

        let reader = BlockIndexReader::decode(&fixed, &var, 3, false).unwrap();
        assert_eq!(reader.offset(0).unwrap(), 0);
        assert_eq!(reader.offset(1).unwrap(), 128);
        assert_eq!(reader.offset(2).unwrap(), 256);
        assert_eq!(reader.last_key(1).unwrap(), key_bytes("d").as_slice());
    }

    #[test]
    fn finds_containing_block() {
        let mut builder = BlockIndexBuilder::new();
        builder.push(0, key_bytes("b"));
        builder.push(128, key_bytes("d"));
        builder.push(256, key_bytes("f"));
        let (fixed, var) = builder.finish(false);
        let reader = BlockIndexReader::decode(&fixed, &var, 3, false).unwrap();

        assert_eq!(reader.find_block(&key_bytes("a")), Some(0));
        assert_eq!(reader.find_block(&key_bytes("c")), Some(1));
        assert_eq!(reader.find_block(&key_bytes("f")), Some(2));
        assert_eq!(reader.find_block(&key_bytes("z")), None);
    }

    #[test]
    fn uses_64bit_offsets_when_requested() {
        let mut builder = BlockIndexBuilder::new();
        let big = u64::from(u32::MAX) + 1000;
        builder.push(big, key_bytes("a"));
        assert!(builder.needs_64bit());
        let (fixed, var) = builder.finish(true);
        let reader = BlockIndexReader::decode(&fixed, &var, 1, true).unwrap();
        assert_eq!(reader.offset(0).unwrap(), big);
    }
}
