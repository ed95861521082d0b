//! Prefix compression for the key+value entries that make up a cell store data block: each
//! entry after the first stores only the length of the prefix it shares with its predecessor and
//! the differing suffix. Ascending key order (guaranteed by the writer) usually makes most of a
//! row, column family, and qualifier redundant from one entry to the next.

use integer_encoding::{VarInt as _, VarIntWriter as _};

use crate::error::CellStoreReadError;

/// Accumulates entries into a prefix-compressed byte stream for one data block.
#[derive(Debug, Default)]
pub struct KeyCompressor {
    out:      Vec<u8>,
    previous: Vec<u8>,
}

impl KeyCompressor {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends `entry` (an encoded cell key prefix followed by its value bytes) to the block
    /// being built. Entries must be supplied in the store's ascending key order; this is not
    /// itself verified here, only relied upon for compression quality.
    pub fn push(&mut self, entry: &[u8]) {
        let shared = common_prefix_len(&self.previous, entry);
        let _ = self.out.write_varint(shared);
        let _ = self.out.write_varint(entry.len() - shared);
        self.out.extend_from_slice(&entry[shared..]);

        self.previous.clear();
        self.previous.extend_from_slice(entry);
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.out.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.out.is_empty()
    }

    /// Consumes the compressor, yielding the raw bytes to place in the data block.
    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        self.out
    }
}

fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b.iter()).take_while(|(x, y)| x == y).count()
}

/// Reconstructs entries from a prefix-compressed data block body, in order.
#[derive(Debug)]
pub struct KeyDecompressor<'a> {
    data:     &'a [u8],
    previous: Vec<u8>,
}

impl<'a> KeyDecompressor<'a> {
    #[must_use]
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, previous: Vec::new() }
    }

    /// Decodes the next entry, or `None` once the block body is exhausted.
    pub fn next_entry(&mut self) -> Option<Result<&[u8], CellStoreReadError>> {
        if self.data.is_empty() {
            return None;
        }
        Some(self.decode_one())
    }

    fn decode_one(&mut self) -> Result<&[u8], CellStoreReadError> {
        let (shared, used) = usize::decode_var(self.data)
            .ok_or(CellStoreReadError::BadIndex)?;
        self.data = self.data.get(used..).ok_or(CellStoreReadError::BadIndex)?;

        let (suffix_len, used) = usize::decode_var(self.data)
            .ok_or(CellStoreReadError::BadIndex)?;
        self.data = self.data.get(used..).ok_or(CellStoreReadError::BadIndex)?;

        if shared > self.previous.len() {
            return Err(CellStoreReadError::BadIndex);
        }
        let (suffix, rest) = if self.data.len() >= suffix_len {
            self.data.split_at(suffix_len)
        } else {
            return Err(CellStoreReadError::BadIndex);
        };
        self.data = rest;

        self.previous.truncate(shared);
        self.previous.extend_from_slice(suffix);
        Ok(&self.previous)
    }
}

#[cfg(test)]
mod tests {
    use super::{KeyCompressor, KeyDecompressor};

    #[test]
    fn round_trips_entries_in_order() {
        let entries: Vec<Vec<u8>> = vec![
            b"row0001value-a".to_vec(),
            b"row0002value-b".to_vec(),
            b"row0002value-c".to_vec(),
            b"row9999value-z".to_vec(),
        ];
        let mut compressor = KeyCompressor::new();
        for entry in &entries {
            compressor.push(entry);
        }
        let body = compressor.finish();

        let mut decompressor = KeyDecompressor::new(&body);
        for expected in &entries {
            let got = decompressor.next_entry().unwrap().unwrap();
            assert_eq!(got, expected.as_slice());
        }
        assert!(decompressor.next_entry().is_none());
    }

    #[test]
    fn shares_no_prefix_between_unrelated_entries() {
        let mut compressor = KeyCompressor::new();
        compressor.push(b"aaaa");
        compressor.push(b"zzzz");
        let body = compressor.finish();

        let mut decompressor = KeyDecompressor::new(&body);
        assert_eq!(decompressor.next_entry().unwrap().unwrap(), b"aaaa");
        assert_eq!(decompressor.next_entry().unwrap().unwrap(), b"zzzz");
    }

    #[test]
    fn rejects_truncated_stream() {
        let mut decompressor = KeyDecompressor::new(&[0x01]);
        assert!(decompressor.next_entry().unwrap().is_err());
    }
}
