//! Bloom filter lifecycle for a cell store being written: accumulate candidate keys in memory
//! until `max_approx_items` is crossed, then extrapolate a final size, size the filter, insert
//! the accumulated set, and insert directly from then on. Modes `Rows` and `RowsAndColumns` test
//! either just the row, or the row and every column family referenced by a scan.

use std::collections::HashSet;

use crate::trailer::BloomFilterMode;

/// Default threshold (approximate distinct items) before the builder commits to a filter size.
pub const DEFAULT_MAX_APPROX_ITEMS: usize = 1 << 20;

/// LevelDB-style Bloom hash, reused for the same empirically-good bit distribution.
fn bloom_hash(data: &[u8]) -> u32 {
    let seed: u32 = 0x_bc9f_1d34;
    let multiplier: u32 = 0x_c6a4_a793;

    #[expect(clippy::cast_possible_truncation, reason = "data is well under u32::MAX bytes")]
    let mut hash = seed ^ (data.len() as u32).wrapping_mul(multiplier);

    let mut chunks = data.chunks_exact(4);
    for chunk in &mut chunks {
        let word = u32::from_le_bytes(chunk.try_into().unwrap());
        hash = hash.wrapping_add(word).wrapping_mul(multiplier);
        hash ^= hash >> 16;
    }
    let remainder = chunks.remainder();
    if !remainder.is_empty() {
        for (idx, &byte) in remainder.iter().enumerate() {
            hash = hash.wrapping_add(u32::from(byte) << (8 * idx));
        }
        hash = hash.wrapping_mul(multiplier);
        hash ^= hash >> 24;
    }
    hash
}

fn num_hash_functions(bits_per_item: f64) -> u8 {
    let computed = (bits_per_item * std::f64::consts::LN_2).round();
    #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss, reason = "clamped below")]
    let n = computed as i64;
    n.clamp(1, 30) as u8
}

/// A sized, filled bit vector plus its hash-function count, ready to be written to a cell store.
#[derive(Debug, Clone)]
pub struct BloomFilter {
    bits:          Vec<u8>,
    num_hashes:    u8,
}

impl BloomFilter {
    fn empty() -> Self {
        Self { bits: vec![0_u8; 8], num_hashes: 1 }
    }

    fn sized_for(item_count: usize, bits_per_item: f64) -> Self {
        let num_hashes = num_hash_functions(bits_per_item);
        #[expect(clippy::cast_possible_truncation, reason = "item_count is bounded in practice")]
        let raw_bits = (item_count as f64 * bits_per_item).ceil() as usize;
        let num_bytes = raw_bits.div_ceil(8).max(8);
        Self { bits: vec![0_u8; num_bytes], num_hashes }
    }

    fn insert(&mut self, key: &[u8]) {
        let num_bits = u32::try_from(self.bits.len() * 8).unwrap_or(u32::MAX);
        let mut hash = bloom_hash(key);
        let delta = hash.rotate_right(17);
        for _ in 0..self.num_hashes {
            let bit = (hash % num_bits) as usize;
            self.bits[bit / 8] |= 1 << (bit % 8);
            hash = hash.wrapping_add(delta);
        }
    }

    #[must_use]
    pub fn may_contain(&self, key: &[u8]) -> bool {
        let num_bits = u32::try_from(self.bits.len() * 8).unwrap_or(u32::MAX);
        let mut hash = bloom_hash(key);
        let delta = hash.rotate_right(17);
        for _ in 0..self.num_hashes {
            let bit = (hash % num_bits) as usize;
            if self.bits[bit / 8] & (1 << (bit % 8)) == 0 {
                return false;
            }
            hash = hash.wrapping_add(delta);
        }
        true
    }

    #[must_use]
    pub fn num_hashes(&self) -> u8 {
        self.num_hashes
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        self.bits.clone()
    }

    #[must_use]
    pub fn decode(bytes: &[u8], num_hashes: u8) -> Self {
        Self { bits: bytes.to_vec(), num_hashes }
    }
}

/// Builds a [`BloomFilter`] incrementally while a cell store is being written.
#[derive(Debug)]
pub struct BloomFilterBuilder {
    mode:              BloomFilterMode,
    bits_per_item:     f64,
    max_approx_items:  usize,
    pending:           HashSet<Vec<u8>>,
    filter:            Option<BloomFilter>,
}

impl BloomFilterBuilder {
    #[must_use]
    pub fn new(mode: BloomFilterMode, bits_per_item: f64, max_approx_items: usize) -> Self {
        Self {
            mode,
            bits_per_item,
            max_approx_items,
            pending: HashSet::new(),
            filter: None,
        }
    }

    #[must_use]
    pub const fn mode(&self) -> BloomFilterMode {
        self.mode
    }

    /// Records that `row` (and, in `RowsAndColumns` mode, `(row, column_family_id)`) was written.
    pub fn add_row(&mut self, row: &[u8], column_family_id: u8) {
        if self.mode == BloomFilterMode::Disabled {
            return;
        }
        let key = self.filter_key(row, column_family_id);
        self.insert_key(key);
    }

    fn filter_key(&self, row: &[u8], column_family_id: u8) -> Vec<u8> {
        match self.mode {
            BloomFilterMode::RowsAndColumns => {
                let mut key = row.to_vec();
                key.push(column_family_id);
                key
            }
            _ => row.to_vec(),
        }
    }

    fn insert_key(&mut self, key: Vec<u8>) {
        if let Some(filter) = &mut self.filter {
            filter.insert(&key);
            return;
        }
        self.pending.insert(key);
        if self.pending.len() >= self.max_approx_items {
            self.commit_filter(self.pending.len());
        }
    }

    /// Extrapolates a final item count, sizes the filter, inserts every pending key, and starts
    /// inserting directly into the sized filter from now on.
    fn commit_filter(&mut self, extrapolated_count: usize) {
        let mut filter = BloomFilter::sized_for(extrapolated_count.max(1), self.bits_per_item);
        for key in self.pending.drain() {
            filter.insert(&key);
        }
        self.filter = Some(filter);
    }

    /// Finalizes the filter. If fewer than `max_approx_items` keys were ever seen, the filter is
    /// sized for exactly the number seen.
    #[must_use]
    pub fn finish(mut self) -> Option<BloomFilter> {
        if self.mode == BloomFilterMode::Disabled {
            return None;
        }
        if self.filter.is_none() {
            let count = self.pending.len();
            self.commit_filter(count);
        }
        self.filter.or_else(|| Some(BloomFilter::empty()))
    }
}

#[cfg(test)]
mod tests {
    use super::{BloomFilterBuilder, BloomFilterMode};

    #[test]
    fn contains_inserted_rows() {
        let mut builder = BloomFilterBuilder::new(BloomFilterMode::Rows, 10.0, 1024);
        for row in ["alpha", "beta", "gamma"] {
            builder.add_row(row.as_bytes(), 1);
        }
        let filter = builder.finish().unwrap();
        assert!(filter.may_contain(b"alpha"));
        assert!(filter.may_contain(b"beta"));
        assert!(filter.may_contain(b"gamma"));
    }

    #[test]
    fn mostly_rejects_absent_rows() {
        let mut builder = BloomFilterBuilder::new(BloomFilterMode::Rows, 10.0, 1024);
        for i in 0..1000 {
            builder.add_row(format!("row-{i}").as_bytes(), 1);
        }
        let filter = builder.finish().unwrap();

        let false_positives = (0..1000)
            .filter(|i| filter.may_contain(format!("absent-{i}").as_bytes()))
            .count();
        assert!(false_positives < 50, "false positive rate too high: {false_positives}/1000");
    }

    #[test]
    fn disabled_mode_produces_no_filter() {
        let mut builder = BloomFilterBuilder::new(BloomFilterMode::Disabled, 10.0, 1024);
        builder.add_row(b"row", 1);
        assert!(builder.finish().is_none());
    }

    #[test]
    fn rows_and_columns_distinguishes_column_family() {
        let mut builder = BloomFilterBuilder::new(BloomFilterMode::RowsAndColumns, 10.0, 1024);
        builder.add_row(b"r1", 1);
        let filter = builder.finish().unwrap();
        assert!(filter.may_contain(&[b"r1".as_slice(), &[1]].concat()));
    }

    #[test]
    fn extrapolates_past_threshold() {
        let mut builder = BloomFilterBuilder::new(BloomFilterMode::Rows, 10.0, 4);
        for i in 0..100 {
            builder.add_row(format!("row-{i}").as_bytes(), 1);
        }
        let filter = builder.finish().unwrap();
        for i in 0..100 {
            assert!(filter.may_contain(format!("row-{i}").as_bytes()));
        }
    }
}
