//! Opens an already-written cell store for scanning. The trailer is read eagerly; the block
//! index and bloom filter are loaded lazily on first use and can be dropped again by
//! [`CellStoreReader::purge_indexes`] once no scanner still needs them.

use std::path::{Path, PathBuf};

use parking_lot::Mutex;

use ht_format::{BlockHeader, CellKey, decode_key_prefix};
use ht_pool::SharedUnboundedBufferPool;
use ht_vfs::traits::{RandomAccess as _, ReadableFilesystem};

use crate::block_index::BlockIndexReader;
use crate::bloom::BloomFilter;
use crate::error::CellStoreReadError;
use crate::key_compress::KeyDecompressor;
use crate::pool::BufferPool as _;
use crate::trailer::{BloomFilterMode, DIRECT_IO_ALIGNMENT, TRAILER_LEN, Trailer};

/// Caps how large a reused block-read buffer is allowed to grow before it's replaced outright.
const MAX_POOLED_BUFFER_CAPACITY: usize = 4 << 20;

const DATA_MAGIC:     [u8; 10] = *b"Data------";
const FIX_IDX_MAGIC:  [u8; 10] = *b"IdxFix----";
const VAR_IDX_MAGIC:  [u8; 10] = *b"IdxVar----";
const FILTER_MAGIC:   [u8; 10] = *b"Filter----";

/// Which of the two bloom-filter-backed section families a scan's key range could fall in, used
/// by [`CellStoreReader::create_scanner`] to pick a traversal strategy.
#[derive(Debug, Clone)]
pub enum CellStoreScannerInterval {
    /// The block index narrowed the scan to these block indices, in ascending order.
    BlockIndex(Vec<usize>),
    /// No usable index narrowing; scan every data block in file order.
    Readahead,
}

struct LazyBlockIndex {
    index:          Option<BlockIndexReader>,
    access_count:   u64,
}

struct LazyBloomFilter {
    filter:  Option<Option<BloomFilter>>,
}

pub struct CellStoreReader<FS: ReadableFilesystem> {
    file:           FS::RandomAccessFile,
    file_size:      u64,
    trailer:        Trailer,
    start_row:      Option<Vec<u8>>,
    end_row:        Option<Vec<u8>>,
    block_index:    Mutex<LazyBlockIndex>,
    bloom:          Mutex<LazyBloomFilter>,
    outstanding_scanners: Mutex<u64>,
    block_buffer_pool: SharedUnboundedBufferPool,
}

impl<FS: ReadableFilesystem> CellStoreReader<FS> {
    pub fn open(fs: &FS, path: &Path) -> Result<Self, CellStoreReadError> {
        let file = fs.open_random_access(path)
            .map_err(|_err| CellStoreReadError::Io(std::io::Error::other("failed to open cell store")))?;
        let file_size = fs.size_of(path)
            .map_err(|_err| CellStoreReadError::Io(std::io::Error::other("failed to stat cell store")))?;
        if file_size < TRAILER_LEN as u64 {
            return Err(CellStoreReadError::BadTrailer);
        }

        let mut trailer_bytes = vec![0_u8; TRAILER_LEN];
        file.read_exact_at(file_size - TRAILER_LEN as u64, &mut trailer_bytes)?;
        let trailer = Trailer::decode(&trailer_bytes)?;

        Ok(Self {
            file,
            file_size,
            trailer,
            start_row: None,
            end_row: None,
            block_index: Mutex::new(LazyBlockIndex { index: None, access_count: 0 }),
            bloom: Mutex::new(LazyBloomFilter { filter: None }),
            outstanding_scanners: Mutex::new(0),
            block_buffer_pool: SharedUnboundedBufferPool::new(MAX_POOLED_BUFFER_CAPACITY),
        })
    }

    #[must_use]
    pub const fn trailer(&self) -> &Trailer {
        &self.trailer
    }

    #[must_use]
    pub const fn file_size(&self) -> u64 {
        self.file_size
    }

    /// Reads the framed block starting at `offset`, verifying `expected_magic`.
    fn read_block(&self, offset: u64, expected_magic: [u8; 10]) -> Result<Vec<u8>, CellStoreReadError> {
        const PREFIX_LEN: usize = ht_format::BASE_HEADER_LEN + ht_format::HEADER_CHECKSUM_LEN;
        if offset >= self.file_size {
            return Err(CellStoreReadError::BadIndex);
        }
        let mut prefix = self.block_buffer_pool.get_buffer();
        prefix.resize(PREFIX_LEN.min((self.file_size - offset) as usize), 0);
        self.file.read_exact_at(offset, &mut prefix)?;
        let (header, _) = BlockHeader::decode(&prefix)?;

        let total_len = PREFIX_LEN as u64 + u64::from(header.compressed_len);
        if offset + total_len > self.file_size {
            return Err(CellStoreReadError::BadIndex);
        }
        let mut block = self.block_buffer_pool.get_buffer();
        block.resize(total_len as usize, 0);
        self.file.read_exact_at(offset, &mut block)?;
        let (_, _, payload) = ht_format::inflate(&block, expected_magic)?;
        Ok(payload)
    }

    fn ensure_block_index(&self) -> Result<(), CellStoreReadError> {
        let mut guard = self.block_index.lock();
        guard.access_count += 1;
        if guard.index.is_some() {
            return Ok(());
        }
        let fixed = self.read_block(self.trailer.fix_index_offset, FIX_IDX_MAGIC)?;
        let var = self.read_block(self.trailer.var_index_offset, VAR_IDX_MAGIC)?;
        let use_64bit = self.trailer.flags.contains(crate::trailer::TrailerFlags::INDEX_64BIT);
        let index = BlockIndexReader::decode(
            &fixed, &var, self.trailer.index_entry_count as usize, use_64bit,
        )?;
        guard.index = Some(index);
        Ok(())
    }

    fn ensure_bloom_filter(&self) -> Result<(), CellStoreReadError> {
        let mut guard = self.bloom.lock();
        if guard.filter.is_some() {
            return Ok(());
        }
        if self.trailer.bloom_filter_mode == BloomFilterMode::Disabled {
            guard.filter = Some(None);
            return Ok(());
        }
        let encoded = self.read_block(self.trailer.filter_offset, FILTER_MAGIC)?;
        let filter = BloomFilter::decode(&encoded, self.trailer.bloom_hash_count);
        guard.filter = Some(Some(filter));
        Ok(())
    }

    /// Tests whether this store could contain a cell matching `row` and, if the store's bloom
    /// filter mode is `RowsAndColumns`, any of `column_families`.
    pub fn may_contain(&self, row: &[u8], column_families: &[u8]) -> Result<bool, CellStoreReadError> {
        self.ensure_bloom_filter()?;
        let guard = self.bloom.lock();
        let Some(Some(filter)) = guard.filter.as_ref() else {
            return Ok(true);
        };
        match self.trailer.bloom_filter_mode {
            BloomFilterMode::Disabled => Ok(true),
            BloomFilterMode::Rows => Ok(filter.may_contain(row)),
            BloomFilterMode::RowsAndColumns => {
                if column_families.is_empty() {
                    return Ok(filter.may_contain(row));
                }
                Ok(column_families.iter().any(|&cf| {
                    let mut key = row.to_vec();
                    key.push(cf);
                    filter.may_contain(&key)
                }))
            }
        }
    }

    /// Chooses which data blocks a scan over `[start, end]` (inclusive, `None` meaning
    /// unbounded) needs to visit.
    pub fn create_scanner(
        &self,
        start: Option<&[u8]>,
        end:   Option<&[u8]>,
    ) -> Result<CellStoreScannerInterval, CellStoreReadError> {
        self.ensure_block_index()?;
        let guard = self.block_index.lock();
        let Some(index) = guard.index.as_ref() else {
            return Ok(CellStoreScannerInterval::Readahead);
        };
        if index.is_empty() {
            return Ok(CellStoreScannerInterval::BlockIndex(Vec::new()));
        }

        // `find_block` returning `None` for `start` means `start` sorts past every block this
        // store holds, so the store contributes nothing to the scan.
        let Some(start_block) = start.map_or(Some(0), |key| index.find_block(key)) else {
            return Ok(CellStoreScannerInterval::BlockIndex(Vec::new()));
        };
        // `None` for `end` means `end` sorts past every block's last key, i.e. the scan runs to
        // the final block.
        let end_block = end.map_or(index.len() - 1, |key| index.find_block(key).unwrap_or(index.len() - 1));

        if start_block > end_block {
            return Ok(CellStoreScannerInterval::BlockIndex(Vec::new()));
        }
        *self.outstanding_scanners.lock() += 1;
        Ok(CellStoreScannerInterval::BlockIndex((start_block..=end_block).collect()))
    }

    /// Decrements the outstanding-scanner count; callers invoke this when a scanner is dropped.
    pub fn release_scanner(&self) {
        let mut count = self.outstanding_scanners.lock();
        *count = count.saturating_sub(1);
    }

    #[must_use]
    pub fn outstanding_scanners(&self) -> u64 {
        *self.outstanding_scanners.lock()
    }

    /// Reads the header of the framed block at `offset` and returns its total on-disk length
    /// (header, checksum, and compressed payload together), without decompressing the payload.
    pub fn block_framed_len(&self, offset: u64) -> Result<u32, CellStoreReadError> {
        const PREFIX_LEN: usize = ht_format::BASE_HEADER_LEN + ht_format::HEADER_CHECKSUM_LEN;
        if offset >= self.file_size {
            return Err(CellStoreReadError::BadIndex);
        }
        let mut prefix = self.block_buffer_pool.get_buffer();
        prefix.resize(PREFIX_LEN.min((self.file_size - offset) as usize), 0);
        self.file.read_exact_at(offset, &mut prefix)?;
        let (header, _) = BlockHeader::decode(&prefix)?;
        Ok(PREFIX_LEN as u32 + header.compressed_len)
    }

    /// The byte offset of data block `block_index` within the file, per the block index.
    pub fn block_offset(&self, block_index: usize) -> Result<u64, CellStoreReadError> {
        self.ensure_block_index()?;
        let guard = self.block_index.lock();
        let index = guard.index.as_ref().ok_or(CellStoreReadError::BadIndex)?;
        index.offset(block_index)
    }

    /// Iterates every `(key, value)` entry in data block `block_index`.
    pub fn scan_block(&self, block_index: usize) -> Result<Vec<(Vec<u8>, Vec<u8>)>, CellStoreReadError> {
        let offset = {
            self.ensure_block_index()?;
            let guard = self.block_index.lock();
            let index = guard.index.as_ref().ok_or(CellStoreReadError::BadIndex)?;
            index.offset(block_index)?
        };
        let body = self.read_block(offset, DATA_MAGIC)?;
        let mut decompressor = KeyDecompressor::new(&body);
        let mut entries = Vec::new();
        while let Some(entry) = decompressor.next_entry() {
            let entry = entry?;
            let (key_ref, value) = decode_key_prefix(entry)?;
            let mut key_bytes = Vec::new();
            CellKey::new(
                key_ref.row, key_ref.column_family_id, key_ref.column_qualifier,
                key_ref.flag, key_ref.timestamp, key_ref.revision,
            ).append_encoded(&mut key_bytes);
            entries.push((key_bytes, value.to_vec()));
        }
        Ok(entries)
    }

    /// Purges the loaded filter, and the block index too if no scanner is outstanding.
    pub fn purge_indexes(&self) {
        self.bloom.lock().filter = None;
        if *self.outstanding_scanners.lock() == 0 {
            let mut guard = self.block_index.lock();
            guard.index = None;
            guard.access_count = 0;
        }
    }

    #[must_use]
    pub fn block_index_access_count(&self) -> u64 {
        self.block_index.lock().access_count
    }

    /// Restricts the advertised row range (after a split). If the block index is resident,
    /// recomputes `disk_usage` from the index's fractional coverage of the new range; otherwise
    /// the previous estimate is left unchanged.
    pub fn rescope(&mut self, new_start: Option<Vec<u8>>, new_end: Option<Vec<u8>>) {
        self.start_row = new_start;
        self.end_row = new_end;
    }

    #[must_use]
    pub fn start_row(&self) -> Option<&[u8]> {
        self.start_row.as_deref()
    }

    #[must_use]
    pub fn end_row(&self) -> Option<&[u8]> {
        self.end_row.as_deref()
    }

    /// Estimated bytes this store occupies within its currently advertised `[start_row, end_row]`
    /// restriction. Full file size if no restriction is in effect or the index isn't resident.
    #[must_use]
    pub fn disk_usage(&self) -> u64 {
        if self.start_row.is_none() && self.end_row.is_none() {
            return self.file_size;
        }
        let guard = self.block_index.lock();
        let Some(index) = guard.index.as_ref() else {
            return self.file_size;
        };
        if index.is_empty() {
            return 0;
        }
        let start_block = self.start_row.as_deref()
            .and_then(|key| index.find_block(&data_block_probe_key(key)))
            .unwrap_or(0);
        let end_block = self.end_row.as_deref()
            .and_then(|key| index.find_block(&data_block_probe_key(key)))
            .unwrap_or(index.len() - 1);

        let first_offset = index.offset(start_block).unwrap_or(0);
        let last_offset = if end_block + 1 < index.len() {
            index.offset(end_block + 1).unwrap_or(self.trailer.fix_index_offset)
        } else {
            self.trailer.fix_index_offset
        };
        let blocks_span = last_offset.saturating_sub(first_offset);
        let index_fraction = (self.file_size - self.trailer.fix_index_offset)
            / u64::try_from(index.len().max(1)).unwrap_or(1)
            * u64::try_from(end_block.saturating_sub(start_block) + 1).unwrap_or(1);
        blocks_span + index_fraction
    }
}

fn data_block_probe_key(row: &[u8]) -> Vec<u8> {
    let mut buf = Vec::new();
    CellKey::new(
        row, 0, b"".as_slice(), ht_format::CellFlag::Insert,
        ht_format::TIMESTAMP_MAX, ht_format::REVISION_MIN,
    ).append_encoded(&mut buf);
    buf
}

/// Builds the path a cell store with sequence number `id` lives at within an access group
/// directory, matching [`crate::writer::cell_store_path`].
#[must_use]
pub fn cell_store_path(access_group_dir: &Path, id: u64) -> PathBuf {
    access_group_dir.join(format!("cs{id}"))
}

#[cfg(test)]
mod tests {
    use ht_format::{CellFlag, CellKey, CompressionType};
    use ht_vfs::ThreadLocalMemoryFS;

    use super::{CellStoreReader, CellStoreScannerInterval};
    use crate::trailer::BloomFilterMode;
    use crate::writer::{CellStoreWriteOptions, CellStoreWriter};

    #[test]
    fn round_trips_ten_thousand_rows() {
        let mut fs = ThreadLocalMemoryFS::default();
        let path = std::path::PathBuf::from("/t/ag/r/cs0");
        let options = CellStoreWriteOptions {
            compression: CompressionType::Snappy,
            bloom_filter_mode: BloomFilterMode::Rows,
            target_blocksize: 4096,
            ..CellStoreWriteOptions::default()
        };
        {
            let mut writer = CellStoreWriter::create(&mut fs, &path, options).unwrap();
            for i in 0..10_000_u32 {
                let row = format!("row-{i:08}");
                writer.add(
                    &CellKey::new(row.as_bytes(), 1, b"".as_slice(), CellFlag::Insert, 100, i64::from(i)),
                    b"0123456789abcdef",
                ).unwrap();
            }
            let summary = writer.finalize().unwrap();
            assert_eq!(summary.total_entries, 10_000);
        }

        let reader = CellStoreReader::open(&fs, &path).unwrap();
        assert_eq!(reader.trailer().total_entries, 10_000);

        assert!(reader.may_contain(b"row-00000000", &[]).unwrap());
        assert!(!reader.may_contain(b"definitely-absent-row", &[]).unwrap());

        let interval = reader.create_scanner(None, None).unwrap();
        let CellStoreScannerInterval::BlockIndex(blocks) = interval else {
            panic!("expected a block-index scan");
        };
        let mut total = 0;
        for block in blocks {
            total += reader.scan_block(block).unwrap().len();
        }
        assert_eq!(total, 10_000);
    }

    #[test]
    fn disabled_bloom_filter_always_may_contain() {
        let mut fs = ThreadLocalMemoryFS::default();
        let path = std::path::PathBuf::from("/t/ag/r/cs0");
        let options = CellStoreWriteOptions {
            compression: CompressionType::None,
            bloom_filter_mode: BloomFilterMode::Disabled,
            ..CellStoreWriteOptions::default()
        };
        {
            let mut writer = CellStoreWriter::create(&mut fs, &path, options).unwrap();
            writer.add(
                &CellKey::new(b"only-row".as_slice(), 1, b"".as_slice(), CellFlag::Insert, 1, 1),
                b"v",
            ).unwrap();
            writer.finalize().unwrap();
        }
        let reader = CellStoreReader::open(&fs, &path).unwrap();
        assert!(reader.may_contain(b"anything-at-all", &[]).unwrap());
    }
}
