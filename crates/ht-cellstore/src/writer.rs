//! Writes a new immutable cell store: data blocks (prefix-compressed, deflated), a fixed+variable
//! block index, an optional bloom filter, a replaced-files list, and the trailer, all aligned to
//! the direct-IO boundary.

use std::path::{Path, PathBuf};

use ht_format::{BlockHeader, CellFlag, CellKey, CompressionType, cmp_keys, decode_key_prefix};
use ht_pool::UnboundedBufferPool;
use ht_vfs::traits::WritableFilesystem;

use crate::block_index::BlockIndexBuilder;
use crate::bloom::BloomFilterBuilder;
use crate::error::CellStoreWriteError;
use crate::key_compress::KeyCompressor;
use crate::pool::BufferPool as _;
use crate::trailer::{BloomFilterMode, DIRECT_IO_ALIGNMENT, Trailer, TrailerFlags};

/// Caps how large a reused entry buffer is allowed to grow before it's replaced outright,
/// matching `ResetBuffer`'s reset policy on the underlying pool.
const MAX_POOLED_BUFFER_CAPACITY: usize = 1 << 20;

const DATA_MAGIC:     [u8; 10] = *b"Data------";
const FIX_IDX_MAGIC:  [u8; 10] = *b"IdxFix----";
const VAR_IDX_MAGIC:  [u8; 10] = *b"IdxVar----";
const FILTER_MAGIC:   [u8; 10] = *b"Filter----";
const REPFILES_MAGIC: [u8; 10] = *b"RepFiles--";

/// Tunable knobs for a [`CellStoreWriter`], mirroring an access group's cellstore property bag.
#[derive(Debug, Clone)]
pub struct CellStoreWriteOptions {
    pub target_blocksize:  u32,
    pub compression:       CompressionType,
    pub bloom_filter_mode: BloomFilterMode,
    pub bloom_bits_per_item:   f64,
    pub bloom_max_approx_items: usize,
    pub table_id:          u64,
    pub table_generation:  u32,
    pub split:             bool,
    pub major_compaction:  bool,
}

impl Default for CellStoreWriteOptions {
    fn default() -> Self {
        Self {
            target_blocksize:  65536,
            compression:       CompressionType::Zlib,
            bloom_filter_mode: BloomFilterMode::Rows,
            bloom_bits_per_item: 10.0,
            bloom_max_approx_items: crate::bloom::DEFAULT_MAX_APPROX_ITEMS,
            table_id:          0,
            table_generation:  0,
            split:             false,
            major_compaction:  false,
        }
    }
}

/// Summary statistics produced by [`CellStoreWriter::finalize`], useful for registering the new
/// store with an access group without re-opening and re-reading the trailer.
#[derive(Debug, Clone, Copy)]
pub struct CellStoreSummary {
    pub file_size:            u64,
    pub total_entries:        u64,
    pub delete_count:         u64,
    pub timestamp_min:        i64,
    pub timestamp_max:        i64,
    pub max_revision:         i64,
    pub compression_ratio_ppm: u32,
}

pub struct CellStoreWriter<FS: WritableFilesystem> {
    file:                FS::WriteFile,
    options:             CellStoreWriteOptions,
    offset:              u64,

    current_block:       KeyCompressor,
    last_key_in_block:    Vec<u8>,
    previous_key:        Vec<u8>,
    have_previous_key:   bool,

    block_index:         BlockIndexBuilder,
    bloom:               BloomFilterBuilder,
    replaced_files:      KeyCompressor,
    replaced_files_count: u32,

    /// Reused scratch buffer for one entry's encoded key+value, returned to the pool as soon as
    /// its bytes have been copied into `current_block`.
    entry_pool:          UnboundedBufferPool,

    total_entries:       u64,
    delete_count:        u64,
    key_bytes:           u64,
    value_bytes:         u64,
    expirable_bytes:     u64,
    timestamp_min:       i64,
    timestamp_max:       i64,
    max_revision:        i64,

    recent_uncompressed: u64,
    recent_compressed:   u64,
    total_uncompressed:  u64,
    total_compressed:    u64,
}

impl<FS: WritableFilesystem> CellStoreWriter<FS> {
    pub fn create(
        fs:         &mut FS,
        path:       &Path,
        options:    CellStoreWriteOptions,
    ) -> Result<Self, CellStoreWriteError> {
        let file = fs.open_writable(path, true)
            .map_err(|_err| CellStoreWriteError::Io(std::io::Error::other("failed to create cell store file")))?;
        let bloom = BloomFilterBuilder::new(
            options.bloom_filter_mode,
            options.bloom_bits_per_item,
            options.bloom_max_approx_items,
        );
        Ok(Self {
            file,
            options,
            offset: 0,
            current_block: KeyCompressor::new(),
            last_key_in_block: Vec::new(),
            previous_key: Vec::new(),
            have_previous_key: false,
            block_index: BlockIndexBuilder::new(),
            bloom,
            replaced_files: KeyCompressor::new(),
            replaced_files_count: 0,
            entry_pool: UnboundedBufferPool::new(MAX_POOLED_BUFFER_CAPACITY),
            total_entries: 0,
            delete_count: 0,
            key_bytes: 0,
            value_bytes: 0,
            expirable_bytes: 0,
            timestamp_min: i64::MAX,
            timestamp_max: i64::MIN,
            max_revision: i64::MIN,
            recent_uncompressed: 0,
            recent_compressed: 0,
            total_uncompressed: 0,
            total_compressed: 0,
        })
    }

    /// Records that `name` is a cell store this new store replaces (superseded by a compaction).
    pub fn add_replaced_file(&mut self, name: &str) {
        self.replaced_files.push(name.as_bytes());
        self.replaced_files_count += 1;
    }

    /// Appends one cell. Keys must arrive in the store's ascending order (same order as
    /// [`ht_format::cmp_keys`]); this is a writer invariant, not something recovered from.
    pub fn add(&mut self, key: &CellKey, value: &[u8]) -> Result<(), CellStoreWriteError> {
        let mut entry = self.entry_pool.get_buffer();
        entry.reserve(key.encoded_len() + value.len());
        key.append_encoded(&mut entry);
        let key_prefix_len = entry.len();
        entry.extend_from_slice(value);

        if self.have_previous_key {
            let (prev, _) = decode_key_prefix(&self.previous_key)
                .expect("previously pushed key is well-formed");
            let (cur, _) = decode_key_prefix(&entry[..key_prefix_len])
                .expect("just-encoded key is well-formed");
            if cmp_keys(&prev, &cur).is_gt() {
                return Err(CellStoreWriteError::OutOfOrder);
            }
        }

        self.bloom.add_row(&key.row, key.column_family_id);

        self.total_entries += 1;
        if key.flag.is_delete() {
            self.delete_count += 1;
        }
        if !matches!(key.flag, CellFlag::Insert) || key.timestamp != ht_format::TIMESTAMP_NULL {
            self.timestamp_min = self.timestamp_min.min(key.timestamp);
            self.timestamp_max = self.timestamp_max.max(key.timestamp);
        }
        self.max_revision = self.max_revision.max(key.revision);
        self.key_bytes += key_prefix_len as u64;
        self.value_bytes += value.len() as u64;

        self.last_key_in_block.clear();
        self.last_key_in_block.extend_from_slice(&entry[..key_prefix_len]);
        self.previous_key.clear();
        self.previous_key.extend_from_slice(&entry[..key_prefix_len]);
        self.have_previous_key = true;

        self.current_block.push(&entry);

        if self.current_block.len() as u64 >= u64::from(self.adaptive_blocksize()) {
            self.flush_block()?;
        }
        Ok(())
    }

    fn adaptive_blocksize(&self) -> u32 {
        if self.recent_compressed == 0 {
            return self.options.target_blocksize;
        }
        let ratio = self.recent_uncompressed as f64 / self.recent_compressed as f64;
        #[expect(clippy::cast_possible_truncation, clippy::cast_sign_loss,
            reason = "bounded by target_blocksize scaled by a small ratio")]
        let scaled = (f64::from(self.options.target_blocksize) * ratio) as u32;
        scaled.max(1024)
    }

    fn flush_block(&mut self) -> Result<(), CellStoreWriteError> {
        if self.current_block.is_empty() {
            return Ok(());
        }
        let body = std::mem::take(&mut self.current_block).finish();
        let uncompressed_len = body.len() as u64;

        let block = ht_format::deflate(DATA_MAGIC, &body, self.options.compression, &[])?;
        let (header, _) = BlockHeader::decode(&block)?;

        self.block_index.push(self.offset, std::mem::take(&mut self.last_key_in_block));
        self.write_all(&block)?;

        self.recent_uncompressed = uncompressed_len;
        self.recent_compressed = u64::from(header.compressed_len).max(1);
        self.total_uncompressed += uncompressed_len;
        self.total_compressed += u64::from(header.compressed_len);

        self.current_block = KeyCompressor::new();
        Ok(())
    }

    fn write_all(&mut self, bytes: &[u8]) -> Result<(), CellStoreWriteError> {
        use std::io::Write as _;
        self.file.write_all(bytes)?;
        self.offset += bytes.len() as u64;
        Ok(())
    }

    /// Flushes the residual block, writes the index/filter/replaced-files sections and the
    /// trailer, and returns a summary of what was written.
    pub fn finalize(mut self) -> Result<CellStoreSummary, CellStoreWriteError> {
        self.flush_block()?;

        let use_64bit = self.block_index.needs_64bit() || self.offset > u64::from(u32::MAX);
        let index_entry_count = u32::try_from(self.block_index.len()).unwrap_or(u32::MAX);
        let (fixed, var) = self.block_index.finish(use_64bit);

        let fix_index_offset = self.offset;
        let fixed_block = ht_format::deflate(FIX_IDX_MAGIC, &fixed, CompressionType::None, &[])?;
        self.write_all(&fixed_block)?;

        let var_index_offset = self.offset;
        let var_block = ht_format::deflate(VAR_IDX_MAGIC, &var, CompressionType::None, &[])?;
        self.write_all(&var_block)?;

        let (filter_offset, filter_length, bloom_hash_count) = match self.bloom.finish() {
            Some(filter) => {
                let offset = self.offset;
                let hashes = filter.num_hashes();
                let encoded = filter.encode();
                let block = ht_format::deflate(FILTER_MAGIC, &encoded, CompressionType::None, &[])?;
                let length = block.len() as u64;
                self.write_all(&block)?;
                (offset, length, hashes)
            }
            None => (0, 0, 0),
        };

        let replaced_files_offset = self.offset;
        let replaced_files = self.replaced_files.finish();
        let replaced_files_length = if replaced_files.is_empty() {
            0
        } else {
            let block = ht_format::deflate(REPFILES_MAGIC, &replaced_files, CompressionType::None, &[])?;
            let length = block.len() as u64;
            self.write_all(&block)?;
            length
        };

        let mut flags = TrailerFlags::empty();
        if use_64bit {
            flags |= TrailerFlags::INDEX_64BIT;
        }
        if self.options.split {
            flags |= TrailerFlags::SPLIT;
        }
        if self.options.major_compaction {
            flags |= TrailerFlags::MAJOR_COMPACTION;
        }

        let compression_ratio_ppm = if self.total_uncompressed == 0 {
            1_000_000
        } else {
            ((self.total_compressed * 1_000_000) / self.total_uncompressed) as u32
        };

        if self.timestamp_min > self.timestamp_max {
            self.timestamp_min = ht_format::TIMESTAMP_NULL;
            self.timestamp_max = ht_format::TIMESTAMP_NULL;
        }

        let trailer = Trailer {
            flags,
            fix_index_offset,
            var_index_offset,
            filter_offset,
            filter_length,
            replaced_files_offset,
            replaced_files_length,
            replaced_files_count: self.replaced_files_count,
            blocksize: self.options.target_blocksize,
            compression: self.options.compression,
            compression_ratio_ppm,
            total_entries: self.total_entries,
            delete_count: self.delete_count,
            key_bytes: self.key_bytes,
            value_bytes: self.value_bytes,
            expirable_bytes: self.expirable_bytes,
            timestamp_min: self.timestamp_min,
            timestamp_max: self.timestamp_max,
            max_revision: self.max_revision,
            bloom_filter_mode: self.options.bloom_filter_mode,
            bloom_hash_count,
            index_entry_count,
            table_id: self.options.table_id,
            table_generation: self.options.table_generation,
            create_time: 0,
        };

        let padding = self.offset.next_multiple_of(DIRECT_IO_ALIGNMENT) - self.offset;
        if padding > 0 {
            self.write_all(&vec![0_u8; padding as usize])?;
        }
        let encoded_trailer = trailer.encode();
        self.write_all(&encoded_trailer)?;

        use std::io::Write as _;
        self.file.flush()?;
        self.file.sync_data()?;

        Ok(CellStoreSummary {
            file_size: self.offset,
            total_entries: self.total_entries,
            delete_count: self.delete_count,
            timestamp_min: self.timestamp_min,
            timestamp_max: self.timestamp_max,
            max_revision: self.max_revision,
            compression_ratio_ppm,
        })
    }
}

/// Chooses the cell store file name for sequence number `id` within an access group directory.
#[must_use]
pub fn cell_store_path(access_group_dir: &Path, id: u64) -> PathBuf {
    access_group_dir.join(format!("cs{id}"))
}

#[cfg(test)]
mod tests {
    use ht_format::{CellFlag, CellKey, CompressionType};
    use ht_vfs::ThreadLocalMemoryFS;
    use ht_vfs::traits::WritableFilesystem as _;

    use super::{CellStoreWriteOptions, CellStoreWriter};
    use crate::trailer::BloomFilterMode;

    #[test]
    fn writes_entries_in_order_and_rejects_regressions() {
        let mut fs = ThreadLocalMemoryFS::default();
        let path = std::path::PathBuf::from("/tables/t/ag/r/cs0");
        let options = CellStoreWriteOptions {
            compression: CompressionType::None,
            bloom_filter_mode: BloomFilterMode::Disabled,
            target_blocksize: 4096,
            ..CellStoreWriteOptions::default()
        };
        let mut writer = CellStoreWriter::create(&mut fs, &path, options).unwrap();

        writer.add(
            &CellKey::new(b"a".as_slice(), 1, b"".as_slice(), CellFlag::Insert, 100, 1),
            b"value-a",
        ).unwrap();
        writer.add(
            &CellKey::new(b"b".as_slice(), 1, b"".as_slice(), CellFlag::Insert, 100, 2),
            b"value-b",
        ).unwrap();

        let err = writer.add(
            &CellKey::new(b"a".as_slice(), 1, b"".as_slice(), CellFlag::Insert, 100, 3),
            b"value-c",
        );
        assert!(err.is_err());
    }

    #[test]
    fn finalize_produces_nonempty_file() {
        let mut fs = ThreadLocalMemoryFS::default();
        let path = std::path::PathBuf::from("/tables/t/ag/r/cs0");
        let options = CellStoreWriteOptions {
            compression: CompressionType::None,
            bloom_filter_mode: BloomFilterMode::Rows,
            target_blocksize: 64,
            ..CellStoreWriteOptions::default()
        };
        let mut writer = CellStoreWriter::create(&mut fs, &path, options).unwrap();
        for i in 0..200_u32 {
            let row = format!("row-{i:06}");
            writer.add(
                &CellKey::new(row.as_bytes(), 1, b"".as_slice(), CellFlag::Insert, 100, i64::from(i)),
                b"value",
            ).unwrap();
        }
        let summary = writer.finalize().unwrap();
        assert_eq!(summary.total_entries, 200);
        assert!(summary.file_size > 0);

        use ht_vfs::traits::ReadableFilesystem as _;
        assert!(fs.size_of(&path).unwrap() > 0);
    }
}
