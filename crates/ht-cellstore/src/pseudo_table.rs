//! Diagnostic projection of a cell store's block index as synthetic rows, so a `.cellstore.index`
//! pseudo-table can be scanned like any other table instead of needing a bespoke RPC.

use ht_vfs::traits::ReadableFilesystem;

use crate::error::CellStoreReadError;
use crate::reader::CellStoreReader;

/// One synthetic row of the `.cellstore.index` pseudo-table, describing a single data block.
#[derive(Debug, Clone)]
pub struct IndexPseudoTableRow {
    /// Synthetic row key: the block's position within the store, decimal, zero-padded to sort
    /// correctly alongside other blocks' rows.
    pub row_key:         String,
    /// Uncompressed size of the block's payload, in bytes.
    pub size:            u32,
    /// On-disk size of the block, header included, in bytes.
    pub compressed_size: u32,
    /// Number of cell entries the block holds.
    pub key_count:       u32,
}

/// Produces one [`IndexPseudoTableRow`] per data block in the store's block index, in block
/// order. Forces the block index to load, same as [`CellStoreReader::create_scanner`].
pub fn populate_index_pseudo_table_scanner<FS: ReadableFilesystem>(
    reader: &CellStoreReader<FS>,
) -> Result<Vec<IndexPseudoTableRow>, CellStoreReadError> {
    let block_count = {
        let interval = reader.create_scanner(None, None)?;
        match interval {
            crate::reader::CellStoreScannerInterval::BlockIndex(blocks) => blocks.len(),
            crate::reader::CellStoreScannerInterval::Readahead => 0,
        }
    };

    let mut rows = Vec::with_capacity(block_count);
    for block_index in 0..block_count {
        let entries = reader.scan_block(block_index)?;
        let key_count = u32::try_from(entries.len()).unwrap_or(u32::MAX);
        let size: u32 = entries.iter().map(|(k, v)| (k.len() + v.len()) as u32).sum();

        let offset = reader.block_offset(block_index)?;
        let compressed_size = reader.block_framed_len(offset)?;

        rows.push(IndexPseudoTableRow {
            row_key: format!("{block_index:012}"),
            size,
            compressed_size,
            key_count,
        });
    }
    Ok(rows)
}
