//! Immutable on-disk cell store (reader/writer v6): data blocks, fixed+variable block index,
//! bloom filter, replaced-files list, and trailer, all aligned to the direct-IO boundary.

mod block_index;
mod bloom;
mod error;
mod key_compress;
mod pool;
mod pseudo_table;
mod reader;
mod trailer;
mod writer;

pub use block_index::{BlockIndexBuilder, BlockIndexReader};
pub use bloom::{BloomFilter, BloomFilterBuilder, DEFAULT_MAX_APPROX_ITEMS};
pub use error::{CellStoreReadError, CellStoreWriteError};
pub use key_compress::{KeyCompressor, KeyDecompressor};
pub use pseudo_table::{IndexPseudoTableRow, populate_index_pseudo_table_scanner};
pub use reader::{CellStoreReader, CellStoreScannerInterval};
pub use trailer::{
    BloomFilterMode, DIRECT_IO_ALIGNMENT, TRAILER_LEN, TRAILER_VERSION, Trailer, TrailerFlags,
};
pub use writer::{CellStoreSummary, CellStoreWriteOptions, CellStoreWriter, cell_store_path};
