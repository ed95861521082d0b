//! Cell key model and framed block codec shared by the commit log and cell store.

mod block;
mod checksum;
mod compression;
mod error;
mod key;
mod value;

pub use block::{
    BASE_HEADER_LEN, BlockHeader, HEADER_CHECKSUM_LEN, HEADER_VERSION, MAGIC_LEN,
    append_header_checksum, deflate, inflate, inflate_with_extra, verify_header_checksum,
};
pub use checksum::fletcher32;
pub use compression::CompressionType;
pub use error::BlockError;
pub use key::{
    CellFlag, CellKey, CellKeyComparator, CellKeyRef, REVISION_MIN, TIMESTAMP_MAX, TIMESTAMP_MIN,
    TIMESTAMP_NULL, cmp_keys, decode_key_prefix,
};
pub use value::{CounterOp, CounterValue, ENCODED_LEN as COUNTER_VALUE_LEN};
