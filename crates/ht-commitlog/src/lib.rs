//! Multi-fragment commit log: numbered fragment files within a log directory, framed data and
//! link blocks, and a group-commit writer paired with a skip-errors-aware reader.

mod block;
mod error;
mod fragment;
mod reader;
mod writer;

pub use block::{DATA_MAGIC, LINK_MAGIC, ParsedBlock, build_data_block, build_link_block, parse_block};
pub use error::{LogReadError, LogWriteError};
pub use fragment::{
    find_mark, fragment_name, fragment_path, list_fragments, mark_name, mark_path,
    purge_marked_fragments, write_mark,
};
pub use reader::{CommitLogReader, ReplayResult};
pub use writer::{CommitLogWriter, DEFAULT_FRAGMENT_ROLL_SIZE};
