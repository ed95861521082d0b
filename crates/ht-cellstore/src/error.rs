use thiserror::Error;

/// Errors writing a cell store. Once returned, the writer that produced it should be abandoned;
/// the caller is responsible for removing whatever partial file was left behind in the DFS.
#[derive(Error, Debug)]
pub enum CellStoreWriteError {
    #[error("cell store block framing error: {0}")]
    Block(#[from] ht_format::BlockError),
    #[error("cell store write failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("cells were not added to the writer in ascending key order")]
    OutOfOrder,
}

/// Errors reading or scanning an already-written cell store.
#[derive(Error, Debug)]
pub enum CellStoreReadError {
    #[error("cell store block framing error: {0}")]
    Block(#[from] ht_format::BlockError),
    #[error("cell store read failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("cell store trailer was truncated or malformed")]
    BadTrailer,
    #[error("cell store trailer carried an unsupported format version `{0}`")]
    UnsupportedVersion(u8),
    #[error("cell store block index was truncated or malformed")]
    BadIndex,
    #[error("requested block index {0} is out of range")]
    IndexOutOfRange(usize),
}
