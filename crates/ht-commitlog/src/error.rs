use thiserror::Error;

/// A corruption observed while replaying framed blocks out of a fragment file.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogReadError {
    #[error("commit-log block framing error: {0}")]
    Block(#[from] ht_format::BlockError),
    #[error("fragment or mark file could not be read: {0}")]
    Io(String),
}

/// A fatal error writing to a commit log fragment; the writer should be considered unusable
/// afterward and the log reopened from scratch once the underlying issue is addressed.
#[derive(Error, Debug)]
pub enum LogWriteError {
    #[error("commit-log block framing error: {0}")]
    Block(#[from] ht_format::BlockError),
    #[error("commit-log fragment write failed: {0}")]
    Io(#[from] std::io::Error),
}
