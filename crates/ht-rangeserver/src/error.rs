//! Error taxonomy for the range-server write path: framing/format errors bubble up unchanged
//! from `ht-format`/`ht-cellstore`/`ht-commitlog`; everything else is classified per the
//! semantic/I-O/invariant split.

use thiserror::Error;

/// Errors raised by [`crate::access_group::AccessGroup`] operations.
#[derive(Debug, Error)]
pub enum AccessGroupError {
    #[error("cell store read failed: {0}")]
    CellStoreRead(#[from] ht_cellstore::CellStoreReadError),

    #[error("cell store write failed: {0}")]
    CellStoreWrite(#[from] ht_cellstore::CellStoreWriteError),

    #[error("commit log write failed: {0}")]
    LogWrite(#[from] ht_commitlog::LogWriteError),

    #[error("commit log read failed: {0}")]
    LogRead(#[from] ht_commitlog::LogReadError),

    #[error("filesystem operation failed: {0}")]
    Filesystem(String),

    #[error(
        "compaction already in progress for this access group; only one outstanding task is \
         allowed"
    )]
    CompactionInProgress,

    #[error("cannot rewrite stores: {0} outstanding scanner(s) hold a reference")]
    ScannersOutstanding(usize),

    #[error("shrink target interval is empty")]
    EmptyShrinkInterval,
}

/// Errors raised while a [`crate::range::Range`] loads, splits, or relinquishes.
#[derive(Debug, Error)]
pub enum RangeError {
    #[error(transparent)]
    AccessGroup(#[from] AccessGroupError),

    #[error("hints file parse error: {0}")]
    Hints(#[from] crate::hints::HintsParseError),

    #[error("filesystem operation failed: {0}")]
    Filesystem(String),

    #[error("range is not in a state that permits this operation (current state: {0:?})")]
    InvalidState(crate::range::RangeState),

    #[error("split row {0:?} does not fall strictly inside [{1:?}, {2:?})")]
    BadSplitRow(Vec<u8>, Vec<u8>, Option<Vec<u8>>),
}

/// Errors raised by the phantom-range recovery participant.
#[derive(Debug, Error)]
pub enum PhantomError {
    #[error(transparent)]
    Range(#[from] RangeError),

    #[error(transparent)]
    AccessGroup(#[from] AccessGroupError),

    #[error("commit log read failed: {0}")]
    LogRead(#[from] ht_commitlog::LogReadError),

    #[error("commit log write failed: {0}")]
    LogWrite(#[from] ht_commitlog::LogWriteError),

    #[error("filesystem operation failed: {0}")]
    Filesystem(String),

    #[error("fragment {0} reported a block out of order")]
    OutOfOrderBlock(u32),

    #[error("fragment {0} reported a duplicate block")]
    DuplicateBlock(u32),

    #[error("fragment {0} is not assigned to this phantom range")]
    UnassignedFragment(u32),

    #[error(
        "phantom range for {start_row:?}..{end_row:?} is in state {state:?}, which does not \
         permit this transition"
    )]
    InvalidState { start_row: Vec<u8>, end_row: Vec<u8>, state: crate::phantom::PhantomState },

    #[error("could not allocate a free phantom log directory after {attempts} attempts")]
    PhantomLogNameExhausted { attempts: u32 },
}
