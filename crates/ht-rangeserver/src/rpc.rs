//! RangeServer RPC surface (§6): operation names, header flags, and the compaction flag bitset,
//! reproduced as Rust types. Wire framing (length-prefixed, versioned encoding) is out of scope —
//! these types describe the logical surface a transport layer would dispatch on.

use bitflags::bitflags;

/// Every operation a range server exposes to the master and to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RangeServerOp {
    LoadRange,
    Update,
    CreateScanner,
    FetchScanblock,
    DestroyScanner,
    Compact,
    Status,
    Shutdown,
    Dump,
    DumpPseudoTable,
    DropTable,
    DropRange,
    GetStatistics,
    UpdateSchema,
    CommitLogSync,
    WaitForMaintenance,
    AcknowledgeLoad,
    RelinquishRange,
    Heapcheck,
    ReplayFragments,
    PhantomLoad,
    PhantomUpdate,
    PhantomPrepareRanges,
    PhantomCommitRanges,
    SetState,
    TableMaintenanceEnable,
    TableMaintenanceDisable,
}

bitflags! {
    /// Request header flags. `URGENT` marks calls for system ranges and recovery, which jump
    /// ahead of the ordinary application-traffic queue; `PROFILE` asks the server to attach
    /// timing data to the response of a scanner call.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct HeaderFlags: u8 {
        const URGENT  = 0x01;
        const PROFILE = 0x02;
    }
}

bitflags! {
    /// Which class(es) of range a `compact` RPC should target, OR'd with which kind(s) of
    /// compaction to run on them.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CompactionFlags: u32 {
        const ROOT     = 0x01;
        const METADATA = 0x02;
        const SYSTEM   = 0x04;
        const USER     = 0x08;
        const ALL      = 0x0F;
        const MINOR    = 0x10;
        const MAJOR    = 0x20;
        const MERGING  = 0x40;
        const GC       = 0x80;
    }
}

/// `(error_code, message)` as carried by every RPC response per §7.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RpcError {
    pub code:    ErrorCode,
    pub message: String,
}

/// The semantic error classification from §7, independent of the Rust-level error enums in
/// [`crate::error`] — this is what crosses the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    Ok,
    BadMagic,
    BadHeader,
    ChecksumMismatch,
    InflateError,
    UnsupportedType,
    CorruptCellStore,
    DfsIoError,
    CommBrokenConnection,
    CommNotConnected,
    Timeout,
    TableNotFound,
    RangeNotFound,
    RangeAlreadyLoaded,
    NamespaceDoesNotExist,
    NameAlreadyInUse,
    PhantomRangeMapNotFound,
}

impl ErrorCode {
    /// `RANGE_ALREADY_LOADED` on `load_range` is treated as success by the caller (the range is
    /// already in the state the caller wanted); every other non-`Ok` code is a real failure.
    #[must_use]
    pub const fn is_success_for(self, op: RangeServerOp) -> bool {
        matches!(self, Self::Ok)
            || (matches!(self, Self::RangeAlreadyLoaded) && matches!(op, RangeServerOp::LoadRange))
    }
}

/// A batch RPC response keyed by the request element it concerns, per §7's "batch RPCs return a
/// map keyed by the request element" rule (`acknowledge_load`, `phantom_commit_ranges`).
pub type BatchResponse<K> = std::collections::HashMap<K, Result<(), RpcError>>;

#[cfg(test)]
mod tests {
    use super::{CompactionFlags, ErrorCode, RangeServerOp};

    #[test]
    fn compaction_flags_compose_class_and_kind() {
        let flags = CompactionFlags::USER | CompactionFlags::MAJOR;
        assert!(flags.contains(CompactionFlags::USER));
        assert!(flags.contains(CompactionFlags::MAJOR));
        assert!(!flags.contains(CompactionFlags::SYSTEM));
    }

    #[test]
    fn all_covers_every_range_class() {
        assert_eq!(
            CompactionFlags::ALL,
            CompactionFlags::ROOT | CompactionFlags::METADATA | CompactionFlags::SYSTEM | CompactionFlags::USER,
        );
    }

    #[test]
    fn range_already_loaded_is_success_only_for_load_range() {
        assert!(ErrorCode::RangeAlreadyLoaded.is_success_for(RangeServerOp::LoadRange));
        assert!(!ErrorCode::RangeAlreadyLoaded.is_success_for(RangeServerOp::Update));
    }
}
