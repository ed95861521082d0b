//! Range identity and classification shared by the balance plan authority and the recovery
//! operation. Mirrors the wire-level `QualifiedRangeSpec`/`RangeState`/range-class vocabulary a
//! range server RPC surface would carry (§6); the RPC framing itself is out of scope, so these
//! are plain value types rather than encoded wire structures.

/// One of the four commit-log classes a range belongs to. Recovery always finishes root before
/// metadata, metadata before system, and system before any user-range recovery (§4.10 "Order
/// across classes").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RangeClass {
    Root,
    Metadata,
    System,
    User,
}

impl RangeClass {
    pub const ALL: [Self; 4] = [Self::Root, Self::Metadata, Self::System, Self::User];

    #[must_use]
    pub const fn index(self) -> usize {
        match self {
            Self::Root => 0,
            Self::Metadata => 1,
            Self::System => 2,
            Self::User => 3,
        }
    }

    #[must_use]
    pub const fn log_dir_name(self) -> &'static str {
        match self {
            Self::Root => "root",
            Self::Metadata => "metadata",
            Self::System => "system",
            Self::User => "user",
        }
    }
}

/// Identifies a range across a load/replay/prepare/commit cycle: the table plus its row
/// interval. Kept structurally identical to `ht-rangeserver::phantom::QualifiedRangeSpec` so a
/// real deployment's RPC layer can convert between the two without ambiguity, but defined locally
/// since the master does not otherwise depend on range-server internals.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QualifiedRangeSpec {
    pub table_id:  u64,
    pub start_row: Vec<u8>,
    pub end_row:   Option<Vec<u8>>,
}

/// Snapshot of a range's load state at the moment its owning server was lost, carried through the
/// recovery plan so a receiver can decide whether it needs a full load or can resume a pending
/// split/relinquish. Opaque to the balance plan authority itself; its bits mirror
/// `ht-rangeserver::range::RangeState`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RangeState {
    pub bits: u8,
}

impl RangeState {
    pub const STEADY: Self = Self { bits: 0 };
}
