//! Per-range write path for a Hypertable-style range server: the cell cache and access group
//! that absorb writes, the range abstraction that owns a row interval's access groups, the
//! maintenance scheduler that decides what compaction runs next, and the phantom-range recovery
//! participant that replays a failed server's log during failover.

mod access_group;
mod cell_cache;
pub mod config;
pub mod error;
pub mod hints;
mod memory_tracker;
pub mod phantom;
pub mod range;
pub mod rpc;
pub mod scheduler;

pub use access_group::{AccessGroup, AccessGroupProperties, AccessGroupScanner, CompactionState};
pub use cell_cache::{CellCache, FrozenCellCache};
pub use memory_tracker::MemoryTracker;
