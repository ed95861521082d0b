//! Encapsulates state common to every access group of a key-range (C6): row interval, table
//! identity, state bitmask, and the split/relinquish operations that hand off rows to a sibling.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use bitflags::bitflags;
use ht_format::{CellFlag, CellKey};
use ht_vfs::traits::{ReadableFilesystem, WritableFilesystem};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::access_group::{AccessGroup, AccessGroupProperties, HintsContext};
use crate::error::{AccessGroupError, RangeError};
use crate::hints::RangeHints;
use crate::memory_tracker::MemoryTracker;

bitflags! {
    /// A range's lifecycle bitmask. Several bits can be set at once (e.g. a range mid-split is
    /// both `STEADY` from a client's perspective and `SPLIT_LOG_INSTALLED` internally).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct RangeState: u32 {
        const STEADY                    = 0x01;
        const SPLIT_LOG_INSTALLED       = 0x02;
        const SPLIT_SHRUNK              = 0x04;
        const RELINQUISH_LOG_INSTALLED  = 0x08;
        const PHANTOM                   = 0x10;
    }
}

/// Identifies the table and schema generation a range belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableIdentity {
    pub table_id:   u64,
    pub generation: u32,
}

/// One table-row-interval range, owned at any moment by exactly one range server.
pub struct Range<FS: WritableFilesystem> {
    pub table:             TableIdentity,
    pub start_row:         Vec<u8>,
    pub end_row:           Option<Vec<u8>>,
    pub access_groups:     Vec<Arc<AccessGroup<FS>>>,
    state:                 Mutex<RangeInner>,
}

struct RangeInner {
    flags:               RangeState,
    original_transfer_log: Option<PathBuf>,
    transfer_log:          Option<PathBuf>,
}

impl<FS: WritableFilesystem> Range<FS> {
    #[must_use]
    pub fn new(
        table:         TableIdentity,
        start_row:     Vec<u8>,
        end_row:       Option<Vec<u8>>,
        access_groups: Vec<Arc<AccessGroup<FS>>>,
    ) -> Self {
        Self {
            table,
            start_row,
            end_row,
            access_groups,
            state: Mutex::new(RangeInner {
                flags: RangeState::STEADY,
                original_transfer_log: None,
                transfer_log: None,
            }),
        }
    }

    #[must_use]
    pub fn state(&self) -> RangeState {
        self.state.lock().flags
    }

    pub fn set_state(&self, flags: RangeState) {
        self.state.lock().flags = flags;
    }

    #[must_use]
    pub fn transfer_log(&self) -> Option<PathBuf> {
        self.state.lock().transfer_log.clone()
    }

    #[must_use]
    pub fn original_transfer_log(&self) -> Option<PathBuf> {
        self.state.lock().original_transfer_log.clone()
    }

    pub fn set_transfer_log(&self, path: Option<PathBuf>) {
        self.state.lock().transfer_log = path;
    }

    /// Applies one mutation to whichever access group owns `key.column_family_id`. Returns
    /// `false` (the key was dropped, not applied) only per the access group's own replay rule —
    /// see [`AccessGroup::add`].
    pub fn apply(
        &self,
        key:               CellKey,
        value:             Vec<u8>,
        recovering:        bool,
        ignore_clock_skew: bool,
    ) -> Result<bool, RangeError> {
        let ag = self.access_group_for(key.column_family_id)?;
        Ok(ag.add(key, value, recovering, ignore_clock_skew))
    }

    fn access_group_for(&self, column_family_id: u8) -> Result<&Arc<AccessGroup<FS>>, RangeError> {
        self.access_groups
            .iter()
            .find(|ag| ag.column_family_ids().contains(&column_family_id))
            .ok_or_else(|| RangeError::InvalidState(self.state()))
    }

    /// Chooses a split row from the aggregate per-row count across every access group's live
    /// cache, picking the row nearest the midpoint by cumulative count. Returns `None` if there
    /// is no data to split on.
    #[must_use]
    pub fn choose_split_row(&self) -> Option<Vec<u8>> {
        let mut estimate: BTreeMap<Vec<u8>, u64> = BTreeMap::new();
        for ag in &self.access_groups {
            ag.split_row_estimate_data(&mut estimate);
        }
        if estimate.is_empty() {
            return None;
        }
        let total: u64 = estimate.values().sum();
        let midpoint = total / 2;
        let mut cumulative = 0_u64;
        for (row, count) in &estimate {
            cumulative += count;
            if cumulative >= midpoint {
                return Some(row.clone());
            }
        }
        estimate.keys().next_back().cloned()
    }

    /// Freezes and flushes every access group to a split-marked cell store, then shrinks each
    /// access group to `[start_row, split_row)` (this range keeps the lower half; the caller is
    /// responsible for constructing the sibling covering `[split_row, end_row)` and emitting its
    /// load message to the master).
    pub fn split(&self, split_row: &[u8]) -> Result<(), RangeError> {
        if split_row <= self.start_row.as_slice()
            || self.end_row.as_deref().is_some_and(|end| split_row >= end)
        {
            return Err(RangeError::BadSplitRow(
                split_row.to_vec(), self.start_row.clone(), self.end_row.clone(),
            ));
        }

        self.state.lock().flags.insert(RangeState::SPLIT_LOG_INSTALLED);
        for ag in &self.access_groups {
            ag.stage_compaction().or_else(skip_if_already_staged)?;
            ag.minor_compact()?;
            ag.major_compact()?;
        }
        for ag in &self.access_groups {
            ag.shrink(Some(self.start_row.as_slice()), Some(split_row))?;
        }
        self.state.lock().flags.insert(RangeState::SPLIT_SHRUNK);
        info!(
            table_id = self.table.table_id,
            split_row = %String::from_utf8_lossy(split_row),
            "range split: shrunk to lower half",
        );
        Ok(())
    }

    /// Freezes and flushes every access group, marks `RELINQUISH_LOG_INSTALLED`, and returns the
    /// transfer log path the new owner must replay during `load_range`.
    pub fn relinquish(&self) -> Result<Option<PathBuf>, RangeError> {
        for ag in &self.access_groups {
            ag.stage_compaction().or_else(skip_if_already_staged)?;
            ag.minor_compact()?;
        }
        self.state.lock().flags.insert(RangeState::RELINQUISH_LOG_INSTALLED);
        Ok(self.transfer_log())
    }
}

fn skip_if_already_staged(err: AccessGroupError) -> Result<(), AccessGroupError> {
    match err {
        AccessGroupError::CompactionInProgress => Ok(()),
        other => Err(other),
    }
}

/// The file name of a range's hints file (§6) within its directory.
pub const HINTS_FILE_NAME: &str = "hints";

/// Creates the access groups for `table` from a column-family-to-access-group assignment, opens
/// whatever cell stores they already have on disk, and seeds their live caches from
/// `replay_entries` (the transfer log's contents, if one was present) before the range is
/// registered in the range server's range map.
///
/// Stores are reopened from the range's `hints` file (§6) when present and parseable; on a
/// missing or corrupt hints file, each access group directory is listed directly instead, per
/// the spec's "missing/corrupt hints are a cache miss, not a fatal error" rule. Either way, each
/// access group is left with a [`HintsContext`] attached so future compactions keep the hints
/// file current.
pub fn load_access_groups<FS: WritableFilesystem>(
    table:             TableIdentity,
    dir:               PathBuf,
    start_row:         Vec<u8>,
    end_row:           Option<Vec<u8>>,
    location:          String,
    assignment:        &[(String, Vec<u8>)],
    fs:                FS,
    tracker:           MemoryTracker,
    replay_entries:    Vec<(CellKey, Vec<u8>)>,
) -> Vec<Arc<AccessGroup<FS>>>
where
    FS: Clone,
{
    let hints_path = dir.join(HINTS_FILE_NAME);
    let hints = read_hints(&fs, &hints_path);

    let groups: Vec<Arc<AccessGroup<FS>>> = assignment
        .iter()
        .map(|(name, cf_ids)| {
            let ag_dir = dir.join(name);
            let ag = AccessGroup::new(
                name.clone(), ag_dir.clone(), cf_ids.clone(),
                AccessGroupProperties::default(), fs.clone(), tracker.clone(),
            );

            let opened = match hints.as_ref().and_then(|h| h.access_groups.get(name)) {
                Some(ag_hints) => ag.open_stores(&ag_hints.files),
                None => open_stores_from_directory(&ag, &fs, &ag_dir),
            };
            if let Err(err) = opened {
                warn!(
                    table_id = table.table_id,
                    access_group = %name,
                    error = %err,
                    "failed to open existing cell stores while loading access group",
                );
            }

            let ag = ag.with_hints_context(HintsContext {
                path:      hints_path.clone(),
                start_row: start_row.clone(),
                end_row:   end_row.clone(),
                location:  location.clone(),
            });
            Arc::new(ag)
        })
        .collect();

    let mut tombstones = 0_usize;
    for (key, value) in replay_entries {
        if key.flag != CellFlag::Insert {
            tombstones += 1;
        }
        if let Some(ag) = groups.iter().find(|ag| ag.column_family_ids().contains(&key.column_family_id)) {
            ag.add(key, value, true, false);
        }
    }
    info!(
        table_id = table.table_id,
        access_groups = groups.len(),
        tombstones,
        used_hints = hints.is_some(),
        "loaded access groups from disk and transfer log replay",
    );
    groups
}

/// Reads and parses the range's hints file, returning `None` on anything short of a clean parse
/// (missing file, I/O error, or corrupt contents) so the caller falls back to a directory scan.
fn read_hints<FS: WritableFilesystem>(fs: &FS, path: &std::path::Path) -> Option<RangeHints> {
    use std::io::Read as _;

    let mut file = fs.open_sequential(path).ok()?;
    let mut text = String::new();
    file.read_to_string(&mut text).ok()?;
    match RangeHints::parse(&text) {
        Ok(hints) => Some(hints),
        Err(err) => {
            warn!(path = %path.display(), error = %err, "ignoring corrupt hints file, falling back to directory scan");
            None
        }
    }
}

/// Lists `ag_dir` directly and opens every file that looks like a cell store (`cs<id>`), for
/// when no hints file is available to say which files belong to this access group.
fn open_stores_from_directory<FS: WritableFilesystem>(
    ag:     &AccessGroup<FS>,
    fs:     &FS,
    ag_dir: &std::path::Path,
) -> Result<(), AccessGroupError> {
    use ht_vfs::traits::IntoDirectoryIterator as _;

    let Ok(children) = fs.children(ag_dir) else {
        // The access group directory doesn't exist yet (a brand-new range); nothing to open.
        return Ok(());
    };
    let files: Vec<String> = children
        .dir_iter()
        .filter_map(|entry| entry.ok())
        .filter_map(|path| path.file_name()?.to_str().map(str::to_string))
        .filter(|name| {
            name.strip_prefix("cs").is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
        })
        .collect();
    ag.open_stores(&files)
}

#[cfg(test)]
mod tests {
    use super::RangeState;

    #[test]
    fn state_bits_compose() {
        let state = RangeState::STEADY | RangeState::SPLIT_LOG_INSTALLED;
        assert!(state.contains(RangeState::STEADY));
        assert!(state.contains(RangeState::SPLIT_LOG_INSTALLED));
        assert!(!state.contains(RangeState::PHANTOM));
    }
}
