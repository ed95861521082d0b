//! The write path's core (C5): per-access-group cell cache, stores vector, compaction state
//! machine, and the garbage collection that runs during major/GC compaction.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use ht_cellstore::{
    BloomFilterMode, CellStoreReader, CellStoreScannerInterval, CellStoreSummary,
    CellStoreWriteOptions, CellStoreWriter,
};
use ht_format::{CellFlag, CellKey, CompressionType, cmp_keys};
use ht_vfs::traits::WritableFilesystem;
use parking_lot::{Condvar, Mutex};
use tracing::{info, warn};

use crate::cell_cache::{CellCache, FrozenCellCache};
use crate::error::AccessGroupError;
use crate::hints::{AccessGroupHints, RangeHints};
use crate::memory_tracker::MemoryTracker;

/// Cellstore property bag: the knobs every store this access group writes inherits.
#[derive(Debug, Clone)]
pub struct AccessGroupProperties {
    pub compressor:          CompressionType,
    pub target_blocksize:    u32,
    pub replication:         Option<i32>,
    pub bloom_filter_mode:   BloomFilterMode,
    pub bloom_bits_per_item: f64,
}

impl Default for AccessGroupProperties {
    fn default() -> Self {
        Self {
            compressor:          CompressionType::Zlib,
            target_blocksize:    65536,
            replication:         None,
            bloom_filter_mode:   BloomFilterMode::Rows,
            bloom_bits_per_item: 10.0,
        }
    }
}

/// Where an access group sits in its compaction state machine (§4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompactionState {
    Idle,
    Staged,
    Minor,
    Merging,
    Major,
    Gc,
    InMemory,
    Split,
}

struct StoreEntry<FS: WritableFilesystem> {
    id:           u64,
    reader:       CellStoreReader<FS>,
    shadow_cache: Mutex<HashMap<Vec<u8>, bool>>,
}

/// Everything the single access-group mutex protects: stores, accounting, and compaction state.
struct AgState<FS: WritableFilesystem> {
    fs:                       FS,
    stores:                   Vec<StoreEntry<FS>>,
    immutable_cache:          Option<FrozenCellCache>,
    next_cs_id:               u64,
    live_files:               Vec<String>,
    disk_usage:               u64,
    compression_ratio_ppm:    u32,
    earliest_cached_revision: Option<i64>,
    latest_stored_revision:   i64,
    clock_skew_errors:        u64,
    compaction:               CompactionState,
    in_memory:                bool,
    garbage_bytes:            u64,
}

/// The per-range context an access group needs to keep the shared `hints` file (§4.5/§6)
/// up to date after every compaction that changes its stores. An access group with no hints
/// context (the default) simply skips the write, which is harmless: the file is an optional
/// startup fast path, not a durability requirement.
#[derive(Debug, Clone)]
pub struct HintsContext {
    pub path:      PathBuf,
    pub start_row: Vec<u8>,
    pub end_row:   Option<Vec<u8>>,
    pub location:  String,
}

/// One access group: a set of column families physically stored together in one LSM tree
/// within a range.
pub struct AccessGroup<FS: WritableFilesystem> {
    pub name:          String,
    pub dir:           PathBuf,
    column_family_ids: Vec<u8>,
    properties:        AccessGroupProperties,
    live_cache:        CellCache,
    state:             Mutex<AgState<FS>>,
    scanner_count:     Arc<(Mutex<usize>, Condvar)>,
    tracker:           MemoryTracker,
    hints:             Option<HintsContext>,
}

impl<FS: WritableFilesystem> AccessGroup<FS> {
    pub fn new(
        name:              impl Into<String>,
        dir:               PathBuf,
        column_family_ids: Vec<u8>,
        properties:        AccessGroupProperties,
        fs:                FS,
        tracker:           MemoryTracker,
    ) -> Self {
        Self {
            name: name.into(),
            dir,
            column_family_ids,
            properties,
            live_cache: CellCache::new(tracker.clone()),
            state: Mutex::new(AgState {
                fs,
                stores: Vec::new(),
                immutable_cache: None,
                next_cs_id: 0,
                live_files: Vec::new(),
                disk_usage: 0,
                compression_ratio_ppm: 1_000_000,
                earliest_cached_revision: None,
                latest_stored_revision: ht_format::REVISION_MIN,
                clock_skew_errors: 0,
                compaction: CompactionState::Idle,
                in_memory: false,
                garbage_bytes: 0,
            }),
            scanner_count: Arc::new((Mutex::new(0), Condvar::new())),
            tracker,
            hints: None,
        }
    }

    /// Attaches the range-level context needed to keep the `hints` file current after
    /// compactions. Call before handing the access group to callers that expect it.
    #[must_use]
    pub fn with_hints_context(mut self, hints: HintsContext) -> Self {
        self.hints = Some(hints);
        self
    }

    #[must_use]
    pub fn column_family_ids(&self) -> &[u8] {
        &self.column_family_ids
    }

    #[must_use]
    pub fn memory_tracker(&self) -> &MemoryTracker {
        &self.tracker
    }

    #[must_use]
    pub fn in_memory(&self) -> bool {
        self.state.lock().in_memory
    }

    pub fn set_in_memory(&self, in_memory: bool) {
        self.state.lock().in_memory = in_memory;
    }

    #[must_use]
    pub fn latest_stored_revision(&self) -> i64 {
        self.state.lock().latest_stored_revision
    }

    #[must_use]
    pub fn earliest_cached_revision(&self) -> Option<i64> {
        self.state.lock().earliest_cached_revision
    }

    #[must_use]
    pub fn disk_usage(&self) -> u64 {
        self.state.lock().disk_usage
    }

    #[must_use]
    pub fn clock_skew_errors(&self) -> u64 {
        self.state.lock().clock_skew_errors
    }

    #[must_use]
    pub fn garbage_bytes(&self) -> u64 {
        self.state.lock().garbage_bytes
    }

    #[must_use]
    pub fn store_count(&self) -> usize {
        self.state.lock().stores.len()
    }

    #[must_use]
    pub fn compression_ratio_ppm(&self) -> u32 {
        self.state.lock().compression_ratio_ppm
    }

    #[must_use]
    pub fn live_files(&self) -> Vec<String> {
        self.state.lock().live_files.clone()
    }

    #[must_use]
    pub fn compaction_state(&self) -> CompactionState {
        self.state.lock().compaction
    }

    #[must_use]
    pub fn outstanding_scanners(&self) -> usize {
        *self.scanner_count.0.lock()
    }

    /// Clears every store's memoized bloom-filter-hit cache, reclaiming the memory it tracked.
    pub fn purge_shadow_caches(&self) {
        let state = self.state.lock();
        let mut freed = 0_u64;
        for store in &state.stores {
            let mut cache = store.shadow_cache.lock();
            for row in cache.keys() {
                freed += (row.len() + std::mem::size_of::<bool>()) as u64;
            }
            cache.clear();
        }
        drop(state);
        if freed > 0 {
            self.tracker.add_shadow_cache_bytes(-i64::try_from(freed).unwrap_or(i64::MAX));
        }
    }

    /// Drops the loaded bloom filter and, for stores with no outstanding scanner, the block index
    /// too, for every cell store in this access group.
    pub fn purge_idle_block_indexes(&self) {
        let state = self.state.lock();
        for store in &state.stores {
            store.reader.purge_indexes();
        }
    }

    /// Opens a set of already-written cell store files (named `cs<id>`, as produced by
    /// [`Self::flush_entries_replacing`]) and adds them to this access group's store set. Used
    /// when a range loads an access group that already has stores on disk, either from a
    /// `hints` file's file list or from a directory scan fallback. `latest_stored_revision` is
    /// restored from each opened store's own trailer, so it's correct even without a hints file.
    pub fn open_stores(&self, file_names: &[String]) -> Result<(), AccessGroupError> {
        let mut state = self.state.lock();
        for file_name in file_names {
            let Some(id) = file_name.strip_prefix("cs").and_then(|rest| rest.parse::<u64>().ok())
            else {
                warn!(access_group = %self.name, file = %file_name, "skipping unrecognized store filename");
                continue;
            };
            if state.stores.iter().any(|s| s.id == id) {
                continue;
            }
            let path = ht_cellstore::cell_store_path(&self.dir, id);
            let reader = CellStoreReader::open(&state.fs, &path).map_err(AccessGroupError::from)?;
            state.next_cs_id = state.next_cs_id.max(id + 1);
            state.latest_stored_revision = state.latest_stored_revision.max(reader.trailer().max_revision);
            state.stores.push(StoreEntry { id, reader, shadow_cache: Mutex::new(HashMap::new()) });
            state.live_files.push(file_name.clone());
        }
        state.stores.sort_by_key(|s| s.id);
        state.disk_usage = state.stores.iter().map(|s| s.reader.disk_usage()).sum();
        Ok(())
    }

    /// `add(key, value)` gated by the revision/recovery/in-memory rule in §4.5. Returns `true`
    /// if the cell was inserted, `false` if it was silently dropped as an already-applied replay.
    pub fn add(
        &self,
        key:               CellKey,
        value:             Vec<u8>,
        recovering:        bool,
        ignore_clock_skew: bool,
    ) -> bool {
        if !self.should_apply(key.revision, recovering, ignore_clock_skew) {
            return false;
        }
        self.live_cache.add(key, value);
        true
    }

    /// Same gating as [`Self::add`], but merge-semantic per [`CellCache::add_counter`].
    pub fn add_counter(
        &self,
        key:               CellKey,
        op:                ht_format::CounterValue,
        recovering:        bool,
        ignore_clock_skew: bool,
    ) -> bool {
        if !self.should_apply(key.revision, recovering, ignore_clock_skew) {
            return false;
        }
        self.live_cache.add_counter(key, op);
        true
    }

    fn should_apply(&self, revision: i64, recovering: bool, ignore_clock_skew: bool) -> bool {
        let mut state = self.state.lock();
        if revision > state.latest_stored_revision || ignore_clock_skew {
            return true;
        }
        if !recovering {
            state.clock_skew_errors += 1;
            warn!(
                access_group = %self.name,
                revision,
                latest_stored_revision = state.latest_stored_revision,
                "incoming revision does not exceed latest stored revision; admitting anyway \
                 and counting as clock skew",
            );
            return true;
        }
        state.in_memory
    }

    /// Merge-scans the live cache, the frozen immutable cache (if any), and every in-scope cell
    /// store over `[start, end]` (`None` meaning unbounded on that side), returning entries in
    /// ascending key order. Holds a scanner-outstanding reference for the returned guard's
    /// lifetime.
    pub fn create_scanner(
        &self,
        start: Option<&CellKey>,
        end:   Option<&CellKey>,
    ) -> Result<AccessGroupScanner, AccessGroupError> {
        *self.scanner_count.0.lock() += 1;

        let mut merged = self.live_cache.scan(start, end);
        let state = self.state.lock();
        if let Some(immutable) = state.immutable_cache.as_ref() {
            merged.extend(immutable.scan(start, end));
        }

        let start_bytes = start.map(encode_key);
        let end_bytes = end.map(encode_key);
        // A scan is "single-row" when both ends fall within the same row; the bloom filter is
        // keyed by row (and, in `RowsAndColumns` mode, row+column-family), so it's only useful
        // as a pre-filter when the scan can't span multiple rows anyway.
        let single_row = matches!((start, end), (Some(s), Some(e)) if s.row == e.row);
        let mut bytes_read = 0_u64;
        for store in &state.stores {
            if single_row && self.properties.bloom_filter_mode != BloomFilterMode::Disabled {
                let row = &start.expect("single_row implies Some(start)").row;
                let may_contain = {
                    let cache = store.shadow_cache.lock();
                    cache.get(row).copied()
                };
                let may_contain = match may_contain {
                    Some(cached) => cached,
                    None => {
                        let hit = store
                            .reader
                            .may_contain(row, &self.column_family_ids)
                            .map_err(AccessGroupError::from)?;
                        store.shadow_cache.lock().insert(row.clone(), hit);
                        self.tracker.add_shadow_cache_bytes(
                            i64::try_from(row.len() + std::mem::size_of::<bool>()).unwrap_or(i64::MAX),
                        );
                        hit
                    }
                };
                if !may_contain {
                    continue;
                }
            }

            let interval = store
                .reader
                .create_scanner(start_bytes.as_deref(), end_bytes.as_deref())
                .map_err(AccessGroupError::from)?;
            let CellStoreScannerInterval::BlockIndex(blocks) = interval else {
                continue;
            };
            for block in blocks {
                let entries = store.reader.scan_block(block).map_err(AccessGroupError::from)?;
                for (key_bytes, value) in entries {
                    bytes_read += (key_bytes.len() + value.len()) as u64;
                    let (key_ref, _) = ht_format::decode_key_prefix(&key_bytes)
                        .expect("cell store entries are always well-formed");
                    let key = CellKey::new(
                        key_ref.row, key_ref.column_family_id, key_ref.column_qualifier,
                        key_ref.flag, key_ref.timestamp, key_ref.revision,
                    );
                    merged.push((key, value));
                }
            }
            store.reader.release_scanner();
        }
        drop(state);

        merged.sort_by(|(a, _), (b, _)| cmp_keys(&key_ref(a), &key_ref(b)));

        Ok(AccessGroupScanner {
            entries:       merged,
            position:      0,
            bytes_read,
            scanner_count: Arc::clone(&self.scanner_count),
        })
    }

    /// Accumulates per-row counts from the live cache, seeding the split-row chooser.
    pub fn split_row_estimate_data(&self, estimate: &mut std::collections::BTreeMap<Vec<u8>, u64>) {
        self.live_cache.split_row_estimate_data(estimate);
    }

    /// `stage_compaction`: freezes the live cache and snapshots garbage stats. Fails if a
    /// compaction is already staged or in progress.
    pub fn stage_compaction(&self) -> Result<(), AccessGroupError> {
        let mut state = self.state.lock();
        if state.compaction != CompactionState::Idle {
            return Err(AccessGroupError::CompactionInProgress);
        }
        let frozen = self.live_cache.freeze();
        state.immutable_cache = Some(frozen);
        state.compaction = CompactionState::Staged;
        Ok(())
    }

    /// Minor compaction: flushes the staged immutable cache to a new cell store. A no-op (and
    /// `Ok(None)`) if the immutable cache is empty, matching the boundary behavior that an empty
    /// compaction produces no cell store and leaves `stores` unchanged.
    pub fn minor_compact(&self) -> Result<Option<CellStoreSummary>, AccessGroupError> {
        let mut state = self.state.lock();
        let Some(frozen) = state.immutable_cache.take() else {
            state.compaction = CompactionState::Idle;
            return Ok(None);
        };
        if frozen.is_empty() {
            state.compaction = CompactionState::Idle;
            return Ok(None);
        }
        state.compaction = CompactionState::Minor;
        let entries = frozen.scan(None, None);
        let summary = self.flush_entries(&mut state, entries, false)?;
        state.compaction = CompactionState::Idle;
        Ok(Some(summary))
    }

    /// Walks `stores` front-to-back (newest first) accumulating disk usage; a contiguous run of
    /// at least `merge_run_length_threshold` stores whose cumulative size is in
    /// `[target_min, target_max]` qualifies. Runs exceeding `target_max` are not extended further.
    #[must_use]
    pub fn find_merge_run(
        &self,
        merge_run_length_threshold: usize,
        target_min:                 u64,
        target_max:                 u64,
    ) -> Option<Vec<usize>> {
        let state = self.state.lock();
        if state.stores.len() < 2 {
            return None;
        }
        let mut best: Option<Vec<usize>> = None;
        let mut run_start = 0_usize;
        while run_start < state.stores.len() {
            let mut cumulative = 0_u64;
            let mut run_end = run_start;
            while run_end < state.stores.len() {
                let size = state.stores[run_end].reader.disk_usage();
                if cumulative + size > target_max && run_end > run_start {
                    break;
                }
                cumulative += size;
                run_end += 1;
                if cumulative >= target_min && (run_end - run_start) >= merge_run_length_threshold {
                    best = Some((run_start..run_end).collect());
                    break;
                }
            }
            if best.is_some() {
                break;
            }
            run_start += 1;
        }
        best
    }

    /// Merges the stores at `indices` (indices into the current `stores` vector, ascending) into
    /// one new store, preserving every entry including tombstones — unlike major compaction,
    /// merging never drops garbage.
    pub fn merge_compact(&self, indices: &[usize]) -> Result<CellStoreSummary, AccessGroupError> {
        let mut state = self.state.lock();
        if state.compaction != CompactionState::Idle && state.compaction != CompactionState::Staged {
            return Err(AccessGroupError::CompactionInProgress);
        }
        state.compaction = CompactionState::Merging;

        let mut entries = Vec::new();
        let mut superseded = Vec::new();
        for &index in indices {
            let store = &state.stores[index];
            superseded.push(store.id);
            for block in 0..store_block_count(store) {
                entries.extend(
                    store.reader.scan_block(block).map_err(AccessGroupError::from)?
                        .into_iter()
                        .map(decode_cell_store_entry),
                );
            }
        }
        entries.sort_by(|(a, _), (b, _)| cmp_keys(&key_ref(a), &key_ref(b)));

        let summary = self.flush_entries_replacing(&mut state, entries, &superseded, indices, false)?;
        state.compaction = CompactionState::Idle;
        Ok(summary)
    }

    /// Major compaction: merges every store plus the immutable cache into one store, dropping
    /// expired/deleted/shadowed versions, and clears the garbage tracker. If every live entry
    /// turns out to be garbage, the superseded stores are dropped and no replacement is written.
    pub fn major_compact(&self) -> Result<Option<CellStoreSummary>, AccessGroupError> {
        self.major_or_gc_compact(CompactionState::Major)
    }

    /// GC compaction: identical machinery to major compaction, run when the garbage tracker
    /// reports garbage above the policy threshold.
    pub fn gc_compact(&self) -> Result<Option<CellStoreSummary>, AccessGroupError> {
        self.major_or_gc_compact(CompactionState::Gc)
    }

    fn major_or_gc_compact(
        &self,
        which: CompactionState,
    ) -> Result<Option<CellStoreSummary>, AccessGroupError> {
        let mut state = self.state.lock();
        if state.compaction != CompactionState::Idle && state.compaction != CompactionState::Staged {
            return Err(AccessGroupError::CompactionInProgress);
        }
        state.compaction = which;

        let mut entries = Vec::new();
        let all_indices: Vec<usize> = (0..state.stores.len()).collect();
        for store in &state.stores {
            for block in 0..store_block_count(store) {
                entries.extend(
                    store.reader.scan_block(block).map_err(AccessGroupError::from)?
                        .into_iter()
                        .map(decode_cell_store_entry),
                );
            }
        }
        if let Some(frozen) = state.immutable_cache.take() {
            entries.extend(frozen.scan(None, None));
        }
        entries.sort_by(|(a, _), (b, _)| cmp_keys(&key_ref(a), &key_ref(b)));

        let before = entries.len();
        let live = collect_live_cells(entries);
        state.garbage_bytes = 0;
        info!(
            access_group = %self.name,
            dropped = before - live.len(),
            "compaction dropped garbage cells",
        );

        let superseded: Vec<u64> = state.stores.iter().map(|s| s.id).collect();
        if live.is_empty() {
            for index in all_indices.iter().rev() {
                state.stores.remove(*index);
            }
            state.live_files.retain(|f| !superseded.iter().any(|id| f == &format!("cs{id}")));
            state.disk_usage = state.stores.iter().map(|s| s.reader.disk_usage()).sum();
            state.compaction = CompactionState::Idle;
            return Ok(None);
        }

        let summary = self.flush_entries_replacing(&mut state, live, &superseded, &all_indices, false)?;
        state.compaction = CompactionState::Idle;
        Ok(Some(summary))
    }

    /// Shrinks the access group to `[new_start, new_end)`: restricts the live cache in place and
    /// either rescopes each store's advertised range (when no scanner is outstanding) or reopens
    /// it with the new restriction. The earliest-cached-revision value is preserved around the
    /// operation so transient emptiness during the restriction is invisible to maintenance.
    pub fn shrink(
        &self,
        new_start: Option<&[u8]>,
        new_end:   Option<&[u8]>,
    ) -> Result<(), AccessGroupError> {
        let mut state = self.state.lock();
        let saved_earliest = state.earliest_cached_revision;

        self.live_cache.retain_range(new_start, new_end);

        let no_scanners = *self.scanner_count.0.lock() == 0;
        for store in &mut state.stores {
            if no_scanners {
                store.reader.rescope(new_start.map(<[u8]>::to_vec), new_end.map(<[u8]>::to_vec));
            } else {
                let path = ht_cellstore::cell_store_path(&self.dir, store.id);
                let mut reopened = CellStoreReader::open(&state.fs, &path)
                    .map_err(AccessGroupError::from)?;
                reopened.rescope(new_start.map(<[u8]>::to_vec), new_end.map(<[u8]>::to_vec));
                store.reader = reopened;
            }
        }
        state.disk_usage = state.stores.iter().map(|s| s.reader.disk_usage()).sum();
        state.earliest_cached_revision = saved_earliest;
        Ok(())
    }

    /// In-memory rewrite: flushes the cache to a new store (for durability/disk accounting) and
    /// then repopulates the live cache with the surviving cells, for access groups marked
    /// `in_memory`.
    pub fn in_memory_rewrite(&self) -> Result<CellStoreSummary, AccessGroupError> {
        let mut state = self.state.lock();
        state.compaction = CompactionState::InMemory;
        let entries = self.live_cache.scan(None, None);
        let live = collect_live_cells(entries);
        let summary = self.flush_entries(&mut state, live.clone(), false)?;
        drop(state);
        for (key, value) in live {
            self.live_cache.add(key, value);
        }
        let mut state = self.state.lock();
        state.compaction = CompactionState::Idle;
        Ok(summary)
    }

    fn flush_entries(
        &self,
        state:       &mut AgState<FS>,
        entries:     Vec<(CellKey, Vec<u8>)>,
        mark_split:  bool,
    ) -> Result<CellStoreSummary, AccessGroupError> {
        self.flush_entries_replacing(state, entries, &[], &[], mark_split)
    }

    fn flush_entries_replacing(
        &self,
        state:       &mut AgState<FS>,
        entries:     Vec<(CellKey, Vec<u8>)>,
        superseded_ids: &[u64],
        superseded_indices: &[usize],
        mark_split:  bool,
    ) -> Result<CellStoreSummary, AccessGroupError> {
        let id = state.next_cs_id;
        state.next_cs_id += 1;
        let path = ht_cellstore::cell_store_path(&self.dir, id);

        let options = CellStoreWriteOptions {
            target_blocksize: self.properties.target_blocksize,
            compression: self.properties.compressor,
            bloom_filter_mode: self.properties.bloom_filter_mode,
            bloom_bits_per_item: self.properties.bloom_bits_per_item,
            split: mark_split,
            ..CellStoreWriteOptions::default()
        };
        let mut writer = CellStoreWriter::create(&mut state.fs, &path, options)
            .map_err(AccessGroupError::from)?;
        for name in superseded_ids.iter().map(|id| format!("cs{id}")) {
            writer.add_replaced_file(&name);
        }
        for (key, value) in &entries {
            writer.add(key, value).map_err(AccessGroupError::from)?;
        }
        let summary = writer.finalize().map_err(AccessGroupError::from)?;

        for &index in superseded_indices.iter().rev() {
            state.stores.remove(index);
        }
        state.live_files.retain(|f| !superseded_ids.iter().any(|id| f == &format!("cs{id}")));

        let reader = CellStoreReader::open(&state.fs, &path).map_err(AccessGroupError::from)?;
        state.stores.push(StoreEntry { id, reader, shadow_cache: Mutex::new(HashMap::new()) });
        state.live_files.push(format!("cs{id}"));
        state.disk_usage = state.stores.iter().map(|s| s.reader.disk_usage()).sum();
        state.latest_stored_revision = state.latest_stored_revision.max(summary.max_revision);
        if let Some(earliest) = state.earliest_cached_revision {
            if state.latest_stored_revision >= earliest {
                state.earliest_cached_revision = None;
            }
        }
        if summary.file_size > 0 {
            state.compression_ratio_ppm = summary.compression_ratio_ppm;
        }
        if let Some(ctx) = &self.hints {
            self.write_hints(state, ctx);
        }
        Ok(summary)
    }

    /// Read-modify-write of the shared range hints file: reads whatever's there (starting fresh
    /// if it's missing or fails to parse), replaces this access group's entry, and writes it
    /// back. Best-effort — a failure here is logged and swallowed rather than propagated, since
    /// the hints file is a startup optimization, not a durability requirement.
    fn write_hints(&self, state: &mut AgState<FS>, ctx: &HintsContext) {
        use ht_vfs::traits::ReadableFilesystem as _;
        use std::io::{Read as _, Write as _};

        let mut hints = state.fs.open_sequential(&ctx.path).ok()
            .and_then(|mut file| {
                let mut text = String::new();
                file.read_to_string(&mut text).ok()?;
                RangeHints::parse(&text).ok()
            })
            .unwrap_or_else(|| RangeHints {
                start_row:     ctx.start_row.clone(),
                end_row:       ctx.end_row.clone(),
                location:      ctx.location.clone(),
                access_groups: std::collections::BTreeMap::new(),
            });

        hints.access_groups.insert(self.name.clone(), AccessGroupHints {
            latest_stored_revision: state.latest_stored_revision,
            disk_usage:             state.disk_usage,
            files:                  state.live_files.clone(),
        });

        let text = hints.serialize();
        let result = state.fs.open_writable(&ctx.path, true).and_then(|mut file| {
            file.write_all(text.as_bytes())?;
            Ok(())
        });
        if let Err(err) = result {
            warn!(access_group = %self.name, path = %ctx.path.display(), error = %err, "failed to write hints file");
        }
    }
}

fn store_block_count<FS: WritableFilesystem>(store: &StoreEntry<FS>) -> usize {
    match store.reader.create_scanner(None, None) {
        Ok(CellStoreScannerInterval::BlockIndex(blocks)) => {
            store.reader.release_scanner();
            blocks.len()
        }
        _ => 0,
    }
}

fn decode_cell_store_entry((key_bytes, value): (Vec<u8>, Vec<u8>)) -> (CellKey, Vec<u8>) {
    let (key_ref, _) = ht_format::decode_key_prefix(&key_bytes)
        .expect("cell store entries are always well-formed");
    (
        CellKey::new(
            key_ref.row, key_ref.column_family_id, key_ref.column_qualifier,
            key_ref.flag, key_ref.timestamp, key_ref.revision,
        ),
        value,
    )
}

fn encode_key(key: &CellKey) -> Vec<u8> {
    let mut buf = Vec::new();
    key.append_encoded(&mut buf);
    buf
}

fn key_ref(key: &CellKey) -> ht_format::CellKeyRef<'_> {
    ht_format::CellKeyRef {
        row:              &key.row,
        column_family_id: key.column_family_id,
        column_qualifier: &key.column_qualifier,
        flag:             key.flag,
        timestamp:        key.timestamp,
        revision:         key.revision,
    }
}

/// Applies delete tombstones to a row/cf/cq-sorted entry list and returns only the surviving,
/// non-tombstone cells. Two passes: collect each delete scope's threshold timestamp, then filter.
fn collect_live_cells(entries: Vec<(CellKey, Vec<u8>)>) -> Vec<(CellKey, Vec<u8>)> {
    let mut row_delete_ts: HashMap<Vec<u8>, i64> = HashMap::new();
    let mut cf_delete_ts: HashMap<(Vec<u8>, u8), i64> = HashMap::new();
    let mut cell_delete_ts: HashMap<(Vec<u8>, u8, Vec<u8>), i64> = HashMap::new();
    let mut version_deleted: HashSet<(Vec<u8>, u8, Vec<u8>, i64)> = HashSet::new();

    for (key, _) in &entries {
        match key.flag {
            CellFlag::DeleteRow => {
                let entry = row_delete_ts.entry(key.row.clone()).or_insert(i64::MIN);
                *entry = (*entry).max(key.timestamp);
            }
            CellFlag::DeleteColumnFamily => {
                let entry = cf_delete_ts
                    .entry((key.row.clone(), key.column_family_id))
                    .or_insert(i64::MIN);
                *entry = (*entry).max(key.timestamp);
            }
            CellFlag::DeleteCell => {
                let entry = cell_delete_ts
                    .entry((key.row.clone(), key.column_family_id, key.column_qualifier.clone()))
                    .or_insert(i64::MIN);
                *entry = (*entry).max(key.timestamp);
            }
            CellFlag::DeleteCellVersion => {
                version_deleted.insert((
                    key.row.clone(), key.column_family_id, key.column_qualifier.clone(),
                    key.timestamp,
                ));
            }
            CellFlag::Insert => {}
        }
    }

    entries
        .into_iter()
        .filter(|(key, _)| {
            if key.flag != CellFlag::Insert {
                return false;
            }
            let row_ts = row_delete_ts.get(&key.row).copied().unwrap_or(i64::MIN);
            if key.timestamp <= row_ts {
                return false;
            }
            let cf_ts = cf_delete_ts
                .get(&(key.row.clone(), key.column_family_id))
                .copied()
                .unwrap_or(i64::MIN);
            if key.timestamp <= cf_ts {
                return false;
            }
            let cell_ts = cell_delete_ts
                .get(&(key.row.clone(), key.column_family_id, key.column_qualifier.clone()))
                .copied()
                .unwrap_or(i64::MIN);
            if key.timestamp <= cell_ts {
                return false;
            }
            !version_deleted.contains(&(
                key.row.clone(), key.column_family_id, key.column_qualifier.clone(), key.timestamp,
            ))
        })
        .collect()
}

/// Entries merged across the live cache, the frozen immutable cache, and every in-scope cell
/// store, in ascending key order. Releases its outstanding-scanner reference on drop.
pub struct AccessGroupScanner {
    entries:       Vec<(CellKey, Vec<u8>)>,
    position:      usize,
    bytes_read:    u64,
    scanner_count: Arc<(Mutex<usize>, Condvar)>,
}

impl AccessGroupScanner {
    #[must_use]
    pub fn bytes_read(&self) -> u64 {
        self.bytes_read
    }
}

impl Iterator for AccessGroupScanner {
    type Item = (CellKey, Vec<u8>);

    fn next(&mut self) -> Option<Self::Item> {
        let item = self.entries.get(self.position).cloned();
        self.position += 1;
        item
    }
}

impl Drop for AccessGroupScanner {
    fn drop(&mut self) {
        let (lock, condvar) = &*self.scanner_count;
        let mut count = lock.lock();
        *count = count.saturating_sub(1);
        condvar.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use ht_format::{CellFlag, CellKey};
    use ht_vfs::ThreadLocalMemoryFS;

    use super::{AccessGroup, AccessGroupProperties};
    use crate::memory_tracker::MemoryTracker;

    fn key(row: &str, ts: i64, rev: i64) -> CellKey {
        CellKey::new(row.as_bytes(), 1, b"".as_slice(), CellFlag::Insert, ts, rev)
    }

    fn ag() -> AccessGroup<ThreadLocalMemoryFS> {
        AccessGroup::new(
            "default",
            std::path::PathBuf::from("/tables/t/default/r"),
            vec![1],
            AccessGroupProperties::default(),
            ThreadLocalMemoryFS::default(),
            MemoryTracker::new(),
        )
    }

    /// S1: a single insert is visible to a scan over the live cache alone.
    #[test]
    fn single_insert_scans_back() {
        let group = ag();
        assert!(group.add(key("r", 100, 1), b"v".to_vec(), false, false));
        let rows: Vec<_> = group.create_scanner(None, None).unwrap().collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].0.row, b"r");
        assert_eq!(rows[0].1, b"v");
    }

    /// Replaying an already-applied revision during recovery is a silent no-op in a non-in-memory
    /// access group, but the same write outside recovery still applies (counted as clock skew).
    #[test]
    fn replay_of_already_applied_revision_is_dropped_only_during_recovery() {
        let group = ag();
        assert!(group.add(key("r", 100, 5), b"v1".to_vec(), false, false));
        group.stage_compaction().unwrap();
        group.minor_compact().unwrap();
        assert_eq!(group.latest_stored_revision(), 5);

        assert!(
            !group.add(key("r", 100, 3), b"stale".to_vec(), true, false),
            "a replayed revision already covered by a flushed store is dropped",
        );
        assert_eq!(group.clock_skew_errors(), 0);

        assert!(
            group.add(key("r", 100, 3), b"skewed".to_vec(), false, false),
            "outside of recovery, a non-increasing revision still applies",
        );
        assert_eq!(group.clock_skew_errors(), 1);
    }

    /// Empty compaction produces no cell store and leaves `stores` unchanged.
    #[test]
    fn empty_cache_compaction_is_noop() {
        let group = ag();
        group.stage_compaction().unwrap();
        let summary = group.minor_compact().unwrap();
        assert!(summary.is_none());
        assert_eq!(group.store_count(), 0);
    }

    /// S3: minor-compacting two generations, then major-compacting, keeps only the newest
    /// revision for a row re-inserted after the first flush, and scans it first.
    #[test]
    fn minor_then_major_compaction_preserves_latest_revision() {
        let group = ag();
        for i in 0..100_u32 {
            let row = format!("r{i:04}");
            assert!(group.add(key(&row, 100, i64::from(i) + 1), b"v1".to_vec(), false, false));
        }
        group.stage_compaction().unwrap();
        let summary = group.minor_compact().unwrap().expect("non-empty flush yields a store");
        assert_eq!(summary.total_entries, 100);

        assert!(group.add(key("r0050", 100, 200), b"v2".to_vec(), false, false));
        group.stage_compaction().unwrap();
        group.minor_compact().unwrap();
        assert_eq!(group.store_count(), 2);

        let summary = group.major_compact().unwrap().expect("live cells remain after major compaction");
        assert_eq!(group.store_count(), 1);
        assert_eq!(summary.total_entries, 100, "major compaction keeps one entry per row");

        let key_r50 = key("r0050", 100, 200);
        let rows: Vec<_> = group
            .create_scanner(Some(&key_r50), Some(&key_r50))
            .unwrap()
            .collect();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1, b"v2");
    }

    /// A delete-row tombstone removes every earlier insert for that row once major-compacted.
    #[test]
    fn major_compaction_drops_rows_covered_by_delete_row_tombstone() {
        let group = ag();
        assert!(group.add(key("r", 100, 1), b"v".to_vec(), false, false));
        assert!(group.add(
            CellKey::new(b"r".as_slice(), 1, b"".as_slice(), CellFlag::DeleteRow, 150, 2),
            Vec::new(),
            false,
            false,
        ));
        group.stage_compaction().unwrap();
        let summary = group.major_compact().unwrap();
        assert!(summary.is_none(), "every cell was garbage, so major compaction writes nothing");
        assert_eq!(group.store_count(), 0);
    }

    /// `find_merge_run` never proposes a run from a single store.
    #[test]
    fn find_merge_run_requires_at_least_two_stores() {
        let group = ag();
        assert!(group.add(key("r", 100, 1), b"v".to_vec(), false, false));
        group.stage_compaction().unwrap();
        group.minor_compact().unwrap();
        assert_eq!(group.store_count(), 1);
        assert!(group.find_merge_run(2, 0, u64::MAX).is_none());
    }

    /// Shrinking to a sub-interval drops out-of-range rows from the live cache.
    #[test]
    fn shrink_drops_rows_outside_new_interval() {
        let group = ag();
        assert!(group.add(key("a", 100, 1), b"a".to_vec(), false, false));
        assert!(group.add(key("m", 100, 2), b"m".to_vec(), false, false));
        assert!(group.add(key("z", 100, 3), b"z".to_vec(), false, false));

        group.shrink(None, Some(b"n".as_slice())).unwrap();
        let rows: Vec<_> = group.create_scanner(None, None).unwrap().collect();
        let present_rows: Vec<&[u8]> = rows.iter().map(|(k, _)| k.row.as_slice()).collect();
        assert!(present_rows.contains(&b"a".as_slice()));
        assert!(present_rows.contains(&b"m".as_slice()));
        assert!(!present_rows.contains(&b"z".as_slice()));
    }
}
