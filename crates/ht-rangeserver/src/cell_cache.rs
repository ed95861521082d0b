//! The writable, lock-protected in-memory tier of an access group's LSM tree (C2).
//!
//! The original source backs this with an arena-allocated skiplist keyed by a byte-comparator,
//! but a skiplist is insert-only — it has no entry-mutation or removal primitive — while
//! `add_counter` requires rewriting an existing entry's `(timestamp, revision)` fields and
//! replacing its count in place. This cache is instead backed by a `BTreeMap` ordered by
//! [`CellKeyComparator`]'s semantics, plus a side index from counter identity to current key so a
//! merge can remove-then-reinsert in one locked section. See `DESIGN.md` for the full rationale.

use std::collections::BTreeMap;
use std::sync::Arc;

use ht_format::{CellKey, CellKeyRef, CounterOp, CounterValue, cmp_keys};
use parking_lot::Mutex;
use tracing::warn;

use crate::memory_tracker::MemoryTracker;

/// Wraps an encoded key so it can be used as a `BTreeMap` key under [`cmp_keys`]'s order rather
/// than lexicographic byte order (timestamp/revision sort descending, not ascending).
#[derive(Debug, Clone, PartialEq, Eq)]
struct OrderedKey(CellKey);

impl OrderedKey {
    fn as_ref(&self) -> CellKeyRef<'_> {
        CellKeyRef {
            row:              &self.0.row,
            column_family_id: self.0.column_family_id,
            column_qualifier: &self.0.column_qualifier,
            flag:             self.0.flag,
            timestamp:        self.0.timestamp,
            revision:         self.0.revision,
        }
    }
}

impl PartialOrd for OrderedKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        cmp_keys(&self.as_ref(), &other.as_ref())
    }
}

/// Identity used to locate an existing counter cell for merging: everything but flag, timestamp,
/// and revision, since those are rewritten on every merge.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CounterIdentity {
    row:              Vec<u8>,
    column_family_id: u8,
    column_qualifier: Vec<u8>,
}

impl CounterIdentity {
    fn from_key(key: &CellKey) -> Self {
        Self {
            row:              key.row.clone(),
            column_family_id: key.column_family_id,
            column_qualifier: key.column_qualifier.clone(),
        }
    }
}

#[derive(Default)]
struct Inner {
    entries:            BTreeMap<OrderedKey, Vec<u8>>,
    counter_index:      std::collections::HashMap<CounterIdentity, OrderedKey>,
    has_counter_deletes: bool,
    collision_count:    u64,
    delete_count:       u64,
    row_counts:         std::collections::HashMap<Vec<u8>, u64>,
}

impl Inner {
    fn insert_raw(&mut self, key: CellKey, value: Vec<u8>) {
        if key.flag.is_delete() {
            self.delete_count += 1;
        }
        *self.row_counts.entry(key.row.clone()).or_insert(0) += 1;
        let ordered = OrderedKey(key);
        if self.entries.insert(ordered, value).is_some() {
            self.collision_count += 1;
            warn!("cell cache: exact-key collision, replacing existing entry");
        }
    }
}

/// A mutable, lock-protected, ordered map from cell key to value, plus a frozen (read-only)
/// predecessor produced by [`CellCache::freeze`] and still scanned until the next compaction
/// drops it.
pub struct CellCache {
    inner:   Mutex<Inner>,
    tracker: MemoryTracker,
}

impl CellCache {
    #[must_use]
    pub fn new(tracker: MemoryTracker) -> Self {
        Self { inner: Mutex::new(Inner::default()), tracker }
    }

    /// Inserts `(key, value)`. Exact-key collisions replace the existing entry, bump the
    /// collision counter, and log a warning; delete-flagged keys bump the delete counter used by
    /// the garbage tracker.
    pub fn add(&self, key: CellKey, value: Vec<u8>) {
        let before = value.len() as i64 + key.encoded_len() as i64;
        let mut guard = self.inner.lock();
        guard.insert_raw(key, value);
        drop(guard);
        self.tracker.add_cache_bytes(before, before);
    }

    /// Merge-semantic counter insert. On `Reset`, or once any counter delete has been observed
    /// for this cache generation, permanently falls back to plain `add` (mirrored by the
    /// `has_counter_deletes` flag) — see `DESIGN.md` for why a reset is treated the same as a
    /// counter delete for this purpose.
    pub fn add_counter(&self, key: CellKey, op: CounterValue) {
        let mut guard = self.inner.lock();

        if key.flag.is_delete() {
            guard.has_counter_deletes = true;
            let mut value = Vec::with_capacity(9);
            value.extend_from_slice(&op.encode());
            guard.insert_raw(key, value);
            return;
        }

        if matches!(op.op, CounterOp::Reset) || guard.has_counter_deletes {
            if matches!(op.op, CounterOp::Reset) {
                guard.has_counter_deletes = true;
            }
            let identity = CounterIdentity::from_key(&key);
            guard.counter_index.remove(&identity);
            let value = op.encode().to_vec();
            guard.insert_raw(key, value);
            return;
        }

        let identity = CounterIdentity::from_key(&key);
        if let Some(existing_ordered) = guard.counter_index.get(&identity).cloned() {
            let existing_value = guard.entries.get(&existing_ordered).cloned();
            if let Some(existing_bytes) = existing_value {
                if let Ok(existing) = CounterValue::decode(&existing_bytes) {
                    if matches!(existing.op, CounterOp::Increment) {
                        guard.entries.remove(&existing_ordered);
                        let merged = op.merge(existing);
                        let value = merged.encode().to_vec();
                        let new_ordered = OrderedKey(key);
                        guard.counter_index.insert(identity, new_ordered.clone());
                        guard.entries.insert(new_ordered, value);
                        return;
                    }
                }
            }
        }

        let value = op.encode().to_vec();
        let ordered = OrderedKey(key);
        guard.counter_index.insert(identity, ordered.clone());
        *guard.row_counts.entry(ordered.0.row.clone()).or_insert(0) += 1;
        guard.entries.insert(ordered, value);
    }

    /// Returns every `(key, value)` pair whose key falls in `[start, end]` (inclusive), in
    /// ascending key order. `start`/`end` of `None` mean unbounded on that side.
    #[must_use]
    pub fn scan(&self, start: Option<&CellKey>, end: Option<&CellKey>) -> Vec<(CellKey, Vec<u8>)> {
        let guard = self.inner.lock();
        guard
            .entries
            .iter()
            .filter(|(k, _)| {
                let after_start = start.is_none_or(|s| cmp_keys(&k.as_ref(), &OrderedKey(s.clone()).as_ref()).is_le());
                let before_end = end.is_none_or(|e| cmp_keys(&k.as_ref(), &OrderedKey(e.clone()).as_ref()).is_ge());
                after_start && before_end
            })
            .map(|(k, v)| (k.0.clone(), v.clone()))
            .collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.inner.lock().entries.is_empty()
    }

    #[must_use]
    pub fn collision_count(&self) -> u64 {
        self.inner.lock().collision_count
    }

    #[must_use]
    pub fn delete_count(&self) -> u64 {
        self.inner.lock().delete_count
    }

    #[must_use]
    pub fn has_counter_deletes(&self) -> bool {
        self.inner.lock().has_counter_deletes
    }

    /// Drops every entry whose row falls outside `[new_start, new_end)` (either bound `None`
    /// meaning unbounded), used by an access group shrinking around a split or relinquish.
    pub fn retain_range(&self, new_start: Option<&[u8]>, new_end: Option<&[u8]>) {
        let mut guard = self.inner.lock();
        guard.entries.retain(|k, _| {
            let row = k.0.row.as_slice();
            new_start.is_none_or(|s| row >= s) && new_end.is_none_or(|e| row < e)
        });
        guard.counter_index.retain(|identity, _| {
            new_start.is_none_or(|s| identity.row.as_slice() >= s)
                && new_end.is_none_or(|e| identity.row.as_slice() < e)
        });
        guard.row_counts.retain(|row, _| {
            new_start.is_none_or(|s| row.as_slice() >= s) && new_end.is_none_or(|e| row.as_slice() < e)
        });
    }

    /// Swaps the writable cache for a new empty one, returning the old contents as an immutable
    /// snapshot. The snapshot is never mutated again; it exists only to be scanned (merged with
    /// the live cache by the access group's scanner) until the next compaction flushes it away.
    #[must_use]
    pub fn freeze(&self) -> FrozenCellCache {
        let mut guard = self.inner.lock();
        let taken = std::mem::take(&mut *guard);
        FrozenCellCache { entries: Arc::new(taken.entries) }
    }

    /// Accumulates per-row entry counts into `estimate`, seeding the split-row chooser.
    pub fn split_row_estimate_data(&self, estimate: &mut BTreeMap<Vec<u8>, u64>) {
        let guard = self.inner.lock();
        for (row, count) in &guard.row_counts {
            *estimate.entry(row.clone()).or_insert(0) += count;
        }
    }

    #[must_use]
    pub fn memory_used(&self) -> u64 {
        self.tracker.cache_bytes_used()
    }

    #[must_use]
    pub fn memory_allocated(&self) -> u64 {
        self.tracker.cache_bytes_allocated()
    }
}

/// An immutable snapshot produced by [`CellCache::freeze`]. Cheap to clone (an `Arc` bump);
/// scanners hold one for their whole lifetime without blocking the live cache.
#[derive(Clone)]
pub struct FrozenCellCache {
    entries: Arc<BTreeMap<OrderedKey, Vec<u8>>>,
}

impl FrozenCellCache {
    #[must_use]
    pub fn scan(&self, start: Option<&CellKey>, end: Option<&CellKey>) -> Vec<(CellKey, Vec<u8>)> {
        self.entries
            .iter()
            .filter(|(k, _)| {
                let after_start = start.is_none_or(|s| cmp_keys(&k.as_ref(), &OrderedKey(s.clone()).as_ref()).is_le());
                let before_end = end.is_none_or(|e| cmp_keys(&k.as_ref(), &OrderedKey(e.clone()).as_ref()).is_ge());
                after_start && before_end
            })
            .map(|(k, v)| (k.0.clone(), v.clone()))
            .collect()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::{CellCache, MemoryTracker};
    use ht_format::{CellFlag, CellKey, CounterValue};

    fn key(row: &str, cf: u8, cq: &str, flag: CellFlag, ts: i64, rev: i64) -> CellKey {
        CellKey::new(row.as_bytes(), cf, cq.as_bytes(), flag, ts, rev)
    }

    #[test]
    fn single_insert_scans_back() {
        let cache = CellCache::new(MemoryTracker::new());
        cache.add(key("r", 1, "", CellFlag::Insert, 100, 1), b"v".to_vec());
        let rows = cache.scan(None, None);
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].1, b"v");
    }

    #[test]
    fn iteration_is_ascending_under_key_comparator() {
        let cache = CellCache::new(MemoryTracker::new());
        cache.add(key("b", 1, "", CellFlag::Insert, 100, 1), b"b".to_vec());
        cache.add(key("a", 1, "", CellFlag::Insert, 100, 1), b"a".to_vec());
        let rows = cache.scan(None, None);
        assert_eq!(rows[0].0.row, b"a");
        assert_eq!(rows[1].0.row, b"b");
    }

    #[test]
    fn counter_merge_sums_and_rewrites_timestamp() {
        let cache = CellCache::new(MemoryTracker::new());
        cache.add_counter(key("r", 1, "c", CellFlag::Insert, 1, 1), CounterValue::increment(5));
        cache.add_counter(key("r", 1, "c", CellFlag::Insert, 2, 2), CounterValue::increment(3));

        let rows = cache.scan(None, None);
        assert_eq!(rows.len(), 1, "merge must not leave a partially-applied counter behind");
        assert_eq!(rows[0].0.timestamp, 2);
        assert_eq!(rows[0].0.revision, 2);
        let decoded = CounterValue::decode(&rows[0].1).unwrap();
        assert_eq!(decoded.count, 8);
    }

    #[test]
    fn reset_falls_back_to_plain_add_and_sticks() {
        let cache = CellCache::new(MemoryTracker::new());
        cache.add_counter(key("r", 1, "c", CellFlag::Insert, 1, 1), CounterValue::increment(5));
        cache.add_counter(key("r", 1, "c", CellFlag::Insert, 2, 2), CounterValue::reset(0));
        assert!(cache.has_counter_deletes());

        cache.add_counter(key("r", 1, "c", CellFlag::Insert, 3, 3), CounterValue::increment(1));
        let rows = cache.scan(None, None);
        assert_eq!(rows.len(), 3, "once reset, subsequent ops are plain inserts, not merges");
    }

    #[test]
    fn exact_key_collision_bumps_collision_counter() {
        let cache = CellCache::new(MemoryTracker::new());
        cache.add(key("r", 1, "", CellFlag::Insert, 100, 1), b"first".to_vec());
        cache.add(key("r", 1, "", CellFlag::Insert, 100, 1), b"second".to_vec());
        assert_eq!(cache.collision_count(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn freeze_yields_immutable_snapshot_and_empties_live_cache() {
        let cache = CellCache::new(MemoryTracker::new());
        cache.add(key("r", 1, "", CellFlag::Insert, 100, 1), b"v".to_vec());
        let frozen = cache.freeze();
        assert_eq!(frozen.len(), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn delete_flag_bumps_delete_count() {
        let cache = CellCache::new(MemoryTracker::new());
        cache.add(key("r", 1, "", CellFlag::DeleteRow, 100, 1), Vec::new());
        assert_eq!(cache.delete_count(), 1);
    }
}
