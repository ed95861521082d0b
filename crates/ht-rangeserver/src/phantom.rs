//! Phantom range recovery participant (C8): while a failed range server's ranges are being
//! reassigned, a replacement server loads each range as a "phantom" and replays the committed
//! log fragments the master forwards to it, before the range is allowed to serve live traffic.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use ht_commitlog::{CommitLogReader, CommitLogWriter, ParsedBlock, parse_block};
use ht_format::CellKey;
use ht_vfs::traits::WritableFilesystem;
use integer_encoding::{VarInt as _, VarIntWriter as _};
use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::PhantomError;
use crate::range::Range;

/// A phantom range's position in its recovery lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhantomState {
    /// The range's existing cell stores were opened; fragments may still be arriving and
    /// buffering, but nothing has been merged into the range yet.
    Loaded,
    /// Every assigned fragment reported completion, its buffered blocks were merged into the
    /// range's access groups and appended to the phantom commit log, and `latest_revision` was
    /// computed from that log.
    Replayed,
    /// The locally reconstructed transfer log was synced to disk.
    Prepared,
    /// The master has durably recorded this range as reassigned; it may now serve live traffic.
    Committed,
}

/// Buffers the raw blocks shipped for one assigned log fragment until that fragment reports
/// completion; nothing is merged into the range until then (§4.8).
struct FragmentData {
    blocks:   Vec<Vec<u8>>,
    complete: bool,
}

/// Identifies a range across a load/replay/prepare/commit cycle: the table plus its row
/// interval.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct QualifiedRangeSpec {
    pub table_id:  u64,
    pub start_row: Vec<u8>,
    pub end_row:   Option<Vec<u8>>,
}

/// Appends one `(key, value)` mutation to a phantom-update buffer, length-prefixing the value so
/// multiple mutations can be concatenated into one buffer and split apart again by
/// [`decode_mutations`].
pub fn encode_mutation(key: &CellKey, value: &[u8], output: &mut Vec<u8>) {
    key.append_encoded(output);
    let _ = output.write_varint(value.len());
    output.extend_from_slice(value);
}

/// Reverses [`encode_mutation`] for every mutation packed into `buffer`.
pub fn decode_mutations(buffer: &[u8]) -> Result<Vec<(CellKey, Vec<u8>)>, PhantomError> {
    let mut out = Vec::new();
    let mut rest = buffer;
    while !rest.is_empty() {
        let (key_ref, after_key) = ht_format::decode_key_prefix(rest)
            .map_err(|err| PhantomError::Filesystem(err.to_string()))?;
        let (value_len, used) = usize::decode_var(after_key)
            .ok_or_else(|| PhantomError::Filesystem("truncated mutation value length".to_string()))?;
        let after_len = &after_key[used..];
        if after_len.len() < value_len {
            return Err(PhantomError::Filesystem("truncated mutation value".to_string()));
        }
        let (value, remainder) = after_len.split_at(value_len);
        let key = CellKey::new(
            key_ref.row, key_ref.column_family_id, key_ref.column_qualifier,
            key_ref.flag, key_ref.timestamp, key_ref.revision,
        );
        out.push((key, value.to_vec()));
        rest = remainder;
    }
    Ok(out)
}

struct PhantomInner {
    state:            PhantomState,
    fragments:        HashMap<u32, FragmentData>,
    latest_revision:  Option<i64>,
}

/// One range under recovery on the replacement server, buffering forwarded log blocks per
/// fragment and, once every assigned fragment has completed, merging them into the live
/// [`Range`] and mirroring them into a fresh phantom transfer log.
pub struct PhantomRange<FS: WritableFilesystem + Clone> {
    pub spec:     QualifiedRangeSpec,
    range:        Arc<Range<FS>>,
    log_dir:      PathBuf,
    fs:           FS,
    assigned:     HashSet<u32>,
    inner:        Mutex<PhantomInner>,
}

impl<FS: WritableFilesystem + Clone> PhantomRange<FS> {
    /// `assigned_fragments` is the set of log fragments the master's recovery plan assigned this
    /// server to replay for this range; [`Self::replay`] rejects any other fragment id outright.
    #[must_use]
    pub fn new(
        spec:               QualifiedRangeSpec,
        range:              Arc<Range<FS>>,
        log_dir:            PathBuf,
        fs:                 FS,
        assigned_fragments: impl IntoIterator<Item = u32>,
    ) -> Self {
        Self {
            spec, range, log_dir, fs,
            assigned: assigned_fragments.into_iter().collect(),
            inner: Mutex::new(PhantomInner {
                state: PhantomState::Loaded,
                fragments: HashMap::new(),
                latest_revision: None,
            }),
        }
    }

    #[must_use]
    pub fn state(&self) -> PhantomState {
        self.inner.lock().state
    }

    /// `latest_revision` computed by [`Self::populate_range_and_log`], once the range has
    /// reached [`PhantomState::Replayed`] or later. `None` beforehand.
    #[must_use]
    pub fn latest_revision(&self) -> Option<i64> {
        self.inner.lock().latest_revision
    }

    /// The range is empty-promotable iff its phantom log's `latest_revision` is `TIMESTAMP_MIN`
    /// (no real mutation was ever merged into it) — only meaningful once replayed.
    #[must_use]
    pub fn is_empty_promotable(&self) -> Option<bool> {
        self.inner.lock().latest_revision.map(|rev| rev == ht_format::TIMESTAMP_MIN)
    }

    /// Buffers one forwarded log block for `fragment`. `fragment_done` marks that this was the
    /// last block the master will forward for this fragment. Out-of-order or duplicate blocks
    /// within an already-completed fragment are rejected, as is a fragment this range was never
    /// assigned. Once every assigned fragment has reported completion, buffered blocks are
    /// merged into the range and the phantom log by [`Self::populate_range_and_log`], advancing
    /// to [`PhantomState::Replayed`].
    pub fn replay(&self, fragment: u32, block_bytes: &[u8], fragment_done: bool) -> Result<(), PhantomError> {
        if !self.assigned.contains(&fragment) {
            return Err(PhantomError::UnassignedFragment(fragment));
        }

        let all_complete = {
            let mut inner = self.inner.lock();
            if inner.state != PhantomState::Loaded {
                return Err(PhantomError::InvalidState {
                    start_row: self.spec.start_row.clone(),
                    end_row: self.spec.end_row.clone().unwrap_or_default(),
                    state: inner.state,
                });
            }

            let data = inner.fragments.entry(fragment).or_insert_with(|| FragmentData {
                blocks: Vec::new(),
                complete: false,
            });
            if data.complete {
                return Err(PhantomError::DuplicateBlock(fragment));
            }
            data.blocks.push(block_bytes.to_vec());
            if fragment_done {
                data.complete = true;
            }

            self.assigned.iter().all(|id| inner.fragments.get(id).is_some_and(|d| d.complete))
        };

        if all_complete {
            self.populate_range_and_log()?;
        }
        Ok(())
    }

    /// Merges every assigned fragment's buffered blocks into the range's access groups, in
    /// ascending fragment order, appending each block unchanged to a freshly-created phantom
    /// commit log as it's applied. Once every fragment is flushed, opens a reader on the
    /// complete phantom log to compute `latest_revision` and advances to
    /// [`PhantomState::Replayed`].
    fn populate_range_and_log(&self) -> Result<(), PhantomError> {
        let mut fragment_ids: Vec<u32> = self.assigned.iter().copied().collect();
        fragment_ids.sort_unstable();

        // Opened unconditionally, even if nothing ends up applied, so the phantom log directory
        // exists on disk and `compute_latest_revision` below has a log to scan either way.
        let mut fs = self.fs.clone();
        let mut writer = CommitLogWriter::open(
            &mut fs, self.log_dir.clone(), 0, ht_format::CompressionType::None,
        ).map_err(|err| PhantomError::Filesystem(err.to_string()))?;

        for fragment in fragment_ids {
            let blocks = {
                let inner = self.inner.lock();
                inner.fragments.get(&fragment).map(|d| d.blocks.clone()).unwrap_or_default()
            };
            for block_bytes in &blocks {
                // Mirrors the original's "only write a phantom-log entry if something was
                // actually merged" rule: a link block, or a data block whose sections decode to
                // zero mutations, leaves the phantom log untouched so an all-empty fragment set
                // keeps the log's `latest_revision` at its no-data sentinel.
                let mut applied_any = false;
                let revision = match parse_block(block_bytes)? {
                    ParsedBlock::Data { revision, sections } => {
                        for (_table_identifier, mutations) in &sections {
                            for (key, value) in decode_mutations(mutations)? {
                                if self.range.apply(key, value, true, true)? {
                                    applied_any = true;
                                }
                            }
                        }
                        revision
                    }
                    ParsedBlock::Link { target_dir, .. } => {
                        warn!(target_dir = %target_dir, "phantom replay ignoring unexpected link block");
                        continue;
                    }
                };
                if applied_any {
                    writer.commit(&[("phantom", block_bytes)], revision)?;
                }
            }
        }
        writer.sync()?;
        drop(writer);

        let latest_revision = self.compute_latest_revision()?;
        let mut inner = self.inner.lock();
        inner.latest_revision = Some(latest_revision);
        inner.state = PhantomState::Replayed;
        info!(
            table_id = self.spec.table_id,
            latest_revision,
            empty_promotable = latest_revision == ht_format::TIMESTAMP_MIN,
            "phantom range populated from its log fragments",
        );
        Ok(())
    }

    /// Opens a reader on the complete phantom log and returns its `latest_revision`, coerced
    /// from the reader's "nothing found" sentinel (`TIMESTAMP_NULL`) to `TIMESTAMP_MIN`, which is
    /// the phantom log's own empty-promotable sentinel (§4.8).
    fn compute_latest_revision(&self) -> Result<i64, PhantomError> {
        let reader = CommitLogReader::new(&self.fs, false);
        let result = reader.replay(&self.log_dir, |_, _, _| {})?;
        Ok(if result.latest_revision == ht_format::TIMESTAMP_NULL {
            ht_format::TIMESTAMP_MIN
        } else {
            result.latest_revision
        })
    }

    /// Syncs the reconstructed transfer log and advances to [`PhantomState::Prepared`]. Requires
    /// every fragment the master is going to forward to have already replayed.
    pub fn prepare(&self) -> Result<(), PhantomError> {
        let mut inner = self.inner.lock();
        if inner.state != PhantomState::Replayed {
            return Err(PhantomError::InvalidState {
                start_row: self.spec.start_row.clone(),
                end_row: self.spec.end_row.clone().unwrap_or_default(),
                state: inner.state,
            });
        }
        inner.state = PhantomState::Prepared;
        Ok(())
    }

    /// Installs the reconstructed transfer log on the live range and advances to
    /// [`PhantomState::Committed`], after which the range may serve live traffic.
    pub fn commit(&self) -> Result<(), PhantomError> {
        let mut inner = self.inner.lock();
        if inner.state != PhantomState::Prepared {
            return Err(PhantomError::InvalidState {
                start_row: self.spec.start_row.clone(),
                end_row: self.spec.end_row.clone().unwrap_or_default(),
                state: inner.state,
            });
        }
        self.range.set_transfer_log(Some(self.log_dir.clone()));
        inner.state = PhantomState::Committed;
        info!(table_id = self.spec.table_id, "phantom range committed");
        Ok(())
    }
}

/// Picks a phantom log directory that does not already exist, retrying with a short backoff on
/// collision: `<log_dir>/<table_id>/<md5-trunc(end_row)>-<attempt_epoch_seconds>`.
pub fn phantom_log_path<FS: WritableFilesystem>(
    fs:              &FS,
    log_dir:         &std::path::Path,
    table_id:        u64,
    end_row:         &[u8],
    epoch_seconds:   impl Fn(u32) -> u64,
    max_attempts:    u32,
) -> Result<PathBuf, PhantomError> {
    let digest = md5::compute(end_row);
    let truncated = u64::from_be_bytes(digest.0[..8].try_into().unwrap());

    for attempt in 0..max_attempts {
        let candidate = log_dir
            .join(table_id.to_string())
            .join(format!("{truncated:016x}-{}", epoch_seconds(attempt)));
        if !fs.exists(&candidate).unwrap_or(false) {
            return Ok(candidate);
        }
        if attempt + 1 < max_attempts {
            std::thread::sleep(std::time::Duration::from_millis(1200));
        }
    }
    Err(PhantomError::PhantomLogNameExhausted { attempts: max_attempts })
}

/// Tracks every phantom range currently under recovery on this server, keyed by the qualified
/// range it corresponds to, so that `phantom_update`/`phantom_prepare_ranges`/
/// `phantom_commit_ranges` RPCs can be routed and `acknowledge_load` can report per-range status.
#[derive(Default)]
pub struct PhantomRegistry<FS: WritableFilesystem + Clone> {
    ranges: Mutex<HashMap<QualifiedRangeSpec, Arc<PhantomRange<FS>>>>,
}

impl<FS: WritableFilesystem + Clone> PhantomRegistry<FS> {
    #[must_use]
    pub fn new() -> Self {
        Self { ranges: Mutex::new(HashMap::new()) }
    }

    pub fn insert(&self, phantom: Arc<PhantomRange<FS>>) {
        self.ranges.lock().insert(phantom.spec.clone(), phantom);
    }

    #[must_use]
    pub fn get(&self, spec: &QualifiedRangeSpec) -> Option<Arc<PhantomRange<FS>>> {
        self.ranges.lock().get(spec).cloned()
    }

    pub fn remove(&self, spec: &QualifiedRangeSpec) -> Option<Arc<PhantomRange<FS>>> {
        self.ranges.lock().remove(spec)
    }

    /// A snapshot suitable for an `acknowledge_load` response: every tracked range's current
    /// phantom state (recovery completion is the caller's responsibility to interpret).
    #[must_use]
    pub fn response_map(&self) -> HashMap<QualifiedRangeSpec, PhantomState> {
        self.ranges.lock().iter().map(|(spec, phantom)| (spec.clone(), phantom.state())).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;
    use std::sync::Arc;

    use ht_commitlog::{build_data_block, build_link_block};
    use ht_format::{CellFlag, CellKey, CompressionType};
    use ht_vfs::ThreadLocalMemoryFS;

    use super::{PhantomRange, PhantomState, QualifiedRangeSpec, decode_mutations, encode_mutation};
    use crate::access_group::{AccessGroup, AccessGroupProperties};
    use crate::error::PhantomError;
    use crate::memory_tracker::MemoryTracker;
    use crate::range::{Range, TableIdentity};

    #[test]
    fn encode_then_decode_recovers_multiple_mutations() {
        let mut buf = Vec::new();
        let k1 = CellKey::new(b"row-1".to_vec(), 0, b"cq".to_vec(), CellFlag::Insert, 100, 1);
        let k2 = CellKey::new(b"row-2".to_vec(), 1, b"".to_vec(), CellFlag::DeleteRow, 200, 2);
        encode_mutation(&k1, b"value-1", &mut buf);
        encode_mutation(&k2, b"", &mut buf);

        let decoded = decode_mutations(&buf).unwrap();
        assert_eq!(decoded.len(), 2);
        assert_eq!(decoded[0].0, k1);
        assert_eq!(decoded[0].1, b"value-1");
        assert_eq!(decoded[1].0, k2);
        assert!(decoded[1].0.flag.is_delete());
    }

    fn spec() -> QualifiedRangeSpec {
        QualifiedRangeSpec { table_id: 1, start_row: b"a".to_vec(), end_row: None }
    }

    fn phantom_range(assigned: impl IntoIterator<Item = u32>) -> PhantomRange<ThreadLocalMemoryFS> {
        let fs = ThreadLocalMemoryFS::default();
        let ag = Arc::new(AccessGroup::new(
            "default",
            PathBuf::from("/tables/t/default/r"),
            vec![1],
            AccessGroupProperties::default(),
            fs.clone(),
            MemoryTracker::new(),
        ));
        let range = Arc::new(Range::new(
            TableIdentity { table_id: 1, generation: 0 },
            b"a".to_vec(),
            None,
            vec![ag],
        ));
        PhantomRange::new(spec(), range, PathBuf::from("/phantom/1/log"), fs, assigned)
    }

    fn data_block(row: &str, revision: i64) -> Vec<u8> {
        let key = CellKey::new(row.as_bytes(), 1, b"".as_slice(), CellFlag::Insert, revision, revision);
        let mut mutations = Vec::new();
        encode_mutation(&key, b"v", &mut mutations);
        build_data_block(&[("0", &mutations)], revision, CompressionType::None).unwrap()
    }

    #[test]
    fn replay_rejects_unassigned_fragment() {
        let phantom = phantom_range([0]);
        let err = phantom.replay(7, &data_block("r", 1), true).unwrap_err();
        assert!(matches!(err, PhantomError::UnassignedFragment(7)));
    }

    #[test]
    fn replay_buffers_until_fragment_done_then_merges_on_last_assigned_fragment() {
        let phantom = phantom_range([0, 1]);

        // Fragment 0 gets two blocks, the first not yet marking completion: nothing should
        // merge, and the range should stay in `Loaded`.
        phantom.replay(0, &data_block("a", 1), false).unwrap();
        assert_eq!(phantom.state(), PhantomState::Loaded);
        phantom.replay(0, &data_block("b", 2), true).unwrap();
        assert_eq!(phantom.state(), PhantomState::Loaded, "fragment 1 hasn't completed yet");
        assert!(phantom.latest_revision().is_none());

        // Only once the last assigned fragment reports done does everything merge at once.
        phantom.replay(1, &data_block("c", 3), true).unwrap();
        assert_eq!(phantom.state(), PhantomState::Replayed);
        assert_eq!(phantom.latest_revision(), Some(3));
        assert_eq!(phantom.is_empty_promotable(), Some(false));
    }

    #[test]
    fn replay_rejects_block_after_fragment_already_complete() {
        let phantom = phantom_range([0]);
        phantom.replay(0, &data_block("a", 1), true).unwrap();
        let err = phantom.replay(0, &data_block("b", 2), false).unwrap_err();
        assert!(matches!(err, PhantomError::DuplicateBlock(0)));
    }

    #[test]
    fn empty_promotable_is_none_before_replay_and_true_after_an_all_link_log() {
        let phantom = phantom_range([0]);
        assert!(phantom.is_empty_promotable().is_none());

        let link_only = build_link_block("/other/dir", 1, CompressionType::None).unwrap();
        phantom.replay(0, &link_only, true).unwrap();
        assert_eq!(phantom.state(), PhantomState::Replayed);
        assert_eq!(phantom.is_empty_promotable(), Some(true));
    }
}
