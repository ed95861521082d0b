//! Replays a logical commit log: every fragment in a log directory, in ascending fragment-number
//! order, following link blocks into other directories as they're encountered. Tracks
//! `latest_revision` across the whole logical log, which feeds an access group's
//! "earliest cached revision" invariant after replay.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};

use ht_vfs::traits::ReadableFilesystem;

use crate::block::{ParsedBlock, parse_block, read_block_stream};
use crate::error::LogReadError;
use crate::fragment::list_fragments;

/// Outcome of replaying a logical commit log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReplayResult {
    /// The highest revision observed across every fragment and every linked directory.
    pub latest_revision: i64,
}

pub struct CommitLogReader<'fs, FS: ReadableFilesystem> {
    fs:          &'fs FS,
    /// If set, corruption within a fragment is logged and skipped rather than propagated.
    skip_errors: bool,
}

impl<'fs, FS: ReadableFilesystem> CommitLogReader<'fs, FS> {
    #[must_use]
    pub const fn new(fs: &'fs FS, skip_errors: bool) -> Self {
        Self { fs, skip_errors }
    }

    /// Replays every data section in `log_dir` (and any directory it links to), calling
    /// `on_section` with `(table_identifier, mutations, block_revision)` for each one, in the
    /// order they were written. Replaying an already-applied block is the caller's
    /// responsibility — this just surfaces every block found.
    pub fn replay(
        &self,
        log_dir:      &Path,
        mut on_section: impl FnMut(&str, &[u8], i64),
    ) -> Result<ReplayResult, LogReadError> {
        let mut latest_revision = ht_format::TIMESTAMP_NULL;
        let mut queue: VecDeque<PathBuf> = VecDeque::from([log_dir.to_path_buf()]);
        let mut visited = Vec::new();

        while let Some(dir) = queue.pop_front() {
            if visited.contains(&dir) {
                continue;
            }
            visited.push(dir.clone());

            let fragments = list_fragments(self.fs, &dir)
                .map_err(|err| LogReadError::Io(err.to_string()))?;

            for fragment in fragments {
                let path = dir.join(fragment.to_string());
                let file = self.fs.open_sequential(&path)
                    .map_err(|err| LogReadError::Io(err.to_string()))?;

                let mut stream_err = None;
                read_block_stream(
                    file,
                    |block, _offset| {
                        if stream_err.is_some() {
                            return;
                        }
                        match parse_block(block) {
                            Ok(ParsedBlock::Data { revision, sections }) => {
                                latest_revision = latest_revision.max(revision);
                                for (table_identifier, mutations) in &sections {
                                    on_section(table_identifier, mutations, revision);
                                }
                            }
                            Ok(ParsedBlock::Link { revision, target_dir }) => {
                                latest_revision = latest_revision.max(revision);
                                queue.push_back(PathBuf::from(target_dir));
                            }
                            Err(err) => {
                                tracing::warn!(
                                    fragment = %path.display(),
                                    error = %err,
                                    "corrupt commit-log block",
                                );
                                if !self.skip_errors {
                                    stream_err = Some(err);
                                }
                            }
                        }
                    },
                    |err| {
                        tracing::warn!(
                            fragment = %path.display(),
                            error = %err,
                            "corrupt commit-log block framing",
                        );
                        if !self.skip_errors && stream_err.is_none() {
                            stream_err = Some(err);
                        }
                    },
                ).map_err(|err| LogReadError::Io(err.to_string()))?;

                if let Some(err) = stream_err {
                    return Err(err);
                }
            }
        }

        Ok(ReplayResult { latest_revision })
    }
}

#[cfg(test)]
mod tests {
    use ht_format::CompressionType;
    use ht_vfs::ThreadLocalMemoryFS;

    use crate::writer::CommitLogWriter;

    use super::CommitLogReader;

    #[test]
    fn replays_a_single_fragment_in_order() {
        let mut fs = ThreadLocalMemoryFS::default();
        let log_dir = std::path::PathBuf::from("/logs/range-1");

        {
            let mut writer = CommitLogWriter::open(&mut fs, log_dir.clone(), 0, CompressionType::None)
                .unwrap();
            writer.commit(&[("t1", b"m1")], 1).unwrap();
            writer.commit(&[("t1", b"m2")], 2).unwrap();
            writer.sync().unwrap();
        }

        let mut seen = Vec::new();
        let reader = CommitLogReader::new(&fs, false);
        let result = reader.replay(&log_dir, |table, mutations, revision| {
            seen.push((table.to_string(), mutations.to_vec(), revision));
        }).unwrap();

        assert_eq!(seen, vec![
            ("t1".to_string(), b"m1".to_vec(), 1),
            ("t1".to_string(), b"m2".to_vec(), 2),
        ]);
        assert_eq!(result.latest_revision, 2);
    }

    #[test]
    fn follows_link_blocks_into_other_directories() {
        let mut fs = ThreadLocalMemoryFS::default();
        let primary = std::path::PathBuf::from("/logs/range-1");
        let linked = std::path::PathBuf::from("/logs/range-1-predecessor");

        {
            let mut writer = CommitLogWriter::open(&mut fs, linked.clone(), 0, CompressionType::None)
                .unwrap();
            writer.commit(&[("t1", b"old")], 1).unwrap();
            writer.sync().unwrap();
        }
        {
            let mut writer = CommitLogWriter::open(&mut fs, primary.clone(), 0, CompressionType::None)
                .unwrap();
            writer.link(linked.to_str().unwrap(), 1).unwrap();
            writer.commit(&[("t1", b"new")], 2).unwrap();
            writer.sync().unwrap();
        }

        let mut seen = Vec::new();
        let reader = CommitLogReader::new(&fs, false);
        let result = reader.replay(&primary, |table, mutations, revision| {
            seen.push((table.to_string(), mutations.to_vec(), revision));
        }).unwrap();

        assert_eq!(seen, vec![
            ("t1".to_string(), b"new".to_vec(), 2),
            ("t1".to_string(), b"old".to_vec(), 1),
        ]);
        assert_eq!(result.latest_revision, 2);
    }

    #[test]
    fn skip_errors_continues_past_corruption() {
        let mut fs = ThreadLocalMemoryFS::default();
        let log_dir = std::path::PathBuf::from("/logs/range-1");

        {
            let mut writer = CommitLogWriter::open(&mut fs, log_dir.clone(), 0, CompressionType::None)
                .unwrap();
            writer.commit(&[("t1", b"m1")], 1).unwrap();
            writer.sync().unwrap();
        }

        // Corrupt the block's magic byte, which fails in `parse_block` rather than in framing.
        {
            use ht_vfs::traits::{ReadableFilesystem as _, WritableFilesystem as _};
            use std::io::Read as _;
            let path = log_dir.join("0");
            let mut data = Vec::new();
            fs.open_sequential(&path).unwrap().read_to_end(&mut data).unwrap();
            data[0] ^= 0xff;
            let mut file = fs.open_writable(&path, true).unwrap();
            use std::io::Write as _;
            file.write_all(&data).unwrap();
        }

        let reader = CommitLogReader::new(&fs, true);
        let result = reader.replay(&log_dir, |_table, _mutations, _revision| {
            panic!("corrupted block should not yield any section");
        }).unwrap();
        assert_eq!(result.latest_revision, ht_format::TIMESTAMP_NULL);
    }
}
