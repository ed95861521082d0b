//! Group-commit writer: each call to [`CommitLogWriter::commit`] appends one self-framed data
//! block (§4.1's block header, Fletcher-32 checksummed) containing a batch of
//! `(table_identifier, mutations)` sections directly to the fragment file — a fragment is simply
//! a back-to-back sequence of these blocks, with no secondary record-splitting layer underneath.
//! After a configurable size threshold, the writer rolls to a fresh, numbered fragment file.

use std::path::PathBuf;

use ht_format::CompressionType;
use ht_vfs::traits::WritableFilesystem;

use crate::error::LogWriteError;
use crate::fragment::{fragment_path, write_mark};

/// Size, in bytes, a fragment file may grow to before the writer rolls to a new one.
pub const DEFAULT_FRAGMENT_ROLL_SIZE: u64 = 64 * 1024 * 1024;

pub struct CommitLogWriter<'fs, FS: WritableFilesystem> {
    fs:                 &'fs mut FS,
    log_dir:            PathBuf,
    current_fragment:   u32,
    file:               FS::AppendFile,
    bytes_in_fragment:  u64,
    roll_size:          u64,
    compression:        CompressionType,
    /// Highest revision observed in any committed block so far, across the whole logical log.
    latest_revision:    i64,
}

impl<'fs, FS: WritableFilesystem> CommitLogWriter<'fs, FS> {
    /// Opens (creating if necessary) fragment `first_fragment` in `log_dir` for appending.
    pub fn open(
        fs:              &'fs mut FS,
        log_dir:         PathBuf,
        first_fragment:  u32,
        compression:     CompressionType,
    ) -> Result<Self, FS::Error> {
        let file = fs.open_appendable(&fragment_path(&log_dir, first_fragment), true)?;
        Ok(Self {
            fs,
            log_dir,
            current_fragment: first_fragment,
            file,
            bytes_in_fragment: 0,
            roll_size: DEFAULT_FRAGMENT_ROLL_SIZE,
            compression,
            latest_revision: ht_format::TIMESTAMP_NULL,
        })
    }

    #[must_use]
    pub const fn with_roll_size(mut self, roll_size: u64) -> Self {
        self.roll_size = roll_size;
        self
    }

    #[must_use]
    pub const fn current_fragment(&self) -> u32 {
        self.current_fragment
    }

    /// Writes one data block containing `sections`, with the block header's revision set to
    /// `max_revision` (the highest revision among the mutations in this commit).
    pub fn commit(
        &mut self,
        sections:     &[(&str, &[u8])],
        max_revision: i64,
    ) -> Result<(), LogWriteError> {
        let block = crate::block::build_data_block(sections, max_revision, self.compression)?;
        self.write_block(&block)?;
        self.latest_revision = self.latest_revision.max(max_revision);
        self.maybe_roll()?;
        Ok(())
    }

    /// Writes a link block pointing at `target_dir`, and records it against `revision`.
    pub fn link(&mut self, target_dir: &str, revision: i64) -> Result<(), LogWriteError> {
        let block = crate::block::build_link_block(target_dir, revision, self.compression)?;
        self.write_block(&block)?;
        self.latest_revision = self.latest_revision.max(revision);
        self.maybe_roll()?;
        Ok(())
    }

    fn write_block(&mut self, block: &[u8]) -> Result<(), LogWriteError> {
        use std::io::Write as _;
        self.file.write_all(block)?;
        self.bytes_in_fragment += u64::try_from(block.len()).unwrap_or(u64::MAX);
        Ok(())
    }

    fn maybe_roll(&mut self) -> Result<(), LogWriteError> {
        if self.bytes_in_fragment >= self.roll_size {
            self.roll_fragment()?;
        }
        Ok(())
    }

    /// Flushes and marks the current fragment complete, then opens the next numbered fragment.
    pub fn roll_fragment(&mut self) -> Result<(), LogWriteError> {
        self.sync()?;
        self.current_fragment += 1;
        self.file = self.fs.open_appendable(
            &fragment_path(&self.log_dir, self.current_fragment),
            true,
        ).map_err(|_err| LogWriteError::Io(std::io::Error::other("failed to roll fragment")))?;
        self.bytes_in_fragment = 0;
        Ok(())
    }

    /// Flushes and waits for the underlying filesystem's durability acknowledgement.
    pub fn sync(&mut self) -> Result<(), LogWriteError> {
        use std::io::Write as _;
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Writes a mark file for every fragment strictly before `up_to_fragment`, indicating that
    /// no range still references their revisions.
    pub fn mark_purged(&mut self, up_to_fragment: u32) -> Result<(), FS::Error> {
        for n in 0..up_to_fragment {
            write_mark(self.fs, &self.log_dir, n)?;
        }
        Ok(())
    }

    #[must_use]
    pub const fn latest_revision(&self) -> i64 {
        self.latest_revision
    }
}
