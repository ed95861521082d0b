//! Fragment file naming and directory listing. A log directory holds fragment files named by a
//! monotonically increasing 32-bit number, plus (at most one, at a time) zero-length `<N>.mark`
//! sentinel file recording that every fragment numbered `<= N` is eligible for deletion.

use std::path::{Path, PathBuf};

use ht_vfs::traits::{IntoDirectoryIterator, ReadableFilesystem, WritableFilesystem};

/// The file name for fragment number `n` within a log directory.
#[must_use]
pub fn fragment_name(n: u32) -> String {
    n.to_string()
}

/// The file name for fragment number `n`'s mark sentinel.
#[must_use]
pub fn mark_name(n: u32) -> String {
    format!("{n}.mark")
}

#[must_use]
pub fn fragment_path(log_dir: &Path, n: u32) -> PathBuf {
    log_dir.join(fragment_name(n))
}

#[must_use]
pub fn mark_path(log_dir: &Path, n: u32) -> PathBuf {
    log_dir.join(mark_name(n))
}

/// Lists the fragment numbers present in `log_dir`, ascending, ignoring `.mark` files and
/// anything else that isn't a bare base-10 number.
pub fn list_fragments<FS: ReadableFilesystem>(
    fs:      &FS,
    log_dir: &Path,
) -> Result<Vec<u32>, FS::Error> {
    let mut fragments: Vec<u32> = fs.children(log_dir)?
        .dir_iter()
        .filter_map(|entry| entry.ok())
        .filter_map(|path| path.file_name()?.to_str()?.parse::<u32>().ok())
        .collect();
    fragments.sort_unstable();
    Ok(fragments)
}

/// Finds the current mark file in `log_dir`, if any, returning the highest fragment number it
/// declares eligible for deletion.
pub fn find_mark<FS: ReadableFilesystem>(
    fs:      &FS,
    log_dir: &Path,
) -> Result<Option<u32>, FS::Error> {
    let mark = fs.children(log_dir)?
        .dir_iter()
        .filter_map(|entry| entry.ok())
        .filter_map(|path| {
            let name = path.file_name()?.to_str()?;
            name.strip_suffix(".mark")?.parse::<u32>().ok()
        })
        .max();
    Ok(mark)
}

/// Writes a new mark file declaring fragments `<= n` eligible for deletion, replacing any
/// previous mark file in `log_dir`.
pub fn write_mark<FS: WritableFilesystem>(
    fs:      &mut FS,
    log_dir: &Path,
    n:       u32,
) -> Result<(), FS::Error> {
    if let Some(previous) = find_mark(fs, log_dir)? {
        if previous != n {
            fs.delete(&mark_path(log_dir, previous))?;
        }
    }
    let _file = fs.open_writable(&mark_path(log_dir, n), true)?;
    Ok(())
}

/// Deletes every fragment numbered `<= mark` from `log_dir`. Leaves the mark file itself in
/// place, since it still documents the boundary.
pub fn purge_marked_fragments<FS: WritableFilesystem>(
    fs:      &mut FS,
    log_dir: &Path,
    mark:    u32,
) -> Result<(), FS::Error> {
    for n in list_fragments(fs, log_dir)? {
        if n <= mark {
            fs.delete(&fragment_path(log_dir, n))?;
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{fragment_name, mark_name};

    #[test]
    fn names_are_stable() {
        assert_eq!(fragment_name(7), "7");
        assert_eq!(mark_name(7), "7.mark");
    }
}
