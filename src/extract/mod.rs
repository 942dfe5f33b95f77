//! Safe extraction of untrusted ZIP archives.
//!
//! [`extract_archive`] unpacks a bundle into a destination directory under an
//! [`ExtractionPolicy`]. Every entry is checked before anything is written:
//!
//! - names are normalized and rejected if absolute, prefixed, or containing
//!   `..`; the resolved target must stay strictly inside the destination,
//!   even through symlinks created by earlier entries
//! - the entry count is checked up front; declared sizes are checked before
//!   reading, actual bytes while copying (headers can lie)
//! - device files, pipes and sockets are skipped; symlinks are skipped unless
//!   the policy allows them, and then only relative targets that resolve
//!   inside the destination are created
//!
//! Regular files are written to a temporary file beside the target and
//! renamed into place, so an aborted extraction never leaves a partial file
//! at its final path.
//!
//! Extraction is blocking; async callers run it on `spawn_blocking`.

mod error;
mod policy;
pub mod sanitize;

use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::time::SystemTime;

use chrono::NaiveDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use zip::ZipArchive;

pub use error::ExtractError;
pub use policy::{
    DEFAULT_MAX_FILE_BYTES, DEFAULT_MAX_FILES, DEFAULT_MAX_TOTAL_BYTES, ExtractionPolicy,
    MAX_SYMLINK_TARGET,
};
use sanitize::{entry_relative_path, resolve_inside, resolve_symlink_target, symlink_target_path};

const COPY_BUFFER: usize = 64 * 1024;

const FILE_MODE: u32 = 0o644;
const EXEC_MODE: u32 = 0o755;
const DIR_MODE: u32 = 0o755;

const S_IFMT: u32 = 0o170_000;
const S_IFREG: u32 = 0o100_000;
const S_IFDIR: u32 = 0o040_000;
const S_IFLNK: u32 = 0o120_000;

/// Summary of one extraction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractReport {
    /// Regular files written.
    pub files: usize,
    /// Directory entries created.
    pub directories: usize,
    /// Symlinks created.
    pub symlinks: usize,
    /// Entries skipped (special files, disallowed symlinks).
    pub skipped: usize,
    /// Bytes written across all files.
    pub bytes: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryKind {
    File,
    Directory,
    Symlink,
    Special,
}

fn entry_kind(is_dir: bool, unix_mode: Option<u32>) -> EntryKind {
    match unix_mode.map(|mode| mode & S_IFMT) {
        Some(S_IFLNK) => EntryKind::Symlink,
        Some(S_IFDIR) => EntryKind::Directory,
        Some(S_IFREG | 0) | None if is_dir => EntryKind::Directory,
        Some(S_IFREG | 0) | None => EntryKind::File,
        Some(_) => EntryKind::Special,
    }
}

/// Extracts `archive` into `destination` under `policy`.
///
/// `destination` is created if missing.
///
/// # Errors
///
/// Returns an [`ExtractError`] describing the first violation or IO failure.
/// Entries already extracted at that point stay in place; the offending
/// entry leaves no file at its final path.
pub fn extract_archive(
    archive: &Path,
    destination: &Path,
    policy: &ExtractionPolicy,
) -> Result<ExtractReport, ExtractError> {
    extract_archive_cancellable(archive, destination, policy, &CancellationToken::new())
}

/// Like [`extract_archive`], stopping at the next entry or copy chunk once
/// `cancel` fires.
///
/// # Errors
///
/// As [`extract_archive`], plus [`ExtractError::Cancelled`]. A cancelled
/// entry leaves no file at its final path.
#[instrument(skip(policy, cancel), fields(archive = %archive.display(), destination = %destination.display()))]
pub fn extract_archive_cancellable(
    archive: &Path,
    destination: &Path,
    policy: &ExtractionPolicy,
    cancel: &CancellationToken,
) -> Result<ExtractReport, ExtractError> {
    let file = File::open(archive).map_err(|source| ExtractError::Open {
        path: archive.to_path_buf(),
        source,
    })?;
    let mut zip = ZipArchive::new(file).map_err(|e| ExtractError::Corrupt {
        path: archive.to_path_buf(),
        reason: e.to_string(),
    })?;

    if zip.len() > policy.max_files {
        return Err(ExtractError::TooManyEntries {
            count: zip.len(),
            limit: policy.max_files,
        });
    }

    create_dir_all(destination).map_err(|e| ExtractError::io("", destination, e))?;
    let root = destination
        .canonicalize()
        .map_err(|e| ExtractError::io("", destination, e))?;

    let mut report = ExtractReport::default();
    for index in 0..zip.len() {
        let mut entry = zip.by_index(index).map_err(|e| ExtractError::Corrupt {
            path: archive.to_path_buf(),
            reason: format!("entry #{index}: {e}"),
        })?;
        let name = entry.name().to_string();
        if cancel.is_cancelled() {
            return Err(ExtractError::Cancelled { entry: name });
        }
        let kind = entry_kind(entry.is_dir(), entry.unix_mode());

        if kind == EntryKind::Special {
            warn!(entry = %name, "skipping special file");
            report.skipped += 1;
            continue;
        }
        if kind == EntryKind::Symlink && !policy.allow_symlinks {
            debug!(entry = %name, "skipping symlink");
            report.skipped += 1;
            continue;
        }

        let relative = entry_relative_path(&name)?;
        let target = resolve_inside(&root, &relative, &name)?;

        match kind {
            EntryKind::Directory => {
                create_dir_all(&target).map_err(|e| ExtractError::io(&name, &target, e))?;
                report.directories += 1;
            }
            EntryKind::Symlink => {
                if entry.size() > MAX_SYMLINK_TARGET {
                    return Err(ExtractError::unsafe_symlink(&name, "target text too long"));
                }
                let mut text = String::new();
                (&mut entry)
                    .take(MAX_SYMLINK_TARGET + 1)
                    .read_to_string(&mut text)
                    .map_err(|e| ExtractError::io(&name, &target, e))?;
                if text.len() as u64 > MAX_SYMLINK_TARGET {
                    return Err(ExtractError::unsafe_symlink(&name, "target text too long"));
                }
                let link_target = symlink_target_path(&name, &text)?;
                resolve_symlink_target(&root, &target, &link_target, &name)?;
                create_symlink(&link_target, &target, &name)?;
                report.symlinks += 1;
            }
            EntryKind::File => {
                if entry.size() > policy.max_file_bytes {
                    return Err(ExtractError::EntryTooLarge {
                        entry: name,
                        limit: policy.max_file_bytes,
                    });
                }
                let executable = entry.unix_mode().is_some_and(|mode| mode & 0o111 != 0);
                let modified = policy
                    .preserve_mtime
                    .then(|| entry.last_modified().and_then(dos_time_to_system))
                    .flatten();
                let file = FileTarget {
                    path: &target,
                    name: &name,
                    executable,
                    modified,
                };
                let written = write_file(&mut entry, &file, policy, report.bytes, cancel)?;
                report.bytes += written;
                report.files += 1;
            }
            EntryKind::Special => {}
        }
    }

    info!(
        files = report.files,
        directories = report.directories,
        symlinks = report.symlinks,
        skipped = report.skipped,
        bytes = report.bytes,
        "archive extracted"
    );
    Ok(report)
}

/// Where and how one regular-file entry is written.
#[derive(Clone, Copy)]
struct FileTarget<'a> {
    path: &'a Path,
    name: &'a str,
    executable: bool,
    modified: Option<SystemTime>,
}

/// Copies one entry into a temp file beside its target, enforcing the size
/// limits on actual bytes, then renames it into place.
fn write_file(
    reader: &mut impl Read,
    file: &FileTarget<'_>,
    policy: &ExtractionPolicy,
    total_before: u64,
    cancel: &CancellationToken,
) -> Result<u64, ExtractError> {
    let FileTarget {
        path: target,
        name,
        executable,
        modified,
    } = *file;
    let parent = target.parent().unwrap_or(target);
    create_dir_all(parent).map_err(|e| ExtractError::io(name, parent, e))?;

    let mut temp = tempfile::Builder::new()
        .prefix(".bundlex-")
        .suffix(".part")
        .tempfile_in(parent)
        .map_err(|e| ExtractError::io(name, parent, e))?;

    let mut buf = vec![0u8; COPY_BUFFER];
    let mut written: u64 = 0;
    loop {
        if cancel.is_cancelled() {
            return Err(ExtractError::Cancelled {
                entry: name.to_string(),
            });
        }
        let read = reader
            .read(&mut buf)
            .map_err(|e| ExtractError::io(name, target, e))?;
        if read == 0 {
            break;
        }
        written += read as u64;
        if written > policy.max_file_bytes {
            return Err(ExtractError::EntryTooLarge {
                entry: name.to_string(),
                limit: policy.max_file_bytes,
            });
        }
        if total_before + written > policy.max_total_bytes {
            return Err(ExtractError::TotalTooLarge {
                entry: name.to_string(),
                limit: policy.max_total_bytes,
            });
        }
        temp.write_all(&buf[..read])
            .map_err(|e| ExtractError::io(name, temp.path(), e))?;
    }
    temp.flush().map_err(|e| ExtractError::io(name, temp.path(), e))?;

    set_file_mode(temp.as_file(), if executable { EXEC_MODE } else { FILE_MODE })
        .map_err(|e| ExtractError::io(name, temp.path(), e))?;
    if let Some(modified) = modified {
        temp.as_file()
            .set_modified(modified)
            .map_err(|e| ExtractError::io(name, temp.path(), e))?;
    }

    temp.persist(target)
        .map_err(|e| ExtractError::io(name, target, e.error))?;
    debug!(entry = %name, bytes = written, "extracted file");
    Ok(written)
}

#[cfg(unix)]
fn set_file_mode(file: &File, mode: u32) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    file.set_permissions(std::fs::Permissions::from_mode(mode))
}

#[cfg(not(unix))]
fn set_file_mode(_file: &File, _mode: u32) -> io::Result<()> {
    Ok(())
}

#[cfg(unix)]
fn create_dir_all(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::DirBuilderExt;
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(DIR_MODE)
        .create(path)
}

#[cfg(not(unix))]
fn create_dir_all(path: &Path) -> io::Result<()> {
    std::fs::create_dir_all(path)
}

/// Creates the link under a temporary name, then renames it over `target`.
#[cfg(unix)]
fn create_symlink(link_target: &Path, target: &Path, name: &str) -> Result<(), ExtractError> {
    let parent = target.parent().unwrap_or(target);
    create_dir_all(parent).map_err(|e| ExtractError::io(name, parent, e))?;

    let file_name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let temp = parent.join(format!(".{file_name}.{:08x}.link", rand::random::<u32>()));

    std::os::unix::fs::symlink(link_target, &temp).map_err(|e| ExtractError::io(name, &temp, e))?;
    if let Err(e) = std::fs::rename(&temp, target) {
        let _ = std::fs::remove_file(&temp);
        return Err(ExtractError::io(name, target, e));
    }
    debug!(entry = %name, target = %link_target.display(), "created symlink");
    Ok(())
}

#[cfg(not(unix))]
fn create_symlink(_link_target: &Path, _target: &Path, name: &str) -> Result<(), ExtractError> {
    Err(ExtractError::unsafe_symlink(name, "symlinks are not supported on this platform"))
}

/// Converts a ZIP (MS-DOS) timestamp, taken as UTC, to `SystemTime`.
fn dos_time_to_system(time: zip::DateTime) -> Option<SystemTime> {
    let naive = NaiveDateTime::try_from(time).ok()?;
    Some(SystemTime::from(naive.and_utc()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_entry_kind_from_mode() {
        assert_eq!(entry_kind(false, None), EntryKind::File);
        assert_eq!(entry_kind(true, None), EntryKind::Directory);
        assert_eq!(entry_kind(false, Some(0o100_644)), EntryKind::File);
        assert_eq!(entry_kind(false, Some(0o040_755)), EntryKind::Directory);
        assert_eq!(entry_kind(false, Some(0o120_777)), EntryKind::Symlink);
        assert_eq!(entry_kind(false, Some(0o010_644)), EntryKind::Special);
        assert_eq!(entry_kind(false, Some(0o020_644)), EntryKind::Special);
        assert_eq!(entry_kind(false, Some(0o140_644)), EntryKind::Special);
    }

    #[test]
    fn test_dos_time_conversion() {
        let time = zip::DateTime::from_date_and_time(2020, 6, 15, 12, 30, 10).unwrap();
        let converted = dos_time_to_system(time).unwrap();
        let secs = converted.duration_since(SystemTime::UNIX_EPOCH).unwrap().as_secs();
        assert_eq!(secs, 1_592_224_210);

        let leap = zip::DateTime::from_date_and_time(2024, 2, 29, 0, 0, 0).unwrap();
        let secs = dos_time_to_system(leap)
            .unwrap()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_secs();
        assert_eq!(secs, 1_709_164_800);
    }
}
