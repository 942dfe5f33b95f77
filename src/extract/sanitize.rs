//! Entry path validation.
//!
//! Two layers, both required:
//!
//! 1. [`entry_relative_path`] rejects names that are unsafe on their face:
//!    absolute paths, drive or UNC prefixes, `..` segments.
//! 2. [`resolve_inside`] resolves the target through the parent chain that
//!    already exists on disk, following symlinks created by earlier entries,
//!    and requires the result to stay strictly inside the destination root.

use std::ffi::OsString;
use std::io;
use std::path::{Component, Path, PathBuf};

use super::ExtractError;

/// Existing symlinks followed while resolving one link target.
const MAX_LINK_HOPS: usize = 40;

/// Normalizes an entry name into a relative path.
///
/// Backslashes count as separators; empty and `.` segments are dropped.
///
/// # Errors
///
/// Returns [`ExtractError::UnsafePath`] for absolute names, drive or UNC
/// prefixes, `..` segments, NUL bytes, and names with no path segments.
pub fn entry_relative_path(name: &str) -> Result<PathBuf, ExtractError> {
    if name.contains('\0') {
        return Err(ExtractError::unsafe_path(name, "contains a NUL byte"));
    }
    let normalized = name.replace('\\', "/");
    if normalized.starts_with('/') {
        return Err(ExtractError::unsafe_path(name, "absolute path"));
    }
    if has_drive_prefix(&normalized) {
        return Err(ExtractError::unsafe_path(name, "drive or volume prefix"));
    }

    let mut relative = PathBuf::new();
    for segment in normalized.split('/') {
        match segment {
            "" | "." => {}
            ".." => return Err(ExtractError::unsafe_path(name, "parent directory segment")),
            _ => relative.push(segment),
        }
    }
    if relative.as_os_str().is_empty() {
        return Err(ExtractError::unsafe_path(name, "empty path"));
    }
    Ok(relative)
}

/// Normalizes a symlink target, which must stay relative.
///
/// # Errors
///
/// Returns [`ExtractError::UnsafeSymlink`] for absolute targets, drive
/// prefixes, NUL bytes, or empty targets.
pub fn symlink_target_path(entry: &str, target: &str) -> Result<PathBuf, ExtractError> {
    if target.contains('\0') {
        return Err(ExtractError::unsafe_symlink(entry, "target contains a NUL byte"));
    }
    let normalized = target.replace('\\', "/");
    if normalized.starts_with('/') || has_drive_prefix(&normalized) {
        return Err(ExtractError::unsafe_symlink(entry, format!("absolute target {target:?}")));
    }
    let path: PathBuf = normalized
        .split('/')
        .filter(|segment| !segment.is_empty())
        .collect();
    if path.as_os_str().is_empty() {
        return Err(ExtractError::unsafe_symlink(entry, "empty target"));
    }
    Ok(path)
}

fn has_drive_prefix(path: &str) -> bool {
    let bytes = path.as_bytes();
    bytes.len() >= 2 && bytes[0].is_ascii_alphabetic() && bytes[1] == b':'
}

/// Resolves `relative` under `root` (already canonical) and checks that the
/// result stays strictly inside `root`.
///
/// The final component itself is not followed, so an existing symlink at the
/// target is replaced rather than written through.
///
/// # Errors
///
/// Returns [`ExtractError::PathEscape`] when the resolved path leaves `root`,
/// or [`ExtractError::Io`] when the parent chain cannot be inspected.
pub fn resolve_inside(root: &Path, relative: &Path, entry: &str) -> Result<PathBuf, ExtractError> {
    let candidate = root.join(relative);
    let Some(file_name) = candidate.file_name() else {
        return Err(ExtractError::path_escape(entry, candidate));
    };
    let parent = candidate.parent().unwrap_or(root);
    let resolved_parent =
        canonicalize_existing(parent).map_err(|e| ExtractError::io(entry, parent, e))?;
    let resolved = resolved_parent.join(file_name);

    if resolved == root || !resolved.starts_with(root) {
        return Err(ExtractError::path_escape(entry, resolved));
    }
    Ok(resolved)
}

/// Resolves where a symlink at `link` pointing to `target` would lead.
///
/// The target is walked one component at a time against the filesystem:
/// symlinks already on disk are read and spliced in, and `..` is applied to
/// the real resolved path. Every step must stay inside `root`.
///
/// `link` must already be resolved with [`resolve_inside`]. The result may
/// be `root` itself.
///
/// # Errors
///
/// Returns [`ExtractError::UnsafeSymlink`] when any step leaves `root`, an
/// existing link on the way is absolute, or links nest too deeply.
pub fn resolve_symlink_target(
    root: &Path,
    link: &Path,
    target: &Path,
    entry: &str,
) -> Result<PathBuf, ExtractError> {
    let mut resolved = link.parent().unwrap_or(root).to_path_buf();
    let mut remaining: Vec<OsString> = target
        .components()
        .rev()
        .map(|c| c.as_os_str().to_os_string())
        .collect();
    let mut hops = 0usize;

    while let Some(part) = remaining.pop() {
        match Path::new(&part).components().next() {
            None | Some(Component::CurDir) => continue,
            Some(Component::ParentDir) => {
                if !resolved.pop() {
                    return Err(ExtractError::unsafe_symlink(entry, "target climbs above the filesystem root"));
                }
            }
            Some(Component::Normal(name)) => {
                let next = resolved.join(name);
                match std::fs::symlink_metadata(&next) {
                    Ok(meta) if meta.file_type().is_symlink() => {
                        hops += 1;
                        if hops > MAX_LINK_HOPS {
                            return Err(ExtractError::unsafe_symlink(entry, "too many levels of symbolic links"));
                        }
                        let spliced = std::fs::read_link(&next).map_err(|e| ExtractError::io(entry, &next, e))?;
                        if spliced.has_root() || spliced.components().any(|c| matches!(c, Component::Prefix(_))) {
                            return Err(ExtractError::unsafe_symlink(
                                entry,
                                format!("target passes through absolute link {}", next.display()),
                            ));
                        }
                        remaining.extend(spliced.components().rev().map(|c| c.as_os_str().to_os_string()));
                        continue;
                    }
                    Ok(_) => resolved = next,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => resolved = next,
                    Err(e) => return Err(ExtractError::io(entry, &next, e)),
                }
            }
            Some(Component::RootDir | Component::Prefix(_)) => {
                return Err(ExtractError::unsafe_symlink(entry, "absolute target"));
            }
        }

        if !resolved.starts_with(root) {
            return Err(ExtractError::unsafe_symlink(
                entry,
                format!("target resolves outside the destination ({})", resolved.display()),
            ));
        }
    }
    Ok(resolved)
}

/// Canonicalizes the longest existing prefix of `path` and re-appends the
/// components that do not exist yet.
pub(crate) fn canonicalize_existing(path: &Path) -> io::Result<PathBuf> {
    let mut existing = path;
    let mut missing = Vec::new();
    loop {
        match std::fs::canonicalize(existing) {
            Ok(mut resolved) => {
                for component in missing.iter().rev() {
                    resolved.push(component);
                }
                return Ok(resolved);
            }
            Err(error) if error.kind() == io::ErrorKind::NotFound => {
                let (Some(name), Some(parent)) = (existing.file_name(), existing.parent()) else {
                    return Err(error);
                };
                missing.push(name.to_os_string());
                existing = parent;
            }
            Err(error) => return Err(error),
        }
    }
}
