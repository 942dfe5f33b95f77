//! Extraction error types.

use std::path::PathBuf;

use thiserror::Error;

/// Errors produced while unpacking an archive.
///
/// Everything except [`ExtractError::Io`] is a policy violation: retrying the
/// same archive cannot succeed.
#[derive(Debug, Error)]
pub enum ExtractError {
    /// The archive could not be opened.
    #[error("failed to open archive {path}: {source}")]
    Open {
        /// The archive path.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The file is not a readable ZIP archive.
    #[error("corrupt archive {path}: {reason}")]
    Corrupt {
        /// The archive path.
        path: PathBuf,
        /// Reader diagnostics.
        reason: String,
    },

    /// The archive holds more entries than the policy allows.
    #[error("archive has {count} entries, limit is {limit}")]
    TooManyEntries {
        /// Entries in the archive.
        count: usize,
        /// Policy limit.
        limit: usize,
    },

    /// An entry name is absolute, carries a drive prefix, or contains `..`.
    #[error("entry '{entry}' has an unsafe path: {reason}")]
    UnsafePath {
        /// Raw entry name.
        entry: String,
        /// What made it unsafe.
        reason: &'static str,
    },

    /// An entry resolves outside the destination directory.
    #[error("entry '{entry}' escapes the destination directory (resolves to {resolved})")]
    PathEscape {
        /// Raw entry name.
        entry: String,
        /// Where it would have been written.
        resolved: PathBuf,
    },

    /// An entry is larger than the per-entry limit.
    #[error("entry '{entry}' exceeds the per-entry limit of {limit} bytes")]
    EntryTooLarge {
        /// Raw entry name.
        entry: String,
        /// Policy limit.
        limit: u64,
    },

    /// The archive expands beyond the total size limit.
    #[error("archive exceeds the total limit of {limit} bytes at entry '{entry}'")]
    TotalTooLarge {
        /// Entry being written when the limit was crossed.
        entry: String,
        /// Policy limit.
        limit: u64,
    },

    /// A symlink entry was refused.
    #[error("symlink '{entry}' rejected: {reason}")]
    UnsafeSymlink {
        /// Raw entry name.
        entry: String,
        /// Why it was refused.
        reason: String,
    },

    /// Filesystem failure while writing an entry.
    #[error("failed to extract '{entry}' to {path}: {source}")]
    Io {
        /// Raw entry name.
        entry: String,
        /// The path being written.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// Extraction was cancelled before every entry was written.
    #[error("extraction cancelled before entry '{entry}'")]
    Cancelled {
        /// First entry not written.
        entry: String,
    },
}

impl ExtractError {
    /// Creates an unsafe-path error.
    pub fn unsafe_path(entry: impl Into<String>, reason: &'static str) -> Self {
        Self::UnsafePath {
            entry: entry.into(),
            reason,
        }
    }

    /// Creates a path-escape error.
    pub fn path_escape(entry: impl Into<String>, resolved: impl Into<PathBuf>) -> Self {
        Self::PathEscape {
            entry: entry.into(),
            resolved: resolved.into(),
        }
    }

    /// Creates a symlink rejection.
    pub fn unsafe_symlink(entry: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::UnsafeSymlink {
            entry: entry.into(),
            reason: reason.into(),
        }
    }

    /// Creates an IO error for one entry.
    pub fn io(entry: impl Into<String>, path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            entry: entry.into(),
            path: path.into(),
            source,
        }
    }

    /// Returns `true` for policy violations, as opposed to IO failures.
    #[must_use]
    pub fn is_policy_violation(&self) -> bool {
        !matches!(self, Self::Open { .. } | Self::Io { .. } | Self::Cancelled { .. })
    }
}
