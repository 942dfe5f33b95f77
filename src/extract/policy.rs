//! Extraction limits.

/// Default maximum number of archive entries.
pub const DEFAULT_MAX_FILES: usize = 20_000;

/// Default maximum total uncompressed bytes (2 GiB).
pub const DEFAULT_MAX_TOTAL_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Default maximum uncompressed bytes per entry (512 MiB).
pub const DEFAULT_MAX_FILE_BYTES: u64 = 512 * 1024 * 1024;

/// Maximum length of a symlink target, in bytes.
pub const MAX_SYMLINK_TARGET: u64 = 4096;

/// Limits applied to one extraction.
///
/// ```
/// use bundlex_core::extract::ExtractionPolicy;
///
/// let policy = ExtractionPolicy {
///     max_files: 100,
///     ..ExtractionPolicy::default()
/// };
/// assert!(!policy.allow_symlinks);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtractionPolicy {
    /// Archives with more entries are rejected before anything is written.
    pub max_files: usize,
    /// Cap on bytes written across all entries.
    pub max_total_bytes: u64,
    /// Cap on bytes written for any single entry.
    pub max_file_bytes: u64,
    /// Create symlink entries instead of skipping them.
    pub allow_symlinks: bool,
    /// Apply entry modification times to extracted files.
    pub preserve_mtime: bool,
}

impl Default for ExtractionPolicy {
    fn default() -> Self {
        Self {
            max_files: DEFAULT_MAX_FILES,
            max_total_bytes: DEFAULT_MAX_TOTAL_BYTES,
            max_file_bytes: DEFAULT_MAX_FILE_BYTES,
            allow_symlinks: false,
            preserve_mtime: false,
        }
    }
}
