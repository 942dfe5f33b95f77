//! Bundle downloads.
//!
//! - [`BundleDownloader`] - export request, archive fetch with retry, extraction
//! - [`UrlGuard`] - SSRF and scheme checks for server-supplied URLs

mod bundle;
mod url_guard;

pub use bundle::{BundleDownloader, DownloadMode, DownloadRequest};
pub use url_guard::{UrlGuard, UrlGuardError};
