//! Constants for the API transport (endpoints, headers, limits).

use std::time::Duration;

/// Production API endpoint used when no base URL is configured.
pub const DEFAULT_BASE_URL: &str = "https://api.lokalise.com/api2/";

/// Header carrying the API token.
pub const AUTH_HEADER: &str = "X-Api-Token";

/// Bytes of a non-2xx body read when building an [`ApiError`](super::ApiError) (8 KiB).
pub const ERROR_BODY_CAP: usize = 8 * 1024;

/// Default end-to-end HTTP timeout.
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(120);

/// TCP connect timeout for API and bundle requests.
pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
