//! Error type for every client operation.
//!
//! [`ClientError`] is the failure value that crosses the public API. Its
//! variants follow the taxonomy the retry layer cares about: transient
//! transport faults, structured API errors, malformed responses,
//! cancellation, and security-policy violations.

use std::path::PathBuf;

use thiserror::Error;

use super::ApiError;
use crate::config::ConfigError;
use crate::download::UrlGuardError;
use crate::extract::ExtractError;

/// Errors produced by the client.
#[derive(Debug, Error)]
pub enum ClientError {
    /// Network-level failure reported by the HTTP client.
    #[error("network error during {operation}: {source}")]
    Network {
        /// What was being attempted.
        operation: String,
        /// The underlying HTTP client error.
        #[source]
        source: reqwest::Error,
    },

    /// The request timed out at the network layer.
    #[error("timeout during {operation}")]
    Timeout {
        /// What was being attempted.
        operation: String,
    },

    /// The caller cancelled the operation.
    #[error("operation cancelled")]
    Cancelled,

    /// The caller's deadline passed before the operation completed.
    #[error("context deadline exceeded")]
    DeadlineExceeded,

    /// The server answered with a non-2xx status.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// A 2xx body ended before a complete JSON value was read.
    #[error("truncated response during {operation}: {source}")]
    Truncated {
        /// What was being attempted.
        operation: String,
        /// The decoder error reporting the early end of input.
        #[source]
        source: serde_json::Error,
    },

    /// A 2xx body was complete but did not decode into the expected shape.
    #[error("failed to decode response during {operation}: {source}")]
    Decode {
        /// What was being attempted.
        operation: String,
        /// The decoder error.
        #[source]
        source: serde_json::Error,
    },

    /// The response decoded but lacked something the operation needs.
    #[error("unexpected response during {operation}: {message}")]
    UnexpectedResponse {
        /// What was being attempted.
        operation: String,
        /// What was missing or wrong.
        message: String,
    },

    /// Local filesystem failure.
    #[error("IO error at {path}: {source}")]
    Io {
        /// The path involved.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// The server declared a content length that the body did not match.
    #[error("incomplete download from {url}: expected {expected} bytes, got {actual}")]
    IncompleteDownload {
        /// The URL being downloaded.
        url: String,
        /// Declared content length.
        expected: u64,
        /// Bytes actually received.
        actual: u64,
    },

    /// The downloaded file is not a readable ZIP archive.
    #[error("invalid archive downloaded from {url}: {reason}")]
    InvalidArchive {
        /// The URL the archive came from.
        url: String,
        /// Why the archive was rejected.
        reason: String,
    },

    /// The caller supplied an unusable request.
    #[error("invalid request: {message}")]
    InvalidRequest {
        /// What was wrong with it.
        message: String,
    },

    /// A server-side process ended without a usable result.
    #[error("process {process_id} ended with status {status}: {message}")]
    Process {
        /// Server-assigned process identifier.
        process_id: String,
        /// Last known status.
        status: String,
        /// What went wrong.
        message: String,
    },

    /// Client configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A server-supplied URL failed validation.
    #[error(transparent)]
    UrlRejected(#[from] UrlGuardError),

    /// Archive extraction was refused or failed.
    #[error(transparent)]
    Extract(#[from] ExtractError),

    /// The last error of a retried operation, annotated with attempts made.
    #[error("{operation} failed after {attempts} attempt(s): {source}")]
    Retry {
        /// The retried operation.
        operation: String,
        /// Number of attempts made.
        attempts: u32,
        /// The error from the final attempt.
        #[source]
        source: Box<ClientError>,
    },
}

impl ClientError {
    /// Creates a network error, promoting client timeouts to [`ClientError::Timeout`].
    pub fn network(operation: impl Into<String>, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            Self::Timeout {
                operation: operation.into(),
            }
        } else {
            Self::Network {
                operation: operation.into(),
                source,
            }
        }
    }

    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Classifies a JSON decoding error as truncation or a malformed payload.
    pub fn decode(operation: impl Into<String>, source: serde_json::Error) -> Self {
        if source.is_eof() {
            Self::Truncated {
                operation: operation.into(),
                source,
            }
        } else {
            Self::Decode {
                operation: operation.into(),
                source,
            }
        }
    }

    /// Creates an unexpected-response error.
    pub fn unexpected(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::UnexpectedResponse {
            operation: operation.into(),
            message: message.into(),
        }
    }

    /// Creates an invalid-request error.
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Creates a process failure error.
    pub fn process(
        process_id: impl Into<String>,
        status: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Process {
            process_id: process_id.into(),
            status: status.into(),
            message: message.into(),
        }
    }

    /// Creates an incomplete-download error.
    pub fn incomplete_download(url: impl Into<String>, expected: u64, actual: u64) -> Self {
        Self::IncompleteDownload {
            url: url.into(),
            expected,
            actual,
        }
    }

    /// Creates an invalid-archive error.
    pub fn invalid_archive(url: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidArchive {
            url: url.into(),
            reason: reason.into(),
        }
    }

    /// Returns the innermost error, looking through retry annotations.
    #[must_use]
    pub fn root(&self) -> &ClientError {
        let mut current = self;
        while let Self::Retry { source, .. } = current {
            current = source;
        }
        current
    }

    /// Returns the structured API error, if that is what ultimately failed.
    #[must_use]
    pub fn api_error(&self) -> Option<&ApiError> {
        match self.root() {
            Self::Api(err) => Some(err),
            _ => None,
        }
    }

    /// Returns `true` for caller-imposed stops: cancellation or deadline.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        matches!(self.root(), Self::Cancelled | Self::DeadlineExceeded)
    }

    /// Number of attempts recorded by the retry layer, if any.
    #[must_use]
    pub fn attempts(&self) -> Option<u32> {
        match self {
            Self::Retry { attempts, .. } => Some(*attempts),
            _ => None,
        }
    }
}
