//! Bundlex Core Library
//!
//! A resilient client for a remote file-exchange API: uploading translation
//! files and downloading exported bundles from CI pipelines.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`api`] - authenticated transport, error model, backoff and retry classification
//! - [`process`] - server-side process status and the bounded-concurrency poller
//! - [`upload`] - upload specs and the streaming base64 body encoder
//! - [`download`] - bundle export, archive download and URL validation
//! - [`extract`] - safe ZIP extraction under size, count and path limits
//! - [`client`] - the [`ExchangeClient`] facade
//!
//! Every long-running call takes a [`CallScope`] for cancellation and deadlines.

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod api;
pub mod client;
pub mod config;
pub mod download;
pub mod extract;
pub mod process;
pub mod scope;
pub mod upload;
mod user_agent;

// Re-export commonly used types
pub use api::{ApiError, Backoff, ClientError, Jitter, RetryPolicy, is_retryable};
pub use client::{DownloadOutcome, ExchangeClient, UploadOptions};
pub use config::{ClientConfig, ClientConfigBuilder, ConfigError};
pub use download::{DownloadMode, DownloadRequest, UrlGuard};
pub use extract::{ExtractError, ExtractReport, ExtractionPolicy, extract_archive, extract_archive_cancellable};
pub use process::{PollPolicy, ProcessStatus, QueuedProcess};
pub use scope::CallScope;
pub use upload::{UploadData, UploadSpec};
