//! Authenticated API access with retry.
//!
//! This module provides the pieces every remote call goes through:
//!
//! - [`Transport`] - one authenticated JSON request, error bodies parsed into [`ApiError`]
//! - [`Backoff`] - jittered exponential retry around an operation
//! - [`is_retryable`] - the transient/permanent error classifier
//! - [`ClientError`] - the failure type shared by the whole crate

mod api_error;
pub mod constants;
mod error;
pub mod retry;
mod transport;

pub use api_error::{ApiError, NON_JSON_REASON};
pub use error::ClientError;
pub use retry::{Backoff, DEFAULT_MAX_RETRIES, Jitter, RetryAttempt, RetryPolicy, is_retryable};
pub use transport::{BodyFactory, RetryBody, Transport};
