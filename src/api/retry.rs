//! Retry with jittered exponential backoff for transient failures.
//!
//! This module provides the [`Backoff`] engine that drives one operation
//! through repeated attempts, and [`is_retryable`], the classifier that
//! decides whether a given [`ClientError`] is worth another attempt.
//!
//! # Overview
//!
//! Each failed attempt is classified. Retryable failures sleep for a delay
//! drawn uniformly from `[0.5 * d, 1.5 * d)`, where `d` starts at the initial
//! delay and doubles per retry up to the maximum. The sleep observes the
//! caller's [`CallScope`]: cancellation aborts immediately and the deadline
//! clips the sleep so the engine never overshoots it.
//!
//! # Example
//!
//! ```
//! use std::time::Duration;
//! use bundlex_core::{Backoff, CallScope, ClientError, RetryPolicy, is_retryable};
//!
//! # async fn example() -> Result<(), ClientError> {
//! let backoff = Backoff::new(RetryPolicy::new(3, Duration::from_millis(100), Duration::from_secs(2)));
//! let scope = CallScope::new();
//! let value = backoff
//!     .run(&scope, "example", |_attempt| async { Ok::<_, ClientError>(42) }, is_retryable)
//!     .await?;
//! assert_eq!(value, 42);
//! # Ok(())
//! # }
//! ```

use std::error::Error as StdError;
use std::future::Future;
use std::io::ErrorKind;
use std::sync::Mutex;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Instant;
use tracing::{debug, warn};

use super::ClientError;
use crate::scope::CallScope;

/// Default number of retries after the first attempt.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Default delay before the first retry.
pub const DEFAULT_INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// Default cap on the backoff delay.
pub const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Retry limits for one operation.
///
/// # Delay Calculation
///
/// ```text
/// d(n)  = min(initial * 2^n, max)      n = 0-based retry index
/// sleep ~ uniform[0.5 * d(n), 1.5 * d(n))
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    max_retries: u32,
    initial_delay: Duration,
    max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: DEFAULT_MAX_RETRIES,
            initial_delay: DEFAULT_INITIAL_BACKOFF,
            max_delay: DEFAULT_MAX_BACKOFF,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy. `max_delay` is promoted to `initial_delay` if smaller.
    #[must_use]
    pub fn new(max_retries: u32, initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries,
            initial_delay,
            max_delay: max_delay.max(initial_delay),
        }
    }

    /// Returns a copy that never retries.
    #[must_use]
    pub fn without_retries(self) -> Self {
        Self {
            max_retries: 0,
            ..self
        }
    }

    /// Retries allowed after the first attempt.
    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Total attempts: `max_retries + 1`.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Returns the un-jittered delay before retry number `retry` (0-based).
    #[must_use]
    pub fn base_delay(&self, retry: u32) -> Duration {
        let factor = 2u32.checked_pow(retry).unwrap_or(u32::MAX);
        self.initial_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }
}

/// Source of jitter for backoff delays.
///
/// One PRNG behind a mutex, so a seeded instance makes delays reproducible
/// in tests while concurrent operations can still share it.
#[derive(Debug)]
pub struct Jitter {
    rng: Mutex<StdRng>,
}

impl Default for Jitter {
    fn default() -> Self {
        Self {
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }
}

impl Jitter {
    /// Creates a deterministic jitter source.
    #[must_use]
    pub fn seeded(seed: u64) -> Self {
        Self {
            rng: Mutex::new(StdRng::seed_from_u64(seed)),
        }
    }

    /// Draws a delay uniformly from `[0.5 * base, 1.5 * base)`.
    pub fn apply(&self, base: Duration) -> Duration {
        if base.is_zero() {
            return base;
        }
        let factor: f64 = {
            let mut rng = self
                .rng
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner);
            rng.gen_range(0.5..1.5)
        };
        base.mul_f64(factor)
    }
}

/// Per-attempt context handed to the retried operation.
#[derive(Debug, Clone)]
pub struct RetryAttempt {
    /// 0-based attempt index.
    pub index: u32,
    /// Time since the first attempt started.
    pub elapsed: Duration,
    /// Display text of the previous attempt's error.
    pub last_error: Option<String>,
}

/// Backoff engine: runs an operation until it succeeds, fails permanently,
/// or exhausts its attempts.
#[derive(Debug, Default)]
pub struct Backoff {
    policy: RetryPolicy,
    jitter: Jitter,
}

impl Backoff {
    /// Creates an engine with an entropy-seeded jitter source.
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            jitter: Jitter::default(),
        }
    }

    /// Creates an engine with an explicit jitter source.
    #[must_use]
    pub fn with_jitter(policy: RetryPolicy, jitter: Jitter) -> Self {
        Self { policy, jitter }
    }

    /// Returns the configured policy.
    #[must_use]
    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Computes the jittered sleep before retry number `retry` (0-based).
    #[must_use]
    pub fn delay_for(&self, retry: u32) -> Duration {
        self.jitter.apply(self.policy.base_delay(retry))
    }

    /// Runs `operation` under the engine's policy.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Cancelled`] / [`ClientError::DeadlineExceeded`] when
    ///   the scope stops the operation; these are returned unannotated.
    /// - [`ClientError::Retry`] wrapping the last error when it was not
    ///   retryable or the attempts ran out.
    pub async fn run<T, F, Fut, C>(
        &self,
        scope: &CallScope,
        operation_name: &str,
        operation: F,
        classify: C,
    ) -> Result<T, ClientError>
    where
        F: FnMut(RetryAttempt) -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
        C: Fn(&ClientError) -> bool,
    {
        self.run_with_policy(scope, operation_name, self.policy, operation, classify)
            .await
    }

    /// Like [`run`](Self::run) with a per-call policy override.
    ///
    /// # Errors
    ///
    /// See [`run`](Self::run).
    pub async fn run_with_policy<T, F, Fut, C>(
        &self,
        scope: &CallScope,
        operation_name: &str,
        policy: RetryPolicy,
        mut operation: F,
        classify: C,
    ) -> Result<T, ClientError>
    where
        F: FnMut(RetryAttempt) -> Fut,
        Fut: Future<Output = Result<T, ClientError>>,
        C: Fn(&ClientError) -> bool,
    {
        let started = Instant::now();
        let mut last_error: Option<String> = None;

        for index in 0..policy.max_attempts() {
            scope.check()?;

            let attempt = RetryAttempt {
                index,
                elapsed: started.elapsed(),
                last_error: last_error.take(),
            };
            let error = match scope.run(operation(attempt)).await {
                Ok(value) => {
                    if index > 0 {
                        debug!(operation = operation_name, attempts = index + 1, "succeeded after retry");
                    }
                    return Ok(value);
                }
                Err(error) => error,
            };

            if error.is_cancelled() {
                return Err(error);
            }

            let attempts = index + 1;
            if !classify(&error) || attempts >= policy.max_attempts() {
                debug!(operation = operation_name, attempts, error = %error, "giving up");
                return Err(ClientError::Retry {
                    operation: operation_name.to_string(),
                    attempts,
                    source: Box::new(error),
                });
            }

            let base = policy.base_delay(index);
            let delay = self.jitter.apply(base);
            warn!(
                operation = operation_name,
                attempt = attempts,
                max_attempts = policy.max_attempts(),
                delay_ms = delay.as_millis(),
                error = %error,
                "retrying after transient failure"
            );
            last_error = Some(error.to_string());
            scope.sleep(delay).await?;
        }

        // max_attempts() is at least 1, so the loop always returns.
        Err(ClientError::unexpected(operation_name, "retry loop ended without an attempt"))
    }
}

/// Decides whether an error is transient.
///
/// Checks run in a fixed order and the first match wins:
///
/// 1. network-layer timeout → retryable
/// 2. cancellation / deadline exceeded → **not** retryable
/// 3. other timeout shapes (IO `TimedOut`) → retryable
/// 4. short read, connection reset, broken pipe, unexpected EOF, incomplete
///    download, invalid archive → retryable
/// 5. API error with status 408, 425, 429, 500, 502, 503, 504 → retryable
///
/// Everything else is permanent.
#[must_use]
pub fn is_retryable(error: &ClientError) -> bool {
    let error = error.root();

    // (1)
    match error {
        ClientError::Timeout { .. } => return true,
        ClientError::Network { source, .. } if source.is_timeout() => return true,
        _ => {}
    }

    // (2)
    if matches!(error, ClientError::Cancelled | ClientError::DeadlineExceeded) {
        return false;
    }

    // (3)
    if let Some(kind) = io_kind(error) {
        if kind == ErrorKind::TimedOut {
            return true;
        }
    }

    // (4)
    match error {
        ClientError::Truncated { .. }
        | ClientError::IncompleteDownload { .. }
        | ClientError::InvalidArchive { .. } => return true,
        ClientError::Network { source, .. }
            if source.is_connect() || source.is_body() || source.is_request() =>
        {
            return true;
        }
        _ => {}
    }
    if io_kind(error).is_some_and(is_short_read_kind) {
        return true;
    }

    // (5)
    if let ClientError::Api(api) = error {
        return api.is_retryable_status();
    }

    false
}

fn is_short_read_kind(kind: ErrorKind) -> bool {
    matches!(
        kind,
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::BrokenPipe
            | ErrorKind::UnexpectedEof
    )
}

/// Finds the first `std::io::Error` kind in the error or its source chain.
fn io_kind(error: &ClientError) -> Option<ErrorKind> {
    if let ClientError::Io { source, .. } = error {
        return Some(source.kind());
    }
    let mut current: Option<&(dyn StdError + 'static)> = error.source();
    while let Some(err) = current {
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            return Some(io.kind());
        }
        current = err.source();
    }
    None
}
