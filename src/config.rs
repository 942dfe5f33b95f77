//! Client configuration.
//!
//! [`ClientConfig`] is immutable once built and shared read-only by every
//! operation spawned from one client. All normalization happens in
//! [`ClientConfigBuilder::build`]:
//!
//! | Setting           | Rule                                                     |
//! |-------------------|----------------------------------------------------------|
//! | base URL          | must be absolute; normalized to end with `/`             |
//! | user agent        | blank overrides are ignored                              |
//! | HTTP timeout      | zero disables the timeout; negative is an error          |
//! | max retries       | negative values clamp to zero                            |
//! | backoff/poll wait | zero falls back to defaults; max promoted to initial     |

use std::time::Duration;

use thiserror::Error;
use url::Url;

use crate::api::constants::{DEFAULT_BASE_URL, DEFAULT_HTTP_TIMEOUT};
use crate::api::retry::{DEFAULT_INITIAL_BACKOFF, DEFAULT_MAX_BACKOFF, DEFAULT_MAX_RETRIES, RetryPolicy};
use crate::download::UrlGuard;
use crate::user_agent;

/// Default first wait between poll rounds.
pub const DEFAULT_POLL_INITIAL_WAIT: Duration = Duration::from_secs(1);

/// Default cap on the wait between poll rounds.
pub const DEFAULT_POLL_MAX_WAIT: Duration = Duration::from_secs(30);

/// Default number of concurrent status requests per poll round.
pub const DEFAULT_POLL_CONCURRENCY: usize = 6;

/// Upper bound on poll concurrency.
const MAX_POLL_CONCURRENCY: usize = 8;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The API token is empty.
    #[error("API token must not be empty")]
    MissingToken,

    /// The API token contains characters not allowed in a header value.
    #[error("API token contains characters not allowed in an HTTP header")]
    InvalidToken,

    /// The project identifier is empty.
    #[error("project id must not be empty")]
    MissingProjectId,

    /// The base URL could not be parsed or is not absolute.
    #[error("invalid base URL {url}: {reason}")]
    InvalidBaseUrl {
        /// The rejected URL.
        url: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A negative HTTP timeout was supplied.
    #[error("HTTP timeout must not be negative (got {seconds}s)")]
    NegativeTimeout {
        /// The rejected value.
        seconds: i64,
    },

    /// The HTTP client could not be constructed.
    #[error("failed to build HTTP client: {source}")]
    HttpClient {
        /// The underlying builder error.
        #[source]
        source: reqwest::Error,
    },
}

/// Immutable client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    base_url: Url,
    token: String,
    project_id: String,
    user_agent: String,
    http_timeout: Option<Duration>,
    retry: RetryPolicy,
    poll_initial_wait: Duration,
    poll_max_wait: Duration,
    poll_concurrency: usize,
    url_guard: UrlGuard,
}

impl ClientConfig {
    /// Starts a builder with the two required settings.
    pub fn builder(token: impl Into<String>, project_id: impl Into<String>) -> ClientConfigBuilder {
        ClientConfigBuilder::new(token, project_id)
    }

    /// API base URL, always ending with `/`.
    #[must_use]
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    /// API token.
    #[must_use]
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Project identifier.
    #[must_use]
    pub fn project_id(&self) -> &str {
        &self.project_id
    }

    /// User-Agent header value.
    #[must_use]
    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    /// End-to-end HTTP timeout; `None` when disabled.
    #[must_use]
    pub fn http_timeout(&self) -> Option<Duration> {
        self.http_timeout
    }

    /// Retry budget and backoff bounds.
    #[must_use]
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry
    }

    /// First wait between poll rounds.
    #[must_use]
    pub fn poll_initial_wait(&self) -> Duration {
        self.poll_initial_wait
    }

    /// Cap on the wait between poll rounds.
    #[must_use]
    pub fn poll_max_wait(&self) -> Duration {
        self.poll_max_wait
    }

    /// Concurrent status requests per poll round.
    #[must_use]
    pub fn poll_concurrency(&self) -> usize {
        self.poll_concurrency
    }

    /// Validation rules for server-supplied download URLs.
    #[must_use]
    pub fn url_guard(&self) -> &UrlGuard {
        &self.url_guard
    }
}

/// Builder for [`ClientConfig`].
#[derive(Debug, Clone)]
pub struct ClientConfigBuilder {
    base_url: Option<String>,
    token: String,
    project_id: String,
    user_agent: Option<String>,
    http_timeout_secs: Option<i64>,
    http_timeout: Option<Duration>,
    max_retries: i64,
    initial_backoff: Duration,
    max_backoff: Duration,
    poll_initial_wait: Duration,
    poll_max_wait: Duration,
    poll_concurrency: usize,
    url_guard: UrlGuard,
}

impl ClientConfigBuilder {
    fn new(token: impl Into<String>, project_id: impl Into<String>) -> Self {
        Self {
            base_url: None,
            token: token.into(),
            project_id: project_id.into(),
            user_agent: None,
            http_timeout_secs: None,
            http_timeout: None,
            max_retries: i64::from(DEFAULT_MAX_RETRIES),
            initial_backoff: DEFAULT_INITIAL_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
            poll_initial_wait: DEFAULT_POLL_INITIAL_WAIT,
            poll_max_wait: DEFAULT_POLL_MAX_WAIT,
            poll_concurrency: DEFAULT_POLL_CONCURRENCY,
            url_guard: UrlGuard::default(),
        }
    }

    /// Overrides the API base URL.
    #[must_use]
    pub fn base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = Some(url.into());
        self
    }

    /// Overrides the User-Agent. Blank values are ignored.
    #[must_use]
    pub fn user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = Some(user_agent.into());
        self
    }

    /// Sets the HTTP timeout. `Duration::ZERO` disables it.
    #[must_use]
    pub fn http_timeout(mut self, timeout: Duration) -> Self {
        self.http_timeout = Some(timeout);
        self.http_timeout_secs = None;
        self
    }

    /// Sets the HTTP timeout from signed seconds, as read from flags or the
    /// environment. Zero disables it; negative values fail at [`build`](Self::build).
    #[must_use]
    pub fn http_timeout_secs(mut self, seconds: i64) -> Self {
        self.http_timeout_secs = Some(seconds);
        self.http_timeout = None;
        self
    }

    /// Sets the retry budget. Negative values clamp to zero.
    #[must_use]
    pub fn max_retries(mut self, retries: i64) -> Self {
        self.max_retries = retries;
        self
    }

    /// Sets backoff bounds. Zero values fall back to defaults.
    #[must_use]
    pub fn backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff = initial;
        self.max_backoff = max;
        self
    }

    /// Sets poll-wait bounds. Zero values fall back to defaults.
    #[must_use]
    pub fn poll_wait(mut self, initial: Duration, max: Duration) -> Self {
        self.poll_initial_wait = initial;
        self.poll_max_wait = max;
        self
    }

    /// Sets concurrent status requests per poll round (clamped to 1..=8).
    #[must_use]
    pub fn poll_concurrency(mut self, concurrency: usize) -> Self {
        self.poll_concurrency = concurrency;
        self
    }

    /// Replaces the download URL validation rules.
    #[must_use]
    pub fn url_guard(mut self, guard: UrlGuard) -> Self {
        self.url_guard = guard;
        self
    }

    /// Validates and normalizes the settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the token or project id is empty, the
    /// base URL is not absolute, or the HTTP timeout is negative.
    pub fn build(self) -> Result<ClientConfig, ConfigError> {
        let token = self.token.trim().to_string();
        if token.is_empty() {
            return Err(ConfigError::MissingToken);
        }
        if !token.bytes().all(|b| b.is_ascii_graphic()) {
            return Err(ConfigError::InvalidToken);
        }
        let project_id = self.project_id.trim().to_string();
        if project_id.is_empty() {
            return Err(ConfigError::MissingProjectId);
        }

        let base_url = normalize_base_url(self.base_url.as_deref().unwrap_or(DEFAULT_BASE_URL))?;

        let user_agent = self
            .user_agent
            .map(|ua| ua.trim().to_string())
            .filter(|ua| !ua.is_empty())
            .unwrap_or_else(user_agent::default_user_agent);

        let http_timeout = match (self.http_timeout_secs, self.http_timeout) {
            (Some(seconds), _) if seconds < 0 => {
                return Err(ConfigError::NegativeTimeout { seconds });
            }
            (Some(0), _) => None,
            (Some(seconds), _) => Some(Duration::from_secs(seconds.unsigned_abs())),
            (None, Some(timeout)) if timeout.is_zero() => None,
            (None, Some(timeout)) => Some(timeout),
            (None, None) => Some(DEFAULT_HTTP_TIMEOUT),
        };

        let max_retries = u32::try_from(self.max_retries.max(0)).unwrap_or(u32::MAX);
        let (initial_backoff, max_backoff) = normalize_bounds(
            self.initial_backoff,
            self.max_backoff,
            DEFAULT_INITIAL_BACKOFF,
            DEFAULT_MAX_BACKOFF,
        );
        let (poll_initial_wait, poll_max_wait) = normalize_bounds(
            self.poll_initial_wait,
            self.poll_max_wait,
            DEFAULT_POLL_INITIAL_WAIT,
            DEFAULT_POLL_MAX_WAIT,
        );

        Ok(ClientConfig {
            base_url,
            token,
            project_id,
            user_agent,
            http_timeout,
            retry: RetryPolicy::new(max_retries, initial_backoff, max_backoff),
            poll_initial_wait,
            poll_max_wait,
            poll_concurrency: self.poll_concurrency.clamp(1, MAX_POLL_CONCURRENCY),
            url_guard: self.url_guard,
        })
    }
}

fn normalize_base_url(raw: &str) -> Result<Url, ConfigError> {
    let raw = raw.trim();
    let mut url = Url::parse(raw).map_err(|e| ConfigError::InvalidBaseUrl {
        url: raw.to_string(),
        reason: e.to_string(),
    })?;
    let web_scheme = matches!(url.scheme(), "http" | "https");
    if !web_scheme || url.cannot_be_a_base() || url.host_str().is_none() {
        return Err(ConfigError::InvalidBaseUrl {
            url: raw.to_string(),
            reason: "must be an absolute http(s) URL".to_string(),
        });
    }
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}

fn normalize_bounds(
    initial: Duration,
    max: Duration,
    default_initial: Duration,
    default_max: Duration,
) -> (Duration, Duration) {
    let initial = if initial.is_zero() { default_initial } else { initial };
    let max = if max.is_zero() { default_max } else { max };
    (initial, max.max(initial))
}
