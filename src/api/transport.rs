//! Authenticated JSON transport over a pooled HTTP client.
//!
//! [`Transport`] issues one request per call to [`Transport::send`], attaching
//! the token, User-Agent and `Accept` headers. Non-2xx responses become
//! [`ApiError`]s built from a bounded prefix of the body. 2xx bodies that are
//! empty mean "success, nothing to decode"; anything else is decoded into the
//! caller's type.
//!
//! [`Transport::send_with_retry`] layers the [`Backoff`] engine on top. Since
//! a request body may be a one-shot stream, the body is described by a
//! [`RetryBody`] that says how to produce it again for each attempt.

use std::fmt;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use futures_util::StreamExt;
use reqwest::header::{ACCEPT, CONTENT_TYPE, HeaderValue};
use reqwest::{Client, Method};
use serde::de::DeserializeOwned;
use tracing::{debug, instrument};
use url::Url;

use super::constants::{AUTH_HEADER, CONNECT_TIMEOUT, ERROR_BODY_CAP};
use super::retry::{Backoff, is_retryable};
use super::{ApiError, ClientError};
use crate::config::{ClientConfig, ConfigError};
use crate::scope::CallScope;

/// Produces a fresh request body for every attempt.
pub type BodyFactory = Arc<dyn Fn() -> Result<reqwest::Body, ClientError> + Send + Sync>;

/// How a request body is reproduced across retry attempts.
///
/// Chosen once per call:
/// - [`RetryBody::Factory`] rebuilds the body (streamed uploads),
/// - [`RetryBody::Rewindable`] replays in-memory bytes,
/// - [`RetryBody::Once`] can be sent a single time, so retries are disabled.
pub enum RetryBody {
    /// No request body.
    Empty,
    /// Rebuilt from scratch for each attempt.
    Factory(BodyFactory),
    /// Replayed from the start for each attempt.
    Rewindable(Bytes),
    /// Consumed by the first attempt.
    Once(Mutex<Option<reqwest::Body>>),
}

impl fmt::Debug for RetryBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => f.write_str("Empty"),
            Self::Factory(_) => f.write_str("Factory(..)"),
            Self::Rewindable(bytes) => write!(f, "Rewindable({} bytes)", bytes.len()),
            Self::Once(_) => f.write_str("Once(..)"),
        }
    }
}

impl RetryBody {
    /// Serializes `value` into a rewindable JSON body.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidRequest`] if `value` cannot be serialized.
    pub fn json<T: serde::Serialize>(value: &T) -> Result<Self, ClientError> {
        serde_json::to_vec(value)
            .map(|bytes| Self::Rewindable(Bytes::from(bytes)))
            .map_err(|e| ClientError::invalid_request(format!("request body is not serializable: {e}")))
    }

    /// Wraps a body that can only be sent once.
    #[must_use]
    pub fn once(body: reqwest::Body) -> Self {
        Self::Once(Mutex::new(Some(body)))
    }

    /// Returns `true` if the body can be produced more than once.
    #[must_use]
    pub fn is_replayable(&self) -> bool {
        !matches!(self, Self::Once(_))
    }

    fn next_body(&self) -> Result<Option<reqwest::Body>, ClientError> {
        match self {
            Self::Empty => Ok(None),
            Self::Factory(factory) => factory().map(Some),
            Self::Rewindable(bytes) => Ok(Some(reqwest::Body::from(bytes.clone()))),
            Self::Once(slot) => slot
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .take()
                .map(Some)
                .ok_or_else(|| ClientError::invalid_request("one-shot request body was already sent")),
        }
    }
}

/// Authenticated API transport.
///
/// Cheap to clone; clones share the connection pool, configuration and
/// backoff engine.
#[derive(Debug, Clone)]
pub struct Transport {
    http: Client,
    config: Arc<ClientConfig>,
    backoff: Arc<Backoff>,
}

impl Transport {
    /// Builds a transport with a fresh connection pool.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Config`] if the HTTP client cannot be built.
    pub fn new(config: Arc<ClientConfig>) -> Result<Self, ClientError> {
        let backoff = Arc::new(Backoff::new(config.retry_policy()));
        Self::with_backoff(config, backoff)
    }

    /// Builds a transport sharing an existing backoff engine.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Config`] if the HTTP client cannot be built.
    pub fn with_backoff(config: Arc<ClientConfig>, backoff: Arc<Backoff>) -> Result<Self, ClientError> {
        let mut builder = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .gzip(true)
            .user_agent(config.user_agent());
        if let Some(timeout) = config.http_timeout() {
            builder = builder.timeout(timeout);
        }
        let http = builder
            .build()
            .map_err(|source| ConfigError::HttpClient { source })?;
        Ok(Self {
            http,
            config,
            backoff,
        })
    }

    /// Shared configuration.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Shared backoff engine.
    #[must_use]
    pub fn backoff(&self) -> &Backoff {
        &self.backoff
    }

    /// Resolves `path` against the base URL. Leading slashes are ignored so
    /// the base URL's own path is kept.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::InvalidRequest`] if the joined URL is invalid.
    pub fn endpoint(&self, path: &str) -> Result<Url, ClientError> {
        self.config
            .base_url()
            .join(path.trim_start_matches('/'))
            .map_err(|e| ClientError::invalid_request(format!("invalid request path {path}: {e}")))
    }

    /// Sends one request and decodes the response.
    ///
    /// Returns `Ok(None)` for a 2xx response with an empty body.
    ///
    /// # Errors
    ///
    /// - [`ClientError::Api`] for non-2xx responses
    /// - [`ClientError::Network`] / [`ClientError::Timeout`] for transport faults
    /// - [`ClientError::Truncated`] / [`ClientError::Decode`] for bad 2xx bodies
    #[instrument(level = "debug", skip(self, body), fields(method = %method))]
    pub async fn send<T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<reqwest::Body>,
    ) -> Result<Option<T>, ClientError> {
        let url = self.endpoint(path)?;
        let operation = format!("{method} {path}");

        let mut token = HeaderValue::from_str(self.config.token())
            .map_err(|_| ClientError::Config(ConfigError::InvalidToken))?;
        token.set_sensitive(true);

        let mut request = self
            .http
            .request(method, url)
            .header(AUTH_HEADER, token)
            .header(ACCEPT, "application/json");
        if let Some(body) = body {
            request = request
                .header(CONTENT_TYPE, "application/json")
                .body(body);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ClientError::network(operation.clone(), e))?;

        let status = response.status();
        if !status.is_success() {
            let prefix = read_capped(response, ERROR_BODY_CAP).await;
            let error = ApiError::from_body(status.as_u16(), &prefix);
            debug!(status = status.as_u16(), error = %error, "API returned error status");
            return Err(error.into());
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| ClientError::network(operation.clone(), e))?;
        decode_body(&operation, &bytes)
    }

    /// Sends a request through the backoff engine.
    ///
    /// A [`RetryBody::Once`] body is sent a single time regardless of the
    /// configured retry budget.
    ///
    /// # Errors
    ///
    /// Returns the final error annotated with the attempt count, or the
    /// scope's cancellation/deadline error.
    pub async fn send_with_retry<T: DeserializeOwned>(
        &self,
        scope: &CallScope,
        method: Method,
        path: &str,
        body: RetryBody,
    ) -> Result<Option<T>, ClientError> {
        let mut policy = self.config.retry_policy();
        if !body.is_replayable() {
            policy = policy.without_retries();
        }
        let operation = format!("{method} {path}");

        self.backoff
            .run_with_policy(
                scope,
                &operation,
                policy,
                |_attempt| {
                    let method = method.clone();
                    let body = body.next_body();
                    async move { self.send::<T>(method, path, body?).await }
                },
                is_retryable,
            )
            .await
    }
}

/// Decodes a 2xx body; empty or whitespace-only bodies decode to `None`.
pub(crate) fn decode_body<T: DeserializeOwned>(
    operation: &str,
    bytes: &[u8],
) -> Result<Option<T>, ClientError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }
    serde_json::from_slice(bytes)
        .map(Some)
        .map_err(|e| ClientError::decode(operation, e))
}

/// Reads at most `cap` bytes of a response body. Read errors end the prefix
/// early; the status code is what matters to the caller.
async fn read_capped(response: reqwest::Response, cap: usize) -> Vec<u8> {
    let mut prefix = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(chunk) = stream.next().await {
        match chunk {
            Ok(chunk) => {
                let take = (cap - prefix.len()).min(chunk.len());
                prefix.extend_from_slice(&chunk[..take]);
                if prefix.len() >= cap {
                    break;
                }
            }
            Err(error) => {
                debug!(error = %error, "error body read interrupted");
                break;
            }
        }
    }
    prefix
}
