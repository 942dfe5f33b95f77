//! High-level client.
//!
//! [`ExchangeClient`] ties the pieces together for the two things callers
//! actually do: upload a file (optionally waiting for the import process) and
//! download a bundle into a directory.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Method;
use serde_json::Value;
use tracing::{info, instrument};
use url::Url;

use crate::api::{Backoff, ClientError, RetryBody, Transport};
use crate::config::ClientConfig;
use crate::download::{BundleDownloader, DownloadRequest};
use crate::extract::{ExtractReport, ExtractionPolicy};
use crate::process::{ApiProcessSource, PollPolicy, QueuedProcess, parse_process, poll};
use crate::scope::CallScope;
use crate::upload::{PreparedUpload, UploadSpec};

/// Options for [`ExchangeClient::upload`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UploadOptions {
    /// Wait up to this long for the import process to finish.
    pub poll_budget: Option<Duration>,
}

/// Result of [`ExchangeClient::download`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadOutcome {
    /// Where the bundle was fetched from.
    pub bundle_url: Url,
    /// What was extracted.
    pub report: ExtractReport,
}

/// Client for one project of the file-exchange API.
///
/// Cheap to clone; clones share configuration, the connection pool and the
/// backoff engine.
///
/// # Example
///
/// ```no_run
/// use std::time::Duration;
/// use bundlex_core::{CallScope, ClientConfig, ExchangeClient, UploadOptions, UploadSpec};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = ClientConfig::builder("token", "123.abc").build()?;
/// let client = ExchangeClient::new(config)?;
/// let scope = CallScope::with_timeout(Duration::from_secs(300));
/// let spec = UploadSpec::from_file("locale/en.json").field("lang_iso", "en");
/// let process = client
///     .upload(&scope, &spec, UploadOptions { poll_budget: Some(Duration::from_secs(60)) })
///     .await?;
/// println!("{} is {}", process.id, process.status);
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone)]
pub struct ExchangeClient {
    transport: Transport,
    downloader: BundleDownloader,
}

impl ExchangeClient {
    /// Creates a client.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Config`] if an HTTP client cannot be built.
    pub fn new(config: ClientConfig) -> Result<Self, ClientError> {
        let transport = Transport::new(Arc::new(config))?;
        Self::from_transport(transport)
    }

    /// Creates a client with an explicit backoff engine, e.g. one with
    /// seeded jitter.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Config`] if an HTTP client cannot be built.
    pub fn with_backoff(config: ClientConfig, backoff: Backoff) -> Result<Self, ClientError> {
        let transport = Transport::with_backoff(Arc::new(config), Arc::new(backoff))?;
        Self::from_transport(transport)
    }

    fn from_transport(transport: Transport) -> Result<Self, ClientError> {
        let downloader = BundleDownloader::new(transport.clone())?;
        Ok(Self {
            transport,
            downloader,
        })
    }

    /// Shared configuration.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        self.transport.config()
    }

    /// Underlying API transport.
    #[must_use]
    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// Bundle downloader.
    #[must_use]
    pub fn downloader(&self) -> &BundleDownloader {
        &self.downloader
    }

    /// Uploads a file and returns its import process.
    ///
    /// The spec is validated before any request is made. The body is
    /// streamed, and rebuilt from the source for each retry attempt. With a
    /// poll budget, the import process is polled until it is terminal or the
    /// budget runs out; otherwise it is returned as first reported.
    ///
    /// # Errors
    ///
    /// - [`ClientError::InvalidRequest`] / [`ClientError::Io`] for an
    ///   unusable spec, before any network call
    /// - API and transport errors after retry
    /// - [`ClientError::Cancelled`] / [`ClientError::DeadlineExceeded`]
    #[instrument(skip(self, scope, spec), fields(filename = %spec.filename()))]
    pub async fn upload(
        &self,
        scope: &CallScope,
        spec: &UploadSpec,
        options: UploadOptions,
    ) -> Result<QueuedProcess, ClientError> {
        let prepared = PreparedUpload::prepare(spec).await?;
        let path = format!("projects/{}/files/upload", self.config().project_id());

        let body_scope = scope.clone();
        let body = RetryBody::Factory(Arc::new(move || {
            Ok::<_, ClientError>(prepared.body(&body_scope))
        }));
        let response: Value = self
            .transport
            .send_with_retry(scope, Method::POST, &path, body)
            .await?
            .ok_or_else(|| ClientError::unexpected(format!("POST {path}"), "empty response body"))?;
        let process = parse_process(&response, None)
            .ok_or_else(|| ClientError::unexpected(format!("POST {path}"), "response has no process"))?;
        info!(process_id = %process.id, status = %process.status, "upload accepted");

        match options.poll_budget {
            Some(budget) if !process.status.is_terminal() => {
                let mut polled = self.poll_processes(scope, &[process.id.clone()], budget).await?;
                Ok(polled.pop().unwrap_or(process))
            }
            _ => Ok(process),
        }
    }

    /// Requests an export and returns the validated bundle URL.
    ///
    /// # Errors
    ///
    /// See [`BundleDownloader::fetch_url`].
    pub async fn fetch_bundle_url(&self, scope: &CallScope, request: &DownloadRequest) -> Result<Url, ClientError> {
        self.downloader.fetch_url(scope, request).await
    }

    /// Exports a bundle and extracts it into `destination`.
    ///
    /// # Errors
    ///
    /// See [`BundleDownloader::fetch_url`] and
    /// [`BundleDownloader::download_and_extract`].
    #[instrument(skip(self, scope, request, policy), fields(destination = %destination.display()))]
    pub async fn download(
        &self,
        scope: &CallScope,
        request: &DownloadRequest,
        destination: &Path,
        policy: &ExtractionPolicy,
    ) -> Result<DownloadOutcome, ClientError> {
        let bundle_url = self.downloader.fetch_url(scope, request).await?;
        let report = self
            .downloader
            .download_and_extract(scope, bundle_url.as_str(), destination, policy)
            .await?;
        Ok(DownloadOutcome { bundle_url, report })
    }

    /// Polls processes until each is terminal or `budget` runs out.
    ///
    /// # Errors
    ///
    /// See [`poll`](crate::process::poll).
    pub async fn poll_processes(
        &self,
        scope: &CallScope,
        process_ids: &[String],
        budget: Duration,
    ) -> Result<Vec<QueuedProcess>, ClientError> {
        let source = Arc::new(ApiProcessSource::new(self.transport.clone()));
        poll(source, scope, process_ids, PollPolicy::from_config(self.config(), budget)).await
    }
}
