//! Bundle export and archive download.
//!
//! Exporting a bundle is a two-step pipeline:
//!
//! 1. [`BundleDownloader::fetch_url`] asks the API for a bundle, either
//!    synchronously (the response carries the URL) or asynchronously (the
//!    response carries a process id, which is polled until it finishes).
//! 2. [`BundleDownloader::download_and_extract`] validates the URL, fetches
//!    the archive with retry, and unpacks it with the safe extractor.
//!
//! Archive fetches use a separate HTTP client that never sends the API token
//! and only follows redirects that pass the [`UrlGuard`].

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use reqwest::{Client, Method, redirect};
use serde_json::{Map, Value};
use tokio::io::{AsyncWriteExt, BufWriter};
use tracing::{debug, info, instrument};
use url::Url;

use super::url_guard::redact;
use super::{UrlGuard, UrlGuardError};
use crate::api::constants::{CONNECT_TIMEOUT, ERROR_BODY_CAP};
use crate::api::{ApiError, ClientError, RetryBody, Transport, is_retryable};
use crate::config::ConfigError;
use crate::extract::{ExtractReport, ExtractionPolicy, extract_archive_cancellable};
use crate::process::{ApiProcessSource, PollPolicy, ProcessStatus, poll};
use crate::scope::CallScope;

/// Redirect hops followed for one archive fetch.
const MAX_REDIRECTS: usize = 10;

/// File name of the archive inside the download work directory.
const ARCHIVE_NAME: &str = "bundle.zip";

/// How the export is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadMode {
    /// The export response carries the bundle URL.
    Sync,
    /// The export runs as a server-side process polled for up to `poll_budget`.
    Async {
        /// Wall-clock budget for polling the export process.
        poll_budget: Duration,
    },
}

/// One bundle export request.
#[derive(Debug, Clone, PartialEq)]
pub struct DownloadRequest {
    params: Map<String, Value>,
    mode: DownloadMode,
}

impl DownloadRequest {
    /// Creates a synchronous request with the given export parameters.
    #[must_use]
    pub fn new(params: Map<String, Value>) -> Self {
        Self {
            params,
            mode: DownloadMode::Sync,
        }
    }

    /// Switches to the asynchronous flow.
    #[must_use]
    pub fn asynchronous(mut self, poll_budget: Duration) -> Self {
        self.mode = DownloadMode::Async { poll_budget };
        self
    }

    /// Export parameters sent verbatim.
    #[must_use]
    pub fn params(&self) -> &Map<String, Value> {
        &self.params
    }

    /// Selected flow.
    #[must_use]
    pub fn mode(&self) -> DownloadMode {
        self.mode
    }
}

/// Exports bundles and downloads them.
#[derive(Debug, Clone)]
pub struct BundleDownloader {
    transport: Transport,
    cdn: Client,
    guard: UrlGuard,
}

impl BundleDownloader {
    /// Builds a downloader on top of an API transport.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Config`] if the archive HTTP client cannot be built.
    pub fn new(transport: Transport) -> Result<Self, ClientError> {
        let guard = *transport.config().url_guard();
        let mut builder = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .gzip(false)
            .user_agent(transport.config().user_agent())
            .redirect(guarded_redirects(guard));
        if let Some(timeout) = transport.config().http_timeout() {
            builder = builder.timeout(timeout);
        }
        let cdn = builder
            .build()
            .map_err(|source| ConfigError::HttpClient { source })?;
        Ok(Self {
            transport,
            cdn,
            guard,
        })
    }

    /// Requests an export and returns the validated bundle URL.
    ///
    /// # Errors
    ///
    /// - API and transport errors from the export call (after retry)
    /// - [`ClientError::Process`] when the export process fails, finishes
    ///   without a URL, or is still pending when the poll budget runs out
    /// - [`ClientError::UrlRejected`] when the URL fails validation
    #[instrument(skip(self, scope, request), fields(mode = ?request.mode()))]
    pub async fn fetch_url(&self, scope: &CallScope, request: &DownloadRequest) -> Result<Url, ClientError> {
        let project = self.transport.config().project_id();
        match request.mode() {
            DownloadMode::Sync => {
                let path = format!("projects/{project}/files/download");
                let body = self.post(scope, &path, request.params()).await?;
                let bundle_url = string_field(&body, "bundle_url")
                    .ok_or_else(|| ClientError::unexpected(format!("POST {path}"), "response has no bundle_url"))?;
                Ok(self.guard.validate(&bundle_url)?)
            }
            DownloadMode::Async { poll_budget } => {
                let path = format!("projects/{project}/files/async-download");
                let body = self.post(scope, &path, request.params()).await?;
                let process_id = string_field(&body, "process_id")
                    .ok_or_else(|| ClientError::unexpected(format!("POST {path}"), "response has no process_id"))?;
                info!(process_id = %process_id, "export queued");
                self.await_export(scope, &process_id, poll_budget).await
            }
        }
    }

    async fn post(&self, scope: &CallScope, path: &str, params: &Map<String, Value>) -> Result<Value, ClientError> {
        let body = RetryBody::json(params)?;
        self.transport
            .send_with_retry::<Value>(scope, Method::POST, path, body)
            .await?
            .ok_or_else(|| ClientError::unexpected(format!("POST {path}"), "empty response body"))
    }

    async fn await_export(&self, scope: &CallScope, process_id: &str, budget: Duration) -> Result<Url, ClientError> {
        let source = Arc::new(ApiProcessSource::new(self.transport.clone()));
        let policy = PollPolicy::from_config(self.transport.config(), budget);
        let ids = [process_id.to_string()];
        let results = poll(source, scope, &ids, policy).await?;

        let Some(process) = results.into_iter().next() else {
            return Err(ClientError::process(process_id, ProcessStatus::Queued.as_str(), "no status returned"));
        };
        match (process.status, process.result_url) {
            (ProcessStatus::Finished, Some(url)) => Ok(self.guard.validate(&url)?),
            (ProcessStatus::Finished, None) => Err(ClientError::process(
                &process.id,
                process.status.as_str(),
                "finished without a download URL",
            )),
            (ProcessStatus::Failed, _) => Err(ClientError::process(
                &process.id,
                process.status.as_str(),
                "export process failed",
            )),
            (ProcessStatus::Queued, _) => Err(ClientError::process(
                &process.id,
                process.status.as_str(),
                format!("export did not finish within {budget:?}"),
            )),
        }
    }

    /// Downloads the archive at `url` to `destination` with retry.
    ///
    /// Each attempt writes to a fresh temporary file next to `destination`,
    /// checks the byte count against any declared content length, and opens
    /// the result as a ZIP archive. Only a complete, readable archive is
    /// renamed into place.
    ///
    /// # Errors
    ///
    /// Returns the last attempt's error annotated with the attempt count, or
    /// [`ClientError::UrlRejected`] if `url` fails validation.
    #[instrument(skip(self, scope, url), fields(url = %redact(url)))]
    pub async fn download_archive(&self, scope: &CallScope, url: &Url, destination: &Path) -> Result<u64, ClientError> {
        self.guard.check(url)?;
        self.transport
            .backoff()
            .run(
                scope,
                "download bundle",
                |_attempt| self.download_once(url, destination),
                is_retryable,
            )
            .await
    }

    async fn download_once(&self, url: &Url, destination: &Path) -> Result<u64, ClientError> {
        let shown = redact(url);
        let operation = format!("GET {shown}");
        let response = self
            .cdn
            .get(url.clone())
            .send()
            .await
            .map_err(|e| map_fetch_error(&operation, e))?;

        let status = response.status();
        if !status.is_success() {
            let prefix = read_capped(response).await;
            return Err(ApiError::from_body(status.as_u16(), &prefix).into());
        }
        let expected = response.content_length();

        let dir = destination.parent().unwrap_or_else(|| Path::new("."));
        let temp = tempfile::Builder::new()
            .prefix(".bundle-")
            .suffix(".part")
            .tempfile_in(dir)
            .map_err(|e| ClientError::io(dir, e))?;
        let (file, temp_path) = temp.into_parts();
        let mut writer = BufWriter::new(tokio::fs::File::from_std(file));

        let mut stream = response.bytes_stream();
        let mut received: u64 = 0;
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| ClientError::network(operation.clone(), e.without_url()))?;
            writer
                .write_all(&chunk)
                .await
                .map_err(|e| ClientError::io(temp_path.to_path_buf(), e))?;
            received += chunk.len() as u64;
        }
        writer
            .flush()
            .await
            .map_err(|e| ClientError::io(temp_path.to_path_buf(), e))?;
        drop(writer);

        if let Some(expected) = expected {
            if expected != received {
                return Err(ClientError::incomplete_download(shown, expected, received));
            }
        }

        let check_path = temp_path.to_path_buf();
        let checked = tokio::task::spawn_blocking(move || validate_zip(&check_path))
            .await
            .map_err(|e| ClientError::invalid_archive(shown.clone(), format!("validation task failed: {e}")))?;
        checked.map_err(|reason| ClientError::invalid_archive(shown, reason))?;

        temp_path
            .persist(destination)
            .map_err(|e| ClientError::io(destination, e.error))?;
        debug!(bytes = received, path = %destination.display(), "archive downloaded");
        Ok(received)
    }

    /// Validates `url`, downloads the archive and extracts it into `destination`.
    ///
    /// The archive is kept in a temporary work directory that is removed
    /// afterwards.
    ///
    /// # Errors
    ///
    /// URL, download and extraction errors; see
    /// [`download_archive`](Self::download_archive) and
    /// [`extract_archive`](crate::extract::extract_archive).
    #[instrument(skip(self, scope, url, policy), fields(url = tracing::field::Empty, destination = %destination.display()))]
    pub async fn download_and_extract(
        &self,
        scope: &CallScope,
        url: &str,
        destination: &Path,
        policy: &ExtractionPolicy,
    ) -> Result<ExtractReport, ClientError> {
        let url = self.guard.validate(url)?;
        tracing::Span::current().record("url", redact(&url).as_str());
        let workdir = tempfile::Builder::new()
            .prefix("bundlex-")
            .tempdir()
            .map_err(|e| ClientError::io(std::env::temp_dir(), e))?;
        let archive = workdir.path().join(ARCHIVE_NAME);

        let bytes = self.download_archive(scope, &url, &archive).await?;
        info!(bytes, "bundle downloaded, extracting");

        let destination: PathBuf = destination.to_path_buf();
        let policy = *policy;
        let cancel = scope.token().child_token();
        let worker_cancel = cancel.clone();
        let extracted = scope
            .run(async move {
                tokio::task::spawn_blocking(move || {
                    extract_archive_cancellable(&archive, &destination, &policy, &worker_cancel)
                })
                .await
                .map_err(|e| ClientError::unexpected("extract bundle", format!("extraction task failed: {e}")))?
                .map_err(ClientError::from)
            })
            .await;
        // a deadline abandons the task without cancelling the caller's token
        cancel.cancel();
        let report = extracted?;
        drop(workdir);
        Ok(report)
    }
}

/// Only follows redirects whose target passes the guard.
fn guarded_redirects(guard: UrlGuard) -> redirect::Policy {
    redirect::Policy::custom(move |attempt| {
        if attempt.previous().len() >= MAX_REDIRECTS {
            return attempt.error("too many redirects");
        }
        match guard.check(attempt.url()) {
            Ok(()) => attempt.follow(),
            Err(rejected) => attempt.error(rejected),
        }
    })
}

/// Surfaces a redirect refused by the guard as a URL rejection. Other
/// errors drop the request URL, which may carry a signed query.
fn map_fetch_error(operation: &str, error: reqwest::Error) -> ClientError {
    if error.is_redirect() {
        let mut source = std::error::Error::source(&error);
        while let Some(cause) = source {
            if let Some(rejected) = cause.downcast_ref::<UrlGuardError>() {
                return ClientError::UrlRejected(rejected.clone());
            }
            source = cause.source();
        }
    }
    ClientError::network(operation, error.without_url())
}

fn validate_zip(path: &Path) -> Result<(), String> {
    let file = std::fs::File::open(path).map_err(|e| e.to_string())?;
    zip::ZipArchive::new(file).map(|_| ()).map_err(|e| e.to_string())
}

async fn read_capped(response: reqwest::Response) -> Vec<u8> {
    let mut prefix = Vec::new();
    let mut stream = response.bytes_stream();
    while let Some(Ok(chunk)) = stream.next().await {
        let take = (ERROR_BODY_CAP - prefix.len()).min(chunk.len());
        prefix.extend_from_slice(&chunk[..take]);
        if prefix.len() >= ERROR_BODY_CAP {
            break;
        }
    }
    prefix
}

fn string_field(body: &Value, key: &str) -> Option<String> {
    body.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_validate_zip_rejects_garbage() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"PK\x03\x04 definitely not a zip").unwrap();
        assert!(validate_zip(file.path()).is_err());
    }

    #[test]
    fn test_validate_zip_accepts_empty_archive() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let writer = zip::ZipWriter::new(file.reopen().unwrap());
        writer.finish().unwrap();
        assert!(validate_zip(file.path()).is_ok());
    }

    #[test]
    fn test_request_modes() {
        let request = DownloadRequest::new(Map::new());
        assert_eq!(request.mode(), DownloadMode::Sync);
        let request = request.asynchronous(Duration::from_secs(30));
        assert_eq!(
            request.mode(),
            DownloadMode::Async {
                poll_budget: Duration::from_secs(30)
            }
        );
    }
}
