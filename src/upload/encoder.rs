//! Streaming JSON encoder for upload bodies.
//!
//! The request body is `{<fields>, "filename": "...", "data": "<base64>"}`
//! with `data` always last. Only the part before `data` is built up front;
//! the payload itself is produced by a writer task that base64-encodes the
//! source chunk by chunk into a bounded channel. The HTTP client reading the
//! other end provides the backpressure, so a large file is never held in
//! memory whole.
//!
//! Pre-encoded payloads are validated in [`PreparedUpload::prepare`], before
//! any request is made.

use std::io;
use std::path::{Path, PathBuf};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::{Bytes, BytesMut};
use futures_util::Stream;
use serde_json::Value;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{DATA_FIELD, FILENAME_FIELD, UploadData, UploadSpec};
use crate::api::ClientError;
use crate::scope::CallScope;

/// Raw bytes read per chunk. A multiple of 3 so chunks encode without padding.
const RAW_CHUNK: usize = 48 * 1024;

/// Encoded bytes per chunk when replaying pre-encoded content.
const ENCODED_CHUNK: usize = 64 * 1024;

/// Chunks buffered between the writer task and the HTTP body.
const CHANNEL_DEPTH: usize = 4;

const BODY_SUFFIX: &[u8] = b"\"}";

/// Message carried by the IO error that ends a cancelled upload stream.
pub const UPLOAD_CANCELLED: &str = "upload cancelled";

#[derive(Debug, Clone)]
enum Payload {
    File(PathBuf),
    Encoded(Bytes),
    Raw(Bytes),
}

/// An upload whose body can be streamed any number of times.
///
/// Cloning is cheap; each call to [`stream`](Self::stream) or
/// [`body`](Self::body) starts a fresh writer task.
#[derive(Debug, Clone)]
pub struct PreparedUpload {
    filename: String,
    head: Bytes,
    payload: Payload,
}

impl PreparedUpload {
    /// Validates `spec` and precomputes the JSON preceding the payload.
    ///
    /// # Errors
    ///
    /// - [`ClientError::InvalidRequest`] if pre-encoded data is not strict
    ///   base64 (standard alphabet, correct padding) or the fields cannot be
    ///   serialized.
    /// - [`ClientError::Io`] if the source file is missing or not a file.
    pub async fn prepare(spec: &UploadSpec) -> Result<Self, ClientError> {
        let payload = match spec.data() {
            UploadData::Base64(encoded) => {
                let encoded = encoded.trim();
                STANDARD.decode(encoded).map_err(|e| {
                    ClientError::invalid_request(format!(
                        "`data` for {} is not valid base64: {e}",
                        spec.filename()
                    ))
                })?;
                Payload::Encoded(Bytes::copy_from_slice(encoded.as_bytes()))
            }
            UploadData::Bytes(bytes) => Payload::Raw(bytes.clone()),
            UploadData::File(path) => {
                let metadata = tokio::fs::metadata(path)
                    .await
                    .map_err(|e| ClientError::io(path.clone(), e))?;
                if !metadata.is_file() {
                    return Err(ClientError::io(
                        path.clone(),
                        io::Error::new(io::ErrorKind::InvalidInput, "upload source is not a regular file"),
                    ));
                }
                Payload::File(path.clone())
            }
        };

        Ok(Self {
            filename: spec.filename().to_string(),
            head: body_head(spec)?,
            payload,
        })
    }

    /// Remote file name.
    #[must_use]
    pub fn filename(&self) -> &str {
        &self.filename
    }

    /// Wraps a fresh stream as an HTTP request body.
    #[must_use]
    pub fn body(&self, scope: &CallScope) -> reqwest::Body {
        reqwest::Body::wrap_stream(self.stream(scope))
    }

    /// Starts a writer task and returns the body as a stream of chunks.
    ///
    /// The stream ends with an IO error if the source cannot be read, or with
    /// an [`UPLOAD_CANCELLED`] error once `scope` is cancelled.
    pub fn stream(&self, scope: &CallScope) -> impl Stream<Item = io::Result<Bytes>> + Send + 'static {
        let (tx, rx) = mpsc::channel(CHANNEL_DEPTH);
        let token = scope.token().clone();
        tokio::spawn(produce(self.clone(), tx, token.clone()));

        let pipe = Pipe {
            rx,
            token,
            done: false,
        };
        futures_util::stream::unfold(pipe, |mut pipe| async move {
            let item = pipe.next_chunk().await?;
            Some((item, pipe))
        })
    }
}

/// Serializes every field except `data`, leaving the object open for it.
fn body_head(spec: &UploadSpec) -> Result<Bytes, ClientError> {
    let mut fields = spec.fields().clone();
    fields.remove(DATA_FIELD);
    fields.insert(FILENAME_FIELD.to_string(), Value::String(spec.filename().to_string()));

    let object = serde_json::to_vec(&Value::Object(fields))
        .map_err(|e| ClientError::invalid_request(format!("upload fields are not serializable: {e}")))?;

    // `object` always ends with '}' and holds at least `filename`.
    let mut head = BytesMut::with_capacity(object.len() + DATA_FIELD.len() + 5);
    head.extend_from_slice(&object[..object.len() - 1]);
    head.extend_from_slice(b",\"");
    head.extend_from_slice(DATA_FIELD.as_bytes());
    head.extend_from_slice(b"\":\"");
    Ok(head.freeze())
}

/// Consumer side of the writer channel.
struct Pipe {
    rx: mpsc::Receiver<io::Result<Bytes>>,
    token: CancellationToken,
    done: bool,
}

impl Pipe {
    async fn next_chunk(&mut self) -> Option<io::Result<Bytes>> {
        if self.done {
            return None;
        }
        let item = tokio::select! {
            biased;
            () = self.token.cancelled() => Some(Err(cancelled())),
            item = self.rx.recv() => item,
        };
        if !matches!(item, Some(Ok(_))) {
            self.done = true;
        }
        item
    }
}

/// Writer task: emits head, payload and suffix, or the first error.
async fn produce(upload: PreparedUpload, tx: mpsc::Sender<io::Result<Bytes>>, token: CancellationToken) {
    let result = write_body(&upload, &tx, &token).await;
    if let Err(error) = result {
        if token.is_cancelled() {
            debug!(filename = %upload.filename, "upload stream cancelled");
            return;
        }
        debug!(filename = %upload.filename, error = %error, "upload stream failed");
        // The receiver may already be gone; nothing else to report to.
        let _ = tx.send(Err(error)).await;
    }
}

async fn write_body(
    upload: &PreparedUpload,
    tx: &mpsc::Sender<io::Result<Bytes>>,
    token: &CancellationToken,
) -> io::Result<()> {
    emit(tx, token, upload.head.clone()).await?;

    match &upload.payload {
        Payload::Encoded(encoded) => {
            let mut offset = 0;
            while offset < encoded.len() {
                let end = (offset + ENCODED_CHUNK).min(encoded.len());
                emit(tx, token, encoded.slice(offset..end)).await?;
                offset = end;
            }
        }
        Payload::Raw(raw) => {
            for chunk in raw.chunks(RAW_CHUNK) {
                emit(tx, token, Bytes::from(STANDARD.encode(chunk))).await?;
            }
        }
        Payload::File(path) => encode_file(path, tx, token).await?,
    }

    emit(tx, token, Bytes::from_static(BODY_SUFFIX)).await
}

/// Streams a file through the encoder, carrying up to two leftover bytes
/// between reads so padding only appears at the very end.
async fn encode_file(
    path: &Path,
    tx: &mpsc::Sender<io::Result<Bytes>>,
    token: &CancellationToken,
) -> io::Result<()> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut buf = vec![0u8; RAW_CHUNK];
    let mut carry: Vec<u8> = Vec::with_capacity(2);
    let mut total: u64 = 0;

    loop {
        let read = tokio::select! {
            () = token.cancelled() => return Err(cancelled()),
            read = file.read(&mut buf) => read?,
        };
        if read == 0 {
            break;
        }
        total += read as u64;

        let mut block = std::mem::take(&mut carry);
        block.extend_from_slice(&buf[..read]);
        let whole = block.len() - block.len() % 3;
        carry = block.split_off(whole);
        if !block.is_empty() {
            emit(tx, token, Bytes::from(STANDARD.encode(&block))).await?;
        }
    }

    if !carry.is_empty() {
        emit(tx, token, Bytes::from(STANDARD.encode(&carry))).await?;
    }
    debug!(path = %path.display(), bytes = total, "upload file encoded");
    Ok(())
}

async fn emit(
    tx: &mpsc::Sender<io::Result<Bytes>>,
    token: &CancellationToken,
    chunk: Bytes,
) -> io::Result<()> {
    tokio::select! {
        () = token.cancelled() => Err(cancelled()),
        sent = tx.send(Ok(chunk)) => sent.map_err(|_| {
            io::Error::new(io::ErrorKind::BrokenPipe, "upload body reader dropped")
        }),
    }
}

fn cancelled() -> io::Error {
    io::Error::new(io::ErrorKind::Interrupted, UPLOAD_CANCELLED)
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::io::Write;

    use futures_util::StreamExt;
    use serde_json::json;

    use super::*;

    async fn collect(upload: &PreparedUpload) -> Value {
        let scope = CallScope::new();
        let mut stream = Box::pin(upload.stream(&scope));
        let mut body = Vec::new();
        while let Some(chunk) = stream.next().await {
            body.extend_from_slice(&chunk.unwrap());
        }
        serde_json::from_slice(&body).unwrap()
    }

    fn decode(body: &Value) -> Vec<u8> {
        STANDARD.decode(body["data"].as_str().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn test_file_payload_round_trips_across_chunks() {
        let content: Vec<u8> = (0..(RAW_CHUNK * 2 + 7)).map(|i| (i % 251) as u8).collect();
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&content).unwrap();

        let spec = UploadSpec::from_file(file.path())
            .field("lang_iso", "en")
            .field("tags", json!(["ci"]));
        let upload = PreparedUpload::prepare(&spec).await.unwrap();
        let body = collect(&upload).await;

        assert_eq!(body["lang_iso"], "en");
        assert_eq!(body["tags"], json!(["ci"]));
        assert_eq!(body["filename"], file.path().to_string_lossy().as_ref());
        assert_eq!(decode(&body), content);
    }

    #[tokio::test]
    async fn test_data_is_last_field() {
        let spec = UploadSpec::with_data("en.json", UploadData::Bytes(Bytes::from_static(b"{}")))
            .field("zzz", 1);
        let upload = PreparedUpload::prepare(&spec).await.unwrap();

        let scope = CallScope::new();
        let chunks: Vec<Bytes> = upload
            .stream(&scope)
            .map(Result::unwrap)
            .collect()
            .await;
        let text = String::from_utf8(chunks.concat()).unwrap();

        assert!(text.ends_with(r#""data":"e30="}"#), "{text}");
    }

    #[tokio::test]
    async fn test_pre_encoded_payload_passed_through() {
        let spec = UploadSpec::with_data("en.json", UploadData::Base64(" aGVsbG8= ".into()));
        let upload = PreparedUpload::prepare(&spec).await.unwrap();
        let body = collect(&upload).await;
        assert_eq!(body["data"], "aGVsbG8=");
        assert_eq!(decode(&body), b"hello");
    }

    #[test]
    fn test_malformed_base64_rejected_up_front() {
        for bad in ["aGVsbG8", "aGVs*G8=", "aGVsbG8=="] {
            let spec = UploadSpec::with_data("en.json", UploadData::Base64(bad.into()));
            let result = tokio_test::block_on(PreparedUpload::prepare(&spec));
            assert!(
                matches!(result, Err(ClientError::InvalidRequest { .. })),
                "{bad} should be rejected"
            );
        }
    }

    #[tokio::test]
    async fn test_missing_file_rejected_up_front() {
        let dir = tempfile::tempdir().unwrap();
        let spec = UploadSpec::from_file(dir.path().join("absent.json"));
        assert!(matches!(PreparedUpload::prepare(&spec).await, Err(ClientError::Io { .. })));

        let spec = UploadSpec::from_file(dir.path());
        assert!(matches!(PreparedUpload::prepare(&spec).await, Err(ClientError::Io { .. })));
    }

    #[tokio::test]
    async fn test_stream_can_be_replayed() {
        let spec = UploadSpec::with_data("a.json", UploadData::Bytes(Bytes::from_static(b"abc")));
        let upload = PreparedUpload::prepare(&spec).await.unwrap();
        assert_eq!(collect(&upload).await, collect(&upload).await);
    }

    #[tokio::test]
    async fn test_cancellation_aborts_stream() {
        let spec = UploadSpec::with_data("big.bin", UploadData::Bytes(Bytes::from(vec![7u8; RAW_CHUNK * 32])));
        let upload = PreparedUpload::prepare(&spec).await.unwrap();
        let scope = CallScope::new();
        let mut stream = Box::pin(upload.stream(&scope));

        assert!(stream.next().await.unwrap().is_ok());
        scope.cancel();

        let error = stream.next().await.unwrap().unwrap_err();
        assert_eq!(error.kind(), io::ErrorKind::Interrupted);
        assert_eq!(error.to_string(), UPLOAD_CANCELLED);
        assert!(stream.next().await.is_none());
    }
}
