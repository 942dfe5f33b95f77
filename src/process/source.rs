//! Where process status comes from.
//!
//! The poller talks to a [`ProcessStatusSource`] rather than to HTTP
//! directly, so the polling discipline can be exercised without a server.
//! [`ApiProcessSource`] is the production implementation.

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value;

use super::{ProcessStatus, QueuedProcess};
use crate::api::{ClientError, Transport};
use crate::scope::CallScope;

/// Fetches the current status of one process.
#[async_trait]
pub trait ProcessStatusSource: Send + Sync {
    /// Queries `process_id` once. No retries: the poller decides what to do
    /// with failures.
    async fn fetch_status(
        &self,
        scope: &CallScope,
        process_id: &str,
    ) -> Result<QueuedProcess, ClientError>;
}

/// Status source backed by the processes endpoint.
#[derive(Debug, Clone)]
pub struct ApiProcessSource {
    transport: Transport,
}

impl ApiProcessSource {
    /// Wraps a transport.
    #[must_use]
    pub fn new(transport: Transport) -> Self {
        Self { transport }
    }
}

#[async_trait]
impl ProcessStatusSource for ApiProcessSource {
    async fn fetch_status(
        &self,
        scope: &CallScope,
        process_id: &str,
    ) -> Result<QueuedProcess, ClientError> {
        let path = format!(
            "projects/{}/processes/{}",
            path_segment(self.transport.config().project_id()),
            path_segment(process_id)
        );
        let body: Option<Value> = scope
            .run(self.transport.send(Method::GET, &path, None))
            .await?;
        let body = body.ok_or_else(|| ClientError::unexpected(format!("GET {path}"), "empty body"))?;
        parse_process(&body, Some(process_id))
            .ok_or_else(|| ClientError::unexpected(format!("GET {path}"), "response has no process status"))
    }
}

/// Normalizes a process object from any of the shapes the API returns.
///
/// Accepts `{"process": {...}}` or a flat object; the id may be `process_id`
/// or `id`; the result URL may be `details.download_url`, `download_url` or
/// `url`. `fallback_id` is used when the body omits the id.
#[must_use]
pub fn parse_process(body: &Value, fallback_id: Option<&str>) -> Option<QueuedProcess> {
    let process = body.get("process").filter(|p| p.is_object()).unwrap_or(body);
    if !process.is_object() {
        return None;
    }

    let id = string_at(process, &["process_id"])
        .or_else(|| string_at(process, &["id"]))
        .or_else(|| fallback_id.map(ToString::to_string))
        .filter(|id| !id.is_empty())?;

    let status = string_at(process, &["status"])
        .map_or(ProcessStatus::Queued, |raw| ProcessStatus::from_server(&raw));

    let result_url = if status == ProcessStatus::Finished {
        string_at(process, &["details", "download_url"])
            .or_else(|| string_at(process, &["download_url"]))
            .or_else(|| string_at(process, &["url"]))
    } else {
        None
    };

    Some(QueuedProcess {
        id,
        status,
        result_url,
    })
}

fn string_at(value: &Value, path: &[&str]) -> Option<String> {
    let mut current = value;
    for key in path {
        current = current.get(key)?;
    }
    match current {
        Value::String(s) => Some(s.trim().to_string()).filter(|s| !s.is_empty()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Percent-encodes one path segment.
fn path_segment(raw: &str) -> String {
    url::form_urlencoded::byte_serialize(raw.as_bytes())
        .collect::<String>()
        .replace('+', "%20")
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_parse_wrapped_process() {
        let body = json!({
            "project_id": "p",
            "process": {
                "process_id": "abc",
                "type": "file-import",
                "status": "finished",
                "details": {"download_url": "https://cdn.example.com/b.zip"}
            }
        });
        let process = parse_process(&body, None).unwrap();
        assert_eq!(process.id, "abc");
        assert_eq!(process.status, ProcessStatus::Finished);
        assert_eq!(process.result_url.as_deref(), Some("https://cdn.example.com/b.zip"));
    }

    #[test]
    fn test_parse_flat_process_with_fallback_id() {
        let body = json!({"status": "running"});
        let process = parse_process(&body, Some("xyz")).unwrap();
        assert_eq!(process, QueuedProcess::queued("xyz"));
    }

    #[test]
    fn test_result_url_ignored_until_finished() {
        let body = json!({"id": 17, "status": "queued", "url": "https://cdn.example.com/x"});
        let process = parse_process(&body, None).unwrap();
        assert_eq!(process.id, "17");
        assert!(process.result_url.is_none());
    }

    #[test]
    fn test_parse_rejects_non_object() {
        assert!(parse_process(&json!("finished"), Some("a")).is_none());
        assert!(parse_process(&json!({"status": "queued"}), None).is_none());
    }

    #[test]
    fn test_path_segment_encoding() {
        assert_eq!(path_segment("a b/c"), "a%20b%2Fc");
        assert_eq!(path_segment("123.abc"), "123.abc");
    }
}
