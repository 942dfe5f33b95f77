//! Structured errors decoded from non-2xx API responses.
//!
//! The service is not consistent about its error body. Several shapes are
//! seen in practice and all of them are folded into one [`ApiError`]:
//!
//! | Shape     | Example                                                   |
//! |-----------|-----------------------------------------------------------|
//! | flat      | `{"message": "...", "statusCode": 400, "error": "Bad"}`   |
//! | nested    | `{"error": {"message": "...", "code": 404, "details": {}}}` |
//! | alternate | `{"message": "...", "code": 4001}` / `errorCode`          |
//! | generic   | any other object; every top-level field kept as details   |
//!
//! Non-JSON bodies keep their trimmed text in [`ApiError::raw`] and carry the
//! reason [`NON_JSON_REASON`].

use serde_json::{Map, Value};

/// Reason attached to errors whose body was not valid JSON.
pub const NON_JSON_REASON: &str = "non_json_body";

/// Maximum characters of body text kept in [`ApiError::raw`].
const RAW_SNIPPET_CHARS: usize = 512;

/// An error response from the remote API.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("API error (HTTP {status}{}): {message}{}", code_suffix(.code), reason_suffix(.reason))]
pub struct ApiError {
    /// HTTP status code.
    pub status: u16,
    /// Service-specific numeric code, when the body carries one.
    pub code: Option<i64>,
    /// Human-readable message.
    pub message: String,
    /// Machine-readable reason, when the body carries one.
    pub reason: Option<String>,
    /// Structured details, when the body carries them.
    pub details: Option<Value>,
    /// Trimmed snippet of the raw body.
    pub raw: String,
}

fn code_suffix(code: &Option<i64>) -> String {
    code.map(|c| format!(", code {c}")).unwrap_or_default()
}

fn reason_suffix(reason: &Option<String>) -> String {
    reason.as_ref().map(|r| format!(" [{r}]")).unwrap_or_default()
}


impl ApiError {
    /// Builds an error carrying only a status and message.
    pub fn new(status: u16, message: impl Into<String>) -> Self {
        Self {
            status,
            code: None,
            message: message.into(),
            reason: None,
            details: None,
            raw: String::new(),
        }
    }

    /// Parses a (possibly truncated) response body into an [`ApiError`].
    ///
    /// Never fails: unknown shapes fall back to a generic error that keeps
    /// the whole body.
    #[must_use]
    pub fn from_body(status: u16, body: &[u8]) -> Self {
        let text = String::from_utf8_lossy(body);
        let trimmed = text.trim();
        let raw = snippet(trimmed);

        if trimmed.is_empty() {
            return Self {
                raw,
                ..Self::new(status, default_message(status))
            };
        }

        let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
            return Self {
                status,
                code: None,
                message: default_message(status),
                reason: Some(NON_JSON_REASON.to_string()),
                details: None,
                raw,
            };
        };

        let mut error = match value {
            Value::Object(map) => from_object(status, map),
            other => Self {
                details: Some(other),
                ..Self::new(status, default_message(status))
            },
        };
        error.raw = raw;
        error
    }

    /// Returns `true` for status codes worth retrying.
    #[must_use]
    pub fn is_retryable_status(&self) -> bool {
        matches!(self.status, 408 | 425 | 429 | 500 | 502 | 503 | 504)
    }
}

fn from_object(status: u16, map: Map<String, Value>) -> ApiError {
    // nested: {"error": {"message", "code", "details"}}
    if let Some(Value::Object(inner)) = map.get("error") {
        if let Some(message) = string_field(inner, "message") {
            return ApiError {
                status,
                code: int_field(inner, "code"),
                message,
                reason: string_field(inner, "reason"),
                details: inner.get("details").cloned(),
                raw: String::new(),
            };
        }
    }

    if let Some(message) = string_field(&map, "message") {
        // flat: {"message", "statusCode", "error"}
        if map.contains_key("statusCode") || map.get("error").is_some_and(Value::is_string) {
            return ApiError {
                status,
                code: int_field(&map, "statusCode"),
                message,
                reason: string_field(&map, "error"),
                details: map.get("details").cloned(),
                raw: String::new(),
            };
        }
        // alternate: {"message", "code" | "errorCode"}
        if map.contains_key("code") || map.contains_key("errorCode") {
            return ApiError {
                status,
                code: int_field(&map, "code").or_else(|| int_field(&map, "errorCode")),
                message,
                reason: string_field(&map, "reason"),
                details: map.get("details").cloned(),
                raw: String::new(),
            };
        }
    }

    let message = string_field(&map, "message")
        .or_else(|| string_field(&map, "error"))
        .unwrap_or_else(|| default_message(status));
    ApiError {
        status,
        code: None,
        message,
        reason: None,
        details: Some(Value::Object(map)),
        raw: String::new(),
    }
}

fn string_field(map: &Map<String, Value>, key: &str) -> Option<String> {
    map.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(ToString::to_string)
}

/// Reads an integer that may arrive as a number or a numeric string.
fn int_field(map: &Map<String, Value>, key: &str) -> Option<i64> {
    match map.get(key)? {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn default_message(status: u16) -> String {
    reqwest::StatusCode::from_u16(status)
        .ok()
        .and_then(|s| s.canonical_reason())
        .map_or_else(|| format!("HTTP {status}"), ToString::to_string)
}

fn snippet(text: &str) -> String {
    text.chars().take(RAW_SNIPPET_CHARS).collect()
}
