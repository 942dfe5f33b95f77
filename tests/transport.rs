//! Integration tests for the authenticated transport and its retry behavior.

mod support;

use bundlex_core::CallScope;
use bundlex_core::api::RetryBody;
use reqwest::Method;
use serde_json::{Value, json};
use wiremock::matchers::{body_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use support::{TOKEN, client, project_path};

#[tokio::test]
async fn test_request_carries_token_and_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(project_path("ping")))
        .and(header("X-Api-Token", TOKEN))
        .and(header("Accept", "application/json"))
        .and(body_json(json!({"a": 1})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server.uri());
    let scope = CallScope::new();
    let body = RetryBody::json(&json!({"a": 1})).expect("serializable");
    let response: Option<Value> = client
        .transport()
        .send_with_retry(&scope, Method::POST, "projects/123.abc/ping", body)
        .await
        .expect("request succeeds");

    assert_eq!(response, Some(json!({"ok": true})));
}

#[tokio::test]
async fn test_transient_status_is_retried_until_success() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(project_path("flaky")))
        .respond_with(ResponseTemplate::new(503).set_body_string("upstream down"))
        .up_to_n_times(2)
        .expect(2)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(project_path("flaky")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server.uri());
    let response: Option<Value> = client
        .transport()
        .send_with_retry(&CallScope::new(), Method::GET, "projects/123.abc/flaky", RetryBody::Empty)
        .await
        .expect("third attempt succeeds");

    assert_eq!(response, Some(json!({"ok": true})));
}

#[tokio::test]
async fn test_client_error_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(project_path("bad")))
        .respond_with(ResponseTemplate::new(400).set_body_json(json!({
            "error": {"message": "Invalid `format` parameter", "code": 400, "details": {"format": "xyz"}}
        })))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server.uri());
    let error = client
        .transport()
        .send_with_retry::<Value>(&CallScope::new(), Method::GET, "projects/123.abc/bad", RetryBody::Empty)
        .await
        .expect_err("400 is permanent");

    assert_eq!(error.attempts(), Some(1));
    let api = error.api_error().expect("API error at the root");
    assert_eq!(api.status, 400);
    assert_eq!(api.code, Some(400));
    assert_eq!(api.message, "Invalid `format` parameter");
    assert_eq!(api.details, Some(json!({"format": "xyz"})));
}

#[tokio::test]
async fn test_retries_exhausted_reports_attempts() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(project_path("down")))
        .respond_with(ResponseTemplate::new(500).set_body_string("<html>oops</html>"))
        .expect(4)
        .mount(&server)
        .await;

    let client = client(&server.uri());
    let error = client
        .transport()
        .send_with_retry::<Value>(&CallScope::new(), Method::GET, "projects/123.abc/down", RetryBody::Empty)
        .await
        .expect_err("always 500");

    assert_eq!(error.attempts(), Some(4));
    let api = error.api_error().expect("API error at the root");
    assert_eq!(api.status, 500);
    assert_eq!(api.reason.as_deref(), Some(bundlex_core::api::NON_JSON_REASON));
    assert_eq!(api.raw, "<html>oops</html>");
}

#[tokio::test]
async fn test_truncated_success_body_is_retried() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(project_path("cut")))
        .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"ok": tr"#))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(project_path("cut")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"ok": true})))
        .mount(&server)
        .await;

    let client = client(&server.uri());
    let response: Option<Value> = client
        .transport()
        .send_with_retry(&CallScope::new(), Method::GET, "projects/123.abc/cut", RetryBody::Empty)
        .await
        .expect("retry after truncation");

    assert_eq!(response, Some(json!({"ok": true})));
}

#[tokio::test]
async fn test_once_body_is_never_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(project_path("once")))
        .respond_with(ResponseTemplate::new(503))
        .expect(1)
        .mount(&server)
        .await;

    let client = client(&server.uri());
    let body = RetryBody::once(reqwest::Body::from("{}"));
    let error = client
        .transport()
        .send_with_retry::<Value>(&CallScope::new(), Method::POST, "projects/123.abc/once", body)
        .await
        .expect_err("single attempt");

    assert_eq!(error.attempts(), Some(1));
}

#[tokio::test]
async fn test_cancelled_scope_sends_nothing() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(200))
        .expect(0)
        .mount(&server)
        .await;

    let client = client(&server.uri());
    let scope = CallScope::new();
    scope.cancel();
    let error = client
        .transport()
        .send_with_retry::<Value>(&scope, Method::GET, "projects/123.abc/x", RetryBody::Empty)
        .await
        .expect_err("cancelled");

    assert!(error.is_cancelled());
    assert!(error.attempts().is_none());
}
