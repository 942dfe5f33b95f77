//! Integration tests for streamed uploads and import-process polling.

mod support;

use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bundlex_core::{CallScope, ClientError, ProcessStatus, UploadData, UploadOptions, UploadSpec};
use serde_json::{Value, json};
use tempfile::TempDir;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use support::{client, project_path};

fn queued_response(id: &str) -> ResponseTemplate {
    ResponseTemplate::new(200).set_body_json(json!({
        "project_id": support::PROJECT,
        "process": {"process_id": id, "type": "file-import", "status": "queued"}
    }))
}

async fn received_bodies(server: &MockServer) -> Vec<Value> {
    server
        .received_requests()
        .await
        .expect("request recording enabled")
        .iter()
        .filter(|r| r.url.path().ends_with("/files/upload"))
        .map(|r| serde_json::from_slice(&r.body).expect("upload body is JSON"))
        .collect()
}

#[tokio::test]
async fn test_upload_streams_file_as_base64() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(project_path("files/upload")))
        .respond_with(queued_response("p-1"))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().expect("temp dir");
    let file = dir.path().join("en.json");
    // spans several encoder chunks, length not a multiple of 3
    let contents: Vec<u8> = (0..200_003u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(&file, &contents).expect("write source");

    let spec = UploadSpec::from_file(&file).field("lang_iso", "en");
    let process = client(&server.uri())
        .upload(&CallScope::new(), &spec, UploadOptions::default())
        .await
        .expect("upload accepted");

    assert_eq!(process.id, "p-1");
    assert_eq!(process.status, ProcessStatus::Queued);

    let bodies = received_bodies(&server).await;
    assert_eq!(bodies.len(), 1);
    let body = &bodies[0];
    assert_eq!(body["filename"], Value::String(file.to_string_lossy().into_owned()));
    assert_eq!(body["lang_iso"], "en");
    let decoded = STANDARD
        .decode(body["data"].as_str().expect("data is a string"))
        .expect("data is base64");
    assert_eq!(decoded, contents);
}

#[tokio::test]
async fn test_upload_retry_resends_complete_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(project_path("files/upload")))
        .respond_with(ResponseTemplate::new(502))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(project_path("files/upload")))
        .respond_with(queued_response("p-2"))
        .mount(&server)
        .await;

    let spec = UploadSpec::with_data("de.json", UploadData::Bytes(b"{\"hallo\":\"welt\"}".to_vec().into()));
    let process = client(&server.uri())
        .upload(&CallScope::new(), &spec, UploadOptions::default())
        .await
        .expect("second attempt accepted");
    assert_eq!(process.id, "p-2");

    let bodies = received_bodies(&server).await;
    assert_eq!(bodies.len(), 2);
    assert_eq!(bodies[0], bodies[1]);
    assert_eq!(bodies[1]["data"], STANDARD.encode(b"{\"hallo\":\"welt\"}"));
}

#[tokio::test]
async fn test_upload_polls_until_finished() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(project_path("files/upload")))
        .respond_with(queued_response("p-3"))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(project_path("processes/p-3")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"process": {"process_id": "p-3", "status": "running"}})))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(project_path("processes/p-3")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"process": {"process_id": "p-3", "status": "finished"}})))
        .mount(&server)
        .await;

    let spec = UploadSpec::with_data("fr.json", UploadData::Base64(STANDARD.encode("{}")));
    let options = UploadOptions {
        poll_budget: Some(Duration::from_secs(5)),
    };
    let process = client(&server.uri())
        .upload(&CallScope::new(), &spec, options)
        .await
        .expect("upload and poll");

    assert_eq!(process.id, "p-3");
    assert_eq!(process.status, ProcessStatus::Finished);
}

#[tokio::test]
async fn test_malformed_base64_rejected_before_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(queued_response("never"))
        .expect(0)
        .mount(&server)
        .await;

    let spec = UploadSpec::from_fields(
        json!({"filename": "en.json", "data": "not*base64!", "lang_iso": "en"})
            .as_object()
            .cloned()
            .expect("object"),
    )
    .expect("fields are well-formed");

    let error = client(&server.uri())
        .upload(&CallScope::new(), &spec, UploadOptions::default())
        .await
        .expect_err("bad base64");
    assert!(matches!(error, ClientError::InvalidRequest { .. }), "got {error:?}");
}

#[tokio::test]
async fn test_missing_file_rejected_before_request() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(queued_response("never"))
        .expect(0)
        .mount(&server)
        .await;

    let dir = TempDir::new().expect("temp dir");
    let spec = UploadSpec::from_file(dir.path().join("absent.json"));
    let error = client(&server.uri())
        .upload(&CallScope::new(), &spec, UploadOptions::default())
        .await
        .expect_err("missing file");
    assert!(matches!(error, ClientError::Io { .. }), "got {error:?}");
}

#[tokio::test]
async fn test_poll_reports_each_process_in_order() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(project_path("processes/a")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"process": {"process_id": "a", "status": "finished"}})))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(project_path("processes/b")))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"error": {"message": "Not found", "code": 404}})))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path(project_path("processes/c")))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"process": {"process_id": "c", "status": "cancelled"}})))
        .mount(&server)
        .await;

    let ids = ["a", "b", "c"].map(String::from);
    let results = client(&server.uri())
        .poll_processes(&CallScope::new(), &ids, Duration::from_secs(5))
        .await
        .expect("poll completes");

    let statuses: Vec<_> = results.iter().map(|p| (p.id.as_str(), p.status)).collect();
    assert_eq!(
        statuses,
        vec![
            ("a", ProcessStatus::Finished),
            ("b", ProcessStatus::Failed),
            ("c", ProcessStatus::Failed),
        ]
    );
}
