mod common;

use std::collections::BTreeMap;
use std::fs;
use std::sync::Arc;
use std::time::Duration;

use common::{city_dataset, init_test_logging, step_engine, FakeRunner};
use d3m_ingest::classification::{ClassificationFile, ImportanceFile};
use d3m_ingest::error::{ErrorKind, IngestError};
use d3m_ingest::metadata::SCHEMA_FILE_NAME;
use d3m_ingest::rest::{load_summary, RestClient, Summarizer};
use d3m_ingest::{Metadata, StepInput};
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{body_partial_json, body_string_contains, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn client(server: &MockServer, function: &str) -> RestClient {
    RestClient::new(format!("{}/{}", server.uri(), function), Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn test_post_file_sends_multipart_file_with_api_key() {
    init_test_logging();

    // Given: a service that requires the api key
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/featurize"))
        .and(header("x-api-key", "secret"))
        .and(body_string_contains("name=\"file\""))
        .and(body_string_contains("name=\"mode\""))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let file = dir.path().join("data.csv");
    fs::write(&file, "a,b\n1,2\n").unwrap();
    let mut params = BTreeMap::new();
    params.insert("mode".to_string(), "fast".to_string());

    // When
    let response = RestClient::new(server.uri(), Duration::from_secs(5))
        .unwrap()
        .with_api_key("secret")
        .post_file("featurize", &file, &params)
        .await
        .unwrap();

    // Then
    assert_eq!(response, json!({ "ok": true }));
}

#[tokio::test]
async fn test_non_ok_status_is_reported_with_url() {
    init_test_logging();

    // Given: a failing service
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    // When
    let result = client(&server, "rank").post_json("", &json!({})).await;

    // Then
    match result {
        Err(IngestError::BadStatus { status, url }) => {
            assert_eq!(status, 500);
            assert!(url.ends_with("/rank"), "{}", url);
        }
        other => panic!("expected bad status, got {:?}", other),
    }
}

#[tokio::test]
async fn test_summarizer_posts_text_and_limit() {
    init_test_logging();

    // Given: a summarizer service
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/summarize"))
        .and(body_partial_json(json!({ "text": "A long description", "max_length": 32 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "summary": "Short" })))
        .expect(1)
        .mount(&server)
        .await;
    let summarizer = Summarizer::new(client(&server, "summarize"), 32);

    // When
    let mut meta = Metadata::new("ds", "ds");
    meta.description = "A long description".to_string();
    load_summary(&mut meta, Some(&summarizer), 32).await.unwrap();

    // Then
    assert_eq!(meta.summary, "Short");
}

#[tokio::test]
async fn test_summary_falls_back_to_truncated_description() {
    // Given: no summarizer
    let mut meta = Metadata::new("ds", "ds");
    meta.description = "abcdefghij".to_string();

    // When
    load_summary(&mut meta, None, 4).await.unwrap();

    // Then
    assert_eq!(meta.summary, "abcd");
}

#[tokio::test]
async fn test_classify_uses_classifier_service_when_configured() {
    init_test_logging();

    // Given: a classifier service answering for three columns
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/classify"))
        .and(body_string_contains("Paris"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "labels": [["integer"], ["city", "text"], ["integer"]],
            "label_probabilities": [[1.0], [0.8, 0.2], [0.9]]
        })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let schema_path = city_dataset(&dir.path().join("input"));
    let runner = Arc::new(FakeRunner::new(&dir.path().join("results")));
    let engine = step_engine(&runner, &dir.path().join("scratch"))
        .with_classifier_service(Some(client(&server, "classify")));
    let output = dir.path().join("classification.json");

    // When
    let classification = engine
        .classify(&StepInput::new(&schema_path), &output)
        .await
        .unwrap();

    // Then: the runner is never involved
    assert!(runner.calls().is_empty());
    assert_eq!(classification.labels[1], vec!["city", "text"]);
    let written = ClassificationFile::read(&output).unwrap();
    assert_eq!(written.label_probabilities[1], vec![0.8, 0.2]);
}

#[tokio::test]
async fn test_classifier_shape_mismatch_is_rejected() {
    init_test_logging();

    // Given: a classifier that answers for one column only
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "labels": [["integer"]],
            "label_probabilities": [[1.0]]
        })))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let schema_path = city_dataset(&dir.path().join("input"));
    let runner = Arc::new(FakeRunner::new(&dir.path().join("results")));
    let engine = step_engine(&runner, &dir.path().join("scratch"))
        .with_classifier_service(Some(client(&server, "classify")));
    let output = dir.path().join("classification.json");

    // When
    let result = engine.classify(&StepInput::new(&schema_path), &output).await;

    // Then: nothing is written
    assert!(result.is_err());
    assert!(!output.exists());
}

#[tokio::test]
async fn test_rank_uses_ranker_service_on_numeric_projection() {
    init_test_logging();

    // Given: a ranker scoring the two numeric columns
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/rank"))
        .and(body_string_contains("population"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "features": [0.7, 0.2] })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let schema_path = city_dataset(&dir.path().join("input"));
    let runner = Arc::new(FakeRunner::new(&dir.path().join("results")));
    let engine = step_engine(&runner, &dir.path().join("scratch"))
        .with_ranker_service(Some(client(&server, "rank")));
    let output = dir.path().join("importance.json");

    // When
    let importance = engine
        .rank(&StepInput::new(&schema_path), &output)
        .await
        .unwrap();

    // Then: scores map back onto dataset columns and the text column scores zero
    assert_eq!(importance.features, vec![0.7, 0.0, 0.2]);
    assert_eq!(ImportanceFile::read(&output).unwrap().features, importance.features);
    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn test_unreachable_service_is_an_http_error() {
    init_test_logging();

    // Given: a service that is gone
    let server = MockServer::start().await;
    let url = server.uri();
    drop(server);

    let dir = TempDir::new().unwrap();
    city_dataset(&dir.path().join("input"));

    // When
    let result = RestClient::new(url, Duration::from_secs(2))
        .unwrap()
        .post_file("", &dir.path().join("input").join(SCHEMA_FILE_NAME), &BTreeMap::new())
        .await;

    // Then
    assert_eq!(result.unwrap_err().kind(), ErrorKind::Http);
}
