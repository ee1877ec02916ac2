mod common;

use std::sync::Arc;
use std::time::Duration;

use common::{image_dataset, init_test_logging, step_engine, FakeRunner};
use d3m_ingest::error::{ErrorKind, IngestError};
use d3m_ingest::search_index::{index_definition, IndexDocument, SearchIndexWriter};
use d3m_ingest::{SchemaLoader, StepInput};
use serde_json::json;
use tempfile::TempDir;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn writer(server: &MockServer) -> SearchIndexWriter {
    SearchIndexWriter::new(server.uri(), "datasets", Duration::from_secs(5)).unwrap()
}

#[tokio::test]
async fn test_missing_index_is_created_with_mapping() {
    init_test_logging();

    // Given: no index yet
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/datasets"))
        .respond_with(ResponseTemplate::new(404))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/datasets"))
        .and(body_partial_json(json!({
            "mappings": { "properties": { "variables": { "type": "nested" } } }
        })))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;

    // When / Then
    writer(&server).ensure_index(false).await.unwrap();
}

#[tokio::test]
async fn test_existing_index_is_kept_unless_overwritten() {
    init_test_logging();

    // Given: an existing index
    let server = MockServer::start().await;
    Mock::given(method("HEAD"))
        .and(path("/datasets"))
        .respond_with(ResponseTemplate::new(200))
        .mount(&server)
        .await;
    Mock::given(method("DELETE"))
        .and(path("/datasets"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("PUT"))
        .and(path("/datasets"))
        .respond_with(ResponseTemplate::new(200))
        .expect(1)
        .mount(&server)
        .await;
    let writer = writer(&server);

    // When: ensuring without overwrite, then with it
    writer.ensure_index(false).await.unwrap();
    writer.ensure_index(true).await.unwrap();

    // Then: only the overwrite deleted and recreated the index
}

#[tokio::test]
async fn test_multi_resource_dataset_is_rejected_until_merged() {
    init_test_logging();

    // Given: an image dataset with a media collection and a table
    let dir = TempDir::new().unwrap();
    let input = image_dataset(&dir.path().join("input"), &["a.jpg", "b.jpg"]);
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .and(path("/datasets/_doc/images"))
        .and(query_param("refresh", "true"))
        .and(body_partial_json(json!({
            "datasetID": "images",
            "variables": [
                { "varName": "d3mIndex", "varIndex": 0 },
                { "varName": "image", "varIndex": 1 },
                { "varName": "label", "varIndex": 2 }
            ]
        })))
        .respond_with(ResponseTemplate::new(201))
        .expect(1)
        .mount(&server)
        .await;
    let writer = writer(&server);

    // When: indexing the unmerged dataset
    let meta = SchemaLoader::new().load(&input).unwrap();
    let result = writer.ingest_metadata(&meta).await;

    // Then: it is refused before any request
    match result {
        Err(IngestError::NotMerged { dataset_id, resources }) => {
            assert_eq!(dataset_id, "images");
            assert_eq!(resources, 2);
        }
        other => panic!("expected not merged, got {:?}", other),
    }

    // When: merging first
    let runner = Arc::new(FakeRunner::new(&dir.path().join("results")));
    let merged = step_engine(&runner, dir.path())
        .merge(&StepInput::new(&input), &dir.path().join("merged"))
        .await
        .unwrap();
    let meta = SchemaLoader::new().load(&merged).unwrap();
    let document = writer.ingest_metadata(&meta).await.unwrap();

    // Then: the document mirrors the merged variables
    assert_eq!(document.variables.len(), 3);
    assert_eq!(document.variables[1].var_name, "image");
}

#[tokio::test]
async fn test_rejected_document_is_an_index_error() {
    init_test_logging();

    // Given: a search service that rejects writes
    let dir = TempDir::new().unwrap();
    let input = common::city_dataset(&dir.path().join("input"));
    let server = MockServer::start().await;
    Mock::given(method("PUT"))
        .respond_with(ResponseTemplate::new(400).set_body_string("mapper_parsing_exception"))
        .mount(&server)
        .await;

    // When
    let meta = SchemaLoader::new().load(&input).unwrap();
    let err = writer(&server).ingest_metadata(&meta).await.unwrap_err();

    // Then
    assert_eq!(err.kind(), ErrorKind::Index);
    assert!(err.to_string().contains("mapper_parsing_exception"));
}

#[test]
fn test_document_and_mapping_field_names_agree() {
    // Given
    let mapping = index_definition();
    let properties = mapping["mappings"]["properties"].as_object().unwrap();
    let mut meta = d3m_ingest::Metadata::new("ds", "Data Set");
    let mut resource = d3m_ingest::metadata::DataResource::new(
        "learningData",
        "tables/learningData.csv",
        d3m_ingest::metadata::ResourceType::Table,
    );
    resource.push_variable(d3m_ingest::metadata::Variable::new(0, "d3mIndex", "index"));
    meta.data_resources.push(resource);

    // When
    let document = serde_json::to_value(IndexDocument::from_metadata(&meta).unwrap()).unwrap();

    // Then: every document field is mapped
    for key in document.as_object().unwrap().keys() {
        assert!(properties.contains_key(key), "unmapped field {}", key);
    }
    for key in document["variables"][0].as_object().unwrap().keys() {
        assert!(
            properties["variables"]["properties"]
                .as_object()
                .unwrap()
                .contains_key(key),
            "unmapped variable field {}",
            key
        );
    }
}
