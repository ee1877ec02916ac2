use std::time::Duration;

use reqwest::{Client, Method, StatusCode};
use serde::Serialize;
use serde_json::{json, Value};
use tracing::{debug, info};
use url::Url;

use crate::error::{IngestError, Result};
use crate::metadata::{Metadata, Variable};

pub const DEFAULT_INDEX_TIMEOUT: Duration = Duration::from_secs(300);

const NGRAM_MIN: u32 = 4;
const NGRAM_MAX: u32 = 20;
const EDGE_NGRAM_MIN: u32 = 1;
const EDGE_NGRAM_MAX: u32 = 20;

/// One entry of the nested `variables` field.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexVariable {
    #[serde(rename = "varName")]
    pub var_name: String,
    #[serde(rename = "colName")]
    pub col_name: String,
    #[serde(rename = "varIndex")]
    pub var_index: usize,
    #[serde(rename = "varRole")]
    pub var_role: Vec<String>,
    #[serde(rename = "varDistilRole")]
    pub var_distil_role: String,
    #[serde(rename = "varType")]
    pub var_type: String,
    #[serde(rename = "varOriginalType")]
    pub var_original_type: String,
    #[serde(rename = "varOriginalName")]
    pub var_original_name: String,
    #[serde(rename = "varDisplayName")]
    pub var_display_name: String,
    #[serde(rename = "varDescription")]
    pub var_description: String,
    pub importance: Option<i64>,
}

impl From<&Variable> for IndexVariable {
    fn from(variable: &Variable) -> Self {
        Self {
            var_name: variable.name.clone(),
            col_name: variable.name.clone(),
            var_index: variable.index,
            var_role: variable.roles.clone(),
            var_distil_role: variable.distil_role.as_str().to_string(),
            var_type: variable.type_name.clone(),
            var_original_type: variable.original_type.clone(),
            var_original_name: variable.original_name.clone(),
            var_display_name: variable.display_name.clone(),
            var_description: variable.description.clone(),
            importance: variable.importance,
        }
    }
}

/// Search document for one merged dataset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexDocument {
    #[serde(rename = "datasetID")]
    pub dataset_id: String,
    #[serde(rename = "datasetName")]
    pub dataset_name: String,
    #[serde(rename = "parentDatasetIDs")]
    pub parent_dataset_ids: Vec<String>,
    #[serde(rename = "storageName")]
    pub storage_name: String,
    #[serde(rename = "datasetFolder")]
    pub dataset_folder: String,
    pub description: String,
    pub summary: String,
    #[serde(rename = "summaryMachine")]
    pub summary_machine: String,
    #[serde(rename = "numRows")]
    pub num_rows: i64,
    #[serde(rename = "numBytes")]
    pub num_bytes: i64,
    pub variables: Vec<IndexVariable>,
}

impl IndexDocument {
    /// Builds the document from merged metadata. References between
    /// resources are not indexed.
    pub fn from_metadata(meta: &Metadata) -> Result<Self> {
        if meta.data_resources.len() != 1 {
            return Err(IngestError::NotMerged {
                dataset_id: meta.id.clone(),
                resources: meta.data_resources.len(),
            });
        }
        let variables = meta.data_resources[0]
            .ordered_variables()
            .into_iter()
            .map(|v| {
                let mut variable = v.clone();
                variable.refers_to = None;
                IndexVariable::from(&variable)
            })
            .collect();

        Ok(Self {
            dataset_id: meta.id.clone(),
            dataset_name: meta.name.clone(),
            parent_dataset_ids: meta.parent_ids.clone(),
            storage_name: meta.storage_name.clone(),
            dataset_folder: meta.dataset_folder.clone(),
            description: meta.description.clone(),
            summary: meta.summary.clone(),
            summary_machine: meta.machine_summary.clone(),
            num_rows: meta.num_rows,
            num_bytes: meta.num_bytes,
            variables,
        })
    }
}

/// Analyzer settings and field mapping of the dataset index.
pub fn index_definition() -> Value {
    let ngram_text = json!({ "type": "text", "analyzer": "ngram_analyzer", "search_analyzer": "standard" });
    let free_text = json!({ "type": "text", "analyzer": "search_analyzer" });
    let keyword = json!({ "type": "keyword" });

    json!({
        "settings": {
            "index": { "max_ngram_diff": NGRAM_MAX - NGRAM_MIN },
            "analysis": {
                "filter": {
                    "ngram_filter": { "type": "ngram", "min_gram": NGRAM_MIN, "max_gram": NGRAM_MAX },
                    "search_filter": { "type": "edge_ngram", "min_gram": EDGE_NGRAM_MIN, "max_gram": EDGE_NGRAM_MAX }
                },
                "analyzer": {
                    "ngram_analyzer": {
                        "type": "custom",
                        "tokenizer": "standard",
                        "filter": ["lowercase", "ngram_filter"]
                    },
                    "search_analyzer": {
                        "type": "custom",
                        "tokenizer": "standard",
                        "filter": ["lowercase", "search_filter"]
                    }
                }
            }
        },
        "mappings": {
            "properties": {
                "datasetID": keyword,
                "datasetName": ngram_text,
                "parentDatasetIDs": keyword,
                "storageName": keyword,
                "datasetFolder": keyword,
                "description": free_text,
                "summary": free_text,
                "summaryMachine": free_text,
                "numRows": { "type": "long" },
                "numBytes": { "type": "long" },
                "variables": {
                    "type": "nested",
                    "properties": {
                        "varName": ngram_text,
                        "colName": keyword,
                        "varIndex": { "type": "integer" },
                        "varRole": keyword,
                        "varDistilRole": keyword,
                        "varType": keyword,
                        "varOriginalType": keyword,
                        "varOriginalName": ngram_text,
                        "varDisplayName": ngram_text,
                        "varDescription": free_text,
                        "importance": { "type": "integer" }
                    }
                }
            }
        }
    })
}

/// Writes dataset metadata into the search index over its HTTP API.
#[derive(Debug, Clone)]
pub struct SearchIndexWriter {
    client: Client,
    endpoint: String,
    index: String,
}

impl SearchIndexWriter {
    pub fn new(endpoint: impl Into<String>, index: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            index: index.into(),
        })
    }

    pub fn index(&self) -> &str {
        &self.index
    }

    fn index_url(&self) -> String {
        format!("{}/{}", self.endpoint, self.index)
    }

    fn document_url(&self, id: &str) -> Result<String> {
        let mut url = Url::parse(&self.index_url()).map_err(|e| IngestError::ConfigError {
            message: format!("invalid search index endpoint {}: {}", self.endpoint, e),
        })?;
        url.path_segments_mut()
            .map_err(|_| IngestError::ConfigError {
                message: format!("search index endpoint {} cannot be a base", self.endpoint),
            })?
            .push("_doc")
            .push(id);
        url.set_query(Some("refresh=true"));
        Ok(url.to_string())
    }

    async fn send(&self, method: Method, url: &str, body: Option<&Value>) -> Result<reqwest::Response> {
        let mut request = self.client.request(method, url);
        if let Some(body) = body {
            request = request.json(body);
        }
        Ok(request.send().await?)
    }

    async fn rejected(response: reqwest::Response, action: &str, url: &str) -> IngestError {
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        IngestError::Index {
            message: format!("{} {} returned {}: {}", action, url, status.as_u16(), body),
        }
    }

    pub async fn index_exists(&self) -> Result<bool> {
        let url = self.index_url();
        let response = self.send(Method::HEAD, &url, None).await?;
        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            _ => Err(Self::rejected(response, "checking index", &url).await),
        }
    }

    pub async fn create_index(&self) -> Result<()> {
        let url = self.index_url();
        info!("Creating search index {}", self.index);
        let response = self.send(Method::PUT, &url, Some(&index_definition())).await?;
        if !response.status().is_success() {
            return Err(Self::rejected(response, "creating index", &url).await);
        }
        Ok(())
    }

    /// Deletes the index; a missing index is not an error.
    pub async fn delete_index(&self) -> Result<()> {
        let url = self.index_url();
        info!("Deleting search index {}", self.index);
        let response = self.send(Method::DELETE, &url, None).await?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => Ok(()),
            _ => Err(Self::rejected(response, "deleting index", &url).await),
        }
    }

    /// Creates the index when missing, recreating it when `overwrite` is set.
    pub async fn ensure_index(&self, overwrite: bool) -> Result<()> {
        let exists = self.index_exists().await?;
        if exists && overwrite {
            self.delete_index().await?;
        }
        if !exists || overwrite {
            self.create_index().await?;
        } else {
            debug!("Search index {} already exists", self.index);
        }
        Ok(())
    }

    /// Upserts the document for `meta` keyed by dataset id and waits for a
    /// refresh so the next search sees it.
    pub async fn ingest_metadata(&self, meta: &Metadata) -> Result<IndexDocument> {
        let document = IndexDocument::from_metadata(meta)?;
        let body = serde_json::to_value(&document)?;
        let url = self.document_url(&document.dataset_id)?;

        info!("Indexing dataset {} into {}", document.dataset_id, self.index);
        let response = self.send(Method::PUT, &url, Some(&body)).await?;
        if !response.status().is_success() {
            return Err(Self::rejected(response, "indexing document", &url).await);
        }
        Ok(document)
    }
}

