use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use reqwest::multipart::{Form, Part};
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info};

use crate::error::{IngestError, Result};
use crate::metadata::Metadata;

pub const DEFAULT_REST_TIMEOUT: Duration = Duration::from_secs(600);
const API_KEY_HEADER: &str = "x-api-key";

/// Client for the featurizer, classifier, ranker and summarizer services.
#[derive(Debug, Clone)]
pub struct RestClient {
    client: Client,
    base_url: String,
    api_key: Option<String>,
}

impl RestClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: None,
        })
    }

    pub fn with_api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, function: &str) -> String {
        if function.is_empty() {
            self.base_url.clone()
        } else {
            format!("{}/{}", self.base_url, function.trim_start_matches('/'))
        }
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_key {
            Some(key) => request.header(API_KEY_HEADER, key),
            None => request,
        }
    }

    /// Uploads `file` as a multipart `file` part with `params` as text
    /// fields and returns the JSON response.
    pub async fn post_file(
        &self,
        function: &str,
        file: &Path,
        params: &BTreeMap<String, String>,
    ) -> Result<Value> {
        let bytes = tokio::fs::read(file)
            .await
            .map_err(|e| IngestError::io(file, e))?;
        let file_name = file
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| "data.csv".to_string());

        let mut form = Form::new().part("file", Part::bytes(bytes).file_name(file_name));
        for (key, value) in params {
            form = form.text(key.clone(), value.clone());
        }

        let url = self.url(function);
        info!("Posting {} to {}", file.display(), url);
        let response = self
            .authorize(self.client.post(&url).multipart(form))
            .send()
            .await?;
        Self::json_body(response, &url).await
    }

    pub async fn post_json<T: Serialize + ?Sized>(&self, function: &str, body: &T) -> Result<Value> {
        let url = self.url(function);
        debug!("Posting JSON to {}", url);
        let response = self
            .authorize(self.client.post(&url).json(body))
            .send()
            .await?;
        Self::json_body(response, &url).await
    }

    async fn json_body(response: reqwest::Response, url: &str) -> Result<Value> {
        let status = response.status();
        if status != StatusCode::OK {
            return Err(IngestError::BadStatus {
                status: status.as_u16(),
                url: url.to_string(),
            });
        }
        Ok(response.json().await?)
    }
}

#[derive(Debug, Serialize)]
struct SummaryRequest<'a> {
    text: &'a str,
    max_length: usize,
}

#[derive(Debug, Deserialize)]
struct SummaryResponse {
    summary: String,
}

/// External text summarizer. Only built when an API key is configured.
#[derive(Debug, Clone)]
pub struct Summarizer {
    client: RestClient,
    max_length: usize,
}

impl Summarizer {
    pub fn new(client: RestClient, max_length: usize) -> Self {
        Self { client, max_length }
    }

    pub async fn summarize(&self, text: &str) -> Result<String> {
        let body = SummaryRequest {
            text,
            max_length: self.max_length,
        };
        let response = self.client.post_json("", &body).await?;
        let parsed: SummaryResponse = serde_json::from_value(response)?;
        Ok(parsed.summary)
    }
}

/// First `max_length` characters of `text`.
pub fn truncate_summary(text: &str, max_length: usize) -> String {
    match text.char_indices().nth(max_length) {
        Some((end, _)) => text[..end].to_string(),
        None => text.to_string(),
    }
}

/// Fills `meta.summary` from the summarizer when there is one, otherwise
/// from the truncated description.
pub async fn load_summary(
    meta: &mut Metadata,
    summarizer: Option<&Summarizer>,
    max_length: usize,
) -> Result<()> {
    meta.summary = match summarizer {
        Some(summarizer) if !meta.description.is_empty() => {
            info!("Summarizing description of {}", meta.id);
            summarizer.summarize(&meta.description).await?
        }
        _ => truncate_summary(&meta.description, max_length),
    };
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncates_on_char_boundary() {
        assert_eq!(truncate_summary("héllo wörld", 7), "héllo w");
        assert_eq!(truncate_summary("short", 256), "short");
        assert_eq!(truncate_summary("", 3), "");
    }
}
