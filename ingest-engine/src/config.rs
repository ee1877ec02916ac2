use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use tracing::info;

use crate::error::{IngestError, Result};

pub const DEFAULT_RUNNER_ENDPOINT: &str = "http://localhost:45042";
pub const DEFAULT_ELASTIC_ENDPOINT: &str = "http://localhost:9200";
pub const DEFAULT_ELASTIC_INDEX: &str = "datasets";
pub const DEFAULT_SUMMARY_MAX_LENGTH: usize = 256;

/// Process-wide settings read from the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestConfig {
    pub runner_endpoint: String,
    pub runner_timeout: Duration,
    pub elastic_endpoint: String,
    pub elastic_index: String,
    pub elastic_timeout: Duration,
    pub database_url: Option<String>,
    pub db_batch_size: usize,
    pub summary_api_key: Option<String>,
    pub summary_endpoint: Option<String>,
    pub summary_max_length: usize,
    pub classifier_endpoint: Option<String>,
    pub ranker_endpoint: Option<String>,
    pub classification_threshold: f64,
    pub tmp_data_path: PathBuf,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            runner_endpoint: DEFAULT_RUNNER_ENDPOINT.to_string(),
            runner_timeout: Duration::from_secs(600),
            elastic_endpoint: DEFAULT_ELASTIC_ENDPOINT.to_string(),
            elastic_index: DEFAULT_ELASTIC_INDEX.to_string(),
            elastic_timeout: Duration::from_secs(300),
            database_url: None,
            db_batch_size: 1000,
            summary_api_key: None,
            summary_endpoint: None,
            summary_max_length: DEFAULT_SUMMARY_MAX_LENGTH,
            classifier_endpoint: None,
            ranker_endpoint: None,
            classification_threshold: 0.8,
            tmp_data_path: std::env::temp_dir(),
        }
    }
}

impl IngestConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from `lookup`, falling back to defaults for
    /// unset or empty keys.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let config = Self {
            runner_endpoint: get("PIPELINE_RUNNER_ENDPOINT").unwrap_or(defaults.runner_endpoint),
            runner_timeout: Duration::from_secs(parse_or(
                get("RUNNER_TIMEOUT_SECS"),
                "RUNNER_TIMEOUT_SECS",
                defaults.runner_timeout.as_secs(),
            )?),
            elastic_endpoint: get("ELASTIC_ENDPOINT").unwrap_or(defaults.elastic_endpoint),
            elastic_index: get("ELASTIC_INDEX").unwrap_or(defaults.elastic_index),
            elastic_timeout: Duration::from_secs(parse_or(
                get("ELASTIC_TIMEOUT_SECS"),
                "ELASTIC_TIMEOUT_SECS",
                defaults.elastic_timeout.as_secs(),
            )?),
            database_url: get("DATABASE_URL"),
            db_batch_size: parse_or(get("DB_BATCH_SIZE"), "DB_BATCH_SIZE", defaults.db_batch_size)?,
            summary_api_key: get("SUMMARY_API_KEY"),
            summary_endpoint: get("SUMMARY_ENDPOINT"),
            summary_max_length: parse_or(
                get("SUMMARY_MAX_LENGTH"),
                "SUMMARY_MAX_LENGTH",
                defaults.summary_max_length,
            )?,
            classifier_endpoint: get("CLASSIFIER_ENDPOINT"),
            ranker_endpoint: get("RANKER_ENDPOINT"),
            classification_threshold: parse_or(
                get("CLASSIFICATION_PROBABILITY_THRESHOLD"),
                "CLASSIFICATION_PROBABILITY_THRESHOLD",
                defaults.classification_threshold,
            )?,
            tmp_data_path: get("TMP_DATA_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.tmp_data_path),
        };

        if config.db_batch_size == 0 {
            return Err(IngestError::ConfigError {
                message: "DB_BATCH_SIZE must be positive".to_string(),
            });
        }
        Ok(config)
    }

    pub fn log_summary(&self) {
        info!("Configuration loaded:");
        info!("  Pipeline runner: {}", self.runner_endpoint);
        info!("  Search index: {}/{}", self.elastic_endpoint, self.elastic_index);
        info!(
            "  Database: {}",
            self.database_url
                .as_deref()
                .map(redact_credentials)
                .unwrap_or_else(|| "disabled".to_string())
        );
        info!("  Scratch folder: {}", self.tmp_data_path.display());
    }
}

fn parse_or<T: FromStr>(value: Option<String>, key: &str, default: T) -> Result<T> {
    match value {
        Some(raw) => raw.trim().parse().map_err(|_| IngestError::ConfigError {
            message: format!("Invalid {}: '{}'", key, raw),
        }),
        None => Ok(default),
    }
}

/// Masks the user info part of a connection url.
pub fn redact_credentials(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme + 3 => {
            format!("{}***{}", &url[..scheme + 3], &url[at..])
        }
        _ => url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_apply_to_missing_keys() {
        let config = IngestConfig::from_lookup(|_| None).unwrap();
        assert_eq!(config, IngestConfig::default());
    }

    #[test]
    fn reads_overrides_and_rejects_garbage() {
        let env: HashMap<&str, &str> = [
            ("RUNNER_TIMEOUT_SECS", "30"),
            ("DATABASE_URL", "postgres://u:p@db/ingest"),
            ("CLASSIFICATION_PROBABILITY_THRESHOLD", "0.5"),
        ]
        .into_iter()
        .collect();
        let config = IngestConfig::from_lookup(|k| env.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.runner_timeout, Duration::from_secs(30));
        assert_eq!(config.classification_threshold, 0.5);
        assert_eq!(
            redact_credentials(config.database_url.as_deref().unwrap()),
            "postgres://***@db/ingest"
        );

        let bad = IngestConfig::from_lookup(|k| (k == "DB_BATCH_SIZE").then(|| "many".to_string()));
        assert!(matches!(bad, Err(IngestError::ConfigError { .. })));
    }
}
