#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Once};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serde_json::{json, Value};
use url::Url;

use d3m_ingest::csv_io;
use d3m_ingest::dispatcher::{result_path, PrimitiveDispatcher};
use d3m_ingest::error::{PrimitiveError, Result};
use d3m_ingest::loader::{schema_dir, SchemaLoader};
use d3m_ingest::metadata::{D3M_INDEX_NAME, SCHEMA_FILE_NAME};
use d3m_ingest::primitives::PipelineDescription;
use d3m_ingest::runner::{SearchRequest, SolutionRunner};
use d3m_ingest::steps::StepEngine;

static INIT: Once = Once::new();

pub fn init_test_logging() {
    INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .init();
    });
}

pub type Table = Vec<Vec<String>>;
pub type Responder = dyn Fn(&PipelineDescription, &Path) -> std::result::Result<Table, String> + Send + Sync;

pub fn row(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| v.to_string()).collect()
}

/// Writes `schema` and the given relative files into `folder` and returns the
/// schema path.
pub fn write_dataset(folder: &Path, schema: &Value, files: &[(&str, &str)]) -> PathBuf {
    fs::create_dir_all(folder).unwrap();
    for (relative, content) in files {
        let path = folder.join(relative);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(&path, content).unwrap();
    }
    let schema_path = folder.join(SCHEMA_FILE_NAME);
    fs::write(&schema_path, serde_json::to_string_pretty(schema).unwrap()).unwrap();
    schema_path
}

pub fn column(index: usize, name: &str, col_type: &str, roles: &[&str]) -> Value {
    json!({ "colIndex": index, "colName": name, "colType": col_type, "role": roles })
}

pub fn table_resource(columns: Vec<Value>) -> Value {
    json!({
        "resID": "learningData",
        "resPath": "tables/learningData.csv",
        "resType": "table",
        "resFormat": { "text/csv": ["csv"] },
        "isCollection": false,
        "columns": columns
    })
}

pub fn schema(id: &str, resources: Vec<Value>) -> Value {
    json!({
        "about": {
            "datasetID": id,
            "datasetName": id,
            "description": format!("Test dataset {}", id),
            "datasetSchemaVersion": "3.1.1"
        },
        "dataResources": resources
    })
}

/// `d3mIndex, city, population` with Paris and Berlin.
pub fn city_dataset(folder: &Path) -> PathBuf {
    let doc = schema(
        "cities",
        vec![table_resource(vec![
            column(0, D3M_INDEX_NAME, "integer", &["index"]),
            column(1, "city", "city", &["attribute"]),
            column(2, "population", "integer", &["attribute"]),
        ])],
    );
    write_dataset(
        folder,
        &doc,
        &[(
            "tables/learningData.csv",
            "d3mIndex,city,population\n1,Paris,2148000\n2,Berlin,3645000\n",
        )],
    )
}

/// Main table whose `image` column refers to a collection of `files`.
pub fn image_dataset(folder: &Path, files: &[&str]) -> PathBuf {
    let doc = schema(
        "images",
        vec![
            json!({
                "resID": "0",
                "resPath": "media/",
                "resType": "image",
                "resFormat": { "image/jpeg": ["jpg"] },
                "isCollection": true
            }),
            table_resource(vec![
                column(0, D3M_INDEX_NAME, "integer", &["index"]),
                json!({
                    "colIndex": 1,
                    "colName": "image",
                    "colType": "string",
                    "role": ["attribute"],
                    "refersTo": { "resID": "0", "resObject": "item" }
                }),
                column(2, "label", "categorical", &["suggestedTarget"]),
            ]),
        ],
    );

    let mut csv = String::from("d3mIndex,image,label\n");
    let mut media: Vec<(String, String)> = Vec::new();
    for (i, file) in files.iter().enumerate() {
        csv.push_str(&format!("{},{},{}\n", i + 1, file, if i % 2 == 0 { "cat" } else { "dog" }));
        media.push((format!("media/{}", file), String::new()));
    }
    let mut entries: Vec<(&str, &str)> = media.iter().map(|(p, c)| (p.as_str(), c.as_str())).collect();
    entries.push(("tables/learningData.csv", csv.as_str()));
    write_dataset(folder, &doc, &entries)
}

/// Header plus rows of the main table of the dataset in `folder`.
pub fn main_table(folder: &Path) -> Table {
    let schema_path = folder.join(SCHEMA_FILE_NAME);
    let meta = SchemaLoader::new().load(&schema_path).unwrap();
    let data_path = schema_dir(&schema_path).join(&meta.main_resource().unwrap().res_path);
    csv_io::read_records(&data_path, false).unwrap()
}

fn target_column(pipeline: &PipelineDescription) -> usize {
    pipeline
        .steps
        .iter()
        .find_map(|s| s.hyperparams.get("target_columns"))
        .map(|v| v.trim_matches(|c| c == '[' || c == ']').parse().unwrap())
        .unwrap_or(0)
}

/// Answers every primitive the step engine uses with plausible output for
/// the dataset it runs on.
pub fn standard_response(pipeline: &PipelineDescription, folder: &Path) -> std::result::Result<Table, String> {
    let table = main_table(folder);
    let header = table[0].clone();
    let rows = &table[1..];
    let key = header.iter().position(|h| h == D3M_INDEX_NAME).unwrap_or(0);

    let response = match pipeline.name.as_str() {
        "denormalize" | "timeseries_formatter" | "data_cleaning" => table.clone(),
        "simon" => {
            let mut out = vec![row(&["column", "semantic_types", "probabilities"])];
            for name in &header {
                let (labels, probabilities) = match name.as_str() {
                    "d3mIndex" | "population" => ("['integer']", "[1.0]"),
                    "city" => ("['city', 'text']", "[0.9, 0.4]"),
                    _ => ("['categorical', 'text']", "[0.85, 0.5]"),
                };
                out.push(row(&[name.as_str(), labels, probabilities]));
            }
            out
        }
        "pca_features" => {
            let mut out = vec![row(&["colIndex", "importance"])];
            for i in 0..header.len() {
                out.push(vec![i.to_string(), format!("{}", 1.0 / (i as f64 + 1.0))]);
            }
            out
        }
        "duke" => vec![
            row(&["token", "probability"]),
            row(&["cities", "0.9"]),
            row(&["population", "0.6"]),
        ],
        "goat_forward" => {
            let column = target_column(pipeline);
            let mut out = vec![row(&[D3M_INDEX_NAME, header[column].as_str(), "latitude", "longitude"])];
            for r in rows {
                let (lat, lon) = match r[column].as_str() {
                    "Paris" => ("48.85", "2.35"),
                    "Berlin" => ("52.52", "13.4"),
                    _ => ("", ""),
                };
                out.push(row(&[r[key].as_str(), r[column].as_str(), lat, lon]));
            }
            out
        }
        "croc" => {
            let column = target_column(pipeline);
            let mut out = vec![row(&[D3M_INDEX_NAME, header[column].as_str(), "objects"])];
            for r in rows {
                out.push(row(&[r[key].as_str(), r[column].as_str(), "{'0': 'cat', '1': 'grass'}"]));
            }
            out
        }
        "unicorn" | "sloth" => {
            let column = target_column(pipeline);
            let mut out = vec![row(&[D3M_INDEX_NAME, header[column].as_str(), "__cluster"])];
            for (i, r) in rows.iter().enumerate() {
                out.push(vec![r[key].clone(), r[column].clone(), (i % 2).to_string()]);
            }
            out
        }
        other => return Err(format!("unexpected pipeline {}", other)),
    };
    Ok(response)
}

/// In-process runner that answers searches with `respond` and writes the
/// produced tables under `output_dir`.
pub struct FakeRunner {
    output_dir: PathBuf,
    solutions: usize,
    failing: usize,
    produce_delay: Duration,
    open_search: bool,
    respond: Box<Responder>,
    searches: Mutex<HashMap<String, SearchRequest>>,
    search_count: AtomicUsize,
    pub pipelines: Mutex<Vec<String>>,
    pub ended: Mutex<Vec<String>>,
    pub produce_uris: Mutex<Vec<String>>,
}

impl FakeRunner {
    pub fn new(output_dir: &Path) -> Self {
        Self::with_responder(output_dir, standard_response)
    }

    pub fn with_responder<F>(output_dir: &Path, respond: F) -> Self
    where
        F: Fn(&PipelineDescription, &Path) -> std::result::Result<Table, String> + Send + Sync + 'static,
    {
        fs::create_dir_all(output_dir).unwrap();
        Self {
            output_dir: output_dir.to_path_buf(),
            solutions: 1,
            failing: 0,
            produce_delay: Duration::ZERO,
            open_search: false,
            respond: Box::new(respond),
            searches: Mutex::new(HashMap::new()),
            search_count: AtomicUsize::new(0),
            pipelines: Mutex::new(Vec::new()),
            ended: Mutex::new(Vec::new()),
            produce_uris: Mutex::new(Vec::new()),
        }
    }

    pub fn solutions(mut self, solutions: usize) -> Self {
        self.solutions = solutions;
        self
    }

    /// The first `failing` solutions of every search fail to fit.
    pub fn failing(mut self, failing: usize) -> Self {
        self.failing = failing;
        self
    }

    pub fn produce_delay(mut self, delay: Duration) -> Self {
        self.produce_delay = delay;
        self
    }

    /// The solution id stream stays open after the last id, as a runner
    /// still searching would keep it.
    pub fn open_search(mut self) -> Self {
        self.open_search = true;
        self
    }

    pub fn calls(&self) -> Vec<String> {
        self.pipelines.lock().unwrap().clone()
    }
}

#[async_trait]
impl SolutionRunner for FakeRunner {
    fn endpoint(&self) -> &str {
        "fake://runner"
    }

    async fn search_solutions(&self, request: SearchRequest) -> Result<String> {
        let search_id = format!("search-{}", self.search_count.fetch_add(1, Ordering::SeqCst));
        self.pipelines.lock().unwrap().push(request.pipeline.name.clone());
        self.searches.lock().unwrap().insert(search_id.clone(), request);
        Ok(search_id)
    }

    async fn solution_ids(&self, search_id: &str) -> Result<BoxStream<'static, Result<String>>> {
        let ids: Vec<Result<String>> = (0..self.solutions)
            .map(|i| Ok(format!("{}/solution-{}", search_id, i)))
            .collect();
        if self.open_search {
            return Ok(stream::iter(ids).chain(stream::pending()).boxed());
        }
        Ok(stream::iter(ids).boxed())
    }

    async fn fit(&self, solution_id: &str, _dataset_uri: &str) -> Result<String> {
        let position: usize = solution_id
            .rsplit('-')
            .next()
            .and_then(|n| n.parse().ok())
            .unwrap_or(0);
        if position < self.failing {
            return Err(PrimitiveError::ExecutionFailed {
                message: format!("{} failed to fit", solution_id),
            }
            .into());
        }
        Ok(format!("{}/fitted", solution_id))
    }

    async fn score(
        &self,
        _solution_id: &str,
        _dataset_uri: &str,
        metrics: &[String],
    ) -> Result<Vec<(String, f64)>> {
        Ok(metrics.iter().map(|m| (m.clone(), 0.75)).collect())
    }

    async fn produce(&self, fitted_solution_id: &str, dataset_uri: &str) -> Result<String> {
        if !self.produce_delay.is_zero() {
            tokio::time::sleep(self.produce_delay).await;
        }
        let search_id = fitted_solution_id.split('/').next().unwrap_or_default().to_string();
        let pipeline = self
            .searches
            .lock()
            .unwrap()
            .get(&search_id)
            .map(|r| r.pipeline.clone())
            .ok_or_else(|| PrimitiveError::BadRequest {
                message: format!("unknown search {}", search_id),
            })?;
        self.produce_uris.lock().unwrap().push(dataset_uri.to_string());

        let schema_path = result_path(dataset_uri)?;
        let table = (self.respond)(&pipeline, &schema_dir(&schema_path))
            .map_err(|message| PrimitiveError::ExecutionFailed { message })?;

        let output = self
            .output_dir
            .join(format!("{}.csv", fitted_solution_id.replace('/', "_")));
        csv_io::write_table(&output, &table[0], table[1..].to_vec())?;
        Ok(Url::from_file_path(&output).unwrap().to_string())
    }

    async fn end_search(&self, search_id: &str) -> Result<()> {
        self.ended.lock().unwrap().push(search_id.to_string());
        Ok(())
    }
}

pub fn dispatcher(runner: &Arc<FakeRunner>) -> PrimitiveDispatcher {
    let runner: Arc<dyn SolutionRunner> = runner.clone();
    PrimitiveDispatcher::new(runner)
}

pub fn step_engine(runner: &Arc<FakeRunner>, scratch: &Path) -> StepEngine {
    StepEngine::new(dispatcher(runner)).with_scratch_root(scratch)
}
