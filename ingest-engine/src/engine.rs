use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::IngestConfig;
use crate::csv_io;
use crate::database::DatabaseWriter;
use crate::error::{IngestError, Result};
use crate::loader::{load_importance, load_summary_machine, schema_dir};
use crate::metadata::{
    Metadata, SchemaSource, CLUSTER_PREFIX, FEATURE_PREFIX, LAT_PREFIX, PROVENANCE_SIMON,
    SCHEMA_FILE_NAME,
};
use crate::rest::{self, RestClient, Summarizer, DEFAULT_REST_TIMEOUT};
use crate::schema_doc::write_schema;
use crate::search_index::SearchIndexWriter;
use crate::steps::{copy_tree, StepEngine, StepInput};
use crate::verify::verify_and_update;

const CLASSIFICATION_FILE: &str = "classification.json";
const IMPORTANCE_FILE: &str = "importance.json";
const SUMMARY_FILE: &str = "summary.json";
const ENRICHED_FOLDER: &str = "enriched";
const INGESTED_FOLDER: &str = "ingested";

/// How far a dataset has advanced through ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IngestStage {
    Raw,
    Formatted,
    Merged,
    Classified,
    Ranked,
    Summarized,
    Geocoded,
    Featurized,
    Clustered,
    Indexed,
}

impl IngestStage {
    /// Infers the furthest stage whose traces are present in `meta`.
    /// Geocode, featurize and cluster only leave a trace when they added a
    /// column, so a dataset without location or media columns reports an
    /// earlier stage.
    pub fn detect(meta: &Metadata) -> IngestStage {
        let Ok(main) = meta.main_resource() else {
            return IngestStage::Raw;
        };
        let has_prefix = |prefix: &str| main.variables.iter().any(|v| v.name.starts_with(prefix));

        if has_prefix(CLUSTER_PREFIX) {
            IngestStage::Clustered
        } else if has_prefix(FEATURE_PREFIX) {
            IngestStage::Featurized
        } else if has_prefix(LAT_PREFIX) {
            IngestStage::Geocoded
        } else if !meta.machine_summary.is_empty() {
            IngestStage::Summarized
        } else if main.variables.iter().any(|v| v.importance.is_some()) {
            IngestStage::Ranked
        } else if main.variables.iter().any(|v| {
            v.suggested_types
                .iter()
                .any(|s| s.provenance == PROVENANCE_SIMON)
        }) {
            IngestStage::Classified
        } else if meta.is_merged() || meta.schema_source == SchemaSource::Merged {
            IngestStage::Merged
        } else if main.has_d3m_index() {
            IngestStage::Formatted
        } else {
            IngestStage::Raw
        }
    }
}

/// One executable step of the ingest sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum IngestStep {
    Format,
    Merge,
    Clean,
    Classify,
    Rank,
    Summarize,
    Geocode,
    Featurize,
    Cluster,
}

impl IngestStep {
    pub const ALL: [IngestStep; 9] = [
        IngestStep::Format,
        IngestStep::Merge,
        IngestStep::Clean,
        IngestStep::Classify,
        IngestStep::Rank,
        IngestStep::Summarize,
        IngestStep::Geocode,
        IngestStep::Featurize,
        IngestStep::Cluster,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            IngestStep::Format => "format",
            IngestStep::Merge => "merge",
            IngestStep::Clean => "clean",
            IngestStep::Classify => "classify",
            IngestStep::Rank => "rank",
            IngestStep::Summarize => "summarize",
            IngestStep::Geocode => "geocode",
            IngestStep::Featurize => "featurize",
            IngestStep::Cluster => "cluster",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        IngestStep::ALL
            .into_iter()
            .find(|step| step.name() == value)
            .ok_or_else(|| IngestError::ConfigError {
                message: format!("Unknown ingest step '{}'", value),
            })
    }

    /// Stage a dataset is in once this step has run.
    pub fn reaches(&self) -> IngestStage {
        match self {
            IngestStep::Format => IngestStage::Formatted,
            IngestStep::Merge | IngestStep::Clean => IngestStage::Merged,
            IngestStep::Classify => IngestStage::Classified,
            IngestStep::Rank => IngestStage::Ranked,
            IngestStep::Summarize => IngestStage::Summarized,
            IngestStep::Geocode => IngestStage::Geocoded,
            IngestStep::Featurize => IngestStage::Featurized,
            IngestStep::Cluster => IngestStage::Clustered,
        }
    }

    fn writes_side_file(&self) -> bool {
        matches!(
            self,
            IngestStep::Classify | IngestStep::Rank | IngestStep::Summarize
        )
    }

    /// Whether a dataset already at `stage` can skip this step.
    fn done_at(&self, stage: IngestStage) -> bool {
        match self {
            IngestStep::Clean => stage > IngestStage::Merged,
            step => step.reaches() <= stage,
        }
    }
}

impl fmt::Display for IngestStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone)]
pub struct IngestRequest {
    pub schema_path: PathBuf,
    pub work_root: PathBuf,
    pub steps: Vec<IngestStep>,
    pub has_header: bool,
    /// Pre-merge schema used by featurize and cluster when the input is
    /// already merged.
    pub source_schema: Option<PathBuf>,
    /// Skips steps the input has already been through.
    pub resume: bool,
    pub index: bool,
    pub overwrite_index: bool,
}

impl IngestRequest {
    pub fn new(schema_path: impl Into<PathBuf>, work_root: impl Into<PathBuf>) -> Self {
        Self {
            schema_path: schema_path.into(),
            work_root: work_root.into(),
            steps: IngestStep::ALL.to_vec(),
            has_header: true,
            source_schema: None,
            resume: false,
            index: true,
            overwrite_index: false,
        }
    }

    pub fn with_steps(mut self, steps: impl IntoIterator<Item = IngestStep>) -> Self {
        let mut steps: Vec<IngestStep> = steps.into_iter().collect();
        steps.sort();
        steps.dedup();
        self.steps = steps;
        self
    }

    pub fn with_source_schema(mut self, source_schema: Option<PathBuf>) -> Self {
        self.source_schema = source_schema;
        self
    }

    pub fn with_header(mut self, has_header: bool) -> Self {
        self.has_header = has_header;
        self
    }

    pub fn resume(mut self, resume: bool) -> Self {
        self.resume = resume;
        self
    }

    pub fn index(mut self, index: bool, overwrite: bool) -> Self {
        self.index = index;
        self.overwrite_index = overwrite;
        self
    }
}

/// Outcome of one ingest run. Projection failures are reported here and do
/// not fail the run.
#[derive(Debug)]
pub struct IngestReport {
    pub dataset_id: String,
    pub schema_path: PathBuf,
    pub executed: Vec<IngestStep>,
    pub skipped: Vec<IngestStep>,
    pub stage: IngestStage,
    pub demoted: Vec<String>,
    pub num_rows: i64,
    pub num_bytes: i64,
    pub index_error: Option<IngestError>,
    pub rows_stored: Option<usize>,
    pub database_error: Option<IngestError>,
}

impl IngestReport {
    pub fn is_complete(&self) -> bool {
        self.index_error.is_none() && self.database_error.is_none()
    }

    /// Both projection failures folded into one message.
    pub fn failure_message(&self) -> Option<String> {
        let messages: Vec<String> = [
            self.index_error.as_ref().map(|e| format!("search index: {}", e)),
            self.database_error.as_ref().map(|e| format!("database: {}", e)),
        ]
        .into_iter()
        .flatten()
        .collect();
        (!messages.is_empty()).then(|| messages.join("; "))
    }
}

/// Runs the full ingest sequence for one dataset and projects the result.
pub struct IngestEngine {
    steps: StepEngine,
    index: Option<SearchIndexWriter>,
    database: Option<DatabaseWriter>,
    summarizer: Option<Summarizer>,
    summary_max_length: usize,
}

impl IngestEngine {
    pub fn new(steps: StepEngine) -> Self {
        Self {
            steps,
            index: None,
            database: None,
            summarizer: None,
            summary_max_length: crate::config::DEFAULT_SUMMARY_MAX_LENGTH,
        }
    }

    pub fn from_config(config: &IngestConfig, cancel: CancellationToken) -> Result<Self> {
        info!("Initializing ingest engine");

        let steps = StepEngine::from_config(config, cancel)?;

        let index = SearchIndexWriter::new(
            config.elastic_endpoint.clone(),
            config.elastic_index.clone(),
            config.elastic_timeout,
        )?;
        let database = match &config.database_url {
            Some(url) => Some(DatabaseWriter::new(url, config.db_batch_size)?),
            None => None,
        };
        let summarizer = match (&config.summary_api_key, &config.summary_endpoint) {
            (Some(key), Some(endpoint)) => Some(Summarizer::new(
                RestClient::new(endpoint.clone(), DEFAULT_REST_TIMEOUT)?.with_api_key(key.clone()),
                config.summary_max_length,
            )),
            (Some(_), None) => {
                return Err(IngestError::ConfigError {
                    message: "SUMMARY_API_KEY is set but SUMMARY_ENDPOINT is not".to_string(),
                })
            }
            _ => None,
        };

        info!("Ingest engine initialized successfully");
        Ok(Self::new(steps)
            .with_search_index(Some(index))
            .with_database(database)
            .with_summarizer(summarizer, config.summary_max_length))
    }

    pub fn with_search_index(mut self, index: Option<SearchIndexWriter>) -> Self {
        self.index = index;
        self
    }

    pub fn with_database(mut self, database: Option<DatabaseWriter>) -> Self {
        self.database = database;
        self
    }

    pub fn with_summarizer(mut self, summarizer: Option<Summarizer>, max_length: usize) -> Self {
        self.summarizer = summarizer;
        self.summary_max_length = max_length;
        self
    }

    pub fn steps(&self) -> &StepEngine {
        &self.steps
    }

    pub async fn run(&self, request: &IngestRequest) -> Result<IngestReport> {
        let loader = self.steps.loader();
        fs::create_dir_all(&request.work_root).map_err(|e| IngestError::io(&request.work_root, e))?;

        let detected = if request.resume {
            IngestStage::detect(&loader.load(&request.schema_path)?)
        } else {
            IngestStage::Raw
        };
        info!(
            "Ingesting {} from stage {:?} into {}",
            request.schema_path.display(),
            detected,
            request.work_root.display()
        );

        let mut current = request.schema_path.clone();
        let mut has_header = request.has_header;
        let mut source_schema = request.source_schema.clone();
        let mut classification: Option<PathBuf> = None;
        let mut importance: Option<PathBuf> = None;
        let mut summary: Option<PathBuf> = None;
        let mut executed = Vec::new();
        let mut skipped = Vec::new();

        for step in request.steps.iter().copied() {
            if request.resume && step.done_at(detected) {
                info!("Skipping {}, dataset is already {:?}", step, detected);
                skipped.push(step);
                continue;
            }
            if !step.writes_side_file() && (classification.is_some() || importance.is_some() || summary.is_some()) {
                current = self.enrich(
                    &current,
                    classification.take().as_deref(),
                    importance.take().as_deref(),
                    summary.take().as_deref(),
                    &request.work_root.join(ENRICHED_FOLDER),
                )?;
            }

            info!("Running {} on {}", step, current.display());
            let input = StepInput::new(&current).with_header(has_header);
            let folder = request.work_root.join(step.name());
            match step {
                IngestStep::Format => current = self.steps.format(&input, &folder).await?,
                IngestStep::Merge => {
                    if source_schema.is_none() {
                        source_schema = Some(current.clone());
                    }
                    current = self.steps.merge(&input, &folder).await?;
                }
                IngestStep::Clean => current = self.steps.clean(&input, &folder).await?,
                IngestStep::Classify => {
                    let path = request.work_root.join(CLASSIFICATION_FILE);
                    self.steps.classify(&input, &path).await?;
                    classification = Some(path);
                }
                IngestStep::Rank => {
                    let path = request.work_root.join(IMPORTANCE_FILE);
                    self.steps.rank(&input, &path).await?;
                    importance = Some(path);
                }
                IngestStep::Summarize => {
                    let path = request.work_root.join(SUMMARY_FILE);
                    self.steps.summarize(&input, &path).await?;
                    summary = Some(path);
                }
                IngestStep::Geocode => current = self.steps.geocode(&input, &folder).await?,
                IngestStep::Featurize => {
                    current = self
                        .steps
                        .featurize(&input, source_schema.as_deref(), &folder)
                        .await?
                }
                IngestStep::Cluster => {
                    current = self
                        .steps
                        .cluster(&input, source_schema.as_deref(), &folder)
                        .await?
                }
            }
            if !step.writes_side_file() {
                has_header = true;
            }
            executed.push(step);
        }

        if classification.is_some() || importance.is_some() || summary.is_some() {
            current = self.enrich(
                &current,
                classification.as_deref(),
                importance.as_deref(),
                summary.as_deref(),
                &request.work_root.join(ENRICHED_FOLDER),
            )?;
        }

        let mut meta = loader.load(&current)?;
        let (schema_path, data_path, demoted) = self
            .finalize(&mut meta, &current, has_header, &request.work_root.join(INGESTED_FOLDER))
            .await?;

        let mut report = IngestReport {
            dataset_id: meta.id.clone(),
            schema_path,
            executed,
            skipped,
            stage: IngestStage::detect(&meta).max(detected),
            demoted,
            num_rows: meta.num_rows,
            num_bytes: meta.num_bytes,
            index_error: None,
            rows_stored: None,
            database_error: None,
        };

        let index_projection = async {
            match &self.index {
                Some(index) if request.index => Some(
                    async {
                        index.ensure_index(request.overwrite_index).await?;
                        index.ingest_metadata(&meta).await
                    }
                    .await,
                ),
                _ => None,
            }
        };
        let database_projection = async {
            match &self.database {
                Some(database) => Some(database.ingest(&meta, &data_path, has_header).await),
                None => None,
            }
        };
        let (indexed, stored) = tokio::join!(index_projection, database_projection);

        match indexed {
            Some(Ok(_)) => {
                info!("Indexed dataset {}", meta.id);
                report.stage = IngestStage::Indexed;
            }
            Some(Err(e)) => {
                warn!("Indexing {} failed: {}", meta.id, e);
                report.index_error = Some(e);
            }
            None => {}
        }
        match stored {
            Some(Ok(rows)) => report.rows_stored = Some(rows),
            Some(Err(e)) => {
                warn!("Storing {} failed: {}", meta.id, e);
                report.database_error = Some(e);
            }
            None => {}
        }

        info!(
            "Ingest of {} finished at stage {:?} ({} rows, {} bytes)",
            report.dataset_id, report.stage, report.num_rows, report.num_bytes
        );
        Ok(report)
    }

    /// Folds side files into the schema of `current` and writes the result
    /// as a new dataset folder.
    fn enrich(
        &self,
        current: &Path,
        classification: Option<&Path>,
        importance: Option<&Path>,
        summary: Option<&Path>,
        folder: &Path,
    ) -> Result<PathBuf> {
        let loader = self.steps.loader();
        let mut meta = match classification {
            Some(path) => loader.load_from_classification(current, path)?,
            None => loader.load(current)?,
        };
        if let Some(path) = importance {
            load_importance(&mut meta, path)?;
        }
        if let Some(path) = summary {
            load_summary_machine(&mut meta, path)?;
        }
        materialize(&meta, current, folder)
    }

    /// Fills summary and statistics, verifies types and writes the final
    /// dataset. Returns the schema and main table paths along with the
    /// demoted variables.
    async fn finalize(
        &self,
        meta: &mut Metadata,
        current: &Path,
        has_header: bool,
        folder: &Path,
    ) -> Result<(PathBuf, PathBuf, Vec<String>)> {
        rest::load_summary(meta, self.summarizer.as_ref(), self.summary_max_length).await?;

        let res_path = meta.main_resource()?.res_path.clone();
        let source_data = schema_dir(current).join(&res_path);
        let demoted = verify_and_update(meta, &source_data, has_header)?;

        meta.num_rows = csv_io::count_rows(&source_data, has_header)? as i64;
        meta.num_bytes = fs::metadata(&source_data)
            .map_err(|e| IngestError::io(&source_data, e))?
            .len() as i64;

        let schema_path = materialize(meta, current, folder)?;
        Ok((schema_path, folder.join(res_path), demoted))
    }
}

/// Copies the dataset tree of `current` into `folder` and writes `meta` as
/// its schema. Files left in `folder` by an earlier run are removed first.
fn materialize(meta: &Metadata, current: &Path, folder: &Path) -> Result<PathBuf> {
    let source = schema_dir(current);
    clear_previous(folder, &source)?;
    if source != folder {
        copy_tree(&source, folder)?;
    }
    let schema_path = folder.join(SCHEMA_FILE_NAME);
    write_schema(meta, &schema_path, meta.is_merged())?;
    Ok(schema_path)
}

/// Removes `folder` unless it does not exist or holds `source`.
fn clear_previous(folder: &Path, source: &Path) -> Result<()> {
    let (Ok(folder_abs), Ok(source_abs)) = (folder.canonicalize(), source.canonicalize()) else {
        return Ok(());
    };
    if source_abs.starts_with(&folder_abs) {
        return Ok(());
    }
    match fs::remove_dir_all(folder) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(IngestError::io(folder, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_step_names_in_order() {
        let names: Vec<&str> = IngestStep::ALL.iter().map(IngestStep::name).collect();
        assert_eq!(
            names,
            ["format", "merge", "clean", "classify", "rank", "summarize", "geocode", "featurize", "cluster"]
        );
        assert_eq!(IngestStep::parse("rank").unwrap(), IngestStep::Rank);
        assert!(IngestStep::parse("index").is_err());
    }

    #[test]
    fn clean_runs_on_merged_datasets() {
        assert!(!IngestStep::Clean.done_at(IngestStage::Merged));
        assert!(IngestStep::Clean.done_at(IngestStage::Classified));
        assert!(IngestStep::Merge.done_at(IngestStage::Merged));
        assert!(!IngestStep::Geocode.done_at(IngestStage::Summarized));
    }

    #[test]
    fn request_steps_are_sorted_and_unique() {
        let request = IngestRequest::new("in/datasetDoc.json", "work")
            .with_steps([IngestStep::Cluster, IngestStep::Format, IngestStep::Cluster]);
        assert_eq!(request.steps, vec![IngestStep::Format, IngestStep::Cluster]);
    }
}
