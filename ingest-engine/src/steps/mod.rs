//! Dataset rewriting steps. Every step reads a schema plus its main table,
//! writes a new folder (or a side file) and never touches its input.
//!
//! Folder-producing steps share the same shape: [`StepEngine::prepare`]
//! copies the input tree and loads the metadata, the step computes the new
//! rows and variables, and [`StepEngine::finish`] writes the table and the
//! schema back with the header derived from the ordered variables.

mod classify;
mod clean;
mod cluster;
mod featurize;
mod format;
mod geocode;
mod merge;
mod rank;
mod summarize;

pub use cluster::SMALL_CLUSTER_INPUT;

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::config::IngestConfig;
use crate::csv_io;
use crate::dispatcher::PrimitiveDispatcher;
use crate::error::{IngestError, PrimitiveError, Result};
use crate::loader::{schema_dir, SchemaLoader};
use crate::metadata::{Metadata, ResourceType, D3M_INDEX_NAME, DEFAULT_DATA_PATH, SCHEMA_FILE_NAME};
use crate::rest::{RestClient, DEFAULT_REST_TIMEOUT};
use crate::runner::GrpcRunner;
use crate::schema_doc::write_schema;

/// Recursively copies `src` into `dst`. Entries below `dst` are skipped so
/// an output folder nested inside its input does not copy itself.
pub fn copy_tree(src: &Path, dst: &Path) -> Result<()> {
    fs::create_dir_all(dst).map_err(|e| IngestError::io(dst, e))?;
    let dst_abs = dst.canonicalize().map_err(|e| IngestError::io(dst, e))?;

    let walker = WalkDir::new(src).into_iter().filter_entry(|entry| {
        entry
            .path()
            .canonicalize()
            .map(|p| p != dst_abs)
            .unwrap_or(true)
    });
    for entry in walker {
        let entry = entry?;
        let relative = entry
            .path()
            .strip_prefix(src)
            .map_err(|e| IngestError::IoError {
                message: format!("{}: {}", entry.path().display(), e),
            })?;
        let target = dst.join(relative);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target).map_err(|e| IngestError::io(&target, e))?;
        } else {
            fs::copy(entry.path(), &target).map_err(|e| IngestError::io(entry.path(), e))?;
        }
    }
    Ok(())
}

fn remove_if_exists(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(IngestError::io(path, e)),
    }
}

/// Location of a step's input dataset.
#[derive(Debug, Clone)]
pub struct StepInput {
    pub schema_path: PathBuf,
    /// Main table to read instead of the one named by the schema.
    pub data_path: Option<PathBuf>,
    pub has_header: bool,
}

impl StepInput {
    pub fn new(schema_path: impl Into<PathBuf>) -> Self {
        Self {
            schema_path: schema_path.into(),
            data_path: None,
            has_header: true,
        }
    }

    pub fn with_data_path(mut self, data_path: Option<PathBuf>) -> Self {
        self.data_path = data_path;
        self
    }

    pub fn with_header(mut self, has_header: bool) -> Self {
        self.has_header = has_header;
        self
    }

    pub fn dataset_folder(&self) -> PathBuf {
        schema_dir(&self.schema_path)
    }

    pub fn main_data_path(&self, meta: &Metadata) -> Result<PathBuf> {
        match &self.data_path {
            Some(path) => Ok(path.clone()),
            None => Ok(self.dataset_folder().join(&meta.main_resource()?.res_path)),
        }
    }

    /// True when the folder on disk is not what the step reads: the main
    /// table is overridden or has no header row.
    pub fn needs_staging(&self) -> bool {
        self.data_path.is_some() || !self.has_header
    }
}

/// Dataset folder handed to a primitive. A staged copy is removed when the
/// value is dropped.
#[derive(Debug)]
pub(crate) struct PrimitiveFolder {
    path: PathBuf,
    staged: bool,
}

impl PrimitiveFolder {
    pub(crate) fn existing(path: PathBuf) -> Self {
        Self { path, staged: false }
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for PrimitiveFolder {
    fn drop(&mut self) {
        if self.staged {
            if let Err(e) = fs::remove_dir_all(&self.path) {
                debug!("Unable to remove {}: {}", self.path.display(), e);
            }
        }
    }
}

/// Runs ingest steps against the pipeline runner and, for classification
/// and ranking, optionally against REST services.
#[derive(Clone)]
pub struct StepEngine {
    dispatcher: PrimitiveDispatcher,
    loader: SchemaLoader,
    scratch_root: PathBuf,
    classifier_service: Option<RestClient>,
    ranker_service: Option<RestClient>,
}

impl StepEngine {
    pub fn new(dispatcher: PrimitiveDispatcher) -> Self {
        Self {
            dispatcher,
            loader: SchemaLoader::new(),
            scratch_root: std::env::temp_dir(),
            classifier_service: None,
            ranker_service: None,
        }
    }

    /// Connects lazily to the configured runner and REST services.
    pub fn from_config(config: &IngestConfig, cancel: CancellationToken) -> Result<Self> {
        let runner = GrpcRunner::connect_lazy(config.runner_endpoint.clone())?;
        let dispatcher = PrimitiveDispatcher::new(Arc::new(runner))
            .with_timeout(config.runner_timeout)
            .with_cancellation(cancel);

        let rest_client = |endpoint: &Option<String>| -> Result<Option<RestClient>> {
            endpoint
                .as_ref()
                .map(|endpoint| RestClient::new(endpoint.clone(), DEFAULT_REST_TIMEOUT))
                .transpose()
        };

        Ok(Self::new(dispatcher)
            .with_loader(SchemaLoader::new().threshold(config.classification_threshold))
            .with_scratch_root(&config.tmp_data_path)
            .with_classifier_service(rest_client(&config.classifier_endpoint)?)
            .with_ranker_service(rest_client(&config.ranker_endpoint)?))
    }

    pub fn with_loader(mut self, loader: SchemaLoader) -> Self {
        self.loader = loader;
        self
    }

    /// Folder for temporary datasets such as the rank projection.
    pub fn with_scratch_root(mut self, scratch_root: impl Into<PathBuf>) -> Self {
        self.scratch_root = scratch_root.into();
        self
    }

    pub fn with_classifier_service(mut self, client: Option<RestClient>) -> Self {
        self.classifier_service = client;
        self
    }

    pub fn with_ranker_service(mut self, client: Option<RestClient>) -> Self {
        self.ranker_service = client;
        self
    }

    pub fn dispatcher(&self) -> &PrimitiveDispatcher {
        &self.dispatcher
    }

    pub fn loader(&self) -> &SchemaLoader {
        &self.loader
    }

    /// Loads the input metadata and its main rows, then copies the input
    /// tree to `output_folder` minus the files the step rewrites.
    fn prepare(&self, input: &StepInput, output_folder: &Path) -> Result<(Metadata, Vec<Vec<String>>)> {
        let meta = self.loader.load(&input.schema_path)?;
        let data_path = input.main_data_path(&meta)?;
        let rows = csv_io::read_records(&data_path, input.has_header)?;

        copy_tree(&input.dataset_folder(), output_folder)?;
        remove_if_exists(&output_folder.join(SCHEMA_FILE_NAME))?;
        remove_if_exists(&output_folder.join(&meta.main_resource()?.res_path))?;

        debug!(
            "Prepared {} rows of {} in {}",
            rows.len(),
            meta.id,
            output_folder.display()
        );
        Ok((meta, rows))
    }

    /// Folder the primitives of a step run against. Without an override the
    /// input folder is used as is; otherwise the input tree is copied under
    /// the scratch root and the main table is replaced by the override,
    /// written with the variable header.
    fn primitive_folder(&self, input: &StepInput, meta: &Metadata) -> Result<PrimitiveFolder> {
        if !input.needs_staging() {
            return Ok(PrimitiveFolder::existing(input.dataset_folder()));
        }
        let staged = PrimitiveFolder {
            path: self
                .scratch_root
                .join(format!("staged-{}", uuid::Uuid::new_v4())),
            staged: true,
        };
        copy_tree(&input.dataset_folder(), staged.path())?;

        let main = meta.main_resource()?;
        let header = main.header();
        let data_path = input.main_data_path(meta)?;
        let rows = csv_io::rewrite(
            &data_path,
            &staged.path().join(&main.res_path),
            input.has_header,
            &header,
            |record| Ok(record.iter().map(str::to_string).collect()),
        )?;
        info!(
            "Staged {} rows of {} for the runner in {}",
            rows,
            data_path.display(),
            staged.path().display()
        );
        Ok(staged)
    }

    /// Writes `rows` under the ordered variable header, points the main
    /// resource at the new table and writes the schema. Returns the new
    /// schema path.
    fn finish(&self, meta: &mut Metadata, output_folder: &Path, rows: Vec<Vec<String>>) -> Result<PathBuf> {
        let merged = meta.is_merged();
        let main = meta.main_resource_mut()?;
        main.reindex();
        main.res_path = DEFAULT_DATA_PATH.to_string();
        let header = main.header();

        csv_io::write_table(&output_folder.join(DEFAULT_DATA_PATH), &header, rows)?;
        let schema_path = output_folder.join(SCHEMA_FILE_NAME);
        write_schema(meta, &schema_path, merged)?;
        Ok(schema_path)
    }

    /// Loads `source_schema` when given; featurize and cluster resolve
    /// media collections through it after the merge dropped them.
    fn source_metadata(&self, meta: &Metadata, source_schema: Option<&Path>) -> Result<Metadata> {
        match source_schema {
            Some(path) => self.loader.load(path),
            None => Ok(meta.clone()),
        }
    }
}

/// A main table column whose values name files in a collection resource.
#[derive(Debug, Clone)]
pub(crate) struct MediaColumn {
    pub name: String,
    /// Position in the table being rewritten.
    pub index: usize,
    /// Position in the source schema the primitive runs against.
    pub source_index: usize,
    pub res_type: ResourceType,
}

/// Columns of `meta`'s main resource that refer to a collection of one of
/// `types`, resolved through `source`.
pub(crate) fn media_columns(
    meta: &Metadata,
    source: &Metadata,
    types: &[ResourceType],
) -> Result<Vec<MediaColumn>> {
    let main = meta.main_resource()?;
    let resources = source.resources_by_id();
    let mut columns = Vec::new();

    for variable in main.ordered_variables() {
        if variable.is_augmentation() {
            continue;
        }
        let in_source = source
            .main_resource()
            .ok()
            .and_then(|r| r.variable(&variable.name))
            .or_else(|| {
                source
                    .data_resources
                    .iter()
                    .find_map(|r| r.variable(&variable.name))
            });
        let reference = variable
            .refers_to
            .as_ref()
            .or_else(|| in_source.and_then(|v| v.refers_to.as_ref()));
        let Some(reference) = reference else { continue };
        if let Some(target) = resources.get(reference.res_id.as_str()) {
            if types.contains(&target.res_type) {
                columns.push(MediaColumn {
                    name: variable.name.clone(),
                    index: variable.index,
                    source_index: in_source.map(|v| v.index).unwrap_or(variable.index),
                    res_type: target.res_type,
                });
            }
        }
    }
    Ok(columns)
}

/// Header and rows of a primitive output table.
pub(crate) fn read_output(path: &Path) -> Result<(Vec<String>, Vec<Vec<String>>)> {
    let header = csv_io::read_header(path)
        .map_err(|e| e.context(format!("reading primitive output {}", path.display())))?;
    let rows = csv_io::read_records(path, true)
        .map_err(|e| e.context(format!("reading primitive output {}", path.display())))?;
    Ok((header, rows))
}

pub(crate) fn malformed_output(path: &Path, message: impl Into<String>) -> IngestError {
    PrimitiveError::MalformedOutput {
        path: path.display().to_string(),
        message: message.into(),
    }
    .into()
}

/// Maps the d3mIndex of every output row to its last `width` values.
pub(crate) fn indexed_tail(path: &Path, width: usize) -> Result<HashMap<String, Vec<String>>> {
    let (header, rows) = read_output(path)?;
    let key = csv_io::column_position(&header, D3M_INDEX_NAME).unwrap_or(0);

    let mut values = HashMap::with_capacity(rows.len());
    for row in rows {
        if row.len() < width + 1 || key >= row.len() - width {
            return Err(malformed_output(
                path,
                format!("expected a {} column and {} value columns", D3M_INDEX_NAME, width),
            ));
        }
        let tail = row[row.len() - width..].to_vec();
        values.entry(row[key].clone()).or_insert(tail);
    }
    Ok(values)
}

/// Extends every row with the values looked up by its key column, or
/// `width` empty cells when the key is absent.
pub(crate) fn append_by_key(
    rows: &mut [Vec<String>],
    key: usize,
    values: &HashMap<String, Vec<String>>,
    width: usize,
) {
    for row in rows.iter_mut() {
        match row.get(key).and_then(|k| values.get(k)) {
            Some(tail) => row.extend(tail.iter().cloned()),
            None => row.extend(std::iter::repeat(String::new()).take(width)),
        }
    }
}

/// Column position of d3mIndex, required by the steps that join results back.
pub(crate) fn d3m_index_position(meta: &Metadata) -> Result<usize> {
    meta.main_resource()?
        .variable(D3M_INDEX_NAME)
        .map(|v| v.index)
        .ok_or_else(|| {
            IngestError::schema(format!(
                "dataset {} has no {} column; run format first",
                meta.id, D3M_INDEX_NAME
            ))
        })
}
