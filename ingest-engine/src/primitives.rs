use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const DATASET_TO_DATAFRAME: &str = "d3m.primitives.data_transformation.dataset_to_dataframe.Common";
const DENORMALIZE: &str = "d3m.primitives.data_transformation.denormalize.Common";
const TIMESERIES_FORMATTER: &str =
    "d3m.primitives.data_preprocessing.data_cleaning.DistilTimeSeriesFormatter";
const DATA_CLEANING: &str = "d3m.primitives.data_cleaning.data_cleaning.Datacleaning";
const SIMON: &str = "d3m.primitives.data_cleaning.column_type_profiler.Simon";
const PCA_FEATURES: &str = "d3m.primitives.feature_selection.pca_features.Pcafeatures";
const DUKE: &str = "d3m.primitives.data_cleaning.text_summarization.Duke";
const GOAT_FORWARD: &str = "d3m.primitives.data_cleaning.geocoding.Goat_forward";
const CROC: &str = "d3m.primitives.digital_image_processing.croc.Croc";
const UNICORN: &str = "d3m.primitives.digital_image_processing.unicorn.Unicorn";
const SLOTH: &str = "d3m.primitives.time_series_segmentation.cluster.Sloth";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PrimitiveRef {
    pub python_path: String,
    pub name: String,
    pub version: String,
}

impl PrimitiveRef {
    fn new(python_path: &str) -> Self {
        let name = python_path.rsplit('.').next().unwrap_or(python_path);
        Self {
            python_path: python_path.to_string(),
            name: name.to_lowercase(),
            version: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineStep {
    pub primitive: PrimitiveRef,
    pub hyperparams: BTreeMap<String, String>,
}

/// Linear pipeline: each step consumes the previous step's output and the
/// last step is exposed as `outputs.0`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineDescription {
    pub id: String,
    pub name: String,
    pub description: String,
    pub steps: Vec<PipelineStep>,
}

impl PipelineDescription {
    fn linear(name: &str, description: &str, steps: Vec<PipelineStep>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            description: description.to_string(),
            steps,
        }
    }

    /// Python path of the primitive doing the work.
    pub fn primitive(&self) -> Option<&str> {
        self.steps.last().map(|s| s.primitive.python_path.as_str())
    }

    /// Data reference consumed by step `i`.
    pub fn step_input(i: usize) -> String {
        if i == 0 {
            "inputs.0".to_string()
        } else {
            format!("steps.{}.produce", i - 1)
        }
    }

    pub fn output_reference(&self) -> String {
        format!("steps.{}.produce", self.steps.len().saturating_sub(1))
    }
}

fn step(python_path: &str) -> PipelineStep {
    PipelineStep {
        primitive: PrimitiveRef::new(python_path),
        hyperparams: BTreeMap::new(),
    }
}

fn step_with(python_path: &str, hyperparams: &[(&str, String)]) -> PipelineStep {
    PipelineStep {
        primitive: PrimitiveRef::new(python_path),
        hyperparams: hyperparams
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect(),
    }
}

fn column_list(columns: &[usize]) -> String {
    let parts: Vec<String> = columns.iter().map(usize::to_string).collect();
    format!("[{}]", parts.join(","))
}

pub fn denormalize() -> PipelineDescription {
    PipelineDescription::linear(
        "denormalize",
        "Denormalize a multi-resource dataset into a single table",
        vec![step(DENORMALIZE), step(DATASET_TO_DATAFRAME)],
    )
}

pub fn timeseries_formatter(main_resource: &str, file_column: usize) -> PipelineDescription {
    PipelineDescription::linear(
        "timeseries_formatter",
        "Inline timeseries files into the main table",
        vec![
            step_with(
                TIMESERIES_FORMATTER,
                &[
                    ("main_resource_index", main_resource.to_string()),
                    ("file_col_index", file_column.to_string()),
                ],
            ),
            step(DATASET_TO_DATAFRAME),
        ],
    )
}

pub fn data_cleaning() -> PipelineDescription {
    PipelineDescription::linear(
        "data_cleaning",
        "Clean table values",
        vec![step(DATASET_TO_DATAFRAME), step(DATA_CLEANING)],
    )
}

pub fn simon() -> PipelineDescription {
    PipelineDescription::linear(
        "simon",
        "Classify column semantic types",
        vec![
            step(DATASET_TO_DATAFRAME),
            step_with(SIMON, &[("statistical_classification", "true".to_string())]),
        ],
    )
}

pub fn pca_features() -> PipelineDescription {
    PipelineDescription::linear(
        "pca_features",
        "Rank numeric columns by principal component contribution",
        vec![step(DATASET_TO_DATAFRAME), step(PCA_FEATURES)],
    )
}

pub fn duke() -> PipelineDescription {
    PipelineDescription::linear(
        "duke",
        "Summarize dataset content",
        vec![step(DATASET_TO_DATAFRAME), step(DUKE)],
    )
}

pub fn goat_forward(column: usize) -> PipelineDescription {
    PipelineDescription::linear(
        "goat_forward",
        "Forward geocode a location column",
        vec![
            step(DATASET_TO_DATAFRAME),
            step_with(GOAT_FORWARD, &[("target_columns", column_list(&[column]))]),
        ],
    )
}

pub fn croc(column: usize) -> PipelineDescription {
    PipelineDescription::linear(
        "croc",
        "Detect objects and text in images",
        vec![
            step(DATASET_TO_DATAFRAME),
            step_with(CROC, &[("target_columns", column_list(&[column]))]),
        ],
    )
}

pub fn unicorn(column: usize) -> PipelineDescription {
    PipelineDescription::linear(
        "unicorn",
        "Cluster images",
        vec![
            step(DATASET_TO_DATAFRAME),
            step_with(UNICORN, &[("target_columns", column_list(&[column]))]),
        ],
    )
}

pub fn sloth(column: usize, clusters: usize) -> PipelineDescription {
    PipelineDescription::linear(
        "sloth",
        "Cluster timeseries",
        vec![
            step(DATASET_TO_DATAFRAME),
            step_with(
                SLOTH,
                &[
                    ("target_columns", column_list(&[column])),
                    ("nclusters", clusters.to_string()),
                ],
            ),
        ],
    )
}
