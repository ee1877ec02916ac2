use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;
use tracing::info;

use crate::error::{IngestError, Result};
use crate::metadata::{DataResource, Metadata, SuggestedType, Variable, VariableRef};

pub const SCHEMA_VERSION: &str = "3.1.1";
pub const DEFAULT_LICENSE: &str = "Unknown";

/// `"true"`/`"false"` flags are written as strings but older documents use booleans.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Flag {
    Bool(bool),
    Text(String),
}

impl Flag {
    pub fn is_set(&self) -> bool {
        match self {
            Flag::Bool(value) => *value,
            Flag::Text(value) => value.eq_ignore_ascii_case("true"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ResFormat {
    Media(BTreeMap<String, Vec<String>>),
    Extensions(Vec<String>),
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AboutDocument {
    #[serde(rename = "datasetID", skip_serializing_if = "Option::is_none")]
    pub dataset_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_name: Option<String>,
    #[serde(
        rename = "parentDatasetIDs",
        default,
        skip_serializing_if = "Vec::is_empty"
    )]
    pub parent_dataset_ids: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub raw_data: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redacted: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dataset_schema_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub license: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merged_schema: Option<Flag>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary_machine: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_rows: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_bytes: Option<i64>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDocument {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub col_index: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub col_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub col_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub col_description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub distil_role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub refers_to: Option<VariableRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub col_display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub col_original_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub col_original_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub importance: Option<i64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggested_types: Vec<SuggestedType>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceDocument {
    #[serde(rename = "resID", default, skip_serializing_if = "Option::is_none")]
    pub res_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub res_path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub res_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub res_format: Option<ResFormat>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub is_collection: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub columns: Option<Vec<ColumnDocument>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SchemaDocument {
    pub about: AboutDocument,
    #[serde(default)]
    pub data_resources: Vec<ResourceDocument>,
}

impl SchemaDocument {
    pub fn read(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| IngestError::io(path, e))?;
        serde_json::from_str(&content).map_err(|e| {
            IngestError::schema(format!("malformed schema {}: {}", path.display(), e))
        })
    }

    pub fn is_merged(&self) -> bool {
        self.about
            .merged_schema
            .as_ref()
            .map(Flag::is_set)
            .unwrap_or(false)
    }

    /// Builds the document for `meta`. A merged document carries only the
    /// main resource.
    pub fn from_metadata(meta: &Metadata, merged: bool) -> Result<Self> {
        let data_resources = if merged {
            vec![ResourceDocument::from(meta.main_resource()?)]
        } else {
            meta.data_resources.iter().map(ResourceDocument::from).collect()
        };

        Ok(Self {
            about: AboutDocument {
                dataset_id: Some(meta.id.clone()),
                dataset_name: Some(meta.name.clone()),
                description: Some(meta.description.clone()),
                storage_name: non_empty(&meta.storage_name),
                parent_dataset_ids: meta.parent_ids.clone(),
                raw_data: Some(meta.raw),
                redacted: Some(meta.redacted),
                dataset_schema_version: Some(SCHEMA_VERSION.to_string()),
                license: Some(DEFAULT_LICENSE.to_string()),
                merged_schema: Some(Flag::Text(merged.to_string())),
                summary: non_empty(&meta.summary),
                summary_machine: non_empty(&meta.machine_summary),
                num_rows: (meta.num_rows > 0).then_some(meta.num_rows),
                num_bytes: (meta.num_bytes > 0).then_some(meta.num_bytes),
            },
            data_resources,
        })
    }
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}

impl From<&Variable> for ColumnDocument {
    fn from(variable: &Variable) -> Self {
        Self {
            col_index: Some(variable.index),
            col_name: Some(variable.name.clone()),
            col_type: Some(variable.type_name.clone()),
            col_description: non_empty(&variable.description),
            role: Some(variable.roles.clone()),
            distil_role: Some(variable.distil_role.as_str().to_string()),
            refers_to: variable.refers_to.clone(),
            col_display_name: non_empty(&variable.display_name),
            col_original_name: non_empty(&variable.original_name),
            col_original_type: non_empty(&variable.original_type),
            importance: variable.importance,
            suggested_types: variable.suggested_types.clone(),
        }
    }
}

impl From<&DataResource> for ResourceDocument {
    fn from(resource: &DataResource) -> Self {
        let columns = if resource.variables.is_empty() && resource.is_collection {
            None
        } else {
            Some(
                resource
                    .ordered_variables()
                    .into_iter()
                    .map(ColumnDocument::from)
                    .collect(),
            )
        };

        Self {
            res_id: Some(resource.res_id.clone()),
            res_path: Some(resource.res_path.clone()),
            res_type: Some(resource.res_type.as_str().to_string()),
            res_format: Some(ResFormat::Media(resource.res_format.clone())),
            is_collection: Some(resource.is_collection),
            columns,
        }
    }
}

/// Writes `meta` as a schema document at `path`, creating parent folders.
pub fn write_schema(meta: &Metadata, path: &Path, merged: bool) -> Result<()> {
    info!("Writing {} schema to {}", if merged { "merged" } else { "full" }, path.display());

    let document = SchemaDocument::from_metadata(meta, merged)?;
    let content = serde_json::to_string_pretty(&document)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| IngestError::io(parent, e))?;
    }
    fs::write(path, content).map_err(|e| IngestError::io(path, e))?;
    Ok(())
}
