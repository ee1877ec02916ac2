use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::classification::{
    apply_classification, map_simon_type, ClassificationFile, ImportanceFile, SummaryFile,
};
use crate::csv_io;
use crate::error::{IngestError, Result};
use crate::metadata::{
    storage_name, DataResource, DistilRole, Metadata, NameNormalizer, ResourceType, SchemaSource,
    Variable, BOOL_TYPE, CATEGORICAL_TYPE, D3M_INDEX_NAME, DATETIME_TYPE, DEFAULT_RESOURCE_ID,
    FLOAT_TYPE, IMAGE_TYPE, INDEX_TYPE, INTEGER_TYPE, LATITUDE_TYPE, LONGITUDE_TYPE,
    ORDINAL_TYPE, REAL_VECTOR_TYPE, ROLE_ATTRIBUTE, STRING_TYPE, TEXT_TYPE, TIMESERIES_TYPE,
    TYPE_PROBABILITY_THRESHOLD, UNKNOWN_TYPE,
};
use crate::schema_doc::{ColumnDocument, ResFormat, ResourceDocument, SchemaDocument};

const SCALAR_TYPES: &[&str] = &[
    INDEX_TYPE,
    INTEGER_TYPE,
    FLOAT_TYPE,
    "real",
    BOOL_TYPE,
    CATEGORICAL_TYPE,
    ORDINAL_TYPE,
    TEXT_TYPE,
    STRING_TYPE,
    DATETIME_TYPE,
    UNKNOWN_TYPE,
    REAL_VECTOR_TYPE,
    LATITUDE_TYPE,
    LONGITUDE_TYPE,
    IMAGE_TYPE,
    TIMESERIES_TYPE,
];

/// Builds [`Metadata`] from the different schema variants.
#[derive(Debug, Clone)]
pub struct SchemaLoader {
    normalize_names: bool,
    threshold: f64,
}

impl Default for SchemaLoader {
    fn default() -> Self {
        Self {
            normalize_names: false,
            threshold: TYPE_PROBABILITY_THRESHOLD,
        }
    }
}

impl SchemaLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn normalize_names(mut self, enabled: bool) -> Self {
        self.normalize_names = enabled;
        self
    }

    pub fn threshold(mut self, threshold: f64) -> Self {
        self.threshold = threshold;
        self
    }

    /// Loads a merged schema when the document is flagged as merged, the
    /// original layout otherwise.
    pub fn load(&self, schema_path: &Path) -> Result<Metadata> {
        let document = SchemaDocument::read(schema_path)?;
        if document.is_merged() {
            self.merged_from_document(schema_path, document)
        } else {
            self.original_from_document(schema_path, document)
        }
    }

    pub fn load_from_original(&self, schema_path: &Path) -> Result<Metadata> {
        info!("Loading original schema from {}", schema_path.display());
        let document = SchemaDocument::read(schema_path)?;
        self.original_from_document(schema_path, document)
    }

    pub fn load_from_merged(&self, schema_path: &Path) -> Result<Metadata> {
        info!("Loading merged schema from {}", schema_path.display());
        let document = SchemaDocument::read(schema_path)?;
        self.merged_from_document(schema_path, document)
    }

    /// Loads a merged schema and folds classifier output into suggested
    /// types. An unreadable classification degrades to the merged schema.
    pub fn load_from_classification(
        &self,
        schema_path: &Path,
        classification_path: &Path,
    ) -> Result<Metadata> {
        let mut meta = self.load_from_merged(schema_path)?;

        let classification = match ClassificationFile::read(classification_path) {
            Ok(classification) => classification,
            Err(e) => {
                warn!(
                    "Unable to read classification {}, using merged schema only: {}",
                    classification_path.display(),
                    e
                );
                return Ok(meta);
            }
        };

        info!(
            "Applying classification {} to {}",
            classification_path.display(),
            meta.id
        );
        apply_classification(
            meta.main_resource_mut()?,
            &classification,
            true,
            self.threshold,
        )?;
        meta.schema_source = SchemaSource::Classification;
        Ok(meta)
    }

    /// Builds metadata from a bare CSV file using only its header.
    pub fn load_from_raw(
        &self,
        dataset_path: &Path,
        classification_path: Option<&Path>,
    ) -> Result<Metadata> {
        info!("Loading raw dataset from {}", dataset_path.display());
        let header = csv_io::read_header(dataset_path)?;

        let folder = dataset_path
            .parent()
            .and_then(Path::file_name)
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        let id = dataset_path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| folder.clone());
        let res_path = dataset_path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();

        let mut meta = Metadata::new(id.clone(), id);
        meta.raw = true;
        meta.dataset_folder = folder;
        meta.schema_source = SchemaSource::Raw;

        let mut resource = DataResource::new(DEFAULT_RESOURCE_ID, res_path, ResourceType::Table);
        let mut normalizer = NameNormalizer::new(self.normalize_names);
        for column in &header {
            let mut variable = Variable::new(0, normalizer.normalize(column), STRING_TYPE);
            variable.display_name = column.clone();
            variable.original_name = column.clone();
            resource.push_variable(variable);
        }

        if let Some(classification_path) = classification_path {
            let classification = ClassificationFile::read(classification_path)?;
            apply_classification(&mut resource, &classification, false, self.threshold)?;
        }

        meta.data_resources.push(resource);
        Ok(meta)
    }

    fn original_from_document(
        &self,
        schema_path: &Path,
        document: SchemaDocument,
    ) -> Result<Metadata> {
        let mut meta = self.header_from_document(schema_path, &document)?;
        meta.schema_source = SchemaSource::Original;

        let schema_dir = schema_dir(schema_path);
        for resource in &document.data_resources {
            let parsed = self.parse_resource(&schema_dir, resource)?;
            meta.data_resources.push(parsed);
        }

        meta.validate()?;
        Ok(meta)
    }

    fn merged_from_document(
        &self,
        schema_path: &Path,
        document: SchemaDocument,
    ) -> Result<Metadata> {
        if !document.is_merged() {
            return Err(IngestError::NotMergedSchema {
                path: schema_path.display().to_string(),
            });
        }
        if document.data_resources.len() != 1 {
            return Err(IngestError::schema(format!(
                "merged schema {} has {} data resources",
                schema_path.display(),
                document.data_resources.len()
            )));
        }

        let mut meta = self.header_from_document(schema_path, &document)?;
        meta.schema_source = SchemaSource::Merged;

        let resource = &document.data_resources[0];
        let columns = resource.columns.as_ref().ok_or_else(|| IngestError::MissingField {
            field: "columns".to_string(),
            context: schema_path.display().to_string(),
        })?;
        let mut parsed = self.resource_shell(resource)?;
        parsed.variables = self.parse_columns(columns, &parsed.res_id)?;
        meta.data_resources.push(parsed);

        // Links into resources dropped by the merge cannot be resolved.
        let known: Vec<String> = meta.data_resources.iter().map(|r| r.res_id.clone()).collect();
        for variable in &mut meta.data_resources[0].variables {
            if let Some(reference) = &variable.refers_to {
                if !known.contains(&reference.res_id) {
                    debug!(
                        "Dropping reference from {} to merged-away resource {}",
                        variable.name, reference.res_id
                    );
                    variable.refers_to = None;
                }
            }
        }

        meta.validate()?;
        Ok(meta)
    }

    fn header_from_document(&self, schema_path: &Path, document: &SchemaDocument) -> Result<Metadata> {
        let about = &document.about;
        let id = about.dataset_id.clone().ok_or_else(|| IngestError::MissingField {
            field: "about.datasetID".to_string(),
            context: schema_path.display().to_string(),
        })?;
        let name = about.dataset_name.clone().ok_or_else(|| IngestError::MissingField {
            field: "about.datasetName".to_string(),
            context: schema_path.display().to_string(),
        })?;

        let mut meta = Metadata::new(id, name);
        meta.description = about.description.clone().unwrap_or_default();
        if let Some(name) = &about.storage_name {
            meta.storage_name = storage_name(name);
        }
        meta.parent_ids = about.parent_dataset_ids.clone();
        meta.raw = about.raw_data.unwrap_or(false);
        meta.redacted = about.redacted.unwrap_or(false);
        meta.summary = about.summary.clone().unwrap_or_default();
        meta.machine_summary = about.summary_machine.clone().unwrap_or_default();
        meta.num_rows = about.num_rows.unwrap_or(0);
        meta.num_bytes = about.num_bytes.unwrap_or(0);
        meta.dataset_folder = schema_dir(schema_path)
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_default();
        Ok(meta)
    }

    fn resource_shell(&self, resource: &ResourceDocument) -> Result<DataResource> {
        let res_id = resource.res_id.clone().ok_or_else(|| IngestError::MissingField {
            field: "resID".to_string(),
            context: "dataResources".to_string(),
        })?;
        let res_path = resource.res_path.clone().ok_or_else(|| IngestError::MissingField {
            field: "resPath".to_string(),
            context: res_id.clone(),
        })?;
        let res_type = resource.res_type.as_deref().ok_or_else(|| IngestError::MissingField {
            field: "resType".to_string(),
            context: res_id.clone(),
        })?;
        let res_type = ResourceType::parse(res_type)?;

        let mut parsed = DataResource::new(res_id, res_path, res_type);
        match &resource.res_format {
            Some(ResFormat::Media(formats)) => parsed.res_format = formats.clone(),
            Some(ResFormat::Extensions(extensions)) => {
                let mut formats = BTreeMap::new();
                formats.insert(res_type.default_media_type().to_string(), extensions.clone());
                parsed.res_format = formats;
            }
            None => {}
        }
        Ok(parsed)
    }

    fn parse_resource(&self, schema_dir: &Path, resource: &ResourceDocument) -> Result<DataResource> {
        let mut parsed = self.resource_shell(resource)?;
        debug!("Parsing {} resource {}", parsed.res_type, parsed.res_id);

        match parsed.res_type {
            ResourceType::Table | ResourceType::Timeseries => {
                let columns = resource.columns.as_ref().ok_or_else(|| IngestError::MissingField {
                    field: "columns".to_string(),
                    context: parsed.res_id.clone(),
                })?;
                parsed.variables = self.parse_columns(columns, &parsed.res_id)?;
            }
            ResourceType::Image | ResourceType::Audio | ResourceType::Text => {}
            ResourceType::Raw => {
                let data_path = schema_dir.join(&parsed.res_path);
                let header = csv_io::read_header(&data_path)?;
                let mut normalizer = NameNormalizer::new(self.normalize_names);
                for column in &header {
                    let mut variable = Variable::new(0, normalizer.normalize(column), STRING_TYPE);
                    variable.display_name = column.clone();
                    variable.original_name = column.clone();
                    parsed.push_variable(variable);
                }
            }
        }
        Ok(parsed)
    }

    fn parse_columns(&self, columns: &[ColumnDocument], res_id: &str) -> Result<Vec<Variable>> {
        let mut normalizer = NameNormalizer::new(self.normalize_names);
        let mut variables = Vec::with_capacity(columns.len());

        for (position, column) in columns.iter().enumerate() {
            let context = format!("{} column {}", res_id, position);
            let raw_name = column.col_name.clone().ok_or_else(|| IngestError::MissingField {
                field: "colName".to_string(),
                context: context.clone(),
            })?;
            let col_type = column.col_type.clone().ok_or_else(|| IngestError::MissingField {
                field: "colType".to_string(),
                context: context.clone(),
            })?;
            let index = column.col_index.ok_or_else(|| IngestError::MissingField {
                field: "colIndex".to_string(),
                context,
            })?;

            if !SCALAR_TYPES.contains(&col_type.as_str()) {
                warn!(
                    "Unrecognized type '{}' for column {} of {}; keeping as declared",
                    col_type, raw_name, res_id
                );
            }
            let type_name = if col_type == STRING_TYPE {
                col_type.clone()
            } else {
                map_simon_type(&col_type)
            };

            let mut variable = Variable::new(index, normalizer.normalize(&raw_name), type_name);
            variable.display_name = column.col_display_name.clone().unwrap_or_else(|| raw_name.clone());
            variable.original_name = column.col_original_name.clone().unwrap_or(raw_name);
            variable.original_type = column.col_original_type.clone().unwrap_or(col_type);
            variable.description = column.col_description.clone().unwrap_or_default();
            variable.roles = column
                .role
                .clone()
                .filter(|roles| !roles.is_empty())
                .unwrap_or_else(|| vec![ROLE_ATTRIBUTE.to_string()]);
            variable.distil_role = parse_distil_role(column.distil_role.as_deref(), &variable.name);
            variable.refers_to = column.refers_to.clone();
            variable.importance = column.importance;
            variable.suggested_types = column.suggested_types.clone();
            variables.push(variable);
        }

        variables.sort_by_key(|v| v.index);
        Ok(variables)
    }
}

fn parse_distil_role(value: Option<&str>, name: &str) -> DistilRole {
    match value {
        Some("metadata") => DistilRole::Metadata,
        Some("index") => DistilRole::Index,
        Some("grouping") => DistilRole::Grouping,
        Some(_) => DistilRole::Data,
        None if name == D3M_INDEX_NAME => DistilRole::Index,
        None => DistilRole::Data,
    }
}

/// Folder holding the schema document; relative resource paths resolve against it.
pub fn schema_dir(schema_path: &Path) -> PathBuf {
    schema_path
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."))
}

/// Sets variable importance from a Rank output. Columns with a positive
/// score are ranked from 1 (most important); all others get 0.
pub fn load_importance(meta: &mut Metadata, importance_path: &Path) -> Result<()> {
    let importance = ImportanceFile::read(importance_path)?;
    let resource = meta.main_resource_mut()?;
    resource.reindex();

    if importance.features.len() != resource.variables.len() {
        return Err(IngestError::schema(format!(
            "importance {} has {} features for {} columns",
            importance_path.display(),
            importance.features.len(),
            resource.variables.len()
        )));
    }

    let mut ranked: Vec<usize> = (0..importance.features.len())
        .filter(|&i| importance.features[i] > 0.0)
        .collect();
    ranked.sort_by(|&a, &b| importance.features[b].total_cmp(&importance.features[a]));

    for variable in &mut resource.variables {
        variable.importance = Some(0);
    }
    for (rank, index) in ranked.into_iter().enumerate() {
        resource.variables[index].importance = Some(rank as i64 + 1);
    }
    Ok(())
}

pub fn load_summary_machine(meta: &mut Metadata, summary_path: &Path) -> Result<()> {
    let summary = SummaryFile::read(summary_path)?;
    meta.machine_summary = summary.summary;
    Ok(())
}
