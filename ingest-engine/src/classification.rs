use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

use crate::error::{IngestError, Result};
use crate::metadata::{
    DataResource, SuggestedType, ADDRESS_TYPE, BOOL_TYPE, CATEGORICAL_TYPE, CITY_TYPE,
    COUNTRY_CODE_TYPE, COUNTRY_TYPE, DATETIME_TYPE, EMAIL_TYPE, FLOAT_TYPE, IMAGE_TYPE,
    INTEGER_TYPE, LATITUDE_TYPE, LONGITUDE_TYPE, ORDINAL_TYPE, PHONE_TYPE, POSTAL_CODE_TYPE,
    PROVENANCE_SCHEMA, PROVENANCE_SIMON, SCHEMA_PROBABILITY, STATE_TYPE, STRING_TYPE,
    TEXT_TYPE, UNKNOWN_TYPE, URI_TYPE,
};

/// Weight applied to complex (non-basic) simon suggestions.
pub const COMPLEX_TYPE_WEIGHT: f64 = 1.5;

const BASIC_TYPES: &[&str] = &[
    INTEGER_TYPE,
    FLOAT_TYPE,
    CATEGORICAL_TYPE,
    BOOL_TYPE,
    TEXT_TYPE,
    ORDINAL_TYPE,
    DATETIME_TYPE,
];

/// Per-column type labels emitted by the Classify step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationFile {
    pub path: String,
    pub labels: Vec<Vec<String>>,
    #[serde(alias = "probabilities")]
    pub label_probabilities: Vec<Vec<f64>>,
}

impl ClassificationFile {
    pub fn read(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| IngestError::io(path, e))?;
        serde_json::from_str(&content).map_err(|e| IngestError::Classification {
            message: format!("malformed classification {}: {}", path.display(), e),
        })
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        write_json(path, self)
    }

    pub fn check_shape(&self, columns: usize) -> Result<()> {
        if self.labels.len() != columns || self.label_probabilities.len() != columns {
            return Err(IngestError::Classification {
                message: format!(
                    "classification has {} label rows and {} probability rows for {} columns",
                    self.labels.len(),
                    self.label_probabilities.len(),
                    columns
                ),
            });
        }
        Ok(())
    }
}

/// Maps a simon label onto the semantic type taxonomy. Unrecognized labels
/// pass through unchanged.
pub fn map_simon_type(label: &str) -> String {
    let mapped = match label {
        "int" | "integer" => INTEGER_TYPE,
        "float" | "real" => FLOAT_TYPE,
        "bool" | "boolean" => BOOL_TYPE,
        "categorical" => CATEGORICAL_TYPE,
        "ordinal" => ORDINAL_TYPE,
        "datetime" | "date" | "dateTime" => DATETIME_TYPE,
        "text" | "string" => TEXT_TYPE,
        "email" => EMAIL_TYPE,
        "phone" => PHONE_TYPE,
        "uri" | "url" => URI_TYPE,
        "address" => ADDRESS_TYPE,
        "city" => CITY_TYPE,
        "state" => STATE_TYPE,
        "country" => COUNTRY_TYPE,
        "country_code" => COUNTRY_CODE_TYPE,
        "postal_code" | "zip" => POSTAL_CODE_TYPE,
        "latitude" => LATITUDE_TYPE,
        "longitude" => LONGITUDE_TYPE,
        "image" => IMAGE_TYPE,
        other => return other.to_string(),
    };
    mapped.to_string()
}

pub fn is_basic_type(type_name: &str) -> bool {
    BASIC_TYPES.contains(&type_name)
}

/// Builds the suggestion list for one column. `schema_type` adds the schema
/// declared type with the sentinel probability.
pub fn suggested_types(
    labels: &[String],
    probabilities: &[f64],
    schema_type: Option<&str>,
) -> Result<Vec<SuggestedType>> {
    if labels.len() != probabilities.len() {
        return Err(IngestError::Classification {
            message: format!(
                "{} labels but {} probabilities",
                labels.len(),
                probabilities.len()
            ),
        });
    }

    let mut suggested: Vec<SuggestedType> = labels
        .iter()
        .zip(probabilities)
        .map(|(label, probability)| {
            let type_name = map_simon_type(label);
            let probability = if is_basic_type(&type_name) {
                *probability
            } else {
                probability * COMPLEX_TYPE_WEIGHT
            };
            SuggestedType::new(type_name, probability, PROVENANCE_SIMON)
        })
        .collect();

    if let Some(schema_type) = schema_type {
        if schema_type != UNKNOWN_TYPE && schema_type != STRING_TYPE && !schema_type.is_empty() {
            suggested.push(SuggestedType::new(
                schema_type,
                SCHEMA_PROBABILITY,
                PROVENANCE_SCHEMA,
            ));
        }
    }

    suggested.sort_by(|a, b| b.probability.total_cmp(&a.probability));
    Ok(suggested)
}

/// Folds a classification into the variables of `resource`, in column order.
pub fn apply_classification(
    resource: &mut DataResource,
    classification: &ClassificationFile,
    include_schema_type: bool,
    threshold: f64,
) -> Result<()> {
    classification.check_shape(resource.variables.len())?;

    resource.reindex();
    for (i, variable) in resource.variables.iter_mut().enumerate() {
        let schema_type = include_schema_type.then(|| variable.type_name.clone());
        let suggested = suggested_types(
            &classification.labels[i],
            &classification.label_probabilities[i],
            schema_type.as_deref(),
        )
        .map_err(|e| e.context(format!("column {}", variable.name)))?;
        variable.apply_suggested_types(suggested, threshold);
    }
    Ok(())
}

/// Column importance emitted by the Rank step, aligned to dataset columns.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImportanceFile {
    pub path: String,
    pub features: Vec<f64>,
}

impl ImportanceFile {
    pub fn read(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| IngestError::io(path, e))?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        write_json(path, self)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SummaryFile {
    pub summary: String,
}

impl SummaryFile {
    pub fn read(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path).map_err(|e| IngestError::io(path, e))?;
        Ok(serde_json::from_str(&content)?)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        write_json(path, self)
    }
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let content = serde_json::to_string(value)?;
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| IngestError::io(parent, e))?;
    }
    fs::write(path, content).map_err(|e| IngestError::io(path, e))
}
