use std::collections::BTreeMap;
use std::path::Path;

use serde::Deserialize;
use tracing::info;

use super::{malformed_output, read_output, StepEngine, StepInput};
use crate::classification::ClassificationFile;
use crate::complex_field::{parse_float_array, parse_string_array};
use crate::csv_io;
use crate::error::Result;
use crate::primitives;
use crate::rest::RestClient;

const LABELS_COLUMN: &str = "semantic_types";
const PROBABILITIES_COLUMN: &str = "probabilities";

#[derive(Debug, Deserialize)]
struct ClassifierResponse {
    labels: Vec<Vec<String>>,
    #[serde(alias = "probabilities")]
    label_probabilities: Vec<Vec<f64>>,
}

impl StepEngine {
    /// Writes per-column type labels for the dataset to `output_path`.
    pub async fn classify(&self, input: &StepInput, output_path: &Path) -> Result<ClassificationFile> {
        let meta = self.loader.load(&input.schema_path)?;
        let data_path = input.main_data_path(&meta)?;
        let columns = meta.main_resource()?.variables.len();

        let (labels, label_probabilities) = match &self.classifier_service {
            Some(service) => classify_rest(service, &data_path).await?,
            None => {
                let folder = self.primitive_folder(input, &meta)?;
                let result = self
                    .dispatcher
                    .submit(&primitives::simon(), folder.path())
                    .await?;
                parse_classification(&result)?
            }
        };

        let classification = ClassificationFile {
            path: data_path.display().to_string(),
            labels,
            label_probabilities,
        };
        classification.check_shape(columns)?;
        classification.write(output_path)?;

        info!(
            "Classified {} columns of {} into {}",
            columns,
            meta.id,
            output_path.display()
        );
        Ok(classification)
    }
}

async fn classify_rest(
    service: &RestClient,
    data_path: &Path,
) -> Result<(Vec<Vec<String>>, Vec<Vec<f64>>)> {
    let response = service.post_file("", data_path, &BTreeMap::new()).await?;
    let parsed: ClassifierResponse = serde_json::from_value(response)?;
    Ok((parsed.labels, parsed.label_probabilities))
}

/// Reads the simon output: one row per dataset column with array literal
/// cells for labels and probabilities.
fn parse_classification(path: &Path) -> Result<(Vec<Vec<String>>, Vec<Vec<f64>>)> {
    let (header, rows) = read_output(path)?;
    if header.len() < 2 {
        return Err(malformed_output(path, "expected label and probability columns"));
    }
    let labels_at = csv_io::column_position(&header, LABELS_COLUMN).unwrap_or(header.len() - 2);
    let probabilities_at =
        csv_io::column_position(&header, PROBABILITIES_COLUMN).unwrap_or(header.len() - 1);

    let mut labels = Vec::with_capacity(rows.len());
    let mut probabilities = Vec::with_capacity(rows.len());
    for row in &rows {
        let row_labels = parse_string_array(&row[labels_at])?;
        let row_probabilities = parse_float_array(&row[probabilities_at])?;
        if row_labels.len() != row_probabilities.len() {
            return Err(malformed_output(
                path,
                format!(
                    "{} labels with {} probabilities",
                    row_labels.len(),
                    row_probabilities.len()
                ),
            ));
        }
        labels.push(row_labels);
        probabilities.push(row_probabilities);
    }
    Ok((labels, probabilities))
}
