use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use serde::Deserialize;
use tracing::{debug, info};

use super::{malformed_output, read_output, StepEngine, StepInput};
use crate::classification::ImportanceFile;
use crate::error::Result;
use crate::join::{get_numeric_columns, NumericProjection};
use crate::metadata::{
    DataResource, Metadata, ResourceType, SchemaSource, DEFAULT_DATA_PATH, SCHEMA_FILE_NAME,
};
use crate::primitives;
use crate::rest::RestClient;
use crate::schema_doc::write_schema;

#[derive(Debug, Deserialize)]
struct RankerResponse {
    features: Vec<f64>,
}

impl StepEngine {
    /// Scores numeric columns by importance and writes one value per
    /// dataset column to `output_path`; non-numeric columns score zero.
    pub async fn rank(&self, input: &StepInput, output_path: &Path) -> Result<ImportanceFile> {
        let meta = self.loader.load(&input.schema_path)?;
        let data_path = input.main_data_path(&meta)?;
        let main = meta.main_resource()?;
        let projection = get_numeric_columns(main, &data_path, input.has_header)?;

        let mut features = vec![0.0; main.variables.len()];
        if projection.indices.is_empty() {
            info!("{} has no numeric columns to rank", meta.id);
        } else {
            let folder = self
                .scratch_root
                .join(format!("rank-{}", uuid::Uuid::new_v4()));
            write_projection(&meta, &projection, &folder)?;

            let scores = match &self.ranker_service {
                Some(service) => rank_rest(service, &folder.join(DEFAULT_DATA_PATH)).await,
                None => self.rank_runner(&folder).await,
            };
            if let Err(e) = fs::remove_dir_all(&folder) {
                debug!("Unable to remove {}: {}", folder.display(), e);
            }

            for (position, score) in scores? {
                let column = projection.indices.get(position).ok_or_else(|| {
                    malformed_output(
                        &folder,
                        format!("ranked column {} is not in the projection", position),
                    )
                })?;
                features[*column] = score;
            }
        }

        let importance = ImportanceFile {
            path: data_path.display().to_string(),
            features,
        };
        importance.write(output_path)?;
        info!("Ranked {} into {}", meta.id, output_path.display());
        Ok(importance)
    }

    async fn rank_runner(&self, folder: &Path) -> Result<Vec<(usize, f64)>> {
        let result = self
            .dispatcher
            .submit(&primitives::pca_features(), folder)
            .await?;
        parse_ranking(&result)
    }
}

async fn rank_rest(service: &RestClient, projection: &Path) -> Result<Vec<(usize, f64)>> {
    let response = service
        .post_file("", projection, &BTreeMap::new())
        .await?;
    let parsed: RankerResponse = serde_json::from_value(response)?;
    Ok(parsed.features.into_iter().enumerate().collect())
}

/// Writes the numeric projection as a one-table dataset in `folder`.
fn write_projection(meta: &Metadata, projection: &NumericProjection, folder: &Path) -> Result<()> {
    let main = meta.main_resource()?;
    let mut resource = DataResource::new(main.res_id.clone(), DEFAULT_DATA_PATH, ResourceType::Table);
    for &index in &projection.indices {
        if let Some(variable) = main.variables.iter().find(|v| v.index == index) {
            resource.push_variable(variable.clone());
        }
    }

    let mut projected = Metadata::new(meta.id.clone(), meta.name.clone());
    projected.schema_source = SchemaSource::Merged;
    projected.data_resources.push(resource);

    projection.write(&folder.join(DEFAULT_DATA_PATH))?;
    write_schema(&projected, &folder.join(SCHEMA_FILE_NAME), true)
}

/// Reads `(colIndex, importance)` rows.
fn parse_ranking(path: &Path) -> Result<Vec<(usize, f64)>> {
    let (_, rows) = read_output(path)?;
    rows.iter()
        .map(|row| {
            let (Some(column), Some(score)) = (row.first(), row.get(1)) else {
                return Err(malformed_output(path, "expected column index and importance"));
            };
            let column = column
                .trim()
                .parse::<usize>()
                .map_err(|_| malformed_output(path, format!("bad column index '{}'", column)))?;
            let score = score
                .trim()
                .parse::<f64>()
                .map_err(|_| malformed_output(path, format!("bad importance '{}'", score)))?;
            Ok((column, score))
        })
        .collect()
}
