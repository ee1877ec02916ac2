use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::{
    append_by_key, d3m_index_position, indexed_tail, media_columns, MediaColumn, StepEngine,
    PrimitiveFolder, StepInput,
};
use crate::error::Result;
use crate::loader::schema_dir;
use crate::metadata::{DistilRole, ResourceType, Variable, CATEGORICAL_TYPE, CLUSTER_PREFIX};
use crate::primitives::{self, PipelineDescription};

/// Image inputs with fewer distinct files than this are not sent to the
/// clustering primitive; every file becomes its own cluster.
pub const SMALL_CLUSTER_INPUT: usize = 5;
const TIMESERIES_CLUSTERS: usize = 4;

impl StepEngine {
    /// Adds a `_cluster_<col>` column with the cluster id of the image or
    /// timeseries each row refers to.
    pub async fn cluster(
        &self,
        input: &StepInput,
        source_schema: Option<&Path>,
        output_folder: &Path,
    ) -> Result<PathBuf> {
        let (mut meta, mut rows) = self.prepare(input, output_folder)?;
        let source = self.source_metadata(&meta, source_schema)?;
        let primitive_folder = match source_schema {
            Some(path) => PrimitiveFolder::existing(schema_dir(path)),
            None => self.primitive_folder(input, &meta)?,
        };

        let main = meta.main_resource()?;
        let targets: Vec<MediaColumn> = media_columns(
            &meta,
            &source,
            &[ResourceType::Image, ResourceType::Timeseries],
        )?
        .into_iter()
        .filter(|c| main.variable(&format!("{}{}", CLUSTER_PREFIX, c.name)).is_none())
        .collect();
        if targets.is_empty() {
            info!("No image or timeseries columns to cluster in {}", meta.id);
            return self.finish(&mut meta, output_folder, rows);
        }
        let key = d3m_index_position(&meta)?;

        for column in targets {
            let small_input = column.res_type == ResourceType::Image
                && distinct_values(&rows, column.index) < SMALL_CLUSTER_INPUT;

            let clusters = if small_input {
                debug!("Clustering {} locally, fewer than {} files", column.name, SMALL_CLUSTER_INPUT);
                local_clusters(&rows, key, column.index)
            } else {
                let pipeline = clustering_pipeline(&column);
                let result = self.dispatcher.submit(&pipeline, primitive_folder.path()).await?;
                indexed_tail(&result, 1)?
            };
            append_by_key(&mut rows, key, &clusters, 1);

            meta.main_resource_mut()?.push_variable(
                Variable::new(0, format!("{}{}", CLUSTER_PREFIX, column.name), CATEGORICAL_TYPE)
                    .with_distil_role(DistilRole::Metadata),
            );
            info!("Clustered {} for {} rows", column.name, clusters.len());
        }

        self.finish(&mut meta, output_folder, rows)
    }
}

fn clustering_pipeline(column: &MediaColumn) -> PipelineDescription {
    match column.res_type {
        ResourceType::Timeseries => primitives::sloth(column.source_index, TIMESERIES_CLUSTERS),
        _ => primitives::unicorn(column.source_index),
    }
}

fn distinct_values(rows: &[Vec<String>], column: usize) -> usize {
    let mut seen: Vec<&str> = rows
        .iter()
        .filter_map(|row| row.get(column).map(String::as_str))
        .collect();
    seen.sort_unstable();
    seen.dedup();
    seen.len()
}

/// Numbers distinct files in order of first appearance.
fn local_clusters(rows: &[Vec<String>], key: usize, column: usize) -> HashMap<String, Vec<String>> {
    let mut ids: HashMap<&str, usize> = HashMap::new();
    let mut clusters = HashMap::with_capacity(rows.len());
    for row in rows {
        let (Some(index), Some(file)) = (row.get(key), row.get(column)) else {
            continue;
        };
        let next = ids.len();
        let id = *ids.entry(file.as_str()).or_insert(next);
        clusters.insert(index.clone(), vec![id.to_string()]);
    }
    clusters
}
