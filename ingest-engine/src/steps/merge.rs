use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::{read_output, StepEngine, StepInput};
use crate::error::Result;
use crate::metadata::{
    DataResource, Metadata, ResourceType, SchemaSource, Variable, DEFAULT_DATA_PATH, STRING_TYPE,
};
use crate::primitives;

/// Column the denormalizer adds for the file behind a media reference.
const FILENAME_FIELD: &str = "filename";

impl StepEngine {
    /// Denormalizes every resource into a single main table.
    pub async fn merge(&self, input: &StepInput, output_folder: &Path) -> Result<PathBuf> {
        let (mut meta, rows) = self.prepare(input, output_folder)?;
        if meta.is_merged() {
            info!("{} is already merged, copying dataset", meta.id);
            return self.finish(&mut meta, output_folder, rows);
        }

        let pipeline = match timeseries_reference(&meta)? {
            Some(column) => {
                let main_id = meta.main_resource()?.res_id.clone();
                primitives::timeseries_formatter(&main_id, column)
            }
            None => primitives::denormalize(),
        };
        let folder = self.primitive_folder(input, &meta)?;
        let result = self.dispatcher.submit(&pipeline, folder.path()).await?;
        let (header, merged_rows) = read_output(&result)?;

        let mut merged = merged_metadata(&meta, &header)?;
        info!(
            "Merged {} resources of {} into {} columns",
            meta.data_resources.len(),
            meta.id,
            header.len()
        );
        self.finish(&mut merged, output_folder, merged_rows)
    }
}

/// Index of the first main table column pointing at a timeseries resource.
fn timeseries_reference(meta: &Metadata) -> Result<Option<usize>> {
    let resources = meta.resources_by_id();
    let main = meta.main_resource()?;
    Ok(main.ordered_variables().into_iter().find_map(|v| {
        let target = resources.get(v.refers_to.as_ref()?.res_id.as_str())?;
        (target.res_type == ResourceType::Timeseries).then_some(v.index)
    }))
}

/// Builds the single-resource metadata matching a denormalized `header`.
/// Known columns keep their variable, `filename` inherits from the media
/// reference it expands, anything else becomes a string attribute.
fn merged_metadata(meta: &Metadata, header: &[String]) -> Result<Metadata> {
    let main = meta.main_resource()?;
    let media_reference = main.ordered_variables().into_iter().find(|v| {
        v.refers_to
            .as_ref()
            .and_then(|r| meta.resource(&r.res_id))
            .map(|target| target.is_collection)
            .unwrap_or(false)
    });

    let mut resource = DataResource::new(main.res_id.clone(), DEFAULT_DATA_PATH, ResourceType::Table);
    resource.res_format = main.res_format.clone();

    for (index, name) in header.iter().enumerate() {
        let existing = main.variable(name).or_else(|| {
            meta.data_resources
                .iter()
                .filter(|r| r.res_id != main.res_id)
                .find_map(|r| r.variable(name))
        });
        let mut variable = match (existing, media_reference) {
            (Some(variable), _) => variable.clone(),
            (None, Some(reference)) if name == FILENAME_FIELD => {
                let mut variable = reference.clone();
                variable.name = name.clone();
                variable.display_name = name.clone();
                variable
            }
            (None, _) => {
                debug!("New column {} introduced by merge", name);
                Variable::new(index, name.clone(), STRING_TYPE)
            }
        };
        variable.index = index;
        resource.variables.push(variable);
    }

    let mut merged = meta.clone();
    merged.data_resources = vec![resource];
    merged.schema_source = SchemaSource::Merged;
    Ok(merged)
}
