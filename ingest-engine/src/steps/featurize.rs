use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::{
    append_by_key, d3m_index_position, indexed_tail, media_columns, PrimitiveFolder, StepEngine,
    StepInput,
};
use crate::error::Result;
use crate::loader::schema_dir;
use crate::metadata::{DistilRole, ResourceType, Variable, FEATURE_PREFIX, TEXT_TYPE};
use crate::primitives;
use crate::pydict;

impl StepEngine {
    /// Adds a `_feature_<col>` column with the labels detected in the image
    /// each row refers to. `source_schema` is the pre-merge schema used to
    /// find the image collections.
    pub async fn featurize(
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
        let targets: Vec<_> = media_columns(&meta, &source, &[ResourceType::Image])?
            .into_iter()
            .filter(|c| main.variable(&format!("{}{}", FEATURE_PREFIX, c.name)).is_none())
            .collect();
        if targets.is_empty() {
            info!("No image columns to featurize in {}", meta.id);
            return self.finish(&mut meta, output_folder, rows);
        }
        let key = d3m_index_position(&meta)?;

        for column in targets {
            debug!("Featurizing images referenced by {}", column.name);
            let result = self
                .dispatcher
                .submit(&primitives::croc(column.source_index), primitive_folder.path())
                .await?;

            let mut features = HashMap::new();
            for (index, values) in indexed_tail(&result, 1)? {
                let literal = values.into_iter().next().unwrap_or_default();
                let joined = if literal.trim().is_empty() {
                    String::new()
                } else {
                    pydict::joined_values(&literal)?
                };
                features.insert(index, vec![joined]);
            }
            append_by_key(&mut rows, key, &features, 1);

            meta.main_resource_mut()?.push_variable(
                Variable::new(0, format!("{}{}", FEATURE_PREFIX, column.name), TEXT_TYPE)
                    .with_distil_role(DistilRole::Metadata),
            );
            info!("Featurized {} for {} rows", column.name, features.len());
        }

        self.finish(&mut meta, output_folder, rows)
    }
}
