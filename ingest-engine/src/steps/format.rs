use std::path::{Path, PathBuf};

use tracing::info;

use super::{StepEngine, StepInput};
use crate::error::Result;
use crate::metadata::{
    DataResource, DistilRole, ResourceType, Variable, D3M_INDEX_NAME, INTEGER_TYPE, ROLE_INDEX,
};

/// Appends a d3mIndex column holding the 1-based row number. Returns false
/// when the resource already has one.
fn add_d3m_index(resource: &mut DataResource, rows: &mut [Vec<String>]) -> bool {
    if resource.has_d3m_index() {
        return false;
    }
    let variable = Variable::new(0, D3M_INDEX_NAME, INTEGER_TYPE)
        .with_roles(&[ROLE_INDEX])
        .with_distil_role(DistilRole::Index);
    resource.push_variable(variable);
    for (i, row) in rows.iter_mut().enumerate() {
        row.push((i + 1).to_string());
    }
    true
}

impl StepEngine {
    /// Gives the main resource a row index and turns a raw resource into a
    /// table. A dataset that already has d3mIndex is copied unchanged.
    pub async fn format(&self, input: &StepInput, output_folder: &Path) -> Result<PathBuf> {
        let (mut meta, mut rows) = self.prepare(input, output_folder)?;
        let main = meta.main_resource_mut()?;

        if main.res_type == ResourceType::Raw {
            main.res_type = ResourceType::Table;
            main.is_collection = false;
        }
        if add_d3m_index(main, &mut rows) {
            info!("Added {} to {} rows", D3M_INDEX_NAME, rows.len());
        } else {
            info!("{} already present, copying dataset", D3M_INDEX_NAME);
        }

        self.finish(&mut meta, output_folder, rows)
    }
}
