use std::collections::HashMap;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use super::{append_by_key, d3m_index_position, indexed_tail, malformed_output, StepEngine, StepInput};
use crate::error::Result;
use crate::metadata::{
    DistilRole, Variable, LATITUDE_TYPE, LAT_PREFIX, LOCATION_TYPES, LONGITUDE_TYPE, LON_PREFIX,
};
use crate::primitives;

impl StepEngine {
    /// Forward geocodes every location column into `_lat_<col>` and
    /// `_lon_<col>` columns. Columns geocoded by an earlier run are skipped.
    pub async fn geocode(&self, input: &StepInput, output_folder: &Path) -> Result<PathBuf> {
        let (mut meta, mut rows) = self.prepare(input, output_folder)?;
        let key = d3m_index_position(&meta)?;

        let main = meta.main_resource()?;
        let candidates: Vec<(String, usize)> = main
            .ordered_variables()
            .into_iter()
            .filter(|v| !v.is_augmentation() && v.suggests_any(LOCATION_TYPES))
            .filter(|v| main.variable(&format!("{}{}", LAT_PREFIX, v.name)).is_none())
            .map(|v| (v.name.clone(), v.index))
            .collect();

        if candidates.is_empty() {
            info!("No location columns to geocode in {}", meta.id);
            return self.finish(&mut meta, output_folder, rows);
        }
        let folder = self.primitive_folder(input, &meta)?;

        for (name, index) in candidates {
            debug!("Geocoding column {}", name);
            let result = self
                .dispatcher
                .submit(&primitives::goat_forward(index), folder.path())
                .await?;
            let coordinates = format_coordinates(&result, indexed_tail(&result, 2)?)?;
            append_by_key(&mut rows, key, &coordinates, 2);

            let main = meta.main_resource_mut()?;
            main.push_variable(
                Variable::new(0, format!("{}{}", LAT_PREFIX, name), LATITUDE_TYPE)
                    .with_distil_role(DistilRole::Metadata),
            );
            main.push_variable(
                Variable::new(0, format!("{}{}", LON_PREFIX, name), LONGITUDE_TYPE)
                    .with_distil_role(DistilRole::Metadata),
            );
            info!("Geocoded {} into {} rows", name, coordinates.len());
        }

        self.finish(&mut meta, output_folder, rows)
    }
}

/// Rewrites coordinates with six decimals; empty cells stay empty.
fn format_coordinates(
    path: &Path,
    values: HashMap<String, Vec<String>>,
) -> Result<HashMap<String, Vec<String>>> {
    values
        .into_iter()
        .map(|(key, pair)| {
            let formatted = pair
                .iter()
                .map(|value| {
                    let value = value.trim();
                    if value.is_empty() {
                        return Ok(String::new());
                    }
                    value
                        .parse::<f64>()
                        .map(|v| format!("{:.6}", v))
                        .map_err(|_| malformed_output(path, format!("bad coordinate '{}'", value)))
                })
                .collect::<Result<Vec<String>>>()?;
            Ok((key, formatted))
        })
        .collect()
}
