use std::path::{Path, PathBuf};

use tracing::info;

use super::{read_output, StepEngine, StepInput};
use crate::csv_io;
use crate::error::{IngestError, Result};
use crate::primitives;

impl StepEngine {
    /// Replaces the main table with the cleaned output, columns realigned
    /// to the existing variables.
    pub async fn clean(&self, input: &StepInput, output_folder: &Path) -> Result<PathBuf> {
        let (mut meta, _) = self.prepare(input, output_folder)?;

        let folder = self.primitive_folder(input, &meta)?;
        let result = self
            .dispatcher
            .submit(&primitives::data_cleaning(), folder.path())
            .await?;
        let (header, cleaned) = read_output(&result)?;

        let positions = meta
            .main_resource()?
            .header()
            .iter()
            .map(|name| {
                csv_io::column_position(&header, name).ok_or_else(|| {
                    IngestError::csv(format!(
                        "cleaned output {} has no column {}",
                        result.display(),
                        name
                    ))
                })
            })
            .collect::<Result<Vec<usize>>>()?;

        let rows: Vec<Vec<String>> = cleaned
            .into_iter()
            .map(|row| {
                positions
                    .iter()
                    .map(|&p| row.get(p).cloned().unwrap_or_default())
                    .collect()
            })
            .collect();

        info!("Cleaned {} rows of {}", rows.len(), meta.id);
        self.finish(&mut meta, output_folder, rows)
    }
}
