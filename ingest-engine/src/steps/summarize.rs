use std::path::Path;

use tracing::info;

use super::{read_output, StepEngine, StepInput};
use crate::classification::SummaryFile;
use crate::error::Result;
use crate::primitives;

impl StepEngine {
    /// Writes the summary tokens of the dataset, joined with `, `.
    pub async fn summarize(&self, input: &StepInput, output_path: &Path) -> Result<SummaryFile> {
        let meta = self.loader.load(&input.schema_path)?;
        let folder = self.primitive_folder(input, &meta)?;
        let result = self
            .dispatcher
            .submit(&primitives::duke(), folder.path())
            .await?;
        let (_, rows) = read_output(&result)?;

        let tokens: Vec<&str> = rows
            .iter()
            .filter_map(|row| row.first())
            .map(|token| token.trim())
            .filter(|token| !token.is_empty())
            .collect();
        let summary = SummaryFile {
            summary: tokens.join(", "),
        };
        summary.write(output_path)?;

        info!(
            "Summarized {} into {} tokens at {}",
            input.schema_path.display(),
            tokens.len(),
            output_path.display()
        );
        Ok(summary)
    }
}
