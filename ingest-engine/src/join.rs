use std::collections::HashMap;
use std::path::Path;
use tracing::info;

use crate::csv_io;
use crate::error::{IngestError, Result};
use crate::metadata::{DataResource, FLOAT_TYPE, INTEGER_TYPE};

#[derive(Debug, Clone, PartialEq)]
pub struct JoinResult {
    pub rows: Vec<Vec<String>>,
    /// Left rows written.
    pub success: usize,
    /// Left rows whose key had no match on the right.
    pub missed: usize,
}

impl JoinResult {
    pub fn write(&self, output: &Path) -> Result<()> {
        csv_io::write_table(output, &[], self.rows.iter().cloned())
    }
}

/// Left joins `left` to `right` on `left_col == right_col`. Matched rows are
/// extended with the right row minus its key column, unmatched rows with
/// empty fields. Header rows are skipped when `has_header` is set and the
/// output has no header.
pub fn left_join(
    left: &Path,
    left_col: usize,
    right: &Path,
    right_col: usize,
    has_header: bool,
) -> Result<JoinResult> {
    let mut lookup: HashMap<String, Vec<String>> = HashMap::new();
    let mut right_width = 0;
    csv_io::for_each_record(right, has_header, |record| {
        let key = record.get(right_col).ok_or_else(|| {
            IngestError::csv(format!(
                "right row has no column {} in {}",
                right_col,
                right.display()
            ))
        })?;
        let tail: Vec<String> = record
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != right_col)
            .map(|(_, v)| v.to_string())
            .collect();
        right_width = right_width.max(tail.len());
        lookup.entry(key.to_string()).or_insert(tail);
        Ok(())
    })?;

    let mut rows = Vec::new();
    let mut missed = 0;
    csv_io::for_each_record(left, has_header, |record| {
        let key = record.get(left_col).ok_or_else(|| {
            IngestError::csv(format!(
                "left row has no column {} in {}",
                left_col,
                left.display()
            ))
        })?;
        let mut row: Vec<String> = record.iter().map(str::to_string).collect();
        match lookup.get(key) {
            Some(tail) => {
                row.extend(tail.iter().cloned());
                row.resize(record.len() + right_width, String::new());
            }
            None => {
                missed += 1;
                row.resize(record.len() + right_width, String::new());
            }
        }
        rows.push(row);
        Ok(())
    })?;

    info!(
        "Joined {} rows from {} ({} without match)",
        rows.len(),
        left.display(),
        missed
    );
    let success = rows.len();
    Ok(JoinResult {
        rows,
        success,
        missed,
    })
}

/// Numeric-only view of a table used for ranking.
#[derive(Debug, Clone, PartialEq)]
pub struct NumericProjection {
    pub header: Vec<String>,
    /// Dataset column index of every projected column.
    pub indices: Vec<usize>,
    pub rows: Vec<Vec<String>>,
}

impl NumericProjection {
    pub fn write(&self, output: &Path) -> Result<()> {
        csv_io::write_table(output, &self.header, self.rows.iter().cloned())
    }
}

/// Projects `data_path` to the integer and float columns of `resource`.
/// Empty cells take the previous row's value, or "0" when there is none.
pub fn get_numeric_columns(
    resource: &DataResource,
    data_path: &Path,
    has_header: bool,
) -> Result<NumericProjection> {
    let numeric: Vec<(usize, String)> = resource
        .ordered_variables()
        .into_iter()
        .filter(|v| v.type_name == INTEGER_TYPE || v.type_name == FLOAT_TYPE)
        .map(|v| (v.index, v.name.clone()))
        .collect();

    let indices: Vec<usize> = numeric.iter().map(|(i, _)| *i).collect();
    let header: Vec<String> = numeric.into_iter().map(|(_, name)| name).collect();

    let mut previous: Vec<String> = vec![String::new(); indices.len()];
    let mut rows = Vec::new();
    csv_io::for_each_record(data_path, has_header, |record| {
        let mut row = Vec::with_capacity(indices.len());
        for (slot, &index) in indices.iter().enumerate() {
            let value = record.get(index).unwrap_or_default();
            let value = if !value.is_empty() {
                value.to_string()
            } else if !previous[slot].is_empty() {
                previous[slot].clone()
            } else {
                "0".to_string()
            };
            previous[slot] = record.get(index).unwrap_or_default().to_string();
            row.push(value);
        }
        rows.push(row);
        Ok(())
    })?;

    Ok(NumericProjection {
        header,
        indices,
        rows,
    })
}
