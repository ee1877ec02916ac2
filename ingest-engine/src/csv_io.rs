use csv::{ReaderBuilder, StringRecord, Writer, WriterBuilder};
use std::fs::{self, File};
use std::path::Path;

use crate::error::{IngestError, Result};

pub fn open_reader(path: &Path, has_header: bool) -> Result<csv::Reader<File>> {
    let file = File::open(path).map_err(|e| IngestError::io(path, e))?;
    Ok(ReaderBuilder::new()
        .has_headers(has_header)
        .flexible(false)
        .from_reader(file))
}

/// Creates the parent folder and opens a CSV writer on `path`.
pub fn open_writer(path: &Path) -> Result<Writer<File>> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| IngestError::io(parent, e))?;
    }
    let file = File::create(path).map_err(|e| IngestError::io(path, e))?;
    Ok(WriterBuilder::new().from_writer(file))
}

pub fn read_header(path: &Path) -> Result<Vec<String>> {
    let mut reader = open_reader(path, true)?;
    let header = reader.headers()?;
    if header.is_empty() {
        return Err(IngestError::csv(format!("{} has no header row", path.display())));
    }
    Ok(header.iter().map(str::to_string).collect())
}

/// Reads every data row, skipping the header when `has_header` is set.
pub fn read_records(path: &Path, has_header: bool) -> Result<Vec<Vec<String>>> {
    let mut rows = Vec::new();
    for_each_record(path, has_header, |record| {
        rows.push(record.iter().map(str::to_string).collect());
        Ok(())
    })?;
    Ok(rows)
}

/// Streams the data rows of `path` through `visit`.
pub fn for_each_record<F>(path: &Path, has_header: bool, mut visit: F) -> Result<()>
where
    F: FnMut(&StringRecord) -> Result<()>,
{
    let mut reader = open_reader(path, has_header)?;
    let mut record = StringRecord::new();
    while reader.read_record(&mut record)? {
        visit(&record)?;
    }
    Ok(())
}

pub fn write_table<I>(path: &Path, header: &[String], rows: I) -> Result<()>
where
    I: IntoIterator<Item = Vec<String>>,
{
    let mut writer = open_writer(path)?;
    if !header.is_empty() {
        writer.write_record(header)?;
    }
    for row in rows {
        if !header.is_empty() && row.len() != header.len() {
            return Err(IngestError::csv(format!(
                "row has {} fields but header has {} in {}",
                row.len(),
                header.len(),
                path.display()
            )));
        }
        writer.write_record(&row)?;
    }
    writer.flush().map_err(|e| IngestError::io(path, e))?;
    Ok(())
}

/// Streams `input` into `output` with a new header, mapping every data row.
/// Returns the number of rows written.
pub fn rewrite<F>(
    input: &Path,
    output: &Path,
    has_header: bool,
    header: &[String],
    mut transform: F,
) -> Result<usize>
where
    F: FnMut(&StringRecord) -> Result<Vec<String>>,
{
    // Read fully first: `output` may be the same file as `input`.
    let mut rows = Vec::new();
    for_each_record(input, has_header, |record| {
        let row = transform(record)?;
        if row.len() != header.len() {
            return Err(IngestError::csv(format!(
                "transformed row has {} fields but header has {}",
                row.len(),
                header.len()
            )));
        }
        rows.push(row);
        Ok(())
    })?;

    let count = rows.len();
    write_table(output, header, rows)?;
    Ok(count)
}

pub fn count_rows(path: &Path, has_header: bool) -> Result<usize> {
    let mut count = 0;
    for_each_record(path, has_header, |_| {
        count += 1;
        Ok(())
    })?;
    Ok(count)
}

/// Column lookup by name in a header row.
pub fn column_position(header: &[String], name: &str) -> Option<usize> {
    header.iter().position(|h| h == name)
}
