use std::path::Path;

use chrono::{DateTime, NaiveDate, NaiveDateTime};
use tracing::{info, warn};

use crate::csv_io;
use crate::error::Result;
use crate::metadata::{Metadata, DATETIME_TYPE, TEXT_TYPE};

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%d-%m-%Y", "%Y%m%d"];
const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
    "%Y/%m/%d %H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
    "%m/%d/%Y %H:%M",
];

pub fn is_datetime(value: &str) -> bool {
    let value = value.trim();
    if DateTime::parse_from_rfc3339(value).is_ok() || DateTime::parse_from_rfc2822(value).is_ok() {
        return true;
    }
    DATETIME_FORMATS
        .iter()
        .any(|f| NaiveDateTime::parse_from_str(value, f).is_ok())
        || DATE_FORMATS
            .iter()
            .any(|f| NaiveDate::parse_from_str(value, f).is_ok())
}

/// Demotes dateTime variables to text when any non-empty value in the main
/// table fails to parse. Returns the names of the demoted variables.
pub fn verify_and_update(meta: &mut Metadata, data_path: &Path, has_header: bool) -> Result<Vec<String>> {
    let main = meta.main_resource_mut()?;
    let mut candidates: Vec<(usize, String, bool)> = main
        .variables
        .iter()
        .filter(|v| v.type_name == DATETIME_TYPE)
        .map(|v| (v.index, v.name.clone(), true))
        .collect();
    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    csv_io::for_each_record(data_path, has_header, |record| {
        for (index, _, valid) in candidates.iter_mut().filter(|c| c.2) {
            let value = record.get(*index).unwrap_or_default();
            if !value.trim().is_empty() && !is_datetime(value) {
                *valid = false;
            }
        }
        Ok(())
    })?;

    let mut demoted = Vec::new();
    for (_, name, valid) in candidates {
        if valid {
            continue;
        }
        if let Some(variable) = main.variable_mut(&name) {
            warn!("Values of {} are not all dates, demoting to {}", name, TEXT_TYPE);
            variable.type_name = TEXT_TYPE.to_string();
        }
        demoted.push(name);
    }
    if !demoted.is_empty() {
        info!("Demoted {} dateTime variables", demoted.len());
    }
    Ok(demoted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recognizes_common_date_shapes() {
        for value in ["2019-03-01", "2019-03-01T10:00:00Z", "03/01/2019", "2019-03-01 10:00:00"] {
            assert!(is_datetime(value), "{}", value);
        }
        for value in ["yesterday", "12", "2019-13-45"] {
            assert!(!is_datetime(value), "{}", value);
        }
    }
}
