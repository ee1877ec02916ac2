use std::path::{Path, PathBuf};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tracing::{debug, info};

use crate::csv_io;
use crate::error::Result;
use crate::loader::{schema_dir, SchemaLoader};
use crate::metadata::SCHEMA_FILE_NAME;
use crate::steps::copy_tree;

pub const TRAIN_FOLDER: &str = "train";
pub const TEST_FOLDER: &str = "test";
pub const TRAIN_PROBABILITY: f64 = 0.9;
const SPLIT_SEED: u64 = 2_391_849;

/// Copies `source_folder` into `<dest_root>/train` and `<dest_root>/test`
/// and splits the main table rows between them. An existing split whose
/// schemas both load is reused as is.
pub fn persist_original_data(source_folder: &Path, dest_root: &Path) -> Result<(PathBuf, PathBuf)> {
    let train = dest_root.join(TRAIN_FOLDER);
    let test = dest_root.join(TEST_FOLDER);

    if split_exists(&train, &test) {
        debug!("Reusing split in {}", dest_root.display());
        return Ok((train, test));
    }

    let schema_path = source_folder.join(SCHEMA_FILE_NAME);
    let meta = SchemaLoader::new().load(&schema_path)?;
    let main = meta.main_resource()?;
    let relative = main.res_path.clone();
    let data_path = schema_dir(&schema_path).join(&relative);

    copy_tree(source_folder, &train)?;
    copy_tree(source_folder, &test)?;

    let header = csv_io::read_header(&data_path)?;
    let mut rng = StdRng::seed_from_u64(SPLIT_SEED);
    let mut train_rows = Vec::new();
    let mut test_rows = Vec::new();
    csv_io::for_each_record(&data_path, true, |record| {
        let row: Vec<String> = record.iter().map(str::to_string).collect();
        if rng.gen_bool(TRAIN_PROBABILITY) {
            train_rows.push(row);
        } else {
            test_rows.push(row);
        }
        Ok(())
    })?;

    info!(
        "Split {} into {} train and {} test rows",
        source_folder.display(),
        train_rows.len(),
        test_rows.len()
    );
    csv_io::write_table(&train.join(&relative), &header, train_rows)?;
    csv_io::write_table(&test.join(&relative), &header, test_rows)?;

    Ok((train, test))
}

fn split_exists(train: &Path, test: &Path) -> bool {
    let loader = SchemaLoader::new();
    [train, test]
        .iter()
        .all(|folder| loader.load(&folder.join(SCHEMA_FILE_NAME)).is_ok())
}
