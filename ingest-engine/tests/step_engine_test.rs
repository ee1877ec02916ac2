mod common;

use std::fs;
use std::sync::Arc;

use common::{
    city_dataset, image_dataset, init_test_logging, main_table, row, schema, step_engine,
    table_resource, write_dataset, column, FakeRunner,
};
use d3m_ingest::classification::ClassificationFile;
use d3m_ingest::error::ErrorKind;
use d3m_ingest::loader::SchemaLoader;
use d3m_ingest::metadata::{DistilRole, D3M_INDEX_NAME, ROLE_INDEX, SCHEMA_FILE_NAME};
use d3m_ingest::steps::StepInput;
use tempfile::TempDir;

fn variable_names(schema_path: &std::path::Path) -> Vec<String> {
    let meta = SchemaLoader::new().load(schema_path).unwrap();
    meta.main_resource()
        .unwrap()
        .ordered_variables()
        .into_iter()
        .map(|v| v.name.clone())
        .collect()
}

#[tokio::test]
async fn test_format_appends_row_index() {
    init_test_logging();

    // Given: a table without d3mIndex
    let dir = TempDir::new().unwrap();
    let doc = schema(
        "plain",
        vec![table_resource(vec![
            column(0, "a", "string", &["attribute"]),
            column(1, "b", "string", &["attribute"]),
        ])],
    );
    let input = write_dataset(
        &dir.path().join("input"),
        &doc,
        &[("tables/learningData.csv", "a,b\nx,y\np,q\n")],
    );
    let runner = Arc::new(FakeRunner::new(&dir.path().join("results")));
    let engine = step_engine(&runner, dir.path());

    // When: formatting it
    let output = engine
        .format(&StepInput::new(&input), &dir.path().join("formatted"))
        .await
        .unwrap();

    // Then: d3mIndex is appended as an integer index column holding row numbers
    let meta = SchemaLoader::new().load(&output).unwrap();
    let main = meta.main_resource().unwrap();
    let index = main.variable(D3M_INDEX_NAME).unwrap();
    assert_eq!(index.index, 2);
    assert_eq!(index.type_name, "integer");
    assert!(index.has_role(ROLE_INDEX));
    assert_eq!(
        main_table(output.parent().unwrap()),
        vec![row(&["a", "b", "d3mIndex"]), row(&["x", "y", "1"]), row(&["p", "q", "2"])]
    );

    // And: the input dataset is untouched and no primitive ran
    assert_eq!(
        fs::read_to_string(dir.path().join("input/tables/learningData.csv")).unwrap(),
        "a,b\nx,y\np,q\n"
    );
    assert!(runner.calls().is_empty());

    // When: formatting the output again
    let again = engine
        .format(&StepInput::new(&output), &dir.path().join("formatted-again"))
        .await
        .unwrap();

    // Then: the variable set is unchanged
    assert_eq!(variable_names(&again), variable_names(&output));
}

#[tokio::test]
async fn test_merge_single_table_keeps_variables() {
    init_test_logging();

    // Given: a one-table dataset
    let dir = TempDir::new().unwrap();
    let input = city_dataset(&dir.path().join("input"));
    let runner = Arc::new(FakeRunner::new(&dir.path().join("results")));
    let engine = step_engine(&runner, dir.path());

    // When: merging it
    let merged = engine
        .merge(&StepInput::new(&input), &dir.path().join("merged"))
        .await
        .unwrap();

    // Then: the result is a merged single-resource schema with the same variables
    let meta = SchemaLoader::new().load_from_merged(&merged).unwrap();
    assert_eq!(meta.data_resources.len(), 1);
    assert_eq!(variable_names(&merged), vec!["d3mIndex", "city", "population"]);
    assert_eq!(main_table(merged.parent().unwrap()), main_table(input.parent().unwrap()));
    assert_eq!(runner.calls(), vec!["denormalize"]);

    // When: merging the merged dataset
    let again = engine
        .merge(&StepInput::new(&merged), &dir.path().join("merged-again"))
        .await
        .unwrap();

    // Then: it is copied through without another primitive call
    assert_eq!(variable_names(&again), variable_names(&merged));
    assert_eq!(runner.calls().len(), 1);
}

#[tokio::test]
async fn test_merge_inherits_media_reference_for_filename() {
    init_test_logging();

    // Given: an image dataset whose denormalizer adds a filename column
    let dir = TempDir::new().unwrap();
    let input = image_dataset(&dir.path().join("input"), &["a.jpg", "b.jpg"]);
    let runner = Arc::new(FakeRunner::with_responder(
        &dir.path().join("results"),
        |_, folder| {
            let mut table = main_table(folder);
            table[0].push("filename".to_string());
            for r in table.iter_mut().skip(1) {
                let file = r[1].clone();
                r.push(file);
            }
            Ok(table)
        },
    ));
    let engine = step_engine(&runner, dir.path());

    // When: merging
    let merged = engine
        .merge(&StepInput::new(&input), &dir.path().join("merged"))
        .await
        .unwrap();

    // Then: filename takes the attributes of the image reference
    let meta = SchemaLoader::new().load(&merged).unwrap();
    let main = meta.main_resource().unwrap();
    let filename = main.variable("filename").unwrap();
    assert_eq!(filename.index, 3);
    assert_eq!(filename.type_name, main.variable("image").unwrap().type_name);

    // And: references into the dropped image collection are not resolvable
    assert!(main.variables.iter().all(|v| v.refers_to.is_none()));
}

#[tokio::test]
async fn test_clean_realigns_columns_to_variables() {
    init_test_logging();

    // Given: a cleaner that returns columns in a different order
    let dir = TempDir::new().unwrap();
    let input = city_dataset(&dir.path().join("input"));
    let runner = Arc::new(FakeRunner::with_responder(&dir.path().join("results"), |_, _| {
        Ok(vec![
            row(&["population", "d3mIndex", "city"]),
            row(&["2148000", "1", "paris"]),
            row(&["3645000", "2", "berlin"]),
        ])
    }));
    let engine = step_engine(&runner, dir.path());

    // When: cleaning
    let cleaned = engine
        .clean(&StepInput::new(&input), &dir.path().join("clean"))
        .await
        .unwrap();

    // Then: the table follows the variable order
    assert_eq!(
        main_table(cleaned.parent().unwrap()),
        vec![
            row(&["d3mIndex", "city", "population"]),
            row(&["1", "paris", "2148000"]),
            row(&["2", "berlin", "3645000"]),
        ]
    );
}

#[tokio::test]
async fn test_classify_writes_labels_per_column() {
    init_test_logging();

    // Given: a merged city dataset
    let dir = TempDir::new().unwrap();
    let input = city_dataset(&dir.path().join("input"));
    let runner = Arc::new(FakeRunner::new(&dir.path().join("results")));
    let engine = step_engine(&runner, dir.path());
    let merged = engine
        .merge(&StepInput::new(&input), &dir.path().join("merged"))
        .await
        .unwrap();

    // When: classifying
    let output = dir.path().join("classification.json");
    let classification = engine
        .classify(&StepInput::new(&merged), &output)
        .await
        .unwrap();

    // Then: one label row per column is written
    assert_eq!(classification.labels.len(), 3);
    assert_eq!(classification.labels[1], vec!["city", "text"]);
    assert_eq!(ClassificationFile::read(&output).unwrap(), classification);

    // And: loading through the classification keeps the declared location type
    let meta = SchemaLoader::new()
        .load_from_classification(&merged, &output)
        .unwrap();
    let city = meta.main_resource().unwrap().variable("city").unwrap();
    assert_eq!(city.type_name, "city");
    assert_eq!(city.suggested_types[0].provenance, "schema");
    assert_eq!(city.suggested_types[1].type_name, "city");
    assert!((city.suggested_types[1].probability - 1.35).abs() < 1e-9);
}

#[tokio::test]
async fn test_rank_aligns_importance_to_dataset_columns() {
    init_test_logging();

    // Given: a dataset with one text and two integer columns
    let dir = TempDir::new().unwrap();
    let input = city_dataset(&dir.path().join("input"));
    let runner = Arc::new(FakeRunner::new(&dir.path().join("results")));
    let scratch = dir.path().join("scratch");
    let engine = step_engine(&runner, &scratch);

    // When: ranking
    let output = dir.path().join("importance.json");
    let importance = engine.rank(&StepInput::new(&input), &output).await.unwrap();

    // Then: projected columns are scored, the text column scores zero
    assert_eq!(importance.features, vec![1.0, 0.0, 0.5]);
    assert_eq!(runner.calls(), vec!["pca_features"]);

    // And: the temporary projection is removed
    assert_eq!(fs::read_dir(&scratch).map(|d| d.count()).unwrap_or(0), 0);
}

#[tokio::test]
async fn test_summarize_joins_tokens() {
    init_test_logging();

    // Given
    let dir = TempDir::new().unwrap();
    let input = city_dataset(&dir.path().join("input"));
    let runner = Arc::new(FakeRunner::new(&dir.path().join("results")));
    let engine = step_engine(&runner, dir.path());

    // When
    let output = dir.path().join("summary.json");
    let summary = engine.summarize(&StepInput::new(&input), &output).await.unwrap();

    // Then
    assert_eq!(summary.summary, "cities, population");
    assert!(output.exists());
}

#[tokio::test]
async fn test_geocode_appends_coordinates() {
    init_test_logging();

    // Given: a city column and a geocoder answering for Paris and Berlin
    let dir = TempDir::new().unwrap();
    let input = city_dataset(&dir.path().join("input"));
    let runner = Arc::new(FakeRunner::new(&dir.path().join("results")));
    let engine = step_engine(&runner, dir.path());

    // When: geocoding
    let output = engine
        .geocode(&StepInput::new(&input), &dir.path().join("geocoded"))
        .await
        .unwrap();

    // Then: latitude and longitude columns are appended with six decimals
    let table = main_table(output.parent().unwrap());
    assert_eq!(
        table,
        vec![
            row(&["d3mIndex", "city", "population", "_lat_city", "_lon_city"]),
            row(&["1", "Paris", "2148000", "48.850000", "2.350000"]),
            row(&["2", "Berlin", "3645000", "52.520000", "13.400000"]),
        ]
    );
    let meta = SchemaLoader::new().load(&output).unwrap();
    let lat = meta.main_resource().unwrap().variable("_lat_city").unwrap();
    assert_eq!(lat.type_name, "latitude");
    assert_eq!(lat.distil_role, DistilRole::Metadata);

    // When: geocoding the output again
    let again = engine
        .geocode(&StepInput::new(&output), &dir.path().join("geocoded-again"))
        .await
        .unwrap();

    // Then: no duplicate columns and no second primitive call
    assert_eq!(variable_names(&again), variable_names(&output));
    assert_eq!(runner.calls(), vec!["goat_forward"]);
}

#[tokio::test]
async fn test_cluster_small_image_input_runs_locally() {
    init_test_logging();

    // Given: three images
    let dir = TempDir::new().unwrap();
    let input = image_dataset(&dir.path().join("input"), &["a.jpg", "b.jpg", "c.jpg"]);
    let runner = Arc::new(FakeRunner::new(&dir.path().join("results")));
    let engine = step_engine(&runner, dir.path());

    // When: clustering
    let output = engine
        .cluster(&StepInput::new(&input), None, &dir.path().join("clustered"))
        .await
        .unwrap();

    // Then: every file is its own cluster and the runner is never called
    let table = main_table(output.parent().unwrap());
    assert_eq!(table[0].last().unwrap(), "_cluster_image");
    let clusters: Vec<&str> = table[1..].iter().map(|r| r.last().unwrap().as_str()).collect();
    assert_eq!(clusters, vec!["0", "1", "2"]);
    assert!(runner.calls().is_empty());

    // And: the media files travel with the dataset
    assert!(dir.path().join("clustered/media/b.jpg").exists());
}

#[tokio::test]
async fn test_cluster_large_image_input_uses_primitive_on_source() {
    init_test_logging();

    // Given: a merged image dataset and its pre-merge source
    let dir = TempDir::new().unwrap();
    let files = ["a.jpg", "b.jpg", "c.jpg", "d.jpg", "e.jpg", "f.jpg"];
    let source = image_dataset(&dir.path().join("input"), &files);
    let runner = Arc::new(FakeRunner::new(&dir.path().join("results")));
    let engine = step_engine(&runner, dir.path());
    let merged = engine
        .merge(&StepInput::new(&source), &dir.path().join("merged"))
        .await
        .unwrap();

    // When: clustering the merged dataset with the source schema
    let output = engine
        .cluster(&StepInput::new(&merged), Some(&source), &dir.path().join("clustered"))
        .await
        .unwrap();

    // Then: the primitive ran against the source folder and ids come back per row
    assert_eq!(runner.calls(), vec!["denormalize", "unicorn"]);
    let last_uri = runner.produce_uris.lock().unwrap().last().cloned().unwrap();
    assert!(last_uri.contains("/input/"), "{}", last_uri);
    let table = main_table(output.parent().unwrap());
    let clusters: Vec<&str> = table[1..].iter().map(|r| r.last().unwrap().as_str()).collect();
    assert_eq!(clusters, vec!["0", "1", "0", "1", "0", "1"]);

    // When: clustering the output again
    let again = engine
        .cluster(&StepInput::new(&output), Some(&source), &dir.path().join("clustered-again"))
        .await
        .unwrap();

    // Then: the cluster column is not duplicated and the primitive is not rerun
    assert_eq!(variable_names(&again), variable_names(&output));
    assert_eq!(runner.calls(), vec!["denormalize", "unicorn"]);
    assert_eq!(main_table(again.parent().unwrap()), table);
}

#[tokio::test]
async fn test_overridden_table_is_staged_for_the_runner() {
    init_test_logging();

    // Given: the city dataset and a headerless replacement for its main table
    let dir = TempDir::new().unwrap();
    let input = city_dataset(&dir.path().join("input"));
    let replacement = dir.path().join("rome.csv");
    fs::write(&replacement, "1,Rome,2873000\n").unwrap();
    let runner = Arc::new(FakeRunner::new(&dir.path().join("results")));
    let scratch = dir.path().join("scratch");
    let engine = step_engine(&runner, &scratch);

    // When: cleaning with the replacement table
    let output = engine
        .clean(
            &StepInput::new(&input)
                .with_data_path(Some(replacement))
                .with_header(false),
            &dir.path().join("cleaned"),
        )
        .await
        .unwrap();

    // Then: the primitive saw the replacement rows under the variable header
    assert_eq!(
        main_table(output.parent().unwrap()),
        vec![
            row(&["d3mIndex", "city", "population"]),
            row(&["1", "Rome", "2873000"]),
        ]
    );
    let uri = runner.produce_uris.lock().unwrap()[0].clone();
    assert!(uri.contains("/scratch/staged-"), "{}", uri);

    // And: the staged copy is gone and the input is untouched
    assert_eq!(fs::read_dir(&scratch).unwrap().count(), 0);
    assert_eq!(
        fs::read_to_string(dir.path().join("input/tables/learningData.csv")).unwrap(),
        "d3mIndex,city,population\n1,Paris,2148000\n2,Berlin,3645000\n"
    );
}

#[tokio::test]
async fn test_overridden_table_of_wrong_width_is_rejected() {
    init_test_logging();

    // Given: a replacement table with two columns for three variables
    let dir = TempDir::new().unwrap();
    let input = city_dataset(&dir.path().join("input"));
    let replacement = dir.path().join("narrow.csv");
    fs::write(&replacement, "d3mIndex,city\n1,Rome\n").unwrap();
    let runner = Arc::new(FakeRunner::new(&dir.path().join("results")));
    let engine = step_engine(&runner, &dir.path().join("scratch"));

    // When
    let result = engine
        .merge(
            &StepInput::new(&input).with_data_path(Some(replacement)),
            &dir.path().join("merged"),
        )
        .await;

    // Then: staging fails before the runner is called
    assert_eq!(result.unwrap_err().kind(), ErrorKind::Csv);
    assert!(runner.calls().is_empty());
}

#[tokio::test]
async fn test_featurize_joins_detected_objects() {
    init_test_logging();

    // Given: a merged image dataset and its source
    let dir = TempDir::new().unwrap();
    let source = image_dataset(&dir.path().join("input"), &["a.jpg", "b.jpg"]);
    let runner = Arc::new(FakeRunner::new(&dir.path().join("results")));
    let engine = step_engine(&runner, dir.path());
    let merged = engine
        .merge(&StepInput::new(&source), &dir.path().join("merged"))
        .await
        .unwrap();

    // When: featurizing
    let output = engine
        .featurize(&StepInput::new(&merged), Some(&source), &dir.path().join("featurized"))
        .await
        .unwrap();

    // Then: the dict literal values are joined into a text column
    let table = main_table(output.parent().unwrap());
    assert_eq!(table[0].last().unwrap(), "_feature_image");
    assert!(table[1..].iter().all(|r| r.last().unwrap() == "cat,grass"));
    let meta = SchemaLoader::new().load(&output).unwrap();
    assert_eq!(
        meta.main_resource().unwrap().variable("_feature_image").unwrap().type_name,
        "text"
    );

    // When: featurizing again
    let again = engine
        .featurize(&StepInput::new(&output), Some(&source), &dir.path().join("featurized-again"))
        .await
        .unwrap();

    // Then: the existing feature column is kept as is
    assert_eq!(variable_names(&again), variable_names(&output));
    assert_eq!(runner.calls(), vec!["denormalize", "croc"]);
}

#[tokio::test]
async fn test_step_failure_surfaces_primitive_error() {
    init_test_logging();

    // Given: a runner whose only solution fails
    let dir = TempDir::new().unwrap();
    let input = city_dataset(&dir.path().join("input"));
    let runner = Arc::new(FakeRunner::new(&dir.path().join("results")).failing(1));
    let engine = step_engine(&runner, dir.path());

    // When
    let result = engine
        .merge(&StepInput::new(&input), &dir.path().join("merged"))
        .await;

    // Then: the error is a primitive failure and the input is intact
    let err = result.unwrap_err();
    assert_eq!(err.kind(), d3m_ingest::error::ErrorKind::Primitive);
    assert!(dir.path().join("input").join(SCHEMA_FILE_NAME).exists());
}
