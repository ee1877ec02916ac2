mod common;

use std::fs;
use std::sync::Arc;
use std::time::Duration;

use common::{city_dataset, dispatcher, init_test_logging, FakeRunner};
use d3m_ingest::csv_io;
use d3m_ingest::error::{ErrorKind, IngestError, PrimitiveError};
use d3m_ingest::primitives;
use d3m_ingest::split::{persist_original_data, TEST_FOLDER, TRAIN_FOLDER};
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

#[tokio::test]
async fn test_first_produced_solution_wins_and_search_is_ended() {
    init_test_logging();

    // Given: three candidate solutions, the first of which fails
    let dir = TempDir::new().unwrap();
    city_dataset(&dir.path().join("input"));
    let runner = Arc::new(
        FakeRunner::new(&dir.path().join("results"))
            .solutions(3)
            .failing(1),
    );

    // When: submitting a pipeline
    let result = dispatcher(&runner)
        .submit(&primitives::denormalize(), &dir.path().join("input"))
        .await
        .unwrap();

    // Then: a produced table comes back as a local path
    assert!(result.is_absolute());
    assert_eq!(csv_io::read_header(&result).unwrap(), vec!["d3mIndex", "city", "population"]);

    // And: the search is closed exactly once
    assert_eq!(*runner.ended.lock().unwrap(), vec!["search-0".to_string()]);
}

#[tokio::test]
async fn test_first_result_does_not_wait_for_search_to_finish() {
    init_test_logging();

    // Given: a runner that keeps searching after its first solution
    let dir = TempDir::new().unwrap();
    city_dataset(&dir.path().join("input"));
    let runner = Arc::new(FakeRunner::new(&dir.path().join("results")).open_search());
    let dispatcher = dispatcher(&runner).with_timeout(Duration::from_secs(30));

    // When
    let result = tokio::time::timeout(
        Duration::from_secs(5),
        dispatcher.submit(&primitives::denormalize(), &dir.path().join("input")),
    )
    .await
    .expect("dispatcher waited for the search stream to close");

    // Then: the produced table is returned and the search is ended
    assert!(result.unwrap().exists());
    assert_eq!(*runner.ended.lock().unwrap(), vec!["search-0".to_string()]);
}

#[tokio::test]
async fn test_all_solutions_failing_reports_first_failure() {
    init_test_logging();

    // Given: every solution fails
    let dir = TempDir::new().unwrap();
    city_dataset(&dir.path().join("input"));
    let runner = Arc::new(
        FakeRunner::new(&dir.path().join("results"))
            .solutions(2)
            .failing(2),
    );

    // When
    let result = dispatcher(&runner)
        .submit(&primitives::data_cleaning(), &dir.path().join("input"))
        .await;

    // Then
    match result {
        Err(IngestError::Primitive(PrimitiveError::ExecutionFailed { message })) => {
            assert!(message.contains("failed to fit"), "{}", message)
        }
        other => panic!("expected execution failure, got {:?}", other),
    }
    assert_eq!(runner.ended.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_search_without_solutions_exposes_no_output() {
    init_test_logging();

    // Given: a search that finds nothing
    let dir = TempDir::new().unwrap();
    city_dataset(&dir.path().join("input"));
    let runner = Arc::new(FakeRunner::new(&dir.path().join("results")).solutions(0));

    // When
    let result = dispatcher(&runner)
        .submit(&primitives::duke(), &dir.path().join("input"))
        .await;

    // Then
    assert!(matches!(
        result,
        Err(IngestError::Primitive(PrimitiveError::NoOutputExposed { .. }))
    ));
}

#[tokio::test]
async fn test_cancellation_stops_pending_solutions() {
    init_test_logging();

    // Given: a slow runner and a caller token
    let dir = TempDir::new().unwrap();
    city_dataset(&dir.path().join("input"));
    let runner = Arc::new(
        FakeRunner::new(&dir.path().join("results"))
            .solutions(2)
            .produce_delay(Duration::from_secs(30)),
    );
    let cancel = CancellationToken::new();
    let dispatcher = dispatcher(&runner).with_cancellation(cancel.clone());

    // When: the caller cancels while solutions are producing
    let canceller = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
    });
    let started = std::time::Instant::now();
    let result = dispatcher
        .submit(&primitives::duke(), &dir.path().join("input"))
        .await;
    canceller.await.unwrap();

    // Then: the submission ends promptly as canceled
    let err = result.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Canceled);
    assert!(started.elapsed() < Duration::from_secs(10));
}

#[tokio::test]
async fn test_deadline_maps_to_primitive_timeout() {
    init_test_logging();

    // Given: a runner slower than the dispatcher deadline
    let dir = TempDir::new().unwrap();
    city_dataset(&dir.path().join("input"));
    let runner = Arc::new(
        FakeRunner::new(&dir.path().join("results")).produce_delay(Duration::from_secs(30)),
    );
    let dispatcher = dispatcher(&runner).with_timeout(Duration::from_millis(100));

    // When
    let result = dispatcher
        .submit(&primitives::duke(), &dir.path().join("input"))
        .await;

    // Then
    match result {
        Err(IngestError::Primitive(PrimitiveError::Timeout { operation, .. })) => {
            assert_eq!(operation, "GetSearchSolutionsResults")
        }
        other => panic!("expected timeout, got {:?}", other),
    }
    assert_eq!(runner.ended.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_predictive_submission_fits_on_train_and_produces_on_test() {
    init_test_logging();

    // Given: a dataset and an empty split root
    let dir = TempDir::new().unwrap();
    city_dataset(&dir.path().join("input"));
    let runner = Arc::new(FakeRunner::new(&dir.path().join("results")));
    let split_root = dir.path().join("split");

    // When: submitting with a metric
    dispatcher(&runner)
        .submit_predictive(
            &primitives::data_cleaning(),
            &dir.path().join("input"),
            &split_root,
            &["accuracy".to_string()],
        )
        .await
        .unwrap();

    // Then: the produce call targets the test split
    let uris = runner.produce_uris.lock().unwrap().clone();
    assert_eq!(uris.len(), 1);
    assert!(uris[0].contains(&format!("/{}/", TEST_FOLDER)), "{}", uris[0]);
}

#[test]
fn test_split_partitions_rows_and_is_reused() {
    init_test_logging();

    // Given: a dataset with many rows
    let dir = TempDir::new().unwrap();
    let schema_path = city_dataset(&dir.path().join("input"));
    let data_path = dir.path().join("input/tables/learningData.csv");
    let mut content = String::from("d3mIndex,city,population\n");
    for i in 1..=200 {
        content.push_str(&format!("{},city{},{}\n", i, i, i * 10));
    }
    fs::write(&data_path, content).unwrap();
    assert!(schema_path.exists());

    // When: splitting
    let split_root = dir.path().join("split");
    let (train, test) =
        tokio_test::assert_ok!(persist_original_data(&dir.path().join("input"), &split_root));

    // Then: every row lands in exactly one split, most of them in train
    let train_rows = csv_io::count_rows(&train.join("tables/learningData.csv"), true).unwrap();
    let test_rows = csv_io::count_rows(&test.join("tables/learningData.csv"), true).unwrap();
    assert_eq!(train_rows + test_rows, 200);
    assert!(train_rows > test_rows);
    assert_eq!(train, split_root.join(TRAIN_FOLDER));

    // When: splitting again after the train table changed
    fs::write(train.join("tables/learningData.csv"), "d3mIndex,city,population\n1,x,1\n").unwrap();
    tokio_test::assert_ok!(persist_original_data(&dir.path().join("input"), &split_root));

    // Then: the existing split is kept
    assert_eq!(
        csv_io::count_rows(&train.join("tables/learningData.csv"), true).unwrap(),
        1
    );
}
