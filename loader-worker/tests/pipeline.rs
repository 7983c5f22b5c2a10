use std::path::Path;
use std::sync::Arc;

use loader_common::budget::WriteBudget;
use loader_common::mapping::{Delimiter, RecordMapper};
use loader_common::store::{DryRunWriter, MockBatchWriter};
use loader_worker::config::PipelineSettings;
use loader_worker::error::LoaderError;
use loader_worker::output::{ATTEMPTED_FILE_NAME, FAILED_FILE_NAME, MALFORMED_FILE_NAME};
use loader_worker::pipeline::Pipeline;
use tempfile::TempDir;

fn mapper() -> RecordMapper {
    RecordMapper::new(
        "SKU,VendorID,VendorProductNumber".parse().unwrap(),
        Delimiter::new('|').unwrap(),
    )
}

fn settings(dir: &TempDir, input: &str, dry_run: bool) -> PipelineSettings {
    let input_path = dir.path().join("input.data");
    std::fs::write(&input_path, input).unwrap();

    PipelineSettings {
        input_path,
        output_dir: dir.path().to_path_buf(),
        budget: WriteBudget::new(2, 1000).unwrap(),
        max_in_flight: 2,
        table: "products".to_owned(),
        mapper: mapper(),
        dry_run,
    }
}

fn read(dir: &Path, name: &str) -> String {
    std::fs::read_to_string(dir.join(name)).unwrap()
}

fn sorted_lines(contents: &str) -> Vec<&str> {
    let mut lines: Vec<&str> = contents.lines().collect();
    lines.sort();
    lines
}

#[tokio::test]
async fn test_partial_failure_and_malformed_line() {
    let dir = TempDir::new().unwrap();
    let settings = settings(&dir, "r1|a|x\nbad-line\nr2||y\nr3|c|z\n", false);
    let writer = Arc::new(MockBatchWriter::new().unprocessed_when("SKU", "r2"));

    let summary = Pipeline::open(settings, writer.clone())
        .await
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(summary.ingest.lines_read, 4);
    assert_eq!(summary.ingest.malformed, 1);
    assert_eq!(summary.dispatched, 2);
    assert_eq!(summary.reconciled.attempted, 3);
    assert_eq!(summary.reconciled.failed, 1);
    assert_eq!(summary.reconciled.partially_failed_batches, 1);

    assert_eq!(read(dir.path(), MALFORMED_FILE_NAME), "bad-line\n");
    assert_eq!(
        sorted_lines(&read(dir.path(), ATTEMPTED_FILE_NAME)),
        vec!["r1", "r2", "r3"]
    );
    assert_eq!(read(dir.path(), FAILED_FILE_NAME), "r2||y\n");

    let calls = writer.calls();
    assert_eq!(calls.len(), 2);
    assert!(calls.iter().all(|(table, _)| table == "products"));
}

#[tokio::test]
async fn test_whole_batch_failure() {
    let dir = TempDir::new().unwrap();
    let settings = settings(&dir, "r1|a|x\nr2|b|y\nr3|c|z\n", false);
    let writer = Arc::new(MockBatchWriter::new().fail_when("SKU", "r1"));

    let summary = Pipeline::open(settings, writer)
        .await
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(summary.reconciled.fully_failed_batches, 1);
    assert_eq!(summary.reconciled.failed, 2);
    assert_eq!(
        sorted_lines(&read(dir.path(), FAILED_FILE_NAME)),
        vec!["r1|a|x", "r2|b|y"]
    );
    assert_eq!(
        sorted_lines(&read(dir.path(), ATTEMPTED_FILE_NAME)),
        vec!["r1", "r2", "r3"]
    );
}

#[tokio::test]
async fn test_dry_run_reports_every_record_written() {
    let dir = TempDir::new().unwrap();
    let settings = settings(&dir, "r1|a|x\nr2|b|y\nr3|c|z\n", true);
    let writer = Arc::new(DryRunWriter::new(mapper()));

    let summary = Pipeline::open(settings, writer)
        .await
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(summary.dispatched, 2);
    assert_eq!(summary.reconciled.attempted, 3);
    assert_eq!(read(dir.path(), FAILED_FILE_NAME), "");
    assert_eq!(read(dir.path(), MALFORMED_FILE_NAME), "");
}

#[tokio::test]
async fn test_dry_run_never_calls_the_store() {
    let dir = TempDir::new().unwrap();
    let settings = settings(&dir, "r1|a|x\nr2|b|y\n", true);
    let writer = Arc::new(MockBatchWriter::new().fail_when("SKU", "r1"));

    let summary = Pipeline::open(settings, writer.clone())
        .await
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(writer.call_count(), 0);
    assert_eq!(summary.reconciled.failed, 0);
    assert_eq!(read(dir.path(), FAILED_FILE_NAME), "");
    assert_eq!(
        sorted_lines(&read(dir.path(), ATTEMPTED_FILE_NAME)),
        vec!["r1", "r2"]
    );
}

#[tokio::test]
async fn test_empty_input_completes() {
    let dir = TempDir::new().unwrap();
    let settings = settings(&dir, "", false);
    let writer = Arc::new(MockBatchWriter::new());

    let summary = Pipeline::open(settings, writer.clone())
        .await
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(summary.dispatched, 0);
    assert_eq!(summary.reconciled.batches, 0);
    assert_eq!(writer.call_count(), 0);
    assert_eq!(read(dir.path(), ATTEMPTED_FILE_NAME), "");
}

#[tokio::test]
async fn test_reruns_append_to_outputs() {
    let dir = TempDir::new().unwrap();

    for _ in 0..2 {
        let settings = settings(&dir, "r1|a|x\nbad-line\n", false);
        let writer = Arc::new(MockBatchWriter::new().fail_when("SKU", "r1"));
        Pipeline::open(settings, writer)
            .await
            .unwrap()
            .run()
            .await
            .unwrap();
    }

    assert_eq!(read(dir.path(), MALFORMED_FILE_NAME), "bad-line\nbad-line\n");
    assert_eq!(read(dir.path(), ATTEMPTED_FILE_NAME), "r1\nr1\n");
    assert_eq!(read(dir.path(), FAILED_FILE_NAME), "r1|a|x\nr1|a|x\n");
}

#[tokio::test]
async fn test_missing_input_fails_before_any_output() {
    let dir = TempDir::new().unwrap();
    let mut settings = settings(&dir, "", false);
    settings.input_path = dir.path().join("does-not-exist.data");

    let result = Pipeline::open(settings, Arc::new(MockBatchWriter::new())).await;

    assert!(matches!(result, Err(LoaderError::Open { .. })));
    assert!(!dir.path().join(MALFORMED_FILE_NAME).exists());
    assert!(!dir.path().join(FAILED_FILE_NAME).exists());
}

#[tokio::test]
async fn test_every_batch_is_reconciled_under_latency() {
    let dir = TempDir::new().unwrap();
    let input: String = (1..=9).map(|i| format!("r{i}|v|p\n")).collect();
    let settings = settings(&dir, &input, false);
    let writer = Arc::new(
        MockBatchWriter::new().with_latency(std::time::Duration::from_millis(20)),
    );

    let summary = Pipeline::open(settings, writer.clone())
        .await
        .unwrap()
        .run()
        .await
        .unwrap();

    assert_eq!(summary.dispatched, 5);
    assert_eq!(summary.reconciled.batches, 5);
    assert_eq!(summary.reconciled.attempted, 9);
    assert_eq!(read(dir.path(), ATTEMPTED_FILE_NAME).lines().count(), 9);
    assert!(writer.max_in_flight() <= 2);
}
