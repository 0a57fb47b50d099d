//! Periodic Task Integration Tests
//!
//! Tests for cycle reports, configuration reloads and cancellation.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use troubleshoot::adapters::{SolvedStore, SqliteStore};
use troubleshoot::config::ConfigSource;
use troubleshoot::core::{Mailbox, PeriodicTask, TaskState};
use troubleshoot::domain::{
    CorrelationId, IngestCandidate, ProblemRef, Report, Request, SolutionRequest, SolutionResponse, SolvedRecord,
    SolvedReport, Status,
};
use troubleshoot::stages::{IngestionStage, SolutionRequestsStage, SolvedProblemsStage};

fn store() -> Arc<dyn SolvedStore> {
    Arc::new(SqliteStore::in_memory().unwrap())
}

fn write_config(dir: &TempDir, yaml: &str) -> ConfigSource<troubleshoot::stages::RepositoryConfig> {
    let path = dir.path().join("repository.yaml");
    std::fs::write(&path, yaml).unwrap();
    ConfigSource::new(path)
}

#[tokio::test]
async fn test_solved_problems_cycle_stores_and_reports() {
    let dir = TempDir::new().unwrap();
    let records: Mailbox<SolvedRecord> = Mailbox::new(dir.path().join("new_records.json"));
    let reports: Mailbox<SolvedReport> = Mailbox::new(dir.path().join("performance_reports.json"));
    let store = store();

    records
        .append_all(vec![
            SolvedRecord::selected("Disk full", "Delete old logs", 2, 3),
            SolvedRecord::manual("Fan noise", "Replace the fan", 0),
        ])
        .await
        .unwrap();

    let task = PeriodicTask::new(
        SolvedProblemsStage::new(records.clone(), reports.clone(), Arc::clone(&store)),
        write_config(&dir, "new_records_period_ms: 10\n"),
        dir.path().join("reports").join("solved_problems.json"),
    );

    let report = task.run_once().await;

    assert!(report.is_ok(), "{:?}", report.error_message);
    assert!(records.peek().await.unwrap().is_empty());

    let emitted = reports.peek().await.unwrap();
    assert_eq!(emitted.len(), 2);
    assert_eq!(emitted[0].solution_index, 2);
    assert_eq!(emitted[1].solution_index, -1);

    let on_disk = Report::read_from(&dir.path().join("reports").join("solved_problems.json"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(on_disk.status, Status::Ok);
}

#[tokio::test]
async fn test_too_few_records_reports_error() {
    let dir = TempDir::new().unwrap();
    let candidates: Mailbox<IngestCandidate> = Mailbox::new(dir.path().join("ingestion_records.json"));
    let store = store();
    store.upsert_solved("disk full", "delete logs").await.unwrap();

    let task = PeriodicTask::new(
        IngestionStage::new(candidates.clone(), store),
        write_config(&dir, "min_records: 5\n"),
        dir.path().join("ingestion.json"),
    );

    let report = task.run_once().await;

    assert_eq!(report.status, Status::Error);
    assert!(report.error_message.unwrap().contains("not enough"));
    // The dataset is still rebuilt with what was eligible
    assert_eq!(candidates.peek().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_invalid_config_skips_cycle() {
    let dir = TempDir::new().unwrap();
    let requests: Mailbox<SolutionRequest> = Mailbox::new(dir.path().join("solution_requests.json"));
    let responses: Mailbox<SolutionResponse> =
        Mailbox::new(dir.path().join("solution_responses.json"));
    requests
        .append(Request::new(
            1,
            ProblemRef {
                problem_id: "missing".to_string(),
            },
        ))
        .await
        .unwrap();

    let task = PeriodicTask::new(
        SolutionRequestsStage::new(requests.clone(), responses.clone(), store()),
        write_config(&dir, "min_records: 50\nmax_records: 10\n"),
        dir.path().join("report.json"),
    );

    let report = task.run_once().await;

    assert!(!report.is_ok());
    assert_eq!(requests.peek().await.unwrap().len(), 1);
    assert!(responses.peek().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_spawned_task_answers_and_stops() {
    let dir = TempDir::new().unwrap();
    let requests: Mailbox<SolutionRequest> = Mailbox::new(dir.path().join("solution_requests.json"));
    let responses: Mailbox<SolutionResponse> =
        Mailbox::new(dir.path().join("solution_responses.json"));

    let task = PeriodicTask::new(
        SolutionRequestsStage::new(requests.clone(), responses.clone(), store()),
        write_config(&dir, "solution_requests_period_ms: 5\n"),
        dir.path().join("report.json"),
    );
    let handle = task.spawn();

    requests
        .append(Request::new(
            4,
            ProblemRef {
                problem_id: "unknown".to_string(),
            },
        ))
        .await
        .unwrap();

    let mut answered = Vec::new();
    for _ in 0..200 {
        answered = responses.peek().await.unwrap();
        if !answered.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    assert_eq!(answered.len(), 1);
    assert_eq!(answered[0].correlation_id, CorrelationId(4));
    assert_eq!(answered[0].status, Status::Error);
    assert!(handle.cycles() >= 1);

    let mut states = handle.subscribe();
    handle.cancel();
    tokio::time::timeout(Duration::from_secs(5), states.wait_for(|s| *s == TaskState::Stopped))
        .await
        .unwrap()
        .unwrap();
    handle.join().await.unwrap();
}
