//! Mailbox Integration Tests
//!
//! Tests for draining, concurrent appends and schema enforcement.

use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;
use troubleshoot::config::schemas::mailbox_schema;
use troubleshoot::config::{Layout, MailboxName};
use troubleshoot::core::gate;
use troubleshoot::core::{Mailbox, MailboxError, SchemaGate};
use troubleshoot::domain::{ProblemDescription, Request, SimilarProblemsRequest};

fn request(id: u64, description: &str) -> SimilarProblemsRequest {
    Request::new(
        id,
        ProblemDescription {
            problem_description: description.to_string(),
        },
    )
}

fn checked_mailbox(dir: &TempDir) -> Mailbox<SimilarProblemsRequest> {
    let gate = SchemaGate::new(
        &mailbox_schema(MailboxName::SimilarProblemRequests),
        "similar_problem_requests",
    )
    .unwrap();
    Mailbox::new(dir.path().join("similar_problem_requests.json")).with_schema(Arc::new(gate))
}

#[tokio::test]
async fn test_drain_returns_entries_then_nothing() {
    let dir = TempDir::new().unwrap();
    let mailbox = checked_mailbox(&dir);

    mailbox.append(request(7, "disk full")).await.unwrap();

    let first = mailbox.drain_and_reset().await.unwrap();
    assert_eq!(first, vec![request(7, "disk full")]);

    let second = mailbox.drain_and_reset().await.unwrap();
    assert!(second.is_empty());
}

#[tokio::test]
async fn test_on_disk_format() {
    let dir = TempDir::new().unwrap();
    let mailbox = checked_mailbox(&dir);

    mailbox.append(request(7, "disk full")).await.unwrap();

    let content = std::fs::read_to_string(mailbox.path()).unwrap();
    let document: serde_json::Value = serde_json::from_str(&content).unwrap();
    assert_eq!(
        document,
        json!({"requests": [{"requestId": 7, "problemDescription": "disk full"}]})
    );
}

#[tokio::test]
async fn test_no_loss_under_concurrent_appends() {
    let dir = TempDir::new().unwrap();
    let mailbox = checked_mailbox(&dir);

    let mut writers = Vec::new();
    for id in 0..20u64 {
        let mailbox = mailbox.clone();
        writers.push(tokio::spawn(async move {
            mailbox.append(request(id, "printer offline")).await.unwrap();
        }));
    }

    let mut seen = Vec::new();
    for _ in 0..5 {
        seen.extend(mailbox.drain_and_reset().await.unwrap());
        tokio::task::yield_now().await;
    }
    for writer in writers {
        writer.await.unwrap();
    }
    seen.extend(mailbox.drain_and_reset().await.unwrap());

    let mut ids: Vec<u64> = seen.iter().map(|r| r.correlation_id.0).collect();
    ids.sort_unstable();
    assert_eq!(ids, (0..20).collect::<Vec<_>>());
}

#[tokio::test]
async fn test_gate_keeps_appends_made_during_processing() {
    let dir = TempDir::new().unwrap();
    let inbox = checked_mailbox(&dir);
    let late = inbox.clone();

    inbox.append(request(1, "disk full")).await.unwrap();

    let consumed = gate::consume(&inbox, |batch| async move {
        late.append(request(2, "fan noise")).await.unwrap();
        Ok::<_, MailboxError>(batch.len())
    })
    .await
    .unwrap()
    .unwrap();

    assert_eq!(consumed.count, 1);
    assert_eq!(inbox.peek().await.unwrap(), vec![request(2, "fan noise")]);
}

#[tokio::test]
async fn test_corrupt_mailbox_is_a_schema_violation() {
    let dir = TempDir::new().unwrap();
    let mailbox = checked_mailbox(&dir);
    std::fs::write(mailbox.path(), r#"{"requests": [{"requestId": "seven"}]}"#).unwrap();

    let err = mailbox.drain_and_reset().await.unwrap_err();
    assert!(err.is_schema_violation(), "{}", err);

    // The bad document is left for inspection
    let content = std::fs::read_to_string(mailbox.path()).unwrap();
    assert!(content.contains("seven"));
}

#[tokio::test]
async fn test_invalid_append_writes_nothing() {
    let dir = TempDir::new().unwrap();
    let mailbox = checked_mailbox(&dir);
    mailbox.append(request(1, "disk full")).await.unwrap();

    let err = mailbox.append(request(2, "   ")).await.unwrap_err();

    assert!(err.is_schema_violation());
    assert_eq!(mailbox.peek().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_layout_attaches_schema_written_by_init() {
    let dir = TempDir::new().unwrap();
    let layout = Layout::new(dir.path());
    troubleshoot::core::orchestrator::initialize(&layout, false)
        .await
        .unwrap();

    let mailbox: Mailbox<SimilarProblemsRequest> =
        layout.open(MailboxName::SimilarProblemRequests).unwrap();
    std::fs::write(
        mailbox.path(),
        r#"{"requests": [{"requestId": 1, "problemDescription": "x", "extra": true}]}"#,
    )
    .unwrap();

    assert!(mailbox.peek().await.unwrap_err().is_schema_violation());
}
