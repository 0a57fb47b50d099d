//! Correlator Integration Tests
//!
//! Tests for response matching, remote errors and the poll budget.

use std::time::{Duration, Instant};

use tempfile::TempDir;
use troubleshoot::core::gate;
use troubleshoot::core::{Backoff, CorrelationError, Correlator, Mailbox, PollPolicy};
use troubleshoot::domain::{
    CorrelationId, ProblemDescription, Response, SimilarProblems, SimilarProblemsRequest,
    SimilarProblemsResponse,
};

type SimilarCorrelator = Correlator<ProblemDescription, SimilarProblems>;

struct Pair {
    _dir: TempDir,
    requests: Mailbox<SimilarProblemsRequest>,
    responses: Mailbox<SimilarProblemsResponse>,
}

impl Pair {
    fn new() -> Self {
        let dir = TempDir::new().unwrap();
        Self {
            requests: Mailbox::new(dir.path().join("similar_problem_requests.json")),
            responses: Mailbox::new(dir.path().join("similar_problem_responses.json")),
            _dir: dir,
        }
    }

    fn correlator(&self, policy: PollPolicy) -> SimilarCorrelator {
        Correlator::new(self.requests.clone(), self.responses.clone(), policy)
    }
}

fn problem(text: &str) -> ProblemDescription {
    ProblemDescription {
        problem_description: text.to_string(),
    }
}

/// Answer every pending request with an id derived from its correlation id
async fn answer_all(pair: &Pair) -> usize {
    gate::consume_into(&pair.requests, &pair.responses, |batch| async move {
        let responses = batch
            .into_iter()
            .map(|r| {
                Response::ok(
                    r.correlation_id,
                    SimilarProblems {
                        problem_ids: vec![format!("p{}", r.correlation_id)],
                    },
                )
            })
            .collect();
        Ok::<_, std::convert::Infallible>(responses)
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn test_error_response_is_remote_not_timeout() {
    let pair = Pair::new();
    pair.responses
        .append(Response::error(CorrelationId(7)))
        .await
        .unwrap();

    let err = pair
        .correlator(PollPolicy::default())
        .request(CorrelationId(7), problem("disk full"))
        .await
        .unwrap_err();

    assert!(err.is_remote(), "{}", err);
}

#[tokio::test]
async fn test_timeout_after_exact_budget() {
    let pair = Pair::new();
    let correlator = pair.correlator(PollPolicy::fixed(4, Duration::from_millis(20)));

    let started = Instant::now();
    let err = correlator
        .request(CorrelationId(1), problem("disk full"))
        .await
        .unwrap_err();

    match err {
        CorrelationError::Timeout { id, attempts } => {
            assert_eq!(id, CorrelationId(1));
            assert_eq!(attempts, 4);
        }
        other => panic!("expected timeout, got {}", other),
    }
    // Three sleeps between four polls
    assert!(started.elapsed() >= Duration::from_millis(60));
}

#[tokio::test]
async fn test_zero_budget_still_polls_once() {
    let pair = Pair::new();
    let correlator = pair.correlator(PollPolicy::new(0, Backoff::Immediate));

    let err = correlator
        .await_response(CorrelationId(3))
        .await
        .unwrap_err();

    assert!(matches!(err, CorrelationError::Timeout { attempts: 1, .. }));
}

#[tokio::test]
async fn test_concurrent_requests_are_isolated() {
    let pair = Pair::new();
    let correlator = pair.correlator(PollPolicy::fixed(200, Duration::from_millis(5)));

    let first = {
        let correlator = correlator.clone();
        tokio::spawn(async move { correlator.request(CorrelationId(1), problem("a")).await })
    };
    let second = {
        let correlator = correlator.clone();
        tokio::spawn(async move { correlator.request(CorrelationId(2), problem("b")).await })
    };

    // Play the consuming stage until both requests are answered
    let mut answered = 0;
    while answered < 2 {
        answered += answer_all(&pair).await;
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let first = first.await.unwrap().unwrap();
    let second = second.await.unwrap().unwrap();
    assert_eq!(first.problem_ids, vec!["p1".to_string()]);
    assert_eq!(second.problem_ids, vec!["p2".to_string()]);
}

#[tokio::test]
async fn test_claiming_removes_only_own_response() {
    let pair = Pair::new();
    pair.responses
        .append_all(vec![
            Response::ok(CorrelationId(1), SimilarProblems { problem_ids: vec![] }),
            Response::ok(CorrelationId(2), SimilarProblems { problem_ids: vec![] }),
        ])
        .await
        .unwrap();

    pair.correlator(PollPolicy::default())
        .claiming()
        .await_response(CorrelationId(1))
        .await
        .unwrap();

    let left = pair.responses.peek().await.unwrap();
    assert_eq!(left.len(), 1);
    assert_eq!(left[0].correlation_id, CorrelationId(2));
}

#[tokio::test]
async fn test_malformed_response_mailbox_is_remote() {
    let pair = Pair::new();
    std::fs::write(pair.responses.path(), "{not json").unwrap();

    let err = pair
        .correlator(PollPolicy::fixed(3, Duration::from_millis(1)))
        .await_response(CorrelationId(9))
        .await
        .unwrap_err();

    assert!(err.is_remote());
}

#[tokio::test]
async fn test_late_response_is_picked_up() {
    let pair = Pair::new();
    let correlator = pair.correlator(PollPolicy::fixed(50, Duration::from_millis(10)));
    let responses = pair.responses.clone();

    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(40)).await;
        responses
            .append(Response::ok(
                CorrelationId(5),
                SimilarProblems {
                    problem_ids: vec!["p9".to_string()],
                },
            ))
            .await
            .unwrap();
    });

    let found = correlator.await_response(CorrelationId(5)).await.unwrap();
    assert_eq!(found.problem_ids, vec!["p9".to_string()]);
}

#[tokio::test]
async fn test_timeout_withdraws_unconsumed_request() {
    let pair = Pair::new();
    let correlator = pair
        .correlator(PollPolicy::fixed(2, Duration::from_millis(1)))
        .claiming();

    for id in 1..=3 {
        let err = correlator
            .request(CorrelationId(id), problem("disk full"))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
    }

    // A stage that starts now finds nothing to answer
    assert_eq!(answer_all(&pair).await, 0);
    assert!(pair.responses.peek().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_late_response_to_abandoned_request_is_removed() {
    let pair = Pair::new();
    let correlator = pair
        .correlator(PollPolicy::fixed(2, Duration::from_millis(1)))
        .claiming();

    // The stage took request 1 but answers only after the requester gave up
    correlator.submit(CorrelationId(1), problem("disk full")).await.unwrap();
    let taken = pair.requests.drain_and_reset().await.unwrap();
    assert!(correlator.await_response(CorrelationId(1)).await.unwrap_err().is_timeout());
    assert_eq!(correlator.strays().await, 1);

    pair.responses
        .append(Response::ok(
            taken[0].correlation_id,
            SimilarProblems {
                problem_ids: vec!["p1".to_string()],
            },
        ))
        .await
        .unwrap();

    correlator.submit(CorrelationId(2), problem("fan noise")).await.unwrap();
    answer_all(&pair).await;
    let found = correlator.await_response(CorrelationId(2)).await.unwrap();

    assert_eq!(found.problem_ids, vec!["p2".to_string()]);
    assert!(pair.responses.peek().await.unwrap().is_empty());
    assert_eq!(correlator.strays().await, 0);
}
