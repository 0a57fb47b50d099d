//! End-to-End Pipeline Tests
//!
//! Drives every stage by hand, in the order a running orchestrator would,
//! from stored solved problems to a recorded operator choice and accuracy.

use std::sync::Arc;
use std::time::Duration;

use tempfile::TempDir;
use troubleshoot::adapters::{
    Collaborators, DistancePredictor, HashingEmbedder, SolvedStore, SqliteStore, ThresholdTrainer,
};
use troubleshoot::config::ResolvedConfig;
use troubleshoot::core::orchestrator::initialize;
use troubleshoot::core::{Orchestrator, PollPolicy};
use troubleshoot::stages::{FeatureStore, IntakeOutcome, SimilarityModel};

const SOLVED: [(&str, &str); 5] = [
    ("Printer reports paper jam in tray two", "Open tray two and remove the stuck sheet"),
    ("Laptop battery drains overnight", "Disable wake on LAN in power settings"),
    ("VPN disconnects every ten minutes", "Raise the keepalive interval to 60 seconds"),
    ("Printer jams when printing duplex", "Clean the duplex rollers"),
    ("Monitor flickers after driver update", "Roll back the graphics driver"),
];

async fn setup(dir: &TempDir) -> (Orchestrator, Arc<dyn SolvedStore>) {
    let mut config = ResolvedConfig::with_home(dir.path());
    config.intake_poll = PollPolicy::fixed(500, Duration::from_millis(10));

    let layout = config.layout();
    initialize(&layout, false).await.unwrap();
    std::fs::write(layout.stage_config("repository"), "min_records: 3\n").unwrap();
    std::fs::write(layout.stage_config("segregation"), "seed: 42\n").unwrap();

    let store: Arc<dyn SolvedStore> = Arc::new(SqliteStore::in_memory().unwrap());
    for (problem, solution) in SOLVED {
        store.upsert_solved(problem, solution).await.unwrap();
    }

    let collaborators = Collaborators {
        embedder: Arc::new(HashingEmbedder::new(64)),
        predictor: Arc::new(DistancePredictor),
        trainer: Arc::new(ThresholdTrainer),
        store: Arc::clone(&store),
    };
    let orchestrator = Orchestrator::with_collaborators(config, collaborators).unwrap();
    (orchestrator, store)
}

async fn cycle(orchestrator: &Orchestrator, task: &str) {
    let report = orchestrator.run_once(task).await.unwrap();
    assert!(report.is_ok(), "{}: {:?}", task, report.error_message);
}

#[tokio::test]
async fn test_training_data_flow() {
    let dir = TempDir::new().unwrap();
    let (orchestrator, _store) = setup(&dir).await;
    let layout = orchestrator.layout().clone();

    cycle(&orchestrator, "ingestion").await;
    assert_eq!(
        orchestrator.mailboxes().ingestion_records.peek().await.unwrap().len(),
        SOLVED.len()
    );

    cycle(&orchestrator, "segregation").await;
    let mut rows = 0;
    for path in [layout.training_set(), layout.validation_set(), layout.test_set()] {
        let content = std::fs::read_to_string(&path).unwrap();
        let mut lines = content.lines();
        assert_eq!(lines.next(), Some("problem_1_id,problem_2_id,same_solution"));
        rows += lines.count();
    }
    assert_eq!(rows, SOLVED.len() * (SOLVED.len() - 1));

    cycle(&orchestrator, "preparation").await;
    let features = FeatureStore::load(layout.feature_vectors()).await.unwrap().unwrap();
    assert_eq!(features.vectors.len(), SOLVED.len());
    assert_eq!(features.embedder, "hashing");

    cycle(&orchestrator, "training").await;
    let model = SimilarityModel::load(layout.similarity_model()).await.unwrap().unwrap();
    assert_eq!(model.trainer, "threshold");
    // 70% of the 20 pairs
    assert_eq!(model.training_pairs, 14);
    assert!((0.0..=1.0).contains(&model.validation_score));
    assert!(model.test_score.is_some());
    assert!(model.model["threshold"].is_number());
}

#[tokio::test]
async fn test_ask_select_and_measure() {
    let dir = TempDir::new().unwrap();
    let (orchestrator, _store) = setup(&dir).await;

    for task in ["ingestion", "segregation", "preparation"] {
        cycle(&orchestrator, task).await;
    }

    let mut session = orchestrator.intake();
    let asking = tokio::spawn(async move {
        let outcome = session
            .find_solutions("printer paper jam in tray two")
            .await;
        (session, outcome)
    });

    // Play the consuming stages until the session has its answer
    while !asking.is_finished() {
        cycle(&orchestrator, "troubleshooting").await;
        cycle(&orchestrator, "solution_requests").await;
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    let (mut session, outcome) = asking.await.unwrap();

    let IntakeOutcome::Solutions(solutions) = outcome else {
        panic!("expected solutions, got {:?}", outcome);
    };
    assert_eq!(solutions.len(), SOLVED.len());
    assert_eq!(
        solutions[0].solution_description,
        "open tray two and remove the stuck sheet"
    );

    // Claimed responses do not pile up
    let mailboxes = orchestrator.mailboxes();
    assert!(mailboxes.similar_problem_responses.peek().await.unwrap().is_empty());
    assert!(mailboxes.solution_responses.peek().await.unwrap().is_empty());

    let record = session.select(1).await.unwrap();
    assert_eq!(record.solution_index, Some(1));

    cycle(&orchestrator, "solved_problems").await;
    let snapshot = orchestrator.monitor().compute_accuracy().await.unwrap();
    assert_eq!(snapshot.accuracy, Some(1.0));
    assert_eq!(snapshot.samples, 1);
}

#[tokio::test]
async fn test_ask_without_running_stages_gives_no_result() {
    let dir = TempDir::new().unwrap();
    let mut config = ResolvedConfig::with_home(dir.path());
    config.intake_poll = PollPolicy::fixed(3, Duration::from_millis(1));
    let collaborators = Collaborators {
        embedder: Arc::new(HashingEmbedder::new(8)),
        predictor: Arc::new(DistancePredictor),
        trainer: Arc::new(ThresholdTrainer),
        store: Arc::new(SqliteStore::in_memory().unwrap()),
    };
    let orchestrator = Orchestrator::with_collaborators(config, collaborators).unwrap();

    let mut session = orchestrator.intake();
    for _ in 0..3 {
        assert_eq!(
            session.find_solutions("disk full").await,
            IntakeOutcome::NoResult
        );
    }

    // The abandoned requests were withdrawn, so a late inference cycle
    // leaves no unclaimed responses behind
    cycle(&orchestrator, "troubleshooting").await;
    assert!(orchestrator
        .mailboxes()
        .similar_problem_responses
        .peek()
        .await
        .unwrap()
        .is_empty());

    let record = session.manual("deleted old logs").await.unwrap();
    assert!(record.is_solution_manual);
    assert_eq!(
        orchestrator.mailboxes().new_records.peek().await.unwrap().len(),
        1
    );
}
