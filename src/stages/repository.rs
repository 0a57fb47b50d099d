//! Solved-problem repository: three tasks sharing `repository.yaml`.
//!
//! - `solution_requests`: answer solution requests from the store
//! - `solved_problems`: store newly solved problems, emit performance reports
//! - `ingestion`: rebuild the ingestion dataset from eligible problems

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::adapters::SolvedStore;
use crate::config::StageConfig;
use crate::core::gate;
use crate::core::mailbox::Mailbox;
use crate::core::periodic::{Stage, StageError};
use crate::domain::{
    IngestCandidate, Response, SolutionRequest, SolutionResponse, SolutionText, SolvedRecord,
    SolvedReport,
};

/// Settings for every repository task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct RepositoryConfig {
    pub solution_requests_period_ms: u64,
    pub new_records_period_ms: u64,
    pub ingestion_period_ms: u64,
    /// Only problems solved within this many days are ingested
    pub max_problem_age_days: u32,
    pub max_records: usize,
    /// Fewer eligible problems than this makes the ingestion cycle fail
    pub min_records: usize,
    /// Glob patterns; a problem with any matching word is never ingested
    pub banned_keywords: Vec<String>,
}

impl Default for RepositoryConfig {
    fn default() -> Self {
        Self {
            solution_requests_period_ms: 1_000,
            new_records_period_ms: 5_000,
            ingestion_period_ms: 120_000,
            max_problem_age_days: 365,
            max_records: 500,
            min_records: 10,
            banned_keywords: Vec::new(),
        }
    }
}

impl StageConfig for RepositoryConfig {
    fn validate(&self) -> Result<(), String> {
        if self.max_records == 0 {
            return Err("max_records must be at least 1".to_string());
        }
        if self.min_records > self.max_records {
            return Err(format!(
                "min_records ({}) exceeds max_records ({})",
                self.min_records, self.max_records
            ));
        }
        for keyword in &self.banned_keywords {
            glob::Pattern::new(keyword)
                .map_err(|e| format!("banned keyword '{}': {}", keyword, e))?;
        }
        Ok(())
    }
}

/// Answers `solution_requests` into `solution_responses`
pub struct SolutionRequestsStage {
    requests: Mailbox<SolutionRequest>,
    responses: Mailbox<SolutionResponse>,
    store: Arc<dyn SolvedStore>,
}

impl SolutionRequestsStage {
    pub fn new(
        requests: Mailbox<SolutionRequest>,
        responses: Mailbox<SolutionResponse>,
        store: Arc<dyn SolvedStore>,
    ) -> Self {
        Self {
            requests,
            responses,
            store,
        }
    }
}

#[async_trait]
impl Stage for SolutionRequestsStage {
    type Config = RepositoryConfig;

    fn name(&self) -> &str {
        "solution_requests"
    }

    fn period(&self, config: &RepositoryConfig) -> Duration {
        Duration::from_millis(config.solution_requests_period_ms)
    }

    async fn run_cycle(&self, _config: &RepositoryConfig) -> Result<usize, StageError> {
        let store = &self.store;

        let handled = gate::consume_into(&self.requests, &self.responses, |batch| async move {
            let mut responses = Vec::with_capacity(batch.len());
            for request in batch {
                let id = request.correlation_id;
                match store.solution_for(&request.payload.problem_id).await? {
                    Some(solution) => responses.push(Response::ok(
                        id,
                        SolutionText {
                            solution_description: solution,
                        },
                    )),
                    None => {
                        debug!(request_id = %id, problem_id = %request.payload.problem_id, "Unknown problem");
                        responses.push(Response::error(id));
                    }
                }
            }
            Ok::<_, StageError>(responses)
        })
        .await?;

        Ok(handled)
    }
}

/// Stores `new_records` and reports each into `performance_reports`
pub struct SolvedProblemsStage {
    records: Mailbox<SolvedRecord>,
    reports: Mailbox<SolvedReport>,
    store: Arc<dyn SolvedStore>,
}

impl SolvedProblemsStage {
    pub fn new(
        records: Mailbox<SolvedRecord>,
        reports: Mailbox<SolvedReport>,
        store: Arc<dyn SolvedStore>,
    ) -> Self {
        Self {
            records,
            reports,
            store,
        }
    }
}

#[async_trait]
impl Stage for SolvedProblemsStage {
    type Config = RepositoryConfig;

    fn name(&self) -> &str {
        "solved_problems"
    }

    fn period(&self, config: &RepositoryConfig) -> Duration {
        Duration::from_millis(config.new_records_period_ms)
    }

    async fn run_cycle(&self, _config: &RepositoryConfig) -> Result<usize, StageError> {
        let store = &self.store;

        let handled = gate::consume_into(&self.records, &self.reports, |batch| async move {
            let mut reports = Vec::with_capacity(batch.len());
            for record in batch {
                // Upserts are keyed by content, so a retried batch adds nothing twice
                let id = store
                    .upsert_solved(&record.problem_description, &record.solution_description)
                    .await?;
                debug!(problem_id = %id, manual = record.is_solution_manual, "Stored solved problem");
                reports.push(record.to_report());
            }
            Ok::<_, StageError>(reports)
        })
        .await?;

        Ok(handled)
    }
}

/// Replaces `ingestion_records` with the currently eligible problems
pub struct IngestionStage {
    records: Mailbox<IngestCandidate>,
    store: Arc<dyn SolvedStore>,
}

impl IngestionStage {
    pub fn new(records: Mailbox<IngestCandidate>, store: Arc<dyn SolvedStore>) -> Self {
        Self { records, store }
    }
}

#[async_trait]
impl Stage for IngestionStage {
    type Config = RepositoryConfig;

    fn name(&self) -> &str {
        "ingestion"
    }

    fn period(&self, config: &RepositoryConfig) -> Duration {
        Duration::from_millis(config.ingestion_period_ms)
    }

    async fn run_cycle(&self, config: &RepositoryConfig) -> Result<usize, StageError> {
        let eligible = self
            .store
            .fetch_eligible(
                config.max_problem_age_days,
                config.max_records,
                &config.banned_keywords,
            )
            .await?;

        let total = eligible.len();
        self.records.replace(eligible).await?;

        if total < config.min_records {
            warn!(total, min = config.min_records, "Not enough eligible records");
            return Err(StageError::Invalid(format!(
                "not enough eligible records: {} < {}",
                total, config.min_records
            )));
        }

        info!(total, "Ingestion dataset rebuilt");
        Ok(total)
    }
}
