//! Inference: answer similar-problem requests from the feature store.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::preparation::{FeatureStore, FeatureVector};
use super::ranking;
use crate::adapters::{Embedder, Predictor};
use crate::config::StageConfig;
use crate::core::gate;
use crate::core::mailbox::Mailbox;
use crate::core::periodic::{Stage, StageError};
use crate::domain::{
    CorrelationId, Response, SimilarProblems, SimilarProblemsRequest, SimilarProblemsResponse,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TroubleshootingConfig {
    pub period_ms: u64,
    /// Upper bound on ids returned per request
    pub max_candidates: usize,
}

impl Default for TroubleshootingConfig {
    fn default() -> Self {
        Self {
            period_ms: 1_000,
            max_candidates: 10,
        }
    }
}

impl StageConfig for TroubleshootingConfig {
    fn validate(&self) -> Result<(), String> {
        if self.max_candidates == 0 {
            return Err("max_candidates must be at least 1".to_string());
        }
        Ok(())
    }
}

pub struct TroubleshootingStage {
    requests: Mailbox<SimilarProblemsRequest>,
    responses: Mailbox<SimilarProblemsResponse>,
    features_path: PathBuf,
    embedder: Arc<dyn Embedder>,
    predictor: Arc<dyn Predictor>,
}

impl TroubleshootingStage {
    pub fn new(
        requests: Mailbox<SimilarProblemsRequest>,
        responses: Mailbox<SimilarProblemsResponse>,
        features_path: PathBuf,
        embedder: Arc<dyn Embedder>,
        predictor: Arc<dyn Predictor>,
    ) -> Self {
        Self {
            requests,
            responses,
            features_path,
            embedder,
            predictor,
        }
    }

    /// Rank every stored problem against one request vector
    async fn answer(
        &self,
        id: CorrelationId,
        request_vector: &[f64],
        candidates: &[FeatureVector],
        max_candidates: usize,
    ) -> Result<SimilarProblemsResponse, StageError> {
        if candidates.is_empty() {
            return Ok(Response::ok(id, SimilarProblems { problem_ids: vec![] }));
        }

        if let Some(mismatch) = candidates
            .iter()
            .find(|c| c.vector.len() != request_vector.len())
        {
            // A stale feature store must not poison the inbox; answer ERROR
            warn!(
                request_id = %id,
                problem_id = %mismatch.problem_id,
                expected = request_vector.len(),
                found = mismatch.vector.len(),
                "Feature dimensions disagree"
            );
            return Ok(Response::error(id));
        }

        let differences: Vec<Vec<f64>> = candidates
            .iter()
            .map(|c| ranking::difference(&c.vector, request_vector))
            .collect();
        let scores = self.predictor.predict(&differences).await?;
        if scores.len() != candidates.len() {
            return Err(StageError::Invalid(format!(
                "predictor returned {} scores for {} candidates",
                scores.len(),
                candidates.len()
            )));
        }

        let ids: Vec<String> = candidates.iter().map(|c| c.problem_id.clone()).collect();
        let problem_ids = ranking::rank(&ids, &scores, max_candidates);
        debug!(request_id = %id, returned = problem_ids.len(), "Ranked candidates");

        Ok(Response::ok(id, SimilarProblems { problem_ids }))
    }
}

#[async_trait]
impl Stage for TroubleshootingStage {
    type Config = TroubleshootingConfig;

    fn name(&self) -> &str {
        "troubleshooting"
    }

    fn period(&self, config: &TroubleshootingConfig) -> Duration {
        Duration::from_millis(config.period_ms)
    }

    async fn run_cycle(&self, config: &TroubleshootingConfig) -> Result<usize, StageError> {
        let handled = gate::consume_into(&self.requests, &self.responses, |batch| async move {
            let candidates = FeatureStore::load(self.features_path.clone())
                .await?
                .map(|store| store.vectors)
                .unwrap_or_default();

            let descriptions: Vec<String> = batch
                .iter()
                .map(|r| r.payload.problem_description.clone())
                .collect();
            let vectors = self.embedder.embed(&descriptions).await?;
            if vectors.len() != batch.len() {
                return Err(StageError::Invalid(format!(
                    "embedder returned {} vectors for {} requests",
                    vectors.len(),
                    batch.len()
                )));
            }

            let mut responses = Vec::with_capacity(batch.len());
            for (request, vector) in batch.iter().zip(&vectors) {
                responses.push(
                    self.answer(
                        request.correlation_id,
                        vector,
                        &candidates,
                        config.max_candidates,
                    )
                    .await?,
                );
            }
            Ok::<_, StageError>(responses)
        })
        .await?;

        Ok(handled)
    }
}
