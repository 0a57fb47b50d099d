//! Feature preparation: embed every mapped problem into the feature store.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::segregation::MappedProblem;
use crate::adapters::Embedder;
use crate::config::StageConfig;
use crate::core::durable;
use crate::core::periodic::{Stage, StageError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PreparationConfig {
    pub period_ms: u64,
}

impl Default for PreparationConfig {
    fn default() -> Self {
        Self { period_ms: 300_000 }
    }
}

impl StageConfig for PreparationConfig {}

/// One stored problem and its embedding
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureVector {
    pub problem_id: String,
    pub vector: Vec<f64>,
}

/// Embeddings of every known problem, read by inference
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FeatureStore {
    pub embedder: String,
    pub generated_at: DateTime<Utc>,
    pub vectors: Vec<FeatureVector>,
}

impl FeatureStore {
    /// The store at `path`, or `None` if preparation has not run yet
    pub async fn load(path: PathBuf) -> Result<Option<Self>, StageError> {
        let context = format!("reading feature store {}", path.display());
        durable::load_json(path)
            .await
            .map_err(|e| StageError::io(context, e))
    }
}

pub struct PreparationStage {
    mapping_path: PathBuf,
    features_path: PathBuf,
    embedder: Arc<dyn Embedder>,
}

impl PreparationStage {
    pub fn new(mapping_path: PathBuf, features_path: PathBuf, embedder: Arc<dyn Embedder>) -> Self {
        Self {
            mapping_path,
            features_path,
            embedder,
        }
    }
}

#[async_trait]
impl Stage for PreparationStage {
    type Config = PreparationConfig;

    fn name(&self) -> &str {
        "preparation"
    }

    fn period(&self, config: &PreparationConfig) -> Duration {
        Duration::from_millis(config.period_ms)
    }

    async fn run_cycle(&self, _config: &PreparationConfig) -> Result<usize, StageError> {
        let mapping: Option<Vec<MappedProblem>> = durable::load_json(self.mapping_path.clone())
            .await
            .map_err(|e| StageError::io("reading problem mapping", e))?;

        let Some(mapping) = mapping else {
            debug!("No problem mapping yet");
            return Ok(0);
        };

        let descriptions: Vec<String> = mapping
            .iter()
            .map(|p| p.problem_description.clone())
            .collect();
        let vectors = self.embedder.embed(&descriptions).await?;
        if vectors.len() != mapping.len() {
            return Err(StageError::Invalid(format!(
                "embedder returned {} vectors for {} problems",
                vectors.len(),
                mapping.len()
            )));
        }

        let store = FeatureStore {
            embedder: self.embedder.name().to_string(),
            generated_at: Utc::now(),
            vectors: mapping
                .into_iter()
                .zip(vectors)
                .map(|(problem, vector)| FeatureVector {
                    problem_id: problem.problem_id,
                    vector,
                })
                .collect(),
        };

        let count = store.vectors.len();
        durable::write_json(self.features_path.clone(), store)
            .await
            .map_err(|e| StageError::io("writing feature store", e))?;

        info!(count, "Feature store written");
        Ok(count)
    }
}
