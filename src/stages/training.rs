//! Model training.
//!
//! Turns the segregated pair datasets into labelled difference vectors
//! using the feature store, hands them to the trainer and keeps the fitted
//! model with its validation and test scores in `similarity_model.json`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::preparation::FeatureStore;
use super::ranking;
use super::segregation::LabelledPair;
use crate::adapters::{LabelledSet, Trainer};
use crate::config::StageConfig;
use crate::core::durable;
use crate::core::periodic::{Stage, StageError};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct TrainingConfig {
    pub period_ms: u64,
    /// Fewer usable training pairs than this fails the cycle
    pub min_training_pairs: usize,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            period_ms: 3_600_000,
            min_training_pairs: 1,
        }
    }
}

impl StageConfig for TrainingConfig {}

/// The last fitted model
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SimilarityModel {
    pub trainer: String,
    pub trained_at: DateTime<Utc>,
    pub training_pairs: usize,
    pub validation_score: f64,
    /// `None` when the test set was empty
    pub test_score: Option<f64>,
    pub model: serde_json::Value,
}

impl SimilarityModel {
    pub async fn load(path: PathBuf) -> Result<Option<Self>, StageError> {
        let context = format!("reading model {}", path.display());
        durable::load_json(path)
            .await
            .map_err(|e| StageError::io(context, e))
    }
}

/// Where the datasets live and where the model goes
#[derive(Debug, Clone)]
pub struct TrainingPaths {
    pub training_set: PathBuf,
    pub validation_set: PathBuf,
    pub test_set: PathBuf,
    pub features: PathBuf,
    pub model: PathBuf,
}

pub struct TrainingStage {
    paths: TrainingPaths,
    trainer: Arc<dyn Trainer>,
}

impl TrainingStage {
    pub fn new(paths: TrainingPaths, trainer: Arc<dyn Trainer>) -> Self {
        Self { paths, trainer }
    }
}

/// Rows of a pair dataset, `None` if segregation has not written it yet
fn read_pairs(path: &Path) -> Result<Option<Vec<LabelledPair>>, StageError> {
    let context = || format!("reading {}", path.display());
    let mut reader = match csv::Reader::from_path(path) {
        Ok(reader) => reader,
        Err(e) => {
            let missing = matches!(
                e.kind(),
                csv::ErrorKind::Io(io) if io.kind() == std::io::ErrorKind::NotFound
            );
            return if missing {
                Ok(None)
            } else {
                Err(StageError::io(context(), e.into()))
            };
        }
    };

    reader
        .deserialize()
        .collect::<Result<Vec<LabelledPair>, _>>()
        .map(Some)
        .map_err(|e| StageError::SchemaViolation(format!("{}: {}", context(), e)))
}

/// Difference vectors for every pair whose problems both have features
///
/// Returns the set and the number of pairs skipped.
pub fn labelled_set(pairs: &[LabelledPair], features: &HashMap<&str, &[f64]>) -> (LabelledSet, usize) {
    let mut set = LabelledSet::default();
    let mut skipped = 0;

    for pair in pairs {
        match (
            features.get(pair.problem_1_id.as_str()),
            features.get(pair.problem_2_id.as_str()),
        ) {
            (Some(first), Some(second)) if first.len() == second.len() => {
                set.push(ranking::difference(first, second), pair.same_solution);
            }
            _ => skipped += 1,
        }
    }
    (set, skipped)
}

#[async_trait]
impl Stage for TrainingStage {
    type Config = TrainingConfig;

    fn name(&self) -> &str {
        "training"
    }

    fn period(&self, config: &TrainingConfig) -> Duration {
        Duration::from_millis(config.period_ms)
    }

    async fn run_cycle(&self, config: &TrainingConfig) -> Result<usize, StageError> {
        let Some(store) = FeatureStore::load(self.paths.features.clone()).await? else {
            debug!("No feature store yet");
            return Ok(0);
        };

        let paths = self.paths.clone();
        let datasets = tokio::task::spawn_blocking(move || {
            Ok::<_, StageError>((
                read_pairs(&paths.training_set)?,
                read_pairs(&paths.validation_set)?,
                read_pairs(&paths.test_set)?,
            ))
        })
        .await
        .map_err(|e| StageError::Invalid(format!("dataset reader failed: {}", e)))??;

        let (Some(training), Some(validation), Some(test)) = datasets else {
            debug!("Datasets not segregated yet");
            return Ok(0);
        };

        let features: HashMap<&str, &[f64]> = store
            .vectors
            .iter()
            .map(|v| (v.problem_id.as_str(), v.vector.as_slice()))
            .collect();
        let (training, skipped_training) = labelled_set(&training, &features);
        let (validation, skipped_validation) = labelled_set(&validation, &features);
        let (test, skipped_test) = labelled_set(&test, &features);

        let skipped = skipped_training + skipped_validation + skipped_test;
        if skipped > 0 {
            warn!(skipped, "Pairs without usable features left out");
        }
        if training.len() < config.min_training_pairs {
            return Err(StageError::Invalid(format!(
                "{} training pairs, at least {} required",
                training.len(),
                config.min_training_pairs
            )));
        }

        let trained = self.trainer.train(&training, &validation).await?;
        let test_score = if test.is_empty() {
            None
        } else {
            Some(self.trainer.test(&trained.model, &test).await?)
        };

        let model = SimilarityModel {
            trainer: self.trainer.name().to_string(),
            trained_at: Utc::now(),
            training_pairs: training.len(),
            validation_score: trained.score,
            test_score,
            model: trained.model,
        };
        durable::write_json(self.paths.model.clone(), model)
            .await
            .map_err(|e| StageError::io("writing model", e))?;

        info!(
            training = training.len(),
            validation_score = trained.score,
            test_score = ?test_score,
            "Model trained"
        );
        Ok(training.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pair(first: &str, second: &str, same: u8) -> LabelledPair {
        LabelledPair {
            problem_1_id: first.to_string(),
            problem_2_id: second.to_string(),
            same_solution: same,
        }
    }

    #[test]
    fn test_pairs_without_features_are_skipped() {
        let a = [1.0, 0.0];
        let b = [0.0, 1.0];
        let short = [1.0];
        let features: HashMap<&str, &[f64]> =
            [("a", &a[..]), ("b", &b[..]), ("c", &short[..])].into_iter().collect();

        let (set, skipped) = labelled_set(
            &[pair("a", "b", 0), pair("a", "x", 1), pair("a", "c", 1)],
            &features,
        );

        assert_eq!(set.labels, vec![0]);
        assert_eq!(set.differences, vec![vec![1.0, -1.0]]);
        assert_eq!(skipped, 2);
    }

    #[test]
    fn test_missing_dataset_reads_as_none() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(read_pairs(&dir.path().join("training_set.csv")).unwrap().is_none());
    }
}
