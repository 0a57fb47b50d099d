//! Collaborator interfaces for external systems.
//!
//! The pipeline talks to collaborators it does not own: a sentence
//! embedder, a similarity predictor, the trainer that fits the predictor's
//! model, and the solved-problem store. Each is an async trait so the
//! bundled local implementations and external programs are interchangeable.

pub mod command;
pub mod local;
pub mod sqlite_store;

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::config::Layout;
use crate::domain::IngestCandidate;

pub use command::{CommandAdapter, CommandConfig};
pub use local::{DistancePredictor, HashingEmbedder, ThresholdTrainer};
pub use sqlite_store::SqliteStore;

/// Failures reported by a collaborator
#[derive(Debug, Error)]
pub enum CollaboratorError {
    /// The collaborator could not be reached; distinct from an empty answer
    #[error("{name} unavailable: {reason}")]
    Unavailable { name: String, reason: String },

    #[error("{name} returned invalid output: {reason}")]
    Invalid { name: String, reason: String },
}

impl CollaboratorError {
    pub fn unavailable(name: impl Into<String>, reason: impl ToString) -> Self {
        Self::Unavailable {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    pub fn invalid(name: impl Into<String>, reason: impl ToString) -> Self {
        Self::Invalid {
            name: name.into(),
            reason: reason.to_string(),
        }
    }
}

/// Maps sentences to fixed-length vectors
#[async_trait]
pub trait Embedder: Send + Sync {
    fn name(&self) -> &str;

    /// One vector per sentence, all of the same length, deterministic
    async fn embed(&self, sentences: &[String]) -> Result<Vec<Vec<f64>>, CollaboratorError>;
}

/// Scores how similar two problems are from the difference of their vectors
#[async_trait]
pub trait Predictor: Send + Sync {
    fn name(&self) -> &str;

    /// One raw score per difference vector; callers clamp to `[0, 1]`
    async fn predict(&self, differences: &[Vec<f64>]) -> Result<Vec<f64>, CollaboratorError>;
}

/// Labelled difference vectors: label 1 means both problems share a solution
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LabelledSet {
    pub differences: Vec<Vec<f64>>,
    pub labels: Vec<u8>,
}

impl LabelledSet {
    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    pub fn push(&mut self, difference: Vec<f64>, label: u8) {
        self.differences.push(difference);
        self.labels.push(label);
    }
}

/// A fitted model, opaque to the pipeline, and its validation score
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainedModel {
    pub model: serde_json::Value,
    pub score: f64,
}

/// Fits and evaluates the similarity model
#[async_trait]
pub trait Trainer: Send + Sync {
    fn name(&self) -> &str;

    /// Fit on `training`, scored on `validation`
    async fn train(
        &self,
        training: &LabelledSet,
        validation: &LabelledSet,
    ) -> Result<TrainedModel, CollaboratorError>;

    /// Score a fitted model on held-out pairs
    async fn test(
        &self,
        model: &serde_json::Value,
        test: &LabelledSet,
    ) -> Result<f64, CollaboratorError>;
}

/// Durable store of solved problems
#[async_trait]
pub trait SolvedStore: Send + Sync {
    fn name(&self) -> &str;

    /// Record a solved problem, returning its id
    async fn upsert_solved(&self, problem: &str, solution: &str) -> Result<String, CollaboratorError>;

    /// Problems no older than `max_age_days` whose descriptions contain no
    /// banned keyword, newest first, at most `max_count`
    async fn fetch_eligible(
        &self,
        max_age_days: u32,
        max_count: usize,
        exclude_keywords: &[String],
    ) -> Result<Vec<IngestCandidate>, CollaboratorError>;

    /// Solution text of a stored problem
    async fn solution_for(&self, problem_id: &str) -> Result<Option<String>, CollaboratorError>;
}

/// Which embedder to use
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EmbedderConfig {
    Hashing {
        #[serde(default = "default_dimensions")]
        dimensions: usize,
    },
    Command(CommandConfig),
}

fn default_dimensions() -> usize {
    128
}

impl Default for EmbedderConfig {
    fn default() -> Self {
        Self::Hashing {
            dimensions: default_dimensions(),
        }
    }
}

/// Which predictor to use
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum PredictorConfig {
    Distance,
    Command(CommandConfig),
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self::Distance
    }
}

/// Which trainer to use
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TrainerConfig {
    Threshold,
    Command(CommandConfig),
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self::Threshold
    }
}

/// Collaborator selection from the global config file
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollaboratorsConfig {
    #[serde(default)]
    pub embedder: EmbedderConfig,
    #[serde(default)]
    pub predictor: PredictorConfig,
    #[serde(default)]
    pub trainer: TrainerConfig,
    /// SQLite database; defaults to `<home>/data/solved_problems.db`
    #[serde(default)]
    pub store_path: Option<PathBuf>,
}

/// The collaborators shared by every stage
#[derive(Clone)]
pub struct Collaborators {
    pub embedder: Arc<dyn Embedder>,
    pub predictor: Arc<dyn Predictor>,
    pub trainer: Arc<dyn Trainer>,
    pub store: Arc<dyn SolvedStore>,
}

impl Collaborators {
    /// Build the configured collaborators
    ///
    /// Opening the store is deferred to first use, so a missing database
    /// surfaces as `Unavailable` inside a stage cycle rather than here.
    pub fn from_config(config: &CollaboratorsConfig, layout: &Layout) -> Self {
        let embedder: Arc<dyn Embedder> = match &config.embedder {
            EmbedderConfig::Hashing { dimensions } => Arc::new(HashingEmbedder::new(*dimensions)),
            EmbedderConfig::Command(command) => Arc::new(CommandAdapter::new("embedder", command.clone())),
        };

        let predictor: Arc<dyn Predictor> = match &config.predictor {
            PredictorConfig::Distance => Arc::new(DistancePredictor),
            PredictorConfig::Command(command) => {
                Arc::new(CommandAdapter::new("predictor", command.clone()))
            }
        };

        let trainer: Arc<dyn Trainer> = match &config.trainer {
            TrainerConfig::Threshold => Arc::new(ThresholdTrainer),
            TrainerConfig::Command(command) => Arc::new(CommandAdapter::new("trainer", command.clone())),
        };

        let store_path = config
            .store_path
            .clone()
            .unwrap_or_else(|| layout.store_db());

        Self {
            embedder,
            predictor,
            trainer,
            store: Arc::new(SqliteStore::new(store_path)),
        }
    }
}

impl std::fmt::Debug for Collaborators {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collaborators")
            .field("embedder", &self.embedder.name())
            .field("predictor", &self.predictor.name())
            .field("trainer", &self.trainer.name())
            .field("store", &self.store.name())
            .finish()
    }
}
