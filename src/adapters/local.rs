//! In-process collaborators: a hashing embedder, a distance predictor and
//! a trainer that fits a decision threshold on the distance similarity.
//!
//! None needs an external model, so a fresh install can run the whole
//! pipeline end to end. Swap in [`super::CommandAdapter`] for real models.

use std::collections::HashSet;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::{CollaboratorError, Embedder, LabelledSet, Predictor, TrainedModel, Trainer};

const STOPWORDS: &[&str] = &[
    "a", "about", "after", "again", "all", "am", "an", "and", "any", "are", "as", "at", "be",
    "been", "before", "being", "but", "by", "can", "did", "do", "does", "doing", "for", "from",
    "had", "has", "have", "having", "he", "her", "here", "him", "his", "how", "i", "if", "in",
    "into", "is", "it", "its", "itself", "just", "me", "my", "no", "nor", "not", "now", "of",
    "off", "on", "once", "only", "or", "other", "our", "out", "over", "own", "same", "she", "so",
    "some", "such", "than", "that", "the", "their", "them", "then", "there", "these", "they",
    "this", "those", "to", "too", "under", "until", "up", "very", "was", "we", "were", "what",
    "when", "where", "which", "while", "who", "why", "will", "with", "you", "your",
];

/// Bag-of-words feature hashing into an L2-normalized vector
pub struct HashingEmbedder {
    dimensions: usize,
    stopwords: HashSet<&'static str>,
}

impl HashingEmbedder {
    pub fn new(dimensions: usize) -> Self {
        Self {
            dimensions: dimensions.max(1),
            stopwords: STOPWORDS.iter().copied().collect(),
        }
    }

    pub fn dimensions(&self) -> usize {
        self.dimensions
    }

    /// Lowercase, strip punctuation, drop stopwords
    pub fn normalize(&self, sentence: &str) -> Vec<String> {
        sentence
            .to_lowercase()
            .split(|c: char| !c.is_alphanumeric())
            .filter(|token| !token.is_empty() && !self.stopwords.contains(*token))
            .map(str::to_string)
            .collect()
    }

    fn vector(&self, sentence: &str) -> Vec<f64> {
        let mut vector = vec![0.0; self.dimensions];

        for token in self.normalize(sentence) {
            let digest = Sha256::digest(token.as_bytes());
            let mut bucket = [0u8; 8];
            bucket.copy_from_slice(&digest[..8]);
            let index = (u64::from_le_bytes(bucket) % self.dimensions as u64) as usize;
            let sign = if digest[8] & 1 == 0 { 1.0 } else { -1.0 };
            vector[index] += sign;
        }

        let norm = vector.iter().map(|x| x * x).sum::<f64>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|x| *x /= norm);
        }
        vector
    }
}

#[async_trait]
impl Embedder for HashingEmbedder {
    fn name(&self) -> &str {
        "hashing"
    }

    async fn embed(&self, sentences: &[String]) -> Result<Vec<Vec<f64>>, CollaboratorError> {
        Ok(sentences.iter().map(|s| self.vector(s)).collect())
    }
}

/// Similarity as `1 / (1 + ‖d‖₂)`: identical vectors score 1
#[derive(Debug, Clone, Copy, Default)]
pub struct DistancePredictor;

impl DistancePredictor {
    pub fn similarity(difference: &[f64]) -> f64 {
        1.0 / (1.0 + difference.iter().map(|x| x * x).sum::<f64>().sqrt())
    }
}

#[async_trait]
impl Predictor for DistancePredictor {
    fn name(&self) -> &str {
        "distance"
    }

    async fn predict(&self, differences: &[Vec<f64>]) -> Result<Vec<f64>, CollaboratorError> {
        Ok(differences
            .iter()
            .map(|d| DistancePredictor::similarity(d))
            .collect())
    }
}

/// Fitted state of [`ThresholdTrainer`]
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ThresholdModel {
    /// Pairs at or above this similarity are predicted to share a solution
    pub threshold: f64,
}

impl ThresholdModel {
    /// Fraction of pairs whose predicted label matches; 0 for no pairs
    pub fn accuracy(&self, set: &LabelledSet) -> f64 {
        if set.is_empty() {
            return 0.0;
        }
        let correct = set
            .differences
            .iter()
            .zip(&set.labels)
            .filter(|(difference, label)| {
                let predicted = DistancePredictor::similarity(difference) >= self.threshold;
                predicted == (**label == 1)
            })
            .count();
        correct as f64 / set.len() as f64
    }
}

/// Grid search over thresholds in `0.05..=0.95`
///
/// Picks the threshold with the best training accuracy; ties go to the
/// lower threshold.
#[derive(Debug, Clone, Copy, Default)]
pub struct ThresholdTrainer;

impl ThresholdTrainer {
    const STEPS: u32 = 19;

    pub fn fit(training: &LabelledSet) -> ThresholdModel {
        let mut best = ThresholdModel { threshold: 0.05 };
        let mut best_accuracy = best.accuracy(training);

        for step in 2..=Self::STEPS {
            let candidate = ThresholdModel {
                threshold: f64::from(step) * 0.05,
            };
            let accuracy = candidate.accuracy(training);
            if accuracy > best_accuracy {
                best = candidate;
                best_accuracy = accuracy;
            }
        }
        best
    }
}

#[async_trait]
impl Trainer for ThresholdTrainer {
    fn name(&self) -> &str {
        "threshold"
    }

    async fn train(
        &self,
        training: &LabelledSet,
        validation: &LabelledSet,
    ) -> Result<TrainedModel, CollaboratorError> {
        if training.is_empty() {
            return Err(CollaboratorError::invalid(self.name(), "no training pairs"));
        }
        let model = Self::fit(training);
        Ok(TrainedModel {
            score: model.accuracy(validation),
            model: serde_json::to_value(model).map_err(|e| CollaboratorError::invalid(self.name(), e))?,
        })
    }

    async fn test(
        &self,
        model: &serde_json::Value,
        test: &LabelledSet,
    ) -> Result<f64, CollaboratorError> {
        let model: ThresholdModel = serde_json::from_value(model.clone())
            .map_err(|e| CollaboratorError::invalid(self.name(), e))?;
        Ok(model.accuracy(test))
    }
}
