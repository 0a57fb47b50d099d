//! Dataset segregation.
//!
//! Reads the ingestion dataset without consuming it and writes:
//! - `problem_mapping.json`: id and description of every ingested problem
//! - `training_set.csv`, `validation_set.csv`, `test_set.csv`: every ordered
//!   pair of distinct problems labelled `same_solution` 1 or 0, shuffled and
//!   split by the configured percentages

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::info;

use crate::config::StageConfig;
use crate::core::durable;
use crate::core::mailbox::Mailbox;
use crate::core::periodic::{Stage, StageError};
use crate::domain::IngestCandidate;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SegregationConfig {
    pub period_ms: u64,
    pub training_percent: u32,
    pub validation_percent: u32,
    pub test_percent: u32,
    /// Fixed shuffle seed; random when absent
    pub seed: Option<u64>,
}

impl Default for SegregationConfig {
    fn default() -> Self {
        Self {
            period_ms: 300_000,
            training_percent: 70,
            validation_percent: 15,
            test_percent: 15,
            seed: None,
        }
    }
}

impl StageConfig for SegregationConfig {
    fn validate(&self) -> Result<(), String> {
        let total = u64::from(self.training_percent)
            + u64::from(self.validation_percent)
            + u64::from(self.test_percent);
        if total != 100 {
            return Err(format!("split percentages sum to {}, expected 100", total));
        }
        Ok(())
    }
}

/// One ingested problem, as read by preparation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappedProblem {
    pub problem_id: String,
    pub problem_description: String,
}

/// A labelled pair of problems
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelledPair {
    pub problem_1_id: String,
    pub problem_2_id: String,
    pub same_solution: u8,
}

/// Every ordered pair of distinct problems
pub fn self_join(problems: &[IngestCandidate]) -> Vec<LabelledPair> {
    let mut pairs = Vec::new();
    for left in problems {
        for right in problems {
            if left.id == right.id {
                continue;
            }
            pairs.push(LabelledPair {
                problem_1_id: left.id.clone(),
                problem_2_id: right.id.clone(),
                same_solution: u8::from(left.solution_ref == right.solution_ref),
            });
        }
    }
    pairs
}

/// Training, validation and test slices
///
/// Training and validation sizes round down; the test set takes the rest.
pub fn split<T>(mut items: Vec<T>, config: &SegregationConfig) -> (Vec<T>, Vec<T>, Vec<T>) {
    let total = items.len();
    let training = total * config.training_percent as usize / 100;
    let validation = total * config.validation_percent as usize / 100;

    let test = items.split_off(training + validation);
    let validation_set = items.split_off(training);
    (items, validation_set, test)
}

/// Write rows as CSV with a header, replacing `path` atomically
fn write_csv(path: &Path, rows: &[LabelledPair]) -> Result<(), StageError> {
    let context = || format!("writing {}", path.display());
    let dir = path.parent().unwrap_or(Path::new("."));
    std::fs::create_dir_all(dir).map_err(|e| StageError::io(context(), e))?;

    let tmp = NamedTempFile::new_in(dir).map_err(|e| StageError::io(context(), e))?;
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(tmp);

    writer
        .write_record(["problem_1_id", "problem_2_id", "same_solution"])
        .map_err(|e| StageError::io(context(), e.into()))?;
    for row in rows {
        writer
            .serialize(row)
            .map_err(|e| StageError::io(context(), e.into()))?;
    }

    let tmp = writer
        .into_inner()
        .map_err(|e| StageError::io(context(), e.into_error()))?;
    tmp.persist(path)
        .map_err(|e| StageError::io(context(), e.error))?;
    Ok(())
}

pub struct SegregationStage {
    records: Mailbox<IngestCandidate>,
    mapping_path: PathBuf,
    training_path: PathBuf,
    validation_path: PathBuf,
    test_path: PathBuf,
}

impl SegregationStage {
    pub fn new(
        records: Mailbox<IngestCandidate>,
        mapping_path: PathBuf,
        training_path: PathBuf,
        validation_path: PathBuf,
        test_path: PathBuf,
    ) -> Self {
        Self {
            records,
            mapping_path,
            training_path,
            validation_path,
            test_path,
        }
    }
}

#[async_trait]
impl Stage for SegregationStage {
    type Config = SegregationConfig;

    fn name(&self) -> &str {
        "segregation"
    }

    fn period(&self, config: &SegregationConfig) -> Duration {
        Duration::from_millis(config.period_ms)
    }

    async fn run_cycle(&self, config: &SegregationConfig) -> Result<usize, StageError> {
        let problems = self.records.peek().await?;

        let mapping: Vec<MappedProblem> = problems
            .iter()
            .map(|p| MappedProblem {
                problem_id: p.id.clone(),
                problem_description: p.description.clone(),
            })
            .collect();
        durable::write_json(self.mapping_path.clone(), mapping)
            .await
            .map_err(|e| StageError::io("writing problem mapping", e))?;

        let mut pairs = self_join(&problems);
        let mut rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        pairs.shuffle(&mut rng);

        let (training, validation, test) = split(pairs, config);
        let counts = (training.len(), validation.len(), test.len());

        let outputs = [
            (self.training_path.clone(), training),
            (self.validation_path.clone(), validation),
            (self.test_path.clone(), test),
        ];
        tokio::task::spawn_blocking(move || {
            outputs
                .iter()
                .try_for_each(|(path, rows)| write_csv(path, rows))
        })
        .await
        .map_err(|e| StageError::Invalid(format!("segregation writer failed: {}", e)))??;

        info!(
            problems = problems.len(),
            training = counts.0,
            validation = counts.1,
            test = counts.2,
            "Datasets written"
        );
        Ok(problems.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(id: &str, solution: &str) -> IngestCandidate {
        IngestCandidate {
            id: id.to_string(),
            description: format!("problem {}", id),
            solution_ref: solution.to_string(),
        }
    }

    #[test]
    fn test_self_join_labels_pairs() {
        let pairs = self_join(&[
            candidate("a", "s1"),
            candidate("b", "s1"),
            candidate("c", "s2"),
        ]);

        assert_eq!(pairs.len(), 6);
        let ab = pairs
            .iter()
            .find(|p| p.problem_1_id == "a" && p.problem_2_id == "b")
            .unwrap();
        assert_eq!(ab.same_solution, 1);
        let ac = pairs
            .iter()
            .find(|p| p.problem_1_id == "a" && p.problem_2_id == "c")
            .unwrap();
        assert_eq!(ac.same_solution, 0);
    }

    #[test]
    fn test_huge_percentages_are_rejected() {
        let config = SegregationConfig {
            training_percent: u32::MAX,
            validation_percent: u32::MAX,
            test_percent: 2,
            ..SegregationConfig::default()
        };

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_split_sizes() {
        let config = SegregationConfig::default();
        let (training, validation, test) = split((0..10).collect::<Vec<_>>(), &config);

        assert_eq!(training.len(), 7);
        assert_eq!(validation.len(), 1);
        assert_eq!(test.len(), 2);
    }

    #[test]
    fn test_percentages_must_sum_to_100() {
        let config = SegregationConfig {
            training_percent: 80,
            ..SegregationConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
