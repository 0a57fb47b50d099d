//! Performance monitoring.
//!
//! Each solved problem scores `(total - index + 1) / total` for a suggestion
//! the operator picked, or 0 when they typed their own solution. Accuracy
//! is the mean score over every report ever consumed; the running sum and
//! count persist in `accuracy_state.json` between runs.

use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::config::{ConfigSource, StageConfig};
use crate::core::durable;
use crate::core::gate;
use crate::core::mailbox::Mailbox;
use crate::core::periodic::StageError;
use crate::domain::SolvedReport;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct MonitoringConfig {
    /// Accuracy below this raises a warning
    pub accuracy_threshold: f64,
}

impl Default for MonitoringConfig {
    fn default() -> Self {
        Self {
            accuracy_threshold: 0.5,
        }
    }
}

impl StageConfig for MonitoringConfig {
    fn validate(&self) -> Result<(), String> {
        if !(0.0..=1.0).contains(&self.accuracy_threshold) {
            return Err(format!(
                "accuracy_threshold {} outside [0, 1]",
                self.accuracy_threshold
            ));
        }
        Ok(())
    }
}

/// Running totals persisted between runs
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccuracyState {
    pub sum_of_scores: f64,
    pub number_of_scores: u64,
}

impl AccuracyState {
    pub fn accuracy(&self) -> Option<f64> {
        if self.number_of_scores == 0 {
            None
        } else {
            Some(self.sum_of_scores / self.number_of_scores as f64)
        }
    }

    fn absorb(mut self, reports: &[SolvedReport]) -> Self {
        for report in reports {
            self.sum_of_scores += report.score();
            self.number_of_scores += 1;
        }
        self
    }
}

/// The published accuracy figure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccuracySnapshot {
    /// `None` until the first report arrives
    pub accuracy: Option<f64>,
    pub samples: u64,
    /// Reports consumed by this run
    pub new_samples: usize,
    pub threshold: f64,
    pub below_threshold: bool,
    pub updated_at: DateTime<Utc>,
}

/// Process-wide accuracy service
///
/// Consumes `performance_reports`; one instance per process keeps that
/// mailbox single-consumer, and the internal lock serializes callers.
pub struct PerformanceMonitor {
    reports: Mailbox<SolvedReport>,
    state_path: PathBuf,
    accuracy_path: PathBuf,
    config: ConfigSource<MonitoringConfig>,
    lock: Mutex<()>,
}

impl PerformanceMonitor {
    pub fn new(
        reports: Mailbox<SolvedReport>,
        state_path: PathBuf,
        accuracy_path: PathBuf,
        config: ConfigSource<MonitoringConfig>,
    ) -> Self {
        Self {
            reports,
            state_path,
            accuracy_path,
            config,
            lock: Mutex::new(()),
        }
    }

    async fn load_state(&self) -> Result<AccuracyState, StageError> {
        durable::load_json(self.state_path.clone())
            .await
            .map(Option::unwrap_or_default)
            .map_err(|e| StageError::io("reading accuracy state", e))
    }

    /// Fold new performance reports into the running accuracy
    #[instrument(skip(self))]
    pub async fn compute_accuracy(&self) -> Result<AccuracySnapshot, StageError> {
        let _guard = self.lock.lock().await;

        let config = match self.config.load().await {
            Ok(config) => config,
            Err(e) => {
                warn!(error = %e, "Monitoring config rejected, using defaults");
                MonitoringConfig::default()
            }
        };

        let previous = self.load_state().await?;
        let consumed = gate::consume(&self.reports, |batch| async move {
            Ok::<_, StageError>(previous.absorb(&batch))
        })
        .await?;

        // Persisted only once the reports are gone from the mailbox, so a
        // failed reset cannot count them twice
        let (state, new_samples) = match consumed {
            Some(consumed) => {
                durable::write_json(self.state_path.clone(), consumed.output)
                    .await
                    .map_err(|e| StageError::io("writing accuracy state", e))?;
                (consumed.output, consumed.count)
            }
            None => (previous, 0),
        };

        let accuracy = state.accuracy();
        let below_threshold = accuracy.is_some_and(|a| a < config.accuracy_threshold);
        let snapshot = AccuracySnapshot {
            accuracy,
            samples: state.number_of_scores,
            new_samples,
            threshold: config.accuracy_threshold,
            below_threshold,
            updated_at: Utc::now(),
        };

        durable::write_json(self.accuracy_path.clone(), snapshot.clone())
            .await
            .map_err(|e| StageError::io("writing accuracy", e))?;

        if below_threshold {
            warn!(
                accuracy = ?accuracy,
                threshold = config.accuracy_threshold,
                "Accuracy below threshold"
            );
        } else {
            info!(accuracy = ?accuracy, samples = state.number_of_scores, new_samples, "Accuracy updated");
        }

        Ok(snapshot)
    }
}
