//! Stages of the troubleshooting system.
//!
//! Every periodic stage implements [`crate::core::periodic::Stage`] and
//! consumes at most one mailbox. The intake session and the performance
//! monitor are driven on demand instead of on a timer.

pub mod intake;
pub mod monitoring;
pub mod preparation;
pub mod ranking;
pub mod repository;
pub mod segregation;
pub mod training;
pub mod troubleshooting;

pub use intake::{IntakeError, IntakeOutcome, IntakeSession, SuggestedSolution};
pub use monitoring::{AccuracySnapshot, MonitoringConfig, PerformanceMonitor};
pub use preparation::{FeatureStore, PreparationConfig, PreparationStage};
pub use repository::{IngestionStage, RepositoryConfig, SolutionRequestsStage, SolvedProblemsStage};
pub use segregation::{SegregationConfig, SegregationStage};
pub use training::{SimilarityModel, TrainingConfig, TrainingPaths, TrainingStage};
pub use troubleshooting::{TroubleshootingConfig, TroubleshootingStage};

/// Names of every stage configuration document
pub const CONFIG_NAMES: [&str; 6] = [
    "repository",
    "segregation",
    "preparation",
    "training",
    "troubleshooting",
    "monitoring",
];

/// Default document for a stage configuration, as YAML
pub fn default_config(name: &str) -> Option<Result<String, serde_yaml::Error>> {
    let yaml = match name {
        "repository" => serde_yaml::to_string(&RepositoryConfig::default()),
        "segregation" => serde_yaml::to_string(&SegregationConfig::default()),
        "preparation" => serde_yaml::to_string(&PreparationConfig::default()),
        "training" => serde_yaml::to_string(&TrainingConfig::default()),
        "troubleshooting" => serde_yaml::to_string(&TroubleshootingConfig::default()),
        "monitoring" => serde_yaml::to_string(&MonitoringConfig::default()),
        _ => return None,
    };
    Some(yaml)
}
