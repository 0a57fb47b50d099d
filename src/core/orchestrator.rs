//! Process-level wiring.
//!
//! The orchestrator opens every mailbox once, builds the collaborators and
//! creates exactly one periodic task per consumed mailbox. Other processes
//! (`once`, `accuracy`, `mailbox drain`) may run the same consumer; the
//! mailbox consumer claim refuses them while a cycle is in progress.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use tracing::{error, info, instrument};

use crate::adapters::Collaborators;
use crate::config::schemas::{mailbox_schema, stage_schema};
use crate::config::{ConfigSource, Layout, MailboxName, Mailboxes, ResolvedConfig, StageConfig};
use crate::domain::Report;
use crate::stages::{
    self, IngestionStage, IntakeSession, PerformanceMonitor, PreparationStage, SegregationStage,
    SolutionRequestsStage, SolvedProblemsStage, TrainingPaths, TrainingStage, TroubleshootingStage,
};

use super::durable;
use super::periodic::{PeriodicTask, Schedulable, Stage, TaskHandle};

/// Every periodic task, with the configuration document it reads
pub const TASKS: [(&str, &str); 7] = [
    ("solution_requests", "repository"),
    ("solved_problems", "repository"),
    ("ingestion", "repository"),
    ("segregation", "segregation"),
    ("preparation", "preparation"),
    ("training", "training"),
    ("troubleshooting", "troubleshooting"),
];

/// Owns the mailboxes, collaborators and monitor of one process
pub struct Orchestrator {
    config: ResolvedConfig,
    layout: Layout,
    mailboxes: Mailboxes,
    collaborators: Collaborators,
    monitor: Arc<PerformanceMonitor>,
}

impl Orchestrator {
    /// Wire everything from the resolved configuration
    pub fn new(config: ResolvedConfig) -> Result<Self> {
        let collaborators = Collaborators::from_config(&config.collaborators, &config.layout());
        Self::with_collaborators(config, collaborators)
    }

    /// Wire everything around the given collaborators
    pub fn with_collaborators(config: ResolvedConfig, collaborators: Collaborators) -> Result<Self> {
        let layout = config.layout();
        let mailboxes = Mailboxes::open(&layout).context("Failed to open mailboxes")?;

        let monitor = Arc::new(PerformanceMonitor::new(
            mailboxes.performance_reports.clone(),
            layout.accuracy_state(),
            layout.accuracy(),
            stage_source(&layout, "monitoring"),
        ));

        Ok(Self {
            config,
            layout,
            mailboxes,
            collaborators,
            monitor,
        })
    }

    pub fn layout(&self) -> &Layout {
        &self.layout
    }

    pub fn mailboxes(&self) -> &Mailboxes {
        &self.mailboxes
    }

    pub fn monitor(&self) -> Arc<PerformanceMonitor> {
        Arc::clone(&self.monitor)
    }

    /// A fresh intake session polling with the configured budget
    pub fn intake(&self) -> IntakeSession {
        IntakeSession::new(&self.mailboxes, self.config.intake_poll.clone())
    }

    fn task<S: Stage>(&self, stage: S, config_name: &str) -> Box<dyn Schedulable> {
        let report = self.layout.report(stage.name());
        Box::new(
            PeriodicTask::new(stage, stage_source(&self.layout, config_name), report)
                .with_fallback_period(self.config.fallback_period),
        )
    }

    /// One task per consumed mailbox, in [`TASKS`] order
    pub fn tasks(&self) -> Vec<Box<dyn Schedulable>> {
        let mb = &self.mailboxes;
        let store = &self.collaborators.store;

        vec![
            self.task(
                SolutionRequestsStage::new(
                    mb.solution_requests.clone(),
                    mb.solution_responses.clone(),
                    Arc::clone(store),
                ),
                "repository",
            ),
            self.task(
                SolvedProblemsStage::new(
                    mb.new_records.clone(),
                    mb.performance_reports.clone(),
                    Arc::clone(store),
                ),
                "repository",
            ),
            self.task(
                IngestionStage::new(mb.ingestion_records.clone(), Arc::clone(store)),
                "repository",
            ),
            self.task(
                SegregationStage::new(
                    mb.ingestion_records.clone(),
                    self.layout.problem_mapping(),
                    self.layout.training_set(),
                    self.layout.validation_set(),
                    self.layout.test_set(),
                ),
                "segregation",
            ),
            self.task(
                PreparationStage::new(
                    self.layout.problem_mapping(),
                    self.layout.feature_vectors(),
                    Arc::clone(&self.collaborators.embedder),
                ),
                "preparation",
            ),
            self.task(
                TrainingStage::new(
                    TrainingPaths {
                        training_set: self.layout.training_set(),
                        validation_set: self.layout.validation_set(),
                        test_set: self.layout.test_set(),
                        features: self.layout.feature_vectors(),
                        model: self.layout.similarity_model(),
                    },
                    Arc::clone(&self.collaborators.trainer),
                ),
                "training",
            ),
            self.task(
                TroubleshootingStage::new(
                    mb.similar_problem_requests.clone(),
                    mb.similar_problem_responses.clone(),
                    self.layout.feature_vectors(),
                    Arc::clone(&self.collaborators.embedder),
                    Arc::clone(&self.collaborators.predictor),
                ),
                "troubleshooting",
            ),
        ]
    }

    /// Spawn every task
    #[instrument(skip(self), fields(home = %self.layout.home().display()))]
    pub fn start(&self) -> Vec<TaskHandle> {
        let handles: Vec<TaskHandle> = self.tasks().into_iter().map(|task| task.spawn()).collect();
        info!(tasks = handles.len(), "Orchestrator started");
        handles
    }

    /// Run a single cycle of the named task
    pub async fn run_once(&self, name: &str) -> Result<Report> {
        let task = self
            .tasks()
            .into_iter()
            .find(|task| task.name() == name)
            .with_context(|| {
                format!(
                    "Unknown task '{}'. Known tasks: {}",
                    name,
                    TASKS.iter().map(|(task, _)| *task).collect::<Vec<_>>().join(", ")
                )
            })?;

        Ok(task.run_once().await)
    }

    /// Last report of every task, `None` if it never ran
    pub async fn status(&self) -> Result<Vec<(String, Option<Report>)>> {
        let mut reports = Vec::with_capacity(TASKS.len());
        for (task, _) in TASKS {
            let path = self.layout.report(task);
            let report = Report::read_from(&path)
                .await
                .with_context(|| format!("Failed to read report {}", path.display()))?;
            reports.push((task.to_string(), report));
        }
        Ok(reports)
    }
}

/// Cancel every task and wait for each loop to exit
pub async fn shutdown(handles: Vec<TaskHandle>) {
    for handle in handles {
        let name = handle.name().to_string();
        if let Err(e) = handle.stop().await {
            error!(task = %name, error = %e, "Task ended abnormally");
        }
    }
    info!("Orchestrator stopped");
}

fn stage_source<C: StageConfig>(layout: &Layout, name: &str) -> ConfigSource<C> {
    ConfigSource::new(layout.stage_config(name)).with_schema(layout.schema(name))
}

/// Write default stage configs, built-in schemas and empty mailboxes
///
/// Existing configs and schemas are kept unless `force` is set. Mailboxes
/// are never truncated; missing ones are created and existing ones checked.
pub async fn initialize(layout: &Layout, force: bool) -> Result<Vec<PathBuf>> {
    let mut written = Vec::new();

    for name in stages::CONFIG_NAMES {
        let path = layout.stage_config(name);
        if force || !path.exists() {
            if let Some(yaml) = stages::default_config(name) {
                let yaml = yaml.with_context(|| format!("Failed to render {} config", name))?;
                if let Some(dir) = path.parent() {
                    tokio::fs::create_dir_all(dir).await?;
                }
                tokio::fs::write(&path, yaml)
                    .await
                    .with_context(|| format!("Failed to write {}", path.display()))?;
                written.push(path);
            }
        }

        if let Some(schema) = stage_schema(name) {
            write_schema(layout.schema(name), schema, force, &mut written).await?;
        }
    }

    for name in MailboxName::ALL {
        write_schema(layout.schema(name.stem()), mailbox_schema(name), force, &mut written).await?;
    }

    let mailboxes = Mailboxes::open(layout).context("Failed to open mailboxes")?;
    mailboxes
        .ensure_all()
        .await
        .context("Failed to create mailboxes")?;

    info!(home = %layout.home().display(), written = written.len(), "Initialized");
    Ok(written)
}

async fn write_schema(
    path: PathBuf,
    schema: serde_json::Value,
    force: bool,
    written: &mut Vec<PathBuf>,
) -> Result<()> {
    if !force && path.exists() {
        return Ok(());
    }
    durable::write_json(path.clone(), schema)
        .await
        .with_context(|| format!("Failed to write {}", path.display()))?;
    written.push(path);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{DistancePredictor, HashingEmbedder, SqliteStore, ThresholdTrainer};
    use tempfile::TempDir;

    fn orchestrator(dir: &TempDir) -> Orchestrator {
        let collaborators = Collaborators {
            embedder: Arc::new(HashingEmbedder::new(16)),
            predictor: Arc::new(DistancePredictor),
            trainer: Arc::new(ThresholdTrainer),
            store: Arc::new(SqliteStore::in_memory().unwrap()),
        };
        Orchestrator::with_collaborators(ResolvedConfig::with_home(dir.path()), collaborators)
            .unwrap()
    }

    #[test]
    fn test_one_task_per_consumer() {
        let dir = TempDir::new().unwrap();
        let names: Vec<String> = orchestrator(&dir)
            .tasks()
            .iter()
            .map(|t| t.name().to_string())
            .collect();

        let expected: Vec<String> = TASKS.iter().map(|(t, _)| t.to_string()).collect();
        assert_eq!(names, expected);
    }

    #[tokio::test]
    async fn test_initialize_then_run_once() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(dir.path());

        let written = initialize(&layout, false).await.unwrap();
        assert!(written.contains(&layout.stage_config("repository")));
        assert!(layout.mailbox(MailboxName::NewRecords).exists());

        // A second run keeps what is there
        assert!(initialize(&layout, false).await.unwrap().is_empty());

        let report = orchestrator(&dir).run_once("solution_requests").await.unwrap();
        assert!(report.is_ok());

        // Nothing segregated yet, so training has nothing to do
        let report = orchestrator(&dir).run_once("training").await.unwrap();
        assert!(report.is_ok());
    }

    #[tokio::test]
    async fn test_unknown_task() {
        let dir = TempDir::new().unwrap();
        assert!(orchestrator(&dir).run_once("nope").await.is_err());
    }

    #[tokio::test]
    async fn test_status_before_any_cycle() {
        let dir = TempDir::new().unwrap();
        let status = orchestrator(&dir).status().await.unwrap();

        assert_eq!(status.len(), TASKS.len());
        assert!(status.iter().all(|(_, report)| report.is_none()));
    }
}
