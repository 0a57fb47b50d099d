//! Self-rescheduling stage tasks.
//!
//! A [`PeriodicTask`] runs one stage action per cycle:
//!
//! 1. load the stage configuration (on failure, report `ERROR`)
//! 2. run the stage action
//! 3. overwrite the task's report file
//! 4. reload the configuration to pick the next delay (fallback on failure)
//! 5. sleep, unless cancelled
//!
//! Within one task only a single cycle is ever in flight. Tasks share no
//! ordering with each other.

use std::fmt;
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::gate::GateError;
use super::mailbox::MailboxError;
use crate::adapters::CollaboratorError;
use crate::config::stage::{ConfigSource, StageConfig};
use crate::domain::Report;

/// Period used when the configuration cannot supply one
pub const DEFAULT_FALLBACK_PERIOD: Duration = Duration::from_secs(120);

/// Why a stage cycle failed
#[derive(Debug, Error)]
pub enum StageError {
    #[error("schema violation: {0}")]
    SchemaViolation(String),

    #[error("collaborator unavailable: {0}")]
    CollaboratorUnavailable(String),

    #[error(transparent)]
    Mailbox(MailboxError),

    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },

    #[error("{0}")]
    Invalid(String),
}

impl StageError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        Self::Io {
            context: context.into(),
            source,
        }
    }
}

impl From<MailboxError> for StageError {
    fn from(e: MailboxError) -> Self {
        if e.is_schema_violation() {
            Self::SchemaViolation(e.to_string())
        } else {
            Self::Mailbox(e)
        }
    }
}

impl From<CollaboratorError> for StageError {
    fn from(e: CollaboratorError) -> Self {
        match e {
            CollaboratorError::Unavailable { .. } => Self::CollaboratorUnavailable(e.to_string()),
            CollaboratorError::Invalid { .. } => Self::Invalid(e.to_string()),
        }
    }
}

impl From<GateError<StageError>> for StageError {
    fn from(e: GateError<StageError>) -> Self {
        match e {
            GateError::Process(inner) => inner,
            GateError::Inbox(e) | GateError::Outbox(e) | GateError::Reset(e) => e.into(),
        }
    }
}

/// One stage action, run once per cycle
#[async_trait]
pub trait Stage: Send + Sync + 'static {
    type Config: StageConfig;

    /// Task name; also names the report file
    fn name(&self) -> &str;

    /// Delay before the next cycle
    fn period(&self, config: &Self::Config) -> Duration;

    /// Run one cycle, returning how many items it handled
    async fn run_cycle(&self, config: &Self::Config) -> Result<usize, StageError>;
}

/// Stable identity of a spawned task
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TaskId(Uuid);

impl TaskId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a task is in its cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Idle,
    Running,
    ReportedOk,
    ReportedError,
    Scheduled,
    Stopped,
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Idle => "idle",
            Self::Running => "running",
            Self::ReportedOk => "reported ok",
            Self::ReportedError => "reported error",
            Self::Scheduled => "scheduled",
            Self::Stopped => "stopped",
        };
        f.write_str(label)
    }
}

/// A stage bound to its configuration and report file
pub struct PeriodicTask<S: Stage> {
    id: TaskId,
    stage: S,
    config: ConfigSource<S::Config>,
    report_path: std::path::PathBuf,
    fallback_period: Duration,
}

impl<S: Stage> PeriodicTask<S> {
    pub fn new(
        stage: S,
        config: ConfigSource<S::Config>,
        report_path: impl Into<std::path::PathBuf>,
    ) -> Self {
        Self {
            id: TaskId::new(),
            stage,
            config,
            report_path: report_path.into(),
            fallback_period: DEFAULT_FALLBACK_PERIOD,
        }
    }

    pub fn with_fallback_period(mut self, period: Duration) -> Self {
        self.fallback_period = period;
        self
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn stage(&self) -> &S {
        &self.stage
    }

    /// Run a single cycle and write its report
    #[instrument(skip(self), fields(task = %self.stage.name()))]
    pub async fn run_once(&self) -> Report {
        let report = match self.config.load().await {
            Err(e) => {
                error!(error = %e, "Configuration rejected");
                Report::error(format!("configuration rejected: {}", e))
            }
            Ok(config) => match self.stage.run_cycle(&config).await {
                Ok(handled) => {
                    if handled > 0 {
                        info!(handled, "Cycle complete");
                    } else {
                        debug!("Cycle complete, nothing to do");
                    }
                    Report::ok()
                }
                Err(e) => {
                    error!(error = %e, "Cycle failed");
                    Report::error(e.to_string())
                }
            },
        };

        if let Err(e) = report.write_to(&self.report_path).await {
            warn!(
                path = %self.report_path.display(),
                error = %e,
                "Failed to write report"
            );
        }

        report
    }

    /// Delay before the next cycle, read from the current configuration
    pub async fn next_delay(&self) -> Duration {
        match self.config.load().await {
            Ok(config) => self.stage.period(&config),
            Err(e) => {
                warn!(
                    task = %self.stage.name(),
                    error = %e,
                    fallback = ?self.fallback_period,
                    "Using fallback period"
                );
                self.fallback_period
            }
        }
    }

    /// Start the cycle loop on the runtime
    pub fn spawn(self) -> TaskHandle {
        let (state_tx, state_rx) = watch::channel(TaskState::Idle);
        let (cancel_tx, mut cancel_rx) = watch::channel(false);
        let cycles = Arc::new(AtomicU64::new(0));

        let id = self.id;
        let name = self.stage.name().to_string();
        let counter = Arc::clone(&cycles);

        let join = tokio::spawn(async move {
            info!(task = %self.stage.name(), id = %self.id, "Task started");
            loop {
                state_tx.send_replace(TaskState::Running);
                let report = self.run_once().await;
                counter.fetch_add(1, Ordering::SeqCst);
                state_tx.send_replace(if report.is_ok() {
                    TaskState::ReportedOk
                } else {
                    TaskState::ReportedError
                });

                let delay = self.next_delay().await;
                state_tx.send_replace(TaskState::Scheduled);

                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = cancelled(&mut cancel_rx) => break,
                }
                if *cancel_rx.borrow() {
                    break;
                }
                state_tx.send_replace(TaskState::Idle);
            }
            state_tx.send_replace(TaskState::Stopped);
            info!(task = %self.stage.name(), "Task stopped");
        });

        TaskHandle {
            id,
            name,
            state: state_rx,
            cancel: cancel_tx,
            cycles,
            join,
        }
    }
}

/// Resolves once cancellation is requested
///
/// A dropped handle detaches the task instead of stopping it.
async fn cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Control surface of a spawned task
#[derive(Debug)]
pub struct TaskHandle {
    id: TaskId,
    name: String,
    state: watch::Receiver<TaskState>,
    cancel: watch::Sender<bool>,
    cycles: Arc<AtomicU64>,
    join: JoinHandle<()>,
}

impl TaskHandle {
    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> TaskState {
        *self.state.borrow()
    }

    /// Completed cycles so far
    pub fn cycles(&self) -> u64 {
        self.cycles.load(Ordering::SeqCst)
    }

    /// Watch state transitions
    pub fn subscribe(&self) -> watch::Receiver<TaskState> {
        self.state.clone()
    }

    /// Stop at the next schedule point; a running cycle still finishes
    pub fn cancel(&self) {
        self.cancel.send_replace(true);
    }

    pub async fn join(self) -> Result<(), JoinError> {
        self.join.await
    }

    /// Cancel and wait for the loop to exit
    pub async fn stop(self) -> Result<(), JoinError> {
        self.cancel();
        self.join().await
    }
}

/// Type-erased view of a [`PeriodicTask`], so tasks of different stages
/// can be held together
#[async_trait]
pub trait Schedulable: Send + Sync {
    fn name(&self) -> &str;

    async fn run_once(&self) -> Report;

    fn spawn(self: Box<Self>) -> TaskHandle;
}

#[async_trait]
impl<S: Stage> Schedulable for PeriodicTask<S> {
    fn name(&self) -> &str {
        self.stage.name()
    }

    async fn run_once(&self) -> Report {
        PeriodicTask::run_once(self).await
    }

    fn spawn(self: Box<Self>) -> TaskHandle {
        PeriodicTask::spawn(*self)
    }
}
