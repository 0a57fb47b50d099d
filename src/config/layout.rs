//! On-disk layout under the troubleshoot home directory.
//!
//! ```text
//! <home>/
//!   mailboxes/   request, response and record mailboxes (+ .lock sidecars)
//!   data/        datasets, feature store, solved-problem database, accuracy
//!   config/      <stage>.yaml, re-read every cycle
//!   schemas/     <name>.schema.json for mailboxes and stage configs
//!   reports/     <task>.json, overwritten after every cycle
//! ```

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use crate::core::mailbox::{Mailbox, MailboxError};
use crate::core::schema::{SchemaError, SchemaGate};
use crate::domain::{
    IngestCandidate, Record, SimilarProblemsRequest, SimilarProblemsResponse, SolutionRequest,
    SolutionResponse, SolvedRecord, SolvedReport,
};

/// Every mailbox the pipeline exchanges data through
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MailboxName {
    SimilarProblemRequests,
    SimilarProblemResponses,
    SolutionRequests,
    SolutionResponses,
    NewRecords,
    PerformanceReports,
    IngestionRecords,
}

impl MailboxName {
    pub const ALL: [MailboxName; 7] = [
        Self::SimilarProblemRequests,
        Self::SimilarProblemResponses,
        Self::SolutionRequests,
        Self::SolutionResponses,
        Self::NewRecords,
        Self::PerformanceReports,
        Self::IngestionRecords,
    ];

    /// File stem shared by the mailbox and its schema
    pub fn stem(&self) -> &'static str {
        match self {
            Self::SimilarProblemRequests => "similar_problem_requests",
            Self::SimilarProblemResponses => "similar_problem_responses",
            Self::SolutionRequests => "solution_requests",
            Self::SolutionResponses => "solution_responses",
            Self::NewRecords => "new_records",
            Self::PerformanceReports => "performance_reports",
            Self::IngestionRecords => "ingestion_records",
        }
    }
}

impl fmt::Display for MailboxName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.stem())
    }
}

impl FromStr for MailboxName {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|name| name.stem() == s)
            .ok_or_else(|| {
                let known: Vec<&str> = Self::ALL.iter().map(|n| n.stem()).collect();
                format!("unknown mailbox '{}' (expected one of: {})", s, known.join(", "))
            })
    }
}

/// Paths of everything the pipeline reads and writes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Layout {
    home: PathBuf,
}

impl Layout {
    pub fn new(home: impl Into<PathBuf>) -> Self {
        Self { home: home.into() }
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn mailboxes_dir(&self) -> PathBuf {
        self.home.join("mailboxes")
    }

    pub fn data_dir(&self) -> PathBuf {
        self.home.join("data")
    }

    pub fn config_dir(&self) -> PathBuf {
        self.home.join("config")
    }

    pub fn schemas_dir(&self) -> PathBuf {
        self.home.join("schemas")
    }

    pub fn reports_dir(&self) -> PathBuf {
        self.home.join("reports")
    }

    pub fn mailbox(&self, name: MailboxName) -> PathBuf {
        self.mailboxes_dir().join(format!("{}.json", name.stem()))
    }

    pub fn schema(&self, stem: &str) -> PathBuf {
        self.schemas_dir().join(format!("{}.schema.json", stem))
    }

    pub fn stage_config(&self, stage: &str) -> PathBuf {
        self.config_dir().join(format!("{}.yaml", stage))
    }

    pub fn report(&self, task: &str) -> PathBuf {
        self.reports_dir().join(format!("{}.json", task))
    }

    pub fn problem_mapping(&self) -> PathBuf {
        self.data_dir().join("problem_mapping.json")
    }

    pub fn training_set(&self) -> PathBuf {
        self.data_dir().join("training_set.csv")
    }

    pub fn validation_set(&self) -> PathBuf {
        self.data_dir().join("validation_set.csv")
    }

    pub fn test_set(&self) -> PathBuf {
        self.data_dir().join("test_set.csv")
    }

    pub fn feature_vectors(&self) -> PathBuf {
        self.data_dir().join("feature_vectors.json")
    }

    pub fn similarity_model(&self) -> PathBuf {
        self.data_dir().join("similarity_model.json")
    }

    pub fn store_db(&self) -> PathBuf {
        self.data_dir().join("solved_problems.db")
    }

    pub fn accuracy(&self) -> PathBuf {
        self.data_dir().join("accuracy.json")
    }

    pub fn accuracy_state(&self) -> PathBuf {
        self.data_dir().join("accuracy_state.json")
    }

    /// Open a mailbox, attaching its schema file when one exists
    pub fn open<R: Record>(&self, name: MailboxName) -> Result<Mailbox<R>, SchemaError> {
        let mailbox = Mailbox::new(self.mailbox(name));
        match SchemaGate::load_optional(&self.schema(name.stem()))? {
            Some(gate) => Ok(mailbox.with_schema(Arc::new(gate))),
            None => Ok(mailbox),
        }
    }
}

/// Most responses a response mailbox keeps
///
/// Responses are removed by the requester that claims them. One whose
/// requester went away is evicted once this many newer responses arrive.
pub const RESPONSE_BACKLOG: usize = 1024;

/// The pipeline's mailboxes, typed
///
/// Opened once per process so every stage and producer shares the same
/// schema gates.
#[derive(Debug, Clone)]
pub struct Mailboxes {
    pub similar_problem_requests: Mailbox<SimilarProblemsRequest>,
    pub similar_problem_responses: Mailbox<SimilarProblemsResponse>,
    pub solution_requests: Mailbox<SolutionRequest>,
    pub solution_responses: Mailbox<SolutionResponse>,
    pub new_records: Mailbox<SolvedRecord>,
    pub performance_reports: Mailbox<SolvedReport>,
    pub ingestion_records: Mailbox<IngestCandidate>,
}

impl Mailboxes {
    pub fn open(layout: &Layout) -> Result<Self, SchemaError> {
        Ok(Self {
            similar_problem_requests: layout.open(MailboxName::SimilarProblemRequests)?,
            similar_problem_responses: layout
                .open(MailboxName::SimilarProblemResponses)?
                .with_capacity(RESPONSE_BACKLOG),
            solution_requests: layout.open(MailboxName::SolutionRequests)?,
            solution_responses: layout
                .open(MailboxName::SolutionResponses)?
                .with_capacity(RESPONSE_BACKLOG),
            new_records: layout.open(MailboxName::NewRecords)?,
            performance_reports: layout.open(MailboxName::PerformanceReports)?,
            ingestion_records: layout.open(MailboxName::IngestionRecords)?,
        })
    }

    /// Create any missing mailbox and validate the existing ones
    pub async fn ensure_all(&self) -> Result<(), MailboxError> {
        self.similar_problem_requests.ensure().await?;
        self.similar_problem_responses.ensure().await?;
        self.solution_requests.ensure().await?;
        self.solution_responses.ensure().await?;
        self.new_records.ensure().await?;
        self.performance_reports.ensure().await?;
        self.ingestion_records.ensure().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_paths_under_home() {
        let layout = Layout::new("/srv/ts");

        assert_eq!(
            layout.mailbox(MailboxName::NewRecords),
            PathBuf::from("/srv/ts/mailboxes/new_records.json")
        );
        assert_eq!(
            layout.stage_config("repository"),
            PathBuf::from("/srv/ts/config/repository.yaml")
        );
        assert_eq!(
            layout.schema("repository"),
            PathBuf::from("/srv/ts/schemas/repository.schema.json")
        );
        assert_eq!(
            layout.report("troubleshooting"),
            PathBuf::from("/srv/ts/reports/troubleshooting.json")
        );
    }

    #[test]
    fn test_mailbox_name_parsing() {
        assert_eq!(
            "solution_requests".parse::<MailboxName>().unwrap(),
            MailboxName::SolutionRequests
        );
        assert!("nope".parse::<MailboxName>().is_err());
    }

    #[tokio::test]
    async fn test_ensure_all_creates_files() {
        let dir = TempDir::new().unwrap();
        let layout = Layout::new(dir.path());
        let mailboxes = Mailboxes::open(&layout).unwrap();

        mailboxes.ensure_all().await.unwrap();

        for name in MailboxName::ALL {
            assert!(layout.mailbox(name).exists(), "{} missing", name);
        }
    }
}
