//! Typed records carried by mailboxes.
//!
//! Every mailbox document is a JSON object holding a single array under a
//! collection key (`requests`, `responses`, `records` or `reports`). The
//! record type fixes that key, and [`Record::check`] carries the per-entry
//! rules a JSON shape alone cannot express.

use std::fmt;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// An entry that can live in a mailbox
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    /// Key of the array holding the entries
    const COLLECTION: &'static str;

    /// Semantic rules beyond the shape. Returns a human-readable reason.
    fn check(&self) -> Result<(), String> {
        Ok(())
    }
}

/// The body of a request or response, flattened next to `requestId`
pub trait Payload: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    fn check(&self) -> Result<(), String> {
        Ok(())
    }
}

/// Caller-assigned identifier pairing a response with its request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CorrelationId(pub u64);

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for CorrelationId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Outcome flag shared by responses and task reports
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "ERROR")]
    Error,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ok => write!(f, "OK"),
            Self::Error => write!(f, "ERROR"),
        }
    }
}

/// A unit of work addressed to another stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request<P> {
    #[serde(rename = "requestId")]
    pub correlation_id: CorrelationId,

    #[serde(flatten)]
    pub payload: P,
}

impl<P> Request<P> {
    pub fn new(correlation_id: impl Into<CorrelationId>, payload: P) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            payload,
        }
    }
}

impl<P: Payload> Record for Request<P> {
    const COLLECTION: &'static str = "requests";

    fn check(&self) -> Result<(), String> {
        self.payload.check()
    }
}

/// The answer to a [`Request`], matched by `requestId`
///
/// An `OK` response must carry its payload; an `ERROR` response carries none.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response<P> {
    #[serde(rename = "requestId")]
    pub correlation_id: CorrelationId,

    pub status: Status,

    #[serde(flatten)]
    pub payload: Option<P>,
}

impl<P> Response<P> {
    pub fn ok(correlation_id: CorrelationId, payload: P) -> Self {
        Self {
            correlation_id,
            status: Status::Ok,
            payload: Some(payload),
        }
    }

    pub fn error(correlation_id: CorrelationId) -> Self {
        Self {
            correlation_id,
            status: Status::Error,
            payload: None,
        }
    }
}

impl<P: Payload> Record for Response<P> {
    const COLLECTION: &'static str = "responses";

    fn check(&self) -> Result<(), String> {
        match (self.status, &self.payload) {
            (Status::Ok, Some(payload)) => payload.check(),
            (Status::Ok, None) => Err(format!(
                "response {} has status OK but no payload",
                self.correlation_id
            )),
            (Status::Error, _) => Ok(()),
        }
    }
}

/// Free-text description of a problem to troubleshoot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemDescription {
    #[serde(rename = "problemDescription")]
    pub problem_description: String,
}

impl Payload for ProblemDescription {
    fn check(&self) -> Result<(), String> {
        if self.problem_description.trim().is_empty() {
            return Err("problemDescription is empty".to_string());
        }
        Ok(())
    }
}

/// Ids of known problems, best match first
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SimilarProblems {
    #[serde(rename = "problemsIds")]
    pub problem_ids: Vec<String>,
}

impl Payload for SimilarProblems {}

/// Reference to a stored problem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProblemRef {
    #[serde(rename = "problemId")]
    pub problem_id: String,
}

impl Payload for ProblemRef {
    fn check(&self) -> Result<(), String> {
        if self.problem_id.is_empty() {
            return Err("problemId is empty".to_string());
        }
        Ok(())
    }
}

/// The solution text attached to a stored problem
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SolutionText {
    #[serde(rename = "solutionDescription")]
    pub solution_description: String,
}

impl Payload for SolutionText {}

pub type SimilarProblemsRequest = Request<ProblemDescription>;
pub type SimilarProblemsResponse = Response<SimilarProblems>;
pub type SolutionRequest = Request<ProblemRef>;
pub type SolutionResponse = Response<SolutionText>;

/// A solved problem offered to segregation and inference
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct IngestCandidate {
    pub id: String,
    pub description: String,
    pub solution_ref: String,
}

impl Record for IngestCandidate {
    const COLLECTION: &'static str = "records";

    fn check(&self) -> Result<(), String> {
        if self.id.is_empty() {
            return Err("candidate id is empty".to_string());
        }
        Ok(())
    }
}

/// How the operator solved a problem during an intake session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SolvedRecord {
    pub problem_description: String,
    pub solution_description: String,
    pub is_solution_manual: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub solution_index: Option<u32>,
    pub total_presented_solutions: u32,
}

impl SolvedRecord {
    /// The operator typed their own solution
    pub fn manual(problem: impl Into<String>, solution: impl Into<String>, presented: u32) -> Self {
        Self {
            problem_description: problem.into(),
            solution_description: solution.into(),
            is_solution_manual: true,
            solution_index: None,
            total_presented_solutions: presented,
        }
    }

    /// The operator picked the 1-based `index` among `presented` suggestions
    pub fn selected(
        problem: impl Into<String>,
        solution: impl Into<String>,
        index: u32,
        presented: u32,
    ) -> Self {
        Self {
            problem_description: problem.into(),
            solution_description: solution.into(),
            is_solution_manual: false,
            solution_index: Some(index),
            total_presented_solutions: presented,
        }
    }

    /// The performance record this outcome produces
    pub fn to_report(&self) -> SolvedReport {
        SolvedReport {
            is_manual: self.is_solution_manual,
            total_presented: self.total_presented_solutions,
            solution_index: match self.solution_index {
                Some(index) if !self.is_solution_manual => i64::from(index),
                _ => -1,
            },
        }
    }
}

impl Record for SolvedRecord {
    const COLLECTION: &'static str = "records";

    fn check(&self) -> Result<(), String> {
        if self.problem_description.trim().is_empty() {
            return Err("problemDescription is empty".to_string());
        }
        match (self.is_solution_manual, self.solution_index) {
            (true, None) => Ok(()),
            (true, Some(_)) => Err("manual solution must not carry solutionIndex".to_string()),
            (false, None) => Err("selected solution requires solutionIndex".to_string()),
            (false, Some(index)) if index >= 1 && index <= self.total_presented_solutions => Ok(()),
            (false, Some(index)) => Err(format!(
                "solutionIndex {} outside 1..={}",
                index, self.total_presented_solutions
            )),
        }
    }
}

/// One solved problem as seen by performance monitoring
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct SolvedReport {
    pub is_manual: bool,
    pub total_presented: u32,
    /// `-1` iff manual, otherwise 1-based
    pub solution_index: i64,
}

impl SolvedReport {
    /// Contribution to accuracy: 1.0 for the top suggestion, falling
    /// linearly with rank, 0 for a manual solution
    pub fn score(&self) -> f64 {
        if self.is_manual || self.total_presented == 0 {
            return 0.0;
        }
        let total = f64::from(self.total_presented);
        (total - self.solution_index as f64 + 1.0) / total
    }
}

impl Record for SolvedReport {
    const COLLECTION: &'static str = "reports";

    fn check(&self) -> Result<(), String> {
        if self.is_manual {
            if self.solution_index != -1 {
                return Err("manual report must have solutionIndex -1".to_string());
            }
            return Ok(());
        }
        if self.solution_index < 1 || self.solution_index > i64::from(self.total_presented) {
            return Err(format!(
                "solutionIndex {} outside 1..={}",
                self.solution_index, self.total_presented
            ));
        }
        Ok(())
    }
}
