//! Operator-facing intake.
//!
//! An [`IntakeSession`] asks inference for problems similar to the one the
//! operator described, fetches each one's solution from the repository and
//! records which suggestion (if any) solved the problem. State lives in the
//! session value; two sessions never see each other's problems.

use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::config::Mailboxes;
use crate::core::correlator::{CorrelationError, CorrelationIds, Correlator};
use crate::core::mailbox::{Mailbox, MailboxError};
use crate::core::policy::PollPolicy;
use crate::domain::{CorrelationId, ProblemDescription, ProblemRef, SimilarProblems, SolutionText, SolvedRecord};

#[derive(Debug, Error)]
pub enum IntakeError {
    #[error("no problem is being solved in this session")]
    NoActiveProblem,

    #[error("solution {index} does not exist, {presented} were presented")]
    IndexOutOfRange { index: u32, presented: u32 },

    #[error("manual solution is empty")]
    EmptySolution,

    #[error("failed to record solved problem: {0}")]
    Record(#[from] MailboxError),
}

/// A suggested solution, in the order inference ranked it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SuggestedSolution {
    pub problem_id: String,
    pub solution_description: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntakeOutcome {
    Solutions(Vec<SuggestedSolution>),
    /// Nothing could be suggested; the operator may still solve manually
    NoResult,
}

#[derive(Debug, Clone)]
struct ActiveProblem {
    description: String,
    presented: Vec<SuggestedSolution>,
}

impl ActiveProblem {
    fn presented_count(&self) -> u32 {
        u32::try_from(self.presented.len()).unwrap_or(u32::MAX)
    }
}

pub struct IntakeSession {
    similar: Correlator<ProblemDescription, SimilarProblems>,
    solutions: Correlator<ProblemRef, SolutionText>,
    new_records: Mailbox<SolvedRecord>,
    ids: CorrelationIds,
    active: Option<ActiveProblem>,
}

impl IntakeSession {
    pub fn new(mailboxes: &Mailboxes, policy: PollPolicy) -> Self {
        Self {
            similar: Correlator::new(
                mailboxes.similar_problem_requests.clone(),
                mailboxes.similar_problem_responses.clone(),
                policy.clone(),
            )
            .claiming(),
            solutions: Correlator::new(
                mailboxes.solution_requests.clone(),
                mailboxes.solution_responses.clone(),
                policy,
            )
            .claiming(),
            new_records: mailboxes.new_records.clone(),
            ids: CorrelationIds::new(),
            active: None,
        }
    }

    /// Problem currently being solved, if any
    pub fn active_description(&self) -> Option<&str> {
        self.active.as_ref().map(|a| a.description.as_str())
    }

    /// Suggest solutions for `description`
    ///
    /// Replaces any problem already in progress. A failed correlation at
    /// any step yields [`IntakeOutcome::NoResult`], never a partial list.
    #[instrument(skip(self))]
    pub async fn find_solutions(&mut self, description: &str) -> IntakeOutcome {
        let description = description.trim().to_string();
        self.active = None;
        if description.is_empty() {
            debug!("Empty problem description");
            return IntakeOutcome::NoResult;
        }

        let presented = match self.correlate(&description).await {
            Ok(presented) => presented,
            Err(e) => {
                warn!(error = %e, "No solutions available");
                Vec::new()
            }
        };

        let outcome = if presented.is_empty() {
            IntakeOutcome::NoResult
        } else {
            info!(count = presented.len(), "Solutions found");
            IntakeOutcome::Solutions(presented.clone())
        };

        self.active = Some(ActiveProblem {
            description,
            presented,
        });
        outcome
    }

    async fn correlate(&self, description: &str) -> Result<Vec<SuggestedSolution>, CorrelationError> {
        let similar = self
            .similar
            .request(
                self.ids.next_id(),
                ProblemDescription {
                    problem_description: description.to_string(),
                },
            )
            .await?;

        // Submit every solution request before waiting so the repository
        // can answer them in one cycle
        let mut pending = Vec::with_capacity(similar.problem_ids.len());
        for problem_id in similar.problem_ids {
            let id = self.ids.next_id();
            let submitted = self
                .solutions
                .submit(
                    id,
                    ProblemRef {
                        problem_id: problem_id.clone(),
                    },
                )
                .await;
            if let Err(e) = submitted {
                self.abandon_all(pending.into_iter().map(|(id, _)| id)).await;
                return Err(e);
            }
            pending.push((id, problem_id));
        }

        let mut presented = Vec::with_capacity(pending.len());
        let mut pending = pending.into_iter();
        while let Some((id, problem_id)) = pending.next() {
            match self.solutions.await_response(id).await {
                Ok(solution) => presented.push(SuggestedSolution {
                    problem_id,
                    solution_description: solution.solution_description,
                }),
                Err(e) => {
                    // The list is discarded, so nobody waits for the rest
                    self.abandon_all(pending.map(|(id, _)| id)).await;
                    return Err(e);
                }
            }
        }
        Ok(presented)
    }

    async fn abandon_all(&self, ids: impl Iterator<Item = CorrelationId>) {
        for id in ids {
            self.solutions.abandon(id).await;
        }
    }

    /// The operator picked the 1-based `index` among the presented solutions
    pub async fn select(&mut self, index: u32) -> Result<SolvedRecord, IntakeError> {
        let active = self.active.as_ref().ok_or(IntakeError::NoActiveProblem)?;
        let presented = active.presented_count();
        let chosen = index
            .checked_sub(1)
            .and_then(|i| active.presented.get(i as usize))
            .ok_or(IntakeError::IndexOutOfRange { index, presented })?;

        let record = SolvedRecord::selected(
            active.description.clone(),
            chosen.solution_description.clone(),
            index,
            presented,
        );
        self.finish(record).await
    }

    /// The operator solved the problem with their own `solution`
    pub async fn manual(&mut self, solution: &str) -> Result<SolvedRecord, IntakeError> {
        let active = self.active.as_ref().ok_or(IntakeError::NoActiveProblem)?;
        let solution = solution.trim();
        if solution.is_empty() {
            return Err(IntakeError::EmptySolution);
        }

        let record = SolvedRecord::manual(
            active.description.clone(),
            solution,
            active.presented_count(),
        );
        self.finish(record).await
    }

    /// Drop the problem in progress without recording anything
    pub fn reset(&mut self) {
        self.active = None;
    }

    async fn finish(&mut self, record: SolvedRecord) -> Result<SolvedRecord, IntakeError> {
        self.new_records.append(record.clone()).await?;
        info!(
            manual = record.is_solution_manual,
            index = ?record.solution_index,
            "Solved problem recorded"
        );
        self.reset();
        Ok(record)
    }
}
