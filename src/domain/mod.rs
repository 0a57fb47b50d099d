//! Domain types for the troubleshooting pipeline.
//!
//! This module contains the core data structures:
//! - Records: typed mailbox entries (requests, responses, candidates, reports)
//! - Report: the outcome a periodic task writes after every cycle

pub mod records;
pub mod report;

pub use records::{
    CorrelationId, IngestCandidate, Payload, ProblemDescription, ProblemRef, Record, Request,
    Response, SimilarProblems, SimilarProblemsRequest, SimilarProblemsResponse, SolutionRequest,
    SolutionResponse, SolutionText, SolvedRecord, SolvedReport, Status,
};
pub use report::Report;
