//! troubleshoot - File-mailbox coordination for smart troubleshooting
//!
//! A set of independent stages cooperates through JSON mailboxes on disk
//! to suggest solutions for operator-described problems and to learn from
//! which suggestion solved them.
//!
//! # Architecture
//!
//! The system is built around mailboxes and periodic tasks:
//! - Every mailbox is a locked JSON collection with a single consumer
//! - Consumers process a snapshot and remove only what they processed
//! - Producers correlate responses to their requests by id, with bounded polling
//! - Each stage runs as a self-rescheduling task that writes a report per cycle
//!
//! # Modules
//!
//! - `adapters`: Embedder, predictor and solved-problem store collaborators
//! - `core`: Mailbox, Gate, Correlator, PeriodicTask, Orchestrator
//! - `stages`: Repository, segregation, preparation, troubleshooting, monitoring, intake
//! - `domain`: Records and reports
//! - `config`: Global settings, on-disk layout and stage configs
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Write default configs, schemas and mailboxes
//! troubleshoot init
//!
//! # Start every stage
//! troubleshoot run
//!
//! # Ask for solutions (while `run` is active elsewhere)
//! troubleshoot ask "printer shows paper jam with empty tray"
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod stages;

// Re-export main types at crate root for convenience
pub use core::{Correlator, Mailbox, Orchestrator, PeriodicTask, PollPolicy};
pub use domain::{Record, Report, Request, Response, Status};
pub use stages::{IntakeOutcome, IntakeSession, PerformanceMonitor};
