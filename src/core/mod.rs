//! Core coordination machinery.
//!
//! This module contains:
//! - Mailbox: locked, schema-checked JSON collections on disk
//! - Gate: consume-and-reset processing of a mailbox
//! - Correlator: request/response matching with bounded polling
//! - PeriodicTask: self-rescheduling stage execution
//! - Orchestrator: wiring of every task, mailbox and collaborator

pub mod correlator;
pub mod durable;
pub mod gate;
pub mod mailbox;
pub mod orchestrator;
pub mod periodic;
pub mod policy;
pub mod schema;

// Re-export commonly used types
pub use correlator::{CorrelationError, CorrelationIds, Correlator};
pub use gate::{consume, consume_into, Consumed, GateError};
pub use mailbox::{ConsumerClaim, Mailbox, MailboxError};
pub use orchestrator::Orchestrator;
pub use periodic::{PeriodicTask, Schedulable, Stage, StageError, TaskHandle, TaskId, TaskState};
pub use policy::{Backoff, PollPolicy};
pub use schema::{SchemaError, SchemaGate};
