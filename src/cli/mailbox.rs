//! Mailbox CLI subcommands.
//!
//! - `peek`: print a mailbox's records without consuming them
//! - `drain`: print and remove every record; refused while the owning task
//!   is mid-cycle

use anyhow::{Context, Result};
use clap::Subcommand;

use crate::config::{self, MailboxName, Mailboxes};
use crate::core::mailbox::Mailbox;
use crate::domain::Record;

#[derive(Subcommand, Debug)]
pub enum MailboxCommands {
    /// Print every record without consuming it
    Peek {
        /// Mailbox name (e.g. new_records)
        name: MailboxName,
    },

    /// Print and remove every record (refused while a consumer is active)
    Drain {
        /// Mailbox name (e.g. new_records)
        name: MailboxName,
    },

    /// List mailboxes and their record counts
    List,
}

impl MailboxCommands {
    pub async fn execute(self) -> Result<()> {
        let layout = config::layout()?;
        let mailboxes = Mailboxes::open(&layout).context("Failed to open mailboxes")?;

        match self {
            Self::Peek { name } => dump(&mailboxes, name, false).await,
            Self::Drain { name } => dump(&mailboxes, name, true).await,
            Self::List => {
                for name in MailboxName::ALL {
                    let count = count(&mailboxes, name).await;
                    match count {
                        Ok(count) => println!("{:<28} {}", name.stem(), count),
                        Err(e) => println!("{:<28} unreadable: {:#}", name.stem(), e),
                    }
                }
                Ok(())
            }
        }
    }
}

async fn dump(mailboxes: &Mailboxes, name: MailboxName, drain: bool) -> Result<()> {
    let records = match name {
        MailboxName::SimilarProblemRequests => take(&mailboxes.similar_problem_requests, drain).await,
        MailboxName::SimilarProblemResponses => take(&mailboxes.similar_problem_responses, drain).await,
        MailboxName::SolutionRequests => take(&mailboxes.solution_requests, drain).await,
        MailboxName::SolutionResponses => take(&mailboxes.solution_responses, drain).await,
        MailboxName::NewRecords => take(&mailboxes.new_records, drain).await,
        MailboxName::PerformanceReports => take(&mailboxes.performance_reports, drain).await,
        MailboxName::IngestionRecords => take(&mailboxes.ingestion_records, drain).await,
    }
    .with_context(|| format!("Failed to read mailbox {}", name))?;

    println!(
        "{}",
        serde_json::to_string_pretty(&records).context("Failed to render records")?
    );
    Ok(())
}

async fn take<R: Record>(mailbox: &Mailbox<R>, drain: bool) -> Result<Vec<serde_json::Value>> {
    let records = if drain {
        mailbox.drain_and_reset().await?
    } else {
        mailbox.peek().await?
    };

    records
        .iter()
        .map(|r| serde_json::to_value(r).map_err(Into::into))
        .collect()
}

async fn count(mailboxes: &Mailboxes, name: MailboxName) -> Result<usize> {
    let records = match name {
        MailboxName::SimilarProblemRequests => mailboxes.similar_problem_requests.peek().await?.len(),
        MailboxName::SimilarProblemResponses => mailboxes.similar_problem_responses.peek().await?.len(),
        MailboxName::SolutionRequests => mailboxes.solution_requests.peek().await?.len(),
        MailboxName::SolutionResponses => mailboxes.solution_responses.peek().await?.len(),
        MailboxName::NewRecords => mailboxes.new_records.peek().await?.len(),
        MailboxName::PerformanceReports => mailboxes.performance_reports.peek().await?.len(),
        MailboxName::IngestionRecords => mailboxes.ingestion_records.peek().await?.len(),
    };
    Ok(records)
}
