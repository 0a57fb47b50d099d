//! Consume-and-reset: the acknowledgement substitute for mailboxes.
//!
//! A consumer reads and validates the inbox backlog, hands the snapshot to
//! its processor, appends the results to the outbox, and only then removes
//! exactly the consumed entries from the inbox. A failure at any earlier step
//! leaves the inbox untouched, so the same entries are offered again next
//! cycle. Entries appended while processing ran survive. The whole cycle
//! runs under the inbox's consumer claim; a concurrent second consumer is
//! refused rather than allowed to reset entries it never saw.

use std::future::Future;

use thiserror::Error;
use tracing::debug;

use super::mailbox::{Mailbox, MailboxError};
use crate::domain::Record;

/// Which step of a consume cycle failed
#[derive(Debug, Error)]
pub enum GateError<E> {
    #[error("inbox unavailable: {0}")]
    Inbox(#[source] MailboxError),

    #[error("processing failed: {0}")]
    Process(#[source] E),

    #[error("results not delivered: {0}")]
    Outbox(#[source] MailboxError),

    #[error("consumed entries not cleared: {0}")]
    Reset(#[source] MailboxError),
}

/// A processed batch
#[derive(Debug, Clone, PartialEq)]
pub struct Consumed<T> {
    /// Number of inbox entries removed
    pub count: usize,
    pub output: T,
}

/// Process the inbox backlog, then remove it
///
/// Returns `None` when the inbox was empty and nothing ran.
pub async fn consume<R, T, E, F, Fut>(
    inbox: &Mailbox<R>,
    process: F,
) -> Result<Option<Consumed<T>>, GateError<E>>
where
    R: Record,
    F: FnOnce(Vec<R>) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let _claim = inbox.claim_consumer().await.map_err(GateError::Inbox)?;
    let batch = inbox.peek().await.map_err(GateError::Inbox)?;
    if batch.is_empty() {
        return Ok(None);
    }

    let count = batch.len();
    let output = process(batch.clone()).await.map_err(GateError::Process)?;
    inbox.remove_consumed(batch).await.map_err(GateError::Reset)?;

    debug!(inbox = %inbox.path().display(), count, "Consumed batch");
    Ok(Some(Consumed { count, output }))
}

/// Process the inbox backlog into `outbox`, then remove it
///
/// Returns the number of inbox entries consumed.
pub async fn consume_into<R, O, E, F, Fut>(
    inbox: &Mailbox<R>,
    outbox: &Mailbox<O>,
    process: F,
) -> Result<usize, GateError<E>>
where
    R: Record,
    O: Record,
    F: FnOnce(Vec<R>) -> Fut,
    Fut: Future<Output = Result<Vec<O>, E>>,
{
    let _claim = inbox.claim_consumer().await.map_err(GateError::Inbox)?;
    let batch = inbox.peek().await.map_err(GateError::Inbox)?;
    if batch.is_empty() {
        return Ok(0);
    }

    let count = batch.len();
    let results = process(batch.clone()).await.map_err(GateError::Process)?;
    let produced = results.len();
    outbox.append_all(results).await.map_err(GateError::Outbox)?;
    inbox.remove_consumed(batch).await.map_err(GateError::Reset)?;

    debug!(
        inbox = %inbox.path().display(),
        outbox = %outbox.path().display(),
        count,
        produced,
        "Consumed batch"
    );
    Ok(count)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{SolvedRecord, SolvedReport};
    use tempfile::TempDir;

    fn solved(problem: &str) -> SolvedRecord {
        SolvedRecord::selected(problem, "restart", 1, 2)
    }

    #[tokio::test]
    async fn test_failed_processing_keeps_inbox() {
        let dir = TempDir::new().unwrap();
        let inbox: Mailbox<SolvedRecord> = Mailbox::new(dir.path().join("in.json"));
        let outbox: Mailbox<SolvedReport> = Mailbox::new(dir.path().join("out.json"));
        inbox.append(solved("a")).await.unwrap();

        let result = consume_into(&inbox, &outbox, |_batch| async {
            Err::<Vec<SolvedReport>, _>("collaborator unavailable")
        })
        .await;

        assert!(matches!(result, Err(GateError::Process(_))));
        assert_eq!(inbox.peek().await.unwrap().len(), 1);
        assert!(outbox.peek().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_appends_during_processing_survive() {
        let dir = TempDir::new().unwrap();
        let inbox: Mailbox<SolvedRecord> = Mailbox::new(dir.path().join("in.json"));
        let outbox: Mailbox<SolvedReport> = Mailbox::new(dir.path().join("out.json"));
        inbox.append(solved("a")).await.unwrap();

        let producer = inbox.clone();
        let consumed = consume_into(&inbox, &outbox, |batch| async move {
            producer.append(solved("late")).await.map_err(|e| e.to_string())?;
            Ok::<_, String>(batch.iter().map(SolvedRecord::to_report).collect())
        })
        .await
        .unwrap();

        assert_eq!(consumed, 1);
        assert_eq!(outbox.peek().await.unwrap().len(), 1);
        assert_eq!(inbox.peek().await.unwrap(), vec![solved("late")]);
    }

    #[tokio::test]
    async fn test_second_consumer_cannot_drop_unseen_entries() {
        let dir = TempDir::new().unwrap();
        let inbox: Mailbox<SolvedRecord> = Mailbox::new(dir.path().join("in.json"));
        let outbox: Mailbox<SolvedReport> = Mailbox::new(dir.path().join("out.json"));
        inbox.append(solved("a")).await.unwrap();

        let rival = inbox.clone();
        consume_into(&inbox, &outbox, |batch| async move {
            let refused = rival.drain_and_reset().await.unwrap_err();
            assert!(refused.is_consumer_busy());
            rival.append(solved("late")).await.map_err(|e| e.to_string())?;
            Ok::<_, String>(batch.iter().map(SolvedRecord::to_report).collect())
        })
        .await
        .unwrap();

        assert_eq!(inbox.peek().await.unwrap(), vec![solved("late")]);
        assert_eq!(outbox.peek().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_busy_inbox_is_not_processed() {
        let dir = TempDir::new().unwrap();
        let inbox: Mailbox<SolvedRecord> = Mailbox::new(dir.path().join("in.json"));
        inbox.append(solved("a")).await.unwrap();
        let _other = inbox.claim_consumer().await.unwrap();

        let result = consume(&inbox, |_batch| async { Ok::<(), String>(()) }).await;

        assert!(matches!(result, Err(GateError::Inbox(ref e)) if e.is_consumer_busy()));
        assert_eq!(inbox.peek().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_empty_inbox_skips_processing() {
        let dir = TempDir::new().unwrap();
        let inbox: Mailbox<SolvedRecord> = Mailbox::new(dir.path().join("in.json"));

        let mut ran = false;
        let result = consume(&inbox, |_batch| {
            ran = true;
            async { Ok::<(), String>(()) }
        })
        .await
        .unwrap();

        assert!(!ran);
        assert!(result.is_none());
    }
}
