//! Request/response correlation over a pair of mailboxes.
//!
//! The producer appends a [`Request`] to the outbound mailbox and then polls
//! the inbound mailbox for a [`Response`] carrying the same correlation id.
//! Several correlations may be in flight against one inbound mailbox; each
//! looks only for its own id.
//!
//! A correlation that gives up withdraws its request. If a consumer already
//! took the request, the id is remembered as a stray and a claiming
//! correlator removes the late response on a later poll.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rand::Rng;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info, instrument, warn};

use super::mailbox::{Mailbox, MailboxError};
use super::policy::PollPolicy;
use crate::domain::{CorrelationId, Payload, Request, Response, Status};

/// Why a correlation produced no payload
#[derive(Debug, Error)]
pub enum CorrelationError {
    #[error("request {id} could not be submitted: {source}")]
    Submit {
        id: CorrelationId,
        #[source]
        source: MailboxError,
    },

    #[error("request {id} failed remotely: {reason}")]
    Remote { id: CorrelationId, reason: String },

    #[error("no response to request {id} after {attempts} polls")]
    Timeout { id: CorrelationId, attempts: u32 },
}

impl CorrelationError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, Self::Remote { .. })
    }
}

/// Hands out correlation ids for one producer
///
/// Producers share response mailboxes, so each sequence starts at a random
/// 63-bit offset; two sequences overlap only with negligible probability.
#[derive(Debug)]
pub struct CorrelationIds {
    next: AtomicU64,
}

impl CorrelationIds {
    pub fn new() -> Self {
        Self::starting_at(rand::thread_rng().gen::<u64>() >> 1)
    }

    pub fn starting_at(first: u64) -> Self {
        Self {
            next: AtomicU64::new(first),
        }
    }

    pub fn next_id(&self) -> CorrelationId {
        CorrelationId(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

impl Default for CorrelationIds {
    fn default() -> Self {
        Self::new()
    }
}

/// Producer side of a request/response mailbox pair
#[derive(Debug, Clone)]
pub struct Correlator<P, Q> {
    outbound: Mailbox<Request<P>>,
    inbound: Mailbox<Response<Q>>,
    policy: PollPolicy,
    claim: bool,
    strays: Arc<Mutex<HashSet<CorrelationId>>>,
}

impl<P: Payload, Q: Payload> Correlator<P, Q> {
    pub fn new(
        outbound: Mailbox<Request<P>>,
        inbound: Mailbox<Response<Q>>,
        policy: PollPolicy,
    ) -> Self {
        Self {
            outbound,
            inbound,
            policy,
            claim: false,
            strays: Arc::default(),
        }
    }

    /// Remove a matched response from the inbound mailbox
    pub fn claiming(mut self) -> Self {
        self.claim = true;
        self
    }

    pub fn policy(&self) -> &PollPolicy {
        &self.policy
    }

    /// Submit `payload` and wait for the matching response
    #[instrument(skip(self, payload), fields(outbound = %self.outbound.path().display()))]
    pub async fn request(&self, id: CorrelationId, payload: P) -> Result<Q, CorrelationError> {
        self.submit(id, payload).await?;
        self.await_response(id).await
    }

    /// Append the request without waiting
    pub async fn submit(&self, id: CorrelationId, payload: P) -> Result<(), CorrelationError> {
        self.outbound
            .append(Request::new(id, payload))
            .await
            .map_err(|source| CorrelationError::Submit { id, source })?;

        debug!(request_id = %id, "Submitted request");
        Ok(())
    }

    /// Poll until the response for `id` shows up or the budget runs out
    pub async fn await_response(&self, id: CorrelationId) -> Result<Q, CorrelationError> {
        let mut attempt = 0;
        loop {
            attempt += 1;

            if let Some(response) = self.poll(id).await? {
                debug!(request_id = %id, attempt, "Response matched");
                return self.resolve(id, response).await;
            }

            if !self.policy.should_poll_again(attempt) {
                warn!(request_id = %id, attempts = attempt, "Gave up waiting for response");
                self.abandon(id).await;
                return Err(CorrelationError::Timeout {
                    id,
                    attempts: attempt,
                });
            }

            tokio::time::sleep(self.policy.delay_after(attempt)).await;
        }
    }

    /// Stop waiting for `id`
    ///
    /// Withdraws the request if no consumer has taken it yet. When claiming,
    /// a response that already arrived is removed; otherwise the id is kept
    /// as a stray so its late response is removed on a later poll.
    pub async fn abandon(&self, id: CorrelationId) {
        let withdrawn = match self
            .outbound
            .remove_where(move |r: &Request<P>| r.correlation_id == id)
            .await
        {
            Ok(removed) => !removed.is_empty(),
            Err(e) => {
                warn!(request_id = %id, error = %e, "Failed to withdraw request");
                false
            }
        };

        if withdrawn {
            debug!(request_id = %id, "Withdrew unanswered request");
            return;
        }
        if !self.claim {
            return;
        }

        match self
            .inbound
            .remove_where(move |r: &Response<Q>| r.correlation_id == id)
            .await
        {
            Ok(removed) if !removed.is_empty() => {
                debug!(request_id = %id, "Discarded response to abandoned request");
            }
            Ok(_) => {
                self.strays.lock().await.insert(id);
            }
            Err(e) => {
                warn!(request_id = %id, error = %e, "Failed to discard response");
                self.strays.lock().await.insert(id);
            }
        }
    }

    /// Abandoned ids whose response has not been removed yet
    pub async fn strays(&self) -> usize {
        self.strays.lock().await.len()
    }

    /// One scan of the inbound mailbox
    ///
    /// An unreadable or malformed mailbox will not heal by waiting, so it
    /// ends the correlation as a remote failure rather than a timeout.
    async fn poll(&self, id: CorrelationId) -> Result<Option<Response<Q>>, CorrelationError> {
        let responses = self
            .inbound
            .peek()
            .await
            .map_err(|e| CorrelationError::Remote {
                id,
                reason: e.to_string(),
            })?;

        if self.claim {
            self.sweep_strays(&responses).await;
        }

        Ok(responses.into_iter().find(|r| r.correlation_id == id))
    }

    /// Remove late responses to abandoned requests
    async fn sweep_strays(&self, responses: &[Response<Q>]) {
        let mut strays = self.strays.lock().await;
        if strays.is_empty() {
            return;
        }

        let arrived: HashSet<CorrelationId> = responses
            .iter()
            .map(|r| r.correlation_id)
            .filter(|id| strays.contains(id))
            .collect();
        if arrived.is_empty() {
            return;
        }

        let targets = arrived.clone();
        match self
            .inbound
            .remove_where(move |r: &Response<Q>| targets.contains(&r.correlation_id))
            .await
        {
            Ok(removed) => {
                strays.retain(|id| !arrived.contains(id));
                info!(count = removed.len(), "Removed late responses to abandoned requests");
            }
            Err(e) => warn!(error = %e, "Failed to remove late responses"),
        }
    }

    async fn resolve(&self, id: CorrelationId, response: Response<Q>) -> Result<Q, CorrelationError> {
        if self.claim {
            if let Err(e) = self
                .inbound
                .remove_where(move |r: &Response<Q>| r.correlation_id == id)
                .await
            {
                warn!(request_id = %id, error = %e, "Failed to claim response");
            }
        }

        match response.status {
            Status::Ok => response.payload.ok_or_else(|| CorrelationError::Remote {
                id,
                reason: "OK response without payload".to_string(),
            }),
            Status::Error => Err(CorrelationError::Remote {
                id,
                reason: "counterpart answered ERROR".to_string(),
            }),
        }
    }
}
