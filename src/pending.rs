//! In-flight commands awaiting a response or a timeout.
//!
//! Each entry owns the responder of one `execute` call and a deadline in a
//! [`DelayQueue`]. Whichever comes first, the response or the deadline,
//! removes the entry and settles the responder; the other one then finds
//! nothing and is ignored.

use std::collections::HashMap;
use std::future::poll_fn;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio_util::time::{delay_queue, DelayQueue};
use tracing::{debug, warn};

use crate::command::CommandResponse;
use crate::error::AmiError;

pub type Outcome = Result<CommandResponse, AmiError>;

/// Longest deadline accepted; the delay queue cannot hold deadlines much past two years.
pub const MAX_TIMEOUT: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Debug)]
struct PendingRequest {
    responder: oneshot::Sender<Outcome>,
    deadline: delay_queue::Key,
}

#[derive(Debug, Default)]
pub struct PendingTable {
    requests: HashMap<u64, PendingRequest>,
    deadlines: DelayQueue<u64>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Tracks `token` until it is settled or `timeout` elapses.
    ///
    /// A token still pending is replaced; its previous caller is rejected as timed out.
    /// Timeouts above [`MAX_TIMEOUT`] are clamped to it.
    pub fn register(&mut self, token: u64, responder: oneshot::Sender<Outcome>, timeout: Duration) {
        let timeout = if timeout > MAX_TIMEOUT {
            warn!(
                "Timeout {:?} for command {} exceeds the maximum, using {:?}",
                timeout, token, MAX_TIMEOUT
            );
            MAX_TIMEOUT
        } else {
            timeout
        };

        let deadline = self.deadlines.insert(token, timeout);
        let previous = self.requests.insert(
            token,
            PendingRequest {
                responder,
                deadline,
            },
        );

        if let Some(previous) = previous {
            warn!("Token {} registered twice, dropping the older request", token);
            self.deadlines.remove(&previous.deadline);
            let _ = previous.responder.send(Err(AmiError::Timeout { token }));
        }

        debug!("Registered pending command {} ({:?} timeout)", token, timeout);
    }

    /// Settles `token` with `outcome`.
    ///
    /// Returns false if the token is unknown or already settled; the outcome
    /// is dropped in that case.
    pub fn settle(&mut self, token: u64, outcome: Outcome) -> bool {
        let Some(request) = self.requests.remove(&token) else {
            return false;
        };

        self.deadlines.remove(&request.deadline);
        if request.responder.send(outcome).is_err() {
            debug!("Caller of command {} is no longer waiting", token);
        }
        true
    }

    /// Waits for the next deadline, rejects its request with a timeout and
    /// returns the token.
    ///
    /// Resolves to `None` immediately when nothing is pending.
    pub async fn next_expired(&mut self) -> Option<u64> {
        let expired = poll_fn(|cx| self.deadlines.poll_expired(cx)).await?;
        let token = expired.into_inner();

        if let Some(request) = self.requests.remove(&token) {
            warn!("Command {} timed out", token);
            let _ = request.responder.send(Err(AmiError::Timeout { token }));
        }
        Some(token)
    }

    pub fn len(&self) -> usize {
        self.requests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.requests.is_empty()
    }
}
