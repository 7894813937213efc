//! Pending-request table with a typestate request lifecycle
//!
//! Every in-flight command lives here as a `PendingRequest<Waiting>` from the
//! moment it is registered until exactly one of three things happens:
//!
//! ```text
//!            ┌──► Resolved   (matching success/error response)
//! Waiting ───┼──► TimedOut   (deadline passed, removed by the waiter)
//!            └──► Cancelled  (connection lost or caller abort)
//! ```
//!
//! Each transition consumes the waiting entry and is only reachable after the
//! entry was removed from the table under the table lock, so a request can not
//! terminate twice. A response whose id is not in the table is discarded.

use crate::command::envelope::{CommandEnvelope, ResponseEnvelope};
use crate::error::{CancelReason, CommandError};
use statum::{machine, state};
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// What the waiter receives when its entry terminates from outside
#[derive(Debug)]
pub enum Termination {
    Resolved(ResponseEnvelope),
    Cancelled(CancelReason),
}

#[state]
#[derive(Debug, Clone)]
pub enum RequestState {
    Waiting,
    Resolved,
    TimedOut,
    Cancelled,
}

#[machine]
pub struct PendingRequest<S: RequestState> {
    envelope: CommandEnvelope,
    created_at: Instant,
    deadline: Instant,
    retry_count: u32,
    completion: Option<oneshot::Sender<Termination>>,
}

impl<S: RequestState> PendingRequest<S> {
    pub fn request_id(&self) -> &str {
        &self.envelope.request_id
    }

    pub fn envelope(&self) -> &CommandEnvelope {
        &self.envelope
    }

    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

impl PendingRequest<Waiting> {
    pub fn create(
        envelope: CommandEnvelope,
        deadline: Instant,
        retry_count: u32,
    ) -> (Self, oneshot::Receiver<Termination>) {
        let (tx, rx) = oneshot::channel();
        let request = Self::new(envelope, Instant::now(), deadline, retry_count, Some(tx));
        (request, rx)
    }

    fn resolve(mut self, response: ResponseEnvelope) -> PendingRequest<Resolved> {
        if let Some(tx) = self.completion.take() {
            if tx.send(Termination::Resolved(response)).is_err() {
                debug!("Waiter for {} already gone", self.envelope.request_id);
            }
        }
        self.transition()
    }

    fn time_out(mut self) -> PendingRequest<TimedOut> {
        self.completion = None;
        self.transition()
    }

    fn cancel(mut self, reason: CancelReason) -> PendingRequest<Cancelled> {
        if let Some(tx) = self.completion.take() {
            let _ = tx.send(Termination::Cancelled(reason));
        }
        self.transition()
    }
}

/// Result of offering a response to the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolveOutcome {
    /// Entry found, removed and its waiter notified
    Resolved,
    /// Entry found but the response was a `pending` ack; entry kept
    Interim,
    /// No such entry: late, duplicate or unsolicited response
    Discarded,
}

/// Snapshot of the table for status displays
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingStats {
    pub pending: usize,
    pub oldest_age: Option<Duration>,
}

/// In-flight commands keyed by request id
///
/// One mutex covers insert, match and remove so that publishing callers, the
/// connection's event loop and expiring waiters never interleave on an entry.
#[derive(Default)]
pub struct PendingTable {
    entries: Mutex<HashMap<String, PendingRequest<Waiting>>>,
}

impl PendingTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, PendingRequest<Waiting>>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers a waiting entry; the id must not collide with a live one
    pub fn insert(
        &self,
        envelope: CommandEnvelope,
        deadline: Instant,
        retry_count: u32,
    ) -> Result<oneshot::Receiver<Termination>, CommandError> {
        let mut entries = self.entries();
        if entries.contains_key(&envelope.request_id) {
            warn!("Refusing duplicate request id {}", envelope.request_id);
            return Err(CommandError::DuplicateRequest(envelope.request_id));
        }

        let request_id = envelope.request_id.clone();
        let (request, rx) = PendingRequest::create(envelope, deadline, retry_count);
        entries.insert(request_id.clone(), request);
        debug!("Registered pending request {} ({} in flight)", request_id, entries.len());
        Ok(rx)
    }

    /// Matches a response against the table
    pub fn resolve(&self, response: ResponseEnvelope) -> ResolveOutcome {
        let mut entries = self.entries();

        if !entries.contains_key(&response.request_id) {
            debug!(
                "Discarding response for unknown request {}",
                response.request_id
            );
            return ResolveOutcome::Discarded;
        }

        if !response.is_terminal() {
            debug!("Interim ack for request {}", response.request_id);
            return ResolveOutcome::Interim;
        }

        match entries.remove(&response.request_id) {
            Some(request) => {
                info!(
                    "Resolved request {} after {:?}",
                    request.request_id(),
                    request.age()
                );
                // Sent under the lock: a waiter that finds its entry gone can
                // rely on the outcome already being in its channel.
                let _resolved = request.resolve(response);
                ResolveOutcome::Resolved
            }
            None => ResolveOutcome::Discarded,
        }
    }

    /// Removes an entry whose deadline passed; false if it already terminated
    pub fn expire(&self, request_id: &str) -> bool {
        match self.entries().remove(request_id) {
            Some(request) => {
                warn!(
                    "Request {} timed out after {:?}",
                    request_id,
                    request.age()
                );
                let _timed_out = request.time_out();
                true
            }
            None => false,
        }
    }

    /// Cancels one entry; false if it already terminated
    pub fn cancel(&self, request_id: &str, reason: CancelReason) -> bool {
        let mut entries = self.entries();
        match entries.remove(request_id) {
            Some(request) => {
                info!("Cancelled request {}: {}", request_id, reason);
                let _cancelled = request.cancel(reason);
                true
            }
            None => false,
        }
    }

    /// Cancels every waiting entry, returning how many were cancelled
    pub fn cancel_all(&self, reason: CancelReason) -> usize {
        let mut entries = self.entries();
        let count = entries.len();
        for (_, request) in entries.drain() {
            let _cancelled = request.cancel(reason.clone());
        }
        if count > 0 {
            warn!("Cancelled {} pending requests: {}", count, reason);
        }
        count
    }

    pub fn contains(&self, request_id: &str) -> bool {
        self.entries().contains_key(request_id)
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    pub fn stats(&self) -> PendingStats {
        let entries = self.entries();
        PendingStats {
            pending: entries.len(),
            oldest_age: entries.values().map(|request| request.age()).max(),
        }
    }
}
