//! Command dispatch with deadlines and explicit retries
//!
//! ```text
//! send_command ──► assign id ──► PendingTable::insert ──► publish lock/control/{id}
//!                                        │
//!          ┌─────────────────────────────┼────────────────────────────┐
//!   response routed in          deadline passes               connection lost
//!   (Resolved → Ok / Device)    (expire → Timeout)            (Cancelled)
//! ```
//!
//! A retry is a new command with a new request id; a timed-out id is never
//! reused, so a late answer to it is discarded by the table.

use crate::command::envelope::{CommandEnvelope, ErrorInfo, ResponseEnvelope, ResponseStatus};
use crate::command::pending::{PendingTable, ResolveOutcome, Termination};
use crate::command::signing::MessageSigner;
use crate::error::{CancelReason, CommandError};
use crate::mqtt::config::DeliveryGuarantee;
use crate::mqtt::topic::control_topic;
use crate::mqtt::Publisher;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Deadline and retry policy for outgoing commands
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchSettings {
    pub default_timeout: Duration,
    pub max_retries: u32,
    /// Retry `n` waits `retry_delay * n` before republishing
    pub retry_delay: Duration,
}

impl Default for DispatchSettings {
    fn default() -> Self {
        Self {
            default_timeout: Duration::from_secs(30),
            max_retries: 3,
            retry_delay: Duration::from_secs(1),
        }
    }
}

pub fn new_request_id() -> String {
    format!("req_{}", Uuid::new_v4().simple())
}

/// Withdraws the entry if the waiting future is dropped early
struct EntryGuard<'a> {
    table: &'a PendingTable,
    request_id: String,
}

impl Drop for EntryGuard<'_> {
    fn drop(&mut self) {
        self.table.cancel(&self.request_id, CancelReason::Aborted);
    }
}

/// Told about every command the device confirmed with `success`
pub trait CommandObserver: Send + Sync {
    fn command_confirmed(&self, envelope: &CommandEnvelope, response: &ResponseEnvelope);
}

pub struct CommandDispatcher {
    publisher: Arc<dyn Publisher>,
    pending: Arc<PendingTable>,
    settings: DispatchSettings,
    signer: Option<Arc<dyn MessageSigner>>,
    observer: Option<Arc<dyn CommandObserver>>,
}

impl CommandDispatcher {
    pub fn new(
        publisher: Arc<dyn Publisher>,
        pending: Arc<PendingTable>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            publisher,
            pending,
            settings,
            signer: None,
            observer: None,
        }
    }

    pub fn with_signer(mut self, signer: Arc<dyn MessageSigner>) -> Self {
        self.signer = Some(signer);
        self
    }

    pub fn with_observer(mut self, observer: Arc<dyn CommandObserver>) -> Self {
        self.observer = Some(observer);
        self
    }

    pub fn pending(&self) -> &Arc<PendingTable> {
        &self.pending
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Sends one command and waits for its single outcome
    ///
    /// `timeout` falls back to the configured default.
    pub async fn send_command(
        &self,
        envelope: CommandEnvelope,
        timeout: Option<Duration>,
    ) -> Result<ResponseEnvelope, CommandError> {
        let timeout = timeout.unwrap_or(self.settings.default_timeout);
        self.attempt(envelope, timeout, 0).await
    }

    /// Sends a command, retrying timeouts up to `max_retries` times
    ///
    /// Only [`CommandError::Timeout`] is retried. Every retry carries a fresh
    /// request id. Exhausting the retries yields [`CommandError::Failed`].
    pub async fn send_with_retries(
        &self,
        envelope: CommandEnvelope,
        timeout: Option<Duration>,
    ) -> Result<ResponseEnvelope, CommandError> {
        let timeout = timeout.unwrap_or(self.settings.default_timeout);
        let mut retry_count = 0;
        let mut current = envelope;

        loop {
            match self.attempt(current.clone(), timeout, retry_count).await {
                Err(CommandError::Timeout { request_id, .. }) => {
                    if retry_count >= self.settings.max_retries {
                        error!(
                            "Command {} failed after {} attempts",
                            current.command,
                            retry_count + 1
                        );
                        return Err(CommandError::Failed {
                            attempts: retry_count + 1,
                            last_request_id: request_id,
                        });
                    }

                    retry_count += 1;
                    let delay = self.settings.retry_delay * retry_count;
                    warn!(
                        "Retrying {} (retry {}/{}) in {:?}, previous request {}",
                        current.command, retry_count, self.settings.max_retries, delay, request_id
                    );
                    tokio::time::sleep(delay).await;

                    current.request_id = new_request_id();
                    current.signature = None;
                }
                other => return other,
            }
        }
    }

    /// Withdraws a waiting command; its caller sees [`CommandError::Cancelled`]
    pub fn cancel(&self, request_id: &str) -> bool {
        self.pending.cancel(request_id, CancelReason::Aborted)
    }

    /// Feeds a decoded response into the table
    pub fn handle_response(&self, response: ResponseEnvelope) -> ResolveOutcome {
        let request_id = response.request_id.clone();
        let outcome = self.pending.resolve(response);
        if outcome == ResolveOutcome::Discarded {
            debug!("Late or unsolicited response {} dropped", request_id);
        }
        outcome
    }

    async fn attempt(
        &self,
        mut envelope: CommandEnvelope,
        timeout: Duration,
        retry_count: u32,
    ) -> Result<ResponseEnvelope, CommandError> {
        if envelope.request_id.is_empty() {
            envelope.request_id = new_request_id();
        }
        self.sign(&mut envelope);

        let request_id = envelope.request_id.clone();
        let topic = control_topic(&envelope.device_id);
        let payload = serde_json::to_vec(&envelope)?;
        let deadline = Instant::now() + timeout;

        let mut rx = self.pending.insert(envelope.clone(), deadline, retry_count)?;
        let _guard = EntryGuard {
            table: &self.pending,
            request_id: request_id.clone(),
        };

        info!(
            "Publishing {} to {} as {} (retry {})",
            envelope.command, topic, request_id, retry_count
        );
        let publish = self
            .publisher
            .publish(&topic, payload, DeliveryGuarantee::AtLeastOnce);

        // The deadline and cancellation cover the publish as well as the wait.
        let waited = tokio::time::timeout_at(deadline, async {
            tokio::select! {
                termination = &mut rx => return Ok(termination),
                published = publish => {
                    if let Err(e) = published {
                        return Err(CommandError::from(e));
                    }
                }
            }
            Ok((&mut rx).await)
        })
        .await;

        let result = match waited {
            Ok(Ok(Ok(termination))) => Self::finish(&request_id, termination),
            Ok(Ok(Err(_))) => Err(CommandError::Cancelled {
                request_id,
                reason: CancelReason::Aborted,
            }),
            Ok(Err(e)) => Err(e),
            Err(_) => {
                if self.pending.expire(&request_id) {
                    return Err(CommandError::Timeout {
                        request_id,
                        after: timeout,
                    });
                }
                // Terminated concurrently with the deadline; the outcome is
                // already in the channel.
                match rx.try_recv() {
                    Ok(termination) => Self::finish(&request_id, termination),
                    Err(_) => Err(CommandError::Timeout {
                        request_id,
                        after: timeout,
                    }),
                }
            }
        };

        if let (Ok(response), Some(observer)) = (&result, &self.observer) {
            observer.command_confirmed(&envelope, response);
        }
        result
    }

    fn finish(
        request_id: &str,
        termination: Termination,
    ) -> Result<ResponseEnvelope, CommandError> {
        match termination {
            Termination::Resolved(response) => match response.status {
                ResponseStatus::Error => {
                    let info = response.error.unwrap_or_else(|| ErrorInfo {
                        code: "UNKNOWN".into(),
                        message: "device reported an error without details".into(),
                        details: None,
                    });
                    warn!(
                        "Device rejected {}: [{}] {}",
                        request_id, info.code, info.message
                    );
                    Err(CommandError::Device {
                        code: info.code,
                        message: info.message,
                        details: info.details,
                    })
                }
                _ => Ok(response),
            },
            Termination::Cancelled(reason) => Err(CommandError::Cancelled {
                request_id: request_id.to_string(),
                reason,
            }),
        }
    }

    fn sign(&self, envelope: &mut CommandEnvelope) {
        let Some(signer) = &self.signer else {
            return;
        };
        envelope.signature = None;
        match signer.sign(envelope) {
            Ok(signature) => envelope.signature = Some(signature),
            Err(e) => warn!("Sending {} unsigned: {}", envelope.request_id, e),
        }
    }
}
