//! Error taxonomy for the lock link
//!
//! Faults are split by the layer that raises them. Transport faults
//! ([`ConnectError`], [`TransportError`]) surface to whoever called the
//! operation that hit them. Command faults ([`CommandError`]) surface through
//! the command's own result. [`MalformedMessage`] never leaves the router: it
//! is logged and the message is dropped.

use std::time::Duration;

/// Failure to establish a broker session
#[derive(Debug, thiserror::Error)]
pub enum ConnectError {
    /// Broker could not be reached (DNS, TCP, TLS or protocol failure)
    ///
    /// Retriable. The reconnect loop keeps trying these with backoff.
    #[error("Broker unreachable: {0}")]
    Unreachable(String),

    /// Broker refused the session (bad credentials, not authorized)
    ///
    /// Not retriable. The connection parks in `Error` until `connect` is
    /// called again with different credentials.
    #[error("Broker rejected connection: {0}")]
    Rejected(String),

    /// No CONNACK within the configured connect timeout
    #[error("Connect timed out after {0:?}")]
    Timeout(Duration),

    /// `connect` called while a session is already up or being established
    #[error("Connection already active")]
    AlreadyActive,
}

impl ConnectError {
    /// Whether the reconnect loop may retry after this error
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::Unreachable(_) | Self::Timeout(_))
    }
}

/// Failure to hand a message to the broker
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// Operation attempted while the connection is not `Connected`
    #[error("Not connected to broker")]
    NotConnected,

    /// Request queue towards the event loop rejected the packet
    #[error("MQTT client error: {0}")]
    Client(#[from] rumqttc::ClientError),

    /// Payload could not be serialized
    #[error("Failed to encode payload: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Broad category of a command failure, for user-facing reporting
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// The device answered and refused the command
    DeviceRejected,
    /// No correlated answer arrived (timeout or retries exhausted)
    NoResponse,
    /// There was no broker session to send on
    NotConnected,
    /// The request was withdrawn before it could complete
    Cancelled,
    /// Local failure (encoding, duplicate id, client queue)
    Other,
}

/// Why a pending request was cancelled
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// Connection left `Connected` (drop, reconnect or disconnect)
    ConnectionLost,
    /// Caller withdrew the request explicitly
    Aborted,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConnectionLost => write!(f, "connection lost"),
            Self::Aborted => write!(f, "aborted by caller"),
        }
    }
}

/// Terminal failure of a single command
#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    /// No broker session when the command was issued
    #[error("Not connected to broker")]
    NotConnected,

    /// No correlated response before the deadline
    ///
    /// Retriable. A retry always uses a new request id.
    #[error("Command {request_id} timed out after {after:?}")]
    Timeout { request_id: String, after: Duration },

    /// Every allowed attempt timed out
    #[error("Command failed after {attempts} attempts (last request {last_request_id})")]
    Failed {
        attempts: u32,
        last_request_id: String,
    },

    /// Device answered with `status = error`
    #[error("Device rejected command: [{code}] {message}")]
    Device {
        code: String,
        message: String,
        details: Option<serde_json::Value>,
    },

    /// Entry removed before a response arrived
    #[error("Command {request_id} cancelled: {reason}")]
    Cancelled {
        request_id: String,
        reason: CancelReason,
    },

    /// Request id already belongs to a waiting entry
    #[error("Request id {0} is already pending")]
    DuplicateRequest(String),

    /// Publish failed for a reason other than a missing session
    #[error("Transport error: {0}")]
    Transport(String),

    /// Envelope could not be serialized
    #[error("Failed to encode command: {0}")]
    Encode(#[from] serde_json::Error),
}

impl CommandError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Device { .. } => FailureKind::DeviceRejected,
            Self::Timeout { .. } | Self::Failed { .. } => FailureKind::NoResponse,
            Self::NotConnected => FailureKind::NotConnected,
            Self::Cancelled { .. } => FailureKind::Cancelled,
            Self::DuplicateRequest(_) | Self::Transport(_) | Self::Encode(_) => FailureKind::Other,
        }
    }
}

impl From<TransportError> for CommandError {
    fn from(err: TransportError) -> Self {
        match err {
            TransportError::NotConnected => Self::NotConnected,
            TransportError::Encode(e) => Self::Encode(e),
            other => Self::Transport(other.to_string()),
        }
    }
}

/// Inbound payload that could not be decoded
///
/// Only ever logged by the router; never returned to callers.
#[derive(Debug, thiserror::Error)]
pub enum MalformedMessage {
    /// Payload is not valid JSON
    #[error("Undecodable payload on {topic}: {source}")]
    Decode {
        topic: String,
        #[source]
        source: serde_json::Error,
    },

    /// JSON decoded but does not have the expected shape
    #[error("Unexpected payload shape on {topic}: {source}")]
    Shape {
        topic: String,
        #[source]
        source: serde_json::Error,
    },
}
