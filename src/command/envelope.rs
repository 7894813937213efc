use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Commands understood by the lock firmware
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    Lock,
    Unlock,
    SetPassword,
    GetStatus,
    EnrollFingerprint,
    DeleteFingerprint,
    StartStream,
    TakeSnapshot,
}

impl CommandType {
    /// Lock and unlock change the bolt; everything else is bookkeeping
    pub fn is_lock_action(&self) -> bool {
        matches!(self, Self::Lock | Self::Unlock)
    }
}

impl fmt::Display for CommandType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Lock => "lock",
            Self::Unlock => "unlock",
            Self::SetPassword => "set_password",
            Self::GetStatus => "get_status",
            Self::EnrollFingerprint => "enroll_fingerprint",
            Self::DeleteFingerprint => "delete_fingerprint",
            Self::StartStream => "start_stream",
            Self::TakeSnapshot => "take_snapshot",
        };
        f.write_str(name)
    }
}

/// Command published on `lock/control/{deviceId}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandEnvelope {
    /// Empty until the dispatcher assigns one
    #[serde(default)]
    pub request_id: String,
    pub device_id: String,
    pub user_id: String,
    pub command: CommandType,
    /// Epoch milliseconds
    pub timestamp: i64,
    #[serde(default)]
    pub params: Map<String, Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

impl CommandEnvelope {
    pub fn new(
        command: CommandType,
        device_id: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            request_id: String::new(),
            device_id: device_id.into(),
            user_id: user_id.into(),
            command,
            timestamp: chrono::Utc::now().timestamp_millis(),
            params: Map::new(),
            signature: None,
        }
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = request_id.into();
        self
    }

    /// Bytes a signer covers: the envelope without its signature
    pub fn signing_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        let mut unsigned = self.clone();
        unsigned.signature = None;
        serde_json::to_vec(&unsigned)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseStatus {
    Success,
    Error,
    /// Interim acknowledgement; the request stays open
    Pending,
}

/// Error block a device attaches to `status = error`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

/// Response published on `lock/response/{deviceId}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub request_id: String,
    pub device_id: String,
    pub status: ResponseStatus,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorInfo>,
}

impl ResponseEnvelope {
    pub fn success(request_id: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            request_id: request_id.into(),
            device_id: device_id.into(),
            status: ResponseStatus::Success,
            timestamp: chrono::Utc::now().timestamp_millis(),
            data: None,
            error: None,
        }
    }

    pub fn failure(
        request_id: impl Into<String>,
        device_id: impl Into<String>,
        code: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            status: ResponseStatus::Error,
            error: Some(ErrorInfo {
                code: code.into(),
                message: message.into(),
                details: None,
            }),
            ..Self::success(request_id, device_id)
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self.status, ResponseStatus::Pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn command_serializes_with_wire_names() {
        let envelope = CommandEnvelope::new(CommandType::EnrollFingerprint, "D1", "u1")
            .with_request_id("req_1")
            .with_param("slot", 3);

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["command"], "enroll_fingerprint");
        assert_eq!(value["requestId"], "req_1");
        assert_eq!(value["deviceId"], "D1");
        assert_eq!(value["params"]["slot"], 3);
        assert!(value.get("signature").is_none());
    }

    #[test]
    fn response_decodes_device_error() {
        let raw = json!({
            "requestId": "req_9",
            "deviceId": "D1",
            "status": "error",
            "timestamp": 1700000000000_i64,
            "error": { "code": "E_AUTH", "message": "user not enrolled" }
        });

        let response: ResponseEnvelope = serde_json::from_value(raw).unwrap();
        assert_eq!(response.status, ResponseStatus::Error);
        assert_eq!(response.error.unwrap().code, "E_AUTH");
    }

    #[test]
    fn signing_payload_ignores_existing_signature() {
        let mut envelope =
            CommandEnvelope::new(CommandType::Lock, "D1", "u1").with_request_id("req_2");
        let unsigned = envelope.signing_payload().unwrap();
        envelope.signature = Some("abc".into());
        assert_eq!(envelope.signing_payload().unwrap(), unsigned);
    }

    #[test]
    fn pending_responses_are_not_terminal() {
        let mut response = ResponseEnvelope::success("r", "D1");
        assert!(response.is_terminal());
        response.status = ResponseStatus::Pending;
        assert!(!response.is_terminal());
    }
}
